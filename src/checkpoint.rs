//! Checkpoint restore for evaluation.
//!
//! A checkpoint is a single safetensors file with four kinds of entries:
//!
//! * `model.*` — model parameters (prefix stripped before model construction);
//! * `optimizer.*` — optimizer state written by the training pipeline;
//! * `epoch` — 1-element u32 tensor, the epoch the checkpoint was taken at;
//! * `loss` — 1-element f32 tensor, the training loss at that point.
//!
//! Evaluation never steps an optimizer, so `optimizer.*` entries are counted
//! and dropped. They stay in the format so the training pipeline can resume
//! from the same file.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use crate::config::ModelConfig;
use crate::model::Seq2SeqTransformer;

const MODEL_PREFIX: &str = "model.";
const OPTIMIZER_PREFIX: &str = "optimizer.";
const EPOCH_KEY: &str = "epoch";
const LOSS_KEY: &str = "loss";

/// A restored checkpoint: the model plus its training bookkeeping.
pub struct LoadedCheckpoint {
    pub model: Seq2SeqTransformer,
    /// Epoch the checkpoint was written at.
    pub epoch: u32,
    /// Training loss recorded at checkpoint time.
    pub loss: f32,
    /// Number of `optimizer.*` entries found and dropped.
    pub discarded_optimizer_entries: usize,
}

/// Restore a model from a checkpoint file onto `device`.
///
/// Fails on a missing file, a malformed bundle (no `model.*` entries, missing
/// `epoch`/`loss`), or a shape mismatch between the stored tensors and the
/// config-built architecture.
pub fn load_model(
    config: &ModelConfig,
    path: &Path,
    device: &Device,
) -> anyhow::Result<LoadedCheckpoint> {
    let tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("load checkpoint {}", path.display()))?;

    let mut model_tensors = HashMap::new();
    let mut discarded_optimizer_entries = 0usize;
    let mut epoch = None;
    let mut loss = None;

    for (name, tensor) in tensors {
        if let Some(rest) = name.strip_prefix(MODEL_PREFIX) {
            model_tensors.insert(rest.to_string(), tensor);
        } else if name.starts_with(OPTIMIZER_PREFIX) {
            // Training-pipeline state; intentionally unused here.
            discarded_optimizer_entries += 1;
        } else if name == EPOCH_KEY {
            epoch = Some(read_scalar_u32(&tensor).context("read checkpoint epoch")?);
        } else if name == LOSS_KEY {
            loss = Some(read_scalar_f32(&tensor).context("read checkpoint loss")?);
        } else {
            anyhow::bail!(
                "checkpoint {}: unrecognised entry {name:?}",
                path.display()
            );
        }
    }

    if model_tensors.is_empty() {
        anyhow::bail!("checkpoint {}: no model.* entries", path.display());
    }
    let epoch = epoch
        .with_context(|| format!("checkpoint {}: missing epoch entry", path.display()))?;
    let loss = loss
        .with_context(|| format!("checkpoint {}: missing loss entry", path.display()))?;

    let vb = VarBuilder::from_tensors(model_tensors, DType::F32, device);
    let model = Seq2SeqTransformer::new(vb, config)
        .with_context(|| format!("build model from checkpoint {}", path.display()))?;

    if discarded_optimizer_entries > 0 {
        tracing::debug!(
            entries = discarded_optimizer_entries,
            "Dropped optimizer state from checkpoint"
        );
    }

    Ok(LoadedCheckpoint {
        model,
        epoch,
        loss,
        discarded_optimizer_entries,
    })
}

/// Write a checkpoint in the layout [`load_model`] reads: the varmap's
/// parameters under `model.`, plus `epoch` and `loss` bookkeeping.
pub fn save_checkpoint(
    varmap: &VarMap,
    epoch: u32,
    loss: f32,
    path: &Path,
) -> anyhow::Result<()> {
    let cpu = Device::Cpu;
    let mut tensors = HashMap::new();
    {
        let data = varmap.data().lock().unwrap();
        for (name, var) in data.iter() {
            tensors.insert(format!("{MODEL_PREFIX}{name}"), var.as_tensor().clone());
        }
    }
    tensors.insert(EPOCH_KEY.to_string(), Tensor::from_vec(vec![epoch], (1,), &cpu)?);
    tensors.insert(LOSS_KEY.to_string(), Tensor::from_vec(vec![loss], (1,), &cpu)?);

    candle_core::safetensors::save(&tensors, path)
        .with_context(|| format!("write checkpoint {}", path.display()))?;
    Ok(())
}

fn read_scalar_u32(tensor: &Tensor) -> anyhow::Result<u32> {
    let values = tensor.to_dtype(DType::U32)?.flatten_all()?.to_vec1::<u32>()?;
    values
        .first()
        .copied()
        .context("empty scalar tensor")
}

fn read_scalar_f32(tensor: &Tensor) -> anyhow::Result<f32> {
    let values = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    values
        .first()
        .copied()
        .context("empty scalar tensor")
}

// ── Tests ───────────────────────────────────────────────────────────────────
