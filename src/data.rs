//! Pre-tokenised evaluation splits.
//!
//! A split is one safetensors file with four tensors sharing a leading
//! sample dimension:
//!
//! | name            | shape    | dtype | contents                         |
//! |-----------------|----------|-------|----------------------------------|
//! | `encoder_input` | (N, Ts)  | u32   | source token ids                 |
//! | `decoder_input` | (N, Td)  | u32   | target token ids                 |
//! | `encoder_mask`  | (N, Ts)  | f32   | 1 at valid positions, 0 at pad   |
//! | `decoder_mask`  | (N, Td)  | f32   | 1 at valid positions, 0 at pad   |
//!
//! Batches are contiguous slices in file order (no shuffling); the last
//! batch may be smaller than `batch_size`.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use candle_core::{Device, Result, Tensor};

const ENCODER_INPUT: &str = "encoder_input";
const DECODER_INPUT: &str = "decoder_input";
const ENCODER_MASK: &str = "encoder_mask";
const DECODER_MASK: &str = "decoder_mask";

/// One batch of the four split tensors, leading dimension ≤ batch_size.
#[derive(Debug, Clone)]
pub struct Batch {
    pub encoder_input: Tensor,
    pub decoder_input: Tensor,
    pub encoder_mask: Tensor,
    pub decoder_mask: Tensor,
}

impl Batch {
    /// Move all four tensors to `device`.
    pub fn to_device(&self, device: &Device) -> Result<Batch> {
        Ok(Batch {
            encoder_input: self.encoder_input.to_device(device)?,
            decoder_input: self.decoder_input.to_device(device)?,
            encoder_mask: self.encoder_mask.to_device(device)?,
            decoder_mask: self.decoder_mask.to_device(device)?,
        })
    }

    /// Number of samples in this batch.
    pub fn len(&self) -> usize {
        self.encoder_input.dim(0).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An evaluation split held in host memory; batches move to the accelerator
/// one at a time during evaluation.
pub struct EvalDataset {
    encoder_input: Tensor,
    decoder_input: Tensor,
    encoder_mask: Tensor,
    decoder_mask: Tensor,
}

impl EvalDataset {
    /// Load a split file onto the CPU.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)
            .with_context(|| format!("load dataset {}", path.display()))?;
        let mut take = |name: &str| {
            tensors
                .remove(name)
                .with_context(|| format!("dataset {}: missing tensor {name:?}", path.display()))
        };
        let encoder_input = take(ENCODER_INPUT)?;
        let decoder_input = take(DECODER_INPUT)?;
        let encoder_mask = take(ENCODER_MASK)?;
        let decoder_mask = take(DECODER_MASK)?;
        Self::new(encoder_input, decoder_input, encoder_mask, decoder_mask)
            .with_context(|| format!("dataset {}", path.display()))
    }

    /// Assemble a split from its four tensors, checking shape invariants:
    /// all four share N, and each mask matches its input's shape.
    pub fn new(
        encoder_input: Tensor,
        decoder_input: Tensor,
        encoder_mask: Tensor,
        decoder_mask: Tensor,
    ) -> anyhow::Result<Self> {
        let (n_enc, _ts) = encoder_input.dims2().context("encoder_input must be rank 2")?;
        let (n_dec, _td) = decoder_input.dims2().context("decoder_input must be rank 2")?;
        if n_enc != n_dec {
            anyhow::bail!("encoder_input has {n_enc} samples but decoder_input has {n_dec}");
        }
        if encoder_mask.dims() != encoder_input.dims() {
            anyhow::bail!(
                "encoder_mask shape {:?} does not match encoder_input {:?}",
                encoder_mask.dims(),
                encoder_input.dims()
            );
        }
        if decoder_mask.dims() != decoder_input.dims() {
            anyhow::bail!(
                "decoder_mask shape {:?} does not match decoder_input {:?}",
                decoder_mask.dims(),
                decoder_input.dims()
            );
        }
        Ok(Self {
            encoder_input,
            decoder_input,
            encoder_mask,
            decoder_mask,
        })
    }

    /// Number of samples in the split.
    pub fn len(&self) -> usize {
        self.encoder_input.dim(0).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of batches `batches(batch_size)` will yield.
    pub fn num_batches(&self, batch_size: usize) -> usize {
        if batch_size == 0 {
            0
        } else {
            self.len().div_ceil(batch_size)
        }
    }

    /// Yield batches of up to `batch_size` samples, in file order.
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = Result<Batch>> + '_ {
        let n = self.len();
        let mut start = 0usize;
        std::iter::from_fn(move || {
            if batch_size == 0 || start >= n {
                return None;
            }
            let len = batch_size.min(n - start);
            let batch = (|| {
                Ok(Batch {
                    encoder_input: self.encoder_input.narrow(0, start, len)?,
                    decoder_input: self.decoder_input.narrow(0, start, len)?,
                    encoder_mask: self.encoder_mask.narrow(0, start, len)?,
                    decoder_mask: self.decoder_mask.narrow(0, start, len)?,
                })
            })();
            start += len;
            Some(batch)
        })
    }
}

/// Write a split in the layout [`EvalDataset::load`] reads.
pub fn write_dataset(
    path: &Path,
    encoder_input: &Tensor,
    decoder_input: &Tensor,
    encoder_mask: &Tensor,
    decoder_mask: &Tensor,
) -> anyhow::Result<()> {
    // Same invariants as load, so a written file always loads.
    EvalDataset::new(
        encoder_input.clone(),
        decoder_input.clone(),
        encoder_mask.clone(),
        decoder_mask.clone(),
    )?;
    let tensors: HashMap<String, Tensor> = [
        (ENCODER_INPUT.to_string(), encoder_input.clone()),
        (DECODER_INPUT.to_string(), decoder_input.clone()),
        (ENCODER_MASK.to_string(), encoder_mask.clone()),
        (DECODER_MASK.to_string(), decoder_mask.clone()),
    ]
    .into_iter()
    .collect();
    candle_core::safetensors::save(&tensors, path)
        .with_context(|| format!("write dataset {}", path.display()))?;
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, IndexOp};

    fn sample_dataset(n: usize) -> EvalDataset {
        let device = Device::Cpu;
        let enc = Tensor::from_vec((0..n as u32 * 3).collect(), (n, 3), &device).unwrap();
        let dec = Tensor::from_vec((0..n as u32 * 4).collect(), (n, 4), &device).unwrap();
        let enc_mask = Tensor::ones((n, 3), DType::F32, &device).unwrap();
        let dec_mask = Tensor::ones((n, 4), DType::F32, &device).unwrap();
        EvalDataset::new(enc, dec, enc_mask, dec_mask).unwrap()
    }

    #[test]
    fn batches_cover_split_in_order() {
        let ds = sample_dataset(5);
        let batches: Vec<Batch> = ds.batches(2).map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(ds.num_batches(2), 3);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 2);
        assert_eq!(batches[2].len(), 1);

        // First row of the second batch is sample 2
        let row = batches[1].encoder_input.i(0).unwrap().to_vec1::<u32>().unwrap();
        assert_eq!(row, vec![6, 7, 8]);
    }

    #[test]
    fn zero_batch_size_yields_nothing() {
        let ds = sample_dataset(3);
        assert_eq!(ds.batches(0).count(), 0);
        assert_eq!(ds.num_batches(0), 0);
    }

    #[test]
    fn mismatched_sample_counts_rejected() {
        let device = Device::Cpu;
        let enc = Tensor::zeros((2, 3), DType::U32, &device).unwrap();
        let dec = Tensor::zeros((3, 4), DType::U32, &device).unwrap();
        let enc_mask = Tensor::ones((2, 3), DType::F32, &device).unwrap();
        let dec_mask = Tensor::ones((3, 4), DType::F32, &device).unwrap();
        assert!(EvalDataset::new(enc, dec, enc_mask, dec_mask).is_err());
    }

    #[test]
    fn mismatched_mask_shape_rejected() {
        let device = Device::Cpu;
        let enc = Tensor::zeros((2, 3), DType::U32, &device).unwrap();
        let dec = Tensor::zeros((2, 4), DType::U32, &device).unwrap();
        let enc_mask = Tensor::ones((2, 3), DType::F32, &device).unwrap();
        let dec_mask = Tensor::ones((2, 5), DType::F32, &device).unwrap();
        assert!(EvalDataset::new(enc, dec, enc_mask, dec_mask).is_err());
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.safetensors");
        let device = Device::Cpu;

        let enc = Tensor::from_vec(vec![1u32, 2, 3, 4, 5, 6], (2, 3), &device).unwrap();
        let dec = Tensor::from_vec(vec![7u32, 8, 9, 10], (2, 2), &device).unwrap();
        let enc_mask = Tensor::ones((2, 3), DType::F32, &device).unwrap();
        let dec_mask = Tensor::ones((2, 2), DType::F32, &device).unwrap();
        write_dataset(&path, &enc, &dec, &enc_mask, &dec_mask).unwrap();

        let ds = EvalDataset::load(&path).unwrap();
        assert_eq!(ds.len(), 2);
        let batch = ds.batches(2).next().unwrap().unwrap();
        assert_eq!(
            batch.decoder_input.flatten_all().unwrap().to_vec1::<u32>().unwrap(),
            vec![7, 8, 9, 10]
        );
    }

    #[test]
    fn missing_tensor_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.safetensors");
        let device = Device::Cpu;
        let tensors: HashMap<String, Tensor> = [(
            ENCODER_INPUT.to_string(),
            Tensor::zeros((2, 3), DType::U32, &device).unwrap(),
        )]
        .into_iter()
        .collect();
        candle_core::safetensors::save(&tensors, &path).unwrap();
        assert!(EvalDataset::load(&path).is_err());
    }
}
