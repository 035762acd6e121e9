//! Per-split perplexity evaluation.
//!
//! Each batch runs one inference-only forward pass. Logits and targets are
//! aligned by the next-token shift (drop the last logits timestep and the
//! first target timestep), the loss is token-averaged cross-entropy over
//! unmasked positions, and each batch contributes `exp(loss)` to the split
//! summary. The summary is the arithmetic mean of those per-batch
//! perplexities — not `exp` of the pooled loss; downstream numbers depend on
//! this exact aggregation.

use candle_core::{Device, Error, Result, Tensor, D};
use candle_nn::ops;
use indicatif::{ProgressBar, ProgressStyle};

use crate::data::{Batch, EvalDataset};
use crate::model::Seq2SeqLm;

/// Token-averaged cross-entropy over positions where `mask` is nonzero.
///
/// `logits` is `(b, t, vocab)`, `targets` is `(b, t)` u32, `mask` is
/// `(b, t)` f32 in {0,1}. Errors if the mask selects no tokens.
pub fn masked_cross_entropy(logits: &Tensor, targets: &Tensor, mask: &Tensor) -> Result<f32> {
    let log_probs = ops::log_softmax(logits, D::Minus1)?;
    let ids = targets.unsqueeze(D::Minus1)?.contiguous()?;
    let nll = log_probs
        .contiguous()?
        .gather(&ids, D::Minus1)?
        .squeeze(D::Minus1)?
        .neg()?;
    let masked = nll.mul(mask)?;

    let total = masked.sum_all()?.to_scalar::<f32>()?;
    let count = mask.sum_all()?.to_scalar::<f32>()?;
    if count <= 0.0 {
        return Err(Error::Msg("no unmasked target tokens in batch".to_string()));
    }
    Ok(total / count)
}

/// Perplexity of one batch: `exp` of the token-averaged loss after the
/// next-token alignment trim.
pub fn batch_perplexity<M: Seq2SeqLm>(model: &M, batch: &Batch) -> Result<f64> {
    let logits = model.forward(
        &batch.encoder_input,
        &batch.encoder_mask,
        &batch.decoder_input,
        &batch.decoder_mask,
    )?;
    let (_b, t, _v) = logits.dims3()?;
    if t < 2 {
        return Err(Error::Msg(format!(
            "decoder sequences must have at least 2 positions for next-token loss, got {t}"
        )));
    }

    // Next-token shift: prediction at position i scores the token at i+1.
    let out = logits.narrow(1, 0, t - 1)?;
    let target = batch.decoder_input.narrow(1, 1, t - 1)?;
    let target_mask = batch.decoder_mask.narrow(1, 1, t - 1)?;

    let loss = masked_cross_entropy(&out, &target, &target_mask)?;
    Ok(f64::from(loss).exp())
}

// ── Accumulation ────────────────────────────────────────────────────────────

/// Running sum of per-batch perplexities plus a batch counter.
#[derive(Debug, Default)]
pub struct PerplexityAccumulator {
    sum: f64,
    batches: usize,
}

impl PerplexityAccumulator {
    pub fn push(&mut self, perplexity: f64) {
        self.sum += perplexity;
        self.batches += 1;
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Mean of the pushed per-batch perplexities, or [`SplitSummary::Empty`]
    /// when nothing was pushed.
    pub fn finish(self) -> SplitSummary {
        if self.batches == 0 {
            SplitSummary::Empty
        } else {
            SplitSummary::Measured(self.sum / self.batches as f64)
        }
    }
}

/// Result of evaluating one split.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SplitSummary {
    /// Mean of per-batch perplexities.
    Measured(f64),
    /// The split yielded zero batches.
    Empty,
}

/// Evaluate one split: iterate batches, move each to `device`, score it, and
/// average. Applied identically to train, validate, and test.
pub fn evaluate_split<M: Seq2SeqLm>(
    model: &M,
    dataset: &EvalDataset,
    batch_size: usize,
    device: &Device,
) -> anyhow::Result<SplitSummary> {
    let pb = ProgressBar::new(dataset.num_batches(batch_size) as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} batches")
            .unwrap()
            .progress_chars("=>-"),
    );

    let mut acc = PerplexityAccumulator::default();
    for batch in dataset.batches(batch_size) {
        let batch = batch?.to_device(device)?;
        acc.push(batch_perplexity(model, &batch)?);
        pb.inc(1);
    }
    pb.finish_and_clear();
    Ok(acc.finish())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    /// Logits depend only on the vocabulary index, identical at every
    /// position: logit(v) = 0.5 · v.
    struct ConstantModel {
        vocab: usize,
    }

    impl Seq2SeqLm for ConstantModel {
        fn forward(&self, _e: &Tensor, _em: &Tensor, dec: &Tensor, _dm: &Tensor) -> Result<Tensor> {
            let (b, t) = dec.dims2()?;
            let row: Vec<f32> = (0..self.vocab).map(|v| v as f32 * 0.5).collect();
            let mut data = Vec::with_capacity(b * t * self.vocab);
            for _ in 0..b * t {
                data.extend_from_slice(&row);
            }
            Tensor::from_vec(data, (b, t, self.vocab), dec.device())
        }
    }

    /// Puts a large logit on the next token at every position, so the loss
    /// under teacher forcing is (nearly) zero.
    struct PeakedModel {
        vocab: usize,
        scale: f32,
    }

    impl Seq2SeqLm for PeakedModel {
        fn forward(&self, _e: &Tensor, _em: &Tensor, dec: &Tensor, _dm: &Tensor) -> Result<Tensor> {
            let ids = dec.to_vec2::<u32>()?;
            let (b, t) = dec.dims2()?;
            let mut data = vec![0f32; b * t * self.vocab];
            for bi in 0..b {
                for ti in 0..t.saturating_sub(1) {
                    let target = ids[bi][ti + 1] as usize;
                    data[(bi * t + ti) * self.vocab + target] = self.scale;
                }
            }
            Tensor::from_vec(data, (b, t, self.vocab), dec.device())
        }
    }

    fn dataset_from_rows(dec_rows: &[Vec<u32>], dec_mask_rows: &[Vec<f32>]) -> EvalDataset {
        let device = Device::Cpu;
        let n = dec_rows.len();
        let td = dec_rows[0].len();
        let ts = 3usize;
        let enc = Tensor::zeros((n, ts), DType::U32, &device).unwrap();
        let enc_mask = Tensor::ones((n, ts), DType::F32, &device).unwrap();
        let dec = Tensor::from_vec(
            dec_rows.iter().flatten().copied().collect::<Vec<u32>>(),
            (n, td),
            &device,
        )
        .unwrap();
        let dec_mask = Tensor::from_vec(
            dec_mask_rows.iter().flatten().copied().collect::<Vec<f32>>(),
            (n, td),
            &device,
        )
        .unwrap();
        EvalDataset::new(enc, dec, enc_mask, dec_mask).unwrap()
    }

    #[test]
    fn masked_cross_entropy_hand_computed() {
        let device = Device::Cpu;
        // Uniform logits over 3 classes: nll = ln 3 at every position.
        let logits = Tensor::zeros((1, 2, 3), DType::F32, &device).unwrap();
        let targets = Tensor::from_vec(vec![1u32, 2], (1, 2), &device).unwrap();

        let mask = Tensor::from_vec(vec![1f32, 0.0], (1, 2), &device).unwrap();
        let loss = masked_cross_entropy(&logits, &targets, &mask).unwrap();
        assert!((loss - 3f32.ln()).abs() < 1e-5, "loss {loss}");

        let mask = Tensor::from_vec(vec![1f32, 1.0], (1, 2), &device).unwrap();
        let loss = masked_cross_entropy(&logits, &targets, &mask).unwrap();
        assert!((loss - 3f32.ln()).abs() < 1e-5, "loss {loss}");
    }

    #[test]
    fn all_masked_batch_is_an_error() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 2, 3), DType::F32, &device).unwrap();
        let targets = Tensor::from_vec(vec![1u32, 2], (1, 2), &device).unwrap();
        let mask = Tensor::zeros((1, 2), DType::F32, &device).unwrap();
        assert!(masked_cross_entropy(&logits, &targets, &mask).is_err());
    }

    #[test]
    fn perfect_prediction_scores_one() {
        // 2 samples, batch_size 2, near-zero loss on the whole batch.
        let ds = dataset_from_rows(
            &[vec![1, 2, 3, 4], vec![5, 6, 7, 8]],
            &[vec![1.0; 4], vec![1.0; 4]],
        );
        let model = PeakedModel {
            vocab: 16,
            scale: 50.0,
        };
        let summary = evaluate_split(&model, &ds, 2, &Device::Cpu).unwrap();
        match summary {
            SplitSummary::Measured(p) => assert!((p - 1.0).abs() < 1e-4, "perplexity {p}"),
            SplitSummary::Empty => panic!("expected a measured summary"),
        }
    }

    #[test]
    fn masked_positions_do_not_influence_loss() {
        // Mask out the final target position, then vary the token under it.
        let mask = vec![vec![1f32, 1.0, 1.0, 0.0]];
        let ds_a = dataset_from_rows(&[vec![1, 2, 3, 4]], &mask);
        let ds_b = dataset_from_rows(&[vec![1, 2, 3, 9]], &mask);
        let model = PeakedModel {
            vocab: 16,
            scale: 5.0,
        };
        let a = evaluate_split(&model, &ds_a, 1, &Device::Cpu).unwrap();
        let b = evaluate_split(&model, &ds_b, 1, &Device::Cpu).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn summary_is_mean_of_per_batch_perplexities() {
        // Two single-sample batches with different losses.
        let ds = dataset_from_rows(
            &[vec![0, 1, 2, 3], vec![0, 7, 7, 7]],
            &[vec![1.0; 4], vec![1.0; 4]],
        );
        let model = ConstantModel { vocab: 8 };

        let per_batch: Vec<f64> = ds
            .batches(1)
            .map(|b| batch_perplexity(&model, &b.unwrap()).unwrap())
            .collect();
        assert_eq!(per_batch.len(), 2);
        let expected = (per_batch[0] + per_batch[1]) / 2.0;

        let summary = evaluate_split(&model, &ds, 1, &Device::Cpu).unwrap();
        match summary {
            SplitSummary::Measured(p) => {
                assert!((p - expected).abs() < 1e-9, "got {p}, expected {expected}");
                // Distinct from exponentiating the pooled loss
                let pooled = ((per_batch[0].ln() + per_batch[1].ln()) / 2.0).exp();
                assert!((p - pooled).abs() > 1e-6);
            }
            SplitSummary::Empty => panic!("expected a measured summary"),
        }
    }

    #[test]
    fn empty_split_reports_empty() {
        let device = Device::Cpu;
        let ds = EvalDataset::new(
            Tensor::zeros((0, 3), DType::U32, &device).unwrap(),
            Tensor::zeros((0, 4), DType::U32, &device).unwrap(),
            Tensor::zeros((0, 3), DType::F32, &device).unwrap(),
            Tensor::zeros((0, 4), DType::F32, &device).unwrap(),
        )
        .unwrap();
        let model = ConstantModel { vocab: 8 };
        let summary = evaluate_split(&model, &ds, 2, &Device::Cpu).unwrap();
        assert_eq!(summary, SplitSummary::Empty);
    }

    #[test]
    fn single_position_decoder_is_an_error() {
        let ds = dataset_from_rows(&[vec![1]], &[vec![1.0]]);
        let model = ConstantModel { vocab: 8 };
        assert!(evaluate_split(&model, &ds, 1, &Device::Cpu).is_err());
    }

    #[test]
    fn accumulator_counts_batches() {
        let mut acc = PerplexityAccumulator::default();
        assert_eq!(acc.batches(), 0);
        acc.push(2.0);
        acc.push(4.0);
        assert_eq!(acc.batches(), 2);
        assert_eq!(acc.finish(), SplitSummary::Measured(3.0));
    }
}
