//! seq2seq-ppl: perplexity evaluation for a pretrained encoder-decoder
//! transformer language model.
//!
//! Restores a trained checkpoint, runs inference-only forward passes over
//! three pre-tokenised splits (train, validate, test), and reports the mean
//! of per-batch perplexities for each split.
//!
//! * **[`ModelConfig`]** — model hyper-parameters (serialised as JSON).
//! * **[`Seq2SeqTransformer`]** — encoder-decoder LM over Candle tensors.
//! * **[`checkpoint`]** — restore weights and training bookkeeping from a
//!   safetensors bundle.
//! * **[`EvalDataset`]** — pre-tokenised split with fixed-size batching.
//! * **[`eval`]** — masked token-averaged cross-entropy and per-split
//!   perplexity.
//! * **[`Reporter`]** — per-split result lines on stdout and a report file.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod eval;
pub mod model;
pub mod report;

pub use config::ModelConfig;
pub use data::{Batch, EvalDataset};
pub use eval::{evaluate_split, PerplexityAccumulator, SplitSummary};
pub use model::{Seq2SeqLm, Seq2SeqTransformer};
pub use report::Reporter;
