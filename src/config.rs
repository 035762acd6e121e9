//! Model configuration for the encoder-decoder transformer.
//!
//! Serialised as JSON so the same file travels with a checkpoint. Missing
//! newer fields fall back to their `#[serde(default)]` values, so configs
//! written by older tooling still load.

use serde::{Deserialize, Serialize};

/// Hyper-parameters of the encoder-decoder transformer.
///
/// Stored alongside weights for reproducible restore. `hidden_size` and
/// `vocab_size` may be overridden from the command line; they must then match
/// the checkpoint being loaded or model construction fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Vocabulary size (must match the tokeniser used for the datasets).
    pub vocab_size: usize,
    /// Hidden size (model dimension d_model).
    pub hidden_size: usize,
    /// Number of attention heads.
    pub num_heads: usize,
    /// Number of encoder layers.
    pub num_encoder_layers: usize,
    /// Number of decoder layers.
    pub num_decoder_layers: usize,
    /// FFN intermediate dimension.
    pub intermediate_size: usize,
    /// Maximum sequence length (bounds the position embedding tables).
    pub max_seq_len: usize,
    /// Layer norm epsilon.
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 50265,
            hidden_size: 768,
            num_heads: 12,
            num_encoder_layers: 6,
            num_decoder_layers: 6,
            intermediate_size: 3072,
            max_seq_len: 512,
            layer_norm_eps: 1e-5,
        }
    }
}

impl ModelConfig {
    /// Head dimension (`hidden_size / num_heads`). Panics if not divisible.
    pub fn head_dim(&self) -> usize {
        assert!(
            self.hidden_size % self.num_heads == 0,
            "hidden_size ({}) must be divisible by num_heads ({})",
            self.hidden_size,
            self.num_heads,
        );
        self.hidden_size / self.num_heads
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
