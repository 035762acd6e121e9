//! Encoder-decoder transformer over Candle tensors.
//!
//! Pre-norm residual blocks throughout. The encoder runs bidirectional
//! self-attention restricted by a padding bias built from the encoder mask;
//! the decoder runs causal self-attention plus cross-attention over the
//! encoder memory. Token and learned position embeddings on both sides.
//! Weight tying: the decoder token embedding doubles as the output
//! projection, so no separate lm_head matrix is stored.
//!
//! There is no dropout and no train-mode state; a constructed model is
//! inference-only by construction.

use candle_core::{DType, Device, Error, IndexOp, Result, Tensor, D};
use candle_nn::{embedding, layer_norm, linear, Embedding, LayerNorm, Linear, Module, VarBuilder};

use crate::config::ModelConfig;

/// Seam between the evaluator and a concrete network: a pure function from
/// padded token/mask tensors to next-token logits.
///
/// Shapes: `(B, Ts)` u32, `(B, Ts)` f32, `(B, Td)` u32, `(B, Td)` f32
/// → `(B, Td, vocab)` f32. Masks are 1 at valid positions, 0 at padding.
pub trait Seq2SeqLm {
    fn forward(
        &self,
        encoder_input: &Tensor,
        encoder_mask: &Tensor,
        decoder_input: &Tensor,
        decoder_mask: &Tensor,
    ) -> Result<Tensor>;
}

// ── Attention biases ────────────────────────────────────────────────────────

/// Additive attention bias from a `{0,1}` padding mask: `(b, t)` → `(b, 1, 1, t)`.
///
/// Valid key positions get 0, padded positions get -1e9 so their softmax
/// weight underflows to zero.
fn padding_bias(mask: &Tensor) -> Result<Tensor> {
    let (b, t) = mask.dims2()?;
    let ones = Tensor::ones((b, t), DType::F32, mask.device())?;
    let inverted = (&ones - mask)?;
    let bias = (-1e9f64 * &inverted)?;
    bias.reshape((b, 1, 1, t))
}

/// Causal bias `(1, 1, t, t)`: 0 on and below the diagonal, -1e9 above.
fn causal_bias(t: usize, device: &Device) -> Result<Tensor> {
    let mask = Tensor::tril2(t, DType::F32, device)?;
    let mask = mask.reshape((1, 1, t, t))?;
    let ones = Tensor::ones((1, 1, t, t), DType::F32, device)?;
    let one_minus_mask = (&ones - &mask)?;
    -1e9f64 * &one_minus_mask
}

// ── Attention ───────────────────────────────────────────────────────────────

/// Multi-head self-attention with a fused Q/K/V projection.
///
/// The caller supplies the additive bias (padding, causal, or their sum),
/// which makes the same layer serve both encoder and decoder blocks.
struct SelfAttention {
    c_attn: Linear,
    c_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl SelfAttention {
    fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let c_attn = linear(hidden, 3 * hidden, vb.pp("c_attn"))?;
        let c_proj = linear(hidden, hidden, vb.pp("c_proj"))?;
        let head_dim = config.head_dim();
        Ok(Self {
            c_attn,
            c_proj,
            num_heads: config.num_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    /// `bias` broadcasts against the raw scores `(b, heads, t, t)`.
    fn forward(&self, x: &Tensor, bias: &Tensor) -> Result<Tensor> {
        let (b, t, c) = x.dims3()?;

        // Fused QKV projection
        let qkv = self.c_attn.forward(x)?;
        let qkv = qkv.reshape((b, t, 3, self.num_heads, self.head_dim))?;
        let qkv = qkv.permute((0, 3, 1, 4, 2))?; // (b, heads, t, head_dim, 3)

        let q = qkv.i((.., .., .., .., 0))?.contiguous()?;
        let k = qkv.i((.., .., .., .., 1))?.contiguous()?;
        let v = qkv.i((.., .., .., .., 2))?.contiguous()?;

        let scores = (q.matmul(&k.t()?)? * self.scale)?;
        let scores = scores.broadcast_add(bias)?;
        let att = candle_nn::ops::softmax(&scores, D::Minus1)?;

        let y = att.contiguous()?.matmul(&v)?;
        let y = y.transpose(1, 2)?; // (b, t, heads, head_dim)
        let y = y.reshape((b, t, c))?;
        self.c_proj.forward(&y)
    }
}

/// Multi-head cross-attention: queries from the decoder stream, keys and
/// values from the encoder memory via a fused K/V projection.
struct CrossAttention {
    q_proj: Linear,
    kv_proj: Linear,
    c_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl CrossAttention {
    fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let q_proj = linear(hidden, hidden, vb.pp("q_proj"))?;
        let kv_proj = linear(hidden, 2 * hidden, vb.pp("kv_proj"))?;
        let c_proj = linear(hidden, hidden, vb.pp("c_proj"))?;
        let head_dim = config.head_dim();
        Ok(Self {
            q_proj,
            kv_proj,
            c_proj,
            num_heads: config.num_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    /// `bias` is the encoder padding bias `(b, 1, 1, ts)`.
    fn forward(&self, x: &Tensor, memory: &Tensor, bias: &Tensor) -> Result<Tensor> {
        let (b, td, c) = x.dims3()?;
        let ts = memory.dim(1)?;

        let q = self
            .q_proj
            .forward(x)?
            .reshape((b, td, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?; // (b, heads, td, head_dim)

        let kv = self.kv_proj.forward(memory)?;
        let kv = kv.reshape((b, ts, 2, self.num_heads, self.head_dim))?;
        let kv = kv.permute((0, 3, 1, 4, 2))?; // (b, heads, ts, head_dim, 2)
        let k = kv.i((.., .., .., .., 0))?.contiguous()?;
        let v = kv.i((.., .., .., .., 1))?.contiguous()?;

        let scores = (q.matmul(&k.t()?)? * self.scale)?;
        let scores = scores.broadcast_add(bias)?;
        let att = candle_nn::ops::softmax(&scores, D::Minus1)?;

        let y = att.contiguous()?.matmul(&v)?;
        let y = y.transpose(1, 2)?; // (b, td, heads, head_dim)
        let y = y.reshape((b, td, c))?;
        self.c_proj.forward(&y)
    }
}

// ── Feed-forward ────────────────────────────────────────────────────────────

/// 2-projection FFN with GELU: `out = W_proj( gelu( W_fc(x) ) )`.
struct FeedForward {
    c_fc: Linear,
    c_proj: Linear,
}

impl FeedForward {
    fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let c_fc = linear(config.hidden_size, config.intermediate_size, vb.pp("c_fc"))?;
        let c_proj = linear(config.intermediate_size, config.hidden_size, vb.pp("c_proj"))?;
        Ok(Self { c_fc, c_proj })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.c_fc.forward(x)?.gelu_erf()?;
        self.c_proj.forward(&h)
    }
}

// ── Embeddings ──────────────────────────────────────────────────────────────

/// Token plus learned position embeddings.
struct TokenEmbedder {
    wte: Embedding,
    wpe: Embedding,
    max_seq_len: usize,
}

impl TokenEmbedder {
    fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let wte = embedding(config.vocab_size, config.hidden_size, vb.pp("wte"))?;
        let wpe = embedding(config.max_seq_len, config.hidden_size, vb.pp("wpe"))?;
        Ok(Self {
            wte,
            wpe,
            max_seq_len: config.max_seq_len,
        })
    }

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (_b, t) = input_ids.dims2()?;
        if t > self.max_seq_len {
            return Err(Error::Msg(format!(
                "sequence length {t} exceeds max_seq_len {}",
                self.max_seq_len
            )));
        }
        let tok = self.wte.forward(input_ids)?;
        let positions = Tensor::arange(0u32, t as u32, input_ids.device())?;
        let pos = self.wpe.forward(&positions)?; // (t, hidden)
        tok.broadcast_add(&pos)
    }
}

// ── Blocks ──────────────────────────────────────────────────────────────────

/// Encoder block: pre-norm → self-attention → residual → pre-norm → FFN → residual.
struct EncoderBlock {
    ln1: LayerNorm,
    attn: SelfAttention,
    ln2: LayerNorm,
    ffn: FeedForward,
}

impl EncoderBlock {
    fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ln1: layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("ln1"))?,
            attn: SelfAttention::new(config, vb.pp("attn"))?,
            ln2: layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("ln2"))?,
            ffn: FeedForward::new(config, vb.pp("mlp"))?,
        })
    }

    fn forward(&self, x: &Tensor, bias: &Tensor) -> Result<Tensor> {
        let normed = self.ln1.forward(x)?;
        let x = (x + self.attn.forward(&normed, bias)?)?;
        let normed = self.ln2.forward(&x)?;
        let x = (&x + self.ffn.forward(&normed)?)?;
        Ok(x)
    }
}

/// Decoder block: causal self-attention, then cross-attention over the
/// encoder memory, then FFN; each sub-layer pre-normed with a residual.
struct DecoderBlock {
    ln1: LayerNorm,
    self_attn: SelfAttention,
    ln2: LayerNorm,
    cross_attn: CrossAttention,
    ln3: LayerNorm,
    ffn: FeedForward,
}

impl DecoderBlock {
    fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ln1: layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("ln1"))?,
            self_attn: SelfAttention::new(config, vb.pp("attn"))?,
            ln2: layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("ln2"))?,
            cross_attn: CrossAttention::new(config, vb.pp("cross_attn"))?,
            ln3: layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("ln3"))?,
            ffn: FeedForward::new(config, vb.pp("mlp"))?,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        memory: &Tensor,
        self_bias: &Tensor,
        cross_bias: &Tensor,
    ) -> Result<Tensor> {
        let normed = self.ln1.forward(x)?;
        let x = (x + self.self_attn.forward(&normed, self_bias)?)?;
        let normed = self.ln2.forward(&x)?;
        let x = (&x + self.cross_attn.forward(&normed, memory, cross_bias)?)?;
        let normed = self.ln3.forward(&x)?;
        let x = (&x + self.ffn.forward(&normed)?)?;
        Ok(x)
    }
}

// ── Seq2SeqTransformer ──────────────────────────────────────────────────────

/// Full encoder-decoder transformer.
///
/// Parameter names under the `VarBuilder`: `encoder.{wte,wpe,h.N.*,ln_f}` and
/// `decoder.{wte,wpe,h.N.*,ln_f}`. The decoder `wte` is shared with the
/// output projection.
pub struct Seq2SeqTransformer {
    encoder_embed: TokenEmbedder,
    encoder_blocks: Vec<EncoderBlock>,
    encoder_ln_f: LayerNorm,
    decoder_embed: TokenEmbedder,
    decoder_blocks: Vec<DecoderBlock>,
    decoder_ln_f: LayerNorm,
    config: ModelConfig,
}

impl Seq2SeqTransformer {
    pub fn new(vb: VarBuilder, config: &ModelConfig) -> Result<Self> {
        let enc = vb.pp("encoder");
        let encoder_embed = TokenEmbedder::new(config, enc.clone())?;
        let mut encoder_blocks = Vec::with_capacity(config.num_encoder_layers);
        for i in 0..config.num_encoder_layers {
            encoder_blocks.push(EncoderBlock::new(config, enc.pp(format!("h.{i}")))?);
        }
        let encoder_ln_f = layer_norm(config.hidden_size, config.layer_norm_eps, enc.pp("ln_f"))?;

        let dec = vb.pp("decoder");
        let decoder_embed = TokenEmbedder::new(config, dec.clone())?;
        let mut decoder_blocks = Vec::with_capacity(config.num_decoder_layers);
        for i in 0..config.num_decoder_layers {
            decoder_blocks.push(DecoderBlock::new(config, dec.pp(format!("h.{i}")))?);
        }
        let decoder_ln_f = layer_norm(config.hidden_size, config.layer_norm_eps, dec.pp("ln_f"))?;

        Ok(Self {
            encoder_embed,
            encoder_blocks,
            encoder_ln_f,
            decoder_embed,
            decoder_blocks,
            decoder_ln_f,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Encode the source sequence into memory states `(b, ts, hidden)`.
    fn encode(&self, encoder_input: &Tensor, encoder_mask: &Tensor) -> Result<Tensor> {
        let bias = padding_bias(encoder_mask)?;
        let mut x = self.encoder_embed.forward(encoder_input)?;
        for block in &self.encoder_blocks {
            x = block.forward(&x, &bias)?;
        }
        self.encoder_ln_f.forward(&x)
    }
}

impl Seq2SeqLm for Seq2SeqTransformer {
    fn forward(
        &self,
        encoder_input: &Tensor,
        encoder_mask: &Tensor,
        decoder_input: &Tensor,
        decoder_mask: &Tensor,
    ) -> Result<Tensor> {
        let memory = self.encode(encoder_input, encoder_mask)?;
        let cross_bias = padding_bias(encoder_mask)?;

        let (_b, td) = decoder_input.dims2()?;
        let self_bias =
            causal_bias(td, decoder_input.device())?.broadcast_add(&padding_bias(decoder_mask)?)?;

        let mut x = self.decoder_embed.forward(decoder_input)?;
        for block in &self.decoder_blocks {
            x = block.forward(&x, &memory, &self_bias, &cross_bias)?;
        }
        let x = self.decoder_ln_f.forward(&x)?;

        // Weight-tied output projection: logits = x @ wte^T
        let wte_weight = self.decoder_embed.wte.embeddings();
        let (b, t, h) = x.dims3()?;
        let x_2d = x.reshape((b * t, h))?;
        let logits = x_2d.matmul(&wte_weight.t()?)?;
        logits.reshape((b, t, self.config.vocab_size))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
