//! CLI for computing per-split perplexity of a pretrained checkpoint.

use std::path::PathBuf;

use candle_core::Device;
use clap::Parser;

use seq2seq_ppl::checkpoint;
use seq2seq_ppl::config::ModelConfig;
use seq2seq_ppl::data::EvalDataset;
use seq2seq_ppl::eval::evaluate_split;
use seq2seq_ppl::report::Reporter;

#[derive(Parser, Debug)]
#[command(
    name = "ppl",
    about = "Compute train/validate/test perplexity of a seq2seq checkpoint"
)]
struct Args {
    /// Model hyper-parameter JSON.
    #[arg(long, default_value = "config/model.json")]
    model_config: PathBuf,
    /// CUDA device index; falls back to CPU when CUDA is unavailable.
    #[arg(long, default_value = "0")]
    gpu: usize,
    #[arg(long, default_value = "1")]
    batch_size: usize,
    /// Checkpoint file (model weights plus epoch/loss bookkeeping).
    #[arg(long, default_value = "weights/bestmodel.safetensors")]
    load_dir: PathBuf,
    #[arg(long, default_value = "data/train.safetensors")]
    train_load_dir: PathBuf,
    #[arg(long, default_value = "data/validate.safetensors")]
    validate_load_dir: PathBuf,
    #[arg(long, default_value = "data/test.safetensors")]
    test_load_dir: PathBuf,
    /// Report file; one line per split.
    #[arg(long, default_value = "results/ppl.txt")]
    save_dir: PathBuf,
    /// Override the config hidden size.
    #[arg(long)]
    hidden_size: Option<usize>,
    /// Override the config vocabulary size.
    #[arg(long)]
    vocab_size: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let device = Device::cuda_if_available(args.gpu)?;

    let mut model_config = ModelConfig::load(&args.model_config)?;
    if let Some(hidden_size) = args.hidden_size {
        model_config.hidden_size = hidden_size;
    }
    if let Some(vocab_size) = args.vocab_size {
        model_config.vocab_size = vocab_size;
    }

    let loaded = checkpoint::load_model(&model_config, &args.load_dir, &device)?;
    tracing::info!(
        checkpoint = %args.load_dir.display(),
        epoch = loaded.epoch,
        train_loss = loaded.loss,
        discarded_optimizer_entries = loaded.discarded_optimizer_entries,
        "Checkpoint restored"
    );

    // All three splits load up front so a missing file fails before any
    // evaluation time is spent.
    let splits = [
        ("train", &args.train_load_dir),
        ("validate", &args.validate_load_dir),
        ("test", &args.test_load_dir),
    ];
    let mut datasets = Vec::with_capacity(splits.len());
    for (label, path) in splits {
        let dataset = EvalDataset::load(path)?;
        tracing::info!(
            split = label,
            samples = dataset.len(),
            path = %path.display(),
            "Loaded split"
        );
        datasets.push((label, dataset));
    }

    let mut reporter = Reporter::create(&args.save_dir)?;
    for (label, dataset) in &datasets {
        let summary = evaluate_split(&loaded.model, dataset, args.batch_size, &device)?;
        reporter.record(label, summary)?;
    }
    Ok(())
}
