//! rvq-probe — quantize random latents and report reconstruction quality.
//!
//! Builds a residual quantizer from a JSON config (or defaults), runs one
//! forward pass over Gaussian input, decodes the indices again and prints a
//! one-line JSON summary to stdout:
//!
//! ```json
//! {"indices_shape":[4,50,8],"mse":0.61,"decode_matches":true,"stage_losses":[...]}
//! ```
//!
//! Exit code 0 on success, non-zero on error.

use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use residual_vq::{ForwardOptions, ResidualVq, ResidualVqConfig};

#[derive(Parser, Debug)]
#[command(
    name = "rvq-probe",
    about = "Probe a residual vector quantizer on random input"
)]
struct Args {
    /// JSON file with a ResidualVqConfig. Defaults are used when omitted.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Batch size.
    #[arg(long, default_value_t = 4)]
    batch: usize,

    /// Sequence length.
    #[arg(long, default_value_t = 50)]
    seq: usize,

    /// Quantizer dropout seed (only used with --train).
    #[arg(long, short = 's')]
    seed: Option<u64>,

    /// Run in training mode (enables quantizer dropout).
    #[arg(long)]
    train: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.batch == 0 || args.seq == 0 {
        anyhow::bail!("batch and seq must be positive");
    }

    let cfg = match &args.config {
        Some(path) => ResidualVqConfig::from_json_file(path)
            .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", path.display()))?,
        None => ResidualVqConfig::default(),
    };

    let device = Device::cuda_if_available(0)?;
    tracing::info!("Using device: {:?}", device);
    tracing::info!(
        dim = cfg.dim,
        num_quantizers = cfg.num_quantizers,
        codebook_size = cfg.stage.codebook_size,
        "building residual quantizer"
    );

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let rvq = ResidualVq::new(&cfg, vb)?;

    let x = Tensor::randn(0f32, 1.0, (args.batch, args.seq, cfg.dim), &device)?;
    let opts = ForwardOptions {
        train: args.train,
        dropout_seed: args.seed,
        ..ForwardOptions::default()
    };

    let t0 = std::time::Instant::now();
    let out = rvq.forward(&x, &opts)?;
    tracing::info!("Forward: {:.3}s", t0.elapsed().as_secs_f64());

    let mse: f32 = (&out.quantized - &x)?.sqr()?.mean_all()?.to_scalar()?;
    let decoded = rvq.get_output_from_indices(&out.indices)?;
    let decode_err: f32 = (&decoded - &out.quantized)?
        .abs()?
        .max_all()?
        .to_scalar()?;
    let stage_losses: Vec<f32> = out.losses.to_dtype(DType::F32)?.to_vec1()?;

    let summary = serde_json::json!({
        "indices_shape": out.indices.dims(),
        "mse": mse,
        "decode_matches": decode_err <= 1e-5,
        "stage_losses": stage_losses,
        "commitment_loss": out.commitment_loss.to_dtype(DType::F32)?.to_scalar::<f32>()?,
    });
    println!("{summary}");

    Ok(())
}
