//! PCN memory training binary.
//!
//! Trains a hierarchical or hybrid PCN to store a set of synthetic patterns,
//! then measures how well it recalls them from occluded or noisy cues.
//! Writes JSONL metrics (one event per line) and a final JSON checkpoint.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pcn_memory::data::{add_gaussian_noise, generate_patterns, occlude_bottom, PatternKind};
use pcn_memory::{
    evaluate_reconstruction, save_checkpoint, train_epoch, CheckpointData, Config,
    HierarchicalPcn, HybridPcn, Nonlinearity, PcnResult, Relaxation, Sgd,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Variant {
    Hierarchical,
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Patterns {
    Gaussian,
    Binary,
    Bipolar,
}

impl From<Patterns> for PatternKind {
    fn from(p: Patterns) -> Self {
        match p {
            Patterns::Gaussian => PatternKind::Gaussian,
            Patterns::Binary => PatternKind::Binary,
            Patterns::Bipolar => PatternKind::Bipolar,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "pcn-memory",
    about = "Train a predictive coding network as an associative memory"
)]
struct Args {
    /// Model variant
    #[arg(long, value_enum, default_value_t = Variant::Hierarchical)]
    variant: Variant,

    /// JSON config file; explicit flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Layer sizes, memory layer first, sensory layer last (e.g. 32,128,256)
    #[arg(long, value_delimiter = ',')]
    nodes: Option<Vec<usize>>,

    /// Nonlinearity: identity, sigmoid, binary, tanh or relu
    #[arg(long)]
    nonlin: Option<Nonlinearity>,

    /// Relaxation step size
    #[arg(long)]
    dt: Option<f32>,

    /// L1 penalty on the top layer
    #[arg(long)]
    lamb: Option<f32>,

    /// Enable layer biases
    #[arg(long, default_value_t = false)]
    use_bias: bool,

    /// Std of the initial memory vector
    #[arg(long)]
    init_std: Option<f32>,

    /// Std of the initial recurrent weight (hybrid only)
    #[arg(long)]
    init_std_wr: Option<f32>,

    /// Relaxation steps per episode
    #[arg(long)]
    n_iters: Option<usize>,

    /// Mini-batch size
    #[arg(long)]
    batch_size: Option<usize>,

    /// Training epochs
    #[arg(long)]
    epochs: Option<usize>,

    /// SGD learning rate
    #[arg(long)]
    lr: Option<f32>,

    /// SGD momentum
    #[arg(long)]
    momentum: Option<f32>,

    /// Random seed for init, data and shuffling
    #[arg(long)]
    seed: Option<u64>,

    /// Number of patterns to memorize
    #[arg(long, default_value_t = 64)]
    num_patterns: usize,

    /// Pattern distribution
    #[arg(long, value_enum, default_value_t = Patterns::Binary)]
    patterns: Patterns,

    /// Fraction of each pattern hidden for the occlusion recall test
    #[arg(long, default_value_t = 0.5)]
    occlusion: f32,

    /// Noise std for the noisy recall test (0 = skip)
    #[arg(long, default_value_t = 0.0)]
    noise_std: f32,

    /// Relaxation steps for recall
    #[arg(long, default_value_t = 200)]
    recall_iters: usize,

    /// Evaluate recall every N epochs
    #[arg(long, default_value_t = 10)]
    eval_every: usize,

    /// Output metrics file (JSONL)
    #[arg(long, default_value = "data/output/metrics.jsonl")]
    metrics_file: PathBuf,

    /// Final checkpoint path
    #[arg(long, default_value = "data/checkpoints/pcn-memory.json")]
    checkpoint: PathBuf,

    /// Emit logs as JSON
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Merge the optional config file with explicit flags.
fn resolve_config(args: &Args) -> PcnResult<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_json_file(path)?,
        None => Config::default(),
    };
    let model = &mut config.model;
    if let Some(nodes) = &args.nodes {
        model.nodes = nodes.clone();
    }
    if let Some(nonlin) = args.nonlin {
        model.nonlin = nonlin;
    }
    if let Some(dt) = args.dt {
        model.dt = dt;
    }
    if let Some(lamb) = args.lamb {
        model.lamb = lamb;
    }
    model.use_bias |= args.use_bias;
    if let Some(init_std) = args.init_std {
        model.init_std = init_std;
    }
    if let Some(init_std_wr) = args.init_std_wr {
        model.init_std_wr = init_std_wr;
    }

    let train = &mut config.train;
    if let Some(n_iters) = args.n_iters {
        train.n_iters = n_iters;
    }
    if let Some(batch_size) = args.batch_size {
        train.batch_size = batch_size;
    }
    if let Some(epochs) = args.epochs {
        train.epochs = epochs;
    }
    if let Some(lr) = args.lr {
        train.lr = lr;
    }
    if let Some(momentum) = args.momentum {
        train.momentum = momentum;
    }
    if let Some(seed) = args.seed {
        train.seed = seed;
    }

    config.model.validate()?;
    config.train.validate()?;
    Ok(config)
}

fn write_event(file: &mut File, event: &serde_json::Value) -> PcnResult<()> {
    writeln!(file, "{event}")?;
    file.flush()?;
    Ok(())
}

/// Recall tests on the stored patterns: occlusion, and optionally noise.
fn evaluate<M: Relaxation + Sync>(
    model: &M,
    patterns: &Array2<f32>,
    args: &Args,
    batch_size: usize,
    rng: &mut StdRng,
) -> PcnResult<serde_json::Value> {
    let (occluded, mask) = occlude_bottom(patterns, args.occlusion)?;
    let occl = evaluate_reconstruction(
        model,
        patterns,
        &occluded,
        &mask,
        args.recall_iters,
        batch_size,
    )?;
    let mut event = serde_json::json!({
        "occlusion_mse": occl.mse,
        "occlusion_psnr_db": occl.psnr,
    });
    if args.noise_std > 0.0 {
        let (noisy, mask) = add_gaussian_noise(patterns, args.noise_std, rng)?;
        let noise =
            evaluate_reconstruction(model, patterns, &noisy, &mask, args.recall_iters, batch_size)?;
        event["noise_mse"] = serde_json::json!(noise.mse);
        event["noise_psnr_db"] = serde_json::json!(noise.psnr);
    }
    Ok(event)
}

fn run<M, F>(mut model: M, config: &Config, args: &Args, to_checkpoint: F) -> PcnResult<()>
where
    M: Relaxation + Sync,
    F: Fn(&M, usize, f32) -> CheckpointData,
{
    let train = &config.train;
    let mut rng = StdRng::seed_from_u64(train.seed.wrapping_add(1));
    let patterns = generate_patterns(
        args.patterns.into(),
        args.num_patterns,
        model.net().sensory_dim(),
        &mut rng,
    );
    let mut optimizer = Sgd::with_weight_decay(train.lr, train.momentum, train.weight_decay);

    if let Some(parent) = args.metrics_file.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut metrics_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&args.metrics_file)?;

    info!(
        variant = ?args.variant,
        nodes = ?config.model.nodes,
        nonlin = %config.model.nonlin,
        dt = config.model.dt,
        lamb = config.model.lamb,
        epochs = train.epochs,
        batch_size = train.batch_size,
        n_iters = train.n_iters,
        patterns = args.num_patterns,
        "starting training"
    );

    let start = Instant::now();
    let mut last_energy = f32::NAN;
    for epoch in 1..=train.epochs {
        let metrics = train_epoch(&mut model, &mut optimizer, &patterns, train, &mut rng)?;
        last_energy = metrics.avg_energy;
        if !metrics.avg_energy.is_finite() {
            warn!(epoch, "energy is not finite; consider a smaller dt or lr");
        }
        info!(
            epoch,
            energy = metrics.avg_energy,
            sensory_mse = metrics.avg_sensory_mse,
            "epoch complete"
        );
        write_event(
            &mut metrics_file,
            &serde_json::json!({
                "event": "epoch",
                "epoch": epoch,
                "avg_energy": metrics.avg_energy,
                "avg_sensory_mse": metrics.avg_sensory_mse,
                "elapsed_secs": start.elapsed().as_secs_f32(),
            }),
        )?;

        if args.eval_every > 0 && (epoch % args.eval_every == 0 || epoch == train.epochs) {
            let mut event = evaluate(&model, &patterns, args, train.batch_size, &mut rng)?;
            info!(epoch, recall = %event, "recall evaluated");
            event["event"] = serde_json::json!("eval");
            event["epoch"] = serde_json::json!(epoch);
            write_event(&mut metrics_file, &event)?;
        }
    }

    save_checkpoint(&to_checkpoint(&model, train.epochs, last_energy), &args.checkpoint)?;
    info!(path = %args.checkpoint.display(), "checkpoint saved");
    Ok(())
}

fn train_main(args: &Args) -> PcnResult<()> {
    let config = resolve_config(args)?;
    let mut rng = StdRng::seed_from_u64(config.train.seed);
    match args.variant {
        Variant::Hierarchical => {
            let model = HierarchicalPcn::new_with_rng(&config.model, &mut rng)?;
            run(model, &config, args, CheckpointData::from_hierarchical)
        }
        Variant::Hybrid => {
            let model = HybridPcn::new_with_rng(&config.model, &mut rng)?;
            run(model, &config, args, CheckpointData::from_hybrid)
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.json_logs);

    match train_main(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "training failed");
            ExitCode::FAILURE
        }
    }
}
