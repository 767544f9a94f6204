use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use rand::Rng;
use tracing::info;
use trt_runner::{
    backend, BackendKind, BindingDesc, DeviceTensor, Engine, RunMode, RunnerConfig, Tensor,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serialized engine file
    engine: Option<PathBuf>,

    /// JSON runner config; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Runtime backend (reference, tensorrt)
    #[arg(long)]
    backend: Option<BackendKind>,

    /// GPU ordinal
    #[arg(long)]
    device: Option<i32>,

    /// Number of samples in the synthetic batch
    #[arg(short, long)]
    batch: Option<usize>,

    /// How many times to run the batch
    #[arg(short = 'n', long)]
    iterations: Option<usize>,

    /// per-sample or device
    #[arg(short, long)]
    mode: Option<RunMode>,

    /// Print the engine summary as JSON
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let config = build_config(&args)?;
    let engine_path = config
        .engine_path()
        .context("no engine file given (pass ENGINE or set \"engine\" in the config)")?;

    let backend = backend::create(config.backend, config.device)?;
    let mut engine = Engine::open(backend, &engine_path)
        .with_context(|| format!("failed to load engine {}", engine_path.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&engine.summary())?);
    } else {
        println!("{}", engine);
    }

    let batch = random_batch(engine.input(), config.batch)?;
    info!("Input batch {} ({} mode)", batch.signature(), config.mode);

    let mut last = None;
    for iteration in 0..config.iterations {
        let started = Instant::now();
        let result = match config.mode {
            RunMode::PerSample => engine.run(&batch)?,
            RunMode::Device => {
                let input = DeviceTensor::upload(engine.backend(), &batch)?;
                engine.run_on_device(&input)?.download()?
            }
        };
        info!(
            iteration,
            elapsed_ms = started.elapsed().as_secs_f64() * 1e3,
            "inference done"
        );
        last = Some(result);
    }

    if let Some(result) = last {
        println!("{}", result.signature());
    }

    Ok(())
}

fn build_config(args: &Args) -> anyhow::Result<RunnerConfig> {
    let mut config = match &args.config {
        Some(path) => RunnerConfig::load(path)?,
        None => RunnerConfig::default(),
    };

    if let Some(engine) = &args.engine {
        // Paths given on the command line are relative to the working directory
        config.engine = Some(std::env::current_dir()?.join(engine));
    }
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if let Some(device) = args.device {
        config.device = device;
    }
    if let Some(batch) = args.batch {
        config.batch = batch;
    }
    if let Some(iterations) = args.iterations {
        config.iterations = iterations;
    }
    if let Some(mode) = args.mode {
        config.mode = mode;
    }

    config.validate()?;
    Ok(config)
}

/// Uniform values in [0, 1), like a freshly sampled image batch.
fn random_batch(input: &BindingDesc, samples: usize) -> anyhow::Result<Tensor> {
    let shape = input.shape.batched(samples);
    let mut rng = rand::thread_rng();
    let values: Vec<f32> = (0..shape.volume()).map(|_| rng.gen::<f32>()).collect();
    Ok(Tensor::from_f32(input.dtype, shape, &values)?)
}
