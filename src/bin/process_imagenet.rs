use batch_whitening::normalize::DEFAULT_NORMALIZE_EPS;
use batch_whitening::{
    DatasetKind, FitStrategy, Preprocessor, ProcessConfig, ProcessOutcome, WhiteningConfig,
    WhiteningMode, DEFAULT_REGULARIZER,
};
use clap::Parser;
use log::info;
use std::error::Error;
use std::path::PathBuf;

/// Normalize a downsampled ImageNet variant and export it as .npz, optionally ZCA-whitened.
#[derive(Parser, Debug)]
#[command(name = "process_imagenet", version, about)]
struct Args {
    /// Directory containing the raw dataset folder (e.g. <DATA>/imagenet32)
    #[arg(short, long)]
    data: PathBuf,

    /// Dataset to process: imagenet8, imagenet16, imagenet32 or imagenet64
    #[arg(long, default_value = "imagenet32")]
    dataset: DatasetKind,

    /// Output directory; an existing directory skips the run
    #[arg(short, long, default_value = "proc")]
    output: PathBuf,

    /// Standard deviation floor for per-sample normalization
    #[arg(long, default_value_t = DEFAULT_NORMALIZE_EPS)]
    eps: f32,

    /// Store arrays without deflate compression
    #[arg(long)]
    uncompressed: bool,

    /// Whiten the normalized data and write *-proc.npz files
    #[arg(long)]
    whiten: bool,

    /// Plain PCA whitening instead of ZCA
    #[arg(long, requires = "whiten")]
    no_zca: bool,

    /// Principal directions to keep (defaults to one per feature)
    #[arg(long)]
    components: Option<usize>,

    /// Added to each singular value before inversion
    #[arg(long, default_value_t = DEFAULT_REGULARIZER)]
    regularizer: f64,

    /// Decomposition used for the fit: svd or covariance
    #[arg(long, default_value = "svd")]
    strategy: FitStrategy,

    /// Fit the whitening on a random subset of this many train samples
    #[arg(long)]
    max_fit_samples: Option<usize>,

    /// Seed for the fit subset
    #[arg(short, long, default_value_t = 42)]
    seed: u64,

    /// Samples per block when applying the whitening
    #[arg(long, default_value_t = 8192)]
    chunk_size: usize,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> ProcessConfig {
        let whitening = self.whiten.then(|| WhiteningConfig {
            n_components: self.components,
            regularizer: self.regularizer,
            mode: WhiteningMode::from_flags(true, !self.no_zca),
            strategy: self.strategy,
            max_fit_samples: self.max_fit_samples,
            seed: self.seed,
        });
        ProcessConfig {
            data_dir: self.data,
            output_dir: self.output,
            dataset: self.dataset,
            eps: self.eps,
            compressed: !self.uncompressed,
            whitening,
            transform_chunk_size: self.chunk_size,
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let config = args.into_config();
    info!("Configuration: {:?}", config);

    match Preprocessor::new(config).run()? {
        ProcessOutcome::Skipped { output_dir } => {
            info!("Nothing to do; {} already exists.", output_dir.display());
        }
        ProcessOutcome::Completed { written } => {
            for path in &written {
                info!("  {}", path.display());
            }
            info!("Finished; wrote {} files.", written.len());
        }
    }
    Ok(())
}
