use anyhow::{Context, Result};
use brats_prep::{
    dataset, plan_split, transforms, Modality, PipelineConfig, Subject,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "brats-prep", version)]
#[command(about = "Preprocessing and batching for multi-modal MRI segmentation datasets")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Move a random sample of subjects into a hold-out directory.
    ///
    /// This MOVES directories: the source loses every selected subject.
    Split {
        /// Directory of subject folders to sample from
        #[arg(short, long)]
        source: PathBuf,

        /// Destination directory, created if missing
        #[arg(short, long)]
        dest: PathBuf,

        /// Number of subjects to move
        #[arg(short, long, default_value_t = brats_prep::split::DEFAULT_SPLIT_COUNT)]
        count: usize,

        /// Selection seed
        #[arg(long, default_value_t = brats_prep::split::DEFAULT_SPLIT_SEED)]
        seed: u64,

        /// Print the selection without moving anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Count subjects in the train/val/test partitions of a dataset
    Summary {
        /// Dataset root holding train/, val/ and test/
        dataset_dir: PathBuf,
    },

    /// Run the batch generator and report what it produces
    Preview {
        /// Directory of subject folders
        pool_dir: PathBuf,

        /// YAML pipeline configuration
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of batches to generate
        #[arg(short, long, default_value_t = 3)]
        batches: usize,
    },

    /// Preprocess one subject and print channel statistics
    Inspect {
        /// Subject directory
        subject_dir: PathBuf,

        /// YAML pipeline configuration
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Split {
            source,
            dest,
            count,
            seed,
            dry_run,
        } => split(&source, &dest, count, seed, dry_run),
        Commands::Summary { dataset_dir } => summary(&dataset_dir),
        Commands::Preview {
            pool_dir,
            config,
            batches,
        } => preview(&pool_dir, config.as_deref(), batches),
        Commands::Inspect {
            subject_dir,
            config,
        } => inspect(&subject_dir, config.as_deref()),
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(p) => PipelineConfig::from_yaml(p)
            .with_context(|| format!("failed to read config {}", p.display())),
        None => Ok(PipelineConfig::default()),
    }
}

fn split(source: &Path, dest: &Path, count: usize, seed: u64, dry_run: bool) -> Result<()> {
    let plan = plan_split(source, count, seed)
        .with_context(|| format!("cannot plan split of {}", source.display()))?;
    info!(
        "Selected {} of {} subjects in {} (seed {})",
        plan.selected().len(),
        plan.population(),
        source.display(),
        seed
    );

    if dry_run {
        for id in plan.selected_ids() {
            println!("{id}");
        }
        return Ok(());
    }

    let moved = plan.execute(dest)?;
    for path in &moved {
        info!("Moved subject {}", path.display());
    }
    info!("Moved {} subjects to {}", moved.len(), dest.display());
    Ok(())
}

fn summary(dataset_dir: &Path) -> Result<()> {
    let counts = dataset::partition_counts(dataset_dir)
        .with_context(|| format!("cannot read dataset {}", dataset_dir.display()))?;
    let total: usize = counts.iter().map(|(_, n)| n).sum();
    for (name, n) in &counts {
        println!("{name:<6} {n:>6}");
    }
    println!("{:<6} {total:>6}", "total");
    Ok(())
}

fn preview(pool_dir: &Path, config: Option<&Path>, batches: usize) -> Result<()> {
    let config = load_config(config)?;
    let generator = config
        .generator(pool_dir)
        .with_context(|| format!("cannot build generator over {}", pool_dir.display()))?;
    info!("Pool has {} subjects", generator.pool().len());

    for (i, batch) in generator.take(batches).enumerate() {
        match batch {
            Ok(batch) => {
                info!(
                    "Batch {} (pass {}): images {:?}, labels {:?}, subjects {:?}",
                    i,
                    batch.pass,
                    batch.images.shape(),
                    batch.labels.shape(),
                    batch.subject_ids
                );
                for skipped in &batch.skipped {
                    warn!("Skipped {}", skipped);
                }
            }
            Err(e) => warn!("Batch {} failed: {}", i, e),
        }
    }
    Ok(())
}

fn inspect(subject_dir: &Path, config: Option<&Path>) -> Result<()> {
    let config = load_config(config)?;
    let subject = Subject::from_dir(subject_dir)?;
    let (image, labels) = config
        .preprocessor()?
        .preprocess(&subject)
        .with_context(|| format!("failed to preprocess {}", subject.dir().display()))?;

    println!("subject {} -> image {:?}", subject.id(), image.shape());
    for m in Modality::ALL {
        let channel = image.index_axis(ndarray::Axis(3), m.channel());
        let stats = transforms::volume_stats(&channel);
        println!(
            "  [{}] {:<6} mean {:>8.4} std {:>8.4}",
            m.channel(),
            m.to_string(),
            stats.mean,
            stats.std
        );
    }
    for (label, count) in transforms::label_histogram(&labels) {
        println!("  label {label}: {count} voxels");
    }
    Ok(())
}
