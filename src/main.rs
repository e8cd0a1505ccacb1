use anyhow::Context;
use clap::{Parser, Subcommand};
use deltabox::config::{Config, LogConfig};
use deltabox::merger::Manifest;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "deltabox", version, about = "Delta container images with lazy extraction")]
struct Cli {
    /// Configuration file (defaults to ./deltabox.* when present)
    #[arg(long, env = "DELTABOX_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Summarise the manifest at the head of a delta image
    Inspect {
        file: PathBuf,

        /// Size of the compressed manifest in bytes
        #[arg(long)]
        header_size: u64,

        /// Also dump every image's entry table
        #[arg(long)]
        toc: bool,
    },
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| log.filter.as_str().into());
    let registry = tracing_subscriber::registry().with(filter);
    if log.json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn inspect(file: &PathBuf, header_size: u64, toc: bool) -> anyhow::Result<()> {
    let mut header = Vec::with_capacity(header_size as usize);
    File::open(file)
        .with_context(|| format!("Failed to open {}", file.display()))?
        .take(header_size)
        .read_to_end(&mut header)?;
    if header.len() as u64 != header_size {
        anyhow::bail!("{} is shorter than its header ({} < {header_size})", file.display(), header.len());
    }
    let manifest = Manifest::decode(&header).context("Failed to decode manifest")?;
    tracing::debug!(file = %file.display(), header_size, "manifest decoded");

    println!("layers: {}", manifest.sources.len());
    println!("ranges: {}", manifest.range_count());
    println!("body:   {} bytes", manifest.body_len());
    for delta in &manifest.deltas {
        println!("image {} ({} entries)", delta.image, delta.len());
        for (tier, checkpoint) in delta.checkpoints.iter().enumerate() {
            println!("  tier {tier}: {checkpoint}");
        }
        if toc {
            delta.export_toc(std::io::stdout().lock(), true)?;
            println!();
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.log);

    match cli.command {
        Command::Inspect { file, header_size, toc } => inspect(&file, header_size, toc),
    }
}
