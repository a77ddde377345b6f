//! Stasis - precompressed static asset server
//!
//! This is the main entry point for the Stasis CLI.

mod server;

use anyhow::Context;
use clap::{Parser, Subcommand};
use stasis_core::config::{ConfigLoader, StasisConfig};
use stasis_static::{CompressionOptions, Encoding, StaticFiles, compress_dir};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Stasis - serve static assets with precomputed compression and validators
#[derive(Parser)]
#[command(name = "stasis")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the asset index and serve it over HTTP
    Serve {
        /// Path to the configuration file (.toml or .json)
        #[arg(default_value = "stasis.toml")]
        config: PathBuf,
    },

    /// Build the asset index and print it
    Scan {
        /// Path to the configuration file (.toml or .json)
        #[arg(default_value = "stasis.toml")]
        config: PathBuf,
    },

    /// Write compressed siblings next to every compressible file in a directory
    Compress {
        /// Directory to compress
        root: PathBuf,

        /// Don't list the files written
        #[arg(short, long)]
        quiet: bool,

        /// Don't produce brotli files
        #[arg(long)]
        no_brotli: bool,

        /// Don't produce gzip files
        #[arg(long)]
        no_gzip: bool,

        /// Also produce zstd files
        #[arg(long)]
        zstd: bool,
    },

    /// Show version information
    Version,
}

/// Install the subscriber; `RUST_LOG` wins over the configured level
fn init_tracing(level: &str, verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new(level)
        }
    });
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}

fn load_config(path: &Path) -> anyhow::Result<StasisConfig> {
    ConfigLoader::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => {
            let config = load_config(&config)?;
            init_tracing(&config.logging.level, cli.verbose);
            serve(config).await
        }
        Commands::Scan { config } => {
            let config = load_config(&config)?;
            init_tracing(&config.logging.level, cli.verbose);
            scan(config).await
        }
        Commands::Compress {
            root,
            quiet,
            no_brotli,
            no_gzip,
            zstd,
        } => {
            init_tracing("warn", cli.verbose);
            compress(root, quiet, no_brotli, no_gzip, zstd).await
        }
        Commands::Version => {
            println!("stasis {}", stasis_core::VERSION);
            Ok(())
        }
    }
}

async fn serve(config: StasisConfig) -> anyhow::Result<()> {
    let files = StaticFiles::from_config(&config)?;
    let report = files.rebuild().await?;
    for error in &report.errors {
        tracing::warn!("⚠️ {}", error);
    }

    let server = server::HttpServer::bind(&config.listen, Arc::new(files))
        .await
        .with_context(|| format!("Failed to listen on {}", config.listen))?;
    server.run().await?;
    Ok(())
}

async fn scan(config: StasisConfig) -> anyhow::Result<()> {
    let files = StaticFiles::from_config(&config)?;
    let report = files.rebuild().await?;
    let snapshot = files.snapshot()?;

    let mut records: Vec<_> = snapshot.records().collect();
    records.sort_by(|a, b| a.key().cmp(b.key()));
    for record in records {
        let variants: Vec<String> = record
            .variants()
            .iter()
            .skip(1)
            .map(|v| format!("{}={}", v.encoding_name(), v.size))
            .collect();
        println!(
            "{}\t{}\t{}\t{}\t{}",
            record.key(),
            if record.is_immutable() { "immutable" } else { "standard" },
            record.identity().size,
            record.etag_str(),
            variants.join(" ")
        );
        for alias in record.aliases() {
            println!("  <- {}", alias);
        }
    }

    println!(
        "📦 {} assets, {} compressed variants, {} aliases, {} redirects in {:?}",
        report.assets, report.variants, report.aliases, report.redirects, report.elapsed
    );
    for error in &report.errors {
        eprintln!("❌ {}", error);
    }
    Ok(())
}

async fn compress(
    root: PathBuf,
    quiet: bool,
    no_brotli: bool,
    no_gzip: bool,
    zstd: bool,
) -> anyhow::Result<()> {
    let encodings: Vec<Encoding> = Encoding::ALL
        .into_iter()
        .filter(|e| match e {
            Encoding::Brotli => !no_brotli,
            Encoding::Gzip => !no_gzip,
            Encoding::Zstd => zstd,
        })
        .collect();
    if encodings.is_empty() {
        anyhow::bail!("Nothing to do: every encoding is disabled");
    }
    let options = CompressionOptions {
        encodings,
        ..Default::default()
    };

    let report = compress_dir(&root, Arc::new(options))
        .await
        .with_context(|| format!("Failed to compress {}", root.display()))?;
    if !quiet {
        for path in &report.written {
            println!("{}", path.display());
        }
    }
    for error in &report.errors {
        eprintln!("❌ {}", error);
    }
    if !quiet {
        println!(
            "🗜️ {} files considered, {} written",
            report.considered,
            report.written.len()
        );
    }
    Ok(())
}
