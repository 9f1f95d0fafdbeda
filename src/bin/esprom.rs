//! ESPROM command-line tool
//!
//! Lists, extracts and copies ROM containers using direct I/O

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use esprom_rs::{bulk_copy, AccessMode, CatalogConfig, DirectOpenOptions, RomCatalog, SampleRange};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "esprom")]
#[command(about = "Inspect and extract samples from ESPROM ROM containers")]
#[command(version)]
struct Args {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the samples of a ROM
    Info {
        /// ROM container
        rom: PathBuf,

        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,

        /// Bytes per in-memory chunk
        #[arg(long)]
        chunk_payload: Option<usize>,
    },

    /// Write one sample to a file
    Extract {
        /// ROM container
        rom: PathBuf,

        /// Sample id
        id: usize,

        /// Output file
        out: PathBuf,
    },

    /// Copy a whole file through an aligned buffer
    Copy {
        from: PathBuf,
        to: PathBuf,

        /// Permission bits of the created file (octal)
        #[arg(long, default_value = "644")]
        mode: String,
    },
}

#[derive(Serialize)]
struct SampleSummary {
    id: usize,
    #[serde(flatten)]
    range: SampleRange,
    len: usize,
    crc32: u32,
}

#[derive(Serialize)]
struct RomSummary {
    path: PathBuf,
    span: u64,
    pool_bytes: usize,
    chunks: usize,
    samples: Vec<SampleSummary>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Info {
            rom,
            json,
            chunk_payload,
        } => info_cmd(rom, json, chunk_payload),
        Command::Extract { rom, id, out } => extract_cmd(rom, id, out),
        Command::Copy { from, to, mode } => copy_cmd(from, to, &mode),
    }
}

fn info_cmd(rom: PathBuf, json: bool, chunk_payload: Option<usize>) -> Result<()> {
    let mut config = CatalogConfig::new();
    if let Some(payload) = chunk_payload {
        config = config.chunk_payload(payload);
    }
    let catalog = RomCatalog::open_with(&rom, &config)
        .with_context(|| format!("Failed to load ROM {:?}", rom))?;

    let mut samples = Vec::with_capacity(catalog.len());
    for (id, range) in catalog.samples().iter().enumerate() {
        let mut view = catalog.sample_view(id)?;
        let mut hasher = crc32fast::Hasher::new();
        loop {
            let window = view.next_window()?;
            if window.is_empty() {
                break;
            }
            hasher.update(window);
        }
        samples.push(SampleSummary {
            id,
            range: *range,
            len: range.len(),
            crc32: hasher.finalize(),
        });
    }

    let summary = RomSummary {
        path: rom,
        span: catalog.span(),
        pool_bytes: catalog.pool().len(),
        chunks: catalog.pool().chunk_count(),
        samples,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("ROM:     {:?}", summary.path);
    println!("Span:    {} bytes", summary.span);
    println!("Pool:    {} bytes in {} chunks", summary.pool_bytes, summary.chunks);
    println!();
    println!("{:>5}  {:>10}  {:>10}  {:>10}  {:>8}", "id", "start", "end", "len", "crc32");
    for sample in &summary.samples {
        println!(
            "{:>5}  {:>10}  {:>10}  {:>10}  {:08x}",
            sample.id, sample.range.start, sample.range.end, sample.len, sample.crc32
        );
    }
    Ok(())
}

fn extract_cmd(rom: PathBuf, id: usize, out: PathBuf) -> Result<()> {
    let catalog =
        RomCatalog::open(&rom).with_context(|| format!("Failed to load ROM {:?}", rom))?;
    let mut view = catalog.sample_view(id)?;

    let mut file = DirectOpenOptions::new()
        .access(AccessMode::WriteOnly)
        .create(true)
        .truncate(true)
        .open(&out)
        .with_context(|| format!("Failed to create {:?}", out))?;

    let mut written = 0usize;
    loop {
        let window = view.next_window()?;
        if window.is_empty() {
            break;
        }
        let n = file.write(window)?;
        if n != window.len() {
            bail!("Short write to {:?}: {} of {} bytes", out, n, window.len());
        }
        written += n;
    }
    file.close()?;

    info!("Extracted sample {} ({} bytes) to {:?}", id, written, out);
    Ok(())
}

fn copy_cmd(from: PathBuf, to: PathBuf, mode: &str) -> Result<()> {
    let mode = u32::from_str_radix(mode, 8)
        .with_context(|| format!("Invalid octal mode '{}'", mode))?;
    let copied = bulk_copy(&from, &to, mode)?;
    info!("Copied {} bytes from {:?} to {:?}", copied, from, to);
    Ok(())
}
