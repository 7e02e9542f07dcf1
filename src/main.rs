//! darknet-extract - Darknet weights to flat binary converter
//!
//! Extracts weights and biases from a Darknet .cfg/.weights pair, folds batch
//! normalization into the convolutions, and writes flat float32 (or INT16
//! Q-format) streams for accelerator loaders.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::PathBuf;

use darknet_extract::{
    parse_cfg_file, resolve_channels, BinarySink, ExtractOptions, ExtractSummary, Extractor,
    LayerKind, OutputFormat, ResolvedNetwork, WeightsReader, DEFAULT_EPSILON,
};

#[derive(Parser, Debug)]
#[command(name = "darknet-extract")]
#[command(about = "Extract weights and biases from Darknet format to binary files")]
#[command(version)]
struct Args {
    /// Darknet .cfg file
    #[arg(long)]
    cfg: PathBuf,

    /// Darknet .weights file
    #[arg(long)]
    weights: PathBuf,

    /// Output weights file
    #[arg(long, default_value = "weights.bin")]
    output_weights: PathBuf,

    /// Output bias file
    #[arg(long, default_value = "bias.bin")]
    output_bias: PathBuf,

    /// Emit INT16 Q-format instead of float32
    #[arg(long)]
    int16: bool,

    /// Per-layer Q values (one little-endian i32 per conv layer), INT16 mode only
    #[arg(long, default_value = "q.bin")]
    output_q: PathBuf,

    /// Batch norm epsilon
    #[arg(long, default_value_t = DEFAULT_EPSILON)]
    epsilon: f32,

    /// Write a JSON report of the run
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if value >= 10.0 {
        format!("{:.1} {}", value, UNITS[unit])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

fn print_network(resolved: &ResolvedNetwork) {
    let config = &resolved.network.config;
    let counts = resolved.network.kind_counts();
    println!("\nConfiguration Summary:");
    println!("Network: {}x{}x{}", config.width, config.height, config.channels);
    println!("Total layers: {}", resolved.layers().len());
    println!("  Convolutional: {}", counts.convolutional);
    println!("  Pool: {}", counts.pool);
    println!("  Other: {}", counts.other);

    println!("\nLayer details:");
    for layer in resolved.layers() {
        match &layer.kind {
            LayerKind::Convolution(conv) => println!(
                "  [{:3}] {:14} filters={} size={} stride={} groups={} in={}{}",
                layer.index,
                layer.kind.name(),
                conv.filters,
                conv.size,
                conv.stride,
                conv.groups,
                layer.input_channels,
                if conv.batch_normalize { ", BN" } else { "" }
            ),
            _ => println!(
                "  [{:3}] {:14} {} -> {} channels",
                layer.index,
                layer.kind.name(),
                layer.input_channels,
                layer.output_channels
            ),
        }
    }
}

fn print_summary(args: &Args, summary: &ExtractSummary, format: OutputFormat) {
    let element = format.element_size() as u64;
    println!("\n=========================");
    println!("Extraction completed successfully!");
    println!("=========================");
    println!("\nStatistics:");
    println!("  Layers processed: {}", summary.layers.len());
    println!("  Total weights: {}", summary.total_weights);
    println!("  Total biases: {}", summary.total_biases);
    println!("  Total parameters: {}", summary.total_parameters());
    println!("  Weights read: {}", format_bytes(summary.bytes_read));
    if !summary.diagnostics.is_empty() {
        println!("  Shape warnings: {}", summary.diagnostics.len());
    }
    println!("\nOutput files:");
    println!(
        "  Weights: {} ({})",
        args.output_weights.display(),
        format_bytes(summary.total_weights as u64 * element)
    );
    println!(
        "  Biases:  {} ({})",
        args.output_bias.display(),
        format_bytes(summary.total_biases as u64 * element)
    );
    if format == OutputFormat::Int16 {
        println!("  Q values: {}", args.output_q.display());
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    println!("Darknet Weights Extractor v{}", env!("CARGO_PKG_VERSION"));
    println!("Config:  {}", args.cfg.display());
    println!("Weights: {}", args.weights.display());

    let network = parse_cfg_file(&args.cfg)
        .with_context(|| format!("Failed to parse config file: {}", args.cfg.display()))?;
    let resolved = resolve_channels(network).context("Failed to resolve layer shapes")?;

    let conv_count = resolved.conv_layers().count();
    println!("Found {} convolutional layers", conv_count);
    if args.verbose {
        print_network(&resolved);
    }

    let expected = resolved.stream_floats() as u64 * 4;
    if let Ok(meta) = fs::metadata(&args.weights) {
        log::info!(
            "graph expects {} of layer data, weights file is {}",
            format_bytes(expected),
            format_bytes(meta.len())
        );
    }

    let mut reader = WeightsReader::open(&args.weights).context("Failed to open weights file")?;

    let format = if args.int16 {
        OutputFormat::Int16
    } else {
        OutputFormat::Float32
    };
    let q_path = (format == OutputFormat::Int16).then_some(args.output_q.as_path());
    let mut sink = BinarySink::create(&args.output_weights, &args.output_bias, q_path)
        .context("Failed to create output files")?;

    let options = ExtractOptions {
        epsilon: args.epsilon,
        format,
    };

    println!("\nExtracting and processing layers...");
    let pb = if args.verbose {
        None
    } else {
        let pb = ProgressBar::new(conv_count as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .context("Invalid progress bar template")?
                .progress_chars("#>-"),
        );
        Some(pb)
    };

    let result = Extractor::new(&resolved, options).run(&mut reader, &mut sink, |report| {
        if let Some(ref pb) = pb {
            pb.inc(1);
            pb.set_message(format!("layer {}", report.index));
        }
    });
    if let Some(pb) = pb {
        pb.finish_with_message("Done");
    }
    let summary = result.context("Extraction failed")?;

    if let Some(ref manifest) = args.manifest {
        let file = File::create(manifest)
            .with_context(|| format!("Failed to create manifest: {}", manifest.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &summary)
            .context("Failed to write manifest")?;
    }

    print_summary(&args, &summary, format);

    Ok(())
}
