use anyhow::Result;
use clap::{Parser, Subcommand};
use std::ops::Range;
use std::path::PathBuf;
use tracing::info;

use hapz_lib::cli::{CompressConfig, DecompressConfig};
use hapz_lib::compression::AlleleWindow;

#[derive(Parser)]
#[command(name = "hapz")]
#[command(author = "hapz Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Compression of haplotype bit-vectors with random-access decoding", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compress a raw vector file (two bit-planes per site)
    Compress(CompressArgs),
    /// Decompress a hapz archive, optionally a range or sample subset of it
    Decompress(DecompressArgs),
}

#[derive(Parser)]
struct CompressArgs {
    /// Input raw vector file (`-` for stdin)
    #[arg(short, long, value_name = "FILE", required = true)]
    input: PathBuf,

    /// Output hapz archive file
    #[arg(short, long, value_name = "FILE", required = true)]
    output: PathBuf,

    /// Number of threads (0 = auto-detect)
    #[arg(short = 't', long, default_value = "0")]
    threads: usize,

    /// Number of samples
    #[arg(short = 's', long, value_name = "N", required = true)]
    samples: u32,

    /// Haplotypes per sample
    #[arg(short, long, default_value = "2")]
    ploidy: u32,

    /// Sites per block
    #[arg(long, default_value = "3584")]
    variants_per_block: u32,

    /// Maximum match depth (0 disables sub-vector matches)
    #[arg(short = 'd', long, default_value = "100")]
    max_depth: u32,

    /// Density buckets with separate statistics (1-32)
    #[arg(long, default_value = "8")]
    ones_ranges: u32,

    /// Bit width of match offsets (1-24)
    #[arg(long, default_value = "8")]
    match_bits: u32,

    /// Bit width of copy offsets (1-31)
    #[arg(long, default_value = "17")]
    copy_bits: u32,

    /// Keep haplotype columns in input order
    #[arg(long)]
    no_permute: bool,
}

#[derive(Parser)]
struct DecompressArgs {
    /// Input hapz archive
    #[arg(short, long, value_name = "FILE", required = true)]
    input: PathBuf,

    /// Output raw vector file (`-` for stdout)
    #[arg(short, long, value_name = "FILE", required = true)]
    output: PathBuf,

    /// Number of threads
    #[arg(short = 't', long, default_value_t = hapz_lib::cli::num_cpus())]
    threads: usize,

    /// Site index range, `START-END` (end exclusive)
    #[arg(short = 'r', long, value_name = "RANGE", value_parser = parse_site_range)]
    range: Option<Range<u64>>,

    /// Comma-separated sample indices, in output order
    #[arg(short = 's', long, value_name = "IDS", value_delimiter = ',')]
    samples: Option<Vec<u32>>,

    /// Maximum number of sites to write
    #[arg(short = 'n', long)]
    limit: Option<u64>,

    /// Vector cache budget in MB (0 = no budget)
    #[arg(short = 'm', long, default_value = "0")]
    memory_mb: u64,

    /// Disable the decoded vector cache
    #[arg(long)]
    no_cache: bool,

    /// Memory-map the archive
    #[arg(long)]
    mmap: bool,

    /// Minimum alternate allele count
    #[arg(long, default_value = "0")]
    min_ac: u32,

    /// Maximum alternate allele count
    #[arg(long, default_value_t = u32::MAX)]
    max_ac: u32,

    /// Minimum alternate allele frequency
    #[arg(long, default_value = "0.0")]
    min_af: f64,

    /// Maximum alternate allele frequency
    #[arg(long, default_value = "1.0")]
    max_af: f64,
}

fn parse_site_range(s: &str) -> Result<Range<u64>, String> {
    let (start, end) = s
        .split_once('-')
        .ok_or_else(|| format!("expected START-END, got `{s}`"))?;
    let start: u64 = start.trim().parse().map_err(|e| format!("bad range start `{start}`: {e}"))?;
    let end: u64 = end.trim().parse().map_err(|e| format!("bad range end `{end}`: {e}"))?;
    if start > end {
        return Err(format!("range start {start} is past its end {end}"));
    }
    Ok(start..end)
}

impl CompressArgs {
    fn into_config(self) -> CompressConfig {
        CompressConfig {
            input: self.input,
            output: self.output,
            threads: self.threads,
            n_samples: self.samples,
            ploidy: self.ploidy,
            variants_per_block: self.variants_per_block,
            max_depth: self.max_depth,
            ones_ranges: self.ones_ranges,
            match_pos_diff_bits: self.match_bits,
            copy_pos_diff_bits: self.copy_bits,
            permute: !self.no_permute,
        }
    }
}

impl DecompressArgs {
    fn into_config(self) -> DecompressConfig {
        DecompressConfig {
            input: self.input,
            output: self.output,
            threads: self.threads,
            memory_mb: self.memory_mb,
            use_cache: !self.no_cache,
            mmap: self.mmap,
            sites: self.range,
            samples: self.samples,
            limit: self.limit,
            allele_filter: AlleleWindow {
                min_ac: self.min_ac,
                max_ac: self.max_ac,
                min_af: self.min_af,
                max_af: self.max_af,
            },
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if std::env::var("HAPZ_NO_BANNER").is_err() {
        eprintln!("hapz v{} - haplotype bit-vector compression", env!("CARGO_PKG_VERSION"));
        eprintln!("Compression: block matching + canonical Huffman coding");
        eprintln!();
    }

    match cli.command {
        Commands::Compress(args) => {
            info!("Starting compression...");
            let config = args.into_config();
            hapz_lib::compression::compress(&config)?;
            info!("Compression complete!");
        }
        Commands::Decompress(args) => {
            info!("Starting decompression...");
            let config = args.into_config();
            hapz_lib::compression::decompress(&config)?;
            info!("Decompression complete!");
        }
    }

    Ok(())
}
