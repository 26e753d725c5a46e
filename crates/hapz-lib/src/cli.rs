use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::compression::allele_filter::AlleleWindow;

#[derive(Clone, Debug)]
pub struct CompressConfig {
    /// Input raw vector file (`-` for stdin)
    pub input: PathBuf,
    /// Output archive file
    pub output: PathBuf,
    /// Number of matcher threads (0 = auto-detect)
    pub threads: usize,
    /// Number of samples per vector
    pub n_samples: u32,
    /// Haplotypes per sample
    pub ploidy: u32,
    /// Sites per block; a block holds two vectors per site
    pub variants_per_block: u32,
    /// Maximum match nesting depth (0 disables sub-vector matches)
    pub max_depth: u32,
    /// Number of density buckets with separate statistics
    pub ones_ranges: u32,
    /// Bit width of match offsets in unique-vector space
    pub match_pos_diff_bits: u32,
    /// Bit width of copy offsets in unique-vector space
    pub copy_pos_diff_bits: u32,
    /// Reorder haplotype columns per block
    pub permute: bool,
}

impl Default for CompressConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            output: PathBuf::new(),
            threads: 0,
            n_samples: 0,
            ploidy: 2,
            variants_per_block: 3584,
            max_depth: 100,
            ones_ranges: 8,
            match_pos_diff_bits: 8,
            copy_pos_diff_bits: 17,
            permute: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DecompressConfig {
    /// Input archive
    pub input: PathBuf,
    /// Output raw vector file (`-` for stdout)
    pub output: PathBuf,
    /// Number of decode threads (0 = auto-detect)
    pub threads: usize,
    /// Vector cache budget in MB (0 = no budget)
    pub memory_mb: u64,
    /// Cache decoded unique vectors
    pub use_cache: bool,
    /// Memory-map the archive instead of reading it
    pub mmap: bool,
    /// Site index range to decode
    pub sites: Option<Range<u64>>,
    /// Sample subset, in output order
    pub samples: Option<Vec<u32>>,
    /// Maximum number of records to write
    pub limit: Option<u64>,
    /// AC/AF window; sites outside it are skipped
    pub allele_filter: AlleleWindow,
}

impl Default for DecompressConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            output: PathBuf::new(),
            threads: 0,
            memory_mb: 0,
            use_cache: true,
            mmap: false,
            sites: None,
            samples: None,
            limit: None,
            allele_filter: AlleleWindow::default(),
        }
    }
}

/// `-` stands for stdin or stdout.
pub fn is_stdio_path(path: &Path) -> bool {
    path.as_os_str() == "-"
}

pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(8)
}

/// Resolve a thread count option (0 = auto-detect).
pub fn resolve_threads(threads: usize) -> usize {
    if threads == 0 {
        num_cpus()
    } else {
        threads
    }
}
