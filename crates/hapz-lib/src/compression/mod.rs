pub mod allele_filter;
pub mod archive_decoder;
pub mod bit_io;
pub mod huffman;
pub mod rank;
pub mod settings;
mod archive;
mod archive_encoder;
mod block_matcher;
mod compress_impl;
mod decompress_impl;
mod hash_table;
mod permutation;
mod queues;
mod vector_cache;

use crate::cli::{CompressConfig, DecompressConfig};
use anyhow::Result;
use tracing::info;

pub use allele_filter::{Allele, AlleleWindow};
pub use archive_decoder::{
    decode_range, Archive, DecodeSession, Query, QuerySpec, SiteRecord, VecKind, MAX_MATCH_NESTING,
};
pub use archive_encoder::ArchiveEncoder;
pub use block_matcher::{expand_tokens, read_block_tokens, BlockMatcher, CompressedBlock, RawVector, Token};
pub use compress_impl::{compress_bytes, compress_stream};
pub use decompress_impl::decode_parallel;
pub use permutation::{apply_permutation, optimize_permutation};
pub use settings::CompressionSettings;

/// Format bytes as human-readable string (e.g., "1.23 GiB").
fn humanize_bytes(bytes: usize) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = KIB * 1024.0;
    const GIB: f64 = MIB * 1024.0;
    let b = bytes as f64;
    if b >= GIB { format!("{:.2} GiB", b / GIB) }
    else if b >= MIB { format!("{:.1} MiB", b / MIB) }
    else if b >= KIB { format!("{:.0} KiB", b / KIB) }
    else { format!("{} B", bytes) }
}

/// Log compression stats.
fn log_compression_stats(original_size: usize, compressed_size: usize, elapsed: std::time::Duration) {
    info!("Compression completed in {:.2}s", elapsed.as_secs_f64());
    info!("Original size: {} ({} bytes)", humanize_bytes(original_size), original_size);
    info!("Compressed size: {} ({} bytes)", humanize_bytes(compressed_size), compressed_size);
    if compressed_size > 0 {
        info!("Compression ratio: {:.2}x", original_size as f64 / compressed_size as f64);
    }
}

/// Compress a raw haplotype vector file into a hapz archive.
pub fn compress(args: &CompressConfig) -> Result<()> {
    compress_impl::compress(args)
}

/// Decode a hapz archive (optionally a site range, sample subset and
/// allele window of it) back to raw vectors.
pub fn decompress(args: &DecompressConfig) -> Result<()> {
    decompress_impl::decompress(args)
}

/// Parse archive bytes for random-access decoding.
pub fn open(bytes: Vec<u8>) -> Result<Archive> {
    Archive::open(bytes)
}
