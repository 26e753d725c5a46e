//! Parallel query decoding: block-aligned site chunks decoded with rayon,
//! each chunk in its own session, written back in site order.

use anyhow::Result;
use rayon::prelude::*;
use std::io::Write;
use std::ops::Range;
use std::time::Instant;
use tracing::{info, warn};

use super::archive_decoder::{Archive, DecodeSession, Query, QuerySpec, SiteRecord};
use crate::cli::{resolve_threads, DecompressConfig};
use crate::io::create_output;

/// Chunks decoded per parallel batch, per thread.
const CHUNKS_PER_THREAD: usize = 2;

/// Split `sites` at archive block boundaries.
fn block_chunks(archive: &Archive, sites: Range<u64>) -> Vec<Range<u64>> {
    let per_block = u64::from(archive.max_no_vec_in_block() / 2).max(1);
    let mut chunks = Vec::new();
    let mut start = sites.start;
    while start < sites.end {
        let end = ((start / per_block + 1) * per_block).min(sites.end);
        chunks.push(start..end);
        start = end;
    }
    chunks
}

fn decode_chunks(
    archive: &Archive,
    query: &Query,
    chunks: &[Range<u64>],
    memory_mb: u64,
    use_cache: bool,
) -> Result<Vec<Vec<SiteRecord>>> {
    chunks
        .par_iter()
        .map(|chunk| {
            let mut session = DecodeSession::with_cache(archive, memory_mb, use_cache);
            session.decode_range(&query.with_sites(chunk.clone()))
        })
        .collect()
}

/// Decode `query` on the current rayon pool. Records come back in site
/// order and the query's limit applies to the whole result.
pub fn decode_parallel(archive: &Archive, query: &Query, memory_mb: u64, use_cache: bool) -> Result<Vec<SiteRecord>> {
    let chunks = block_chunks(archive, query.sites());
    let mut records: Vec<SiteRecord> = decode_chunks(archive, query, &chunks, memory_mb, use_cache)?
        .into_iter()
        .flatten()
        .collect();
    if let Some(limit) = query.limit() {
        records.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
    }
    Ok(records)
}

pub(super) fn decompress(args: &DecompressConfig) -> Result<()> {
    let start_time = Instant::now();
    let threads = resolve_threads(args.threads);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .ok(); // Ignore error if already initialized

    let archive = Archive::open_path(&args.input, args.mmap)?;
    info!(
        "Archive: {} sites, {} samples x ploidy {}, {} blocks ({} unique, {} copies)",
        archive.n_sites(),
        archive.n_samples(),
        archive.ploidy(),
        archive.no_blocks(),
        archive.unique_no(),
        archive.copy_no()
    );

    let spec = QuerySpec {
        sites: args.sites.clone(),
        samples: args.samples.clone(),
        limit: args.limit,
        allele_window: args.allele_filter,
    };
    let query = archive.prepare(&spec)?;
    info!(
        "Using {} threads for decompression, cache of {} vectors per thread",
        threads,
        DecodeSession::with_cache(&archive, args.memory_mb, args.use_cache).cache_capacity()
    );

    let mut out = create_output(&args.output)?;
    let chunks = block_chunks(&archive, query.sites());
    let mut written = 0u64;
    let limit = query.limit().unwrap_or(u64::MAX);
    'batches: for batch in chunks.chunks(threads * CHUNKS_PER_THREAD) {
        for records in decode_chunks(&archive, &query, batch, args.memory_mb, args.use_cache)? {
            for rec in records {
                if written >= limit {
                    break 'batches;
                }
                out.write_all(&rec.planes[0])?;
                out.write_all(&rec.planes[1])?;
                written += 1;
            }
        }
    }
    out.flush()?;

    let sites = query.sites();
    if written == 0 && limit > 0 && !sites.is_empty() {
        warn!("No site in {}..{} passed the allele window", sites.start, sites.end);
    }
    info!(
        "Decompression completed in {:.2}s: {} of {} sites written, {} haplotypes each",
        start_time.elapsed().as_secs_f64(),
        written,
        sites.end - sites.start,
        query.n_haps()
    );
    Ok(())
}
