//! Compression orchestrators: pipelined block matching with in-order archive encoding.

use anyhow::{anyhow, bail, Result};
use std::io::{Read, Write};
use std::sync::mpsc::SyncSender;
use std::thread::{self, ScopedJoinHandle};
use std::time::Instant;
use tracing::{debug, info};

use super::archive_encoder::ArchiveEncoder;
use super::block_matcher::{BlockMatcher, CompressedBlock};
use super::permutation::permute_block;
use super::queues::{block_channel, BlockReceiver, OrderedBlockQueue};
use super::settings::CompressionSettings;
use super::log_compression_stats;
use crate::cli::{resolve_threads, CompressConfig};
use crate::io::{create_output, open_input, VectorReader};

/// Raw blocks buffered ahead of the workers, per worker.
const BLOCKS_IN_FLIGHT_PER_WORKER: usize = 2;

struct RawBlock {
    block_id: u32,
    data: Vec<u8>,
}

fn join_stage<T>(handle: ScopedJoinHandle<'_, Result<T>>, stage: &str) -> Result<T> {
    handle.join().map_err(|_| anyhow!("{stage} thread panicked"))?
}

/// Reads blocks of vectors and hands them to the workers. Returns the
/// number of vectors read.
fn run_producer<R: Read>(
    reader: R,
    settings: &CompressionSettings,
    raw: SyncSender<RawBlock>,
) -> Result<u64> {
    let mut input = VectorReader::new(reader, settings.vec_len, settings.padding_mask());
    let block_vecs = settings.max_no_vec_in_block as usize;
    let mut block_id = 0u32;
    loop {
        let data = input.read_block(block_vecs)?;
        if data.is_empty() {
            break;
        }
        raw.send(RawBlock { block_id, data })
            .map_err(|_| anyhow!("compression pipeline aborted"))?;
        block_id += 1;
    }
    let no_vec = input.vectors_read();
    if no_vec % 2 != 0 {
        bail!("input holds {no_vec} vectors; every site needs two bit-planes");
    }
    Ok(no_vec)
}

/// Each worker owns its matcher and permutation scratch.
fn run_worker(
    settings: &CompressionSettings,
    raw: &BlockReceiver<RawBlock>,
    done: &OrderedBlockQueue<CompressedBlock>,
) -> Result<()> {
    let mut matcher = BlockMatcher::new(settings.clone());
    while let Some(RawBlock { block_id, mut data }) = raw.recv()? {
        let permutation = permute_block(&mut data, settings, block_id)?;
        let mut block = matcher.compress_block(block_id, &data)?;
        block.permutation = permutation;
        debug!(block_id, n_unique = block.n_unique, raw_bytes = block.raw.len(), "block matched");
        done.push(block_id, block)?;
    }
    Ok(())
}

/// Compress a stream of raw vectors into archive bytes.
///
/// One reader thread feeds a bounded queue, `threads` workers permute and
/// match blocks independently, and this thread feeds the results to the
/// encoder strictly in block order.
pub fn compress_stream<R: Read + Send>(reader: R, settings: &CompressionSettings, threads: usize) -> Result<Vec<u8>> {
    run_pipeline(reader, settings, threads).map(|(_, archive)| archive)
}

/// Returns the number of input vectors alongside the archive.
fn run_pipeline<R: Read + Send>(reader: R, settings: &CompressionSettings, threads: usize) -> Result<(u64, Vec<u8>)> {
    let start = Instant::now();
    let workers = threads.max(1);
    let (raw_tx, raw_rx) = block_channel::<RawBlock>(workers * BLOCKS_IN_FLIGHT_PER_WORKER);
    let done_queue = OrderedBlockQueue::<CompressedBlock>::new(workers);
    let mut encoder = ArchiveEncoder::new(settings.clone());

    let no_vec = thread::scope(|scope| -> Result<u64> {
        let (raw, done) = (&raw_rx, &done_queue);

        let producer = scope.spawn(move || {
            let result = run_producer(reader, settings, raw_tx);
            if result.is_err() {
                done.abort();
            }
            result
        });

        let worker_handles: Vec<_> = (0..workers)
            .map(|_| {
                scope.spawn(move || {
                    let result = run_worker(settings, raw, done);
                    if result.is_err() {
                        raw.close();
                        done.abort();
                    }
                    done.worker_done();
                    result
                })
            })
            .collect();

        let mut consume = || -> Result<()> {
            let mut expected = 0u32;
            while let Some(block) = done.pop(expected)? {
                encoder.add_block(block)?;
                expected += 1;
            }
            Ok(())
        };
        let consumed = consume();
        if consumed.is_err() {
            raw.close();
            done.abort();
        }

        // after a worker or encoder failure the reader only sees an abort
        let no_vec = join_stage(producer, "reader");
        let worker_results: Vec<Result<()>> = worker_handles
            .into_iter()
            .map(|h| join_stage(h, "matcher"))
            .collect();
        for r in worker_results {
            r?;
        }
        consumed?;
        no_vec
    })?;

    if encoder.no_vec() != no_vec {
        bail!("encoder received {} of {no_vec} vectors", encoder.no_vec());
    }
    info!(
        "Matched {} vectors in {} blocks with {} workers ({:.2}s)",
        no_vec,
        encoder.no_blocks(),
        workers,
        start.elapsed().as_secs_f64()
    );
    Ok((no_vec, encoder.encode()?))
}

/// In-memory convenience over [`compress_stream`].
pub fn compress_bytes(data: &[u8], settings: &CompressionSettings, threads: usize) -> Result<Vec<u8>> {
    compress_stream(data, settings, threads)
}

pub(super) fn compress(args: &CompressConfig) -> Result<()> {
    let start_time = Instant::now();
    let settings = CompressionSettings::from_config(args)?;
    let threads = resolve_threads(args.threads);

    info!("Using {} threads for compression", threads);
    info!("Input: {:?}", args.input);
    info!("Output: {:?}", args.output);
    info!(
        "Layout: {} samples x ploidy {} ({} bytes per vector), {} vectors per block",
        settings.n_samples, settings.ploidy, settings.vec_len, settings.max_no_vec_in_block
    );

    let input = open_input(&args.input)?;
    let (no_vec, archive) = run_pipeline(input, &settings, threads)?;

    let mut out = create_output(&args.output)?;
    out.write_all(&archive)?;
    out.flush()?;

    log_compression_stats(no_vec as usize * settings.vec_len, archive.len(), start_time.elapsed());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::archive_decoder::Archive;

    fn settings(n_samples: u32, variants_per_block: u32) -> CompressionSettings {
        CompressionSettings::from_config(&CompressConfig {
            n_samples,
            ploidy: 2,
            variants_per_block,
            ..CompressConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_output_independent_of_thread_count() {
        let s = settings(12, 4);
        let mut data = Vec::new();
        for k in 0..60u32 {
            let v = (k % 7) as u8;
            data.extend([v.wrapping_mul(37), v ^ 0x5a, (k % 3) as u8 * 16]);
        }
        let one = compress_bytes(&data, &s, 1).unwrap();
        let four = compress_bytes(&data, &s, 4).unwrap();
        assert_eq!(one, four);
        assert_eq!(Archive::open(one).unwrap().decode_all().unwrap(), data);
    }

    #[test]
    fn test_odd_vector_count_rejected() {
        let s = settings(4, 4);
        let err = compress_bytes(&[0x10, 0x20, 0x30], &s, 2).unwrap_err();
        assert!(err.to_string().contains("two bit-planes"), "{err}");
    }

    #[test]
    fn test_padding_violation_rejected() {
        // 3 samples x 2 = 6 haplotypes: the two low bits are padding
        let s = settings(3, 4);
        assert!(compress_bytes(&[0x00, 0x01], &s, 2).is_err());
    }

    #[test]
    fn test_empty_input() {
        let s = settings(4, 4);
        let archive = Archive::open(compress_bytes(&[], &s, 2).unwrap()).unwrap();
        assert_eq!(archive.n_sites(), 0);
        assert!(archive.decode_all().unwrap().is_empty());
    }
}
