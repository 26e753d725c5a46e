//! Random-access decoding of hapz archives.
//!
//! An [`Archive`] is parsed once and is immutable afterwards, so any number
//! of [`DecodeSession`]s (one per thread) can read from it. A session owns
//! the vector cache and the current block's permutation.
//!
//! Matches copy bytes at the same offsets of an earlier unique vector, so a
//! request for some byte spans of one vector turns into requests for
//! sub-spans of other vectors, all writing into the same output buffer.
//! These are resolved from an explicit work stack.

use anyhow::{bail, Context, Result};
use memmap2::Mmap;
use std::fs::File;
use std::ops::{Deref, Range};
use std::path::Path;
use std::rc::Rc;
use tracing::debug;

use super::allele_filter::{count_alleles, AcRange, Allele, AlleleWindow};
use super::archive::{open_reader, read_code, GroupCodes, RunSizeModel};
use super::archive_encoder::position_group_stride;
use super::bit_io::{width_for, BitReader};
use super::block_matcher::{
    FLAG_LITERAL, FLAG_MATCH, FLAG_MATCH_SAME_REF, FLAG_ONES_RUN, FLAG_ZERO_RUN, LITERAL_RUN_FLAG_BIAS,
};
use super::huffman::HuffmanCode;
use super::permutation::{hap_bit, set_hap_bit};
use super::rank::RankBitVec;
use super::settings::{match_huf_bits, FLAG_ALPHABET, FULL_POS_STEP, MAX_ONES_GROUPS};
use super::vector_cache::VectorCache;
use crate::error::QueryError;

/// Longest chain of match hops followed before the archive is declared corrupt.
pub const MAX_MATCH_NESTING: u32 = 512;

const CORRUPT: &str = "truncated or corrupt core stream";

/// Archive storage: read into memory or memory-mapped.
pub enum ArchiveBytes {
    Owned(Vec<u8>),
    Mapped(Mmap),
}

impl Deref for ArchiveBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            ArchiveBytes::Owned(v) => v,
            ArchiveBytes::Mapped(m) => m,
        }
    }
}

/// Classification of one vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VecKind {
    Zero,
    Copy { unique: u64 },
    Unique { unique: u64 },
}

/// Byte spans of one unique vector still to be materialised.
#[derive(Debug, Clone)]
struct Task {
    unique: u64,
    spans: Vec<Range<usize>>,
    depth: u32,
}

/// Walks sorted, disjoint spans alongside a monotonically increasing offset.
struct SpanCursor<'s> {
    spans: &'s [Range<usize>],
    k: usize,
}

impl<'s> SpanCursor<'s> {
    fn new(spans: &'s [Range<usize>]) -> Self {
        Self { spans, k: 0 }
    }

    #[inline]
    fn advance(&mut self, i: usize) {
        while self.k < self.spans.len() && self.spans[self.k].end <= i {
            self.k += 1;
        }
    }

    #[inline]
    fn contains(&mut self, i: usize) -> bool {
        self.advance(i);
        self.k < self.spans.len() && self.spans[self.k].start <= i
    }

    #[inline]
    fn overlaps(&mut self, start: usize, end: usize) -> bool {
        self.advance(start);
        self.k < self.spans.len() && self.spans[self.k].start < end
    }

    fn clip(&mut self, start: usize, end: usize) -> Vec<Range<usize>> {
        self.advance(start);
        self.spans[self.k..]
            .iter()
            .take_while(|s| s.start < end)
            .map(|s| s.start.max(start)..s.end.min(end))
            .collect()
    }
}

/// Merge the permuted byte offsets of `haps` into sorted spans.
fn needed_spans(haps: &[u32], perm: &[u32]) -> Vec<Range<usize>> {
    let mut bytes: Vec<usize> = haps.iter().map(|&h| perm[h as usize] as usize / 8).collect();
    bytes.sort_unstable();
    bytes.dedup();
    let mut spans: Vec<Range<usize>> = Vec::new();
    for b in bytes {
        match spans.last_mut() {
            Some(last) if last.end == b => last.end = b + 1,
            _ => spans.push(b..b + 1),
        }
    }
    spans
}

/// A parsed archive.
pub struct Archive {
    bytes: ArchiveBytes,
    zeros: [RankBitVec; 2],
    copies: [RankBitVec; 2],
    ones_ranges: u32,
    ploidy: u32,
    n_samples: u32,
    n_haplotypes: u32,
    vec_len: usize,
    msb_code: HuffmanCode,
    group_code: HuffmanCode,
    group_codes: Vec<GroupCodes>,
    flag_code: HuffmanCode,
    no_vec: u64,
    copy_no: u64,
    used_bits_cp: u32,
    copy_range: Range<usize>,
    unique_no: u64,
    run_models: Vec<RunSizeModel>,
    used_bits_noncp: u32,
    low_bits: u32,
    position_range: Range<usize>,
    no_blocks: u32,
    max_no_vec_in_block: u32,
    perm_bits: u32,
    perm_block_bytes: usize,
    perm_range: Range<usize>,
    core_range: Range<usize>,
}

impl Archive {
    pub fn open(bytes: Vec<u8>) -> Result<Self> {
        Self::parse(ArchiveBytes::Owned(bytes))
    }

    pub fn open_path(path: &Path, mmap: bool) -> Result<Self> {
        let bytes = if mmap {
            let file = File::open(path).with_context(|| format!("Failed to open archive: {:?}", path))?;
            let map = unsafe { Mmap::map(&file).with_context(|| format!("Failed to mmap archive: {:?}", path))? };
            ArchiveBytes::Mapped(map)
        } else {
            ArchiveBytes::Owned(std::fs::read(path).with_context(|| format!("Failed to read archive: {:?}", path))?)
        };
        Self::parse(bytes).with_context(|| format!("Invalid archive: {:?}", path))
    }

    fn parse(bytes: ArchiveBytes) -> Result<Self> {
        let data: &[u8] = &bytes;
        let mut r = open_reader(data)?;

        let zeros = [RankBitVec::read_from(&mut r)?, RankBitVec::read_from(&mut r)?];
        let copies = [RankBitVec::read_from(&mut r)?, RankBitVec::read_from(&mut r)?];

        let ones_ranges = u32::from(r.read_u8()?);
        let ploidy = u32::from(r.read_u8()?);
        let vec_len = usize::try_from(r.read_u64()?)?;
        if !(1..=MAX_ONES_GROUPS).contains(&ones_ranges) {
            bail!("ones ranges {ones_ranges} outside 1..={MAX_ONES_GROUPS}");
        }
        if ploidy == 0 || vec_len == 0 {
            bail!("invalid layout: ploidy {ploidy}, vector length {vec_len}");
        }

        let msb_code = read_code(&mut r, "match offset")?;
        let group_code = read_code(&mut r, "group")?;
        let group_codes = (0..ones_ranges)
            .map(|_| GroupCodes::read_from(&mut r))
            .collect::<Result<Vec<_>>>()?;
        let flag_code = read_code(&mut r, "flag")?;

        let no_vec = r.read_u64()?;
        let copy_no = r.read_u64()?;
        let used_bits_cp = u32::from(r.read_u8()?);
        let copy_range = r.read_stream_range()?;

        let unique_no = r.read_u64()?;
        let run_models = (0..ones_ranges)
            .map(|_| RunSizeModel::read_from(&mut r))
            .collect::<Result<Vec<_>>>()?;

        let used_bits_noncp = u32::from(r.read_u8()?);
        let match_pos_diff_bits = u32::from(r.read_u8()?);
        let position_range = r.read_stream_range()?;

        let no_blocks = r.read_u32()?;
        let max_no_vec_in_block = r.read_u32()?;
        let n_samples = r.read_u32()?;
        let perm_range = r.read_stream_range()?;
        let core_range = r.rest_range();

        // cross-checks
        let n_haplotypes = n_samples
            .checked_mul(ploidy)
            .context("haplotype count overflows")?;
        if (n_haplotypes as usize).div_ceil(8) != vec_len {
            bail!("{n_samples} samples of ploidy {ploidy} do not fit {vec_len}-byte vectors");
        }
        if no_vec % 2 != 0 {
            bail!("odd vector count {no_vec}");
        }
        for (name, pair) in [("zero", &zeros), ("copy", &copies)] {
            if pair[0].len() as u64 != no_vec.div_ceil(2) || pair[1].len() as u64 != no_vec / 2 {
                bail!("{name} bit-vectors do not cover {no_vec} vectors");
            }
        }
        let n_zero = zeros[0].count_ones() + zeros[1].count_ones();
        let n_copy = copies[0].count_ones() + copies[1].count_ones();
        if n_copy != copy_no {
            bail!("copy count {copy_no} disagrees with the copy bit-vectors ({n_copy})");
        }
        if no_vec.checked_sub(n_zero + n_copy) != Some(unique_no) {
            bail!("unique count {unique_no} disagrees with the classification bit-vectors");
        }
        if !(1..=24).contains(&match_pos_diff_bits) || used_bits_cp > 31 || used_bits_noncp > 32 {
            bail!("invalid field widths");
        }
        let huf_bits = match_huf_bits(match_pos_diff_bits);
        let alphabets = [
            (group_code.alphabet_size(), ones_ranges, "group"),
            (flag_code.alphabet_size(), FLAG_ALPHABET as u32, "flag"),
            (msb_code.alphabet_size(), 1 << huf_bits, "match offset"),
        ];
        for (got, want, what) in alphabets {
            if got != want {
                bail!("{what} code covers {got} symbols, expected {want}");
            }
        }
        if group_codes.iter().any(|g| g.literals.alphabet_size() != 256) {
            bail!("literal code does not cover 256 symbols");
        }
        if (copy_range.len() as u64) * 8 < copy_no * u64::from(used_bits_cp) {
            bail!("copy offset stream is truncated");
        }
        if unique_no > 0 {
            let stride = position_group_stride(used_bits_noncp) as u64;
            let full_groups = (unique_no - 1) / FULL_POS_STEP;
            let last = unique_no - full_groups * FULL_POS_STEP;
            let need = full_groups * stride + 8 + ((last - 1) * u64::from(used_bits_noncp)).div_ceil(8);
            if (position_range.len() as u64) < need {
                bail!("position index is truncated");
            }
        }
        if max_no_vec_in_block == 0 || max_no_vec_in_block % 2 != 0 {
            bail!("invalid block size {max_no_vec_in_block}");
        }
        if u64::from(no_blocks) != no_vec.div_ceil(u64::from(max_no_vec_in_block)) {
            bail!("{no_blocks} blocks cannot hold {no_vec} vectors");
        }
        let perm_bits = width_for(u64::from(n_haplotypes.saturating_sub(1)));
        let perm_block_bytes = (n_haplotypes as usize * perm_bits as usize).div_ceil(8);
        if perm_range.len() < no_blocks as usize * perm_block_bytes {
            bail!("permutation table is truncated");
        }

        Ok(Self {
            zeros,
            copies,
            ones_ranges,
            ploidy,
            n_samples,
            n_haplotypes,
            vec_len,
            msb_code,
            group_code,
            group_codes,
            flag_code,
            no_vec,
            copy_no,
            used_bits_cp,
            copy_range,
            unique_no,
            run_models,
            used_bits_noncp,
            low_bits: match_pos_diff_bits - huf_bits,
            position_range,
            no_blocks,
            max_no_vec_in_block,
            perm_bits,
            perm_block_bytes,
            perm_range,
            core_range,
            bytes,
        })
    }

    pub fn n_samples(&self) -> u32 {
        self.n_samples
    }

    pub fn ploidy(&self) -> u32 {
        self.ploidy
    }

    pub fn n_haplotypes(&self) -> u32 {
        self.n_haplotypes
    }

    pub fn vec_len(&self) -> usize {
        self.vec_len
    }

    pub fn no_vec(&self) -> u64 {
        self.no_vec
    }

    pub fn n_sites(&self) -> u64 {
        self.no_vec / 2
    }

    pub fn unique_no(&self) -> u64 {
        self.unique_no
    }

    pub fn copy_no(&self) -> u64 {
        self.copy_no
    }

    pub fn no_blocks(&self) -> u32 {
        self.no_blocks
    }

    pub fn ones_ranges(&self) -> u32 {
        self.ones_ranges
    }

    pub fn max_no_vec_in_block(&self) -> u32 {
        self.max_no_vec_in_block
    }

    #[inline]
    fn core(&self) -> &[u8] {
        &self.bytes[self.core_range.clone()]
    }

    pub fn classify(&self, vec: u64) -> Result<VecKind> {
        if vec >= self.no_vec {
            bail!("vector {vec} out of range ({} vectors)", self.no_vec);
        }
        let id = (vec / 2) as usize;
        let p = (vec % 2) as usize;
        if self.zeros[p].get(id) {
            return Ok(VecKind::Zero);
        }
        let zeros_before = self.zeros[0].rank1(id + p) + self.zeros[1].rank1(id);
        let copies_before = self.copies[0].rank1(id + p) + self.copies[1].rank1(id);
        let unique_before = vec - zeros_before - copies_before;
        if !self.copies[p].get(id) {
            return Ok(VecKind::Unique { unique: unique_before });
        }

        let mut r = BitReader::new(&self.bytes[self.copy_range.clone()]);
        r.set_bit_pos(copies_before as usize * self.used_bits_cp as usize);
        let diff = u64::from(r.get_bits(self.used_bits_cp).context("truncated copy offset stream")?);
        let unique = unique_before
            .checked_sub(diff + 1)
            .with_context(|| format!("copy {vec} refers before the first unique vector"))?;
        Ok(VecKind::Copy { unique })
    }

    /// Byte offset of unique vector `unique` in the core stream.
    fn unique_position(&self, unique: u64) -> Result<usize> {
        if unique >= self.unique_no {
            bail!("unique vector {unique} out of range ({})", self.unique_no);
        }
        let group = (unique / FULL_POS_STEP) as usize;
        let j = (unique % FULL_POS_STEP) as usize;
        let base = group * position_group_stride(self.used_bits_noncp);
        let mut r = BitReader::new(&self.bytes[self.position_range.clone()]);
        r.set_byte_pos(base);
        let checkpoint = r.get_u64().context("truncated position index")?;
        let delta = if j == 0 {
            0
        } else {
            r.set_bit_pos(base * 8 + 64 + (j - 1) * self.used_bits_noncp as usize);
            u64::from(r.get_bits(self.used_bits_noncp).context("truncated position index")?)
        };
        let pos = usize::try_from(checkpoint + delta)?;
        if pos >= self.core_range.len() {
            bail!("unique vector {unique} starts past the core stream");
        }
        Ok(pos)
    }

    /// Column permutation of block `block`: `perm[original] = stored`.
    pub fn permutation(&self, block: u32) -> Result<Vec<u32>> {
        if block >= self.no_blocks {
            bail!("block {block} out of range ({} blocks)", self.no_blocks);
        }
        let n = self.n_haplotypes as usize;
        let mut r = BitReader::new(&self.bytes[self.perm_range.clone()]);
        r.set_byte_pos(block as usize * self.perm_block_bytes);
        let mut seen = vec![false; n];
        let mut perm = Vec::with_capacity(n);
        for _ in 0..n {
            let p = r.get_bits(self.perm_bits).context("truncated permutation table")?;
            match seen.get_mut(p as usize) {
                Some(s) if !*s => *s = true,
                _ => bail!("block {block} permutation is not a bijection"),
            }
            perm.push(p);
        }
        Ok(perm)
    }

    /// Materialise `task.spans` of one unique vector into `out`, queueing
    /// the spans covered by matches onto `pending`.
    fn walk_unique(&self, task: &Task, out: &mut [u8], pending: &mut Vec<Task>) -> Result<()> {
        let Some(stop) = task.spans.last().map(|s| s.end) else {
            return Ok(());
        };
        let vec_len = self.vec_len;
        let unique = task.unique;
        let checked_end = |i: usize, len: usize| -> Result<usize> {
            if len == 0 {
                bail!("zero-length token in unique vector {unique}");
            }
            if i + len > vec_len {
                bail!("decode of unique vector {unique} walked past the {vec_len}-byte vector end");
            }
            Ok(i + len)
        };

        let mut r = BitReader::new(self.core());
        r.set_byte_pos(self.unique_position(unique)?);
        let group = self.group_code.decode_lut(&mut r).context(CORRUPT)? as usize;
        let codes = self.group_codes.get(group).context(CORRUPT)?;
        let run_model = &self.run_models[group];

        let mut spans = SpanCursor::new(&task.spans);
        let mut prev_target: Option<u64> = None;
        let mut i = 0usize;
        while i < stop {
            let flag = self.flag_code.decode_lut(&mut r).context(CORRUPT)?;
            match flag {
                FLAG_LITERAL => {
                    let b = codes.literals.decode_lut(&mut r).context(CORRUPT)?;
                    if spans.contains(i) {
                        out[i] = b as u8;
                    }
                    i += 1;
                }
                FLAG_MATCH | FLAG_MATCH_SAME_REF => {
                    let target = if flag == FLAG_MATCH {
                        let hi = u64::from(self.msb_code.decode_lut(&mut r).context(CORRUPT)?);
                        let lo = u64::from(r.get_bits(self.low_bits).context(CORRUPT)?);
                        let diff = (hi << self.low_bits) | lo;
                        unique
                            .checked_sub(diff + 1)
                            .with_context(|| format!("unique vector {unique} refers before the first vector"))?
                    } else {
                        prev_target
                            .with_context(|| format!("same-reference match without a previous match in unique vector {unique}"))?
                    };
                    prev_target = Some(target);
                    let len = codes.match_lens.decode_fast(&mut r).context(CORRUPT)? as usize;
                    let end = checked_end(i, len)?;
                    let clipped = spans.clip(i, end);
                    if !clipped.is_empty() {
                        pending.push(Task {
                            unique: target,
                            spans: clipped,
                            depth: task.depth + 1,
                        });
                    }
                    i = end;
                }
                FLAG_ZERO_RUN | FLAG_ONES_RUN => {
                    let (code, byte) = if flag == FLAG_ZERO_RUN {
                        (&codes.zero_runs, 0x00)
                    } else {
                        (&codes.ones_runs, 0xff)
                    };
                    let len = code.decode_fast(&mut r).context(CORRUPT)? as usize;
                    let end = checked_end(i, len)?;
                    for s in spans.clip(i, end) {
                        out[s].fill(byte);
                    }
                    i = end;
                }
                f => {
                    let n = (f - LITERAL_RUN_FLAG_BIAS) as usize;
                    let end = checked_end(i, n)?;
                    let size = run_model.decode(&mut r, n).context(CORRUPT)?;
                    if spans.overlaps(i, end) {
                        for k in i..end {
                            let b = codes.literals.decode_lut(&mut r).context(CORRUPT)?;
                            if spans.contains(k) {
                                out[k] = b as u8;
                            }
                        }
                    } else {
                        r.skip_bits(usize::try_from(size)?).context(CORRUPT)?;
                    }
                    i = end;
                }
            }
        }
        Ok(())
    }

    /// Validate a query against this archive.
    pub fn prepare(&self, spec: &QuerySpec) -> Result<Query, QueryError> {
        let n_sites = self.n_sites();
        let sites = spec.sites.clone().unwrap_or(0..n_sites);
        if sites.start > sites.end || sites.end > n_sites {
            return Err(QueryError::SiteRangeOutOfBounds {
                start: sites.start,
                end: sites.end,
                n_sites,
            });
        }
        let haplotypes = match &spec.samples {
            None => None,
            Some(samples) if samples.is_empty() => return Err(QueryError::EmptySampleSet),
            Some(samples) => {
                let mut haps = Vec::with_capacity(samples.len() * self.ploidy as usize);
                for &s in samples {
                    if s >= self.n_samples {
                        return Err(QueryError::SampleOutOfRange {
                            index: s,
                            n_samples: self.n_samples,
                        });
                    }
                    haps.extend((0..self.ploidy).map(|k| s * self.ploidy + k));
                }
                Some(haps)
            }
        };
        let n_haps = haplotypes.as_ref().map_or(self.n_haplotypes as usize, Vec::len);
        let ac_range = if spec.allele_window.is_unbounded() {
            None
        } else {
            Some(spec.allele_window.resolve(n_haps as u32)?)
        };
        Ok(Query {
            sites,
            haplotypes,
            n_haps,
            ac_range,
            limit: spec.limit,
        })
    }

    /// Every vector, in original column order, concatenated.
    pub fn decode_all(&self) -> Result<Vec<u8>> {
        let mut session = DecodeSession::new(self);
        let mut out = Vec::with_capacity(self.no_vec as usize * self.vec_len);
        for v in 0..self.no_vec {
            out.extend(session.decode_vector(v)?);
        }
        Ok(out)
    }
}

/// What to decode: a site range, a sample subset, a record limit and an
/// allele window. `None` means everything.
#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    pub sites: Option<Range<u64>>,
    pub samples: Option<Vec<u32>>,
    pub limit: Option<u64>,
    pub allele_window: AlleleWindow,
}

/// A `QuerySpec` validated against one archive.
#[derive(Debug, Clone)]
pub struct Query {
    sites: Range<u64>,
    haplotypes: Option<Vec<u32>>,
    n_haps: usize,
    ac_range: Option<AcRange>,
    limit: Option<u64>,
}

impl Query {
    pub fn sites(&self) -> Range<u64> {
        self.sites.clone()
    }

    pub fn n_haps(&self) -> usize {
        self.n_haps
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub(crate) fn with_sites(&self, sites: Range<u64>) -> Self {
        Self {
            sites,
            ..self.clone()
        }
    }
}

/// Both planes of one site, restricted to the selected haplotypes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteRecord {
    pub site: u64,
    pub n_haps: usize,
    pub planes: [Vec<u8>; 2],
    pub ac_an: (u32, u32),
}

impl SiteRecord {
    pub fn genotypes(&self) -> Vec<Allele> {
        (0..self.n_haps)
            .map(|h| Allele::from_planes(hap_bit(&self.planes[0], h), hap_bit(&self.planes[1], h)))
            .collect()
    }
}

struct BlockPermutation {
    block: u32,
    perm: Rc<[u32]>,
    identity: bool,
}

/// Per-thread decoding state over a shared archive.
pub struct DecodeSession<'a> {
    archive: &'a Archive,
    cache: VectorCache,
    perm: Option<BlockPermutation>,
    pending: Vec<Task>,
}

impl<'a> DecodeSession<'a> {
    /// Session with a cache sized to the block length.
    pub fn new(archive: &'a Archive) -> Self {
        Self::with_cache(archive, 0, true)
    }

    pub fn with_cache(archive: &'a Archive, memory_mb: u64, use_cache: bool) -> Self {
        let capacity = if use_cache {
            VectorCache::capacity_for(
                memory_mb,
                archive.vec_len,
                archive.no_vec,
                u64::from(archive.max_no_vec_in_block),
            )
        } else {
            0
        };
        Self {
            archive,
            cache: VectorCache::new(capacity),
            perm: None,
            pending: Vec::new(),
        }
    }

    pub fn cache_capacity(&self) -> usize {
        self.cache.capacity()
    }

    pub fn cache_stats(&self) -> (u64, u64) {
        self.cache.stats()
    }

    fn block_permutation(&mut self, vec: u64) -> Result<(Rc<[u32]>, bool)> {
        let block = (vec / u64::from(self.archive.max_no_vec_in_block)) as u32;
        match &self.perm {
            Some(bp) if bp.block == block => {}
            _ => {
                let perm = self.archive.permutation(block)?;
                let identity = perm.iter().enumerate().all(|(i, &p)| i as u32 == p);
                self.perm = Some(BlockPermutation {
                    block,
                    perm: perm.into(),
                    identity,
                });
            }
        }
        match &self.perm {
            Some(bp) => Ok((Rc::clone(&bp.perm), bp.identity)),
            None => bail!("permutation of block {block} unavailable"),
        }
    }

    fn resolve(&mut self, root: u64, spans: Vec<Range<usize>>, out: &mut [u8]) -> Result<()> {
        self.pending.clear();
        self.pending.push(Task {
            unique: root,
            spans,
            depth: 0,
        });
        while let Some(task) = self.pending.pop() {
            if task.depth > MAX_MATCH_NESTING {
                bail!(
                    "match chain deeper than {MAX_MATCH_NESTING} while decoding unique vector {}",
                    task.unique
                );
            }
            if let Some(cached) = self.cache.get(task.unique) {
                for s in &task.spans {
                    out[s.clone()].copy_from_slice(&cached[s.clone()]);
                }
                continue;
            }
            self.archive.walk_unique(&task, out, &mut self.pending)?;
        }
        Ok(())
    }

    /// Full unique vector in stored (permuted) column order.
    fn unique_full(&mut self, unique: u64) -> Result<Vec<u8>> {
        if let Some(cached) = self.cache.get(unique) {
            return Ok(cached.to_vec());
        }
        let mut out = vec![0u8; self.archive.vec_len];
        let full = 0..self.archive.vec_len;
        self.resolve(unique, vec![full], &mut out)?;
        self.cache.insert(unique, out.clone());
        Ok(out)
    }

    /// Vector `vec` in stored (permuted) column order.
    pub fn decode_stored(&mut self, vec: u64) -> Result<Vec<u8>> {
        match self.archive.classify(vec)? {
            VecKind::Zero => Ok(vec![0; self.archive.vec_len]),
            VecKind::Copy { unique } | VecKind::Unique { unique } => self.unique_full(unique),
        }
    }

    /// Vector `vec` in original column order.
    pub fn decode_vector(&mut self, vec: u64) -> Result<Vec<u8>> {
        let stored = self.decode_stored(vec)?;
        let (perm, identity) = self.block_permutation(vec)?;
        if identity {
            return Ok(stored);
        }
        let mut out = vec![0u8; self.archive.vec_len];
        for (h, &p) in perm.iter().enumerate() {
            if hap_bit(&stored, p as usize) {
                set_hap_bit(&mut out, h);
            }
        }
        Ok(out)
    }

    /// Selected haplotypes of vector `vec`, decoding only the bytes they occupy.
    fn project_vector(&mut self, vec: u64, haps: &[u32], perm: &[u32], spans: &[Range<usize>]) -> Result<Vec<u8>> {
        let mut stored = vec![0u8; self.archive.vec_len];
        match self.archive.classify(vec)? {
            VecKind::Zero => {}
            VecKind::Copy { unique } | VecKind::Unique { unique } => match self.cache.get(unique) {
                Some(cached) => stored.copy_from_slice(cached),
                None => self.resolve(unique, spans.to_vec(), &mut stored)?,
            },
        }
        let mut out = vec![0u8; haps.len().div_ceil(8)];
        for (k, &h) in haps.iter().enumerate() {
            if hap_bit(&stored, perm[h as usize] as usize) {
                set_hap_bit(&mut out, k);
            }
        }
        Ok(out)
    }

    /// Decode one site; `None` when the allele window rejects it.
    pub fn decode_site(&mut self, site: u64, query: &Query) -> Result<Option<SiteRecord>> {
        let vec0 = site * 2;
        let planes = match &query.haplotypes {
            None => [self.decode_vector(vec0)?, self.decode_vector(vec0 + 1)?],
            Some(haps) => {
                let (perm, _) = self.block_permutation(vec0)?;
                let spans = needed_spans(haps, &perm);
                [
                    self.project_vector(vec0, haps, &perm, &spans)?,
                    self.project_vector(vec0 + 1, haps, &perm, &spans)?,
                ]
            }
        };
        let ac_an = count_alleles(&planes, query.n_haps);
        if let Some(range) = query.ac_range {
            if !range.contains(ac_an.0) {
                return Ok(None);
            }
        }
        Ok(Some(SiteRecord {
            site,
            n_haps: query.n_haps,
            planes,
            ac_an,
        }))
    }

    /// Decode the query's sites in order, stopping at its record limit.
    pub fn decode_range(&mut self, query: &Query) -> Result<Vec<SiteRecord>> {
        let mut records = Vec::new();
        for site in query.sites.clone() {
            if query.limit.is_some_and(|l| records.len() as u64 >= l) {
                break;
            }
            if let Some(rec) = self.decode_site(site, query)? {
                records.push(rec);
            }
        }
        debug!(
            sites = query.sites.end - query.sites.start,
            records = records.len(),
            "range decoded"
        );
        Ok(records)
    }
}

/// Open-query convenience: validate `spec` and decode it with a fresh session.
pub fn decode_range(archive: &Archive, spec: &QuerySpec) -> Result<Vec<SiteRecord>> {
    let query = archive.prepare(spec)?;
    DecodeSession::new(archive).decode_range(&query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::compress_impl::compress_bytes;
    use crate::compression::settings::CompressionSettings;

    fn sample_archive() -> (Vec<u8>, Archive) {
        // 2 samples, ploidy 2: 4 haplotypes in one byte
        let planes: Vec<u8> = vec![
            0b0000_0000, 0b0000_0000, // site 0: all ref
            0b0000_0000, 0b1100_0000, // site 1: haplotypes 0, 1 alt
            0b1000_0000, 0b1001_0000, // site 2: 0 other, 3 alt
            0b0000_0000, 0b1100_0000, // site 3: copy of site 1 plane 1
        ];
        let s = CompressionSettings::for_samples(2, 2).unwrap();
        let bytes = compress_bytes(&planes, &s, 2).unwrap();
        (planes, Archive::open(bytes).unwrap())
    }

    #[test]
    fn test_classification_and_full_decode() {
        let (planes, archive) = sample_archive();
        assert_eq!(archive.n_sites(), 4);
        assert_eq!(archive.classify(0).unwrap(), VecKind::Zero);
        assert!(matches!(archive.classify(7).unwrap(), VecKind::Copy { .. }));
        assert_eq!(archive.decode_all().unwrap(), planes);
    }

    #[test]
    fn test_sample_projection_and_genotypes() {
        let (_, archive) = sample_archive();
        let spec = QuerySpec {
            samples: Some(vec![1]),
            ..QuerySpec::default()
        };
        let records = decode_range(&archive, &spec).unwrap();
        assert_eq!(records.len(), 4);
        // sample 1 holds haplotypes 2 and 3
        assert_eq!(records[2].genotypes(), vec![Allele::Ref, Allele::Alt]);
        assert_eq!(records[2].ac_an, (1, 2));
        assert_eq!(records[1].planes, [vec![0], vec![0]]);
    }

    #[test]
    fn test_allele_window_filters_sites() {
        let (_, archive) = sample_archive();
        let spec = QuerySpec {
            allele_window: AlleleWindow {
                min_ac: 2,
                ..AlleleWindow::default()
            },
            ..QuerySpec::default()
        };
        let sites: Vec<u64> = decode_range(&archive, &spec).unwrap().iter().map(|r| r.site).collect();
        assert_eq!(sites, vec![1, 3]);
    }

    #[test]
    fn test_limit_and_range() {
        let (_, archive) = sample_archive();
        let spec = QuerySpec {
            sites: Some(1..4),
            limit: Some(2),
            ..QuerySpec::default()
        };
        let sites: Vec<u64> = decode_range(&archive, &spec).unwrap().iter().map(|r| r.site).collect();
        assert_eq!(sites, vec![1, 2]);
    }

    #[test]
    fn test_query_errors() {
        let (_, archive) = sample_archive();
        let bad_sample = QuerySpec {
            samples: Some(vec![2]),
            ..QuerySpec::default()
        };
        assert_eq!(
            archive.prepare(&bad_sample).unwrap_err(),
            QueryError::SampleOutOfRange { index: 2, n_samples: 2 }
        );
        let empty = QuerySpec {
            samples: Some(vec![]),
            ..QuerySpec::default()
        };
        assert_eq!(archive.prepare(&empty).unwrap_err(), QueryError::EmptySampleSet);
        let range = QuerySpec {
            sites: Some(2..9),
            ..QuerySpec::default()
        };
        assert!(matches!(
            archive.prepare(&range).unwrap_err(),
            QueryError::SiteRangeOutOfBounds { .. }
        ));
    }

    #[test]
    fn test_span_cursor_clips() {
        let spans = vec![2..4, 6..9, 12..13];
        let mut c = SpanCursor::new(&spans);
        assert!(!c.contains(1));
        assert!(c.contains(3));
        assert_eq!(c.clip(3, 7), vec![3..4, 6..7]);
        assert!(!c.overlaps(9, 12));
        assert_eq!(c.clip(10, 20), vec![12..13]);
    }

    #[test]
    fn test_needed_spans_merge() {
        let perm: Vec<u32> = (0..32).collect();
        assert_eq!(needed_spans(&[0, 9, 17, 3, 30], &perm), vec![0..4]);
        // byte 1 is not needed, so bytes 0 and 2..4 stay apart
        assert_eq!(needed_spans(&[30, 0, 17, 23], &perm), vec![0..1, 2..4]);
        let reversed: Vec<u32> = (0..32).rev().collect();
        assert_eq!(needed_spans(&[0], &reversed), vec![3..4]);
    }

    #[test]
    fn test_corrupt_archives_are_rejected() {
        let planes = vec![0b1100_0000u8, 0b0100_0000, 0, 0b1000_0000];
        let s = CompressionSettings::for_samples(2, 2).unwrap();
        let bytes = compress_bytes(&planes, &s, 1).unwrap();
        assert!(Archive::open(bytes.clone()).is_ok());
        for cut in [3, 10, bytes.len() / 2] {
            assert!(Archive::open(bytes[..cut].to_vec()).is_err(), "cut at {cut}");
        }
        let mut bad = bytes.clone();
        bad[0] = b'X';
        assert!(Archive::open(bad).is_err());
    }
}
