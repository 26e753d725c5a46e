//! Corpus-wide entropy coding of matched blocks.
//!
//! Blocks arrive in id order through [`ArchiveEncoder::add_block`]. Once the
//! last block is in, [`ArchiveEncoder::encode`] rewrites block-local match
//! references as offsets in unique-vector space, builds the prefix codes
//! from corpus statistics and serializes the archive.

use anyhow::{bail, Context, Result};
use std::time::Instant;
use tracing::{debug, info};

use super::archive::{
    put_stream, put_table, put_u32, put_u64, put_u8, write_prefix, GroupCodes, RunSizeModel,
};
use super::bit_io::{bits_used, width_for, BitReader, BitWriter};
use super::block_matcher::{read_raw_vector, CompressedBlock, RawVector, Token};
use super::huffman::HuffmanCode;
use super::rank::{BitVecBuilder, RankBitVec};
use super::settings::{CompressionSettings, FLAG_ALPHABET, FULL_POS_STEP, MAX_LITERAL_RUN};

/// Token with its match reference resolved to a unique-space offset.
enum Resolved<'a> {
    Literal(u8),
    LiteralRun(&'a [u8]),
    Match { diff: u64, len: u32 },
    SameRef { len: u32 },
    ZeroRun { len: u32 },
    OnesRun { len: u32 },
}

fn to_u32_counts(counts: &[u64], what: &str) -> Result<Vec<u32>> {
    counts
        .iter()
        .map(|&c| u32::try_from(c).ok())
        .collect::<Option<Vec<u32>>>()
        .with_context(|| format!("{what} histogram bucket overflows 32 bits"))
}

struct GroupHistograms {
    literals: Vec<u64>,
    zero_runs: Vec<u64>,
    ones_runs: Vec<u64>,
    match_lens: Vec<u64>,
}

impl GroupHistograms {
    fn new(s: &CompressionSettings) -> Self {
        Self {
            literals: vec![0; 256],
            zero_runs: vec![0; 1 << s.bit_size_run_len],
            ones_runs: vec![0; 1 << s.bit_size_run_len],
            match_lens: vec![0; 1 << s.bit_size_match_len],
        }
    }

    fn build(&self) -> Result<GroupCodes> {
        Ok(GroupCodes {
            literals: HuffmanCode::from_frequencies(&to_u32_counts(&self.literals, "literal")?, true)?,
            zero_runs: HuffmanCode::from_frequencies(&to_u32_counts(&self.zero_runs, "zero-run")?, true)?,
            ones_runs: HuffmanCode::from_frequencies(&to_u32_counts(&self.ones_runs, "ones-run")?, true)?,
            match_lens: HuffmanCode::from_frequencies(&to_u32_counts(&self.match_lens, "match-length")?, true)?,
        })
    }
}

/// Accumulates matched blocks and writes the final archive.
pub struct ArchiveEncoder {
    settings: CompressionSettings,
    zeros: [BitVecBuilder; 2],
    copies: [BitVecBuilder; 2],
    unique: BitVecBuilder,
    copy_ids: Vec<u64>,
    copy_origins: Vec<u64>,
    raw: Vec<u8>,
    block_unique: Vec<u32>,
    permutations: BitWriter,
    no_vec: u64,
    saw_partial_block: bool,
}

impl ArchiveEncoder {
    pub fn new(settings: CompressionSettings) -> Self {
        Self {
            settings,
            zeros: Default::default(),
            copies: Default::default(),
            unique: BitVecBuilder::new(),
            copy_ids: Vec::new(),
            copy_origins: Vec::new(),
            raw: Vec::new(),
            block_unique: Vec::new(),
            permutations: BitWriter::new(),
            no_vec: 0,
            saw_partial_block: false,
        }
    }

    pub fn no_blocks(&self) -> u32 {
        self.block_unique.len() as u32
    }

    pub fn no_vec(&self) -> u64 {
        self.no_vec
    }

    pub fn add_block(&mut self, block: CompressedBlock) -> Result<()> {
        let s = &self.settings;
        let expected = self.block_unique.len() as u32;
        if block.block_id != expected {
            bail!("block {} arrived while expecting block {expected}", block.block_id);
        }
        if self.saw_partial_block {
            bail!("block {} follows a partial block", block.block_id);
        }
        let n_vecs = block.n_vecs as usize;
        if block.n_vecs > s.max_no_vec_in_block {
            bail!("block {} holds {n_vecs} vectors, limit is {}", block.block_id, s.max_no_vec_in_block);
        }
        if block.zeros.len() != n_vecs || block.copies.len() != n_vecs {
            bail!("block {} classification length mismatch", block.block_id);
        }
        let n_copies = block.copies.iter().filter(|&&c| c).count();
        if n_copies != block.copy_origins.len() {
            bail!("block {} has {n_copies} copies but {} origins", block.block_id, block.copy_origins.len());
        }
        if block.permutation.len() != s.n_haplotypes as usize {
            bail!("block {} permutation has {} entries", block.block_id, block.permutation.len());
        }
        if block.n_vecs < s.max_no_vec_in_block {
            self.saw_partial_block = true;
        }

        let block_start = u64::from(block.block_id) * u64::from(s.max_no_vec_in_block);
        let mut origins = block.copy_origins.iter();
        for v in 0..n_vecs {
            let global = self.no_vec + v as u64;
            let parity = (global % 2) as usize;
            let (zero, copy) = (block.zeros[v], block.copies[v]);
            if zero && copy {
                bail!("vector {global} is classified both zero and copy");
            }
            self.zeros[parity].push(zero);
            self.copies[parity].push(copy);
            self.unique.push(!zero && !copy);
            if copy {
                let origin = origins.next().copied().unwrap_or_default();
                if origin as usize >= v {
                    bail!("copy {global} refers forward to block-local vector {origin}");
                }
                self.copy_ids.push(global);
                self.copy_origins.push(block_start + u64::from(origin));
            }
        }

        self.raw.extend_from_slice(&block.raw);
        let perm_bits = width_for(u64::from(s.n_haplotypes.saturating_sub(1)));
        for &p in &block.permutation {
            self.permutations.put_bits(p, perm_bits);
        }
        self.permutations.flush_to_byte();

        self.block_unique.push(block.n_unique);
        self.no_vec += n_vecs as u64;
        debug!(block_id = block.block_id, n_vecs, n_unique = block.n_unique, "block added");
        Ok(())
    }

    /// Parse every unique vector of the raw stream, in order.
    fn for_each_unique(&self, mut f: impl FnMut(u64, u64, RawVector) -> Result<()>) -> Result<()> {
        let mut r = BitReader::new(&self.raw);
        let mut cur = 0u64;
        let block_len = u64::from(self.settings.max_no_vec_in_block);
        for (b, &n) in self.block_unique.iter().enumerate() {
            let block_start = b as u64 * block_len;
            for _ in 0..n {
                let raw = read_raw_vector(&mut r, &self.settings)
                    .with_context(|| format!("raw stream of unique vector {cur}"))?;
                f(cur, block_start, raw)?;
                cur += 1;
            }
        }
        Ok(())
    }

    /// Offset in unique space from vector `cur` back to block-local `ref_id`, minus one.
    fn match_diff(&self, unique: &RankBitVec, block_start: u64, ref_id: u32, cur: u64) -> Result<u64> {
        let global = block_start + u64::from(ref_id);
        if !unique.get(global as usize) {
            bail!("match of unique vector {cur} refers to non-unique vector {global}");
        }
        let target = unique.rank1(global as usize);
        if target >= cur {
            bail!("match of unique vector {cur} refers forward to unique vector {target}");
        }
        let diff = cur - target - 1;
        if diff >> self.settings.match_pos_diff_bits != 0 {
            bail!("match offset {diff} exceeds {} bits", self.settings.match_pos_diff_bits);
        }
        Ok(diff)
    }

    fn resolve<'a>(
        &self,
        unique: &RankBitVec,
        block_start: u64,
        cur: u64,
        token: &'a Token,
    ) -> Result<Resolved<'a>> {
        Ok(match token {
            Token::Literal(b) => Resolved::Literal(*b),
            Token::LiteralRun(bytes) => Resolved::LiteralRun(bytes),
            Token::Match { ref_id, len } => Resolved::Match {
                diff: self.match_diff(unique, block_start, *ref_id, cur)?,
                len: *len,
            },
            Token::MatchSameRef { len } => Resolved::SameRef { len: *len },
            Token::ZeroRun { len } => Resolved::ZeroRun { len: *len },
            Token::OnesRun { len } => Resolved::OnesRun { len: *len },
        })
    }

    pub fn encode(self) -> Result<Vec<u8>> {
        let start = Instant::now();
        let s = self.settings.clone();
        let groups = s.ones_ranges as usize;
        let huf_bits = s.match_huf_bits();
        let low_bits = s.match_pos_diff_bits - huf_bits;

        let zeros = self.zeros.clone().map(BitVecBuilder::build);
        let copies = self.copies.clone().map(BitVecBuilder::build);
        let unique = self.unique.clone().build();
        let unique_no = unique.count_ones();

        // copy origins as unique-space offsets
        let mut copy_diffs = Vec::with_capacity(self.copy_ids.len());
        for (&copy, &origin) in self.copy_ids.iter().zip(&self.copy_origins) {
            if !unique.get(origin as usize) {
                bail!("copy {copy} refers to non-unique vector {origin}");
            }
            let diff = unique.rank1(copy as usize) - unique.rank1(origin as usize) - 1;
            if diff >> s.copy_pos_diff_bits != 0 {
                bail!("copy offset {diff} exceeds {} bits", s.copy_pos_diff_bits);
            }
            copy_diffs.push(diff);
        }
        let used_bits_cp = bits_used(copy_diffs.iter().copied().max().unwrap_or(0));
        let mut copy_stream = BitWriter::with_capacity(copy_diffs.len() * used_bits_cp as usize / 8 + 8);
        for &d in &copy_diffs {
            copy_stream.put_bits(d as u32, used_bits_cp);
        }
        let copy_stream = copy_stream.into_bytes();

        // statistics
        let mut flags = vec![0u64; FLAG_ALPHABET];
        let mut group_types = vec![0u64; groups];
        let mut msb = vec![0u64; 1 << huf_bits];
        let mut hist: Vec<GroupHistograms> = (0..groups).map(|_| GroupHistograms::new(&s)).collect();
        self.for_each_unique(|cur, block_start, raw| {
            let g = raw.group as usize;
            if g >= groups {
                bail!("unique vector {cur} has ones group {g} of {groups}");
            }
            group_types[g] += 1;
            let h = &mut hist[g];
            for token in &raw.tokens {
                flags[token.flag() as usize] += 1;
                match self.resolve(&unique, block_start, cur, token)? {
                    Resolved::Match { diff, len } => {
                        msb[(diff >> low_bits) as usize] += 1;
                        h.match_lens[len as usize] += 1;
                    }
                    Resolved::SameRef { len } => h.match_lens[len as usize] += 1,
                    Resolved::Literal(b) => h.literals[b as usize] += 1,
                    Resolved::LiteralRun(bytes) => {
                        for &b in bytes {
                            h.literals[b as usize] += 1;
                        }
                    }
                    Resolved::ZeroRun { len } => h.zero_runs[len as usize] += 1,
                    Resolved::OnesRun { len } => h.ones_runs[len as usize] += 1,
                }
            }
            Ok(())
        })?;

        let flag_code = HuffmanCode::from_frequencies(&to_u32_counts(&flags, "flag")?, true)?;
        let group_code = HuffmanCode::from_frequencies(&to_u32_counts(&group_types, "group")?, true)?;
        let msb_code = HuffmanCode::from_frequencies(&to_u32_counts(&msb, "match offset")?, true)?;
        let group_codes = hist.iter().map(GroupHistograms::build).collect::<Result<Vec<_>>>()?;

        // literal-run sizes: cheapest run per (group, length), then field widths
        let mut run_costs: Vec<(usize, usize, u32)> = Vec::new();
        let mut bias = vec![vec![u32::MAX; MAX_LITERAL_RUN + 1]; groups];
        self.for_each_unique(|_, _, raw| {
            let g = raw.group as usize;
            for token in &raw.tokens {
                if let Token::LiteralRun(bytes) = token {
                    let cost: u32 = bytes.iter().map(|&b| group_codes[g].literals.code_len(u32::from(b))).sum();
                    let slot = &mut bias[g][bytes.len()];
                    *slot = (*slot).min(cost);
                    run_costs.push((g, bytes.len(), cost));
                }
            }
            Ok(())
        })?;
        let mut width_counts = vec![[0u64; 33]; groups];
        for &(g, len, cost) in &run_costs {
            width_counts[g][bits_used(u64::from(cost - bias[g][len] + 1)) as usize] += 1;
        }
        let run_models: Vec<RunSizeModel> = (0..groups)
            .map(|g| {
                let counts = &width_counts[g];
                let max_used = counts.iter().rposition(|&c| c > 0).unwrap_or(0) as u32;
                let used = (1..=max_used)
                    .min_by_key(|&used| {
                        counts
                            .iter()
                            .enumerate()
                            .map(|(w, &c)| {
                                let bits = if w as u32 <= used { used } else { used + max_used };
                                c * u64::from(bits)
                            })
                            .sum::<u64>()
                    })
                    .unwrap_or(0);
                RunSizeModel {
                    max_used_bits: max_used,
                    used_bits: used,
                    bias: bias[g].iter().map(|&b| if b == u32::MAX { 0 } else { b }).collect(),
                }
            })
            .collect();
        drop(run_costs);

        // core stream
        let mut core = BitWriter::with_capacity(self.raw.len() / 2 + 64);
        let mut positions: Vec<u64> = Vec::with_capacity(unique_no as usize);
        self.for_each_unique(|cur, block_start, raw| {
            core.flush_to_byte();
            positions.push(core.byte_len() as u64);
            let g = raw.group as usize;
            let codes = &group_codes[g];
            group_code.encode(&mut core, raw.group);
            for token in &raw.tokens {
                flag_code.encode(&mut core, token.flag());
                match self.resolve(&unique, block_start, cur, token)? {
                    Resolved::Match { diff, len } => {
                        msb_code.encode(&mut core, (diff >> low_bits) as u32);
                        core.put_bits(diff as u32, low_bits);
                        codes.match_lens.encode(&mut core, len);
                    }
                    Resolved::SameRef { len } => codes.match_lens.encode(&mut core, len),
                    Resolved::Literal(b) => codes.literals.encode(&mut core, u32::from(b)),
                    Resolved::LiteralRun(bytes) => {
                        let cost: u32 = bytes.iter().map(|&b| codes.literals.code_len(u32::from(b))).sum();
                        run_models[g].encode(&mut core, bytes.len(), cost);
                        for &b in bytes {
                            codes.literals.encode(&mut core, u32::from(b));
                        }
                    }
                    Resolved::ZeroRun { len } => codes.zero_runs.encode(&mut core, len),
                    Resolved::OnesRun { len } => codes.ones_runs.encode(&mut core, len),
                }
            }
            Ok(())
        })?;
        let core = core.into_bytes();

        let (used_bits_noncp, position_index) = encode_positions(&positions)?;

        let mut out = Vec::with_capacity(core.len() + position_index.len() + copy_stream.len() + 4096);
        write_prefix(&mut out);
        for bv in zeros.iter().chain(copies.iter()) {
            bv.write_to(&mut out);
        }
        let indices_end = out.len();
        put_u8(&mut out, s.ones_ranges as u8);
        put_u8(&mut out, s.ploidy as u8);
        put_u64(&mut out, s.vec_len as u64);
        put_table(&mut out, &msb_code.store_tree());
        put_table(&mut out, &group_code.store_tree());
        for codes in &group_codes {
            codes.write_to(&mut out);
        }
        put_table(&mut out, &flag_code.store_tree());
        let tables_end = out.len();
        put_u64(&mut out, self.no_vec);
        put_u64(&mut out, copy_diffs.len() as u64);
        put_u8(&mut out, used_bits_cp as u8);
        put_stream(&mut out, &copy_stream);
        put_u64(&mut out, unique_no);
        for model in &run_models {
            model.write_to(&mut out);
        }
        put_u8(&mut out, used_bits_noncp as u8);
        put_u8(&mut out, s.match_pos_diff_bits as u8);
        put_stream(&mut out, &position_index);
        put_u32(&mut out, self.block_unique.len() as u32);
        put_u32(&mut out, s.max_no_vec_in_block);
        put_u32(&mut out, s.n_samples);
        let permutations = self.permutations.into_bytes();
        put_stream(&mut out, &permutations);
        out.extend_from_slice(&core);

        info!(
            "Archive: {} vectors ({} unique, {} copies, {} blocks) in {} bytes",
            self.no_vec,
            unique_no,
            copy_diffs.len(),
            self.block_unique.len(),
            out.len()
        );
        info!(
            "  indices {} B, code tables {} B, copies {} B, positions {} B, permutations {} B, core {} B",
            indices_end,
            tables_end - indices_end,
            copy_stream.len(),
            position_index.len(),
            permutations.len(),
            core.len()
        );
        debug!("Encoding took {:.2}s", start.elapsed().as_secs_f64());
        Ok(out)
    }
}

/// Position index: per group of `FULL_POS_STEP` unique vectors, an absolute
/// u64 checkpoint followed by fixed-width deltas from it, byte aligned.
fn encode_positions(positions: &[u64]) -> Result<(u32, Vec<u8>)> {
    let step = FULL_POS_STEP as usize;
    let max_delta = positions
        .chunks(step)
        .flat_map(|group| group.iter().map(move |&p| p - group[0]))
        .max()
        .unwrap_or(0);
    let used_bits = bits_used(max_delta);
    if used_bits > 32 {
        bail!("position delta {max_delta} does not fit the index");
    }
    let mut w = BitWriter::with_capacity(positions.len() * used_bits as usize / 8 + 16);
    for group in positions.chunks(step) {
        w.put_u64(group[0]);
        for &p in &group[1..] {
            w.put_bits((p - group[0]) as u32, used_bits);
        }
        w.flush_to_byte();
    }
    Ok((used_bits, w.into_bytes()))
}

/// Byte size of one full position-index group.
pub(crate) fn position_group_stride(used_bits: u32) -> usize {
    8 + ((FULL_POS_STEP as usize - 1) * used_bits as usize).div_ceil(8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::archive::{open_reader, ByteReader};
    use crate::compression::block_matcher::BlockMatcher;

    #[test]
    fn test_position_index_layout() {
        let positions: Vec<u64> = (0..2100u64).map(|i| i * 3).collect();
        let (bits, index) = encode_positions(&positions).unwrap();
        assert_eq!(bits, bits_used(1024 * 3));
        let stride = position_group_stride(bits);
        let mut r = BitReader::new(&index);
        r.set_byte_pos(stride);
        assert_eq!(r.get_u64(), Some(1025 * 3));
        r.set_byte_pos(2 * stride);
        assert_eq!(r.get_u64(), Some(2050 * 3));
        r.set_bit_pos(2 * stride * 8 + 64 + 4 * bits as usize);
        assert_eq!(r.get_bits(bits), Some(5 * 3));
    }

    #[test]
    fn test_blocks_must_arrive_in_order() {
        let s = CompressionSettings::for_samples(8, 1).unwrap();
        let mut enc = ArchiveEncoder::new(s.clone());
        let block = CompressedBlock {
            block_id: 1,
            permutation: (0..8).collect(),
            ..CompressedBlock::default()
        };
        assert!(enc.add_block(block).is_err());
    }

    #[test]
    fn test_only_last_block_may_be_partial() {
        let s = CompressionSettings::for_samples(8, 1).unwrap();
        let mut enc = ArchiveEncoder::new(s.clone());
        let mut m = BlockMatcher::new(s.clone());
        let mut block = m.compress_block(0, &[1, 2]).unwrap();
        block.permutation = (0..8).collect();
        enc.add_block(block).unwrap();
        let mut block = m.compress_block(1, &[3, 4]).unwrap();
        block.permutation = (0..8).collect();
        assert!(enc.add_block(block).is_err());
    }

    #[test]
    fn test_header_fields() {
        let s = CompressionSettings::for_samples(3, 1).unwrap();
        let mut enc = ArchiveEncoder::new(s.clone());
        let mut m = BlockMatcher::new(s.clone());
        let mut block = m.compress_block(0, &[0, 0, 0b1010_0000, 0b1010_0000]).unwrap();
        block.permutation = vec![0, 1, 2];
        enc.add_block(block).unwrap();
        let bytes = enc.encode().unwrap();

        let mut r: ByteReader<'_> = open_reader(&bytes).unwrap();
        for _ in 0..4 {
            RankBitVec::read_from(&mut r).unwrap();
        }
        assert_eq!(r.read_u8().unwrap(), s.ones_ranges as u8);
        assert_eq!(r.read_u8().unwrap(), 1);
        assert_eq!(r.read_u64().unwrap(), 1);
    }
}
