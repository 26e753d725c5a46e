//! Block-local dictionary matching over haplotype bit-vectors.
//!
//! Each vector of a block is classified as zero-only, a copy of an earlier
//! in-scope vector, or unique. Unique vectors are written to a raw token
//! stream with fixed-width fields:
//!
//! ```text
//! [byte align] group:bit_size_ones_group
//! token*:  flag:8 payload
//!   0  literal        byte:8
//!   1  match          ref:bit_size_id len:bit_size_match_len
//!   2  same-ref match len:bit_size_match_len
//!   3  zero run       len:bit_size_run_len
//!   4  ones run       len:bit_size_run_len
//!   n  literal run    (n - 3) bytes, n >= 5
//! ```
//!
//! Match references are block-local vector ids; the archive encoder turns
//! them into offsets in unique-vector space.

use anyhow::{bail, Context, Result};

use super::bit_io::{BitReader, BitWriter};
use super::hash_table::{hash_bytes, IdTable};
use super::settings::{
    CompressionSettings, HASH_KEY_LEN, MAX_LITERAL_RUN, MIN_LITERAL_RUN, MIN_ONES_RUN_LEN,
    MIN_ZERO_RUN_LEN,
};

pub const FLAG_LITERAL: u32 = 0;
pub const FLAG_MATCH: u32 = 1;
pub const FLAG_MATCH_SAME_REF: u32 = 2;
pub const FLAG_ZERO_RUN: u32 = 3;
pub const FLAG_ONES_RUN: u32 = 4;
/// Literal runs are flagged as `len + LITERAL_RUN_FLAG_BIAS`.
pub const LITERAL_RUN_FLAG_BIAS: u32 = 3;

const POSITION_TABLE_INIT: usize = 256;
const NOT_UNIQUE: u32 = u32::MAX;

/// One unit of a unique vector's encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Literal(u8),
    Match { ref_id: u32, len: u32 },
    MatchSameRef { len: u32 },
    ZeroRun { len: u32 },
    OnesRun { len: u32 },
    LiteralRun(Vec<u8>),
}

impl Token {
    /// Number of vector bytes the token covers.
    pub fn len(&self) -> usize {
        match self {
            Token::Literal(_) => 1,
            Token::Match { len, .. }
            | Token::MatchSameRef { len }
            | Token::ZeroRun { len }
            | Token::OnesRun { len } => *len as usize,
            Token::LiteralRun(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flag(&self) -> u32 {
        match self {
            Token::Literal(_) => FLAG_LITERAL,
            Token::Match { .. } => FLAG_MATCH,
            Token::MatchSameRef { .. } => FLAG_MATCH_SAME_REF,
            Token::ZeroRun { .. } => FLAG_ZERO_RUN,
            Token::OnesRun { .. } => FLAG_ONES_RUN,
            Token::LiteralRun(bytes) => bytes.len() as u32 + LITERAL_RUN_FLAG_BIAS,
        }
    }
}

/// Matcher output for one block, handed to the archive encoder.
#[derive(Debug, Clone, Default)]
pub struct CompressedBlock {
    pub block_id: u32,
    pub n_vecs: u32,
    /// Raw token stream of the unique vectors, in vector order.
    pub raw: Vec<u8>,
    pub zeros: Vec<bool>,
    pub copies: Vec<bool>,
    /// Block-local origin of each copy, in vector order.
    pub copy_origins: Vec<u32>,
    pub n_unique: u32,
    /// Column permutation applied before matching (original -> permuted).
    pub permutation: Vec<u32>,
}

/// A unique vector parsed back out of the raw stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawVector {
    pub group: u32,
    pub tokens: Vec<Token>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MatchCandidate {
    pub ref_id: u32,
    pub len: usize,
    pub depth: u32,
}

/// Whether `cand` (of length `len`, chain depth `depth`) should replace the
/// current best match. Continuing the previous reference wins even when up
/// to one byte shorter.
pub(crate) fn prefer_candidate(
    cand: u32,
    len: usize,
    depth: u32,
    best: &MatchCandidate,
    prev_ref: Option<u32>,
) -> bool {
    let cand_is_prev = prev_ref == Some(cand);
    let best_is_prev = prev_ref == Some(best.ref_id);
    len > best.len + 1
        || (cand_is_prev && len + 1 >= best.len)
        || (!best_is_prev
            && (len > best.len
                || (len == best.len
                    && (depth < best.depth || (depth == best.depth && cand > best.ref_id)))))
}

/// Hash of the key at offset `i` of vector `v`, or `None` when the key is
/// all zero or any of its bytes already sits at the depth limit.
#[inline]
fn key_hash(data: &[u8], depth: &[u8], vec_len: usize, max_depth: u32, v: usize, i: usize) -> Option<u64> {
    let start = v * vec_len + i;
    let key = &data[start..start + HASH_KEY_LEN];
    if depth[start..start + HASH_KEY_LEN]
        .iter()
        .any(|&c| u32::from(c) >= max_depth)
    {
        return None;
    }
    if key.iter().all(|&b| b == 0) {
        return None;
    }
    Some(hash_bytes(key))
}

/// Length of the run of `byte` at the start of `bytes`.
#[inline]
fn run_len(bytes: &[u8], byte: u8) -> usize {
    bytes.iter().take_while(|&&b| b == byte).count()
}

/// Length of the trailing run of `byte`, or 0 when shorter than `min`.
#[inline]
fn tail_run(bytes: &[u8], byte: u8, min: usize) -> usize {
    let n = bytes.iter().rev().take_while(|&&b| b == byte).count();
    if n < min {
        0
    } else {
        n
    }
}

/// Writes raw tokens and folds literal streaks into literal runs.
struct TokenEmitter<'w> {
    out: &'w mut BitWriter,
    bit_size_id: u32,
    bit_size_match_len: u32,
    bit_size_run_len: u32,
    lit_run: usize,
    prev_ref: Option<u32>,
}

impl TokenEmitter<'_> {
    fn literal(&mut self, vec: &[u8], i: usize) {
        self.out.put_byte(FLAG_LITERAL as u8);
        self.out.put_byte(vec[i]);
        self.lit_run += 1;
        if self.lit_run == MAX_LITERAL_RUN {
            self.fold_literals(vec, i + 1);
        }
    }

    /// Close the current literal streak ending before `end`.
    fn flush_literals(&mut self, vec: &[u8], end: usize) {
        if self.lit_run >= MIN_LITERAL_RUN {
            self.fold_literals(vec, end);
        }
        self.lit_run = 0;
    }

    fn fold_literals(&mut self, vec: &[u8], end: usize) {
        let n = self.lit_run;
        self.out.discard_bits(n * 16);
        self.out.put_byte((n as u32 + LITERAL_RUN_FLAG_BIAS) as u8);
        self.out.put_bytes(&vec[end - n..end]);
        self.lit_run = 0;
    }

    fn zero_run(&mut self, len: usize) {
        self.out.put_byte(FLAG_ZERO_RUN as u8);
        self.out.put_bits(len as u32, self.bit_size_run_len);
    }

    fn ones_run(&mut self, len: usize) {
        self.out.put_byte(FLAG_ONES_RUN as u8);
        self.out.put_bits(len as u32, self.bit_size_run_len);
    }

    fn matched(&mut self, ref_id: u32, len: usize) {
        if self.prev_ref == Some(ref_id) {
            self.out.put_byte(FLAG_MATCH_SAME_REF as u8);
        } else {
            self.out.put_byte(FLAG_MATCH as u8);
            self.out.put_bits(ref_id, self.bit_size_id);
        }
        self.out.put_bits(len as u32, self.bit_size_match_len);
        self.prev_ref = Some(ref_id);
    }
}

/// Per-worker matcher state. Reused across blocks.
pub struct BlockMatcher {
    settings: CompressionSettings,
    position_tables: Vec<IdTable>,
    vector_table: IdTable,
    /// Per-byte match-chain depth, `n_vecs * vec_len`.
    depth: Vec<u8>,
    insert_mask: Vec<bool>,
    /// Offsets whose key went into the position tables, `n_vecs * n_offsets`.
    registered: Vec<bool>,
    unique_ids: Vec<u32>,
    ordinal: Vec<u32>,
    /// Index into `unique_ids` of the oldest vector still in the position tables.
    oldest_part: usize,
}

impl BlockMatcher {
    pub fn new(settings: CompressionSettings) -> Self {
        let n_offsets = (settings.vec_len + 1).saturating_sub(HASH_KEY_LEN);
        let vector_table_size = (settings.max_no_vec_in_block as usize * 4).next_power_of_two();
        Self {
            position_tables: (0..n_offsets).map(|_| IdTable::new(POSITION_TABLE_INIT)).collect(),
            vector_table: IdTable::new(vector_table_size),
            depth: Vec::new(),
            insert_mask: Vec::with_capacity(settings.vec_len),
            registered: Vec::new(),
            unique_ids: Vec::new(),
            ordinal: Vec::new(),
            oldest_part: 0,
            settings,
        }
    }

    pub fn settings(&self) -> &CompressionSettings {
        &self.settings
    }

    /// Tables go back to their initial size so that probe order, and with
    /// it the chosen matches, does not depend on earlier blocks.
    fn reset(&mut self, n_vecs: usize) {
        for table in &mut self.position_tables {
            if table.capacity() > POSITION_TABLE_INIT {
                *table = IdTable::new(POSITION_TABLE_INIT);
            } else {
                table.clear();
            }
        }
        self.vector_table.clear();
        self.depth.clear();
        self.depth.resize(n_vecs * self.settings.vec_len, 0);
        self.registered.clear();
        self.registered.resize(n_vecs * self.position_tables.len(), false);
        self.unique_ids.clear();
        self.ordinal.clear();
        self.ordinal.resize(n_vecs, NOT_UNIQUE);
        self.oldest_part = 0;
    }

    /// Match every vector of `data` (`n_vecs * vec_len` bytes, already
    /// permuted) against the block's history.
    pub fn compress_block(&mut self, block_id: u32, data: &[u8]) -> Result<CompressedBlock> {
        let vec_len = self.settings.vec_len;
        if data.len() % vec_len != 0 {
            bail!("block {block_id}: {} bytes is not a whole number of {vec_len}-byte vectors", data.len());
        }
        let n_vecs = data.len() / vec_len;
        if n_vecs > self.settings.max_no_vec_in_block as usize {
            bail!(
                "block {block_id}: {n_vecs} vectors exceed the block limit of {}",
                self.settings.max_no_vec_in_block
            );
        }
        self.reset(n_vecs);

        let mut out = BitWriter::with_capacity(data.len() / 4 + 64);
        let mut block = CompressedBlock {
            block_id,
            n_vecs: n_vecs as u32,
            zeros: vec![false; n_vecs],
            copies: vec![false; n_vecs],
            ..CompressedBlock::default()
        };

        for v in 0..n_vecs {
            let vec = &data[v * vec_len..(v + 1) * vec_len];
            if vec.iter().all(|&b| b == 0) {
                block.zeros[v] = true;
                continue;
            }
            let h = hash_bytes(vec);
            if let Some(origin) = self.find_copy(data, vec, h) {
                block.copies[v] = true;
                block.copy_origins.push(origin);
                continue;
            }
            self.vector_table.insert(h, v as u32);
            self.encode_unique(data, v, &mut out);
            self.register_unique(data, v);
        }

        block.n_unique = self.unique_ids.len() as u32;
        block.raw = out.into_bytes();
        Ok(block)
    }

    fn find_copy(&self, data: &[u8], vec: &[u8], h: u64) -> Option<u32> {
        let vec_len = self.settings.vec_len;
        let oldest = self
            .unique_ids
            .len()
            .saturating_sub(self.settings.n_vec_history_vecs as usize);
        self.vector_table.probe(h).find(|&cand| {
            let ord = self.ordinal[cand as usize];
            ord != NOT_UNIQUE
                && ord as usize >= oldest
                && &data[cand as usize * vec_len..(cand as usize + 1) * vec_len] == vec
        })
    }

    fn best_match(&self, data: &[u8], v: usize, i: usize, prev_ref: Option<u32>) -> Option<MatchCandidate> {
        let vec_len = self.settings.vec_len;
        let max_depth = self.settings.max_depth;
        let h = key_hash(data, &self.depth, vec_len, max_depth, v, i)?;
        let base = v * vec_len;

        let mut best: Option<MatchCandidate> = None;
        for cand in self.position_tables[i].probe(h) {
            let cbase = cand as usize * vec_len;
            let mut len = 0usize;
            let mut depth = 0u32;
            while i + len < vec_len && data[cbase + i + len] == data[base + i + len] {
                let c = u32::from(self.depth[cbase + i + len]);
                if c >= max_depth {
                    break;
                }
                depth = depth.max(c);
                len += 1;
            }
            if len < HASH_KEY_LEN {
                continue;
            }
            let take = match &best {
                None => true,
                Some(b) => prefer_candidate(cand, len, depth, b, prev_ref),
            };
            if take {
                best = Some(MatchCandidate { ref_id: cand, len, depth });
            }
            if best.is_some_and(|b| b.len + i >= vec_len) {
                break;
            }
        }
        best
    }

    fn encode_unique(&mut self, data: &[u8], v: usize, out: &mut BitWriter) {
        let vec_len = self.settings.vec_len;
        let base = v * vec_len;
        let vec = &data[base..base + vec_len];

        out.flush_to_byte();
        out.put_bits(self.settings.ones_group(vec), self.settings.bit_size_ones_group);

        self.insert_mask.clear();
        self.insert_mask.resize(vec_len, true);

        let zero_tail = tail_run(vec, 0x00, MIN_ZERO_RUN_LEN);
        let ones_tail = tail_run(vec, 0xff, MIN_ONES_RUN_LEN);
        let end = HASH_KEY_LEN.max(zero_tail).max(ones_tail);

        let mut em = TokenEmitter {
            out,
            bit_size_id: self.settings.bit_size_id,
            bit_size_match_len: self.settings.bit_size_match_len,
            bit_size_run_len: self.settings.bit_size_run_len,
            lit_run: 0,
            prev_ref: None,
        };

        let mut i = 0usize;
        while vec_len - i > end {
            let zeros = run_len(&vec[i..], 0x00);
            if zeros >= MIN_ZERO_RUN_LEN {
                em.flush_literals(vec, i);
                em.zero_run(zeros);
                self.insert_mask[i..i + zeros - MIN_ZERO_RUN_LEN].fill(false);
                i += zeros;
                continue;
            }
            let ones = run_len(&vec[i..], 0xff);
            if ones >= MIN_ONES_RUN_LEN {
                em.flush_literals(vec, i);
                em.ones_run(ones);
                self.insert_mask[i..i + ones - MIN_ONES_RUN_LEN].fill(false);
                i += ones;
                continue;
            }

            let found = if vec_len - end <= HASH_KEY_LEN {
                None
            } else {
                self.best_match(data, v, i, em.prev_ref)
            };
            match found {
                Some(m) => {
                    em.flush_literals(vec, i);
                    em.matched(m.ref_id, m.len);
                    let d = (m.depth + 1).min(u32::from(u8::MAX)) as u8;
                    self.depth[base + i..base + i + m.len].fill(d);
                    i += m.len;
                }
                None => {
                    em.literal(vec, i);
                    i += 1;
                }
            }
        }

        let zero_tail = zero_tail.min(vec_len - i);
        let ones_tail = ones_tail.min(vec_len - i);
        let tail = zero_tail.max(ones_tail);
        while i < vec_len - tail {
            em.literal(vec, i);
            i += 1;
        }
        em.flush_literals(vec, i);

        if zero_tail > 0 && i < vec_len {
            em.zero_run(zero_tail);
            self.insert_mask[i..].fill(false);
            i += zero_tail;
        }
        if ones_tail > 0 && i < vec_len {
            em.ones_run(ones_tail);
            self.insert_mask[i..].fill(false);
            i += ones_tail;
        }
        debug_assert_eq!(i, vec_len);
    }

    /// Insert vector `v`'s keys into the position tables and evict history
    /// beyond the match window. Offsets inside runs are never keys, also
    /// not when a table is rebuilt.
    fn register_unique(&mut self, data: &[u8], v: usize) {
        let vec_len = self.settings.vec_len;
        let max_depth = self.settings.max_depth;
        let n_offsets = self.position_tables.len();

        for i in 0..n_offsets {
            if !self.insert_mask[i] {
                continue;
            }
            let Some(h) = key_hash(data, &self.depth, vec_len, max_depth, v, i) else {
                continue;
            };
            if self.position_tables[i].needs_rebuild() {
                let depth = &self.depth;
                let registered = &self.registered;
                let entries = self.unique_ids[self.oldest_part..]
                    .iter()
                    .filter(|&&u| registered[u as usize * n_offsets + i])
                    .filter_map(|&u| key_hash(data, depth, vec_len, max_depth, u as usize, i).map(|h| (h, u)));
                self.position_tables[i].rebuild(entries);
            }
            self.position_tables[i].insert(h, v as u32);
            self.registered[v * n_offsets + i] = true;
        }

        self.ordinal[v] = self.unique_ids.len() as u32;
        self.unique_ids.push(v as u32);

        let window = self.settings.n_vec_history_parts as usize;
        while self.unique_ids.len() - self.oldest_part > window {
            let old = self.unique_ids[self.oldest_part] as usize;
            for i in 0..n_offsets {
                if !self.registered[old * n_offsets + i] {
                    continue;
                }
                if let Some(h) = key_hash(data, &self.depth, vec_len, max_depth, old, i) {
                    self.position_tables[i].remove(h, old as u32);
                }
            }
            self.oldest_part += 1;
        }
    }
}

/// Parse one unique vector from a raw token stream.
pub fn read_raw_vector(r: &mut BitReader<'_>, settings: &CompressionSettings) -> Result<RawVector> {
    const TRUNCATED: &str = "truncated raw token stream";
    r.align_to_byte();
    let group = r.get_bits(settings.bit_size_ones_group).context(TRUNCATED)?;
    let mut tokens = Vec::new();
    let mut covered = 0usize;
    while covered < settings.vec_len {
        let flag = u32::from(r.get_byte().context(TRUNCATED)?);
        let token = match flag {
            FLAG_LITERAL => Token::Literal(r.get_byte().context(TRUNCATED)?),
            FLAG_MATCH => {
                let ref_id = r.get_bits(settings.bit_size_id).context(TRUNCATED)?;
                let len = r.get_bits(settings.bit_size_match_len).context(TRUNCATED)?;
                Token::Match { ref_id, len }
            }
            FLAG_MATCH_SAME_REF => Token::MatchSameRef {
                len: r.get_bits(settings.bit_size_match_len).context(TRUNCATED)?,
            },
            FLAG_ZERO_RUN => Token::ZeroRun {
                len: r.get_bits(settings.bit_size_run_len).context(TRUNCATED)?,
            },
            FLAG_ONES_RUN => Token::OnesRun {
                len: r.get_bits(settings.bit_size_run_len).context(TRUNCATED)?,
            },
            f => {
                let n = (f - LITERAL_RUN_FLAG_BIAS) as usize;
                let mut bytes = Vec::with_capacity(n);
                for _ in 0..n {
                    bytes.push(r.get_byte().context(TRUNCATED)?);
                }
                Token::LiteralRun(bytes)
            }
        };
        if token.is_empty() {
            bail!("zero-length token (flag {flag}) in raw stream");
        }
        covered += token.len();
        tokens.push(token);
    }
    if covered != settings.vec_len {
        bail!("tokens cover {covered} bytes of a {}-byte vector", settings.vec_len);
    }
    Ok(RawVector { group, tokens })
}

/// Parse every unique vector of a block.
pub fn read_block_tokens(block: &CompressedBlock, settings: &CompressionSettings) -> Result<Vec<RawVector>> {
    let mut r = BitReader::new(&block.raw);
    (0..block.n_unique)
        .map(|_| read_raw_vector(&mut r, settings))
        .collect()
}

/// Expand tokens back into vector bytes, resolving matches against
/// already-expanded vectors of the same block.
pub fn expand_tokens(tokens: &[Token], block: &[Vec<u8>], vec_len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(vec_len);
    let mut prev_ref: Option<u32> = None;
    for token in tokens {
        let i = out.len();
        match token {
            Token::Literal(b) => out.push(*b),
            Token::LiteralRun(bytes) => out.extend_from_slice(bytes),
            Token::ZeroRun { len } => out.resize(i + *len as usize, 0x00),
            Token::OnesRun { len } => out.resize(i + *len as usize, 0xff),
            Token::Match { ref_id, len } => {
                prev_ref = Some(*ref_id);
                let src = block.get(*ref_id as usize).context("match refers to a later vector")?;
                out.extend_from_slice(src.get(i..i + *len as usize).context("match past vector end")?);
            }
            Token::MatchSameRef { len } => {
                let ref_id = prev_ref.context("same-ref match without a previous match")?;
                let src = block.get(ref_id as usize).context("match refers to a later vector")?;
                out.extend_from_slice(src.get(i..i + *len as usize).context("match past vector end")?);
            }
        }
    }
    if out.len() != vec_len {
        bail!("tokens expand to {} bytes, expected {vec_len}", out.len());
    }
    Ok(out)
}
