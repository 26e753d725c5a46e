//! Bit-vectors with a constant-time rank directory.
//!
//! Storage is the plain, uncompressed bit array plus one u64 cumulative
//! count per 512-bit superblock: 64 extra bits per 512 in memory, so
//! `rank1` touches at most eight words. Only the words are serialized; the
//! directory is rebuilt on load and costs nothing on disk.

use anyhow::{bail, Result};

use super::archive::{put_u64, ByteReader};

const WORDS_PER_SUPERBLOCK: usize = 8;

/// Growable bit-vector under construction.
#[derive(Debug, Clone, Default)]
pub struct BitVecBuilder {
    len: usize,
    words: Vec<u64>,
}

impl BitVecBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bits: usize) -> Self {
        Self {
            len: 0,
            words: Vec::with_capacity(bits.div_ceil(64)),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn push(&mut self, bit: bool) {
        if self.len % 64 == 0 {
            self.words.push(0);
        }
        if bit {
            self.words[self.len / 64] |= 1u64 << (self.len % 64);
        }
        self.len += 1;
    }

    #[inline]
    pub fn get(&self, i: usize) -> bool {
        i < self.len && (self.words[i / 64] >> (i % 64)) & 1 == 1
    }

    pub fn build(self) -> RankBitVec {
        RankBitVec::from_words(self.words, self.len)
    }
}

/// Immutable bit-vector supporting `rank1` in O(1).
#[derive(Debug, Clone)]
pub struct RankBitVec {
    len: usize,
    words: Vec<u64>,
    supers: Vec<u64>,
}

impl RankBitVec {
    fn from_words(words: Vec<u64>, len: usize) -> Self {
        let mut supers = Vec::with_capacity(words.len() / WORDS_PER_SUPERBLOCK + 1);
        let mut acc = 0u64;
        for chunk in words.chunks(WORDS_PER_SUPERBLOCK) {
            supers.push(acc);
            acc += chunk.iter().map(|w| u64::from(w.count_ones())).sum::<u64>();
        }
        supers.push(acc);
        Self { len, words, supers }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn count_ones(&self) -> u64 {
        self.supers.last().copied().unwrap_or(0)
    }

    #[inline]
    pub fn get(&self, i: usize) -> bool {
        i < self.len && (self.words[i / 64] >> (i % 64)) & 1 == 1
    }

    /// Number of set bits in `[0, i)`. `i` is clamped to `len`.
    #[inline]
    pub fn rank1(&self, i: usize) -> u64 {
        let i = i.min(self.len);
        let word = i / 64;
        let sb = word / WORDS_PER_SUPERBLOCK;
        let mut count = self.supers[sb];
        for w in &self.words[sb * WORDS_PER_SUPERBLOCK..word] {
            count += u64::from(w.count_ones());
        }
        let rem = i % 64;
        if rem > 0 {
            count += u64::from((self.words[word] & ((1u64 << rem) - 1)).count_ones());
        }
        count
    }

    /// Append `len` and the raw words, little-endian.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        put_u64(out, self.len as u64);
        for &w in &self.words {
            put_u64(out, w);
        }
    }

    pub(crate) fn read_from(reader: &mut ByteReader<'_>) -> Result<Self> {
        let len = reader.read_u64()?;
        let len = usize::try_from(len)?;
        let n_words = len.div_ceil(64);
        if n_words > reader.remaining() / 8 {
            bail!("bit-vector of {len} bits exceeds the remaining archive data");
        }
        let mut words = Vec::with_capacity(n_words);
        for _ in 0..n_words {
            words.push(reader.read_u64()?);
        }
        if len % 64 != 0 {
            if let Some(&last) = words.last() {
                if last >> (len % 64) != 0 {
                    bail!("bit-vector has bits set past its length");
                }
            }
        }
        Ok(Self::from_words(words, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(bits: &[bool]) -> RankBitVec {
        let mut b = BitVecBuilder::new();
        for &bit in bits {
            b.push(bit);
        }
        b.build()
    }

    #[test]
    fn test_rank_matches_naive_count() {
        let bits: Vec<bool> = (0..5000).map(|i| (i * 37 + i / 7) % 5 == 0).collect();
        let bv = build(&bits);
        let mut naive = 0u64;
        for (i, &bit) in bits.iter().enumerate() {
            assert_eq!(bv.rank1(i), naive, "rank at {i}");
            assert_eq!(bv.get(i), bit);
            naive += u64::from(bit);
        }
        assert_eq!(bv.rank1(bits.len()), naive);
        assert_eq!(bv.count_ones(), naive);
    }

    #[test]
    fn test_empty_vector() {
        let bv = BitVecBuilder::new().build();
        assert!(bv.is_empty());
        assert_eq!(bv.rank1(0), 0);
        assert!(!bv.get(0));
    }

    #[test]
    fn test_directory_is_one_count_per_superblock() {
        let bits: Vec<bool> = (0..1030).map(|i| i % 2 == 0).collect();
        let bv = build(&bits);
        assert_eq!(bv.words.len(), 17);
        assert_eq!(bv.supers.len(), 1030usize.div_ceil(512) + 1);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let bits: Vec<bool> = (0..1030).map(|i| i % 3 == 1).collect();
        let bv = build(&bits);
        let mut out = Vec::new();
        bv.write_to(&mut out);
        assert_eq!(out.len(), 8 + 8 * 1030usize.div_ceil(64));

        let mut reader = ByteReader::new(&out);
        let loaded = RankBitVec::read_from(&mut reader).unwrap();
        assert_eq!(loaded.len(), 1030);
        for i in [0, 1, 63, 64, 511, 512, 1029, 1030] {
            assert_eq!(loaded.rank1(i), bv.rank1(i));
        }
    }

    #[test]
    fn test_truncated_vector_is_rejected() {
        let bv = build(&[true; 200]);
        let mut out = Vec::new();
        bv.write_to(&mut out);
        out.truncate(out.len() - 3);
        let mut reader = ByteReader::new(&out);
        assert!(RankBitVec::read_from(&mut reader).is_err());
    }
}
