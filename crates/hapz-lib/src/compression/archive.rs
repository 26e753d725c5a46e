//! Archive framing primitives.
//!
//! All integers are little-endian. Layout after the 4-byte prefix
//! (`magic(2) version(1) reserved(1)`):
//!
//! 1. zero-only bit-vectors for planes 0 and 1, copy bit-vectors for planes 0 and 1
//! 2. `ones_ranges` u8, `ploidy` u8, `vec_len` u64
//! 3. match high-bits code, group-type code (u32 length + tree)
//! 4. per ones group: literal, zero-run, ones-run and match-length codes
//! 5. token-flag code
//! 6. `no_vec` u64, `copy_no` u64, `used_bits_cp` u8, copy-offset stream (u64 length + bytes)
//! 7. `unique_no` u64, per ones group: `max_used_bits` u8, `used_bits` u8,
//!    then the non-zero literal-run biases (`n` u32, `bias_bits` u8, `n`
//!    bit-packed `len:8 bias:bias_bits` pairs, byte aligned)
//! 8. `used_bits_noncp` u8, match-position-diff width u8, position index (u64 length + bytes)
//! 9. `no_blocks` u32, `max_no_vec_in_block` u32, `n_samples` u32, permutation stream (u64 length + bytes)
//! 10. core stream (rest of the file)

use anyhow::{anyhow, bail, Context, Result};
use std::ops::Range;

use super::bit_io::{bits_used, BitReader, BitWriter};
use super::huffman::HuffmanCode;
use super::settings::MAX_LITERAL_RUN;

/// Archive magic bytes.
pub(crate) const ARCHIVE_MAGIC: [u8; 2] = *b"HZ";
/// Current archive format version.
pub(crate) const ARCHIVE_VERSION: u8 = 1;
/// magic(2) + version(1) + reserved(1)
pub(crate) const PREFIX_SIZE: usize = 4;

pub(crate) fn write_prefix(out: &mut Vec<u8>) {
    out.extend_from_slice(&ARCHIVE_MAGIC);
    out.push(ARCHIVE_VERSION);
    out.push(0);
}

#[inline]
pub(crate) fn put_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

#[inline]
pub(crate) fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

#[inline]
pub(crate) fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Code tables carry a 4-byte length prefix.
pub(crate) fn put_table(out: &mut Vec<u8>, table: &[u8]) {
    put_u32(out, table.len() as u32);
    out.extend_from_slice(table);
}

/// Bitstreams carry an 8-byte length prefix.
pub(crate) fn put_stream(out: &mut Vec<u8>, stream: &[u8]) {
    put_u64(out, stream.len() as u64);
    out.extend_from_slice(stream);
}

/// Sequential checked reader over archive bytes.
#[derive(Debug, Clone)]
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    #[inline]
    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub(crate) fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.offset)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let offset = self.offset;
        let end = offset
            .checked_add(n)
            .ok_or_else(|| anyhow!("truncated archive at offset {offset}"))?;
        let slice = self
            .data
            .get(offset..end)
            .ok_or_else(|| anyhow!("truncated archive at offset {offset}"))?;
        self.offset = end;
        Ok(slice)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(b);
        Ok(u64::from_le_bytes(word))
    }

    pub(crate) fn read_table(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    /// Skip over a length-prefixed stream and return its byte range.
    pub(crate) fn read_stream_range(&mut self) -> Result<Range<usize>> {
        let len = usize::try_from(self.read_u64()?)?;
        let start = self.offset;
        self.take(len)?;
        Ok(start..start + len)
    }

    pub(crate) fn rest_range(&mut self) -> Range<usize> {
        let start = self.offset.min(self.data.len());
        self.offset = self.data.len();
        start..self.data.len()
    }
}

/// Validate the prefix and return a reader positioned after it.
pub(crate) fn open_reader(data: &[u8]) -> Result<ByteReader<'_>> {
    if data.len() < PREFIX_SIZE {
        bail!("archive too small ({} bytes)", data.len());
    }
    if data[..2] != ARCHIVE_MAGIC {
        bail!("not a hapz archive (bad magic)");
    }
    if data[2] != ARCHIVE_VERSION {
        bail!("unsupported archive version {}", data[2]);
    }
    let mut reader = ByteReader::new(data);
    reader.take(PREFIX_SIZE)?;
    Ok(reader)
}

/// Code tables used for the tokens of one ones group.
#[derive(Debug, Clone)]
pub(crate) struct GroupCodes {
    pub literals: HuffmanCode,
    pub zero_runs: HuffmanCode,
    pub ones_runs: HuffmanCode,
    pub match_lens: HuffmanCode,
}

impl GroupCodes {
    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        for code in [&self.literals, &self.zero_runs, &self.ones_runs, &self.match_lens] {
            put_table(out, &code.store_tree());
        }
    }

    pub(crate) fn read_from(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            literals: read_code(reader, "literal")?,
            zero_runs: read_code(reader, "zero-run")?,
            ones_runs: read_code(reader, "ones-run")?,
            match_lens: read_code(reader, "match-length")?,
        })
    }
}

pub(crate) fn read_code(reader: &mut ByteReader<'_>, what: &str) -> Result<HuffmanCode> {
    let table = reader.read_table()?;
    HuffmanCode::load_tree(table).with_context(|| format!("invalid {what} code table"))
}

/// Stored bit size of each literal run, relative to the cheapest run of the
/// same length in the same ones group.
///
/// A value `v = size - bias[len] + 1` is written in `used_bits` bits; values
/// that do not fit are written as 0 followed by `v` in `max_used_bits` bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RunSizeModel {
    pub max_used_bits: u32,
    pub used_bits: u32,
    pub bias: Vec<u32>,
}

impl RunSizeModel {
    /// Lengths without literal runs have bias 0 and are left out.
    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        put_u8(out, self.max_used_bits as u8);
        put_u8(out, self.used_bits as u8);
        let entries: Vec<(usize, u32)> = self
            .bias
            .iter()
            .copied()
            .enumerate()
            .filter(|&(_, b)| b != 0)
            .collect();
        let bias_bits = bits_used(u64::from(entries.iter().map(|&(_, b)| b).max().unwrap_or(0)));
        put_u32(out, entries.len() as u32);
        put_u8(out, bias_bits as u8);
        let mut w = BitWriter::with_capacity(entries.len() * (8 + bias_bits as usize) / 8 + 1);
        for (len, b) in entries {
            w.put_bits(len as u32, 8);
            w.put_bits(b, bias_bits);
        }
        out.extend_from_slice(&w.into_bytes());
    }

    pub(crate) fn read_from(reader: &mut ByteReader<'_>) -> Result<Self> {
        let max_used_bits = u32::from(reader.read_u8()?);
        let used_bits = u32::from(reader.read_u8()?);
        if max_used_bits > 32 || used_bits > max_used_bits {
            bail!("invalid literal-run size widths ({used_bits}/{max_used_bits})");
        }
        let n_entries = reader.read_u32()? as usize;
        let bias_bits = u32::from(reader.read_u8()?);
        if n_entries > MAX_LITERAL_RUN + 1 || bias_bits > 32 {
            bail!("invalid literal-run bias table ({n_entries} entries of {bias_bits} bits)");
        }
        let packed = reader.take((n_entries * (8 + bias_bits as usize)).div_ceil(8))?;
        let mut r = BitReader::new(packed);
        let mut bias = vec![0u32; MAX_LITERAL_RUN + 1];
        for _ in 0..n_entries {
            let len = r.get_bits(8).context("truncated literal-run bias table")? as usize;
            let b = r.get_bits(bias_bits).context("truncated literal-run bias table")?;
            *bias
                .get_mut(len)
                .ok_or_else(|| anyhow!("literal-run length {len} out of range"))? = b;
        }
        Ok(Self {
            max_used_bits,
            used_bits,
            bias,
        })
    }

    pub(crate) fn encode(&self, w: &mut BitWriter, len: usize, size: u32) {
        let v = size - self.bias[len] + 1;
        if self.used_bits < 32 && v < (1u32 << self.used_bits) {
            w.put_bits(v, self.used_bits);
        } else {
            w.put_bits(0, self.used_bits);
            w.put_bits(v, self.max_used_bits);
        }
    }

    /// Bit size of a literal run of `len` bytes.
    pub(crate) fn decode(&self, r: &mut BitReader<'_>, len: usize) -> Option<u64> {
        let mut v = r.get_bits(self.used_bits)?;
        if v == 0 {
            v = r.get_bits(self.max_used_bits)?;
        }
        if v == 0 {
            return None;
        }
        Some(u64::from(v) - 1 + u64::from(*self.bias.get(len)?))
    }
}
