//! Minimum-redundancy prefix codes.
//!
//! The tree is built from a frequency histogram with a deterministic
//! tie-break (equal frequencies pop the lower id first), so only the tree
//! shape and leaf ids need to be stored: codes are re-derived on load.
//!
//! Decoding uses two acceleration tables:
//! - a shortcut table of `2^min_len` entries giving the tree position after
//!   the shortest code length, used by [`HuffmanCode::decode_fast`];
//! - a lookup table of `2^min(max_len, 16)` entries that resolves any code
//!   fitting the window in one probe and otherwise hands back the internal
//!   node to continue from, used by [`HuffmanCode::decode_lut`].

use anyhow::{bail, Context, Result};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

use super::bit_io::{bits_used, BitReader, BitWriter};

/// Widest lookup window.
pub const MAX_LUT_BITS: u32 = 16;

/// Longest code the bit-level writers can emit in one call.
pub const MAX_CODE_LEN: u32 = 31;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Child {
    Leaf(u32),
    Node(u32),
}

#[derive(Clone, Copy, Debug)]
struct Node {
    children: [Child; 2],
}

/// A symbol's codeword, right-aligned in `code`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Code {
    pub code: u32,
    pub len: u32,
}

#[derive(Clone, Copy, Debug)]
enum LutEntry {
    Symbol { symbol: u32, len: u8 },
    Partial { node: u32 },
}

/// Collects symbol frequencies in symbol order.
#[derive(Debug, Clone)]
pub struct HuffmanBuilder {
    size: usize,
    freqs: Vec<u32>,
}

impl HuffmanBuilder {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            freqs: Vec::with_capacity(size),
        }
    }

    /// Record the frequency of the next symbol.
    pub fn insert(&mut self, freq: u32) {
        self.freqs.push(freq);
    }

    /// Build the code. With `compact`, zero-frequency symbols are dropped
    /// from the tree as long as at least two leaves remain.
    pub fn complete(mut self, compact: bool) -> Result<HuffmanCode> {
        if self.size == 0 {
            bail!("cannot build a prefix code over an empty alphabet");
        }
        self.freqs.resize(self.size, 0);
        HuffmanCode::build(&self.freqs, compact)
    }
}

/// A complete prefix code with decode tables.
#[derive(Debug, Clone)]
pub struct HuffmanCode {
    size: u32,
    nodes: Vec<Node>,
    root: Child,
    codes: Vec<Code>,
    min_len: u32,
    max_len: u32,
    lut_bits: u32,
    lut: Vec<LutEntry>,
    shortcut: Vec<Child>,
}

impl HuffmanCode {
    pub fn from_frequencies(freqs: &[u32], compact: bool) -> Result<Self> {
        let mut builder = HuffmanBuilder::new(freqs.len());
        for &f in freqs {
            builder.insert(f);
        }
        builder.complete(compact)
    }

    fn build(freqs: &[u32], compact: bool) -> Result<Self> {
        let size = u32::try_from(freqs.len()).context("alphabet too large")?;

        // Internal nodes are numbered after the symbols so that on equal
        // frequency a leaf always pops before an internal node.
        let mut heap: BinaryHeap<Reverse<(u64, u32)>> = freqs
            .iter()
            .enumerate()
            .map(|(id, &f)| Reverse((u64::from(f), id as u32)))
            .collect();

        if compact {
            while heap.len() > 2 {
                match heap.peek() {
                    Some(Reverse((0, _))) => {
                        heap.pop();
                    }
                    _ => break,
                }
            }
        }

        let as_child = |id: u32| {
            if id < size {
                Child::Leaf(id)
            } else {
                Child::Node(id - size)
            }
        };

        let mut nodes: Vec<Node> = Vec::with_capacity(heap.len().saturating_sub(1));
        while heap.len() > 1 {
            let (Some(Reverse((fa, a))), Some(Reverse((fb, b)))) = (heap.pop(), heap.pop()) else {
                break;
            };
            let id = size + nodes.len() as u32;
            nodes.push(Node {
                children: [as_child(a), as_child(b)],
            });
            heap.push(Reverse((fa + fb, id)));
        }

        let root = match heap.pop() {
            Some(Reverse((_, id))) => as_child(id),
            None => bail!("prefix code has no symbols"),
        };

        Self::from_tree(size, nodes, root)
    }

    fn from_tree(size: u32, nodes: Vec<Node>, root: Child) -> Result<Self> {
        let mut codes = vec![Code::default(); size as usize];
        let mut min_len = u32::MAX;
        let mut max_len = 0u32;
        let mut n_leaves = 0usize;

        let mut stack = vec![(root, 0u32, 0u32)];
        while let Some((child, code, len)) = stack.pop() {
            if len > MAX_CODE_LEN {
                bail!("prefix code length {len} exceeds the {MAX_CODE_LEN}-bit limit");
            }
            match child {
                Child::Leaf(symbol) => {
                    let slot = codes
                        .get_mut(symbol as usize)
                        .with_context(|| format!("leaf symbol {symbol} outside alphabet of {size}"))?;
                    *slot = Code { code, len };
                    min_len = min_len.min(len);
                    max_len = max_len.max(len);
                    n_leaves += 1;
                }
                Child::Node(n) => {
                    let node = nodes
                        .get(n as usize)
                        .with_context(|| format!("dangling prefix-code node {n}"))?;
                    stack.push((node.children[1], (code << 1) | 1, len + 1));
                    stack.push((node.children[0], code << 1, len + 1));
                }
            }
        }

        if n_leaves == 1 || min_len > max_len {
            min_len = 0;
        }

        let mut hc = Self {
            size,
            nodes,
            root,
            codes,
            min_len,
            max_len,
            lut_bits: 0,
            lut: Vec::new(),
            shortcut: Vec::new(),
        };
        hc.build_tables();
        Ok(hc)
    }

    fn build_tables(&mut self) {
        if self.max_len == 0 {
            return;
        }
        self.lut_bits = self.max_len.min(MAX_LUT_BITS);
        let lut_bits = self.lut_bits;
        self.lut = vec![LutEntry::Partial { node: 0 }; 1usize << lut_bits];
        self.shortcut = vec![self.root; 1usize << self.min_len];

        let mut stack = vec![(self.root, 0u32, 0u32)];
        while let Some((child, code, depth)) = stack.pop() {
            if depth == self.min_len {
                self.shortcut[code as usize] = child;
            }
            match child {
                Child::Leaf(symbol) => {
                    let shift = lut_bits - depth;
                    let start = (code << shift) as usize;
                    let entry = LutEntry::Symbol {
                        symbol,
                        len: depth as u8,
                    };
                    self.lut[start..start + (1usize << shift)].fill(entry);
                }
                Child::Node(node) if depth == lut_bits => {
                    self.lut[code as usize] = LutEntry::Partial { node };
                }
                Child::Node(node) => {
                    let children = self.nodes[node as usize].children;
                    stack.push((children[1], (code << 1) | 1, depth + 1));
                    stack.push((children[0], code << 1, depth + 1));
                }
            }
        }
    }

    #[inline]
    pub fn alphabet_size(&self) -> u32 {
        self.size
    }

    #[inline]
    pub fn min_len(&self) -> u32 {
        self.min_len
    }

    #[inline]
    pub fn max_len(&self) -> u32 {
        self.max_len
    }

    #[inline]
    pub fn code(&self, symbol: u32) -> Code {
        self.codes[symbol as usize]
    }

    /// Code length of `symbol` in bits.
    #[inline]
    pub fn code_len(&self, symbol: u32) -> u32 {
        self.codes[symbol as usize].len
    }

    #[inline]
    pub fn encode(&self, w: &mut BitWriter, symbol: u32) {
        let c = self.codes[symbol as usize];
        w.put_bits(c.code, c.len);
    }

    fn walk(&self, r: &mut BitReader<'_>, mut node: u32) -> Option<u32> {
        loop {
            let bit = r.get_bit()? as usize;
            match self.nodes.get(node as usize)?.children[bit] {
                Child::Leaf(symbol) => return Some(symbol),
                Child::Node(n) => node = n,
            }
        }
    }

    /// Plain bit-by-bit decode from the root.
    pub fn decode_slow(&self, r: &mut BitReader<'_>) -> Option<u32> {
        match self.root {
            Child::Leaf(symbol) => Some(symbol),
            Child::Node(n) => self.walk(r, n),
        }
    }

    /// Decode using the `min_len` shortcut table, then walk.
    pub fn decode_fast(&self, r: &mut BitReader<'_>) -> Option<u32> {
        if self.max_len == 0 {
            return self.decode_slow(r);
        }
        let prefix = r.get_bits(self.min_len)?;
        match self.shortcut[prefix as usize] {
            Child::Leaf(symbol) => Some(symbol),
            Child::Node(n) => self.walk(r, n),
        }
    }

    /// Decode using the windowed lookup table, walking past the window for
    /// codes longer than it.
    pub fn decode_lut(&self, r: &mut BitReader<'_>) -> Option<u32> {
        if self.max_len == 0 {
            return self.decode_slow(r);
        }
        match self.lut[r.peek_bits(self.lut_bits) as usize] {
            LutEntry::Symbol { symbol, len } => {
                r.consume(u32::from(len));
                if r.is_overrun() {
                    return None;
                }
                Some(symbol)
            }
            LutEntry::Partial { node } => {
                r.consume(self.lut_bits);
                if r.is_overrun() {
                    return None;
                }
                self.walk(r, node)
            }
        }
    }

    /// Serialize alphabet size, length bounds and the preorder tree shape.
    pub fn store_tree(&self) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.put_u32(self.size);
        w.put_byte(self.min_len as u8);
        w.put_byte(self.max_len as u8);

        let id_bits = bits_used(u64::from(self.size.saturating_sub(1)));
        let mut stack = vec![self.root];
        while let Some(child) = stack.pop() {
            match child {
                Child::Leaf(symbol) => {
                    w.put_bit(true);
                    w.put_bits(symbol, id_bits);
                }
                Child::Node(n) => {
                    w.put_bit(false);
                    let children = self.nodes[n as usize].children;
                    stack.push(children[1]);
                    stack.push(children[0]);
                }
            }
        }
        w.into_bytes()
    }

    pub fn load_tree(data: &[u8]) -> Result<Self> {
        let mut r = BitReader::new(data);
        let size = r.get_u32().context("truncated prefix-code header")?;
        let min_len = u32::from(r.get_byte().context("truncated prefix-code header")?);
        let max_len = u32::from(r.get_byte().context("truncated prefix-code header")?);
        if size == 0 {
            bail!("prefix code over an empty alphabet");
        }
        if max_len > MAX_CODE_LEN {
            bail!("stored prefix code length {max_len} exceeds the {MAX_CODE_LEN}-bit limit");
        }

        let id_bits = bits_used(u64::from(size - 1));
        let mut nodes = Vec::new();
        let root = Self::read_subtree(&mut r, size, id_bits, &mut nodes, 0)?;

        let hc = Self::from_tree(size, nodes, root)?;
        if hc.min_len != min_len || hc.max_len != max_len {
            bail!(
                "prefix code lengths disagree with header ({}..{} vs {}..{})",
                hc.min_len,
                hc.max_len,
                min_len,
                max_len
            );
        }
        Ok(hc)
    }

    fn read_subtree(
        r: &mut BitReader<'_>,
        size: u32,
        id_bits: u32,
        nodes: &mut Vec<Node>,
        depth: u32,
    ) -> Result<Child> {
        if depth > MAX_CODE_LEN {
            bail!("prefix-code tree deeper than {MAX_CODE_LEN}");
        }
        let is_leaf = r.get_bit().context("truncated prefix-code tree")?;
        if is_leaf {
            let symbol = r.get_bits(id_bits).context("truncated prefix-code tree")?;
            if symbol >= size {
                bail!("prefix-code leaf {symbol} outside alphabet of {size}");
            }
            return Ok(Child::Leaf(symbol));
        }
        let slot = nodes.len();
        nodes.push(Node {
            children: [Child::Leaf(0); 2],
        });
        let left = Self::read_subtree(r, size, id_bits, nodes, depth + 1)?;
        let right = Self::read_subtree(r, size, id_bits, nodes, depth + 1)?;
        nodes[slot].children = [left, right];
        Ok(Child::Node(slot as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_all(hc: &HuffmanCode, symbols: &[u32]) -> Vec<u8> {
        let mut w = BitWriter::new();
        for &s in symbols {
            hc.encode(&mut w, s);
        }
        w.into_bytes()
    }

    #[test]
    fn test_skewed_frequencies_get_short_codes() {
        let hc = HuffmanCode::from_frequencies(&[100, 1, 1, 50], true).unwrap();
        assert_eq!(hc.code_len(0), 1);
        assert!(hc.code_len(3) <= hc.code_len(1));
        assert_eq!(hc.max_len(), 3);
    }

    #[test]
    fn test_equal_frequencies_break_ties_by_symbol() {
        let a = HuffmanCode::from_frequencies(&[5, 5, 5, 5], false).unwrap();
        let b = HuffmanCode::from_frequencies(&[5, 5, 5, 5], false).unwrap();
        for s in 0..4 {
            assert_eq!(a.code(s), b.code(s));
            assert_eq!(a.code_len(s), 2);
        }
        // the two lowest ids are merged first and land under the same parent
        assert_eq!(a.code(0).code >> 1, a.code(1).code >> 1);
    }

    #[test]
    fn test_store_load_reproduces_codes() {
        let freqs: Vec<u32> = (0..300u32).map(|i| (i * 7919) % 97).collect();
        let hc = HuffmanCode::from_frequencies(&freqs, true).unwrap();
        let loaded = HuffmanCode::load_tree(&hc.store_tree()).unwrap();
        for (s, &f) in freqs.iter().enumerate() {
            if f > 0 {
                assert_eq!(hc.code(s as u32), loaded.code(s as u32), "symbol {s}");
            }
        }
        assert_eq!(hc.min_len(), loaded.min_len());
        assert_eq!(hc.max_len(), loaded.max_len());
    }

    #[test]
    fn test_compact_drops_unused_symbols() {
        let mut freqs = vec![0u32; 256];
        freqs[10] = 3;
        freqs[200] = 9;
        let hc = HuffmanCode::from_frequencies(&freqs, true).unwrap();
        assert_eq!(hc.code_len(10), 1);
        assert_eq!(hc.code_len(200), 1);
        assert_eq!(hc.code_len(0), 0);
    }

    #[test]
    fn test_single_used_symbol_keeps_two_leaves() {
        let mut freqs = vec![0u32; 16];
        freqs[7] = 42;
        let hc = HuffmanCode::from_frequencies(&freqs, true).unwrap();
        assert_eq!(hc.code_len(7), 1);
        let data = encode_all(&hc, &[7, 7, 7]);
        let mut r = BitReader::new(&data);
        for _ in 0..3 {
            assert_eq!(hc.decode_lut(&mut r), Some(7));
        }
    }

    #[test]
    fn test_single_symbol_alphabet_uses_no_bits() {
        let hc = HuffmanCode::from_frequencies(&[12], true).unwrap();
        assert_eq!(hc.max_len(), 0);
        assert_eq!(hc.min_len(), 0);
        let loaded = HuffmanCode::load_tree(&hc.store_tree()).unwrap();
        let empty: [u8; 0] = [];
        let mut r = BitReader::new(&empty);
        assert_eq!(loaded.decode_lut(&mut r), Some(0));
        assert_eq!(loaded.decode_fast(&mut r), Some(0));
    }

    #[test]
    fn test_all_decoders_agree_up_to_31_bits() {
        // powers of two give a maximally unbalanced tree
        let freqs: Vec<u32> = (0..32).map(|i| 1u32 << i).collect();
        let hc = HuffmanCode::from_frequencies(&freqs, true).unwrap();
        assert_eq!(hc.max_len(), 31);

        let symbols: Vec<u32> = (0..32).chain((0..32).rev()).collect();
        let data = encode_all(&hc, &symbols);
        let loaded = HuffmanCode::load_tree(&hc.store_tree()).unwrap();

        let mut slow = BitReader::new(&data);
        let mut fast = BitReader::new(&data);
        let mut lut = BitReader::new(&data);
        for &s in &symbols {
            assert_eq!(loaded.decode_slow(&mut slow), Some(s));
            assert_eq!(loaded.decode_fast(&mut fast), Some(s));
            assert_eq!(loaded.decode_lut(&mut lut), Some(s));
        }
    }

    #[test]
    fn test_rejects_codes_longer_than_31_bits() {
        let mut freqs = vec![1u32];
        freqs.extend((0..32).map(|i| 1u32 << i));
        let err = HuffmanCode::from_frequencies(&freqs, true).unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_decode_truncated_stream_fails() {
        let hc = HuffmanCode::from_frequencies(&[1, 1, 1, 1, 1, 1, 1, 1], true).unwrap();
        let data = encode_all(&hc, &[5]);
        let mut r = BitReader::new(&data[..0]);
        assert_eq!(hc.decode_lut(&mut r), None);
        let mut r = BitReader::new(&data[..0]);
        assert_eq!(hc.decode_fast(&mut r), None);
    }

    #[test]
    fn test_load_rejects_garbage() {
        assert!(HuffmanCode::load_tree(&[0, 0]).is_err());
        let mut w = BitWriter::new();
        w.put_u32(4);
        w.put_byte(1);
        w.put_byte(40);
        assert!(HuffmanCode::load_tree(&w.into_bytes()).is_err());
    }
}
