//! Per-block haplotype column reordering.
//!
//! Columns are summarised by a sketch over a random sample of the block's
//! non-empty vectors, then chained greedily so that each column is followed
//! by its nearest (Hamming) remaining neighbour. Similar columns end up
//! adjacent, which lengthens the byte-level matches found by the block
//! matcher.

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use super::settings::{CompressionSettings, PART_TRIALS};

/// Base seed for vector sampling; mixed with the block id.
pub const PERMUTATION_SEED: u64 = 0x6861_707a_7065_726d;

const GUARD_DENSITY: i64 = 1 << 29;
const INITIAL_BEST_COST: i64 = 1 << 28;

#[inline]
pub(crate) fn hap_bit(vec: &[u8], h: usize) -> bool {
    vec[h / 8] & (0x80 >> (h % 8)) != 0
}

#[inline]
pub(crate) fn set_hap_bit(vec: &mut [u8], h: usize) {
    vec[h / 8] |= 0x80 >> (h % 8);
}

fn popcount(bytes: &[u8]) -> u64 {
    bytes.iter().map(|b| u64::from(b.count_ones())).sum()
}

/// Column sketches over sampled vectors, `words` u64 per haplotype.
struct Sketches {
    words: usize,
    bits: Vec<u64>,
    ones: Vec<i64>,
}

impl Sketches {
    fn build(block: &[u8], n_haps: usize, vec_len: usize, sampled: &[usize]) -> Self {
        let words = sampled.len().div_ceil(64).max(1);
        let mut bits = vec![0u64; n_haps * words];
        for (k, &v) in sampled.iter().enumerate() {
            let vec = &block[v * vec_len..(v + 1) * vec_len];
            for (j, &byte) in vec.iter().enumerate() {
                if byte == 0 {
                    continue;
                }
                for b in 0..8 {
                    let h = j * 8 + b;
                    if h < n_haps && byte & (0x80 >> b) != 0 {
                        bits[h * words + k / 64] |= 1u64 << (k % 64);
                    }
                }
            }
        }
        let ones = (0..n_haps)
            .map(|h| {
                bits[h * words..(h + 1) * words]
                    .iter()
                    .map(|w| i64::from(w.count_ones()))
                    .sum()
            })
            .collect();
        Self { words, bits, ones }
    }

    /// Hamming distance between two columns, stopping early at `limit`.
    fn distance(&self, a: usize, b: usize, limit: i64) -> i64 {
        let sa = &self.bits[a * self.words..(a + 1) * self.words];
        let sb = &self.bits[b * self.words..(b + 1) * self.words];
        let mut cost = 0i64;
        for (x, y) in sa.iter().zip(sb) {
            cost += i64::from((x ^ y).count_ones());
            if cost >= limit {
                break;
            }
        }
        cost
    }
}

/// Greedy nearest-neighbour chain over columns, starting from column 0.
fn chain_columns(sketches: &Sketches, n_haps: usize) -> Vec<usize> {
    let lo = n_haps;
    let hi = n_haps + 1;
    let mut density = sketches.ones.clone();
    density.push(-GUARD_DENSITY);
    density.push(GUARD_DENSITY);

    let mut sorted: Vec<usize> = (0..n_haps).collect();
    sorted.sort_by_key(|&h| (density[h], h));

    // doubly linked list in density order between two guards
    let mut prev = vec![lo; n_haps + 2];
    let mut next = vec![hi; n_haps + 2];
    let mut last = lo;
    for &h in &sorted {
        next[last] = h;
        prev[h] = last;
        last = h;
    }
    next[last] = hi;
    prev[hi] = last;

    let mut order = Vec::with_capacity(n_haps);
    let mut p = 0usize;
    order.push(p);
    while order.len() < n_haps {
        let mut up = next[p];
        let mut down = prev[p];
        let mut best_cost = INITIAL_BEST_COST;
        let mut best_p = None;
        loop {
            let dif_up = density[up] - density[p];
            let dif_down = density[p] - density[down];
            if dif_up.min(dif_down) >= best_cost {
                break;
            }
            let cand = if dif_up < dif_down {
                let c = up;
                up = next[up];
                c
            } else {
                let c = down;
                down = prev[down];
                c
            };
            let cost = sketches.distance(p, cand, best_cost);
            if cost < best_cost {
                best_cost = cost;
                best_p = Some(cand);
            }
        }

        next[prev[p]] = next[p];
        prev[next[p]] = prev[p];
        match best_p {
            Some(b) => {
                order.push(b);
                p = b;
            }
            None => break,
        }
    }
    order.truncate(n_haps);
    order
}

/// Compute the column permutation for one block: `perm[original] = new`.
pub fn optimize_permutation(block: &[u8], settings: &CompressionSettings, block_id: u32) -> Vec<u32> {
    let n_haps = settings.n_haplotypes as usize;
    let vec_len = settings.vec_len;
    if !settings.permute || n_haps < 2 {
        return (0..n_haps as u32).collect();
    }

    let n_vecs = block.len() / vec_len;
    let mut sampled: Vec<usize> = (0..n_vecs)
        .filter(|&v| block[v * vec_len..(v + 1) * vec_len].iter().any(|&b| b != 0))
        .collect();
    let mut rng = StdRng::seed_from_u64(PERMUTATION_SEED ^ u64::from(block_id));
    sampled.shuffle(&mut rng);
    sampled.truncate(PART_TRIALS);
    sampled.sort_unstable();

    let sketches = Sketches::build(block, n_haps, vec_len, &sampled);
    let order = chain_columns(&sketches, n_haps);

    let mut perm = vec![0u32; n_haps];
    for (new, &old) in order.iter().enumerate() {
        perm[old] = new as u32;
    }
    debug!(block_id, sampled = sampled.len(), "column permutation computed");
    perm
}

/// Rewrite every vector of `block` so that bit `perm[x]` of the result is
/// bit `x` of the input.
pub fn apply_permutation(block: &mut [u8], perm: &[u32], vec_len: usize) -> Result<()> {
    let before = popcount(block);
    let mut scratch = vec![0u8; vec_len];
    for vec in block.chunks_exact_mut(vec_len) {
        if vec.iter().all(|&b| b == 0) {
            continue;
        }
        scratch.fill(0);
        for (x, &to) in perm.iter().enumerate() {
            if hap_bit(vec, x) {
                set_hap_bit(&mut scratch, to as usize);
            }
        }
        vec.copy_from_slice(&scratch);
    }
    let after = popcount(block);
    if before != after {
        bail!("permutation changed the block population count ({before} -> {after})");
    }
    Ok(())
}

/// Optimise and apply the permutation for one block, returning it.
pub fn permute_block(block: &mut [u8], settings: &CompressionSettings, block_id: u32) -> Result<Vec<u32>> {
    let perm = optimize_permutation(block, settings, block_id);
    let identity = perm.iter().enumerate().all(|(i, &p)| i as u32 == p);
    if !identity {
        apply_permutation(block, &perm, settings.vec_len)?;
    }
    Ok(perm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::CompressConfig;

    fn settings(n_haps: u32, permute: bool) -> CompressionSettings {
        CompressionSettings::from_config(&CompressConfig {
            n_samples: n_haps,
            ploidy: 1,
            permute,
            ..CompressConfig::default()
        })
        .unwrap()
    }

    /// Two column patterns: even haplotypes follow `a`, odd ones follow `b`.
    fn two_pattern_block(n_vecs: usize) -> Vec<u8> {
        let mut block = Vec::new();
        for k in 0..n_vecs {
            let a = k % 3 == 0;
            let b = k % 2 == 0;
            let mut vec = vec![0u8; 2];
            for h in 0..16 {
                if (h % 2 == 0 && a) || (h % 2 == 1 && b) {
                    set_hap_bit(&mut vec, h);
                }
            }
            block.extend(vec);
        }
        block
    }

    #[test]
    fn test_permutation_is_bijection() {
        let s = settings(37, true);
        let mut block = Vec::new();
        for k in 0..50u32 {
            block.extend((0..s.vec_len as u32).map(|j| (k.wrapping_mul(31) ^ j.wrapping_mul(17)) as u8));
        }
        for v in block.chunks_exact_mut(s.vec_len) {
            let last = v.len() - 1;
            v[last] &= !s.padding_mask();
        }
        let perm = optimize_permutation(&block, &s, 0);
        let mut seen = vec![false; 37];
        for &p in &perm {
            assert!(!seen[p as usize]);
            seen[p as usize] = true;
        }
        assert!(seen.iter().all(|&x| x));
    }

    #[test]
    fn test_similar_columns_become_adjacent() {
        let s = settings(16, true);
        let mut block = two_pattern_block(40);
        let perm = permute_block(&mut block, &s, 3).unwrap();
        for h in (0..16).step_by(2) {
            assert!(perm[h] < 8, "haplotype {h} placed at {}", perm[h]);
        }
        for vec in block.chunks_exact(2) {
            assert!(vec.iter().all(|&b| b == 0 || b == 0xff), "{vec:?}");
        }
    }

    #[test]
    fn test_population_count_preserved() {
        let s = settings(16, true);
        let original = two_pattern_block(40);
        let mut block = original.clone();
        permute_block(&mut block, &s, 1).unwrap();
        assert_eq!(popcount(&block), popcount(&original));
    }

    #[test]
    fn test_apply_moves_bits() {
        let mut block = vec![0b1000_0000u8, 0b0100_0000];
        let perm: Vec<u32> = vec![15, 14, 13, 12, 11, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1, 0];
        apply_permutation(&mut block, &perm, 2).unwrap();
        assert_eq!(block, vec![0b0000_0010, 0b0000_0001]);
    }

    #[test]
    fn test_disabled_gives_identity() {
        let s = settings(16, false);
        let original = two_pattern_block(10);
        let mut block = original.clone();
        let perm = permute_block(&mut block, &s, 0).unwrap();
        assert_eq!(perm, (0..16).collect::<Vec<u32>>());
        assert_eq!(block, original);
    }

    #[test]
    fn test_deterministic_per_block_id() {
        let s = settings(16, true);
        let block = two_pattern_block(40);
        assert_eq!(optimize_permutation(&block, &s, 5), optimize_permutation(&block, &s, 5));
    }
}
