//! Format constants and the per-archive settings derived from configuration.

use anyhow::{bail, Result};

use super::bit_io::{bits_used, width_for};
use crate::cli::CompressConfig;

/// Default number of sites per block; a block holds two vectors per site.
pub const PART_SIZE: u32 = 3584;
/// Upper bound on vectors sampled for the permutation sketches.
pub const PART_TRIALS: usize = 3584;
/// Length of the per-offset hash key in bytes.
pub const HASH_KEY_LEN: usize = 5;
pub const MIN_ZERO_RUN_LEN: usize = 2;
pub const MIN_ONES_RUN_LEN: usize = 2;
/// Consecutive literals at or above this count are folded into one run token.
pub const MIN_LITERAL_RUN: usize = 20;
pub const MAX_LITERAL_RUN: usize = 252;
/// Unique vectors between absolute entries of the position index.
pub const FULL_POS_STEP: u64 = 1025;
/// High bits of a match offset that are entropy coded.
pub const MATCH_BITS_HUF: u32 = 8;
pub const MAX_ONES_GROUPS: u32 = 32;
/// Flag alphabet: five fixed token kinds plus `len + 3` for literal runs.
pub const FLAG_ALPHABET: usize = MAX_LITERAL_RUN + 4;

/// Settings shared by the block matcher and the archive encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionSettings {
    pub n_samples: u32,
    pub ploidy: u32,
    pub n_haplotypes: u32,
    pub vec_len: usize,
    pub max_no_vec_in_block: u32,
    pub max_depth: u32,
    pub ones_ranges: u32,
    pub match_pos_diff_bits: u32,
    pub copy_pos_diff_bits: u32,
    pub n_vec_history_parts: u32,
    pub n_vec_history_vecs: u32,
    pub bit_size_id: u32,
    pub bit_size_match_len: u32,
    pub bit_size_run_len: u32,
    pub bit_size_ones_group: u32,
    pub permute: bool,
}

impl CompressionSettings {
    pub fn from_config(config: &CompressConfig) -> Result<Self> {
        if config.n_samples == 0 {
            bail!("sample count must be positive");
        }
        if config.ploidy == 0 || config.ploidy > 255 {
            bail!("ploidy must be in 1..=255, got {}", config.ploidy);
        }
        if config.variants_per_block == 0 {
            bail!("variants per block must be positive");
        }
        if config.max_depth > u32::from(u8::MAX) {
            bail!("max depth must be at most {}, got {}", u8::MAX, config.max_depth);
        }
        if !(1..=MAX_ONES_GROUPS).contains(&config.ones_ranges) {
            bail!("ones ranges must be in 1..={MAX_ONES_GROUPS}, got {}", config.ones_ranges);
        }
        if !(1..=24).contains(&config.match_pos_diff_bits) {
            bail!("match position width must be in 1..=24, got {}", config.match_pos_diff_bits);
        }
        if !(1..=31).contains(&config.copy_pos_diff_bits) {
            bail!("copy position width must be in 1..=31, got {}", config.copy_pos_diff_bits);
        }

        let n_haplotypes = config
            .n_samples
            .checked_mul(config.ploidy)
            .ok_or_else(|| anyhow::anyhow!("haplotype count overflows"))?;
        let max_no_vec_in_block = config
            .variants_per_block
            .checked_mul(2)
            .ok_or_else(|| anyhow::anyhow!("block size overflows"))?;
        let vec_len = (n_haplotypes as usize).div_ceil(8);
        let run_bits = width_for(vec_len as u64);

        Ok(Self {
            n_samples: config.n_samples,
            ploidy: config.ploidy,
            n_haplotypes,
            vec_len,
            max_no_vec_in_block,
            max_depth: config.max_depth,
            ones_ranges: config.ones_ranges,
            match_pos_diff_bits: config.match_pos_diff_bits,
            copy_pos_diff_bits: config.copy_pos_diff_bits,
            n_vec_history_parts: 1 << config.match_pos_diff_bits,
            n_vec_history_vecs: 1 << config.copy_pos_diff_bits,
            bit_size_id: width_for(u64::from(max_no_vec_in_block)),
            bit_size_match_len: run_bits,
            bit_size_run_len: run_bits,
            bit_size_ones_group: bits_used(u64::from(config.ones_ranges - 1)),
            permute: config.permute,
        })
    }

    /// Convenience constructor with default tuning.
    pub fn for_samples(n_samples: u32, ploidy: u32) -> Result<Self> {
        Self::from_config(&CompressConfig {
            n_samples,
            ploidy,
            ..CompressConfig::default()
        })
    }

    /// Entropy-coded high part of a match offset.
    #[inline]
    pub fn match_huf_bits(&self) -> u32 {
        match_huf_bits(self.match_pos_diff_bits)
    }

    /// Density bucket of a vector.
    #[inline]
    pub fn ones_group(&self, vec: &[u8]) -> u32 {
        ones_group(vec, self.ones_ranges)
    }

    /// Bits past `n_haplotypes` in the last byte; they must stay clear.
    #[inline]
    pub fn padding_mask(&self) -> u8 {
        match self.n_haplotypes % 8 {
            0 => 0,
            used => 0xffu8 >> used,
        }
    }
}

#[inline]
pub(crate) fn match_huf_bits(match_pos_diff_bits: u32) -> u32 {
    match_pos_diff_bits.min(MATCH_BITS_HUF)
}

pub(crate) fn ones_group(vec: &[u8], ones_ranges: u32) -> u32 {
    let mut count: u64 = vec.iter().map(|b| u64::from(b.count_ones())).sum();
    count = count.saturating_sub(1);
    let range = ((vec.len() as u64 * 8) / u64::from(ones_ranges)).max(1);
    ((count / range) as u32).min(ones_ranges - 1)
}
