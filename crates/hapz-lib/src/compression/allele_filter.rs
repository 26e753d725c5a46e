//! Allele counting over decoded bit-planes and AC/AF row filtering.

use crate::error::QueryError;

/// Per-haplotype allele derived from the two planes of a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Allele {
    Ref,
    Alt,
    Other,
    Missing,
}

impl Allele {
    /// Plane bits `(plane0, plane1)`: 00 ref, 01 alt, 11 other, 10 missing.
    #[inline]
    pub fn from_planes(plane0: bool, plane1: bool) -> Self {
        match (plane0, plane1) {
            (false, false) => Allele::Ref,
            (false, true) => Allele::Alt,
            (true, true) => Allele::Other,
            (true, false) => Allele::Missing,
        }
    }
}

/// Caller-supplied window on allele count and frequency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlleleWindow {
    pub min_ac: u32,
    pub max_ac: u32,
    pub min_af: f64,
    pub max_af: f64,
}

impl Default for AlleleWindow {
    fn default() -> Self {
        Self {
            min_ac: 0,
            max_ac: u32::MAX,
            min_af: 0.0,
            max_af: 1.0,
        }
    }
}

impl AlleleWindow {
    pub fn is_unbounded(&self) -> bool {
        *self == Self::default()
    }

    /// Fold the frequency bounds into an AC window for `an` haplotypes,
    /// keeping whichever bound is stricter.
    pub fn resolve(&self, an: u32) -> Result<AcRange, QueryError> {
        let mut min_ac = self.min_ac;
        let mut max_ac = self.max_ac;
        if self.min_af > 0.0 {
            let from_af = (self.min_af * f64::from(an)).ceil();
            min_ac = min_ac.max(from_af.min(f64::from(u32::MAX)) as u32);
        }
        if self.max_af < 1.0 {
            let from_af = (self.max_af * f64::from(an)).floor().max(0.0);
            max_ac = max_ac.min(from_af as u32);
        }
        if min_ac > max_ac {
            return Err(QueryError::InvalidAlleleWindow { min_ac, max_ac });
        }
        Ok(AcRange { min_ac, max_ac })
    }
}

/// Inclusive AC bounds after resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcRange {
    pub min_ac: u32,
    pub max_ac: u32,
}

impl AcRange {
    #[inline]
    pub fn contains(&self, ac: u32) -> bool {
        (self.min_ac..=self.max_ac).contains(&ac)
    }
}

/// `(AC, AN)` for `n_haps` haplotypes packed MSB-first in both planes.
/// AC counts `Alt` haplotypes; AN is the number of haplotypes.
pub fn count_alleles(planes: &[Vec<u8>; 2], n_haps: usize) -> (u32, u32) {
    let full = n_haps / 8;
    let mut ac: u32 = planes[0][..full]
        .iter()
        .zip(&planes[1][..full])
        .map(|(&a, &b)| (!a & b).count_ones())
        .sum();
    let rem = n_haps % 8;
    if rem > 0 {
        let mask = !(0xffu8 >> rem);
        ac += (!planes[0][full] & planes[1][full] & mask).count_ones();
    }
    (ac, n_haps as u32)
}
