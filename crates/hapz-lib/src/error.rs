//! Typed errors for query-time failures.
//!
//! Everything fatal (configuration, I/O, corrupt archives) travels as
//! `anyhow::Error`; a `QueryError` means the request itself was out of
//! bounds and can be downcast by callers that want to report it.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("sample {index} out of range (archive holds {n_samples} samples)")]
    SampleOutOfRange { index: u32, n_samples: u32 },
    #[error("site range {start}..{end} outside archive of {n_sites} sites")]
    SiteRangeOutOfBounds { start: u64, end: u64, n_sites: u64 },
    #[error("sample subset is empty")]
    EmptySampleSet,
    #[error("allele window is empty: min AC {min_ac} > max AC {max_ac}")]
    InvalidAlleleWindow { min_ac: u32, max_ac: u32 },
}
