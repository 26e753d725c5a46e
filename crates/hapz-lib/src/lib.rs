//! hapz: compression of population-scale haplotype bit-vectors.
//!
//! Input is a sequence of fixed-length vectors, two bit-planes per site,
//! one bit per haplotype. [`compression::compress_stream`] turns it into an
//! archive; [`compression::Archive`] and [`compression::DecodeSession`]
//! decode any site range or sample subset back out of it.

pub mod cli;
pub mod compression;
pub mod error;
pub mod io;

pub use error::QueryError;
