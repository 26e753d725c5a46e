pub mod vectors;

pub use vectors::{create_output, open_input, VectorInput, VectorReader};
