use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

/// I/O buffer size for raw vector files
const IO_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Plain file or stdin, both buffered.
pub enum VectorInput {
    File(BufReader<File>),
    Stdin(BufReader<std::io::Stdin>),
}

impl Read for VectorInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            VectorInput::File(r) => r.read(buf),
            VectorInput::Stdin(r) => r.read(buf),
        }
    }
}

/// Open a raw vector file, or stdin if path is `-`.
pub fn open_input(path: &Path) -> Result<VectorInput> {
    if crate::cli::is_stdio_path(path) {
        return Ok(VectorInput::Stdin(BufReader::with_capacity(IO_BUFFER_SIZE, std::io::stdin())));
    }
    let file = File::open(path).with_context(|| format!("Failed to open input file: {:?}", path))?;
    Ok(VectorInput::File(BufReader::with_capacity(IO_BUFFER_SIZE, file)))
}

/// Create an output sink, or stdout if path is `-`.
pub fn create_output(path: &Path) -> Result<Box<dyn Write>> {
    if crate::cli::is_stdio_path(path) {
        return Ok(Box::new(BufWriter::with_capacity(IO_BUFFER_SIZE, std::io::stdout().lock())));
    }
    let file = File::create(path).with_context(|| format!("Failed to create output file: {:?}", path))?;
    Ok(Box::new(BufWriter::with_capacity(IO_BUFFER_SIZE, file)))
}

/// Reads fixed-length haplotype vectors in blocks.
///
/// Every vector is checked for set padding bits (bits past the last
/// haplotype in the final byte), which indicate a sample-count or ploidy
/// mismatch between the caller's layout and the data.
pub struct VectorReader<R: Read> {
    inner: R,
    vec_len: usize,
    padding_mask: u8,
    vectors_read: u64,
}

impl<R: Read> VectorReader<R> {
    pub fn new(inner: R, vec_len: usize, padding_mask: u8) -> Self {
        Self {
            inner,
            vec_len,
            padding_mask,
            vectors_read: 0,
        }
    }

    pub fn vectors_read(&self) -> u64 {
        self.vectors_read
    }

    /// Read up to `max_vecs` vectors. An empty result means end of input.
    pub fn read_block(&mut self, max_vecs: usize) -> Result<Vec<u8>> {
        let want = max_vecs * self.vec_len;
        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("Failed to read vector input"),
            }
        }
        buf.truncate(filled);
        if filled % self.vec_len != 0 {
            bail!(
                "input ends with a partial vector: {} trailing bytes after {} vectors of {} bytes",
                filled % self.vec_len,
                self.vectors_read + (filled / self.vec_len) as u64,
                self.vec_len
            );
        }
        if self.padding_mask != 0 {
            for (k, vec) in buf.chunks_exact(self.vec_len).enumerate() {
                if vec[self.vec_len - 1] & self.padding_mask != 0 {
                    bail!(
                        "vector {} sets bits past the last haplotype; check the sample count and ploidy",
                        self.vectors_read + k as u64
                    );
                }
            }
        }
        self.vectors_read += (filled / self.vec_len) as u64;
        Ok(buf)
    }
}
