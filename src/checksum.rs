//! Block-granular image checksums
//!
//! The digest is computed over the logical (guest-visible) byte stream in
//! fixed-size blocks: each block is hashed, and the root hash consumes the
//! per-block digests. Two images with the same logical content therefore
//! produce the same digest regardless of on-disk format, compression, or
//! archive container.

use crate::error::{Error, Result};
use crate::source::{read_range, LogicalReader};
use blake2::digest::{Update as _, VariableOutput};
use blake2::Blake2bVar;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::str::FromStr;

pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Sha1,
    Sha256,
    Blake2b,
    Blake3,
}

impl Default for Algorithm {
    fn default() -> Self {
        Algorithm::Sha1
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha1" => Ok(Algorithm::Sha1),
            "sha256" => Ok(Algorithm::Sha256),
            "blake2b" => Ok(Algorithm::Blake2b),
            "blake3" => Ok(Algorithm::Blake3),
            other => Err(Error::InvalidArgument(format!(
                "unknown checksum algorithm {other:?}"
            ))),
        }
    }
}

enum Ctx {
    Sha1(Sha1),
    Sha256(Sha256),
    Blake2b(Blake2bVar),
    Blake3(Box<blake3::Hasher>),
}

impl Ctx {
    fn new(algorithm: Algorithm, digest_size: Option<usize>) -> Result<Self> {
        match (algorithm, digest_size) {
            (Algorithm::Sha1, None) => Ok(Ctx::Sha1(Sha1::new())),
            (Algorithm::Sha256, None) => Ok(Ctx::Sha256(Sha256::new())),
            (Algorithm::Blake3, None) => Ok(Ctx::Blake3(Box::new(blake3::Hasher::new()))),
            (Algorithm::Blake2b, size) => {
                let size = size.unwrap_or(64);
                Blake2bVar::new(size)
                    .map(Ctx::Blake2b)
                    .map_err(|_| Error::InvalidArgument(format!("bad digest size {size}")))
            }
            (_, Some(_)) => Err(Error::InvalidArgument(
                "digest size is only meaningful for variable-length algorithms".into(),
            )),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Ctx::Sha1(h) => Digest::update(h, data),
            Ctx::Sha256(h) => Digest::update(h, data),
            Ctx::Blake2b(h) => h.update(data),
            Ctx::Blake3(h) => {
                h.update(data);
            }
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            Ctx::Sha1(h) => h.finalize().to_vec(),
            Ctx::Sha256(h) => h.finalize().to_vec(),
            Ctx::Blake2b(h) => {
                let mut out = vec![0u8; h.output_size()];
                h.finalize_variable(&mut out)
                    .expect("output buffer sized from the context");
                out
            }
            Ctx::Blake3(h) => h.finalize().as_bytes().to_vec(),
        }
    }
}

/// Streaming block-hash state. Feed the logical stream in order; the last
/// block may be short.
pub struct BlockHasher {
    algorithm: Algorithm,
    digest_size: Option<usize>,
    block_size: usize,
    root: Ctx,
    pending: Vec<u8>,
}

impl BlockHasher {
    pub fn new(
        block_size: usize,
        algorithm: Algorithm,
        digest_size: Option<usize>,
    ) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::InvalidArgument("block size must be positive".into()));
        }
        Ok(BlockHasher {
            algorithm,
            digest_size,
            block_size,
            root: Ctx::new(algorithm, digest_size)?,
            pending: Vec::new(),
        })
    }

    pub fn update(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let take = (self.block_size - self.pending.len()).min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.pending.len() == self.block_size {
                self.fold_block()?;
            }
        }
        Ok(())
    }

    fn fold_block(&mut self) -> Result<()> {
        let mut block = Ctx::new(self.algorithm, self.digest_size)?;
        block.update(&self.pending);
        self.root.update(&block.finalize());
        self.pending.clear();
        Ok(())
    }

    pub fn finalize(mut self) -> Result<String> {
        if !self.pending.is_empty() {
            self.fold_block()?;
        }
        let digest = self.root.finalize();
        Ok(hex(&digest))
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Checksum the whole logical content of a source.
pub fn checksum_reader(
    reader: &dyn LogicalReader,
    block_size: usize,
    algorithm: Algorithm,
    digest_size: Option<usize>,
) -> Result<String> {
    let mut hasher = BlockHasher::new(block_size, algorithm, digest_size)?;
    read_range(reader, 0, reader.size(), block_size, |chunk| {
        hasher.update(chunk)
    })?;
    hasher.finalize()
}
