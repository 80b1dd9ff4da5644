//! 🫁 Zipper — a gzip compressor that keeps its output buffer between calls.
//!
//! Once warm it stops allocating: the encoder writes into the same `Vec` every time.
//! One zipper per builder / flusher; they are not shared.

use std::io::Write;

use flate2::Compression;
use flate2::write::GzEncoder;

#[derive(Debug)]
pub struct Zipper {
    out: Vec<u8>,
    level: Compression,
}

impl Default for Zipper {
    fn default() -> Self {
        Self::new(Compression::default())
    }
}

impl Zipper {
    pub fn new(level: Compression) -> Self {
        Self { out: Vec::new(), level }
    }

    /// 🗜️ Compresses `data`. The returned slice is valid until the next call.
    pub fn zip(&mut self, data: &[u8]) -> std::io::Result<&[u8]> {
        let mut out = std::mem::take(&mut self.out);
        out.clear();
        let mut encoder = GzEncoder::new(out, self.level);
        encoder.write_all(data)?;
        self.out = encoder.finish()?;
        Ok(&self.out)
    }
}
