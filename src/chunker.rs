//! Cut streams into blocks, at fixed offsets or content-defined boundaries.
//!
//! The dynamic mode picks boundaries from the payload bytes themselves
//! (FastCDC), so identical content re-chunks identically no matter what
//! preceded it in the stream - which is what makes dedup across versions
//! and writers effective. Splitter parameters are part of the repository
//! format and must never change after creation: a different mask would
//! re-cut (and re-id) nearly every block in the repository.

use std::io::Read;

use fastcdc::v2020::StreamCDC;
use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitterMode {
    /// A block every `max_size` bytes.
    Fixed,
    /// Content-defined boundaries, expected size `avg_size`,
    /// clamped to `[min_size, max_size]`.
    Dynamic,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitterParams {
    pub mode: SplitterMode,
    pub min_size: u32,
    pub avg_size: u32,
    pub max_size: u32,
}

impl Default for SplitterParams {
    fn default() -> Self {
        Self {
            mode: SplitterMode::Dynamic,
            min_size: 512 * 1024,
            avg_size: 1024 * 1024,
            max_size: 8 * 1024 * 1024,
        }
    }
}

impl SplitterParams {
    pub fn fixed(max_size: u32) -> Self {
        Self {
            mode: SplitterMode::Fixed,
            min_size: max_size,
            avg_size: max_size,
            max_size,
        }
    }

    /// Sanity-check bounds before use; loaded format documents go through
    /// here so a bad repository fails early instead of mid-stream.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::invalid("splitter", "max_size must be positive"));
        }
        if self.mode == SplitterMode::Dynamic {
            // FastCDC's own limits, plus ordering.
            if self.min_size < 64 || self.avg_size < 256 || self.max_size < 1024 {
                return Err(Error::invalid("splitter", "sizes too small for chunking"));
            }
            if !(self.min_size <= self.avg_size && self.avg_size <= self.max_size) {
                return Err(Error::invalid("splitter", "requires min <= avg <= max"));
            }
        }
        Ok(())
    }

    /// Lazily cut `reader` into chunks.
    pub fn split<R: Read>(&self, reader: R) -> Chunks<R> {
        match self.mode {
            SplitterMode::Fixed => Chunks(Inner::Fixed {
                reader,
                max: self.max_size as usize,
                done: false,
            }),
            SplitterMode::Dynamic => Chunks(Inner::Dynamic(StreamCDC::new(
                reader,
                self.min_size,
                self.avg_size,
                self.max_size,
            ))),
        }
    }
}

pub struct Chunks<R: Read>(Inner<R>);

enum Inner<R: Read> {
    Fixed {
        reader: R,
        max: usize,
        done: bool,
    },
    Dynamic(StreamCDC<R>),
}

impl<R: Read> Iterator for Chunks<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.0 {
            Inner::Fixed { reader, max, done } => {
                if *done {
                    return None;
                }
                let mut buf = vec![0u8; *max];
                let mut filled = 0;
                while filled < *max {
                    match reader.read(&mut buf[filled..]) {
                        Ok(0) => {
                            *done = true;
                            break;
                        }
                        Ok(n) => filled += n,
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => return Some(Err(e.into())),
                    }
                }
                if filled == 0 {
                    return None;
                }
                buf.truncate(filled);
                Some(Ok(buf))
            }
            Inner::Dynamic(cdc) => match cdc.next()? {
                Ok(chunk) => Some(Ok(chunk.data)),
                Err(fastcdc::v2020::Error::IoError(e)) => Some(Err(e.into())),
                Err(e) => Some(Err(Error::corrupt(format!("chunker failed: {e}")))),
            },
        }
    }
}
