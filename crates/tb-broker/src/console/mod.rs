//! Console multiplexing
//!
//! Every (target, console) pair is a byte stream tagged with a generation
//! `g` and a byte count `b`. Offsets are only meaningful within one
//! generation: whenever the stream restarts, `g` grows and `b` drops back
//! to zero, and clients that see a new `g` start reading again from 0.
//!
//! Only the newest bytes of a generation are kept, up to the configured
//! buffer limit. `b` still counts every byte of the generation.

mod multiplexer;
mod stream;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use multiplexer::{ConsoleLimits, ConsoleMultiplexer};

/// Result of a console read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleChunk {
    /// Current generation
    pub generation: u64,
    /// Current byte count; the highest readable offset
    pub size: u64,
    /// Offset of the first byte of `data`; later than the requested one
    /// when those bytes were already dropped from memory
    pub offset: u64,
    pub enabled: bool,
    /// Bytes starting at the requested offset; empty on a generation
    /// mismatch, on a disabled console or past the end of the stream
    pub data: Bytes,
}

impl ConsoleChunk {
    /// Value of the `"<generation> <offset>"` stream position header
    pub fn position(&self) -> String {
        format!("{} {}", self.generation, self.size)
    }
}

/// Stream position and availability of a console
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleInfo {
    pub name: String,
    pub enabled: bool,
    pub generation: u64,
    pub size: u64,
}
