//! Compression mode table.
//!
//! A mode trades fidelity for memory and speed: a larger square resolution
//! yields more visual tokens, which can represent more text before the
//! compression ratio becomes lossy. The table is fixed at compile time and
//! looked up by [`ModeId`].
//!
//! | Mode  | Resolution | Visual tokens | Max text tokens | Memory | Safe ratio |
//! |-------|-----------:|--------------:|----------------:|-------:|-----------:|
//! | tiny  | 512        | 64            | 600             | 2 GB   | 9.4        |
//! | small | 640        | 100           | 900             | 4 GB   | 9.0        |
//! | base  | 1024       | 256           | 2500            | 8 GB   | 9.8        |
//! | large | 1280       | 400           | 4000            | 12 GB  | 10.0       |
//!
//! `large` is only reachable through an explicit override; auto-selection
//! never picks it.

use crate::error::OcrError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a compression mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeId {
    Tiny,
    Small,
    Base,
    Large,
}

/// Immutable configuration of one compression mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CompressionMode {
    pub id: ModeId,
    /// Square target resolution in pixels.
    pub resolution: u32,
    /// Visual tokens the encoder emits per page.
    pub vision_tokens: usize,
    /// Largest text-token count the mode represents safely.
    pub max_text_tokens: usize,
    /// Free accelerator memory required to run the mode, in GB.
    pub min_memory_gb: f64,
    /// `max_text_tokens / vision_tokens`, rounded down to one decimal.
    pub safe_ratio: f64,
}

const MODES: [CompressionMode; 4] = [
    CompressionMode {
        id: ModeId::Tiny,
        resolution: 512,
        vision_tokens: 64,
        max_text_tokens: 600,
        min_memory_gb: 2.0,
        safe_ratio: 9.4,
    },
    CompressionMode {
        id: ModeId::Small,
        resolution: 640,
        vision_tokens: 100,
        max_text_tokens: 900,
        min_memory_gb: 4.0,
        safe_ratio: 9.0,
    },
    CompressionMode {
        id: ModeId::Base,
        resolution: 1024,
        vision_tokens: 256,
        max_text_tokens: 2500,
        min_memory_gb: 8.0,
        safe_ratio: 9.8,
    },
    CompressionMode {
        id: ModeId::Large,
        resolution: 1280,
        vision_tokens: 400,
        max_text_tokens: 4000,
        min_memory_gb: 12.0,
        safe_ratio: 10.0,
    },
];

impl ModeId {
    /// The always-safe floor of the mode ladder.
    pub const FLOOR: ModeId = ModeId::Tiny;

    /// Every mode, smallest first.
    pub const ALL: [ModeId; 4] = [ModeId::Tiny, ModeId::Small, ModeId::Base, ModeId::Large];

    /// Look up the mode's configuration.
    pub fn config(self) -> &'static CompressionMode {
        &MODES[self as usize]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModeId::Tiny => "tiny",
            ModeId::Small => "small",
            ModeId::Base => "base",
            ModeId::Large => "large",
        }
    }

    /// Mode whose square resolution equals `px`, if any.
    pub fn for_resolution(px: u32) -> Option<ModeId> {
        MODES.iter().find(|m| m.resolution == px).map(|m| m.id)
    }
}

impl fmt::Display for ModeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModeId {
    type Err = OcrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tiny" => Ok(ModeId::Tiny),
            "small" => Ok(ModeId::Small),
            "base" => Ok(ModeId::Base),
            "large" => Ok(ModeId::Large),
            _ => Err(OcrError::UnknownMode { mode: s.to_string() }),
        }
    }
}
