use anyhow::Result;
use serde::Serialize;

use crate::{ModelLike, ModelVariant};

/// How aggressively a pipeline trades speed for memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryMode {
    Standard,
    /// Text encoders stay on the CPU in F32; only embeddings move to the device.
    Sliced,
}

impl MemoryMode {
    pub fn from_slicing(slice: bool) -> Self {
        if slice {
            Self::Sliced
        } else {
            Self::Standard
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoadOptions {
    pub device: candle_core::Device,
    pub memory_mode: MemoryMode,
}

pub trait Loader: Send + Sync {
    /// Builds a ready pipeline for `variant`. Blocking; may download weights.
    fn load(&self, variant: &ModelVariant, options: &LoadOptions) -> Result<Box<dyn ModelLike>>;
}
