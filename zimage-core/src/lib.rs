pub mod config;
pub mod device_map;
pub mod engine;
mod error;
pub mod hardware;
pub mod history;
pub mod loader;
mod loader_factory;
pub mod lora;
pub mod lora_store;
pub mod paths;
pub mod registry;
mod util;
pub mod worker;

mod flux;

#[cfg(any(test, feature = "test-helpers"))]
pub mod testing;

pub use config::{Config, FeatureFlags};
pub use device_map::*;
pub use engine::{Engine, EngineStatus};
pub use error::{Error, Result};
pub use flux::FluxLoader;
pub use hardware::{Device, HardwareProfile};
pub use history::{HistoryEntry, HistoryQuery, HistoryStore, LoraSnapshot, NewHistoryEntry};
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
pub use lora_store::{LoraFile, LoraStore};
pub use paths::AppPaths;
pub use registry::{ModelVariant, Precision};
use serde::{Deserialize, Serialize};
pub use util::{encode_png, thumbnail_png};
pub(crate) use util::*;
pub use worker::{GenerationResult, Worker};

/// Default sampling steps when a caller does not pick one.
pub const DEFAULT_STEPS: u32 = 9;
pub const DEFAULT_WIDTH: u32 = 1280;
pub const DEFAULT_HEIGHT: u32 = 720;
pub const DEFAULT_PRECISION: &str = "q8";
pub const DEFAULT_LORA_STRENGTH: f32 = 1.0;

/// One LoRA reference inside a generation request.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct LoraRequest {
    pub filename: String,
    #[serde(default = "default_lora_strength")]
    pub strength: f32,
}

fn default_lora_strength() -> f32 {
    DEFAULT_LORA_STRENGTH
}

/// What a façade asks the worker for. Values are raw; the worker normalises them.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub seed: Option<u64>,
    pub precision: String,
    pub loras: Vec<LoraRequest>,
    pub record_history: bool,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            steps: DEFAULT_STEPS,
            seed: None,
            precision: DEFAULT_PRECISION.to_string(),
            loras: Vec::new(),
            record_history: true,
        }
    }
}

/// A LoRA resolved against the store, ready to be attached to a pipeline.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct LoraAdapter {
    pub filename: String,
    pub display_name: String,
    pub file_path: std::path::PathBuf,
    /// sha256 of the installed bytes, so a replaced file compares unequal.
    pub hash: Option<String>,
    pub strength: f32,
}

/// Validated parameters for a single pipeline call.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceParams {
    pub prompt: String,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub seed: u64,
}

/// A loaded diffusion pipeline. Owned by the engine and only touched while
/// the engine lock is held.
pub trait ModelLike: Send {
    /// Applies adapters in order on top of the base weights.
    fn attach_loras(&mut self, adapters: &[LoraAdapter]) -> anyhow::Result<()>;

    /// Restores the base weights.
    fn detach_loras(&mut self) -> anyhow::Result<()>;

    fn run(&mut self, params: &InferenceParams) -> anyhow::Result<DynamicImage>;
}
