//! The model cache: one loaded pipeline plus the configuration it was built with.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use image::DynamicImage;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    registry, DeviceMap, Error, HardwareProfile, InferenceParams, LoadOptions, Loader,
    LoraAdapter, MemoryMode, ModelLike, Precision, Result,
};

/// Most adapters a pipeline carries at once.
pub const MAX_LORAS: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    Unloaded,
    Loading,
    Ready,
    Reconfiguring,
}

serde_plain::derive_display_from_serialize!(EngineStatus);

/// Owns the pipeline. Callers serialise access (see [`crate::Worker`]); the
/// engine itself is not thread safe.
///
/// The recorded precision and LoRA list only change after a reconfiguration
/// fully succeeds. Any load or attach failure, panics included, drops the
/// pipeline and leaves the engine `Unloaded`, so the next call reloads from
/// scratch.
pub struct Engine {
    loader: Arc<dyn Loader>,
    profile: HardwareProfile,
    device_map: DeviceMap,
    status: EngineStatus,
    precision: Option<Precision>,
    loras: Vec<LoraAdapter>,
    memory_mode: Option<MemoryMode>,
    pipeline: Option<Box<dyn ModelLike>>,
}

impl Engine {
    pub fn new(loader: Arc<dyn Loader>, profile: HardwareProfile, device_map: DeviceMap) -> Self {
        Self {
            loader,
            profile,
            device_map,
            status: EngineStatus::Unloaded,
            precision: None,
            loras: Vec::new(),
            memory_mode: None,
            pipeline: None,
        }
    }

    pub fn status(&self) -> EngineStatus {
        self.status
    }

    pub fn loaded_precision(&self) -> Option<Precision> {
        self.precision
    }

    pub fn attached_loras(&self) -> &[LoraAdapter] {
        &self.loras
    }

    pub fn memory_mode(&self) -> Option<MemoryMode> {
        self.memory_mode
    }

    /// Makes the pipeline match `precision` with exactly `loras` attached, in order.
    pub fn ensure_ready(&mut self, precision: Precision, loras: &[LoraAdapter]) -> Result<()> {
        if loras.len() > MAX_LORAS {
            return Err(Error::invalid(format!(
                "at most {MAX_LORAS} LoRAs can be applied, got {}",
                loras.len()
            )));
        }

        let reusable = self.status == EngineStatus::Ready
            && self.precision == Some(precision)
            && self.pipeline.is_some();
        if reusable && self.loras == loras {
            return Ok(());
        }

        // A panic inside the loader must not strand the engine half built.
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            if reusable {
                self.reconfigure(loras)
            } else {
                self.load(precision, loras)
            }
        }));
        match outcome {
            Ok(result) => result?,
            Err(payload) => {
                self.fault();
                return Err(Error::model_load(
                    "pipeline setup panicked",
                    anyhow::anyhow!(panic_message(payload.as_ref())),
                ));
            }
        }

        self.loras = loras.to_vec();
        self.status = EngineStatus::Ready;
        Ok(())
    }

    fn reconfigure(&mut self, loras: &[LoraAdapter]) -> Result<()> {
        self.status = EngineStatus::Reconfiguring;
        info!("Reconfiguring LoRAs: {} adapter(s)", loras.len());
        let result = match self.pipeline.as_mut() {
            Some(pipeline) => pipeline.detach_loras().and_then(|()| {
                if loras.is_empty() {
                    Ok(())
                } else {
                    pipeline.attach_loras(loras)
                }
            }),
            None => Err(anyhow::anyhow!("no pipeline to reconfigure")),
        };
        if let Err(e) = result {
            self.fault();
            return Err(Error::model_load("failed to apply LoRA adapters", e));
        }
        Ok(())
    }

    fn load(&mut self, precision: Precision, loras: &[LoraAdapter]) -> Result<()> {
        // Free the previous weights before allocating new ones.
        self.release();
        self.status = EngineStatus::Loading;

        let slice = self.device_map == DeviceMap::ForceCpu || self.profile.should_slice_attention();
        let memory_mode = MemoryMode::from_slicing(slice);
        let device = match self.profile.candle_device(self.device_map) {
            Ok(device) => device,
            Err(e) => {
                self.fault();
                return Err(Error::model_load("failed to set up device", e));
            }
        };
        let variant = registry::variant(precision);
        info!("Loading {} pipeline ({})", precision, variant.model_identifier);

        let options = LoadOptions {
            device,
            memory_mode,
        };
        let mut pipeline = match self.loader.load(&variant, &options) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                self.fault();
                return Err(Error::model_load(
                    format!("failed to load {precision} weights"),
                    e,
                ));
            }
        };
        if !loras.is_empty() {
            if let Err(e) = pipeline.attach_loras(loras) {
                drop(pipeline);
                self.fault();
                return Err(Error::model_load("failed to apply LoRA adapters", e));
            }
        }

        self.pipeline = Some(pipeline);
        self.precision = Some(precision);
        self.memory_mode = Some(memory_mode);
        Ok(())
    }

    /// Runs the pipeline as configured by the last [`Engine::ensure_ready`].
    ///
    /// Allocator exhaustion releases the pipeline so the next call reloads.
    pub fn run_inference(&mut self, params: &InferenceParams) -> Result<DynamicImage> {
        let status = self.status;
        let result = match self.pipeline.as_mut() {
            Some(pipeline) if status == EngineStatus::Ready => pipeline.run(params),
            _ => {
                return Err(Error::generation(anyhow::anyhow!(
                    "engine is {status}, no pipeline to run"
                )))
            }
        };
        result.map_err(|e| {
            let err = Error::generation(e);
            if err.is_out_of_memory() {
                warn!("Out of memory during inference, releasing the pipeline");
                self.release();
            }
            err
        })
    }

    /// Drops the pipeline. Safe to call in any state.
    pub fn release(&mut self) {
        if self.pipeline.is_some() {
            info!("Releasing pipeline");
        }
        self.fault();
    }

    fn fault(&mut self) {
        self.pipeline = None;
        self.precision = None;
        self.loras.clear();
        self.memory_mode = None;
        self.status = EngineStatus::Unloaded;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
