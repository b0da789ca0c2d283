//! Deterministic in-process pipeline for tests. Never downloads weights.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use image::{DynamicImage, Rgb, RgbImage};

use crate::{InferenceParams, LoadOptions, Loader, LoraAdapter, ModelLike, ModelVariant, Precision};

#[derive(Clone, Debug, PartialEq)]
pub enum MockEvent {
    Load(Precision),
    Attach(Vec<String>),
    Detach,
    Run { precision: Precision, seed: u64 },
}

#[derive(Default)]
struct Shared {
    events: Mutex<Vec<MockEvent>>,
    fail_next_load: AtomicBool,
    panic_next_attach: AtomicBool,
    fail_next_run: Mutex<Option<String>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    run_delay: Mutex<Duration>,
}

/// Loader whose pipelines paint a solid colour identifying their precision.
#[derive(Clone, Default)]
pub struct MockLoader {
    shared: Arc<Shared>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl MockLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MockEvent> {
        lock(&self.shared.events).clone()
    }

    pub fn load_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, MockEvent::Load(_)))
            .count()
    }

    pub fn fail_next_load(&self) {
        self.shared.fail_next_load.store(true, Ordering::SeqCst);
    }

    /// The next `attach_loras` panics instead of returning an error.
    pub fn panic_next_attach(&self) {
        self.shared.panic_next_attach.store(true, Ordering::SeqCst);
    }

    /// The next `run` fails with `message`.
    pub fn fail_next_run(&self, message: &str) {
        *lock(&self.shared.fail_next_run) = Some(message.to_string());
    }

    /// Every `run` sleeps this long, to widen race windows.
    pub fn set_run_delay(&self, delay: Duration) {
        *lock(&self.shared.run_delay) = delay;
    }

    /// Highest number of simultaneous `run` calls observed.
    pub fn max_concurrent_runs(&self) -> usize {
        self.shared.max_running.load(Ordering::SeqCst)
    }

    fn record(&self, event: MockEvent) {
        lock(&self.shared.events).push(event);
    }
}

/// Smallest valid safetensors payload: an empty header.
pub fn empty_safetensors() -> Vec<u8> {
    let header = b"{}";
    let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
    bytes.extend_from_slice(header);
    bytes
}

/// A tensor-free safetensors payload whose bytes vary with `revision`.
pub fn safetensors_revision(revision: &str) -> Vec<u8> {
    let header = serde_json::json!({ "__metadata__": { "revision": revision } }).to_string();
    let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
    bytes.extend_from_slice(header.as_bytes());
    bytes
}

/// The colour a mock pipeline of `precision` paints.
pub fn precision_colour(precision: Precision) -> Rgb<u8> {
    match precision {
        Precision::Full => Rgb([255, 0, 0]),
        Precision::Q8 => Rgb([0, 255, 0]),
        Precision::Q4 => Rgb([0, 0, 255]),
    }
}

impl Loader for MockLoader {
    fn load(&self, variant: &ModelVariant, _options: &LoadOptions) -> Result<Box<dyn ModelLike>> {
        if self.shared.fail_next_load.swap(false, Ordering::SeqCst) {
            bail!("mock weights for {} are corrupt", variant.precision);
        }
        self.record(MockEvent::Load(variant.precision));
        Ok(Box::new(MockModel {
            loader: self.clone(),
            precision: variant.precision,
        }))
    }
}

struct MockModel {
    loader: MockLoader,
    precision: Precision,
}

impl ModelLike for MockModel {
    fn attach_loras(&mut self, adapters: &[LoraAdapter]) -> Result<()> {
        if self.loader.shared.panic_next_attach.swap(false, Ordering::SeqCst) {
            panic!("mock adapter tensors are malformed");
        }
        for adapter in adapters {
            if !adapter.file_path.is_file() {
                bail!("LoRA file {} is missing", adapter.file_path.display());
            }
        }
        self.loader.record(MockEvent::Attach(
            adapters.iter().map(|a| a.filename.clone()).collect(),
        ));
        Ok(())
    }

    fn detach_loras(&mut self) -> Result<()> {
        self.loader.record(MockEvent::Detach);
        Ok(())
    }

    fn run(&mut self, params: &InferenceParams) -> Result<DynamicImage> {
        let shared = &self.loader.shared;
        let running = shared.running.fetch_add(1, Ordering::SeqCst) + 1;
        shared.max_running.fetch_max(running, Ordering::SeqCst);

        let delay = *lock(&shared.run_delay);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let failure = lock(&shared.fail_next_run).take();
        shared.running.fetch_sub(1, Ordering::SeqCst);
        if let Some(message) = failure {
            return Err(anyhow!(message));
        }

        self.loader.record(MockEvent::Run {
            precision: self.precision,
            seed: params.seed,
        });
        let img = RgbImage::from_pixel(
            params.width as u32,
            params.height as u32,
            precision_colour(self.precision),
        );
        Ok(DynamicImage::ImageRgb8(img))
    }
}
