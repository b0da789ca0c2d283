//! Request lifecycle: validate, run on the engine, save, record.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::engine::MAX_LORAS;
use crate::history::{self, HistoryStore, LoraSnapshot, NewHistoryEntry};
use crate::{
    encode_png, registry, Config, Engine, EngineStatus, Error, GenerationRequest,
    HardwareProfile, InferenceParams, Loader, LoraAdapter, LoraStore, ModelVariant, Precision,
    Result,
};

/// Largest generated seed; keeps seeds portable to 32-bit consumers.
pub const MAX_GENERATED_SEED: u64 = (1 << 31) - 1;
/// Width and height are floored to a multiple of this.
pub const DIMENSION_STEP: u32 = 16;
const PROMPT_SLUG_LEN: usize = 30;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GenerationResult {
    /// `None` when the caller opted out of history.
    pub history_id: Option<i64>,
    pub filename: String,
    pub output_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub seed: u64,
    pub precision: Precision,
    pub model_id: String,
    pub loras: Vec<LoraSnapshot>,
    pub file_size_kb: f64,
    /// Seconds spent in inference, excluding any model (re)load.
    pub generation_time: f64,
}

/// A request after normalisation; everything needed to run without further lookups.
#[derive(Clone, Debug)]
struct Job {
    params: InferenceParams,
    precision: Precision,
    loras: Vec<LoraAdapter>,
    record_history: bool,
}

/// Floors to a multiple of [`DIMENSION_STEP`], never below one step.
pub fn adjust_dimension(value: u32) -> u32 {
    (value / DIMENSION_STEP * DIMENSION_STEP).max(DIMENSION_STEP)
}

/// File-name-safe prefix of the prompt.
pub fn prompt_slug(prompt: &str) -> String {
    let slug: String = prompt
        .chars()
        .take(PROMPT_SLUG_LEN)
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
        .collect();
    if slug.is_empty() {
        "image".to_string()
    } else {
        slug
    }
}

fn output_filename(prompt: &str) -> String {
    let ts = chrono::Utc::now().timestamp();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}.png", prompt_slug(prompt), ts, &suffix[..6])
}

/// Front door to the engine. Cheap to clone; clones share the engine.
#[derive(Clone)]
pub struct Worker {
    engine: Arc<Mutex<Engine>>,
    profile: HardwareProfile,
    history: HistoryStore,
    loras: LoraStore,
    outputs_dir: PathBuf,
}

impl Worker {
    pub fn new(
        engine: Engine,
        profile: HardwareProfile,
        history: HistoryStore,
        loras: LoraStore,
    ) -> Self {
        let outputs_dir = history.outputs_dir().to_path_buf();
        Self {
            engine: Arc::new(Mutex::new(engine)),
            profile,
            history,
            loras,
            outputs_dir,
        }
    }

    /// Opens the database under `config.paths` and wires an engine around `loader`.
    pub async fn open(
        config: &Config,
        profile: HardwareProfile,
        loader: Arc<dyn Loader>,
    ) -> Result<Self> {
        let pool = history::open_pool(&config.paths.db_path).await?;
        let engine = Engine::new(loader, profile.clone(), config.device_map);
        Ok(Self::new(
            engine,
            profile,
            HistoryStore::new(pool.clone(), &config.paths.outputs_dir),
            LoraStore::new(pool, &config.paths.loras_dir),
        ))
    }

    pub fn profile(&self) -> &HardwareProfile {
        &self.profile
    }

    pub fn variants(&self) -> Vec<ModelVariant> {
        registry::list_variants(&self.profile)
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn loras(&self) -> &LoraStore {
        &self.loras
    }

    pub fn outputs_dir(&self) -> &Path {
        &self.outputs_dir
    }

    /// Waits for any running job, then reports the engine state.
    pub async fn engine_status(&self) -> EngineStatus {
        self.engine.lock().await.status()
    }

    /// Drops the loaded pipeline once the current job (if any) finishes.
    pub async fn release(&self) {
        self.engine.lock().await.release();
    }

    /// Runs one generation end to end.
    ///
    /// The job runs on its own task: dropping the returned future does not
    /// abort it, and its history row is still written.
    pub async fn generate(&self, request: GenerationRequest) -> Result<GenerationResult> {
        let job = self.prepare(request).await?;
        let worker = self.clone();
        tokio::spawn(async move { worker.execute(job).await })
            .await
            .map_err(|e| Error::generation(anyhow::anyhow!("generation task failed: {e}")))?
    }

    async fn prepare(&self, request: GenerationRequest) -> Result<Job> {
        let prompt = request.prompt.trim();
        if prompt.is_empty() {
            return Err(Error::invalid("prompt must not be empty"));
        }
        if request.steps == 0 {
            return Err(Error::invalid("steps must be at least 1"));
        }
        let precision: Precision = request.precision.parse()?;

        let seed = match request.seed {
            Some(seed) if seed > i64::MAX as u64 => {
                return Err(Error::invalid(format!("seed {seed} is too large")));
            }
            Some(seed) => seed,
            None => rand::rng().random_range(0..=MAX_GENERATED_SEED),
        };

        if request.loras.len() > MAX_LORAS {
            return Err(Error::invalid(format!(
                "at most {MAX_LORAS} LoRAs can be applied, got {}",
                request.loras.len()
            )));
        }
        let mut seen = HashSet::new();
        let mut loras = Vec::with_capacity(request.loras.len());
        for lora in &request.loras {
            if !seen.insert(lora.filename.as_str()) {
                return Err(Error::invalid(format!(
                    "LoRA '{}' is listed more than once",
                    lora.filename
                )));
            }
            loras.push(self.loras.resolve(&lora.filename, lora.strength).await?);
        }

        let width = adjust_dimension(request.width);
        let height = adjust_dimension(request.height);
        if (width, height) != (request.width, request.height) {
            info!(
                "Adjusted size {}x{} to {}x{}",
                request.width, request.height, width, height
            );
        }

        Ok(Job {
            params: InferenceParams {
                prompt: prompt.to_string(),
                width: width as usize,
                height: height as usize,
                steps: request.steps as usize,
                seed,
            },
            precision,
            loras,
            record_history: request.record_history,
        })
    }

    async fn execute(self, job: Job) -> Result<GenerationResult> {
        let engine = self.engine.clone().lock_owned().await;
        let params = job.params.clone();
        let precision = job.precision;
        let adapters = job.loras.clone();
        let (png, generation_time) = tokio::task::spawn_blocking(move || {
            let mut engine = engine;
            engine.ensure_ready(precision, &adapters)?;
            let started = Instant::now();
            let image = engine.run_inference(&params)?;
            let generation_time = started.elapsed().as_secs_f64();
            drop(engine);
            let png = encode_png(&image)
                .map_err(|e| Error::storage("encoding generated image", e))?;
            Ok::<_, Error>((png, generation_time))
        })
        .await
        .map_err(|e| Error::generation(anyhow::anyhow!("inference thread failed: {e}")))??;

        let filename = output_filename(&job.params.prompt);
        let output_path = self.write_image(&filename, &png).await?;
        let file_size_kb = png.len() as f64 / 1024.0;

        let loras: Vec<LoraSnapshot> = job
            .loras
            .iter()
            .map(|a| LoraSnapshot {
                filename: a.filename.clone(),
                display_name: a.display_name.clone(),
                strength: a.strength,
            })
            .collect();
        let model_id = registry::model_identifier(precision).to_string();

        let history_id = if job.record_history {
            let entry = NewHistoryEntry {
                prompt: job.params.prompt.clone(),
                width: job.params.width as u32,
                height: job.params.height as u32,
                steps: job.params.steps as u32,
                seed: job.params.seed,
                precision,
                model: model_id.clone(),
                loras: loras.clone(),
                filename: filename.clone(),
                file_size_kb,
                generation_time,
            };
            match self.history.append(&entry).await {
                Ok(id) => Some(id),
                Err(e) => {
                    error!("Failed to record generation, removing {}: {}", filename, e);
                    if let Err(rm) = tokio::fs::remove_file(&output_path).await {
                        warn!("Could not remove {}: {}", output_path.display(), rm);
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        info!(
            "Generated {} ({}x{}, {} steps, seed {}, {}) in {:.2}s",
            filename,
            job.params.width,
            job.params.height,
            job.params.steps,
            job.params.seed,
            precision,
            generation_time
        );
        Ok(GenerationResult {
            history_id,
            filename,
            output_path,
            width: job.params.width as u32,
            height: job.params.height as u32,
            steps: job.params.steps as u32,
            seed: job.params.seed,
            precision,
            model_id,
            loras,
            file_size_kb,
            generation_time,
        })
    }

    /// Temp file then rename, so readers never see a partial image.
    async fn write_image(&self, filename: &str, png: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.outputs_dir)
            .await
            .map_err(|e| Error::storage(format!("creating {}", self.outputs_dir.display()), e))?;
        let target = self.outputs_dir.join(filename);
        let tmp = self.outputs_dir.join(format!(".{filename}.tmp"));
        if let Err(e) = tokio::fs::write(&tmp, png).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::storage(format!("writing {}", tmp.display()), e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::storage(format!("writing {}", target.display()), e));
        }
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjust_dimension_floors_to_step() {
        assert_eq!(adjust_dimension(100), 96);
        assert_eq!(adjust_dimension(1280), 1280);
        assert_eq!(adjust_dimension(721), 720);
        assert_eq!(adjust_dimension(15), 16);
        assert_eq!(adjust_dimension(0), 16);
    }

    #[test]
    fn test_prompt_slug() {
        assert_eq!(prompt_slug("a cat, on a mat!"), "acatonamat");
        assert_eq!(prompt_slug("日本語"), "image");
        assert_eq!(
            prompt_slug("abcdefghijklmnopqrstuvwxyz0123456789"),
            "abcdefghijklmnopqrstuvwxyz0123"
        );
    }

    #[test]
    fn test_output_filename_shape() {
        let name = output_filename("red fox");
        let parts: Vec<&str> = name.trim_end_matches(".png").split('_').collect();
        assert_eq!(parts[0], "redfox");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 6);
    }
}
