use std::io::Cursor;
use std::path::PathBuf;

use anyhow::{Context, Error, Result};
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_transformers::models::clip::text_model::{self, ClipTextTransformer};
use candle_transformers::models::flux::{
    autoencoder::{self, AutoEncoder},
    model, quantized_model, sampling,
};
use candle_transformers::models::t5::{self, T5EncoderModel};
use candle_transformers::quantized_var_builder;
use hf_hub::api::sync::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::{
    lora, seeded_noise, tensor_to_image, InferenceParams, LoadOptions, Loader, LoraAdapter,
    MemoryMode, ModelLike, ModelVariant,
};

const T5_MAX_TOKENS: usize = 256;
// Schnell is guidance-distilled.
const GUIDANCE: f64 = 0.0;

enum Transformer {
    Full(model::Flux),
    Quantized(quantized_model::Flux),
}

/// Where the transformer weights live, so LoRA changes can rebuild from the base.
struct TransformerSource {
    path: PathBuf,
    quantized: bool,
}

impl TransformerSource {
    fn build(&self, adapters: &[LoraAdapter], device: &Device, dtype: DType) -> Result<Transformer> {
        let config = model::Config::schnell();
        if self.quantized {
            let vb = if adapters.is_empty() {
                quantized_var_builder::VarBuilder::from_gguf(&self.path, device)
                    .context("failed to read gguf transformer")?
            } else {
                let buffer = self.merged_gguf(adapters)?;
                quantized_var_builder::VarBuilder::from_gguf_buffer(&buffer, device)
                    .context("failed to rebuild gguf transformer")?
            };
            let flux = quantized_model::Flux::new(&config, vb)
                .context("failed to load quantized flux model")?;
            Ok(Transformer::Quantized(flux))
        } else {
            let vb = if adapters.is_empty() {
                unsafe {
                    candle_nn::VarBuilder::from_mmaped_safetensors(&[&self.path], dtype, device)
                        .context("failed to build flux var builder")?
                }
            } else {
                let mut tensors = candle_core::safetensors::load(&self.path, device)
                    .context("failed to read flux weights")?;
                let deltas = lora::collect_deltas(adapters, |k| tensors.get(k).map(|t| t.dims().to_vec()))?;
                for (key, delta) in deltas {
                    if let Some(weight) = tensors.get(&key) {
                        let merged = lora::apply_dense(weight, &delta)
                            .with_context(|| format!("failed to merge LoRA into {key}"))?;
                        tensors.insert(key, merged);
                    }
                }
                candle_nn::VarBuilder::from_tensors(tensors, dtype, device)
            };
            let flux = model::Flux::new(&config, vb).context("failed to load flux model")?;
            Ok(Transformer::Full(flux))
        }
    }

    /// Rewrites the gguf file in memory with the adapters folded in.
    fn merged_gguf(&self, adapters: &[LoraAdapter]) -> Result<Vec<u8>> {
        let mut file = std::fs::File::open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        let content = gguf_file::Content::read(&mut file).context("failed to parse gguf header")?;
        let deltas = lora::collect_deltas(adapters, |k| {
            content.tensor_infos.get(k).map(|info| info.shape.dims().to_vec())
        })?;

        let mut tensors = Vec::with_capacity(content.tensor_infos.len());
        for name in content.tensor_infos.keys() {
            let mut qtensor = content.tensor(&mut file, name, &Device::Cpu)?;
            if let Some(delta) = deltas.get(name) {
                qtensor = lora::apply_quantized(&qtensor, delta)
                    .with_context(|| format!("failed to merge LoRA into {name}"))?;
            }
            tensors.push((name.as_str(), qtensor));
        }
        let metadata: Vec<_> = content.metadata.iter().map(|(k, v)| (k.as_str(), v)).collect();
        let tensor_refs: Vec<_> = tensors.iter().map(|(k, t)| (*k, t)).collect();

        let mut buffer = Cursor::new(Vec::new());
        gguf_file::write(&mut buffer, &metadata, &tensor_refs)?;
        Ok(buffer.into_inner())
    }
}

pub struct FluxModel {
    device: Device,
    dtype: DType,
    /// Device for the text encoders; the host in sliced mode.
    encoder_device: Device,
    t5_model: T5EncoderModel,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
    autoencoder: AutoEncoder,
    source: TransformerSource,
    flux_model: Option<Transformer>,
    has_loras: bool,
}

impl FluxModel {
    fn rebuild(&mut self, adapters: &[LoraAdapter]) -> Result<()> {
        // Free the old weights first; a failed rebuild leaves no transformer.
        self.flux_model = None;
        self.has_loras = false;
        self.flux_model = Some(self.source.build(adapters, &self.device, self.dtype)?);
        self.has_loras = !adapters.is_empty();
        Ok(())
    }

    fn encode_prompt(&mut self, prompt: &str) -> Result<(Tensor, Tensor)> {
        let mut t5_tokens = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        t5_tokens.resize(T5_MAX_TOKENS, 0);
        let input_token_ids = Tensor::new(&*t5_tokens, &self.encoder_device)?.unsqueeze(0)?;
        let t5_emb = self.t5_model.forward(&input_token_ids)?;

        let clip_tokens = self
            .clip_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let input_token_ids_clip = Tensor::new(&*clip_tokens, &self.encoder_device)?.unsqueeze(0)?;
        let clip_emb = self.clip_model.forward(&input_token_ids_clip)?;

        Ok((t5_emb, clip_emb))
    }
}

impl ModelLike for FluxModel {
    fn attach_loras(&mut self, adapters: &[LoraAdapter]) -> Result<()> {
        if adapters.is_empty() {
            return self.detach_loras();
        }
        info!("Merging {} LoRA adapter(s)", adapters.len());
        self.rebuild(adapters)
    }

    fn detach_loras(&mut self) -> Result<()> {
        if self.has_loras || self.flux_model.is_none() {
            self.rebuild(&[])?;
        }
        Ok(())
    }

    fn run(&mut self, params: &InferenceParams) -> Result<DynamicImage> {
        let (t5_emb, clip_emb) = self.encode_prompt(&params.prompt)?;

        let transformer = self
            .flux_model
            .as_ref()
            .context("flux transformer is not loaded")?;
        // Quantized matmuls run in f32.
        let run_dtype = match transformer {
            Transformer::Full(_) => self.dtype,
            Transformer::Quantized(_) => DType::F32,
        };
        let t5_emb = t5_emb.to_device(&self.device)?.to_dtype(run_dtype)?;
        let clip_emb = clip_emb.to_device(&self.device)?.to_dtype(run_dtype)?;
        let noise_img = seeded_noise(params.seed, params.height, params.width, run_dtype, &self.device)?;

        let state = sampling::State::new(&t5_emb, &clip_emb, &noise_img)?;
        let timesteps = sampling::get_schedule(params.steps, None);

        let latent_img = match transformer {
            Transformer::Full(flux) => sampling::denoise(
                flux,
                &state.img,
                &state.img_ids,
                &state.txt,
                &state.txt_ids,
                &state.vec,
                &timesteps,
                GUIDANCE,
            )?,
            Transformer::Quantized(flux) => sampling::denoise(
                flux,
                &state.img,
                &state.img_ids,
                &state.txt,
                &state.txt_ids,
                &state.vec,
                &timesteps,
                GUIDANCE,
            )?,
        };
        let unpacked = sampling::unpack(&latent_img, params.height, params.width)?;
        debug!("Generated latent image");

        let decoded = self.autoencoder.decode(&unpacked.to_dtype(self.dtype)?)?;
        debug!("Decoded image");

        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        let img_tensor = img.i(0)?;

        tensor_to_image(&img_tensor)
    }
}

/// Loads FLUX.1-schnell with T5-XXL and CLIP-L text encoders from the hub.
pub struct FluxLoader;

impl Loader for FluxLoader {
    fn load(&self, variant: &ModelVariant, options: &LoadOptions) -> Result<Box<dyn ModelLike>> {
        let api = Api::new().context("failed to create hub client")?;
        let device = options.device.clone();
        let dtype = device.bf16_default_to_f32();
        let (encoder_device, encoder_dtype) = match options.memory_mode {
            MemoryMode::Sliced => (Device::Cpu, DType::F32),
            MemoryMode::Standard => (device.clone(), dtype),
        };
        info!(
            "Loading {} ({}) on {:?}, memory mode {:?}",
            variant.model_identifier, variant.precision, device, options.memory_mode
        );

        // --- T5 ---
        let t5_repo = api.repo(hf_hub::Repo::with_revision(
            "google/t5-v1_1-xxl".to_string(),
            hf_hub::RepoType::Model,
            "refs/pr/2".to_string(),
        ));
        let t5_model_file = t5_repo
            .get("model.safetensors")
            .context("failed to load T5 model file")?;
        let t5_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(
                &[t5_model_file],
                encoder_dtype,
                &encoder_device,
            )
            .context("failed to build T5 var builder")?
        };
        let config_filename = t5_repo.get("config.json").context("failed to get T5 config")?;
        let config_str =
            std::fs::read_to_string(&config_filename).context("failed to read T5 config")?;
        let t5_config: t5::Config =
            serde_json::from_str(&config_str).context("failed to parse T5 config")?;
        let t5_model = T5EncoderModel::load(t5_vb, &t5_config).context("failed to load T5 model")?;
        let t5_tokenizer_filename = api
            .model("lmz/mt5-tokenizers".to_string())
            .get("t5-v1_1-xxl.tokenizer.json")
            .context("failed to get T5 tokenizer")?;
        let t5_tokenizer = Tokenizer::from_file(t5_tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load T5 tokenizer")?;

        // --- CLIP ---
        let clip_repo = api.repo(hf_hub::Repo::model(
            "openai/clip-vit-large-patch14".to_string(),
        ));
        let clip_model_file = clip_repo
            .get("model.safetensors")
            .context("failed to get CLIP model file")?;
        let clip_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(
                &[clip_model_file],
                encoder_dtype,
                &encoder_device,
            )
            .context("failed to build CLIP var builder")?
        };
        let clip_config = text_model::ClipTextConfig {
            vocab_size: 49408,
            projection_dim: 768,
            activation: text_model::Activation::QuickGelu,
            intermediate_size: 3072,
            embed_dim: 768,
            max_position_embeddings: 77,
            pad_with: None,
            num_hidden_layers: 12,
            num_attention_heads: 12,
        };
        let clip_model = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_config)
            .context("failed to load CLIP model")?;
        let clip_tokenizer_filename = clip_repo
            .get("tokenizer.json")
            .context("failed to get CLIP tokenizer")?;
        let clip_tokenizer = Tokenizer::from_file(clip_tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;

        // --- Autoencoder ---
        let bf_repo = api.repo(hf_hub::Repo::model(
            "black-forest-labs/FLUX.1-schnell".to_string(),
        ));
        let autoencoder_model_file = bf_repo
            .get("ae.safetensors")
            .context("failed to get autoencoder model file")?;
        let autoencoder_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[autoencoder_model_file], dtype, &device)
                .context("failed to build autoencoder var builder")?
        };
        let autoencoder = AutoEncoder::new(&autoencoder::Config::schnell(), autoencoder_vb)
            .context("failed to load autoencoder")?;

        // --- Transformer ---
        let path = api
            .model(variant.model_identifier.clone())
            .get(&variant.weights_file)
            .with_context(|| format!("failed to get {}", variant.weights_file))?;
        let source = TransformerSource {
            quantized: crate::WeightsFormat::from_filename(&variant.weights_file)
                == crate::WeightsFormat::Gguf,
            path,
        };
        let flux_model = source.build(&[], &device, dtype)?;

        Ok(Box::new(FluxModel {
            device,
            dtype,
            encoder_device,
            t5_model,
            t5_tokenizer,
            clip_model,
            clip_tokenizer,
            autoencoder,
            source,
            flux_model: Some(flux_model),
            has_loras: false,
        }))
    }
}
