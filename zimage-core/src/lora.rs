//! LoRA weight deltas and how they fold into base weights.

use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, Context, Result};
use candle_core::quantized::QTensor;
use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::LoraAdapter;

const PREFIXES: [&str; 3] = ["diffusion_model.", "transformer.", "base_model.model."];

/// Underscore-joined words that form a single path segment in kohya names.
const KOHYA_COMPOUNDS: [&str; 19] = [
    "double_blocks",
    "single_blocks",
    "img_attn",
    "txt_attn",
    "img_mlp",
    "txt_mlp",
    "img_mod",
    "txt_mod",
    "img_in",
    "txt_in",
    "time_in",
    "vector_in",
    "guidance_in",
    "in_layer",
    "out_layer",
    "final_layer",
    "adaLN_modulation",
    "query_norm",
    "key_norm",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Part {
    Down,
    Up,
    Alpha,
}

/// Where an adapter's delta lands inside the base weight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Placement {
    Whole,
    /// Row block `index` of a projection fused from `count` blocks. All blocks
    /// but the last are as tall as the weight is wide.
    Slot { index: usize, count: usize },
    /// The two row halves are stored in the opposite order.
    SwappedHalves,
}

#[derive(Debug, PartialEq)]
struct Key {
    module: String,
    placement: Placement,
    part: Part,
}

/// Splits an adapter tensor name into the base module it targets, where in
/// that module it lands, and its role.
///
/// Accepts native flux names, kohya `lora_unet_` names and diffusers names.
fn parse_key(raw: &str) -> Option<Key> {
    let (module, part) = split_part(raw)?;
    if module.starts_with("lora_te") || module.starts_with("text_encoder") {
        return None;
    }
    if let Some(flat) = module.strip_prefix("lora_unet_") {
        return Some(Key {
            module: kohya_module(flat),
            placement: Placement::Whole,
            part,
        });
    }

    let mut module = module;
    for prefix in PREFIXES {
        if let Some(rest) = module.strip_prefix(prefix) {
            module = rest;
        }
    }
    let (module, placement) =
        diffusers_module(module).unwrap_or_else(|| (module.to_string(), Placement::Whole));
    Some(Key {
        module,
        placement,
        part,
    })
}

fn split_part(raw: &str) -> Option<(&str, Part)> {
    if let Some(module) = raw.strip_suffix(".alpha") {
        return Some((module, Part::Alpha));
    }
    [
        (".lora_A.weight", Part::Down),
        (".lora_down.weight", Part::Down),
        (".lora_B.weight", Part::Up),
        (".lora_up.weight", Part::Up),
    ]
    .into_iter()
    .find_map(|(suffix, part)| raw.strip_suffix(suffix).map(|module| (module, part)))
}

/// `double_blocks_0_img_attn_qkv` -> `double_blocks.0.img_attn.qkv`
fn kohya_module(flat: &str) -> String {
    let words: Vec<&str> = flat.split('_').collect();
    let mut segments = Vec::with_capacity(words.len());
    let mut i = 0;
    while i < words.len() {
        if let Some(next) = words.get(i + 1) {
            let pair = format!("{}_{}", words[i], next);
            if KOHYA_COMPOUNDS.contains(&pair.as_str()) {
                segments.push(pair);
                i += 2;
                continue;
            }
        }
        segments.push(words[i].to_string());
        i += 1;
    }
    segments.join(".")
}

/// Maps diffusers `FluxTransformer2DModel` module names onto flux names.
fn diffusers_module(module: &str) -> Option<(String, Placement)> {
    use Placement::{Slot, SwappedHalves, Whole};

    if let Some(rest) = module.strip_prefix("transformer_blocks.") {
        let (block, inner) = rest.split_once('.')?;
        let (target, placement) = match inner {
            "attn.to_q" => ("img_attn.qkv", Slot { index: 0, count: 3 }),
            "attn.to_k" => ("img_attn.qkv", Slot { index: 1, count: 3 }),
            "attn.to_v" => ("img_attn.qkv", Slot { index: 2, count: 3 }),
            "attn.add_q_proj" => ("txt_attn.qkv", Slot { index: 0, count: 3 }),
            "attn.add_k_proj" => ("txt_attn.qkv", Slot { index: 1, count: 3 }),
            "attn.add_v_proj" => ("txt_attn.qkv", Slot { index: 2, count: 3 }),
            "attn.to_out.0" => ("img_attn.proj", Whole),
            "attn.to_add_out" => ("txt_attn.proj", Whole),
            "ff.net.0.proj" => ("img_mlp.0", Whole),
            "ff.net.2" => ("img_mlp.2", Whole),
            "ff_context.net.0.proj" => ("txt_mlp.0", Whole),
            "ff_context.net.2" => ("txt_mlp.2", Whole),
            "norm1.linear" => ("img_mod.lin", Whole),
            "norm1_context.linear" => ("txt_mod.lin", Whole),
            _ => return None,
        };
        return Some((format!("double_blocks.{block}.{target}"), placement));
    }

    if let Some(rest) = module.strip_prefix("single_transformer_blocks.") {
        let (block, inner) = rest.split_once('.')?;
        let (target, placement) = match inner {
            "attn.to_q" => ("linear1", Slot { index: 0, count: 4 }),
            "attn.to_k" => ("linear1", Slot { index: 1, count: 4 }),
            "attn.to_v" => ("linear1", Slot { index: 2, count: 4 }),
            "proj_mlp" => ("linear1", Slot { index: 3, count: 4 }),
            "proj_out" => ("linear2", Whole),
            "norm.linear" => ("modulation.lin", Whole),
            _ => return None,
        };
        return Some((format!("single_blocks.{block}.{target}"), placement));
    }

    let (target, placement) = match module {
        "x_embedder" => ("img_in", Whole),
        "context_embedder" => ("txt_in", Whole),
        "time_text_embed.timestep_embedder.linear_1" => ("time_in.in_layer", Whole),
        "time_text_embed.timestep_embedder.linear_2" => ("time_in.out_layer", Whole),
        "time_text_embed.text_embedder.linear_1" => ("vector_in.in_layer", Whole),
        "time_text_embed.text_embedder.linear_2" => ("vector_in.out_layer", Whole),
        "time_text_embed.guidance_embedder.linear_1" => ("guidance_in.in_layer", Whole),
        "time_text_embed.guidance_embedder.linear_2" => ("guidance_in.out_layer", Whole),
        "proj_out" => ("final_layer.linear", Whole),
        "norm_out.linear" => ("final_layer.adaLN_modulation.1", SwappedHalves),
        _ => return None,
    };
    Some((target.to_string(), placement))
}

#[derive(Default)]
struct Pair {
    down: Option<Tensor>,
    up: Option<Tensor>,
    alpha: Option<f64>,
}

/// Sums the deltas of every adapter, keyed by the base weight they modify.
///
/// `weight_shape` returns the shape of a base model tensor, or `None` when the
/// model has no such tensor. An adapter that touches none of them is rejected.
pub fn collect_deltas(
    adapters: &[LoraAdapter],
    weight_shape: impl Fn(&str) -> Option<Vec<usize>>,
) -> Result<HashMap<String, Tensor>> {
    let mut merged: HashMap<String, Tensor> = HashMap::new();
    for adapter in adapters {
        let tensors = candle_core::safetensors::load(&adapter.file_path, &Device::Cpu)
            .with_context(|| format!("failed to read LoRA {}", adapter.filename))?;

        let mut pairs: HashMap<(String, Placement), Pair> = HashMap::new();
        for (name, tensor) in tensors {
            let Some(key) = parse_key(&name) else {
                continue;
            };
            let pair = pairs.entry((key.module, key.placement)).or_default();
            match key.part {
                Part::Down => pair.down = Some(tensor),
                Part::Up => pair.up = Some(tensor),
                Part::Alpha => {
                    let values = tensor.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
                    let alpha = values.first().copied().with_context(|| {
                        format!("LoRA {} has an empty alpha tensor {name}", adapter.filename)
                    })?;
                    pair.alpha = Some(alpha);
                }
            }
        }

        let mut pieces: HashMap<String, Vec<(Placement, Tensor)>> = HashMap::new();
        for ((module, placement), pair) in pairs {
            let (Some(down), Some(up)) = (pair.down, pair.up) else {
                continue;
            };
            let delta = delta(&down, &up, pair.alpha, adapter.strength)?;
            pieces.entry(module).or_default().push((placement, delta));
        }

        let mut matched = 0usize;
        for (module, parts) in pieces {
            let weight_key = format!("{module}.weight");
            let Some(shape) = weight_shape(&weight_key) else {
                continue;
            };
            let delta = assemble(parts, &shape)
                .with_context(|| format!("LoRA {} does not fit {weight_key}", adapter.filename))?;
            let delta = match merged.remove(&weight_key) {
                Some(previous) => (previous + delta)?,
                None => delta,
            };
            merged.insert(weight_key, delta);
            matched += 1;
        }
        if matched == 0 {
            bail!(
                "LoRA {} does not match any weight of the loaded model",
                adapter.filename
            );
        }
        debug!("LoRA {} touches {} weights", adapter.filename, matched);
    }
    Ok(merged)
}

/// Lays the deltas aimed at one weight out in that weight's row order.
/// Missing blocks of a fused projection stay zero.
fn assemble(parts: Vec<(Placement, Tensor)>, shape: &[usize]) -> Result<Tensor> {
    let mut total: Option<Tensor> = None;
    let mut slots: BTreeMap<usize, Tensor> = BTreeMap::new();
    let mut slot_count = 0;

    for (placement, delta) in parts {
        let piece = match placement {
            Placement::Whole => delta,
            Placement::SwappedHalves => {
                let rows = delta.dim(0)?;
                let half = rows / 2;
                Tensor::cat(&[delta.narrow(0, half, rows - half)?, delta.narrow(0, 0, half)?], 0)?
            }
            Placement::Slot { index, count } => {
                slot_count = count;
                slots.insert(index, delta);
                continue;
            }
        };
        total = Some(match total {
            Some(t) => (t + piece)?,
            None => piece,
        });
    }

    if !slots.is_empty() {
        let &[rows, cols] = shape else {
            bail!("fused projection weight must be 2D, got {shape:?}");
        };
        let mut blocks = Vec::with_capacity(slot_count);
        for index in 0..slot_count {
            let height = if index + 1 < slot_count {
                cols
            } else {
                rows.saturating_sub(cols * (slot_count - 1))
            };
            match slots.remove(&index) {
                Some(block) if block.dims() == [height, cols] => blocks.push(block),
                Some(block) => bail!(
                    "block {index} has shape {:?}, expected {:?}",
                    block.dims(),
                    [height, cols]
                ),
                None => blocks.push(Tensor::zeros((height, cols), DType::F32, &Device::Cpu)?),
            }
        }
        let fused = Tensor::cat(&blocks, 0)?;
        total = Some(match total {
            Some(t) => (t + fused)?,
            None => fused,
        });
    }
    total.context("no LoRA deltas to assemble")
}

/// `strength * alpha / rank * up @ down`, in F32.
fn delta(down: &Tensor, up: &Tensor, alpha: Option<f64>, strength: f32) -> Result<Tensor> {
    let down = down.to_dtype(DType::F32)?;
    let up = up.to_dtype(DType::F32)?;
    let rank = down.dim(0)?;
    let scale = alpha.map_or(1.0, |a| a / rank as f64) * strength as f64;
    Ok((up.matmul(&down)? * scale)?)
}

/// Adds `delta` onto a dense weight, keeping its dtype and device.
pub fn apply_dense(weight: &Tensor, delta: &Tensor) -> Result<Tensor> {
    if weight.dims() != delta.dims() {
        bail!(
            "LoRA delta shape {:?} does not match weight shape {:?}",
            delta.dims(),
            weight.dims()
        );
    }
    let merged = (weight.to_dtype(DType::F32)? + delta.to_device(weight.device())?)?;
    Ok(merged.to_dtype(weight.dtype())?)
}

/// Dequantizes, merges and requantizes to the original GGML dtype.
pub fn apply_quantized(weight: &QTensor, delta: &Tensor) -> Result<QTensor> {
    let dense = weight.dequantize(&Device::Cpu)?;
    let merged = apply_dense(&dense, delta)?;
    Ok(QTensor::quantize(&merged, weight.dtype())?)
}
