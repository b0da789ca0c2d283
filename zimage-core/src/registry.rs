//! Static catalogue of precision tiers and the weights each one loads.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Device, Error, HardwareProfile, Result};

/// Named quantization level of the diffusion transformer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Full,
    Q8,
    Q4,
}

serde_plain::derive_display_from_serialize!(Precision);

impl Precision {
    pub const ALL: [Precision; 3] = [Precision::Full, Precision::Q8, Precision::Q4];

    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Full => "full",
            Precision::Q8 => "q8",
            Precision::Q4 => "q4",
        }
    }

    pub fn is_quantized(&self) -> bool {
        !matches!(self, Precision::Full)
    }
}

impl FromStr for Precision {
    type Err = Error;

    /// Case-insensitive, surrounding whitespace ignored.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Precision::Full),
            "q8" => Ok(Precision::Q8),
            "q4" => Ok(Precision::Q4),
            _ => Err(Error::UnknownPrecision(s.to_string())),
        }
    }
}

/// A loadable precision tier.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModelVariant {
    pub precision: Precision,
    /// Hub repository holding the transformer weights.
    pub model_identifier: String,
    /// File inside `model_identifier` with the transformer weights.
    pub weights_file: String,
    pub is_recommended: bool,
    /// Whether the tier is expected to fit on the profiled hardware.
    pub available: bool,
}

struct StaticVariant {
    precision: Precision,
    repo: &'static str,
    file: &'static str,
}

const VARIANTS: [StaticVariant; 3] = [
    StaticVariant {
        precision: Precision::Full,
        repo: "black-forest-labs/FLUX.1-schnell",
        file: "flux1-schnell.safetensors",
    },
    StaticVariant {
        precision: Precision::Q8,
        repo: "city96/FLUX.1-schnell-gguf",
        file: "flux1-schnell-Q8_0.gguf",
    },
    StaticVariant {
        precision: Precision::Q4,
        repo: "city96/FLUX.1-schnell-gguf",
        file: "flux1-schnell-Q4_0.gguf",
    },
];

fn lookup(precision: Precision) -> &'static StaticVariant {
    match precision {
        Precision::Full => &VARIANTS[0],
        Precision::Q8 => &VARIANTS[1],
        Precision::Q4 => &VARIANTS[2],
    }
}

/// Hub identifier for a tier; recorded in history rows.
pub fn model_identifier(precision: Precision) -> &'static str {
    lookup(precision).repo
}

/// All tiers in `full, q8, q4` order. Exactly one is recommended: the one
/// matching `profile.recommended_precision`.
pub fn list_variants(profile: &HardwareProfile) -> Vec<ModelVariant> {
    VARIANTS
        .iter()
        .map(|v| {
            let is_recommended = v.precision == profile.recommended_precision;
            ModelVariant {
                precision: v.precision,
                model_identifier: v.repo.to_string(),
                weights_file: v.file.to_string(),
                is_recommended,
                available: is_recommended || fits(v.precision, profile),
            }
        })
        .collect()
}

/// Maps a user supplied precision string onto its tier.
pub fn resolve(precision: &str) -> Result<ModelVariant> {
    let precision: Precision = precision.parse()?;
    Ok(variant(precision))
}

pub(crate) fn variant(precision: Precision) -> ModelVariant {
    let v = lookup(precision);
    ModelVariant {
        precision,
        model_identifier: v.repo.to_string(),
        weights_file: v.file.to_string(),
        is_recommended: false,
        available: true,
    }
}

// Only the unquantized tier is ever ruled out; quantized tiers stay selectable.
fn fits(precision: Precision, profile: &HardwareProfile) -> bool {
    if precision.is_quantized() {
        return true;
    }
    match profile.device {
        Device::Cuda | Device::Rocm => profile.vram_gb.map_or(true, |v| v >= 8.0),
        Device::Mps => profile.ram_gb().map_or(true, |r| r > 24.0),
        Device::Cpu => profile.ram_gb().map_or(true, |r| r >= 16.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(device: Device, ram: f64, vram: Option<f64>) -> HardwareProfile {
        HardwareProfile::from_parts(device, ram, vram)
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("FULL".parse::<Precision>().unwrap(), Precision::Full);
        assert_eq!(" q8 ".parse::<Precision>().unwrap(), Precision::Q8);
        assert_eq!("Q4".parse::<Precision>().unwrap(), Precision::Q4);
    }

    #[test]
    fn test_resolve_rejects_unknown_tiers() {
        for bad in ["", "q9", "fulll", "q_8", "q-4", "Q16"] {
            let err = resolve(bad).unwrap_err();
            assert!(matches!(err, Error::UnknownPrecision(_)), "{bad}");
        }
    }

    #[test]
    fn test_exactly_one_recommended() {
        for p in [
            profile(Device::Cuda, 64.0, Some(24.0)),
            profile(Device::Cuda, 64.0, Some(6.0)),
            profile(Device::Mps, 16.0, None),
            profile(Device::Cpu, 32.0, None),
            profile(Device::Rocm, 0.0, None),
        ] {
            let variants = list_variants(&p);
            assert_eq!(variants.len(), 3);
            let recommended: Vec<_> = variants.iter().filter(|v| v.is_recommended).collect();
            assert_eq!(recommended.len(), 1);
            assert_eq!(recommended[0].precision, p.recommended_precision);
            assert!(recommended[0].available);
        }
    }

    #[test]
    fn test_full_unavailable_on_small_gpu() {
        let variants = list_variants(&profile(Device::Cuda, 32.0, Some(6.0)));
        let full = variants.iter().find(|v| v.precision == Precision::Full).unwrap();
        assert!(!full.available);
        assert!(variants.iter().filter(|v| v.available).count() >= 2);
    }

    #[test]
    fn test_display_matches_wire_format() {
        assert_eq!(Precision::Q8.to_string(), "q8");
        assert_eq!(model_identifier(Precision::Full), "black-forest-labs/FLUX.1-schnell");
    }
}
