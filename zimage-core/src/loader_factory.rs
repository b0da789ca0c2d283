use std::sync::{Arc, Once};

use tracing::{info, warn};

use crate::{FeatureFlags, FluxLoader, Loader};

/// On-disk format of a transformer checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightsFormat {
    Safetensors,
    Gguf,
}

impl WeightsFormat {
    /// Detect the format from the weights file name.
    pub fn from_filename(name: &str) -> Self {
        if name.to_ascii_lowercase().ends_with(".gguf") {
            WeightsFormat::Gguf
        } else {
            WeightsFormat::Safetensors
        }
    }
}

static APPLY_FLAGS: Once = Once::new();

/// Applies process-wide backend switches. Only the first call has an effect.
pub fn apply_feature_flags(flags: FeatureFlags) {
    APPLY_FLAGS.call_once(|| {
        #[cfg(feature = "cuda")]
        {
            candle_core::quantized::cuda::set_force_dmmv(flags.force_dmmv);
            candle_core::cuda_backend::set_gemm_reduced_precision_f16(flags.reduced_precision_gemm);
            candle_core::cuda_backend::set_gemm_reduced_precision_bf16(flags.reduced_precision_gemm);
            info!(
                "CUDA flags: force_dmmv={}, reduced_precision_gemm={}",
                flags.force_dmmv, flags.reduced_precision_gemm
            );
        }
        #[cfg(not(feature = "cuda"))]
        {
            if flags.force_dmmv || flags.reduced_precision_gemm {
                warn!("CUDA flags requested but this build has no CUDA support, ignoring them");
            } else {
                info!("Using default backend settings");
            }
        }
    });
}

/// The production loader, with `flags` applied.
pub fn default_loader(flags: FeatureFlags) -> Arc<dyn Loader> {
    apply_feature_flags(flags);
    Arc::new(FluxLoader)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_filename() {
        assert_eq!(WeightsFormat::from_filename("flux1-schnell-Q8_0.gguf"), WeightsFormat::Gguf);
        assert_eq!(WeightsFormat::from_filename("FLUX.GGUF"), WeightsFormat::Gguf);
        assert_eq!(
            WeightsFormat::from_filename("flux1-schnell.safetensors"),
            WeightsFormat::Safetensors
        );
    }
}
