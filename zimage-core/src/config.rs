use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::paths::{AppPaths, PathOverrides};
use crate::{DeviceMap, Error, Result};

pub const CONFIG_VERSION: u32 = 1;

/// On-disk `config.json`. Keys mirror the environment variables they stand in for.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(rename = "Z_IMAGE_STUDIO_DATA_DIR", default)]
    pub data_dir: Option<PathBuf>,
    #[serde(rename = "Z_IMAGE_STUDIO_OUTPUT_DIR", default)]
    pub output_dir: Option<PathBuf>,
    #[serde(
        rename = "ZIMAGE_CUDA_REDUCED_PRECISION",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub reduced_precision_gemm: Option<bool>,
    #[serde(
        rename = "ZIMAGE_FORCE_DMMV",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub force_dmmv: Option<bool>,
}

impl ConfigFile {
    /// Reads `path`. A missing or unparsable file yields the defaults.
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                debug!("No config at {}: {}", path.display(), e);
                return Self::default();
            }
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!("Ignoring corrupt config {}: {}", path.display(), e);
            Self::default()
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::storage(format!("creating {}", parent.display()), e))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::storage("serializing config", e))?;
        std::fs::write(path, json)
            .map_err(|e| Error::storage(format!("writing {}", path.display()), e))
    }
}

/// Experimental CUDA switches, applied once when the default loader is built.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeatureFlags {
    /// Let f16/bf16 matmuls accumulate in reduced precision.
    pub reduced_precision_gemm: bool,
    /// Force the dequantize-mat-vec kernels for quantized matmuls.
    pub force_dmmv: bool,
}

impl FeatureFlags {
    /// Explicit values win over the config file; absent means off.
    pub fn resolve(
        reduced_precision_gemm: Option<bool>,
        force_dmmv: Option<bool>,
        file: &ConfigFile,
    ) -> Self {
        Self {
            reduced_precision_gemm: reduced_precision_gemm
                .or(file.reduced_precision_gemm)
                .unwrap_or(false),
            force_dmmv: force_dmmv.or(file.force_dmmv).unwrap_or(false),
        }
    }
}

/// Everything the core needs from the outside world, passed in explicitly.
#[derive(Clone, Debug)]
pub struct Config {
    pub paths: AppPaths,
    pub device_map: DeviceMap,
    pub features: FeatureFlags,
}

/// Values a façade collected from flags or environment.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub paths: PathOverrides,
    pub cpu: bool,
    pub reduced_precision_gemm: Option<bool>,
    pub force_dmmv: Option<bool>,
}

impl Config {
    /// Resolves paths and flags against the config file under `config_dir`.
    pub fn load(config_dir: &Path, overrides: &Overrides) -> Result<Self> {
        let file = ConfigFile::load(&config_dir.join(crate::paths::CONFIG_FILE_NAME));
        let paths = AppPaths::resolve(config_dir, &overrides.paths, &file)?;
        Ok(Self {
            paths,
            device_map: DeviceMap::from_cpu_flag(overrides.cpu),
            features: FeatureFlags::resolve(
                overrides.reduced_precision_gemm,
                overrides.force_dmmv,
                &file,
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_corrupt_config_is_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(ConfigFile::load(&path), ConfigFile::default());
        assert_eq!(ConfigFile::load(&dir.path().join("missing.json")), ConfigFile::default());
    }

    #[test]
    fn test_config_keys_match_env_names() {
        let file: ConfigFile = serde_json::from_str(
            r#"{"version": 1, "Z_IMAGE_STUDIO_DATA_DIR": "/srv/zimage", "ZIMAGE_FORCE_DMMV": true}"#,
        )
        .unwrap();
        assert_eq!(file.version, Some(1));
        assert_eq!(file.data_dir, Some(PathBuf::from("/srv/zimage")));
        assert_eq!(file.output_dir, None);

        let flags = FeatureFlags::resolve(None, None, &file);
        assert!(flags.force_dmmv);
        assert!(!flags.reduced_precision_gemm);

        let flags = FeatureFlags::resolve(Some(true), Some(false), &file);
        assert!(!flags.force_dmmv);
        assert!(flags.reduced_precision_gemm);
    }
}
