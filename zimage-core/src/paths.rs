//! Filesystem layout and the one-time move away from the working-directory layout.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::{ConfigFile, CONFIG_VERSION};
use crate::{Error, Result};

pub const APP_NAME: &str = "z-image-studio";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const DB_FILE_NAME: &str = "zimage.db";

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PathOverrides {
    pub data_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AppPaths {
    pub config_path: PathBuf,
    pub data_dir: PathBuf,
    pub outputs_dir: PathBuf,
    pub loras_dir: PathBuf,
    pub db_path: PathBuf,
}

impl AppPaths {
    /// `~/.z-image-studio`, or a relative fallback when there is no home directory.
    pub fn default_config_dir() -> PathBuf {
        dirs::home_dir()
            .map(|home| home.join(format!(".{APP_NAME}")))
            .unwrap_or_else(|| PathBuf::from(format!(".{APP_NAME}")))
    }

    /// Data dir: override, then config file, then the platform data dir.
    /// Outputs dir: override, then config file, then `<data>/outputs`.
    /// Every directory is created.
    pub fn resolve(config_dir: &Path, overrides: &PathOverrides, file: &ConfigFile) -> Result<Self> {
        let data_dir = overrides
            .data_dir
            .clone()
            .or_else(|| file.data_dir.clone())
            .or_else(|| dirs::data_dir().map(|d| d.join(APP_NAME)))
            .unwrap_or_else(|| config_dir.join("data"));
        let outputs_dir = overrides
            .output_dir
            .clone()
            .or_else(|| file.output_dir.clone())
            .unwrap_or_else(|| data_dir.join("outputs"));

        let paths = Self {
            config_path: config_dir.join(CONFIG_FILE_NAME),
            loras_dir: data_dir.join("loras"),
            db_path: data_dir.join(DB_FILE_NAME),
            data_dir,
            outputs_dir,
        };
        for dir in [config_dir, &paths.data_dir, &paths.outputs_dir, &paths.loras_dir] {
            std::fs::create_dir_all(dir)
                .map_err(|e| Error::storage(format!("creating {}", dir.display()), e))?;
        }
        Ok(paths)
    }
}

/// Moves data from the legacy working-directory layout (`outputs/`,
/// `loras/`, `zimage.db` under `legacy_root`) into `paths`, then writes the
/// config file. A no-op once the config file exists. Returns whether a
/// migration ran.
pub fn ensure_initial_setup(legacy_root: &Path, paths: &AppPaths) -> Result<bool> {
    if paths.config_path.exists() {
        return Ok(false);
    }
    info!(
        "No config found, migrating legacy data from {}",
        legacy_root.display()
    );

    move_tree(&legacy_root.join("outputs"), &paths.outputs_dir)?;
    move_tree(&legacy_root.join("loras"), &paths.loras_dir)?;
    move_file(&legacy_root.join(DB_FILE_NAME), &paths.db_path)?;

    let config = ConfigFile {
        version: Some(CONFIG_VERSION),
        ..ConfigFile::default()
    };
    info!("Writing config file to {}", paths.config_path.display());
    config.save(&paths.config_path)?;
    Ok(true)
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn move_tree(src: &Path, dst: &Path) -> Result<()> {
    if !src.exists() || same_path(src, dst) {
        return Ok(());
    }
    if !src.is_dir() {
        return move_file(src, dst);
    }
    info!("Moving {} -> {}", src.display(), dst.display());
    let entries = std::fs::read_dir(src)
        .map_err(|e| Error::storage(format!("reading {}", src.display()), e))?;
    for entry in entries.flatten() {
        let path = entry.path();
        let target = dst.join(entry.file_name());
        if path.is_dir() {
            move_tree(&path, &target)?;
        } else {
            move_file(&path, &target)?;
        }
    }
    // Leftovers (skipped conflicts) keep the directory alive.
    let _ = std::fs::remove_dir(src);
    Ok(())
}

fn move_file(src: &Path, dst: &Path) -> Result<()> {
    if !src.exists() || same_path(src, dst) {
        return Ok(());
    }
    if dst.exists() {
        warn!(
            "Not migrating {}: {} already exists",
            src.display(),
            dst.display()
        );
        return Ok(());
    }
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::storage(format!("creating {}", parent.display()), e))?;
    }
    if std::fs::rename(src, dst).is_err() {
        // Crossing filesystems.
        std::fs::copy(src, dst).map_err(|e| {
            Error::storage(format!("copying {} to {}", src.display(), dst.display()), e)
        })?;
        if let Err(e) = std::fs::remove_file(src) {
            warn!("Copied but could not remove {}: {}", src.display(), e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn layout(root: &Path) -> AppPaths {
        let overrides = PathOverrides {
            data_dir: Some(root.join("data")),
            output_dir: None,
        };
        AppPaths::resolve(&root.join("cfg"), &overrides, &ConfigFile::default()).unwrap()
    }

    #[test]
    fn test_resolve_precedence() {
        let root = TempDir::new().unwrap();
        let file = ConfigFile {
            data_dir: Some(root.path().join("from-file")),
            output_dir: Some(root.path().join("out-file")),
            ..ConfigFile::default()
        };
        let overrides = PathOverrides {
            data_dir: Some(root.path().join("from-flag")),
            output_dir: None,
        };
        let paths = AppPaths::resolve(&root.path().join("cfg"), &overrides, &file).unwrap();
        assert_eq!(paths.data_dir, root.path().join("from-flag"));
        assert_eq!(paths.outputs_dir, root.path().join("out-file"));
        assert_eq!(paths.db_path, root.path().join("from-flag").join("zimage.db"));
        assert!(paths.loras_dir.is_dir());
        assert!(paths.outputs_dir.is_dir());
    }

    #[test]
    fn test_migration_moves_legacy_data_once() {
        let root = TempDir::new().unwrap();
        let legacy = root.path().join("legacy");
        std::fs::create_dir_all(legacy.join("outputs")).unwrap();
        std::fs::create_dir_all(legacy.join("loras")).unwrap();
        std::fs::write(legacy.join("outputs/cat_1.png"), b"png").unwrap();
        std::fs::write(legacy.join("loras/style.safetensors"), b"lora").unwrap();
        std::fs::write(legacy.join("zimage.db"), b"db").unwrap();

        let paths = layout(root.path());
        assert!(ensure_initial_setup(&legacy, &paths).unwrap());
        assert!(paths.outputs_dir.join("cat_1.png").exists());
        assert!(paths.loras_dir.join("style.safetensors").exists());
        assert_eq!(std::fs::read(&paths.db_path).unwrap(), b"db");
        assert!(!legacy.join("zimage.db").exists());

        let config = ConfigFile::load(&paths.config_path);
        assert_eq!(config.version, Some(CONFIG_VERSION));

        // Second run is a no-op even if legacy data reappears.
        std::fs::write(legacy.join("zimage.db"), b"new").unwrap();
        assert!(!ensure_initial_setup(&legacy, &paths).unwrap());
        assert_eq!(std::fs::read(&paths.db_path).unwrap(), b"db");
    }

    #[test]
    fn test_migration_never_overwrites() {
        let root = TempDir::new().unwrap();
        let legacy = root.path().join("legacy");
        std::fs::create_dir_all(legacy.join("outputs")).unwrap();
        std::fs::write(legacy.join("outputs/a.png"), b"old").unwrap();

        let paths = layout(root.path());
        std::fs::write(paths.outputs_dir.join("a.png"), b"current").unwrap();
        ensure_initial_setup(&legacy, &paths).unwrap();
        assert_eq!(std::fs::read(paths.outputs_dir.join("a.png")).unwrap(), b"current");
        assert!(legacy.join("outputs/a.png").exists());
    }
}
