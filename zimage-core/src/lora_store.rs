//! Registry of installed LoRA files: rows in `lora_files`, bytes in the loras dir.

use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{FromRow, SqlitePool};
use tracing::{info, warn};

use crate::{Error, LoraAdapter, Result};

pub const LORA_EXTENSION: &str = ".safetensors";

/// Strengths outside this range are clamped.
pub const MIN_STRENGTH: f32 = -1.0;
pub const MAX_STRENGTH: f32 = 2.0;

#[derive(Clone, Debug, PartialEq, Serialize, FromRow)]
pub struct LoraFile {
    pub id: i64,
    pub filename: String,
    pub display_name: Option<String>,
    pub trigger_word: Option<String>,
    pub hash: Option<String>,
    pub created_at: Option<String>,
}

impl LoraFile {
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.filename)
    }
}

/// Keeps only the final path component and characters safe in a file name.
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let clean: String = base
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ' '))
        .collect();
    let clean = clean.trim().trim_start_matches('.').to_string();
    if clean.len() <= LORA_EXTENSION.len() || !clean.to_ascii_lowercase().ends_with(LORA_EXTENSION) {
        return None;
    }
    Some(clean)
}

const SELECT_LORA: &str = "SELECT id, filename, display_name, trigger_word, hash, \
                           CAST(created_at AS TEXT) AS created_at FROM lora_files";

#[derive(Clone)]
pub struct LoraStore {
    pool: SqlitePool,
    dir: PathBuf,
}

impl LoraStore {
    pub fn new(pool: SqlitePool, dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            dir: dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn list(&self) -> Result<Vec<LoraFile>> {
        let rows = sqlx::query_as(&format!(
            "{SELECT_LORA} ORDER BY COALESCE(display_name, filename) ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_by_filename(&self, filename: &str) -> Result<Option<LoraFile>> {
        let row = sqlx::query_as(&format!("{SELECT_LORA} WHERE filename = ?"))
            .bind(filename)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Writes `bytes` as `filename` and registers it. Re-installing an
    /// existing filename replaces the file and keeps the row id.
    pub async fn install(
        &self,
        filename: &str,
        display_name: Option<&str>,
        trigger_word: Option<&str>,
        bytes: &[u8],
    ) -> Result<LoraFile> {
        let filename = sanitize_filename(filename).ok_or_else(|| {
            Error::invalid(format!("LoRA files must be {LORA_EXTENSION}, got '{filename}'"))
        })?;
        safetensors::SafeTensors::read_metadata(bytes).map_err(|e| {
            Error::invalid(format!("{filename} is not a valid safetensors file: {e}"))
        })?;
        let hash = hex::encode(Sha256::digest(bytes));

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::storage(format!("creating {}", self.dir.display()), e))?;
        let target = self.dir.join(&filename);
        let tmp = self.dir.join(format!(".{}.{}.tmp", filename, uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| Error::storage(format!("writing {}", tmp.display()), e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::storage(format!("writing {}", target.display()), e));
        }

        let display_name = display_name
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| filename.trim_end_matches(LORA_EXTENSION).to_string());
        let trigger_word = trigger_word.map(str::trim).filter(|s| !s.is_empty());

        sqlx::query(
            r#"
            INSERT INTO lora_files (filename, display_name, trigger_word, hash, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(filename) DO UPDATE SET
                display_name = excluded.display_name,
                trigger_word = excluded.trigger_word,
                hash = excluded.hash
            "#,
        )
        .bind(&filename)
        .bind(&display_name)
        .bind(trigger_word)
        .bind(&hash)
        .bind(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&self.pool)
        .await?;

        info!("Installed LoRA {} ({} bytes)", filename, bytes.len());
        self.get_by_filename(&filename)
            .await?
            .ok_or_else(|| Error::NotFound(format!("LoRA {filename} vanished after install")))
    }

    /// Copies a file from disk into the store.
    pub async fn install_from_path(
        &self,
        path: &Path,
        display_name: Option<&str>,
        trigger_word: Option<&str>,
    ) -> Result<LoraFile> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| Error::invalid(format!("cannot read {}: {e}", path.display())))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.install(&filename, display_name, trigger_word, &bytes).await
    }

    /// Looks up a registered LoRA and clamps its strength. Unknown or missing
    /// files are the caller's mistake.
    pub async fn resolve(&self, filename: &str, strength: f32) -> Result<LoraAdapter> {
        let row = self
            .get_by_filename(filename)
            .await?
            .ok_or_else(|| Error::invalid(format!("LoRA '{filename}' is not installed")))?;
        let file_path = self.dir.join(&row.filename);
        if !tokio::fs::try_exists(&file_path).await.unwrap_or(false) {
            return Err(Error::invalid(format!(
                "LoRA '{filename}' is registered but {} is missing",
                file_path.display()
            )));
        }
        if !strength.is_finite() {
            return Err(Error::invalid(format!("LoRA '{filename}' strength must be a number")));
        }
        Ok(LoraAdapter {
            display_name: row.display_name().to_string(),
            filename: row.filename,
            file_path,
            hash: row.hash,
            strength: strength.clamp(MIN_STRENGTH, MAX_STRENGTH),
        })
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let filename: Option<String> =
            sqlx::query_scalar("SELECT filename FROM lora_files WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(filename) = filename else {
            return Err(Error::NotFound(format!("LoRA {id} not found")));
        };
        sqlx::query("DELETE FROM lora_files WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let path = self.dir.join(&filename);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("LoRA file {} was already gone", path.display())
            }
            Err(e) => warn!("Failed to delete LoRA file {}: {}", path.display(), e),
        }
        info!("Deleted LoRA {}", filename);
        Ok(())
    }
}
