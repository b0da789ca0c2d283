//! Persistent record of finished generations.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, info, warn};

use crate::{Error, Precision, Result};

/// Model recorded by rows written before the model column existed.
const LEGACY_MODEL: &str = "Tongyi-MAI/Z-Image-Turbo";

pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// A LoRA as it was when the image was generated. Survives LoRA deletion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoraSnapshot {
    pub filename: String,
    pub display_name: String,
    pub strength: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub seed: Option<i64>,
    pub precision: String,
    pub model: String,
    pub loras: Vec<LoraSnapshot>,
    pub filename: String,
    pub file_size_kb: f64,
    pub generation_time: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewHistoryEntry {
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub seed: u64,
    pub precision: Precision,
    pub model: String,
    pub loras: Vec<LoraSnapshot>,
    pub filename: String,
    pub file_size_kb: f64,
    pub generation_time: f64,
}

/// Page and filter for [`HistoryStore::list`]. Date bounds are inclusive UTC days.
#[derive(Clone, Debug, PartialEq)]
pub struct HistoryQuery {
    pub limit: u32,
    pub offset: u32,
    pub q: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
            q: None,
            start_date: None,
            end_date: None,
        }
    }
}

#[derive(FromRow)]
struct HistoryRow {
    id: i64,
    prompt: Option<String>,
    width: Option<i64>,
    height: Option<i64>,
    steps: Option<i64>,
    seed: Option<i64>,
    precision: Option<String>,
    model: Option<String>,
    loras: Option<String>,
    filename: Option<String>,
    file_size_kb: Option<f64>,
    generation_time: Option<f64>,
    created_at: Option<String>,
    lora_strength: Option<f64>,
    legacy_lora_filename: Option<String>,
    legacy_lora_name: Option<String>,
}

impl From<HistoryRow> for HistoryEntry {
    fn from(row: HistoryRow) -> Self {
        let loras = match row.loras.as_deref() {
            Some(json) => serde_json::from_str(json).unwrap_or_else(|e| {
                warn!("Unreadable LoRA snapshot on history row {}: {}", row.id, e);
                Vec::new()
            }),
            // Rows from the single-LoRA schema.
            None => match row.legacy_lora_filename {
                Some(filename) => vec![LoraSnapshot {
                    display_name: row.legacy_lora_name.unwrap_or_else(|| filename.clone()),
                    filename,
                    strength: row.lora_strength.unwrap_or(0.0) as f32,
                }],
                None => Vec::new(),
            },
        };
        HistoryEntry {
            id: row.id,
            prompt: row.prompt.unwrap_or_default(),
            width: row.width.unwrap_or(0) as u32,
            height: row.height.unwrap_or(0) as u32,
            steps: row.steps.unwrap_or(0) as u32,
            seed: row.seed,
            precision: row.precision.unwrap_or_else(|| Precision::Full.to_string()),
            model: row.model.unwrap_or_else(|| LEGACY_MODEL.to_string()),
            loras,
            filename: row.filename.unwrap_or_default(),
            file_size_kb: row.file_size_kb.unwrap_or(0.0),
            generation_time: row.generation_time.unwrap_or(0.0),
            created_at: row
                .created_at
                .as_deref()
                .and_then(parse_timestamp)
                .unwrap_or_default(),
        }
    }
}

/// Accepts RFC 3339 and the space-separated form older rows used.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Opens (creating if needed) the database at `path` and brings its schema up to date.
pub async fn open_pool(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .map_err(|e| Error::storage(format!("opening database {}", path.display()), e))?;
    migrate(&pool).await?;
    info!("History database ready at {}", path.display());
    Ok(pool)
}

/// Creates missing tables, then adds columns introduced after the first
/// schema. Safe to run on every start.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS generations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            prompt TEXT,
            negative_prompt TEXT,
            steps INTEGER,
            width INTEGER,
            height INTEGER,
            cfg_scale REAL,
            seed INTEGER,
            model TEXT,
            status TEXT,
            filename TEXT,
            error_message TEXT,
            created_at TEXT,
            generation_time REAL,
            file_size_kb REAL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS lora_files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            filename TEXT UNIQUE NOT NULL,
            display_name TEXT,
            trigger_word TEXT,
            hash TEXT,
            created_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    let columns: Vec<String> =
        sqlx::query_scalar("SELECT name FROM pragma_table_info('generations')")
            .fetch_all(pool)
            .await?;
    let additions = [
        ("precision", "TEXT DEFAULT 'full'"),
        (
            "lora_file_id",
            "INTEGER REFERENCES lora_files(id) ON DELETE SET NULL",
        ),
        ("lora_strength", "REAL DEFAULT 0.0"),
        ("loras", "TEXT"),
    ];
    for (name, decl) in additions {
        if !columns.iter().any(|c| c == name) {
            debug!("Adding column generations.{}", name);
            sqlx::query(&format!("ALTER TABLE generations ADD COLUMN {name} {decl}"))
                .execute(pool)
                .await?;
        }
    }

    sqlx::query("UPDATE generations SET precision = 'full' WHERE precision IS NULL")
        .execute(pool)
        .await?;
    sqlx::query("UPDATE generations SET model = ? WHERE model IS NULL")
        .bind(LEGACY_MODEL)
        .execute(pool)
        .await?;
    Ok(())
}

#[derive(Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
    outputs_dir: PathBuf,
}

impl HistoryStore {
    pub fn new(pool: SqlitePool, outputs_dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            outputs_dir: outputs_dir.into(),
        }
    }

    pub fn outputs_dir(&self) -> &Path {
        &self.outputs_dir
    }

    pub async fn append(&self, entry: &NewHistoryEntry) -> Result<i64> {
        let loras = serde_json::to_string(&entry.loras)
            .map_err(|e| Error::storage("serializing LoRA snapshot", e))?;
        let result = sqlx::query(
            r#"
            INSERT INTO generations (
                prompt, steps, width, height, cfg_scale, seed, model, status,
                filename, created_at, generation_time, file_size_kb, precision, loras
            ) VALUES (?, ?, ?, ?, 0.0, ?, ?, 'succeeded', ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.prompt)
        .bind(entry.steps as i64)
        .bind(entry.width as i64)
        .bind(entry.height as i64)
        .bind(entry.seed as i64)
        .bind(&entry.model)
        .bind(&entry.filename)
        .bind(now_timestamp())
        .bind(entry.generation_time)
        .bind(entry.file_size_kb)
        .bind(entry.precision.as_str())
        .bind(loras)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// One page, newest first, plus the total number of matching rows.
    pub async fn list(&self, query: &HistoryQuery) -> Result<(Vec<HistoryEntry>, i64)> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM generations g");
        push_filters(&mut count, query);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT g.id, g.prompt, g.width, g.height, g.steps, g.seed, g.precision, g.model,
                   g.loras, g.filename, g.file_size_kb, g.generation_time,
                   CAST(g.created_at AS TEXT) AS created_at, g.lora_strength,
                   l.filename AS legacy_lora_filename, l.display_name AS legacy_lora_name
            FROM generations g
            LEFT JOIN lora_files l ON g.lora_file_id = l.id
            "#,
        );
        push_filters(&mut select, query);
        select.push(" ORDER BY g.created_at DESC, g.id DESC LIMIT ");
        select.push_bind(query.limit as i64);
        select.push(" OFFSET ");
        select.push_bind(query.offset as i64);

        let rows: Vec<HistoryRow> = select.build_query_as().fetch_all(&self.pool).await?;
        Ok((rows.into_iter().map(HistoryEntry::from).collect(), total))
    }

    pub async fn get(&self, id: i64) -> Result<HistoryEntry> {
        let row: Option<HistoryRow> = sqlx::query_as(
            r#"
            SELECT g.id, g.prompt, g.width, g.height, g.steps, g.seed, g.precision, g.model,
                   g.loras, g.filename, g.file_size_kb, g.generation_time,
                   CAST(g.created_at AS TEXT) AS created_at, g.lora_strength,
                   l.filename AS legacy_lora_filename, l.display_name AS legacy_lora_name
            FROM generations g
            LEFT JOIN lora_files l ON g.lora_file_id = l.id
            WHERE g.id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(HistoryEntry::from)
            .ok_or_else(|| Error::NotFound(format!("history item {id} not found")))
    }

    /// Removes the row, then its image. Failing to remove the image is logged, not returned.
    pub async fn delete(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let filename: Option<Option<String>> =
            sqlx::query_scalar("SELECT filename FROM generations WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(filename) = filename else {
            return Err(Error::NotFound(format!("history item {id} not found")));
        };
        sqlx::query("DELETE FROM generations WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        // The row is gone; a leftover image is only worth a warning.
        if let Some(filename) = filename.filter(|f| !f.is_empty()) {
            let path = self.outputs_dir.join(&filename);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Deleted image {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!("Image {} for history item {} was already gone", path.display(), id)
                }
                Err(e) => warn!("Failed to delete image {}: {}", path.display(), e),
            }
        }
        Ok(())
    }
}

fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, query: &HistoryQuery) {
    builder.push(" WHERE (g.status IS NULL OR g.status = 'succeeded')");
    if let Some(q) = query.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        builder.push(" AND instr(lower(g.prompt), lower(");
        builder.push_bind(q.to_string());
        builder.push(")) > 0");
    }
    if let Some(start) = query.start_date {
        builder.push(" AND substr(g.created_at, 1, 10) >= ");
        builder.push_bind(start.format("%Y-%m-%d").to_string());
    }
    if let Some(end) = query.end_date {
        builder.push(" AND substr(g.created_at, 1, 10) <= ");
        builder.push_bind(end.format("%Y-%m-%d").to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> HistoryStore {
        let pool = open_pool(&dir.path().join("zimage.db")).await.unwrap();
        HistoryStore::new(pool, dir.path())
    }

    fn entry(prompt: &str, filename: &str) -> NewHistoryEntry {
        NewHistoryEntry {
            prompt: prompt.to_string(),
            width: 96,
            height: 96,
            steps: 9,
            seed: 1234,
            precision: Precision::Q8,
            model: "city96/FLUX.1-schnell-gguf".to_string(),
            loras: vec![LoraSnapshot {
                filename: "style.safetensors".to_string(),
                display_name: "Style".to_string(),
                strength: 0.8,
            }],
            filename: filename.to_string(),
            file_size_kb: 12.5,
            generation_time: 1.25,
        }
    }

    #[tokio::test]
    async fn test_append_then_get() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let id = store.append(&entry("a red fox", "fox.png")).await.unwrap();

        let item = store.get(id).await.unwrap();
        assert_eq!(item.prompt, "a red fox");
        assert_eq!((item.width, item.height), (96, 96));
        assert_eq!(item.seed, Some(1234));
        assert_eq!(item.precision, "q8");
        assert_eq!(item.loras[0].strength, 0.8);

        assert!(matches!(store.get(id + 1).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_pages_are_disjoint_and_newest_first() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        for i in 0..5 {
            store
                .append(&entry(&format!("prompt {i}"), &format!("{i}.png")))
                .await
                .unwrap();
        }
        let page = |offset| HistoryQuery {
            limit: 2,
            offset,
            ..HistoryQuery::default()
        };
        let (first, total) = store.list(&page(0)).await.unwrap();
        let (second, total2) = store.list(&page(2)).await.unwrap();
        let (third, _) = store.list(&page(4)).await.unwrap();
        assert_eq!((total, total2), (5, 5));
        assert_eq!(first[0].prompt, "prompt 4");
        let ids: Vec<i64> = first.iter().chain(&second).chain(&third).map(|e| e.id).collect();
        assert_eq!(ids.len(), 5);
        assert!(ids.windows(2).all(|w| w[0] > w[1]));
    }

    #[tokio::test]
    async fn test_filters() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        store.append(&entry("A Red Fox", "1.png")).await.unwrap();
        store.append(&entry("blue whale", "2.png")).await.unwrap();

        let (items, total) = store
            .list(&HistoryQuery {
                q: Some("red FOX".to_string()),
                ..HistoryQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(items[0].prompt, "A Red Fox");

        let today = Utc::now().date_naive();
        let (_, total) = store
            .list(&HistoryQuery {
                start_date: Some(today),
                end_date: Some(today),
                ..HistoryQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 2);

        let (_, total) = store
            .list(&HistoryQuery {
                end_date: today.pred_opt(),
                ..HistoryQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn test_delete_removes_row_and_file() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        std::fs::write(dir.path().join("cat.png"), b"png").unwrap();
        let id = store.append(&entry("cat", "cat.png")).await.unwrap();
        let gone = store.append(&entry("dog", "dog.png")).await.unwrap();

        store.delete(id).await.unwrap();
        assert!(!dir.path().join("cat.png").exists());
        assert!(matches!(store.get(id).await, Err(Error::NotFound(_))));

        // File already missing: row still goes.
        store.delete(gone).await.unwrap();
        assert!(matches!(store.delete(gone).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_commits_even_if_image_cannot_be_removed() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        // A directory where the image should be makes remove_file fail.
        std::fs::create_dir(dir.path().join("stuck.png")).unwrap();
        let id = store.append(&entry("stuck", "stuck.png")).await.unwrap();

        store.delete(id).await.unwrap();
        assert!(matches!(store.get(id).await, Err(Error::NotFound(_))));
        assert!(dir.path().join("stuck.png").is_dir());
    }

    #[tokio::test]
    async fn test_migration_upgrades_old_schema() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("zimage.db");
        {
            let options = SqliteConnectOptions::new()
                .filename(&path)
                .create_if_missing(true);
            let pool = SqlitePoolOptions::new().connect_with(options).await.unwrap();
            sqlx::query(
                "CREATE TABLE generations (id INTEGER PRIMARY KEY AUTOINCREMENT, prompt TEXT, \
                 negative_prompt TEXT, steps INTEGER, width INTEGER, height INTEGER, cfg_scale REAL, \
                 seed INTEGER, model TEXT, status TEXT, filename TEXT, error_message TEXT, \
                 created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP, generation_time REAL, file_size_kb REAL)",
            )
            .execute(&pool)
            .await
            .unwrap();
            sqlx::query(
                "INSERT INTO generations (prompt, steps, width, height, status, filename, created_at) \
                 VALUES ('old', 8, 512, 512, 'succeeded', 'old.png', '2024-05-01 10:00:00.123456')",
            )
            .execute(&pool)
            .await
            .unwrap();
            pool.close().await;
        }

        let pool = open_pool(&path).await.unwrap();
        // Running again is harmless.
        migrate(&pool).await.unwrap();
        let store = HistoryStore::new(pool, dir.path());
        let (items, total) = store.list(&HistoryQuery::default()).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(items[0].precision, "full");
        assert_eq!(items[0].model, LEGACY_MODEL);
        assert!(items[0].loras.is_empty());
        assert_eq!(items[0].created_at.format("%Y-%m-%d").to_string(), "2024-05-01");
    }
}
