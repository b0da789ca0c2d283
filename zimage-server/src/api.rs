//! HTTP handlers.

use axum::{
    extract::{rejection::JsonRejection, Multipart, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zimage_core::{
    GenerationRequest, GenerationResult, HistoryEntry, HistoryQuery, LoraRequest, Precision,
    Worker, DEFAULT_HEIGHT, DEFAULT_PRECISION, DEFAULT_STEPS, DEFAULT_WIDTH,
};

use crate::{ApiError, ApiResult, AppState};

/// Largest history page a client can ask for.
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    pub prompt: String,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_precision")]
    pub precision: String,
    #[serde(default)]
    pub loras: Vec<LoraRequest>,
}

fn default_steps() -> u32 {
    DEFAULT_STEPS
}

fn default_width() -> u32 {
    DEFAULT_WIDTH
}

fn default_height() -> u32 {
    DEFAULT_HEIGHT
}

fn default_precision() -> String {
    DEFAULT_PRECISION.to_string()
}

impl From<GenerateBody> for GenerationRequest {
    fn from(body: GenerateBody) -> Self {
        GenerationRequest {
            width: body.width,
            height: body.height,
            steps: body.steps,
            seed: body.seed,
            precision: body.precision,
            loras: body.loras,
            ..GenerationRequest::new(body.prompt)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedLora {
    pub filename: String,
    pub strength: f32,
}

/// Client view of a finished generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub id: Option<i64>,
    pub image_url: String,
    pub generation_time: f64,
    pub width: u32,
    pub height: u32,
    pub seed: u64,
    pub precision: Precision,
    pub steps: u32,
    pub model_id: String,
    pub file_size_kb: f64,
    pub loras: Vec<AppliedLora>,
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

impl From<&GenerationResult> for GenerateResponse {
    fn from(r: &GenerationResult) -> Self {
        Self {
            id: r.history_id,
            image_url: format!("/outputs/{}", r.filename),
            generation_time: round_to(r.generation_time, 2),
            width: r.width,
            height: r.height,
            seed: r.seed,
            precision: r.precision,
            steps: r.steps,
            model_id: r.model_id.clone(),
            file_size_kb: round_to(r.file_size_kb, 1),
            loras: r
                .loras
                .iter()
                .map(|l| AppliedLora {
                    filename: l.filename.clone(),
                    strength: l.strength,
                })
                .collect(),
        }
    }
}

pub async fn generate(
    State(state): State<AppState>,
    payload: Result<Json<GenerateBody>, JsonRejection>,
) -> ApiResult<Json<GenerateResponse>> {
    let Json(body) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let result = state.worker.generate(body.into()).await?;
    Ok(Json(GenerateResponse::from(&result)))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub precision: Precision,
    pub hf_model_id: String,
    pub recommended: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub device: String,
    pub ram_gb: Option<f64>,
    pub vram_gb: Option<f64>,
    pub default_precision: Precision,
    pub models: Vec<ModelInfo>,
}

impl ModelsResponse {
    /// Hardware summary plus the tiers expected to fit on it.
    pub fn for_worker(worker: &Worker) -> Self {
        let profile = worker.profile();
        let models = worker
            .variants()
            .into_iter()
            .filter(|v| v.available)
            .map(|v| ModelInfo {
                id: v.precision.to_string(),
                precision: v.precision,
                hf_model_id: v.model_identifier,
                recommended: v.is_recommended,
            })
            .collect();
        Self {
            device: profile.device.to_string(),
            ram_gb: profile.ram_gb().map(|gb| round_to(gb, 1)),
            vram_gb: profile.vram_gb.map(|gb| round_to(gb, 1)),
            default_precision: profile.recommended_precision,
            models,
        }
    }
}

pub async fn models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse::for_worker(&state.worker))
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub q: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

fn parse_date(field: &str, raw: Option<&str>) -> ApiResult<Option<NaiveDate>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| ApiError::BadRequest(format!("{field} must be YYYY-MM-DD, got '{s}'"))),
    }
}

impl HistoryParams {
    pub fn into_query(self) -> ApiResult<HistoryQuery> {
        let defaults = HistoryQuery::default();
        Ok(HistoryQuery {
            limit: self.limit.unwrap_or(defaults.limit).clamp(1, MAX_PAGE_SIZE),
            offset: self.offset.unwrap_or(0),
            start_date: parse_date("start_date", self.start_date.as_deref())?,
            end_date: parse_date("end_date", self.end_date.as_deref())?,
            q: self.q,
        })
    }
}

pub async fn history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<(HeaderMap, Json<Vec<HistoryEntry>>)> {
    let query = params.into_query()?;
    let (entries, total) = state.worker.history().list(&query).await?;
    debug!(
        "History page offset={} limit={} returned {} of {}",
        query.offset,
        query.limit,
        entries.len(),
        total
    );

    let mut headers = HeaderMap::new();
    headers.insert("x-total-count", HeaderValue::from(total));
    headers.insert("x-page-size", HeaderValue::from(query.limit));
    headers.insert("x-page-offset", HeaderValue::from(query.offset));
    Ok((headers, Json(entries)))
}

pub async fn delete_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.worker.history().delete(id).await?;
    info!("Deleted history item {}", id);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraSummary {
    pub id: i64,
    pub filename: String,
    pub display_name: String,
    pub trigger_word: Option<String>,
}

impl From<zimage_core::LoraFile> for LoraSummary {
    fn from(f: zimage_core::LoraFile) -> Self {
        Self {
            id: f.id,
            display_name: f.display_name().to_string(),
            filename: f.filename,
            trigger_word: f.trigger_word,
        }
    }
}

pub async fn list_loras(State(state): State<AppState>) -> ApiResult<Json<Vec<LoraSummary>>> {
    let loras = state.worker.loras().list().await?;
    Ok(Json(loras.into_iter().map(LoraSummary::from).collect()))
}

pub async fn upload_lora(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<LoraSummary>> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut display_name = None;
    let mut trigger_word = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.body_text()))?;
                file = Some((filename, bytes.to_vec()));
            }
            "display_name" | "trigger_word" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.body_text()))?;
                if name == "display_name" {
                    display_name = Some(text);
                } else {
                    trigger_word = Some(text);
                }
            }
            other => debug!("Ignoring multipart field '{}'", other),
        }
    }

    let (filename, bytes) =
        file.ok_or_else(|| ApiError::BadRequest("missing 'file' field".to_string()))?;
    let lora = state
        .worker
        .loras()
        .install(
            &filename,
            display_name.as_deref(),
            trigger_word.as_deref(),
            &bytes,
        )
        .await?;
    Ok(Json(LoraSummary::from(lora)))
}

pub async fn delete_lora(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.worker.loras().delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// A bare file name: no separators, no parent references, not hidden.
fn is_plain_filename(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0'])
}

pub async fn download(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> ApiResult<Response> {
    if !is_plain_filename(&filename) {
        return Err(ApiError::BadRequest(format!("invalid file name '{filename}'")));
    }
    let outputs = state.worker.outputs_dir();
    let path = outputs.join(&filename);
    let not_found = || ApiError::NotFound(format!("{filename} not found"));

    let resolved = tokio::fs::canonicalize(&path).await.map_err(|_| not_found())?;
    let root = tokio::fs::canonicalize(outputs).await.map_err(|_| not_found())?;
    if !resolved.starts_with(&root) {
        return Err(ApiError::BadRequest(format!("invalid file name '{filename}'")));
    }
    let bytes = tokio::fs::read(&resolved).await.map_err(|_| not_found())?;

    let content_type = if filename.to_ascii_lowercase().ends_with(".png") {
        "image/png"
    } else {
        "application/octet-stream"
    };
    let disposition = format!("attachment; filename=\"{filename}\"");
    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_filename() {
        assert!(is_plain_filename("fox_1700000000_abc123.png"));
        assert!(!is_plain_filename("../zimage.db"));
        assert!(!is_plain_filename("..\\zimage.db"));
        assert!(!is_plain_filename(".hidden.png.tmp"));
        assert!(!is_plain_filename(""));
    }

    #[test]
    fn test_history_params_validation() {
        let query = HistoryParams::default().into_query().unwrap();
        assert_eq!((query.limit, query.offset), (20, 0));

        let query = HistoryParams {
            limit: Some(10_000),
            start_date: Some("2024-05-01".into()),
            ..Default::default()
        }
        .into_query()
        .unwrap();
        assert_eq!(query.limit, MAX_PAGE_SIZE);
        assert_eq!(query.start_date, NaiveDate::from_ymd_opt(2024, 5, 1));

        let err = HistoryParams {
            end_date: Some("May 1st".into()),
            ..Default::default()
        }
        .into_query()
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_rounding() {
        assert_eq!(round_to(1.23456, 2), 1.23);
        assert_eq!(round_to(12.345, 1), 12.3);
    }
}
