use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::api::AppState;
use crate::engine::{
    EngineStats, ExtractReport, ForgetReceipt, Page, PrimeResponse, SaveOutcome,
    SensitivityBatchReport, SensitivityReview, UpdateOutcome,
};
use crate::error::{MemkeepError, Result};
use crate::indexing::ReconcileReport;
use crate::memory::records::{
    IdentityDocument, JournalEntry, Neighbor, NewRule, Rule, RulePatch,
};
use crate::memory::types::{Gate, Memory, MemoryPatch, SaveRequest, Scope, Sensitivity};
use crate::privacy::PiiFinding;
use crate::reflection::ReflectionReport;
use crate::retrieval::{SearchRequest, SearchResponse};
use crate::storage::filter::MemoryFilter;

pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = state.engine.config();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "storage_mode": config.storage.mode.as_str(),
    }))
}

// -------------------------------------------------------------------------
// Tools
// -------------------------------------------------------------------------

pub async fn save_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SaveRequest>,
) -> Result<Json<SaveOutcome>> {
    Ok(Json(state.engine.save(request).await?))
}

pub async fn search_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>> {
    Ok(Json(state.engine.search(&request).await?))
}

#[derive(Debug, Deserialize)]
pub struct ForgetToolRequest {
    pub id: Uuid,
    #[serde(default)]
    pub reason: String,
}

pub async fn forget_tool_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ForgetToolRequest>,
) -> Result<Json<ForgetReceipt>> {
    Ok(Json(state.engine.forget(request.id, &request.reason).await?))
}

#[derive(Debug, Deserialize)]
pub struct PrimeToolRequest {
    pub message: String,
}

pub async fn prime_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PrimeToolRequest>,
) -> Result<Json<PrimeResponse>> {
    Ok(Json(state.engine.prime(&request.message).await?))
}

#[derive(Debug, Deserialize)]
pub struct ExtractToolRequest {
    pub transcript: String,
}

pub async fn extract_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExtractToolRequest>,
) -> Result<Json<ExtractReport>> {
    Ok(Json(state.engine.auto_extract(&request.transcript).await?))
}

// -------------------------------------------------------------------------
// Memories
// -------------------------------------------------------------------------

/// Query string of `GET /memories`; list values are comma separated
#[derive(Debug, Deserialize, Default)]
pub struct MemoriesQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    pub gate: Option<String>,
    pub scope: Option<String>,
    pub sensitivity: Option<String>,
    pub person: Option<String>,
    pub project: Option<String>,
    pub min_confidence: Option<f64>,
    #[serde(default)]
    pub include_archived: bool,
}

fn default_limit() -> usize {
    50
}

fn parse_list<T>(raw: Option<&str>) -> Result<Option<Vec<T>>>
where
    T: std::str::FromStr<Err = MemkeepError>,
{
    let Some(raw) = raw else {
        return Ok(None);
    };
    let values = raw
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::parse)
        .collect::<Result<Vec<T>>>()?;
    Ok((!values.is_empty()).then_some(values))
}

impl MemoriesQuery {
    fn filter(&self) -> Result<MemoryFilter> {
        Ok(MemoryFilter {
            gates: parse_list::<Gate>(self.gate.as_deref())?,
            scopes: parse_list::<Scope>(self.scope.as_deref())?,
            sensitivity: parse_list::<Sensitivity>(self.sensitivity.as_deref())?,
            person: self.person.clone(),
            project: self.project.clone(),
            min_confidence: self.min_confidence,
            since: None,
            include_archived: self.include_archived,
        })
    }
}

pub async fn list_memories_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MemoriesQuery>,
) -> Result<Json<Page>> {
    let filter = query.filter()?;
    Ok(Json(state.engine.list(&filter, query.limit, query.offset)?))
}

pub async fn create_memory_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SaveRequest>,
) -> Result<(StatusCode, Json<SaveOutcome>)> {
    let outcome = state.engine.save(request).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

pub async fn get_memory_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Memory>> {
    Ok(Json(state.engine.get(id).await?))
}

pub async fn update_memory_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(patch): Json<MemoryPatch>,
) -> Result<Json<UpdateOutcome>> {
    Ok(Json(state.engine.update(id, patch).await?))
}

#[derive(Debug, Deserialize, Default)]
pub struct ReasonQuery {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReasonBody {
    reason: String,
}

/// Forget via `DELETE`; the reason comes from the JSON body or `?reason=`.
pub async fn delete_memory_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<ReasonQuery>,
    body: Bytes,
) -> Result<Json<ForgetReceipt>> {
    let reason = if body.iter().all(u8::is_ascii_whitespace) {
        query.reason.unwrap_or_default()
    } else {
        serde_json::from_slice::<ReasonBody>(&body)
            .map_err(|e| MemkeepError::Validation(format!("invalid forget body: {e}")))?
            .reason
    };
    Ok(Json(state.engine.forget(id, &reason).await?))
}

pub async fn pin_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Memory>> {
    Ok(Json(state.engine.pin(id).await?))
}

pub async fn unpin_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Memory>> {
    Ok(Json(state.engine.unpin(id).await?))
}

pub async fn set_sensitivity_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(review): Json<SensitivityReview>,
) -> Result<Json<Memory>> {
    Ok(Json(state.engine.set_sensitivity(id, review).await?))
}

#[derive(Debug, Deserialize, Default)]
pub struct DepthQuery {
    pub depth: Option<usize>,
}

#[derive(Serialize)]
pub struct NeighborsResponse {
    pub id: Uuid,
    pub neighbors: Vec<Neighbor>,
}

pub async fn neighbors_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<DepthQuery>,
) -> Result<Json<NeighborsResponse>> {
    let neighbors = state.engine.neighbors(id, query.depth)?;
    Ok(Json(NeighborsResponse { id, neighbors }))
}

// -------------------------------------------------------------------------
// Identity, stats, maintenance
// -------------------------------------------------------------------------

pub async fn get_identity_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<IdentityDocument>> {
    Ok(Json(state.engine.identity()?))
}

pub async fn put_identity_handler(
    State(state): State<Arc<AppState>>,
    Json(document): Json<IdentityDocument>,
) -> Result<Json<IdentityDocument>> {
    Ok(Json(state.engine.update_identity(document)?))
}

pub async fn stats_handler(State(state): State<Arc<AppState>>) -> Result<Json<EngineStats>> {
    Ok(Json(state.engine.stats().await?))
}

pub async fn pii_handler(State(state): State<Arc<AppState>>) -> Result<Json<Vec<PiiFinding>>> {
    Ok(Json(state.engine.scan_pii()?))
}

pub async fn reflect_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReflectionReport>> {
    Ok(Json(state.engine.reflect().await?))
}

pub async fn reconcile_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReconcileReport>> {
    Ok(Json(state.engine.reconcile().await?))
}

#[derive(Debug, Deserialize, Default)]
pub struct ClassifyQuery {
    #[serde(default)]
    pub force: bool,
}

pub async fn classify_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ClassifyQuery>,
) -> Result<Json<SensitivityBatchReport>> {
    Ok(Json(state.engine.classify_sensitivity(query.force).await?))
}

// -------------------------------------------------------------------------
// Journal
// -------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct JournalQuery {
    #[serde(default = "default_journal_days")]
    pub days: i64,
}

fn default_journal_days() -> i64 {
    7
}

pub async fn journal_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JournalQuery>,
) -> Result<Json<Vec<JournalEntry>>> {
    Ok(Json(state.engine.recent_journal(query.days)?))
}

#[derive(Debug, Deserialize)]
pub struct CheckpointRequest {
    pub summary: String,
}

pub async fn checkpoint_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CheckpointRequest>,
) -> Result<(StatusCode, Json<JournalEntry>)> {
    let entry = state.engine.checkpoint(&request.summary)?;
    Ok((StatusCode::CREATED, Json(entry)))
}

// -------------------------------------------------------------------------
// Rules
// -------------------------------------------------------------------------

pub async fn list_rules_handler(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Rule>>> {
    Ok(Json(state.engine.list_rules()?))
}

pub async fn create_rule_handler(
    State(state): State<Arc<AppState>>,
    Json(rule): Json<NewRule>,
) -> Result<(StatusCode, Json<Rule>)> {
    let rule = state.engine.create_rule(rule)?;
    Ok((StatusCode::CREATED, Json(rule)))
}

pub async fn update_rule_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(patch): Json<RulePatch>,
) -> Result<Json<Rule>> {
    Ok(Json(state.engine.update_rule(id, patch)?))
}

pub async fn delete_rule_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    state.engine.delete_rule(id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memories_query_builds_filter() {
        let query = MemoriesQuery {
            gate: Some("behavioral, epistemic".into()),
            scope: Some("project".into()),
            ..Default::default()
        };
        let filter = query.filter().unwrap();
        assert_eq!(filter.gates, Some(vec![Gate::Behavioral, Gate::Epistemic]));
        assert_eq!(filter.scopes, Some(vec![Scope::Project]));
        assert_eq!(filter.sensitivity, None);
    }

    #[test]
    fn test_memories_query_rejects_unknown_gate() {
        let query = MemoriesQuery {
            gate: Some("mystery".into()),
            ..Default::default()
        };
        assert_eq!(query.filter().unwrap_err().kind(), "validation_error");
    }
}
