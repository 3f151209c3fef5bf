//! REST API handlers

use super::AppState;
use crate::config::IncrementalConfig;
use crate::error::IndexError;
use crate::index::{EntryKind, IndexMetadata};
use crate::indexer::CycleOutcome;
use crate::registry::{IncrementalStats, IntegrityReport, RepairReport, SearchResponse};
use crate::search::{SearchOptions, SortBy, SortOrder};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

type ApiResult<T> = Result<T, (StatusCode, String)>;

/// Search query parameters
#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    /// The search query string
    #[serde(default)]
    pub q: String,
    /// `file` or `directory`
    #[serde(rename = "type")]
    pub kind: Option<EntryKind>,
    /// Comma separated extensions, e.g. `pdf,txt`
    pub ext: Option<String>,
    pub sort: Option<SortBy>,
    pub order: Option<SortOrder>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl SearchParams {
    pub fn to_options(&self) -> SearchOptions {
        let options = SearchOptions {
            kind: self.kind,
            sort_by: self.sort.unwrap_or_default(),
            sort_order: self.order,
            limit: self.limit,
            offset: self.offset,
            ..SearchOptions::default()
        };
        match &self.ext {
            Some(ext) => options.with_extensions(ext.split(',')),
            None => options,
        }
    }
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SharesResponse {
    pub shares: Vec<IndexMetadata>,
}

#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub share_id: String,
    pub message: &'static str,
}

fn error_response(e: IndexError) -> (StatusCode, String) {
    let status = match &e {
        IndexError::InvalidShareId(_) => StatusCode::BAD_REQUEST,
        IndexError::ShareNotFound(_) => StatusCode::NOT_FOUND,
        IndexError::ShareDisabled(_) => StatusCode::CONFLICT,
        IndexError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %format!("{:#}", e), "Request failed");
    }
    (status, format!("{:#}", e))
}

/// Handle health check requests
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn shares_handler(State(registry): State<AppState>) -> Json<SharesResponse> {
    Json(SharesResponse {
        shares: registry.list_statuses(),
    })
}

/// Handle search requests
pub async fn search_handler(
    State(registry): State<AppState>,
    Path(share_id): Path<String>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<SearchResponse>> {
    let options = params.to_options();
    // Scoring is CPU bound over the whole index
    let response = tokio::task::spawn_blocking(move || {
        registry.search(&share_id, &params.q, &options)
    })
    .await
    .map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Search task failed: {}", e),
        )
    })?
    .map_err(error_response)?;
    Ok(Json(response))
}

pub async fn status_handler(
    State(registry): State<AppState>,
    Path(share_id): Path<String>,
) -> ApiResult<Json<IndexMetadata>> {
    registry
        .get_status(&share_id)
        .map(Json)
        .map_err(error_response)
}

pub async fn incremental_stats_handler(
    State(registry): State<AppState>,
    Path(share_id): Path<String>,
) -> ApiResult<Json<IncrementalStats>> {
    registry
        .get_incremental_stats(&share_id)
        .map(Json)
        .map_err(error_response)
}

/// Run one incremental cycle and wait for its outcome
pub async fn incremental_trigger_handler(
    State(registry): State<AppState>,
    Path(share_id): Path<String>,
) -> ApiResult<Json<CycleOutcome>> {
    registry
        .trigger_incremental_update(&share_id)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn integrity_handler(
    State(registry): State<AppState>,
    Path(share_id): Path<String>,
) -> ApiResult<Json<IntegrityReport>> {
    registry
        .check_integrity(&share_id)
        .await
        .map(Json)
        .map_err(error_response)
}

/// Queue a rebuild; progress is visible through the status endpoint
pub async fn rebuild_handler(
    State(registry): State<AppState>,
    Path(share_id): Path<String>,
) -> ApiResult<(StatusCode, Json<AcceptedResponse>)> {
    registry.rebuild_index(&share_id).map_err(error_response)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            share_id,
            message: "rebuild scheduled",
        }),
    ))
}

pub async fn repair_handler(
    State(registry): State<AppState>,
    Path(share_id): Path<String>,
) -> ApiResult<Json<RepairReport>> {
    registry
        .repair(&share_id)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn delete_handler(
    State(registry): State<AppState>,
    Path(share_id): Path<String>,
) -> ApiResult<StatusCode> {
    registry
        .delete_index(&share_id)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn incremental_config_handler(
    State(registry): State<AppState>,
    Json(config): Json<IncrementalConfig>,
) -> ApiResult<Json<IncrementalConfig>> {
    registry
        .configure_incremental_update(config)
        .await
        .map_err(|e| match e {
            // Validation problems are the caller's fault
            IndexError::Other(e) => (StatusCode::BAD_REQUEST, format!("{:#}", e)),
            other => error_response(other),
        })?;
    Ok(Json(registry.incremental_config()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (IndexError::InvalidShareId("..".into()), StatusCode::BAD_REQUEST),
            (IndexError::ShareNotFound("x".into()), StatusCode::NOT_FOUND),
            (IndexError::ShareDisabled("x".into()), StatusCode::CONFLICT),
            (
                IndexError::Other(anyhow::anyhow!("disk full")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(error_response(error).0, expected);
        }
    }

    #[test]
    fn test_search_params_to_options() {
        let params = SearchParams {
            q: "report".to_string(),
            kind: Some(EntryKind::File),
            ext: Some(".PDF, txt".to_string()),
            sort: Some(SortBy::Size),
            order: None,
            limit: Some(5000),
            offset: 10,
        };
        let options = params.to_options();
        assert_eq!(options.kind, Some(EntryKind::File));
        assert_eq!(options.extensions, vec!["pdf", "txt"]);
        assert_eq!(options.sort_by, SortBy::Size);
        assert_eq!(options.effective_limit(), 1000);
        assert_eq!(options.offset, 10);
    }
}
