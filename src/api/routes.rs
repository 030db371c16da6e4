//! API route definitions.

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::{routing::get, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;
use uuid::Uuid;

use super::error::ApiError;
use super::state::AppState;

const DEFAULT_PAGE: usize = 100;
const MAX_PAGE: usize = 1000;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/incidents", get(list_incidents))
        .route("/incidents/{id}", get(get_incident))
        .route("/audit", get(audit_page))
        .route("/audit/stream", get(audit_stream))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

async fn health(State(app): State<AppState>) -> Result<Json<Value>, ApiError> {
    let open = app.store().list_incidents(true, MAX_PAGE)?.len();
    let last_seq = app.store().last_audit_seq()?;
    Ok(Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "started_at": app.started_at.to_rfc3339(),
            "open_incidents": open,
            "last_audit_seq": last_seq
        },
        "meta": meta()
    })))
}

#[derive(Debug, Deserialize)]
struct IncidentQuery {
    #[serde(default)]
    open: bool,
    limit: Option<usize>,
}

async fn list_incidents(
    State(app): State<AppState>,
    Query(q): Query<IncidentQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = q.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let incidents = app.store().list_incidents(q.open, limit)?;
    Ok(Json(json!({
        "data": incidents,
        "meta": { "total": incidents.len(), "timestamp": chrono::Utc::now().to_rfc3339() }
    })))
}

async fn get_incident(State(app): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let id = Uuid::parse_str(&id).map_err(|_| ApiError::BadRequest(format!("invalid incident id '{id}'")))?;
    let store = app.store();
    let incident = store
        .get_incident(&id)?
        .ok_or_else(|| ApiError::NotFound(format!("incident {id} not found")))?;
    let decisions = store.decisions_for_incident(&id)?;
    let attempts = store.attempts_for_incident(&id)?;
    let audit = store.audit_for_incident(&id)?;
    Ok(Json(json!({
        "data": {
            "incident": incident,
            "decisions": decisions,
            "attempts": attempts,
            "audit": audit
        },
        "meta": meta()
    })))
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    #[serde(default)]
    after: i64,
    limit: Option<usize>,
}

async fn audit_page(State(app): State<AppState>, Query(q): Query<AuditQuery>) -> Result<Json<Value>, ApiError> {
    let limit = q.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let records = app.store().audit_after(q.after, limit)?;
    let next = records.last().and_then(|r| r.seq).unwrap_or(q.after);
    Ok(Json(json!({
        "data": records,
        "meta": { "after": q.after, "next": next, "timestamp": chrono::Utc::now().to_rfc3339() }
    })))
}

/// Live feed of committed audit records. A subscriber that falls behind
/// misses records; it can page them back in through `/audit?after=`.
async fn audit_stream(State(app): State<AppState>) -> impl IntoResponse {
    let rx = app.audit.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| {
        let record = msg.ok()?;
        let mut event = Event::default().event(record.kind.as_str());
        if let Some(seq) = record.seq {
            event = event.id(seq.to_string());
        }
        event.json_data(&record).ok().map(Ok::<Event, Infallible>)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::super::router;
    use super::*;
    use crate::audit::{AuditKind, AuditLogger, AuditRecord};
    use crate::retry::RetryPolicy;
    use crate::storage::{open_memory_pool, Store};
    use axum::http::StatusCode;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app_state() -> AppState {
        let store = Store::new(open_memory_pool().unwrap());
        AppState::new(Arc::new(AuditLogger::new(store, RetryPolicy::once())))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
        let req = axum::http::Request::builder()
            .uri(uri)
            .body(axum::body::Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get(router(app_state()), "/api/v1/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "ok");
        assert_eq!(body["data"]["open_incidents"], 0);
    }

    #[tokio::test]
    async fn test_audit_paging() {
        let state = app_state();
        for _ in 0..3 {
            state
                .audit
                .record(AuditRecord::new(AuditKind::Error).with_field("error", "x"))
                .await
                .unwrap();
        }

        let (status, body) = get(router(state.clone()), "/api/v1/audit?after=0&limit=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 2);
        let next = body["meta"]["next"].as_i64().unwrap();

        let (_, body) = get(router(state), &format!("/api/v1/audit?after={next}")).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
        assert_eq!(body["data"][0]["kind"], "error");
    }

    #[tokio::test]
    async fn test_incident_lookup_errors() {
        let state = app_state();
        let (status, _) = get(router(state.clone()), "/api/v1/incidents/not-a-uuid").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = get(router(state.clone()), &format!("/api/v1/incidents/{}", Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("not found"));

        let (status, body) = get(router(state), "/api/v1/incidents?open=true").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["meta"]["total"], 0);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let (status, _) = get(router(app_state()), "/api/v2/nothing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
