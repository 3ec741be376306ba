use axum::{extract::{Path, State}, http::{HeaderMap, StatusCode}, routing::{get, post}, Json, Router};
use nlp_core::stats::{PipelineStats, PipelineStatsSnapshot};
use nlp_core::topic::Topic;
use nlp_core::{Document, Pipeline, ScoreRecord, Tables, DOCUMENTS_KEY};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// A single document or a batch.
#[derive(Deserialize)]
#[serde(untagged)]
pub enum SubmitBody {
    One(Document),
    Many(Vec<Document>),
}

#[derive(Serialize)]
pub struct SubmitResponse {
    pub accepted: usize,
}

#[derive(Serialize)]
pub struct DocumentResponse {
    pub document: String,
    /// Absent when no term of the document has scored above zero yet.
    pub term: Option<String>,
    pub tfidf: f64,
}

#[derive(Serialize)]
pub struct TermResponse {
    pub term: String,
    pub document_frequency: u64,
    pub occurrences: u64,
    pub document_count: u64,
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub document_count: u64,
    pub tracked_documents: usize,
    #[serde(flatten)]
    pub stages: PipelineStatsSnapshot,
}

#[derive(Clone)]
pub struct AppState {
    pub documents: Topic,
    pub tables: Tables,
    pub stats: PipelineStats,
    /// Latest improvement seen on MostImportantTerm, per document.
    pub latest: Arc<RwLock<HashMap<String, ScoreRecord>>>,
    pub admin_token: Option<String>,
}

/// Build the HTTP app around a running pipeline. Takes over the pipeline's
/// MostImportantTerm channel; the pipeline only drains once the returned
/// router (and every clone of it) is dropped.
pub fn build_app(pipeline: &mut Pipeline, admin_token: Option<String>) -> Router {
    let latest: Arc<RwLock<HashMap<String, ScoreRecord>>> = Arc::default();
    if let Some(mut subscription) = pipeline.take_most_important() {
        let latest = Arc::clone(&latest);
        tokio::spawn(async move {
            while let Some(record) = subscription.recv().await {
                match record {
                    Ok(record) => {
                        tracing::debug!(document = %record.document, term = %record.term, tfidf = record.tfidf, "most important term");
                        latest.write().insert(record.document.clone(), record);
                    }
                    Err(e) => tracing::error!(error = %e, "unreadable most important term record"),
                }
            }
        });
    } else {
        tracing::warn!("most important term channel already taken; /documents/:key only reports scores");
    }

    let app_state = AppState {
        documents: pipeline.documents(),
        tables: pipeline.tables().clone(),
        stats: pipeline.stats().clone(),
        latest,
        admin_token,
    };

    // CORS: read CORS_ALLOW_ORIGIN (comma-separated) or allow Any by default
    let cors = match std::env::var("CORS_ALLOW_ORIGIN") {
        Ok(val) => {
            let origins: Vec<_> = val
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            if origins.is_empty() {
                CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
            } else {
                CorsLayer::new().allow_origin(AllowOrigin::list(origins)).allow_methods(Any).allow_headers(Any)
            }
        }
        Err(_) => CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any),
    };

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/documents", post(submit_handler))
        .route("/documents/:key", get(document_handler))
        .route("/terms/:term", get(term_handler))
        .route("/stats", get(stats_handler))
        .with_state(app_state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

pub async fn submit_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SubmitBody>,
) -> Result<(StatusCode, Json<SubmitResponse>), (StatusCode, String)> {
    authorize(&state, &headers)?;
    let docs = match body {
        SubmitBody::One(doc) => vec![doc],
        SubmitBody::Many(docs) => docs,
    };
    for doc in &docs {
        if doc.key.is_empty() {
            return Err((StatusCode::BAD_REQUEST, "document key must not be empty".into()));
        }
    }
    let mut accepted = 0;
    for doc in docs {
        state
            .documents
            .send_raw(&doc.key, doc.text.into_bytes())
            .await
            .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
        accepted += 1;
    }
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { accepted })))
}

pub async fn document_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<DocumentResponse>, (StatusCode, String)> {
    if let Some(record) = state.latest.read().get(&key) {
        return Ok(Json(DocumentResponse { document: key, term: Some(record.term.clone()), tfidf: record.tfidf }));
    }
    // known from an earlier run, or nothing scored above zero yet
    if state.tables.most_important_score.contains(&key) {
        let tfidf = state.tables.most_important_score.get(&key);
        return Ok(Json(DocumentResponse { document: key, term: None, tfidf }));
    }
    Err((StatusCode::NOT_FOUND, format!("unknown document {key}")))
}

pub async fn term_handler(State(state): State<AppState>, Path(term): Path<String>) -> Json<TermResponse> {
    Json(TermResponse {
        document_frequency: state.tables.document_frequency.get(&term),
        occurrences: state.tables.term_occurrence.get(&term),
        document_count: state.tables.document_count.get(DOCUMENTS_KEY),
        term,
    })
}

pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        document_count: state.tables.document_count.get(DOCUMENTS_KEY),
        tracked_documents: state.tables.most_important_score.len(),
        stages: state.stats.snapshot(),
    })
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), (StatusCode, String)> {
    let Some(required) = &state.admin_token else { return Ok(()) };
    let provided = headers.get("X-ADMIN-TOKEN").and_then(|v| v.to_str().ok()).unwrap_or("");
    if provided == required {
        Ok(())
    } else {
        Err((StatusCode::UNAUTHORIZED, "invalid admin token".into()))
    }
}
