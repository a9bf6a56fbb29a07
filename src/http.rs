//! HTTP status surface — a human-readable summary page and a JSON health
//! endpoint for the hosting platform's checks.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::State,
    response::Html,
    routing::get,
};

use crate::store::Store;

/// Shared state for the status routes.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub started_at: Instant,
}

/// Build the status router.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .with_state(state)
}

async fn index(State(state): State<AppState>) -> Html<String> {
    let body = match state.store.counts().await {
        Ok(counts) => format!(
            "<h1>groupsmith</h1>\
             <p>✅ Service is running</p>\
             <ul>\
             <li>Users: {}</li>\
             <li>Linked accounts: {}</li>\
             <li>Groups created: {}</li>\
             </ul>",
            counts.users, counts.accounts, counts.groups
        ),
        Err(e) => {
            tracing::warn!("Status page could not read counts: {e}");
            "<h1>groupsmith</h1>\
             <p>✅ Service is running</p>\
             <p>⚠️ Database stats temporarily unavailable</p>"
                .to_string()
        }
    };
    Html(format!("<!DOCTYPE html><html><body>{body}</body></html>"))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let db_ok = state.store.counts().await.is_ok();
    Json(serde_json::json!({
        "status": "ok",
        "database": db_ok,
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::store::LibSqlStore;

    async fn state() -> AppState {
        AppState {
            store: Arc::new(LibSqlStore::new_memory().await.unwrap()),
            started_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn health_reports_reachable_database() {
        let body = health(State(state().await)).await.0;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["database"], true);
    }

    #[tokio::test]
    async fn index_shows_counts() {
        let state = state().await;
        state.store.upsert_user(1, "Alice", false).await.unwrap();
        let Html(page) = index(State(state)).await;
        assert!(page.contains("Users: 1"));
        assert!(page.contains("groupsmith"));
    }
}
