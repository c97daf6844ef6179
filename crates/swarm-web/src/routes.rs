use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use swarm_core::{AgentEventRecord, MetricsSnapshot, WorkItem};

use crate::error::WebError;
use crate::model::{group_pr_views, AgentRunView, PrView};
use crate::store::DashboardStore;

type SharedStore = Arc<dyn DashboardStore>;

pub fn router(store: SharedStore) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/metrics", get(metrics))
        .route("/api/agents", get(list_agents))
        .route("/api/agents/{agent_id}/logs", get(agent_logs))
        .route("/api/issues", get(list_issues))
        .route("/api/prs", get(list_prs))
        .with_state(store)
}

const INDEX_PAGE: &str = r#"<!doctype html>
<html>
<head><title>swarm dashboard</title></head>
<body>
<h1>swarm orchestrator</h1>
<p>Read-only API: <code>/api/metrics</code>, <code>/api/agents</code>,
<code>/api/agents/{id}/logs?since=N</code>, <code>/api/issues</code>, <code>/api/prs</code></p>
</body>
</html>
"#;

async fn index() -> impl IntoResponse {
    Html(INDEX_PAGE)
}

async fn metrics(State(store): State<SharedStore>) -> Result<Json<MetricsSnapshot>, WebError> {
    let snapshot = blocking(move || store.metrics()).await?;
    Ok(Json(snapshot))
}

#[derive(Debug, Serialize)]
struct AgentsResponse {
    agents: Vec<AgentRunView>,
}

async fn list_agents(State(store): State<SharedStore>) -> Result<Json<AgentsResponse>, WebError> {
    let runs = blocking(move || store.agent_runs()).await?;
    let agents = runs.iter().map(AgentRunView::from).collect();
    Ok(Json(AgentsResponse { agents }))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default)]
    since: i64,
}

#[derive(Debug, Serialize)]
struct LogsResponse {
    events: Vec<AgentEventRecord>,
}

async fn agent_logs(
    State(store): State<SharedStore>,
    Path(agent_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsResponse>, WebError> {
    let events = blocking(move || store.agent_events(&agent_id, query.since)).await?;
    Ok(Json(LogsResponse { events }))
}

#[derive(Debug, Serialize)]
struct IssuesResponse {
    issues: Vec<WorkItem>,
}

async fn list_issues(State(store): State<SharedStore>) -> Result<Json<IssuesResponse>, WebError> {
    let issues = blocking(move || store.work_items()).await?;
    Ok(Json(IssuesResponse { issues }))
}

#[derive(Debug, Serialize)]
struct PrsResponse {
    prs: Vec<PrView>,
}

async fn list_prs(State(store): State<SharedStore>) -> Result<Json<PrsResponse>, WebError> {
    let iterations = blocking(move || store.review_iterations()).await?;
    Ok(Json(PrsResponse {
        prs: group_pr_views(&iterations),
    }))
}

/// Store queries are synchronous SQLite reads; keep them off the async
/// workers.
async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> Result<T, crate::store::QueryError> + Send + 'static,
) -> Result<T, WebError> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| WebError::Internal {
            message: format!("blocking task failed: {err}"),
        })?
        .map_err(WebError::from)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use tower::ServiceExt;

    use swarm_core::{
        AgentEventKind, AgentEventRecord, AgentId, AgentKind, AgentRun, AgentRunStatus,
        MetricsSnapshot, ReviewIteration, ReviewIterationStatus, WorkItem,
    };

    use crate::store::{DashboardStore, QueryError};

    use super::router;

    #[derive(Default)]
    struct StubStore {
        runs: Vec<AgentRun>,
        events: Vec<AgentEventRecord>,
        items: Vec<WorkItem>,
        iterations: Vec<ReviewIteration>,
        metrics: MetricsSnapshot,
    }

    impl DashboardStore for StubStore {
        fn metrics(&self) -> Result<MetricsSnapshot, QueryError> {
            Ok(self.metrics.clone())
        }

        fn agent_runs(&self) -> Result<Vec<AgentRun>, QueryError> {
            Ok(self.runs.clone())
        }

        fn agent_events(
            &self,
            agent_id: &str,
            since_id: i64,
        ) -> Result<Vec<AgentEventRecord>, QueryError> {
            Ok(self
                .events
                .iter()
                .filter(|e| e.agent_id.as_str() == agent_id && e.id > since_id)
                .cloned()
                .collect())
        }

        fn work_items(&self) -> Result<Vec<WorkItem>, QueryError> {
            Ok(self.items.clone())
        }

        fn review_iterations(&self) -> Result<Vec<ReviewIteration>, QueryError> {
            Ok(self.iterations.clone())
        }
    }

    fn mk_run(agent_id: &str) -> AgentRun {
        AgentRun {
            agent_id: AgentId::new(agent_id),
            work_item_number: 7,
            pr_number: Some(55),
            kind: AgentKind::Implement,
            status: AgentRunStatus::Completed,
            worktree_path: None,
            branch_name: None,
            pid: None,
            session_id: None,
            resume_count: 0,
            rate_limited_at: None,
            turns_used: 4,
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            error_message: None,
        }
    }

    fn mk_event(id: i64, agent_id: &str) -> AgentEventRecord {
        AgentEventRecord {
            id,
            agent_id: AgentId::new(agent_id),
            kind: AgentEventKind::Assistant,
            payload: "{\"type\":\"assistant\"}".to_string(),
            timestamp: Utc::now(),
        }
    }

    async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .expect("request");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_counters() {
        let store = StubStore {
            metrics: MetricsSnapshot {
                resolved: 3,
                pending: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let app = router(Arc::new(store));
        let (status, body) = get_json(app, "/api/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["resolved"], 3);
        assert_eq!(body["pending"], 1);
    }

    #[tokio::test]
    async fn agents_endpoint_lists_runs_with_views() {
        let store = StubStore {
            runs: vec![mk_run("agent-issue-7-attempt-1")],
            ..Default::default()
        };
        let app = router(Arc::new(store));
        let (status, body) = get_json(app, "/api/agents").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["agents"][0]["agent_id"], "agent-issue-7-attempt-1");
        assert_eq!(body["agents"][0]["turns_used"], 4);
    }

    #[tokio::test]
    async fn logs_endpoint_pages_by_since_id() {
        let store = StubStore {
            events: vec![mk_event(1, "a-1"), mk_event(2, "a-1"), mk_event(3, "other")],
            ..Default::default()
        };
        let app = router(Arc::new(store));

        let (status, body) = get_json(app.clone(), "/api/agents/a-1/logs?since=1").await;
        assert_eq!(status, StatusCode::OK);
        let events = body["events"].as_array().expect("array");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["id"], 2);

        let (_, all) = get_json(app, "/api/agents/a-1/logs").await;
        assert_eq!(all["events"].as_array().expect("array").len(), 2);
    }

    #[tokio::test]
    async fn issues_and_prs_endpoints_round_trip() {
        let store = StubStore {
            items: vec![WorkItem::new(42, "Add endpoint", "plan")],
            iterations: vec![ReviewIteration {
                id: 1,
                pr_number: 99,
                iteration: 2,
                comments_count: 3,
                comments_json: None,
                agent_id: None,
                status: ReviewIterationStatus::Fixing,
                created_at: Utc::now(),
            }],
            ..Default::default()
        };
        let app = router(Arc::new(store));

        let (status, issues) = get_json(app.clone(), "/api/issues").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(issues["issues"][0]["number"], 42);
        assert_eq!(issues["issues"][0]["status"], "pending");

        let (status, prs) = get_json(app, "/api/prs").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(prs["prs"][0]["pr_number"], 99);
        assert_eq!(prs["prs"][0]["iterations"], 2);
        assert_eq!(prs["prs"][0]["latest_status"], "fixing");
    }

    #[tokio::test]
    async fn index_serves_the_static_page() {
        let app = router(Arc::new(StubStore::default()));
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        assert!(String::from_utf8_lossy(&bytes).contains("swarm orchestrator"));
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let app = router(Arc::new(StubStore::default()));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/unknown")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
