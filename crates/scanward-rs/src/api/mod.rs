use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    ledger::LedgerError,
    models::{LaunchedTask, NmapScanSpeed, Task, TaskResults, TaskStatus},
    AppState,
};

const NOT_FOUND: &str = "NOT_FOUND";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/scanner/fscan", get(run_fscan))
        .route("/scanner/nmap", get(run_nmap))
        .route("/scanner/diy", get(run_diy))
        .route("/scanner/getTaskStatus", get(task_status))
        .route("/scanner/getTaskResults", get(task_results))
        .route("/scanner/getTask", get(task_record))
        .with_state(state)
}

pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "service": "scanward-rs"}))
}

#[derive(Debug, Deserialize)]
pub struct FscanQuery {
    target: String,
    threads: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct NmapQuery {
    target: String,
    timeout: Option<u64>,
    /// Comma separated, e.g. `22,80,443`. Absent means every port.
    ports: Option<String>,
    speed: Option<NmapScanSpeed>,
}

#[derive(Debug, Deserialize)]
pub struct DiyQuery {
    command: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskQuery {
    task_id: String,
}

pub async fn run_fscan(State(state): State<AppState>, Query(q): Query<FscanQuery>) -> Response {
    launched(state.orchestrator.run_fscan(&q.target, q.threads).await)
}

pub async fn run_nmap(State(state): State<AppState>, Query(q): Query<NmapQuery>) -> Response {
    let ports = match parse_ports(q.ports.as_deref()) {
        Ok(ports) => ports,
        Err(msg) => return (StatusCode::BAD_REQUEST, msg).into_response(),
    };
    launched(
        state
            .orchestrator
            .run_nmap(&q.target, q.timeout, ports, q.speed)
            .await,
    )
}

pub async fn run_diy(State(state): State<AppState>, Query(q): Query<DiyQuery>) -> Response {
    launched(state.orchestrator.run_diy(&q.command).await)
}

pub async fn task_status(State(state): State<AppState>, Query(q): Query<TaskQuery>) -> Response {
    match state.orchestrator.status(&q.task_id).await {
        Ok(status) => Json(status_body(status)).into_response(),
        Err(e) => internal(e),
    }
}

pub async fn task_results(State(state): State<AppState>, Query(q): Query<TaskQuery>) -> Response {
    match state.orchestrator.results(&q.task_id).await {
        Ok(results) => Json(results_body(results)).into_response(),
        Err(e) => internal(e),
    }
}

pub async fn task_record(State(state): State<AppState>, Query(q): Query<TaskQuery>) -> Response {
    match state.orchestrator.task(&q.task_id).await {
        Ok(task) => task_response(task),
        Err(e) => internal(e),
    }
}

fn task_response(task: Option<Task>) -> Response {
    match task {
        Some(task) => Json(task).into_response(),
        None => (StatusCode::NOT_FOUND, Json(status_body(None))).into_response(),
    }
}

fn launched(result: Result<LaunchedTask, LedgerError>) -> Response {
    match result {
        Ok(task) => Json(json!({"taskId": task.task_id})).into_response(),
        Err(e) => internal(e),
    }
}

fn internal(e: LedgerError) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

fn status_body(status: Option<TaskStatus>) -> Value {
    json!({"status": status.map_or(NOT_FOUND, TaskStatus::as_str)})
}

fn results_body(results: Option<TaskResults>) -> Value {
    match results {
        Some(results) => json!({"results": results}),
        None => json!({"results": []}),
    }
}

fn parse_ports(raw: Option<&str>) -> Result<Vec<u16>, String> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<u16>().map_err(|_| format!("invalid port: {p}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_are_comma_separated() {
        assert_eq!(parse_ports(None).unwrap(), Vec::<u16>::new());
        assert_eq!(parse_ports(Some("")).unwrap(), Vec::<u16>::new());
        assert_eq!(parse_ports(Some("22, 80,443,")).unwrap(), vec![22, 80, 443]);
        assert_eq!(parse_ports(Some("22,http")).unwrap_err(), "invalid port: http");
        assert!(parse_ports(Some("70000")).is_err());
    }

    #[test]
    fn unknown_tasks_use_sentinels() {
        assert_eq!(status_body(None), json!({"status": "NOT_FOUND"}));
        assert_eq!(
            status_body(Some(TaskStatus::InProgress)),
            json!({"status": "IN_PROGRESS"})
        );
        assert_eq!(results_body(None), json!({"results": []}));
    }

    #[test]
    fn stored_results_are_returned_as_is() {
        let body = results_body(Some(TaskResults::Log {
            text: "ok".into(),
            truncated: false,
        }));
        assert_eq!(
            body,
            json!({"results": {"kind": "log", "data": {"text": "ok", "truncated": false}}})
        );
    }

    #[test]
    fn task_records_report_missing_ids() {
        assert_eq!(task_response(None).status(), StatusCode::NOT_FOUND);

        let task = Task::new("t1", "sudo -n id", "/tmp/diy_t1.log", "run_diy_command");
        assert_eq!(task_response(Some(task)).status(), StatusCode::OK);
        let q: TaskQuery = query_from("taskId=t1");
        assert_eq!(q.task_id, "t1");
    }

    #[test]
    fn speed_binds_from_query_strings() {
        let q: NmapQuery =
            query_from("target=10.0.0.1&speed=2&ports=22,80&timeout=30");
        assert_eq!(q.speed, Some(NmapScanSpeed::Medium));
        assert_eq!(q.timeout, Some(30));
        assert_eq!(q.ports.as_deref(), Some("22,80"));
    }

    fn query_from<T: serde::de::DeserializeOwned>(query: &str) -> T {
        let uri: axum::http::Uri = format!("http://localhost/scanner/nmap?{query}").parse().unwrap();
        Query::<T>::try_from_uri(&uri).unwrap().0
    }
}
