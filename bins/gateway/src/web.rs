#![cfg(feature = "web-api")]

use std::collections::HashSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post, put},
    Json, Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use gateway_core::error::GatewayError;
use gateway_core::executor::ExecutionContext;
use gateway_core::schedule::{NewSchedule, SchedulePatch};

use crate::app::Gateway;
use crate::module::{Module, ModuleCtx};

type AppState = Arc<Gateway>;

#[derive(Serialize)]
struct Status {
    uptime_ms: u64,
    backend: &'static str,
    macros: usize,
    schedules: usize,
}

#[derive(Deserialize, Default)]
struct PageQuery { page: Option<String> }

#[derive(Deserialize, Default)]
struct TabletQuery { tablet: Option<String> }

#[derive(Deserialize, Default)]
struct AuditQuery { limit: Option<usize> }

#[derive(Deserialize)]
struct ExecuteReq {
    #[serde(rename = "macro", default)]
    macro_key: String,
    /// Paths as strings (`"2.1"`) or bare top-level indices (`3`).
    #[serde(default)]
    skip_steps: Vec<Value>,
}

pub struct WebServer {
    pub http_addr: Option<SocketAddr>,
    pub https_addr: Option<SocketAddr>,
    pub tls_cert_pem: Option<String>,
    pub tls_key_pem: Option<String>,
}

impl WebServer {
    pub fn new(http: Option<SocketAddr>, https: Option<SocketAddr>, cert: Option<String>, key: Option<String>) -> Self {
        Self { http_addr: http, https_addr: https, tls_cert_pem: cert, tls_key_pem: key }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/api/macros", get(macros_list))
        .route("/api/macro/execute", post(macro_execute))
        .route("/api/macro/expand/:key", get(macro_expand))
        .route("/api/schedules", get(schedules_list))
        .route("/api/schedule", post(schedule_create))
        .route("/api/schedule/:id", put(schedule_update).delete(schedule_delete))
        .route("/api/audit", get(audit_list))
        .route("/api/events", get(events))
        .with_state(state)
}

impl Module for WebServer {
    fn name(&self) -> &'static str { "web" }

    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let app = router(ctx.gw.clone());
            let mut servers = Vec::<JoinHandle<anyhow::Result<()>>>::new();

            if let Some(addr) = self.http_addr {
                info!("web http listening on http://{}", addr);
                let app_clone = app.clone();
                let mut sd = ctx.shutdown.clone();
                servers.push(tokio::spawn(async move {
                    let listener = tokio::net::TcpListener::bind(addr).await?;
                    let serve_fut = axum::serve(listener, app_clone);
                    tokio::select! {
                        r = serve_fut => { r?; }
                        _ = sd.changed() => {}
                    }
                    Ok(())
                }));
            }

            match (self.https_addr, self.tls_cert_pem.clone(), self.tls_key_pem.clone()) {
                (Some(addr), Some(cert), Some(key)) => {
                    info!("web https listening on https://{}", addr);
                    let app_clone = app.clone();
                    let mut sd = ctx.shutdown.clone();
                    servers.push(tokio::spawn(async move {
                        let config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key).await?;
                        let serve_fut = axum_server::bind_rustls(addr, config).serve(app_clone.into_make_service());
                        tokio::select! {
                            r = serve_fut => { r?; }
                            _ = sd.changed() => {}
                        }
                        Ok(())
                    }));
                }
                (Some(addr), _, _) => warn!(%addr, "https_addr set without tls_cert_pem/tls_key_pem; not listening"),
                _ => {}
            }

            let _ = ctx.shutdown.clone().changed().await;
            for s in servers { s.await??; }
            Ok(())
        })
    }
}

fn tablet_id(headers: &HeaderMap, q: &TabletQuery) -> String {
    headers
        .get("x-tablet-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| q.tablet.clone().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| "Unknown".to_string())
}

fn skip_set(raw: &[Value]) -> HashSet<String> {
    raw.iter()
        .filter_map(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .collect()
}

fn error_response(e: GatewayError) -> Response {
    let code = match &e {
        GatewayError::UnknownMacro(_) | GatewayError::ScheduleNotFound(_) => StatusCode::NOT_FOUND,
        GatewayError::InvalidSchedule(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, Json(json!({ "success": false, "error": e.to_string() }))).into_response()
}

async fn status(State(gw): State<AppState>) -> Response {
    let schedules = gw.schedules.list().map(|s| s.len()).unwrap_or(0);
    Json(Status {
        uptime_ms: gw.started.elapsed().as_millis() as u64,
        backend: gw.backend,
        macros: gw.registry().len(),
        schedules,
    })
    .into_response()
}

async fn macros_list(State(gw): State<AppState>, Query(q): Query<PageQuery>) -> Response {
    let reg = gw.registry();
    let buttons = match q.page.as_deref().filter(|p| !p.is_empty()) {
        Some(page) => json!(reg.buttons(page)),
        None => json!(reg.all_buttons()),
    };
    Json(json!({ "macros": reg.catalog(), "buttons": buttons })).into_response()
}

async fn macro_execute(
    State(gw): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<TabletQuery>,
    Json(req): Json<ExecuteReq>,
) -> Response {
    let actor = tablet_id(&headers, &q);
    if !gw.registry().contains(&req.macro_key) {
        return error_response(GatewayError::UnknownMacro(req.macro_key));
    }
    let ctx = ExecutionContext::new(actor).skipping(skip_set(&req.skip_steps));
    info!(actor = %ctx.actor, macro_key = %req.macro_key, skipping = ctx.skip_paths.len(), "macro execute");

    match gw.executor.execute(&req.macro_key, &ctx).await {
        Ok(r) if r.success => (StatusCode::OK, Json(r)).into_response(),
        Ok(r) => (StatusCode::INTERNAL_SERVER_ERROR, Json(r)).into_response(),
        Err(GatewayError::UnknownMacro(k)) if k == req.macro_key => error_response(GatewayError::UnknownMacro(k)),
        Err(e) => match e.partial_result() {
            Some(r) => (StatusCode::INTERNAL_SERVER_ERROR, Json(r)).into_response(),
            None => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "success": false, "error": e.to_string() })))
                .into_response(),
        },
    }
}

async fn macro_expand(State(gw): State<AppState>, Path(key): Path<String>) -> Response {
    match gw.registry().expand(&key) {
        Ok(tree) => Json(tree).into_response(),
        Err(e) => error_response(e),
    }
}

async fn schedules_list(State(gw): State<AppState>) -> Response {
    match gw.schedules.list() {
        Ok(list) => Json(list).into_response(),
        Err(e) => error_response(e),
    }
}

async fn schedule_create(State(gw): State<AppState>, Json(new): Json<NewSchedule>) -> Response {
    let key = new.macro_key.trim().to_string();
    if !key.is_empty() && !gw.registry().contains(&key) {
        return error_response(GatewayError::UnknownMacro(key));
    }
    match gw.schedules.create(new) {
        Ok(s) => (StatusCode::CREATED, Json(json!({ "id": s.id, "success": true }))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn schedule_update(
    State(gw): State<AppState>,
    Path(id): Path<u64>,
    Json(patch): Json<SchedulePatch>,
) -> Response {
    if let Some(key) = patch.macro_key.as_deref() {
        if !gw.registry().contains(key.trim()) {
            return error_response(GatewayError::UnknownMacro(key.to_string()));
        }
    }
    match gw.schedules.update(id, patch) {
        Ok(_) => Json(json!({ "success": true })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn schedule_delete(State(gw): State<AppState>, Path(id): Path<u64>) -> Response {
    match gw.schedules.delete(id) {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn audit_list(State(gw): State<AppState>, Query(q): Query<AuditQuery>) -> Response {
    match gw.executor.audit().recent(q.limit.unwrap_or(50)) {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => error_response(GatewayError::Store(e)),
    }
}

async fn events(State(gw): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = gw.executor.progress().subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(ev) => {
            let json = serde_json::to_string(&ev).unwrap_or_default();
            Some(Ok(Event::default().event(ev.topic()).data(json)))
        }
        Err(_) => None, // lagged
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use gateway_core::devices::MockBackend;

    const CATALOG: &str = r#"
macros:
  warmup:
    label: Warm up
    steps:
      - { type: mixer_scene, scene: 1 }
      - { type: ha_check, entity: switch.stage, expect: "on", message: "Stage power is off" }
  outer:
    steps:
      - { type: macro, macro: warmup }
  unfinished:
    steps:
      - { type: mixer_scene, scene: 1 }
      - { type: mixer_scene, scene: 2 }
      - { type: macro, macro: ghost }
buttons:
  main:
    - section: Service
      items:
        - { label: Warm up, action: { type: macro, macro: warmup } }
"#;

    fn gw() -> AppState {
        let states = [("switch.stage".to_string(), "off".to_string())].into_iter().collect();
        Arc::new(Gateway::in_memory(CATALOG, Arc::new(MockBackend::new(states))).unwrap())
    }

    async fn body(resp: Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn exec(key: &str, skip: Value) -> Json<ExecuteReq> {
        Json(serde_json::from_value(json!({ "macro": key, "skip_steps": skip })).unwrap())
    }

    #[tokio::test]
    async fn execute_maps_outcomes_to_status_codes() {
        let gw = gw();
        let mut headers = HeaderMap::new();
        headers.insert("x-tablet-id", "LobbyTablet".parse().unwrap());

        // stage power reads "off", so the check fails
        let resp = macro_execute(State(gw.clone()), headers.clone(), Query(TabletQuery::default()), exec("warmup", json!([]))).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let v = body(resp).await;
        assert_eq!(v["error"], "Stage power is off");
        assert_eq!(v["failed_step"], "1");

        let resp = macro_execute(State(gw.clone()), headers, Query(TabletQuery::default()), exec("outer", json!(["0.1"]))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body(resp).await["steps_completed"], 1);

        let resp = macro_execute(State(gw.clone()), HeaderMap::new(), Query(TabletQuery::default()), exec("nope", json!([]))).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body(resp).await["error"], "Unknown macro: nope");

        let audit = gw.executor.audit().recent(10).unwrap();
        assert!(audit.iter().all(|a| a.actor == "LobbyTablet"));
    }

    #[tokio::test]
    async fn dangling_child_reports_counts_for_replay() {
        let gw = gw();
        let resp = macro_execute(State(gw), HeaderMap::new(), Query(TabletQuery::default()), exec("unfinished", json!([]))).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let v = body(resp).await;
        assert_eq!(v["success"], false);
        assert_eq!(v["macro"], "unfinished");
        assert_eq!(v["steps_completed"], 2);
        assert_eq!(v["steps_total"], 3);
        assert_eq!(v["failed_step"], "2");
        assert_eq!(v["error"], "Unknown macro: ghost");
    }

    #[tokio::test]
    async fn numeric_skip_steps_address_top_level() {
        let gw = gw();
        let resp = macro_execute(State(gw), HeaderMap::new(), Query(TabletQuery { tablet: Some("T2".into()) }), exec("warmup", json!([1]))).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn macros_and_expand() {
        let gw = gw();
        let v = body(macros_list(State(gw.clone()), Query(PageQuery { page: Some("main".into()) })).await).await;
        assert_eq!(v["macros"]["warmup"]["steps"], 2);
        assert_eq!(v["buttons"][0]["section"], "Service");

        let v = body(macro_expand(State(gw.clone()), Path("outer".into())).await).await;
        assert_eq!(v["steps"][0]["child_macro"], "warmup");
        assert_eq!(v["steps"][0]["children"][1]["path"], "0.1");

        let resp = macro_expand(State(gw), Path("ghost".into())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn schedule_crud_over_http() {
        let gw = gw();
        let new = |v: Value| Json(serde_json::from_value::<NewSchedule>(v).unwrap());

        let resp = schedule_create(State(gw.clone()), new(json!({ "name": "Morning", "macro": "warmup", "time": "7:30" }))).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let id = body(resp).await["id"].as_u64().unwrap();

        let resp = schedule_create(State(gw.clone()), new(json!({ "name": "X", "macro": "ghost" }))).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = schedule_create(State(gw.clone()), new(json!({ "macro": "warmup" }))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let patch: SchedulePatch = serde_json::from_value(json!({ "enabled": false, "days": "5,6" })).unwrap();
        let resp = schedule_update(State(gw.clone()), Path(id), Json(patch)).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let v = body(schedules_list(State(gw.clone())).await).await;
        assert_eq!(v[0]["time_of_day"], "07:30");
        assert_eq!(v[0]["days"], "5,6");
        assert_eq!(v[0]["enabled"], false);

        assert_eq!(schedule_delete(State(gw.clone()), Path(id)).await.status(), StatusCode::OK);
        assert_eq!(schedule_delete(State(gw), Path(id)).await.status(), StatusCode::NOT_FOUND);
    }
}
