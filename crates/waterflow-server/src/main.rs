use actix_cors::Cors;
use actix_web::{get, post, web, App, HttpResponse, HttpServer, Responder};
use actix_ws::Message;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;
use waterflow_core::{EngineError, FitableInvoker, FlowContextStatus, NodeExecutor, StoreError};
use waterflow_nodes::{HttpFitableInvoker, LocalFitables};
use waterflow_runtime::{
    DefinitionLoader, ExecutorRegistry, FlowRuntime, RetryScheduler, RuntimeConfig,
};

/// Application state shared across handlers
struct AppState {
    runtime: FlowRuntime,
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    operator: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResumeRequest {
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct PositionQuery {
    position: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    status: Option<String>,
}

fn error_body(message: impl ToString) -> serde_json::Value {
    serde_json::json!({ "error": message.to_string() })
}

/// Map a runtime error onto an HTTP status
fn error_response(err: EngineError) -> HttpResponse {
    match &err {
        EngineError::StreamNotFound(_)
        | EngineError::NodeNotFound { .. }
        | EngineError::Store(StoreError::ContextNotFound(_)) => {
            HttpResponse::NotFound().json(error_body(&err))
        }
        EngineError::ContextConflict(_) | EngineError::NotSuspended { .. } => {
            HttpResponse::Conflict().json(error_body(&err))
        }
        EngineError::Definition(_) | EngineError::Serialization(_) => {
            HttpResponse::BadRequest().json(error_body(&err))
        }
        EngineError::NodeFailed(flow_err) => {
            HttpResponse::UnprocessableEntity().json(serde_json::json!({
                "error": err.to_string(),
                "code": flow_err.code,
                "kind": flow_err.kind,
            }))
        }
        EngineError::Store(_) => {
            error!("Store failure: {}", err);
            HttpResponse::InternalServerError().json(error_body(&err))
        }
    }
}

/// Health check endpoint
#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "waterflow"
    }))
}

/// List registered definitions
#[get("/api/definitions")]
async fn list_definitions(data: web::Data<AppState>) -> impl Responder {
    let definitions: Vec<_> = data
        .runtime
        .definitions()
        .await
        .iter()
        .map(|d| {
            serde_json::json!({
                "streamId": d.stream_id(),
                "name": d.name,
                "status": d.status,
                "nodes": d.nodes.len(),
            })
        })
        .collect();
    HttpResponse::Ok().json(definitions)
}

/// Register a definition document
#[post("/api/definitions")]
async fn create_definition(data: web::Data<AppState>, body: String) -> impl Responder {
    match data.runtime.register_json(&body).await {
        Ok(stream_id) => {
            info!("Registered stream {}", stream_id);
            HttpResponse::Created().json(serde_json::json!({ "streamId": stream_id }))
        }
        Err(e) => error_response(e),
    }
}

#[get("/api/definitions/{stream_id}")]
async fn get_definition(data: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    match data.runtime.definition(&path.into_inner()).await {
        Ok(definition) => HttpResponse::Ok().json(definition.as_ref()),
        Err(e) => error_response(e),
    }
}

/// Start a new trace
#[post("/api/streams/{stream_id}/start")]
async fn start_stream(
    data: web::Data<AppState>,
    path: web::Path<String>,
    req: web::Json<StartRequest>,
) -> impl Responder {
    let stream_id = path.into_inner();
    let StartRequest { data: payload, operator } = req.into_inner();

    match data.runtime.start(&stream_id, payload, operator).await {
        Ok(trace_id) => HttpResponse::Ok().json(serde_json::json!({ "traceId": trace_id })),
        Err(e) => {
            warn!("Start of {} failed: {}", stream_id, e);
            error_response(e)
        }
    }
}

/// Complete the context waiting at a node
#[post("/api/traces/{trace_id}/nodes/{node_id}/resume")]
async fn resume_node(
    data: web::Data<AppState>,
    path: web::Path<(Uuid, String)>,
    req: web::Json<ResumeRequest>,
) -> impl Responder {
    let (trace_id, node_id) = path.into_inner();
    match data
        .runtime
        .resume(trace_id, &node_id, req.into_inner().data)
        .await
    {
        Ok(contexts) => HttpResponse::Ok().json(contexts),
        Err(e) => error_response(e),
    }
}

#[get("/api/traces/{trace_id}/contexts")]
async fn trace_contexts(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
    query: web::Query<PositionQuery>,
) -> impl Responder {
    let trace_id = path.into_inner();
    let result = match &query.position {
        Some(position) => data.runtime.contexts_by_position(trace_id, position).await,
        None => data.runtime.contexts_by_trace(trace_id).await,
    };
    match result {
        Ok(contexts) => HttpResponse::Ok().json(contexts),
        Err(e) => error_response(e),
    }
}

/// Contexts by status, e.g. `?status=pending,error`; defaults to the active ones
#[get("/api/contexts")]
async fn contexts_by_status(
    data: web::Data<AppState>,
    query: web::Query<StatusQuery>,
) -> impl Responder {
    let statuses: Vec<FlowContextStatus> = match &query.status {
        None => FlowContextStatus::ACTIVE.to_vec(),
        Some(raw) => match raw
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.trim().parse::<FlowContextStatus>())
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(statuses) => statuses,
            Err(e) => return HttpResponse::BadRequest().json(error_body(e)),
        },
    };
    match data.runtime.contexts_by_status(&statuses).await {
        Ok(contexts) => HttpResponse::Ok().json(contexts),
        Err(e) => error_response(e),
    }
}

/// List executors by node kind
#[get("/api/nodes")]
async fn list_node_types(data: web::Data<AppState>) -> impl Responder {
    let registry = data.runtime.registry();
    let nodes: Vec<_> = registry
        .list_node_types()
        .into_iter()
        .map(|node_type| {
            serde_json::json!({
                "type": node_type,
                "description": registry
                    .get(node_type)
                    .map(|e| e.description().to_string())
                    .unwrap_or_default(),
            })
        })
        .collect();
    HttpResponse::Ok().json(nodes)
}

/// WebSocket endpoint for real-time events
#[get("/api/events")]
async fn websocket_events(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;

    info!("WebSocket client connected");

    let mut events = data.runtime.subscribe_events();

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if let Ok(json) = serde_json::to_string(&event) {
                                if session.text(json).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("WebSocket client lagging, {} events dropped", skipped);
                        }
                        Err(_) => break,
                    }
                }

                Some(Ok(msg)) = msg_stream.recv() => {
                    match msg {
                        Message::Ping(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                else => break,
            }
        }

        info!("WebSocket client disconnected");
        let _ = session.close(None).await;
    });

    Ok(res)
}

fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health_check)
        .service(list_definitions)
        .service(create_definition)
        .service(get_definition)
        .service(start_stream)
        .service(resume_node)
        .service(trace_contexts)
        .service(contexts_by_status)
        .service(list_node_types)
        .service(websocket_events);
}

fn broker() -> Arc<dyn FitableInvoker> {
    match std::env::var("FITABLE_BASE_URL") {
        Ok(base_url) => {
            info!("Invoking fitables over HTTP at {}", base_url);
            Arc::new(HttpFitableInvoker::new(base_url))
        }
        Err(_) => {
            warn!("FITABLE_BASE_URL not set, automatic tasks will fail with FitableNotFound");
            Arc::new(LocalFitables::new())
        }
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting waterflow server");

    let invoker = broker();
    let mut registry = ExecutorRegistry::new();
    waterflow_nodes::register_all(&mut registry, invoker.clone());
    let runtime = FlowRuntime::with_registry(Arc::new(registry), invoker, RuntimeConfig::from_env());

    if let Ok(dir) = std::env::var("WATERFLOW_DEFINITIONS_DIR") {
        DefinitionLoader::new(dir).load_into(&runtime).await?;
    }

    let (cancel, scheduler) = RetryScheduler::new(runtime.clone()).spawn();

    let app_state = web::Data::new(AppState { runtime });
    let bind_address =
        std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    info!("Server starting on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .configure(routes)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    cancel.cancel();
    scheduler.await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test};
    use serde_json::{json, Value};

    fn state() -> web::Data<AppState> {
        let fitables = LocalFitables::new();
        fitables.register_fn("greet", |_| Ok(json!({"greeted": true})));
        let invoker: Arc<dyn FitableInvoker> = Arc::new(fitables);
        let mut registry = ExecutorRegistry::new();
        waterflow_nodes::register_all(&mut registry, invoker.clone());
        web::Data::new(AppState {
            runtime: FlowRuntime::new(Arc::new(registry), invoker),
        })
    }

    fn definition() -> Value {
        json!({
            "metaId": "review",
            "nodes": [
                {"metaId": "start", "type": "start"},
                {"metaId": "greet", "type": "state", "jober": {"fitables": ["greet"]}},
                {"metaId": "approve", "type": "manualTask"},
                {"metaId": "end", "type": "end"}
            ],
            "events": [
                {"from": "start", "to": "greet"},
                {"from": "greet", "to": "approve"},
                {"from": "approve", "to": "end"}
            ]
        })
    }

    #[actix_web::test]
    async fn test_start_query_and_resume() {
        let app = test::init_service(App::new().app_data(state()).configure(routes)).await;

        let req = test::TestRequest::post()
            .uri("/api/definitions")
            .set_payload(definition().to_string())
            .to_request();
        let resp: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp["streamId"], "review-1.0.0");

        let req = test::TestRequest::post()
            .uri("/api/streams/review-1.0.0/start")
            .set_json(json!({"data": {"doc": 1}, "operator": "alice"}))
            .to_request();
        let resp: Value = test::call_and_read_body_json(&app, req).await;
        let trace = resp["traceId"].as_str().unwrap().to_string();

        let req = test::TestRequest::get()
            .uri("/api/contexts?status=pending")
            .to_request();
        let pending: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(pending.as_array().unwrap().len(), 1);
        assert_eq!(pending[0]["position"], "approve");

        let uri = format!("/api/traces/{}/nodes/approve/resume", trace);
        let req = test::TestRequest::post()
            .uri(&uri)
            .set_json(json!({"data": {"ok": true}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let req = test::TestRequest::post()
            .uri(&uri)
            .set_json(json!({"data": {}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let req = test::TestRequest::get()
            .uri(&format!("/api/traces/{}/contexts?position=end", trace))
            .to_request();
        let end: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(end[0]["status"], "ARCHIVED");
        assert_eq!(end[0]["data"], json!({"doc": 1, "greeted": true, "ok": true}));
    }

    #[actix_web::test]
    async fn test_bad_requests() {
        let app = test::init_service(App::new().app_data(state()).configure(routes)).await;

        let req = test::TestRequest::post()
            .uri("/api/definitions")
            .set_payload(r#"{"metaId": "x", "nodes": [{"metaId": "end", "type": "end"}]}"#)
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::post()
            .uri("/api/streams/missing-1.0.0/start")
            .set_json(json!({}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::get()
            .uri("/api/contexts?status=done")
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
    }
}
