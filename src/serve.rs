//! Query server for annotation front ends.
//!
//! A small `tiny_http` server exposing read-only queries over the shared
//! document state, plus the viewport record that steers priority rendering
//! and an on-demand extraction trigger. An empty viewport clears the record.
//!
//! | Route                                  | Response                      |
//! |----------------------------------------|-------------------------------|
//! | `GET  /api/<doc>/status`               | build report                  |
//! | `GET  /api/<doc>/lookup?line=<key>`    | lookup entry                  |
//! | `GET  /api/<doc>/canvas?page=&x=&y=`   | canvas point                  |
//! | `GET  /api/<doc>/source?x=&y=`         | page point                    |
//! | `GET  /api/<doc>/nearby?x0=&y0=&x1=&y1=` | nearby lines                |
//! | `GET  /api/<doc>/signal`               | latest reload signal or null  |
//! | `POST /api/<doc>/viewport`             | stores `{pages: [...]}`       |
//! | `POST /api/<doc>/extract`              | queues a lookup extraction    |
//! | `GET  /<doc>/<artifact>`               | file from the output dir      |
//!
//! Requests are answered on the calling thread; every query reads an
//! immutable snapshot, so the build actors never wait on the server.

use crate::{
    build::{DocumentHandle, Scheduler},
    config::AppConfig,
    coords::{CanvasRect, Mapper, find_nearby_lines},
    document::DocumentState,
    log,
    signal::{SignalDispatcher, Viewport},
};
use anyhow::{Context, Result};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::{
    fs,
    io::{Cursor, Read},
    net::SocketAddr,
    path::{Component, Path, PathBuf},
    sync::Arc,
};
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};

/// Try binding to port, retry with incremented port if in use
const MAX_PORT_RETRIES: u16 = 10;

/// Largest accepted request body.
const MAX_BODY: u64 = 64 * 1024;

// ============================================================================
// Context
// ============================================================================

/// Read side of the registry, shared with request handlers.
#[derive(Clone)]
pub struct ApiContext {
    pub config: Arc<AppConfig>,
    pub states: FxHashMap<String, Arc<DocumentState>>,
    /// Actors of the primary documents.
    pub handles: FxHashMap<String, DocumentHandle>,
    pub dispatcher: SignalDispatcher,
}

impl ApiContext {
    pub fn from_scheduler(scheduler: &Scheduler) -> Self {
        let pipeline = scheduler.pipeline();
        Self {
            config: Arc::clone(&pipeline.config),
            states: scheduler
                .states()
                .map(|s| (s.doc.name.clone(), Arc::clone(s)))
                .collect(),
            handles: scheduler
                .handles()
                .map(|h| (h.state.doc.name.clone(), h.clone()))
                .collect(),
            dispatcher: pipeline.dispatcher.clone(),
        }
    }
}

// ============================================================================
// Server Entry Point
// ============================================================================

/// Serve queries until Ctrl+C.
///
/// Blocking; the build actors keep running on the async runtime.
pub fn serve(ctx: &ApiContext) -> Result<()> {
    let interface = ctx
        .config
        .serve
        .interface_addr()
        .with_context(|| format!("Invalid interface `{}`", ctx.config.serve.interface))?;
    let (server, addr) = try_bind_port(interface, ctx.config.serve.port, MAX_PORT_RETRIES)?;
    let server = Arc::new(server);

    let server_for_signal = Arc::clone(&server);
    ctrlc::set_handler(move || {
        log!("serve"; "shutting down...");
        server_for_signal.unblock();
    })
    .context("Failed to set Ctrl+C handler")?;

    log!("serve"; "http://{}", addr);

    for request in server.incoming_requests() {
        if let Err(e) = handle_request(request, ctx) {
            log!("serve"; "request error: {e}");
        }
    }

    Ok(())
}

/// Try to bind to a port, retrying with incremented port numbers if in use.
fn try_bind_port(
    interface: std::net::IpAddr,
    base_port: u16,
    max_retries: u16,
) -> Result<(Server, SocketAddr)> {
    let mut last_error = None;
    for offset in 0..max_retries {
        let port = base_port.saturating_add(offset);
        let addr = SocketAddr::new(interface, port);

        match Server::http(addr) {
            Ok(server) => {
                if offset > 0 {
                    log!("serve"; "port {} in use, using {} instead", base_port, port);
                }
                return Ok((server, addr));
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(anyhow::anyhow!(
        "Failed to bind after {} attempts (ports {}-{}): {}",
        max_retries,
        base_port,
        base_port.saturating_add(max_retries.saturating_sub(1)),
        last_error.map(|e| e.to_string()).unwrap_or_default()
    ))
}

// ============================================================================
// Routing
// ============================================================================

/// Outcome of routing one request.
#[derive(Debug, PartialEq)]
enum Reply {
    Json(String),
    File(PathBuf),
    NoContent,
    Accepted,
    Error(u16, String),
}

impl Reply {
    fn json(value: &impl Serialize) -> Self {
        match serde_json::to_string(value) {
            Ok(json) => Self::Json(json),
            Err(e) => Self::Error(500, e.to_string()),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::Error(400, message.into())
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::Error(404, message.into())
    }
}

fn handle_request(mut request: Request, ctx: &ApiContext) -> Result<()> {
    let mut body = String::new();
    if *request.method() == Method::Post {
        request
            .as_reader()
            .take(MAX_BODY)
            .read_to_string(&mut body)
            .context("Failed to read request body")?;
    }

    let reply = route(request.method(), request.url(), &body, ctx);
    respond(request, reply, &ctx.config.serve.allow_origin)
}

/// Split `url` into decoded path segments and query parameters.
fn parse_url(url: &str) -> (Vec<String>, FxHashMap<String, String>) {
    let (path, query) = url.split_once('?').unwrap_or((url, ""));
    let decode = |s: &str| {
        urlencoding::decode(s)
            .map(std::borrow::Cow::into_owned)
            .unwrap_or_else(|_| s.to_owned())
    };

    let segments = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(decode)
        .collect();
    let params = query
        .split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode(key), decode(&value.replace('+', " ")))
        })
        .collect();
    (segments, params)
}

fn route(method: &Method, url: &str, body: &str, ctx: &ApiContext) -> Reply {
    let (segments, params) = parse_url(url);
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

    match (method, segments.as_slice()) {
        (Method::Get, ["api", doc, query]) => match ctx.states.get(*doc) {
            Some(state) => api_query(ctx, state, query, &params),
            None => Reply::not_found(format!("unknown document `{doc}`")),
        },
        (Method::Post, ["api", doc, "viewport"]) => {
            if !ctx.states.contains_key(*doc) {
                return Reply::not_found(format!("unknown document `{doc}`"));
            }
            match serde_json::from_str::<Viewport>(body) {
                Ok(viewport) if viewport.pages.is_empty() => {
                    ctx.dispatcher.clear_viewport(doc);
                    Reply::NoContent
                }
                Ok(viewport) => {
                    ctx.dispatcher.set_viewport(doc, &viewport);
                    Reply::NoContent
                }
                Err(e) => Reply::bad_request(format!("invalid viewport: {e}")),
            }
        }
        (Method::Post, ["api", doc, "extract"]) => match ctx.handles.get(*doc) {
            Some(handle) if handle.request_extraction() => Reply::Accepted,
            Some(_) => Reply::Error(503, "build actor stopped".into()),
            None if ctx.states.contains_key(*doc) => {
                Reply::Error(409, format!("`{doc}` has no sources of its own"))
            }
            None => Reply::not_found(format!("unknown document `{doc}`")),
        },
        (Method::Get, [doc, rest @ ..]) if !rest.is_empty() => match ctx.states.get(*doc) {
            Some(state) => artifact(state, rest),
            None => Reply::not_found(format!("unknown document `{doc}`")),
        },
        _ => Reply::not_found("no such route"),
    }
}

fn param<T: std::str::FromStr>(params: &FxHashMap<String, String>, name: &str) -> Result<T, Reply> {
    let value = params
        .get(name)
        .ok_or_else(|| Reply::bad_request(format!("missing parameter `{name}`")))?;
    value
        .parse()
        .map_err(|_| Reply::bad_request(format!("invalid parameter `{name}`: `{value}`")))
}

fn api_query(
    ctx: &ApiContext,
    state: &DocumentState,
    query: &str,
    params: &FxHashMap<String, String>,
) -> Reply {
    let result = match query {
        "status" => Ok(Reply::json(&state.report())),
        "signal" => Ok(Reply::json(&ctx.dispatcher.latest(&state.doc.name))),
        "lookup" => lookup(state, params),
        "canvas" => canvas(ctx, state, params),
        "source" => source(ctx, state, params),
        "nearby" => nearby(ctx, state, params),
        _ => Err(Reply::not_found(format!("unknown query `{query}`"))),
    };
    result.unwrap_or_else(|reply| reply)
}

fn lookup(state: &DocumentState, params: &FxHashMap<String, String>) -> Result<Reply, Reply> {
    let line: String = param(params, "line")?;
    let table = state
        .lookup()
        .ok_or_else(|| Reply::not_found("no lookup table yet"))?;
    table
        .get_str(&line)
        .map(Reply::json)
        .ok_or_else(|| Reply::not_found(format!("no entry for line `{line}`")))
}

fn mapper(ctx: &ApiContext, state: &DocumentState) -> Result<Mapper, Reply> {
    Mapper::for_document(state, &ctx.config.canvas).map_err(|e| Reply::Error(409, e.to_string()))
}

fn canvas(
    ctx: &ApiContext,
    state: &DocumentState,
    params: &FxHashMap<String, String>,
) -> Result<Reply, Reply> {
    let (page, x, y) = (param(params, "page")?, param(params, "x")?, param(params, "y")?);
    mapper(ctx, state)?
        .to_canvas(page, x, y)
        .map(|point| Reply::json(&point))
        .map_err(|e| Reply::not_found(e.to_string()))
}

fn source(
    ctx: &ApiContext,
    state: &DocumentState,
    params: &FxHashMap<String, String>,
) -> Result<Reply, Reply> {
    let (x, y) = (param(params, "x")?, param(params, "y")?);
    mapper(ctx, state)?
        .to_page(x, y)
        .map(|point| Reply::json(&point))
        .map_err(|e| Reply::Error(409, e.to_string()))
}

fn nearby(
    ctx: &ApiContext,
    state: &DocumentState,
    params: &FxHashMap<String, String>,
) -> Result<Reply, Reply> {
    let rect = CanvasRect::new(
        param(params, "x0")?,
        param(params, "y0")?,
        param(params, "x1")?,
        param(params, "y1")?,
    );
    let table = state
        .lookup()
        .ok_or_else(|| Reply::not_found("no lookup table yet"))?;
    find_nearby_lines(&table, &mapper(ctx, state)?, &ctx.config.canvas, rect)
        .map(|lines| Reply::json(&lines))
        .map_err(|e| Reply::Error(409, e.to_string()))
}

/// A file below the document's output directory; hidden entries and
/// parent components are refused.
fn artifact(state: &DocumentState, segments: &[&str]) -> Reply {
    let relative: PathBuf = segments.iter().collect();
    let safe = relative.components().all(|c| {
        matches!(c, Component::Normal(name) if !name.to_string_lossy().starts_with('.'))
    });
    let path = state.doc.output.join(&relative);
    if safe && path.is_file() {
        Reply::File(path)
    } else {
        Reply::not_found("404 Not Found")
    }
}

// ============================================================================
// Response Helpers
// ============================================================================

fn header(name: &str, value: &str) -> Result<Header> {
    Header::from_bytes(name, value).map_err(|()| anyhow::anyhow!("invalid header `{name}`"))
}

fn respond(request: Request, reply: Reply, allow_origin: &str) -> Result<()> {
    match reply {
        Reply::Json(json) => {
            let response = Response::from_string(json)
                .with_header(header("Content-Type", "application/json; charset=utf-8")?)
                .with_header(header("Access-Control-Allow-Origin", allow_origin)?);
            request.respond(response)?;
        }
        Reply::File(path) => {
            let content =
                fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
            let response = Response::from_data(content)
                .with_header(header("Content-Type", guess_content_type(&path))?)
                .with_header(header("Cache-Control", "no-cache")?);
            request.respond(response)?;
        }
        Reply::NoContent => {
            request.respond(Response::empty(StatusCode(204)))?;
        }
        Reply::Accepted => {
            request.respond(Response::empty(StatusCode(202)))?;
        }
        Reply::Error(status, message) => {
            let len = message.len();
            let response = Response::new(
                StatusCode(status),
                vec![header("Content-Type", "text/plain; charset=utf-8")?],
                Cursor::new(message),
                Some(len),
                None,
            );
            request.respond(response)?;
        }
    }
    Ok(())
}

/// Guess MIME content type from file extension.
fn guess_content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("pdf") => "application/pdf",
        Some("json") => "application/json; charset=utf-8",
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::testing;
    use crate::document::Document;
    use crate::signal::{MemoryStore, ReloadSignal};

    fn context(root: &Path) -> ApiContext {
        testing::project(root);
        let config = Arc::new(testing::config(root, 1));
        let state = Arc::new(DocumentState::new(Document::from_config(
            &config.documents[0],
            &config,
        )));
        fs::create_dir_all(&state.doc.output).unwrap();
        fs::write(
            state.doc.lookup_path(),
            r#"{
                "meta": {"sourceFile": "main.tex", "generatedAt": "2026-01-01T00:00:00+00:00", "totalLines": 5},
                "lines": {
                    "4": {"page": 1, "x": 72.0, "y": 100.0, "content": "Hello."},
                    "chap.tex:2": {"page": 2, "x": 72.0, "y": 50.0, "content": "Chapter."}
                }
            }"#,
        )
        .unwrap();
        state.restore_lookup();
        state.set_page_count(2);

        ApiContext {
            config,
            states: FxHashMap::from_iter([("paper".to_owned(), state)]),
            handles: FxHashMap::default(),
            dispatcher: SignalDispatcher::new(Arc::new(MemoryStore::default())),
        }
    }

    fn get(ctx: &ApiContext, url: &str) -> Reply {
        route(&Method::Get, url, "", ctx)
    }

    fn json(reply: Reply) -> serde_json::Value {
        match reply {
            Reply::Json(json) => serde_json::from_str(&json).unwrap(),
            other => panic!("expected json, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_url() {
        let (segments, params) = parse_url("/api/my%20paper/lookup?line=chap.tex%3A2&x=");
        assert_eq!(segments, vec!["api", "my paper", "lookup"]);
        assert_eq!(params["line"], "chap.tex:2");
        assert_eq!(params["x"], "");
    }

    #[test]
    fn test_lookup_query() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());

        let entry = json(get(&ctx, "/api/paper/lookup?line=4"));
        assert_eq!(entry["content"], "Hello.");
        let entry = json(get(&ctx, "/api/paper/lookup?line=chap.tex:2"));
        assert_eq!(entry["page"], 2);

        assert!(matches!(get(&ctx, "/api/paper/lookup?line=9"), Reply::Error(404, _)));
        assert!(matches!(get(&ctx, "/api/paper/lookup"), Reply::Error(400, _)));
        assert!(matches!(get(&ctx, "/api/thesis/lookup?line=4"), Reply::Error(404, _)));
    }

    #[test]
    fn test_coordinate_queries() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let canvas = &ctx.config.canvas;
        let scale = canvas.target_width / canvas.page_width;

        let point = json(get(&ctx, "/api/paper/canvas?page=1&x=72&y=100"));
        assert!((point["x"].as_f64().unwrap() - 72.0 * scale).abs() < 1e-9);

        let url = format!("/api/paper/source?x={}&y={}", 72.0 * scale, 100.0 * scale);
        let point = json(get(&ctx, &url));
        assert_eq!(point["page"], 1);
        assert!((point["y"].as_f64().unwrap() - 100.0).abs() < 1e-9);

        assert!(matches!(
            get(&ctx, "/api/paper/canvas?page=1&x=abc&y=0"),
            Reply::Error(400, _)
        ));
    }

    #[test]
    fn test_nearby_query() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let scale = ctx.config.canvas.target_width / ctx.config.canvas.page_width;

        let y = 100.0 * scale;
        let url = format!("/api/paper/nearby?x0=0&y0={}&x1=20&y1={}", y - 5.0, y + 5.0);
        let lines = json(get(&ctx, &url));
        assert_eq!(lines.as_array().unwrap().len(), 1);
        assert_eq!(lines[0]["line"], "4");
    }

    #[test]
    fn test_viewport_and_signal() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());

        assert_eq!(json(get(&ctx, "/api/paper/signal")), serde_json::Value::Null);

        let reply = route(&Method::Post, "/api/paper/viewport", r#"{"pages":[2,3]}"#, &ctx);
        assert_eq!(reply, Reply::NoContent);
        assert_eq!(ctx.dispatcher.priority_pages("paper"), vec![2, 3]);

        let reply = route(&Method::Post, "/api/paper/viewport", "{", &ctx);
        assert!(matches!(reply, Reply::Error(400, _)));

        // an empty page list forgets the viewport
        let reply = route(&Method::Post, "/api/paper/viewport", r#"{"pages":[]}"#, &ctx);
        assert_eq!(reply, Reply::NoContent);
        assert!(ctx.dispatcher.viewport("paper").is_none());

        ctx.dispatcher.publish("paper", &ReloadSignal::full());
        assert_eq!(json(get(&ctx, "/api/paper/signal"))["type"], "full");
    }

    #[test]
    fn test_status_and_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());

        let status = json(get(&ctx, "/api/paper/status"));
        assert_eq!(status["status"], "none");
        assert_eq!(status["pageCount"], 2);

        let output = &ctx.states["paper"].doc.output;
        fs::write(output.join("page-1.svg"), "<svg/>").unwrap();
        assert_eq!(
            get(&ctx, "/paper/page-1.svg"),
            Reply::File(output.join("page-1.svg"))
        );
        assert!(matches!(get(&ctx, "/paper/../src/main.tex"), Reply::Error(404, _)));
        assert!(matches!(get(&ctx, "/paper/.staging"), Reply::Error(404, _)));
        assert!(matches!(get(&ctx, "/paper/page-9.svg"), Reply::Error(404, _)));
    }

    #[test]
    fn test_extract_needs_an_actor() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());

        // no actor runs for a document built elsewhere
        let reply = route(&Method::Post, "/api/paper/extract", "", &ctx);
        assert!(matches!(reply, Reply::Error(409, _)));
        let reply = route(&Method::Post, "/api/thesis/extract", "", &ctx);
        assert!(matches!(reply, Reply::Error(404, _)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extract_route_installs_table() {
        use crate::build::Pipeline;
        use crate::compiler::{FormatCache, testing::FakeRunner};
        use flate2::{Compression, write::GzEncoder};
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        testing::project(dir.path());
        let config = Arc::new(testing::config(dir.path(), 1));
        let scheduler = Scheduler::start(Pipeline {
            config,
            runner: Arc::new(FakeRunner::new(1)),
            formats: FormatCache::default(),
            dispatcher: SignalDispatcher::new(Arc::new(MemoryStore::default())),
        });
        let ctx = ApiContext::from_scheduler(&scheduler);
        let doc = &ctx.states["paper"].doc;

        let log = format!(
            "Input:1:{}\n{{1\nx1,4:4718592,655360\n",
            doc.main_path().unwrap().display()
        );
        fs::create_dir_all(doc.build_dir()).unwrap();
        let mut gz = GzEncoder::new(fs::File::create(doc.synctex_path()).unwrap(), Compression::default());
        gz.write_all(log.as_bytes()).unwrap();
        gz.finish().unwrap();

        assert!(matches!(get(&ctx, "/api/paper/lookup?line=4"), Reply::Error(404, _)));
        assert_eq!(route(&Method::Post, "/api/paper/extract", "", &ctx), Reply::Accepted);
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;

        let entry = json(get(&ctx, "/api/paper/lookup?line=4"));
        assert_eq!(entry["x"], 72.0);
        scheduler.shutdown().await;
    }
}
