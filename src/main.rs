//! Zone router + dual listeners (spec §4.8, "A2").
//!
//! Grounded in `original_source/cmd/snowedin/main.go` (config load, signal
//! shutdown) and `web/web.go`/`api/api.go` (the two-listener topology). The
//! accept-loop-plus-`tokio::select!` shutdown shape is kept from the
//! teacher's own `main`; everything inside a connection is new, since the
//! teacher served one fixed directory and this router dispatches into
//! per-zone handlers picked by path prefix and `Host`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::time::timeout;
use tracing::{error, info, info_span, trace, warn, Instrument};

use edgezone::backend::filesystem::{FilesystemBackend, FsBackendConfig};
use edgezone::config::Config;
use edgezone::http::{reason_phrase, Headers, Method, RequestCtx};
use edgezone::zone::Zone;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// One zone behind its filesystem backend. The router is generic over
/// `Backend` only at the `Zone` level; at the top it erases to this single
/// concrete type since `filesystem` is the only shipped backend (spec §4.7).
struct Router {
    zones: HashMap<String, Zone<FilesystemBackend>>,
    log_level: u8,
}

impl Router {
    fn from_config(config: &Config) -> Self {
        let mut zones = HashMap::new();
        for zone_cfg in &config.zones {
            let name = zone_cfg.name.clone();
            let fs_config = FsBackendConfig::from_settings(&zone_cfg.backend_settings);
            let backend = FilesystemBackend::new(fs_config);
            zones.insert(name, Zone::new(zone_cfg.clone(), backend));
        }
        Self { zones, log_level: config.log_level }
    }

    fn find(&self, name: &str) -> Option<&Zone<FilesystemBackend>> {
        self.zones.get(name)
    }
}

fn init_tracing(log_level: u8) {
    let filter = match log_level {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config() -> Config {
    let path = std::env::var("KISS_CONFIG").unwrap_or_else(|_| "./config.yml".to_string());
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to read config file {path}: {e}");
            std::process::exit(1);
        }
    };
    match serde_yaml::from_str(&contents) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to parse config: {e}");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    let config = load_config();
    init_tracing(config.log_level);

    let router = Arc::new(Router::from_config(&config));
    let read_timeout = config.listen.read_timeout();
    let write_timeout = config.listen.write_timeout();
    let idle_timeout = config.listen.idle_timeout();

    let web_listener = TcpListener::bind(config.listen.web.as_str())
        .await
        .unwrap_or_else(|e| panic!("failed to bind web listener {}: {e}", config.listen.web));
    let api_listener = TcpListener::bind(config.listen.api.as_str())
        .await
        .unwrap_or_else(|e| panic!("failed to bind api listener {}: {e}", config.listen.api));

    info!(web = %config.listen.web, api = %config.listen.api, "zone engine listening");

    let web_router = router.clone();
    let web_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                result = web_listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let _ = stream.set_nodelay(true);
                            let router = web_router.clone();
                            tokio::spawn(handle_web_connection(stream, peer.ip().to_string(), router, read_timeout, write_timeout, idle_timeout));
                        }
                        Err(e) => {
                            warn!(error = %e, "web accept failed");
                            continue;
                        }
                    }
                }
                _ = shutdown_signal() => {
                    SHUTDOWN.store(true, Ordering::Relaxed);
                    break;
                }
            }
        }
    });

    let api_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                result = api_listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            tokio::spawn(handle_api_connection(stream, read_timeout, write_timeout));
                        }
                        Err(e) => {
                            warn!(error = %e, "api accept failed");
                            continue;
                        }
                    }
                }
                _ = shutdown_signal() => {
                    SHUTDOWN.store(true, Ordering::Relaxed);
                    break;
                }
            }
        }
    });

    let _ = tokio::join!(web_task, api_task);
    info!("zone engine shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Routeless API listener: every accepted connection reads one request and
/// answers `404`, matching the original's empty `mux.Router` (spec §1, §4.8).
async fn handle_api_connection(mut stream: TcpStream, read_timeout: Duration, write_timeout: Duration) {
    let mut buf = [0u8; 4096];
    if timeout(read_timeout, stream.read(&mut buf)).await.is_err() {
        return;
    }
    let body = b"Not Found";
    let response = format!(
        "HTTP/1.1 404 Not Found\r\nContent-Length: {}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n",
        body.len()
    );
    let _ = timeout(write_timeout, async {
        stream.write_all(response.as_bytes()).await?;
        stream.write_all(body).await
    })
    .await;
}

async fn handle_web_connection(
    mut stream: TcpStream,
    client_ip: String,
    router: Arc<Router>,
    read_timeout: Duration,
    write_timeout: Duration,
    idle_timeout: Duration,
) {
    loop {
        if SHUTDOWN.load(Ordering::Relaxed) {
            return;
        }
        // `idle_timeout` bounds the wait for a new request to start on a
        // kept-alive connection; `read_timeout` bounds finishing it once
        // the first byte has arrived (spec §4.8).
        match timeout(idle_timeout, stream.readable()).await {
            Ok(Ok(())) => {}
            _ => return,
        }
        match timeout(read_timeout, read_request(&mut stream)).await {
            Ok(Ok(Some(raw))) => {
                let keep_alive = raw.headers.get("connection").map(|v| !v.eq_ignore_ascii_case("close")).unwrap_or(true);
                let result = timeout(write_timeout, dispatch(&router, &raw, &client_ip, &mut stream)).await;
                if result.is_err() || !keep_alive {
                    return;
                }
            }
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                warn!(error = %e, "request parse failed");
                return;
            }
            Err(_) => return,
        }
    }
}

struct RawRequest {
    method: Method,
    path: String,
    headers: Headers,
}

/// Reads one HTTP/1.1 request off `stream` using `httparse` for the request
/// line and header split (spec §4.8) — a drop-in generalization of the
/// teacher's own hand-rolled two-header parser to the full conditional/range
/// header set this crate reads.
async fn read_request(stream: &mut TcpStream) -> std::io::Result<Option<RawRequest>> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut header_storage = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Request::new(&mut header_storage);
        match parsed.parse(&buf) {
            Ok(httparse::Status::Complete(_)) => {
                let method = Method::parse(parsed.method.unwrap_or(""));
                let path = parsed.path.unwrap_or("/").to_string();
                let mut headers = Headers::new();
                for h in parsed.headers.iter() {
                    headers.push(h.name.to_string(), String::from_utf8_lossy(h.value).into_owned());
                }
                return Ok(Some(RawRequest { method, path, headers }));
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() > 64 * 1024 {
                    return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "request head too large"));
                }
                continue;
            }
            Err(e) => {
                return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()));
            }
        }
    }
}

/// Splits `/{zone}/{rest}` into `(zone_name, "/rest")`, extracting the
/// leading path segment as the zone name the way spec.md §6 describes —
/// the rest is handed to the zone unchanged so it can run its own
/// normalization.
fn split_zone_prefix(path: &str) -> (&str, &str) {
    let trimmed = path.trim_start_matches('/');
    match trimmed.split_once('/') {
        Some((zone, rest)) => (zone, rest),
        None => (trimmed, ""),
    }
}

async fn dispatch(router: &Router, raw: &RawRequest, client_ip: &str, stream: &mut TcpStream) -> std::io::Result<()> {
    if !raw.method.is_recognized() {
        return write_router_error(stream, 405, "Method Not Allowed", Some("OPTIONS, GET, HEAD, DELETE")).await;
    }

    let (zone_name, rest) = split_zone_prefix(&raw.path);
    let span = info_span!("request", zone = zone_name, path = %raw.path, client_ip = %client_ip);
    let _enter = span.enter();
    log_request_headers(router.log_level, raw, client_ip);

    let Some(zone) = router.find(zone_name) else {
        drop(_enter);
        return write_router_error(stream, 404, "Not Found", None).await;
    };

    let host = raw.headers.get("host");
    if !zone.host_allowed(host) {
        drop(_enter);
        return write_router_error(stream, 403, "Forbidden Host", None).await;
    }

    let zone_path = format!("/{rest}");
    let ctx = RequestCtx::new(raw.method.clone(), zone_path, raw.headers.clone(), client_ip.to_string());
    drop(_enter);
    if let Err(e) = zone.handle(&ctx, stream).instrument(span).await {
        error!(zone = zone_name, error = %e, "zone handler failed");
    }
    Ok(())
}

/// Mirrors the original's "level ≥ 3 dumps headers" behavior
/// (`cdn/utils/log.go`'s `LogHeaders`): a one-line summary at level 3, every
/// header traced individually at level 4.
fn log_request_headers(log_level: u8, raw: &RawRequest, client_ip: &str) {
    if log_level < 3 {
        return;
    }
    tracing::debug!(method = %raw.method, path = %raw.path, client_ip = %client_ip, "request received");
    if log_level >= 4 {
        for (name, value) in raw.headers.iter() {
            trace!(header = %name, value = %value, "request header");
        }
    }
}

async fn write_router_error(stream: &mut TcpStream, status: u16, message: &str, allow: Option<&str>) -> std::io::Result<()> {
    let body = message.as_bytes();
    let mut head = format!(
        "HTTP/1.1 {status} {}\r\nContent-Length: {}\r\nContent-Type: text/plain; charset=utf-8\r\n",
        reason_phrase(status),
        body.len()
    );
    if let Some(allow) = allow {
        head.push_str("Allow: ");
        head.push_str(allow);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}
