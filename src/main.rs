#[allow(dead_code)]
mod config;
#[allow(dead_code)]
mod content;
#[allow(dead_code)]
mod error_pages;
#[allow(dead_code)]
mod index;
#[allow(dead_code)]
mod router;
#[allow(dead_code)]
mod static_files;
#[allow(dead_code)]
mod store;
#[allow(dead_code)]
mod trace_writer;
#[allow(dead_code)]
mod url;
#[allow(dead_code)]
mod validate;

use async_trait::async_trait;
use config::ServerConf;
use index::RoutingSnapshot;
use pingora_core::prelude::*;
use pingora_core::upstreams::peer::Peer;
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::{http_proxy_service, ProxyHttp, Session};
use router::{match_url, Execution, MatchResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use trace_writer::{TraceEntry, TraceSender};

const SERVER_CONF_PATH: &str = "/data/server_conf.json";

/// Shared routing state, replaced wholesale on reload so in-flight
/// requests always observe one consistent snapshot.
struct SharedState {
    conf: ServerConf,
    snapshot: RoutingSnapshot,
}

impl SharedState {
    fn build(conf: ServerConf) -> Self {
        let snapshot = RoutingSnapshot::rebuild(&conf);
        log::info!(
            "snapshot built: {} project(s), {} proxy route(s), {} dns route(s), env={}",
            snapshot.projects.len(),
            snapshot.proxy_index.len(),
            snapshot.dns_index.len(),
            snapshot.environment.as_str()
        );
        SharedState { conf, snapshot }
    }
}

/// Outcome of the synchronous routing phase (no borrows held after this)
enum RequestAction {
    /// Serve the router-resolved file from disk
    ServeFile {
        base_root: PathBuf,
        file: PathBuf,
        status: u16,
    },
    /// Forward to the script-execution upstream
    ExecUpstream {
        upstream_addr: String,
        exec_path: String,
        project: String,
        website: String,
    },
    /// Redirect a plain-HTTP request to its HTTPS equivalent
    ForceHttps { location: String },
}

/// Per-request context passed through the ProxyHttp callbacks
pub struct ProxyCtx {
    /// The exec upstream address (host:port) when proxying
    upstream_addr: Option<String>,
    exec_path: String,
    exec_project: String,
    exec_website: String,
    /// (project, trace text) for the trace writer, consumed at logging time
    trace: Option<(String, String)>,
}

impl ProxyCtx {
    fn new() -> Self {
        ProxyCtx {
            upstream_addr: None,
            exec_path: String::new(),
            exec_project: String::new(),
            exec_website: String::new(),
            trace: None,
        }
    }
}

/// The router application.
/// Uses arc_swap::ArcSwap for lock-free snapshot reads on the hot path.
pub struct ProxyApp {
    state: Arc<arc_swap::ArcSwap<SharedState>>,
    trace_tx: Option<TraceSender>,
}

impl ProxyApp {
    fn new(state: Arc<arc_swap::ArcSwap<SharedState>>, trace_tx: Option<TraceSender>) -> Self {
        ProxyApp { state, trace_tx }
    }

    /// Run the match pipeline and decide how to answer. Lock-free read via
    /// ArcSwap; the MatchResult is returned for logging and tracing.
    fn resolve_request(
        &self,
        host_header: Option<&str>,
        path_and_query: &str,
        server_port: Option<u16>,
    ) -> (RequestAction, MatchResult) {
        let state = self.state.load();
        let host = host_header.unwrap_or("");
        let raw_url = format!("{}{}", host, path_and_query);

        let m = match_url(&state.snapshot, &raw_url);

        // Per-website SSL enforcement happens before any content leaves on
        // the plain listener.
        if let Some(site) = state.snapshot.website(&m.project, &m.website) {
            if site.ssl_redirect {
                if let Some(port) = server_port {
                    if port == state.conf.listen.http {
                        let location = format!("https://{}{}", host, path_and_query);
                        return (RequestAction::ForceHttps { location }, m);
                    }
                }
            }
        }

        let status = if m.status == 0 { 500 } else { m.status };
        let action = match m.execution {
            Execution::Server => RequestAction::ExecUpstream {
                upstream_addr: state.conf.exec_upstream.clone(),
                exec_path: m.full_path().display().to_string(),
                project: m.project.clone(),
                website: m.website.clone(),
            },
            Execution::Client => {
                let file = m.full_path();
                let base_root = if file.starts_with(&state.snapshot.system_root) {
                    state.snapshot.system_root.clone()
                } else {
                    state.snapshot.web_root.clone()
                };
                RequestAction::ServeFile {
                    base_root,
                    file,
                    status,
                }
            }
        };
        (action, m)
    }
}

#[async_trait]
impl ProxyHttp for ProxyApp {
    type CTX = ProxyCtx;

    fn new_ctx(&self) -> Self::CTX {
        ProxyCtx::new()
    }

    /// Handle the incoming request: match, redirect, serve or hand off
    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        let host_header: Option<String> = session
            .req_header()
            .headers
            .get("host")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let path_and_query = session
            .req_header()
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let server_port = session
            .downstream_session
            .server_addr()
            .and_then(|a| a.as_inet())
            .map(|inet| inet.port());

        let ims: Option<String> = session
            .req_header()
            .headers
            .get(http::header::IF_MODIFIED_SINCE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let (action, m) = self.resolve_request(host_header.as_deref(), &path_and_query, server_port);
        ctx.trace = Some((m.project.clone(), m.trace_text()));

        match action {
            RequestAction::ExecUpstream {
                upstream_addr,
                exec_path,
                project,
                website,
            } => {
                ctx.upstream_addr = Some(upstream_addr);
                ctx.exec_path = exec_path;
                ctx.exec_project = project;
                ctx.exec_website = website;
                Ok(false)
            }

            RequestAction::ForceHttps { location } => {
                let mut resp = ResponseHeader::build(301, Some(2)).unwrap();
                let _ = resp.insert_header(http::header::LOCATION, &location);
                let _ = resp.insert_header(http::header::CONTENT_LENGTH, 0);
                session.write_response_header(Box::new(resp), true).await?;
                Ok(true)
            }

            RequestAction::ServeFile {
                base_root,
                file,
                status,
            } => {
                if let Some(file_resp) = static_files::serve_resolved_file(
                    &base_root,
                    &file,
                    status,
                    ims.as_deref(),
                ) {
                    session
                        .write_response_header(Box::new(file_resp.header), false)
                        .await?;
                    if !file_resp.body.is_empty() {
                        session
                            .write_response_body(Some(file_resp.body), true)
                            .await?;
                    } else {
                        session.write_response_body(None, true).await?;
                    }
                } else {
                    // Even the cascade bottom is unreadable; answer with
                    // the generated page.
                    let code = if status >= 400 { status } else { 404 };
                    let err_resp = error_pages::builtin_error_page(code);
                    session
                        .write_response_header(Box::new(err_resp.header), false)
                        .await?;
                    session
                        .write_response_body(Some(err_resp.body), true)
                        .await?;
                }
                Ok(true)
            }
        }
    }

    /// Connect to the script-execution upstream for server-exec content
    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let addr = ctx.upstream_addr.as_ref().ok_or_else(|| {
            pingora_core::Error::because(
                pingora_core::ErrorType::ConnectNoRoute,
                "no exec upstream resolved",
                pingora_core::Error::new(pingora_core::ErrorType::ConnectNoRoute),
            )
        })?;

        let mut peer = HttpPeer::new(addr.as_str(), false, String::new());

        let options = peer.get_mut_peer_options().unwrap();
        options.connection_timeout = Some(Duration::from_secs(5));
        options.total_connection_timeout = Some(Duration::from_secs(10));
        options.read_timeout = Some(Duration::from_secs(60));
        options.write_timeout = Some(Duration::from_secs(60));
        options.idle_timeout = Some(Duration::from_secs(60));

        Ok(Box::new(peer))
    }

    /// Carry the resolution to the exec host
    async fn upstream_request_filter(
        &self,
        session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        if let Some(host) = session.req_header().headers.get("host").cloned() {
            upstream_request.insert_header("Host", host)?;
        }

        upstream_request.insert_header("X-Exec-Path", &ctx.exec_path)?;
        upstream_request.insert_header("X-Exec-Project", &ctx.exec_project)?;
        upstream_request.insert_header("X-Exec-Website", &ctx.exec_website)?;

        if let Some(client_ip) = session
            .downstream_session
            .client_addr()
            .and_then(|addr| addr.as_inet())
            .map(|inet| inet.ip())
        {
            let ip_str = client_ip.to_string();

            let xff = upstream_request
                .headers
                .get("X-Forwarded-For")
                .and_then(|v| v.to_str().ok())
                .map(|s| format!("{}, {}", s, ip_str))
                .unwrap_or_else(|| ip_str.clone());
            upstream_request.insert_header("X-Forwarded-For", &xff)?;
            upstream_request.insert_header("X-Real-IP", &ip_str)?;
        }

        Ok(())
    }

    /// Tag responses before sending downstream
    async fn response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        _ctx: &mut Self::CTX,
    ) -> Result<()> {
        let _ = upstream_response.insert_header("Server", "vhost-router");
        Ok(())
    }

    /// Handle errors that occur while proxying to the exec host
    async fn fail_to_proxy(
        &self,
        session: &mut Session,
        e: &pingora_core::Error,
        _ctx: &mut Self::CTX,
    ) -> pingora_proxy::FailToProxy {
        let code = match e.etype() {
            pingora_core::ErrorType::HTTPStatus(code) => *code,
            _ => match e.esource() {
                pingora_core::ErrorSource::Upstream => 502,
                pingora_core::ErrorSource::Downstream => 0,
                _ => 500,
            },
        };

        if code > 0 {
            let err_resp = error_pages::builtin_error_page(code);
            let _ = session
                .write_response_header(Box::new(err_resp.header), false)
                .await;
            let _ = session.write_response_body(Some(err_resp.body), true).await;
        }

        pingora_proxy::FailToProxy {
            error_code: code,
            can_reuse_downstream: false,
        }
    }

    /// Log completed requests and persist the match trace
    async fn logging(
        &self,
        session: &mut Session,
        e: Option<&pingora_core::Error>,
        ctx: &mut Self::CTX,
    ) {
        let status = session
            .response_written()
            .map(|r| r.status.as_u16())
            .unwrap_or(0);
        let method = session.req_header().method.as_str();
        let path = session.req_header().uri.path();
        let host = session
            .req_header()
            .headers
            .get("host")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");

        if let Some(err) = e {
            log::error!("{} {} {} {} - error: {}", method, host, path, status, err);
        } else {
            log::info!("{} {} {} {}", method, host, path, status);
        }

        if let (Some(tx), Some((project, trace))) = (&self.trace_tx, ctx.trace.take()) {
            let line = format!(
                "{} {} {}{} {}\n{}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                method,
                host,
                path,
                status,
                trace
            );
            let _ = tx.send(TraceEntry { project, line });
        }
    }
}

fn main() {
    env_logger::init();
    log::info!("vhost-router starting...");

    let conf = match ServerConf::load(Path::new(SERVER_CONF_PATH)) {
        Ok(conf) => conf,
        Err(e) => {
            log::warn!(
                "failed to load {}: {}. Using defaults.",
                SERVER_CONF_PATH,
                e
            );
            ServerConf::default()
        }
    };

    let http_port = conf.listen.http;
    let https_port = conf.listen.https;

    // Build shared state with ArcSwap so reloads are atomic pointer swaps
    let shared_state = Arc::new(arc_swap::ArcSwap::from_pointee(SharedState::build(
        conf.clone(),
    )));

    // Trace writer on its own runtime thread
    let (trace_tx, trace_rx) = trace_writer::create_trace_channel();
    let trace_logs_dir = PathBuf::from(&conf.logs_dir);
    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(trace_writer::run_trace_writer(trace_logs_dir, trace_rx));
    });

    let proxy_app = ProxyApp::new(Arc::clone(&shared_state), Some(trace_tx));

    // Reload thread: SIGHUP forces a rebuild, and the store listing is
    // polled so edits to any config.json are picked up without a signal.
    let reload_state = Arc::clone(&shared_state);
    let reload_conf = conf.clone();
    std::thread::spawn(move || {
        use std::sync::atomic::{AtomicBool, Ordering};
        static SIGHUP_RECEIVED: AtomicBool = AtomicBool::new(false);

        unsafe {
            libc::signal(libc::SIGHUP, sighup_handler as *const () as libc::sighandler_t);
        }

        let interval = Duration::from_secs(reload_conf.poll_interval_secs.max(1));
        loop {
            std::thread::sleep(interval);

            let forced = SIGHUP_RECEIVED.swap(false, Ordering::SeqCst);
            let current = store::scan_listing(Path::new(&reload_conf.web_source));
            let changes = store::diff_listing(&reload_state.load().snapshot.listing, &current);

            if !forced && changes.is_empty() {
                continue;
            }
            if forced {
                log::info!("SIGHUP received, rebuilding snapshot...");
            } else {
                log::info!(
                    "config change detected (+{} ~{} -{}), rebuilding snapshot...",
                    changes.added.len(),
                    changes.changed.len(),
                    changes.removed.len()
                );
            }
            let new_state = Arc::new(SharedState::build(reload_conf.clone()));
            reload_state.store(new_state);
        }

        extern "C" fn sighup_handler(_sig: libc::c_int) {
            SIGHUP_RECEIVED.store(true, Ordering::SeqCst);
        }
    });

    // Create Pingora server
    let mut server_conf = pingora_core::server::configuration::ServerConf::default();
    server_conf.upstream_keepalive_pool_size = 128;
    let opt = pingora_core::server::configuration::Opt::default();
    let mut server = Server::new_with_opt_and_conf(opt, server_conf);
    server.bootstrap();

    let mut http_service = http_proxy_service(&server.configuration, proxy_app);

    // Both listeners are plain TCP; TLS terminates in front of the router
    // and decrypted traffic arrives on the https port.
    http_service.add_tcp(&format!("0.0.0.0:{}", http_port));
    http_service.add_tcp(&format!("0.0.0.0:{}", https_port));

    server.add_service(http_service);

    log::info!(
        "starting router: HTTP={}, HTTPS={}, environment={}",
        http_port,
        https_port,
        conf.environment
    );

    server.run_forever();
}
