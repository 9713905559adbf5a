//! `wharf` — daemon and control-plane CLI in one binary.
//!
//! `wharf run` starts the edge proxy: it loads persisted state, wires up
//! the blue-green controller, health checker, certificate machinery, and
//! the Pingora data plane, then blocks forever. Every other subcommand is
//! a thin client that dials the control socket, sends one [`Command`], and
//! prints the [`Response`].

mod defaults;
mod deploy;
mod events;
mod health;
mod paths;
mod proxy;
mod routing;
mod socket;
mod store;
mod tls;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use parking_lot::RwLock;
use pingora_core::listeners::tls::TlsSettings;
use pingora_core::prelude::*;
use tokio::net::UnixStream;

use wharf_core::{Command, ErrorKind, Response};

use deploy::{Controller, MockDriver};
use events::EventBus;
use health::HealthChecker;
use socket::SocketServer;
use store::Store;
use tls::{
    AcmeClient, AcmeConfig, CertManager, CertQueueWorker, ChallengeHandler, SelfSignedGenerator,
    SniStore, create_sni_callbacks,
};

#[derive(Parser)]
#[command(name = "wharf", about = "persistent edge proxy with TLS and blue-green deployment")]
struct Args {
    /// Control socket path. Defaults to a dev-checkout path under `target/`,
    /// else `/run/wharf/wharf.sock`.
    #[arg(long, global = true, env = "WHARF_SOCKET")]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground.
    Run(RunArgs),
    /// Deploy a target to a hostname, starting the idle blue/green slot.
    Deploy(DeployArgs),
    /// Remove a hostname and stop both of its containers.
    Remove { host: String },
    /// List every known route.
    List,
    /// Get a single route by hostname.
    Get { host: String },
    /// Print a summary of daemon state.
    Status,
    /// Manually override a route's health flag.
    UpdateHealth {
        host: String,
        #[arg(value_parser = clap::value_parser!(bool))]
        healthy: bool,
    },
}

#[derive(clap::Args)]
struct DeployArgs {
    host: String,
    target: String,
    #[arg(long, default_value = "")]
    project: String,
    #[arg(long, default_value = "/up")]
    health_path: String,
}

#[derive(clap::Args)]
struct RunArgs {
    #[arg(long, default_value_t = 80)]
    http_port: u16,
    #[arg(long, default_value_t = 443)]
    https_port: u16,
    #[arg(long, env = "WHARF_STATE_DIR")]
    state_dir: Option<PathBuf>,
    #[arg(long, env = "WHARF_CERT_DIR")]
    cert_dir: Option<PathBuf>,
    /// Use the Let's Encrypt staging directory instead of production.
    #[arg(long)]
    acme_staging: bool,
    /// Contact email handed to the ACME server and stored with queued hosts.
    #[arg(long, env = "WHARF_ACME_EMAIL")]
    acme_email: Option<String>,
    /// Skip ACME entirely; every non-private hostname falls back to a
    /// self-signed certificate.
    #[arg(long)]
    no_acme: bool,
    /// Disable the 308 redirect from plain HTTP to HTTPS.
    #[arg(long)]
    no_redirect: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let exe = std::env::current_exe().ok();
    let socket_path = paths::resolve_socket_path(
        args.socket,
        exe.as_deref().unwrap_or_else(|| std::path::Path::new("wharf")),
    );

    match args.command {
        Commands::Run(run_args) => run_daemon(socket_path, run_args),
        other => {
            let rt = tokio::runtime::Runtime::new()?;
            let exit_code = rt.block_on(dispatch_client(socket_path, other));
            std::process::exit(exit_code);
        }
    }
}

fn command_from_args(command: Commands) -> Command {
    match command {
        Commands::Deploy(a) => Command::Deploy {
            host: a.host,
            target: a.target,
            project: a.project,
            health_path: a.health_path,
        },
        Commands::Remove { host } => Command::Remove { host },
        Commands::List => Command::List,
        Commands::Get { host } => Command::Get { host },
        Commands::Status => Command::Status,
        Commands::UpdateHealth { host, healthy } => Command::UpdateHealth { host, healthy },
        Commands::Run(_) => unreachable!("Run is handled before dispatch"),
    }
}

/// Dial the control socket, send one command, print the response. Exit
/// code is 0 on success, 1 on a command-level failure the daemon reported,
/// 2 if the daemon could not be reached at all.
async fn dispatch_client(socket_path: PathBuf, command: Commands) -> i32 {
    let command = command_from_args(command);

    let mut stream = match UnixStream::connect(&socket_path).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("could not reach wharf daemon at {}: {e}", socket_path.display());
            return 2;
        }
    };

    let request = match serde_json::to_vec(&command) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("failed to encode request: {e}");
            return 2;
        }
    };

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    if let Err(e) = stream.write_all(&request).await {
        eprintln!("failed to send request: {e}");
        return 2;
    }
    if let Err(e) = stream.shutdown().await {
        eprintln!("failed to shut down write half: {e}");
        return 2;
    }

    let mut raw = Vec::new();
    if let Err(e) = stream.read_to_end(&mut raw).await {
        eprintln!("failed to read response: {e}");
        return 2;
    }

    let response: Response = match serde_json::from_slice(&raw) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("daemon returned an unreadable response: {e}");
            return 2;
        }
    };

    if response.is_ok() {
        match response.data {
            Some(data) => println!("{}", serde_json::to_string_pretty(&data).unwrap_or_default()),
            None => println!("ok"),
        }
        0
    } else {
        eprintln!(
            "error{}: {}",
            response.kind.map(|k| format!(" ({k:?})")).unwrap_or_default(),
            response.error.as_deref().unwrap_or("unknown error")
        );
        1
    }
}

/// Hostnames that will never have a publicly trusted certificate issued
/// for them — loopback aliases, bare single-label names, and the reserved
/// non-public TLDs from RFC 2606 / RFC 8375. These always get a
/// self-signed fallback instead of an ACME order.
fn is_private_local_hostname(host: &str) -> bool {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() {
        return false;
    }
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }
    if !host.contains('.') {
        return true;
    }
    host.ends_with(".local")
        || host.ends_with(".test")
        || host.ends_with(".invalid")
        || host.ends_with(".example")
        || host.ends_with(".home.arpa")
}

struct Daemon {
    store: Arc<Store>,
    controller: Arc<Controller>,
    cert_manager: Arc<CertManager>,
    self_signed: Arc<SelfSignedGenerator>,
    sni: Arc<SniStore>,
    cert_queue: Option<Arc<CertQueueWorker>>,
    acme_enabled: bool,
    contact_email: String,
    global_options: RwLock<HashMap<String, String>>,
}

impl Daemon {
    /// Make sure `host` has some certificate loaded into the SNI store:
    /// reuse an issued one, otherwise fall back to self-signed immediately
    /// and, for publicly-routable hosts with ACME enabled, queue a real
    /// issuance in the background.
    async fn ensure_certificate(&self, host: &str) {
        if self.sni.get(host).is_some() {
            return;
        }

        if let Some(info) = self.cert_manager.get(host) {
            if let Ok(loaded) = tls::LoadedCert::from_files(&info.cert_path, &info.key_path) {
                self.sni.set(host.to_string(), loaded);
                return;
            }
        }

        match self.self_signed.get_or_create(host) {
            Ok(cert) => {
                if let Ok(loaded) = tls::LoadedCert::from_files(&cert.cert_path, &cert.key_path) {
                    self.cert_manager
                        .register_self_signed(host, cert.cert_path.clone(), cert.key_path.clone());
                    self.sni.set(host.to_string(), loaded);
                }
            }
            Err(e) => tracing::warn!(host, error = %e, "failed to generate fallback certificate"),
        }

        if !is_private_local_hostname(host)
            && self.acme_enabled
            && let Some(queue) = &self.cert_queue
        {
            queue.enqueue(host, &self.contact_email);
        }
    }

    async fn handle_command(&self, command: Command) -> Response {
        match command {
            Command::Deploy { host, target, project, health_path } => {
                match self.controller.deploy(&host, &target, &project, &health_path).await {
                    Ok(route) => {
                        self.ensure_certificate(&route.host).await;
                        Response::ok(route)
                    }
                    Err(e @ deploy::DeployError::HealthCheckFailed) => {
                        Response::err(ErrorKind::HealthCheckFailed, e.to_string())
                    }
                    Err(e) => Response::err(ErrorKind::BackendUnavailable, e.to_string()),
                }
            }
            Command::Remove { host } => match self.controller.remove(&host).await {
                Ok(()) => {
                    let normalized = routing::normalize_host(&host);
                    self.sni.remove(&normalized);
                    self.cert_manager.remove(&normalized);
                    self.store.remove_cert_queue_entry(&normalized);
                    Response::ok_empty()
                }
                Err(deploy::DeployError::NotFound) => {
                    Response::err(ErrorKind::NotFound, format!("no deployment for {host}"))
                }
                Err(e) => Response::err(ErrorKind::BackendUnavailable, e.to_string()),
            },
            Command::List => Response::ok(self.store.list_routes()),
            Command::Get { host } => match self.store.get_route(&routing::normalize_host(&host)) {
                Some(route) => Response::ok(route),
                None => Response::err(ErrorKind::NotFound, format!("no route for {host}")),
            },
            Command::Status => {
                let routes = self.store.list_routes();
                let healthy = routes.iter().filter(|r| r.healthy).count();
                Response::ok(serde_json::json!({
                    "routes": routes.len(),
                    "healthy": healthy,
                    "unhealthy": routes.len() - healthy,
                    "acme_enabled": self.acme_enabled,
                    "state_write_ok": !self.store.last_state_write_failed(),
                }))
            }
            Command::UpdateHealth { host, healthy } => {
                let host = routing::normalize_host(&host);
                if self.store.get_route(&host).is_none() {
                    return Response::err(ErrorKind::NotFound, format!("no route for {host}"));
                }
                self.store.update_health(&host, healthy);
                Response::ok_empty()
            }
            Command::SetGlobalOption { key, value } => {
                self.global_options.write().insert(key, value);
                Response::ok_empty()
            }
        }
    }
}

fn run_daemon(socket_path: PathBuf, args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let exe = std::env::current_exe().ok();
    let exe_ref = exe.as_deref().unwrap_or_else(|| std::path::Path::new("wharf"));
    let state_dir = paths::resolve_state_dir(args.state_dir, exe_ref);
    let cert_dir = args.cert_dir.unwrap_or_else(paths::production_default_cert_dir);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting wharf");
    tracing::info!(socket = %socket_path.display(), "control socket path");
    tracing::info!(state_dir = %state_dir.display(), cert_dir = %cert_dir.display(), "data directories");

    // Tokio runtime for everything except the Pingora data plane, which
    // manages its own runtime internally.
    let rt = tokio::runtime::Runtime::new()?;

    let store = Store::open(&state_dir)?;
    let events = Arc::new(EventBus::new());
    let driver: Arc<dyn deploy::ContainerDriver> = Arc::new(MockDriver::new());
    let controller = Arc::new(Controller::new(store.clone(), driver, events.clone()));

    let cert_manager = Arc::new(CertManager::new(cert_dir.clone()));
    cert_manager.init()?;
    let self_signed = Arc::new(SelfSignedGenerator::new(cert_dir.clone()));
    let sni = Arc::new(SniStore::new());

    let contact_email = args.acme_email.clone().unwrap_or_default();
    let (acme_client, challenge_handler) = if args.no_acme {
        tracing::info!("ACME disabled, routes fall back to self-signed certificates");
        (None, None)
    } else {
        let acme_config = AcmeConfig {
            staging: args.acme_staging,
            contact_email: args.acme_email.clone(),
            account_dir: state_dir.join("acme"),
            order_timeout: defaults::ACME_ATTEMPT_BUDGET,
        };
        let client = Arc::new(AcmeClient::new(acme_config));
        match rt.block_on(client.init()) {
            Ok(()) => {
                if args.acme_staging {
                    tracing::warn!("using Let's Encrypt staging directory; certificates are not publicly trusted");
                }
                let handler = ChallengeHandler::new(client.challenge_tokens());
                (Some(client), Some(handler))
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to initialize ACME account, continuing without ACME");
                (None, None)
            }
        }
    };
    let acme_enabled = acme_client.is_some();

    let cert_queue = acme_client.as_ref().map(|acme| {
        let worker = Arc::new(CertQueueWorker::new(
            store.clone(),
            acme.clone(),
            cert_manager.clone(),
            sni.clone(),
            events.clone(),
        ));
        rt.spawn(worker.clone().run());
        rt.spawn(worker.clone().run_renewal_sweep(contact_email.clone()));
        worker
    });

    let daemon = Arc::new(Daemon {
        store: store.clone(),
        controller,
        cert_manager: cert_manager.clone(),
        self_signed: self_signed.clone(),
        sni: sni.clone(),
        cert_queue,
        acme_enabled,
        contact_email,
        global_options: RwLock::new(HashMap::new()),
    });

    // Pre-load a certificate for every route already on disk so the TLS
    // handshake has something to serve immediately on restart.
    for route in store.list_routes() {
        rt.block_on(daemon.ensure_certificate(&route.host));
    }

    let health_checker = Arc::new(HealthChecker::new(store.clone(), events.clone()));
    rt.spawn(health_checker.run());

    let socket_server = SocketServer::new(socket_path.to_string_lossy().to_string());
    let socket_daemon = daemon.clone();
    rt.spawn(async move {
        if let Err(e) = socket_server
            .run(move |cmd| {
                let daemon = socket_daemon.clone();
                async move { daemon.handle_command(cmd).await }
            })
            .await
        {
            tracing::error!(error = %e, "control socket server stopped");
        }
    });

    // Flush persisted state as soon as a shutdown signal lands; the actual
    // connection drain is Pingora's job (see `grace_period_seconds` below),
    // so this task never calls `process::exit` itself.
    let shutdown_store = store.clone();
    rt.spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received, flushing state and draining connections");
        shutdown_store.flush_now();
    });

    let redirect_http_to_https = !args.no_redirect;
    let mut server_conf = pingora_core::server::configuration::ServerConf::default();
    let drain_secs = defaults::SHUTDOWN_DRAIN_BUDGET.as_secs();
    server_conf.grace_period_seconds = Some(drain_secs);
    server_conf.graceful_shutdown_timeout_seconds = Some(drain_secs);
    let mut server = Server::new_with_opt_and_conf(None, server_conf);
    server.bootstrap();

    let proxy = match challenge_handler {
        Some(handler) => {
            proxy::WharfProxy::with_acme_challenges(store.clone(), redirect_http_to_https, handler)
        }
        None => proxy::WharfProxy::new(store.clone(), redirect_http_to_https),
    };

    let mut proxy_service = pingora_proxy::http_proxy_service(&server.configuration, proxy);
    proxy_service.add_tcp(&format!("0.0.0.0:{}", args.http_port));

    let mut tls_settings = TlsSettings::with_callbacks(create_sni_callbacks(sni))?;
    tls_settings.enable_h2();
    proxy_service.add_tls_with_settings(&format!("0.0.0.0:{}", args.https_port), None, tls_settings);
    tracing::info!(http_port = args.http_port, https_port = args.https_port, "listeners ready");

    server.add_service(proxy_service);

    // `rt` must outlive this call: Pingora blocks the current thread, but
    // every background task spawned above keeps running on `rt`'s pool.
    server.run_forever();

    #[allow(unreachable_code)]
    Ok(())
}
