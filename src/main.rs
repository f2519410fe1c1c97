use std::{
    convert::Infallible,
    fs::File,
    future::IntoFuture,
    io::BufReader,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, Request},
    response::Response,
    routing::any,
    serve::{Listener, ListenerExt},
};
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use futures_util::StreamExt;
use meloy_gateway::{
    adapters::{
        FileConfigProvider, HttpClientAdapter, HttpHandler, JsonLinesStatsExporter,
        LogStatsExporter,
    },
    config::{
        AppConfigValidator, RouteDocumentValidator, ServerPoolValidator,
        loader::{self, APIS_DIR, APP_CONFIG_FILE},
        models::{RouteDocument, SslConfig, StatsExporterKind},
    },
    core::{
        GatewayService, RouteDefinition, StatsRecorder, hooks::AccessLogHook,
        route::DEFAULT_TIMEOUT,
    },
    ports::{config_provider::ConfigProvider, http_client::HttpClient, stats::StatsExporter},
    tracing_setup,
    utils::GracefulShutdown,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    task::JoinHandle,
};
use tower_http::catch_panic::CatchPanicLayer;

const RELOAD_DEBOUNCE: Duration = Duration::from_secs(2);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    /// Application directory holding `config/` and `apis/`
    #[clap(short, long, default_value = ".", global = true)]
    dir: PathBuf,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Start the gateway with JSON logs (default)
    Serve,
    /// Start the gateway with console logs and per-request stat logging
    Debug,
    /// Validate the application directory
    Validate,
    /// Write a skeleton route document to `apis/<code>.json`
    Create {
        /// Route code; `_` separates path segments
        code: String,
    },
}

struct AxumListener<S> {
    stream: S,
    local_addr: SocketAddr,
}

impl<S, I, E> Listener for AxumListener<S>
where
    S: futures_util::Stream<Item = Result<(I, SocketAddr), E>> + Unpin + Send + 'static,
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    type Io = I;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.stream.next().await {
                Some(Ok((io, addr))) => return (io, addr),
                Some(Err(e)) => tracing::debug!("TLS accept error: {}", e),
                None => std::future::pending().await,
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_server(&args.dir, false).await,
        Commands::Debug => run_server(&args.dir, true).await,
        Commands::Validate => validate_command(&args.dir).await,
        Commands::Create { code } => create_route_command(&args.dir, &code).await,
    }
}

async fn run_server(dir: &Path, debug: bool) -> Result<()> {
    if debug {
        tracing_setup::init_console_tracing()?;
    } else {
        tracing_setup::init_tracing()?;
    }

    let crypto = rustls::crypto::aws_lc_rs::default_provider();
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(crypto) {
        tracing::warn!(
            "CryptoProvider::install_default for aws-lc-rs reported an error: {:?}. \
            A provider was probably installed already.",
            e
        );
    }

    tracing::info!(dir = %dir.display(), "Loading application directory");

    let provider = Arc::new(
        FileConfigProvider::watching(dir).context("Failed to start configuration watcher")?,
    );
    let changes = provider.watch();

    let snapshot = provider
        .load_snapshot()
        .await
        .with_context(|| format!("Failed to load {}", dir.display()))?;
    AppConfigValidator::validate(&snapshot.app)
        .map_err(|e| eyre!("Invalid {APP_CONFIG_FILE}: {e}"))?;
    let app = snapshot.app.clone();

    let gateway = Arc::new(
        GatewayService::with_stats(app.clone(), StatsRecorder::new().verbose(debug))
            .with_provider(provider.clone()),
    );
    gateway.hooks().add_hook(Arc::new(AccessLogHook));
    let summary = gateway.apply_snapshot(snapshot).await;
    tracing::info!(
        added = summary.added,
        updated = summary.updated,
        disabled = summary.disabled,
        "Routes loaded"
    );

    let http_client: Arc<dyn HttpClient> =
        Arc::new(HttpClientAdapter::new().context("Failed to create HTTP client adapter")?);

    let exporter: Arc<dyn StatsExporter> = match app.stats.exporter {
        StatsExporterKind::Log => Arc::new(LogStatsExporter),
        StatsExporterKind::File => Arc::new(JsonLinesStatsExporter::new(dir.join(&app.stats.file))),
    };

    let mut tasks: Vec<JoinHandle<()>> = vec![
        gateway
            .cache()
            .clone()
            .spawn_sweeper(Duration::from_secs(app.cache.sweep_interval_secs.max(1))),
        gateway.stats().clone().spawn_flusher(
            exporter.clone(),
            Duration::from_secs(app.stats.flush_interval_secs.max(1)),
        ),
    ];
    if let Some(changes) = changes {
        tasks.push(spawn_reload_watcher(gateway.clone(), changes));
    }
    #[cfg(unix)]
    tasks.extend(spawn_sighup_reload(gateway.clone()));

    let graceful_shutdown = Arc::new(GracefulShutdown::new());
    {
        let shutdown = graceful_shutdown.clone();
        tasks.push(tokio::spawn(async move {
            shutdown.run_signal_handler().await;
        }));
    }

    let http_handler = HttpHandler::new(gateway.clone(), http_client);

    let make_request_route = |handler: HttpHandler| {
        any(
            move |ConnectInfo(client_addr): ConnectInfo<SocketAddr>, req: Request| {
                let handler = handler.clone();
                async move {
                    match handler.handle_request(req, Some(client_addr)).await {
                        Ok(response) => Ok::<Response<Body>, Infallible>(response),
                        Err(e) => {
                            tracing::error!("Request handling error: {:?}", e);
                            let mut response = Response::new(Body::from("Internal Server Error"));
                            *response.status_mut() = http::StatusCode::INTERNAL_SERVER_ERROR;
                            Ok(response)
                        }
                    }
                }
            },
        )
    };

    let router = Router::new()
        .route("/{*path}", make_request_route(http_handler.clone()))
        .route("/", make_request_route(http_handler))
        .layer(CatchPanicLayer::new());

    let addr: SocketAddr = app
        .listen_addr()
        .parse()
        .context("Failed to parse listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    let shutdown_signal = {
        let shutdown = graceful_shutdown.clone();
        async move {
            let reason = shutdown.wait_for_shutdown_signal().await;
            tracing::info!(?reason, "Stopping listener, draining in-flight requests");
        }
    };

    let server_result = if app.tls_enabled() {
        let tls = load_tls_config(dir, &app.ssl)?;
        let local_addr = listener.local_addr().context("Failed to get local addr")?;
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(tls));
        let tls_listener = AxumListener {
            stream: tls_listener::TlsListener::new(acceptor, listener),
            local_addr,
        }
        .tap_io(|_io| {});

        tracing::info!(%addr, "Meloy gateway listening (HTTPS)");
        drive(
            axum::serve(
                tls_listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown_signal),
            &graceful_shutdown,
        )
        .await
    } else {
        tracing::info!(%addr, "Meloy gateway listening (HTTP)");
        drive(
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown_signal),
            &graceful_shutdown,
        )
        .await
    };

    for task in &tasks {
        task.abort();
    }
    match gateway.stats().flush(exporter.as_ref()).await {
        Ok(count) => tracing::info!(records = count, "Final stats flush"),
        Err(e) => tracing::error!(error = %e, "Final stats flush failed"),
    }

    server_result?;
    tracing::info!("Graceful shutdown completed");
    Ok(())
}

/// Run the server until it drains, or give up `DRAIN_TIMEOUT` after shutdown began.
async fn drive<S>(server: S, shutdown: &GracefulShutdown) -> Result<()>
where
    S: IntoFuture<Output = std::io::Result<()>>,
{
    let server = server.into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => result.context("Server error"),
        _ = async {
            shutdown.wait_for_shutdown_signal().await;
            tokio::time::sleep(DRAIN_TIMEOUT).await;
        } => {
            tracing::warn!(timeout = ?DRAIN_TIMEOUT, "In-flight requests did not drain in time");
            Ok(())
        }
    }
}

fn load_tls_config(dir: &Path, ssl: &SslConfig) -> Result<rustls::ServerConfig> {
    let cert_path = dir.join(&ssl.cert);
    let key_path = dir.join(&ssl.key);

    let mut cert_reader = BufReader::new(
        File::open(&cert_path)
            .with_context(|| format!("Failed to open cert file {}", cert_path.display()))?,
    );
    let mut key_reader = BufReader::new(
        File::open(&key_path)
            .with_context(|| format!("Failed to open key file {}", key_path.display()))?,
    );

    let cert_chain = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| eyre!("No private key found in {}", key_path.display()))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

async fn reload_and_log(gateway: &GatewayService, trigger: &str) {
    match gateway.reload().await {
        Ok(summary) => tracing::info!(
            trigger,
            added = summary.added,
            updated = summary.updated,
            disabled = summary.disabled,
            "Routes reloaded"
        ),
        Err(e) => tracing::error!(
            trigger,
            error = %e,
            "Reload failed, keeping previous configuration"
        ),
    }
}

/// Reload once the document watcher has been quiet for `RELOAD_DEBOUNCE`.
fn spawn_reload_watcher(
    gateway: Arc<GatewayService>,
    mut changes: mpsc::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("Config watcher task started");
        while changes.recv().await.is_some() {
            loop {
                match tokio::time::timeout(RELOAD_DEBOUNCE, changes.recv()).await {
                    Ok(Some(())) => continue,
                    Ok(None) => return,
                    Err(_) => break,
                }
            }
            reload_and_log(&gateway, "watcher").await;
        }
        tracing::info!("Config watcher task is shutting down");
    })
}

#[cfg(unix)]
fn spawn_sighup_reload(gateway: Arc<GatewayService>) -> Option<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::hangup()) {
        Ok(mut hangup) => Some(tokio::spawn(async move {
            while hangup.recv().await.is_some() {
                reload_and_log(&gateway, "sighup").await;
            }
        })),
        Err(e) => {
            tracing::error!(error = %e, "Failed to register SIGHUP handler");
            None
        }
    }
}

/// Validate the application directory and exit
async fn validate_command(dir: &Path) -> Result<()> {
    println!("🔍 Validating application directory: {}", dir.display());

    let snapshot = match loader::load_snapshot(dir).await {
        Ok(snapshot) => {
            println!("✅ Configuration parsing: OK");
            snapshot
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    let mut failures = 0usize;

    match AppConfigValidator::validate(&snapshot.app) {
        Ok(()) => println!("✅ {APP_CONFIG_FILE}: OK"),
        Err(e) => {
            failures += 1;
            eprintln!("❌ {APP_CONFIG_FILE}: {e}");
        }
    }

    match ServerPoolValidator::validate(&snapshot.servers) {
        Ok(()) => println!("✅ Server pools: {}", snapshot.servers.len()),
        Err(e) => {
            failures += 1;
            eprintln!("❌ Server pools: {e}");
        }
    }

    for source in &snapshot.routes {
        let result = RouteDocumentValidator::validate(&source.document)
            .map_err(|e| e.to_string())
            .and_then(|()| {
                RouteDefinition::build(source, &snapshot.servers)
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            });
        if let Err(e) = result {
            failures += 1;
            eprintln!("❌ {}: {e}", source.file.display());
        }
    }

    if let Err(conflicts) = RouteDocumentValidator::check_route_conflicts(&snapshot.routes) {
        println!("⚠️  Route conflicts:");
        for conflict in conflicts {
            println!("   • {conflict}");
        }
    }

    println!();
    println!("📋 Summary:");
    println!("   • Listen Address: {}", snapshot.app.listen_addr());
    println!("   • TLS Enabled: {}", snapshot.app.tls_enabled());
    println!("   • Routes: {}", snapshot.routes.len());
    println!("   • Admin Enabled: {}", snapshot.app.admin.enabled);

    if failures > 0 {
        eprintln!();
        eprintln!("❌ {failures} problem(s) found");
        std::process::exit(1);
    }

    println!();
    println!("🎉 Application directory is valid and ready to use!");
    Ok(())
}

/// Write a skeleton route document
async fn create_route_command(dir: &Path, code: &str) -> Result<()> {
    let file = dir.join(APIS_DIR).join(format!("{code}.json"));
    if file.exists() {
        eprintln!("❌ Error: '{}' already exists", file.display());
        std::process::exit(1);
    }

    let servers = match loader::load_servers(dir) {
        Ok(servers) => servers,
        Err(e) => {
            eprintln!("⚠️  Could not read server pools: {e}");
            Vec::new()
        }
    };
    let server = servers
        .first()
        .map(|pool| pool.code.as_str())
        .unwrap_or("default");

    let document = RouteDocument {
        name: code.to_string(),
        path: format!("/{}", code.replace('_', "/")),
        address: format!("%{{server.{server}}}%{{api.path}}"),
        methods: vec!["GET".to_string()],
        timeout: humantime::format_duration(DEFAULT_TIMEOUT).to_string(),
        ..RouteDocument::default()
    };

    let text = serde_json::to_string_pretty(&document)?;
    if let Some(parent) = file.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::write(&file, text)
        .await
        .with_context(|| format!("Failed to write {}", file.display()))?;

    println!("✅ Created {}", file.display());
    Ok(())
}
