use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use shepherd::api::{ApiContext, ApiServer};
use shepherd::config::{AgentConfig, HostIdentity};
use shepherd::proxy::{ForwardClient, ProxyServer, ProxyState};
use shepherd::registry::AppRegistry;
use shepherd::routes::{self, RoutingTables, TableBuilder};
use shepherd::runtime::RuntimeManager;
use shepherd::supervisor::Supervisor;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let started_at = Instant::now();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("shepherd=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("shepherd.toml"));

    let config = AgentConfig::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "failed to load configuration");
        e
    })?;
    info!(path = %config_path.display(), "configuration loaded");

    let paths = config.paths.clone();
    tokio::fs::create_dir_all(paths.apps_dir()).await?;
    tokio::fs::create_dir_all(paths.logs_dir()).await?;

    let mut identity = HostIdentity::load_or_create(&paths.host_file()).await?;
    identity.apply_secret_reset(&paths.host_file()).await?;

    print_startup_banner(&config, &identity);

    let default_cert = routes::load_or_generate_default_cert(&paths, &identity.ip).await?;

    let registry = Arc::new(AppRegistry::open(&paths).await?);
    let runtime = RuntimeManager::new(config.runtime.clone(), config.timing.install_ack());
    let (supervisor, events) = Supervisor::new(
        Arc::clone(&registry),
        paths.clone(),
        Arc::clone(&runtime),
        config.timing.clone(),
    );

    // Boot restart before the first table build, so resumed apps are
    // already routable when the proxy comes up.
    supervisor.resume_running_apps().await;

    let builder = TableBuilder::new(
        paths.registry_file(),
        identity.ip.clone(),
        config.server.api_port,
        Arc::clone(&default_cert),
    );
    let tables = RoutingTables::new(builder.build().await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let rebuild_handle = routes::spawn_rebuild_loop(
        Arc::clone(&builder),
        tables.clone(),
        events,
        config.timing.rebuild_interval(),
        shutdown_rx.clone(),
    );

    let api_context = ApiContext {
        paths: paths.clone(),
        timing: config.timing.clone(),
        registry: Arc::clone(&registry),
        supervisor: Arc::clone(&supervisor),
        runtime: Arc::clone(&runtime),
        secret_hash: identity.secret.clone(),
        started_at,
    };
    let api_server = ApiServer::bind(
        listener_addr(&config.server.bind, config.server.api_port)?,
        api_context,
        shutdown_rx.clone(),
    )
    .await?;
    let api_handle = tokio::spawn(async move {
        if let Err(err) = api_server.run().await {
            error!(%err, "management api error");
        }
    });

    let state = Arc::new(ProxyState {
        tables: tables.clone(),
        client: ForwardClient::new(),
        no_response_delay: config.timing.no_response_delay(),
    });

    let http_proxy = ProxyServer::bind(
        listener_addr(&config.server.bind, config.server.http_port)?,
        Arc::clone(&state),
        None,
        shutdown_rx.clone(),
    )
    .await?;
    let http_handle = tokio::spawn(async move {
        if let Err(err) = http_proxy.run().await {
            error!(%err, "http proxy error");
        }
    });

    let https_proxy = ProxyServer::bind(
        listener_addr(&config.server.bind, config.server.https_port)?,
        Arc::clone(&state),
        Some(routes::tls_acceptor(tables.clone())),
        shutdown_rx.clone(),
    )
    .await?;
    let https_handle = tokio::spawn(async move {
        if let Err(err) = https_proxy.run().await {
            error!(%err, "https proxy error");
        }
    });

    wait_for_shutdown_signal().await;

    // Listeners drain and exit. Application processes keep running in
    // their own process groups; the next boot resumes them from the
    // registry.
    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = api_handle.await;
        let _ = http_handle.await;
        let _ = https_handle.await;
        let _ = rebuild_handle.await;
    })
    .await;

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl-c");
        info!("received ctrl-c, shutting down");
    }
}

fn listener_addr(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{bind}:{port}")
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address {bind}:{port}: {e}"))
}

fn print_startup_banner(config: &AgentConfig, identity: &HostIdentity) {
    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "starting agent"
    );
    info!(
        bind = %config.server.bind,
        api_port = config.server.api_port,
        http_port = config.server.http_port,
        https_port = config.server.https_port,
        host_ip = %identity.ip,
        "listener configuration"
    );
    info!(
        data_dir = %config.paths.data_dir.display(),
        runtime_root = %config.runtime.root_dir.display(),
        "storage configuration"
    );
    info!(
        startup_grace_secs = config.timing.startup_grace_secs,
        restart_delay_secs = config.timing.restart_delay_secs,
        rebuild_interval_secs = config.timing.rebuild_interval_secs,
        "timing configuration"
    );
}
