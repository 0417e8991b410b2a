use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use slipgate::config::{CliArgs, Config, Session};
use slipgate::dialer::tls::TlsPolicy;
use slipgate::dialer::Dialer;
use slipgate::handler::Handler;
use slipgate::logger::{self, log, LogLevel};
use slipgate::pool::BufferPool;
use slipgate::resolve::Resolver;
use slipgate::socks::ProxyFrontend;
use slipgate::transport::tunnel::WsTunnel;
use slipgate::transport::Transport;

// mimalloc keeps allocation overhead flat under many small sessions
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliArgs::parse_args();
    logger::init_logger(cli.log_level.as_deref().and_then(LogLevel::parse));

    let config = Config::from_file(&cli.config_file)?;
    let session = Session::generate();
    log::info!(
        bind = %config.server.bind,
        session_id = %session.session_id,
        client_id = %session.client_id,
        worker = config.worker.enable,
        fragment = config.fragment.enable,
        "starting"
    );

    let worker = config.worker_policy();
    let dialer = Arc::new(Dialer::new(
        TlsPolicy::from_config(&config.tls),
        config.fragment_policy(),
        config.unix.protected,
    ));
    let resolver = Arc::new(Resolver::new(
        &config.dns,
        worker.clone(),
        Arc::clone(&dialer),
    ));
    let pool = Arc::new(BufferPool::default());
    let frame_timeout = Duration::from_secs(config.udp.timeout);
    let ws_tunnel = Arc::new(WsTunnel::new(
        Arc::clone(&dialer),
        worker.clone(),
        frame_timeout,
        frame_timeout,
        session.client_id.clone(),
    ));
    let transport = Arc::new(Transport::new(
        Arc::clone(&pool),
        ws_tunnel,
        config.udp.bind.clone(),
        session.session_id.clone(),
        worker.sni.clone(),
    ));
    let handler = Arc::new(Handler::new(
        resolver,
        dialer,
        transport,
        worker,
        pool,
        config.udp.enable,
    ));

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT");
            let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM");
            tokio::select! {
                _ = sigint.recv() => log::info!("SIGINT received, shutting down"),
                _ = sigterm.recv() => log::info!("SIGTERM received, shutting down"),
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok();
            log::info!("shutdown signal received");
        }

        shutdown.cancel();
    });

    let frontend = ProxyFrontend::new(config.server.bind.clone(), handler, cancel);
    frontend.listen_and_serve().await?;
    Ok(())
}
