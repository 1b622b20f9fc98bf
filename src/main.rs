mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use ws_link::config::{ProxyMode, ProxySettings};
use ws_link::handler::EchoHandler;
use ws_link::proxy::{PeerCallback, ReconnectCallback};
use ws_link::{tls, ClientProxy, PeerInfo, ServerProxy};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("Invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    info!("ws-link v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Check { config } => check_config(&config),
        Commands::Cert {
            cert_out,
            key_out,
            common_name,
            alt_names,
        } => {
            tls::generate_self_signed_cert(
                &common_name,
                &alt_names,
                Path::new(&cert_out),
                Path::new(&key_out),
            )?;
            println!("Generated self-signed certificate: {}", cert_out);
            println!("Generated private key: {}", key_out);
            Ok(())
        }
        Commands::Server { config } => run_server(&config).await,
        Commands::Client { config } => run_client(&config).await,
    }
}

fn load_settings(path: &str, mode: ProxyMode) -> Result<ProxySettings> {
    info!("Loading configuration from: {}", path);
    let settings = ProxySettings::load(path)?;
    if settings.proxy.mode != mode {
        anyhow::bail!(
            "{} is a {:?} configuration, expected {:?}",
            path,
            settings.proxy.mode,
            mode
        );
    }
    Ok(settings)
}

async fn run_server(path: &str) -> Result<()> {
    let settings = load_settings(path, ProxyMode::Server)?;
    let max_connections = settings.proxy.max_connections;

    let mut config = settings
        .into_config()
        .context("Failed to build server configuration")?;
    config.set_handler(Arc::new(EchoHandler));

    let server = ServerProxy::new(config);
    if let Some(max) = max_connections {
        server.set_conn_limiter(max)?;
    }
    let on_connect: PeerCallback = Arc::new(|peer: &PeerInfo| info!("Peer {} connected", peer));
    let on_disconnect: PeerCallback =
        Arc::new(|peer: &PeerInfo| warn!("Peer {} disconnected", peer));
    server.set_on_conn_callback(vec![on_connect]);
    server.set_disconn_callback(vec![on_disconnect]);
    server.add_handler("/healthz", |_req| {
        http::Response::new("ok".to_string())
    })?;

    server.start().await.context("Failed to start server")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Shutting down...");
    server.stop().await;
    info!("Stats: {:?}", server.stats());
    Ok(())
}

async fn run_client(path: &str) -> Result<()> {
    let settings = load_settings(path, ProxyMode::Client)?;
    let mut config = settings
        .into_config()
        .context("Failed to build client configuration")?;
    config.set_handler(Arc::new(EchoHandler));

    let client = ClientProxy::new(config);
    let on_reconnect: ReconnectCallback = Arc::new(|| info!("Link re-established"));
    let on_disconnect: PeerCallback =
        Arc::new(|peer: &PeerInfo| warn!("Link {} lost", peer));
    client.set_reconn_callback(vec![on_reconnect]);
    client.set_disconn_callback(vec![on_disconnect]);

    client.start().await.context("Failed to start client")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Shutting down...");
    client.stop().await?;
    info!("Stats: {:?}", client.stats());
    Ok(())
}

/// 检查配置文件（不读取 TLS 文件）
fn check_config(path: &str) -> Result<()> {
    let settings = ProxySettings::load(path)?;
    let tls = settings.tls_info();

    println!("✓ Configuration file is valid: {}", path);
    println!("  mode: {:?}", settings.proxy.mode);
    println!("  name: {}", settings.proxy.name);
    println!("  endpoint: {}:{}{}", settings.proxy.host, settings.proxy.port, settings.proxy.path);
    println!("  ca: {:?}", tls.ca_path);
    println!("  cert: {:?}", tls.cert_path);
    println!("  key: {:?}", tls.key_path);
    if let Some(rps) = &settings.rps_limiter {
        println!("  rps limiter: {} rps, burst {}", rps.rps, rps.burst);
    }
    if let Some(bw) = &settings.bandwidth_limiter {
        println!(
            "  bandwidth limiter: {} bytes / {} ms",
            bw.max_throughput, bw.period_ms
        );
    }
    Ok(())
}
