// vox-edge: voice-command edge daemon (secure MQTT link, session pipeline, DMA accelerator).

mod config;
mod device;
mod pipeline;
mod tls;
mod transport;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vox_core::{
    Accelerator, BufferPool, FeatureExtractor, InferenceBridge, LogMelSpectrogram,
    SessionController, INPUT_SIZE,
};

use crate::config::Config;
use crate::pipeline::{Pipeline, SharedAccelerator};
use crate::transport::{TransportClient, TransportOptions};

#[derive(Parser, Debug)]
#[command(name = "vox-edge", version, about = "Voice-command edge daemon")]
struct Cli {
    /// Config file (default: ~/.config/vox-edge/config.toml, then /etc/vox-edge/config.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load(cli.config.as_deref()).context("loading configuration")?;

    let cert_paths = tls::CertPaths::new(&cfg.tls.secrets_dir, &cfg.tls.cert_prefix);
    let tls_config = tls::load_client_config(&cert_paths).context("loading certificates")?;
    info!(dir = %cfg.tls.secrets_dir.display(), "certificates loaded");

    let extractor = LogMelSpectrogram::default();
    if extractor.output_len() != INPUT_SIZE {
        bail!(
            "feature extractor yields {} values, accelerator expects {}",
            extractor.output_len(),
            INPUT_SIZE
        );
    }
    let device = device::DmaProxyDevice::open(&cfg.hardware.tx_device, &cfg.hardware.rx_device)
        .context("opening accelerator")?;
    info!(?device, "accelerator ready");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, tls_config, Arc::new(extractor), Box::new(device)))
}

async fn run(
    cfg: Config,
    tls_config: rustls::ClientConfig,
    extractor: Arc<dyn FeatureExtractor>,
    device: Box<dyn Accelerator>,
) -> anyhow::Result<()> {
    let server_name = cfg.tls.server_name.as_deref().unwrap_or(&cfg.broker.host);
    let dialer = tls::TlsDialer::new(&cfg.broker.host, cfg.broker.port, server_name, tls_config)
        .context("configuring broker dialer")?;

    let (client, inbound) = TransportClient::start(Arc::new(dialer), transport_options(&cfg));
    let mut link = client.watch_state();
    tokio::spawn(async move {
        while link.changed().await.is_ok() {
            let state = *link.borrow_and_update();
            info!(?state, "broker link");
        }
    });
    client.subscribe(&cfg.topics.fragments).await?;
    client.subscribe(&cfg.topics.control).await?;

    let device: SharedAccelerator = Arc::new(Mutex::new(device));
    let pipeline = Pipeline::new(
        SessionController::with_timeout(cfg.session.timeout()),
        InferenceBridge::new(extractor, BufferPool::new()),
        device,
        client,
        cfg.topics.clone(),
    )
    .with_tick(cfg.session.tick())
    .with_hardware_timeout(cfg.hardware.timeout());

    let client = pipeline
        .run(inbound, async {
            if let Err(e) = shutdown_signal().await {
                error!(error = %e, "signal handler failed");
            }
        })
        .await;
    client.disconnect().await;
    Ok(())
}

fn transport_options(cfg: &Config) -> TransportOptions {
    let client_id = if cfg.broker.client_id.is_empty() {
        format!("vox-edge-{:08x}", rand::random::<u32>())
    } else {
        cfg.broker.client_id.clone()
    };
    TransportOptions {
        client_id,
        username: cfg.broker.username.clone(),
        password: cfg.broker.password.clone(),
        keep_alive: std::time::Duration::from_secs(u64::from(cfg.broker.keep_alive_secs)),
        inbound_capacity: cfg.broker.inbound_capacity,
        backoff_unit: cfg.reconnect.unit(),
        backoff_max_units: cfg.reconnect.max_units,
        ..TransportOptions::default()
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_client_id_gets_random_suffix() {
        let mut cfg = Config::default();
        cfg.broker.client_id.clear();
        let id = transport_options(&cfg).client_id;
        assert!(id.starts_with("vox-edge-"));
        assert_eq!(id.len(), "vox-edge-".len() + 8);
        assert_eq!(transport_options(&Config::default()).client_id, "ultra96");
    }

    #[test]
    fn cli_accepts_config_flag() {
        let cli = Cli::parse_from(["vox-edge", "--config", "/tmp/vox.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/vox.toml")));
    }
}
