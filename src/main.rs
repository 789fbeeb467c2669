use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use servicehub::config::AppConfig;
use servicehub::mqtt::{
    batch_endpoint_messages, batch_outgoing_messages, ConnectivityHandle, EndpointMessage,
    InboundMessage, MqttError, RumqttcClient,
};
use servicehub::routing::{tokens, MessageRouter, TokenRegistry};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup_errors()?;

    let config_path = AppConfig::default_path();
    let config = AppConfig::load_or_create(&config_path).await?;
    setup_logging(config.tracing_level());
    info!("Loaded configuration from {}", config_path.display());

    let registry = Arc::new(TokenRegistry::new());
    let (inbound_tx, inbound_rx) = mpsc::channel(100);
    let client = RumqttcClient::new(Some(inbound_tx));
    let handle = ConnectivityHandle::spawn(Box::new(client), registry.clone(), config.retry.clone());

    let _events = spawn_event_logger(&handle);
    let _inbound = spawn_inbound_forwarder(inbound_rx, registry.clone(), config.service_name.clone());

    let options = config.broker.to_options().await?;
    let shutdown = CancellationToken::new();
    let _signal = spawn_ctrl_c(shutdown.clone());

    match handle.connect(options, shutdown.clone()).await {
        Ok(()) => {}
        Err(MqttError::Cancelled) => {
            info!("Interrupted while connecting");
            return Ok(());
        }
        Err(e) => return Err(eyre!("Failed to connect to broker: {}", e)),
    }

    if !config.subscriptions.is_empty() {
        handle
            .subscribe_many(config.subscriptions.clone())
            .await
            .map_err(|e| eyre!("Failed to subscribe: {}", e))?;
    }

    let tag_messages = batch_outgoing_messages(&config.subscriptions);
    if !tag_messages.is_empty() {
        if let Err(e) = handle.publish_many(tag_messages).await {
            warn!("Failed to publish tag test messages: {}", e);
        }
    }

    log_referenced_services(&config.endpoints);
    let batch = batch_endpoint_messages(&config.endpoints);
    if !batch.is_empty() {
        handle
            .publish_many(batch)
            .await
            .map_err(|e| eyre!("Failed to publish endpoint messages: {}", e))?;
        info!("Published {} endpoint message(s)", config.endpoints.len());
    }

    info!("Running, press Ctrl-C to stop");
    shutdown.cancelled().await;

    if let Err(e) = handle.disconnect().await {
        warn!("Disconnect failed: {}", e);
    }
    if !registry.is_empty() {
        info!("Recorded messages of {} service(s)", registry.len());
    }
    info!("Shut down");
    Ok(())
}

fn setup_errors() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn setup_logging(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

fn log_referenced_services(endpoints: &[EndpointMessage]) {
    for endpoint in endpoints {
        let services = tokens::referenced_services(&endpoint.message);
        if !services.is_empty() {
            debug!("{} references {}", endpoint.endpoint, services.join(", "));
        }
    }
}

fn spawn_ctrl_c(shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for Ctrl-C: {}", e);
            return;
        }
        info!("Ctrl-C received");
        shutdown.cancel();
    })
}

fn spawn_event_logger(handle: &ConnectivityHandle) -> tokio::task::JoinHandle<()> {
    let mut events = handle.listen();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if event.connected => info!("Broker connection up"),
                Ok(_) => info!("Broker connection down"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Missed {} connection events", n)
                }
                Err(_) => break,
            }
        }
    })
}

/// Records every inbound broker message as the latest message of `service_name`.
fn spawn_inbound_forwarder(
    mut inbound: mpsc::Receiver<InboundMessage>,
    registry: Arc<TokenRegistry>,
    service_name: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = inbound.recv().await {
            debug!("Inbound on {}: {}", message.topic, message.preview(64));
            if let Err(e) = registry.update_message(&service_name, &message.payload) {
                error!("Failed to record inbound message: {}", e);
            }
        }
    })
}
