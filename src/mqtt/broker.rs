//! Production [`BrokerClient`] backed by `rumqttc`.

use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, LastWill, MqttOptions,
    Outgoing, Packet, TlsConfiguration, Transport,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::client::{BoxFuture, BrokerClient, ConnectRequest, QualityOfService};
use super::error::MqttError;
use super::message::InboundMessage;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_CAPACITY: usize = 100;
/// Time the driver gets to flush the DISCONNECT packet
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

struct Session {
    client: AsyncClient,
    driver: JoinHandle<()>,
    cancel: CancellationToken,
    /// Cancelled by the driver when the broker link drops
    lost: CancellationToken,
}

pub struct RumqttcClient {
    inbound: Option<mpsc::Sender<InboundMessage>>,
    connect_timeout: Duration,
    session: Option<Session>,
}

impl Default for RumqttcClient {
    fn default() -> Self {
        Self::new(None)
    }
}

impl RumqttcClient {
    /// Messages arriving on subscribed topics go to `inbound`, or are dropped without one.
    pub fn new(inbound: Option<mpsc::Sender<InboundMessage>>) -> Self {
        Self {
            inbound,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            session: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn establish(&mut self, request: &ConnectRequest) -> Result<(), MqttError> {
        self.close().await;

        let (client, mut event_loop) = AsyncClient::new(mqtt_options(request), REQUEST_CAPACITY);

        match tokio::time::timeout(self.connect_timeout, await_conn_ack(&mut event_loop)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(MqttError::NetworkUnreachable(format!(
                    "No CONNACK from {}:{} within {:?}",
                    request.host, request.port, self.connect_timeout
                )))
            }
        }

        let cancel = CancellationToken::new();
        let lost = CancellationToken::new();
        let driver = tokio::spawn(drive(
            event_loop,
            self.inbound.clone(),
            cancel.clone(),
            lost.clone(),
        ));
        self.session = Some(Session {
            client,
            driver,
            cancel,
            lost,
        });
        Ok(())
    }

    async fn close(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if session.lost.is_cancelled() {
            debug!("Session already lost, skipping DISCONNECT");
        } else if let Err(e) = session.client.try_disconnect() {
            warn!("Error queueing disconnect packet: {:?}", e);
        }

        let finished = match tokio::time::timeout(DISCONNECT_GRACE, &mut session.driver).await {
            Ok(joined) => joined,
            Err(_) => {
                debug!("Driver did not flush DISCONNECT in time, stopping it");
                session.cancel.cancel();
                session.driver.await
            }
        };
        if let Err(e) = finished {
            warn!("Event loop driver ended abnormally: {}", e);
        }
    }

    /// The current session, unless it was never established or has been lost.
    fn live_session(&self) -> Result<&Session, MqttError> {
        self.session
            .as_ref()
            .filter(|session| !session.lost.is_cancelled())
            .ok_or(MqttError::NotConnected)
    }
}

impl BrokerClient for RumqttcClient {
    fn connect<'a>(&'a mut self, request: &'a ConnectRequest) -> BoxFuture<'a, Result<(), MqttError>> {
        Box::pin(self.establish(request))
    }

    fn disconnect(&mut self) -> BoxFuture<'_, Result<(), MqttError>> {
        Box::pin(async move {
            self.close().await;
            Ok(())
        })
    }

    fn publish<'a>(
        &'a mut self,
        topic: &'a str,
        payload: String,
        qos: QualityOfService,
        retain: bool,
    ) -> BoxFuture<'a, Result<(), MqttError>> {
        Box::pin(async move {
            self.live_session()?
                .client
                .try_publish(topic, qos.into(), retain, payload.into_bytes())
                .map_err(|e| MqttError::Transfer(e.to_string()))
        })
    }

    fn subscribe<'a>(
        &'a mut self,
        topic: &'a str,
        qos: QualityOfService,
    ) -> BoxFuture<'a, Result<(), MqttError>> {
        Box::pin(async move {
            self.live_session()?
                .client
                .try_subscribe(topic, qos.into())
                .map_err(|e| MqttError::Transfer(e.to_string()))
        })
    }

    fn session_lost(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            match &self.session {
                Some(session) => session.lost.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        })
    }
}

fn mqtt_options(request: &ConnectRequest) -> MqttOptions {
    let mut options = MqttOptions::new(request.client_id.clone(), request.host.clone(), request.port);
    options
        .set_keep_alive(request.keep_alive)
        .set_clean_session(request.clean_session);

    if let Some(credentials) = &request.credentials {
        options.set_credentials(credentials.username.clone(), credentials.password.clone());
    }

    if let Some(will) = &request.last_will {
        options.set_last_will(LastWill::new(
            will.topic.clone(),
            will.payload.clone().into_bytes(),
            will.qos.into(),
            will.retain,
        ));
    }

    if let Some(tls) = &request.tls {
        let transport = match &tls.ca_certificate {
            Some(ca) => {
                let client_auth = match (&tls.client_certificate, &tls.client_key) {
                    (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
                    _ => None,
                };
                Transport::Tls(TlsConfiguration::Simple {
                    ca: ca.clone(),
                    alpn: None,
                    client_auth,
                })
            }
            None => Transport::tls_with_default_config(),
        };
        options.set_transport(transport);
    }

    options
}

async fn await_conn_ack(event_loop: &mut EventLoop) -> Result<(), MqttError> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(classify_refusal(ack.code))
                };
            }
            Ok(event) => trace!("Event before CONNACK: {:?}", event),
            Err(e) => return Err(classify_connection_error(&e)),
        }
    }
}

/// Keeps the event loop running and forwards incoming PUBLISH packets.
///
/// Stops after the DISCONNECT packet went out, on `cancel`, or on the first connection
/// error. An error cancels `lost`; the event loop is not polled again, so it never
/// reconnects on its own.
async fn drive(
    mut event_loop: EventLoop,
    inbound: Option<mpsc::Sender<InboundMessage>>,
    cancel: CancellationToken,
    lost: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = event_loop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage::from_topic(publish.topic, &publish.payload);
                debug!("Received {}", message);
                if let Some(tx) = &inbound {
                    if tx.send(message).await.is_err() {
                        debug!("Inbound receiver closed, dropping message");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Disconnected by broker");
                lost.cancel();
                break;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("DISCONNECT sent");
                break;
            }
            Ok(event) => trace!("Event: {:?}", event),
            Err(e) => {
                warn!("Broker connection lost: {}", e);
                lost.cancel();
                break;
            }
        }
    }
    info!("Event loop driver stopped");
}

fn classify_refusal(code: ConnectReturnCode) -> MqttError {
    match code {
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            MqttError::AuthenticationRejected(format!("{:?}", code))
        }
        ConnectReturnCode::ServiceUnavailable => {
            MqttError::NetworkUnreachable(format!("{:?}", code))
        }
        other => MqttError::ProtocolError(format!("Connection refused: {:?}", other)),
    }
}

fn classify_connection_error(err: &ConnectionError) -> MqttError {
    match err {
        ConnectionError::ConnectionRefused(code) => classify_refusal(*code),
        ConnectionError::Io(e) => MqttError::NetworkUnreachable(e.to_string()),
        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => {
            MqttError::NetworkUnreachable(err.to_string())
        }
        ConnectionError::Tls(e) => MqttError::ProtocolError(format!("TLS: {}", e)),
        ConnectionError::MqttState(e) => MqttError::ProtocolError(e.to_string()),
        ConnectionError::NotConnAck(packet) => {
            MqttError::ProtocolError(format!("Expected CONNACK, got {:?}", packet))
        }
        #[allow(unreachable_patterns)]
        other => MqttError::ProtocolError(other.to_string()),
    }
}
