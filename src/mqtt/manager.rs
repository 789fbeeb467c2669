//! # Messaging Connectivity Manager
//!
//! Owns the one logical broker connection of the process and mediates every
//! interaction with it through a single worker task.
//!
//! ## Architecture
//!
//! ```text
//! Front-ends ──► ConnectivityHandle ──[Command]──► ConnectivityWorker ──► BrokerClient
//!    ▲               (cloneable)         mpsc          (owns state)          │
//!    │                                                      │                ▼
//!    └──── watch<ConnectionState> / broadcast<ConnectionEvent> ◄──┘        broker
//! ```
//!
//! The worker processes commands strictly in arrival order, so only one connect or
//! disconnect is ever in progress and a publish or subscribe never races a transition.
//! Requests that arrive while a connect or disconnect is running wait in the queue and
//! see the state the transition left behind: they block until it completes, then
//! either proceed (`Connected`) or fail with [`MqttError::NotConnected`].
//!
//! ## Connection State Machine
//!
//! ```text
//!                connect                 ok
//! Disconnected ──────────► Connecting ──────────► Connected
//!      ▲                   │   ▲    │                  │
//!      │  failure/cancel   │   └────┘ retry wait       │ disconnect / reconnect
//!      ├───────────────────┘                           ▼
//!      └────────────────────────────────────── Disconnecting
//! ```
//!
//! The worker task itself has a separate compile-time lifecycle
//! (`Idle → Running → Stopped`) modelled with `statum`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use statum::{machine, state};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::RetryPolicy;
use super::client::{BrokerClient, QualityOfService};
use super::error::MqttError;
use super::options::ConnectionOptions;
use super::publish::TagSubscription;
use crate::routing::MessageRouter;

const COMMAND_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 16;

macro_rules! handle_command {
    ($action:expr, $response_tx:expr) => {
        if $response_tx.send($action.await).is_err() {
            warn!("Requester went away before the response was sent");
        }
    };
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Raised after every successful connect (`true`) and every closed session (`false`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub connected: bool,
}

type Responder = oneshot::Sender<Result<(), MqttError>>;

/// Requests processed by the worker, each answered through its responder.
#[derive(Debug)]
pub enum Command {
    Connect {
        options: ConnectionOptions,
        cancel: CancellationToken,
        abort: CancellationToken,
        response_tx: Responder,
    },
    Disconnect {
        response_tx: Responder,
    },
    Subscribe {
        subscriptions: Vec<TagSubscription>,
        response_tx: Responder,
    },
    Publish {
        topic: String,
        template: String,
        qos: QualityOfService,
        retain: bool,
        response_tx: Responder,
    },
    PublishMany {
        batch: HashMap<String, Vec<String>>,
        response_tx: Responder,
    },
}

/// Front door to the connectivity manager.
///
/// Cheap to clone; every clone talks to the same worker and therefore the same broker
/// session. The worker shuts down (closing an open session) once the last clone is dropped.
#[derive(Clone)]
pub struct ConnectivityHandle {
    commands: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    /// Parent of every queued or running connect; replaced on each disconnect
    abort: Arc<Mutex<CancellationToken>>,
}

impl ConnectivityHandle {
    /// Spawns the worker task on the current tokio runtime.
    pub fn spawn(
        client: Box<dyn BrokerClient>,
        router: Arc<dyn MessageRouter>,
        retry: RetryPolicy,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        debug!("Retry policy: {:?}", retry);
        let worker = ConnectivityWorker::create(
            client,
            router,
            retry,
            commands_rx,
            state_tx,
            events_tx.clone(),
        )
        .start();

        tokio::spawn(async move {
            let stopped = worker.run().await;
            stopped.finish();
        });

        Self {
            commands: commands_tx,
            state_rx,
            events_tx,
            abort: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    /// Establishes a broker session with `options`, replacing any existing one.
    ///
    /// With a reconnect delay configured, retryable failures are retried according to
    /// the manager's [`RetryPolicy`]. Cancelling `cancel`, or calling
    /// [`disconnect`](Self::disconnect), aborts the attempt or retry wait with
    /// [`MqttError::Cancelled`].
    pub async fn connect(
        &self,
        options: ConnectionOptions,
        cancel: CancellationToken,
    ) -> Result<(), MqttError> {
        let abort = lock(&self.abort).child_token();
        self.request(|response_tx| Command::Connect {
            options,
            cancel,
            abort,
            response_tx,
        })
        .await
    }

    /// Aborts pending connects and closes the current session. No-op when disconnected.
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        {
            let mut abort = lock(&self.abort);
            abort.cancel();
            *abort = CancellationToken::new();
        }
        self.request(|response_tx| Command::Disconnect { response_tx })
            .await
    }

    pub async fn subscribe(
        &self,
        topic: impl Into<String>,
        qos: QualityOfService,
    ) -> Result<(), MqttError> {
        self.subscribe_many(vec![TagSubscription::new(topic, qos)])
            .await
    }

    /// Subscribes to every filter in order, stopping at the first failure.
    pub async fn subscribe_many(
        &self,
        subscriptions: Vec<TagSubscription>,
    ) -> Result<(), MqttError> {
        self.request(|response_tx| Command::Subscribe {
            subscriptions,
            response_tx,
        })
        .await
    }

    /// Resolves `template` against the token registry and publishes it with QoS 0.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        template: impl Into<String>,
    ) -> Result<(), MqttError> {
        self.publish_with(topic, template, QualityOfService::AtMostOnce, false)
            .await
    }

    pub async fn publish_with(
        &self,
        topic: impl Into<String>,
        template: impl Into<String>,
        qos: QualityOfService,
        retain: bool,
    ) -> Result<(), MqttError> {
        let topic = topic.into();
        let template = template.into();
        self.request(|response_tx| Command::Publish {
            topic,
            template,
            qos,
            retain,
            response_tx,
        })
        .await
    }

    /// Publishes every template of every topic.
    ///
    /// Templates of one topic are sent in the given order; topics are independent.
    pub async fn publish_many(
        &self,
        batch: HashMap<String, Vec<String>>,
    ) -> Result<(), MqttError> {
        self.request(|response_tx| Command::PublishMany { batch, response_tx })
            .await
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Registers a listener for connect/disconnect notifications.
    pub fn listen(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events_tx.subscribe()
    }

    async fn request(
        &self,
        build: impl FnOnce(Responder) -> Command,
    ) -> Result<(), MqttError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.commands
            .send(build(response_tx))
            .await
            .map_err(|_| MqttError::ChannelError("Connectivity manager is not running".into()))?;

        response_rx.await.map_err(|_| {
            MqttError::ChannelError("Connectivity manager dropped the request".into())
        })?
    }
}

fn lock(token: &Mutex<CancellationToken>) -> MutexGuard<'_, CancellationToken> {
    token.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lifecycle of the worker task
#[state]
#[derive(Debug, Clone)]
pub enum WorkerState {
    /// Channels wired, task not yet running
    Idle,
    /// Processing commands
    Running,
    /// All handles dropped, session closed
    Stopped,
}

/// The task that exclusively owns the broker client and the connection state.
#[machine]
pub struct ConnectivityWorker<S: WorkerState> {
    client: Box<dyn BrokerClient>,
    router: Arc<dyn MessageRouter>,
    retry: RetryPolicy,
    commands: mpsc::Receiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ConnectionEvent>,
}

impl<S: WorkerState> ConnectivityWorker<S> {
    fn current_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }
}

impl ConnectivityWorker<Idle> {
    pub fn create(
        client: Box<dyn BrokerClient>,
        router: Arc<dyn MessageRouter>,
        retry: RetryPolicy,
        commands: mpsc::Receiver<Command>,
        state_tx: watch::Sender<ConnectionState>,
        events_tx: broadcast::Sender<ConnectionEvent>,
    ) -> Self {
        Self::new(client, router, retry, commands, state_tx, events_tx)
    }

    pub fn start(self) -> ConnectivityWorker<Running> {
        info!("Connectivity manager started");
        self.transition()
    }
}

impl ConnectivityWorker<Running> {
    /// Processes commands until every handle is gone.
    ///
    /// While connected, a session lost by the client takes precedence over queued
    /// commands, so nothing is sent into a dead session.
    pub async fn run(mut self) -> ConnectivityWorker<Stopped> {
        loop {
            let connected = self.current_state() == ConnectionState::Connected;
            let next = tokio::select! {
                biased;
                _ = self.client.session_lost(), if connected => None,
                command = self.commands.recv() => Some(command),
            };

            match next {
                None => self.on_session_lost().await,
                Some(Some(command)) => self.dispatch(command).await,
                Some(None) => break,
            }
        }

        info!("All handles dropped, shutting down connectivity manager");
        if self.current_state() == ConnectionState::Connected {
            self.close_session().await;
        }
        self.transition()
    }

    async fn dispatch(&mut self, command: Command) {
        match command {
            Command::Connect {
                options,
                cancel,
                abort,
                response_tx,
            } => {
                handle_command!(self.connect(options, cancel, abort), response_tx);
            }
            Command::Disconnect { response_tx } => {
                handle_command!(self.disconnect(), response_tx);
            }
            Command::Subscribe {
                subscriptions,
                response_tx,
            } => {
                handle_command!(self.subscribe(subscriptions), response_tx);
            }
            Command::Publish {
                topic,
                template,
                qos,
                retain,
                response_tx,
            } => {
                handle_command!(self.publish(topic, template, qos, retain), response_tx);
            }
            Command::PublishMany { batch, response_tx } => {
                handle_command!(self.publish_many(batch), response_tx);
            }
        }
    }

    async fn connect(
        &mut self,
        options: ConnectionOptions,
        cancel: CancellationToken,
        abort: CancellationToken,
    ) -> Result<(), MqttError> {
        let request = options.connect_request().inspect_err(|e| {
            error!("Rejected connection options: {}", e);
        })?;

        if cancel.is_cancelled() || abort.is_cancelled() {
            debug!("Connect cancelled while queued");
            return Err(MqttError::Cancelled);
        }

        if self.current_state() == ConnectionState::Connected {
            info!("Closing current session before reconnecting");
            self.close_session().await;
        }

        self.set_state(ConnectionState::Connecting);
        info!(
            "Connecting to {}:{} as {}",
            request.host, request.port, request.client_id
        );

        let mut backoff = options
            .reconnect_delay
            .map(|delay| self.retry.backoff(delay));
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            debug!("Connect attempt {}", attempt);

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(MqttError::Cancelled),
                _ = abort.cancelled() => Err(MqttError::Cancelled),
                result = self.client.connect(&request) => result,
            };

            let failure = match outcome {
                Ok(()) => {
                    self.set_state(ConnectionState::Connected);
                    self.notify(true);
                    info!(
                        "Connected to {}:{} after {} attempt(s)",
                        request.host, request.port, attempt
                    );
                    return Ok(());
                }
                Err(MqttError::Cancelled) => return self.abort_connect(),
                Err(e) => e,
            };

            let Some(backoff) = backoff.as_mut() else {
                error!("Connect failed: {}", failure);
                self.set_state(ConnectionState::Disconnected);
                return Err(failure);
            };

            if !failure.is_retryable() {
                error!("Connect failed, not retrying: {}", failure);
                self.set_state(ConnectionState::Disconnected);
                return Err(failure);
            }

            let delay = match backoff.next_sleep() {
                Ok(delay) => delay,
                Err(e) => {
                    error!("Giving up on connect ({}), last failure: {}", e, failure);
                    self.set_state(ConnectionState::Disconnected);
                    return Err(failure);
                }
            };

            warn!(
                "Connect attempt {} failed: {}. Retry {}/{} in {:.2} seconds",
                attempt,
                failure,
                backoff.retry(),
                backoff.max_retries(),
                delay.as_secs_f64()
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.abort_connect(),
                _ = abort.cancelled() => return self.abort_connect(),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn on_session_lost(&mut self) {
        warn!("Broker session lost");
        self.close_session().await;
    }

    fn abort_connect(&mut self) -> Result<(), MqttError> {
        info!("Connect cancelled");
        self.set_state(ConnectionState::Disconnected);
        Err(MqttError::Cancelled)
    }

    async fn disconnect(&mut self) -> Result<(), MqttError> {
        if self.current_state() == ConnectionState::Connected {
            self.close_session().await;
        } else {
            debug!("Disconnect requested while {}", self.current_state());
        }
        Ok(())
    }

    /// Best effort: the state ends `Disconnected` even if the client reports an error.
    async fn close_session(&mut self) {
        self.set_state(ConnectionState::Disconnecting);
        if let Err(e) = self.client.disconnect().await {
            warn!("Error while closing broker session: {}", e);
        }
        self.set_state(ConnectionState::Disconnected);
        self.notify(false);
        info!("Disconnected from broker");
    }

    async fn subscribe(&mut self, subscriptions: Vec<TagSubscription>) -> Result<(), MqttError> {
        if subscriptions.iter().any(|s| s.topic.trim().is_empty()) {
            return Err(MqttError::InvalidArgument(
                "Topic filter cannot be empty or whitespace".into(),
            ));
        }
        self.ensure_connected()?;

        for sub in &subscriptions {
            debug!("Subscribing to {} with {}", sub.topic, sub.qos);
            self.client.subscribe(&sub.topic, sub.qos).await?;
        }
        info!("Subscribed to {} topic(s)", subscriptions.len());
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: String,
        template: String,
        qos: QualityOfService,
        retain: bool,
    ) -> Result<(), MqttError> {
        validate_publish_topic(&topic)?;
        self.ensure_connected()?;
        self.send(&topic, &template, qos, retain).await
    }

    async fn publish_many(&mut self, batch: HashMap<String, Vec<String>>) -> Result<(), MqttError> {
        for topic in batch.keys() {
            validate_publish_topic(topic)?;
        }
        self.ensure_connected()?;

        for (topic, templates) in &batch {
            for template in templates {
                self.send(topic, template, QualityOfService::AtMostOnce, false)
                    .await?;
            }
        }
        Ok(())
    }

    async fn send(
        &mut self,
        topic: &str,
        template: &str,
        qos: QualityOfService,
        retain: bool,
    ) -> Result<(), MqttError> {
        let payload = self.router.resolve_tokens(template);
        debug!("Publishing {} bytes to {} ({})", payload.len(), topic, qos);
        self.client.publish(topic, payload, qos, retain).await
    }

    fn ensure_connected(&self) -> Result<(), MqttError> {
        match self.current_state() {
            ConnectionState::Connected => Ok(()),
            other => {
                debug!("Request rejected, connection is {}", other);
                Err(MqttError::NotConnected)
            }
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            debug!("Connection state: {} -> {}", previous, next);
        }
    }

    fn notify(&self, connected: bool) {
        if self.events_tx.send(ConnectionEvent { connected }).is_err() {
            debug!("No listeners for connection event");
        }
    }
}

impl ConnectivityWorker<Stopped> {
    pub fn finish(self) {
        info!("Connectivity manager stopped in state {}", self.current_state());
    }
}

fn validate_publish_topic(topic: &str) -> Result<(), MqttError> {
    if topic.trim().is_empty() {
        return Err(MqttError::InvalidArgument(
            "Topic cannot be empty or whitespace".into(),
        ));
    }
    if topic.contains(&['+', '#'][..]) {
        return Err(MqttError::InvalidArgument(format!(
            "Cannot publish to wildcard topic {}",
            topic
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::client::{BoxFuture, ConnectRequest, WillMessage};
    use crate::routing::{RoutingError, TokenRegistry};
    use std::collections::VecDeque;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Connect(ConnectRequest),
        Disconnect,
        Publish {
            topic: String,
            payload: String,
            qos: QualityOfService,
            retain: bool,
        },
        Subscribe {
            topic: String,
            qos: QualityOfService,
        },
    }

    /// In-memory broker client that records calls and replays scripted connect outcomes.
    #[derive(Clone, Default)]
    struct ScriptedClient {
        calls: Arc<Mutex<Vec<Call>>>,
        outcomes: Arc<Mutex<VecDeque<Result<(), MqttError>>>>,
        connect_delay: Option<Duration>,
        /// Cancel to simulate the broker dropping an established session
        lost: CancellationToken,
    }

    impl ScriptedClient {
        fn with_outcomes(outcomes: Vec<Result<(), MqttError>>) -> Self {
            Self {
                outcomes: Arc::new(Mutex::new(outcomes.into())),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn connect_attempts(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, Call::Connect(_)))
                .count()
        }

        fn published(&self, topic: &str) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Publish { topic: t, payload, .. } if t == topic => Some(payload),
                    _ => None,
                })
                .collect()
        }
    }

    impl BrokerClient for ScriptedClient {
        fn connect<'a>(
            &'a mut self,
            request: &'a ConnectRequest,
        ) -> BoxFuture<'a, Result<(), MqttError>> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(Call::Connect(request.clone()));
                let outcome = self.outcomes.lock().unwrap().pop_front().unwrap_or(Ok(()));
                if let Some(delay) = self.connect_delay {
                    tokio::time::sleep(delay).await;
                }
                outcome
            })
        }

        fn disconnect(&mut self) -> BoxFuture<'_, Result<(), MqttError>> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(Call::Disconnect);
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
                self.calls.lock().unwrap().push(Call::Publish {
                    topic: topic.to_string(),
                    payload,
                    qos,
                    retain,
                });
                Ok(())
            })
        }

        fn subscribe<'a>(
            &'a mut self,
            topic: &'a str,
            qos: QualityOfService,
        ) -> BoxFuture<'a, Result<(), MqttError>> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(Call::Subscribe {
                    topic: topic.to_string(),
                    qos,
                });
                Ok(())
            })
        }

        fn session_lost(&mut self) -> BoxFuture<'_, ()> {
            Box::pin(self.lost.clone().cancelled_owned())
        }
    }

    /// Router that records every template it is asked to resolve.
    #[derive(Default)]
    struct RecordingRouter {
        inner: TokenRegistry,
        resolved: Mutex<Vec<String>>,
    }

    impl MessageRouter for RecordingRouter {
        fn update_message(&self, service_name: &str, message: &str) -> Result<(), RoutingError> {
            self.inner.update_message(service_name, message)
        }

        fn try_get_message(&self, service_name: &str) -> Option<String> {
            self.inner.try_get_message(service_name)
        }

        fn resolve_tokens(&self, template: &str) -> String {
            self.resolved.lock().unwrap().push(template.to_string());
            self.inner.resolve_tokens(template)
        }
    }

    fn spawn_with(client: &ScriptedClient, retry: RetryPolicy) -> (ConnectivityHandle, Arc<TokenRegistry>) {
        let registry = Arc::new(TokenRegistry::new());
        let handle = ConnectivityHandle::spawn(Box::new(client.clone()), registry.clone(), retry);
        (handle, registry)
    }

    fn spawn(client: &ScriptedClient) -> (ConnectivityHandle, Arc<TokenRegistry>) {
        spawn_with(client, RetryPolicy::default())
    }

    fn options() -> ConnectionOptions {
        ConnectionOptions::new("broker", 1883, "test-client")
    }

    fn unreachable() -> Result<(), MqttError> {
        Err(MqttError::NetworkUnreachable("connection refused".into()))
    }

    #[tokio::test]
    async fn connect_subscribe_publish_reach_client() {
        let client = ScriptedClient::default();
        let (handle, _) = spawn(&client);

        handle.connect(options(), CancellationToken::new()).await.unwrap();
        handle.subscribe("topic", QualityOfService::AtMostOnce).await.unwrap();
        handle.publish("topic", "msg").await.unwrap();

        assert_eq!(handle.state(), ConnectionState::Connected);
        let calls = client.calls();
        assert_eq!(calls.len(), 3);
        assert!(matches!(calls[0], Call::Connect(_)));
        assert_eq!(
            calls[2],
            Call::Publish {
                topic: "topic".into(),
                payload: "msg".into(),
                qos: QualityOfService::AtMostOnce,
                retain: false,
            }
        );
    }

    #[tokio::test]
    async fn publish_sends_resolved_payload_after_one_resolution() {
        let client = ScriptedClient::default();
        let router = Arc::new(RecordingRouter::default());
        router.update_message("svc", "hello").unwrap();
        let handle =
            ConnectivityHandle::spawn(Box::new(client.clone()), router.clone(), RetryPolicy::default());

        handle.connect(options(), CancellationToken::new()).await.unwrap();
        handle.publish("topic", "say {svc.Message}").await.unwrap();

        assert_eq!(*router.resolved.lock().unwrap(), vec!["say {svc.Message}".to_string()]);
        assert_eq!(client.published("topic"), vec!["say hello"]);
    }

    #[tokio::test]
    async fn publish_sees_latest_registry_value() {
        let client = ScriptedClient::default();
        let (handle, registry) = spawn(&client);
        handle.connect(options(), CancellationToken::new()).await.unwrap();

        registry.update_message("svc", "first").unwrap();
        handle.publish("t", "{svc.Message}").await.unwrap();
        registry.update_message("svc", "second").unwrap();
        handle.publish("t", "{svc.Message}").await.unwrap();

        assert_eq!(client.published("t"), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn requests_outside_connected_fail_fast() {
        let client = ScriptedClient::default();
        let (handle, _) = spawn(&client);

        assert_eq!(handle.publish("t", "m").await, Err(MqttError::NotConnected));
        assert_eq!(
            handle.subscribe("t", QualityOfService::AtLeastOnce).await,
            Err(MqttError::NotConnected)
        );
        let batch = HashMap::from([("t".to_string(), vec!["m".to_string()])]);
        assert_eq!(handle.publish_many(batch).await, Err(MqttError::NotConnected));
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn invalid_topics_are_rejected() {
        let client = ScriptedClient::default();
        let (handle, _) = spawn(&client);
        handle.connect(options(), CancellationToken::new()).await.unwrap();

        assert!(matches!(
            handle.publish("a/#", "m").await,
            Err(MqttError::InvalidArgument(_))
        ));
        assert!(matches!(
            handle.subscribe(" ", QualityOfService::AtMostOnce).await,
            Err(MqttError::InvalidArgument(_))
        ));
        assert_eq!(client.calls().len(), 1);
    }

    #[tokio::test]
    async fn retries_once_then_connects() {
        let client = ScriptedClient::with_outcomes(vec![unreachable(), Ok(())]);
        let (handle, _) = spawn(&client);

        let opts = options().with_reconnect_delay(Duration::from_millis(10));
        handle.connect(opts, CancellationToken::new()).await.unwrap();

        assert_eq!(client.connect_attempts(), 2);
        assert_eq!(handle.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn without_delay_failure_is_returned_unmodified() {
        let client = ScriptedClient::with_outcomes(vec![unreachable(), Ok(())]);
        let (handle, _) = spawn(&client);

        let result = handle.connect(options(), CancellationToken::new()).await;

        assert_eq!(result, unreachable());
        assert_eq!(client.connect_attempts(), 1);
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn authentication_rejection_is_not_retried() {
        let rejected = Err(MqttError::AuthenticationRejected("bad password".into()));
        let client = ScriptedClient::with_outcomes(vec![rejected.clone(), Ok(())]);
        let (handle, _) = spawn(&client);

        let opts = options().with_reconnect_delay(Duration::from_millis(1));
        let result = handle.connect(opts, CancellationToken::new()).await;

        assert_eq!(result, rejected);
        assert_eq!(client.connect_attempts(), 1);
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn gives_up_after_retry_budget() {
        let client = ScriptedClient::with_outcomes(vec![unreachable(); 10]);
        let retry = RetryPolicy {
            max_retries: 2,
            multiplier: 1.0,
            max_delay_secs: 1,
        };
        let (handle, _) = spawn_with(&client, retry);

        let opts = options().with_reconnect_delay(Duration::from_millis(1));
        let result = handle.connect(opts, CancellationToken::new()).await;

        assert_eq!(result, unreachable());
        assert_eq!(client.connect_attempts(), 3);
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn reconnect_closes_previous_session_exactly_once() {
        let client = ScriptedClient::default();
        let (handle, _) = spawn(&client);
        let mut events = handle.listen();

        handle.connect(options(), CancellationToken::new()).await.unwrap();
        handle.connect(options(), CancellationToken::new()).await.unwrap();

        let calls = client.calls();
        assert_eq!(calls.len(), 3);
        assert!(matches!(calls[0], Call::Connect(_)));
        assert_eq!(calls[1], Call::Disconnect);
        assert!(matches!(calls[2], Call::Connect(_)));

        assert_eq!(events.recv().await.unwrap(), ConnectionEvent { connected: true });
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent { connected: false });
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent { connected: true });
    }

    #[tokio::test]
    async fn invalid_options_keep_existing_session() {
        let client = ScriptedClient::default();
        let (handle, _) = spawn(&client);
        handle.connect(options(), CancellationToken::new()).await.unwrap();

        let result = handle
            .connect(ConnectionOptions::new("broker", 0, "id"), CancellationToken::new())
            .await;

        assert!(matches!(result, Err(MqttError::InvalidArgument(_))));
        assert_eq!(handle.state(), ConnectionState::Connected);
        assert_eq!(client.calls().len(), 1);
    }

    #[tokio::test]
    async fn will_and_session_options_reach_client() {
        let client = ScriptedClient::default();
        let (handle, _) = spawn(&client);

        let mut opts = options().with_will("t", "p", QualityOfService::AtLeastOnce, true);
        opts.keep_alive_secs = 10;
        opts.clean_session = false;
        handle.connect(opts, CancellationToken::new()).await.unwrap();

        let calls = client.calls();
        let Call::Connect(request) = &calls[0] else {
            panic!("expected a connect call");
        };
        assert_eq!(
            request.last_will,
            Some(WillMessage {
                topic: "t".into(),
                payload: "p".into(),
                qos: QualityOfService::AtLeastOnce,
                retain: true,
            })
        );
        assert_eq!(request.keep_alive, Duration::from_secs(10));
        assert!(!request.clean_session);
    }

    #[tokio::test]
    async fn publish_many_keeps_per_topic_order() {
        let client = ScriptedClient::default();
        let (handle, _) = spawn(&client);
        handle.connect(options(), CancellationToken::new()).await.unwrap();

        let batch = HashMap::from([
            ("t1".to_string(), vec!["m1".to_string(), "m2".to_string()]),
            ("t2".to_string(), vec!["m3".to_string()]),
        ]);
        handle.publish_many(batch).await.unwrap();

        assert_eq!(client.published("t1"), vec!["m1", "m2"]);
        assert_eq!(client.published("t2"), vec!["m3"]);
    }

    #[tokio::test]
    async fn subscribe_forwards_qos_unchanged() {
        let client = ScriptedClient::default();
        let (handle, _) = spawn(&client);
        handle.connect(options(), CancellationToken::new()).await.unwrap();

        handle
            .subscribe("t", QualityOfService::ExactlyOnce)
            .await
            .unwrap();

        assert_eq!(
            client.calls()[1],
            Call::Subscribe {
                topic: "t".into(),
                qos: QualityOfService::ExactlyOnce,
            }
        );
    }

    #[tokio::test]
    async fn cancel_aborts_retry_wait() {
        let client = ScriptedClient::with_outcomes(vec![unreachable(); 5]);
        let (handle, _) = spawn(&client);
        let cancel = CancellationToken::new();

        let connecting = {
            let handle = handle.clone();
            let cancel = cancel.clone();
            let opts = options().with_reconnect_delay(Duration::from_secs(30));
            tokio::spawn(async move { handle.connect(opts, cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.state(), ConnectionState::Connecting);
        cancel.cancel();

        let result = connecting.await.unwrap();
        assert_eq!(result, Err(MqttError::Cancelled));
        assert_eq!(client.connect_attempts(), 1);
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn cancel_aborts_in_flight_attempt() {
        let client = ScriptedClient {
            connect_delay: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let (handle, _) = spawn(&client);
        let cancel = CancellationToken::new();

        let connecting = {
            let handle = handle.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { handle.connect(options(), cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        assert_eq!(connecting.await.unwrap(), Err(MqttError::Cancelled));
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_aborts_pending_connect() {
        let client = ScriptedClient::with_outcomes(vec![unreachable(); 5]);
        let (handle, _) = spawn(&client);

        let connecting = {
            let handle = handle.clone();
            let opts = options().with_reconnect_delay(Duration::from_secs(30));
            tokio::spawn(async move { handle.connect(opts, CancellationToken::new()).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.disconnect().await.unwrap();

        assert_eq!(connecting.await.unwrap(), Err(MqttError::Cancelled));
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert!(!client.calls().contains(&Call::Disconnect));
    }

    #[tokio::test]
    async fn disconnect_emits_event_and_is_idempotent() {
        let client = ScriptedClient::default();
        let (handle, _) = spawn(&client);
        let mut state = handle.watch_state();

        handle.disconnect().await.unwrap();
        assert!(client.calls().is_empty());

        handle.connect(options(), CancellationToken::new()).await.unwrap();
        let mut events = handle.listen();
        handle.disconnect().await.unwrap();
        handle.disconnect().await.unwrap();

        assert_eq!(events.recv().await.unwrap(), ConnectionEvent { connected: false });
        assert!(events.try_recv().is_err());
        assert_eq!(*state.borrow_and_update(), ConnectionState::Disconnected);
        assert_eq!(
            client.calls().iter().filter(|c| **c == Call::Disconnect).count(),
            1
        );
    }

    #[tokio::test]
    async fn dropping_last_handle_closes_session() {
        let client = ScriptedClient::default();
        let (handle, _) = spawn(&client);
        handle.connect(options(), CancellationToken::new()).await.unwrap();
        let mut state = handle.watch_state();

        drop(handle);
        tokio::time::timeout(Duration::from_secs(1), async {
            while *state.borrow_and_update() != ConnectionState::Disconnected {
                if state.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(client.calls().last(), Some(&Call::Disconnect));
    }

    #[tokio::test]
    async fn publish_during_connect_waits_for_session() {
        let client = ScriptedClient {
            connect_delay: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let (handle, _) = spawn(&client);

        let connecting = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.connect(options(), CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.state(), ConnectionState::Connecting);

        handle.publish("t", "m").await.unwrap();

        assert_eq!(connecting.await.unwrap(), Ok(()));
        let calls = client.calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(calls[0], Call::Connect(_)));
        assert!(matches!(calls[1], Call::Publish { .. }));
    }

    #[tokio::test]
    async fn publish_during_failing_connect_is_not_connected() {
        let client = ScriptedClient {
            connect_delay: Some(Duration::from_millis(100)),
            ..ScriptedClient::with_outcomes(vec![unreachable()])
        };
        let (handle, _) = spawn(&client);

        let connecting = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.connect(options(), CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.state(), ConnectionState::Connecting);

        assert_eq!(handle.publish("t", "m").await, Err(MqttError::NotConnected));
        assert_eq!(connecting.await.unwrap(), unreachable());
        assert_eq!(client.connect_attempts(), 1);
        assert!(client.published("t").is_empty());
    }

    #[tokio::test]
    async fn lost_session_moves_to_disconnected() {
        let client = ScriptedClient::default();
        let (handle, _) = spawn(&client);
        let mut events = handle.listen();
        handle.connect(options(), CancellationToken::new()).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent { connected: true });

        client.lost.cancel();

        let down = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(down, ConnectionEvent { connected: false });
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert_eq!(client.calls().last(), Some(&Call::Disconnect));
        assert_eq!(handle.publish("t", "m").await, Err(MqttError::NotConnected));
        assert!(client.published("t").is_empty());
    }
}
