//! The broker link.
//!
//! A [`LinkSupervisor`] exclusively owns the wireless association and the
//! single broker session of the node. Actors share it through a reference
//! and only ever call [`Publish::publish`] on it.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use growbox::profile::{BrokerCredentials, Secret, WirelessCredentials};

use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, timeout};

use tracing::{debug, info, warn};

use crate::error::{LinkError, PublishError, RadioError, TransportError};

/// Broker port.
pub const BROKER_PORT: u16 = 1883;

/// Keepalive interval of the broker session.
pub const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Time during which publishes are dropped after a failed recovery, instead
/// of recovering again.
pub const RECOVERY_HOLDOFF: Duration = Duration::from_secs(10);

// Used when the radio reports no unique identifier.
const FALLBACK_CLIENT_ID: &str = "growbox-node";

/// The wireless layer.
#[allow(async_fn_in_trait)]
pub trait Radio {
    /// Associates with the wireless network.
    ///
    /// # Errors
    ///
    /// Fails if the access point refuses the association or no interface is
    /// usable.
    async fn associate(&mut self, credentials: &WirelessCredentials) -> Result<(), RadioError>;

    /// Whether the node is currently associated.
    fn is_associated(&self) -> bool;

    /// The stable hardware-unique identifier of the node.
    fn unique_id(&self) -> Vec<u8>;
}

/// The transport carrying the broker session.
#[allow(async_fn_in_trait)]
pub trait BrokerTransport {
    /// Resolves the broker hostname.
    ///
    /// # Errors
    ///
    /// Fails if the hostname has no address.
    async fn resolve(&mut self, host: &str, port: u16) -> Result<IpAddr, TransportError>;

    /// Opens a session, replacing the current one if any.
    ///
    /// # Errors
    ///
    /// Fails if the broker cannot be reached or refuses the session.
    async fn connect(&mut self, options: &SessionOptions) -> Result<(), TransportError>;

    /// Writes a payload on a topic.
    ///
    /// # Errors
    ///
    /// Fails if no session is open or the write does not complete.
    async fn send(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Whether a session is currently open.
    fn is_connected(&self) -> bool;
}

/// Publishes payloads on topics.
#[allow(async_fn_in_trait)]
pub trait Publish {
    /// Publishes a payload on a topic.
    ///
    /// Delivery is best-effort and at-most-once.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Dropped`] when the payload was not delivered.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError>;
}

/// Broker session parameters.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Client identifier.
    pub client_id: String,
    /// Resolved broker address.
    pub address: SocketAddr,
    /// Session login.
    pub login: String,
    /// Session password.
    pub password: Secret,
    /// Keepalive interval.
    pub keep_alive: Duration,
}

/// Bounded retry with exponential backoff for wireless association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Wait after the first failed attempt.
    pub initial_backoff: Duration,
    /// Upper bound of a single wait.
    pub max_backoff: Duration,
    /// Time granted to a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Returns the wait following the given failed attempt, starting at `1`.
    ///
    /// The wait doubles at each attempt, up to
    /// [`max_backoff`](Self::max_backoff).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Link parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    /// Association retry policy.
    pub retry: RetryPolicy,
    /// Broker port.
    pub port: u16,
    /// Session keepalive.
    pub keep_alive: Duration,
    /// Time during which publishes are dropped after a failed recovery.
    pub recovery_holdoff: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            port: BROKER_PORT,
            keep_alive: KEEP_ALIVE,
            recovery_holdoff: RECOVERY_HOLDOFF,
        }
    }
}

#[derive(Debug, Default)]
struct LinkState {
    associated: bool,
    connected: bool,
    broker_ip: Option<IpAddr>,
    client_id: Option<String>,
    // Set while a send is in flight. A send cancelled midway leaves it set,
    // since the session may carry a partial frame.
    sending: bool,
    // When the last unsuccessful recovery started or ended.
    failed_recovery: Option<Instant>,
}

struct Link<R, T> {
    radio: R,
    transport: T,
    state: LinkState,
}

impl<R: Radio, T: BrokerTransport> Link<R, T> {
    fn is_up(&mut self) -> bool {
        self.state.associated = self.radio.is_associated();
        self.state.connected =
            self.state.associated && !self.state.sending && self.transport.is_connected();
        self.state.connected
    }

    async fn send(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.state.sending = true;
        let result = self.transport.send(topic, payload).await;
        self.state.sending = false;
        result
    }

    fn recovery_held_off(&self, holdoff: Duration) -> Option<Duration> {
        self.state
            .failed_recovery
            .map(|at| at.elapsed())
            .filter(|elapsed| *elapsed < holdoff)
    }

    async fn associate(
        &mut self,
        credentials: &WirelessCredentials,
        policy: &RetryPolicy,
    ) -> Result<(), LinkError> {
        let attempts = policy.max_attempts.max(1);

        for attempt in 1..=attempts {
            info!(attempt, "Associating with `{}`", credentials.ssid);

            let error = match timeout(policy.attempt_timeout, self.radio.associate(credentials))
                .await
            {
                Ok(Ok(())) => {
                    self.state.associated = true;
                    info!("Associated with `{}`", credentials.ssid);
                    return Ok(());
                }
                Ok(Err(e)) => e,
                Err(_) => RadioError::Timeout,
            };

            self.state.associated = false;
            warn!(attempt, "Association failed: {error}");

            if attempt < attempts {
                sleep(policy.backoff(attempt)).await;
            }
        }

        Err(LinkError::AssociationFailed { attempts })
    }

    async fn connect_broker(
        &mut self,
        broker: Option<&BrokerCredentials>,
        settings: &LinkSettings,
    ) -> Result<(), LinkError> {
        self.state.connected = false;
        let broker = broker.ok_or(TransportError::NoBroker)?;

        let ip = self.transport.resolve(&broker.address, settings.port).await?;
        self.state.broker_ip = Some(ip);

        let client_id = self.client_id().to_owned();
        let options = SessionOptions {
            client_id,
            address: SocketAddr::new(ip, settings.port),
            login: broker.login.clone(),
            password: broker.password.clone(),
            keep_alive: settings.keep_alive,
        };

        debug!(
            "Opening a session with {} as `{}`",
            options.address, options.client_id
        );
        self.transport.connect(&options).await?;
        self.state.connected = true;
        self.state.sending = false;

        info!("Connected to the broker at {}", options.address);
        Ok(())
    }

    // One recovery cycle. An interrupted recovery counts as a failed one.
    async fn recover(
        &mut self,
        wireless: &WirelessCredentials,
        broker: Option<&BrokerCredentials>,
        settings: &LinkSettings,
    ) -> Result<(), LinkError> {
        self.state.failed_recovery = Some(Instant::now());
        let result = self.reconnect(wireless, broker, settings).await;
        self.state.failed_recovery = result.is_err().then(Instant::now);
        result
    }

    // Reassociates if needed, then reopens the session.
    async fn reconnect(
        &mut self,
        wireless: &WirelessCredentials,
        broker: Option<&BrokerCredentials>,
        settings: &LinkSettings,
    ) -> Result<(), LinkError> {
        debug!(
            associated = self.state.associated,
            broker = ?self.state.broker_ip,
            "Recovering the link"
        );
        if !self.radio.is_associated() {
            self.associate(wireless, &settings.retry).await?;
        }
        self.connect_broker(broker, settings).await
    }

    fn client_id(&mut self) -> &str {
        self.state.client_id.get_or_insert_with(|| {
            let id = self
                .radio
                .unique_id()
                .iter()
                .map(|byte| format!("{byte:02x}"))
                .collect::<String>();
            if id.is_empty() {
                FALLBACK_CLIENT_ID.into()
            } else {
                id
            }
        })
    }
}

/// Owner of the wireless association and the broker session.
///
/// Every operation takes an internal admission gate, so sends of concurrent
/// callers never interleave on the wire.
///
/// A publish finding the link down runs one recovery cycle. Once a recovery
/// fails, publishes are dropped without recovering for
/// [`recovery_holdoff`](LinkSettings::recovery_holdoff), so callers queued
/// on the gate do not repeat it.
pub struct LinkSupervisor<R, T> {
    wireless: WirelessCredentials,
    broker: Option<BrokerCredentials>,
    settings: LinkSettings,
    link: Mutex<Link<R, T>>,
}

impl<R: Radio, T: BrokerTransport> LinkSupervisor<R, T> {
    /// Creates a [`LinkSupervisor`].
    ///
    /// Nothing is associated nor connected until
    /// [`associate`](Self::associate) and
    /// [`connect_broker`](Self::connect_broker) are called.
    #[must_use]
    pub fn new(
        radio: R,
        transport: T,
        wireless: WirelessCredentials,
        broker: Option<BrokerCredentials>,
        settings: LinkSettings,
    ) -> Self {
        Self {
            wireless,
            broker,
            settings,
            link: Mutex::new(Link {
                radio,
                transport,
                state: LinkState::default(),
            }),
        }
    }

    /// Associates with the wireless network.
    ///
    /// Attempts are bounded by the [`RetryPolicy`] and separated by an
    /// exponential backoff.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::AssociationFailed`] once every attempt failed.
    pub async fn associate(&self) -> Result<(), LinkError> {
        let mut link = self.link.lock().await;
        link.associate(&self.wireless, &self.settings.retry).await
    }

    /// Resolves the broker and opens a session.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::BrokerConnectFailed`] if the broker cannot be
    /// resolved or refuses the session.
    pub async fn connect_broker(&self) -> Result<(), LinkError> {
        let mut link = self.link.lock().await;
        link.connect_broker(self.broker.as_ref(), &self.settings)
            .await
    }
}

impl<R: Radio, T: BrokerTransport> Publish for LinkSupervisor<R, T> {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        let mut guard = self.link.lock().await;
        let link = &mut *guard;

        if link.is_up() {
            match link.send(topic, payload).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(topic, "Send failed, recovering the link: {e}"),
            }
        } else if let Some(elapsed) = link.recovery_held_off(self.settings.recovery_holdoff) {
            debug!(
                topic,
                "Event dropped, the link failed to recover {} ms ago",
                elapsed.as_millis()
            );
            return Err(PublishError::Dropped);
        } else {
            debug!(topic, "Link down, recovering before sending");
        }

        if let Err(e) = link
            .recover(&self.wireless, self.broker.as_ref(), &self.settings)
            .await
        {
            warn!(topic, "Event dropped, link recovery failed: {e}");
            return Err(PublishError::Dropped);
        }

        match link.send(topic, payload).await {
            Ok(()) => Ok(()),
            Err(e) => {
                link.state.connected = false;
                warn!(topic, "Event dropped after recovery: {e}");
                Err(PublishError::Dropped)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::net::{IpAddr, Ipv4Addr};
    use std::rc::Rc;
    use std::time::Duration;

    use growbox::profile::{BrokerCredentials, Secret, WirelessCredentials};

    use tokio::task::{JoinSet, LocalSet, yield_now};

    use crate::error::{LinkError, PublishError, RadioError, TransportError};

    use super::{
        BrokerTransport, LinkSettings, LinkSupervisor, Publish, RECOVERY_HOLDOFF, Radio,
        RetryPolicy, SessionOptions,
    };

    #[derive(Default)]
    struct Counters {
        associated: Cell<bool>,
        refused_associations: Cell<u32>,
        associations: Cell<u32>,
        connected: Cell<bool>,
        refused_connections: Cell<u32>,
        connections: Cell<u32>,
        failing_sends: Cell<u32>,
        sends: Cell<u32>,
        client_ids: RefCell<Vec<String>>,
        wire: RefCell<Vec<u8>>,
    }

    struct FakeRadio(Rc<Counters>);

    impl Radio for FakeRadio {
        async fn associate(&mut self, _: &WirelessCredentials) -> Result<(), RadioError> {
            self.0.associations.set(self.0.associations.get() + 1);
            let refused = self.0.refused_associations.get();
            if refused > 0 {
                self.0.refused_associations.set(refused - 1);
                return Err(RadioError::Rejected("wrong password".into()));
            }
            self.0.associated.set(true);
            Ok(())
        }

        fn is_associated(&self) -> bool {
            self.0.associated.get()
        }

        fn unique_id(&self) -> Vec<u8> {
            vec![0xDE, 0xAD, 0x01]
        }
    }

    struct FakeTransport(Rc<Counters>);

    impl BrokerTransport for FakeTransport {
        async fn resolve(&mut self, _: &str, _: u16) -> Result<IpAddr, TransportError> {
            Ok(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)))
        }

        async fn connect(&mut self, options: &SessionOptions) -> Result<(), TransportError> {
            self.0.connections.set(self.0.connections.get() + 1);
            self.0
                .client_ids
                .borrow_mut()
                .push(options.client_id.clone());
            let refused = self.0.refused_connections.get();
            if refused > 0 {
                self.0.refused_connections.set(refused - 1);
                return Err(TransportError::Handshake("bad credentials".into()));
            }
            self.0.connected.set(true);
            Ok(())
        }

        async fn send(&mut self, _: &str, payload: &[u8]) -> Result<(), TransportError> {
            self.0.sends.set(self.0.sends.get() + 1);
            let failing = self.0.failing_sends.get();
            if failing > 0 {
                self.0.failing_sends.set(failing - 1);
                self.0.connected.set(false);
                return Err(TransportError::Send("broken pipe".into()));
            }
            // Writes in chunks, yielding in between, like a socket would.
            for chunk in payload.chunks(2) {
                self.0.wire.borrow_mut().extend_from_slice(chunk);
                yield_now().await;
            }
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.0.connected.get()
        }
    }

    fn supervisor(counters: &Rc<Counters>) -> LinkSupervisor<FakeRadio, FakeTransport> {
        LinkSupervisor::new(
            FakeRadio(Rc::clone(counters)),
            FakeTransport(Rc::clone(counters)),
            WirelessCredentials::new("greenhouse".into(), Secret::new("wifi".into())),
            Some(BrokerCredentials::new(
                "broker.local".into(),
                "node".into(),
                Secret::new("mqtt".into()),
            )),
            LinkSettings::default(),
        )
    }

    #[test]
    fn backoff_doubles_up_to_the_bound() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_secs(1));
        assert_eq!(policy.backoff(4), Duration::from_secs(4));
        assert_eq!(policy.backoff(6), Duration::from_secs(8));
        assert_eq!(policy.backoff(40), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn association_is_bounded() {
        let counters = Rc::new(Counters::default());
        counters.refused_associations.set(u32::MAX);
        let link = supervisor(&counters);

        let err = link.associate().await.unwrap_err();
        assert!(matches!(err, LinkError::AssociationFailed { attempts: 5 }));
        assert_eq!(counters.associations.get(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn association_retries_until_success() {
        let counters = Rc::new(Counters::default());
        counters.refused_associations.set(2);
        let link = supervisor(&counters);

        let start = tokio::time::Instant::now();
        link.associate().await.unwrap();
        assert_eq!(counters.associations.get(), 3);
        // 500 ms then 1 s of backoff.
        assert_eq!(start.elapsed(), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_derives_client_id() {
        let counters = Rc::new(Counters::default());
        let link = supervisor(&counters);

        link.associate().await.unwrap();
        link.connect_broker().await.unwrap();
        assert_eq!(counters.client_ids.borrow().as_slice(), ["dead01"]);

        counters.refused_connections.set(1);
        assert!(matches!(
            link.connect_broker().await,
            Err(LinkError::BrokerConnectFailed(
                TransportError::Handshake(_)
            ))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn disassociated_publish_recovers_once() {
        let counters = Rc::new(Counters::default());
        let link = supervisor(&counters);

        link.publish("t", b"first").await.unwrap();
        assert_eq!(counters.associations.get(), 1);
        assert_eq!(counters.connections.get(), 1);
        assert_eq!(counters.sends.get(), 1);

        // Radio lost, and the send following the recovery fails too.
        counters.associated.set(false);
        counters.failing_sends.set(1);

        assert_eq!(link.publish("t", b"second").await, Err(PublishError::Dropped));
        assert_eq!(counters.associations.get(), 2);
        assert_eq!(counters.connections.get(), 2);
        assert_eq!(counters.sends.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_is_retried_once() {
        let counters = Rc::new(Counters::default());
        let link = supervisor(&counters);
        link.associate().await.unwrap();
        link.connect_broker().await.unwrap();

        counters.failing_sends.set(1);
        link.publish("t", b"ok").await.unwrap();
        assert_eq!(counters.sends.get(), 2);
        assert_eq!(counters.connections.get(), 2);
        // The radio stayed up.
        assert_eq!(counters.associations.get(), 1);

        counters.failing_sends.set(2);
        assert_eq!(link.publish("t", b"lost").await, Err(PublishError::Dropped));
        assert_eq!(counters.sends.get(), 4);
        assert_eq!(counters.connections.get(), 3);
        assert_eq!(counters.wire.borrow().as_slice(), b"ok".as_slice());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_recovery_drops_without_sending() {
        let counters = Rc::new(Counters::default());
        counters.refused_associations.set(u32::MAX);
        let link = supervisor(&counters);

        assert_eq!(link.publish("t", b"x").await, Err(PublishError::Dropped));
        assert_eq!(counters.sends.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_recovery_is_not_repeated_during_holdoff() {
        let counters = Rc::new(Counters::default());
        counters.refused_associations.set(u32::MAX);
        let link = supervisor(&counters);

        assert_eq!(link.publish("t", b"x").await, Err(PublishError::Dropped));
        assert_eq!(counters.associations.get(), 5);

        // Dropped at once, without touching the radio.
        let start = tokio::time::Instant::now();
        assert_eq!(link.publish("t", b"y").await, Err(PublishError::Dropped));
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(counters.associations.get(), 5);

        tokio::time::sleep(RECOVERY_HOLDOFF).await;
        counters.refused_associations.set(0);
        link.publish("t", b"z").await.unwrap();
        assert_eq!(counters.associations.get(), 6);
        assert_eq!(counters.wire.borrow().as_slice(), b"z".as_slice());
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_send_reopens_the_session() {
        let counters = Rc::new(Counters::default());
        let link = supervisor(&counters);
        link.associate().await.unwrap();
        link.connect_broker().await.unwrap();

        // Cancelled after the first chunk reached the wire.
        let interrupted =
            tokio::time::timeout(Duration::ZERO, link.publish("t", b"partial")).await;
        assert!(interrupted.is_err());
        assert_eq!(counters.connections.get(), 1);

        link.publish("t", b"ok").await.unwrap();
        assert_eq!(counters.connections.get(), 2);
        assert_eq!(counters.associations.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_publishes_never_interleave() {
        let counters = Rc::new(Counters::default());
        let link = Rc::new(supervisor(&counters));

        let local = LocalSet::new();
        local
            .run_until(async {
                let mut tasks = JoinSet::new();
                for payload in ["AAAAAAAAAA", "BBBBBBBBBB", "CCCCCCCCCC"] {
                    let link = Rc::clone(&link);
                    let _ = tasks.spawn_local(async move {
                        for _ in 0..3 {
                            link.publish("t", payload.as_bytes()).await.unwrap();
                        }
                    });
                }
                while let Some(result) = tasks.join_next().await {
                    result.unwrap();
                }
            })
            .await;

        let wire = counters.wire.borrow();
        assert_eq!(wire.len(), 90);
        for frame in wire.chunks(10) {
            assert!(frame.iter().all(|byte| *byte == frame[0]));
        }
    }
}
