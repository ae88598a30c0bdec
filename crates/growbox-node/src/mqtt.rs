use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};

use tokio::net::lookup_host;
use tokio::time::timeout;

use tokio_util::sync::CancellationToken;

use tracing::{debug, error};

use crate::error::TransportError;
use crate::link::{BrokerTransport, SessionOptions};

// The capacity of the bounded request channel of a session.
const REQUEST_CHANNEL_CAPACITY: usize = 10;

// Time granted to the broker to acknowledge a session.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

struct Session {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    cancellation_token: CancellationToken,
}

/// A broker transport speaking `MQTT` 3.1.1 over `TCP`.
///
/// Events are published with at-most-once quality of service. Once a session
/// is acknowledged, a background task drives its event loop and flags the
/// session down at the first network error: reconnection is left to the
/// caller.
#[derive(Default)]
pub struct MqttTransport {
    session: Option<Session>,
}

impl MqttTransport {
    /// Creates an [`MqttTransport`] with no open session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn close(&mut self) {
        if let Some(session) = self.session.take() {
            session.cancellation_token.cancel();
        }
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(TransportError::Handshake(format!(
                        "session refused: {:?}",
                        ack.code
                    )))
                };
            }
            Ok(event) => debug!("Ignoring {event:?} during the handshake"),
            Err(e) => return Err(TransportError::Handshake(e.to_string())),
        }
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    connected: Arc<AtomicBool>,
    cancellation_token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancellation_token.cancelled() => { break; }
            event = eventloop.poll() => {
                if let Err(e) = event {
                    error!("Broker session lost: {e}");
                    break;
                }
            }
        }
    }
    connected.store(false, Ordering::Release);
}

impl BrokerTransport for MqttTransport {
    async fn resolve(&mut self, host: &str, port: u16) -> Result<IpAddr, TransportError> {
        let resolution = |reason: String| TransportError::Resolution {
            host: host.into(),
            reason,
        };

        lookup_host((host, port))
            .await
            .map_err(|e| resolution(e.to_string()))?
            .next()
            .map(|address| address.ip())
            .ok_or_else(|| resolution("no address found".into()))
    }

    async fn connect(&mut self, options: &SessionOptions) -> Result<(), TransportError> {
        self.close();

        let mut mqttoptions = MqttOptions::new(
            options.client_id.as_str(),
            options.address.ip().to_string(),
            options.address.port(),
        );
        let _ = mqttoptions
            .set_keep_alive(options.keep_alive)
            .set_credentials(options.login.as_str(), options.password.expose())
            .set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, REQUEST_CHANNEL_CAPACITY);

        timeout(HANDSHAKE_TIMEOUT, await_connack(&mut eventloop))
            .await
            .map_err(|_| TransportError::Handshake("no acknowledgement from the broker".into()))??;

        let connected = Arc::new(AtomicBool::new(true));
        let cancellation_token = CancellationToken::new();

        drop(tokio::spawn(run_event_loop(
            eventloop,
            Arc::clone(&connected),
            cancellation_token.clone(),
        )));

        self.session = Some(Session {
            client,
            connected,
            cancellation_token,
        });

        Ok(())
    }

    async fn send(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        let session = self
            .session
            .as_ref()
            .filter(|session| session.connected.load(Ordering::Acquire))
            .ok_or(TransportError::NotConnected)?;

        session
            .client
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.connected.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;

    use growbox::profile::Secret;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    use crate::error::TransportError;
    use crate::link::{BrokerTransport, SessionOptions};

    use super::MqttTransport;

    fn options(address: SocketAddr) -> SessionOptions {
        SessionOptions {
            client_id: "dead01".into(),
            address,
            login: "node".into(),
            password: Secret::new("mqtt".into()),
            keep_alive: Duration::from_secs(60),
        }
    }

    // Accepts one session, answers its CONNECT with the given return code,
    // then collects bytes until `marker` shows up or the socket closes.
    async fn broker(return_code: u8, marker: &'static [u8]) -> (SocketAddr, JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buffer = vec![0; 1024];

            let _ = socket.read(&mut buffer).await.unwrap();
            socket
                .write_all(&[0x20, 0x02, 0x00, return_code])
                .await
                .unwrap();

            let mut received = Vec::new();
            while !received.windows(marker.len()).any(|w| w == marker) {
                let n = socket.read(&mut buffer).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buffer[..n]);
            }
            received
        });

        (address, handle)
    }

    #[tokio::test]
    async fn resolve_localhost() {
        let mut transport = MqttTransport::new();
        let ip = transport.resolve("127.0.0.1", 1883).await.unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn publish_over_a_session() {
        let (address, broker) = broker(0x00, b"hello").await;

        let mut transport = MqttTransport::new();
        assert!(matches!(
            transport.send("growbox/test", b"early").await,
            Err(TransportError::NotConnected)
        ));

        transport.connect(&options(address)).await.unwrap();
        assert!(transport.is_connected());

        transport.send("growbox/test", b"hello").await.unwrap();

        let received = broker.await.unwrap();
        assert!(received.windows(12).any(|w| w == b"growbox/test"));
        assert!(received.ends_with(b"hello"));
    }

    #[tokio::test]
    async fn refused_session() {
        // Return code 5: not authorized.
        let (address, _broker) = broker(0x05, b"never").await;

        let mut transport = MqttTransport::new();
        assert!(matches!(
            transport.connect(&options(address)).await,
            Err(TransportError::Handshake(_))
        ));
        assert!(!transport.is_connected());
    }
}
