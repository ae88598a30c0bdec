//! Node scenarios, from the bootstrap file to the published events.

use std::cell::{Cell, RefCell};
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;
use std::time::Duration;

use growbox::profile::WirelessCredentials;

use growbox_node::boot::{BootConfig, boot, boot_until_ready};
use growbox_node::credentials::CredentialStore;
use growbox_node::error::{BootError, ConfigError, PublishError, RadioError, TransportError};
use growbox_node::link::{
    BrokerTransport, LinkSettings, LinkSupervisor, Publish, Radio, SessionOptions,
};
use growbox_node::scheduler::Scheduler;
use growbox_node::sim::{Action, SimulatedBoard};

use serde_json::{Value, json};

use tempfile::NamedTempFile;

use tokio::time::{Instant, sleep, sleep_until};

use tokio_util::sync::CancellationToken;

// Publisher recording every event with its emission time.
struct Recorder {
    start: Instant,
    events: RefCell<Vec<(Duration, Value)>>,
}

impl Recorder {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            events: RefCell::new(Vec::new()),
        }
    }

    fn events(&self) -> Vec<(Duration, Value)> {
        self.events.borrow().clone()
    }
}

impl Publish for Recorder {
    async fn publish(&self, _: &str, payload: &[u8]) -> Result<(), PublishError> {
        self.events
            .borrow_mut()
            .push((self.start.elapsed(), serde_json::from_slice(payload).unwrap()));
        Ok(())
    }
}

#[derive(Default)]
struct Network {
    refuse_associations: Cell<bool>,
    hang_associations: Cell<bool>,
    associations: Cell<u32>,
    associated: Cell<bool>,
    connections: Cell<u32>,
    connected: Cell<bool>,
    sent: RefCell<Vec<(String, Value)>>,
}

struct FakeRadio(Rc<Network>);

impl Radio for FakeRadio {
    async fn associate(&mut self, _: &WirelessCredentials) -> Result<(), RadioError> {
        self.0.associations.set(self.0.associations.get() + 1);
        if self.0.hang_associations.get() {
            std::future::pending::<()>().await;
        }
        if self.0.refuse_associations.get() {
            return Err(RadioError::Rejected("out of range".into()));
        }
        self.0.associated.set(true);
        Ok(())
    }

    fn is_associated(&self) -> bool {
        self.0.associated.get()
    }

    fn unique_id(&self) -> Vec<u8> {
        vec![0x0A, 0x0B]
    }
}

struct FakeTransport(Rc<Network>);

impl BrokerTransport for FakeTransport {
    async fn resolve(&mut self, _: &str, _: u16) -> Result<IpAddr, TransportError> {
        Ok(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    async fn connect(&mut self, _: &SessionOptions) -> Result<(), TransportError> {
        self.0.connections.set(self.0.connections.get() + 1);
        self.0.connected.set(true);
        Ok(())
    }

    async fn send(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.0
            .sent
            .borrow_mut()
            .push((topic.into(), serde_json::from_slice(payload).unwrap()));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.0.connected.get()
    }
}

fn bootstrap(store: &CredentialStore, monitoring: bool, sensors: Value) -> Value {
    let mut value = json!({
        "thing_id": 1,
        "thing_hostname": "grow-1",
        "thing_monitoring": monitoring,
        "wifi": { "ssid": "greenhouse", "password": store.encrypt("wifi-pass") },
        "thing_sensors": sensors,
    });
    if monitoring {
        value["mqtt"] = json!({
            "url": "broker.local",
            "login": "node",
            "password": store.encrypt("mqtt-pass"),
        });
    }
    value
}

fn pump(id: u32, pin: u8) -> Value {
    json!({
        "id": id,
        "topic": format!("sensors/{id}"),
        "kind": "pump",
        "configs": [
            { "name": "pin", "value": pin },
            { "name": "period_on", "value": 5 },
            { "name": "period_off", "value": 10 },
        ],
    })
}

fn bootstrap_file(value: &Value) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{value}").unwrap();
    file
}

fn last_level(board: &SimulatedBoard, pin: u8) -> Option<bool> {
    board.journal().iter().rev().find_map(|action| match *action {
        Action::Level { pin: p, high } if p == pin => Some(high),
        _ => None,
    })
}

async fn cancel_after(cancellation_token: CancellationToken, duration: Duration) {
    sleep(duration).await;
    cancellation_token.cancel();
}

#[tokio::test(start_paused = true)]
async fn pump_duty_cycle_over_thirty_seconds() {
    let store = CredentialStore::new();
    let profile = store
        .parse(&bootstrap(&store, true, json!([pump(10, 4)])).to_string())
        .unwrap();

    let recorder = Rc::new(Recorder::new());
    let scheduler = Scheduler::new(&profile, SimulatedBoard::new(), Rc::clone(&recorder)).unwrap();

    let token = CancellationToken::new();
    tokio::join!(
        scheduler.run(token.clone()),
        cancel_after(token, Duration::from_millis(30_500))
    );

    let events = recorder.events();
    let statuses: Vec<_> = events.iter().map(|(_, e)| e["status"].clone()).collect();
    assert_eq!(statuses, vec![json!(0), json!(1), json!(0), json!(1), json!(0)]);

    let times: Vec<_> = events.iter().map(|(t, _)| t.as_secs()).collect();
    assert_eq!(times, vec![0, 5, 15, 20, 30]);

    for (_, event) in &events {
        assert_eq!(event["thingId"], 1);
        assert_eq!(event["sensorId"], 10);
        assert_eq!(event["topic"], "sensors/10");
        assert_eq!(event["name"], "pump");
    }
}

#[tokio::test(start_paused = true)]
async fn air_probe_reports_temperature_then_humidity() {
    let store = CredentialStore::new();
    let sensor = json!({
        "id": 12,
        "topic": "sensors/air",
        "kind": "temp",
        "configs": [
            { "name": "pin", "value": "6" },
            { "name": "period_on", "value": 1 },
            { "name": "period_off", "value": 60 },
        ],
    });
    let profile = store
        .parse(&bootstrap(&store, true, json!([sensor])).to_string())
        .unwrap();

    // The simulated probe reads 21.5 °C and 46 %.
    let recorder = Rc::new(Recorder::new());
    let scheduler = Scheduler::new(&profile, SimulatedBoard::new(), Rc::clone(&recorder)).unwrap();

    let token = CancellationToken::new();
    tokio::join!(
        scheduler.run(token.clone()),
        cancel_after(token, Duration::from_millis(1_500))
    );

    let events: Vec<_> = recorder.events().into_iter().map(|(_, e)| e).collect();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["name"], "temp");
    assert_eq!(events[0]["status"], 21.5);
    assert_eq!(events[1]["name"], "hum");
    assert_eq!(events[1]["status"], 46.0);
}

#[tokio::test(start_paused = true)]
async fn independent_actors_keep_their_own_periods() {
    let store = CredentialStore::new();
    let light = json!({
        "id": 11,
        "topic": "sensors/11",
        "configs": [
            { "name": "kind", "value": "light" },
            { "name": "pin", "value": 5 },
            { "name": "color", "value": "(0, 255, 0)" },
            { "name": "number_led", "value": 4 },
            { "name": "period_on", "value": 2 },
            { "name": "period_off", "value": 2 },
        ],
    });
    let profile = store
        .parse(&bootstrap(&store, true, json!([pump(10, 4), light])).to_string())
        .unwrap();

    let recorder = Rc::new(Recorder::new());
    let scheduler = Scheduler::new(&profile, SimulatedBoard::new(), Rc::clone(&recorder)).unwrap();

    let token = CancellationToken::new();
    tokio::join!(
        scheduler.run(token.clone()),
        cancel_after(token, Duration::from_millis(9_500))
    );

    let events = recorder.events();
    let light_times: Vec<_> = events
        .iter()
        .filter(|(_, e)| e["name"] == "light")
        .map(|(t, _)| t.as_secs())
        .collect();
    assert_eq!(light_times, vec![0, 2, 4, 6, 8]);

    let pump_times: Vec<_> = events
        .iter()
        .filter(|(_, e)| e["name"] == "pump")
        .map(|(t, _)| t.as_secs())
        .collect();
    assert_eq!(pump_times, vec![0, 5]);
}

#[tokio::test(start_paused = true)]
async fn pumps_keep_their_schedule_while_the_link_is_lost() {
    let store = CredentialStore::new();
    let profile = store
        .parse(&bootstrap(&store, true, json!([pump(10, 4), pump(11, 5)])).to_string())
        .unwrap();

    let network = Rc::new(Network::default());
    network.hang_associations.set(true);
    let link = Rc::new(LinkSupervisor::new(
        FakeRadio(Rc::clone(&network)),
        FakeTransport(Rc::clone(&network)),
        profile.wireless().clone(),
        profile.broker().cloned(),
        LinkSettings::default(),
    ));

    let board = SimulatedBoard::new();
    let scheduler = Scheduler::new(&profile, board.clone(), link).unwrap();

    let start = Instant::now();
    let token = CancellationToken::new();
    let checks = async {
        // Running (low) for 5 s, stopped (high) for 10 s.
        for (at, high) in [(2_500, false), (7_500, true), (17_500, false), (25_000, true)] {
            sleep_until(start + Duration::from_millis(at)).await;
            for pin in [4, 5] {
                assert_eq!(last_level(&board, pin), Some(high), "pin {pin} at {at} ms");
            }
        }
        token.cancel();
    };
    tokio::join!(scheduler.run(token.clone()), checks);

    assert!(network.sent.borrow().is_empty());
    // One recovery per ON phase, the queued publishes were dropped.
    assert_eq!(network.associations.get(), 2);
}

#[tokio::test(start_paused = true)]
async fn boot_with_monitoring_publishes_through_the_link() {
    let store = CredentialStore::new();
    let file = bootstrap_file(&bootstrap(&store, true, json!([pump(10, 4)])));
    let config = BootConfig {
        bootstrap: file.path().into(),
        ..BootConfig::default()
    };

    let network = Rc::new(Network::default());
    let node = boot(
        &config,
        FakeRadio(Rc::clone(&network)),
        FakeTransport(Rc::clone(&network)),
        SimulatedBoard::new(),
    )
    .await
    .unwrap();

    assert_eq!(node.profile().hostname(), "grow-1");
    assert_eq!(network.associations.get(), 1);
    assert_eq!(network.connections.get(), 1);

    let token = CancellationToken::new();
    tokio::join!(
        node.run(token.clone()),
        cancel_after(token, Duration::from_millis(5_500))
    );

    let sent = network.sent.borrow();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].0, "sensors/10");
    assert_eq!(sent[0].1["status"], 0);
    assert_eq!(sent[1].1["status"], 1);
}

#[tokio::test(start_paused = true)]
async fn boot_without_monitoring_never_reaches_the_broker() {
    let store = CredentialStore::new();
    let file = bootstrap_file(&bootstrap(&store, false, json!([pump(10, 4)])));
    let config = BootConfig {
        bootstrap: file.path().into(),
        ..BootConfig::default()
    };

    let network = Rc::new(Network::default());
    let board = SimulatedBoard::new();
    let node = boot(
        &config,
        FakeRadio(Rc::clone(&network)),
        FakeTransport(Rc::clone(&network)),
        board.clone(),
    )
    .await
    .unwrap();

    let token = CancellationToken::new();
    tokio::join!(
        node.run(token.clone()),
        cancel_after(token, Duration::from_secs(30))
    );

    assert_eq!(network.associations.get(), 1);
    assert_eq!(network.connections.get(), 0);
    assert!(network.sent.borrow().is_empty());
    assert!(!board.journal().is_empty());
}

#[tokio::test]
async fn boot_fails_without_bootstrap_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = BootConfig {
        bootstrap: dir.path().join("secrets.json"),
        ..BootConfig::default()
    };

    let network = Rc::new(Network::default());
    let result = boot(
        &config,
        FakeRadio(Rc::clone(&network)),
        FakeTransport(Rc::clone(&network)),
        SimulatedBoard::new(),
    )
    .await;

    assert!(matches!(
        result,
        Err(BootError::Config(ConfigError::Io(_)))
    ));
    assert_eq!(network.associations.get(), 0);
}

#[tokio::test(start_paused = true)]
async fn boot_is_retried_after_a_pause() {
    let store = CredentialStore::new();
    let file = bootstrap_file(&bootstrap(&store, true, json!([pump(10, 4)])));
    let mut config = BootConfig {
        bootstrap: file.path().into(),
        ..BootConfig::default()
    };
    config.link.retry.max_attempts = 2;

    let network = Rc::new(Network::default());
    network.refuse_associations.set(true);

    let boots = Cell::new(0);
    let start = Instant::now();
    let node = boot_until_ready(
        &config,
        || {
            boots.set(boots.get() + 1);
            // The radio comes back for the second boot.
            if boots.get() == 2 {
                network.refuse_associations.set(false);
            }
            (
                FakeRadio(Rc::clone(&network)),
                FakeTransport(Rc::clone(&network)),
                SimulatedBoard::new(),
            )
        },
        &CancellationToken::new(),
    )
    .await;

    assert!(node.is_some());
    assert_eq!(boots.get(), 2);
    assert_eq!(network.associations.get(), 3);
    // One association backoff, then the boot pause.
    assert_eq!(
        start.elapsed(),
        config.link.retry.backoff(1) + config.retry_delay
    );
}

#[tokio::test]
async fn cancelled_boot_gives_up() {
    let dir = tempfile::tempdir().unwrap();
    let config = BootConfig {
        bootstrap: dir.path().join("secrets.json"),
        ..BootConfig::default()
    };

    let token = CancellationToken::new();
    token.cancel();

    let network = Rc::new(Network::default());
    let node = boot_until_ready(
        &config,
        || {
            (
                FakeRadio(Rc::clone(&network)),
                FakeTransport(Rc::clone(&network)),
                SimulatedBoard::new(),
            )
        },
        &token,
    )
    .await;

    assert!(node.is_none());
}
