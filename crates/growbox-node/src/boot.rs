use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use growbox::profile::DeviceProfile;

use tokio::time::sleep;

use tokio_util::sync::CancellationToken;

use tracing::{error, info, warn};

use crate::credentials::{CipherKey, CredentialStore};
use crate::error::BootError;
use crate::hardware::Board;
use crate::link::{BrokerTransport, LinkSettings, LinkSupervisor, Radio};
use crate::scheduler::Scheduler;

/// Default path of the bootstrap file.
pub const DEFAULT_BOOTSTRAP_PATH: &str = "secrets.json";

/// Default pause between two boot attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Boot parameters.
#[derive(Debug, Clone)]
pub struct BootConfig {
    /// Path of the bootstrap file.
    pub bootstrap: PathBuf,
    /// Key protecting the credentials of the bootstrap file.
    pub key: CipherKey,
    /// Link parameters.
    pub link: LinkSettings,
    /// Pause between two boot attempts.
    pub retry_delay: Duration,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            bootstrap: PathBuf::from(DEFAULT_BOOTSTRAP_PATH),
            key: CipherKey::FACTORY,
            link: LinkSettings::default(),
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// A booted node, ready to run its actors.
pub struct Node<B: Board, P> {
    profile: DeviceProfile,
    scheduler: Scheduler<B, P>,
}

impl<B, P> Node<B, P>
where
    B: Board + 'static,
    P: crate::link::Publish + 'static,
{
    /// The profile the node booted with.
    #[must_use]
    pub const fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    /// Runs the actors until the token is cancelled.
    pub async fn run(self, cancellation_token: CancellationToken) {
        info!(
            "Thing {} (`{}`) running",
            self.profile.id(),
            self.profile.hostname()
        );
        self.scheduler.run(cancellation_token).await;
    }
}

/// Boots a node.
///
/// The sequence loads the profile, associates with the wireless network,
/// opens the broker session when monitoring is enabled, then claims the
/// hardware of every sensor. A broker that cannot be reached is not fatal:
/// the session is reopened by the first publish.
///
/// # Errors
///
/// Fails if the profile cannot be loaded, if the association fails, or if
/// the board refuses a hardware handle. Nothing survives a failed boot, so
/// the sequence can be retried from scratch.
pub async fn boot<B, R, T>(
    config: &BootConfig,
    radio: R,
    transport: T,
    board: B,
) -> Result<Node<B, LinkSupervisor<R, T>>, BootError>
where
    B: Board + 'static,
    R: Radio + 'static,
    T: BrokerTransport + 'static,
{
    let profile = CredentialStore::with_key(config.key).load(&config.bootstrap)?;

    let link = Rc::new(LinkSupervisor::new(
        radio,
        transport,
        profile.wireless().clone(),
        profile.broker().cloned(),
        config.link,
    ));

    link.associate().await?;

    if profile.monitoring() {
        if let Err(e) = link.connect_broker().await {
            warn!("{e}, the session will be reopened on the first publish");
        }
    } else {
        info!("Monitoring disabled, nothing will be published");
    }

    let scheduler = Scheduler::new(&profile, board, link)?;

    Ok(Node { profile, scheduler })
}

/// Boots a node, pausing and retrying after every failure.
///
/// The closure provides fresh components for each attempt. Returns `None`
/// if the token is cancelled before a boot succeeds.
pub async fn boot_until_ready<B, R, T, F>(
    config: &BootConfig,
    mut components: F,
    cancellation_token: &CancellationToken,
) -> Option<Node<B, LinkSupervisor<R, T>>>
where
    B: Board + 'static,
    R: Radio + 'static,
    T: BrokerTransport + 'static,
    F: FnMut() -> (R, T, B),
{
    loop {
        let (radio, transport, board) = components();

        let attempt = tokio::select! {
            biased;
            () = cancellation_token.cancelled() => return None,
            attempt = boot(config, radio, transport, board) => attempt,
        };

        match attempt {
            Ok(node) => return Some(node),
            Err(e) => error!(
                "Boot failed: {e}, retrying in {} ms",
                config.retry_delay.as_millis()
            ),
        }

        tokio::select! {
            biased;
            () = cancellation_token.cancelled() => return None,
            () = sleep(config.retry_delay) => {}
        }
    }
}
