use std::rc::Rc;

use growbox::profile::DeviceProfile;

use tokio::task::{JoinSet, LocalSet};

use tokio_util::sync::CancellationToken;

use tracing::{error, info};

use crate::actor::DutyCycleActor;
use crate::error::HardwareError;
use crate::hardware::Board;
use crate::link::Publish;

/// Runs one [`DutyCycleActor`] per sensor of a profile.
///
/// Actors are multiplexed on the current thread. Each one is a separate task,
/// so a panicking actor is logged and the others keep running.
pub struct Scheduler<B: Board, P> {
    actors: Vec<DutyCycleActor<B, P>>,
}

impl<B, P> Scheduler<B, P>
where
    B: Board + 'static,
    P: Publish + 'static,
{
    /// Creates a [`Scheduler`], claiming the hardware of every sensor.
    ///
    /// When the profile disables monitoring, the publisher is never handed
    /// to the actors.
    ///
    /// # Errors
    ///
    /// Fails as soon as the board refuses a hardware handle.
    pub fn new(
        profile: &DeviceProfile,
        mut board: B,
        publisher: Rc<P>,
    ) -> Result<Self, HardwareError> {
        let publisher = profile.monitoring().then_some(publisher);

        let actors = profile
            .sensors()
            .iter()
            .map(|spec| {
                DutyCycleActor::new(profile.id(), spec.clone(), &mut board, publisher.clone())
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { actors })
    }

    /// Number of actors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actors.len()
    }

    /// Whether the scheduler has no actor.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    /// Runs every actor until the token is cancelled.
    pub async fn run(self, cancellation_token: CancellationToken) {
        info!("Running {} actors", self.actors.len());

        let local = LocalSet::new();
        local
            .run_until(async move {
                let mut tasks = JoinSet::new();
                for actor in self.actors {
                    let _ = tasks.spawn_local(actor.run(cancellation_token.clone()));
                }

                while let Some(result) = tasks.join_next().await {
                    if let Err(e) = result {
                        error!("Actor terminated abnormally: {e}");
                    }
                }

                // Even with no actor left, return only on cancellation.
                cancellation_token.cancelled().await;
            })
            .await;

        info!("Scheduler stopped");
    }
}
