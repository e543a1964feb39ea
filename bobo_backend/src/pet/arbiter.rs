use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use flume::Sender;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::PetEvent;
use crate::error::{PetError, PetResult};

/// What started an interaction span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interaction {
    Chat,
    Hug,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterState {
    Idle,
    AwaitingModel {
        interaction: Interaction,
        since: Instant,
    },
    CooldownAfterInteraction {
        until: Instant,
    },
}

impl ArbiterState {
    pub fn phase(&self) -> ArbiterPhase {
        match self {
            ArbiterState::Idle => ArbiterPhase::Idle,
            ArbiterState::AwaitingModel { .. } => ArbiterPhase::AwaitingModel,
            ArbiterState::CooldownAfterInteraction { .. } => ArbiterPhase::Cooldown,
        }
    }
}

/// Data-free view of [`ArbiterState`] for the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbiterPhase {
    Idle,
    AwaitingModel,
    Cooldown,
}

struct Inner {
    state: ArbiterState,
    last_settled: Instant,
}

/// Gatekeeper for everything that touches the conversation log.
///
/// At most one interaction span is open at a time; a second request while a
/// span is open is rejected with [`PetError::Busy`] rather than queued. Idle
/// mumbles are only permitted in [`ArbiterState::Idle`].
pub struct InteractionArbiter {
    inner: Mutex<Inner>,
    cooldown: Duration,
    events: Option<Sender<PetEvent>>,
}

impl InteractionArbiter {
    pub fn new(cooldown: Duration, events: Option<Sender<PetEvent>>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ArbiterState::Idle,
                last_settled: Instant::now(),
            }),
            cooldown,
            events,
        }
    }

    /// Opens an interaction span. The span lasts until the returned permit
    /// is dropped.
    pub fn begin(self: &Arc<Self>, interaction: Interaction) -> PetResult<InteractionPermit> {
        let mut inner = self.lock();
        self.resolve(&mut inner);
        if let ArbiterState::AwaitingModel { interaction: busy, .. } = inner.state {
            tracing::debug!("Rejecting {:?}: {:?} still in flight", interaction, busy);
            return Err(PetError::Busy);
        }

        inner.state = ArbiterState::AwaitingModel {
            interaction,
            since: Instant::now(),
        };
        self.publish(ArbiterPhase::AwaitingModel);
        tracing::debug!("Arbiter: {:?} span opened", interaction);

        Ok(InteractionPermit {
            arbiter: Arc::clone(self),
            interaction,
        })
    }

    pub fn state(&self) -> ArbiterState {
        let mut inner = self.lock();
        self.resolve(&mut inner);
        inner.state
    }

    pub fn phase(&self) -> ArbiterPhase {
        self.state().phase()
    }

    /// Whether an idle mumble may touch the log right now.
    pub fn permits_mumble(&self) -> bool {
        self.state() == ArbiterState::Idle
    }

    /// When the last interaction span closed (or construction time).
    pub fn last_settled(&self) -> Instant {
        self.lock().last_settled
    }

    fn settle(&self, interaction: Interaction) {
        let mut inner = self.lock();
        let now = Instant::now();
        inner.last_settled = now;
        inner.state = if self.cooldown.is_zero() {
            ArbiterState::Idle
        } else {
            ArbiterState::CooldownAfterInteraction {
                until: now + self.cooldown,
            }
        };
        self.publish(inner.state.phase());
        tracing::debug!("Arbiter: {:?} span closed", interaction);
    }

    // Cooldown lapses lazily, the first time anyone looks after it expires.
    fn resolve(&self, inner: &mut Inner) {
        if let ArbiterState::CooldownAfterInteraction { until } = inner.state {
            if Instant::now() >= until {
                inner.state = ArbiterState::Idle;
                self.publish(ArbiterPhase::Idle);
            }
        }
    }

    fn publish(&self, phase: ArbiterPhase) {
        if let Some(events) = &self.events {
            let _ = events.send(PetEvent::ArbiterChanged(phase));
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Proof that an interaction span is open. Dropping it closes the span, so
/// success, failure, timeout and task cancellation all release the arbiter.
#[must_use = "the interaction span closes as soon as the permit is dropped"]
pub struct InteractionPermit {
    arbiter: Arc<InteractionArbiter>,
    interaction: Interaction,
}

impl InteractionPermit {
    pub fn interaction(&self) -> Interaction {
        self.interaction
    }
}

impl Drop for InteractionPermit {
    fn drop(&mut self) {
        self.arbiter.settle(self.interaction);
    }
}
