use std::sync::Arc;
use std::time::Duration;

use flume::Sender;
use rand::seq::IndexedRandom;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use super::arbiter::InteractionArbiter;
use super::PetEvent;
use crate::config::PetConfig;
use crate::conversation::{ConversationLog, ConversationTurn};
use crate::error::PetResult;

/// Keeps the pet talking while nobody else is: after `threshold` of quiet it
/// appends one locally chosen mumble, without asking the oracle.
pub struct IdleScheduler {
    log: Arc<ConversationLog>,
    arbiter: Arc<InteractionArbiter>,
    lines: Vec<String>,
    threshold: Duration,
    poll_interval: Duration,
    events: Sender<PetEvent>,
}

impl IdleScheduler {
    pub fn new(
        log: Arc<ConversationLog>,
        arbiter: Arc<InteractionArbiter>,
        config: &PetConfig,
        events: Sender<PetEvent>,
    ) -> Self {
        let lines = config
            .mumble_lines
            .iter()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect();
        Self {
            log,
            arbiter,
            lines,
            threshold: config.idle_threshold(),
            poll_interval: config.idle_poll_interval(),
            events,
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Quiet time is measured from whichever happened last: a log mutation
    /// or the close of an interaction span.
    pub fn reference_time(&self) -> Instant {
        self.log.last_mutation().max(self.arbiter.last_settled())
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.reference_time()) >= self.threshold
    }

    /// One poll. Returns the mumble if one was appended.
    pub async fn tick(&self) -> PetResult<Option<ConversationTurn>> {
        if !self.is_due(Instant::now()) || !self.arbiter.permits_mumble() {
            return Ok(None);
        }
        let Some(line) = self.lines.choose(&mut rand::rng()) else {
            return Ok(None);
        };

        let turn = ConversationTurn::mumble(line.clone());
        // re-checked under the log's writer lock, so no interaction can slip
        // in between this check and the write
        let written = self
            .log
            .append_if(turn.clone(), || {
                self.arbiter.permits_mumble() && self.is_due(Instant::now())
            })
            .await?;

        if !written {
            return Ok(None);
        }
        tracing::debug!("Idle mumble: {}", turn.content);
        let _ = self.events.send(PetEvent::TurnAppended(turn.clone()));
        Ok(Some(turn))
    }

    /// Polls until `shutdown` flips to true or its sender goes away.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "Idle chatter running (threshold {:?}, poll {:?}, {} line(s))",
            self.threshold,
            self.poll_interval,
            self.lines.len()
        );
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::warn!("Idle mumble failed: {}", e);
                        let _ = self.events.send(PetEvent::Error {
                            kind: e.kind(),
                            message: e.to_string(),
                        });
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Idle chatter stopped");
    }
}
