pub mod arbiter;
pub mod deriver;
pub mod idle;
pub mod state;

use std::sync::{Arc, Mutex, MutexGuard};

use flume::Sender;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;

use crate::config::PetConfig;
use crate::conversation::{ConversationLog, ConversationTurn};
use crate::error::{PetError, PetResult};
use crate::llm_client::Oracle;
use crate::presentation::{asset_for, FALLBACK_ASSET, HUG_ASSET};
use crate::store::Store;

use arbiter::{ArbiterPhase, Interaction, InteractionArbiter, InteractionPermit};
use deriver::StateDeriver;
use idle::IdleScheduler;
use state::{Mood, PetState};

/// Everything observers of the pet may want to react to.
#[derive(Debug, Clone)]
pub enum PetEvent {
    TurnAppended(ConversationTurn),
    MoodChanged {
        state: PetState,
        asset: &'static str,
    },
    ArbiterChanged(ArbiterPhase),
    HugStarted {
        asset: &'static str,
    },
    LogReset(Vec<ConversationTurn>),
    Error {
        kind: &'static str,
        message: String,
    },
}

/// A decoded state together with the asset the presenter should show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PetView {
    #[serde(flatten)]
    pub state: PetState,
    pub asset: &'static str,
}

impl PetView {
    fn from_state(state: PetState) -> Self {
        let asset = asset_for(state.mood);
        Self { state, asset }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PetStatus {
    pub phase: ArbiterPhase,
    pub mood: Option<Mood>,
    pub asset: &'static str,
    pub hungry_level: Option<u8>,
    pub conversation_ended: bool,
    pub turn_count: usize,
    pub idle_for_ms: u64,
    pub hug_pending: bool,
}

/// Coordinates the log, the oracle, the idle chatter and the arbiter that
/// keeps them from stepping on each other.
pub struct Pet {
    config: PetConfig,
    log: Arc<ConversationLog>,
    arbiter: Arc<InteractionArbiter>,
    deriver: StateDeriver,
    idle: Arc<IdleScheduler>,
    events: Sender<PetEvent>,
    current: Mutex<Option<PetState>>,
    pending_hug: Mutex<Option<AbortHandle>>,
}

impl Pet {
    pub fn new(
        config: PetConfig,
        store: Arc<dyn Store>,
        oracle: Arc<dyn Oracle>,
        events: Sender<PetEvent>,
    ) -> Self {
        let log = Arc::new(ConversationLog::new(store, config.greeting.clone()));
        let arbiter = Arc::new(InteractionArbiter::new(
            config.interaction_cooldown(),
            Some(events.clone()),
        ));
        let deriver = StateDeriver::new(oracle, &config);
        let idle = Arc::new(IdleScheduler::new(
            log.clone(),
            arbiter.clone(),
            &config,
            events.clone(),
        ));

        Self {
            config,
            log,
            arbiter,
            deriver,
            idle,
            events,
            current: Mutex::new(None),
            pending_hug: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PetConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<ConversationLog> {
        &self.log
    }

    pub fn arbiter(&self) -> &Arc<InteractionArbiter> {
        &self.arbiter
    }

    /// Brings the log into its start-of-process shape.
    pub async fn startup(&self) -> PetResult<()> {
        if self.config.reset_on_start {
            self.reset().await?;
            return Ok(());
        }
        let existing = self.log.read_all().await?;
        if existing.is_empty() {
            self.log.reset().await?;
        } else {
            tracing::info!("Keeping existing conversation ({} turn(s))", existing.len());
        }
        Ok(())
    }

    pub async fn messages(&self) -> PetResult<Vec<ConversationTurn>> {
        self.log.read_all().await
    }

    /// One user message, one oracle round-trip.
    pub async fn chat(&self, content: &str) -> PetResult<PetView> {
        if content.trim().is_empty() {
            return Err(PetError::InvalidInput(
                "message content cannot be empty".to_string(),
            ));
        }
        let permit = self.arbiter.begin(Interaction::Chat)?;
        self.interact(&permit, content).await
    }

    /// Opens a hug span right away, then after the hug delay sends the hug
    /// utterance through the chat path. Resolves when the span ends.
    pub async fn hug(self: &Arc<Self>) -> PetResult<PetView> {
        let permit = self.arbiter.begin(Interaction::Hug)?;
        self.emit(PetEvent::HugStarted { asset: HUG_ASSET });
        tracing::info!("Hug started");

        let (done_tx, done_rx) = oneshot::channel();
        let pet = Arc::clone(self);
        let delay = self.config.hug_delay();

        {
            // hold the slot while spawning so the task cannot clear it first
            let mut pending = self.pending_hug_slot();
            let task = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                // only the delay is cancellable
                if pet.pending_hug_slot().take().is_none() {
                    return;
                }
                let utterance = pet.config.hug_utterance();
                let result = pet.interact(&permit, &utterance).await;
                drop(permit);
                let _ = done_tx.send(result);
            });
            *pending = Some(task.abort_handle());
        }

        done_rx.await.unwrap_or(Err(PetError::Cancelled))
    }

    /// Aborts a pending hug. Returns whether there was one.
    pub fn cancel_hug(&self) -> bool {
        match self.pending_hug_slot().take() {
            Some(handle) => {
                handle.abort();
                tracing::info!("Hug cancelled");
                true
            }
            None => false,
        }
    }

    /// Appends an externally chosen mumble, subject to the same gate as the
    /// idle scheduler.
    pub async fn mumble(&self, content: &str) -> PetResult<ConversationTurn> {
        let content = content.trim();
        if content.is_empty() {
            return Err(PetError::InvalidInput(
                "mumble content cannot be empty".to_string(),
            ));
        }

        let turn = ConversationTurn::mumble(content);
        let written = self
            .log
            .append_if(turn.clone(), || self.arbiter.permits_mumble())
            .await?;
        if !written {
            return Err(PetError::Busy);
        }
        tracing::debug!("External mumble: {}", turn.content);
        self.emit(PetEvent::TurnAppended(turn.clone()));
        Ok(turn)
    }

    /// Clears the conversation back to the greeting.
    pub async fn reset(&self) -> PetResult<Vec<ConversationTurn>> {
        let _permit = self.arbiter.begin(Interaction::Reset)?;
        let turns = self.log.reset().await.inspect_err(|e| self.emit_error(e))?;
        *self.current_slot() = None;
        self.emit(PetEvent::LogReset(turns.clone()));
        Ok(turns)
    }

    pub async fn status(&self) -> PetResult<PetStatus> {
        let turn_count = self.log.len().await?;
        let current = self.current_slot().clone();
        let idle_for = Instant::now().saturating_duration_since(self.idle.reference_time());

        Ok(PetStatus {
            phase: self.arbiter.phase(),
            mood: current.as_ref().map(|state| state.mood),
            asset: current
                .as_ref()
                .map(|state| asset_for(state.mood))
                .unwrap_or(FALLBACK_ASSET),
            hungry_level: current.as_ref().map(|state| state.hunger_level),
            conversation_ended: current
                .as_ref()
                .map(|state| state.conversation_ended)
                .unwrap_or(false),
            turn_count,
            idle_for_ms: idle_for.as_millis() as u64,
            hug_pending: self.pending_hug_slot().is_some(),
        })
    }

    /// Starts idle chatter unless it is disabled in config.
    pub fn spawn_idle_loop(&self, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        if !self.config.enable_idle_chatter {
            tracing::info!("Idle chatter disabled");
            return None;
        }
        Some(tokio::spawn(self.idle.clone().run(shutdown)))
    }

    async fn interact(&self, permit: &InteractionPermit, content: &str) -> PetResult<PetView> {
        tracing::debug!("{:?} interaction: {}", permit.interaction(), content.trim());
        let derivation = self
            .deriver
            .derive(&self.log, content)
            .await
            .inspect_err(|e| self.emit_error(e))?;

        for turn in &derivation.turns {
            self.emit(PetEvent::TurnAppended(turn.clone()));
        }
        let view = PetView::from_state(derivation.state);
        *self.current_slot() = Some(view.state.clone());
        self.emit(PetEvent::MoodChanged {
            state: view.state.clone(),
            asset: view.asset,
        });
        Ok(view)
    }

    fn emit(&self, event: PetEvent) {
        let _ = self.events.send(event);
    }

    fn emit_error(&self, error: &PetError) {
        self.emit(PetEvent::Error {
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    fn current_slot(&self) -> MutexGuard<'_, Option<PetState>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pending_hug_slot(&self) -> MutexGuard<'_, Option<AbortHandle>> {
        self.pending_hug
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
