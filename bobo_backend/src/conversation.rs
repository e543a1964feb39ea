use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{PetError, PetResult};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    /// Older conversation files store the pet's turns as "assistant".
    #[serde(alias = "assistant")]
    Pet,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Pet => "pet",
            Role::System => "system",
        }
    }

    /// Role name understood by OpenAI-compatible chat endpoints.
    pub fn as_oracle_role(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Pet => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Role::User),
            "pet" | "assistant" => Some(Role::Pet),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/// One immutable entry of the conversation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
    /// Set on idle mumbles so prompt building can tell filler from dialogue.
    #[serde(default, skip_serializing_if = "is_false")]
    pub idle: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            idle: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn pet(content: impl Into<String>) -> Self {
        Self::new(Role::Pet, content)
    }

    pub fn mumble(content: impl Into<String>) -> Self {
        Self {
            idle: true,
            ..Self::new(Role::Pet, content)
        }
    }
}

/// Ordered, append-only conversation history backed by a [`Store`].
///
/// All mutation goes through one writer lock and is a full read-modify-write
/// of the stored sequence, so concurrent appends can never overwrite each
/// other. Reads do not take the lock: stores write atomically, so a reader
/// sees either the state before or after a mutation.
pub struct ConversationLog {
    store: Arc<dyn Store>,
    greeting: String,
    writer: tokio::sync::Mutex<()>,
    last_mutation: Mutex<Instant>,
}

impl ConversationLog {
    pub fn new(store: Arc<dyn Store>, greeting: impl Into<String>) -> Self {
        Self {
            store,
            greeting: greeting.into(),
            writer: tokio::sync::Mutex::new(()),
            last_mutation: Mutex::new(Instant::now()),
        }
    }

    /// The sequence a fresh or reset log starts from.
    pub fn seed(&self) -> Vec<ConversationTurn> {
        if self.greeting.trim().is_empty() {
            Vec::new()
        } else {
            vec![ConversationTurn::pet(self.greeting.clone())]
        }
    }

    /// Full ordered history. A log that was never written reads as empty.
    pub async fn read_all(&self) -> PetResult<Vec<ConversationTurn>> {
        match self.store.read().await {
            Ok(Some(turns)) => Ok(turns),
            Ok(None) => Ok(Vec::new()),
            Err(error) => {
                tracing::error!("Failed to read conversation log: {:#}", error);
                Err(PetError::store(error))
            }
        }
    }

    /// Reads the history once any in-flight mutation has landed.
    pub async fn snapshot(&self) -> PetResult<Vec<ConversationTurn>> {
        let _writer = self.writer.lock().await;
        self.read_all().await
    }

    pub async fn append(&self, turn: ConversationTurn) -> PetResult<()> {
        self.append_all(vec![turn]).await
    }

    /// Appends several turns as a single atomic mutation.
    pub async fn append_all(&self, turns: Vec<ConversationTurn>) -> PetResult<()> {
        let _writer = self.writer.lock().await;
        self.write_locked(turns).await
    }

    /// Appends `turn` only if `permit` still holds once the writer lock is
    /// taken. Returns whether the turn was written.
    ///
    /// The predicate runs while no other mutation can start, which lets the
    /// idle path re-check the arbiter without a window between check and write.
    pub async fn append_if<F>(&self, turn: ConversationTurn, permit: F) -> PetResult<bool>
    where
        F: FnOnce() -> bool,
    {
        let _writer = self.writer.lock().await;
        if !permit() {
            return Ok(false);
        }
        self.write_locked(vec![turn]).await?;
        Ok(true)
    }

    /// Clears the log back to its seed.
    pub async fn reset(&self) -> PetResult<Vec<ConversationTurn>> {
        let _writer = self.writer.lock().await;
        let seed = self.seed();
        self.store.write(&seed).await.map_err(|error| {
            tracing::error!("Failed to reset conversation log: {:#}", error);
            PetError::store(error)
        })?;
        self.touch();
        tracing::info!("Conversation log reset ({} seed turn(s))", seed.len());
        Ok(seed)
    }

    /// Number of turns currently stored.
    pub async fn len(&self) -> PetResult<usize> {
        Ok(self.read_all().await?.len())
    }

    pub fn last_mutation(&self) -> Instant {
        *self
            .last_mutation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn write_locked(&self, turns: Vec<ConversationTurn>) -> PetResult<()> {
        let mut current = self.read_all().await?;
        current.extend(turns);
        self.store.write(&current).await.map_err(|error| {
            tracing::error!("Failed to write conversation log: {:#}", error);
            PetError::store(error)
        })?;
        self.touch();
        Ok(())
    }

    fn touch(&self) {
        let mut guard = self
            .last_mutation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Instant::now();
    }
}
