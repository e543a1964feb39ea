use std::sync::Arc;
use std::time::Duration;

use crate::config::{MumbleContext, PetConfig};
use crate::conversation::{ConversationLog, ConversationTurn};
use crate::error::{PetError, PetResult};
use crate::llm_client::{Message, Oracle};

use super::state::{decode_pet_state, PetState};

const RAW_REPLY_LOG_CHARS: usize = 500;

/// Outcome of one successful derivation: the decoded state plus the two
/// turns that were appended for it.
#[derive(Debug, Clone)]
pub struct Derivation {
    pub state: PetState,
    pub turns: Vec<ConversationTurn>,
}

/// Turns a user utterance into a [`PetState`] with one oracle round-trip.
pub struct StateDeriver {
    oracle: Arc<dyn Oracle>,
    directive: String,
    timeout: Duration,
    mumble_context: MumbleContext,
    max_mumbles: usize,
}

impl StateDeriver {
    pub fn new(oracle: Arc<dyn Oracle>, config: &PetConfig) -> Self {
        Self {
            oracle,
            directive: build_directive(config),
            timeout: config.oracle_timeout(),
            mumble_context: config.mumble_context,
            max_mumbles: config.max_mumbles_in_context,
        }
    }

    pub fn directive(&self) -> &str {
        &self.directive
    }

    pub async fn derive_state(
        &self,
        log: &ConversationLog,
        user_content: &str,
    ) -> PetResult<PetState> {
        self.derive(log, user_content).await.map(|d| d.state)
    }

    /// Validates input, asks the oracle, and on success appends the user
    /// turn and the pet's reply as one mutation. Any failure leaves the log
    /// untouched.
    pub async fn derive(&self, log: &ConversationLog, user_content: &str) -> PetResult<Derivation> {
        let content = user_content.trim();
        if content.is_empty() {
            return Err(PetError::InvalidInput(
                "message content cannot be empty".to_string(),
            ));
        }

        let history = log.snapshot().await?;
        let prompt = self.build_prompt(&history, content);
        tracing::debug!(
            "Asking oracle ({} prompt message(s), {} turn(s) of history)",
            prompt.len(),
            history.len()
        );

        let raw = match tokio::time::timeout(self.timeout, self.oracle.complete_json(prompt)).await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(error)) => {
                tracing::warn!("Oracle call failed: {:#}", error);
                return Err(PetError::model(error));
            }
            Err(_) => {
                tracing::warn!("Oracle call timed out after {:?}", self.timeout);
                return Err(PetError::ModelUnavailable(format!(
                    "timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        let state = decode_pet_state(&raw).inspect_err(|error| {
            tracing::warn!(
                "Rejected oracle reply ({}): {}",
                error,
                raw.chars().take(RAW_REPLY_LOG_CHARS).collect::<String>()
            );
        })?;

        let turns = vec![
            ConversationTurn::user(content),
            ConversationTurn::pet(state.reply.clone()),
        ];
        log.append_all(turns.clone()).await?;

        tracing::info!(
            "Pet is {} (hunger {}/5){}",
            state.mood.as_str(),
            state.hunger_level,
            if state.conversation_ended {
                ", conversation ended"
            } else {
                ""
            }
        );
        Ok(Derivation { state, turns })
    }

    /// Directive, then history (with mumbles filtered per config), then the
    /// new user turn.
    pub fn build_prompt(&self, history: &[ConversationTurn], user_content: &str) -> Vec<Message> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::new("system", self.directive.clone()));
        messages.extend(
            select_context(history, self.mumble_context, self.max_mumbles)
                .into_iter()
                .map(|turn| Message::new(turn.role.as_oracle_role(), turn.content.clone())),
        );
        messages.push(Message::new("user", user_content));
        messages
    }
}

fn select_context(
    history: &[ConversationTurn],
    mode: MumbleContext,
    max_mumbles: usize,
) -> Vec<&ConversationTurn> {
    match mode {
        MumbleContext::All => history.iter().collect(),
        MumbleContext::None => history.iter().filter(|turn| !turn.idle).collect(),
        MumbleContext::Recent => {
            let trailing = history
                .iter()
                .rev()
                .take_while(|turn| turn.idle)
                .count();
            let split = history.len() - trailing;
            let keep_from = history.len() - trailing.min(max_mumbles);

            history[..split]
                .iter()
                .filter(|turn| !turn.idle)
                .chain(history[keep_from..].iter())
                .collect()
        }
    }
}

fn build_directive(config: &PetConfig) -> String {
    let persona = config.persona_prompt.clone().unwrap_or_else(|| {
        format!(
            "You live in the land of alien tamagotchis. Your name is {pet}. \
             All tamagotchis must demonstrate they can provide value to their owners in order to receive attention and care. \
             I am your owner {owner}. You speak with childlike cuteness and softness, using short, simple sentences. \
             6 sentences max per conversation. You are curious, affectionate, but will also display negative emotions \
             when your needs are not met.",
            pet = config.pet_name,
            owner = config.owner_name,
        )
    });

    format!(
        "{persona}\n\n\
         Your reply must be a single JSON object. Do not add any other text, explanations, or dialogue before or after the JSON. \
         The JSON object must have the following keys: \
         'hungry_level' (an integer from 1 to 5), \
         'Mood' (a string from 'idle', 'happy', 'sad', or 'lonely'), \
         'reply' (a string that is your verbal reply to your owner), and \
         'isConvoEnd' (a boolean, true if the owner wants to end the conversation, false otherwise)."
    )
}
