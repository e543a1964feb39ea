use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PetError, PetResult};

pub const MIN_HUNGER: i64 = 1;
pub const MAX_HUNGER: i64 = 5;

const HUNGER_KEY: &str = "hungry_level";
const MOOD_KEY: &str = "Mood";
const REPLY_KEY: &str = "reply";
const LEGACY_REPLY_KEY: &str = "mumblejumble";
const CONVO_END_KEY: &str = "isConvoEnd";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    Idle,
    Happy,
    Sad,
    Lonely,
}

impl Mood {
    pub const ALL: [Mood; 4] = [Mood::Idle, Mood::Happy, Mood::Sad, Mood::Lonely];

    pub fn as_str(self) -> &'static str {
        match self {
            Mood::Idle => "idle",
            Mood::Happy => "happy",
            Mood::Sad => "sad",
            Mood::Lonely => "lonely",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "idle" => Some(Mood::Idle),
            "happy" => Some(Mood::Happy),
            "sad" => Some(Mood::Sad),
            "lonely" => Some(Mood::Lonely),
            _ => None,
        }
    }
}

/// Affective snapshot decoded from one oracle reply.
///
/// Field names on the wire match the oracle schema, so clients written for
/// the raw model output can read it unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PetState {
    #[serde(rename = "hungry_level")]
    pub hunger_level: u8,
    #[serde(rename = "Mood")]
    pub mood: Mood,
    pub reply: String,
    #[serde(rename = "isConvoEnd")]
    pub conversation_ended: bool,
}

/// Validates raw oracle text and converts it into a [`PetState`].
///
/// Every required key must be present with the right type and range;
/// nothing is defaulted.
pub fn decode_pet_state(raw: &str) -> PetResult<PetState> {
    let json = extract_json(raw)
        .ok_or_else(|| invalid("reply does not contain a JSON object".to_string()))?;
    let value: Value =
        serde_json::from_str(&json).map_err(|e| invalid(format!("malformed JSON: {e}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| invalid("reply is not a JSON object".to_string()))?;

    Ok(PetState {
        hunger_level: hunger_level(object)?,
        mood: mood(object)?,
        reply: reply_text(object)?,
        conversation_ended: conversation_ended(object)?,
    })
}

fn invalid(message: String) -> PetError {
    PetError::InvalidOracleResponse(message)
}

fn required<'a>(object: &'a Map<String, Value>, key: &str) -> PetResult<&'a Value> {
    object
        .get(key)
        .ok_or_else(|| invalid(format!("missing key '{key}'")))
}

fn hunger_level(object: &Map<String, Value>) -> PetResult<u8> {
    let value = required(object, HUNGER_KEY)?;
    let level = value
        .as_i64()
        .ok_or_else(|| invalid(format!("'{HUNGER_KEY}' must be an integer, got {value}")))?;
    if !(MIN_HUNGER..=MAX_HUNGER).contains(&level) {
        return Err(invalid(format!(
            "'{HUNGER_KEY}' must be between {MIN_HUNGER} and {MAX_HUNGER}, got {level}"
        )));
    }
    Ok(level as u8)
}

fn mood(object: &Map<String, Value>) -> PetResult<Mood> {
    let value = required(object, MOOD_KEY)?;
    let raw = value
        .as_str()
        .ok_or_else(|| invalid(format!("'{MOOD_KEY}' must be a string, got {value}")))?;
    Mood::parse(raw).ok_or_else(|| invalid(format!("unknown mood '{raw}'")))
}

fn reply_text(object: &Map<String, Value>) -> PetResult<String> {
    let (key, value) = match object.get(REPLY_KEY) {
        Some(value) => (REPLY_KEY, value),
        None => match object.get(LEGACY_REPLY_KEY) {
            Some(value) => (LEGACY_REPLY_KEY, value),
            None => return Err(invalid(format!("missing key '{REPLY_KEY}'"))),
        },
    };
    let text = value
        .as_str()
        .ok_or_else(|| invalid(format!("'{key}' must be a string, got {value}")))?;
    if text.trim().is_empty() {
        return Err(invalid(format!("'{key}' is empty")));
    }
    Ok(text.to_string())
}

fn conversation_ended(object: &Map<String, Value>) -> PetResult<bool> {
    let value = required(object, CONVO_END_KEY)?;
    value
        .as_bool()
        .ok_or_else(|| invalid(format!("'{CONVO_END_KEY}' must be a boolean, got {value}")))
}

/// Pulls the JSON object out of a model reply, tolerating reasoning tags
/// and markdown fences around it.
fn extract_json(response: &str) -> Option<String> {
    let text = strip_thinking_tags(response.trim());

    if text.starts_with('{') && serde_json::from_str::<Value>(&text).is_ok() {
        return Some(text);
    }

    if let Some(json) = extract_from_markdown_code_block(&text) {
        tracing::debug!("Extracted JSON from markdown code block");
        return Some(json);
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(text[start..=end].to_string())
}

fn strip_thinking_tags(text: &str) -> String {
    let mut result = text.to_string();
    for tag in ["thinking", "think"] {
        let open = format!("<{tag}>");
        let close = format!("</{tag}>");
        while let Some(start) = result.find(&open) {
            let end = match result[start..].find(&close) {
                Some(offset) => start + offset + close.len(),
                None => start + open.len(),
            };
            result.replace_range(start..end, "");
        }
        // stray closer left by a truncated or reordered block
        result = result.replace(&close, "");
    }
    result.trim().to_string()
}

fn extract_from_markdown_code_block(text: &str) -> Option<String> {
    let body_start = if let Some(start) = text.find("```json") {
        start + 7
    } else {
        text.find("```")? + 3
    };
    let end = text[body_start..].find("```")?;
    let body = text[body_start..body_start + end].trim();
    body.starts_with('{').then(|| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_invalid(raw: &str) -> String {
        match decode_pet_state(raw) {
            Err(PetError::InvalidOracleResponse(message)) => message,
            other => panic!("expected InvalidOracleResponse, got {:?}", other),
        }
    }

    #[test]
    fn decodes_well_formed_reply() {
        let state = decode_pet_state(
            r#"{"hungry_level":3,"Mood":"happy","reply":"hi!","isConvoEnd":false}"#,
        )
        .unwrap();
        assert_eq!(
            state,
            PetState {
                hunger_level: 3,
                mood: Mood::Happy,
                reply: "hi!".to_string(),
                conversation_ended: false,
            }
        );
    }

    #[test]
    fn accepts_original_reply_key_and_capitalized_mood() {
        let state = decode_pet_state(
            r#"{"hungry_level":5,"Mood":"Lonely","mumblejumble":"Bobo misses you.","isConvoEnd":true}"#,
        )
        .unwrap();
        assert_eq!(state.mood, Mood::Lonely);
        assert_eq!(state.reply, "Bobo misses you.");
        assert!(state.conversation_ended);
    }

    #[test]
    fn tolerates_thinking_tags_and_code_fences() {
        let raw = "<think>owner seems nice</think>\n```json\n{\"hungry_level\":2,\"Mood\":\"idle\",\"reply\":\"ok\",\"isConvoEnd\":false}\n```";
        assert_eq!(decode_pet_state(raw).unwrap().mood, Mood::Idle);

        let chatty = "Sure! {\"hungry_level\":1,\"Mood\":\"sad\",\"reply\":\"sniff\",\"isConvoEnd\":false} hope that helps";
        assert_eq!(decode_pet_state(chatty).unwrap().mood, Mood::Sad);
    }

    #[test]
    fn strips_closed_and_dangling_thinking_tags() {
        assert_eq!(
            strip_thinking_tags("<thinking>hmm</thinking> {\"a\":1} <think>more</think>"),
            "{\"a\":1}"
        );
        assert_eq!(strip_thinking_tags("<think>{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_thinking_tags("{\"a\":1}</think>"), "{\"a\":1}");
    }

    #[test]
    fn rejects_missing_keys() {
        assert!(expect_invalid(r#"{"Mood":"happy","reply":"hi","isConvoEnd":false}"#)
            .contains("hungry_level"));
        assert!(expect_invalid(r#"{"hungry_level":3,"reply":"hi","isConvoEnd":false}"#)
            .contains("Mood"));
        assert!(expect_invalid(r#"{"hungry_level":3,"Mood":"happy","isConvoEnd":false}"#)
            .contains("reply"));
        assert!(expect_invalid(r#"{"hungry_level":3,"Mood":"happy","reply":"hi"}"#)
            .contains("isConvoEnd"));
    }

    #[test]
    fn rejects_wrong_types() {
        expect_invalid(r#"{"hungry_level":"3","Mood":"happy","reply":"hi","isConvoEnd":false}"#);
        expect_invalid(r#"{"hungry_level":2.5,"Mood":"happy","reply":"hi","isConvoEnd":false}"#);
        expect_invalid(r#"{"hungry_level":3,"Mood":1,"reply":"hi","isConvoEnd":false}"#);
        expect_invalid(r#"{"hungry_level":3,"Mood":"happy","reply":["hi"],"isConvoEnd":false}"#);
        expect_invalid(r#"{"hungry_level":3,"Mood":"happy","reply":"hi","isConvoEnd":"no"}"#);
    }

    #[test]
    fn rejects_out_of_range_hunger_and_unknown_mood() {
        assert!(expect_invalid(
            r#"{"hungry_level":0,"Mood":"happy","reply":"hi","isConvoEnd":false}"#
        )
        .contains("between 1 and 5"));
        expect_invalid(r#"{"hungry_level":6,"Mood":"happy","reply":"hi","isConvoEnd":false}"#);
        assert!(expect_invalid(
            r#"{"hungry_level":3,"Mood":"confused","reply":"hi","isConvoEnd":false}"#
        )
        .contains("confused"));
    }

    #[test]
    fn rejects_blank_reply_and_non_json() {
        expect_invalid(r#"{"hungry_level":3,"Mood":"happy","reply":"  ","isConvoEnd":false}"#);
        expect_invalid("Bobo is sleepy.");
        expect_invalid("[1, 2, 3]");
        expect_invalid("{\"hungry_level\": 3,");
    }

    #[test]
    fn pet_state_serializes_with_oracle_keys() {
        let value = serde_json::to_value(PetState {
            hunger_level: 4,
            mood: Mood::Sad,
            reply: "sniff".to_string(),
            conversation_ended: false,
        })
        .unwrap();
        assert_eq!(value["hungry_level"], 4);
        assert_eq!(value["Mood"], "sad");
        assert_eq!(value["reply"], "sniff");
        assert_eq!(value["isConvoEnd"], false);
    }
}
