//! Boundary parsing of interaction payloads and the immediate response shapes.

use std::fmt;

use axum::{
    Json,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

const INTERACTION_TYPE_PING: i64 = 1;
const INTERACTION_TYPE_COMMAND: i64 = 2;

const RESPONSE_TYPE_PONG: u8 = 1;
const RESPONSE_TYPE_MESSAGE: u8 = 4;
const RESPONSE_TYPE_DEFERRED: u8 = 5;

/// Message flag restricting visibility to the invoking user.
pub const EPHEMERAL_FLAG: u64 = 1 << 6;

#[derive(Debug, Deserialize)]
struct RawInteraction {
    #[serde(rename = "type")]
    kind: Option<i64>,
    #[serde(default)]
    data: Option<RawCommandData>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    application_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCommandData {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    options: Vec<RawCommandOption>,
}

#[derive(Debug, Deserialize)]
struct RawCommandOption {
    name: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("request body is not valid JSON: {0}")]
    InvalidJson(String),
}

/// Where the deferred follow-up for a command goes.
#[derive(Clone, PartialEq, Eq)]
pub struct FollowupTarget {
    pub application_id: String,
    pub token: String,
}

impl fmt::Debug for FollowupTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FollowupTarget")
            .field("application_id", &self.application_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    pub name: String,
    /// First option of the command, if any.
    pub subcommand: Option<String>,
    /// Absent when the payload carries no token or application id.
    pub followup: Option<FollowupTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interaction {
    Ping,
    Command(CommandInvocation),
    /// Any other or missing `type`.
    Other { kind: Option<i64> },
}

impl Interaction {
    #[must_use]
    pub fn is_ping(&self) -> bool {
        matches!(self, Self::Ping)
    }

    #[must_use]
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Command(_) => "command",
            Self::Other { .. } => "other",
        }
    }
}

/// Only bodies that are not JSON at all are errors. JSON of an unexpected
/// shape classifies as [`Interaction::Other`] so the caller still decides
/// between 401 and a reply.
pub fn classify(body: &[u8]) -> Result<Interaction, ClassifyError> {
    let value = serde_json::from_slice::<Value>(body)
        .map_err(|error| ClassifyError::InvalidJson(error.to_string()))?;
    let raw = match RawInteraction::deserialize(&value) {
        Ok(raw) => raw,
        Err(_) => {
            return Ok(Interaction::Other {
                kind: value.get("type").and_then(Value::as_i64),
            });
        }
    };

    match raw.kind {
        Some(INTERACTION_TYPE_PING) => Ok(Interaction::Ping),
        Some(INTERACTION_TYPE_COMMAND) => {
            let followup = match (non_empty(raw.application_id), non_empty(raw.token)) {
                (Some(application_id), Some(token)) => Some(FollowupTarget {
                    application_id,
                    token,
                }),
                _ => None,
            };
            let (name, subcommand) = match raw.data {
                Some(data) => (
                    data.name.unwrap_or_default(),
                    data.options.into_iter().next().map(|option| option.name),
                ),
                None => (String::new(), None),
            };
            Ok(Interaction::Command(CommandInvocation {
                name,
                subcommand,
                followup,
            }))
        }
        kind => Ok(Interaction::Other { kind }),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractionResponse {
    Pong,
    Message { content: String, ephemeral: bool },
    Deferred,
}

impl InteractionResponse {
    pub fn message(content: impl Into<String>) -> Self {
        Self::Message {
            content: content.into(),
            ephemeral: false,
        }
    }

    pub fn ephemeral(content: impl Into<String>) -> Self {
        Self::Message {
            content: content.into(),
            ephemeral: true,
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Pong => json!({ "type": RESPONSE_TYPE_PONG }),
            Self::Deferred => json!({ "type": RESPONSE_TYPE_DEFERRED }),
            Self::Message { content, ephemeral } => {
                let mut data = json!({ "content": content });
                if *ephemeral {
                    data["flags"] = json!(EPHEMERAL_FLAG);
                }
                json!({ "type": RESPONSE_TYPE_MESSAGE, "data": data })
            }
        }
    }
}

impl IntoResponse for InteractionResponse {
    fn into_response(self) -> Response {
        Json(self.to_json()).into_response()
    }
}
