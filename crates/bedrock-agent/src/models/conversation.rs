use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use super::message::Message;
use crate::errors::TranscriptError;

/// An ordered, append-only transcript of messages exchanged with the model.
///
/// The whole transcript is sent back to the endpoint on every round, so ordering
/// is significant and messages are never edited once pushed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Drop everything appended after `len`. Only the agent uses this, to discard
    /// the partial state of a failed reply.
    pub(crate) fn truncate_to(&mut self, len: usize) {
        self.messages.truncate(len);
    }

    /// Write the transcript as pretty json
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), TranscriptError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, TranscriptError> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

impl From<Vec<Message>> for Conversation {
    fn from(messages: Vec<Message>) -> Self {
        Self { messages }
    }
}
