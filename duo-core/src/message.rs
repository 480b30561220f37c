//! Chat message value and the bounded in-memory history.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Longest payload either radio can carry (the long-range radio rejects anything above 239 bytes).
pub const MAX_MESSAGE_LEN: usize = 239;

/// Text plus the trailing NUL terminator.
pub const MESSAGE_BUFFER_SIZE: usize = MAX_MESSAGE_LEN + 1;

/// Number of messages kept in history.
pub const MAX_HISTORY_MESSAGES: usize = 10;

/// Who wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sender {
    Me,
    Them,
}

/// A single chat message. Text is never longer than [`MAX_MESSAGE_LEN`] bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    sender: Sender,
    text: String,
}

impl Message {
    /// Overlong text is truncated, never rejected.
    pub fn new(sender: Sender, text: &str) -> Self {
        let mut msg = Self {
            sender,
            text: String::new(),
        };
        msg.set_text(text);
        msg
    }

    /// Build a message from raw received bytes. Stops at the first NUL, then truncates.
    pub fn from_payload(sender: Sender, payload: &[u8]) -> Self {
        let end = payload
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(payload.len());
        let text = String::from_utf8_lossy(&payload[..end]);
        Self::new(sender, &text)
    }

    pub fn sender(&self) -> Sender {
        self.sender
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Replace the text, truncating on a character boundary at [`MAX_MESSAGE_LEN`] bytes.
    pub fn set_text(&mut self, text: &str) {
        let text = text.split('\0').next().unwrap_or_default();
        self.text.clear();
        self.text.push_str(truncate_to_boundary(text, MAX_MESSAGE_LEN));
    }

    /// Bytes to hand to `tx_wait` (no terminator).
    pub fn to_payload(&self) -> Vec<u8> {
        self.text.as_bytes().to_vec()
    }

    /// Text bytes followed by exactly one NUL.
    pub fn to_c_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.text.len() + 1);
        out.extend_from_slice(self.text.as_bytes());
        out.push(0);
        out
    }
}

fn truncate_to_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// The most recent messages, oldest first. Pushing past capacity drops the oldest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageHistory {
    messages: VecDeque<Message>,
}

impl MessageHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_message(&mut self, sender: Sender, text: &str) {
        if self.messages.len() == MAX_HISTORY_MESSAGES {
            self.messages.pop_front();
        }
        self.messages.push_back(Message::new(sender, text));
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Out-of-range indices return the newest message; `None` only when empty.
    pub fn get(&self, index: usize) -> Option<&Message> {
        self.messages
            .get(index)
            .or_else(|| self.messages.back())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}
