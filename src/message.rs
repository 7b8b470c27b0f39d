//! Fetched message payload.

use mail_parser::{Message, MessageParser};

/// One message as delivered by the server.
///
/// The orchestration layer only moves these around. Decoding is left to the
/// caller through [`MailMessage::parsed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    raw: Vec<u8>,
}

impl MailMessage {
    pub fn from_bytes(raw: impl Into<Vec<u8>>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.raw
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Parse the RFC 5322 payload. Returns `None` if it is not a message.
    pub fn parsed(&self) -> Option<Message<'_>> {
        MessageParser::default().parse(self.raw.as_slice())
    }

    pub fn subject(&self) -> Option<String> {
        self.parsed()?.subject().map(str::to_string)
    }

    pub fn message_id(&self) -> Option<String> {
        self.parsed()?.message_id().map(str::to_string)
    }
}

impl From<Vec<u8>> for MailMessage {
    fn from(raw: Vec<u8>) -> Self {
        Self::from_bytes(raw)
    }
}
