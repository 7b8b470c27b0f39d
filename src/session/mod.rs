//! Mail session abstraction.
//!
//! The wire protocols live behind these traits. A session is stateful and its
//! control calls (`connect`, `authenticate`, `open_inbox`, `search`, `stat`,
//! `disconnect`) take `&mut self`. Retrieval calls take `&self` so that a
//! fetcher can keep several of them in flight against one session; each one
//! is interrupted by dropping its future.
//!
//! - `SearchSession`: IMAP-like: server-side search, retrieval by UID
//! - `IndexedSession`: POP3-like: positional retrieval, deletion on close
//! - `memory`: in-memory mailboxes implementing both, for tests and dry runs

pub mod memory;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Security;
use crate::error::SessionError;
use crate::message::MailMessage;
use crate::request::SearchQuery;

/// Unique identifier of a message in a searchable mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageUid(pub u32);

impl fmt::Display for MessageUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Access mode when opening a mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxAccess {
    ReadOnly,
    ReadWrite,
}

/// Connection lifecycle shared by every protocol family.
#[async_trait]
pub trait Session: Send + Sync {
    async fn connect(&mut self, host: &str, port: u16, security: Security)
    -> Result<(), SessionError>;

    async fn authenticate(&mut self, username: &str, password: &str) -> Result<(), SessionError>;

    /// Close the session. With `commit`, pending state is flushed (IMAP
    /// expunge, POP3 QUIT applying deletions); without it, it is discarded.
    async fn disconnect(&mut self, commit: bool) -> Result<(), SessionError>;
}

/// Session-search protocol family.
#[async_trait]
pub trait SearchSession: Session {
    async fn open_inbox(&mut self, access: MailboxAccess) -> Result<(), SessionError>;

    async fn search(&mut self, query: &SearchQuery) -> Result<Vec<MessageUid>, SessionError>;

    async fn fetch_message(&self, uid: MessageUid) -> Result<MailMessage, SessionError>;
}

/// Sequential-retrieve-delete protocol family.
///
/// Indices are zero-based and stay valid until the session is closed.
#[async_trait]
pub trait IndexedSession: Session {
    /// Number of messages in the mailbox when the session was opened.
    async fn stat(&mut self) -> Result<usize, SessionError>;

    async fn retrieve(&self, index: usize) -> Result<MailMessage, SessionError>;

    async fn mark_deleted(&self, index: usize) -> Result<(), SessionError>;
}

/// Produces a fresh, unconnected session for each fetch.
///
/// Implemented for any `Fn() -> S` closure.
pub trait SessionFactory: Send + Sync {
    type Session;

    fn create(&self) -> Self::Session;
}

impl<S, F> SessionFactory for F
where
    F: Fn() -> S + Send + Sync,
{
    type Session = S;

    fn create(&self) -> S {
        self()
    }
}
