//! In-memory mailboxes speaking both session families.
//!
//! A [`MemoryMailbox`] is a cheaply clonable handle to shared mailbox state.
//! Sessions created from it see the same messages, so a POP3 session that
//! commits its deletions changes what the next session finds. Latency and
//! failures can be injected, and every retrieval is counted so callers can
//! observe how many were in flight at once.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use mail_parser::MessageParser;

use crate::config::Security;
use crate::error::SessionError;
use crate::message::MailMessage;
use crate::request::SearchQuery;
use crate::session::{IndexedSession, MailboxAccess, MessageUid, SearchSession, Session};

#[derive(Debug, Clone)]
struct StoredMessage {
    uid: MessageUid,
    raw: Vec<u8>,
    seen: bool,
}

#[derive(Debug, Default)]
struct MailboxState {
    messages: Vec<StoredMessage>,
    next_uid: u32,
    username: Option<String>,
    password: Option<String>,
    refuse_connections: bool,
    fail_retrieve: Option<usize>,
    fail_delete: Option<usize>,
}

#[derive(Debug, Default)]
struct Counters {
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    retrieve_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    deletes_marked: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Point-in-time copy of a mailbox's instrumentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxStats {
    pub connects: usize,
    pub disconnects: usize,
    pub retrieve_calls: usize,
    pub delete_calls: usize,
    /// Deletions that completed and will apply on a committing close.
    pub deletes_marked: usize,
    pub in_flight: usize,
    /// Highest number of retrievals observed in flight at once.
    pub max_in_flight: usize,
}

/// Shared handle to an in-memory mailbox.
#[derive(Debug, Clone, Default)]
pub struct MemoryMailbox {
    state: Arc<Mutex<MailboxState>>,
    counters: Arc<Counters>,
    latency: Duration,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mailbox pre-filled with `count` generated messages.
    pub fn with_messages(count: usize) -> Self {
        let mailbox = Self::new();
        for i in 0..count {
            mailbox.deliver(format!(
                "From: sender{i}@example.com\r\n\
                 To: inbox@example.com\r\n\
                 Subject: Message {i}\r\n\
                 Message-ID: <msg-{i}@example.com>\r\n\
                 \r\n\
                 Body of message {i}.\r\n"
            ));
        }
        mailbox
    }

    /// Delay applied to connect, authenticate and every retrieve/delete.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Only accept this username/password pair.
    pub fn with_credentials(self, username: &str, password: &str) -> Self {
        {
            let mut state = self.lock();
            state.username = Some(username.to_string());
            state.password = Some(password.to_string());
        }
        self
    }

    /// Refuse every connection attempt.
    pub fn refusing_connections(self) -> Self {
        self.lock().refuse_connections = true;
        self
    }

    /// Fail the retrieval of the message at `position` (mailbox order).
    pub fn failing_retrieve_at(self, position: usize) -> Self {
        self.lock().fail_retrieve = Some(position);
        self
    }

    /// Fail the deletion of the message at `index`.
    pub fn failing_delete_at(self, index: usize) -> Self {
        self.lock().fail_delete = Some(index);
        self
    }

    /// Append a message, returning its UID.
    pub fn deliver(&self, raw: impl Into<Vec<u8>>) -> MessageUid {
        let mut state = self.lock();
        state.next_uid += 1;
        let uid = MessageUid(state.next_uid);
        state.messages.push(StoredMessage {
            uid,
            raw: raw.into(),
            seen: false,
        });
        uid
    }

    pub fn mark_seen(&self, uid: MessageUid) {
        if let Some(msg) = self.lock().messages.iter_mut().find(|m| m.uid == uid) {
            msg.seen = true;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> MailboxStats {
        let c = &self.counters;
        MailboxStats {
            connects: c.connects.load(Ordering::SeqCst),
            disconnects: c.disconnects.load(Ordering::SeqCst),
            retrieve_calls: c.retrieve_calls.load(Ordering::SeqCst),
            delete_calls: c.delete_calls.load(Ordering::SeqCst),
            deletes_marked: c.deletes_marked.load(Ordering::SeqCst),
            in_flight: c.in_flight.load(Ordering::SeqCst),
            max_in_flight: c.max_in_flight.load(Ordering::SeqCst),
        }
    }

    /// Session factory for the session-search family.
    pub fn imap_factory(&self) -> impl Fn() -> MemoryImapSession + Send + Sync + 'static {
        let mailbox = self.clone();
        move || MemoryImapSession::new(mailbox.clone())
    }

    /// Session factory for the retrieve-delete family.
    pub fn pop3_factory(&self) -> impl Fn() -> MemoryPop3Session + Send + Sync + 'static {
        let mailbox = self.clone();
        move || MemoryPop3Session::new(mailbox.clone())
    }

    fn lock(&self) -> MutexGuard<'_, MailboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        } else {
            tokio::task::yield_now().await;
        }
    }

    async fn open_connection(&self, host: &str) -> Result<(), SessionError> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.lock().refuse_connections {
            return Err(SessionError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{host} refused the connection"),
            )));
        }
        Ok(())
    }

    async fn check_login(&self, username: &str, password: &str) -> Result<(), SessionError> {
        self.pause().await;
        let state = self.lock();
        let user_ok = state.username.as_deref().is_none_or(|u| u == username);
        let pass_ok = state.password.as_deref().is_none_or(|p| p == password);
        if user_ok && pass_ok {
            Ok(())
        } else {
            Err(SessionError::Auth(format!("invalid credentials for {username}")))
        }
    }

    fn enter_retrieval(&self) -> InFlight<'_> {
        let c = &self.counters;
        c.retrieve_calls.fetch_add(1, Ordering::SeqCst);
        let now = c.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        c.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(&c.in_flight)
    }

    fn close(&self) {
        self.counters.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// Decrements the in-flight gauge when a retrieval ends or is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn query_matches(query: &SearchQuery, msg: &StoredMessage) -> bool {
    let parsed = MessageParser::default().parse(msg.raw.as_slice());
    let header_contains = |value: Option<&str>, needle: &str| {
        value.is_some_and(|v| v.to_lowercase().contains(&needle.to_lowercase()))
    };
    let date = || {
        parsed.as_ref().and_then(|m| m.date()).and_then(|d| {
            NaiveDate::from_ymd_opt(i32::from(d.year), u32::from(d.month), u32::from(d.day))
        })
    };

    match query {
        SearchQuery::All => true,
        SearchQuery::Seen => msg.seen,
        SearchQuery::Unseen => !msg.seen,
        SearchQuery::From(addr) => {
            let from = parsed
                .as_ref()
                .and_then(|m| m.from())
                .and_then(|a| a.first())
                .and_then(|a| a.address());
            header_contains(from, addr)
        }
        SearchQuery::Subject(text) => {
            header_contains(parsed.as_ref().and_then(|m| m.subject()), text)
        }
        SearchQuery::Since(since) => date().is_some_and(|d| d >= *since),
        SearchQuery::Before(before) => date().is_some_and(|d| d < *before),
        SearchQuery::And(terms) => terms.iter().all(|t| query_matches(t, msg)),
        SearchQuery::Or(a, b) => query_matches(a, msg) || query_matches(b, msg),
        SearchQuery::Not(q) => !query_matches(q, msg),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Disconnected,
    /// Connect started but not finished; the socket may be half open.
    Connecting,
    Connected,
    Authenticated,
}

/// Session-search session over a [`MemoryMailbox`].
#[derive(Debug)]
pub struct MemoryImapSession {
    mailbox: MemoryMailbox,
    phase: Phase,
    inbox_open: bool,
}

impl MemoryImapSession {
    pub fn new(mailbox: MemoryMailbox) -> Self {
        Self {
            mailbox,
            phase: Phase::Disconnected,
            inbox_open: false,
        }
    }

    fn require(&self, phase: Phase) -> Result<(), SessionError> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(SessionError::Closed)
        }
    }
}

#[async_trait]
impl Session for MemoryImapSession {
    async fn connect(
        &mut self,
        host: &str,
        _port: u16,
        _security: Security,
    ) -> Result<(), SessionError> {
        self.require(Phase::Disconnected)?;
        self.phase = Phase::Connecting;
        if let Err(e) = self.mailbox.open_connection(host).await {
            self.phase = Phase::Disconnected;
            return Err(e);
        }
        self.phase = Phase::Connected;
        Ok(())
    }

    async fn authenticate(&mut self, username: &str, password: &str) -> Result<(), SessionError> {
        self.require(Phase::Connected)?;
        self.mailbox.check_login(username, password).await?;
        self.phase = Phase::Authenticated;
        Ok(())
    }

    async fn disconnect(&mut self, _commit: bool) -> Result<(), SessionError> {
        if self.phase == Phase::Disconnected {
            return Err(SessionError::Closed);
        }
        self.phase = Phase::Disconnected;
        self.inbox_open = false;
        self.mailbox.close();
        Ok(())
    }
}

#[async_trait]
impl SearchSession for MemoryImapSession {
    async fn open_inbox(&mut self, _access: MailboxAccess) -> Result<(), SessionError> {
        self.require(Phase::Authenticated)?;
        self.inbox_open = true;
        Ok(())
    }

    async fn search(&mut self, query: &SearchQuery) -> Result<Vec<MessageUid>, SessionError> {
        if !self.inbox_open {
            return Err(SessionError::Protocol("no mailbox selected".to_string()));
        }
        let state = self.mailbox.lock();
        Ok(state
            .messages
            .iter()
            .filter(|m| query_matches(query, m))
            .map(|m| m.uid)
            .collect())
    }

    async fn fetch_message(&self, uid: MessageUid) -> Result<MailMessage, SessionError> {
        if !self.inbox_open {
            return Err(SessionError::Protocol("no mailbox selected".to_string()));
        }
        let _guard = self.mailbox.enter_retrieval();
        self.mailbox.pause().await;

        let state = self.mailbox.lock();
        let position = state
            .messages
            .iter()
            .position(|m| m.uid == uid)
            .ok_or_else(|| SessionError::NotFound(uid.to_string()))?;
        if state.fail_retrieve == Some(position) {
            return Err(SessionError::Protocol(format!("FETCH {uid} failed")));
        }
        Ok(MailMessage::from_bytes(state.messages[position].raw.clone()))
    }
}

/// Retrieve-delete session over a [`MemoryMailbox`].
///
/// The message list is snapshotted at `stat`; deletions are only applied to
/// the mailbox when the session is closed with `commit`.
#[derive(Debug)]
pub struct MemoryPop3Session {
    mailbox: MemoryMailbox,
    phase: Phase,
    snapshot: Vec<StoredMessage>,
    marked: Mutex<HashSet<usize>>,
}

impl MemoryPop3Session {
    pub fn new(mailbox: MemoryMailbox) -> Self {
        Self {
            mailbox,
            phase: Phase::Disconnected,
            snapshot: Vec::new(),
            marked: Mutex::new(HashSet::new()),
        }
    }

    fn snapshot_entry(&self, index: usize) -> Result<&StoredMessage, SessionError> {
        if self.phase != Phase::Authenticated {
            return Err(SessionError::Closed);
        }
        self.snapshot
            .get(index)
            .ok_or_else(|| SessionError::NotFound(format!("index {index}")))
    }
}

#[async_trait]
impl Session for MemoryPop3Session {
    async fn connect(
        &mut self,
        host: &str,
        _port: u16,
        _security: Security,
    ) -> Result<(), SessionError> {
        if self.phase != Phase::Disconnected {
            return Err(SessionError::Protocol("already connected".to_string()));
        }
        self.phase = Phase::Connecting;
        if let Err(e) = self.mailbox.open_connection(host).await {
            self.phase = Phase::Disconnected;
            return Err(e);
        }
        self.phase = Phase::Connected;
        Ok(())
    }

    async fn authenticate(&mut self, username: &str, password: &str) -> Result<(), SessionError> {
        if self.phase != Phase::Connected {
            return Err(SessionError::Closed);
        }
        self.mailbox.check_login(username, password).await?;
        self.snapshot = self.mailbox.lock().messages.clone();
        self.phase = Phase::Authenticated;
        Ok(())
    }

    async fn disconnect(&mut self, commit: bool) -> Result<(), SessionError> {
        if self.phase == Phase::Disconnected {
            return Err(SessionError::Closed);
        }
        let marked = std::mem::take(
            &mut *self.marked.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if commit && self.phase == Phase::Authenticated {
            let doomed: HashSet<MessageUid> =
                marked.iter().filter_map(|&i| self.snapshot.get(i)).map(|m| m.uid).collect();
            self.mailbox.lock().messages.retain(|m| !doomed.contains(&m.uid));
        }
        self.phase = Phase::Disconnected;
        self.snapshot.clear();
        self.mailbox.close();
        Ok(())
    }
}

#[async_trait]
impl IndexedSession for MemoryPop3Session {
    async fn stat(&mut self) -> Result<usize, SessionError> {
        if self.phase != Phase::Authenticated {
            return Err(SessionError::Closed);
        }
        Ok(self.snapshot.len())
    }

    async fn retrieve(&self, index: usize) -> Result<MailMessage, SessionError> {
        let entry = self.snapshot_entry(index)?;
        let _guard = self.mailbox.enter_retrieval();
        self.mailbox.pause().await;

        if self.mailbox.lock().fail_retrieve == Some(index) {
            return Err(SessionError::Protocol(format!("RETR {} failed", index + 1)));
        }
        Ok(MailMessage::from_bytes(entry.raw.clone()))
    }

    async fn mark_deleted(&self, index: usize) -> Result<(), SessionError> {
        self.snapshot_entry(index)?;
        self.mailbox.counters.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.mailbox.pause().await;

        if self.mailbox.lock().fail_delete == Some(index) {
            return Err(SessionError::Protocol(format!("DELE {} failed", index + 1)));
        }
        let newly_marked = self
            .marked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(index);
        if newly_marked {
            self.mailbox.counters.deletes_marked.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
