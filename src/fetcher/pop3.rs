//! Sequential-retrieve-delete fetcher (POP3 family).
//!
//! POP3 has no search: the fetcher reads the message count once after login
//! and walks indices `0..count`. Each message is retrieved and then marked
//! for deletion; a deletion is only attempted after its retrieval succeeded.
//! The server applies the deletions when the session is closed, so indices
//! stay valid for the whole fetch.
//!
//! Reads are destructive. The session is closed with commit on every exit
//! path, which means a fetch that fails part-way has already removed every
//! message whose retrieve+delete pair completed, even though the caller gets
//! the error and not those messages. If a deletion itself fails, the message
//! may or may not have been removed: do not retry blindly.
//!
//! A fetch whose future is dropped never closes its session, and a POP3
//! server discards pending deletions when the connection goes away without
//! QUIT.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{FetcherConfiguration, MailServerConnection, Protocol, RetrievalPlan};
use crate::error::{FetchError, Result};
use crate::fetcher::ProtocolFetcher;
use crate::fetcher::retrieve::{connect, finish, guarded, retrieve_all};
use crate::message::MailMessage;
use crate::request::FetchRequest;
use crate::session::{IndexedSession, Session, SessionFactory};

pub struct Pop3Fetcher<F> {
    factory: F,
}

impl<F> Pop3Fetcher<F>
where
    F: SessionFactory,
    F::Session: IndexedSession,
{
    pub fn new(factory: F) -> Self {
        Self { factory }
    }

    async fn run(
        &self,
        configuration: Option<&FetcherConfiguration>,
        connection: &MailServerConnection,
        cancel: &CancellationToken,
    ) -> Result<Vec<MailMessage>> {
        connection.validate()?;

        let mut session = self.factory.create();
        let host = connection.host.as_str();

        connect(&mut session, connection, cancel).await?;

        let outcome = Self::consume(&mut session, configuration, connection, cancel).await;

        finish(&mut session, true, host, outcome).await
    }

    async fn consume(
        session: &mut F::Session,
        configuration: Option<&FetcherConfiguration>,
        connection: &MailServerConnection,
        cancel: &CancellationToken,
    ) -> Result<Vec<MailMessage>> {
        let host = connection.host.as_str();

        guarded(cancel, async {
            session
                .authenticate(&connection.username, connection.password())
                .await
                .map_err(|e| FetchError::connection(host, e))
        })
        .await?;

        let count = guarded(cancel, async {
            session
                .stat()
                .await
                .map_err(|e| FetchError::protocol("stat", e))
        })
        .await?;

        let plan = configuration.map_or(RetrievalPlan::Sequential, |c| c.plan(count));
        debug!(host = %host, count, ?plan, "Mailbox stat");

        let session: &F::Session = session;
        retrieve_all(0..count, plan, cancel, |index| async move {
            let message = session
                .retrieve(index)
                .await
                .map_err(|e| FetchError::protocol("retrieve", e))?;
            session
                .mark_deleted(index)
                .await
                .map_err(|e| FetchError::protocol("delete", e))?;
            Ok(message)
        })
        .await
    }
}

#[async_trait]
impl<F> ProtocolFetcher for Pop3Fetcher<F>
where
    F: SessionFactory,
    F::Session: IndexedSession,
{
    fn protocol(&self) -> Protocol {
        Protocol::Pop3
    }

    async fn fetch(
        &self,
        connection: &MailServerConnection,
        _request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<MailMessage>> {
        self.run(None, connection, cancel).await
    }

    async fn fetch_bounded(
        &self,
        configuration: &FetcherConfiguration,
        connection: &MailServerConnection,
        _request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<MailMessage>> {
        configuration.validate()?;
        self.run(Some(configuration), connection, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::FetchErrorKind;
    use crate::fetcher::ensure_request_supported;
    use crate::request::SearchQuery;
    use crate::session::memory::MemoryMailbox;

    fn connection() -> MailServerConnection {
        MailServerConnection::new("pop.example.com", 995, "bob", "secret")
    }

    #[tokio::test]
    async fn retrieves_and_deletes_every_message() {
        let mailbox = MemoryMailbox::with_messages(3);
        let fetcher = Pop3Fetcher::new(mailbox.pop3_factory());

        let messages = fetcher
            .fetch(&connection(), &FetchRequest::all(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(messages.len(), 3);
        assert!(mailbox.is_empty());
        let stats = mailbox.stats();
        assert_eq!(stats.retrieve_calls, 3);
        assert_eq!(stats.delete_calls, 3);
    }

    #[tokio::test]
    async fn empty_mailbox_makes_no_calls() {
        let mailbox = MemoryMailbox::new();
        let fetcher = Pop3Fetcher::new(mailbox.pop3_factory());

        let messages = fetcher
            .fetch_bounded(
                &FetcherConfiguration::force_parallel(3),
                &connection(),
                &FetchRequest::all(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(messages.is_empty());
        let stats = mailbox.stats();
        assert_eq!(stats.retrieve_calls, 0);
        assert_eq!(stats.delete_calls, 0);
        assert_eq!(stats.disconnects, 1);
    }

    #[tokio::test]
    async fn failed_retrieval_skips_its_deletion() {
        let mailbox = MemoryMailbox::with_messages(5).failing_retrieve_at(3);
        let fetcher = Pop3Fetcher::new(mailbox.pop3_factory());

        let err = fetcher
            .fetch(&connection(), &FetchRequest::all(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), FetchErrorKind::Protocol);
        // Messages 0..3 were consumed before the failure; 3 and 4 remain.
        assert_eq!(mailbox.len(), 2);
        assert_eq!(mailbox.stats().delete_calls, 3);
    }

    #[tokio::test]
    async fn failed_deletion_fails_the_fetch() {
        let mailbox = MemoryMailbox::with_messages(4).failing_delete_at(1);
        let fetcher = Pop3Fetcher::new(mailbox.pop3_factory());

        let err = fetcher
            .fetch(&connection(), &FetchRequest::all(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), FetchErrorKind::Protocol);
        assert!(err.to_string().contains("delete"));
    }

    #[tokio::test]
    async fn parallel_retrieval_is_capped() {
        let mailbox = MemoryMailbox::with_messages(40).with_latency(Duration::from_millis(2));
        let fetcher = Pop3Fetcher::new(mailbox.pop3_factory());

        let messages = fetcher
            .fetch_bounded(
                &FetcherConfiguration::conditional_parallel(10, 4),
                &connection(),
                &FetchRequest::all(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(messages.len(), 40);
        assert!(mailbox.stats().max_in_flight <= 4);
        assert!(mailbox.is_empty());
    }

    #[test]
    fn selection_criterion_is_rejected() {
        let fetcher = Pop3Fetcher::new(MemoryMailbox::new().pop3_factory());
        assert!(fetcher.configurable().is_none());
        assert!(ensure_request_supported(&fetcher, &FetchRequest::all()).is_ok());
        assert!(
            ensure_request_supported(&fetcher, &FetchRequest::new(SearchQuery::Unseen)).is_err()
        );
    }

    #[tokio::test]
    async fn cancellation_commits_only_completed_pairs() {
        let mailbox = MemoryMailbox::with_messages(50).with_latency(Duration::from_millis(2));
        let fetcher = Pop3Fetcher::new(mailbox.pop3_factory());

        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            let mailbox = mailbox.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                let before = mailbox.stats();
                cancel.cancel();
                before
            })
        };

        let err = fetcher
            .fetch_bounded(
                &FetcherConfiguration::force_parallel(3),
                &connection(),
                &FetchRequest::all(),
                &cancel,
            )
            .await
            .unwrap_err();
        let before = canceller.await.unwrap();

        assert!(matches!(err, FetchError::Cancelled));
        let stats = mailbox.stats();
        assert_eq!(stats.retrieve_calls, before.retrieve_calls);
        assert_eq!(stats.delete_calls, before.delete_calls);
        assert_eq!(stats.deletes_marked, before.deletes_marked);
        assert_eq!(stats.disconnects, 1);
        assert_eq!(stats.in_flight, 0);

        // The close commits every finished retrieve+delete pair and nothing else.
        assert!(stats.deletes_marked > 0 && stats.deletes_marked < 50);
        assert_eq!(mailbox.len(), 50 - stats.deletes_marked);
    }
}
