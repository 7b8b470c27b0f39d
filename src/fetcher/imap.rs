//! Session-search fetcher (IMAP family).
//!
//! Opens the inbox read-only, evaluates the request's search criterion and
//! retrieves every matching message by UID. Nothing is deleted or flagged.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{FetcherConfiguration, MailServerConnection, Protocol, RetrievalPlan};
use crate::error::{FetchError, Result, UsageError};
use crate::fetcher::retrieve::{connect, finish, guarded, retrieve_all};
use crate::fetcher::{ConfigurableFetcher, ProtocolFetcher};
use crate::message::MailMessage;
use crate::request::FetchRequest;
use crate::session::{MailboxAccess, SearchSession, Session, SessionFactory};

pub struct ImapFetcher<F> {
    factory: F,
}

impl<F> ImapFetcher<F>
where
    F: SessionFactory,
    F::Session: SearchSession,
{
    pub fn new(factory: F) -> Self {
        Self { factory }
    }

    async fn run(
        &self,
        configuration: Option<&FetcherConfiguration>,
        connection: &MailServerConnection,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<MailMessage>> {
        connection.validate()?;

        let mut session = self.factory.create();
        let host = connection.host.as_str();

        connect(&mut session, connection, cancel).await?;

        let outcome = Self::select_and_retrieve(
            &mut session,
            configuration,
            connection,
            request,
            cancel,
        )
        .await;

        finish(&mut session, true, host, outcome).await
    }

    async fn select_and_retrieve(
        session: &mut F::Session,
        configuration: Option<&FetcherConfiguration>,
        connection: &MailServerConnection,
        request: &FetchRequest,
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

        guarded(cancel, async {
            session
                .open_inbox(MailboxAccess::ReadOnly)
                .await
                .map_err(|e| FetchError::protocol("open inbox", e))
        })
        .await?;

        let uids = guarded(cancel, async {
            session
                .search(&request.query)
                .await
                .map_err(|e| FetchError::protocol("search", e))
        })
        .await?;

        let plan = configuration.map_or(RetrievalPlan::Sequential, |c| c.plan(uids.len()));
        debug!(host = %host, query = %request.query, count = uids.len(), ?plan, "Inbox searched");

        let session: &F::Session = session;
        retrieve_all(uids, plan, cancel, |uid| async move {
            session
                .fetch_message(uid)
                .await
                .map_err(|e| FetchError::protocol("retrieve", e))
        })
        .await
    }
}

#[async_trait]
impl<F> ProtocolFetcher for ImapFetcher<F>
where
    F: SessionFactory,
    F::Session: SearchSession,
{
    fn protocol(&self) -> Protocol {
        Protocol::Imap
    }

    fn configurable(&self) -> Option<&dyn ConfigurableFetcher> {
        Some(self)
    }

    async fn fetch(
        &self,
        connection: &MailServerConnection,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<MailMessage>> {
        self.run(None, connection, request, cancel).await
    }

    async fn fetch_bounded(
        &self,
        configuration: &FetcherConfiguration,
        connection: &MailServerConnection,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<MailMessage>> {
        configuration.validate()?;
        self.run(Some(configuration), connection, request, cancel).await
    }
}

impl<F> ConfigurableFetcher for ImapFetcher<F>
where
    F: SessionFactory,
    F::Session: SearchSession,
{
    /// Every criterion renders to a SEARCH key.
    fn check_request(&self, _request: &FetchRequest) -> std::result::Result<(), UsageError> {
        Ok(())
    }
}
