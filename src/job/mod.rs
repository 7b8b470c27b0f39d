//! Mailbox fetch jobs.
//!
//! A job binds one fetcher, one connection, one policy and one request, and
//! runs them through a single `invoke` entry point:
//!
//! - `state`: job state machine (Configured → Fetching → Fetched/Failed)
//! - `hooks`: injected lifecycle callbacks

pub mod hooks;
pub mod state;

pub use hooks::{FetchHooks, HookContext, HookError, NoopHooks, TracingHooks};
pub use state::{JobId, JobState, JobStatus, StateTransition};

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{ExecutionMode, FetcherConfiguration, MailServerConnection};
use crate::error::{FetchError, Result, UsageError};
use crate::fetcher::{ProtocolFetcher, ensure_request_supported};
use crate::message::MailMessage;
use crate::request::FetchRequest;

/// One configured unit of work against one mailbox.
pub struct MailboxFetchJob {
    id: JobId,
    label: Option<String>,
    fetcher: Arc<dyn ProtocolFetcher>,
    connection: MailServerConnection,
    configuration: FetcherConfiguration,
    request: FetchRequest,
    hooks: Arc<dyn FetchHooks>,
    status: JobStatus,
}

impl MailboxFetchJob {
    pub fn builder(fetcher: Arc<dyn ProtocolFetcher>) -> MailboxFetchJobBuilder {
        MailboxFetchJobBuilder {
            fetcher,
            connection: None,
            configuration: None,
            request: None,
            hooks: None,
            label: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn state(&self) -> JobState {
        self.status.state
    }

    pub fn status(&self) -> &JobStatus {
        &self.status
    }

    pub fn connection(&self) -> &MailServerConnection {
        &self.connection
    }

    pub fn configuration(&self) -> &FetcherConfiguration {
        &self.configuration
    }

    pub fn request(&self) -> &FetchRequest {
        &self.request
    }

    /// Run the fetch.
    ///
    /// Hooks run around the fetch: `on_fetching` first, then `on_fetched` or
    /// `on_fetch_failed`. A fetch error is returned unchanged even if the
    /// failure hook also fails. Messages are only returned if both the fetch
    /// and `on_fetched` succeed.
    pub async fn invoke(&mut self, cancel: &CancellationToken) -> Result<Vec<MailMessage>> {
        self.transition(JobState::Fetching, None);
        info!(
            job_id = %self.id,
            protocol = %self.fetcher.protocol(),
            host = %self.connection.host,
            mode = %self.configuration.execution_mode,
            "Fetch job started"
        );

        let outcome = self.run(cancel).await;

        match &outcome {
            Ok(messages) => {
                self.status.fetched = messages.len();
                self.transition(JobState::Fetched, None);
                info!(job_id = %self.id, count = messages.len(), "Fetch job finished");
            }
            Err(e) => {
                self.transition(JobState::Failed, Some(e));
                debug!(job_id = %self.id, kind = %e.kind(), error = %e, "Fetch job failed");
            }
        }

        outcome
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<Vec<MailMessage>> {
        let ctx = HookContext {
            job_id: self.id,
            label: self.label.as_deref(),
            host: &self.connection.host,
            fetcher: self.fetcher.as_ref(),
            cancel,
        };

        self.hooks
            .on_fetching(&ctx)
            .await
            .map_err(|e| FetchError::hook("on_fetching", e.to_string()))?;

        let fetched = match self.configuration.execution_mode {
            ExecutionMode::None => {
                self.fetcher
                    .fetch(&self.connection, &self.request, cancel)
                    .await
            }
            ExecutionMode::ConditionalParallel | ExecutionMode::ForceParallel => {
                self.fetcher
                    .fetch_bounded(&self.configuration, &self.connection, &self.request, cancel)
                    .await
            }
        };

        let messages = match fetched {
            Ok(messages) => messages,
            Err(err) => {
                if let Err(hook_err) = self.hooks.on_fetch_failed(&ctx, &err).await {
                    error!(
                        job_id = %self.id,
                        error = %hook_err,
                        original = %err,
                        "on_fetch_failed hook failed"
                    );
                }
                return Err(err);
            }
        };

        self.hooks
            .on_fetched(&ctx, &messages)
            .await
            .map_err(|e| FetchError::hook("on_fetched", e.to_string()))?;

        Ok(messages)
    }

    fn transition(&mut self, to: JobState, error: Option<&FetchError>) {
        // invoke() takes &mut self, so only these edges are ever requested.
        if let Err(reason) = self.status.transition_to(to, error.map(FetchError::kind)) {
            debug!(job_id = %self.id, %reason, "Ignoring invalid job transition");
        }
    }
}

/// Builder for [`MailboxFetchJob`].
pub struct MailboxFetchJobBuilder {
    fetcher: Arc<dyn ProtocolFetcher>,
    connection: Option<MailServerConnection>,
    configuration: Option<FetcherConfiguration>,
    request: Option<FetchRequest>,
    hooks: Option<Arc<dyn FetchHooks>>,
    label: Option<String>,
}

impl MailboxFetchJobBuilder {
    /// Mail server to fetch from. Required.
    pub fn connection(mut self, connection: MailServerConnection) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Fetch policy. Defaults to sequential retrieval.
    pub fn configuration(mut self, configuration: FetcherConfiguration) -> Self {
        self.configuration = Some(configuration);
        self
    }

    /// Selection criterion. Defaults to every message; anything else needs a
    /// configurable fetcher.
    pub fn request(mut self, request: FetchRequest) -> Self {
        self.request = Some(request);
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn FetchHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn build(self) -> Result<MailboxFetchJob> {
        let connection = self.connection.ok_or(UsageError::MissingConnection)?;
        connection.validate()?;

        let configuration = self.configuration.unwrap_or_default();
        configuration.validate()?;

        let request = self.request.unwrap_or_default();
        ensure_request_supported(self.fetcher.as_ref(), &request)?;

        Ok(MailboxFetchJob {
            id: JobId::new(),
            label: self.label,
            fetcher: self.fetcher,
            connection,
            configuration,
            request,
            hooks: self.hooks.unwrap_or_else(|| Arc::new(NoopHooks)),
            status: JobStatus::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::config::Protocol;
    use crate::error::{FetchErrorKind, SessionError};
    use crate::fetcher::{ImapFetcher, Pop3Fetcher};
    use crate::request::SearchQuery;
    use crate::session::memory::MemoryMailbox;

    fn connection() -> MailServerConnection {
        MailServerConnection::new("mail.example.com", 993, "carol", "pw")
    }

    fn imap(mailbox: &MemoryMailbox) -> Arc<dyn ProtocolFetcher> {
        Arc::new(ImapFetcher::new(mailbox.imap_factory()))
    }

    /// Records hook calls; fails the ones it is told to.
    #[derive(Default)]
    struct RecordingHooks {
        calls: Mutex<Vec<String>>,
        fail_fetching: bool,
        fail_fetched: bool,
        fail_failed: bool,
    }

    impl RecordingHooks {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String, fail: bool) -> std::result::Result<(), HookError> {
            self.calls.lock().unwrap().push(call);
            if fail { Err("hook exploded".into()) } else { Ok(()) }
        }
    }

    #[async_trait]
    impl FetchHooks for RecordingHooks {
        async fn on_fetching(&self, ctx: &HookContext<'_>) -> std::result::Result<(), HookError> {
            let call = format!("fetching:{}", ctx.fetcher.protocol());
            self.record(call, self.fail_fetching)
        }

        async fn on_fetched(
            &self,
            _ctx: &HookContext<'_>,
            messages: &[MailMessage],
        ) -> std::result::Result<(), HookError> {
            self.record(format!("fetched:{}", messages.len()), self.fail_fetched)
        }

        async fn on_fetch_failed(
            &self,
            _ctx: &HookContext<'_>,
            error: &FetchError,
        ) -> std::result::Result<(), HookError> {
            self.record(format!("failed:{}", error.kind()), self.fail_failed)
        }
    }

    #[test]
    fn build_without_connection_is_usage_error() {
        let err = MailboxFetchJob::builder(imap(&MemoryMailbox::new()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, FetchError::Usage(UsageError::MissingConnection)));
    }

    #[test]
    fn build_rejects_invalid_policy() {
        let err = MailboxFetchJob::builder(imap(&MemoryMailbox::new()))
            .connection(connection())
            .configuration(FetcherConfiguration::force_parallel(0))
            .build()
            .err()
            .unwrap();
        assert_eq!(err.kind(), FetchErrorKind::Usage);
    }

    #[test]
    fn build_rejects_criterion_on_non_configurable_fetcher() {
        let mailbox = MemoryMailbox::new();
        let err = MailboxFetchJob::builder(Arc::new(Pop3Fetcher::new(mailbox.pop3_factory())))
            .connection(connection())
            .request(FetchRequest::new(SearchQuery::Unseen))
            .build()
            .err()
            .unwrap();
        assert!(matches!(
            err,
            FetchError::Usage(UsageError::NotConfigurable { .. })
        ));
        assert_eq!(mailbox.stats().connects, 0);
    }

    #[test]
    fn defaults_are_synthesized() {
        let job = MailboxFetchJob::builder(imap(&MemoryMailbox::new()))
            .connection(connection())
            .label("inbox")
            .build()
            .unwrap();
        assert_eq!(job.state(), JobState::Configured);
        assert_eq!(job.configuration(), &FetcherConfiguration::default());
        assert!(job.request().is_select_all());
        assert_eq!(job.label(), Some("inbox"));
    }

    #[tokio::test]
    async fn successful_invoke_runs_hooks_in_order() {
        let mailbox = MemoryMailbox::with_messages(3);
        let hooks = Arc::new(RecordingHooks::default());
        let mut job = MailboxFetchJob::builder(imap(&mailbox))
            .connection(connection())
            .hooks(hooks.clone())
            .build()
            .unwrap();

        let messages = job.invoke(&CancellationToken::new()).await.unwrap();

        assert_eq!(messages.len(), 3);
        assert_eq!(job.state(), JobState::Fetched);
        assert_eq!(job.status().fetched, 3);
        assert_eq!(hooks.calls(), vec!["fetching:imap", "fetched:3"]);
    }

    #[tokio::test]
    async fn failure_hook_sees_error_and_error_is_unchanged() {
        let mailbox = MemoryMailbox::with_messages(3).refusing_connections();
        let hooks = Arc::new(RecordingHooks {
            fail_failed: true,
            ..RecordingHooks::default()
        });
        let mut job = MailboxFetchJob::builder(imap(&mailbox))
            .connection(connection())
            .hooks(hooks.clone())
            .build()
            .unwrap();

        let err = job.invoke(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(
            err,
            FetchError::Connection {
                source: SessionError::Io(_),
                ..
            }
        ));
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(job.status().last_error(), Some(FetchErrorKind::Connection));
        assert_eq!(hooks.calls(), vec!["fetching:imap", "failed:connection"]);
    }

    #[tokio::test]
    async fn failing_pre_hook_prevents_fetch() {
        let mailbox = MemoryMailbox::with_messages(3);
        let hooks = Arc::new(RecordingHooks {
            fail_fetching: true,
            ..RecordingHooks::default()
        });
        let mut job = MailboxFetchJob::builder(imap(&mailbox))
            .connection(connection())
            .hooks(hooks.clone())
            .build()
            .unwrap();

        let err = job.invoke(&CancellationToken::new()).await.unwrap_err();

        assert_eq!(err.kind(), FetchErrorKind::Hook);
        assert_eq!(mailbox.stats().connects, 0);
        assert_eq!(hooks.calls(), vec!["fetching:imap"]);
    }

    #[tokio::test]
    async fn failing_post_hook_fails_the_job() {
        let mailbox = MemoryMailbox::with_messages(2);
        let hooks = Arc::new(RecordingHooks {
            fail_fetched: true,
            ..RecordingHooks::default()
        });
        let mut job = MailboxFetchJob::builder(imap(&mailbox))
            .connection(connection())
            .hooks(hooks)
            .build()
            .unwrap();

        let err = job.invoke(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, FetchError::Hook { hook: "on_fetched", .. }));
        assert_eq!(job.state(), JobState::Failed);
    }

    #[tokio::test]
    async fn none_mode_uses_sequential_entry_point() {
        let mailbox = MemoryMailbox::with_messages(30).with_latency(Duration::from_millis(1));
        let mut job = MailboxFetchJob::builder(imap(&mailbox))
            .connection(connection())
            .configuration(FetcherConfiguration {
                minimum_message_count_to_parallelize: 0,
                max_degree_of_parallelism: 8,
                ..FetcherConfiguration::default()
            })
            .build()
            .unwrap();

        let messages = job.invoke(&CancellationToken::new()).await.unwrap();
        assert_eq!(messages.len(), 30);
        assert_eq!(mailbox.stats().max_in_flight, 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_fails_with_cancellation() {
        let mailbox = MemoryMailbox::with_messages(3);
        let mut job = MailboxFetchJob::builder(imap(&mailbox))
            .connection(connection())
            .configuration(FetcherConfiguration::force_parallel(2))
            .build()
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = job.invoke(&cancel).await.unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(job.status().last_error(), Some(FetchErrorKind::Cancelled));
        assert_eq!(mailbox.stats().connects, 0);
    }

    #[tokio::test]
    async fn job_can_be_invoked_again() {
        let mailbox = MemoryMailbox::with_messages(2);
        let mut job = MailboxFetchJob::builder(Arc::new(Pop3Fetcher::new(mailbox.pop3_factory())))
            .connection(connection())
            .build()
            .unwrap();
        let cancel = CancellationToken::new();

        assert_eq!(job.invoke(&cancel).await.unwrap().len(), 2);
        assert_eq!(job.invoke(&cancel).await.unwrap().len(), 0);
        assert_eq!(job.state(), JobState::Fetched);
        assert_eq!(job.status().transitions.len(), 4);
        assert_eq!(job.fetcher.protocol(), Protocol::Pop3);
    }
}
