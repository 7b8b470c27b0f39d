//! Lifecycle hooks around a fetch.
//!
//! Hooks observe a job; they cannot change its configuration or its
//! messages. A failing hook is reported like any other job error.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::FetchError;
use crate::fetcher::ProtocolFetcher;
use crate::job::state::JobId;
use crate::message::MailMessage;

/// Error type returned by hook implementations.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// What a hook sees of the running job.
pub struct HookContext<'a> {
    pub job_id: JobId,
    pub label: Option<&'a str>,
    pub host: &'a str,
    pub fetcher: &'a dyn ProtocolFetcher,
    pub cancel: &'a CancellationToken,
}

#[async_trait]
pub trait FetchHooks: Send + Sync {
    /// Called right before the fetch starts.
    async fn on_fetching(&self, _ctx: &HookContext<'_>) -> Result<(), HookError> {
        Ok(())
    }

    /// Called after a successful fetch.
    async fn on_fetched(
        &self,
        _ctx: &HookContext<'_>,
        _messages: &[MailMessage],
    ) -> Result<(), HookError> {
        Ok(())
    }

    /// Called after a failed fetch, before the error is returned.
    async fn on_fetch_failed(
        &self,
        _ctx: &HookContext<'_>,
        _error: &FetchError,
    ) -> Result<(), HookError> {
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl FetchHooks for NoopHooks {}

/// Hooks that log every lifecycle event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHooks;

#[async_trait]
impl FetchHooks for TracingHooks {
    async fn on_fetching(&self, ctx: &HookContext<'_>) -> Result<(), HookError> {
        info!(
            job_id = %ctx.job_id,
            protocol = %ctx.fetcher.protocol(),
            host = %ctx.host,
            "Fetching mailbox"
        );
        Ok(())
    }

    async fn on_fetched(
        &self,
        ctx: &HookContext<'_>,
        messages: &[MailMessage],
    ) -> Result<(), HookError> {
        info!(job_id = %ctx.job_id, host = %ctx.host, count = messages.len(), "Mailbox fetched");
        Ok(())
    }

    async fn on_fetch_failed(
        &self,
        ctx: &HookContext<'_>,
        error: &FetchError,
    ) -> Result<(), HookError> {
        warn!(
            job_id = %ctx.job_id,
            host = %ctx.host,
            kind = %error.kind(),
            error = %error,
            "Mailbox fetch failed"
        );
        Ok(())
    }
}
