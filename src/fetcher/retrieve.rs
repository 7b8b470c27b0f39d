//! Shared retrieval loop and session teardown.

use std::future::Future;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt, stream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{MailServerConnection, RetrievalPlan};
use crate::error::{FetchError, Result};
use crate::message::MailMessage;
use crate::session::Session;

/// Upper bound on the best-effort disconnect after a failed fetch.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `fut` unless `cancel` fires first.
///
/// The token is polled first, so a future is never started once the signal
/// has fired.
pub(crate) async fn guarded<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(FetchError::Cancelled),
        res = fut => res,
    }
}

/// Retrieve one message per key according to `plan`.
///
/// Sequential plans await each retrieval before starting the next. Parallel
/// plans keep at most `limit` retrievals in flight and yield results in
/// completion order. The first error (or cancellation) drops every retrieval
/// still in flight.
pub(crate) async fn retrieve_all<I, F, Fut>(
    keys: I,
    plan: RetrievalPlan,
    cancel: &CancellationToken,
    retrieve_one: F,
) -> Result<Vec<MailMessage>>
where
    I: IntoIterator,
    F: Fn(I::Item) -> Fut,
    Fut: Future<Output = Result<MailMessage>>,
{
    match plan {
        RetrievalPlan::Sequential => {
            // Keys are pulled lazily; the server-reported count is not
            // trusted as an allocation size.
            let mut messages = Vec::new();
            for key in keys {
                messages.push(guarded(cancel, retrieve_one(key)).await?);
            }
            Ok(messages)
        }
        RetrievalPlan::Parallel { limit } => {
            stream::iter(keys)
                .map(|key| guarded(cancel, retrieve_one(key)))
                .buffer_unordered(limit.get())
                .try_collect()
                .await
        }
    }
}

/// Connect `session`, racing `cancel`.
///
/// An already-cancelled token never touches the session. A connect that is
/// interrupted by cancellation may have left a half-open connection behind,
/// so it gets the same best-effort disconnect as a failed fetch.
pub(crate) async fn connect<S>(
    session: &mut S,
    connection: &MailServerConnection,
    cancel: &CancellationToken,
) -> Result<()>
where
    S: Session + ?Sized,
{
    if cancel.is_cancelled() {
        return Err(FetchError::Cancelled);
    }

    let host = connection.host.as_str();
    let outcome = guarded(cancel, async {
        session
            .connect(host, connection.port, connection.security)
            .await
            .map_err(|e| FetchError::connection(host, e))
    })
    .await;

    match outcome {
        Err(err) if err.is_cancellation() => {
            finish(session, false, host, Err(err)).await.map(|_| ())
        }
        other => other,
    }
}

/// Close a connected session and settle the fetch outcome.
///
/// After a successful fetch the disconnect is part of the operation and its
/// failure fails the fetch. After a failed fetch the disconnect is best
/// effort: it is bounded by a timeout, logged if it fails, and the original
/// error is returned.
pub(crate) async fn finish<S>(
    session: &mut S,
    commit: bool,
    host: &str,
    outcome: Result<Vec<MailMessage>>,
) -> Result<Vec<MailMessage>>
where
    S: Session + ?Sized,
{
    match outcome {
        Ok(messages) => {
            session
                .disconnect(commit)
                .await
                .map_err(|e| FetchError::protocol("disconnect", e))?;
            debug!(host = %host, count = messages.len(), "Session closed");
            Ok(messages)
        }
        Err(err) => {
            match tokio::time::timeout(DISCONNECT_TIMEOUT, session.disconnect(commit)).await {
                Ok(Ok(())) => debug!(host = %host, "Session closed after failed fetch"),
                Ok(Err(e)) => warn!(host = %host, error = %e, "Disconnect after failed fetch failed"),
                Err(_) => warn!(host = %host, "Disconnect after failed fetch timed out"),
            }
            Err(err)
        }
    }
}
