//! Protocol fetchers.
//!
//! A fetcher owns the connect / authenticate / enumerate / retrieve /
//! disconnect sequence of one protocol family and hides it behind
//! [`ProtocolFetcher`]. Each call opens its own session from a
//! [`SessionFactory`](crate::session::SessionFactory); sessions are never
//! shared between calls.

pub mod imap;
pub mod pop3;
mod retrieve;

pub use imap::ImapFetcher;
pub use pop3::Pop3Fetcher;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{FetcherConfiguration, MailServerConnection, Protocol};
use crate::error::{Result, UsageError};
use crate::message::MailMessage;
use crate::request::FetchRequest;

/// Uniform fetch capability over one mail protocol.
#[async_trait]
pub trait ProtocolFetcher: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Optional capability: fetchers that honour a selection criterion
    /// return themselves here. The default is not configurable.
    fn configurable(&self) -> Option<&dyn ConfigurableFetcher> {
        None
    }

    /// Retrieve every selected message one at a time.
    async fn fetch(
        &self,
        connection: &MailServerConnection,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<MailMessage>>;

    /// Retrieve the selected messages, in parallel when `configuration`
    /// says so for the enumerated count. Output order is unspecified.
    async fn fetch_bounded(
        &self,
        configuration: &FetcherConfiguration,
        connection: &MailServerConnection,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<MailMessage>>;
}

/// Fetchers that accept a caller-supplied selection criterion.
pub trait ConfigurableFetcher: Send + Sync {
    /// Reject requests this fetcher cannot evaluate.
    fn check_request(&self, request: &FetchRequest) -> std::result::Result<(), UsageError>;
}

/// Verify that `request` can be honoured by `fetcher`.
///
/// The default "select all" request is accepted by every fetcher; anything
/// else needs the [`ConfigurableFetcher`] capability.
pub fn ensure_request_supported(
    fetcher: &dyn ProtocolFetcher,
    request: &FetchRequest,
) -> std::result::Result<(), UsageError> {
    match fetcher.configurable() {
        Some(configurable) => configurable.check_request(request),
        None if request.is_select_all() => Ok(()),
        None => Err(UsageError::NotConfigurable {
            protocol: fetcher.protocol().to_string(),
        }),
    }
}
