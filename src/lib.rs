//! Mail Fetch: concurrent mailbox retrieval.
//!
//! A [`MailboxFetchJob`] pulls every selected message out of one mailbox
//! through a [`ProtocolFetcher`] (search-and-fetch for IMAP, destructive
//! retrieve-and-delete for POP3), retrieving messages in parallel when its
//! [`FetcherConfiguration`] says so. A [`FetchService`] runs many jobs with a
//! bound on how many are in flight and reports per-job failures without
//! letting one job sink the others.

pub mod config;
pub mod error;
pub mod fetcher;
pub mod job;
pub mod message;
pub mod request;
pub mod service;
pub mod session;

pub use config::{
    ExecutionMode, FetcherConfiguration, MailServerConnection, Protocol, RetrievalPlan, Security,
};
pub use error::{FetchError, FetchErrorKind, Result};
pub use fetcher::{ImapFetcher, Pop3Fetcher, ProtocolFetcher};
pub use job::{FetchHooks, JobState, MailboxFetchJob};
pub use message::MailMessage;
pub use request::{FetchRequest, SearchQuery};
pub use service::{FetchReport, FetchService, FetcherRegistry, MailboxFetchJobSpec};
