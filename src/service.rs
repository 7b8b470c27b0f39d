//! Multi-mailbox fetch service.
//!
//! Runs many fetch jobs, possibly against different protocols and servers,
//! with a bound on how many run at once. Jobs are isolated: one failing job
//! never stops its siblings, and the [`FetchReport`] says which jobs
//! succeeded and which failed.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{FetcherConfiguration, MailServerConnection, Protocol};
use crate::error::{ConfigError, FetchError, FetchErrorKind, Result, UsageError};
use crate::fetcher::ProtocolFetcher;
use crate::job::{FetchHooks, JobId, MailboxFetchJob};
use crate::message::MailMessage;
use crate::request::FetchRequest;

/// Description of one job for the service.
#[derive(Debug, Clone, Deserialize)]
pub struct MailboxFetchJobSpec {
    #[serde(default)]
    pub label: Option<String>,
    pub protocol: Protocol,
    pub connection: MailServerConnection,
    #[serde(default)]
    pub configuration: FetcherConfiguration,
    #[serde(default)]
    pub request: Option<FetchRequest>,
}

impl MailboxFetchJobSpec {
    pub fn new(protocol: Protocol, connection: MailServerConnection) -> Self {
        Self {
            label: None,
            protocol,
            connection,
            configuration: FetcherConfiguration::default(),
            request: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_configuration(mut self, configuration: FetcherConfiguration) -> Self {
        self.configuration = configuration;
        self
    }

    pub fn with_request(mut self, request: FetchRequest) -> Self {
        self.request = Some(request);
        self
    }

    /// Parse a JSON array of job specs and validate each one.
    pub fn from_json(json: &str) -> std::result::Result<Vec<Self>, ConfigError> {
        let specs: Vec<Self> = serde_json::from_str(json)?;
        for spec in &specs {
            spec.connection.validate()?;
            spec.configuration.validate()?;
        }
        Ok(specs)
    }
}

/// Fetchers available to the service, one per protocol.
#[derive(Clone, Default)]
pub struct FetcherRegistry {
    fetchers: HashMap<Protocol, Arc<dyn ProtocolFetcher>>,
}

impl FetcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `fetcher` under its own protocol, replacing any previous one.
    pub fn register(mut self, fetcher: Arc<dyn ProtocolFetcher>) -> Self {
        self.fetchers.insert(fetcher.protocol(), fetcher);
        self
    }

    pub fn get(&self, protocol: Protocol) -> Option<Arc<dyn ProtocolFetcher>> {
        self.fetchers.get(&protocol).cloned()
    }

    pub fn protocols(&self) -> impl Iterator<Item = Protocol> + '_ {
        self.fetchers.keys().copied()
    }
}

/// Identifies a job in a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRef {
    /// Position of the job spec in the service's job list.
    pub index: usize,
    pub label: Option<String>,
    pub protocol: Protocol,
    pub host: String,
    pub username: String,
}

impl JobRef {
    fn new(index: usize, spec: &MailboxFetchJobSpec) -> Self {
        Self {
            index,
            label: spec.label.clone(),
            protocol: spec.protocol,
            host: spec.connection.host.clone(),
            username: spec.connection.username.clone(),
        }
    }
}

impl fmt::Display for JobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "#{} {label}", self.index),
            None => write!(
                f,
                "#{} {}://{}@{}",
                self.index, self.protocol, self.username, self.host
            ),
        }
    }
}

/// A job that returned its messages.
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub job: JobRef,
    pub job_id: JobId,
    pub fetched: usize,
    pub elapsed: Option<Duration>,
}

/// A job that failed, with the error that ended it.
#[derive(Debug)]
pub struct JobFailure {
    pub job: JobRef,
    pub error: FetchError,
}

impl JobFailure {
    pub fn kind(&self) -> FetchErrorKind {
        self.error.kind()
    }
}

/// Aggregated outcome of a service run.
///
/// `messages` holds the messages of every succeeded job, in no particular
/// order. `succeeded` and `failures` are sorted by job index.
#[derive(Debug, Default)]
pub struct FetchReport {
    pub messages: Vec<MailMessage>,
    pub succeeded: Vec<JobSummary>,
    pub failures: Vec<JobFailure>,
}

impl FetchReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// True when at least one job stopped because of cancellation.
    pub fn was_cancelled(&self) -> bool {
        self.failures.iter().any(|f| f.error.is_cancellation())
    }

    pub fn failure_for(&self, index: usize) -> Option<&JobFailure> {
        self.failures.iter().find(|f| f.job.index == index)
    }
}

type JobOutcome = std::result::Result<(JobSummary, Vec<MailMessage>), FetchError>;

/// Runs a list of fetch jobs and aggregates their results.
pub struct FetchService {
    registry: FetcherRegistry,
    hooks: Option<Arc<dyn FetchHooks>>,
    jobs: Vec<MailboxFetchJobSpec>,
}

impl FetchService {
    pub fn new(registry: FetcherRegistry) -> Self {
        Self {
            registry,
            hooks: None,
            jobs: Vec::new(),
        }
    }

    /// Hooks attached to every job the service runs.
    pub fn with_hooks(mut self, hooks: Arc<dyn FetchHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Add one job.
    pub fn configure_job(&mut self, spec: MailboxFetchJobSpec) -> &mut Self {
        self.jobs.push(spec);
        self
    }

    /// Replace the job list.
    pub fn configure_jobs(&mut self, specs: Vec<MailboxFetchJobSpec>) -> &mut Self {
        self.jobs = specs;
        self
    }

    pub fn jobs(&self) -> &[MailboxFetchJobSpec] {
        &self.jobs
    }

    /// Run every job, one at a time.
    pub async fn invoke(&self, cancel: &CancellationToken) -> Result<FetchReport> {
        self.invoke_with(1, cancel).await
    }

    /// Run every job with at most `parallelism` jobs in flight.
    ///
    /// Only a usage error of the call itself (parallelism 0) is returned as
    /// `Err`; job errors end up in [`FetchReport::failures`].
    pub async fn invoke_with(
        &self,
        parallelism: usize,
        cancel: &CancellationToken,
    ) -> Result<FetchReport> {
        let parallelism = NonZeroUsize::new(parallelism).ok_or(UsageError::ZeroParallelism)?;
        info!(jobs = self.jobs.len(), parallelism, "Fetch service started");

        let permits = Arc::new(Semaphore::new(parallelism.get()));
        // Dropping the set aborts every job still running.
        let mut tasks: JoinSet<JobOutcome> = JoinSet::new();
        let mut running: HashMap<task::Id, JobRef> = HashMap::with_capacity(self.jobs.len());

        for (index, spec) in self.jobs.iter().enumerate() {
            let job_ref = JobRef::new(index, spec);

            let spec = spec.clone();
            let fetcher = self.registry.get(spec.protocol);
            let hooks = self.hooks.clone();
            let permits = Arc::clone(&permits);
            let cancel = cancel.clone();
            let summary_ref = job_ref.clone();

            let handle = tasks.spawn(async move {
                let _permit = acquire_slot(permits).await?;
                run_job(summary_ref, spec, fetcher, hooks, &cancel).await
            });
            running.insert(handle.id(), job_ref);
        }

        let mut report = FetchReport::default();

        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, outcome) = match joined {
                Ok((id, outcome)) => (id, outcome),
                Err(e) => (
                    e.id(),
                    Err(FetchError::Panicked {
                        reason: e.to_string(),
                    }),
                ),
            };
            let Some(job) = running.remove(&id) else {
                continue;
            };

            match outcome {
                Ok((summary, messages)) => {
                    report.messages.extend(messages);
                    report.succeeded.push(summary);
                }
                Err(error) => {
                    warn!(job = %job, kind = %error.kind(), error = %error, "Fetch job failed");
                    report.failures.push(JobFailure { job, error });
                }
            }
        }

        report.succeeded.sort_by_key(|s| s.job.index);
        report.failures.sort_by_key(|f| f.job.index);

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failures.len(),
            messages = report.messages.len(),
            "Fetch service finished"
        );

        Ok(report)
    }
}

/// Wait for a job slot.
async fn acquire_slot(
    permits: Arc<Semaphore>,
) -> std::result::Result<OwnedSemaphorePermit, FetchError> {
    permits
        .acquire_owned()
        .await
        .map_err(|e| FetchError::Scheduling {
            reason: e.to_string(),
        })
}

async fn run_job(
    job_ref: JobRef,
    spec: MailboxFetchJobSpec,
    fetcher: Option<Arc<dyn ProtocolFetcher>>,
    hooks: Option<Arc<dyn FetchHooks>>,
    cancel: &CancellationToken,
) -> JobOutcome {
    let fetcher = fetcher.ok_or_else(|| UsageError::UnsupportedProtocol {
        protocol: spec.protocol.to_string(),
    })?;

    let mut builder = MailboxFetchJob::builder(fetcher)
        .connection(spec.connection)
        .configuration(spec.configuration);
    if let Some(request) = spec.request {
        builder = builder.request(request);
    }
    if let Some(label) = spec.label {
        builder = builder.label(label);
    }
    if let Some(hooks) = hooks {
        builder = builder.hooks(hooks);
    }

    let mut job = builder.build()?;
    let messages = job.invoke(cancel).await?;

    let summary = JobSummary {
        job: job_ref,
        job_id: job.id(),
        fetched: messages.len(),
        elapsed: job.status().elapsed(),
    };
    Ok((summary, messages))
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::fetcher::{ImapFetcher, Pop3Fetcher};
    use crate::session::memory::MemoryMailbox;

    fn spec(protocol: Protocol, host: &str) -> MailboxFetchJobSpec {
        MailboxFetchJobSpec::new(protocol, MailServerConnection::new(host, 993, "alice", "pw"))
    }

    struct PanickingFetcher;

    #[async_trait]
    impl ProtocolFetcher for PanickingFetcher {
        fn protocol(&self) -> Protocol {
            Protocol::Imap
        }

        async fn fetch(
            &self,
            _connection: &MailServerConnection,
            _request: &FetchRequest,
            _cancel: &CancellationToken,
        ) -> Result<Vec<MailMessage>> {
            panic!("fetcher blew up");
        }

        async fn fetch_bounded(
            &self,
            _configuration: &FetcherConfiguration,
            _connection: &MailServerConnection,
            _request: &FetchRequest,
            _cancel: &CancellationToken,
        ) -> Result<Vec<MailMessage>> {
            panic!("fetcher blew up");
        }
    }

    #[tokio::test]
    async fn zero_parallelism_is_rejected() {
        let service = FetchService::new(FetcherRegistry::new());
        let err = service
            .invoke_with(0, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Usage(UsageError::ZeroParallelism)));
    }

    #[tokio::test]
    async fn empty_job_list_yields_empty_report() {
        let service = FetchService::new(FetcherRegistry::new());
        let report = service.invoke(&CancellationToken::new()).await.unwrap();
        assert!(report.is_success());
        assert!(report.messages.is_empty());
        assert!(report.succeeded.is_empty());
    }

    #[tokio::test]
    async fn messages_from_all_jobs_are_aggregated() {
        let imap = MemoryMailbox::with_messages(3);
        let pop3 = MemoryMailbox::with_messages(2);
        let registry = FetcherRegistry::new()
            .register(Arc::new(ImapFetcher::new(imap.imap_factory())))
            .register(Arc::new(Pop3Fetcher::new(pop3.pop3_factory())));

        let mut service = FetchService::new(registry);
        service
            .configure_job(spec(Protocol::Imap, "imap.example.com").with_label("work"))
            .configure_job(spec(Protocol::Pop3, "pop.example.com"));

        let report = service.invoke_with(2, &CancellationToken::new()).await.unwrap();

        assert!(report.is_success());
        assert_eq!(report.messages.len(), 5);
        assert_eq!(report.succeeded.len(), 2);
        assert_eq!(report.succeeded[0].job.label.as_deref(), Some("work"));
        assert_eq!(report.succeeded[0].fetched, 3);
        assert_eq!(report.succeeded[1].fetched, 2);
    }

    #[tokio::test]
    async fn unregistered_protocol_fails_only_that_job() {
        let imap = MemoryMailbox::with_messages(1);
        let registry =
            FetcherRegistry::new().register(Arc::new(ImapFetcher::new(imap.imap_factory())));

        let mut service = FetchService::new(registry);
        service.configure_jobs(vec![
            spec(Protocol::Pop3, "pop.example.com"),
            spec(Protocol::Imap, "imap.example.com"),
        ]);

        let report = service.invoke(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.messages.len(), 1);
        let failure = report.failure_for(0).unwrap();
        assert_eq!(failure.kind(), FetchErrorKind::Usage);
        assert!(matches!(
            failure.error,
            FetchError::Usage(UsageError::UnsupportedProtocol { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_job_is_a_per_job_failure() {
        let imap = MemoryMailbox::with_messages(2);
        let registry =
            FetcherRegistry::new().register(Arc::new(ImapFetcher::new(imap.imap_factory())));

        let mut service = FetchService::new(registry);
        service
            .configure_job(spec(Protocol::Imap, ""))
            .configure_job(spec(Protocol::Imap, "imap.example.com"));

        let report = service.invoke(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].job.index, 0);
        assert_eq!(report.failures[0].kind(), FetchErrorKind::Usage);
        assert_eq!(report.succeeded.len(), 1);
        // The invalid job never opened a session.
        assert_eq!(imap.stats().connects, 1);
    }

    #[tokio::test]
    async fn panicking_fetcher_is_isolated() {
        let pop3 = MemoryMailbox::with_messages(2);
        let registry = FetcherRegistry::new()
            .register(Arc::new(PanickingFetcher))
            .register(Arc::new(Pop3Fetcher::new(pop3.pop3_factory())));

        let mut service = FetchService::new(registry);
        service
            .configure_job(spec(Protocol::Imap, "imap.example.com"))
            .configure_job(spec(Protocol::Pop3, "pop.example.com"));

        let report = service.invoke_with(2, &CancellationToken::new()).await.unwrap();

        assert_eq!(report.messages.len(), 2);
        let failure = report.failure_for(0).unwrap();
        assert_eq!(failure.kind(), FetchErrorKind::Panicked);
        assert!(failure.error.to_string().contains("panicked"));
    }

    #[tokio::test]
    async fn closed_slots_fail_the_job_instead_of_skipping_the_bound() {
        let permits = Arc::new(Semaphore::new(1));
        permits.close();

        let err = acquire_slot(permits).await.unwrap_err();
        assert_eq!(err.kind(), FetchErrorKind::Scheduling);
    }

    #[test]
    fn job_specs_parse_from_json() {
        let json = r#"[
            {
                "label": "support",
                "protocol": "imap",
                "connection": {"host": "imap.example.com", "port": 993, "username": "a", "password": "p"},
                "configuration": {"execution_mode": "conditional_parallel", "minimum_message_count_to_parallelize": 10},
                "request": {"query": "unseen"}
            },
            {
                "protocol": "pop3",
                "connection": {"host": "pop.example.com", "port": 995, "username": "b", "password": "q", "security": "tls"}
            }
        ]"#;

        let specs = MailboxFetchJobSpec::from_json(json).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].label.as_deref(), Some("support"));
        assert_eq!(specs[0].configuration.minimum_message_count_to_parallelize, 10);
        assert_eq!(specs[0].configuration.max_degree_of_parallelism, 3);
        assert!(specs[0].request.is_some());
        assert_eq!(specs[1].protocol, Protocol::Pop3);
        assert!(specs[1].request.is_none());
    }

    #[test]
    fn job_specs_are_validated() {
        let json = r#"[{"protocol": "imap", "connection": {"host": "h", "port": 0, "username": "a", "password": "p"}}]"#;
        assert!(matches!(
            MailboxFetchJobSpec::from_json(json),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            MailboxFetchJobSpec::from_json("not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn job_ref_display() {
        let unlabeled = JobRef::new(2, &spec(Protocol::Pop3, "pop.example.com"));
        assert_eq!(unlabeled.to_string(), "#2 pop3://alice@pop.example.com");
        let labeled = JobRef::new(0, &spec(Protocol::Imap, "h").with_label("work"));
        assert_eq!(labeled.to_string(), "#0 work");
    }
}
