//! Mail ingestion: upstream IMAP session, watermark polling, MIME parsing
//! and fan-out into alias mailboxes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tempbox_core::{AliasDirectory, Mail, MailStore};

mod connection_mod;
mod dispatch_mod;
mod parse_mod;
mod session_mod;

pub use connection_mod::{
    ConnectionManager, ConnectionSettings, PollOutcome, RAW_QUEUE_CAPACITY, RetryPolicy,
    SessionState,
};
pub use dispatch_mod::{DispatchOutcome, Dispatcher};
pub use parse_mod::{MimePart, TextKind, classify_content_type, parse_message};
pub use session_mod::{Connector, ImapConnector, ImapSession, MailboxSession, SeqRange};

/// Depth of the queue between polling and dispatch.
pub const DISPATCH_QUEUE_CAPACITY: usize = 1;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IngestError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("mailbox select failed: {0}")]
    MailboxSelect(String),

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("message parse failed: {0}")]
    PartParse(String),

    #[error("persistence failed: {0}")]
    Persistence(String),
}

impl IngestError {
    /// Errors that are handled by reconnecting.
    pub fn is_connection_tier(&self) -> bool {
        matches!(
            self,
            IngestError::Connection(_) | IngestError::Auth(_) | IngestError::MailboxSelect(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub mailbox: String,
    pub skip_tls_verify: bool,
    pub fetch_chunk_size: usize,
    pub timeout_secs: u64,
}

impl ImapConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn connection_settings(&self, retry: RetryPolicy) -> ConnectionSettings {
        ConnectionSettings {
            mailbox: self.mailbox.clone(),
            op_timeout: self.timeout(),
            retry,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub connection: ConnectionSettings,
    pub poll_interval: Duration,
    pub cleanup_interval: Duration,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

pub struct IngestEngine;

impl IngestEngine {
    /// Spawns the polling, dispatch and cache cleanup tasks.
    pub fn start<C: Connector>(
        connector: C,
        settings: IngestSettings,
        directory: Arc<AliasDirectory>,
        store: Arc<dyn MailStore>,
    ) -> IngestHandle {
        let (mail_tx, mail_rx) = mpsc::channel::<Mail>(DISPATCH_QUEUE_CAPACITY);
        let (status_tx, status_rx) = watch::channel(SessionState::default());

        let dispatcher = Dispatcher::new(directory.clone(), store).spawn(mail_rx);

        let manager = ConnectionManager::new(connector, settings.connection);
        let poll_interval = settings.poll_interval;
        let poller = tokio::spawn(async move {
            run_poller(manager, poll_interval, mail_tx, status_tx).await;
        });

        let cleanup_interval = settings.cleanup_interval.max(Duration::from_millis(1));
        let janitor = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                directory.purge_expired();
                debug!(live_aliases = directory.alias_count(), "alias caches swept");
            }
        });

        IngestHandle {
            status: status_rx,
            tasks: vec![poller, dispatcher, janitor],
        }
    }
}

async fn run_poller<C: Connector>(
    mut manager: ConnectionManager<C>,
    poll_interval: Duration,
    mail_tx: mpsc::Sender<Mail>,
    status: watch::Sender<SessionState>,
) {
    info!(mailbox = %manager.settings().mailbox, "ingestion started");
    loop {
        match manager.poll_once(&mail_tx).await {
            Ok(outcome) => debug!(?outcome, "poll cycle"),
            Err(err) => warn!(error = %err, "poll cycle failed"),
        }
        status.send_replace(*manager.state());
        if mail_tx.is_closed() {
            warn!("dispatch worker gone, stopping ingestion");
            return;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

pub struct IngestHandle {
    status: watch::Receiver<SessionState>,
    tasks: Vec<JoinHandle<()>>,
}

impl IngestHandle {
    /// Session state as of the end of the latest poll cycle.
    pub fn status(&self) -> SessionState {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.status.clone()
    }

    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
        info!("ingestion stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::{IngestError, RetryPolicy};
    use std::time::Duration;

    #[test]
    fn connection_tier_errors_are_classified() {
        assert!(IngestError::Connection("x".into()).is_connection_tier());
        assert!(IngestError::Auth("x".into()).is_connection_tier());
        assert!(IngestError::MailboxSelect("x".into()).is_connection_tier());
        assert!(!IngestError::Fetch("x".into()).is_connection_tier());
        assert!(!IngestError::PartParse("x".into()).is_connection_tier());
        assert!(!IngestError::Persistence("x".into()).is_connection_tier());
    }

    #[test]
    fn default_retry_is_unbounded_five_seconds() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.interval, Duration::from_secs(5));
        assert_eq!(retry.max_attempts, None);
        assert_eq!(RetryPolicy::bounded(Duration::ZERO, 0).max_attempts, Some(1));
    }
}
