use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tempbox_core::Mail;

use super::parse_mod::parse_message;
use super::session_mod::{Connector, MailboxSession, SeqRange};
use super::IngestError;

/// Depth of the queue between the fetch producer and the parser.
pub const RAW_QUEUE_CAPACITY: usize = 1;

/// Fixed-interval retry with an optional attempt cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// `None` retries until the process exits.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

    pub fn forever(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    pub fn bounded(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: Some(max_attempts.max(1)),
        }
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::forever(Self::DEFAULT_INTERVAL)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub mailbox: String,
    /// Upper bound for any single blocking upstream operation.
    pub op_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            mailbox: "INBOX".to_string(),
            op_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionState {
    pub connected: bool,
    /// Mailbox message count observed at the end of the last cycle.
    pub watermark: u32,
    pub last_sync_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Unchanged { watermark: u32 },
    /// The mailbox shrank; nothing was fetched.
    Rebased { from: u32, to: u32 },
    Fetched { range: SeqRange, emitted: usize },
}

/// Owns the upstream session and the watermark that decides what is new.
pub struct ConnectionManager<C: Connector> {
    connector: Arc<C>,
    settings: ConnectionSettings,
    session: Option<C::Session>,
    state: SessionState,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, settings: ConnectionSettings) -> Self {
        Self {
            connector: Arc::new(connector),
            settings,
            session: None,
            state: SessionState::default(),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Opens a fresh session, selects the mailbox and restarts the
    /// watermark at its current message count.
    pub async fn connect(&mut self) -> Result<(), IngestError> {
        self.disconnect();
        let connector = Arc::clone(&self.connector);
        let mailbox = self.settings.mailbox.clone();
        let (session, selected) =
            run_blocking(self.settings.op_timeout, IngestError::Connection, move || {
                let mut session = connector.connect()?;
                let selected = session.select(&mailbox);
                Ok::<_, IngestError>((session, selected))
            })
            .await??;
        match selected {
            Ok(count) => {
                self.session = Some(session);
                self.state = SessionState {
                    connected: true,
                    watermark: count,
                    last_sync_time: Some(Utc::now()),
                };
                info!(
                    mailbox = %self.settings.mailbox,
                    watermark = count,
                    "upstream mailbox selected"
                );
                Ok(())
            }
            Err(err) => {
                // Next successful cycle rescans the whole mailbox.
                self.state.watermark = 0;
                Err(err)
            }
        }
    }

    /// Retries [`connect`](Self::connect) under the retry policy until a
    /// session is up. Only returns an error when a bounded policy runs out.
    pub async fn reconnect(&mut self) -> Result<(), IngestError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.connect().await {
                Ok(()) => {
                    info!(attempts, watermark = self.state.watermark, "upstream connected");
                    return Ok(());
                }
                Err(err) => {
                    warn!(attempts, error = %err, "upstream connect failed");
                    if self.settings.retry.exhausted(attempts) {
                        return Err(err);
                    }
                }
            }
            tokio::time::sleep(self.settings.retry.interval).await;
        }
    }

    /// Runs one change-detection cycle and sends every new message to `out`.
    pub async fn poll_once(&mut self, out: &mpsc::Sender<Mail>) -> Result<PollOutcome, IngestError> {
        if !self.state.connected || self.session.is_none() {
            self.reconnect().await?;
        }
        let count = match self.select_current().await {
            Ok(count) => count,
            Err(err) => return Err(self.abort_cycle(err).await),
        };

        let watermark = self.state.watermark;
        if count == watermark {
            return Ok(PollOutcome::Unchanged { watermark });
        }
        let Some(range) = SeqRange::new(watermark + 1, count) else {
            info!(from = watermark, to = count, "mailbox shrank, rebasing watermark");
            self.mark_synced(count);
            return Ok(PollOutcome::Rebased {
                from: watermark,
                to: count,
            });
        };

        debug!(range = %range, "fetching new messages");
        let emitted = match self.fetch_new(range, out).await {
            Ok(emitted) => emitted,
            Err(err) => return Err(self.abort_cycle(err).await),
        };
        self.mark_synced(count);
        info!(range = %range, emitted, "poll cycle complete");
        Ok(PollOutcome::Fetched { range, emitted })
    }

    async fn select_current(&mut self) -> Result<u32, IngestError> {
        let Some(mut session) = self.session.take() else {
            return Err(IngestError::Connection("no active session".to_string()));
        };
        let mailbox = self.settings.mailbox.clone();
        let (session, selected) =
            run_blocking(self.settings.op_timeout, IngestError::MailboxSelect, move || {
                let selected = session.select(&mailbox);
                (session, selected)
            })
            .await?;
        self.session = Some(session);
        selected
    }

    async fn fetch_new(
        &mut self,
        range: SeqRange,
        out: &mpsc::Sender<Mail>,
    ) -> Result<usize, IngestError> {
        let Some(mut session) = self.session.take() else {
            return Err(IngestError::Fetch("no active session".to_string()));
        };
        let (raw_tx, mut raw_rx) = mpsc::channel::<Vec<u8>>(RAW_QUEUE_CAPACITY);
        let producer = tokio::task::spawn_blocking(move || {
            let result = session.fetch_range(range, &mut |raw| raw_tx.blocking_send(raw).is_ok());
            (session, result)
        });

        // The timeout bounds each wait on upstream, not time spent blocked on
        // the dispatch queue.
        let timeout = self.settings.op_timeout;
        let mut emitted = 0usize;
        loop {
            let raw = match tokio::time::timeout(timeout, raw_rx.recv()).await {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(_) => {
                    return Err(IngestError::Fetch(format!(
                        "no upstream progress for {:?}",
                        timeout
                    )));
                }
            };
            match parse_message(&raw) {
                Ok(mail) => {
                    if out.send(mail).await.is_err() {
                        warn!("dispatch queue closed, abandoning batch");
                        break;
                    }
                    emitted += 1;
                }
                Err(err) => warn!(error = %err, "skipping unparseable message"),
            }
        }
        drop(raw_rx);

        match tokio::time::timeout(timeout, producer).await {
            Ok(Ok((session, Ok(())))) => {
                self.session = Some(session);
                Ok(emitted)
            }
            Ok(Ok((_, Err(err)))) => Err(err),
            Ok(Err(join_err)) => Err(IngestError::Fetch(format!(
                "fetch worker failed: {}",
                join_err
            ))),
            Err(_) => Err(IngestError::Fetch(format!("timed out after {:?}", timeout))),
        }
    }

    async fn abort_cycle(&mut self, err: IngestError) -> IngestError {
        warn!(error = %err, "poll cycle aborted, reconnecting");
        self.disconnect();
        if let Err(reconnect_err) = self.reconnect().await {
            warn!(error = %reconnect_err, "reconnect gave up");
        }
        err
    }

    fn mark_synced(&mut self, count: u32) {
        self.state.watermark = count;
        self.state.last_sync_time = Some(Utc::now());
    }

    fn disconnect(&mut self) {
        self.state.connected = false;
        if let Some(mut session) = self.session.take() {
            tokio::task::spawn_blocking(move || session.logout());
        }
    }
}

async fn run_blocking<T, F>(
    timeout: Duration,
    on_error: fn(String) -> IngestError,
    f: F,
) -> Result<T, IngestError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(join_err)) => Err(on_error(format!("upstream worker failed: {}", join_err))),
        Err(_) => Err(on_error(format!("timed out after {:?}", timeout))),
    }
}
