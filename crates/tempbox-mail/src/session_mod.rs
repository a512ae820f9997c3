use std::fmt;

use imap::{ClientBuilder, ConnectionMode};
use tracing::{debug, warn};

use super::{ImapConfig, IngestError};

/// Inclusive range of message sequence numbers, `first >= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqRange {
    pub first: u32,
    pub last: u32,
}

impl SeqRange {
    pub fn new(first: u32, last: u32) -> Option<Self> {
        if first == 0 || first > last {
            return None;
        }
        Some(Self { first, last })
    }

    pub fn len(&self) -> u32 {
        self.last - self.first + 1
    }

    /// Splits the range into consecutive sub-ranges of at most `size` numbers.
    pub fn chunks(&self, size: usize) -> impl Iterator<Item = SeqRange> {
        let size = u32::try_from(size.max(1)).unwrap_or(u32::MAX);
        let last = self.last;
        let mut next = Some(self.first);
        std::iter::from_fn(move || {
            let first = next?;
            let end = first.saturating_add(size - 1).min(last);
            next = if end < last { Some(end + 1) } else { None };
            Some(SeqRange { first, last: end })
        })
    }
}

impl fmt::Display for SeqRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.first == self.last {
            write!(f, "{}", self.first)
        } else {
            write!(f, "{}:{}", self.first, self.last)
        }
    }
}

/// An authenticated upstream session. Calls block; callers run them on the
/// blocking pool.
pub trait MailboxSession: Send + 'static {
    /// Selects `mailbox` and returns its current message count.
    fn select(&mut self, mailbox: &str) -> Result<u32, IngestError>;

    /// Feeds the raw messages of `range` to `sink` in sequence order. Stops
    /// early, without error, once `sink` returns false.
    fn fetch_range(
        &mut self,
        range: SeqRange,
        sink: &mut dyn FnMut(Vec<u8>) -> bool,
    ) -> Result<(), IngestError>;

    fn logout(&mut self) {}
}

/// Opens and authenticates new upstream sessions.
pub trait Connector: Send + Sync + 'static {
    type Session: MailboxSession;

    fn connect(&self) -> Result<Self::Session, IngestError>;
}

pub struct ImapConnector {
    config: ImapConfig,
}

impl ImapConnector {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }
}

impl Connector for ImapConnector {
    type Session = ImapSession;

    fn connect(&self) -> Result<ImapSession, IngestError> {
        let imap = &self.config;
        debug!(host = %imap.host, port = imap.port, "imap connect start");
        let client = ClientBuilder::new(imap.host.as_str(), imap.port)
            .tls_kind(imap::TlsKind::Native)
            .mode(ConnectionMode::Tls)
            .danger_skip_tls_verify(imap.skip_tls_verify)
            .connect()
            .map_err(|err| IngestError::Connection(err.to_string()))?;
        debug!("imap connect tls established");
        let session = client
            .login(&imap.username, &imap.password)
            .map_err(|(err, _client)| IngestError::Auth(err.to_string()))?;
        debug!(username = %imap.username, "imap login ok");
        Ok(ImapSession {
            session,
            chunk_size: imap.fetch_chunk_size,
        })
    }
}

pub struct ImapSession {
    session: imap::Session<imap::Connection>,
    chunk_size: usize,
}

impl MailboxSession for ImapSession {
    fn select(&mut self, mailbox: &str) -> Result<u32, IngestError> {
        let selected = self
            .session
            .select(mailbox)
            .map_err(|err| IngestError::MailboxSelect(err.to_string()))?;
        Ok(selected.exists)
    }

    fn fetch_range(
        &mut self,
        range: SeqRange,
        sink: &mut dyn FnMut(Vec<u8>) -> bool,
    ) -> Result<(), IngestError> {
        for chunk in range.chunks(self.chunk_size) {
            debug!(range = %chunk, "imap fetch chunk");
            let fetches = self
                .session
                .fetch(chunk.to_string(), "RFC822")
                .map_err(|err| IngestError::Fetch(err.to_string()))?;
            let mut ordered: Vec<_> = fetches.iter().collect();
            ordered.sort_by_key(|fetch| fetch.message);
            for fetch in ordered {
                let Some(body) = fetch.body() else {
                    warn!(seq = fetch.message, "server returned no message body");
                    continue;
                };
                if !sink(body.to_vec()) {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn logout(&mut self) {
        if let Err(err) = self.session.logout() {
            debug!(error = %err, "imap logout failed");
        }
    }
}
