use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{SqlitePool, sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions};

mod alias_mod;

pub use alias_mod::{
    ALIAS_LOCAL_PART_LEN, AliasDirectory, DEFAULT_ALIAS_TTL, IssuedAlias, MailboxSnapshot,
    QueryError,
};

/// Number of most recent mails kept per alias.
pub const MAILBOX_CAPACITY: usize = 10;

/// A parsed inbound message as surfaced to alias owners.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mail {
    pub from: String,
    pub to: String,
    /// Unix seconds from the `Date` header, 0 when absent.
    pub timestamp: i64,
    pub subject: String,
    pub plain_text: Vec<String>,
    pub html_text: Vec<String>,
    pub attachments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasMailbox {
    pub address: String,
    pub owner_id: String,
    pub mails: Vec<Mail>,
}

impl AliasMailbox {
    pub fn new(address: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            owner_id: owner_id.into(),
            mails: Vec::new(),
        }
    }

    /// Inserts `mail` keeping the list newest first and at most
    /// [`MAILBOX_CAPACITY`] long.
    pub fn push(&mut self, mail: Mail) {
        self.mails.push(mail);
        self.mails.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        self.mails.truncate(MAILBOX_CAPACITY);
    }
}

/// Durable, body-less record of a delivered mail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailSummaryRow {
    pub owner_id: String,
    pub alias_address: String,
    pub timestamp: i64,
    pub from: String,
    pub subject: String,
}

impl MailSummaryRow {
    pub fn from_mail(owner_id: &str, mail: &Mail) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            alias_address: mail.to.clone(),
            timestamp: mail.timestamp,
            from: mail.from.clone(),
            subject: mail.subject.clone(),
        }
    }
}

#[async_trait]
pub trait MailStore: Send + Sync {
    async fn insert_mail_summary(&self, row: &MailSummaryRow) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteMailStore {
    pool: SqlitePool,
}

impl SqliteMailStore {
    pub async fn connect(path: &str) -> Result<Self> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{}", path)
        };
        let options = SqliteConnectOptions::new()
            .filename(url.trim_start_matches("sqlite:"))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn list_mail_summaries(&self, owner_id: &str) -> Result<Vec<MailSummaryRow>> {
        let rows = sqlx::query_as::<_, (String, String, i64, String, String)>(
            "SELECT owner_id, alias_address, date_ts, from_addr, subject
             FROM mails WHERE owner_id = ? ORDER BY date_ts DESC, id DESC",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(
                |(owner_id, alias_address, timestamp, from, subject)| MailSummaryRow {
                    owner_id,
                    alias_address,
                    timestamp,
                    from,
                    subject,
                },
            )
            .collect())
    }
}

#[async_trait]
impl MailStore for SqliteMailStore {
    async fn insert_mail_summary(&self, row: &MailSummaryRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO mails (owner_id, alias_address, date_ts, from_addr, subject)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&row.owner_id)
        .bind(&row.alias_address)
        .bind(row.timestamp)
        .bind(&row.from)
        .bind(&row.subject)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
