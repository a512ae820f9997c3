use std::time::Duration;

use moka::ops::compute::{CompResult, Op};
use moka::sync::Cache;

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{AliasMailbox, Mail};

pub const DEFAULT_ALIAS_TTL: Duration = Duration::from_secs(5 * 60);
pub const ALIAS_LOCAL_PART_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedAlias {
    pub owner_id: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxSnapshot {
    pub owner_id: String,
    pub address: String,
    pub mails: Vec<Mail>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("unknown or expired owner id: {0}")]
    UnknownOwner(String),

    #[error("mailbox for {0} has expired")]
    MailboxExpired(String),
}

impl QueryError {
    /// Numeric code reported to API clients.
    pub fn code(&self) -> u8 {
        match self {
            QueryError::MailboxExpired(_) => 1,
            QueryError::UnknownOwner(_) => 2,
        }
    }
}

/// Expiring alias state shared by ingestion and the alias API.
///
/// Three caches with the same time-to-live: owner id to alias, alias to owner
/// id, and alias to its recent mail. Writes restart an entry's expiry, reads
/// do not.
pub struct AliasDirectory {
    domain: String,
    aliases: Cache<String, String>,
    owners: Cache<String, String>,
    mailboxes: Cache<String, AliasMailbox>,
}

fn expiring_cache<V>(ttl: Duration) -> Cache<String, V>
where
    V: Clone + Send + Sync + 'static,
{
    Cache::builder().time_to_live(ttl).build()
}

impl AliasDirectory {
    pub fn new(domain: impl Into<String>, ttl: Duration) -> Self {
        Self {
            domain: domain.into(),
            aliases: expiring_cache(ttl),
            owners: expiring_cache(ttl),
            mailboxes: expiring_cache(ttl),
        }
    }

    pub fn issue(&self) -> IssuedAlias {
        let owner_id = uuid::Uuid::new_v4().to_string();
        let local: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(ALIAS_LOCAL_PART_LEN)
            .map(char::from)
            .collect();
        let address = format!("{}@{}", local, self.domain);

        self.aliases.insert(owner_id.clone(), address.clone());
        self.owners.insert(address.clone(), owner_id.clone());
        self.mailboxes
            .insert(address.clone(), AliasMailbox::new(&address, &owner_id));
        debug!(alias = %address, owner_id = %owner_id, "alias issued");
        IssuedAlias { owner_id, address }
    }

    /// Returns the alias mailbox for `owner_id` and restarts the expiry of
    /// all of its entries.
    pub fn query(&self, owner_id: &str) -> Result<MailboxSnapshot, QueryError> {
        let address = self
            .aliases
            .get(owner_id)
            .ok_or_else(|| QueryError::UnknownOwner(owner_id.to_string()))?;
        let refreshed = self
            .mailboxes
            .entry_by_ref(address.as_str())
            .and_compute_with(|entry| match entry {
                Some(entry) => Op::Put(entry.into_value()),
                None => Op::Nop,
            });
        let mails = match refreshed {
            CompResult::ReplacedWith(entry) => entry.into_value().mails,
            _ => return Err(QueryError::MailboxExpired(address)),
        };
        self.aliases.insert(owner_id.to_string(), address.clone());
        self.owners.insert(address.clone(), owner_id.to_string());
        Ok(MailboxSnapshot {
            owner_id: owner_id.to_string(),
            address,
            mails,
        })
    }

    pub fn owner_of(&self, address: &str) -> Option<String> {
        self.owners.get(address)
    }

    pub fn mailbox(&self, address: &str) -> Option<AliasMailbox> {
        self.mailboxes.get(address)
    }

    /// Appends `mail` to the mailbox of `address` as one atomic update.
    /// Returns false when the mailbox is unknown or expired.
    pub fn deliver(&self, address: &str, mail: Mail) -> bool {
        let result = self
            .mailboxes
            .entry_by_ref(address)
            .and_compute_with(|entry| match entry {
                Some(entry) => {
                    let mut mailbox = entry.into_value();
                    mailbox.push(mail);
                    Op::Put(mailbox)
                }
                None => Op::Nop,
            });
        matches!(result, CompResult::ReplacedWith(_))
    }

    /// Evicts expired entries from all three caches.
    pub fn purge_expired(&self) {
        self.aliases.run_pending_tasks();
        self.owners.run_pending_tasks();
        self.mailboxes.run_pending_tasks();
    }

    /// Number of live aliases, as of the last sweep.
    pub fn alias_count(&self) -> u64 {
        self.owners.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::{ALIAS_LOCAL_PART_LEN, AliasDirectory, DEFAULT_ALIAS_TTL, QueryError};
    use crate::Mail;

    fn mail_to(address: &str, timestamp: i64) -> Mail {
        Mail {
            to: address.to_string(),
            timestamp,
            ..Mail::default()
        }
    }

    #[test]
    fn issued_alias_uses_domain_and_random_local_part() {
        let directory = AliasDirectory::new("drop.example", DEFAULT_ALIAS_TTL);
        let issued = directory.issue();
        let (local, domain) = issued.address.split_once('@').unwrap();
        assert_eq!(domain, "drop.example");
        assert_eq!(local.len(), ALIAS_LOCAL_PART_LEN);
        assert!(local.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(uuid::Uuid::parse_str(&issued.owner_id).is_ok());

        assert_eq!(
            directory.owner_of(&issued.address),
            Some(issued.owner_id.clone())
        );
        let mailbox = directory.mailbox(&issued.address).unwrap();
        assert!(mailbox.mails.is_empty());
        assert_eq!(mailbox.owner_id, issued.owner_id);
    }

    #[test]
    fn query_returns_delivered_mail() {
        let directory = AliasDirectory::new("drop.example", DEFAULT_ALIAS_TTL);
        let issued = directory.issue();
        assert!(directory.deliver(&issued.address, mail_to(&issued.address, 5)));
        assert!(directory.deliver(&issued.address, mail_to(&issued.address, 9)));

        let snapshot = directory.query(&issued.owner_id).unwrap();
        assert_eq!(snapshot.address, issued.address);
        let stamps: Vec<i64> = snapshot.mails.iter().map(|m| m.timestamp).collect();
        assert_eq!(stamps, vec![9, 5]);
    }

    #[test]
    fn query_unknown_owner_reports_code_two() {
        let directory = AliasDirectory::new("drop.example", DEFAULT_ALIAS_TTL);
        let err = directory.query("nobody").unwrap_err();
        assert!(matches!(err, QueryError::UnknownOwner(_)));
        assert_eq!(err.code(), 2);
    }

    #[test]
    fn deliver_to_unknown_alias_is_rejected() {
        let directory = AliasDirectory::new("drop.example", DEFAULT_ALIAS_TTL);
        assert!(!directory.deliver("ghost@drop.example", mail_to("ghost@drop.example", 1)));
        assert!(directory.mailbox("ghost@drop.example").is_none());
    }

    #[test]
    fn query_keeps_alias_alive() {
        let directory = AliasDirectory::new("drop.example", Duration::from_millis(80));
        let issued = directory.issue();
        thread::sleep(Duration::from_millis(50));
        directory.query(&issued.owner_id).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(directory.query(&issued.owner_id).is_ok());
        thread::sleep(Duration::from_millis(100));
        assert!(directory.query(&issued.owner_id).is_err());
        assert!(directory.owner_of(&issued.address).is_none());
    }

    #[test]
    fn delivery_does_not_extend_owner_lookup() {
        let directory = AliasDirectory::new("drop.example", Duration::from_millis(200));
        let issued = directory.issue();
        thread::sleep(Duration::from_millis(120));
        assert_eq!(
            directory.owner_of(&issued.address),
            Some(issued.owner_id.clone())
        );
        assert!(directory.deliver(&issued.address, mail_to(&issued.address, 1)));
        thread::sleep(Duration::from_millis(120));
        assert!(directory.owner_of(&issued.address).is_none());
        assert!(directory.mailbox(&issued.address).is_some());
    }

    #[test]
    fn purge_removes_expired_aliases() {
        let directory = AliasDirectory::new("drop.example", Duration::from_millis(20));
        directory.issue();
        directory.issue();
        directory.purge_expired();
        assert_eq!(directory.alias_count(), 2);
        thread::sleep(Duration::from_millis(40));
        directory.purge_expired();
        assert_eq!(directory.alias_count(), 0);
    }

    #[test]
    fn concurrent_deliveries_are_not_lost() {
        let directory = Arc::new(AliasDirectory::new("drop.example", DEFAULT_ALIAS_TTL));
        let issued = directory.issue();
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let directory = Arc::clone(&directory);
                let address = issued.address.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        let ts = worker * 50 + i;
                        assert!(directory.deliver(&address, mail_to(&address, ts)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stamps: Vec<i64> = directory
            .mailbox(&issued.address)
            .unwrap()
            .mails
            .iter()
            .map(|m| m.timestamp)
            .collect();
        assert_eq!(stamps, (390..400).rev().collect::<Vec<i64>>());
    }
}
