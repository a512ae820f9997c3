use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tempbox_core::{AliasDirectory, Mail, MailStore, MailSummaryRow};

use super::IngestError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered { owner_id: String },
    /// Recipient has no live alias entry; the mail was dropped.
    UnknownAlias,
}

/// Routes parsed mail into alias mailboxes and records a summary row.
#[derive(Clone)]
pub struct Dispatcher {
    directory: Arc<AliasDirectory>,
    store: Arc<dyn MailStore>,
}

impl Dispatcher {
    pub fn new(directory: Arc<AliasDirectory>, store: Arc<dyn MailStore>) -> Self {
        Self { directory, store }
    }

    pub async fn dispatch(&self, mail: Mail) -> DispatchOutcome {
        let Some(owner_id) = self.directory.owner_of(&mail.to) else {
            debug!(to = %mail.to, "no alias for recipient, dropping mail");
            return DispatchOutcome::UnknownAlias;
        };
        let row = MailSummaryRow::from_mail(&owner_id, &mail);
        let to = mail.to.clone();
        if !self.directory.deliver(&to, mail) {
            debug!(to = %to, "alias mailbox expired, dropping mail");
            return DispatchOutcome::UnknownAlias;
        }
        debug!(to = %to, owner_id = %owner_id, "mail delivered");

        if let Err(err) = self.store.insert_mail_summary(&row).await {
            let err = IngestError::Persistence(err.to_string());
            warn!(to = %to, error = %err, "mail summary not persisted");
        }
        DispatchOutcome::Delivered { owner_id }
    }

    /// Consumes `rx` one mail at a time until every sender is gone.
    pub fn spawn(self, mut rx: mpsc::Receiver<Mail>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(mail) = rx.recv().await {
                self.dispatch(mail).await;
            }
            debug!("dispatch queue closed");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use tempbox_core::{AliasDirectory, DEFAULT_ALIAS_TTL, Mail, MailStore, MailSummaryRow};

    use super::{DispatchOutcome, Dispatcher};

    #[derive(Default)]
    struct RecordingStore {
        rows: Mutex<Vec<MailSummaryRow>>,
    }

    #[async_trait]
    impl MailStore for RecordingStore {
        async fn insert_mail_summary(&self, row: &MailSummaryRow) -> Result<()> {
            self.rows.lock().unwrap().push(row.clone());
            Ok(())
        }
    }

    struct FailingStore;

    #[async_trait]
    impl MailStore for FailingStore {
        async fn insert_mail_summary(&self, _row: &MailSummaryRow) -> Result<()> {
            Err(anyhow!("database is locked"))
        }
    }

    fn mail(to: &str, timestamp: i64) -> Mail {
        Mail {
            from: "sender@example.com".to_string(),
            to: to.to_string(),
            timestamp,
            subject: format!("t{}", timestamp),
            ..Mail::default()
        }
    }

    #[tokio::test]
    async fn delivers_to_known_alias_and_persists_summary() {
        let directory = Arc::new(AliasDirectory::new("drop.example", DEFAULT_ALIAS_TTL));
        let store = Arc::new(RecordingStore::default());
        let alias = directory.issue();
        let dispatcher = Dispatcher::new(directory.clone(), store.clone());

        let outcome = dispatcher.dispatch(mail(&alias.address, 7)).await;

        assert_eq!(
            outcome,
            DispatchOutcome::Delivered {
                owner_id: alias.owner_id.clone()
            }
        );
        let mailbox = directory.mailbox(&alias.address).unwrap();
        assert_eq!(mailbox.mails.len(), 1);
        let rows = store.rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].owner_id, alias.owner_id);
        assert_eq!(rows[0].alias_address, alias.address);
        assert_eq!(rows[0].subject, "t7");
    }

    #[tokio::test]
    async fn unknown_alias_is_dropped_silently() {
        let directory = Arc::new(AliasDirectory::new("drop.example", DEFAULT_ALIAS_TTL));
        let store = Arc::new(RecordingStore::default());
        let alias = directory.issue();
        let dispatcher = Dispatcher::new(directory.clone(), store.clone());

        let outcome = dispatcher.dispatch(mail("stranger@drop.example", 1)).await;

        assert_eq!(outcome, DispatchOutcome::UnknownAlias);
        assert!(directory.mailbox(&alias.address).unwrap().mails.is_empty());
        assert!(directory.mailbox("stranger@drop.example").is_none());
        assert!(store.rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn persistence_failure_does_not_block_delivery() {
        let directory = Arc::new(AliasDirectory::new("drop.example", DEFAULT_ALIAS_TTL));
        let alias = directory.issue();
        let dispatcher = Dispatcher::new(directory.clone(), Arc::new(FailingStore));

        let outcome = dispatcher.dispatch(mail(&alias.address, 3)).await;

        assert!(matches!(outcome, DispatchOutcome::Delivered { .. }));
        assert_eq!(directory.mailbox(&alias.address).unwrap().mails.len(), 1);
    }

    #[tokio::test]
    async fn worker_drains_queue_into_bounded_mailbox() {
        let directory = Arc::new(AliasDirectory::new("drop.example", DEFAULT_ALIAS_TTL));
        let store = Arc::new(RecordingStore::default());
        let alias = directory.issue();
        let (tx, rx) = mpsc::channel(1);
        let worker = Dispatcher::new(directory.clone(), store.clone()).spawn(rx);

        for ts in [5, 1, 12, 3, 8, 11, 2, 9, 4, 10, 6, 7] {
            tx.send(mail(&alias.address, ts)).await.unwrap();
        }
        drop(tx);
        worker.await.unwrap();

        let stamps: Vec<i64> = directory
            .mailbox(&alias.address)
            .unwrap()
            .mails
            .iter()
            .map(|m| m.timestamp)
            .collect();
        assert_eq!(stamps, vec![12, 11, 10, 9, 8, 7, 6, 5, 4, 3]);
        assert_eq!(store.rows.lock().unwrap().len(), 12);
    }
}
