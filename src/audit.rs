//! Audit log of orchestration steps, persisted and pushed live to subscribers.
//!
//! Every entry is written to the record store and then broadcast. The broadcast channel is
//! bounded per subscriber: when a subscriber falls behind by more than the configured
//! capacity, its oldest undelivered entries are dropped. Producers never wait on readers.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use crate::database::{RecordStore, RecordStoreExt, LOGS};
use crate::error::AuditError;
use crate::models::{LogEntry, LogStatus, Node};

pub struct AuditLog {
    store: Arc<dyn RecordStore>,
    // Ordered by creation; the lock is the single-writer gate for the store too.
    entries: Mutex<Vec<LogEntry>>,
    tx: broadcast::Sender<LogEntry>,
}

impl AuditLog {
    /// Load persisted entries and create the broadcaster.
    pub fn open(store: Arc<dyn RecordStore>, capacity: usize) -> anyhow::Result<Self> {
        let mut entries: Vec<LogEntry> = store.list_as(LOGS)?;
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tracing::info!("Loaded {} audit log entries", entries.len());

        let (tx, _) = broadcast::channel(capacity.max(1));
        Ok(Self {
            store,
            entries: Mutex::new(entries),
            tx,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LogEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn append(&self, entry: LogEntry) -> Result<LogEntry, AuditError> {
        let mut entries = self.lock();
        self.store.put_as(LOGS, &entry.id, &entry)?;
        entries.push(entry.clone());
        self.publish(&entry);
        Ok(entry)
    }

    /// Open a `running` entry for a command about to be dispatched to `node`.
    pub fn start(&self, node: &Node, operation: &str, command: &str) -> Result<LogEntry, AuditError> {
        let now = Utc::now();
        self.append(LogEntry {
            id: Uuid::new_v4().to_string(),
            node_id: node.id.clone(),
            node_name: node.name.clone(),
            operation: operation.to_string(),
            command: command.to_string(),
            output: String::new(),
            status: LogStatus::Running,
            created_at: now,
            updated_at: now,
        })
    }

    /// Move a running entry to its terminal status. Terminal entries never change again.
    pub fn update_status(
        &self,
        id: &str,
        status: LogStatus,
        output: &str,
    ) -> Result<LogEntry, AuditError> {
        if !status.is_terminal() {
            return Err(AuditError::NotTerminal);
        }

        let mut entries = self.lock();
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| AuditError::NotFound(id.to_string()))?;
        if !entry.status.can_transition_to(status) {
            return Err(AuditError::AlreadyTerminal {
                id: id.to_string(),
                status: format!("{:?}", entry.status).to_lowercase(),
            });
        }

        let mut updated = entry.clone();
        updated.status = status;
        updated.output = output.to_string();
        updated.updated_at = Utc::now();
        self.store.put_as(LOGS, id, &updated)?;
        *entry = updated.clone();

        self.publish(&updated);
        Ok(updated)
    }

    pub fn get(&self, id: &str) -> Option<LogEntry> {
        self.lock().iter().find(|e| e.id == id).cloned()
    }

    pub fn list(&self) -> Vec<LogEntry> {
        self.lock().clone()
    }

    pub fn list_by_node(&self, node_id: &str) -> Vec<LogEntry> {
        self.lock()
            .iter()
            .filter(|e| e.node_id == node_id)
            .cloned()
            .collect()
    }

    pub fn clear(&self) -> Result<(), AuditError> {
        let mut entries = self.lock();
        self.store.clear(LOGS)?;
        entries.clear();
        Ok(())
    }

    pub fn subscribe(&self) -> LogSubscription {
        LogSubscription {
            rx: self.tx.subscribe(),
            dropped: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn publish(&self, entry: &LogEntry) {
        // Err only means nobody is listening.
        let _ = self.tx.send(entry.clone());
    }
}

/// One observer's view of the live stream.
pub struct LogSubscription {
    rx: broadcast::Receiver<LogEntry>,
    dropped: u64,
}

impl LogSubscription {
    /// Next entry, skipping past anything dropped while this subscriber lagged.
    /// Returns `None` once the log is gone.
    pub async fn next(&mut self) -> Option<LogEntry> {
        loop {
            match self.rx.recv().await {
                Ok(entry) => return Some(entry),
                Err(RecvError::Lagged(n)) => {
                    self.dropped += n;
                    tracing::warn!("log subscriber lagged, dropped {} oldest entries", n);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Entries this subscriber has missed so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
