use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::store::{ns, Kv, KvSerde};

/// Entries kept by [`KvAudit`]; older ones are dropped.
pub const AUDIT_CAP: usize = 1_000;

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// RFC 3339 timestamp (UTC).
    pub at: String,
    /// Tablet id or `Schedule:<name>`.
    pub actor: String,
    /// e.g. `macro:execute`.
    pub action: String,
    /// e.g. the macro key.
    pub target: String,
    /// Short JSON summary of the request.
    pub request: String,
    /// Outcome text.
    pub result: String,
    /// Wall time of the operation.
    pub latency_ms: f64,
}

impl AuditEntry {
    /// Entry stamped with the current time.
    pub fn now(
        actor: impl Into<String>,
        action: impl Into<String>,
        target: impl Into<String>,
        request: impl Into<String>,
        result: impl Into<String>,
        latency_ms: f64,
    ) -> Self {
        Self {
            at: Utc::now().to_rfc3339(),
            actor: actor.into(),
            action: action.into(),
            target: target.into(),
            request: request.into(),
            result: result.into(),
            latency_ms,
        }
    }
}

/// Append-only audit log.
pub trait AuditSink: Send + Sync {
    /// Append one entry.
    fn record(&self, entry: AuditEntry) -> Result<()>;
    /// Newest-first listing.
    fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>>;
}

/// Audit log kept as a ring of `AUDIT_CAP` slots in the KV store, one entry
/// per key (`audit:<slot>`) plus a sequence counter (`audit:seq`).
pub struct KvAudit<K: Kv> {
    kv: K,
    lock: Mutex<()>,
}

impl<K: Kv> KvAudit<K> {
    /// Audit log stored under the `audit` namespace.
    pub fn new(kv: K) -> Self { Self { kv, lock: Mutex::new(()) } }

    fn seq(&self) -> Result<u64> {
        Ok(self.kv.get_t(&seq_key()).context("read audit sequence")?.unwrap_or(0))
    }
}

fn seq_key() -> Vec<u8> { ns("audit", "seq") }

fn slot_key(seq: u64) -> Vec<u8> { ns("audit", &(seq % AUDIT_CAP as u64).to_string()) }

impl<K: Kv> AuditSink for KvAudit<K> {
    fn record(&self, entry: AuditEntry) -> Result<()> {
        let _g = self.lock.lock().map_err(|_| anyhow::anyhow!("audit lock poisoned"))?;
        let seq = self.seq()?;
        self.kv.put_t(&slot_key(seq), &entry).context("write audit entry")?;
        self.kv.put_t(&seq_key(), &(seq + 1)).context("write audit sequence")
    }

    fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let next = self.seq()?;
        let oldest = next.saturating_sub(AUDIT_CAP as u64);
        let mut out = Vec::new();
        for seq in (oldest..next).rev().take(limit) {
            if let Some(entry) = self.kv.get_t(&slot_key(seq))? {
                out.push(entry);
            }
        }
        Ok(out)
    }
}
