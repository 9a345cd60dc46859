//! Shared fakes for unit tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use crate::audit::{AuditEntry, AuditSink};
use crate::devices::{DeviceBackend, DeviceOp, DeviceReply};

type Script = Box<dyn Fn(&DeviceOp, usize) -> Result<DeviceReply> + Send + Sync>;

/// Device back end driven by a closure. The closure sees the op and how many
/// times an equal op has been performed (1 on the first call).
pub struct FakeDevices {
    calls: Mutex<Vec<DeviceOp>>,
    script: Script,
}

impl FakeDevices {
    pub fn ok() -> Arc<Self> {
        Self::scripted(|_, _| Ok(DeviceReply::ok()))
    }

    pub fn scripted(f: impl Fn(&DeviceOp, usize) -> Result<DeviceReply> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self { calls: Mutex::new(Vec::new()), script: Box::new(f) })
    }

    pub fn calls(&self) -> Vec<DeviceOp> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: &DeviceOp) -> usize {
        self.calls.lock().unwrap().iter().filter(|o| *o == op).count()
    }
}

#[async_trait]
impl DeviceBackend for FakeDevices {
    async fn perform(&self, op: &DeviceOp) -> Result<DeviceReply> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(op.clone());
            calls.iter().filter(|o| *o == op).count()
        };
        (self.script)(op, n)
    }
}

/// Audit sink that refuses every write.
pub struct BrokenAudit;

impl AuditSink for BrokenAudit {
    fn record(&self, _: AuditEntry) -> Result<()> {
        Err(anyhow!("disk full"))
    }

    fn recent(&self, _: usize) -> Result<Vec<AuditEntry>> {
        Ok(Vec::new())
    }
}
