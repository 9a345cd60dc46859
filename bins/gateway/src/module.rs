use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::app::Gateway;

/// Shared services plus the shutdown signal every module watches.
#[derive(Clone)]
pub struct ModuleCtx {
    pub gw: Arc<Gateway>,
    pub shutdown: tokio::sync::watch::Receiver<bool>,
}

/// A long-lived task owned by the daemon.
pub trait Module: Send + 'static {
    fn name(&self) -> &'static str;
    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>>;
}
