use std::time::Duration;

use chrono::Local;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::module::{Module, ModuleCtx};

/// Evaluates persisted schedules against the local clock every tick.
pub struct Scheduler {
    tick: Duration,
}

impl Scheduler {
    pub fn new(tick: Duration) -> Self {
        Self { tick: tick.max(Duration::from_secs(1)) }
    }
}

impl Module for Scheduler {
    fn name(&self) -> &'static str { "scheduler" }

    fn spawn(self: Box<Self>, mut ctx: ModuleCtx) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let mut tick = interval(self.tick);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(tick_secs = self.tick.as_secs(), "scheduler running");

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let now = Local::now().naive_local();
                        match ctx.gw.runner.tick(now) {
                            Ok(fired) if fired.is_empty() => debug!("nothing due"),
                            Ok(fired) => {
                                for f in fired {
                                    info!(schedule = f.schedule_id, macro_key = %f.macro_key, "launched");
                                }
                            }
                            Err(e) => warn!("schedule tick failed: {e}"),
                        }
                    }
                    changed = ctx.shutdown.changed() => {
                        if changed.is_err() || *ctx.shutdown.borrow() {
                            info!("scheduler stopping");
                            break;
                        }
                    }
                }
            }
            Ok(())
        })
    }
}
