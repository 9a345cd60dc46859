//! Persisted recurring schedules and the minute-resolution runner that fires
//! them.
//!
//! A schedule is due when it is enabled, today's weekday is in its day set,
//! the local wall clock reads its `HH:MM`, and it has not already fired in
//! this calendar minute. The minute stamp is written before the macro starts,
//! so two ticks inside the same minute run the macro once.

use chrono::{Datelike, Local, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::executor::{ExecutionContext, ExecutionResult, MacroExecutor};
use crate::store::{ns, Kv, KvSerde};

/// `last_fired` stamp format.
pub const MINUTE_FMT: &str = "%Y-%m-%d %H:%M";

/// Set of weekdays, 0 = Monday .. 6 = Sunday. Serialized as `"0,1,2"`.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Weekdays(u8);

impl Weekdays {
    /// Every day of the week.
    pub const ALL: Weekdays = Weekdays(0b111_1111);

    /// Is `day` in the set?
    pub fn contains(self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    /// Is the set empty?
    pub fn is_empty(self) -> bool { self.0 == 0 }
}

impl Default for Weekdays {
    fn default() -> Self { Self::ALL }
}

impl fmt::Debug for Weekdays {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Weekdays({self})")
    }
}

impl fmt::Display for Weekdays {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let days: Vec<String> = (0..7u8).filter(|d| self.0 & (1 << d) != 0).map(|d| d.to_string()).collect();
        f.write_str(&days.join(","))
    }
}

impl std::str::FromStr for Weekdays {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bits = 0u8;
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.parse::<u8>() {
                Ok(d) if d < 7 => bits |= 1 << d,
                _ => return Err(GatewayError::InvalidSchedule(format!("bad weekday `{part}` (0=Mon .. 6=Sun)"))),
            }
        }
        Ok(Weekdays(bits))
    }
}

impl TryFrom<String> for Weekdays {
    type Error = GatewayError;

    fn try_from(s: String) -> Result<Self, Self::Error> { s.parse() }
}

impl From<Weekdays> for String {
    fn from(d: Weekdays) -> String { d.to_string() }
}

/// A persisted recurring trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntity {
    /// Store-assigned id.
    pub id: u64,
    /// Display name; the run's actor is `Schedule:<name>`.
    pub name: String,
    /// Macro to run.
    #[serde(rename = "macro")]
    pub macro_key: String,
    /// Days it may fire on.
    pub days: Weekdays,
    /// Local `HH:MM`.
    pub time_of_day: String,
    /// Disabled schedules never fire.
    pub enabled: bool,
    /// `YYYY-MM-DD HH:MM` of the last fire.
    pub last_fired: Option<String>,
    /// RFC 3339 creation time.
    pub created: String,
}

/// Fields for a new schedule.
#[derive(Debug, Clone, Deserialize)]
pub struct NewSchedule {
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Macro key.
    #[serde(rename = "macro", default)]
    pub macro_key: String,
    /// Days; every day when absent.
    #[serde(default)]
    pub days: Weekdays,
    /// `HH:MM`; `08:00` when absent.
    #[serde(default = "default_time", alias = "time")]
    pub time_of_day: String,
    /// Enabled unless told otherwise.
    #[serde(default = "yes")]
    pub enabled: bool,
}

fn default_time() -> String { "08:00".to_string() }
fn yes() -> bool { true }

/// Partial update; absent fields stay as they are.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchedulePatch {
    /// New name.
    pub name: Option<String>,
    /// New macro key.
    #[serde(rename = "macro")]
    pub macro_key: Option<String>,
    /// New day set.
    pub days: Option<Weekdays>,
    /// New `HH:MM`.
    #[serde(alias = "time")]
    pub time_of_day: Option<String>,
    /// Enable/disable.
    pub enabled: Option<bool>,
}

/// Schedule persistence.
pub trait ScheduleStore: Send + Sync {
    /// All schedules ordered by time of day.
    fn list(&self) -> Result<Vec<ScheduleEntity>, GatewayError>;
    /// One schedule.
    fn get(&self, id: u64) -> Result<Option<ScheduleEntity>, GatewayError>;
    /// Validate and persist a new schedule.
    fn create(&self, new: NewSchedule) -> Result<ScheduleEntity, GatewayError>;
    /// Apply a patch.
    fn update(&self, id: u64, patch: SchedulePatch) -> Result<ScheduleEntity, GatewayError>;
    /// Remove a schedule.
    fn delete(&self, id: u64) -> Result<(), GatewayError>;
    /// Stamp `minute` as the last fire. Returns `false` if it already was,
    /// which makes the check-and-set atomic across concurrent ticks.
    fn mark_fired(&self, id: u64, minute: &str) -> Result<bool, GatewayError>;
}

/// Validate and zero-pad `HH:MM` (`8:05` becomes `08:05`).
pub fn parse_time_of_day(s: &str) -> Result<String, GatewayError> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .map(|t| t.format("%H:%M").to_string())
        .map_err(|_| GatewayError::InvalidSchedule(format!("bad time `{s}` (want HH:MM)")))
}

fn require_name(name: &str) -> Result<String, GatewayError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(GatewayError::InvalidSchedule("name is required".into()));
    }
    Ok(name.to_string())
}

fn require_days(days: Weekdays) -> Result<Weekdays, GatewayError> {
    if days.is_empty() {
        return Err(GatewayError::InvalidSchedule("days must name at least one weekday".into()));
    }
    Ok(days)
}

fn require_macro(key: &str) -> Result<String, GatewayError> {
    let key = key.trim();
    if key.is_empty() {
        return Err(GatewayError::InvalidSchedule("macro is required".into()));
    }
    Ok(key.to_string())
}

/* --------------------- KvScheduleStore --------------------- */

/// Schedules in the KV store: one record per id plus an id registry.
pub struct KvScheduleStore<K: Kv> {
    kv: K,
    lock: Mutex<()>,
}

fn ids_key() -> Vec<u8> { ns("schedules", "registry") }
fn next_id_key() -> Vec<u8> { ns("schedules", "next_id") }
fn record_key(id: u64) -> Vec<u8> { ns("schedules", &id.to_string()) }

impl<K: Kv> KvScheduleStore<K> {
    /// Store over `kv`.
    pub fn new(kv: K) -> Self { Self { kv, lock: Mutex::new(()) } }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>, GatewayError> {
        self.lock.lock().map_err(|_| GatewayError::Store(anyhow::anyhow!("schedule lock poisoned")))
    }

    fn ids(&self) -> Result<Vec<u64>, GatewayError> {
        Ok(self.kv.get_t(&ids_key())?.unwrap_or_default())
    }

    fn load(&self, id: u64) -> Result<Option<ScheduleEntity>, GatewayError> {
        Ok(self.kv.get_t(&record_key(id))?)
    }
}

impl<K: Kv> ScheduleStore for KvScheduleStore<K> {
    fn list(&self) -> Result<Vec<ScheduleEntity>, GatewayError> {
        let mut out = Vec::new();
        for id in self.ids()? {
            match self.load(id)? {
                Some(s) => out.push(s),
                None => warn!(id, "schedule in registry but missing record"),
            }
        }
        out.sort_by(|a, b| a.time_of_day.cmp(&b.time_of_day).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    fn get(&self, id: u64) -> Result<Option<ScheduleEntity>, GatewayError> {
        self.load(id)
    }

    fn create(&self, new: NewSchedule) -> Result<ScheduleEntity, GatewayError> {
        let entity = ScheduleEntity {
            id: 0,
            name: require_name(&new.name)?,
            macro_key: require_macro(&new.macro_key)?,
            days: require_days(new.days)?,
            time_of_day: parse_time_of_day(&new.time_of_day)?,
            enabled: new.enabled,
            last_fired: None,
            created: Local::now().to_rfc3339(),
        };

        let _g = self.guard()?;
        let id = self.kv.get_t::<u64>(&next_id_key())?.unwrap_or(1);
        let entity = ScheduleEntity { id, ..entity };
        self.kv.put_t(&record_key(id), &entity)?;
        let mut ids = self.ids()?;
        ids.push(id);
        self.kv.put_t(&ids_key(), &ids)?;
        self.kv.put_t(&next_id_key(), &(id + 1))?;
        info!(id, name = %entity.name, macro_key = %entity.macro_key, "schedule created");
        Ok(entity)
    }

    fn update(&self, id: u64, patch: SchedulePatch) -> Result<ScheduleEntity, GatewayError> {
        let _g = self.guard()?;
        let mut s = self.load(id)?.ok_or(GatewayError::ScheduleNotFound(id))?;
        if let Some(name) = patch.name {
            s.name = require_name(&name)?;
        }
        if let Some(key) = patch.macro_key {
            s.macro_key = require_macro(&key)?;
        }
        if let Some(days) = patch.days {
            s.days = require_days(days)?;
        }
        if let Some(t) = patch.time_of_day {
            s.time_of_day = parse_time_of_day(&t)?;
        }
        if let Some(enabled) = patch.enabled {
            s.enabled = enabled;
        }
        self.kv.put_t(&record_key(id), &s)?;
        Ok(s)
    }

    fn delete(&self, id: u64) -> Result<(), GatewayError> {
        let _g = self.guard()?;
        if !self.kv.delete(&record_key(id))? {
            return Err(GatewayError::ScheduleNotFound(id));
        }
        let mut ids = self.ids()?;
        ids.retain(|i| *i != id);
        self.kv.put_t(&ids_key(), &ids)?;
        info!(id, "schedule deleted");
        Ok(())
    }

    fn mark_fired(&self, id: u64, minute: &str) -> Result<bool, GatewayError> {
        let _g = self.guard()?;
        let mut s = self.load(id)?.ok_or(GatewayError::ScheduleNotFound(id))?;
        if s.last_fired.as_deref() == Some(minute) {
            return Ok(false);
        }
        s.last_fired = Some(minute.to_string());
        self.kv.put_t(&record_key(id), &s)?;
        Ok(true)
    }
}

/* --------------------- ScheduleRunner --------------------- */

/// A schedule the runner just launched.
pub struct Fired {
    /// Schedule id.
    pub schedule_id: u64,
    /// Macro started.
    pub macro_key: String,
    /// The detached run.
    pub handle: JoinHandle<Result<ExecutionResult, GatewayError>>,
}

/// Evaluates schedules against the clock and launches due macros.
#[derive(Clone)]
pub struct ScheduleRunner {
    store: Arc<dyn ScheduleStore>,
    executor: Arc<MacroExecutor>,
}

impl ScheduleRunner {
    /// Runner over `store`, executing with `executor`.
    pub fn new(store: Arc<dyn ScheduleStore>, executor: Arc<MacroExecutor>) -> Self {
        Self { store, executor }
    }

    /// Schedules due at `now` (local wall clock).
    pub fn due(&self, now: NaiveDateTime) -> Result<Vec<ScheduleEntity>, GatewayError> {
        let hhmm = now.format("%H:%M").to_string();
        let minute = now.format(MINUTE_FMT).to_string();
        let weekday = now.weekday();
        Ok(self
            .store
            .list()?
            .into_iter()
            .filter(|s| s.enabled && s.days.contains(weekday) && s.time_of_day == hhmm)
            .filter(|s| s.last_fired.as_deref() != Some(minute.as_str()))
            .collect())
    }

    /// Fire everything due at `now`. Runs are detached: this returns as soon
    /// as they are spawned, and one schedule's trouble never stops the rest.
    pub fn tick(&self, now: NaiveDateTime) -> Result<Vec<Fired>, GatewayError> {
        let minute = now.format(MINUTE_FMT).to_string();
        let mut fired = Vec::new();
        for s in self.due(now)? {
            match self.store.mark_fired(s.id, &minute) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(id = s.id, "could not stamp schedule, not firing: {e}");
                    continue;
                }
            }
            info!(id = s.id, name = %s.name, macro_key = %s.macro_key, "schedule fired");
            let executor = self.executor.clone();
            let ctx = ExecutionContext::new(format!("Schedule:{}", s.name));
            let key = s.macro_key.clone();
            let handle = tokio::spawn(async move {
                let res = executor.execute(&key, &ctx).await.and_then(ExecutionResult::into_result);
                match &res {
                    Ok(r) => info!(macro_key = %key, actor = %ctx.actor, steps = r.steps_completed, "scheduled run ok"),
                    Err(e) if e.is_structural() && e.partial_result().is_none() => warn!(macro_key = %key, actor = %ctx.actor, "scheduled run refused: {e}"),
                    Err(e) => warn!(macro_key = %key, actor = %ctx.actor, "scheduled run failed: {e}"),
                }
                res
            });
            fired.push(Fired { schedule_id: s.id, macro_key: s.macro_key, handle });
        }
        Ok(fired)
    }
}
