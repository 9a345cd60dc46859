#![deny(missing_docs)]
//! gateway_core: macro engine and schedule runner for the building-control
//! gateway (catalog, dispatcher, executor, schedules, config, KV, logging).

/// Configuration helpers (AppId, dirs, load_or_init, etc.)
pub mod cfg;
/// Simple file-backed KV store with serde helpers.
pub mod store;
/// Tracing/log initialization helpers.
pub mod logx;
/// Engine error type and nesting ceiling.
pub mod error;
/// Catalog model and YAML loader.
pub mod macros;
/// Read-only macro lookup, validation and preview trees.
pub mod registry;
/// Device operations and back ends.
pub mod devices;
/// Step -> device operation dispatch.
pub mod dispatcher;
/// Macro execution with skip paths, failure policies and nesting.
pub mod executor;
/// Progress and notification fan-out.
pub mod progress;
/// Append-only audit log.
pub mod audit;
/// Persisted schedules and the minute runner.
pub mod schedule;

#[cfg(test)]
mod testkit;
