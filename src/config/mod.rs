//! Read-only configuration: server settings, scoring rules, client SLAs,
//! task type templates, backend credentials, and scheduler cadences.
//!
//! Loaded once at startup from `task-relay.yaml` (or `--config`), with
//! secrets resolved from environment variables.

mod loader;
mod types;

pub use types::*;
