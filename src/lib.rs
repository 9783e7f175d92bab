//! `ias` provisioning runtime.
//!
//! The root daemon (`iasd`) fetches a control manifest and runs its items in
//! three phases (`preflight`, `setupassistant`, `userland`). User-context
//! scripts are handed to the per-session agent (`iasagent`) over a loopback
//! channel so they never run as root.
//!
//! Invariants:
//! - manifest order is execution order; only adjacent items sharing a
//!   `parallel_group` run together, and a group drains before the next item
//! - at most `MaximumRedownloads + 1` transfers per item
//! - the download window is reset to its minimum at each phase boundary
//! - at most one agent session per daemon process

pub mod ipc;
pub mod item;
pub mod limiter;
pub mod logging;
pub mod manifest;
pub mod phase;
pub mod plan;
pub mod process;
pub mod receipt;
pub mod reporter;
pub mod run;
pub mod settings;
pub mod signing;
