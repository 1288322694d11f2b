//! Workspace placeholder crate.
//!
//! This crate exists to expose shared feature flags that map to the individual
//! workspace crates. Host applications can depend on `setlist-sync-workspace`
//! and pick `desktop-shims` (default bridges from `bridge-desktop`) or
//! `mobile` (every bridge injected by the host) without wiring each crate
//! individually.

#[cfg(any(feature = "desktop-shims", feature = "mobile"))]
pub use core_service::{CoreError, CoreService};
