//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `FileSystemAccess` using `tokio::fs`, rooted in the platform app directories
//! - `DeviceIdentity` persisted as a UUID next to the library database
//! - `NetworkMonitor` using a cached TCP connectivity probe
//!
//! The remote sync transport is always host-specific and has no desktop default.
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{DesktopDeviceIdentity, TokioFileSystem};
//!
//! #[tokio::main]
//! async fn main() -> bridge_traits::error::Result<()> {
//!     let fs = TokioFileSystem::new();
//!     let identity = DesktopDeviceIdentity::load_or_create(&fs).await?;
//!     // Use in core configuration
//!     Ok(())
//! }
//! ```

mod device;
mod filesystem;
mod network;

pub use device::DesktopDeviceIdentity;
pub use filesystem::TokioFileSystem;
pub use network::DesktopNetworkMonitor;
