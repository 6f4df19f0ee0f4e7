//! regmux — a device-mediation runtime.
//!
//! User-space clients submit ordered register-I/O programs ("io-entries")
//! against heterogeneous devices, observe completion and periodic events
//! coming back, and gate deferred programs on trigger conditions: boolean
//! combinations of event-counter predicates and fence predicates.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Command channel                         │
//! │  Typed packets: submit, cancel, events, buffers, lifecycle   │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Client scheduler           │  Trigger engine                │
//! │  per-client worker, drain:  │  AND/OR/NONE over event and    │
//! │  cleanup → txns → periodic  │  fence predicates              │
//! ├─────────────────────────────┴────────────────────────────────┤
//! │  Bus managers (one worker per shared bus, FIFO of clients)   │
//! ├──────────────────────────────────────────────────────────────┤
//! │  IoEntry executor against each device's RegisterIo           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use regmux::config::RuntimeConfig;
//! use regmux::device::{DeviceConfig, DeviceKind, NullDeviceOps, TestRegisterIo};
//! use regmux::io_entry::IoEntry;
//! use regmux::runtime::Runtime;
//! use regmux::transaction::TransactionInfo;
//! use std::sync::Arc;
//!
//! let runtime = Runtime::new(RuntimeConfig::default());
//! runtime.register_device(
//!     DeviceConfig::new(1, "sensor0", DeviceKind::Test),
//!     Some(Arc::new(TestRegisterIo::new())),
//!     Arc::new(NullDeviceOps),
//! )?;
//!
//! let client = runtime.open_client(1)?;
//! client.enable_device().await?;
//! client.submit_transaction(TransactionInfo::immediate(vec![IoEntry::Write {
//!     offset: 0x100,
//!     value: 0xDEAD,
//! }]))?;
//! ```

pub mod buffer;
pub mod bus;
pub mod client;
pub mod command;
pub mod config;
pub mod device;
pub mod dpm;
pub mod error;
pub mod event;
pub mod executor;
pub mod fence;
pub mod io_entry;
pub mod logging;
pub mod periodic;
pub mod runtime;
pub mod time;
pub mod transaction;
pub mod trigger;

pub(crate) mod sync;

/// Version of the regmux library and CLI.
///
/// Synchronized across the workspace; defined in `Cargo.toml` and injected
/// at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
