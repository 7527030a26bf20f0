// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # ualink-core
//!
//! Protocol-agnostic building blocks shared by the ualink OPC UA client:
//!
//! - **Lifecycle**: ordered startup/shutdown of components and tasks
//! - **Handle**: wrapping client-handle allocation with collision avoidance
//! - **Backoff**: reconnect delay policies
//! - **Logging**: tracing subscriber bootstrap
//! - **Error**: core error type
//!
//! ## Example
//!
//! ```rust,ignore
//! use ualink_core::{ClientHandleSequence, LifecycleManager, ShutdownOrder};
//!
//! let lifecycle = LifecycleManager::new(ShutdownOrder::Inverse);
//! let handles = ClientHandleSequence::new();
//! let handle = handles.next_handle(|h| in_use.contains(&h))?;
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod backoff;
pub mod error;
pub mod handle;
pub mod lifecycle;
pub mod logging;

// =============================================================================
// Re-exports for convenience
// =============================================================================

pub use backoff::{
    BackoffConfig, BackoffKind, ExponentialBackoff, FixedDelay, NoRetry, ReconnectPolicy,
    RetryDecision,
};
pub use error::{CoreError, CoreResult};
pub use handle::ClientHandleSequence;
pub use lifecycle::{Lifecycle, LifecycleHandle, LifecycleManager, ShutdownOrder};
pub use logging::{init_logging, LogFormat};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
