// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Common Test Utilities
//!
//! Shared test utilities, fixtures and helpers for the integration tests.
//!
//! ## Module Structure
//!
//! - `fixtures`: Well-known nodes, settings and configuration documents
//! - `builders`: Client/server pairs and notification messages
//! - `assertions`: Bounded waits and assertion helpers
//! - `mocks`: In-memory OPC UA server and recording listeners
//! - `harness`: Test harness with deadline and teardown

pub mod fixtures;
pub mod builders;
pub mod assertions;
pub mod mocks;
pub mod harness;

// Re-exports for convenience
pub use fixtures::*;
pub use builders::*;
pub use assertions::*;
pub use mocks::*;
pub use harness::*;

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Initialize test logging. Call this at the start of each test module.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("warn,ualink_client=debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Create a temporary directory for test data.
pub fn temp_test_dir(prefix: &str) -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir()
        .expect("Failed to create temp directory")
}
