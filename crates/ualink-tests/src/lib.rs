// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # ualink Integration Tests
//!
//! Integration tests for the ualink OPC UA client, run against an in-memory
//! server that implements the transport seam.
//!
//! ## Running Tests
//!
//! ```bash
//! # Run all integration tests
//! cargo test -p ualink-tests
//!
//! # Run specific test suite
//! cargo test -p ualink-tests --test integration_core
//! cargo test -p ualink-tests --test integration_session
//! cargo test -p ualink-tests --test integration_subscription
//! cargo test -p ualink-tests --test integration_recovery
//!
//! # Run with logs
//! RUST_LOG=ualink_client=trace cargo test -p ualink-tests -- --nocapture
//! ```
//!
//! ## Test Categories
//!
//! ### Core Tests (`integration_core.rs`)
//! - Lifecycle ordering
//! - Client handle allocation and wraparound
//! - Configuration files (TOML, JSON) and validation
//!
//! ### Session Tests (`integration_session.rs`)
//! - Concurrent first use creates exactly one session
//! - Session future stability across reactivation
//! - Keep-alive driven recovery, close and restart
//!
//! ### Subscription Tests (`integration_subscription.rs`)
//! - Data change delivery, ordering, republish and data loss
//! - Monitored item services and pipelining limits
//!
//! ### Recovery Tests (`integration_recovery.rs`)
//! - Channel loss with reactivation
//! - Server restart with transfer or recreation
//! - Retry and abandonment of recovery attempts

pub mod common;
