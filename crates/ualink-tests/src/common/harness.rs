// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Test Harness
//!
//! Runs an integration test against a fresh client/server pair under a
//! deadline, and disconnects the client afterwards.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use ualink_client::client::UaClient;

use super::builders::TestClientBuilder;
use super::mocks::MockServer;

// =============================================================================
// Test Harness
// =============================================================================

/// Configuration for the test harness.
#[derive(Debug, Clone)]
pub struct TestHarnessConfig {
    /// Name of the test (used for logging and temp directories).
    pub test_name: String,

    /// Timeout for the entire test.
    pub timeout: Duration,

    /// Whether to create a temp directory for the test.
    pub create_temp_dir: bool,

    /// Whether to enable tracing for the test.
    pub enable_tracing: bool,
}

impl Default for TestHarnessConfig {
    fn default() -> Self {
        Self {
            test_name: "unknown_test".to_string(),
            timeout: Duration::from_secs(30),
            create_temp_dir: false,
            enable_tracing: false,
        }
    }
}

impl TestHarnessConfig {
    /// Create a new config with a test name.
    pub fn new(test_name: impl Into<String>) -> Self {
        Self {
            test_name: test_name.into(),
            ..Default::default()
        }
    }

    /// Set the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Create a temp directory.
    pub fn with_temp_dir(mut self) -> Self {
        self.create_temp_dir = true;
        self
    }

    /// Enable tracing.
    pub fn with_tracing(mut self) -> Self {
        self.enable_tracing = true;
        self
    }
}

/// Resources provided by the test harness.
pub struct TestResources {
    /// Configuration used to create this harness.
    pub config: TestHarnessConfig,

    /// The in-memory server.
    pub server: Arc<MockServer>,

    /// The client under test.
    pub client: Arc<UaClient>,

    temp_dir: Option<TempDir>,
}

impl TestResources {
    /// Get the temp directory path.
    pub fn temp_path(&self) -> Option<PathBuf> {
        self.temp_dir.as_ref().map(|d| d.path().to_path_buf())
    }

    /// Create a file path in the temp directory.
    pub fn temp_file(&self, name: &str) -> Option<PathBuf> {
        self.temp_dir.as_ref().map(|d| d.path().join(name))
    }
}

/// The main test harness.
pub struct TestHarness {
    config: TestHarnessConfig,
    builder: TestClientBuilder,
}

impl TestHarness {
    /// Create a new test harness with a config.
    pub fn new(config: TestHarnessConfig) -> Self {
        Self {
            config,
            builder: TestClientBuilder::new(),
        }
    }

    /// Create a new test harness with a test name.
    pub fn with_name(test_name: impl Into<String>) -> Self {
        Self::new(TestHarnessConfig::new(test_name))
    }

    /// Customize the client/server pair.
    pub fn client(mut self, f: impl FnOnce(TestClientBuilder) -> TestClientBuilder) -> Self {
        self.builder = f(self.builder);
        self
    }

    /// Set up the test environment. Must be called inside a tokio runtime.
    pub fn setup(self) -> TestResources {
        if self.config.enable_tracing {
            super::init_test_logging();
        }

        let temp_dir = self.config.create_temp_dir.then(|| {
            tempfile::Builder::new()
                .prefix(&format!("ualink_test_{}_", self.config.test_name))
                .tempdir()
                .expect("Failed to create temp directory")
        });

        let fixture = self.builder.build();
        TestResources {
            config: self.config,
            server: fixture.server,
            client: Arc::new(fixture.client),
            temp_dir,
        }
    }

    /// Run a test with automatic setup and teardown.
    pub async fn run<F, Fut>(self, test_fn: F)
    where
        F: FnOnce(TestResources) -> Fut,
        Fut: Future<Output = ()>,
    {
        let timeout = self.config.timeout;
        let test_name = self.config.test_name.clone();
        let resources = self.setup();
        let client = resources.client.clone();

        let result = tokio::time::timeout(timeout, test_fn(resources)).await;

        let _ = client.disconnect().await;
        if result.is_err() {
            panic!("Test {} timed out after {:?}", test_name, timeout);
        }
    }
}
