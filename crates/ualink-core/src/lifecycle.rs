// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Ordered startup and shutdown coordination.
//!
//! [`LifecycleManager`] sequences the startup and teardown of stateful
//! components together with free-standing tasks. Registration returns a
//! [`LifecycleHandle`] regardless of what was registered, so a component and a
//! bare task are removed the same way.
//!
//! ```text
//! startup():   A.on_startup -> task1 -> B.on_startup        (registration order)
//! shutdown():  Linear  -> A.on_shutdown -> task2 -> B.on_shutdown
//!              Inverse -> B.on_shutdown -> task2 -> A.on_shutdown
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use ualink_core::lifecycle::{LifecycleManager, ShutdownOrder};
//!
//! let manager = LifecycleManager::new(ShutdownOrder::Inverse);
//! let handle = manager.add_shutdown_task(|| async { tracing::info!("bye") });
//! manager.remove_lifecycle(handle);
//! manager.shutdown().await; // nothing runs
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

// =============================================================================
// Lifecycle Trait
// =============================================================================

/// A component with startup and shutdown hooks.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        "lifecycle"
    }

    /// Called during [`LifecycleManager::startup`].
    async fn on_startup(&self);

    /// Called during [`LifecycleManager::shutdown`].
    async fn on_shutdown(&self);
}

// =============================================================================
// Shutdown Order
// =============================================================================

/// Order in which shutdown actions run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownOrder {
    /// Registration order.
    #[default]
    Linear,
    /// Reverse registration order.
    Inverse,
}

impl fmt::Display for ShutdownOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linear => write!(f, "linear"),
            Self::Inverse => write!(f, "inverse"),
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Removable registration handle shared by lifecycles and tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LifecycleHandle(u64);

impl LifecycleHandle {
    /// Returns the raw registration id.
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LifecycleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lifecycle-{}", self.0)
    }
}

type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
enum Action {
    Lifecycle(Arc<dyn Lifecycle>),
    Startup(TaskFn),
    Shutdown(TaskFn),
}

impl Action {
    fn label(&self) -> String {
        match self {
            Self::Lifecycle(l) => l.name().to_string(),
            Self::Startup(_) => "startup-task".to_string(),
            Self::Shutdown(_) => "shutdown-task".to_string(),
        }
    }
}

#[derive(Clone)]
struct Registration {
    handle: LifecycleHandle,
    action: Action,
}

// =============================================================================
// LifecycleManager
// =============================================================================

/// Coordinates ordered startup and shutdown.
///
/// The shutdown order is fixed at construction. Actions registered or
/// removed while `startup()`/`shutdown()` is running take effect on the next
/// run.
pub struct LifecycleManager {
    order: ShutdownOrder,
    registrations: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl LifecycleManager {
    /// Creates a manager with the given shutdown order.
    pub fn new(order: ShutdownOrder) -> Self {
        Self {
            order,
            registrations: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Returns the configured shutdown order.
    pub fn shutdown_order(&self) -> ShutdownOrder {
        self.order
    }

    /// Registers a component whose hooks run at startup and shutdown.
    pub fn add_lifecycle(&self, lifecycle: Arc<dyn Lifecycle>) -> LifecycleHandle {
        self.register(Action::Lifecycle(lifecycle))
    }

    /// Registers a task that runs at startup.
    pub fn add_startup_task<F, Fut>(&self, task: F) -> LifecycleHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(Action::Startup(Arc::new(move || task().boxed())))
    }

    /// Registers a task that runs at shutdown.
    pub fn add_shutdown_task<F, Fut>(&self, task: F) -> LifecycleHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(Action::Shutdown(Arc::new(move || task().boxed())))
    }

    /// Removes a registration. Returns `false` if the handle is unknown.
    pub fn remove_lifecycle(&self, handle: LifecycleHandle) -> bool {
        let mut registrations = self.registrations.write();
        let before = registrations.len();
        registrations.retain(|r| r.handle != handle);
        let removed = registrations.len() != before;

        if removed {
            tracing::trace!(handle = %handle, "Lifecycle registration removed");
        }
        removed
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.registrations.read().len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.registrations.read().is_empty()
    }

    /// Runs every startup action in registration order.
    pub async fn startup(&self) {
        let snapshot = self.registrations.read().clone();
        tracing::debug!(registrations = snapshot.len(), "Running lifecycle startup");

        for registration in snapshot {
            match &registration.action {
                Action::Lifecycle(lifecycle) => lifecycle.on_startup().await,
                Action::Startup(task) => task().await,
                Action::Shutdown(_) => continue,
            }
            tracing::trace!(
                handle = %registration.handle,
                action = %registration.action.label(),
                "Startup action complete"
            );
        }
    }

    /// Runs every shutdown action in the configured order.
    pub async fn shutdown(&self) {
        let mut snapshot: Vec<Registration> = self
            .registrations
            .read()
            .iter()
            .filter(|r| !matches!(r.action, Action::Startup(_)))
            .cloned()
            .collect();

        if self.order == ShutdownOrder::Inverse {
            snapshot.reverse();
        }

        tracing::debug!(
            registrations = snapshot.len(),
            order = %self.order,
            "Running lifecycle shutdown"
        );

        for registration in snapshot {
            match &registration.action {
                Action::Lifecycle(lifecycle) => lifecycle.on_shutdown().await,
                Action::Shutdown(task) => task().await,
                Action::Startup(_) => {}
            }
            tracing::trace!(
                handle = %registration.handle,
                action = %registration.action.label(),
                "Shutdown action complete"
            );
        }
    }

    fn register(&self, action: Action) -> LifecycleHandle {
        let handle = LifecycleHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::trace!(handle = %handle, action = %action.label(), "Lifecycle registered");
        self.registrations.write().push(Registration { handle, action });
        handle
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new(ShutdownOrder::default())
    }
}

impl fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("order", &self.order)
            .field("registrations", &self.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Lifecycle for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn on_startup(&self) {
            self.log.lock().push(format!("{}:start", self.name));
        }

        async fn on_shutdown(&self) {
            self.log.lock().push(format!("{}:stop", self.name));
        }
    }

    fn push_task(
        log: &Arc<Mutex<Vec<String>>>,
        label: &'static str,
    ) -> impl Fn() -> futures::future::Ready<()> + Send + Sync + 'static {
        let log = Arc::clone(log);
        move || {
            log.lock().push(label.to_string());
            futures::future::ready(())
        }
    }

    #[tokio::test]
    async fn test_inverse_shutdown_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = LifecycleManager::new(ShutdownOrder::Inverse);

        manager.add_shutdown_task(push_task(&log, "one"));
        manager.add_shutdown_task(push_task(&log, "two"));
        manager.add_shutdown_task(push_task(&log, "three"));

        manager.shutdown().await;
        assert_eq!(*log.lock(), vec!["three", "two", "one"]);
    }

    #[tokio::test]
    async fn test_default_shutdown_order_is_linear() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = LifecycleManager::default();
        assert_eq!(manager.shutdown_order(), ShutdownOrder::Linear);

        manager.add_shutdown_task(push_task(&log, "one"));
        manager.add_shutdown_task(push_task(&log, "two"));
        manager.add_shutdown_task(push_task(&log, "three"));

        manager.shutdown().await;
        assert_eq!(*log.lock(), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_removed_task_never_runs() {
        let count = Arc::new(AtomicUsize::new(0));
        let manager = LifecycleManager::new(ShutdownOrder::Inverse);

        let counter = Arc::clone(&count);
        let handle = manager.add_shutdown_task(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let counter = Arc::clone(&count);
        let startup = manager.add_startup_task(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert!(manager.remove_lifecycle(handle));
        assert!(manager.remove_lifecycle(startup));
        assert!(!manager.remove_lifecycle(handle));

        manager.startup().await;
        manager.shutdown().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_startup_runs_lifecycles_and_tasks_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = LifecycleManager::new(ShutdownOrder::Inverse);

        manager.add_lifecycle(Arc::new(Recorder {
            name: "session",
            log: Arc::clone(&log),
        }));
        manager.add_startup_task(push_task(&log, "task"));
        manager.add_lifecycle(Arc::new(Recorder {
            name: "publisher",
            log: Arc::clone(&log),
        }));

        manager.startup().await;
        assert_eq!(
            *log.lock(),
            vec!["session:start", "task", "publisher:start"]
        );

        log.lock().clear();
        manager.shutdown().await;
        assert_eq!(*log.lock(), vec!["publisher:stop", "session:stop"]);
    }

    #[tokio::test]
    async fn test_removed_lifecycle_skipped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = LifecycleManager::default();

        let handle = manager.add_lifecycle(Arc::new(Recorder {
            name: "gone",
            log: Arc::clone(&log),
        }));
        manager.add_lifecycle(Arc::new(Recorder {
            name: "kept",
            log: Arc::clone(&log),
        }));
        manager.remove_lifecycle(handle);

        manager.startup().await;
        manager.shutdown().await;
        assert_eq!(*log.lock(), vec!["kept:start", "kept:stop"]);
    }

    #[test]
    fn test_handles_are_unique() {
        let manager = LifecycleManager::default();
        let a = manager.add_startup_task(|| async {});
        let b = manager.add_shutdown_task(|| async {});
        assert_ne!(a, b);
        assert_eq!(manager.len(), 2);
        assert_eq!(a.to_string(), format!("lifecycle-{}", a.id()));
    }
}
