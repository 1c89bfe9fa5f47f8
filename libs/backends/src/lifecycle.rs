//! Ordered teardown of everything a backend opened
//!
//! Adapters push each resource onto a [`HandleStack`] as soon as it is open.
//! Closing walks the stack in reverse, keeps going past failures and reports
//! the first one. A stack that has been closed is empty, so closing again is
//! a no-op.

use crate::BackendError;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long a background task gets to stop before it is aborted
pub const TASK_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Something a backend must release on close
#[async_trait]
pub trait Handle: Send + Sync {
    /// Short name used in logs and close errors
    fn label(&self) -> &'static str;

    async fn close(&mut self) -> Result<(), BackendError>;
}

pub struct HandleStack {
    backend: &'static str,
    handles: Vec<Box<dyn Handle>>,
}

impl HandleStack {
    pub fn new(backend: &'static str) -> Self {
        Self {
            backend,
            handles: Vec::new(),
        }
    }

    pub fn push(&mut self, handle: impl Handle + 'static) {
        debug!(backend = self.backend, handle = handle.label(), "Registered handle");
        self.handles.push(Box::new(handle));
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Close every handle, newest first
    pub async fn close_all(&mut self) -> Result<(), BackendError> {
        let mut first_error = None;

        while let Some(mut handle) = self.handles.pop() {
            match handle.close().await {
                Ok(()) => debug!(backend = self.backend, handle = handle.label(), "Closed handle"),
                Err(e) => {
                    warn!(
                        backend = self.backend,
                        handle = handle.label(),
                        error = %e,
                        "Failed to close handle"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for HandleStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<_> = self.handles.iter().map(|h| h.label()).collect();
        f.debug_struct("HandleStack")
            .field("backend", &self.backend)
            .field("handles", &labels)
            .finish()
    }
}

/// A spawned background task stopped through its shutdown token
pub struct TaskHandle {
    label: &'static str,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TaskHandle {
    pub fn new(label: &'static str, shutdown: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            label,
            shutdown,
            task: Some(task),
        }
    }
}

#[async_trait]
impl Handle for TaskHandle {
    fn label(&self) -> &'static str {
        self.label
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        self.shutdown.cancel();

        // The task stays owned by self while joining, so a dropped close still aborts it
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let joined = tokio::time::timeout(TASK_SHUTDOWN_GRACE, task).await;
        let task = self.task.take();

        match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BackendError::close(self.label, e)),
            Err(_) => {
                if let Some(task) = task {
                    task.abort();
                }
                Err(BackendError::close(
                    self.label,
                    format!("task did not stop within {:?}", TASK_SHUTDOWN_GRACE),
                ))
            }
        }
    }
}

/// A handle dropped without close still stops its task
impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            debug!(handle = self.label, "Task handle dropped without close, aborting task");
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Recorded {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl Handle for Recorded {
        fn label(&self) -> &'static str {
            self.label
        }

        async fn close(&mut self) -> Result<(), BackendError> {
            self.log.lock().unwrap().push(self.label);
            if self.fail {
                return Err(BackendError::close(self.label, "refused"));
            }
            Ok(())
        }
    }

    fn stack_with(log: &Arc<Mutex<Vec<&'static str>>>, failing: &[&'static str]) -> HandleStack {
        let mut stack = HandleStack::new("test");
        for label in ["connection", "heartbeat", "session"] {
            stack.push(Recorded {
                label,
                log: log.clone(),
                fail: failing.contains(&label),
            });
        }
        stack
    }

    #[tokio::test]
    async fn test_close_runs_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stack = stack_with(&log, &[]);

        stack.close_all().await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["session", "heartbeat", "connection"]);
        assert!(stack.is_empty());
    }

    #[tokio::test]
    async fn test_close_continues_past_failures_and_reports_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stack = stack_with(&log, &["heartbeat", "connection"]);

        let err = stack.close_all().await.unwrap_err();

        assert!(matches!(err, BackendError::Close { handle: "heartbeat", .. }));
        assert_eq!(log.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_dropped_stack_stops_tasks() {
        let (alive_tx, mut alive) = tokio::sync::mpsc::channel::<()>(1);
        let task = tokio::spawn(async move {
            let _alive = alive_tx;
            std::future::pending::<()>().await
        });

        let mut stack = HandleStack::new("test");
        stack.push(TaskHandle::new("driver", CancellationToken::new(), task));
        drop(stack);

        // the sender goes away only once the task future is dropped
        let stopped = tokio::time::timeout(Duration::from_secs(1), alive.recv()).await;
        assert!(matches!(stopped, Ok(None)));
    }

    #[tokio::test]
    async fn test_dropped_handle_cancels_shutdown() {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async {});

        drop(TaskHandle::new("heartbeat", shutdown, task));
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_empty_stack_closes() {
        let mut stack = HandleStack::new("test");
        assert!(tokio_test::block_on(stack.close_all()).is_ok());
    }

    #[tokio::test]
    async fn test_close_twice_is_noop() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stack = stack_with(&log, &[]);

        stack.close_all().await.unwrap();
        stack.close_all().await.unwrap();

        assert_eq!(log.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_task_handle_stops_task() {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move { token.cancelled().await });

        let mut handle = TaskHandle::new("driver", shutdown, task);
        handle.close().await.unwrap();
        handle.close().await.unwrap();
    }
}
