//! Per-task workflow value and single-shot responder

use serde_json::Value;
use taskstore::RequestOptions;
use tokio::sync::oneshot;
use tracing::debug;

use crate::declaration::Envelope;
use crate::device::ConnectionInfo;
use crate::view::TaskView;

/// Everything one task's workflow carries from step to step
///
/// The task ledger holds the recorded outcome; this holds the working data
/// that must not be persisted (the unmasked declaration, credentials).
#[derive(Debug, Clone)]
pub struct Workflow {
    pub task_id: String,
    pub envelope: Envelope,
    pub options: RequestOptions,
    /// Resolved after pointer resolution and account setup
    pub conn: ConnectionInfo,
    /// Configuration captured before processing; the rollback target
    pub snapshot: Option<Value>,
}

impl Workflow {
    pub fn new(task_id: impl Into<String>, envelope: Envelope, options: RequestOptions) -> Self {
        let conn = envelope.connection_info();
        Self {
            task_id: task_id.into(),
            envelope,
            options,
            conn,
            snapshot: None,
        }
    }
}

/// Delivers at most one response to the caller waiting on a task
pub struct Responder {
    tx: Option<oneshot::Sender<TaskView>>,
}

impl Responder {
    pub fn channel() -> (Self, oneshot::Receiver<TaskView>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Responder for workflows nobody is waiting on
    pub fn detached() -> Self {
        Self { tx: None }
    }

    /// Send the response; later calls are no-ops. Returns whether this call sent it.
    pub fn respond(&mut self, view: TaskView) -> bool {
        match self.tx.take() {
            Some(tx) => {
                debug!(task_id = %view.id, code = ?view.result.code, "Responder::respond: sending");
                let _ = tx.send(view);
                true
            }
            None => false,
        }
    }

    pub fn has_responded(&self) -> bool {
        self.tx.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskstore::Task;

    #[tokio::test]
    async fn test_responds_once() {
        let (mut responder, rx) = Responder::channel();
        let first = TaskView::from(&Task::new("a", 0));
        let second = TaskView::from(&Task::new("b", 0));

        assert!(!responder.has_responded());
        assert!(responder.respond(first));
        assert!(!responder.respond(second));
        assert!(responder.has_responded());
        assert_eq!(rx.await.unwrap().id, "a");
    }

    #[test]
    fn test_detached_never_sends() {
        let mut responder = Responder::detached();
        assert!(!responder.respond(TaskView::from(&Task::new("a", 0))));
    }
}
