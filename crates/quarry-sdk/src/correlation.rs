// Task-local correlation context used to tag log lines with the step that
// produced them. Under enhanced logging the trace formatter stitches the
// current frame's id into every line; hosts without correlation support
// bind the no-op manager and logging is unaffected. The slot follows
// asynchronous continuations of the task it was installed on, so
// concurrently executing steps never observe each other's frames.

use std::cell::RefCell;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

/// A correlation frame that can produce an id string for log tagging.
pub trait CorrelationContext: Send + Sync {
    /// The correlation id of this frame.
    fn correlation_id(&self) -> &str;
}

/// Correlation frame for a single executing step.
#[derive(Debug, Clone)]
pub struct StepContext {
    id: String,
}

impl StepContext {
    /// Create a frame for the given step.
    pub fn new(step_id: Uuid) -> Self {
        Self {
            id: build_step_correlation_id(step_id),
        }
    }
}

impl CorrelationContext for StepContext {
    fn correlation_id(&self) -> &str {
        &self.id
    }
}

/// The short id shape used for steps: `STEP-` plus the first 12 hex digits
/// of the step uuid. The manager below is shape-agnostic; this is a caller
/// convention.
pub fn build_step_correlation_id(step_id: Uuid) -> String {
    let simple = step_id.simple().to_string();
    format!("STEP-{}", &simple[..12])
}

tokio::task_local! {
    /// Single-slot carrier of the current correlation frame.
    static CURRENT_CONTEXT: RefCell<Option<Arc<dyn CorrelationContext>>>;
}

/// Manages the current correlation frame for the executing task.
pub trait CorrelationManager: Send + Sync {
    /// Replace the current frame.
    fn set_current(&self, context: Arc<dyn CorrelationContext>);

    /// Clear the current frame.
    fn clear_current(&self);

    /// The current frame's id, or the empty string when absent.
    fn build_correlation_id(&self) -> String;
}

/// Task-local implementation backed by the slot installed with
/// [`with_correlation_slot`]. Operations outside an installed slot are
/// silent no-ops so logging never breaks.
#[derive(Debug, Default)]
pub struct TaskLocalCorrelationManager;

impl CorrelationManager for TaskLocalCorrelationManager {
    fn set_current(&self, context: Arc<dyn CorrelationContext>) {
        let _ = CURRENT_CONTEXT.try_with(|slot| *slot.borrow_mut() = Some(context));
    }

    fn clear_current(&self) {
        let _ = CURRENT_CONTEXT.try_with(|slot| *slot.borrow_mut() = None);
    }

    fn build_correlation_id(&self) -> String {
        CURRENT_CONTEXT
            .try_with(|slot| {
                slot.borrow()
                    .as_ref()
                    .map(|c| c.correlation_id().to_string())
            })
            .ok()
            .flatten()
            .unwrap_or_default()
    }
}

/// No-op manager for hosts that run without correlation support.
#[derive(Debug, Default)]
pub struct NoopCorrelationManager;

impl CorrelationManager for NoopCorrelationManager {
    fn set_current(&self, _context: Arc<dyn CorrelationContext>) {}

    fn clear_current(&self) {}

    fn build_correlation_id(&self) -> String {
        String::new()
    }
}

/// Run `future` with a fresh (empty) correlation slot installed on the
/// current task.
pub async fn with_correlation_slot<F: Future>(future: F) -> F::Output {
    CURRENT_CONTEXT.scope(RefCell::new(None), future).await
}
