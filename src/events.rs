/*!
 * In-process publish/subscribe bus connecting the pipeline stages.
 *
 * Handlers are registered per [`EventKind`] and invoked synchronously, in
 * registration order, every time an event of that kind is emitted. A
 * handler that returns an error or panics is logged and skipped; the
 * remaining handlers still run and `emit` never fails.
 *
 * Dispatch works on a snapshot of the subscriber list taken when `emit`
 * starts, so handlers may subscribe or unsubscribe while being dispatched.
 * Such changes apply from the next `emit`.
 */

use log::{debug, error, info};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// Discriminant of a [`PipelineEvent`], used as the subscription key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    IngestionCompleted,
    AnalysisCompleted,
    TranslationCompleted,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::IngestionCompleted => "ingestion_completed",
            EventKind::AnalysisCompleted => "analysis_completed",
            EventKind::TranslationCompleted => "translation_completed",
        };
        write!(f, "{}", name)
    }
}

/// Completion signals exchanged by the stages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// An ingest scan for one account finished
    IngestionCompleted {
        /// Account name the scan ran for
        account_id: String,
        /// Number of new posts stored, or the failure message
        outcome: Result<usize, String>,
    },

    /// A thread was assembled and moved to `Analyzed`
    AnalysisCompleted {
        thread_id: String,
        /// Platform user id of the thread author
        author_id: String,
    },

    /// A thread translation finished or was abandoned
    TranslationCompleted {
        thread_id: String,
        author_id: String,
        outcome: Result<(), String>,
    },
}

impl PipelineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PipelineEvent::IngestionCompleted { .. } => EventKind::IngestionCompleted,
            PipelineEvent::AnalysisCompleted { .. } => EventKind::AnalysisCompleted,
            PipelineEvent::TranslationCompleted { .. } => EventKind::TranslationCompleted,
        }
    }
}

/// Shared event handler. Identity for unsubscription is the `Arc` pointer.
pub type EventHandler = Arc<dyn Fn(&PipelineEvent) -> anyhow::Result<()> + Send + Sync>;

/// Subscriber registry keyed by event kind
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler to the list for `kind`
    pub fn subscribe(&self, kind: EventKind, handler: EventHandler) {
        let mut handlers = self.handlers.write();
        let list = handlers.entry(kind).or_default();
        list.push(handler);
        info!("Subscribed to {} ({} handler(s))", kind, list.len());
    }

    /// Remove the first registration of `handler` for `kind`.
    ///
    /// Returns whether a registration was removed. A handler registered
    /// several times needs one call per registration.
    pub fn unsubscribe(&self, kind: EventKind, handler: &EventHandler) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        match list.iter().position(|h| Arc::ptr_eq(h, handler)) {
            Some(index) => {
                list.remove(index);
                info!("Unsubscribed from {} ({} handler(s) left)", kind, list.len());
                true
            }
            None => false,
        }
    }

    /// Invoke every handler registered for the event's kind.
    ///
    /// Handler failures and panics are logged and isolated.
    pub fn emit(&self, event: &PipelineEvent) {
        let kind = event.kind();
        let snapshot: Vec<EventHandler> = match self.handlers.read().get(&kind) {
            Some(list) => list.clone(),
            None => Vec::new(),
        };

        if snapshot.is_empty() {
            debug!("Emitted {} with no subscribers", kind);
            return;
        }

        info!("Emitting {} to {} handler(s)", kind, snapshot.len());
        for (index, handler) in snapshot.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Handler #{} for {} failed: {:#}", index, kind, e),
                Err(_) => error!("Handler #{} for {} panicked", index, kind),
            }
        }
    }

    /// Number of live registrations for `kind`
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read();
        let counts: HashMap<EventKind, usize> =
            handlers.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("EventBus").field("handlers", &counts).finish()
    }
}
