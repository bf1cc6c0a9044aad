use crate::agent_buffer::AgentBuffer;
use crate::agent_queue::AgentQueue;
use crate::listener::RecordListener;
use basalt_config::{BufferOverflowStrategy, CollectorConfig};
use basalt_matrix::SubMatrix;
use lithos_events::{Attachment, RecordCursor};
use parking_lot::{Condvar, Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Combines a subscription's existing attachment with an incoming
/// subscription item.
///
/// On add, the result becomes the row's attachment. On removal, a `Some`
/// result keeps the subscription alive with that attachment and `None`
/// removes it.
pub trait AttachmentStrategy: Send + Sync {
    fn update_attachment(&self, old: Option<Attachment>, cursor: &RecordCursor, remove: bool) -> Option<Attachment>;
}

/// Accepts or rejects subscription items before they reach the matrix.
pub trait SubscriptionFilter: Send + Sync {
    fn accept(&self, cursor: &RecordCursor) -> bool;
}

impl<F> SubscriptionFilter for F
where
    F: Fn(&RecordCursor) -> bool + Send + Sync,
{
    fn accept(&self, cursor: &RecordCursor) -> bool {
        self(cursor)
    }
}

#[derive(Default)]
pub struct AgentBuilder {
    pub(crate) name: Option<String>,
    pub(crate) attachment_strategy: Option<Arc<dyn AttachmentStrategy>>,
    pub(crate) filter: Option<Arc<dyn SubscriptionFilter>>,
    pub(crate) snapshot_listener: Option<Arc<dyn RecordListener>>,
    pub(crate) data_listener: Option<Arc<dyn RecordListener>>,
    pub(crate) buffer_size: Option<usize>,
    pub(crate) overflow_strategy: Option<BufferOverflowStrategy>,
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn attachment_strategy(mut self, strategy: Arc<dyn AttachmentStrategy>) -> Self {
        self.attachment_strategy = Some(strategy);
        self
    }

    pub fn filter(mut self, filter: Arc<dyn SubscriptionFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn snapshot_listener(mut self, listener: Arc<dyn RecordListener>) -> Self {
        self.snapshot_listener = Some(listener);
        self
    }

    pub fn data_listener(mut self, listener: Arc<dyn RecordListener>) -> Self {
        self.data_listener = Some(listener);
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    pub fn overflow_strategy(mut self, strategy: BufferOverflowStrategy) -> Self {
        self.overflow_strategy = Some(strategy);
        self
    }

    pub fn has_attachment_strategy(&self) -> bool {
        self.attachment_strategy.is_some()
    }
}

/// State guarded by the agent's local lock.
#[derive(Debug)]
pub(crate) struct AgentLocal {
    pub snapshot_queue: AgentQueue,
    pub update_queue: AgentQueue,
    pub buffer: AgentBuffer,
    /// A removal happened; shrink and refilter once the change completes.
    pub reduced_sub: bool,
    /// Next row the set-subscription cleanup will look at.
    pub setter_cleanup: Option<usize>,
    /// Next row the close sweep will look at.
    pub close_cursor: Option<usize>,
    /// Ticker: records retrieved from the snapshot queue since the last update batch.
    pub snapshot_retrieved: usize,
}

#[derive(Default)]
struct Listeners {
    snapshot: Option<Arc<dyn RecordListener>>,
    data: Option<Arc<dyn RecordListener>>,
}

/// One consumer of a collector. Numbers start at 2; 1 is the total.
pub struct Agent {
    number: i32,
    name: String,
    sub: RwLock<Arc<SubMatrix>>,
    sub_mod_count: AtomicU32,
    closed: AtomicBool,
    pub(crate) local: Mutex<AgentLocal>,
    /// Signalled when a blocked buffer drains or the agent closes.
    pub(crate) unblocked: Condvar,
    attachment_strategy: Option<Arc<dyn AttachmentStrategy>>,
    filter: Option<Arc<dyn SubscriptionFilter>>,
    listeners: Mutex<Listeners>,
}

impl Agent {
    pub(crate) fn new(number: i32, sub: SubMatrix, builder: AgentBuilder, config: &CollectorConfig) -> Self {
        let buffer = AgentBuffer::new(
            builder.buffer_size.unwrap_or(config.agent_buffer_size),
            builder.overflow_strategy.unwrap_or(config.buffer_overflow_strategy),
        );
        Self {
            number,
            name: builder.name.unwrap_or_else(|| format!("agent-{number}")),
            sub: RwLock::new(Arc::new(sub)),
            sub_mod_count: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            local: Mutex::new(AgentLocal {
                snapshot_queue: AgentQueue::default(),
                update_queue: AgentQueue::default(),
                buffer,
                reduced_sub: false,
                setter_cleanup: None,
                close_cursor: None,
                snapshot_retrieved: 0,
            }),
            unblocked: Condvar::new(),
            attachment_strategy: builder.attachment_strategy,
            filter: builder.filter,
            listeners: Mutex::new(Listeners {
                snapshot: builder.snapshot_listener,
                data: builder.data_listener,
            }),
        }
    }

    pub fn number(&self) -> i32 {
        self.number
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sub(&self) -> Arc<SubMatrix> {
        self.sub.read().clone()
    }

    pub(crate) fn set_sub(&self, sub: Arc<SubMatrix>) {
        *self.sub.write() = sub;
    }

    pub fn sub_mod_count(&self) -> u32 {
        self.sub_mod_count.load(Ordering::Acquire)
    }

    pub(crate) fn inc_sub_mod_count(&self) {
        self.sub_mod_count.fetch_add(1, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns false if the agent was already closed.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn has_attachment_strategy(&self) -> bool {
        self.attachment_strategy.is_some()
    }

    pub(crate) fn attachment_strategy(&self) -> Option<&Arc<dyn AttachmentStrategy>> {
        self.attachment_strategy.as_ref()
    }

    pub(crate) fn accepts(&self, cursor: &RecordCursor) -> bool {
        self.filter.as_ref().is_none_or(|f| f.accept(cursor))
    }

    pub(crate) fn set_snapshot_listener(&self, listener: Option<Arc<dyn RecordListener>>) {
        self.listeners.lock().snapshot = listener;
    }

    pub(crate) fn set_data_listener(&self, listener: Option<Arc<dyn RecordListener>>) {
        self.listeners.lock().data = listener;
    }

    pub(crate) fn notify_snapshot_listener(&self) {
        let listener = self.listeners.lock().snapshot.clone();
        if let Some(l) = listener {
            l.records_available();
        }
    }

    pub(crate) fn notify_data_listener(&self) {
        let listener = self.listeners.lock().data.clone();
        if let Some(l) = listener {
            l.records_available();
        }
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("number", &self.number)
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}
