//! Write-once, multi-subscriber event channel for a single turn.
//!
//! A [`RuntimeEventSource`] accepts exactly one producer for its lifetime:
//! either an [`EventSink`] handed to a service adapter (direct mode) or an
//! externally produced [`EventStream`] that is forwarded verbatim
//! (forwarding mode). Events are buffered, so every subscriber sees the whole
//! sequence once, no matter when it subscribed.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::{Stream, StreamExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{Result, RuntimeError};
use crate::events::{EventStream, MessageAccumulator, RuntimeEvent, StreamFailure};
use crate::types::Message;

/// Message shown in the chat when a turn fails without a more specific one.
pub const DEFAULT_ERROR_MESSAGE: &str =
    "An error occurred while processing your request. Please try again.";

/// Subscriber view of an event source.
///
/// Yields events in order; a failed source ends with one `Err` item.
pub type Subscription = Pin<Box<dyn Stream<Item = std::result::Result<RuntimeEvent, StreamFailure>> + Send>>;

/// How an event source ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Completed,
    Failed(StreamFailure),
    Cancelled,
}

#[derive(Default)]
struct State {
    events: Vec<RuntimeEvent>,
    terminal: Option<Terminal>,
    subscribers: usize,
}

struct Inner {
    state: Mutex<State>,
    version: watch::Sender<u64>,
    producer_attached: AtomicBool,
    cancel: CancellationToken,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    fn push(&self, event: RuntimeEvent) -> bool {
        {
            let mut state = self.lock();
            if state.terminal.is_some() {
                return false;
            }
            state.events.push(event);
        }
        self.bump();
        true
    }

    fn finish(&self, terminal: Terminal) {
        {
            let mut state = self.lock();
            if state.terminal.is_some() {
                return;
            }
            state.terminal = Some(terminal);
        }
        self.bump();
    }

    fn terminal(&self) -> Option<Terminal> {
        self.lock().terminal.clone()
    }
}

/// Event channel carrying one turn's output to the transport layer.
///
/// Cloning is cheap; clones share the same buffer and producer slot.
#[derive(Clone)]
pub struct RuntimeEventSource {
    inner: Arc<Inner>,
}

impl RuntimeEventSource {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                version,
                producer_attached: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    fn claim(&self) -> Result<()> {
        if self.inner.producer_attached.swap(true, Ordering::SeqCst) {
            return Err(RuntimeError::Misuse(
                "event source already has a producer attached".into(),
            ));
        }
        Ok(())
    }

    /// Whether a producer (sink, forwarded stream or error message) was attached.
    pub fn has_producer(&self) -> bool {
        self.inner.producer_attached.load(Ordering::SeqCst)
    }

    /// Direct mode: hand out the single sink an adapter pushes events into.
    pub fn sink(&self) -> Result<EventSink> {
        self.claim()?;
        Ok(EventSink {
            inner: self.inner.clone(),
            finished: false,
        })
    }

    /// Forwarding mode: relay every item of `stream` into this source.
    ///
    /// An `Err` item is forwarded as a [`RuntimeEvent::RunError`] followed by
    /// a failed terminal state; the end of `stream` completes the source.
    /// Cancellation drops `stream`, which aborts the upstream request.
    pub fn forward(&self, stream: EventStream) -> Result<()> {
        self.claim()?;
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut stream = stream;
            loop {
                tokio::select! {
                    biased;
                    _ = inner.cancel.cancelled() => {
                        debug!("Forwarded event stream cancelled by consumer");
                        inner.finish(Terminal::Cancelled);
                        break;
                    }
                    item = stream.next() => match item {
                        Some(Ok(event)) => {
                            inner.push(event);
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Forwarded event stream failed");
                            let message = e.to_string();
                            inner.push(RuntimeEvent::RunError {
                                message: message.clone(),
                            });
                            inner.finish(Terminal::Failed(StreamFailure::new(message)));
                            break;
                        }
                        None => {
                            inner.finish(Terminal::Completed);
                            break;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// Emit a single chat-visible error and end the stream.
    ///
    /// Only takes effect while no producer is attached; returns whether the
    /// error was emitted.
    pub fn send_error_message_to_chat(&self, message: &str) -> bool {
        if self.claim().is_err() {
            warn!("Producer already attached, not sending error message to chat");
            return false;
        }
        self.inner.push(RuntimeEvent::RunError {
            message: message.to_string(),
        });
        self.inner
            .finish(Terminal::Failed(StreamFailure::new(message)));
        true
    }

    /// Subscribe to the event sequence.
    ///
    /// When the last subscriber drops before the source ended, the producer
    /// is cancelled.
    pub fn subscribe(&self) -> Subscription {
        self.open(true)
    }

    /// Cancel the producer; the source ends as [`Terminal::Cancelled`].
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
        if !self.has_producer() {
            self.inner.finish(Terminal::Cancelled);
        }
    }

    pub fn terminal(&self) -> Option<Terminal> {
        self.inner.terminal()
    }

    /// Events buffered so far.
    pub fn events(&self) -> Vec<RuntimeEvent> {
        self.inner.lock().events.clone()
    }

    /// Resolves to the output messages once the source completes.
    ///
    /// A failed or cancelled source resolves to an error. Observing does not
    /// count as a subscription for cancellation purposes.
    pub fn output_messages(
        &self,
    ) -> impl Future<Output = std::result::Result<Vec<Message>, StreamFailure>> + Send + 'static
    {
        let mut events = self.open(false);
        let inner = self.inner.clone();
        async move {
            let mut acc = MessageAccumulator::new();
            while let Some(item) = events.next().await {
                acc.apply(&item?);
            }
            match inner.terminal() {
                Some(Terminal::Cancelled) => Err(StreamFailure::new("event stream was cancelled")),
                _ => Ok(acc.finish()),
            }
        }
    }

    fn open(&self, counted: bool) -> Subscription {
        let cursor = Cursor {
            inner: self.inner.clone(),
            version: self.inner.version.subscribe(),
            next: 0,
            done: false,
            _guard: counted.then(|| SubscriberGuard::new(self.inner.clone())),
        };

        Box::pin(futures::stream::unfold(cursor, |mut cursor| async move {
            if cursor.done {
                return None;
            }
            loop {
                cursor.version.borrow_and_update();
                let step = {
                    let state = cursor.inner.lock();
                    if let Some(event) = state.events.get(cursor.next) {
                        Step::Event(event.clone())
                    } else {
                        match &state.terminal {
                            None => Step::Wait,
                            Some(Terminal::Failed(failure)) => Step::Fail(failure.clone()),
                            Some(_) => Step::End,
                        }
                    }
                };

                match step {
                    Step::Event(event) => {
                        cursor.next += 1;
                        return Some((Ok(event), cursor));
                    }
                    Step::Fail(failure) => {
                        cursor.done = true;
                        return Some((Err(failure), cursor));
                    }
                    Step::End => return None,
                    Step::Wait => {
                        if cursor.version.changed().await.is_err() {
                            return None;
                        }
                    }
                }
            }
        }))
    }
}

impl Default for RuntimeEventSource {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RuntimeEventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("RuntimeEventSource")
            .field("events", &state.events.len())
            .field("terminal", &state.terminal)
            .field("producer_attached", &self.has_producer())
            .finish()
    }
}

enum Step {
    Event(RuntimeEvent),
    Fail(StreamFailure),
    End,
    Wait,
}

struct Cursor {
    inner: Arc<Inner>,
    version: watch::Receiver<u64>,
    next: usize,
    done: bool,
    _guard: Option<SubscriberGuard>,
}

struct SubscriberGuard {
    inner: Arc<Inner>,
}

impl SubscriberGuard {
    fn new(inner: Arc<Inner>) -> Self {
        inner.lock().subscribers += 1;
        Self { inner }
    }
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        let abandoned = {
            let mut state = self.inner.lock();
            state.subscribers = state.subscribers.saturating_sub(1);
            state.subscribers == 0 && state.terminal.is_none()
        };
        if abandoned {
            debug!("Last subscriber dropped, cancelling producer");
            self.inner.cancel.cancel();
        }
    }
}

/// Producer handle for direct mode.
///
/// Dropping a sink that was neither completed nor failed completes the
/// source, so consumers never wait on a producer that went away.
pub struct EventSink {
    inner: Arc<Inner>,
    finished: bool,
}

impl EventSink {
    /// Push an event; returns false once the source has ended.
    pub fn emit(&self, event: RuntimeEvent) -> bool {
        self.inner.push(event)
    }

    pub fn send_text_message_start(&self, message_id: &str, parent_message_id: Option<&str>) {
        self.emit(RuntimeEvent::TextMessageStart {
            message_id: message_id.to_string(),
            parent_message_id: parent_message_id.map(str::to_string),
        });
    }

    pub fn send_text_message_content(&self, message_id: &str, content: &str) {
        self.emit(RuntimeEvent::TextMessageContent {
            message_id: message_id.to_string(),
            content: content.to_string(),
        });
    }

    pub fn send_text_message_end(&self, message_id: &str) {
        self.emit(RuntimeEvent::TextMessageEnd {
            message_id: message_id.to_string(),
        });
    }

    /// Start, content and end of a complete text message.
    pub fn send_text_message(&self, message_id: &str, content: &str) {
        self.send_text_message_start(message_id, None);
        self.send_text_message_content(message_id, content);
        self.send_text_message_end(message_id);
    }

    pub fn send_action_execution_start(
        &self,
        action_execution_id: &str,
        action_name: &str,
        parent_message_id: Option<&str>,
    ) {
        self.emit(RuntimeEvent::ActionExecutionStart {
            action_execution_id: action_execution_id.to_string(),
            action_name: action_name.to_string(),
            parent_message_id: parent_message_id.map(str::to_string),
        });
    }

    pub fn send_action_execution_args(&self, action_execution_id: &str, args: &str) {
        self.emit(RuntimeEvent::ActionExecutionArgs {
            action_execution_id: action_execution_id.to_string(),
            args: args.to_string(),
        });
    }

    pub fn send_action_execution_end(&self, action_execution_id: &str) {
        self.emit(RuntimeEvent::ActionExecutionEnd {
            action_execution_id: action_execution_id.to_string(),
        });
    }

    /// Start, arguments and end of a complete action execution.
    pub fn send_action_execution(
        &self,
        action_execution_id: &str,
        action_name: &str,
        args: &str,
        parent_message_id: Option<&str>,
    ) {
        self.send_action_execution_start(action_execution_id, action_name, parent_message_id);
        self.send_action_execution_args(action_execution_id, args);
        self.send_action_execution_end(action_execution_id);
    }

    pub fn send_action_execution_result(
        &self,
        action_execution_id: &str,
        action_name: &str,
        result: &str,
    ) {
        self.emit(RuntimeEvent::ActionExecutionResult {
            action_name: action_name.to_string(),
            action_execution_id: action_execution_id.to_string(),
            result: result.to_string(),
        });
    }

    /// Snapshot of an agent's state; `state` is serialized JSON.
    pub fn send_agent_state_message(
        &self,
        thread_id: &str,
        agent_name: &str,
        node_name: &str,
        state: &str,
        running: bool,
    ) {
        self.emit(RuntimeEvent::AgentStateMessage {
            thread_id: thread_id.to_string(),
            agent_name: agent_name.to_string(),
            node_name: node_name.to_string(),
            run_id: String::new(),
            active: running,
            role: "assistant".to_string(),
            state: state.to_string(),
            running,
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves when the consumer side cancelled the turn.
    pub async fn cancelled(&self) {
        self.inner.cancel.cancelled().await
    }

    pub fn complete(mut self) {
        self.finished = true;
        self.inner.finish(Terminal::Completed);
    }

    /// Emit a chat-visible error and end the source as failed.
    pub fn fail(mut self, message: &str) {
        self.finished = true;
        self.inner.push(RuntimeEvent::RunError {
            message: message.to_string(),
        });
        self.inner
            .finish(Terminal::Failed(StreamFailure::new(message)));
    }
}

impl Drop for EventSink {
    fn drop(&mut self) {
        if !self.finished {
            let terminal = if self.inner.cancel.is_cancelled() {
                Terminal::Cancelled
            } else {
                Terminal::Completed
            };
            self.inner.finish(terminal);
        }
    }
}
