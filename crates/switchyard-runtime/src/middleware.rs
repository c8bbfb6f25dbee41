//! Before/after request hooks around a turn.
//!
//! Before-hooks run in registration order and are awaited; the first error
//! aborts the turn. After-hooks run on a detached task once the output
//! messages are known, and every failure there is logged and dropped.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use switchyard_core::events::StreamFailure;
use switchyard_core::types::Message;

/// Context passed to before-request hooks.
#[derive(Debug, Clone)]
pub struct BeforeRequest {
    pub thread_id: Option<String>,
    pub run_id: Option<String>,
    pub input_messages: Vec<Message>,
    pub properties: serde_json::Map<String, serde_json::Value>,
    pub url: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Context passed to after-request hooks.
#[derive(Debug, Clone)]
pub struct AfterRequest {
    pub thread_id: String,
    pub run_id: Option<String>,
    pub input_messages: Vec<Message>,
    pub output_messages: Vec<Message>,
    pub properties: serde_json::Map<String, serde_json::Value>,
    pub url: Option<String>,
    pub timestamp: DateTime<Utc>,
}

pub type BeforeHook =
    Arc<dyn Fn(BeforeRequest) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub type AfterHook =
    Arc<dyn Fn(AfterRequest) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Hook chains; read-only once the runtime is built.
#[derive(Clone, Default)]
pub struct Middleware {
    before: Vec<BeforeHook>,
    after: Vec<AfterHook>,
}

impl Middleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_before_request(&mut self, hook: BeforeHook) {
        self.before.push(hook);
    }

    pub fn on_after_request(&mut self, hook: AfterHook) {
        self.after.push(hook);
    }

    /// Await every before-hook in order; the first failure propagates.
    pub async fn run_before(&self, request: &BeforeRequest) -> anyhow::Result<()> {
        for hook in &self.before {
            hook(request.clone()).await?;
        }
        Ok(())
    }

    /// Detach the after-hooks behind `output_messages`.
    ///
    /// Nothing here can fail the caller: a failed output stream skips the
    /// hooks, and hook errors are logged and dropped. Returns `None` when no
    /// after-hook is registered.
    pub fn spawn_after<F>(
        &self,
        output_messages: F,
        request: BeforeRequest,
        thread_id: String,
    ) -> Option<JoinHandle<()>>
    where
        F: Future<Output = Result<Vec<Message>, StreamFailure>> + Send + 'static,
    {
        if self.after.is_empty() {
            return None;
        }
        let hooks = self.after.clone();

        Some(tokio::spawn(async move {
            let output = match output_messages.await {
                Ok(messages) => messages,
                Err(failure) => {
                    debug!(error = %failure, "Output stream did not complete, skipping after-request hooks");
                    return;
                }
            };

            let after = AfterRequest {
                thread_id,
                run_id: request.run_id,
                input_messages: request.input_messages,
                output_messages: output,
                properties: request.properties,
                url: request.url,
                timestamp: Utc::now(),
            };
            for hook in &hooks {
                if let Err(e) = hook(after.clone()).await {
                    warn!(error = %e, thread_id = %after.thread_id, "After-request hook failed, ignoring");
                }
            }
        }))
    }
}

impl std::fmt::Debug for Middleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Middleware")
            .field("before", &self.before.len())
            .field("after", &self.after.len())
            .finish()
    }
}
