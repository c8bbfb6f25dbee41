//! Server-side actions and name-based de-duplication.
//!
//! A [`ServerAction`] is either callable (a handler returning a JSON result)
//! or a remote agent, which is only ever invoked by delegating a turn to it.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use switchyard_core::error::{Result, RuntimeError};
use switchyard_core::events::EventStream;
use switchyard_core::types::{
    ActionDescriptor, AgentStateInput, CallerContext, ClientAction, Message, MetaEvent,
};

/// A callable server-side action.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn call(
        &self,
        arguments: serde_json::Value,
        context: &CallerContext,
    ) -> anyhow::Result<serde_json::Value>;
}

/// What a remote agent receives when a turn is delegated to it.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub name: String,
    pub thread_id: String,
    pub node_name: Option<String>,
    pub messages: Vec<Message>,
    /// Client-held state for this agent, if the request carried any.
    pub state: Option<AgentStateInput>,
    pub meta_events: Vec<MetaEvent>,
    /// Actions the agent may call (never includes the agent itself).
    pub actions: Vec<ActionDescriptor>,
    pub context: CallerContext,
}

/// A remote agent's streaming entry point.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Start a run; the returned stream is forwarded verbatim.
    async fn invoke(&self, invocation: AgentInvocation) -> Result<EventStream>;
}

#[derive(Clone)]
pub enum ActionKind {
    Handler(Arc<dyn ActionHandler>),
    Agent(Arc<dyn AgentHandler>),
}

/// Async closure form of an [`ActionHandler`].
pub type ActionFn = Arc<
    dyn Fn(serde_json::Value, CallerContext) -> BoxFuture<'static, anyhow::Result<serde_json::Value>>
        + Send
        + Sync,
>;

struct FnHandler(ActionFn);

#[async_trait]
impl ActionHandler for FnHandler {
    async fn call(
        &self,
        arguments: serde_json::Value,
        context: &CallerContext,
    ) -> anyhow::Result<serde_json::Value> {
        (self.0)(arguments, context.clone()).await
    }
}

/// Produces extra actions from the caller context on every turn.
pub type ActionFactory = Arc<dyn Fn(&CallerContext) -> Vec<ServerAction> + Send + Sync>;

#[derive(Clone)]
pub struct ServerAction {
    pub descriptor: ActionDescriptor,
    pub kind: ActionKind,
}

impl ServerAction {
    pub fn new(descriptor: ActionDescriptor, handler: impl ActionHandler + 'static) -> Self {
        Self {
            descriptor,
            kind: ActionKind::Handler(Arc::new(handler)),
        }
    }

    pub fn from_fn<F>(descriptor: ActionDescriptor, f: F) -> Self
    where
        F: Fn(serde_json::Value, CallerContext) -> BoxFuture<'static, anyhow::Result<serde_json::Value>>
            + Send
            + Sync
            + 'static,
    {
        Self::new(descriptor, FnHandler(Arc::new(f)))
    }

    pub fn agent(descriptor: ActionDescriptor, handler: Arc<dyn AgentHandler>) -> Self {
        Self {
            descriptor,
            kind: ActionKind::Agent(handler),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn is_agent(&self) -> bool {
        matches!(self.kind, ActionKind::Agent(_))
    }

    /// Run a callable action. Agent actions are rejected.
    pub async fn execute(
        &self,
        arguments: serde_json::Value,
        context: &CallerContext,
    ) -> Result<serde_json::Value> {
        match &self.kind {
            ActionKind::Handler(handler) => handler
                .call(arguments, context)
                .await
                .map_err(reclassify),
            ActionKind::Agent(_) => Err(RuntimeError::Misuse(format!(
                "'{}' is a remote agent and can only be reached by delegating a turn to it",
                self.name()
            ))),
        }
    }
}

/// Recover a [`RuntimeError`] that travelled through an `anyhow` seam.
pub(crate) fn reclassify(err: anyhow::Error) -> RuntimeError {
    match err.downcast::<RuntimeError>() {
        Ok(classified) => classified,
        Err(other) => RuntimeError::Other(other),
    }
}

impl std::fmt::Debug for ServerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerAction")
            .field("name", &self.descriptor.name)
            .field("agent", &self.is_agent())
            .finish()
    }
}

/// Anything identified by an action name.
pub trait Named {
    fn name(&self) -> &str;
}

impl Named for ActionDescriptor {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Named for ServerAction {
    fn name(&self) -> &str {
        &self.descriptor.name
    }
}

impl Named for ClientAction {
    fn name(&self) -> &str {
        &self.descriptor.name
    }
}

/// Keep the first occurrence of every name, in order.
///
/// Priority is expressed by input order: pass higher-priority sources first.
pub fn dedupe_by_name<T: Named>(items: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.name().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn descriptor(name: &str, description: &str) -> ActionDescriptor {
        ActionDescriptor::new(name, description, json!({ "type": "object" }))
    }

    fn echo(name: &str) -> ServerAction {
        ServerAction::from_fn(descriptor(name, "echo"), |args, _ctx| {
            Box::pin(async move { Ok(json!({ "echo": args })) })
        })
    }

    struct NeverAgent;

    #[async_trait]
    impl AgentHandler for NeverAgent {
        async fn invoke(&self, _invocation: AgentInvocation) -> Result<EventStream> {
            Err(RuntimeError::Misuse("not reachable in tests".into()))
        }
    }

    #[test]
    fn test_dedupe_first_occurrence_wins() {
        let a = vec![descriptor("x", "from a"), descriptor("y", "")];
        let b = vec![descriptor("z", ""), descriptor("x", "from b")];
        let merged = dedupe_by_name(a.into_iter().chain(b));

        let names: Vec<&str> = merged.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["x", "y", "z"]);
        assert_eq!(merged[0].description, "from a");
    }

    #[test]
    fn test_dedupe_empty() {
        assert!(dedupe_by_name(Vec::<ActionDescriptor>::new()).is_empty());
    }

    #[tokio::test]
    async fn test_execute_handler() {
        let result = echo("ping")
            .execute(json!({ "n": 1 }), &CallerContext::default())
            .await
            .unwrap();
        assert_eq!(result["echo"]["n"], 1);
    }

    #[tokio::test]
    async fn test_execute_agent_is_misuse() {
        let action = ServerAction::agent(descriptor("planner", ""), Arc::new(NeverAgent));
        assert!(action.is_agent());
        let err = action
            .execute(json!({}), &CallerContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Misuse(_)));
    }

    #[tokio::test]
    async fn test_handler_error_is_unclassified() {
        let failing = ServerAction::from_fn(descriptor("boom", ""), |_args, _ctx| {
            Box::pin(async { Err(anyhow::anyhow!("kaboom")) })
        });
        let err = failing
            .execute(json!({}), &CallerContext::default())
            .await
            .unwrap_err();
        assert!(!err.is_classified());
        assert!(err.to_string().contains("kaboom"));
    }
}
