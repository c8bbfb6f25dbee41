//! Turn processor: assembles the action surface for a turn and dispatches it
//! either to the service adapter (direct) or to a remote agent (delegation).

use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use tracing::{debug, error, info};

use switchyard_core::config::{Config, EndpointDefinition, RemoteChain};
use switchyard_core::error::{Result, RuntimeError};
use switchyard_core::event_source::{DEFAULT_ERROR_MESSAGE, RuntimeEventSource};
use switchyard_core::events::StreamFailure;
use switchyard_core::types::{
    ActionAvailability, ActionDescriptor, Agent, AgentSession, AgentStateInput,
    AgentStateSnapshot, CallerContext, ClientAction, ForwardedParameters, Message, MetaEvent,
    new_id,
};
use switchyard_providers::{AdapterRequest, EmptyAdapter, ServiceAdapter, adapter_from_config};

use crate::actions::{
    ActionFactory, ActionKind, AgentInvocation, ServerAction, dedupe_by_name, reclassify,
};
use crate::agent_state;
use crate::discovery::{self, setup_remote_actions};
use crate::langserve::resolve_chains;
use crate::middleware::{AfterHook, BeforeHook, BeforeRequest, Middleware};

/// Caller-owned future resolving to a turn's output messages.
pub type OutputMessages = BoxFuture<'static, std::result::Result<Vec<Message>, StreamFailure>>;

/// Where a turn is in its lifecycle; used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Init,
    ActionAssembly,
    DirectDispatch,
    AgentDelegation,
    Streaming,
    Failed,
}

/// One conversational turn.
#[derive(Default)]
pub struct TurnRequest {
    pub messages: Vec<Message>,
    pub client_actions: Vec<ClientAction>,
    pub agent_session: Option<AgentSession>,
    pub agent_states: Vec<AgentStateInput>,
    pub meta_events: Vec<MetaEvent>,
    pub forwarded_parameters: Option<ForwardedParameters>,
    pub extensions: Option<serde_json::Value>,
    pub thread_id: Option<String>,
    pub run_id: Option<String>,
    pub context: CallerContext,
    /// The channel this turn's output goes to. Subscribe before processing
    /// to also see the error message of a failed turn.
    pub event_source: RuntimeEventSource,
    /// Output messages for the after-request hooks. Defaults to folding the
    /// event source.
    pub output_messages: Option<OutputMessages>,
}

impl TurnRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub struct TurnResponse {
    pub thread_id: String,
    pub run_id: Option<String>,
    pub event_source: RuntimeEventSource,
    pub server_actions: Vec<ServerAction>,
    /// The actions offered for this turn, minus remote agents.
    pub action_inputs_without_agents: Vec<ActionDescriptor>,
    pub extensions: Option<serde_json::Value>,
}

/// The orchestration runtime. Read-only once built; turns are independent.
pub struct Runtime {
    adapter: Arc<dyn ServiceAdapter>,
    actions: Vec<ServerAction>,
    action_factory: Option<ActionFactory>,
    chain_actions: Vec<ServerAction>,
    endpoints: Vec<Arc<EndpointDefinition>>,
    middleware: Middleware,
    delegate_agent_processing_to_service_adapter: bool,
    http: reqwest::Client,
}

#[derive(Default)]
pub struct RuntimeBuilder {
    adapter: Option<Arc<dyn ServiceAdapter>>,
    actions: Vec<ServerAction>,
    action_factory: Option<ActionFactory>,
    chains: Vec<RemoteChain>,
    endpoints: Vec<EndpointDefinition>,
    middleware: Middleware,
    delegate_agent_processing_to_service_adapter: bool,
    http: Option<reqwest::Client>,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn adapter(mut self, adapter: Arc<dyn ServiceAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn action(mut self, action: ServerAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn action_factory(
        mut self,
        factory: impl Fn(&CallerContext) -> Vec<ServerAction> + Send + Sync + 'static,
    ) -> Self {
        self.action_factory = Some(Arc::new(factory));
        self
    }

    pub fn endpoint(mut self, endpoint: EndpointDefinition) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn chain(mut self, chain: RemoteChain) -> Self {
        self.chains.push(chain);
        self
    }

    pub fn on_before_request(mut self, hook: BeforeHook) -> Self {
        self.middleware.on_before_request(hook);
        self
    }

    pub fn on_after_request(mut self, hook: AfterHook) -> Self {
        self.middleware.on_after_request(hook);
        self
    }

    pub fn delegate_agent_processing_to_service_adapter(mut self, delegate: bool) -> Self {
        self.delegate_agent_processing_to_service_adapter = delegate;
        self
    }

    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Resolve LangServe chains and freeze the configuration.
    pub async fn build(self) -> Runtime {
        let http = self.http.unwrap_or_default();
        let chain_actions = resolve_chains(&http, &self.chains).await;
        Runtime {
            adapter: self.adapter.unwrap_or_else(|| Arc::new(EmptyAdapter)),
            actions: self.actions,
            action_factory: self.action_factory,
            chain_actions,
            endpoints: self.endpoints.into_iter().map(Arc::new).collect(),
            middleware: self.middleware,
            delegate_agent_processing_to_service_adapter: self
                .delegate_agent_processing_to_service_adapter,
            http,
        }
    }
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Builder preloaded from a config file's adapter, endpoints and chains.
    pub fn builder_from_config(config: &Config) -> RuntimeBuilder {
        let mut builder = RuntimeBuilder::new().delegate_agent_processing_to_service_adapter(
            config.delegate_agent_processing_to_service_adapter,
        );
        if let Some(adapter) = &config.adapter {
            builder = builder.adapter(adapter_from_config(adapter));
        }
        for endpoint in &config.endpoints {
            builder = builder.endpoint(endpoint.clone());
        }
        for chain in &config.chains {
            builder = builder.chain(chain.clone());
        }
        builder
    }

    /// Static, factory, chain and remote actions, de-duplicated in that order.
    pub async fn server_actions(&self, context: &CallerContext) -> Result<Vec<ServerAction>> {
        let factory_actions = self
            .action_factory
            .as_ref()
            .map(|factory| factory(context))
            .unwrap_or_default();
        let remote_actions = setup_remote_actions(&self.http, &self.endpoints, context).await?;

        Ok(dedupe_by_name(
            self.actions
                .iter()
                .cloned()
                .chain(factory_actions)
                .chain(self.chain_actions.iter().cloned())
                .chain(remote_actions),
        ))
    }

    /// Agents offered by every configured endpoint, in configuration order.
    pub async fn discover_agents(&self, context: &CallerContext) -> Result<Vec<Agent>> {
        discovery::discover_agents(&self.http, &self.endpoints, context).await
    }

    pub async fn load_agent_state(
        &self,
        context: &CallerContext,
        thread_id: &str,
        agent_name: &str,
    ) -> Result<AgentStateSnapshot> {
        agent_state::load_agent_state(&self.http, &self.endpoints, context, thread_id, agent_name)
            .await
    }

    /// Process one turn.
    ///
    /// Classified errors are returned unchanged. Anything else also puts a
    /// generic error message on the event source if nothing was attached yet.
    pub async fn process_turn(&self, request: TurnRequest) -> Result<TurnResponse> {
        let event_source = request.event_source.clone();
        match self.dispatch(request).await {
            Ok(response) => {
                debug!(phase = ?TurnPhase::Streaming, thread_id = %response.thread_id, "Turn dispatched");
                Ok(response)
            }
            Err(err) if err.is_classified() => {
                debug!(phase = ?TurnPhase::Failed, kind = err.kind(), error = %err, "Turn rejected");
                Err(err)
            }
            Err(err) => {
                error!(phase = ?TurnPhase::Failed, error = %err, "Error processing turn");
                event_source.send_error_message_to_chat(DEFAULT_ERROR_MESSAGE);
                Err(err)
            }
        }
    }

    async fn dispatch(&self, request: TurnRequest) -> Result<TurnResponse> {
        debug!(phase = ?TurnPhase::Init, "Processing turn");
        if !self.adapter.accepts_direct_requests() && request.agent_session.is_none() {
            return Err(RuntimeError::Misuse(format!(
                "The '{}' adapter can only be used for agent sessions. Configure a service adapter or lock the request to an agent",
                self.adapter.id()
            )));
        }

        debug!(phase = ?TurnPhase::ActionAssembly, "Assembling actions");
        let server_actions = self.server_actions(&request.context).await?;

        let session = request
            .agent_session
            .clone()
            .filter(|_| !self.delegate_agent_processing_to_service_adapter);
        match session {
            Some(session) => self.delegate_to_agent(request, session, server_actions).await,
            None => self.dispatch_direct(request, server_actions).await,
        }
    }

    async fn dispatch_direct(
        &self,
        request: TurnRequest,
        server_actions: Vec<ServerAction>,
    ) -> Result<TurnResponse> {
        debug!(phase = ?TurnPhase::DirectDispatch, adapter = self.adapter.id(), "Dispatching to service adapter");
        let action_inputs = dedupe_by_name(
            server_actions
                .iter()
                .map(|action| action.descriptor.clone())
                .chain(
                    request
                        .client_actions
                        .iter()
                        .filter(|action| action.available == ActionAvailability::Enabled)
                        .map(|action| action.descriptor.clone()),
                ),
        );

        let before = before_request(&request, request.thread_id.clone());
        self.middleware.run_before(&before).await.map_err(reclassify)?;

        let TurnRequest {
            messages,
            agent_session,
            agent_states,
            forwarded_parameters,
            extensions,
            thread_id,
            run_id,
            event_source,
            output_messages,
            ..
        } = request;

        let response = self
            .adapter
            .process(AdapterRequest {
                messages,
                actions: action_inputs.clone(),
                thread_id: thread_id.clone(),
                run_id,
                event_source: event_source.clone(),
                forwarded_parameters,
                extensions,
                agent_session,
                agent_states,
            })
            .await?;

        let thread_id = thread_id
            .filter(|id| !id.is_empty())
            .or(Some(response.thread_id).filter(|id| !id.is_empty()))
            .unwrap_or_else(new_id);

        self.middleware.spawn_after(
            output_or_fold(output_messages, &event_source),
            before,
            thread_id.clone(),
        );

        Ok(TurnResponse {
            action_inputs_without_agents: without_agents(action_inputs, &server_actions),
            thread_id,
            run_id: response.run_id,
            event_source,
            server_actions,
            extensions: response.extensions,
        })
    }

    async fn delegate_to_agent(
        &self,
        request: TurnRequest,
        session: AgentSession,
        server_actions: Vec<ServerAction>,
    ) -> Result<TurnResponse> {
        debug!(phase = ?TurnPhase::AgentDelegation, agent = %session.agent_name, "Delegating turn to agent");

        let handler = server_actions
            .iter()
            .find_map(|action| match &action.kind {
                ActionKind::Agent(handler) if action.name() == session.agent_name => Some(handler.clone()),
                _ => None,
            })
            .ok_or_else(|| RuntimeError::AgentDiscovery {
                agent_name: session.agent_name.clone(),
                available: server_actions
                    .iter()
                    .filter(|a| a.is_agent())
                    .map(|a| a.name().to_string())
                    .collect(),
            })?;

        // Every other action, including other agents, but never the agent itself.
        let delegated = dedupe_by_name(
            server_actions
                .iter()
                .filter(|action| !(action.is_agent() && action.name() == session.agent_name))
                .map(|action| action.descriptor.clone())
                .chain(
                    request
                        .client_actions
                        .iter()
                        .filter(|action| action.available != ActionAvailability::Disabled)
                        .map(|action| action.descriptor.clone()),
                ),
        )
        .into_iter()
        .filter(|descriptor| descriptor.name != session.agent_name)
        .collect::<Vec<_>>();

        let thread_id = request
            .thread_id
            .clone()
            .or_else(|| session.thread_id.clone())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(new_id);

        let before = before_request(&request, Some(thread_id.clone()));
        self.middleware.run_before(&before).await.map_err(reclassify)?;

        let state = request
            .agent_states
            .iter()
            .find(|s| s.agent_name == session.agent_name)
            .cloned();

        info!(agent = %session.agent_name, thread_id = %thread_id, "Invoking remote agent");
        let stream = handler
            .invoke(AgentInvocation {
                name: session.agent_name.clone(),
                thread_id: thread_id.clone(),
                node_name: session.node_name.clone(),
                messages: request.messages,
                state,
                meta_events: request.meta_events,
                actions: delegated.clone(),
                context: request.context,
            })
            .await?;
        request.event_source.forward(stream)?;

        self.middleware.spawn_after(
            output_or_fold(request.output_messages, &request.event_source),
            before,
            thread_id.clone(),
        );

        Ok(TurnResponse {
            action_inputs_without_agents: without_agents(delegated, &server_actions),
            thread_id,
            run_id: request.run_id,
            event_source: request.event_source,
            server_actions,
            extensions: request.extensions,
        })
    }
}

fn before_request(request: &TurnRequest, thread_id: Option<String>) -> BeforeRequest {
    BeforeRequest {
        thread_id,
        run_id: request.run_id.clone(),
        input_messages: request.messages.clone(),
        properties: request.context.properties.clone(),
        url: request.context.url.clone(),
        timestamp: Utc::now(),
    }
}

fn output_or_fold(output: Option<OutputMessages>, source: &RuntimeEventSource) -> OutputMessages {
    match output {
        Some(output) => output,
        None => Box::pin(source.output_messages()),
    }
}

fn without_agents(
    actions: Vec<ActionDescriptor>,
    server_actions: &[ServerAction],
) -> Vec<ActionDescriptor> {
    actions
        .into_iter()
        .filter(|descriptor| {
            !server_actions
                .iter()
                .any(|action| action.is_agent() && action.name() == descriptor.name)
        })
        .collect()
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("adapter", &self.adapter.id())
            .field("actions", &self.actions)
            .field("chain_actions", &self.chain_actions)
            .field("endpoints", &self.endpoints.len())
            .field("middleware", &self.middleware)
            .finish()
    }
}
