//! Switchyard runtime: routes conversational turns to a service adapter or
//! a remote agent.
//!
//! A [`Runtime`] merges server-side actions from static registrations, a
//! per-request factory, LangServe chains and remote endpoints, then either
//! hands the turn to its [`ServiceAdapter`](switchyard_providers::ServiceAdapter)
//! or delegates it to a remote agent and forwards the agent's event stream.

pub mod actions;
pub mod agent_state;
pub mod discovery;
pub mod langchain;
pub mod langserve;
pub mod middleware;
pub mod platform;
pub mod processor;
pub mod remote;

pub use actions::{ActionHandler, AgentHandler, AgentInvocation, ServerAction};
pub use middleware::{AfterRequest, BeforeRequest};
pub use processor::{Runtime, RuntimeBuilder, TurnRequest, TurnResponse};
