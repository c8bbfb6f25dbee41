//! Agent discovery and remote action setup across configured endpoints.
//!
//! Results always follow endpoint configuration order, even where requests
//! run concurrently, because name collisions are settled first-seen-wins.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::try_join_all;
use tracing::debug;

use switchyard_core::config::EndpointDefinition;
use switchyard_core::error::{Result, RuntimeError};
use switchyard_core::types::{Agent, CallerContext};

use crate::actions::ServerAction;
use crate::platform::{PlatformClient, platform_actions};
use crate::remote::{direct_actions, fetch_info};

/// Drop endpoints whose url was already seen, keeping the first.
pub fn unique_endpoints(endpoints: &[Arc<EndpointDefinition>]) -> Vec<Arc<EndpointDefinition>> {
    let mut seen = HashSet::new();
    endpoints
        .iter()
        .filter(|endpoint| seen.insert(endpoint.key().to_string()))
        .cloned()
        .collect()
}

/// Agents offered by a single endpoint.
async fn agents_of(
    http: &reqwest::Client,
    endpoint: &Arc<EndpointDefinition>,
    context: &CallerContext,
) -> Result<Vec<Agent>> {
    match endpoint.as_ref() {
        EndpointDefinition::Platform(platform) => {
            let client = PlatformClient::new(http, platform, context);
            let assistants = client.search_assistants().await?;
            Ok(assistants
                .into_iter()
                .map(|assistant| Agent {
                    name: assistant.graph_id,
                    id: assistant.assistant_id,
                    description: String::new(),
                    endpoint: endpoint.clone(),
                })
                .collect())
        }
        EndpointDefinition::Direct(direct) => {
            let info = fetch_info(http, direct, context).await?;
            Ok(info
                .agents
                .into_iter()
                .map(|agent| Agent {
                    id: agent.resolved_id(),
                    name: agent.name,
                    description: agent.description,
                    endpoint: endpoint.clone(),
                })
                .collect())
        }
    }
}

/// Every agent across `endpoints`, in endpoint order.
///
/// Endpoints are queried one after another; the first failure aborts the
/// whole discovery.
pub async fn discover_agents(
    http: &reqwest::Client,
    endpoints: &[Arc<EndpointDefinition>],
    context: &CallerContext,
) -> Result<Vec<Agent>> {
    let mut agents = Vec::new();
    for endpoint in unique_endpoints(endpoints) {
        let found = agents_of(http, &endpoint, context).await?;
        debug!(endpoint = %endpoint.key(), count = found.len(), "Discovered agents");
        agents.extend(found);
    }
    Ok(agents)
}

/// Server actions contributed by the endpoints, in endpoint order.
///
/// Direct endpoints are asked for `/info` concurrently; platform endpoints
/// contribute their declared agents without a network call.
pub async fn setup_remote_actions(
    http: &reqwest::Client,
    endpoints: &[Arc<EndpointDefinition>],
    context: &CallerContext,
) -> Result<Vec<ServerAction>> {
    let per_endpoint = try_join_all(unique_endpoints(endpoints).into_iter().map(|endpoint| async move {
        match endpoint.as_ref() {
            EndpointDefinition::Platform(platform) => {
                Ok::<_, RuntimeError>(platform_actions(http, &Arc::new(platform.clone())))
            }
            EndpointDefinition::Direct(direct) => {
                let info = fetch_info(http, direct, context).await?;
                Ok(direct_actions(http, &Arc::new(direct.clone()), info))
            }
        }
    }))
    .await?;

    Ok(per_endpoint.into_iter().flatten().collect())
}
