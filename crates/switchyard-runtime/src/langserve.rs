//! LangServe chains exposed as callable server actions.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, warn};

use switchyard_core::config::{ParameterType, RemoteChain};
use switchyard_core::error::{Result, RuntimeError};
use switchyard_core::types::{ActionDescriptor, CallerContext};

use crate::actions::{ActionHandler, ServerAction};

struct ChainHandler {
    http: reqwest::Client,
    chain_url: String,
    parameter_type: ParameterType,
}

#[async_trait]
impl ActionHandler for ChainHandler {
    async fn call(&self, arguments: Value, _context: &CallerContext) -> anyhow::Result<Value> {
        let input = match self.parameter_type {
            ParameterType::Single => arguments.get("input").cloned().unwrap_or(arguments),
            ParameterType::Multi => arguments,
        };

        let url = format!("{}/invoke", self.chain_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({ "input": input }))
            .send()
            .await
            .map_err(|e| RuntimeError::transport(url.clone(), e))?;
        if !response.status().is_success() {
            return Err(RuntimeError::from_status(url, response.status().as_u16()).into());
        }

        let mut body: Value = response.json().await?;
        Ok(body.get_mut("output").map(Value::take).unwrap_or(Value::Null))
    }
}

/// Build the action for one chain, fetching its input schema if needed.
async fn resolve_chain(http: &reqwest::Client, chain: &RemoteChain) -> Result<ServerAction> {
    let chain_url = chain.chain_url.trim_end_matches('/').to_string();

    let (parameters, parameter_type) = match &chain.parameters {
        Some(parameters) => (
            parameters.clone(),
            chain.parameter_type.unwrap_or_default(),
        ),
        None => {
            let url = format!("{chain_url}/input_schema");
            let response = http
                .get(&url)
                .send()
                .await
                .map_err(|e| RuntimeError::transport(url.clone(), e))?;
            if !response.status().is_success() {
                return Err(RuntimeError::from_status(url, response.status().as_u16()));
            }
            let schema: Value = response
                .json()
                .await
                .map_err(|e| RuntimeError::transport(url, e))?;
            schema_to_parameters(schema)
        }
    };

    let descriptor = ActionDescriptor::new(chain.name.clone(), chain.description.clone(), parameters);
    Ok(ServerAction::new(
        descriptor,
        ChainHandler {
            http: http.clone(),
            chain_url,
            parameter_type,
        },
    ))
}

/// Object schemas are used as-is; anything else is wrapped as one `input`.
fn schema_to_parameters(schema: Value) -> (Value, ParameterType) {
    if schema.get("type").and_then(Value::as_str) == Some("object") && schema.get("properties").is_some() {
        (schema, ParameterType::Multi)
    } else {
        let wrapped = json!({
            "type": "object",
            "properties": { "input": schema },
            "required": ["input"],
        });
        (wrapped, ParameterType::Single)
    }
}

/// Resolve every chain once; chains that fail to resolve are skipped.
pub async fn resolve_chains(http: &reqwest::Client, chains: &[RemoteChain]) -> Vec<ServerAction> {
    let resolved = futures::future::join_all(chains.iter().map(|chain| resolve_chain(http, chain))).await;

    chains
        .iter()
        .zip(resolved)
        .filter_map(|(chain, result)| match result {
            Ok(action) => {
                debug!(chain = %chain.name, "Resolved LangServe chain");
                Some(action)
            }
            Err(e) => {
                warn!(chain = %chain.name, url = %chain.chain_url, error = %e, "Skipping LangServe chain");
                None
            }
        })
        .collect()
}
