//! Configuration loading, endpoint normalization, and validation.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;
use crate::types::CallerContext;

/// Top-level switchyard configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter: Option<AdapterConfig>,

    /// Remote endpoints, in priority order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<EndpointDefinition>,

    /// Legacy LangServe chains exposed as server actions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chains: Vec<RemoteChain>,

    /// Let the service adapter handle agent sessions instead of delegating
    /// them to remote agents.
    #[serde(default)]
    pub delegate_agent_processing_to_service_adapter: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

// --- Service adapter ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    #[default]
    Openai,
    Openrouter,
    Ollama,
    /// No completion backend; only agent-locked sessions can be served.
    Empty,
}

/// Configuration for the completion backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdapterConfig {
    #[serde(default)]
    pub kind: AdapterKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl AdapterConfig {
    /// Resolve the API key: check `api_key` field first, then `api_key_env` environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

// --- Remote endpoints ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Direct,
    Platform,
}

/// An agent declared up front for a platform endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclaredAgent {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Produces extra request headers for a direct endpoint from the caller context.
#[derive(Clone)]
pub struct HeaderHook(Arc<dyn Fn(&CallerContext) -> HashMap<String, String> + Send + Sync>);

impl HeaderHook {
    pub fn new(f: impl Fn(&CallerContext) -> HashMap<String, String> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn headers(&self, ctx: &CallerContext) -> HashMap<String, String> {
        (self.0)(ctx)
    }
}

impl std::fmt::Debug for HeaderHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HeaderHook(..)")
    }
}

/// Plain HTTP service exposing `/info`, `/agents/state`, `/agents/execute`
/// and `/actions/execute`.
#[derive(Debug, Clone)]
pub struct DirectEndpoint {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub header_hook: Option<HeaderHook>,
}

impl DirectEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            headers: HashMap::new(),
            header_hook: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_header_hook(mut self, hook: HeaderHook) -> Self {
        self.header_hook = Some(hook);
        self
    }

    /// Full url of a route on this endpoint, e.g. `route("info")`.
    pub fn route(&self, path: &str) -> String {
        format!("{}/{}", self.url, path.trim_start_matches('/'))
    }

    /// Static headers overlaid with whatever the hook returns for `ctx`.
    pub fn request_headers(&self, ctx: &CallerContext) -> HashMap<String, String> {
        let mut headers = self.headers.clone();
        if let Some(hook) = &self.header_hook {
            headers.extend(hook.headers(ctx));
        }
        headers
    }
}

/// Managed agent-hosting service reached through its REST API.
#[derive(Debug, Clone)]
pub struct PlatformEndpoint {
    pub deployment_url: String,
    pub api_key: Option<String>,
    pub agents: Vec<DeclaredAgent>,
}

impl PlatformEndpoint {
    pub fn new(deployment_url: impl Into<String>, api_key: Option<String>, agents: Vec<DeclaredAgent>) -> Self {
        Self {
            deployment_url: deployment_url.into().trim_end_matches('/').to_string(),
            api_key,
            agents,
        }
    }
}

/// A configured endpoint, with its variant resolved once at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "EndpointConfig", into = "EndpointConfig")]
pub enum EndpointDefinition {
    Direct(DirectEndpoint),
    Platform(PlatformEndpoint),
}

impl EndpointDefinition {
    pub fn kind(&self) -> EndpointKind {
        match self {
            Self::Direct(_) => EndpointKind::Direct,
            Self::Platform(_) => EndpointKind::Platform,
        }
    }

    /// Identity used to de-duplicate endpoints: url or deployment url.
    pub fn key(&self) -> &str {
        match self {
            Self::Direct(d) => &d.url,
            Self::Platform(p) => &p.deployment_url,
        }
    }
}

/// Serialized (possibly untagged) form of an endpoint entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<EndpointKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agents: Option<Vec<DeclaredAgent>>,
}

impl EndpointConfig {
    /// Explicit `type` wins; otherwise a deployment url plus an agents list
    /// means platform, anything else is direct.
    pub fn inferred_kind(&self) -> EndpointKind {
        match self.kind {
            Some(kind) => kind,
            None if self.deployment_url.is_some() && self.agents.is_some() => EndpointKind::Platform,
            None => EndpointKind::Direct,
        }
    }
}

impl TryFrom<EndpointConfig> for EndpointDefinition {
    type Error = RuntimeError;

    fn try_from(raw: EndpointConfig) -> Result<Self, Self::Error> {
        match raw.inferred_kind() {
            EndpointKind::Platform => {
                let deployment_url = raw.deployment_url.clone().ok_or_else(|| {
                    RuntimeError::Config("platform endpoint requires `deployment_url`".into())
                })?;
                let api_key = resolve_secret_field(&raw.api_key, &raw.api_key_env);
                Ok(Self::Platform(PlatformEndpoint::new(
                    deployment_url,
                    api_key,
                    raw.agents.unwrap_or_default(),
                )))
            }
            EndpointKind::Direct => {
                let url = raw
                    .url
                    .ok_or_else(|| RuntimeError::Config("direct endpoint requires `url`".into()))?;
                let mut endpoint = DirectEndpoint::new(url);
                endpoint.headers = raw.headers;
                Ok(Self::Direct(endpoint))
            }
        }
    }
}

impl From<EndpointDefinition> for EndpointConfig {
    fn from(def: EndpointDefinition) -> Self {
        match def {
            EndpointDefinition::Direct(d) => Self {
                kind: Some(EndpointKind::Direct),
                url: Some(d.url),
                headers: d.headers,
                ..Self::default()
            },
            EndpointDefinition::Platform(p) => Self {
                kind: Some(EndpointKind::Platform),
                deployment_url: Some(p.deployment_url),
                // Never write resolved secrets back out.
                api_key: p.api_key.map(|_| "********".to_string()),
                agents: Some(p.agents),
                ..Self::default()
            },
        }
    }
}

// --- LangServe chains ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    /// The chain takes one value, sent as `input`.
    Single,
    /// The chain takes an object of named parameters.
    #[default]
    Multi,
}

/// A LangServe chain exposed as a server action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteChain {
    pub chain_url: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema of the parameters; fetched from `/input_schema` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_type: Option<ParameterType>,
}

// --- Logging ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "switchyard_runtime=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> crate::error::Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| RuntimeError::Config(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_default()
        })
        .into_owned())
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Parse config text. Endpoint variants are inferred here, once.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let substituted = substitute_env_vars(raw)?;
        json5::from_str(&substituted).map_err(|e| RuntimeError::Config(e.to_string()))
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Some(adapter) = &self.adapter {
            let needs_key = matches!(adapter.kind, AdapterKind::Openai | AdapterKind::Openrouter);
            if needs_key && adapter.resolve_api_key().is_none() {
                warnings.push(format!("Adapter '{:?}' has no API key configured", adapter.kind));
            }
        }

        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            let key = endpoint.key();
            if !key.starts_with("http://") && !key.starts_with("https://") {
                errors.push(format!("Endpoint url must be http(s): {key}"));
            }
            if !seen.insert(key.to_string()) {
                warnings.push(format!("Duplicate endpoint {key} will be ignored"));
            }
            if let EndpointDefinition::Platform(p) = endpoint {
                if p.agents.is_empty() {
                    warnings.push(format!("Platform endpoint {key} declares no agents"));
                }
            }
        }

        for chain in &self.chains {
            if chain.name.is_empty() {
                errors.push(format!("Chain at {} has no name", chain.chain_url));
            }
        }

        (warnings, errors)
    }
}

/// Base directory for switchyard data: `~/.switchyard/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".switchyard")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_SY_KEY", "sk-test-123") };
        let input = r#"{"key": "${TEST_SY_KEY}", "other": "plain"}"#;
        let result = substitute_env_vars(input).unwrap();
        assert!(result.contains("sk-test-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_SY_KEY") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_SY_TEST}"}"#;
        let result = substitute_env_vars(input).unwrap();
        assert!(result.contains(r#""""#)); // empty string
    }

    #[test]
    fn test_missing_file_is_default() {
        let config = Config::load(Path::new("/nonexistent/switchyard.json")).unwrap();
        assert!(config.endpoints.is_empty());
        assert!(!config.delegate_agent_processing_to_service_adapter);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // comments are fine, this is JSON5
                adapter: { kind: "ollama", model: "llama3" },
                delegate_agent_processing_to_service_adapter: true,
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        let adapter = config.adapter.unwrap();
        assert_eq!(adapter.kind, AdapterKind::Ollama);
        assert_eq!(adapter.model.as_deref(), Some("llama3"));
        assert!(config.delegate_agent_processing_to_service_adapter);
    }

    #[test]
    fn test_untagged_endpoints_are_inferred() {
        let config = Config::parse(
            r#"{
                endpoints: [
                    { url: "http://localhost:8000/copilot/" },
                    { deployment_url: "https://lg.example.com", agents: [{ name: "planner" }] },
                    { deployment_url: "https://lg.example.com/other", url: "http://fallback:9000" },
                ],
            }"#,
        )
        .unwrap();

        assert_eq!(config.endpoints.len(), 3);
        match &config.endpoints[0] {
            EndpointDefinition::Direct(d) => assert_eq!(d.url, "http://localhost:8000/copilot"),
            other => panic!("expected direct, got {other:?}"),
        }
        match &config.endpoints[1] {
            EndpointDefinition::Platform(p) => {
                assert_eq!(p.agents[0].name, "planner");
                assert_eq!(p.agents[0].description, "");
            }
            other => panic!("expected platform, got {other:?}"),
        }
        // A deployment url without an agents list is not enough for platform.
        assert_eq!(config.endpoints[2].kind(), EndpointKind::Direct);
    }

    #[test]
    fn test_explicit_type_wins() {
        let config = Config::parse(
            r#"{ endpoints: [{ type: "platform", deployment_url: "https://lg.example.com" }] }"#,
        )
        .unwrap();
        assert_eq!(config.endpoints[0].kind(), EndpointKind::Platform);
    }

    #[test]
    fn test_direct_without_url_is_config_error() {
        let err = Config::parse(r#"{ endpoints: [{ headers: { "x-a": "1" } }] }"#).unwrap_err();
        assert!(matches!(err, RuntimeError::Config(_)));
        assert!(err.to_string().contains("url"));
    }

    #[test]
    fn test_header_hook_overrides_static_headers() {
        let endpoint = DirectEndpoint::new("http://localhost:8000")
            .with_header("x-team", "static")
            .with_header("x-keep", "yes")
            .with_header_hook(HeaderHook::new(|ctx: &CallerContext| {
                let mut headers = HashMap::new();
                if let Some(user) = ctx.properties.get("user").and_then(|v| v.as_str()) {
                    headers.insert("x-team".to_string(), user.to_string());
                }
                headers
            }));

        let mut props = serde_json::Map::new();
        props.insert("user".into(), serde_json::json!("alice"));
        let headers = endpoint.request_headers(&CallerContext::with_properties(props));
        assert_eq!(headers["x-team"], "alice");
        assert_eq!(headers["x-keep"], "yes");
        assert_eq!(endpoint.route("/info"), "http://localhost:8000/info");
    }

    #[test]
    fn test_logging_config_defaults() {
        let config = Config::parse(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_adapter_resolve_api_key() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_SY_API_KEY", "from-env") };
        let adapter = AdapterConfig {
            api_key_env: Some("TEST_SY_API_KEY".into()),
            ..AdapterConfig::default()
        };
        assert_eq!(adapter.resolve_api_key(), Some("from-env".into()));

        let direct = AdapterConfig {
            api_key: Some("direct-key".into()),
            api_key_env: Some("TEST_SY_API_KEY".into()),
            ..AdapterConfig::default()
        };
        // Direct key takes priority
        assert_eq!(direct.resolve_api_key(), Some("direct-key".into()));
        unsafe { std::env::remove_var("TEST_SY_API_KEY") };
    }

    #[test]
    fn test_validate_flags_duplicates_and_bad_urls() {
        let config = Config::parse(
            r#"{
                adapter: { kind: "openai" },
                endpoints: [
                    { url: "http://a.example.com" },
                    { url: "http://a.example.com/" },
                    { url: "ftp://b.example.com" },
                ],
            }"#,
        )
        .unwrap();
        let (warnings, errors) = config.validate();
        assert!(warnings.iter().any(|w| w.contains("Duplicate endpoint")));
        assert!(warnings.iter().any(|w| w.to_lowercase().contains("api key")));
        assert!(errors.iter().any(|e| e.contains("ftp://b.example.com")));
    }

    #[test]
    fn test_platform_key_is_masked_when_serialized() {
        let def = EndpointDefinition::Platform(PlatformEndpoint::new(
            "https://lg.example.com",
            Some("secret".into()),
            vec![],
        ));
        let json = serde_json::to_string(&def).unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains("\"type\":\"platform\""));
    }
}
