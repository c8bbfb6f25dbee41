use thiserror::Error;

/// Boxed source error carried by transport failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime was configured in a way that cannot serve the request.
    #[error("Misuse: {0}")]
    Misuse(String),

    /// The endpoint answered 404 on one of its routes.
    #[error(
        "Failed to find a compatible endpoint at {url}. Make sure the endpoint exists and exposes the runtime routes"
    )]
    EndpointNotFound { url: String },

    /// Network, DNS or non-2xx failure talking to an endpoint.
    #[error("{}", low_level_message(.url, .status, .is_remote_endpoint, .source))]
    LowLevel {
        url: String,
        is_remote_endpoint: bool,
        status: Option<u16>,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Agent '{agent_name}' was not found. Available agents: {}", format_names(.available))]
    AgentDiscovery {
        agent_name: String,
        available: Vec<String>,
    },

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RuntimeError {
    /// Transport failure with an underlying cause (connection refused, DNS, body decode).
    pub fn transport(url: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::LowLevel {
            url: url.into(),
            is_remote_endpoint: true,
            status: None,
            source: Some(source.into()),
        }
    }

    /// Classify a non-2xx status returned by a remote endpoint.
    pub fn from_status(url: impl Into<String>, status: u16) -> Self {
        let url = url.into();
        if status == 404 {
            Self::EndpointNotFound { url }
        } else {
            Self::LowLevel {
                url,
                is_remote_endpoint: true,
                status: Some(status),
                source: None,
            }
        }
    }

    /// True for errors that already carry caller-actionable detail.
    ///
    /// These pass through the processor unchanged and skip the generic
    /// chat-visible error event.
    pub fn is_classified(&self) -> bool {
        !matches!(self, Self::Other(_) | Self::Io(_) | Self::Json(_))
    }

    /// Short machine-readable kind, used in logs and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Misuse(_) => "misuse",
            Self::EndpointNotFound { .. } => "endpoint_not_found",
            Self::LowLevel { .. } => "low_level",
            Self::AgentDiscovery { .. } => "agent_discovery",
            Self::Config(_) => "config",
            Self::Io(_) | Self::Json(_) | Self::Other(_) => "unclassified",
        }
    }
}

fn low_level_message(
    url: &str,
    status: &Option<u16>,
    is_remote_endpoint: &bool,
    source: &Option<BoxError>,
) -> String {
    let target = if *is_remote_endpoint {
        "remote endpoint"
    } else {
        "service"
    };
    match (status, source) {
        (Some(status), _) => format!("Request to {target} {url} failed with status {status}"),
        (None, Some(source)) => format!("Failed to reach {target} {url}: {source}"),
        (None, None) => format!("Failed to reach {target} {url}"),
    }
}

fn format_names(names: &[String]) -> String {
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(", ")
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
