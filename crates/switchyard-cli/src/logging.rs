use switchyard_core::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Filter directives: `RUST_LOG` wins, then `--verbose`, then the config.
fn directives(logging: &LoggingConfig, verbose: bool) -> String {
    let level = if verbose {
        "debug"
    } else {
        logging.level.as_deref().unwrap_or("info")
    };
    std::iter::once(level.to_string())
        .chain(logging.filters.iter().cloned())
        .collect::<Vec<_>>()
        .join(",")
}

pub fn init(logging: Option<&LoggingConfig>, verbose: bool) {
    let defaults = LoggingConfig::default();
    let logging = logging.unwrap_or(&defaults);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives(logging, verbose)));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match (logging.format.as_str(), logging.output.as_str()) {
        ("json", "stdout") => builder.json().with_writer(std::io::stdout).init(),
        ("json", _) => builder.json().with_writer(std::io::stderr).init(),
        (_, "stdout") => builder.with_writer(std::io::stdout).init(),
        _ => builder.with_writer(std::io::stderr).init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_info() {
        assert_eq!(directives(&LoggingConfig::default(), false), "info");
    }

    #[test]
    fn test_verbose_overrides_level_but_keeps_filters() {
        let logging = LoggingConfig {
            level: Some("warn".into()),
            filters: vec!["switchyard_runtime=trace".into()],
            ..LoggingConfig::default()
        };
        assert_eq!(directives(&logging, false), "warn,switchyard_runtime=trace");
        assert_eq!(directives(&logging, true), "debug,switchyard_runtime=trace");
    }
}
