mod logging;

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{Map, Value, json};
use tokio_stream::StreamExt;

use switchyard_core::config::Config;
use switchyard_core::events::RuntimeEvent;
use switchyard_core::types::{AgentSession, CallerContext, Message};
use switchyard_runtime::{Runtime, ServerAction, TurnRequest};

#[derive(Parser)]
#[command(
    name = "switchyard",
    about = "Route conversational turns to an LLM service or to remote agents",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Machine-readable output
    #[arg(long, global = true)]
    json: bool,

    /// Caller property forwarded to endpoints, as key=value (repeatable)
    #[arg(short = 'p', long = "property", global = true, value_parser = parse_property)]
    properties: Vec<(String, String)>,
}

#[derive(Subcommand)]
enum Commands {
    /// List agents offered by the configured endpoints
    Agents,

    /// List the server actions available to a turn
    Actions,

    /// Print an agent's state for a thread
    State {
        #[arg(long)]
        thread: String,

        #[arg(long)]
        agent: String,
    },

    /// Process a single turn and stream the reply
    Chat {
        /// Message to send
        #[arg(short, long)]
        message: String,

        /// Delegate the turn to this agent
        #[arg(long)]
        agent: Option<String>,

        /// Agent node to resume at
        #[arg(long, requires = "agent")]
        node: Option<String>,

        /// Continue an existing thread
        #[arg(long)]
        thread: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Check the configuration for problems
    Validate,
}

fn parse_property(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .as_deref()
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    logging::init(config.logging.as_ref(), cli.verbose);

    let context = CallerContext::with_properties(
        cli.properties
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect::<Map<_, _>>(),
    );

    match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s) in {}", errors.len(), config_path.display());
                }
                println!("Config OK: {}", config_path.display());
            }
        },
        Commands::Agents => {
            let runtime = Runtime::builder_from_config(&config).build().await;
            let agents = runtime.discover_agents(&context).await?;
            if cli.json {
                let listed: Vec<Value> = agents
                    .iter()
                    .map(|a| {
                        json!({
                            "name": a.name,
                            "id": a.id,
                            "description": a.description,
                            "endpoint": a.endpoint.key(),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&listed)?);
            } else if agents.is_empty() {
                println!("No agents found");
            } else {
                for agent in &agents {
                    println!("{:<24} {:<38} {}", agent.name, agent.id, agent.endpoint.key());
                }
            }
        }
        Commands::Actions => {
            let runtime = Runtime::builder_from_config(&config).build().await;
            let actions = runtime.server_actions(&context).await?;
            if cli.json {
                let listed: Vec<Value> = actions
                    .iter()
                    .map(|a| json!({ "agent": a.is_agent(), "action": a.descriptor }))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&listed)?);
            } else {
                for action in &actions {
                    let kind = if action.is_agent() { "agent" } else { "action" };
                    println!("{:<24} {:<7} {}", action.name(), kind, action.descriptor.description);
                }
            }
        }
        Commands::State { thread, agent } => {
            let runtime = Runtime::builder_from_config(&config).build().await;
            let snapshot = runtime.load_agent_state(&context, &thread, &agent).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Commands::Chat {
            message,
            agent,
            node,
            thread,
        } => {
            let runtime = Runtime::builder_from_config(&config).build().await;
            chat(&runtime, context, message, agent, node, thread, cli.json).await?;
        }
    }

    Ok(())
}

/// Run one turn, print its events, and execute callable actions it requests.
async fn chat(
    runtime: &Runtime,
    context: CallerContext,
    message: String,
    agent: Option<String>,
    node: Option<String>,
    thread: Option<String>,
    json_output: bool,
) -> anyhow::Result<()> {
    let mut request = TurnRequest::new(vec![Message::user(message)]);
    request.context = context.clone();
    request.thread_id = thread;
    request.agent_session = agent.map(|agent_name| AgentSession {
        agent_name,
        node_name: node,
        thread_id: None,
    });

    // Subscribe first so a failed turn's error message is not missed.
    let mut events = request.event_source.subscribe();
    let response = runtime.process_turn(request).await?;
    tracing::debug!(thread_id = %response.thread_id, "Turn started");

    let callable: HashMap<&str, &ServerAction> = response
        .server_actions
        .iter()
        .filter(|a| !a.is_agent())
        .map(|a| (a.name(), a))
        .collect();
    let mut pending: HashMap<String, (String, String)> = HashMap::new();

    while let Some(item) = events.next().await {
        let event = match item {
            Ok(event) => event,
            Err(failure) => anyhow::bail!("turn failed: {failure}"),
        };
        if json_output {
            println!("{}", serde_json::to_string(&event)?);
        }

        match event {
            RuntimeEvent::TextMessageContent { content, .. } if !json_output => {
                print!("{content}");
                std::io::stdout().flush()?;
            }
            RuntimeEvent::TextMessageEnd { .. } if !json_output => println!(),
            RuntimeEvent::ActionExecutionStart {
                action_execution_id,
                action_name,
                ..
            } => {
                pending.insert(action_execution_id, (action_name, String::new()));
            }
            RuntimeEvent::ActionExecutionArgs {
                action_execution_id,
                args,
            } => {
                if let Some((_, buffered)) = pending.get_mut(&action_execution_id) {
                    buffered.push_str(&args);
                }
            }
            RuntimeEvent::ActionExecutionEnd { action_execution_id } => {
                let Some((name, args)) = pending.remove(&action_execution_id) else {
                    continue;
                };
                if !json_output {
                    println!("-> {name}({args})");
                }
                let Some(action) = callable.get(name.as_str()) else {
                    continue;
                };
                let arguments: Value = if args.trim().is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&args).with_context(|| format!("arguments for {name}"))?
                };
                match action.execute(arguments, &context).await {
                    Ok(result) if json_output => println!(
                        "{}",
                        json!({ "type": "LocalActionResult", "actionName": name, "result": result })
                    ),
                    Ok(result) => println!("<- {name}: {result}"),
                    Err(e) => eprintln!("<- {name} failed: {e}"),
                }
            }
            RuntimeEvent::RunError { message } if !json_output => eprintln!("error: {message}"),
            _ => {}
        }
    }

    if !json_output {
        println!("[thread {}]", response.thread_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_property() {
        assert_eq!(
            parse_property("authorization=abc=").unwrap(),
            ("authorization".to_string(), "abc=".to_string())
        );
        assert!(parse_property("novalue").is_err());
        assert!(parse_property("=x").is_err());
    }

    #[test]
    fn test_cli_parses_chat() {
        let cli = Cli::try_parse_from([
            "switchyard", "chat", "-m", "hi", "--agent", "planner", "--node", "draft", "--json",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Chat { message, agent, node, thread } => {
                assert_eq!(message, "hi");
                assert_eq!(agent.as_deref(), Some("planner"));
                assert_eq!(node.as_deref(), Some("draft"));
                assert!(thread.is_none());
            }
            _ => panic!("expected chat"),
        }
    }

    #[test]
    fn test_node_requires_agent() {
        assert!(Cli::try_parse_from(["switchyard", "chat", "-m", "hi", "--node", "x"]).is_err());
    }
}
