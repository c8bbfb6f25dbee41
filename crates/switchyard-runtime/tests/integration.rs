//! End-to-end turns against mocked direct, platform and LangServe endpoints.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use switchyard_core::config::{DirectEndpoint, EndpointDefinition, PlatformEndpoint, RemoteChain};
use switchyard_core::error::RuntimeError;
use switchyard_core::events::StreamFailure;
use switchyard_core::types::{AgentSession, AgentStateSnapshot, CallerContext, Message};
use switchyard_runtime::{Runtime, TurnRequest};

fn direct(server: &MockServer) -> EndpointDefinition {
    EndpointDefinition::Direct(DirectEndpoint::new(server.uri()))
}

async fn mount_info(server: &MockServer, body: Value) {
    Mock::given(method("POST"))
        .and(path("/info"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

fn ndjson(events: &[Value]) -> String {
    events.iter().map(|e| format!("{e}\n")).collect()
}

fn session(agent: &str) -> Option<AgentSession> {
    Some(AgentSession {
        agent_name: agent.into(),
        node_name: None,
        thread_id: None,
    })
}

#[tokio::test]
async fn test_discovery_is_stable_up_to_ids() {
    let server = MockServer::start().await;
    mount_info(
        &server,
        json!({
            "actions": [],
            "agents": [
                { "name": "planner", "description": "Plans trips" },
                { "name": "writer", "description": "Writes copy" }
            ]
        }),
    )
    .await;

    let runtime = Runtime::builder().endpoint(direct(&server)).build().await;
    let ctx = CallerContext::default();
    let first = runtime.discover_agents(&ctx).await.unwrap();
    let second = runtime.discover_agents(&ctx).await.unwrap();

    assert_eq!(first.len(), 2);
    assert_eq!(first[0].name, "planner");
    assert_eq!(first[1].name, "writer");
    for (a, b) in first.iter().zip(&second) {
        assert!(a.same_shape(b));
    }
}

#[tokio::test]
async fn test_discovery_failures_are_classified() {
    let missing = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/info"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&missing)
        .await;
    let runtime = Runtime::builder().endpoint(direct(&missing)).build().await;
    let err = runtime.discover_agents(&CallerContext::default()).await.unwrap_err();
    assert!(matches!(err, RuntimeError::EndpointNotFound { .. }));

    let broken = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/info"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&broken)
        .await;
    let runtime = Runtime::builder().endpoint(direct(&broken)).build().await;
    let err = runtime.discover_agents(&CallerContext::default()).await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::LowLevel { status: Some(500), is_remote_endpoint: true, .. }
    ));

    let runtime = Runtime::builder()
        .endpoint(EndpointDefinition::Direct(DirectEndpoint::new("http://127.0.0.1:1")))
        .build()
        .await;
    let err = runtime.discover_agents(&CallerContext::default()).await.unwrap_err();
    match err {
        RuntimeError::LowLevel { status, source, .. } => {
            assert!(status.is_none());
            assert!(source.is_some());
        }
        other => panic!("expected a transport failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_platform_state_failure_reads_as_empty() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/assistants/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "assistant_id": "asst-1", "graph_id": "planner" }
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/threads/t-1/state"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let runtime = Runtime::builder()
        .endpoint(EndpointDefinition::Platform(PlatformEndpoint::new(
            server.uri(),
            None,
            Vec::new(),
        )))
        .build()
        .await;
    let snapshot = runtime
        .load_agent_state(&CallerContext::default(), "t-1", "planner")
        .await
        .unwrap();
    assert_eq!(snapshot, AgentStateSnapshot::empty("t-1"));
}

#[tokio::test]
async fn test_direct_state_is_passed_through() {
    let server = MockServer::start().await;
    mount_info(&server, json!({ "agents": [{ "name": "planner" }] })).await;
    Mock::given(method("POST"))
        .and(path("/agents/state"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "threadExists": true,
            "state": { "step": 2 },
            "messages": []
        })))
        .mount(&server)
        .await;

    let runtime = Runtime::builder().endpoint(direct(&server)).build().await;
    let snapshot = runtime
        .load_agent_state(&CallerContext::default(), "t-9", "planner")
        .await
        .unwrap();
    assert!(snapshot.thread_exists);
    assert_eq!(snapshot.state, r#"{"step":2}"#);
    assert_eq!(snapshot.messages, "[]");
}

#[tokio::test]
async fn test_unknown_agent_never_reaches_the_endpoint() {
    let server = MockServer::start().await;
    mount_info(&server, json!({ "agents": [{ "name": "planner" }] })).await;
    Mock::given(method("POST"))
        .and(path("/agents/execute"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let runtime = Runtime::builder().endpoint(direct(&server)).build().await;
    let mut request = TurnRequest::new(vec![Message::user("hi")]);
    request.agent_session = session("ghost");

    let err = runtime.process_turn(request).await.unwrap_err();
    match err {
        RuntimeError::AgentDiscovery { agent_name, available } => {
            assert_eq!(agent_name, "ghost");
            assert_eq!(available, vec!["planner".to_string()]);
        }
        other => panic!("expected an agent discovery error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_delegated_turn_forwards_events_without_self() {
    let server = MockServer::start().await;
    mount_info(
        &server,
        json!({
            "actions": [{ "name": "lookup", "description": "", "parameters": { "type": "object" } }],
            "agents": [{ "name": "planner" }, { "name": "writer" }]
        }),
    )
    .await;
    let body = ndjson(&[
        json!({ "type": "TextMessageStart", "messageId": "m1" }),
        json!({ "type": "TextMessageContent", "messageId": "m1", "content": "On " }),
        json!({ "type": "TextMessageContent", "messageId": "m1", "content": "it." }),
        json!({ "type": "TextMessageEnd", "messageId": "m1" }),
    ]);
    Mock::given(method("POST"))
        .and(path("/agents/execute"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .expect(1)
        .mount(&server)
        .await;

    let runtime = Runtime::builder().endpoint(direct(&server)).build().await;
    let mut request = TurnRequest::new(vec![Message::user("plan a trip")]);
    request.agent_session = session("planner");
    request.thread_id = Some("t-42".into());

    let response = runtime.process_turn(request).await.unwrap();
    assert_eq!(response.thread_id, "t-42");

    let messages = response.event_source.output_messages().await.unwrap();
    assert_eq!(messages.len(), 1);
    match &messages[0] {
        Message::Assistant { content, .. } => assert_eq!(content.as_deref(), Some("On it.")),
        other => panic!("unexpected message: {other:?}"),
    }

    let requests = server.received_requests().await.unwrap();
    let execute = requests
        .iter()
        .find(|r| r.url.path() == "/agents/execute")
        .unwrap();
    let sent: Value = execute.body_json().unwrap();
    assert_eq!(sent["name"], "planner");
    assert_eq!(sent["threadId"], "t-42");
    let offered: Vec<&str> = sent["actions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["name"].as_str().unwrap())
        .collect();
    assert_eq!(offered, vec!["lookup", "writer"]);
}

#[tokio::test]
async fn test_after_hook_errors_do_not_reach_the_caller() {
    let server = MockServer::start().await;
    mount_info(&server, json!({ "agents": [{ "name": "planner" }] })).await;
    Mock::given(method("POST"))
        .and(path("/agents/execute"))
        .respond_with(ResponseTemplate::new(200).set_body_string(ndjson(&[
            json!({ "type": "TextMessageStart", "messageId": "m1" }),
            json!({ "type": "TextMessageEnd", "messageId": "m1" }),
        ])))
        .mount(&server)
        .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let runtime = Runtime::builder()
        .endpoint(direct(&server))
        .on_after_request(Arc::new(|_req| {
            Box::pin(async { Err(anyhow::anyhow!("audit sink offline")) })
        }))
        .on_after_request(Arc::new(move |req| {
            let tx = tx.clone();
            Box::pin(async move {
                tx.send((req.thread_id, req.output_messages.len()))?;
                Ok(())
            })
        }))
        .build()
        .await;

    let mut request = TurnRequest::new(vec![Message::user("hi")]);
    request.agent_session = session("planner");
    request.thread_id = Some("t-7".into());
    runtime.process_turn(request).await.unwrap();

    let (thread_id, outputs) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(thread_id, "t-7");
    assert_eq!(outputs, 1);
}

#[tokio::test]
async fn test_remote_action_executes_on_its_endpoint() {
    let server = MockServer::start().await;
    mount_info(
        &server,
        json!({ "actions": [{ "name": "lookup", "description": "Find a record", "parameters": {} }] }),
    )
    .await;
    Mock::given(method("POST"))
        .and(path("/actions/execute"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": { "id": 42 } })))
        .mount(&server)
        .await;

    let runtime = Runtime::builder().endpoint(direct(&server)).build().await;
    let ctx = CallerContext::default();
    let actions = runtime.server_actions(&ctx).await.unwrap();
    assert_eq!(actions.len(), 1);

    let result = actions[0].execute(json!({ "q": "x" }), &ctx).await.unwrap();
    assert_eq!(result, json!({ "id": 42 }));

    let requests = server.received_requests().await.unwrap();
    let execute = requests
        .iter()
        .find(|r| r.url.path() == "/actions/execute")
        .unwrap();
    let sent: Value = execute.body_json().unwrap();
    assert_eq!(sent["name"], "lookup");
    assert_eq!(sent["arguments"]["q"], "x");
}

#[tokio::test]
async fn test_langserve_chain_is_resolved_and_invoked() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/summarize/input_schema"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "type": "string" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/summarize/invoke"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "output": "short" })))
        .mount(&server)
        .await;

    let runtime = Runtime::builder()
        .chain(RemoteChain {
            chain_url: format!("{}/summarize", server.uri()),
            name: "summarize".into(),
            description: "Summarize text".into(),
            parameters: None,
            parameter_type: None,
        })
        .chain(RemoteChain {
            chain_url: "http://127.0.0.1:1/gone".into(),
            name: "gone".into(),
            description: String::new(),
            parameters: None,
            parameter_type: None,
        })
        .build()
        .await;

    let ctx = CallerContext::default();
    let actions = runtime.server_actions(&ctx).await.unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].name(), "summarize");

    let result = actions[0]
        .execute(json!({ "input": "a long text" }), &ctx)
        .await
        .unwrap();
    assert_eq!(result, json!("short"));

    let requests = server.received_requests().await.unwrap();
    let invoke = requests
        .iter()
        .find(|r| r.url.path() == "/summarize/invoke")
        .unwrap();
    let sent: Value = invoke.body_json().unwrap();
    assert_eq!(sent, json!({ "input": "a long text" }));
}

#[tokio::test]
async fn test_platform_run_streams_text_and_state() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/threads"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "thread_id": "t-3" })))
        .expect(1)
        .mount(&server)
        .await;

    let frames = [
        ("metadata", json!({ "run_id": "r-1" })),
        (
            "events",
            json!({
                "event": "on_chat_model_stream",
                "metadata": { "langgraph_node": "plan" },
                "data": { "chunk": { "id": "msg-1", "content": "Booked." } }
            }),
        ),
        ("events", json!({ "event": "on_chat_model_end", "data": {} })),
        ("values", json!({ "itinerary": ["Lisbon"], "messages": [] })),
    ];
    let sse: String = frames
        .iter()
        .map(|(event, data)| format!("event: {event}\ndata: {data}\n\n"))
        .collect();
    Mock::given(method("POST"))
        .and(path("/threads/t-3/runs/stream"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse),
        )
        .expect(1)
        .mount(&server)
        .await;

    let runtime = Runtime::builder()
        .endpoint(EndpointDefinition::Platform(PlatformEndpoint::new(
            server.uri(),
            Some("lsv2-key".into()),
            vec![switchyard_core::config::DeclaredAgent {
                name: "planner".into(),
                description: "Plans trips".into(),
            }],
        )))
        .build()
        .await;

    let mut request = TurnRequest::new(vec![Message::user("book it")]);
    request.agent_session = session("planner");
    request.thread_id = Some("t-3".into());
    let response = runtime.process_turn(request).await.unwrap();

    let messages = response.event_source.output_messages().await.unwrap();
    assert_eq!(messages.len(), 1);
    match &messages[0] {
        Message::Assistant { content, .. } => assert_eq!(content.as_deref(), Some("Booked.")),
        other => panic!("unexpected message: {other:?}"),
    }

    let states: Vec<(String, bool)> = response
        .event_source
        .events()
        .into_iter()
        .filter_map(|event| match event {
            switchyard_core::events::RuntimeEvent::AgentStateMessage { state, running, .. } => {
                Some((state, running))
            }
            _ => None,
        })
        .collect();
    assert_eq!(states.len(), 2);
    assert!(states[0].1);
    assert!(!states[1].1);
    assert_eq!(states[1].0, r#"{"itinerary":["Lisbon"]}"#);

    let requests = server.received_requests().await.unwrap();
    let run = requests
        .iter()
        .find(|r| r.url.path() == "/threads/t-3/runs/stream")
        .unwrap();
    assert_eq!(run.headers.get("x-api-key").unwrap(), "lsv2-key");
}

#[tokio::test]
async fn test_endpoints_accumulate_in_configuration_order() {
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    // The first endpoint answers last; order must still follow configuration.
    Mock::given(method("POST"))
        .and(path("/info"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "actions": [{ "name": "x", "description": "from first" }],
                    "agents": [{ "name": "dup", "description": "first agent" }]
                }))
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&first)
        .await;
    mount_info(
        &second,
        json!({
            "actions": [{ "name": "x", "description": "from second" }],
            "agents": [{ "name": "dup", "description": "second agent" }]
        }),
    )
    .await;

    let runtime = Runtime::builder()
        .endpoint(direct(&first))
        .endpoint(direct(&second))
        .build()
        .await;
    let ctx = CallerContext::default();

    let agents = runtime.discover_agents(&ctx).await.unwrap();
    assert_eq!(agents.len(), 2);
    assert_eq!(agents[0].description, "first agent");
    assert_eq!(agents[0].endpoint.key(), first.uri());
    assert_eq!(agents[1].endpoint.key(), second.uri());

    let actions = runtime.server_actions(&ctx).await.unwrap();
    let described: Vec<(&str, &str)> = actions
        .iter()
        .map(|a| (a.name(), a.descriptor.description.as_str()))
        .collect();
    assert_eq!(described, vec![("x", "from first"), ("dup", "first agent")]);
}

#[tokio::test]
async fn test_one_missing_endpoint_aborts_discovery() {
    let healthy = MockServer::start().await;
    mount_info(&healthy, json!({ "agents": [{ "name": "planner" }] })).await;
    let missing = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/info"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&missing)
        .await;

    let runtime = Runtime::builder()
        .endpoint(direct(&healthy))
        .endpoint(direct(&missing))
        .build()
        .await;
    let ctx = CallerContext::default();

    let err = runtime.discover_agents(&ctx).await.unwrap_err();
    assert!(matches!(err, RuntimeError::EndpointNotFound { ref url } if url.starts_with(&missing.uri())));
    let err = runtime.server_actions(&ctx).await.unwrap_err();
    assert!(matches!(err, RuntimeError::EndpointNotFound { .. }));
}

#[tokio::test]
async fn test_missing_state_route_is_endpoint_not_found() {
    let server = MockServer::start().await;
    mount_info(&server, json!({ "agents": [{ "name": "planner" }] })).await;
    Mock::given(method("POST"))
        .and(path("/agents/state"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let runtime = Runtime::builder().endpoint(direct(&server)).build().await;
    let err = runtime
        .load_agent_state(&CallerContext::default(), "t-1", "planner")
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::EndpointNotFound { ref url } if url.ends_with("/agents/state")));
}

#[tokio::test]
async fn test_missing_execute_route_fails_delegated_turn() {
    let server = MockServer::start().await;
    mount_info(&server, json!({ "agents": [{ "name": "planner" }] })).await;
    Mock::given(method("POST"))
        .and(path("/agents/execute"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let runtime = Runtime::builder().endpoint(direct(&server)).build().await;
    let mut request = TurnRequest::new(vec![Message::user("hi")]);
    request.agent_session = session("planner");
    let source = request.event_source.clone();

    let err = runtime.process_turn(request).await.unwrap_err();
    assert!(matches!(err, RuntimeError::EndpointNotFound { ref url } if url.ends_with("/agents/execute")));
    // Classified errors do not put the generic message on the stream.
    assert!(!source.has_producer());
}

#[tokio::test]
async fn test_after_hook_waits_for_caller_output_messages() {
    let server = MockServer::start().await;
    mount_info(&server, json!({ "agents": [{ "name": "planner" }] })).await;
    Mock::given(method("POST"))
        .and(path("/agents/execute"))
        .respond_with(ResponseTemplate::new(200).set_body_string(ndjson(&[
            json!({ "type": "TextMessageStart", "messageId": "m1" }),
            json!({ "type": "TextMessageEnd", "messageId": "m1" }),
        ])))
        .mount(&server)
        .await;

    let (hook_tx, mut hook_rx) = mpsc::unbounded_channel();
    let runtime = Runtime::builder()
        .endpoint(direct(&server))
        .on_after_request(Arc::new(move |req| {
            let hook_tx = hook_tx.clone();
            Box::pin(async move {
                hook_tx.send(req.output_messages.len())?;
                Ok(())
            })
        }))
        .build()
        .await;

    let (output_tx, output_rx) = oneshot::channel::<Vec<Message>>();
    let mut request = TurnRequest::new(vec![Message::user("hi")]);
    request.agent_session = session("planner");
    request.output_messages = Some(Box::pin(async move {
        output_rx
            .await
            .map_err(|_| StreamFailure::new("output sender dropped"))
    }));
    let response = runtime.process_turn(request).await.unwrap();

    // The agent stream finishes on its own; the hook still waits for the caller.
    response.event_source.output_messages().await.unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(200), hook_rx.recv())
            .await
            .is_err()
    );

    output_tx
        .send(vec![Message::assistant("one"), Message::assistant("two")])
        .unwrap();
    let outputs = tokio::time::timeout(Duration::from_secs(5), hook_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outputs, 2);
}
