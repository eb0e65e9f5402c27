use std::sync::{Arc, Mutex};
use std::time::Duration;

use agora_client::{
    AgoraClient, AgoraClientConfig, CacheKey, Message, MessageRole, ReadOutcome, RoomDraft,
    RoomMode, StreamEvent, StreamEventHandler, TurnDelivery, TurnRequest, TurnUpdate,
};
use httpmock::prelude::*;
use serde_json::json;

fn sse(payloads: &[serde_json::Value]) -> String {
    payloads
        .iter()
        .map(|payload| format!("data: {payload}\n\n"))
        .collect()
}

#[tokio::test]
async fn integration_room_session_streamed_turn_and_refresh() {
    let server = MockServer::start();

    let create_room = server.mock(|when, then| {
        when.method(POST)
            .path("/rooms")
            .header("authorization", "Bearer integration")
            .json_body(json!({ "name": "design review", "goal": "ship v2" }));
        then.status(201).json_body(json!({
            "id": 10,
            "name": "design review",
            "goal": "ship v2",
            "current_mode": "manual"
        }));
    });
    let list_rooms = server.mock(|when, then| {
        when.method(GET).path("/rooms");
        then.status(200).json_body(json!([{
            "id": 10,
            "name": "design review",
            "goal": "ship v2",
            "current_mode": "manual"
        }]));
    });
    let set_mode = server.mock(|when, then| {
        when.method(PATCH)
            .path("/rooms/10/mode")
            .json_body(json!({ "mode": "roundtable" }));
        then.status(200).json_body(json!({
            "id": 10,
            "name": "design review",
            "goal": "ship v2",
            "current_mode": "roundtable"
        }));
    });
    let list_sessions = server.mock(|when, then| {
        when.method(GET).path("/rooms/10/sessions");
        then.status(200).json_body(json!([]));
    });
    let create_session = server.mock(|when, then| {
        when.method(POST).path("/rooms/10/sessions").json_body(json!({}));
        then.status(201)
            .json_body(json!({ "id": 77, "room_id": 10, "agent_id": null }));
    });
    let stream = server.mock(|when, then| {
        when.method(POST)
            .path("/sessions/77/turns/stream")
            .header("accept", "text/event-stream")
            .json_body(json!({ "message": "critique the plan" }));
        then.status(200)
            .header("content-type", "text/event-stream")
            .body(sse(&[
                json!({ "type": "round_start", "round": 1 }),
                json!({ "type": "chunk", "delta": "Architect: looks solid. " }),
                json!({ "type": "chunk", "delta": "Critic: needs tests." }),
                json!({ "type": "round_end", "round": 1 }),
                json!({
                    "type": "done",
                    "turn_id": 500,
                    "provider_model": "gpt-4o-mini",
                    "balance_after": 12.0
                }),
            ]));
    });
    let messages = server.mock(|when, then| {
        when.method(GET).path("/sessions/77/messages");
        then.status(200).json_body(json!([
            { "id": 1, "session_id": 77, "role": "user", "content": "critique the plan", "turn_id": 500 },
            { "id": 2, "session_id": 77, "role": "assistant", "agent_name": "Architect", "content": "looks solid.", "turn_id": 500 },
            { "id": 3, "session_id": 77, "role": "assistant", "agent_name": "Critic", "content": "needs tests.", "turn_id": 500 }
        ]));
    });
    let turns = server.mock(|when, then| {
        when.method(GET).path("/sessions/77/turns");
        then.status(200).json_body(json!([{
            "id": 500,
            "session_id": 77,
            "turn_index": 0,
            "status": "completed",
            "mode_used": "roundtable",
            "user_input": "critique the plan",
            "assistant_output": "Architect: looks solid. Critic: needs tests."
        }]));
    });

    let client = AgoraClient::new(
        AgoraClientConfig::new(server.base_url()).with_bearer_token("integration"),
    )
    .expect("client should be created");

    let room = client
        .create_room(&RoomDraft::new("design review").with_goal("ship v2"))
        .await
        .expect("room created");
    create_room.assert_calls(1);
    list_rooms.assert_calls(1);
    assert_eq!(room.id, "10");

    let room = client
        .set_room_mode(&room.id, RoomMode::Roundtable)
        .await
        .expect("mode changed");
    set_mode.assert_calls(1);
    assert_eq!(room.current_mode, RoomMode::Roundtable);

    let session = client
        .ensure_session(&room.id, None)
        .await
        .expect("session ensured");
    list_sessions.assert_calls(2);
    create_session.assert_calls(1);
    assert_eq!(session.id, "77");
    assert_eq!(session.room_id, "10");
    assert_eq!(client.selected_session().as_deref(), Some("77"));

    let deltas = Arc::new(Mutex::new(Vec::new()));
    let observer: StreamEventHandler = {
        let deltas = Arc::clone(&deltas);
        Arc::new(move |event: &StreamEvent| {
            if let StreamEvent::Chunk { delta } = event {
                deltas.lock().expect("deltas lock").push(delta.clone());
            }
        })
    };
    let outcome = client
        .send_turn(&session.id, &TurnRequest::new("critique the plan"), Some(observer))
        .await
        .expect("turn streamed");
    stream.assert_calls(1);
    messages.assert_calls(1);
    turns.assert_calls(1);

    assert_eq!(outcome.delivery, TurnDelivery::Streamed);
    assert_eq!(outcome.text, "Architect: looks solid. Critic: needs tests.");
    assert_eq!(deltas.lock().expect("deltas lock").len(), 2);
    let done = outcome.done.expect("done metadata");
    assert_eq!(done.turn_id.as_deref(), Some("500"));
    assert_eq!(done.balance_after, Some(12.0));

    let cached_messages = client
        .cache()
        .get_as::<Message>(&CacheKey::session_messages("77"))
        .expect("decode")
        .expect("messages cached");
    assert_eq!(cached_messages.len(), 3);
    assert_eq!(cached_messages[2].role, MessageRole::Assistant);
    assert_eq!(cached_messages[2].agent_name.as_deref(), Some("Critic"));
    assert_eq!(cached_messages[2].turn_id.as_deref(), Some("500"));

    let history = client.list_turns("77").await.expect("turn history");
    assert_eq!(history[0].mode_used, Some(RoomMode::Roundtable));
}

#[tokio::test]
async fn integration_poller_resumes_after_spawned_turn() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/sessions/s1/turns/stream");
        then.status(200)
            .header("content-type", "text/event-stream")
            .delay(Duration::from_millis(150))
            .body(sse(&[
                json!({ "type": "chunk", "delta": "done thinking" }),
                json!({ "type": "done", "turn_id": "t1" }),
            ]));
    });
    let messages = server.mock(|when, then| {
        when.method(GET).path("/sessions/s1/messages");
        then.status(200).json_body(json!([
            { "id": 1, "role": "assistant", "content": "done thinking" }
        ]));
    });

    let client = AgoraClient::new(AgoraClientConfig::new(server.base_url()))
        .expect("client should be created");
    let poller = client.message_poller();

    let mut turn = client
        .spawn_turn("s1", TurnRequest::new("think"))
        .expect("turn spawned");
    assert_eq!(
        poller.poll_once("s1").await.expect("poll while streaming"),
        ReadOutcome::Suspended
    );
    messages.assert_calls(0);

    let mut terminal = None;
    while let Some(update) = turn.recv().await {
        if update.is_terminal() {
            terminal = Some(update);
            break;
        }
    }
    match terminal {
        Some(TurnUpdate::Completed(outcome)) => assert_eq!(outcome.text, "done thinking"),
        other => panic!("unexpected terminal update: {other:?}"),
    }

    assert_eq!(
        poller.poll_once("s1").await.expect("poll after turn"),
        ReadOutcome::Applied
    );
    messages.assert_calls(1);
    assert_eq!(
        client
            .cache()
            .get(&CacheKey::session_messages("s1"))
            .map(|items| items.len()),
        Some(1)
    );
}
