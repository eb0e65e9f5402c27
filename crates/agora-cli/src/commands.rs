use std::io::Write;
use std::sync::Arc;

use agora_client::{
    AgentDraft, AgoraClient, AgoraError, RoomAgentDraft, RoomDraft, RoundMarkerKind,
    SessionDraft, StreamEvent, StreamEventHandler, TurnDelivery, TurnOutcome, TurnRequest,
};
use anyhow::{anyhow, Context, Result};

use crate::cli_args::{
    AgentsCommand, ChatArgs, Cli, CliCommand, RoomAgentsCommand, RoomsCommand, SessionsCommand,
};

pub(crate) async fn run_cli(cli: Cli) -> Result<()> {
    let client =
        AgoraClient::new(cli.client_config()).context("failed to configure Agora client")?;

    match cli.command {
        CliCommand::Rooms { command } => run_rooms(&client, command).await,
        CliCommand::Agents { command } => run_agents(&client, command).await,
        CliCommand::RoomAgents { command } => run_room_agents(&client, command).await,
        CliCommand::Sessions { command } => run_sessions(&client, command).await,
        CliCommand::Chat(args) => run_chat(&client, args).await,
    }
}

async fn run_rooms(client: &AgoraClient, command: RoomsCommand) -> Result<()> {
    match command {
        RoomsCommand::List => {
            let rooms = client.list_rooms().await.context("failed to list rooms")?;
            for room in rooms {
                let pending = room
                    .pending_mode
                    .map(|mode| format!(" (pending {mode})"))
                    .unwrap_or_default();
                println!(
                    "{}\t{}\t{}{}",
                    room.id, room.name, room.current_mode, pending
                );
            }
        }
        RoomsCommand::Create { name, goal } => {
            let mut draft = RoomDraft::new(name);
            draft.goal = goal;
            let room = client
                .create_room(&draft)
                .await
                .map_err(|error| describe_failure("create room", error))?;
            println!("created room {} ({})", room.id, room.name);
        }
        RoomsCommand::Delete { room_id } => {
            client
                .delete_room(&room_id)
                .await
                .map_err(|error| describe_failure("delete room", error))?;
            println!("deleted room {room_id}");
        }
        RoomsCommand::Mode { room_id, mode } => {
            let room = client
                .set_room_mode(&room_id, mode)
                .await
                .map_err(|error| describe_failure("change room mode", error))?;
            println!("room {} now in {} mode", room.id, room.current_mode);
        }
    }
    Ok(())
}

async fn run_agents(client: &AgoraClient, command: AgentsCommand) -> Result<()> {
    match command {
        AgentsCommand::List => {
            let agents = client.list_agents().await.context("failed to list agents")?;
            for agent in agents {
                println!(
                    "{}\t{}\t{}\t{}",
                    agent.id, agent.key, agent.name, agent.model_alias
                );
            }
        }
        AgentsCommand::Create {
            key,
            name,
            model_alias,
            role_prompt,
            tools,
        } => {
            let draft = AgentDraft {
                key,
                name,
                model_alias,
                role_prompt,
                tool_permissions: tools,
            };
            let agent = client
                .create_agent(&draft)
                .await
                .map_err(|error| describe_failure("create agent", error))?;
            println!("created agent {} ({})", agent.id, agent.key);
        }
        AgentsCommand::Delete { agent_id } => {
            client
                .delete_agent(&agent_id)
                .await
                .map_err(|error| describe_failure("delete agent", error))?;
            println!("deleted agent {agent_id}");
        }
    }
    Ok(())
}

async fn run_room_agents(client: &AgoraClient, command: RoomAgentsCommand) -> Result<()> {
    match command {
        RoomAgentsCommand::List { room_id } => {
            let assignments = client
                .list_room_agents(&room_id)
                .await
                .with_context(|| format!("failed to list agents of room {room_id}"))?;
            for assignment in assignments {
                println!("{}\t{}", assignment.position, assignment.agent_id);
            }
        }
        RoomAgentsCommand::Assign {
            room_id,
            agent_id,
            position,
        } => {
            let draft = RoomAgentDraft { agent_id, position };
            let assignment = client
                .assign_agent(&room_id, &draft)
                .await
                .map_err(|error| describe_failure("assign agent", error))?;
            println!(
                "assigned agent {} to room {room_id} at position {}",
                assignment.agent_id, assignment.position
            );
        }
        RoomAgentsCommand::Remove { room_id, agent_id } => {
            client
                .unassign_agent(&room_id, &agent_id)
                .await
                .map_err(|error| describe_failure("remove agent", error))?;
            println!("removed agent {agent_id} from room {room_id}");
        }
    }
    Ok(())
}

async fn run_sessions(client: &AgoraClient, command: SessionsCommand) -> Result<()> {
    match command {
        SessionsCommand::List { room_id } => {
            let sessions = client
                .list_sessions(&room_id)
                .await
                .with_context(|| format!("failed to list sessions of room {room_id}"))?;
            for session in sessions {
                println!(
                    "{}\t{}",
                    session.id,
                    session.agent_id.as_deref().unwrap_or("room")
                );
            }
        }
        SessionsCommand::Create { room_id, agent_id } => {
            let session = client
                .create_session(&room_id, &SessionDraft { agent_id })
                .await
                .map_err(|error| describe_failure("create session", error))?;
            println!("created session {}", session.id);
        }
    }
    Ok(())
}

async fn run_chat(client: &AgoraClient, args: ChatArgs) -> Result<()> {
    let mut request = TurnRequest::new(args.message);
    request.model_alias_override = args.model_alias;

    let json = args.json;
    let observer: StreamEventHandler = Arc::new(move |event: &StreamEvent| {
        if let Some(rendered) = render_event(event, json) {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(rendered.as_bytes());
            let _ = stdout.flush();
        }
    });

    let outcome = client
        .send_turn(&args.session_id, &request, Some(observer))
        .await
        .map_err(|error| describe_failure("send message", error))?;

    if json {
        return Ok(());
    }
    if outcome.delivery == TurnDelivery::Fallback {
        println!("{}", outcome.text);
    } else {
        println!();
    }
    eprintln!("{}", render_summary(&outcome));
    if outcome.done.as_ref().is_some_and(|done| done.low_balance) {
        eprintln!("warning: account balance is low");
    }
    Ok(())
}

fn render_event(event: &StreamEvent, json: bool) -> Option<String> {
    if json {
        return serde_json::to_string(event)
            .ok()
            .map(|line| format!("{line}\n"));
    }
    match event {
        StreamEvent::Chunk { delta } => Some(delta.clone()),
        StreamEvent::RoundMarker {
            kind: RoundMarkerKind::Start,
            round,
        } => Some(format!("\n[round {round}]\n")),
        StreamEvent::RoundMarker {
            kind: RoundMarkerKind::End,
            ..
        } => Some("\n".to_string()),
        StreamEvent::Done(_) | StreamEvent::Unknown { .. } => None,
    }
}

fn render_summary(outcome: &TurnOutcome) -> String {
    let via = match outcome.delivery {
        TurnDelivery::Streamed => "stream",
        TurnDelivery::Fallback => "fallback",
    };
    let Some(done) = outcome.done.as_ref() else {
        return format!("turn finished via {via}");
    };
    let mut summary = format!(
        "turn {} finished via {via}",
        done.turn_id.as_deref().unwrap_or("?")
    );
    if let Some(model) = done.provider_model.as_deref() {
        summary.push_str(&format!(" model={model}"));
    }
    if let Some(balance) = done.balance_after {
        summary.push_str(&format!(" balance={balance:.2}"));
    }
    if done.summary_used_fallback {
        summary.push_str(" summary=fallback");
    }
    summary
}

fn describe_failure(action: &str, error: AgoraError) -> anyhow::Error {
    match error.preserved_input() {
        Some(input) => anyhow!(
            "failed to {action}: {} (unsent message kept: {:?})",
            error.user_message(),
            input.message
        ),
        None => anyhow!("failed to {action}: {}", error.user_message()),
    }
}
