use agora_client::{
    AgoraClientConfig, RoomMode, DEFAULT_POLL_INTERVAL_MS, DEFAULT_REQUEST_TIMEOUT_MS,
    DEFAULT_STREAM_TIMEOUT_MS,
};
use clap::{Args, Parser, Subcommand};

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_room_mode(value: &str) -> Result<RoomMode, String> {
    value.parse::<RoomMode>()
}

#[derive(Debug, Parser)]
#[command(
    name = "agora",
    about = "Command-line client for the Agora multi-agent chat service",
    version
)]
pub(crate) struct Cli {
    #[arg(
        long,
        env = "AGORA_API_BASE",
        default_value = "http://127.0.0.1:8000",
        help = "Base URL of the Agora API"
    )]
    pub(crate) api_base: String,

    #[arg(
        long,
        env = "AGORA_TOKEN",
        hide_env_values = true,
        help = "Bearer token sent with every request"
    )]
    pub(crate) token: Option<String>,

    #[arg(
        long = "request-timeout-ms",
        env = "AGORA_REQUEST_TIMEOUT_MS",
        default_value_t = DEFAULT_REQUEST_TIMEOUT_MS,
        value_parser = parse_positive_u64,
        help = "Deadline for non-streaming requests"
    )]
    pub(crate) request_timeout_ms: u64,

    #[arg(
        long = "stream-timeout-ms",
        env = "AGORA_STREAM_TIMEOUT_MS",
        default_value_t = DEFAULT_STREAM_TIMEOUT_MS,
        value_parser = parse_positive_u64,
        help = "Deadline for one streamed turn and for its synchronous fallback"
    )]
    pub(crate) stream_timeout_ms: u64,

    #[arg(
        long = "poll-interval-ms",
        env = "AGORA_POLL_INTERVAL_MS",
        default_value_t = DEFAULT_POLL_INTERVAL_MS,
        value_parser = parse_positive_u64,
        help = "Interval between background message refreshes"
    )]
    pub(crate) poll_interval_ms: u64,

    #[arg(
        long = "log-filter",
        env = "AGORA_LOG",
        help = "Tracing filter directives, e.g. agora_client=debug"
    )]
    pub(crate) log_filter: Option<String>,

    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

impl Cli {
    pub(crate) fn client_config(&self) -> AgoraClientConfig {
        AgoraClientConfig {
            api_base: self.api_base.clone(),
            bearer_token: self.token.clone(),
            request_timeout_ms: self.request_timeout_ms,
            stream_timeout_ms: self.stream_timeout_ms,
            poll_interval_ms: self.poll_interval_ms,
        }
    }
}

#[derive(Debug, Subcommand)]
pub(crate) enum CliCommand {
    /// Manage rooms.
    Rooms {
        #[command(subcommand)]
        command: RoomsCommand,
    },
    /// Manage agent definitions.
    Agents {
        #[command(subcommand)]
        command: AgentsCommand,
    },
    /// Manage which agents take part in a room.
    RoomAgents {
        #[command(subcommand)]
        command: RoomAgentsCommand,
    },
    /// Manage conversation sessions of a room.
    Sessions {
        #[command(subcommand)]
        command: SessionsCommand,
    },
    /// Send one message and stream the reply.
    Chat(ChatArgs),
}

#[derive(Debug, Subcommand)]
pub(crate) enum RoomsCommand {
    List,
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        goal: Option<String>,
    },
    Delete {
        room_id: String,
    },
    /// Change the dispatch mode (manual, roundtable or orchestrator).
    Mode {
        room_id: String,
        #[arg(value_parser = parse_room_mode)]
        mode: RoomMode,
    },
}

#[derive(Debug, Subcommand)]
pub(crate) enum AgentsCommand {
    List,
    Create {
        #[arg(long)]
        key: String,
        #[arg(long)]
        name: String,
        #[arg(long = "model-alias")]
        model_alias: String,
        #[arg(long = "role-prompt", default_value = "")]
        role_prompt: String,
        #[arg(long = "tool", help = "Tool the agent may call; repeat for several")]
        tools: Vec<String>,
    },
    Delete {
        agent_id: String,
    },
}

#[derive(Debug, Subcommand)]
pub(crate) enum RoomAgentsCommand {
    List {
        room_id: String,
    },
    Assign {
        room_id: String,
        agent_id: String,
        #[arg(long)]
        position: Option<u32>,
    },
    Remove {
        room_id: String,
        agent_id: String,
    },
}

#[derive(Debug, Subcommand)]
pub(crate) enum SessionsCommand {
    List {
        room_id: String,
    },
    Create {
        room_id: String,
        #[arg(long = "agent", help = "Agent id for a one-to-one session")]
        agent_id: Option<String>,
    },
}

#[derive(Debug, Args)]
pub(crate) struct ChatArgs {
    pub(crate) session_id: String,
    pub(crate) message: String,
    #[arg(long = "model-alias", help = "Override the model alias for this turn")]
    pub(crate) model_alias: Option<String>,
    #[arg(long, help = "Print every stream event as one JSON line")]
    pub(crate) json: bool,
}
