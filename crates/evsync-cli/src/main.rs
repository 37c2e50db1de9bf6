//! evsync operator tool.
//!
//! Opens a session against the configured hubs and logs the event stream:
//! status changes, messages, typing, read receipts and notifications. Lines
//! on stdin drive the session until interrupted.
//!
//! # Usage
//!
//! ```bash
//! # Staff session watching two conversations
//! evsync --token "$TOKEN" --user advisor-12 --staff --join 41 --join 42
//!
//! # Guest web chat
//! evsync --token "$TOKEN" --guest web-7f3a --join 41
//! ```
//!
//! # Commands
//!
//! - `<id>: <text>` sends a message
//! - `/join <id>`, `/leave <id>`, `/read <id>`, `/typing <id>`
//! - `/read-all` clears the notification badge

use std::time::Duration;

use clap::Parser;
use evsync_client::{
    ClientError, Identity,
    transport::{Session, SessionConfig, SystemEnv},
};
use evsync_proto::{ConversationId, Credential, InvalidConversationId};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// evsync session client
#[derive(Parser, Debug)]
#[command(name = "evsync")]
#[command(about = "Open an evsync session and log its events")]
#[command(version)]
struct Args {
    /// Conversation hub websocket URL
    #[arg(long, env = "EVSYNC_CHAT_HUB", default_value = "ws://localhost:5000/hubs/chat")]
    chat_hub: String,

    /// Notification hub websocket URL
    #[arg(
        long,
        env = "EVSYNC_NOTIFICATION_HUB",
        default_value = "ws://localhost:5000/hubs/notifications"
    )]
    notification_hub: String,

    /// REST API base URL
    #[arg(long, env = "EVSYNC_API", default_value = "http://localhost:5000/api")]
    api: String,

    /// Bearer token for hubs and REST calls
    #[arg(long, env = "EVSYNC_TOKEN", hide_env_values = true)]
    token: String,

    /// Authenticated user id
    #[arg(long, env = "EVSYNC_USER", conflicts_with = "guest", required_unless_present = "guest")]
    user: Option<String>,

    /// Guest chat session id
    #[arg(long, env = "EVSYNC_GUEST")]
    guest: Option<String>,

    /// Join the staff notification group
    #[arg(long, requires = "user")]
    staff: bool,

    /// Conversations to join at startup
    #[arg(short, long = "join", value_name = "ID")]
    join: Vec<String>,

    /// Seconds to wait for each hub at startup
    #[arg(long, default_value = "10")]
    connect_timeout: u64,

    /// Seconds between REST polls while a hub is down
    #[arg(long, default_value = "30")]
    poll_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn identity(&self) -> Identity {
        match (&self.user, &self.guest) {
            (Some(user), _) if self.staff => Identity::staff(user.clone()),
            (Some(user), _) => Identity::user(user.clone()),
            (None, Some(guest)) => Identity::guest(guest.clone()),
            (None, None) => Identity::default(),
        }
    }

    fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::new(&self.chat_hub, &self.notification_hub, &self.api);
        config.connect_timeout = Duration::from_secs(self.connect_timeout);
        config.poll_interval = Duration::from_secs(self.poll_interval);
        config
    }
}

/// One line of operator input.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Join(String),
    Leave(ConversationId),
    Read(ConversationId),
    Typing(ConversationId),
    ReadAll,
    Send { conversation: ConversationId, text: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
enum CommandError {
    #[error("unknown command {0:?}")]
    Unknown(String),

    #[error("/{0} needs a conversation id")]
    MissingArgument(&'static str),

    #[error(transparent)]
    Conversation(#[from] InvalidConversationId),
}

/// Parse one input line. Blank lines yield `None`.
fn parse_command(line: &str) -> Result<Option<Command>, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    if let Some(rest) = line.strip_prefix('/') {
        let (name, arg) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        let arg = arg.trim();
        let conversation = |command: &'static str| -> Result<ConversationId, CommandError> {
            if arg.is_empty() {
                return Err(CommandError::MissingArgument(command));
            }
            Ok(arg.parse()?)
        };

        let command = match name {
            "join" if arg.is_empty() => return Err(CommandError::MissingArgument("join")),
            "join" => Command::Join(arg.to_string()),
            "leave" => Command::Leave(conversation("leave")?),
            "read" => Command::Read(conversation("read")?),
            "typing" => Command::Typing(conversation("typing")?),
            "read-all" => Command::ReadAll,
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        return Ok(Some(command));
    }

    let Some((conversation, text)) = line.split_once(':') else {
        return Err(CommandError::Unknown(line.to_string()));
    };
    Ok(Some(Command::Send { conversation: conversation.parse()?, text: text.trim().to_string() }))
}

async fn execute(session: &Session<SystemEnv>, command: Command) -> Result<(), ClientError> {
    match command {
        Command::Join(id) => {
            let conversation = session.chat().join(&id).await?;
            info!(%conversation, "joined");
        },
        Command::Leave(conversation) => session.chat().leave(conversation).await?,
        Command::Read(conversation) => session.chat().mark_read(conversation).await?,
        Command::Typing(conversation) => session.chat().notify_typing(conversation).await?,
        Command::ReadAll => session.notifications().mark_all_read().await?,
        Command::Send { conversation, text } => {
            session.chat().send_message(conversation, text).await?;
        },
    }
    Ok(())
}

/// Log everything the session publishes.
fn subscribe(session: &Session<SystemEnv>) {
    let chat = session.chat();
    chat.on_status_changed(|change| {
        info!(hub = "chat", from = %change.from, to = %change.to, "status changed");
    });
    chat.on_message(|message| {
        info!(
            conversation = %message.conversation,
            sender = %message.sender,
            id = %message.id,
            "{}",
            message.content
        );
    });
    chat.on_typing_changed(|conversation, typists| {
        let typists: Vec<String> = typists.iter().map(ToString::to_string).collect();
        info!(%conversation, ?typists, "typing");
    });
    chat.on_read_receipt(|marker| {
        info!(
            conversation = %marker.conversation,
            reader = %marker.reader,
            last_read_at = %marker.last_read_at,
            "read receipt"
        );
    });

    let notifications = session.notifications();
    notifications.on_status_changed(|change| {
        info!(hub = "notifications", from = %change.from, to = %change.to, "status changed");
    });
    notifications.on_notification(|notification| {
        info!(id = %notification.id, title = %notification.title, "{}", notification.message);
    });
    notifications.on_unread_count_change(|unread| info!(unread, "notification badge"));
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let config = args.session_config();
    info!(chat = %config.chat_endpoint, notifications = %config.notification_endpoint, "starting");

    let credential = Credential::bearer(args.token.clone());
    let session = Session::init(SystemEnv::new(), args.identity(), credential, config).await?;
    subscribe(&session);

    for id in &args.join {
        if let Err(error) = execute(&session, Command::Join(id.clone())).await {
            warn!(conversation = %id, %error, "join failed");
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match parse_command(&line) {
                    Ok(Some(command)) => {
                        if let Err(error) = execute(&session, command).await {
                            warn!(%error, "command failed");
                        }
                    },
                    Ok(None) => {},
                    Err(error) => warn!(%error, "ignoring input"),
                },
                Ok(None) => {
                    info!("stdin closed, running until interrupted");
                    stdin_open = false;
                },
                Err(error) => {
                    warn!(%error, "stdin failed");
                    stdin_open = false;
                },
            },
            result = &mut shutdown => {
                if let Err(error) = result {
                    warn!(%error, "signal handler failed");
                }
                break;
            },
        }
    }

    info!("shutting down");
    session.dispose().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Result<Args, clap::Error> {
        let mut argv = vec!["evsync", "--token", "t-1"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv)
    }

    #[test]
    fn staff_flag_builds_staff_identity() {
        let args = args(&["--user", "advisor", "--staff", "-j", "41", "--join", "42"]).unwrap();

        assert_eq!(args.identity(), Identity::staff("advisor"));
        assert_eq!(args.join, vec!["41".to_string(), "42".to_string()]);
    }

    #[test]
    fn guest_identity_without_user() {
        let args = args(&["--guest", "web-1"]).unwrap();

        assert_eq!(args.identity(), Identity::guest("web-1"));
    }

    #[test]
    fn user_and_guest_conflict() {
        assert!(args(&["--user", "u", "--guest", "g"]).is_err());
    }

    #[test]
    fn staff_requires_user() {
        assert!(args(&["--guest", "g", "--staff"]).is_err());
    }

    #[test]
    fn durations_flow_into_session_config() {
        let args =
            args(&["--user", "u", "--connect-timeout", "3", "--poll-interval", "5"]).unwrap();
        let config = args.session_config();

        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.chat_endpoint, "ws://localhost:5000/hubs/chat");
    }

    #[test]
    fn message_line_parses_to_send() {
        let command = parse_command("41:  Your car is ready ").unwrap();

        assert_eq!(
            command,
            Some(Command::Send {
                conversation: ConversationId::new(41),
                text: "Your car is ready".into()
            })
        );
    }

    #[test]
    fn slash_commands_parse() {
        assert_eq!(parse_command("/join 7").unwrap(), Some(Command::Join("7".into())));
        assert_eq!(parse_command("/read 7").unwrap(), Some(Command::Read(ConversationId::new(7))));
        assert_eq!(parse_command("/read-all").unwrap(), Some(Command::ReadAll));
        assert_eq!(parse_command("   ").unwrap(), None);
    }

    #[test]
    fn bad_input_is_reported() {
        assert_eq!(parse_command("/leave"), Err(CommandError::MissingArgument("leave")));
        assert_eq!(parse_command("/frobnicate 1"), Err(CommandError::Unknown("frobnicate".into())));
        assert!(matches!(parse_command("abc: hi"), Err(CommandError::Conversation(_))));
        assert!(matches!(parse_command("no separator"), Err(CommandError::Unknown(_))));
    }
}
