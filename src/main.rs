//! swarm-relay command line entry point.
//!
//! Exit codes: 0 accepted, 1 rejected, 2 configuration error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use swarm_relay::actuator::{InputDevice, RecordingDevice, XdotoolDevice};
use swarm_relay::message::{MessageDraft, MessageType, Priority, Recipient};
use swarm_relay::router::{Accepted, Disposition, MessageRouter, TracingAlertSink};
use swarm_relay::types::{ActuatorBackend, AgentId};
use swarm_relay::{Config, Error, Result};

const EXIT_REJECTED: u8 = 1;
const EXIT_CONFIG: u8 = 2;

#[derive(Parser)]
#[command(name = "swarm-relay")]
#[command(author, version, about = "Route messages between screen-resident agents", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the relay configuration (JSON). Required.
    #[arg(long, global = true, env = "SWARM_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Record actuator actions instead of driving the desktop
    #[arg(long, global = true)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a message to one agent
    Send {
        /// Recipient agent id (or ALL)
        #[arg(long)]
        agent: String,

        /// Message body
        #[arg(long)]
        message: String,

        /// LOW, NORMAL or URGENT
        #[arg(long, default_value = "NORMAL")]
        priority: Priority,

        /// Tag (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Message type
        #[arg(long = "type", default_value = "DIRECT")]
        message_type: MessageType,

        /// Sender id
        #[arg(long, default_value = "operator")]
        from: String,
    },

    /// Send a message to every active agent
    Broadcast {
        /// Message body
        #[arg(long)]
        message: String,

        /// LOW, NORMAL or URGENT
        #[arg(long, default_value = "NORMAL")]
        priority: Priority,

        /// Tag (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Sender id
        #[arg(long, default_value = "operator")]
        from: String,
    },

    /// Show an agent's mailbox
    Inbox {
        /// Agent id
        #[arg(long)]
        agent: String,

        /// Only messages recorded after this RFC 3339 timestamp
        #[arg(long)]
        since: Option<DateTime<Utc>>,
    },

    /// List active agents
    Agents,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) if e.is_config() => {
            eprintln!("configuration error: {}", e);
            ExitCode::from(EXIT_CONFIG)
        }
        Err(e) => {
            eprintln!("rejected: {}", e);
            ExitCode::from(EXIT_REJECTED)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = Config::load_required(cli.config.as_deref())?;
    if cli.dry_run {
        config.actuator.backend = ActuatorBackend::DryRun;
    }
    swarm_relay::observability::init_tracing(&config.observability);

    let device: Arc<dyn InputDevice> = match config.actuator.backend {
        ActuatorBackend::Xdotool => Arc::new(XdotoolDevice::new(&config.actuator)),
        ActuatorBackend::DryRun => Arc::new(RecordingDevice::new()),
    };
    let router = MessageRouter::from_config(&config, device, Arc::new(TracingAlertSink)).await?;

    let code = match cli.command {
        Commands::Send {
            agent,
            message,
            priority,
            tags,
            message_type,
            from,
        } => {
            let recipient = Recipient::try_from(agent).map_err(Error::validation)?;
            let draft = tags.into_iter().fold(
                MessageDraft::new(parse_agent(from)?, recipient, message)
                    .with_priority(priority)
                    .with_type(message_type),
                MessageDraft::with_tag,
            );
            router.start();
            let result = router.submit(draft).await;
            settle(&router).await;
            report(result?)
        }
        Commands::Broadcast {
            message,
            priority,
            tags,
            from,
        } => {
            let draft = tags.into_iter().fold(
                MessageDraft::broadcast(parse_agent(from)?, message).with_priority(priority),
                MessageDraft::with_tag,
            );
            router.start();
            let result = router.broadcast(draft).await;
            settle(&router).await;
            let outcomes = result?;
            let mut rejected = false;
            for outcome in outcomes {
                match outcome.result {
                    Ok(accepted) => {
                        println!("{}\t{}", outcome.agent, describe(&accepted));
                    }
                    Err(e) => {
                        rejected = true;
                        println!("{}\trejected: {}", outcome.agent, e);
                    }
                }
            }
            if rejected {
                ExitCode::from(EXIT_REJECTED)
            } else {
                ExitCode::SUCCESS
            }
        }
        Commands::Inbox { agent, since } => {
            for message in router.inbox(&parse_agent(agent)?, since).await? {
                println!("{}", serde_json::to_string(&message)?);
            }
            ExitCode::SUCCESS
        }
        Commands::Agents => {
            let snapshot = router.registry().snapshot();
            for id in snapshot.active_ids() {
                if let Some(agent) = snapshot.get(&id) {
                    println!("{}\t{}\t{}", agent.id, agent.primary, agent.description);
                }
            }
            ExitCode::SUCCESS
        }
    };

    Ok(code)
}

fn parse_agent(raw: String) -> Result<AgentId> {
    AgentId::from_string(raw).map_err(Error::validation)
}

/// Let queued deliveries finish, then stop the worker.
async fn settle(router: &MessageRouter) {
    if let Err(e) = router.drain_default().await {
        tracing::warn!(error = %e, "exiting with deliveries outstanding; mailbox copies are durable");
    }
    router.shutdown().await;
}

fn report(accepted: Accepted) -> ExitCode {
    println!("{}", describe(&accepted));
    if let Disposition::FannedOut(outcomes) = &accepted.disposition {
        let mut rejected = false;
        for outcome in outcomes {
            match &outcome.result {
                Ok(inner) => println!("  {}\t{}", outcome.agent, describe(inner)),
                Err(e) => {
                    rejected = true;
                    println!("  {}\trejected: {}", outcome.agent, e);
                }
            }
        }
        if rejected {
            return ExitCode::from(EXIT_REJECTED);
        }
    }
    ExitCode::SUCCESS
}

fn describe(accepted: &Accepted) -> String {
    let disposition = match &accepted.disposition {
        Disposition::Queued => "queued".to_string(),
        Disposition::MailboxOnly => "mailbox_only".to_string(),
        Disposition::Suppressed(reason) => format!("suppressed ({:?})", reason),
        Disposition::FannedOut(outcomes) => format!("fanned out to {}", outcomes.len()),
    };
    format!(
        "accepted {} -> {}: {}",
        accepted.message_id, accepted.recipient, disposition
    )
}
