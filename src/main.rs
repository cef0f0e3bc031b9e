use clap::{Parser, Subcommand};
use tracing::{info, warn};

use msgsession::agent::AgentEvent;
use msgsession::config::load_config;
use msgsession::utils::error::SessionError;
use msgsession::utils::logging;
use msgsession::{Message, Session};

#[derive(Debug, Parser)]
#[command(name = "msgsession", about = "Consume from or produce to a messaging destination")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Subscribe to a destination and print every message received.
    Consume {
        destination: String,
        #[arg(long)]
        selector: Option<String>,
        #[arg(long)]
        subtopic: Option<String>,
    },
    /// Send one message to a destination and wait for the acknowledgement.
    Produce {
        destination: String,
        /// JSON body; anything that does not parse is sent as a string.
        body: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), SessionError> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let settings = load_config()?;
    logging::init(&settings.logging.level);

    let session = Session::from_settings(settings);
    match cli.command {
        Command::Consume {
            destination,
            selector,
            subtopic,
        } => {
            let consumer = session.consumer(&destination);
            let mut events = consumer.events();
            consumer.set_selector(selector)?;
            consumer.set_subtopic(subtopic)?;
            consumer.subscribe(None)?;
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(AgentEvent::Message(message)) => println!("{}", message.body),
                        Some(AgentEvent::Fault { fault, .. }) => {
                            warn!(code = ?fault.fault_code(), "fault");
                        }
                        Some(event) => info!(?event, "event"),
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            consumer.unsubscribe(false)?;
            consumer.disconnect();
        }
        Command::Produce { destination, body } => {
            let producer = session.producer(&destination);
            let mut events = producer.events();
            let body = serde_json::from_str(&body).unwrap_or(serde_json::Value::String(body));
            producer.send(Message::new_async().with_body(body))?;
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(AgentEvent::Acknowledge { request, .. }) if !request.is_command(
                            msgsession::message::CommandOperation::TriggerConnect,
                        ) => {
                            info!(message_id = %request.message_id(), "acknowledged");
                            break;
                        }
                        Some(AgentEvent::Fault { fault, .. }) => {
                            warn!(code = ?fault.fault_code(), detail = ?fault.fault(), "send failed");
                            break;
                        }
                        Some(event) => info!(?event, "event"),
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            producer.disconnect();
        }
    }
    Ok(())
}
