use std::path::PathBuf;

use clap::{Parser, Subcommand};
use courier::{Courier, CourierConfig, config::find_config_file};
use courier_common::{Message, logging};
use courier_delivery::SendOutcome;

/// Send messages through a resilient, multi-provider delivery pipeline
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(about = "Deliver messages with retry, rate limiting and failover", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send a single message
    Send {
        /// Message identifier, used for deduplication (a ULID when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Recipient address
        #[arg(long)]
        to: String,

        /// Message body
        #[arg(long)]
        content: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init();

    let config_path = find_config_file(cli.config.as_deref())?;
    let courier = Courier::from_config(CourierConfig::load(&config_path)?)?;

    let result = match cli.command {
        Commands::Send { id, to, content } => {
            let id = id.unwrap_or_else(|| ulid::Ulid::new().to_string());
            let message = Message::new(id, to, content);

            let result = courier.send(&message).await;
            match &result {
                Ok(SendOutcome::Delivered(receipt)) => {
                    println!("{}: {}", receipt.provider, receipt.ack);
                }
                Ok(SendOutcome::Duplicate) => println!("Duplicate email, not sent again"),
                Err(_) => {}
            }
            println!("{} {}", message.id(), courier.status_of(message.id().as_str()));

            result.map(|_| ())
        }
    };

    courier.shutdown();

    Ok(result?)
}
