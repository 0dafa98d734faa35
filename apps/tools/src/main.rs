use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use shared::{
    domain::{MessageDraft, Sender},
    protocol::{SubmitRequest, SubmitResponse},
};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    server_url: String,
    #[arg(long, default_value = "sqlite://./data/server.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or rename a channel directly in the database.
    CreateChannel {
        channel_id: String,
        description: String,
    },
    /// Submit a message through the producer endpoint.
    Send {
        channel_id: String,
        sender_id: String,
        text: String,
        #[arg(long)]
        sender_name: Option<String>,
    },
    /// Fetch messages newer than the given RFC 3339 timestamp
    /// (defaults to the last hour).
    Fetch {
        channel_id: String,
        #[arg(long)]
        after: Option<DateTime<Utc>>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::CreateChannel {
            channel_id,
            description,
        } => {
            let storage = Storage::new(&cli.database_url).await?;
            storage
                .upsert_channel(&channel_id.clone().into(), &description)
                .await?;
            println!("upserted channel_id={channel_id}");
        }
        Command::Send {
            channel_id,
            sender_id,
            text,
            sender_name,
        } => {
            let request = SubmitRequest {
                message: MessageDraft {
                    id: None,
                    channel_id: channel_id.into(),
                    sender: Sender {
                        id: sender_id.into(),
                        name: sender_name,
                    },
                    text: Some(text),
                    image_url: None,
                    created_at: None,
                },
            };
            let response: SubmitResponse = reqwest::Client::new()
                .post(format!("{}/api/send-message", cli.server_url))
                .json(&request)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            println!(
                "accepted id={} created_at={}",
                response.message.id,
                response.message.created_at.to_rfc3339()
            );
        }
        Command::Fetch { channel_id, after } => {
            let after = after.unwrap_or_else(|| Utc::now() - Duration::hours(1));
            let messages: Vec<shared::domain::Message> = reqwest::Client::new()
                .get(format!(
                    "{}/channels/{}/messages",
                    cli.server_url, channel_id
                ))
                .query(&[("after", after.to_rfc3339())])
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            for message in &messages {
                println!(
                    "{} {} {}: {}",
                    message.created_at.to_rfc3339(),
                    message.id,
                    message.sender.id,
                    message.preview()
                );
            }
            println!("fetched {} messages", messages.len());
        }
    }

    Ok(())
}
