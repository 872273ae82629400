use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use server_api::{gatekeeper::mint_token, HistoryService};
use shared::domain::{Identity, MessageId, UserId};
use storage::{MessageStore, Storage};

#[derive(Parser, Debug)]
#[command(about = "Offline maintenance for the chat coordinator database")]
struct Cli {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://./data/chat.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the newest group messages, oldest first.
    GroupHistory {
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Print the direct conversation between two identities.
    PrivateHistory {
        a: i64,
        b: i64,
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
    /// List an identity's direct conversations by latest activity.
    Threads { user_id: i64 },
    /// Hard-delete a message. Live clients are not notified.
    Purge { message_id: i64 },
    /// Issue a credential for local testing.
    MintToken {
        user_id: i64,
        username: String,
        #[arg(long, env = "JWT_SECRET")]
        secret: String,
        #[arg(long, default_value_t = 3600)]
        ttl_seconds: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::GroupHistory { limit } => {
            let storage = open(&cli.database_url).await?;
            let messages = history(&storage).group_history(Some(limit)).await?;
            println!("{}", serde_json::to_string_pretty(&messages)?);
            storage.close().await;
        }
        Command::PrivateHistory { a, b, limit } => {
            let storage = open(&cli.database_url).await?;
            let messages = history(&storage)
                .private_history(UserId(a), UserId(b), Some(limit))
                .await?;
            println!("{}", serde_json::to_string_pretty(&messages)?);
            storage.close().await;
        }
        Command::Threads { user_id } => {
            let storage = open(&cli.database_url).await?;
            let threads = history(&storage)
                .private_threads_for(UserId(user_id))
                .await?;
            println!("{}", serde_json::to_string_pretty(&threads)?);
            storage.close().await;
        }
        Command::Purge { message_id } => {
            let storage = open(&cli.database_url).await?;
            let removed = storage.delete_message(MessageId(message_id)).await?;
            storage.close().await;
            if !removed {
                bail!("message {message_id} not found");
            }
            println!("purged message_id={message_id}");
        }
        Command::MintToken {
            user_id,
            username,
            secret,
            ttl_seconds,
        } => {
            let identity = Identity::new(UserId(user_id), username.trim());
            let token =
                mint_token(&secret, &identity, ttl_seconds).context("failed to mint token")?;
            println!("{token}");
        }
    }

    Ok(())
}

async fn open(database_url: &str) -> Result<Storage> {
    Storage::new(database_url)
        .await
        .with_context(|| format!("failed to open database '{database_url}'"))
}

fn history(storage: &Storage) -> HistoryService {
    HistoryService::new(Arc::new(storage.clone()))
}
