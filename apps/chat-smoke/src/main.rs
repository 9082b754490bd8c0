use std::env;

use chat_core::RemotePort;
use chat_hosted::{HostedClient, HostedConfig};
use chat_platform::{InMemoryCredentialStore, ScopedCredentialStore};

#[tokio::main]
async fn main() {
    let config = match HostedConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid backend configuration: {err}");
            eprintln!("Required: CHAT_BACKEND_URL and CHAT_BACKEND_ANON_KEY");
            std::process::exit(1);
        }
    };

    let store = ScopedCredentialStore::new(InMemoryCredentialStore::default(), "chat-smoke");
    let client = match HostedClient::new(config, store) {
        Ok(client) => client,
        Err(err) => {
            eprintln!("Failed to initialize hosted client: {err}");
            std::process::exit(1);
        }
    };
    println!("Hosted client initialized for {}", client.config.base_url);

    let (Ok(email), Ok(password)) = (env::var("CHAT_SMOKE_EMAIL"), env::var("CHAT_SMOKE_PASSWORD"))
    else {
        println!("Set CHAT_SMOKE_EMAIL and CHAT_SMOKE_PASSWORD to run the live smoke.");
        return;
    };

    let session = match client.sessions.sign_in_with_password(&email, &password).await {
        Ok(session) => session,
        Err(err) => {
            eprintln!("Sign-in failed: {err}");
            std::process::exit(1);
        }
    };
    println!("Signed in as {} ({})", session.email, session.user_id);

    let mut failed = false;
    match client.backend.fetch_conversation_list(&session.user_id).await {
        Ok(rows) => {
            println!("{} conversation(s)", rows.len());
            if let Some(first) = rows.first() {
                match client
                    .backend
                    .fetch_conversation(&first.conversation_id, &session.user_id)
                    .await
                {
                    Ok(conversation) => println!(
                        "Latest conversation with {} has {} message(s)",
                        first.peer.username,
                        conversation.messages.len()
                    ),
                    Err(err) => {
                        eprintln!("Conversation fetch failed: {err}");
                        failed = true;
                    }
                }
            }
        }
        Err(err) => {
            eprintln!("Conversation list fetch failed: {err}");
            failed = true;
        }
    }

    if let Err(err) = client.sessions.sign_out().await {
        eprintln!("Sign-out failed: {err}");
        failed = true;
    }
    if failed {
        std::process::exit(1);
    }
    println!("Smoke run passed");
}
