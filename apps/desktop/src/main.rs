use std::{collections::HashMap, fs, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    ApiGateway, ChatClient, ClientEvent, ConversationMessage, SessionStore,
    WebSocketPushConnector,
};
use shared::domain::UserId;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use url::Url;
use uuid::Uuid;

#[derive(Parser, Debug)]
struct Args {
    /// Backend base URL; overrides client.toml and SERVER_URL.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    email: String,
    #[arg(long)]
    password: String,
    /// Start or resume a conversation with this user instead of the most
    /// recent one.
    #[arg(long)]
    recipient: Option<Uuid>,
}

struct Settings {
    server_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8000".into(),
        }
    }
}

fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("client.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("server_url") {
                settings.server_url = v.clone();
            }
        }
    }

    if let Ok(v) = std::env::var("SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("APP__SERVER_URL") {
        settings.server_url = v;
    }

    settings
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    let base_url = Url::parse(&settings.server_url)
        .with_context(|| format!("invalid server url: {}", settings.server_url))?;

    let session = Arc::new(SessionStore::new());
    let gateway = Arc::new(ApiGateway::new(base_url.clone(), session));
    let connector = Arc::new(WebSocketPushConnector::new(base_url));
    let client = ChatClient::new(gateway, connector);

    let profile = client.login(&args.email, &args.password).await?;
    println!(
        "Logged in as {} {} <{}>",
        profile.first_name, profile.last_name, profile.email
    );

    let summary = match args.recipient {
        Some(recipient) => client.open_with(UserId(recipient)).await?,
        None => {
            let conversations = client.conversations().await?;
            let Some(summary) = conversations.into_iter().next() else {
                println!("No conversations yet; pass --recipient to start one.");
                return Ok(());
            };
            client.select_conversation(summary.clone()).await?;
            summary
        }
    };
    println!(
        "Chatting with {} {} (type /quit to exit)",
        summary.other_user.first_name, summary.other_user.last_name
    );

    for message in client.messages().await {
        print_message(&message);
    }

    let mut events = client.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ClientEvent::MessageAppended { message, .. }) if !message.own => {
                    print_message(&message);
                }
                Ok(ClientEvent::SendFailed { content, .. }) => {
                    println!("(send failed, kept as draft: {content})");
                }
                Ok(ClientEvent::SessionInvalidated) => {
                    println!("Session expired; please log in again.");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("event stream ended: {err}");
                    break;
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim() == "/quit" {
            break;
        }
        if let Err(err) = client.send_message(&line).await {
            eprintln!("send failed: {err}");
        }
    }

    client.close_conversation().await;
    Ok(())
}

fn print_message(message: &ConversationMessage) {
    let origin = if message.own { "you" } else { "them" };
    println!(
        "[{}] {}: {}",
        message.sent_at.format("%H:%M"),
        origin,
        message.content
    );
}
