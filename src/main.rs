use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

use market_chat::api::{Message, NotificationEvent};
use market_chat::channel::{channel_name, user_channel_name};
use market_chat::chat::{ChatSession, ChatSnapshot, ChatState, Phase};
use market_chat::config::AppConfig;
use market_chat::notify::{NotificationClient, StaticSession};
use market_chat::storage::MessageCache;
use market_chat::{Error, Result};

#[derive(Parser)]
#[command(name = "market-chat", version, about = "Marketplace chat client")]
struct Cli {
    /// Config file; defaults to market-chat.toml in the user config dir.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// User to act as, overriding `user_id` from the config.
    #[arg(long = "as", global = true, value_name = "USER")]
    as_user: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file.
    Init,
    /// Print the chat channel for two users, or the notification channel for one.
    Channel { a: String, b: Option<String> },
    /// Print the conversation with another user.
    History {
        #[arg(long = "with", value_name = "USER")]
        with: String,
    },
    /// Chat with another user; every stdin line is sent, `/quit` leaves.
    Chat {
        #[arg(long = "with", value_name = "USER")]
        with: String,
    },
    /// Print notifications for the signed-in user.
    Notify,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = run(Cli::parse()).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    let user = cli.as_user.clone().or_else(|| config.user_id.clone());

    match cli.command {
        Command::Init => {
            let path = cli
                .config
                .or_else(AppConfig::default_path)
                .ok_or_else(|| Error::Config("no config directory available".into()))?;
            if path.exists() {
                println!("{} already exists", path.display());
            } else {
                AppConfig::default().save_to(&path)?;
                println!("wrote {}", path.display());
            }
        }
        Command::Channel { a, b } => match b {
            Some(b) => println!("{}", channel_name(&a, &b)),
            None => println!("{}", user_channel_name(&a)),
        },
        Command::History { with } => history(&config, &require_user(user)?, &with).await?,
        Command::Chat { with } => chat(&config, &require_user(user)?, &with).await?,
        Command::Notify => notify(&config, user).await?,
    }
    Ok(())
}

fn require_user(user: Option<String>) -> Result<String> {
    user.filter(|u| !u.is_empty())
        .ok_or_else(|| Error::Config("no user given: pass --as or set user_id".into()))
}

fn print_messages(messages: &[Message]) {
    for m in messages {
        println!("[{}] {}: {}", m.timestamp, m.sender_id, m.content);
    }
}

fn open_cache() -> Option<MessageCache> {
    match MessageCache::open_default() {
        Ok(cache) => Some(cache),
        Err(e) => {
            warn!("history cache unavailable: {}", e);
            None
        }
    }
}

async fn history(config: &AppConfig, user: &str, with: &str) -> Result<()> {
    let state = ChatState::with_timeout(Arc::new(config.api_client()?), config.request_timeout());
    let channel = channel_name(user, with);
    let mut cache = open_cache();

    let phase = state.activate(user, Some(with)).await;
    let snapshot = state.snapshot().await;
    if phase == Phase::Ready {
        if let Some(cache) = cache.as_mut() {
            if let Err(e) = cache.store_history(&channel, &snapshot.messages) {
                warn!("could not cache history: {}", e);
            }
        }
        print_messages(&snapshot.messages);
        return Ok(());
    }

    if let Some(err) = &snapshot.error {
        eprintln!("{}", err);
    }
    if let Some(cache) = &cache {
        let cached = cache.load_history(&channel)?;
        if !cached.is_empty() {
            eprintln!("showing {} cached messages", cached.len());
            print_messages(&cached);
        }
    }
    Ok(())
}

async fn chat(config: &AppConfig, user: &str, with: &str) -> Result<()> {
    let state = ChatState::with_timeout(Arc::new(config.api_client()?), config.request_timeout());
    let stomp = match config.stomp_config(user) {
        Ok(stomp) => Some(stomp),
        Err(e) => {
            warn!("live updates disabled: {}", e);
            None
        }
    };
    let mut session = ChatSession::new(state, stomp);

    session.activate(user, Some(with)).await;
    let mut shown = Shown::default();
    shown.update(&session.state().snapshot().await);
    info!("chatting with {} on {}; /quit to leave", with, channel_name(user, with));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut refresh = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line == "/quit" {
                    break;
                }
                if !line.is_empty() {
                    // Failures land in the snapshot error and are printed below.
                    let _ = session.send_message(line).await;
                }
            }
            _ = refresh.tick() => {}
        }
        shown.update(&session.state().snapshot().await);
    }

    session.deactivate().await;
    Ok(())
}

/// Tracks what the terminal already shows.
#[derive(Default)]
struct Shown {
    count: usize,
    error: Option<String>,
}

impl Shown {
    fn update(&mut self, snapshot: &ChatSnapshot) {
        if snapshot.messages.len() > self.count {
            print_messages(&snapshot.messages[self.count..]);
        }
        self.count = snapshot.messages.len();
        if snapshot.error != self.error {
            if let Some(err) = &snapshot.error {
                eprintln!("{}", err);
            }
            self.error = snapshot.error.clone();
        }
    }
}

async fn notify(config: &AppConfig, user: Option<String>) -> Result<()> {
    let session = StaticSession(user);
    let client = NotificationClient::new(&session, config.notifications.as_ref(), config.api_client()?)?;
    let (mut handle, mut events) = client.connect().await?;
    let channel = handle.subscribe_user().await?;
    info!("listening on {}", channel);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(NotificationEvent::Notification { channel, event, data }) => {
                    println!("[{}] {}: {}", channel, event, data);
                }
                Some(NotificationEvent::Error(reason)) => warn!("{}", reason),
                None => break,
            },
        }
    }

    handle.disconnect().await;
    Ok(())
}
