//! The fixed worker executable. One process per instance: the host passes
//! the instance's manifest path and the worker loads everything else as
//! data at startup.

use std::sync::{Arc, OnceLock};

use anyhow::Context as _;
use aviary_instance::{ActivityKind, PresenceStatus};
use serenity::all::{
    ActivityData, Client, Context, EventHandler, GatewayIntents, Message, OnlineStatus, Ready,
    UserId,
};
use serenity::async_trait;

mod completion;
mod gateway;
mod memory;
mod runtime;

use completion::HttpCompletion;
use gateway::DiscordGateway;
use memory::MemoryStore;
use runtime::{InboundMessage, Runtime};

struct Handler {
    runtime: Arc<Runtime<HttpCompletion>>,
    // Filled in at ready; needed to recognize and strip mentions.
    bot_user: OnceLock<UserId>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        tracing::info!("{} is connected to the gateway", ready.user.name);
        let _ = self.bot_user.set(ready.user.id);

        let presence = &self.runtime.config().presence;
        let activity = match presence.kind {
            ActivityKind::Playing => ActivityData::playing(&presence.activity),
            ActivityKind::Listening => ActivityData::listening(&presence.activity),
            ActivityKind::Watching => ActivityData::watching(&presence.activity),
            ActivityKind::Custom => ActivityData::custom(&presence.activity),
        };
        let status = match presence.status {
            PresenceStatus::Online => OnlineStatus::Online,
            PresenceStatus::Idle => OnlineStatus::Idle,
            PresenceStatus::Dnd => OnlineStatus::DoNotDisturb,
            PresenceStatus::Invisible => OnlineStatus::Invisible,
        };
        ctx.set_presence(Some(activity), status);
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }

        let Some(&me) = self.bot_user.get() else {
            return;
        };
        let is_dm = msg.guild_id.is_none();
        let mentioned = msg.mentions.iter().any(|u| u.id == me);
        if !is_dm && !mentioned {
            return;
        }

        let mut content = msg.content.clone();
        if mentioned {
            content = content
                .replace(&format!("<@{me}>"), "")
                .replace(&format!("<@!{me}>"), "");
        }

        let inbound = InboundMessage {
            channel_id: msg.channel_id.get(),
            message_id: msg.id.get(),
            author_id: msg.author.id.get(),
            author_name: msg.author.name.clone(),
            content: content.trim().to_string(),
        };
        let gateway = Arc::new(DiscordGateway::new(ctx.http.clone()));
        self.runtime.handle_event(&gateway, inbound).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let manifest_path = std::env::args()
        .nth(1)
        .context("usage: aviary-worker <manifest-path>")?;
    let text = tokio::fs::read_to_string(&manifest_path)
        .await
        .with_context(|| format!("read manifest {manifest_path}"))?;
    let config = aviary_instance::manifest::extract(&text).context("extract instance config")?;

    tracing::info!(instance = %config.id, name = %config.display_name, "worker starting");

    let memory_dir = aviary_instance::memory_dir(&aviary_instance::data_root());
    let memory = MemoryStore::new(memory_dir, config.id.clone(), config.limits.history_limit);
    let completion = HttpCompletion::new(config.completion.clone());
    let runtime = Arc::new(Runtime::new(config.clone(), memory, completion));

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::DIRECT_MESSAGES;
    let mut client = Client::builder(&config.credential, intents)
        .event_handler(Handler {
            runtime,
            bot_user: OnceLock::new(),
        })
        .await
        .context("build gateway client")?;

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        tracing::info!("shutting down");
        shard_manager.shutdown_all().await;
    });

    client.start().await.context("gateway connection ended")?;
    Ok(())
}

// The host stops workers with SIGTERM; ctrl-c covers interactive runs.
#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
