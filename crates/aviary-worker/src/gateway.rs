//! Chat gateway seam.
//!
//! The runtime only ever needs two operations: fire the typing indicator
//! and deliver a message. Send failures are logged and swallowed so a
//! gateway hiccup stays contained to the one conversation it happened in.

use std::sync::Arc;

use serenity::all::{
    ChannelId, CreateAllowedMentions, CreateMessage, Http, MessageId, MessageReference,
};
use serenity::async_trait;

#[async_trait]
pub trait Gateway: Send + Sync + 'static {
    /// Fire the transient typing indicator once.
    async fn send_typing(&self, channel_id: u64);

    /// Deliver a message. `reply_to` threads it onto the triggering message.
    async fn send_message(&self, channel_id: u64, reply_to: Option<u64>, content: &str);
}

pub struct DiscordGateway {
    http: Arc<Http>,
}

impl DiscordGateway {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Gateway for DiscordGateway {
    async fn send_typing(&self, channel_id: u64) {
        if let Err(err) = ChannelId::new(channel_id).broadcast_typing(&self.http).await {
            tracing::debug!(channel = channel_id, error = %err, "typing signal failed");
        }
    }

    async fn send_message(&self, channel_id: u64, reply_to: Option<u64>, content: &str) {
        let channel = ChannelId::new(channel_id);
        let mut builder = CreateMessage::new()
            .content(content)
            .allowed_mentions(CreateAllowedMentions::new());
        if let Some(message_id) = reply_to {
            builder = builder
                .reference_message(MessageReference::from((channel, MessageId::new(message_id))));
        }
        if let Err(err) = channel.send_message(&self.http, builder).await {
            tracing::warn!(channel = channel_id, error = %err, "failed to deliver reply");
        }
    }
}
