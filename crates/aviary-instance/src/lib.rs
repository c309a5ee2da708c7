use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod manifest;

/// Stable instance identifier assigned at creation.
///
/// NOTE: This is opaque to callers. File names and memory prefixes are
/// derived from it, so it never changes after creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    /// Upper bound on the rendered reply, in characters.
    pub max_response_chars: usize,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.9,
            presence_penalty: 0.6,
            frequency_penalty: 0.7,
            max_response_chars: 4000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Retained conversation history per user, counted in (user, assistant) pairs.
    pub history_limit: usize,
    /// Hard timeout per completion attempt.
    pub request_timeout_ms: u64,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Quiet window per conversation after a request finishes.
    pub cooldown_ms: u64,
    /// Interval of the liveness (typing) signal while a request is pending.
    pub typing_interval_ms: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            history_limit: 10,
            request_timeout_ms: 30_000,
            max_retries: 3,
            cooldown_ms: 3_000,
            typing_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionSettings {
    /// Chat-completions endpoint, e.g. `https://host/v1/chat/completions`.
    pub url: String,
    /// Bearer token sent with every completion request.
    pub api_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Idle,
    Dnd,
    Invisible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Playing,
    Listening,
    Watching,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceSettings {
    pub status: PresenceStatus,
    pub activity: String,
    pub kind: ActivityKind,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            status: PresenceStatus::Online,
            activity: "with humans".to_string(),
            kind: ActivityKind::Playing,
        }
    }
}

pub const DEFAULT_MODEL: &str = "anubis-pro-105b-v1";

/// Full per-instance configuration. One of these is embedded in each
/// instance manifest and is everything a worker needs to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: InstanceId,
    pub owner_id: String,
    pub display_name: String,
    /// Auth secret for the chat gateway.
    pub credential: String,
    pub model_id: String,
    pub system_instruction: String,
    #[serde(default)]
    pub generation: GenerationParams,
    #[serde(default)]
    pub limits: ResourceLimits,
    pub completion: CompletionSettings,
    #[serde(default)]
    pub presence: PresenceSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Creation input. Unset sections fall back to defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewInstance {
    pub display_name: String,
    pub credential: String,
    pub system_instruction: String,
    pub completion: CompletionSettings,
    pub model_id: Option<String>,
    pub generation: Option<GenerationParams>,
    pub limits: Option<ResourceLimits>,
    pub presence: Option<PresenceSettings>,
}

/// Partial update. Only provided fields are merged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstanceUpdate {
    pub display_name: Option<String>,
    pub credential: Option<String>,
    pub model_id: Option<String>,
    pub system_instruction: Option<String>,
    pub generation: Option<GenerationParams>,
    pub limits: Option<ResourceLimits>,
    pub completion: Option<CompletionSettings>,
    pub presence: Option<PresenceSettings>,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid instance config: {0}")]
pub struct ValidationError(pub String);

fn clamp_limits(mut l: ResourceLimits) -> ResourceLimits {
    l.history_limit = l.history_limit.clamp(1, 200);
    l.request_timeout_ms = l.request_timeout_ms.clamp(1_000, 600_000);
    l.max_retries = l.max_retries.min(10);
    l.cooldown_ms = l.cooldown_ms.min(600_000);
    l.typing_interval_ms = l.typing_interval_ms.clamp(1_000, 60_000);
    l
}

fn clamp_generation(mut g: GenerationParams) -> GenerationParams {
    g.temperature = g.temperature.clamp(0.0, 2.0);
    g.presence_penalty = g.presence_penalty.clamp(-2.0, 2.0);
    g.frequency_penalty = g.frequency_penalty.clamp(-2.0, 2.0);
    g.max_response_chars = g.max_response_chars.clamp(1, 100_000);
    g
}

impl NewInstance {
    pub fn into_config(self, owner_id: &str) -> Result<InstanceConfig, ValidationError> {
        let now = Utc::now();
        let config = InstanceConfig {
            id: InstanceId::new(),
            owner_id: owner_id.to_string(),
            display_name: self.display_name,
            credential: self.credential,
            model_id: self
                .model_id
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            system_instruction: self.system_instruction,
            generation: clamp_generation(self.generation.unwrap_or_default()),
            limits: clamp_limits(self.limits.unwrap_or_default()),
            completion: self.completion,
            presence: self.presence.unwrap_or_default(),
            created_at: now,
            updated_at: now,
        };
        config.validate()?;
        Ok(config)
    }
}

impl InstanceConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.display_name.trim().is_empty() {
            return Err(ValidationError("display name must be non-empty".into()));
        }
        if self.owner_id.trim().is_empty() {
            return Err(ValidationError("owner id must be non-empty".into()));
        }
        if self.credential.trim().is_empty() {
            return Err(ValidationError("gateway credential must be non-empty".into()));
        }
        if self.completion.url.trim().is_empty() {
            return Err(ValidationError("completion url must be non-empty".into()));
        }
        Ok(())
    }

    /// Merge a partial update. The id, owner and created_at never change.
    pub fn apply(&mut self, update: InstanceUpdate) {
        if let Some(v) = update.display_name {
            self.display_name = v;
        }
        if let Some(v) = update.credential {
            self.credential = v;
        }
        if let Some(v) = update.model_id {
            self.model_id = v;
        }
        if let Some(v) = update.system_instruction {
            self.system_instruction = v;
        }
        if let Some(v) = update.generation {
            self.generation = clamp_generation(v);
        }
        if let Some(v) = update.limits {
            self.limits = clamp_limits(v);
        }
        if let Some(v) = update.completion {
            self.completion = v;
        }
        if let Some(v) = update.presence {
            self.presence = v;
        }
        self.updated_at = Utc::now();
    }
}

/// Root of all persisted state. Overridable for tests and packaging.
pub fn data_root() -> std::path::PathBuf {
    let raw = std::env::var("AVIARY_DATA_ROOT").unwrap_or_else(|_| "./data".to_string());
    let p = std::path::PathBuf::from(raw);
    let abs = if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| std::path::PathBuf::from("."))
            .join(p)
    };

    // Best-effort canonicalization: don't fail if the directory doesn't exist yet.
    std::fs::canonicalize(&abs).unwrap_or(abs)
}

pub fn instances_dir(data_root: &std::path::Path) -> std::path::PathBuf {
    data_root.join("instances")
}

pub fn memory_dir(data_root: &std::path::Path) -> std::path::PathBuf {
    data_root.join("memory")
}

/// Memory file name for one (instance, user) conversation.
pub fn memory_file_name(id: &InstanceId, user_id: u64) -> String {
    format!("{}_{}.json", id.0, user_id)
}

/// Prefix shared by all of an instance's memory files. Deletion enumerates
/// by this prefix and must touch nothing else.
pub fn memory_file_prefix(id: &InstanceId) -> String {
    format!("{}_", id.0)
}
