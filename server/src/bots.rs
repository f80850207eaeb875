//! Bot Configuration
//!
//! Maps each source id to the bot that answers for it. Loaded once at startup
//! from a JSON file and shared read-only afterwards.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;

/// One configured bot.
#[derive(Clone, Deserialize)]
pub struct BotConfig {
    /// Source id (the Slack app id) events for this bot arrive under.
    pub source_id: String,
    pub name: String,
    /// The bot's own user id, used to drop self-authored messages.
    pub bot_user_id: String,
    /// Web API token used to reply.
    pub bot_token: String,
    /// Channels the bot responds in.
    pub allowed_channels: HashSet<String>,
    /// Directory the automation runs in.
    pub working_directory: PathBuf,
}

impl BotConfig {
    pub fn allows_channel(&self, channel: &str) -> bool {
        self.allowed_channels.contains(channel)
    }
}

impl std::fmt::Debug for BotConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotConfig")
            .field("source_id", &self.source_id)
            .field("name", &self.name)
            .field("bot_user_id", &self.bot_user_id)
            .field("bot_token", &"[REDACTED]")
            .field("allowed_channels", &self.allowed_channels)
            .field("working_directory", &self.working_directory)
            .finish()
    }
}

#[derive(Deserialize)]
struct BotsFile {
    bots: Vec<BotConfig>,
}

/// Read-only lookup from source id to bot.
#[derive(Debug, Clone, Default)]
pub struct BotRegistry {
    bots: Arc<HashMap<String, Arc<BotConfig>>>,
}

impl BotRegistry {
    /// Build a registry from already-parsed bots.
    ///
    /// # Errors
    /// Fails on duplicate source ids or blank required fields.
    pub fn from_bots(bots: Vec<BotConfig>) -> anyhow::Result<Self> {
        let mut map = HashMap::with_capacity(bots.len());
        for bot in bots {
            anyhow::ensure!(!bot.source_id.trim().is_empty(), "bot '{}' has no source_id", bot.name);
            anyhow::ensure!(
                !bot.bot_user_id.trim().is_empty(),
                "bot '{}' has no bot_user_id",
                bot.name
            );
            let source_id = bot.source_id.clone();
            if map.insert(source_id.clone(), Arc::new(bot)).is_some() {
                anyhow::bail!("duplicate bot source_id '{source_id}'");
            }
        }
        Ok(Self { bots: Arc::new(map) })
    }

    /// Parse the `{"bots": [...]}` JSON document.
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let file: BotsFile = serde_json::from_str(raw).context("invalid bots configuration")?;
        Self::from_bots(file.bots)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read bots configuration {}", path.display()))?;
        Self::from_json(&raw)
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<BotConfig>> {
        self.bots.get(source_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.bots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bots.is_empty()
    }
}
