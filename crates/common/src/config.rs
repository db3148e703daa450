use std::env;
use std::str::FromStr;

use crate::error::{Result, VoxError};

/// Which session table this deployment reads its credentials from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Prod,
    Dev1,
    Dev2,
}

impl Mode {
    pub fn session_table(self) -> &'static str {
        match self {
            Mode::Prod => "bots",
            Mode::Dev1 => "bots_dev_1",
            Mode::Dev2 => "bots_dev_2",
        }
    }
}

impl FromStr for Mode {
    type Err = VoxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PROD" => Ok(Mode::Prod),
            "DEV_1" => Ok(Mode::Dev1),
            "DEV_2" => Ok(Mode::Dev2),
            other => Err(VoxError::Config(format!("unknown MODE {other:?}"))),
        }
    }
}

/// Process configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,

    pub clickhouse_host: String,
    pub clickhouse_port: u16,
    pub clickhouse_password: String,

    /// This shard's index.
    pub shard: u32,
    pub shard_host: String,
    pub shard_port: u16,
    /// `host:port` for every shard, indexed by shard number (controller side).
    pub shard_endpoints: Vec<String>,

    pub controller_host: String,
    pub controller_port: u16,

    /// Sessions loaded per shard.
    pub active_sessions: usize,
    /// Join cap per session.
    pub max_chats_per_session: usize,
    /// Discovery member-count threshold for groups.
    pub min_chat_members: i64,
    /// Discovery member-count threshold for channels.
    pub min_channel_members: i64,

    pub auto_discover: bool,
    pub read_only: bool,
    /// Best-effort vote on anonymous open polls. Off by default: voting is a
    /// visible side effect on the remote network.
    pub poll_auto_vote: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            mode: required("MODE")?.parse()?,
            clickhouse_host: required("CLICKHOUSE_HOST")?,
            clickhouse_port: parsed("CLICKHOUSE_PORT", 9440)?,
            clickhouse_password: required("CLICKHOUSE_PASSWORD")?,
            shard: parsed("SHARD_NUM", 0)?,
            shard_host: env_or("SHARD_HOST", "0.0.0.0"),
            shard_port: parsed("SHARD_PORT", 8001)?,
            shard_endpoints: parse_endpoints(&env_or("SHARD_ENDPOINTS", "")),
            controller_host: env_or("CONTROLLER_HOST", "0.0.0.0"),
            controller_port: parsed("CONTROLLER_PORT", 8002)?,
            active_sessions: parsed("ACTIVE_BOTS_COUNT", 3)?,
            max_chats_per_session: parsed("MAX_CHATS_FOR_BOT", 200)?,
            min_chat_members: parsed("MIN_CHAT_MEMBERS_COUNT", 300)?,
            min_channel_members: parsed("MIN_CHANNEL_MEMBERS_COUNT", 5000)?,
            auto_discover: flag("AUTO_DISCOVER"),
            read_only: flag("READ_ONLY"),
            poll_auto_vote: flag("POLL_AUTO_VOTE"),
        })
    }

    pub fn clickhouse_url(&self) -> String {
        format!("https://{}:{}", self.clickhouse_host, self.clickhouse_port)
    }

    pub fn shard_bind_addr(&self) -> String {
        format!("{}:{}", self.shard_host, self.shard_port)
    }

    pub fn controller_bind_addr(&self) -> String {
        format!("{}:{}", self.controller_host, self.controller_port)
    }
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| VoxError::Config(format!("{name} is not set")))
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parsed<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| VoxError::Config(format!("invalid {name}: {raw:?}"))),
        Err(_) => Ok(default),
    }
}

fn flag(name: &str) -> bool {
    matches!(
        env::var(name).unwrap_or_default().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_endpoints(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
