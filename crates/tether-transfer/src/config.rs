use std::time::Duration;

use crate::protocol::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};

/// Default number of consecutive link failures tolerated before giving up.
pub const DEFAULT_MAX_RECONNECTS: u32 = 3;

/// Default pause between a link failure and the next attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(2000);

/// How transfer frames are laid out on the data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// One tag byte in front of every frame.
    #[default]
    Tagged,
    /// Bare JSON metadata and raw chunks. A chunk that happens to parse as
    /// metadata JSON is misread, so abort notices are never sent.
    Legacy,
}

impl Framing {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tagged" => Some(Self::Tagged),
            "legacy" => Some(Self::Legacy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub framing: Framing,
    pub require_consent: bool,
    pub abort_notice: bool,
}

impl TransferConfig {
    /// Clamp the chunk size into the range data channels accept.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        self
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(size) = env_parse::<usize>("TETHER_CHUNK_SIZE") {
            config = config.with_chunk_size(size);
        }
        if let Some(framing) = std::env::var("TETHER_FRAMING")
            .ok()
            .and_then(|v| Framing::parse(&v))
        {
            config.framing = framing;
        }
        if let Some(flag) = env_flag("TETHER_REQUIRE_CONSENT") {
            config.require_consent = flag;
        }
        if let Some(flag) = env_flag("TETHER_ABORT_NOTICE") {
            config.abort_notice = flag;
        }
        config
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            framing: Framing::Tagged,
            require_consent: false,
            abort_notice: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub max_reconnects: u32,
    pub reconnect_delay: Duration,
}

impl ConnectionConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(max) = env_parse::<u32>("TETHER_MAX_RECONNECTS") {
            config.max_reconnects = max;
        }
        if let Some(ms) = env_parse::<u64>("TETHER_RECONNECT_DELAY_MS") {
            config.reconnect_delay = Duration::from_millis(ms);
        }
        config
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_reconnects: DEFAULT_MAX_RECONNECTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring unparseable {}={:?}", key, raw);
            None
        }
    }
}

fn env_flag(key: &str) -> Option<bool> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!("Ignoring unparseable {}={:?}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_size_clamped() {
        assert_eq!(TransferConfig::default().with_chunk_size(1).chunk_size, MIN_CHUNK_SIZE);
        assert_eq!(TransferConfig::default().with_chunk_size(1 << 20).chunk_size, MAX_CHUNK_SIZE);
        assert_eq!(TransferConfig::default().with_chunk_size(32_768).chunk_size, 32_768);
    }

    #[test]
    fn test_framing_parse() {
        assert_eq!(Framing::parse("Legacy"), Some(Framing::Legacy));
        assert_eq!(Framing::parse(" tagged "), Some(Framing::Tagged));
        assert_eq!(Framing::parse("json"), None);
    }
}
