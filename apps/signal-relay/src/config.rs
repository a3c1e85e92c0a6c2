use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Where negotiation records are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Redis,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(StoreBackend::Memory),
            "redis" => Ok(StoreBackend::Redis),
            other => Err(format!("unknown store backend {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub store_backend: StoreBackend,
    pub redis_url: String,
    pub session_ttl_seconds: u64,
    pub store_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub default_room: String,
    pub ice_servers: Vec<String>,
    pub debug_feed_capacity: usize,
}

fn parsed<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|val| val.trim().parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let ice_servers = env::var("ICE_SERVERS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .unwrap_or(defaults.ice_servers);

        Self {
            port: parsed("RELAY_PORT").unwrap_or(defaults.port),
            bind: env::var("RELAY_BIND").unwrap_or(defaults.bind),
            store_backend: parsed("STORE_BACKEND").unwrap_or(defaults.store_backend),
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            session_ttl_seconds: parsed("SESSION_TTL").unwrap_or(defaults.session_ttl_seconds),
            store_timeout_ms: parsed("STORE_TIMEOUT_MS").unwrap_or(defaults.store_timeout_ms),
            write_timeout_ms: parsed("WRITE_TIMEOUT_MS").unwrap_or(defaults.write_timeout_ms),
            default_room: env::var("DEFAULT_ROOM")
                .ok()
                .filter(|room| !room.trim().is_empty())
                .unwrap_or(defaults.default_room),
            ice_servers,
            debug_feed_capacity: parsed::<usize>("DEBUG_FEED_CAPACITY")
                .filter(|capacity| *capacity > 0)
                .unwrap_or(defaults.debug_feed_capacity),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 7001,
            bind: "0.0.0.0".to_string(),
            store_backend: StoreBackend::Memory,
            redis_url: "redis://localhost:6379".to_string(),
            session_ttl_seconds: 2_592_000, // 30 days
            store_timeout_ms: 2_000,
            write_timeout_ms: 10_000,
            default_room: "room-id".to_string(),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            debug_feed_capacity: 64,
        }
    }
}
