use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

use crate::game::constants::{lifecycle, net, rules};
use crate::lobby::{ActorSettings, DirectorySettings};
use crate::net::api::ApiSettings;
use crate::net::connection::Liveness;

/// Server configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub bind_address: IpAddr,
    /// WebTransport port
    pub port: u16,
    pub api_port: u16,
    pub metrics_port: u16,
    /// Base URL handed out in join endpoints
    pub public_join_url: String,
    pub default_target_score: u32,
    pub max_participants: usize,
    pub max_sessions: usize,
    pub actor_mailbox_capacity: usize,
    pub connection_mailbox_capacity: usize,
    pub actor_tick: Duration,
    pub idle_grace: Duration,
    pub sweep_interval: Duration,
    pub eviction_timeout: Duration,
    pub ping_period: Duration,
    pub pong_wait: Duration,
    pub write_wait: Duration,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 4433,
            api_port: 8080,
            metrics_port: 9090,
            public_join_url: "https://localhost:4433".to_string(),
            default_target_score: rules::DEFAULT_TARGET_SCORE,
            max_participants: rules::MAX_PARTICIPANTS,
            max_sessions: lifecycle::MAX_SESSIONS,
            actor_mailbox_capacity: lifecycle::ACTOR_MAILBOX_CAPACITY,
            connection_mailbox_capacity: net::CONNECTION_MAILBOX_CAPACITY,
            actor_tick: lifecycle::ACTOR_TICK_INTERVAL,
            idle_grace: lifecycle::IDLE_GRACE,
            sweep_interval: lifecycle::SWEEP_INTERVAL,
            eviction_timeout: lifecycle::EVICTION_TIMEOUT,
            ping_period: net::PING_PERIOD,
            pong_wait: net::PONG_WAIT,
            write_wait: net::WRITE_WAIT,
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

/// Parse `key` if set; keep `current` and warn when the value is invalid
fn env_or<T, F>(key: &str, current: T, valid: F, expected: &str) -> T
where
    T: FromStr,
    F: Fn(&T) -> bool,
{
    let Ok(raw) = std::env::var(key) else {
        return current;
    };
    match raw.parse::<T>() {
        Ok(parsed) if valid(&parsed) => parsed,
        Ok(_) => {
            tracing::warn!("{} must be {}, using default", key, expected);
            current
        }
        Err(_) => {
            tracing::warn!("Invalid {} '{}', using default", key, raw);
            current
        }
    }
}

fn env_secs(key: &str, current: Duration) -> Duration {
    let secs = env_or(key, current.as_secs(), |s| *s > 0, "> 0 seconds");
    Duration::from_secs(secs)
}

impl ServerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        config.bind_address = env_or("BIND_ADDRESS", config.bind_address, |_| true, "an IP address");
        config.port = env_or("PORT", config.port, |p| *p > 0, "> 0");
        config.api_port = env_or("API_PORT", config.api_port, |p| *p > 0, "> 0");
        config.metrics_port = env_or("METRICS_PORT", config.metrics_port, |p| *p > 0, "> 0");

        if let Ok(url) = std::env::var("PUBLIC_JOIN_URL") {
            config.public_join_url = url;
        }

        config.default_target_score = env_or(
            "DEFAULT_TARGET_SCORE",
            config.default_target_score,
            |t| *t > 0,
            "> 0",
        );
        config.max_participants = env_or(
            "MAX_PARTICIPANTS",
            config.max_participants,
            |n| *n >= rules::MIN_PARTICIPANTS && *n <= 16,
            "2-16",
        );
        config.max_sessions = env_or(
            "MAX_SESSIONS",
            config.max_sessions,
            |n| *n > 0 && *n <= 100_000,
            "1-100000",
        );
        config.actor_mailbox_capacity = env_or(
            "ACTOR_MAILBOX_CAPACITY",
            config.actor_mailbox_capacity,
            |n| *n > 0,
            "> 0",
        );
        config.connection_mailbox_capacity = env_or(
            "CONNECTION_MAILBOX_CAPACITY",
            config.connection_mailbox_capacity,
            |n| *n > 0,
            "> 0",
        );

        config.actor_tick = env_secs("ACTOR_TICK_SECS", config.actor_tick);
        config.idle_grace = env_secs("IDLE_GRACE_SECS", config.idle_grace);
        config.sweep_interval = env_secs("SWEEP_INTERVAL_SECS", config.sweep_interval);
        config.eviction_timeout = env_secs("EVICTION_TIMEOUT_SECS", config.eviction_timeout);
        config.ping_period = env_secs("PING_PERIOD_SECS", config.ping_period);
        config.pong_wait = env_secs("PONG_WAIT_SECS", config.pong_wait);
        config.write_wait = env_secs("WRITE_WAIT_SECS", config.write_wait);

        if let Ok(cert_path) = std::env::var("TLS_CERT_PATH") {
            config.tls_cert_path = Some(cert_path);
        }

        if let Ok(key_path) = std::env::var("TLS_KEY_PATH") {
            config.tls_key_path = Some(key_path);
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("Port cannot be 0".to_string());
        }
        if self.port == self.api_port || self.port == self.metrics_port || self.api_port == self.metrics_port {
            return Err("PORT, API_PORT and METRICS_PORT must differ".to_string());
        }
        if self.max_participants < rules::MIN_PARTICIPANTS {
            return Err(format!(
                "max_participants must be at least {}",
                rules::MIN_PARTICIPANTS
            ));
        }
        if self.max_sessions == 0 {
            return Err("max_sessions must be at least 1".to_string());
        }
        if self.ping_period >= self.pong_wait {
            return Err("ping_period must be shorter than pong_wait".to_string());
        }
        if self.tls_cert_path.is_some() != self.tls_key_path.is_some() {
            return Err("TLS_CERT_PATH and TLS_KEY_PATH must be set together".to_string());
        }
        Ok(())
    }

    pub fn actor_settings(&self) -> ActorSettings {
        ActorSettings {
            mailbox_capacity: self.actor_mailbox_capacity,
            tick_interval: self.actor_tick,
            idle_grace: self.idle_grace,
        }
    }

    pub fn directory_settings(&self) -> DirectorySettings {
        DirectorySettings {
            actor: self.actor_settings(),
            max_sessions: self.max_sessions,
            default_target: self.default_target_score,
            max_participants: self.max_participants,
        }
    }

    pub fn liveness(&self) -> Liveness {
        Liveness {
            ping_period: self.ping_period,
            pong_wait: self.pong_wait,
            write_wait: self.write_wait,
        }
    }

    pub fn api_settings(&self) -> ApiSettings {
        ApiSettings {
            public_join_url: self.public_join_url.clone(),
        }
    }
}
