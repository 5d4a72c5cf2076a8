//! Process configuration, read from env vars with defaults — the same
//! pattern the teacher uses for `AGENTICLAW_GATEWAY_TOKEN` / `AGENTICLAW_MODEL`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Gateway bind/auth configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub bind: BindMode,
    #[serde(default)]
    pub auth: AuthConfig,
}

fn default_port() -> u16 {
    18789
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: BindMode::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self {
            port: env_or("CHORUS_PORT", default_port()),
            bind: if std::env::var("CHORUS_LAN").is_ok() {
                BindMode::Lan
            } else {
                BindMode::Loopback
            },
            auth: AuthConfig::from_env(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    #[default]
    Loopback,
    Lan,
}

impl BindMode {
    pub fn to_addr(&self) -> &str {
        match self {
            BindMode::Loopback => "127.0.0.1",
            BindMode::Lan => "0.0.0.0",
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    pub token: Option<String>,
}

impl AuthConfig {
    fn from_env() -> Self {
        match std::env::var("CHORUS_GATEWAY_TOKEN") {
            Ok(token) if !token.is_empty() => Self {
                mode: AuthMode::Token,
                token: Some(token),
            },
            _ => Self {
                mode: AuthMode::None,
                token: None,
            },
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    Token,
    #[default]
    None,
}

/// Browser Runtime tuning (§4.C). Directories are created lazily on first
/// use, not at config-load time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrowserConfig {
    pub idle_timeout: Duration,
    pub action_timeout: Duration,
    pub download_dir: std::path::PathBuf,
    pub screenshot_dir: std::path::PathBuf,
    pub console_log_dir: std::path::PathBuf,
    /// `None` means no resampling is performed.
    pub max_image_dimension: Option<u32>,
    pub console_ring_capacity: usize,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        let base = std::env::temp_dir().join("chorus-browser");
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            action_timeout: Duration::from_secs(15),
            download_dir: base.join("downloads"),
            screenshot_dir: base.join("screenshots"),
            console_log_dir: base.join("console-logs"),
            max_image_dimension: None,
            console_ring_capacity: 100,
        }
    }
}

impl BrowserConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        let idle_minutes: u64 = env_or("CHORUS_BROWSER_IDLE_MINUTES", 30);
        cfg.idle_timeout = if idle_minutes == 0 {
            Duration::from_secs(30 * 60)
        } else {
            Duration::from_secs(idle_minutes * 60)
        };
        if let Some(dim) = std::env::var("CHORUS_BROWSER_MAX_IMAGE_DIM")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            cfg.max_image_dimension = Some(dim);
        }
        cfg
    }
}

/// Coordinator eviction sweep tuning (§4.F).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvictionConfig {
    pub sweep_interval: Duration,
    pub idle_threshold: Duration,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5 * 60),
            idle_threshold: Duration::from_secs(30 * 60),
        }
    }
}
