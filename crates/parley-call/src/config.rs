use std::env;
use std::time::Duration;

use parley_store::{HttpFallback, StoreResult};
use url::Url;

const DEFAULT_PRIMARY_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_SIGNAL_POLL_MS: u64 = 2_000;
const DEFAULT_ROSTER_POLL_MS: u64 = 5_000;
const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Call core configuration
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Base URL of the store's REST endpoint, used as the fallback transport
    pub store_url: Option<Url>,
    /// Token appended as `auth=` to fallback requests
    pub store_auth: Option<String>,
    /// Budget for one primary-store operation before falling back
    pub primary_timeout: Duration,
    /// Interval of the inbox polling loop that backs up push delivery
    pub signal_poll_interval: Duration,
    /// Interval of the roster re-read that backs up push delivery
    pub roster_poll_interval: Duration,
    /// Separator between user id and random suffix in session keys
    pub key_separator: String,
    /// Top-level store node under which call rooms live
    pub root: String,
    /// Delete the roster entry when the process receives ctrl-c
    pub install_exit_hook: bool,
    pub media: MediaConfig,
}

#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub ice_servers: Vec<String>,
    /// `None` means no capture device is available
    pub audio_device: Option<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            audio_device: Some("default".to_string()),
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            store_url: None,
            store_auth: None,
            primary_timeout: Duration::from_millis(DEFAULT_PRIMARY_TIMEOUT_MS),
            signal_poll_interval: Duration::from_millis(DEFAULT_SIGNAL_POLL_MS),
            roster_poll_interval: Duration::from_millis(DEFAULT_ROSTER_POLL_MS),
            key_separator: "_".to_string(),
            root: "calls".to_string(),
            install_exit_hook: true,
            media: MediaConfig::default(),
        }
    }
}

impl CallConfig {
    /// Load configuration from `PARLEY_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let millis = |name: &str, fallback: Duration| {
            var(name)
                .and_then(|value| value.trim().parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };

        let store_url = var("PARLEY_STORE_URL").and_then(|raw| match Url::parse(raw.trim()) {
            Ok(url) => Some(url),
            Err(err) => {
                tracing::warn!(target = "parley::config", url = %raw, error = %err, "ignoring invalid store url");
                None
            }
        });

        let ice_servers = if var("PARLEY_LOCALHOST_ONLY").is_some() {
            Vec::new()
        } else {
            var("PARLEY_ICE_SERVERS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|url| !url.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or(defaults.media.ice_servers)
        };

        let audio_device = match var("PARLEY_AUDIO_DEVICE") {
            Some(device) if device.eq_ignore_ascii_case("none") => None,
            Some(device) => Some(device),
            None => defaults.media.audio_device,
        };

        Self {
            store_url,
            store_auth: var("PARLEY_STORE_AUTH"),
            primary_timeout: millis("PARLEY_PRIMARY_TIMEOUT_MS", defaults.primary_timeout),
            signal_poll_interval: millis("PARLEY_SIGNAL_POLL_MS", defaults.signal_poll_interval),
            roster_poll_interval: millis("PARLEY_ROSTER_POLL_MS", defaults.roster_poll_interval),
            key_separator: var("PARLEY_KEY_SEPARATOR").unwrap_or(defaults.key_separator),
            root: var("PARLEY_STORE_ROOT").unwrap_or(defaults.root),
            install_exit_hook: var("PARLEY_EXIT_HOOK")
                .map(|value| !matches!(value.trim(), "0" | "false" | "off"))
                .unwrap_or(defaults.install_exit_hook),
            media: MediaConfig {
                ice_servers,
                audio_device,
            },
        }
    }

    /// Builds the REST fallback transport when a store URL is configured.
    pub fn http_fallback(&self) -> StoreResult<Option<HttpFallback>> {
        let Some(url) = &self.store_url else {
            return Ok(None);
        };
        let mut fallback = HttpFallback::with_timeout(url.clone(), self.primary_timeout)?;
        if let Some(token) = &self.store_auth {
            fallback = fallback.with_auth(token.clone());
        }
        Ok(Some(fallback))
    }
}
