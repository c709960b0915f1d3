// Call configuration: ICE servers, negotiation timings, log defaults.

use crate::error::{CallError, Result};
use crate::utils::add_ice_url_scheme;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(debug_assertions)]
pub const DEFAULT_LOG_FILTER: &str = "call_session=debug,webrtc=warn"; // dev builds are chatty

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_FILTER: &str = "call_session=info,webrtc=error";

/// Delay before the caller sends its offer. There is no "callee ready"
/// handshake, so the callee gets this long to set up its side.
pub const DEFAULT_OFFER_GRACE_MS: u64 = 1_500;

/// How long a disconnected peer may take to come back before the call ends.
pub const DEFAULT_DISCONNECT_GRACE_MS: u64 = 10_000;

pub const DEFAULT_ICE_CANDIDATE_POOL_SIZE: u8 = 20;

/// Number of `CALL_TURN_URL_n` slots read from the environment.
const ENV_TURN_SLOTS: usize = 3;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IceServerKind {
    Stun,
    Turn,
}

/// ICE server entry
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub id: String,
    pub r#type: IceServerKind,
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            r#type: IceServerKind::Stun,
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        id: impl Into<String>,
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            r#type: IceServerKind::Turn,
            url: url.into(),
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    /// Url with the `stun:`/`turn:` scheme filled in.
    pub fn normalized_url(&self) -> String {
        add_ice_url_scheme(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(CallError::Config(format!(
                "ICE server {} has an empty url",
                self.id
            )));
        }
        if self.r#type == IceServerKind::Turn
            && (self.username.is_none() || self.credential.is_none())
        {
            return Err(CallError::Config(format!(
                "TURN server {} requires username and credential",
                self.id
            )));
        }
        Ok(())
    }
}

/// Public STUN servers used when nothing else is configured.
pub static DEFAULT_STUN_SERVERS: Lazy<Vec<IceServerConfig>> = Lazy::new(|| {
    vec![
        IceServerConfig::stun("google-stun-1", "stun:stun1.l.google.com:19302"),
        IceServerConfig::stun("google-stun-2", "stun:stun2.l.google.com:19302"),
        IceServerConfig::stun("google-stun-3", "stun:stun3.l.google.com:19302"),
        IceServerConfig::stun("google-stun-4", "stun:stun4.l.google.com:19302"),
        IceServerConfig::stun("google-stun", "stun:stun.l.google.com:19302"),
        IceServerConfig::stun("twilio-stun", "stun:global.stun.twilio.com:3478"),
    ]
});

/// OpenRelay public TURN servers. Free, but often blocked.
pub static PUBLIC_TURN_FALLBACK: Lazy<Vec<IceServerConfig>> = Lazy::new(|| {
    [
        "turn:openrelay.metered.ca:80",
        "turn:openrelay.metered.ca:443",
        "turn:openrelay.metered.ca:443?transport=tcp",
    ]
    .iter()
    .enumerate()
    .map(|(i, url)| {
        IceServerConfig::turn(
            format!("openrelay-{}", i + 1),
            *url,
            "openrelayproject",
            "openrelayproject",
        )
    })
    .collect()
});

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CallConfig {
    /// Explicitly configured servers (STUN defaults and custom TURN).
    pub ice_servers: Vec<IceServerConfig>,
    /// Append the OpenRelay TURN servers after `ice_servers`.
    pub public_turn_fallback: bool,
    pub ice_candidate_pool_size: u8,
    pub offer_grace_delay_ms: u64,
    pub disconnect_grace_ms: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS.clone(),
            public_turn_fallback: true,
            ice_candidate_pool_size: DEFAULT_ICE_CANDIDATE_POOL_SIZE,
            offer_grace_delay_ms: DEFAULT_OFFER_GRACE_MS,
            disconnect_grace_ms: DEFAULT_DISCONNECT_GRACE_MS,
        }
    }
}

impl CallConfig {
    /// Defaults overlaid with `CALL_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`CallConfig::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        for slot in 1..=ENV_TURN_SLOTS {
            let url = lookup(&format!("CALL_TURN_URL_{slot}"));
            let username = lookup(&format!("CALL_TURN_USERNAME_{slot}"));
            // a url without a username is ignored, as the web client does
            if let (Some(url), Some(username)) = (url, username) {
                let credential = lookup(&format!("CALL_TURN_CREDENTIAL_{slot}")).unwrap_or_default();
                tracing::info!(slot, "custom TURN server configured");
                config.ice_servers.push(IceServerConfig::turn(
                    format!("custom-turn-{slot}"),
                    url,
                    username,
                    credential,
                ));
            }
        }

        if let Some(ms) = lookup("CALL_OFFER_GRACE_MS") {
            config.offer_grace_delay_ms = parse_env("CALL_OFFER_GRACE_MS", &ms)?;
        }
        if let Some(ms) = lookup("CALL_DISCONNECT_GRACE_MS") {
            config.disconnect_grace_ms = parse_env("CALL_DISCONNECT_GRACE_MS", &ms)?;
        }
        if let Some(flag) = lookup("CALL_PUBLIC_TURN_FALLBACK") {
            config.public_turn_fallback = parse_env("CALL_PUBLIC_TURN_FALLBACK", &flag)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for server in &self.ice_servers {
            server.validate()?;
        }
        Ok(())
    }

    /// Every server handed to the peer connection, fallbacks last.
    pub fn effective_ice_servers(&self) -> Vec<IceServerConfig> {
        let mut servers = self.ice_servers.clone();
        if self.public_turn_fallback {
            servers.extend(PUBLIC_TURN_FALLBACK.iter().cloned());
        }
        servers
    }

    pub fn offer_grace_delay(&self) -> Duration {
        Duration::from_millis(self.offer_grace_delay_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| CallError::Config(format!("{key} has an invalid value: {raw}")))
}
