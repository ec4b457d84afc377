// SPDX-License-Identifier: Apache-2.0

//! Client settings.
//!
//! Defaults are layered under `CANOPY_`-prefixed environment variables,
//! e.g. `CANOPY_ENDPOINT=zk1:2181` or `CANOPY_SESSION_TIMEOUT_MS=30000`.

use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Serialized},
};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Environment variable prefix for all settings.
const ENV_PREFIX: &str = "CANOPY_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// Coordination service endpoint, `host:port`.
    pub endpoint: String,

    /// Session timeout requested from the coordination service.
    pub session_timeout_ms: u64,

    /// Registry root node under which all service entries live.
    pub root: String,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:2181".to_string(),
            session_timeout_ms: 10_000,
            root: "/services".to_string(),
        }
    }
}

impl RegistrySettings {
    /// Load settings from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let settings: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()?;
        Ok(settings)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = RegistrySettings::default();
        assert_eq!(settings.root, "/services");
        assert_eq!(settings.session_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn env_overrides_default() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("CANOPY_ROOT", "/registry");
            let settings = RegistrySettings::from_env().unwrap();
            assert_eq!(settings.root, "/registry");
            assert_eq!(settings.endpoint, "127.0.0.1:2181");
            Ok(())
        });
    }
}
