// =============================================================================
// Engine Configuration — environment-driven settings
// =============================================================================
//
// Required environment (missing values are an unrecoverable init failure):
//
//   BROKER_API_BASE_LIVE / BROKER_API_BASE_DEMO   REST base URLs
//   BROKER_MD_WS_LIVE    / BROKER_MD_WS_DEMO      market-data socket URLs
//   DATABASE_URL / DATABASE_KEY                   persistence pair
//
// The live/demo choice follows the account type.
// =============================================================================

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::types::AccountType;

/// Default monitoring tick cadence in seconds.
pub const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub account_type: AccountType,
    pub api_base_live: String,
    pub api_base_demo: String,
    pub md_ws_live: String,
    pub md_ws_demo: String,
    pub database_url: String,
    pub database_key: String,
    pub user_id: String,
    pub broker_account_id: String,
    /// Master switch: when false every setup is alerted instead of executed.
    pub execution_enabled: bool,
    pub alerts_enabled: bool,
    pub monitor_interval_secs: u64,
}

impl EngineConfig {
    /// Load from process environment (after dotenv).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load via an arbitrary lookup, so tests never mutate the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| -> Result<String> {
            match lookup(key) {
                Some(v) if !v.is_empty() => Ok(v),
                _ => bail!("missing required environment variable {key}"),
            }
        };

        let account_type = match lookup("ACCOUNT_TYPE").as_deref() {
            Some("live") => AccountType::Live,
            _ => AccountType::Demo,
        };

        Ok(Self {
            account_type,
            api_base_live: required("BROKER_API_BASE_LIVE")?,
            api_base_demo: required("BROKER_API_BASE_DEMO")?,
            md_ws_live: required("BROKER_MD_WS_LIVE")?,
            md_ws_demo: required("BROKER_MD_WS_DEMO")?,
            database_url: required("DATABASE_URL")?,
            database_key: required("DATABASE_KEY")?,
            user_id: lookup("ENGINE_USER_ID").unwrap_or_else(|| "default".to_string()),
            broker_account_id: lookup("BROKER_ACCOUNT_ID")
                .unwrap_or_else(|| "default".to_string()),
            execution_enabled: lookup("EXECUTION_ENABLED")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            alerts_enabled: lookup("ALERTS_ENABLED")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
            monitor_interval_secs: lookup("MONITOR_INTERVAL_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MONITOR_INTERVAL_SECS),
        })
    }

    /// REST base URL for the configured account type.
    pub fn api_base(&self) -> &str {
        match self.account_type {
            AccountType::Live => &self.api_base_live,
            AccountType::Demo => &self.api_base_demo,
        }
    }

    /// Market-data socket URL for the configured account type.
    pub fn md_ws_url(&self) -> &str {
        match self.account_type {
            AccountType::Live => &self.md_ws_live,
            AccountType::Demo => &self.md_ws_demo,
        }
    }
}
