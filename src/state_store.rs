// =============================================================================
// Strategy State Store — intraday state that must survive restarts
// =============================================================================
//
// Composite key (strategyId, stateType); values are opaque JSON payloads with
// typed helpers layered on top. A read past `expiresAt` deletes the row and
// returns nothing, so stale intraday state can never leak into a new session.
// Default expiry is the next 16:00 Eastern market close.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::EngineResult;
use crate::persistence::{StateType, StrategyStateRepository, StrategyStateRow};
use crate::rules::session::next_market_close;
use crate::types::{Direction, OpeningRange};

// ---------------------------------------------------------------------------
// Typed payloads
// ---------------------------------------------------------------------------

/// A persisted opening range, with the window that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredOpeningRange {
    pub symbol: String,
    pub start_minute: u32,
    pub end_minute: u32,
    pub range: OpeningRange,
}

/// The most recent entry taken by a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastEntryState {
    pub setup_id: String,
    pub direction: Direction,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownReason {
    Loss,
    Manual,
    DailyLimit,
    ConsecutiveFailures,
}

/// A trading pause for one strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CooldownState {
    pub reason: CooldownReason,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub previous_loss: Option<f64>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct StrategyStateStore {
    repo: Arc<dyn StrategyStateRepository>,
}

impl StrategyStateStore {
    pub fn new(repo: Arc<dyn StrategyStateRepository>) -> Self {
        Self { repo }
    }

    /// Upsert a state blob. `expires_at = None` defaults to the next market
    /// close.
    pub async fn upsert_state(
        &self,
        strategy_id: &str,
        state_type: StateType,
        payload: serde_json::Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> EngineResult<()> {
        let now = Utc::now();
        let expires_at = expires_at.or_else(|| Some(next_market_close(now)));
        debug!(strategy_id, state_type = %state_type, "strategy state upserted");
        self.repo
            .upsert(StrategyStateRow {
                strategy_id: strategy_id.to_string(),
                state_type,
                payload,
                calculated_at: now,
                expires_at,
            })
            .await
    }

    /// Read a state blob, honouring expiry: an expired row is deleted and
    /// reads as absent.
    pub async fn get_state(
        &self,
        strategy_id: &str,
        state_type: StateType,
    ) -> EngineResult<Option<serde_json::Value>> {
        let Some(row) = self.repo.get(strategy_id, state_type).await? else {
            return Ok(None);
        };
        if let Some(expires_at) = row.expires_at {
            if expires_at <= Utc::now() {
                debug!(strategy_id, state_type = %state_type, "expired state purged on read");
                self.repo.delete(strategy_id, state_type).await?;
                return Ok(None);
            }
        }
        Ok(Some(row.payload))
    }

    // -------------------------------------------------------------------------
    // Typed helpers
    // -------------------------------------------------------------------------

    pub async fn save_opening_range(
        &self,
        strategy_id: &str,
        stored: &StoredOpeningRange,
    ) -> EngineResult<()> {
        let payload = serde_json::to_value(stored)
            .map_err(|e| crate::errors::EngineError::Internal(e.to_string()))?;
        self.upsert_state(strategy_id, StateType::OpeningRange, payload, None)
            .await
    }

    pub async fn opening_range(&self, strategy_id: &str) -> EngineResult<Option<StoredOpeningRange>> {
        Ok(self
            .get_state(strategy_id, StateType::OpeningRange)
            .await?
            .and_then(|v| serde_json::from_value(v).ok()))
    }

    pub async fn save_session_stats(
        &self,
        strategy_id: &str,
        stats: serde_json::Value,
    ) -> EngineResult<()> {
        self.upsert_state(strategy_id, StateType::SessionStats, stats, None)
            .await
    }

    pub async fn save_last_entry(
        &self,
        strategy_id: &str,
        entry: &LastEntryState,
    ) -> EngineResult<()> {
        let payload = serde_json::to_value(entry)
            .map_err(|e| crate::errors::EngineError::Internal(e.to_string()))?;
        self.upsert_state(strategy_id, StateType::LastEntry, payload, None)
            .await
    }

    pub async fn last_entry(&self, strategy_id: &str) -> EngineResult<Option<LastEntryState>> {
        Ok(self
            .get_state(strategy_id, StateType::LastEntry)
            .await?
            .and_then(|v| serde_json::from_value(v).ok()))
    }

    /// Persist a cooldown; it expires when the cooldown window ends.
    pub async fn save_cooldown(
        &self,
        strategy_id: &str,
        cooldown: &CooldownState,
    ) -> EngineResult<()> {
        let payload = serde_json::to_value(cooldown)
            .map_err(|e| crate::errors::EngineError::Internal(e.to_string()))?;
        info!(
            strategy_id,
            reason = ?cooldown.reason,
            until = %cooldown.end_time,
            "cooldown saved"
        );
        self.upsert_state(
            strategy_id,
            StateType::Cooldown,
            payload,
            Some(cooldown.end_time),
        )
        .await
    }

    pub async fn cooldown(&self, strategy_id: &str) -> EngineResult<Option<CooldownState>> {
        Ok(self
            .get_state(strategy_id, StateType::Cooldown)
            .await?
            .and_then(|v| serde_json::from_value(v).ok()))
    }

    /// Whether a strategy is currently cooling down.
    pub async fn is_in_cooldown(&self, strategy_id: &str, now: DateTime<Utc>) -> EngineResult<bool> {
        Ok(self
            .cooldown(strategy_id)
            .await?
            .map_or(false, |c| c.start_time <= now && now < c.end_time))
    }

    // -------------------------------------------------------------------------
    // Bulk operations
    // -------------------------------------------------------------------------

    /// Fetch all non-expired state for the given strategies, grouped per
    /// strategy. Used at engine start.
    pub async fn restore_all(
        &self,
        strategy_ids: &[String],
    ) -> EngineResult<HashMap<String, HashMap<StateType, serde_json::Value>>> {
        let rows = self.repo.list_active_for(strategy_ids, Utc::now()).await?;
        let mut map: HashMap<String, HashMap<StateType, serde_json::Value>> = HashMap::new();
        for row in rows {
            map.entry(row.strategy_id.clone())
                .or_default()
                .insert(row.state_type, row.payload);
        }
        info!(strategies = map.len(), "strategy state restored");
        Ok(map)
    }

    /// Batch-delete expired rows.
    pub async fn cleanup_expired(&self) -> EngineResult<u64> {
        let deleted = self.repo.delete_expired(Utc::now()).await?;
        if deleted > 0 {
            info!(deleted, "expired strategy state cleaned up");
        }
        Ok(deleted)
    }
}

impl std::fmt::Debug for StrategyStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyStateStore").finish()
    }
}
