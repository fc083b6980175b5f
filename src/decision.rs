//! Decision Recording
//!
//! Provides the decision/action records the monitor hands to its owner when
//! updating a stop or closing a position, plus a pluggable
//! [`DecisionRecorder`] trait for persisting them. Persistent backends live
//! with the host application; this crate ships a tracing-backed recorder for
//! observability.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Error type for decision recording operations.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// A stop-loss adjustment decision passed to the owner's execution routine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossDecision {
    /// Trading symbol (e.g., "BTCUSDT")
    pub symbol: String,
    /// Decision kind; always `"update_stop_loss"` for this engine
    pub action: String,
    /// The new stop price to place
    pub new_stop_loss: f64,
    /// Human-readable explanation of how the stop was derived
    pub reasoning: String,
}

impl StopLossDecision {
    /// Build an `update_stop_loss` decision.
    pub fn update_stop_loss(
        symbol: impl Into<String>,
        new_stop_loss: f64,
        reasoning: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            action: "update_stop_loss".to_string(),
            new_stop_loss,
            reasoning: reasoning.into(),
        }
    }
}

/// A single executed (or attempted) action inside a decision record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionAction {
    /// Action kind (e.g., "update_stop_loss", "emergency_close_long")
    pub action: String,
    /// Trading symbol
    pub symbol: String,
    /// Quantity involved; 0 when the executor resolves it itself
    pub quantity: f64,
    /// Leverage; 0 when not applicable
    pub leverage: u32,
    /// Mark price at the time of the action
    pub price: f64,
    /// Exchange order id, when one was returned
    pub order_id: Option<i64>,
    /// Timestamp of the action
    pub timestamp: DateTime<Utc>,
    /// Whether the action completed successfully
    pub success: bool,
}

/// A decision record with its execution log and actions, for later review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Unique record identifier
    pub record_id: String,
    /// Free-form execution log lines
    pub execution_log: Vec<String>,
    /// Whether the overall decision succeeded
    pub success: bool,
    /// The actions taken as part of this decision
    pub decisions: Vec<DecisionAction>,
}

impl DecisionRecord {
    /// Create a new record with a generated id.
    pub fn new(execution_log: Vec<String>, success: bool, decisions: Vec<DecisionAction>) -> Self {
        Self {
            record_id: uuid::Uuid::new_v4().to_string(),
            execution_log,
            success,
            decisions,
        }
    }
}

/// Trait for persisting decision records to various backends.
#[async_trait]
pub trait DecisionRecorder: Send + Sync {
    /// Record a decision. Implementations should be non-blocking.
    async fn log_decision(&self, record: &DecisionRecord) -> Result<(), RecordError>;
}

/// Recorder that emits structured tracing logs.
///
/// In AWS, these logs are automatically captured by CloudWatch when using
/// the tracing-subscriber with JSON formatting.
pub struct TracingDecisionRecorder;

impl TracingDecisionRecorder {
    /// Create a new tracing recorder
    pub fn new() -> Self {
        Self
    }
}

impl Default for TracingDecisionRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DecisionRecorder for TracingDecisionRecorder {
    async fn log_decision(&self, record: &DecisionRecord) -> Result<(), RecordError> {
        for action in &record.decisions {
            info!(
                target: "decisions",
                record_id = %record.record_id,
                action = %action.action,
                symbol = %action.symbol,
                price = action.price,
                order_id = ?action.order_id,
                timestamp = %action.timestamp.to_rfc3339(),
                success = action.success,
                "Decision recorded"
            );
        }
        Ok(())
    }
}
