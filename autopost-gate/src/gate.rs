use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::{BlockCode, DenyResponse, FlagError};
use crate::config::Config;
use crate::decision::DecisionEngine;
use crate::fallback::{FallbackError, FallbackStore};
use crate::flags::FlagRecord;
use crate::metrics_consts::{CACHE_INVALIDATIONS_COUNTER, GATE_DECISIONS_COUNTER};
use crate::resolver::FlagResolver;
use crate::store::Client;

/// Terminal state of one evaluation, before it's turned into a response or a query answer.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Verdict {
    Allowed,
    KillSwitchActive,
    AutopostDisabled,
    DestinationDisabled(String),
}

/// Why the gate refused a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    KillSwitchActive,
    AutopostDisabled,
    DestinationDisabled(String),
    /// The evaluation itself failed, as opposed to a flag answering "no".
    ServiceUnavailable { destination: Option<String> },
}

impl Denial {
    pub fn code(&self) -> BlockCode {
        match self {
            Denial::KillSwitchActive => BlockCode::KillSwitchActive,
            Denial::AutopostDisabled => BlockCode::AutopostDisabled,
            Denial::DestinationDisabled(_) => BlockCode::PlatformAutopostDisabled,
            Denial::ServiceUnavailable { destination: None } => BlockCode::KillSwitchError,
            Denial::ServiceUnavailable {
                destination: Some(_),
            } => BlockCode::PlatformCheckError,
        }
    }
}

impl From<&Denial> for DenyResponse {
    fn from(denial: &Denial) -> Self {
        let (error, message, platform) = match denial {
            Denial::KillSwitchActive => (
                "Autopost operations are currently disabled".to_string(),
                "All automatic posting has been temporarily disabled by the administrator"
                    .to_string(),
                None,
            ),
            Denial::AutopostDisabled => (
                "Autopost is currently disabled".to_string(),
                "Automatic posting is currently disabled".to_string(),
                None,
            ),
            Denial::DestinationDisabled(destination) => (
                format!("Autopost is disabled for {}", destination),
                format!("Automatic posting to {} is currently disabled", destination),
                Some(destination.clone()),
            ),
            Denial::ServiceUnavailable { destination: None } => (
                "Service temporarily unavailable".to_string(),
                "Unable to verify system status, blocking operation for safety".to_string(),
                None,
            ),
            Denial::ServiceUnavailable {
                destination: Some(destination),
            } => (
                "Service temporarily unavailable".to_string(),
                "Unable to verify platform status, blocking operation for safety".to_string(),
                Some(destination.clone()),
            ),
        };

        DenyResponse {
            success: false,
            error,
            code: denial.code(),
            message,
            platform,
        }
    }
}

impl IntoResponse for Denial {
    fn into_response(self) -> Response {
        DenyResponse::from(&self).into_response()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardOutcome {
    Allowed,
    Denied(Denial),
}

impl GuardOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GuardOutcome::Allowed)
    }
}

/// Answer to "would this post be blocked right now", for workers outside the HTTP path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCheck {
    pub blocked: bool,
    pub reason: Option<BlockCode>,
    pub message: String,
    #[serde(rename = "platform", skip_serializing_if = "Option::is_none", default)]
    pub destination: Option<String>,
}

impl BlockCheck {
    fn allowed(destination: Option<String>) -> Self {
        BlockCheck {
            blocked: false,
            reason: None,
            message: "Autopost is allowed".to_string(),
            destination,
        }
    }

    fn blocked(reason: BlockCode, message: String, destination: Option<String>) -> Self {
        BlockCheck {
            blocked: true,
            reason: Some(reason),
            message,
            destination,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", .0.message)]
pub struct GateBlocked(pub BlockCheck);

/// Shared handle on the gate, cheap to clone into handlers and middleware.
#[derive(Clone)]
pub struct GateContext {
    engine: DecisionEngine,
}

impl GateContext {
    pub fn new(config: &Config, store: Arc<dyn Client + Send + Sync>) -> Self {
        let resolver = Arc::new(FlagResolver::from_config(config, store));

        let fallback = match FallbackStore::new(
            config.fallback_path(),
            &config.fallback_encryption_secret,
            config.fallback_ttl(),
        ) {
            Ok(fallback) => Some(Arc::new(fallback)),
            Err(FallbackError::SecretMissing) => {
                tracing::warn!(
                    "FALLBACK_ENCRYPTION_SECRET is not set, kill switch decisions won't survive a flag store outage"
                );
                None
            }
            Err(e) => {
                tracing::warn!("kill switch fallback store disabled: {}", e);
                None
            }
        };

        GateContext::from_parts(resolver, fallback)
    }

    pub fn from_parts(resolver: Arc<FlagResolver>, fallback: Option<Arc<FallbackStore>>) -> Self {
        GateContext {
            engine: DecisionEngine::new(resolver, fallback),
        }
    }

    pub fn engine(&self) -> &DecisionEngine {
        &self.engine
    }

    async fn evaluate(&self, destination: Option<&str>) -> Result<Verdict, FlagError> {
        if self.engine.is_kill_switch_active().await? {
            return Ok(Verdict::KillSwitchActive);
        }
        if !self.engine.is_autopost_enabled().await? {
            return Ok(Verdict::AutopostDisabled);
        }
        if let Some(destination) = destination {
            if !self.engine.is_destination_enabled(destination).await? {
                return Ok(Verdict::DestinationDisabled(destination.to_string()));
            }
        }
        Ok(Verdict::Allowed)
    }

    /// Checks kill switch, global enable and destination, stopping at the first "no".
    /// Any failure to evaluate blocks.
    pub async fn guard(&self, destination: Option<&str>) -> GuardOutcome {
        let destination = normalize_destination(destination);

        let verdict = self.evaluate(destination.as_deref()).await;
        let outcome = match verdict {
            Ok(Verdict::Allowed) => GuardOutcome::Allowed,
            Ok(Verdict::KillSwitchActive) => GuardOutcome::Denied(Denial::KillSwitchActive),
            Ok(Verdict::AutopostDisabled) => GuardOutcome::Denied(Denial::AutopostDisabled),
            Ok(Verdict::DestinationDisabled(d)) => {
                GuardOutcome::Denied(Denial::DestinationDisabled(d))
            }
            Err(e) => {
                tracing::error!("autopost gate evaluation failed, blocking: {}", e);
                GuardOutcome::Denied(Denial::ServiceUnavailable { destination })
            }
        };

        let label = match &outcome {
            GuardOutcome::Allowed => "allowed",
            GuardOutcome::Denied(denial) => denial.code().as_str(),
        };
        metrics::counter!(GATE_DECISIONS_COUNTER, "entry" => "guard", "outcome" => label)
            .increment(1);

        outcome
    }

    pub async fn would_block(&self, destination: Option<&str>) -> BlockCheck {
        let destination = normalize_destination(destination);

        let verdict = self.evaluate(destination.as_deref()).await;
        let check = match verdict {
            Ok(Verdict::Allowed) => BlockCheck::allowed(destination),
            Ok(Verdict::KillSwitchActive) => BlockCheck::blocked(
                BlockCode::KillSwitchActive,
                "Global kill switch is active".to_string(),
                destination,
            ),
            Ok(Verdict::AutopostDisabled) => BlockCheck::blocked(
                BlockCode::AutopostDisabled,
                "Autopost is globally disabled".to_string(),
                destination,
            ),
            Ok(Verdict::DestinationDisabled(d)) => BlockCheck::blocked(
                BlockCode::PlatformAutopostDisabled,
                format!("Autopost is disabled for {}", d),
                Some(d),
            ),
            Err(e) => {
                tracing::error!("autopost status check failed, reporting blocked: {}", e);
                BlockCheck::blocked(
                    BlockCode::CheckFailed,
                    "Could not verify autopost status, blocking operation for safety".to_string(),
                    destination,
                )
            }
        };

        let label = match check.reason {
            None => "allowed",
            Some(code) => code.as_str(),
        };
        metrics::counter!(GATE_DECISIONS_COUNTER, "entry" => "would_block", "outcome" => label)
            .increment(1);

        check
    }

    /// `would_block` for job handlers that want to bail out with `?`.
    pub async fn ensure_allowed(&self, destination: Option<&str>) -> Result<(), GateBlocked> {
        let check = self.would_block(destination).await;
        if check.blocked {
            return Err(GateBlocked(check));
        }
        Ok(())
    }

    /// Forgets every cached flag so the next check sees the store's current state.
    pub fn invalidate(&self) {
        self.engine.resolver().invalidate();
        metrics::counter!(CACHE_INVALIDATIONS_COUNTER).increment(1);
        tracing::info!("flags cache invalidated");
    }

    pub async fn cache_snapshot(&self) -> Vec<FlagRecord> {
        self.engine.resolver().cache().records().await
    }
}

fn normalize_destination(destination: Option<&str>) -> Option<String> {
    destination
        .map(|d| d.trim().to_lowercase())
        .filter(|d| !d.is_empty())
}

/// Refuses the request unless automated posting is allowed globally.
pub async fn check_kill_switch(
    State(gate): State<GateContext>,
    request: Request,
    next: Next,
) -> Response {
    match gate.guard(None).await {
        GuardOutcome::Allowed => next.run(request).await,
        GuardOutcome::Denied(denial) => denial.into_response(),
    }
}

/// Refuses the request unless automated posting is allowed for the `:platform` in the path.
pub async fn check_platform_autopost(
    State(gate): State<GateContext>,
    Path(platform): Path<String>,
    request: Request,
    next: Next,
) -> Response {
    match gate.guard(Some(&platform)).await {
        GuardOutcome::Allowed => next.run(request).await,
        GuardOutcome::Denied(denial) => denial.into_response(),
    }
}
