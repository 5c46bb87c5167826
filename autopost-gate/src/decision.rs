use std::sync::Arc;

use crate::api::FlagError;
use crate::fallback::FallbackStore;
use crate::flags::FlagKey;
use crate::metrics_consts::CHECK_ERRORS_COUNTER;
use crate::resolver::{FlagResolver, ResolutionSource};

/// The three checks guarding automated posting.
///
/// Each one answers a plain boolean and absorbs store failures according to what it
/// protects. The kill switch fails closed: with no fresh answer from the store and no
/// usable fallback snapshot it reports itself active. The feature checks fail open.
/// `FlagError::MissingFlag` is a configuration problem and always reaches the caller.
#[derive(Clone)]
pub struct DecisionEngine {
    resolver: Arc<FlagResolver>,
    fallback: Option<Arc<FallbackStore>>,
}

impl DecisionEngine {
    pub fn new(resolver: Arc<FlagResolver>, fallback: Option<Arc<FallbackStore>>) -> Self {
        DecisionEngine { resolver, fallback }
    }

    pub fn resolver(&self) -> &Arc<FlagResolver> {
        &self.resolver
    }

    /// True means the kill switch is on and nothing may be posted.
    pub async fn is_kill_switch_active(&self) -> Result<bool, FlagError> {
        match self.resolver.resolve(&FlagKey::kill_switch()).await {
            Ok(resolution) => {
                let active = resolution.record.enabled;
                // only a record the store actually returned may replace the snapshot
                if resolution.source == ResolutionSource::Remote {
                    if let Some(fallback) = &self.fallback {
                        fallback.save(active).await;
                    }
                }
                Ok(active)
            }
            Err(e) if e.is_configuration_error() => Err(e),
            Err(e) => {
                metrics::counter!(CHECK_ERRORS_COUNTER, "check" => "kill_switch").increment(1);

                let snapshot = match &self.fallback {
                    Some(fallback) => fallback.load().await,
                    None => None,
                };
                match snapshot {
                    Some(active) => {
                        tracing::warn!(
                            active,
                            "flag store unavailable, using persisted kill switch decision: {}",
                            e
                        );
                        Ok(active)
                    }
                    None => {
                        tracing::error!(
                            "flag store unavailable and no usable kill switch snapshot, blocking: {}",
                            e
                        );
                        Ok(true)
                    }
                }
            }
        }
    }

    pub async fn is_autopost_enabled(&self) -> Result<bool, FlagError> {
        self.fail_open(&FlagKey::autopost_enable(), "autopost").await
    }

    pub async fn is_destination_enabled(&self, destination: &str) -> Result<bool, FlagError> {
        self.fail_open(&FlagKey::for_destination(destination), "destination")
            .await
    }

    async fn fail_open(&self, key: &FlagKey, check: &'static str) -> Result<bool, FlagError> {
        match self.resolver.get(key).await {
            Ok(record) => Ok(record.enabled),
            Err(e) if e.is_configuration_error() => Err(e),
            Err(e) => {
                metrics::counter!(CHECK_ERRORS_COUNTER, "check" => check).increment(1);
                tracing::warn!("could not resolve {}, treating it as enabled: {}", key, e);
                Ok(true)
            }
        }
    }
}
