use std::path::Path;
use std::sync::Arc;

use rand::{distributions::Alphanumeric, Rng};

use crate::config::Config;
use crate::gate::GateContext;
use crate::store::MockFlagStore;

pub fn random_string(prefix: &str, length: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect();
    format!("{}{}", prefix, suffix)
}

/// Test config whose fallback file lives under `dir`, with its own random secret.
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default_test_config();
    config.fallback_path = dir
        .join("kill-switch-state.json")
        .to_string_lossy()
        .into_owned();
    config.fallback_encryption_secret =
        crate::config::EncryptionSecret::new(random_string("secret_", 16));
    config
}

/// Every flag the test config knows about, all in the "posting allowed" position.
pub fn healthy_store() -> MockFlagStore {
    MockFlagStore::with_flags(&[
        ("KILL_SWITCH_AUTOPOST", false),
        ("ENABLE_AUTOPOST", true),
        ("AUTOPOST_TWITTER", true),
        ("AUTOPOST_YOUTUBE", true),
    ])
}

pub fn setup_gate(store: &MockFlagStore, config: &Config) -> GateContext {
    GateContext::new(config, Arc::new(store.clone()))
}
