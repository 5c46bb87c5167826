pub mod api;
pub mod config;
pub mod decision;
pub mod fallback;
pub mod flags;
pub mod flags_cache;
pub mod gate;
pub mod metrics_consts;
pub mod metrics_utils;
pub mod resolver;
pub mod router;
pub mod server;
pub mod store;
pub mod test_utils;
