use std::net::SocketAddr;
use std::sync::Arc;

use once_cell::sync::Lazy;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use autopost_gate::config::Config;
use autopost_gate::server::serve_with_store;
use autopost_gate::store::MockFlagStore;

pub static DEFAULT_CONFIG: Lazy<Config> = Lazy::new(Config::default_test_config);

pub struct ServerHandle {
    pub addr: SocketAddr,
    pub store: MockFlagStore,
    shutdown: Arc<Notify>,
    // keeps the fallback file alive for as long as the server
    _dir: tempfile::TempDir,
}

impl ServerHandle {
    pub async fn for_store(store: MockFlagStore) -> ServerHandle {
        ServerHandle::for_config(DEFAULT_CONFIG.clone(), store).await
    }

    pub async fn for_config(mut config: Config, store: MockFlagStore) -> ServerHandle {
        let dir = tempfile::tempdir().unwrap();
        config.fallback_path = dir
            .path()
            .join("kill-switch-state.json")
            .to_string_lossy()
            .into_owned();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let notify = Arc::new(Notify::new());
        let shutdown = notify.clone();

        let server_store = Arc::new(store.clone());
        tokio::spawn(async move {
            serve_with_store(config, server_store, listener, async move {
                notify.notified().await
            })
            .await
        });

        ServerHandle {
            addr,
            store,
            shutdown,
            _dir: dir,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{:?}{}", self.addr, path)
    }

    pub async fn post(&self, path: &str) -> reqwest::Response {
        reqwest::Client::new()
            .post(self.url(path))
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        reqwest::Client::new()
            .get(self.url(path))
            .send()
            .await
            .expect("failed to send request")
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.notify_one()
    }
}

pub fn healthy_store() -> MockFlagStore {
    autopost_gate::test_utils::healthy_store()
}
