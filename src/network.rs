use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub const DEFAULT_PROBE_URLS: [&str; 2] = [
    "https://www.cloudflare.com/cdn-cgi/trace",
    "https://www.google.com/generate_204",
];

// Проверка online статуса через легковесный HTTP запрос
pub async fn check_online_status(probe_urls: &[String], timeout: Duration) -> bool {
    let client = match Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(_) => return false,
    };

    for url in probe_urls {
        match client.get(url).send().await {
            Ok(response) if response.status().is_success() => return true,
            Ok(response) => debug!("[NET] Probe {} returned {}", url, response.status()),
            Err(e) => debug!("[NET] Probe {} failed: {}", url, e),
        }
    }
    false
}

/// Platform connectivity signal: current online flag plus change notifications.
#[derive(Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Platform `online` / `offline` event hook. Only real transitions notify subscribers.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(
                "[NET] Connectivity changed: {}",
                if online { "online" } else { "offline" }
            );
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Poll the HTTP probes and publish transitions. Abort the handle to stop.
    pub fn spawn_probe(&self, probe_urls: Vec<String>, interval: Duration) -> JoinHandle<()> {
        let connectivity = self.clone();
        tokio::spawn(async move {
            let timeout = Duration::from_secs(2).min(interval);
            // 0-1s stagger before the first probe
            let jitter_ms = rand::random::<u32>() as u64 % 1000;
            tokio::time::sleep(Duration::from_millis(jitter_ms)).await;

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let online = check_online_status(&probe_urls, timeout).await;
                connectivity.set_online(online);
            }
        })
    }
}
