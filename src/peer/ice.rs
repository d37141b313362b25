use crate::config::CallConfig;
use crate::peer::types::{IceCandidate, IceConfig, IceServer, IceUrls, TransportPolicy};
use crate::store::CandidateEntry;
use crate::utils::to_ice_servers;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Выдаёт набор STUN/TURN серверов на одну попытку соединения
///
/// Не падает: любые ошибки провайдера заменяются статическим списком.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn ice_config(&self) -> IceConfig;
}

/// Публичные STUN сервера на случай, если провайдер недоступен
pub fn fallback_ice_config(config: &CallConfig) -> IceConfig {
    IceConfig {
        servers: to_ice_servers(&config.fallback_servers),
        pool_size: config.ice_candidate_pool_size,
        policy: TransportPolicy::All,
    }
}

/// Статический список серверов
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    config: IceConfig,
}

impl StaticCredentials {
    pub fn new(config: IceConfig) -> Self {
        Self { config }
    }

    pub fn from_config(config: &CallConfig) -> Self {
        Self::new(fallback_ice_config(config))
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn ice_config(&self) -> IceConfig {
        self.config.clone()
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CredentialsResponse {
    ice_servers: Vec<RawIceServer>,
}

#[derive(Deserialize, Debug)]
struct RawIceServer {
    urls: IceUrls,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    credential: Option<String>,
}

/// Получает сервера с HTTP endpoint: `{"iceServers": [{"urls": ..., ...}]}`
pub struct HttpCredentialProvider {
    url: String,
    client: reqwest::Client,
    timeout: Duration,
    fallback: IceConfig,
}

impl HttpCredentialProvider {
    pub fn new(url: impl Into<String>, config: &CallConfig) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            timeout: config.credentials_timeout(),
            fallback: fallback_ice_config(config),
        }
    }

    async fn fetch(&self) -> Result<Vec<IceServer>, String> {
        let response = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("credentials endpoint returned {}", response.status()));
        }

        let body: CredentialsResponse = response.json().await.map_err(|e| e.to_string())?;
        let servers: Vec<IceServer> = body
            .ice_servers
            .into_iter()
            .map(|raw| IceServer {
                urls: raw.urls.into_vec(),
                username: raw.username,
                credential: raw.credential,
            })
            .filter(|s| !s.urls.is_empty())
            .collect();

        if servers.is_empty() {
            return Err("credentials endpoint returned no servers".into());
        }
        Ok(servers)
    }
}

#[async_trait]
impl CredentialProvider for HttpCredentialProvider {
    async fn ice_config(&self) -> IceConfig {
        debug!("Requesting ICE servers from {}", self.url);
        match self.fetch().await {
            Ok(servers) => {
                info!(
                    "ICE servers obtained: {:?}",
                    servers.iter().flat_map(|s| s.urls.iter()).collect::<Vec<_>>()
                );
                IceConfig {
                    servers,
                    pool_size: self.fallback.pool_size,
                    policy: TransportPolicy::All,
                }
            }
            Err(e) => {
                warn!("Error getting ICE servers: {e}; falling back to basic STUN servers");
                self.fallback.clone()
            }
        }
    }
}

/// Очередь кандидатов собеседника
///
/// Кандидаты, пришедшие до remote description, копятся в порядке
/// добавления и отдаются разом после её установки. Записи с `seq`, который
/// уже был применён, отбрасываются, поэтому повторная подписка ничего не
/// применяет дважды.
#[derive(Debug, Default)]
pub struct RemoteCandidateQueue {
    pending: Vec<CandidateEntry>,
    last_seq: Option<u64>,
    remote_ready: bool,
}

impl RemoteCandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Кандидаты, которые можно применить прямо сейчас
    pub fn push(&mut self, entry: CandidateEntry) -> Vec<IceCandidate> {
        if self.is_seen(entry.seq) {
            debug!("Skipping already seen remote candidate seq={}", entry.seq);
            return Vec::new();
        }

        if self.remote_ready {
            self.last_seq = Some(entry.seq);
            vec![entry.candidate]
        } else {
            debug!(
                "Remote description not set yet, queuing candidate seq={}",
                entry.seq
            );
            self.pending.push(entry);
            Vec::new()
        }
    }

    /// Remote description установлена: отдаёт накопленное
    pub fn remote_ready(&mut self) -> Vec<IceCandidate> {
        self.remote_ready = true;
        let pending = std::mem::take(&mut self.pending);
        if let Some(last) = pending.last() {
            self.last_seq = Some(last.seq);
        }
        pending.into_iter().map(|e| e.candidate).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn is_seen(&self, seq: u64) -> bool {
        self.last_seq.is_some_and(|last| seq <= last)
            || self.pending.iter().any(|e| e.seq == seq)
    }
}
