// Конфигурация приложения
// Логирование можно отключить только в режиме разработки

use crate::error::{CallError, Result};
use crate::peer::types::ServerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене логирование отключено

// Дополнительные настройки для режима разработки
#[cfg(debug_assertions)]
pub mod dev {
    // Для полного отключения логирования в режиме разработки
    // измените эту константу на false
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const ENABLE_LOGGING: bool = false;
}

/// Настройки подбора собеседника и согласования
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CallConfig {
    /// Сколько раз пробуем занять чужую запись, прежде чем создать свою
    pub max_claim_attempts: u32,
    /// Окно на самовосстановление после disconnected/failed
    pub recovery_window_ms: u64,
    /// Как часто ожидающий offerer перепроверяет открытые записи
    pub rematch_interval_ms: u64,
    /// HTTP endpoint выдачи TURN/STUN серверов
    pub credentials_url: Option<String>,
    pub credentials_timeout_ms: u64,
    pub ice_candidate_pool_size: u8,
    /// Серверы на случай, если endpoint недоступен
    pub fallback_servers: Vec<ServerConfig>,
    /// Возраст, после которого запись считается мусором
    pub stale_call_age_secs: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            max_claim_attempts: 3,
            recovery_window_ms: 10_000,
            rematch_interval_ms: 2_000,
            credentials_url: None,
            credentials_timeout_ms: 5_000,
            ice_candidate_pool_size: 10,
            fallback_servers: vec![
                ServerConfig {
                    id: "default-stun-1".into(),
                    r#type: "stun".into(),
                    url: "stun:stun1.l.google.com:19302".into(),
                    username: None,
                    credential: None,
                },
                ServerConfig {
                    id: "default-stun-2".into(),
                    r#type: "stun".into(),
                    url: "stun:stun2.l.google.com:19302".into(),
                    username: None,
                    credential: None,
                },
            ],
            stale_call_age_secs: 24 * 60 * 60,
        }
    }
}

impl CallConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: CallConfig =
            serde_json::from_str(json).map_err(|e| CallError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_claim_attempts == 0 {
            return Err(CallError::InvalidConfig(
                "max_claim_attempts must be at least 1".into(),
            ));
        }
        if self.recovery_window_ms == 0 || self.rematch_interval_ms == 0 {
            return Err(CallError::InvalidConfig(
                "recovery_window_ms and rematch_interval_ms must be positive".into(),
            ));
        }

        for server in &self.fallback_servers {
            if server.url.is_empty() {
                return Err(CallError::InvalidConfig(format!(
                    "server {} has an empty url",
                    server.id
                )));
            }

            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(CallError::InvalidConfig(format!(
                    "TURN server {} requires username and credential",
                    server.id
                )));
            }
        }
        Ok(())
    }

    pub fn recovery_window(&self) -> Duration {
        Duration::from_millis(self.recovery_window_ms)
    }

    pub fn rematch_interval(&self) -> Duration {
        Duration::from_millis(self.rematch_interval_ms)
    }

    pub fn credentials_timeout(&self) -> Duration {
        Duration::from_millis(self.credentials_timeout_ms)
    }

    pub fn stale_call_age(&self) -> Duration {
        Duration::from_secs(self.stale_call_age_secs)
    }
}
