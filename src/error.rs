//! Ошибки подбора собеседника и согласования соединения

use crate::peer::state::SessionStatus;
use crate::store::StoreError;

/// Result с CallError
pub type Result<T> = std::result::Result<T, CallError>;

/// Ошибки, которые видит вызывающий код контроллера сессии
///
/// После любой из них `search()` можно вызвать заново.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// Нет доступа к камере/микрофону (запрет, нет устройства)
    #[error("Media access failed: {0}")]
    MediaAccess(String),

    /// Ошибка хранилища во время поиска собеседника
    #[error("Partner search failed: {0}")]
    PartnerSearch(String),

    /// Не удалось применить SDP или кандидат
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Пропала связь с собеседником
    #[error("Connectivity lost: {0}")]
    ConnectivityLost(String),

    /// Шаг очистки не удался (только логируется)
    #[error("Cleanup failed: {0}")]
    Cleanup(String),

    /// Операция прервана отменой или teardown
    #[error("Operation cancelled")]
    Cancelled,

    /// Операция недопустима в текущем статусе
    #[error("Cannot {operation} while {status}")]
    InvalidState {
        operation: &'static str,
        status: SessionStatus,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid identity: {0}")]
    Identity(String),
}

impl CallError {
    pub(crate) fn partner_search(err: StoreError) -> Self {
        CallError::PartnerSearch(err.to_string())
    }

    pub(crate) fn negotiation(err: impl std::fmt::Display) -> Self {
        CallError::Negotiation(err.to_string())
    }

    /// Есть ли смысл повторить `search()`
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CallError::MediaAccess(_)
                | CallError::PartnerSearch(_)
                | CallError::Negotiation(_)
                | CallError::ConnectivityLost(_)
                | CallError::Cancelled
        )
    }

    /// Нужно ли действие пользователя (дать разрешение, подключить камеру)
    pub fn is_user_actionable(&self) -> bool {
        matches!(self, CallError::MediaAccess(_))
    }
}
