use crate::peer::connection::ConnectionHandle;
use crate::peer::media::MediaStream;
use crate::peer::types::Role;
use crate::signaling::NegotiationState;
use crate::store::CallId;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Статус сессии, который видит UI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Searching,
    Waiting,
    /// Описания обменяны; ICE может ещё соединяться, а треки собеседника
    /// приходят позже через `remote_stream()`
    Connected,
    Disconnecting,
    Canceling,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Searching => "searching",
            SessionStatus::Waiting => "waiting",
            SessionStatus::Connected => "connected",
            SessionStatus::Disconnecting => "disconnecting",
            SessionStatus::Canceling => "canceling",
        };
        f.write_str(label)
    }
}

/// ========== SESSION STATE ==========
///
/// Всё, что живёт от начала поиска до teardown. Очищается целиком.
#[derive(Default)]
pub struct SessionState {
    /// Номер сессии; задачи прошлой сессии по нему понимают, что устарели
    pub epoch: u64,
    pub role: Option<Role>,
    pub call_id: Option<CallId>,
    pub connection: Option<Arc<ConnectionHandle>>,
    pub local_stream: Option<MediaStream>,
    pub cancel: Option<CancellationToken>,
    pub driver: Option<JoinHandle<()>>,
    /// Состояние текущей попытки согласования
    pub negotiation: Option<watch::Receiver<NegotiationState>>,
}

impl SessionState {
    /// Забирает все поля, оставляя пустое состояние
    pub fn take(&mut self) -> SessionState {
        std::mem::take(self)
    }

    pub fn is_empty(&self) -> bool {
        self.role.is_none()
            && self.call_id.is_none()
            && self.connection.is_none()
            && self.local_stream.is_none()
            && self.cancel.is_none()
            && self.driver.is_none()
            && self.negotiation.is_none()
    }

    /// Принадлежат ли поля сессии `epoch`, которую ещё не отменили
    pub fn is_live(&self, epoch: u64) -> bool {
        self.epoch == epoch && self.cancel.as_ref().is_some_and(|t| !t.is_cancelled())
    }
}

/// Снимок для UI: без ручек на ресурсы
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub status: SessionStatus,
    pub role: Option<Role>,
    pub call_id: Option<CallId>,
    pub negotiation: Option<NegotiationState>,
}
