//! Контроллер звонка
//!
//! Единственная точка входа и выхода: `search()`, `cancel_search()`,
//! `end_call()`. Всё, что создаётся по дороге, сразу кладётся в
//! [`SessionState`], поэтому teardown может прервать поиск на любом шаге и
//! освободить ровно то, что уже успели создать.

use crate::config::CallConfig;
use crate::error::{CallError, Result};
use crate::matchmaker::{expire_stale_calls, Assignment, Identity, Matchmaker};
use crate::peer::connection::{ConnectionHandle, PeerFactory};
use crate::peer::ice::{CredentialProvider, HttpCredentialProvider, StaticCredentials};
use crate::peer::media::{MediaSource, MediaStream};
use crate::peer::state::{SessionState, SessionStatus, SessionView};
use crate::peer::types::Role;
use crate::signaling::{Exit, Negotiator, Progress};
use crate::store::{CallRecord, RendezvousStore, StoreError};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Внешние зависимости сессии
pub struct Collaborators {
    pub store: Arc<dyn RendezvousStore>,
    pub media: Arc<dyn MediaSource>,
    pub peers: Arc<dyn PeerFactory>,
    /// `None` - по `credentials_url` из конфига или статический список
    pub credentials: Option<Arc<dyn CredentialProvider>>,
}

/// Что делать с записью звонка при teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposal {
    Delete,
    /// Только если запись создали мы
    DeleteIfOwned,
}

/// Кто разбирает сессию `epoch`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Caller(u64),
    /// Сам driver: свою задачу не ждём
    Driver(u64),
}

impl Origin {
    fn epoch(self) -> u64 {
        match self {
            Origin::Caller(epoch) | Origin::Driver(epoch) => epoch,
        }
    }
}

struct SessionInner {
    identity: Identity,
    store: Arc<dyn RendezvousStore>,
    media: Arc<dyn MediaSource>,
    peers: Arc<dyn PeerFactory>,
    credentials: Arc<dyn CredentialProvider>,
    matchmaker: Matchmaker,
    config: CallConfig,

    status_tx: watch::Sender<SessionStatus>,
    local_tx: watch::Sender<Option<MediaStream>>,
    remote_tx: Arc<watch::Sender<Option<MediaStream>>>,

    state: Mutex<SessionState>,
    search_lock: tokio::sync::Mutex<()>,
    teardown_gate: tokio::sync::Mutex<()>,
    epochs: AtomicU64,
}

/// Один участник: ищет собеседника, держит звонок, всё за собой убирает
#[derive(Clone)]
pub struct CallSession {
    inner: Arc<SessionInner>,
}

impl CallSession {
    pub fn new(identity: Identity, deps: Collaborators, config: CallConfig) -> Result<Self> {
        config.validate()?;

        let credentials = match (deps.credentials, &config.credentials_url) {
            (Some(provider), _) => provider,
            (None, Some(url)) => {
                let provider: Arc<dyn CredentialProvider> =
                    Arc::new(HttpCredentialProvider::new(url.clone(), &config));
                provider
            }
            (None, None) => Arc::new(StaticCredentials::from_config(&config)),
        };

        let (status_tx, _) = watch::channel(SessionStatus::Disconnected);
        let (local_tx, _) = watch::channel(None);
        let (remote_tx, _) = watch::channel(None);

        Ok(Self {
            inner: Arc::new(SessionInner {
                identity,
                matchmaker: Matchmaker::new(deps.store.clone(), &config),
                store: deps.store,
                media: deps.media,
                peers: deps.peers,
                credentials,
                config,
                status_tx,
                local_tx,
                remote_tx: Arc::new(remote_tx),
                state: Mutex::new(SessionState::default()),
                search_lock: tokio::sync::Mutex::new(()),
                teardown_gate: tokio::sync::Mutex::new(()),
                epochs: AtomicU64::new(0),
            }),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn status(&self) -> SessionStatus {
        *self.inner.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Локальный поток, пока сессия жива
    pub fn local_stream(&self) -> watch::Receiver<Option<MediaStream>> {
        self.inner.local_tx.subscribe()
    }

    /// Общий поток собеседника; меняется с каждым новым треком
    pub fn remote_stream(&self) -> watch::Receiver<Option<MediaStream>> {
        self.inner.remote_tx.subscribe()
    }

    pub fn view(&self) -> SessionView {
        let state = self.inner.state.lock();
        SessionView {
            status: self.status(),
            role: state.role,
            call_id: state.call_id.clone(),
            negotiation: state.negotiation.as_ref().map(|rx| *rx.borrow()),
        }
    }

    /// Находит собеседника или встаёт в ожидание
    ///
    /// Повторный вызов во время поиска или звонка ничего не делает. При
    /// ошибке любого шага сессия полностью разобрана и поиск можно начать
    /// заново.
    pub async fn search(&self) -> Result<()> {
        let Ok(_guard) = self.inner.search_lock.try_lock() else {
            debug!("Search already in progress");
            return Ok(());
        };

        let status = self.status();
        match status {
            SessionStatus::Disconnected => {}
            SessionStatus::Searching | SessionStatus::Waiting | SessionStatus::Connected => {
                debug!("Search ignored while {status}");
                return Ok(());
            }
            SessionStatus::Disconnecting | SessionStatus::Canceling => {
                return Err(CallError::InvalidState {
                    operation: "search",
                    status,
                });
            }
        }

        let epoch = self.inner.epochs.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        {
            let mut state = self.inner.state.lock();
            *state = SessionState {
                epoch,
                cancel: Some(token.clone()),
                ..Default::default()
            };
            self.inner.status_tx.send_replace(SessionStatus::Searching);
        }
        info!("Searching for a partner as {}", self.inner.identity);

        match self.inner.establish(epoch, &token).await {
            Ok(()) => Ok(()),
            Err(CallError::Cancelled) => {
                info!("Search cancelled");
                self.inner
                    .teardown(Disposal::DeleteIfOwned, Origin::Caller(epoch))
                    .await;
                Err(CallError::Cancelled)
            }
            Err(e) => {
                warn!("Search failed: {e}");
                self.inner
                    .teardown(Disposal::Delete, Origin::Caller(epoch))
                    .await;
                Err(e)
            }
        }
    }

    /// Прерывает поиск или ожидание
    ///
    /// Свою запись удаляет, чужую (если успели её занять) не трогает.
    pub async fn cancel_search(&self) -> Result<()> {
        let epoch = {
            let state = self.inner.state.lock();
            let status = self.status();
            match status {
                SessionStatus::Disconnected => return Ok(()),
                SessionStatus::Connected => {
                    return Err(CallError::InvalidState {
                        operation: "cancel search",
                        status,
                    })
                }
                _ => {}
            }
            if state.is_live(state.epoch) {
                self.inner.status_tx.send_replace(SessionStatus::Canceling);
                if let Some(token) = &state.cancel {
                    token.cancel();
                }
                Some(state.epoch)
            } else {
                None
            }
        };

        if let Some(epoch) = epoch {
            info!("Cancelling search");
            self.inner
                .teardown(Disposal::DeleteIfOwned, Origin::Caller(epoch))
                .await;
        }
        // search() мог ещё не размотаться
        drop(self.inner.search_lock.lock().await);
        Ok(())
    }

    /// Завершает установленный звонок
    pub async fn end_call(&self) -> Result<()> {
        let status = self.status();
        match status {
            SessionStatus::Connected => {}
            SessionStatus::Disconnected | SessionStatus::Disconnecting => return Ok(()),
            SessionStatus::Searching | SessionStatus::Waiting | SessionStatus::Canceling => {
                return Err(CallError::InvalidState {
                    operation: "end call",
                    status,
                })
            }
        }

        let epoch = self.inner.state.lock().epoch;
        info!("Ending call");
        self.inner
            .teardown(Disposal::Delete, Origin::Caller(epoch))
            .await;
        Ok(())
    }

    /// Снимает записи, брошенные дольше `stale_call_age`
    pub async fn expire_stale_calls(&self) -> Result<usize> {
        expire_stale_calls(self.inner.store.as_ref(), self.inner.config.stale_call_age()).await
    }
}

impl SessionInner {
    async fn establish(self: &Arc<Self>, epoch: u64, token: &CancellationToken) -> Result<()> {
        let local = interruptible(token, self.media.acquire())
            .await
            .map_err(|e| match e {
                CallError::MediaAccess(_) | CallError::Cancelled => e,
                other => CallError::MediaAccess(other.to_string()),
            })?;
        if !self.install(epoch, |state| state.local_stream = Some(local.clone())) {
            local.stop_all();
            return Err(CallError::Cancelled);
        }
        self.local_tx.send_replace(Some(local.clone()));
        debug!("Local media acquired: {:?}", local.track_ids());

        let negotiator = self.connect(epoch, token, &local, None).await?;
        self.spawn_driver(epoch, token.clone(), negotiator)
    }

    /// Соединение + роль + первый обмен описаниями
    async fn connect(
        &self,
        epoch: u64,
        token: &CancellationToken,
        local: &MediaStream,
        claimed: Option<CallRecord>,
    ) -> Result<Negotiator> {
        let ice = interruptible(token, async { Ok(self.credentials.ice_config().await) }).await?;

        let (connection, events) = interruptible(
            token,
            ConnectionHandle::open(self.peers.as_ref(), &ice, local, self.remote_tx.clone()),
        )
        .await?;
        if !self.install(epoch, |state| state.connection = Some(connection.clone())) {
            connection.close().await;
            return Err(CallError::Cancelled);
        }

        let assignment = match claimed {
            Some(record) => Assignment {
                role: Role::Answerer,
                record,
            },
            None => interruptible(token, self.matchmaker.find_or_create(&self.identity)).await?,
        };
        let installed = self.install(epoch, |state| {
            state.role = Some(assignment.role);
            state.call_id = Some(assignment.record.id.clone());
        });
        if !installed {
            self.dispose_record(assignment.call_id(), Disposal::DeleteIfOwned)
                .await;
            return Err(CallError::Cancelled);
        }

        let mut negotiator = Negotiator::new(
            assignment,
            self.identity.clone(),
            self.store.clone(),
            connection,
            events,
            self.matchmaker.clone(),
            &self.config,
        );
        if !self.install(epoch, |state| {
            state.negotiation = Some(negotiator.subscribe_state())
        }) {
            return Err(CallError::Cancelled);
        }
        interruptible(token, negotiator.start()).await?;
        Ok(negotiator)
    }

    fn spawn_driver(
        self: &Arc<Self>,
        epoch: u64,
        token: CancellationToken,
        negotiator: Negotiator,
    ) -> Result<()> {
        let status = status_for(negotiator.role());
        let mut state = self.state.lock();
        if !state.is_live(epoch) {
            return Err(CallError::Cancelled);
        }
        info!(
            "Negotiating call {} as {}",
            negotiator.call_id(),
            negotiator.role()
        );
        state.driver = Some(tokio::spawn(self.clone().drive(epoch, token, negotiator)));
        self.status_tx.send_replace(status);
        Ok(())
    }

    /// Ведёт сессию до терминального события и сам её разбирает
    async fn drive(self: Arc<Self>, epoch: u64, token: CancellationToken, mut negotiator: Negotiator) {
        loop {
            let exit = loop {
                match negotiator.next(&token).await {
                    Progress::PartnerAnswered => {
                        if self.set_status_if_live(epoch, SessionStatus::Connected) {
                            info!("Partner answered call {}", negotiator.call_id());
                        }
                    }
                    Progress::Finished(exit) => break exit,
                }
            };
            negotiator.unsubscribe();

            match exit {
                Exit::Cancelled => return,
                Exit::Rematch(claimed) => match self.rebuild(epoch, &token, claimed).await {
                    Ok(next) => {
                        negotiator = next;
                        continue;
                    }
                    Err(CallError::Cancelled) => return,
                    Err(e) => warn!("Failed to restart matchmaking: {e}"),
                },
                Exit::RemoteHangup => info!("Partner ended the call"),
                Exit::Ended(e) => warn!("Call ended: {e}"),
            }

            drop(negotiator);
            self.teardown(Disposal::Delete, Origin::Driver(epoch)).await;
            return;
        }
    }

    /// Новая попытка после сверки очереди: свежий peer connection,
    /// своя снятая запись удаляется
    async fn rebuild(
        &self,
        epoch: u64,
        token: &CancellationToken,
        claimed: Option<CallRecord>,
    ) -> Result<Negotiator> {
        let (old_connection, old_call, local) = {
            let mut state = self.state.lock();
            if !state.is_live(epoch) {
                return Err(CallError::Cancelled);
            }
            state.role = None;
            state.negotiation = None;
            self.status_tx.send_replace(SessionStatus::Searching);
            (
                state.connection.take(),
                state.call_id.take(),
                state.local_stream.clone(),
            )
        };
        let local =
            local.ok_or_else(|| CallError::Negotiation("local media is gone".to_string()))?;

        if let Some(connection) = old_connection {
            connection.close().await;
        }
        clear_stream(&self.remote_tx);
        if let Some(id) = old_call {
            self.delete_record(&id).await;
        }
        info!(
            "Restarting negotiation{}",
            if claimed.is_some() { " as answerer" } else { "" }
        );

        let negotiator = self.connect(epoch, token, &local, claimed).await?;
        if !self.set_status_if_live(epoch, status_for(negotiator.role())) {
            return Err(CallError::Cancelled);
        }
        Ok(negotiator)
    }

    /// Идемпотентный разбор сессии `origin.epoch()`
    ///
    /// Шаги не прерываются ошибками: каждая логируется, следующий шаг
    /// выполняется всё равно.
    async fn teardown(&self, disposal: Disposal, origin: Origin) {
        let _gate = self.teardown_gate.lock().await;
        let taken = {
            let mut state = self.state.lock();
            if state.epoch != origin.epoch() || state.is_empty() {
                debug!("Session {} already released", origin.epoch());
                return;
            }
            state.take()
        };

        self.status_tx.send_if_modified(|status| {
            if *status == SessionStatus::Canceling {
                return false;
            }
            *status = SessionStatus::Disconnecting;
            true
        });

        if let Some(token) = &taken.cancel {
            token.cancel();
        }
        if let Some(driver) = taken.driver {
            match origin {
                Origin::Driver(_) => drop(driver),
                Origin::Caller(_) => {
                    driver.abort();
                    let _ = driver.await;
                }
            }
        }

        if let Some(id) = &taken.call_id {
            self.dispose_record(id, disposal).await;
        }
        if let Some(connection) = taken.connection {
            connection.close().await;
        }
        if let Some(local) = taken.local_stream {
            local.stop_all();
        }

        clear_stream(&self.remote_tx);
        clear_stream(&self.local_tx);
        self.status_tx.send_replace(SessionStatus::Disconnected);
        info!("Session released");
    }

    async fn dispose_record(&self, id: &str, disposal: Disposal) {
        if disposal == Disposal::DeleteIfOwned {
            match self.store.get(id).await {
                Ok(Some(record)) if record.created_by != self.identity.as_str() => {
                    debug!("Call {id} belongs to {}, leaving it", record.created_by);
                    return;
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    debug!("Call {id} already gone");
                    return;
                }
                Err(e) => {
                    warn!(
                        "{}",
                        CallError::Cleanup(format!("cannot check owner of call {id}: {e}"))
                    );
                    return;
                }
            }
        }
        self.delete_record(id).await;
    }

    async fn delete_record(&self, id: &str) {
        match self.store.delete(id).await {
            Ok(()) => debug!("Deleted call {id}"),
            Err(StoreError::NotFound(_)) => debug!("Call {id} already gone"),
            Err(e) => warn!("{}", CallError::Cleanup(format!("delete call {id}: {e}"))),
        }
    }

    fn install(&self, epoch: u64, apply: impl FnOnce(&mut SessionState)) -> bool {
        let mut state = self.state.lock();
        if !state.is_live(epoch) {
            return false;
        }
        apply(&mut state);
        true
    }

    fn set_status_if_live(&self, epoch: u64, status: SessionStatus) -> bool {
        let state = self.state.lock();
        if !state.is_live(epoch) {
            return false;
        }
        self.status_tx.send_replace(status);
        true
    }
}

fn status_for(role: Role) -> SessionStatus {
    match role {
        Role::Offerer => SessionStatus::Waiting,
        Role::Answerer => SessionStatus::Connected,
    }
}

fn clear_stream(tx: &watch::Sender<Option<MediaStream>>) {
    tx.send_if_modified(|stream| stream.take().is_some());
}

/// Шаг, который отмена прерывает на любом await
async fn interruptible<T>(
    token: &CancellationToken,
    step: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(CallError::Cancelled),
        result = step => result,
    }
}
