//! Согласование offer/answer и обмен кандидатами через запись звонка
//!
//! [`Negotiator`] живёт одну попытку соединения: от выданной матчмейкером
//! роли до первого терминального события. Источников событий два -
//! peer connection и живые подписки на запись и подколлекцию кандидатов.

use crate::config::CallConfig;
use crate::error::{CallError, Result};
use crate::logger::analyze_candidates;
use crate::matchmaker::{Assignment, Identity, Matchmaker, Rematch};
use crate::peer::connection::{ConnectionHandle, PeerConnection, PeerEvent, PeerEvents};
use crate::peer::ice::RemoteCandidateQueue;
use crate::peer::types::{IceCandidate, LinkState, Role, SessionDescription};
use crate::store::{
    CallPatch, CallRecord, CallStatus, CandidateChange, CandidateSide, ClaimOutcome,
    Precondition, RecordChange, RendezvousStore, StoreError, Subscription, WriteMode,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Состояние одной попытки согласования
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

/// Чем закончилась попытка
#[derive(Debug)]
pub enum Exit {
    /// Сработал токен отмены; разбор делает тот, кто отменил
    Cancelled,
    /// Ожидание уступило встречной записи: `Some` - она уже занята нами,
    /// `None` - искать заново
    Rematch(Option<CallRecord>),
    /// Собеседник удалил или закрыл запись
    RemoteHangup,
    Ended(CallError),
}

#[derive(Debug)]
pub enum Progress {
    /// Offerer получил answer и больше не ждёт собеседника
    PartnerAnswered,
    Finished(Exit),
}

enum Step {
    Watchdog,
    Record(Option<RecordChange>),
    Candidate(Option<CandidateChange>),
    Peer(Option<PeerEvent>),
    RematchTick,
}

pub struct Negotiator {
    role: Role,
    identity: Identity,
    record: CallRecord,
    store: Arc<dyn RendezvousStore>,
    connection: Arc<ConnectionHandle>,
    matchmaker: Matchmaker,
    events: Option<PeerEvents>,
    state: watch::Sender<NegotiationState>,

    queue: RemoteCandidateQueue,
    record_sub: Option<Subscription<RecordChange>>,
    candidate_sub: Option<Subscription<CandidateChange>>,
    local_candidates: Vec<IceCandidate>,

    /// sdp последнего применённого offer (answerer)
    remote_offer: Option<String>,
    /// sdp последнего применённого answer (offerer)
    remote_answer: Option<String>,
    claimed: bool,
    restarted: bool,
    restart_pending: bool,

    connection_link: LinkState,
    path_link: LinkState,
    watchdog: Option<Instant>,
    recovery_window: Duration,
    rematch: Option<Interval>,
    rematch_interval: Duration,
}

impl Negotiator {
    pub fn new(
        assignment: Assignment,
        identity: Identity,
        store: Arc<dyn RendezvousStore>,
        connection: Arc<ConnectionHandle>,
        events: PeerEvents,
        matchmaker: Matchmaker,
        config: &CallConfig,
    ) -> Self {
        Self {
            role: assignment.role,
            identity,
            record: assignment.record,
            store,
            connection,
            matchmaker,
            events: Some(events),
            state: watch::channel(NegotiationState::Idle).0,
            queue: RemoteCandidateQueue::new(),
            record_sub: None,
            candidate_sub: None,
            local_candidates: Vec::new(),
            remote_offer: None,
            remote_answer: None,
            claimed: false,
            restarted: false,
            restart_pending: false,
            connection_link: LinkState::New,
            path_link: LinkState::New,
            watchdog: None,
            recovery_window: config.recovery_window(),
            rematch: None,
            rematch_interval: config.rematch_interval(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn call_id(&self) -> &str {
        &self.record.id
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    /// Наблюдатель за состоянием, переживает сам `Negotiator`
    pub fn subscribe_state(&self) -> watch::Receiver<NegotiationState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: NegotiationState) {
        self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    /// Первый обмен: offerer публикует offer, answerer отвечает на него.
    /// После возврата подписки на запись и кандидаты уже живы.
    pub async fn start(&mut self) -> Result<()> {
        self.set_state(NegotiationState::Negotiating);
        let started = match self.role {
            Role::Offerer => self.start_offerer().await,
            Role::Answerer => self.start_answerer().await,
        };
        if started.is_err() {
            self.set_state(NegotiationState::Failed);
        }
        started
    }

    async fn start_offerer(&mut self) -> Result<()> {
        let peer = self.peer();
        let offer = peer.create_offer(false).await?;
        peer.set_local_description(offer.clone()).await?;

        // публикуем только в ещё открытую запись: снятая janitor'ом не оживает
        let patch = CallPatch {
            offer: Some(offer.clone()),
            ..Default::default()
        };
        let published = self
            .store
            .conditional_update(
                &self.record.id,
                Precondition::StatusIs(CallStatus::Waiting),
                patch,
            )
            .await;
        match published {
            Ok(ClaimOutcome::Accepted) => {}
            Ok(ClaimOutcome::Rejected) => {
                return Err(CallError::Negotiation(format!(
                    "call {} is no longer waiting",
                    self.record.id
                )))
            }
            Err(e) => return Err(CallError::negotiation(e)),
        }
        self.record.offer = Some(offer);
        info!("Published offer for call {}", self.record.id);

        self.subscribe().await?;

        let mut tick = interval_at(Instant::now() + self.rematch_interval, self.rematch_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.rematch = Some(tick);
        Ok(())
    }

    async fn start_answerer(&mut self) -> Result<()> {
        let id = self.record.id.clone();
        let current = self
            .store
            .get(&id)
            .await
            .map_err(CallError::negotiation)?
            .ok_or_else(|| CallError::Negotiation(format!("call {id} disappeared")))?;
        let offer = current
            .offer
            .clone()
            .ok_or_else(|| CallError::Negotiation(format!("call {id} has no offer")))?;
        self.record = current;
        self.claimed = true;

        self.answer(offer).await?;
        self.subscribe().await
    }

    async fn subscribe(&mut self) -> Result<()> {
        let id = self.record.id.clone();
        let side = CandidateSide::read_by(self.role);
        self.record_sub = Some(
            self.store
                .subscribe_record(&id)
                .await
                .map_err(CallError::negotiation)?,
        );
        self.candidate_sub = Some(
            self.store
                .subscribe_candidates(&id, side)
                .await
                .map_err(CallError::negotiation)?,
        );
        debug!("Subscribed to call {id} and {}", side.collection_name());
        Ok(())
    }

    /// Снимает подписки и таймеры; дальше `next()` вернёт только отмену
    pub fn unsubscribe(&mut self) {
        if let Some(sub) = self.record_sub.take() {
            sub.unsubscribe();
        }
        if let Some(sub) = self.candidate_sub.take() {
            sub.unsubscribe();
        }
        self.events = None;
        self.rematch = None;
        self.watchdog = None;
    }

    /// Обрабатывает события, пока не случится что-то важное для контроллера
    pub async fn next(&mut self, cancel: &CancellationToken) -> Progress {
        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Progress::Finished(Exit::Cancelled),
                _ = expire(self.watchdog) => Step::Watchdog,
                change = next_change(&mut self.record_sub) => Step::Record(change),
                change = next_change(&mut self.candidate_sub) => Step::Candidate(change),
                event = next_event(&mut self.events) => Step::Peer(event),
                _ = tick(&mut self.rematch) => Step::RematchTick,
            };

            let handled = match step {
                Step::Watchdog => self.on_watchdog().await,
                Step::Record(change) => self.on_record(change).await,
                Step::Candidate(change) => self.on_candidate(change).await,
                Step::Peer(event) => self.on_peer(event).await,
                Step::RematchTick => Ok(self.on_rematch_tick().await),
            };

            match handled {
                Ok(Some(progress)) => return progress,
                Ok(None) => {}
                Err(e) => {
                    self.set_state(NegotiationState::Failed);
                    return Progress::Finished(Exit::Ended(e));
                }
            }
        }
    }

    fn peer(&self) -> Arc<dyn PeerConnection> {
        self.connection.peer().clone()
    }

    fn link(&self) -> LinkState {
        self.connection_link.combine(self.path_link)
    }

    async fn on_record(&mut self, change: Option<RecordChange>) -> Result<Option<Progress>> {
        match change {
            None => {
                debug!("Record subscription closed by the store");
                self.record_sub = None;
                Ok(None)
            }
            Some(RecordChange::Removed(id)) => {
                info!("Call {id} was removed, partner left");
                self.set_state(NegotiationState::Closed);
                Ok(Some(Progress::Finished(Exit::RemoteHangup)))
            }
            Some(RecordChange::Snapshot(record)) => self.on_snapshot(record).await,
        }
    }

    async fn on_snapshot(&mut self, record: CallRecord) -> Result<Option<Progress>> {
        if record.status == CallStatus::Expired {
            info!("Call {} expired", record.id);
            self.set_state(NegotiationState::Closed);
            return Ok(Some(Progress::Finished(Exit::RemoteHangup)));
        }
        if record.status == CallStatus::Matched && !self.claimed {
            self.claimed = true;
            self.rematch = None;
            info!(
                "Call {} claimed by {}",
                record.id,
                record.answered_by.as_deref().unwrap_or("unknown")
            );
        }

        let progress = match self.role {
            Role::Offerer => self.on_answer(record.answer.clone()).await?,
            Role::Answerer => {
                self.on_offer(record.offer.clone()).await?;
                None
            }
        };
        self.record = record;
        Ok(progress)
    }

    async fn on_answer(&mut self, answer: Option<SessionDescription>) -> Result<Option<Progress>> {
        let Some(answer) = answer else {
            return Ok(None);
        };
        if self.remote_answer.as_deref() == Some(answer.sdp.as_str()) {
            return Ok(None);
        }

        let peer = self.peer();
        if self.remote_answer.is_none() {
            if peer.has_remote_description().await {
                return Ok(None);
            }
            peer.set_remote_description(answer.clone()).await?;
            self.remote_answer = Some(answer.sdp);
            self.rematch = None;
            info!("Applied answer for call {}", self.record.id);
            self.flush_candidates().await?;
            return Ok(Some(Progress::PartnerAnswered));
        }

        if self.restart_pending {
            peer.set_remote_description(answer.clone()).await?;
            self.remote_answer = Some(answer.sdp);
            self.restart_pending = false;
            info!("Applied answer after ICE restart");
        }
        Ok(None)
    }

    async fn on_offer(&mut self, offer: Option<SessionDescription>) -> Result<()> {
        let Some(offer) = offer else {
            return Ok(());
        };
        if self.remote_offer.as_deref() == Some(offer.sdp.as_str()) {
            return Ok(());
        }
        info!("Offer changed, answering ICE restart");
        self.answer(offer).await
    }

    /// Применяет offer и пишет answer в запись (merge)
    async fn answer(&mut self, offer: SessionDescription) -> Result<()> {
        let peer = self.peer();
        peer.set_remote_description(offer.clone()).await?;
        self.remote_offer = Some(offer.sdp);
        self.flush_candidates().await?;

        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;
        self.store
            .update(
                &self.record.id,
                CallPatch {
                    answer: Some(answer),
                    ..Default::default()
                },
                WriteMode::Merge,
            )
            .await
            .map_err(CallError::negotiation)?;
        info!("Published answer for call {}", self.record.id);
        Ok(())
    }

    async fn flush_candidates(&mut self) -> Result<()> {
        let ready = self.queue.remote_ready();
        if !ready.is_empty() {
            debug!("Applying {} queued remote candidates", ready.len());
        }
        self.apply_candidates(ready).await
    }

    async fn apply_candidates(&self, candidates: Vec<IceCandidate>) -> Result<()> {
        let peer = self.peer();
        for candidate in candidates {
            peer.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    async fn on_candidate(&mut self, change: Option<CandidateChange>) -> Result<Option<Progress>> {
        match change {
            None => {
                debug!("Candidate subscription closed by the store");
                self.candidate_sub = None;
            }
            Some(CandidateChange::Added(entry)) => {
                let ready = self.queue.push(entry);
                self.apply_candidates(ready).await?;
            }
        }
        Ok(None)
    }

    async fn on_peer(&mut self, event: Option<PeerEvent>) -> Result<Option<Progress>> {
        let Some(event) = event else {
            self.events = None;
            return Err(CallError::ConnectivityLost(
                "peer connection went away".into(),
            ));
        };

        match event {
            PeerEvent::LocalCandidate(candidate) => self.relay(candidate).await,
            PeerEvent::GatheringComplete => {
                analyze_candidates(&self.local_candidates);
            }
            PeerEvent::Connection(state) => {
                let before = self.link();
                self.connection_link = state;
                return self.on_link(before).await;
            }
            PeerEvent::Path(state) => {
                let before = self.link();
                self.path_link = state;
                return self.on_link(before).await;
            }
            PeerEvent::Track(track) => {
                self.connection.add_remote_track(track);
            }
        }
        Ok(None)
    }

    /// Локальный кандидат пишем только в свою подколлекцию
    async fn relay(&mut self, candidate: IceCandidate) {
        self.local_candidates.push(candidate.clone());
        let side = CandidateSide::written_by(self.role);
        match self.store.append(&self.record.id, side, candidate).await {
            Ok(seq) => debug!("Relayed local candidate #{seq} to {}", side.collection_name()),
            Err(StoreError::NotFound(_)) => debug!("Call record is gone, dropping local candidate"),
            Err(e) => warn!("Failed to relay local candidate: {e}"),
        }
    }

    async fn on_link(&mut self, before: LinkState) -> Result<Option<Progress>> {
        let now = self.link();
        if now == before {
            return Ok(None);
        }
        debug!("Link state {before:?} -> {now:?}");

        match now {
            LinkState::New | LinkState::Connecting => {}
            LinkState::Connected => {
                if self.watchdog.take().is_some() {
                    info!("Connection recovered within the recovery window");
                }
                self.set_state(NegotiationState::Connected);
            }
            LinkState::Disconnected => self.arm_watchdog(now),
            LinkState::Failed => {
                if self.restarted {
                    self.set_state(NegotiationState::Failed);
                    return Err(CallError::ConnectivityLost(
                        "connection failed after ICE restart".into(),
                    ));
                }
                self.restarted = true;
                self.set_state(NegotiationState::Negotiating);
                self.arm_watchdog(now);
                match self.role {
                    Role::Offerer => self.restart_ice().await?,
                    Role::Answerer => info!("Waiting for the offerer to restart ICE"),
                }
            }
            LinkState::Closed => {
                self.set_state(NegotiationState::Closed);
                return Err(CallError::ConnectivityLost("peer connection closed".into()));
            }
        }
        Ok(None)
    }

    fn arm_watchdog(&mut self, state: LinkState) {
        if self.watchdog.is_none() {
            warn!(
                "Connection {state:?} - waiting {} s for recovery",
                self.recovery_window.as_secs_f32()
            );
            self.watchdog = Some(Instant::now() + self.recovery_window);
        }
    }

    async fn on_watchdog(&mut self) -> Result<Option<Progress>> {
        self.watchdog = None;
        let peer = self.peer();
        // событие о восстановлении могло потеряться
        if peer.link_state() == LinkState::Connected {
            info!("Link is connected again, dropping the recovery watchdog");
            self.connection_link = LinkState::Connected;
            self.path_link = LinkState::Connected;
            self.set_state(NegotiationState::Connected);
            return Ok(None);
        }
        peer.dump_stats("RECOVERY-TIMEOUT").await;
        self.set_state(NegotiationState::Failed);
        Err(CallError::ConnectivityLost(format!(
            "no recovery within {} s",
            self.recovery_window.as_secs_f32()
        )))
    }

    async fn restart_ice(&mut self) -> Result<()> {
        let peer = self.peer();
        let offer = peer.create_offer(true).await?;
        peer.set_local_description(offer.clone()).await?;
        self.store
            .update(
                &self.record.id,
                CallPatch {
                    offer: Some(offer),
                    ..Default::default()
                },
                WriteMode::Merge,
            )
            .await
            .map_err(CallError::negotiation)?;
        self.restart_pending = true;
        info!("Published ICE restart offer for call {}", self.record.id);
        Ok(())
    }

    async fn on_rematch_tick(&mut self) -> Option<Progress> {
        if self.claimed || self.remote_answer.is_some() {
            self.rematch = None;
            return None;
        }
        match self.matchmaker.rematch(&self.identity, &self.record).await {
            Ok(Rematch::Stay) => None,
            Ok(Rematch::Claimed(record)) => {
                self.set_state(NegotiationState::Closed);
                Some(Progress::Finished(Exit::Rematch(Some(record))))
            }
            Ok(Rematch::Lost) => {
                self.set_state(NegotiationState::Closed);
                Some(Progress::Finished(Exit::Rematch(None)))
            }
            Err(e) => {
                warn!("Waiting room check failed: {e}");
                None
            }
        }
    }
}

async fn next_change<T>(sub: &mut Option<Subscription<T>>) -> Option<T> {
    match sub {
        Some(sub) => sub.next().await,
        None => std::future::pending().await,
    }
}

async fn next_event(events: &mut Option<PeerEvents>) -> Option<PeerEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn tick(rematch: &mut Option<Interval>) {
    match rematch {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
