//! Интерфейс общего хранилища документов, через которое идёт рандеву
//!
//! Хранилище само по себе внешнее; здесь только контракт и
//! [`memory::MemoryStore`] для тестов и локального демо.

pub mod memory;

use crate::peer::types::{IceCandidate, Role, SessionDescription};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub type CallId = String;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("call record not found: {0}")]
    NotFound(CallId),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid store request: {0}")]
    Invalid(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Waiting,
    Matched,
    Expired,
}

/// Запись звонка
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: CallId,
    pub offer: Option<SessionDescription>,
    pub answer: Option<SessionDescription>,
    pub status: CallStatus,
    pub created_by: String,
    pub answered_by: Option<String>,
    pub created: DateTime<Utc>,
    pub matched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expired_at: Option<DateTime<Utc>>,
}

/// Новая запись до того, как хранилище выдало ей id
#[derive(Debug, Clone, PartialEq)]
pub struct NewCall {
    pub created_by: String,
    pub created: DateTime<Utc>,
    pub offer: Option<SessionDescription>,
}

/// Набор полей для записи; `None` - поле не трогаем
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallPatch {
    pub offer: Option<SessionDescription>,
    pub answer: Option<SessionDescription>,
    pub status: Option<CallStatus>,
    pub answered_by: Option<String>,
    pub matched_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
}

impl CallPatch {
    /// Применяет патч поверх записи
    pub fn apply(&self, record: &mut CallRecord) {
        if let Some(offer) = &self.offer {
            record.offer = Some(offer.clone());
        }
        if let Some(answer) = &self.answer {
            record.answer = Some(answer.clone());
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(answered_by) = &self.answered_by {
            record.answered_by = Some(answered_by.clone());
        }
        if let Some(at) = self.matched_at {
            record.matched_at = Some(at);
        }
        if let Some(at) = self.expired_at {
            record.expired_at = Some(at);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Сливаем с существующими полями
    Merge,
    /// Перезаписываем всё, кроме id/createdBy/created
    Replace,
}

/// Условие для атомарного обновления
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    StatusIs(CallStatus),
}

impl Precondition {
    pub fn holds(&self, record: &CallRecord) -> bool {
        match self {
            Precondition::StatusIs(status) => record.status == *status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Accepted,
    Rejected,
}

/// Какой из двух подколлекций кандидатов касается операция
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateSide {
    /// `offerCandidates`
    Offerer,
    /// `answerCandidates`
    Answerer,
}

impl CandidateSide {
    /// Куда пишет роль свои локальные кандидаты
    pub fn written_by(role: Role) -> Self {
        match role {
            Role::Offerer => CandidateSide::Offerer,
            Role::Answerer => CandidateSide::Answerer,
        }
    }

    /// Откуда роль читает кандидаты собеседника
    pub fn read_by(role: Role) -> Self {
        Self::written_by(role.opposite())
    }

    pub fn collection_name(self) -> &'static str {
        match self {
            CandidateSide::Offerer => "offerCandidates",
            CandidateSide::Answerer => "answerCandidates",
        }
    }
}

/// Неизменяемая запись подколлекции кандидатов
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CandidateEntry {
    /// Порядковый номер, выдаётся хранилищем при добавлении
    pub seq: u64,
    pub candidate: IceCandidate,
    pub added: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordChange {
    Snapshot(CallRecord),
    Removed(CallId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CandidateChange {
    Added(CandidateEntry),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderField {
    CreatedBy,
    Created,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallQuery {
    /// Статус входит в список; пустой список - любой
    pub status_in: Vec<CallStatus>,
    pub created_by_not: Option<String>,
    pub created_before: Option<DateTime<Utc>>,
    pub has_offer: bool,
    pub order_by: Vec<OrderField>,
    pub limit: Option<usize>,
}

impl CallQuery {
    pub fn matches(&self, record: &CallRecord) -> bool {
        if !self.status_in.is_empty() && !self.status_in.contains(&record.status) {
            return false;
        }
        if let Some(owner) = &self.created_by_not {
            if &record.created_by == owner {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if record.created >= before {
                return false;
            }
        }
        if self.has_offer && record.offer.is_none() {
            return false;
        }
        true
    }

    pub fn compare(&self, a: &CallRecord, b: &CallRecord) -> std::cmp::Ordering {
        self.order_by
            .iter()
            .map(|field| match field {
                OrderField::CreatedBy => a.created_by.cmp(&b.created_by),
                OrderField::Created => a.created.cmp(&b.created),
            })
            .find(|o| o.is_ne())
            .unwrap_or_else(|| a.id.cmp(&b.id))
    }
}

/// Живая подписка; удаление значения снимает подписку
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx }
    }

    /// Следующее изменение; `None` - хранилище закрыло подписку
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.rx.close();
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Тонкий адаптер над хранилищем документов
///
/// Транзакций между операциями нет. Единственный примитив синхронизации
/// между участниками - [`RendezvousStore::conditional_update`].
#[async_trait]
pub trait RendezvousStore: Send + Sync {
    async fn create(&self, call: NewCall) -> StoreResult<CallId>;

    async fn get(&self, id: &str) -> StoreResult<Option<CallRecord>>;

    async fn update(&self, id: &str, patch: CallPatch, mode: WriteMode) -> StoreResult<()>;

    /// Пишет поля только если условие выполняется на текущем состоянии
    async fn conditional_update(
        &self,
        id: &str,
        precondition: Precondition,
        patch: CallPatch,
    ) -> StoreResult<ClaimOutcome>;

    /// Добавляет кандидат в конец подколлекции, возвращает его `seq`
    async fn append(
        &self,
        id: &str,
        side: CandidateSide,
        candidate: IceCandidate,
    ) -> StoreResult<u64>;

    /// Сначала текущий снимок, потом изменения
    async fn subscribe_record(&self, id: &str) -> StoreResult<Subscription<RecordChange>>;

    /// Сначала все существующие записи по порядку, потом новые
    async fn subscribe_candidates(
        &self,
        id: &str,
        side: CandidateSide,
    ) -> StoreResult<Subscription<CandidateChange>>;

    async fn query(&self, query: &CallQuery) -> StoreResult<Vec<CallRecord>>;

    async fn delete(&self, id: &str) -> StoreResult<()>;
}
