//! Подбор собеседника через общее хранилище
//!
//! Ищем открытую запись чужого участника и пытаемся занять её атомарным
//! `waiting → matched`. Не вышло за `max_claim_attempts` попыток или
//! открытых записей нет - создаём свою и ждём.

use crate::config::CallConfig;
use crate::error::{CallError, Result};
use crate::peer::types::Role;
use crate::store::{
    CallPatch, CallQuery, CallRecord, CallStatus, ClaimOutcome, NewCall, OrderField,
    Precondition, RendezvousStore, StoreError,
};
use crate::utils::random_id;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Анонимный идентификатор участника
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(CallError::Identity("identity must not be empty".into()));
        }
        Ok(Self(id))
    }

    /// Случайный id для запуска без внешней авторизации
    pub fn anonymous() -> Self {
        Self(format!("anon-{}", random_id()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Identity {
    type Error = CallError;

    fn try_from(value: String) -> Result<Self> {
        Identity::new(value)
    }
}

impl From<Identity> for String {
    fn from(value: Identity) -> Self {
        value.0
    }
}

/// Роль и запись, выданные матчмейкером
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub role: Role,
    pub record: CallRecord,
}

impl Assignment {
    pub fn call_id(&self) -> &str {
        &self.record.id
    }
}

/// Итог сверки очереди ожидания
#[derive(Debug, Clone, PartialEq)]
pub enum Rematch {
    /// Остаёмся offerer'ом своей записи
    Stay,
    /// Своя запись снята, чужая занята: дальше как answerer
    Claimed(CallRecord),
    /// Своя запись снята, а чужую перехватили: искать заново
    Lost,
}

#[derive(Clone)]
pub struct Matchmaker {
    store: Arc<dyn RendezvousStore>,
    max_claim_attempts: u32,
}

impl Matchmaker {
    pub fn new(store: Arc<dyn RendezvousStore>, config: &CallConfig) -> Self {
        Self {
            store,
            max_claim_attempts: config.max_claim_attempts.max(1),
        }
    }

    /// Занимает открытую запись или создаёт свою
    pub async fn find_or_create(&self, identity: &Identity) -> Result<Assignment> {
        for attempt in 1..=self.max_claim_attempts {
            let Some(open) = self.find_open(identity).await? else {
                debug!("No open calls found (attempt {attempt})");
                break;
            };

            if let Some(record) = self.claim(open, identity).await? {
                info!("Claimed call {} as answerer", record.id);
                return Ok(Assignment {
                    role: Role::Answerer,
                    record,
                });
            }
            debug!(
                "Lost claim race (attempt {attempt}/{})",
                self.max_claim_attempts
            );
        }

        let record = self.create(identity).await?;
        info!("Created call {} as offerer", record.id);
        Ok(Assignment {
            role: Role::Offerer,
            record,
        })
    }

    /// Сверка для ожидающего offerer'а
    ///
    /// Если открыта запись участника с меньшим id, снимаем свою (`waiting →
    /// expired`) и занимаем ту. Так два одновременных поиска сходятся в
    /// одну пару, а не ждут друг друга вечно.
    pub async fn rematch(&self, identity: &Identity, own: &CallRecord) -> Result<Rematch> {
        let Some(open) = self.find_open(identity).await? else {
            return Ok(Rematch::Stay);
        };
        if open.created_by.as_str() >= identity.as_str() {
            return Ok(Rematch::Stay);
        }

        let withdraw = CallPatch {
            status: Some(CallStatus::Expired),
            expired_at: Some(Utc::now()),
            ..Default::default()
        };
        match self
            .store
            .conditional_update(
                &own.id,
                Precondition::StatusIs(CallStatus::Waiting),
                withdraw,
            )
            .await
        {
            Ok(ClaimOutcome::Accepted) => {}
            Ok(ClaimOutcome::Rejected) => {
                debug!("Call {} was claimed meanwhile, keeping it", own.id);
                return Ok(Rematch::Stay);
            }
            Err(StoreError::NotFound(_)) => return Ok(Rematch::Stay),
            Err(e) => return Err(CallError::partner_search(e)),
        }
        info!("Withdrew call {} in favour of {}", own.id, open.id);

        match self.claim(open, identity).await? {
            Some(record) => Ok(Rematch::Claimed(record)),
            None => Ok(Rematch::Lost),
        }
    }

    async fn find_open(&self, identity: &Identity) -> Result<Option<CallRecord>> {
        let query = CallQuery {
            status_in: vec![CallStatus::Waiting],
            created_by_not: Some(identity.to_string()),
            has_offer: true,
            // неравенство по createdBy требует сортировки по нему же
            order_by: vec![OrderField::CreatedBy, OrderField::Created],
            limit: Some(1),
            ..Default::default()
        };
        let hits = self
            .store
            .query(&query)
            .await
            .map_err(CallError::partner_search)?;
        Ok(hits.into_iter().next())
    }

    /// `Some` - запись наша; `None` - другой участник успел раньше
    async fn claim(&self, mut record: CallRecord, identity: &Identity) -> Result<Option<CallRecord>> {
        let patch = CallPatch {
            status: Some(CallStatus::Matched),
            answered_by: Some(identity.to_string()),
            matched_at: Some(Utc::now()),
            ..Default::default()
        };
        let outcome = self
            .store
            .conditional_update(
                &record.id,
                Precondition::StatusIs(CallStatus::Waiting),
                patch.clone(),
            )
            .await;

        match outcome {
            Ok(ClaimOutcome::Accepted) => {
                patch.apply(&mut record);
                Ok(Some(record))
            }
            Ok(ClaimOutcome::Rejected) => Ok(None),
            // запись удалили между запросом и захватом
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(CallError::partner_search(e)),
        }
    }

    async fn create(&self, identity: &Identity) -> Result<CallRecord> {
        let created = Utc::now();
        let id = self
            .store
            .create(NewCall {
                created_by: identity.to_string(),
                created,
                offer: None,
            })
            .await
            .map_err(CallError::partner_search)?;

        Ok(CallRecord {
            id,
            offer: None,
            answer: None,
            status: CallStatus::Waiting,
            created_by: identity.to_string(),
            answered_by: None,
            created,
            matched_at: None,
            expired_at: None,
        })
    }
}

/// Помечает `expired` записи старше `max_age`, всё ещё `waiting`/`matched`
///
/// Возвращает число снятых записей.
pub async fn expire_stale_calls(store: &dyn RendezvousStore, max_age: Duration) -> Result<usize> {
    let max_age = chrono::Duration::from_std(max_age)
        .map_err(|e| CallError::InvalidConfig(format!("stale call age: {e}")))?;
    let query = CallQuery {
        status_in: vec![CallStatus::Waiting, CallStatus::Matched],
        created_before: Some(Utc::now() - max_age),
        order_by: vec![OrderField::Created],
        ..Default::default()
    };
    let stale = store.query(&query).await.map_err(CallError::partner_search)?;

    let mut expired = 0;
    for record in stale {
        let patch = CallPatch {
            status: Some(CallStatus::Expired),
            expired_at: Some(Utc::now()),
            ..Default::default()
        };
        match store
            .conditional_update(&record.id, Precondition::StatusIs(record.status), patch)
            .await
        {
            Ok(ClaimOutcome::Accepted) => expired += 1,
            Ok(ClaimOutcome::Rejected) | Err(StoreError::NotFound(_)) => {}
            Err(e) => warn!("Failed to expire call {}: {e}", record.id),
        }
    }
    if expired > 0 {
        info!("Expired {expired} stale calls");
    }
    Ok(expired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::SessionDescription;
    use crate::store::memory::{MemoryStore, StoreOp};
    use chrono::DateTime;

    fn matchmaker(store: &MemoryStore) -> Matchmaker {
        Matchmaker::new(Arc::new(store.clone()), &CallConfig::default())
    }

    fn id(name: &str) -> Identity {
        Identity::new(name).unwrap()
    }

    /// Запись с опубликованным offer, как после старта offerer'а
    async fn open_call(store: &MemoryStore, owner: &str) -> String {
        store
            .create(NewCall {
                created_by: owner.into(),
                created: Utc::now(),
                offer: Some(SessionDescription::offer(format!("offer-of-{owner}"))),
            })
            .await
            .unwrap()
    }

    #[test]
    fn identity_rejects_blank() {
        assert!(matches!(Identity::new("  "), Err(CallError::Identity(_))));
        assert!(Identity::anonymous().as_str().starts_with("anon-"));
        let parsed: std::result::Result<Identity, _> = serde_json::from_str("\"\"");
        assert!(parsed.is_err());
    }

    #[tokio::test]
    async fn empty_store_makes_offerer() {
        let store = MemoryStore::new();
        let assignment = matchmaker(&store).find_or_create(&id("alice")).await.unwrap();

        assert_eq!(assignment.role, Role::Offerer);
        let stored = store.record(assignment.call_id()).unwrap();
        assert_eq!(stored.status, CallStatus::Waiting);
        assert_eq!(stored.created_by, "alice");
        assert!(stored.offer.is_none());
    }

    #[tokio::test]
    async fn open_call_is_claimed() {
        let store = MemoryStore::new();
        let call = open_call(&store, "alice").await;

        let assignment = matchmaker(&store).find_or_create(&id("bob")).await.unwrap();
        assert_eq!(assignment.role, Role::Answerer);
        assert_eq!(assignment.call_id(), call);

        let stored = store.record(&call).unwrap();
        assert_eq!(stored.status, CallStatus::Matched);
        assert_eq!(stored.answered_by.as_deref(), Some("bob"));
        assert!(stored.matched_at.is_some());
        assert_eq!(assignment.record, stored);
    }

    #[tokio::test]
    async fn own_call_is_never_claimed() {
        let store = MemoryStore::new();
        open_call(&store, "alice").await;

        let assignment = matchmaker(&store).find_or_create(&id("alice")).await.unwrap();
        assert_eq!(assignment.role, Role::Offerer);
        assert_eq!(store.records().len(), 2);
    }

    #[tokio::test]
    async fn unpublished_call_is_invisible() {
        let store = MemoryStore::new();
        let mm = matchmaker(&store);
        mm.find_or_create(&id("alice")).await.unwrap();

        let second = mm.find_or_create(&id("bob")).await.unwrap();
        assert_eq!(second.role, Role::Offerer);
    }

    #[tokio::test]
    async fn two_racers_one_winner() {
        let store = MemoryStore::new();
        let call = open_call(&store, "host").await;
        let mm = matchmaker(&store);
        let (a, b) = (id("a"), id("b"));

        let (ra, rb) = tokio::join!(mm.find_or_create(&a), mm.find_or_create(&b));
        let roles = [ra.unwrap(), rb.unwrap()];

        let answerers: Vec<_> = roles.iter().filter(|r| r.role == Role::Answerer).collect();
        assert_eq!(answerers.len(), 1);
        assert_eq!(answerers[0].call_id(), call);
        assert_eq!(roles.iter().filter(|r| r.role == Role::Offerer).count(), 1);
    }

    #[tokio::test]
    async fn three_racers_one_answerer_two_offerers() {
        let store = MemoryStore::new();
        let call = open_call(&store, "host").await;
        let mm = matchmaker(&store);
        let (a, b, c) = (id("a"), id("b"), id("c"));

        let (ra, rb, rc) = tokio::join!(
            mm.find_or_create(&a),
            mm.find_or_create(&b),
            mm.find_or_create(&c)
        );
        let roles = [ra.unwrap(), rb.unwrap(), rc.unwrap()];

        assert_eq!(roles.iter().filter(|r| r.role == Role::Answerer).count(), 1);
        let offerers: Vec<_> = roles.iter().filter(|r| r.role == Role::Offerer).collect();
        assert_eq!(offerers.len(), 2);
        assert_ne!(offerers[0].call_id(), offerers[1].call_id());
        assert!(offerers.iter().all(|r| r.call_id() != call));

        let winner = store.record(&call).unwrap();
        assert_eq!(winner.status, CallStatus::Matched);
        let answerer = roles.iter().find(|r| r.role == Role::Answerer).unwrap();
        assert_eq!(winner.answered_by, answerer.record.answered_by);
    }

    #[tokio::test]
    async fn query_failure_is_partner_search_error() {
        let store = MemoryStore::new();
        store.fail_next(StoreOp::Query);
        let err = matchmaker(&store).find_or_create(&id("a")).await.unwrap_err();
        assert!(matches!(err, CallError::PartnerSearch(_)));
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn failed_create_leaves_nothing() {
        let store = MemoryStore::new();
        store.fail_next(StoreOp::Create);
        let err = matchmaker(&store).find_or_create(&id("a")).await.unwrap_err();
        assert!(matches!(err, CallError::PartnerSearch(_)));
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn rematch_yields_to_smaller_identity() {
        let store = MemoryStore::new();
        let mm = matchmaker(&store);
        let small = open_call(&store, "aaa").await;
        let big = open_call(&store, "zzz").await;
        let own = store.record(&big).unwrap();

        match mm.rematch(&id("zzz"), &own).await.unwrap() {
            Rematch::Claimed(record) => assert_eq!(record.id, small),
            other => panic!("expected claim, got {other:?}"),
        }
        assert_eq!(store.record(&big).unwrap().status, CallStatus::Expired);
        assert_eq!(store.record(&small).unwrap().status, CallStatus::Matched);

        // меньший id не уступает
        let small_own = store.record(&small).unwrap();
        assert_eq!(mm.rematch(&id("aaa"), &small_own).await.unwrap(), Rematch::Stay);
    }

    #[tokio::test]
    async fn rematch_keeps_claimed_record() {
        let store = MemoryStore::new();
        let mm = matchmaker(&store);
        open_call(&store, "aaa").await;
        let own_id = open_call(&store, "zzz").await;

        // кто-то занял нашу запись до сверки
        mm.claim(store.record(&own_id).unwrap(), &id("bob"))
            .await
            .unwrap()
            .unwrap();

        let own = store.record(&own_id).unwrap();
        assert_eq!(mm.rematch(&id("zzz"), &own).await.unwrap(), Rematch::Stay);
        assert_eq!(store.record(&own_id).unwrap().status, CallStatus::Matched);
    }

    #[tokio::test]
    async fn janitor_expires_only_old_open_calls() {
        let store = MemoryStore::new();
        let old = store
            .create(NewCall {
                created_by: "old".into(),
                created: DateTime::from_timestamp(1_000, 0).unwrap(),
                offer: None,
            })
            .await
            .unwrap();
        let fresh = open_call(&store, "fresh").await;

        let expired = expire_stale_calls(&store, Duration::from_secs(86_400))
            .await
            .unwrap();
        assert_eq!(expired, 1);

        let old = store.record(&old).unwrap();
        assert_eq!(old.status, CallStatus::Expired);
        assert!(old.expired_at.is_some());
        assert_eq!(store.record(&fresh).unwrap().status, CallStatus::Waiting);

        // повторный проход ничего не меняет
        assert_eq!(
            expire_stale_calls(&store, Duration::from_secs(86_400))
                .await
                .unwrap(),
            0
        );
    }
}
