//! Хранилище в памяти процесса
//!
//! Ведёт себя как документное хранилище с живыми подписками: все операции
//! атомарны по отдельности, `conditional_update` проверяет условие и пишет
//! под одной блокировкой.

use super::{
    CallId, CallPatch, CallQuery, CallRecord, CallStatus, CandidateChange, CandidateEntry,
    CandidateSide, ClaimOutcome, NewCall, Precondition, RecordChange, RendezvousStore,
    StoreError, StoreResult, Subscription, WriteMode,
};
use crate::peer::types::IceCandidate;
use crate::utils::random_id;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Операции, в которые можно внедрить отказ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Create,
    Get,
    Update,
    ConditionalUpdate,
    Append,
    Subscribe,
    Query,
    Delete,
}

struct StoredCall {
    record: CallRecord,
    offerer_candidates: Vec<CandidateEntry>,
    answerer_candidates: Vec<CandidateEntry>,
    record_watchers: Vec<mpsc::UnboundedSender<RecordChange>>,
    candidate_watchers: Vec<(CandidateSide, mpsc::UnboundedSender<CandidateChange>)>,
}

impl StoredCall {
    fn candidates(&self, side: CandidateSide) -> &Vec<CandidateEntry> {
        match side {
            CandidateSide::Offerer => &self.offerer_candidates,
            CandidateSide::Answerer => &self.answerer_candidates,
        }
    }

    fn candidates_mut(&mut self, side: CandidateSide) -> &mut Vec<CandidateEntry> {
        match side {
            CandidateSide::Offerer => &mut self.offerer_candidates,
            CandidateSide::Answerer => &mut self.answerer_candidates,
        }
    }

    fn notify_record(&mut self) {
        let change = RecordChange::Snapshot(self.record.clone());
        self.record_watchers
            .retain(|tx| tx.send(change.clone()).is_ok());
    }
}

#[derive(Default)]
struct Inner {
    calls: HashMap<CallId, StoredCall>,
    faults: Vec<StoreOp>,
    next_seq: u64,
}

impl Inner {
    fn take_fault(&mut self, op: StoreOp) -> StoreResult<()> {
        if let Some(pos) = self.faults.iter().position(|f| *f == op) {
            self.faults.remove(pos);
            return Err(StoreError::Unavailable(format!("injected {op:?} failure")));
        }
        Ok(())
    }

    fn call_mut(&mut self, id: &str) -> StoreResult<&mut StoredCall> {
        self.calls
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Следующая операция `op` завершится ошибкой `Unavailable`
    pub fn fail_next(&self, op: StoreOp) {
        self.inner.lock().faults.push(op);
    }

    pub fn record(&self, id: &str) -> Option<CallRecord> {
        self.inner.lock().calls.get(id).map(|c| c.record.clone())
    }

    pub fn records(&self) -> Vec<CallRecord> {
        let mut records: Vec<_> = self
            .inner
            .lock()
            .calls
            .values()
            .map(|c| c.record.clone())
            .collect();
        records.sort_by(|a, b| a.created.cmp(&b.created).then(a.id.cmp(&b.id)));
        records
    }

    pub fn candidates(&self, id: &str, side: CandidateSide) -> Vec<CandidateEntry> {
        self.inner
            .lock()
            .calls
            .get(id)
            .map(|c| c.candidates(side).clone())
            .unwrap_or_default()
    }

    /// Число живых подписок на запись и её подколлекции
    pub fn live_subscriptions(&self, id: &str) -> usize {
        let mut inner = self.inner.lock();
        let Some(call) = inner.calls.get_mut(id) else {
            return 0;
        };
        call.record_watchers.retain(|tx| !tx.is_closed());
        call.candidate_watchers.retain(|(_, tx)| !tx.is_closed());
        call.record_watchers.len() + call.candidate_watchers.len()
    }
}

#[async_trait]
impl RendezvousStore for MemoryStore {
    async fn create(&self, call: NewCall) -> StoreResult<CallId> {
        tokio::task::yield_now().await;
        let mut inner = self.inner.lock();
        inner.take_fault(StoreOp::Create)?;

        let id = random_id();
        let record = CallRecord {
            id: id.clone(),
            offer: call.offer,
            answer: None,
            status: CallStatus::Waiting,
            created_by: call.created_by,
            answered_by: None,
            created: call.created,
            matched_at: None,
            expired_at: None,
        };
        inner.calls.insert(
            id.clone(),
            StoredCall {
                record,
                offerer_candidates: Vec::new(),
                answerer_candidates: Vec::new(),
                record_watchers: Vec::new(),
                candidate_watchers: Vec::new(),
            },
        );
        debug!("memory store: created call {id}");
        Ok(id)
    }

    async fn get(&self, id: &str) -> StoreResult<Option<CallRecord>> {
        tokio::task::yield_now().await;
        let mut inner = self.inner.lock();
        inner.take_fault(StoreOp::Get)?;
        Ok(inner.calls.get(id).map(|c| c.record.clone()))
    }

    async fn update(&self, id: &str, patch: CallPatch, mode: WriteMode) -> StoreResult<()> {
        tokio::task::yield_now().await;
        let mut inner = self.inner.lock();
        inner.take_fault(StoreOp::Update)?;
        let call = inner.call_mut(id)?;

        match mode {
            WriteMode::Merge => patch.apply(&mut call.record),
            WriteMode::Replace => {
                let record = &mut call.record;
                record.offer = patch.offer;
                record.answer = patch.answer;
                record.status = patch.status.unwrap_or(record.status);
                record.answered_by = patch.answered_by;
                record.matched_at = patch.matched_at;
                record.expired_at = patch.expired_at;
            }
        }
        call.notify_record();
        Ok(())
    }

    async fn conditional_update(
        &self,
        id: &str,
        precondition: Precondition,
        patch: CallPatch,
    ) -> StoreResult<ClaimOutcome> {
        tokio::task::yield_now().await;
        let mut inner = self.inner.lock();
        inner.take_fault(StoreOp::ConditionalUpdate)?;
        let call = inner.call_mut(id)?;

        if !precondition.holds(&call.record) {
            debug!("memory store: {precondition:?} rejected on {id}");
            return Ok(ClaimOutcome::Rejected);
        }
        patch.apply(&mut call.record);
        call.notify_record();
        Ok(ClaimOutcome::Accepted)
    }

    async fn append(
        &self,
        id: &str,
        side: CandidateSide,
        candidate: IceCandidate,
    ) -> StoreResult<u64> {
        tokio::task::yield_now().await;
        let mut inner = self.inner.lock();
        inner.take_fault(StoreOp::Append)?;
        inner.next_seq += 1;
        let seq = inner.next_seq;
        let call = inner.call_mut(id)?;

        let entry = CandidateEntry {
            seq,
            candidate,
            added: chrono::Utc::now(),
        };
        call.candidates_mut(side).push(entry.clone());
        call.candidate_watchers.retain(|(watched, tx)| {
            *watched != side || tx.send(CandidateChange::Added(entry.clone())).is_ok()
        });
        Ok(seq)
    }

    async fn subscribe_record(&self, id: &str) -> StoreResult<Subscription<RecordChange>> {
        tokio::task::yield_now().await;
        let mut inner = self.inner.lock();
        inner.take_fault(StoreOp::Subscribe)?;
        let call = inner.call_mut(id)?;

        let (tx, rx) = mpsc::unbounded_channel();
        // получатель жив, отправка не может упасть
        let _ = tx.send(RecordChange::Snapshot(call.record.clone()));
        call.record_watchers.push(tx);
        Ok(Subscription::new(rx))
    }

    async fn subscribe_candidates(
        &self,
        id: &str,
        side: CandidateSide,
    ) -> StoreResult<Subscription<CandidateChange>> {
        tokio::task::yield_now().await;
        let mut inner = self.inner.lock();
        inner.take_fault(StoreOp::Subscribe)?;
        let call = inner.call_mut(id)?;

        let (tx, rx) = mpsc::unbounded_channel();
        for entry in call.candidates(side) {
            let _ = tx.send(CandidateChange::Added(entry.clone()));
        }
        call.candidate_watchers.push((side, tx));
        Ok(Subscription::new(rx))
    }

    async fn query(&self, query: &CallQuery) -> StoreResult<Vec<CallRecord>> {
        tokio::task::yield_now().await;
        let mut inner = self.inner.lock();
        inner.take_fault(StoreOp::Query)?;

        let mut hits: Vec<CallRecord> = inner
            .calls
            .values()
            .map(|c| &c.record)
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        hits.sort_by(|a, b| query.compare(a, b));
        if let Some(limit) = query.limit {
            hits.truncate(limit);
        }
        Ok(hits)
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        tokio::task::yield_now().await;
        let mut inner = self.inner.lock();
        inner.take_fault(StoreOp::Delete)?;

        let call = inner
            .calls
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        for tx in &call.record_watchers {
            let _ = tx.send(RecordChange::Removed(id.to_string()));
        }
        debug!("memory store: deleted call {id}");
        Ok(())
    }
}
