use std::collections::HashMap;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, broadcast};
use uuid::Uuid;

use super::{ChangeEvent, ChangeKind, Page, Pagination, ProcessFilter, ProcessSort, Store};
use crate::custody::{DocumentState, ProcessDocument};
use crate::error::{Result, SuprimentoError};
use crate::ledger::{ExpenseItem, GdrRecord, TaxReportRow};
use crate::state_machine::{
    Accountability, AccountabilityStatus, ChangeRecord, Process, ProcessStatus,
    TramitHistoryEntry,
};

/// Store operations that can be made to fail once, for rollback tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    InsertProcess,
    UpdateProcess,
    UpdateProcessStatus,
    UpdateAccountabilityStatus,
    AppendHistory,
    InsertDocument,
    InsertAccountability,
    GetAccountability,
    ListItems,
    InsertItem,
    DeleteItem,
    UpdateDocument,
    InsertGdr,
    AppendChange,
}

#[derive(Default)]
struct Tables {
    processes: HashMap<Uuid, Process>,
    accountabilities: HashMap<Uuid, Accountability>,
    items: Vec<ExpenseItem>,
    documents: Vec<ProcessDocument>,
    history: Vec<TramitHistoryEntry>,
    changes: Vec<ChangeRecord>,
    tax_rows: Vec<TaxReportRow>,
    gdrs: Vec<GdrRecord>,
    sequences: HashMap<i32, u32>,
}

/// In-memory store used by the demo and by tests.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    events: broadcast::Sender<ChangeEvent>,
    fail_points: std::sync::Mutex<Vec<StoreOp>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            tables: Mutex::new(Tables::default()),
            events,
            fail_points: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Makes the next call of `op` fail with a network error.
    pub fn fail_next(&self, op: StoreOp) {
        if let Ok(mut points) = self.fail_points.lock() {
            points.push(op);
        }
    }

    fn check(&self, op: StoreOp) -> Result<()> {
        let mut points = match self.fail_points.lock() {
            Ok(p) => p,
            Err(_) => return Ok(()),
        };
        if let Some(pos) = points.iter().position(|p| *p == op) {
            points.remove(pos);
            return Err(SuprimentoError::NetworkFailure(format!("store unreachable during {op:?}")));
        }
        Ok(())
    }

    fn publish(&self, table: &str, kind: ChangeKind, payload: &impl Serialize) {
        let payload = serde_json::to_value(payload).unwrap_or(serde_json::Value::Null);
        // No subscribers is fine.
        let _ = self.events.send(ChangeEvent {
            table: table.to_string(),
            kind,
            payload,
        });
    }
}

impl Store for MemoryStore {
    async fn insert_process(&self, process: Process) -> Result<Process> {
        self.check(StoreOp::InsertProcess)?;
        let mut tables = self.tables.lock().await;
        if tables.processes.contains_key(&process.id) {
            return Err(SuprimentoError::AlreadyExists {
                entity: "process".into(),
            });
        }
        tables.processes.insert(process.id, process.clone());
        drop(tables);
        self.publish("solicitations", ChangeKind::Insert, &process);
        Ok(process)
    }

    async fn get_process(&self, id: Uuid) -> Result<Process> {
        let tables = self.tables.lock().await;
        tables
            .processes
            .get(&id)
            .cloned()
            .ok_or_else(|| SuprimentoError::not_found("process", id))
    }

    async fn discard_process(&self, id: Uuid) -> Result<()> {
        let mut tables = self.tables.lock().await;
        match tables.processes.remove(&id) {
            Some(removed) => {
                drop(tables);
                self.publish("solicitations", ChangeKind::Delete, &removed);
                Ok(())
            }
            None => Err(SuprimentoError::not_found("process", id)),
        }
    }

    async fn list_processes(&self, filter: &ProcessFilter, page: Pagination) -> Result<Page<Process>> {
        let tables = self.tables.lock().await;
        let mut matching: Vec<Process> = tables
            .processes
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        match filter.sort {
            ProcessSort::CreatedDesc => matching.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
            ProcessSort::UpdatedAsc => matching.sort_by(|a, b| a.updated_at.cmp(&b.updated_at)),
        }
        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect();
        Ok(Page {
            items,
            total,
            offset: page.offset,
            limit: page.limit,
        })
    }

    async fn update_process(&self, process: Process) -> Result<Process> {
        self.check(StoreOp::UpdateProcess)?;
        let mut tables = self.tables.lock().await;
        let current = tables
            .processes
            .get_mut(&process.id)
            .ok_or_else(|| SuprimentoError::not_found("process", process.id))?;
        let status = current.status;
        *current = Process {
            status,
            updated_at: Utc::now(),
            ..process
        };
        let updated = current.clone();
        drop(tables);
        self.publish("solicitations", ChangeKind::Update, &updated);
        Ok(updated)
    }

    async fn update_process_status(
        &self,
        id: Uuid,
        expected: ProcessStatus,
        new: ProcessStatus,
    ) -> Result<Process> {
        self.check(StoreOp::UpdateProcessStatus)?;
        let mut tables = self.tables.lock().await;
        let current = tables
            .processes
            .get_mut(&id)
            .ok_or_else(|| SuprimentoError::not_found("process", id))?;
        if current.status != expected {
            return Err(SuprimentoError::ConcurrencyConflict {
                entity: format!("process {id}"),
                expected: expected.to_string(),
                actual: current.status.to_string(),
            });
        }
        current.status = new;
        current.updated_at = Utc::now();
        let updated = current.clone();
        drop(tables);
        self.publish("solicitations", ChangeKind::Update, &updated);
        Ok(updated)
    }

    async fn next_sequence(&self, year: i32) -> Result<u32> {
        let mut tables = self.tables.lock().await;
        let seq = tables.sequences.entry(year).or_insert(0);
        *seq += 1;
        Ok(*seq)
    }

    async fn insert_accountability(&self, accountability: Accountability) -> Result<Accountability> {
        self.check(StoreOp::InsertAccountability)?;
        let mut tables = self.tables.lock().await;
        if tables
            .accountabilities
            .values()
            .any(|a| a.process_id == accountability.process_id)
        {
            return Err(SuprimentoError::AlreadyExists {
                entity: "accountability".into(),
            });
        }
        tables
            .accountabilities
            .insert(accountability.id, accountability.clone());
        drop(tables);
        self.publish("accountabilities", ChangeKind::Insert, &accountability);
        Ok(accountability)
    }

    async fn get_accountability(&self, id: Uuid) -> Result<Accountability> {
        self.check(StoreOp::GetAccountability)?;
        let tables = self.tables.lock().await;
        tables
            .accountabilities
            .get(&id)
            .cloned()
            .ok_or_else(|| SuprimentoError::not_found("accountability", id))
    }

    async fn find_accountability(&self, process_id: Uuid) -> Result<Option<Accountability>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .accountabilities
            .values()
            .find(|a| a.process_id == process_id)
            .cloned())
    }

    async fn update_accountability(&self, accountability: Accountability) -> Result<Accountability> {
        let mut tables = self.tables.lock().await;
        let current = tables
            .accountabilities
            .get_mut(&accountability.id)
            .ok_or_else(|| SuprimentoError::not_found("accountability", accountability.id))?;
        let status = current.status;
        *current = Accountability {
            status,
            ..accountability
        };
        Ok(current.clone())
    }

    async fn discard_accountability(&self, id: Uuid) -> Result<()> {
        let mut tables = self.tables.lock().await;
        match tables.accountabilities.remove(&id) {
            Some(removed) => {
                drop(tables);
                self.publish("accountabilities", ChangeKind::Delete, &removed);
                Ok(())
            }
            None => Err(SuprimentoError::not_found("accountability", id)),
        }
    }

    async fn update_accountability_status(
        &self,
        id: Uuid,
        expected: AccountabilityStatus,
        new: AccountabilityStatus,
    ) -> Result<Accountability> {
        self.check(StoreOp::UpdateAccountabilityStatus)?;
        let mut tables = self.tables.lock().await;
        let current = tables
            .accountabilities
            .get_mut(&id)
            .ok_or_else(|| SuprimentoError::not_found("accountability", id))?;
        if current.status != expected {
            return Err(SuprimentoError::ConcurrencyConflict {
                entity: format!("accountability {id}"),
                expected: expected.to_string(),
                actual: current.status.to_string(),
            });
        }
        current.status = new;
        let updated = current.clone();
        drop(tables);
        self.publish("accountabilities", ChangeKind::Update, &updated);
        Ok(updated)
    }

    async fn insert_item(&self, item: ExpenseItem) -> Result<ExpenseItem> {
        self.check(StoreOp::InsertItem)?;
        let mut tables = self.tables.lock().await;
        if tables.items.iter().any(|i| i.id == item.id) {
            return Err(SuprimentoError::AlreadyExists {
                entity: "expense item".into(),
            });
        }
        tables.items.push(item.clone());
        Ok(item)
    }

    async fn delete_item(&self, id: Uuid) -> Result<()> {
        self.check(StoreOp::DeleteItem)?;
        let mut tables = self.tables.lock().await;
        let before = tables.items.len();
        tables.items.retain(|i| i.id != id);
        if tables.items.len() == before {
            return Err(SuprimentoError::not_found("expense item", id));
        }
        Ok(())
    }

    async fn list_items(&self, accountability_id: Uuid) -> Result<Vec<ExpenseItem>> {
        self.check(StoreOp::ListItems)?;
        let tables = self.tables.lock().await;
        Ok(tables
            .items
            .iter()
            .filter(|i| i.accountability_id == accountability_id)
            .cloned()
            .collect())
    }

    async fn insert_document(&self, document: ProcessDocument) -> Result<ProcessDocument> {
        self.check(StoreOp::InsertDocument)?;
        let mut tables = self.tables.lock().await;
        tables.documents.push(document.clone());
        drop(tables);
        self.publish("process_documents", ChangeKind::Insert, &document);
        Ok(document)
    }

    async fn get_document(&self, id: Uuid) -> Result<ProcessDocument> {
        let tables = self.tables.lock().await;
        tables
            .documents
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or_else(|| SuprimentoError::not_found("document", id))
    }

    async fn update_document(&self, document: ProcessDocument, expected: DocumentState) -> Result<ProcessDocument> {
        self.check(StoreOp::UpdateDocument)?;
        let mut tables = self.tables.lock().await;
        let slot = tables
            .documents
            .iter_mut()
            .find(|d| d.id == document.id)
            .ok_or_else(|| SuprimentoError::not_found("document", document.id))?;
        if slot.state != expected {
            return Err(SuprimentoError::ConcurrencyConflict {
                entity: format!("document {}", document.id),
                expected: format!("{expected:?}"),
                actual: format!("{:?}", slot.state),
            });
        }
        *slot = document.clone();
        drop(tables);
        self.publish("process_documents", ChangeKind::Update, &document);
        Ok(document)
    }

    async fn list_documents(&self, process_id: Uuid) -> Result<Vec<ProcessDocument>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .documents
            .iter()
            .filter(|d| d.process_id == process_id)
            .cloned()
            .collect())
    }

    async fn discard_document(&self, id: Uuid) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let before = tables.documents.len();
        tables.documents.retain(|d| d.id != id);
        if tables.documents.len() == before {
            return Err(SuprimentoError::not_found("document", id));
        }
        Ok(())
    }

    async fn append_history(&self, entry: TramitHistoryEntry) -> Result<()> {
        self.check(StoreOp::AppendHistory)?;
        let mut tables = self.tables.lock().await;
        tables.history.push(entry.clone());
        drop(tables);
        self.publish("historico_tramitacao", ChangeKind::Insert, &entry);
        Ok(())
    }

    async fn list_history(&self, process_id: Uuid) -> Result<Vec<TramitHistoryEntry>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .history
            .iter()
            .filter(|h| h.process_id == process_id)
            .cloned()
            .collect())
    }

    async fn append_change(&self, record: ChangeRecord) -> Result<()> {
        self.check(StoreOp::AppendChange)?;
        let mut tables = self.tables.lock().await;
        tables.changes.push(record);
        Ok(())
    }

    async fn list_changes(&self, process_id: Uuid) -> Result<Vec<ChangeRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .changes
            .iter()
            .filter(|c| c.process_id == process_id)
            .cloned()
            .collect())
    }

    async fn upsert_tax_row(&self, row: TaxReportRow) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        if tables.tax_rows.iter().any(|r| r.item_id == row.item_id) {
            return Ok(false);
        }
        tables.tax_rows.push(row);
        Ok(true)
    }

    async fn list_tax_rows(&self, accountability_id: Uuid) -> Result<Vec<TaxReportRow>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .tax_rows
            .iter()
            .filter(|r| r.accountability_id == accountability_id)
            .cloned()
            .collect())
    }

    async fn insert_gdr(&self, record: GdrRecord) -> Result<GdrRecord> {
        self.check(StoreOp::InsertGdr)?;
        let mut tables = self.tables.lock().await;
        tables.gdrs.push(record.clone());
        Ok(record)
    }

    async fn get_gdr(&self, id: Uuid) -> Result<GdrRecord> {
        let tables = self.tables.lock().await;
        tables
            .gdrs
            .iter()
            .find(|g| g.id == id)
            .cloned()
            .ok_or_else(|| SuprimentoError::not_found("gdr", id))
    }

    async fn update_gdr(&self, record: GdrRecord) -> Result<GdrRecord> {
        let mut tables = self.tables.lock().await;
        let slot = tables
            .gdrs
            .iter_mut()
            .find(|g| g.id == record.id)
            .ok_or_else(|| SuprimentoError::not_found("gdr", record.id))?;
        *slot = record.clone();
        Ok(record)
    }

    async fn list_gdrs(&self, accountability_id: Uuid) -> Result<Vec<GdrRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .gdrs
            .iter()
            .filter(|g| g.accountability_id == accountability_id)
            .cloned()
            .collect())
    }

    async fn discard_gdr(&self, id: Uuid) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let before = tables.gdrs.len();
        tables.gdrs.retain(|g| g.id != id);
        if tables.gdrs.len() == before {
            return Err(SuprimentoError::not_found("gdr", id));
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }
}
