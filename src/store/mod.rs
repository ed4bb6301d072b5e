//! Persistent-store collaborator.
//!
//! The relational store is consumed through typed command/query operations.
//! Status writes are compare-and-set: they apply only when the persisted
//! status still equals the caller's expected value.

mod memory;

pub use memory::{MemoryStore, StoreOp};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::custody::{DocumentState, ProcessDocument};
use crate::error::Result;
use crate::ledger::{ExpenseItem, GdrRecord, TaxReportRow};
use crate::state_machine::{
    Accountability, AccountabilityStatus, ChangeRecord, Process, ProcessStatus,
    TramitHistoryEntry,
};

/// Pagination parameters for list queries.
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub offset: u64,
    pub limit: u64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

/// A paginated result set.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProcessSort {
    #[default]
    CreatedDesc,
    UpdatedAsc,
}

/// Filter for `list_processes`. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ProcessFilter {
    pub statuses: Vec<ProcessStatus>,
    pub requester_id: Option<Uuid>,
    pub updated_before: Option<DateTime<Utc>>,
    pub sort: ProcessSort,
}

impl ProcessFilter {
    pub fn matches(&self, process: &Process) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&process.status))
            && self.requester_id.is_none_or(|id| id == process.requester_id)
            && self.updated_before.is_none_or(|cutoff| process.updated_at < cutoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Change notification published by the store (best-effort).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub payload: serde_json::Value,
}

#[allow(async_fn_in_trait)]
pub trait Store: Send + Sync {
    async fn insert_process(&self, process: Process) -> Result<Process>;
    async fn get_process(&self, id: Uuid) -> Result<Process>;
    /// Hard removal, used only to compensate a creation that did not commit.
    async fn discard_process(&self, id: Uuid) -> Result<()>;
    async fn list_processes(&self, filter: &ProcessFilter, page: Pagination) -> Result<Page<Process>>;
    /// Updates every field except `status`.
    async fn update_process(&self, process: Process) -> Result<Process>;
    async fn update_process_status(
        &self,
        id: Uuid,
        expected: ProcessStatus,
        new: ProcessStatus,
    ) -> Result<Process>;
    /// Next protocol sequence number for the year.
    async fn next_sequence(&self, year: i32) -> Result<u32>;

    /// Fails with `AlreadyExists` if the process already has one.
    async fn insert_accountability(&self, accountability: Accountability) -> Result<Accountability>;
    async fn get_accountability(&self, id: Uuid) -> Result<Accountability>;
    async fn find_accountability(&self, process_id: Uuid) -> Result<Option<Accountability>>;
    /// Updates every field except `status`.
    async fn update_accountability(&self, accountability: Accountability) -> Result<Accountability>;
    /// Hard removal, used only to compensate a transition that did not commit.
    async fn discard_accountability(&self, id: Uuid) -> Result<()>;
    async fn update_accountability_status(
        &self,
        id: Uuid,
        expected: AccountabilityStatus,
        new: AccountabilityStatus,
    ) -> Result<Accountability>;

    /// Fails with `AlreadyExists` on a duplicate item id.
    async fn insert_item(&self, item: ExpenseItem) -> Result<ExpenseItem>;
    async fn delete_item(&self, id: Uuid) -> Result<()>;
    async fn list_items(&self, accountability_id: Uuid) -> Result<Vec<ExpenseItem>>;

    async fn insert_document(&self, document: ProcessDocument) -> Result<ProcessDocument>;
    async fn get_document(&self, id: Uuid) -> Result<ProcessDocument>;
    /// Writes the document only if its persisted state is still `expected`;
    /// otherwise fails with `ConcurrencyConflict`.
    async fn update_document(&self, document: ProcessDocument, expected: DocumentState) -> Result<ProcessDocument>;
    /// All documents of a process, tombstones included.
    async fn list_documents(&self, process_id: Uuid) -> Result<Vec<ProcessDocument>>;
    /// Hard removal, used only to compensate a transition that did not commit.
    async fn discard_document(&self, id: Uuid) -> Result<()>;

    async fn append_history(&self, entry: TramitHistoryEntry) -> Result<()>;
    async fn list_history(&self, process_id: Uuid) -> Result<Vec<TramitHistoryEntry>>;
    async fn append_change(&self, record: ChangeRecord) -> Result<()>;
    async fn list_changes(&self, process_id: Uuid) -> Result<Vec<ChangeRecord>>;

    /// Inserts the row unless one exists for the same item; returns whether it was inserted.
    async fn upsert_tax_row(&self, row: TaxReportRow) -> Result<bool>;
    async fn list_tax_rows(&self, accountability_id: Uuid) -> Result<Vec<TaxReportRow>>;

    async fn insert_gdr(&self, record: GdrRecord) -> Result<GdrRecord>;
    async fn get_gdr(&self, id: Uuid) -> Result<GdrRecord>;
    async fn update_gdr(&self, record: GdrRecord) -> Result<GdrRecord>;
    async fn list_gdrs(&self, accountability_id: Uuid) -> Result<Vec<GdrRecord>>;
    /// Hard removal, used only to compensate a transition that did not commit.
    async fn discard_gdr(&self, id: Uuid) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}
