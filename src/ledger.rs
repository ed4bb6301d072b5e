//! Accountability ledger: expense items, withholdings, residual-balance
//! returns (GDR) and the tax-reporting projection.
//!
//! Totals are always recomputed from the items; no running counter is kept.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collab::{Notifier, StorageRef};
use crate::custody::DocumentKind;
use crate::drafts::{DraftEntry, SyncStatus};
use crate::engine::{ProcessEngine, Undo};
use crate::error::{Result, SuprimentoError};
use crate::state_machine::{
    Accountability, AccountabilityStatus, Actor, ChangeAction, ChangeRecord, Process, ProcessStatus,
    Role,
};
use crate::store::Store;

/// INSS withheld from an individual provider.
pub const INSS_RATE: Decimal = dec!(0.11);
/// ISS withheld from an individual provider.
pub const ISS_RATE: Decimal = dec!(0.05);
/// Employer-side INSS, reported but never withheld.
pub const EMPLOYER_INSS_RATE: Decimal = dec!(0.20);

/// Rounds to cents, midpoint away from zero.
pub fn cents(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Elemento de despesa permitido em suprimento de fundos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExpenseElement {
    /// 3.3.90.30 material de consumo
    #[serde(rename = "3.3.90.30")]
    Material,
    /// 3.3.90.33 passagens e locomoção
    #[serde(rename = "3.3.90.33")]
    Transport,
    /// 3.3.90.36 serviços de pessoa física
    #[serde(rename = "3.3.90.36")]
    IndividualServiceProvider,
    /// 3.3.90.39 serviços de pessoa jurídica
    #[serde(rename = "3.3.90.39")]
    CompanyServices,
}

impl ExpenseElement {
    pub const ALL: [ExpenseElement; 4] = [
        ExpenseElement::Material,
        ExpenseElement::Transport,
        ExpenseElement::IndividualServiceProvider,
        ExpenseElement::CompanyServices,
    ];

    pub fn code(self) -> &'static str {
        match self {
            ExpenseElement::Material => "3.3.90.30",
            ExpenseElement::Transport => "3.3.90.33",
            ExpenseElement::IndividualServiceProvider => "3.3.90.36",
            ExpenseElement::CompanyServices => "3.3.90.39",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ExpenseElement::Material => "Material de Consumo",
            ExpenseElement::Transport => "Passagens e Locomoção",
            ExpenseElement::IndividualServiceProvider => "Serviços de Terceiros - Pessoa Física",
            ExpenseElement::CompanyServices => "Serviços de Terceiros - Pessoa Jurídica",
        }
    }

    pub fn parse(code: &str) -> Result<Self> {
        let code = code.trim();
        Self::ALL
            .into_iter()
            .find(|e| e.code() == code)
            .ok_or_else(|| SuprimentoError::validation(format!("expense element {code:?} not allowed")))
    }

    pub fn requires_withholding(self) -> bool {
        self == ExpenseElement::IndividualServiceProvider
    }
}

/// Withholding figures of an individual-provider item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withholding {
    pub base: Decimal,
    pub inss_withheld: Decimal,
    pub iss_withheld: Decimal,
    /// Reporting only; not subtracted from `net`.
    pub employer_inss: Decimal,
    pub net: Decimal,
}

impl Withholding {
    pub fn compute(gross: Decimal) -> Self {
        let inss_withheld = cents(gross * INSS_RATE);
        let iss_withheld = cents(gross * ISS_RATE);
        Self {
            base: gross,
            inss_withheld,
            iss_withheld,
            employer_inss: cents(gross * EMPLOYER_INSS_RATE),
            net: gross - inss_withheld - iss_withheld,
        }
    }

    pub fn total_withheld(&self) -> Decimal {
        self.inss_withheld + self.iss_withheld
    }
}

/// Form input for a new expense item, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpenseDraft {
    pub date: Option<NaiveDate>,
    pub description: String,
    pub supplier: String,
    pub doc_type: String,
    pub doc_number: String,
    pub value: Option<Decimal>,
    pub element: String,
    pub receipt: Option<StorageRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpenseItem {
    pub id: Uuid,
    pub accountability_id: Uuid,
    pub date: NaiveDate,
    pub description: String,
    pub supplier: String,
    pub doc_type: String,
    pub doc_number: String,
    /// Gross value.
    pub value: Decimal,
    pub element: ExpenseElement,
    pub receipt: Option<StorageRef>,
    pub withholding: Option<Withholding>,
    pub created_at: DateTime<Utc>,
}

impl ExpenseItem {
    /// Validates the form and derives the withholding fields.
    pub fn from_draft(accountability_id: Uuid, draft: ExpenseDraft) -> Result<Self> {
        let date = draft
            .date
            .ok_or_else(|| SuprimentoError::validation("expense date is required"))?;
        let value = draft
            .value
            .ok_or_else(|| SuprimentoError::validation("expense value is required"))?;
        if value <= Decimal::ZERO {
            return Err(SuprimentoError::validation("expense value must be positive"));
        }
        let supplier = draft.supplier.trim().to_string();
        if supplier.is_empty() {
            return Err(SuprimentoError::validation("supplier is required"));
        }
        let element = ExpenseElement::parse(&draft.element)?;
        if element.requires_withholding() && draft.receipt.is_none() {
            return Err(SuprimentoError::MissingRequiredReceipt(format!(
                "{} item from {supplier}",
                element.code()
            )));
        }
        let value = cents(value);
        Ok(Self {
            id: Uuid::new_v4(),
            accountability_id,
            date,
            description: draft.description.trim().to_string(),
            supplier,
            doc_type: draft.doc_type.trim().to_string(),
            doc_number: draft.doc_number.trim().to_string(),
            value,
            element,
            receipt: draft.receipt,
            withholding: element.requires_withholding().then(|| Withholding::compute(value)),
            created_at: Utc::now(),
        })
    }

    pub fn net(&self) -> Decimal {
        self.withholding.as_ref().map_or(self.value, |w| w.net)
    }
}

/// Totals recomputed from the item list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerTotals {
    pub granted: Decimal,
    pub spent: Decimal,
    pub withheld: Decimal,
    pub net_paid: Decimal,
    pub employer_charges: Decimal,
    /// granted − spent
    pub balance: Decimal,
}

impl LedgerTotals {
    pub fn compute(granted: Decimal, items: &[ExpenseItem]) -> Self {
        let spent: Decimal = items.iter().map(|i| i.value).sum();
        let withheld: Decimal = items
            .iter()
            .filter_map(|i| i.withholding.as_ref())
            .map(Withholding::total_withheld)
            .sum();
        let employer_charges: Decimal = items
            .iter()
            .filter_map(|i| i.withholding.as_ref())
            .map(|w| w.employer_inss)
            .sum();
        Self {
            granted,
            spent,
            withheld,
            net_paid: spent - withheld,
            employer_charges,
            balance: granted - spent,
        }
    }

    pub fn requires_gdr(&self, epsilon: Decimal) -> bool {
        self.balance > epsilon
    }
}

/// One row of the tax-reporting ledger, keyed by item id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxReportRow {
    pub item_id: Uuid,
    pub accountability_id: Uuid,
    pub process_id: Uuid,
    pub supplier: String,
    pub service_date: NaiveDate,
    pub gross: Decimal,
    pub inss_retained: Decimal,
    pub iss_retained: Decimal,
    pub employer_inss: Decimal,
    /// INSS retained + ISS retained + employer INSS.
    pub total_due: Decimal,
}

impl TaxReportRow {
    pub fn project(item: &ExpenseItem, process_id: Uuid) -> Option<Self> {
        let w = item.withholding.as_ref()?;
        Some(Self {
            item_id: item.id,
            accountability_id: item.accountability_id,
            process_id,
            supplier: item.supplier.clone(),
            service_date: item.date,
            gross: item.value,
            inss_retained: w.inss_withheld,
            iss_retained: w.iss_withheld,
            employer_inss: w.employer_inss,
            total_due: w.inss_withheld + w.iss_withheld + w.employer_inss,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GdrStatus {
    Pending,
    Confirmed,
}

/// GDR data supplied by the requester when residual funds remain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GdrReturn {
    pub number: String,
    pub paid_on: NaiveDate,
    pub proof: Option<StorageRef>,
}

/// Guia de Devolução de Recurso registrada numa submissão.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GdrRecord {
    pub id: Uuid,
    pub accountability_id: Uuid,
    pub process_id: Uuid,
    pub number: String,
    pub value: Decimal,
    pub paid_on: NaiveDate,
    pub proof: StorageRef,
    pub status: GdrStatus,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

/// Validated submission, ready to be committed by the engine.
#[derive(Debug, Clone)]
pub struct Submission {
    pub totals: LedgerTotals,
    pub items: Vec<ExpenseItem>,
    pub gdr: Option<GdrRecord>,
}

/// Store writes made by [`AccountabilityLedger::resume_sync`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub pushed: usize,
    pub removed: usize,
}

/// Operations over one process's accountability.
pub struct AccountabilityLedger<'a, S: Store, N: Notifier> {
    engine: &'a ProcessEngine<S, N>,
}

impl<'a, S: Store, N: Notifier> AccountabilityLedger<'a, S, N> {
    pub fn new(engine: &'a ProcessEngine<S, N>) -> Self {
        Self { engine }
    }

    fn store(&self) -> &S {
        self.engine.store()
    }

    fn ensure_owner(accountability: &Accountability, actor: &Actor, action: &str) -> Result<()> {
        if actor.id != accountability.requester_id {
            return Err(SuprimentoError::Unauthorized {
                role: actor.role.to_string(),
                action: action.to_string(),
            });
        }
        Ok(())
    }

    fn ensure_editable(accountability: &Accountability) -> Result<()> {
        if !accountability.status.is_editable() {
            return Err(SuprimentoError::validation(format!(
                "accountability is {} and no longer editable",
                accountability.status.label()
            )));
        }
        Ok(())
    }

    /// Opens the accountability of a paid (or paying) process.
    pub async fn open(&self, process_id: Uuid, actor: &Actor) -> Result<Accountability> {
        let process = self.store().get_process(process_id).await?;
        if actor.id != process.requester_id {
            return Err(SuprimentoError::Unauthorized {
                role: actor.role.to_string(),
                action: "open accountability".into(),
            });
        }
        if !matches!(
            process.status,
            ProcessStatus::WaitingSupridoConfirmation | ProcessStatus::Paid
        ) {
            return Err(SuprimentoError::validation(format!(
                "process {} has not been paid",
                process.nup
            )));
        }
        if self.store().find_accountability(process_id).await?.is_some() {
            return Err(SuprimentoError::AlreadyExists {
                entity: format!("accountability for {}", process.nup),
            });
        }
        let accountability = Accountability::open(&process, self.engine.settings().deadline_days);
        let accountability = self.store().insert_accountability(accountability).await?;
        info!(nup = %process.nup, deadline = %accountability.deadline, "accountability opened");
        Ok(accountability)
    }

    pub async fn items(&self, accountability_id: Uuid) -> Result<Vec<ExpenseItem>> {
        self.store().list_items(accountability_id).await
    }

    pub async fn totals(&self, accountability_id: Uuid) -> Result<LedgerTotals> {
        let accountability = self.store().get_accountability(accountability_id).await?;
        let items = self.store().list_items(accountability_id).await?;
        Ok(LedgerTotals::compute(accountability.granted_value, &items))
    }

    async fn cached_entry(&self, accountability_id: Uuid) -> Option<DraftEntry> {
        let cache = self.engine.drafts()?;
        match cache.latest(accountability_id).await {
            Ok(entry) => entry,
            Err(err) => {
                warn!(%accountability_id, error = %err, "unreadable draft snapshot");
                None
            }
        }
    }

    /// Header used to validate an edit. Falls back to the one cached with the
    /// local draft while the store is unreachable.
    async fn editable(&self, accountability_id: Uuid, actor: &Actor, action: &str) -> Result<Accountability> {
        let accountability = match self.store().get_accountability(accountability_id).await {
            Ok(accountability) => accountability,
            Err(err @ SuprimentoError::NetworkFailure(_)) => {
                let cached = self
                    .cached_entry(accountability_id)
                    .await
                    .and_then(|entry| entry.accountability);
                let Some(cached) = cached else {
                    return Err(err);
                };
                debug!(%accountability_id, "store unreachable, using cached header");
                cached
            }
            Err(err) => return Err(err),
        };
        Self::ensure_owner(&accountability, actor, action)?;
        Self::ensure_editable(&accountability)?;
        Ok(accountability)
    }

    /// Items being edited: the unsynced local draft when there is one,
    /// otherwise the store's. The flag reports an unsynced draft.
    async fn working_items(&self, accountability_id: Uuid) -> Result<(Vec<ExpenseItem>, bool)> {
        if let Some(entry) = self.cached_entry(accountability_id).await {
            return Ok((entry.items, true));
        }
        Ok((self.store().list_items(accountability_id).await?, false))
    }

    /// Saves the snapshot locally, then runs the store write. The draft is
    /// cleared only once the store holds the whole snapshot.
    async fn write_through(
        &self,
        accountability: &Accountability,
        snapshot: Vec<ExpenseItem>,
        backlog: bool,
        write: impl Future<Output = Result<()>>,
    ) -> Result<()> {
        let Some(cache) = self.engine.drafts() else {
            return write.await;
        };
        cache.save_for(accountability, snapshot, Vec::new());
        if let Err(err) = write.await {
            cache.set_status(SyncStatus::Error);
            warn!(accountability_id = %accountability.id, error = %err, "store write failed, draft kept locally");
            return Err(err);
        }
        if backlog {
            if let Err(err) = self.resume_sync(accountability.id).await {
                warn!(accountability_id = %accountability.id, error = %err, "earlier offline edits still pending");
            }
        } else if let Err(err) = cache.mark_synced(accountability.id).await {
            warn!(accountability_id = %accountability.id, error = %err, "failed to clear synced draft");
        }
        Ok(())
    }

    pub async fn add_item(&self, accountability_id: Uuid, draft: ExpenseDraft, actor: &Actor) -> Result<ExpenseItem> {
        let accountability = self.editable(accountability_id, actor, "add expense item").await?;
        let item = ExpenseItem::from_draft(accountability_id, draft)?;

        let (mut snapshot, backlog) = self.working_items(accountability_id).await?;
        snapshot.push(item.clone());
        let write = async { self.store().insert_item(item.clone()).await.map(|_| ()) };
        self.write_through(&accountability, snapshot, backlog, write).await?;

        self.engine
            .record_change(
                ChangeRecord::new(accountability.process_id, ChangeAction::ItemAdded, actor)
                    .describe(format!("{} - {} ({})", item.supplier, item.value, item.element.code())),
            )
            .await;
        debug!(item_id = %item.id, value = %item.value, "expense item added");
        Ok(item)
    }

    pub async fn remove_item(&self, accountability_id: Uuid, item_id: Uuid, actor: &Actor) -> Result<()> {
        let accountability = self.editable(accountability_id, actor, "remove expense item").await?;
        let (items, backlog) = self.working_items(accountability_id).await?;
        let Some(removed) = items.iter().find(|i| i.id == item_id).cloned() else {
            return Err(SuprimentoError::not_found("expense item", item_id));
        };
        let snapshot: Vec<ExpenseItem> = items.into_iter().filter(|i| i.id != item_id).collect();
        // An item added offline may never have reached the store.
        let write = async {
            match self.store().delete_item(item_id).await {
                Ok(()) | Err(SuprimentoError::NotFound { .. }) => Ok(()),
                Err(err) => Err(err),
            }
        };
        self.write_through(&accountability, snapshot, backlog, write).await?;

        self.engine
            .record_change(
                ChangeRecord::new(accountability.process_id, ChangeAction::ItemRemoved, actor)
                    .describe(format!("{} - {}", removed.supplier, removed.value)),
            )
            .await;
        Ok(())
    }

    /// Brings the store in line with the local draft: pushes the items it has
    /// not seen, deletes the ones removed offline, then clears the draft.
    pub async fn resume_sync(&self, accountability_id: Uuid) -> Result<SyncReport> {
        let Some(cache) = self.engine.drafts() else {
            return Ok(SyncReport::default());
        };
        let Some(entry) = cache.latest(accountability_id).await? else {
            return Ok(SyncReport::default());
        };
        cache.set_status(SyncStatus::Syncing);
        let report = match self.apply_draft(&entry).await {
            Ok(report) => report,
            Err(err) => {
                cache.set_status(SyncStatus::Error);
                return Err(err);
            }
        };
        cache.mark_synced(accountability_id).await?;
        info!(%accountability_id, pushed = report.pushed, removed = report.removed, "draft synced");
        Ok(report)
    }

    async fn apply_draft(&self, entry: &DraftEntry) -> Result<SyncReport> {
        let accountability = self.store().get_accountability(entry.id).await?;
        Self::ensure_editable(&accountability)?;
        let stored = self.store().list_items(entry.id).await?;

        let mut report = SyncReport::default();
        for item in entry.items.iter().filter(|i| !stored.iter().any(|s| s.id == i.id)) {
            match self.store().insert_item(item.clone()).await {
                Ok(_) => report.pushed += 1,
                Err(SuprimentoError::AlreadyExists { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        for item in stored.iter().filter(|s| !entry.items.iter().any(|i| i.id == s.id)) {
            match self.store().delete_item(item.id).await {
                Ok(()) => report.removed += 1,
                Err(SuprimentoError::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(report)
    }

    /// Validates a submission and builds the GDR record when one is owed.
    pub(crate) fn prepare_submission(
        &self,
        accountability: &Accountability,
        items: Vec<ExpenseItem>,
        actor: &Actor,
        gdr: Option<GdrReturn>,
    ) -> Result<Submission> {
        Self::ensure_owner(accountability, actor, "submit accountability")?;
        Self::ensure_editable(accountability)?;
        if items.is_empty() {
            return Err(SuprimentoError::validation("accountability has no expense items"));
        }
        let totals = LedgerTotals::compute(accountability.granted_value, &items);
        if totals.balance < Decimal::ZERO {
            return Err(SuprimentoError::validation(format!(
                "spent {} exceeds granted {}",
                totals.spent, totals.granted
            )));
        }

        let gdr = if totals.requires_gdr(self.engine.settings().balance_epsilon) {
            let Some(input) = gdr else {
                return Err(SuprimentoError::ResidualBalanceRequiresGdr {
                    balance: totals.balance,
                });
            };
            let number = input.number.trim().to_string();
            if number.is_empty() {
                return Err(SuprimentoError::validation("GDR number is required"));
            }
            let Some(proof) = input.proof else {
                return Err(SuprimentoError::MissingRequiredReceipt("GDR payment proof".into()));
            };
            Some(GdrRecord {
                id: Uuid::new_v4(),
                accountability_id: accountability.id,
                process_id: accountability.process_id,
                number,
                value: totals.balance,
                paid_on: input.paid_on,
                proof,
                status: GdrStatus::Pending,
                created_at: Utc::now(),
                confirmed_at: None,
            })
        } else {
            if gdr.is_some() {
                debug!(balance = %totals.balance, "no residual balance, GDR ignored");
            }
            None
        };

        Ok(Submission { totals, items, gdr })
    }

    /// Submits the accountability. A manager submitting their own goes
    /// straight to SOSFU with a self-signed attestation.
    pub async fn submit(&self, accountability_id: Uuid, actor: &Actor, gdr: Option<GdrReturn>) -> Result<Accountability> {
        if self.cached_entry(accountability_id).await.is_some() {
            self.resume_sync(accountability_id).await?;
        }
        let accountability = self.store().get_accountability(accountability_id).await?;
        let items = self.store().list_items(accountability_id).await?;
        let submission = self.prepare_submission(&accountability, items, actor, gdr)?;
        let target = submission_target(actor);
        self.engine
            .commit_accountability(accountability, target, actor, None, Some(submission))
            .await
    }

    /// Writes run inside the engine's compensated section of a submission.
    pub(crate) async fn apply_submission(
        &self,
        process: &Process,
        accountability: &Accountability,
        submission: &Submission,
        actor: &Actor,
        undo: &mut Undo,
    ) -> Result<()> {
        let totals = &submission.totals;
        let returned_balance = submission.gdr.as_ref().map_or(Decimal::ZERO, |g| g.value);
        undo.restore_accountability(accountability.clone());
        self.store()
            .update_accountability(Accountability {
                total_spent: totals.spent,
                total_withheld: totals.withheld,
                returned_balance,
                submitted_at: Some(Utc::now()),
                ..accountability.clone()
            })
            .await?;

        if let Some(gdr) = &submission.gdr {
            let record = self.store().insert_gdr(gdr.clone()).await?;
            undo.gdr(record.id);
        }

        let mut projected = 0;
        for row in submission.items.iter().filter_map(|i| TaxReportRow::project(i, process.id)) {
            if self.store().upsert_tax_row(row).await? {
                projected += 1;
            }
        }
        debug!(projected, "tax rows projected");

        let custody = self.engine.custody();
        let sheet = custody
            .generate_signed(
                process.id,
                DocumentKind::Generic,
                "Balancete de Prestação de Contas",
                &balance_sheet(process, totals, returned_balance),
                actor,
            )
            .await?;
        undo.document(sheet.id);

        if actor.role == Role::Manager {
            let attestation = custody
                .generate_signed(
                    process.id,
                    DocumentKind::Generic,
                    "Certidão de Atesto da Prestação de Contas",
                    &format!(
                        "Atesto a regular aplicação dos recursos do processo {}, no valor de {}.",
                        process.nup, totals.spent
                    ),
                    actor,
                )
                .await?;
            undo.document(attestation.id);
        }
        Ok(())
    }

    pub async fn attest(&self, accountability_id: Uuid, actor: &Actor) -> Result<Accountability> {
        self.engine
            .transition_accountability(
                accountability_id,
                AccountabilityStatus::WaitingManager,
                AccountabilityStatus::WaitingSosfu,
                actor,
                None,
            )
            .await
    }

    pub async fn approve(&self, accountability_id: Uuid, actor: &Actor) -> Result<Accountability> {
        self.engine
            .transition_accountability(
                accountability_id,
                AccountabilityStatus::WaitingSosfu,
                AccountabilityStatus::Approved,
                actor,
                None,
            )
            .await
    }

    /// Returns the accountability to the requester from whichever review step holds it.
    pub async fn return_for_correction(&self, accountability_id: Uuid, actor: &Actor, note: &str) -> Result<Accountability> {
        let accountability = self.store().get_accountability(accountability_id).await?;
        self.engine
            .transition_accountability(
                accountability_id,
                accountability.status,
                AccountabilityStatus::Correction,
                actor,
                Some(note),
            )
            .await
    }

    /// Moves an editable accountability past its deadline to LATE. Returns
    /// `None` when the deadline has not passed.
    pub async fn mark_overdue(&self, accountability_id: Uuid, now: DateTime<Utc>) -> Result<Option<Accountability>> {
        let accountability = self.store().get_accountability(accountability_id).await?;
        if !accountability.is_overdue(now) {
            return Ok(None);
        }
        let updated = self
            .engine
            .transition_accountability(
                accountability_id,
                accountability.status,
                AccountabilityStatus::Late,
                &Actor::system(),
                Some("Prazo de prestação de contas expirado"),
            )
            .await?;
        Ok(Some(updated))
    }

    pub async fn tax_rows(&self, accountability_id: Uuid) -> Result<Vec<TaxReportRow>> {
        self.store().list_tax_rows(accountability_id).await
    }

    pub async fn gdrs(&self, accountability_id: Uuid) -> Result<Vec<GdrRecord>> {
        self.store().list_gdrs(accountability_id).await
    }

    /// SOSFU confirms the treasury credited the returned balance.
    pub async fn confirm_gdr(&self, gdr_id: Uuid, actor: &Actor) -> Result<GdrRecord> {
        if actor.role != Role::Sosfu {
            return Err(SuprimentoError::Unauthorized {
                role: actor.role.to_string(),
                action: "confirm GDR".into(),
            });
        }
        let mut record = self.store().get_gdr(gdr_id).await?;
        if record.status == GdrStatus::Confirmed {
            return Err(SuprimentoError::validation(format!("GDR {} already confirmed", record.number)));
        }
        record.status = GdrStatus::Confirmed;
        record.confirmed_at = Some(Utc::now());
        let record = self.store().update_gdr(record).await?;
        self.engine
            .record_change(
                ChangeRecord::new(record.process_id, ChangeAction::GdrRegistered, actor)
                    .describe(format!("GDR {} confirmada", record.number))
                    .field("status", Some("PENDING".into()), Some("CONFIRMED".into())),
            )
            .await;
        Ok(record)
    }
}

/// Target status of a submission by `actor`.
pub(crate) fn submission_target(actor: &Actor) -> AccountabilityStatus {
    if actor.role == Role::Manager {
        AccountabilityStatus::WaitingSosfu
    } else {
        AccountabilityStatus::WaitingManager
    }
}

fn balance_sheet(process: &Process, totals: &LedgerTotals, returned: Decimal) -> String {
    format!(
        "BALANCETE - {nup}\n\
         Suprido: {beneficiary}\n\
         Valor concedido: {granted}\n\
         Valor aplicado: {spent}\n\
         Retenções: {withheld}\n\
         Valor devolvido (GDR): {returned}\n\
         Saldo: {balance}",
        nup = process.nup,
        beneficiary = process.beneficiary,
        granted = totals.granted,
        spent = totals.spent,
        withheld = totals.withheld,
        balance = totals.balance - returned,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::MemoryNotifier;
    use crate::config::EngineSettings;
    use crate::drafts::DraftCache;
    use crate::state_machine::{NewProcess, ProcessStatus};
    use crate::store::{MemoryStore, StoreOp};
    use std::time::Duration;
    use tempfile::TempDir;

    fn receipt() -> StorageRef {
        StorageRef {
            path: "processes/x/recibo.jpg".into(),
            url: "file:///tmp/recibo.jpg".into(),
        }
    }

    fn draft(value: Decimal, element: &str) -> ExpenseDraft {
        ExpenseDraft {
            date: NaiveDate::from_ymd_opt(2026, 4, 2),
            description: "Despesa".into(),
            supplier: "Fornecedor".into(),
            doc_type: "NF".into(),
            doc_number: "1".into(),
            value: Some(value),
            element: element.into(),
            receipt: None,
        }
    }

    async fn paid_accountability(
        engine: &ProcessEngine<MemoryStore, MemoryNotifier>,
        requester: &Actor,
    ) -> Accountability {
        let process = Process::new(
            "TJPA-ADM-2026/000010".into(),
            requester,
            NewProcess {
                beneficiary: requester.name.clone(),
                unit: "Comarca de Santarém".into(),
                granted_value: dec!(1000.00),
                justification: "Pronto pagamento".into(),
                manager_name: "Carlos Lima".into(),
                manager_email: Some("carlos@tjpa.jus.br".into()),
                event_start: None,
                event_end: None,
            },
            ProcessStatus::Paid,
        );
        let process = engine.store().insert_process(process).await.unwrap();
        engine.ledger().open(process.id, requester).await.unwrap()
    }

    fn engine() -> ProcessEngine<MemoryStore, MemoryNotifier> {
        ProcessEngine::new(MemoryStore::new(), MemoryNotifier::new(), EngineSettings::default())
    }

    #[test]
    fn withholding_uses_statutory_rates() {
        let w = Withholding::compute(dec!(1000.00));
        assert_eq!(w.inss_withheld, dec!(110.00));
        assert_eq!(w.iss_withheld, dec!(50.00));
        assert_eq!(w.employer_inss, dec!(200.00));
        assert_eq!(w.net, dec!(840.00));
    }

    #[test]
    fn withholding_rounds_half_away_from_zero() {
        let w = Withholding::compute(dec!(0.50));
        assert_eq!(w.inss_withheld, dec!(0.06));
        assert_eq!(w.iss_withheld, dec!(0.03));
        assert_eq!(w.net, dec!(0.41));
    }

    #[test]
    fn element_codes_are_closed() {
        assert_eq!(ExpenseElement::parse("3.3.90.36").unwrap(), ExpenseElement::IndividualServiceProvider);
        assert!(ExpenseElement::parse("3.3.90.14").is_err());
    }

    #[test]
    fn draft_validation() {
        let id = Uuid::new_v4();
        let mut missing_date = draft(dec!(10), "3.3.90.30");
        missing_date.date = None;
        assert!(matches!(
            ExpenseItem::from_draft(id, missing_date),
            Err(SuprimentoError::ValidationFailed(_))
        ));

        let mut blank_supplier = draft(dec!(10), "3.3.90.30");
        blank_supplier.supplier = "  ".into();
        assert!(ExpenseItem::from_draft(id, blank_supplier).is_err());

        assert!(matches!(
            ExpenseItem::from_draft(id, draft(dec!(300), "3.3.90.36")),
            Err(SuprimentoError::MissingRequiredReceipt(_))
        ));

        let mut with_receipt = draft(dec!(300), "3.3.90.36");
        with_receipt.receipt = Some(receipt());
        let item = ExpenseItem::from_draft(id, with_receipt).unwrap();
        assert_eq!(item.net(), dec!(252.00));
    }

    #[test]
    fn totals_recompute_from_items() {
        let id = Uuid::new_v4();
        let mut pf = draft(dec!(200), "3.3.90.36");
        pf.receipt = Some(receipt());
        let items = vec![
            ExpenseItem::from_draft(id, draft(dec!(300), "3.3.90.30")).unwrap(),
            ExpenseItem::from_draft(id, pf).unwrap(),
        ];
        let totals = LedgerTotals::compute(dec!(1000), &items);
        assert_eq!(totals.spent, dec!(500));
        assert_eq!(totals.withheld, dec!(32.00));
        assert_eq!(totals.employer_charges, dec!(40.00));
        assert_eq!(totals.balance, dec!(500));
        assert!(totals.requires_gdr(dec!(0.01)));
        assert!(!LedgerTotals::compute(dec!(500.01), &items).requires_gdr(dec!(0.01)));
    }

    #[tokio::test]
    async fn add_and_remove_items_only_by_owner_while_editable() {
        let engine = engine();
        let requester = Actor::new("Ana Souza", "ana@tjpa.jus.br", Role::Requester);
        let acc = paid_accountability(&engine, &requester).await;
        let ledger = engine.ledger();

        let stranger = Actor::new("Outro", "outro@tjpa.jus.br", Role::Requester);
        assert!(matches!(
            ledger.add_item(acc.id, draft(dec!(10), "3.3.90.30"), &stranger).await,
            Err(SuprimentoError::Unauthorized { .. })
        ));

        let item = ledger.add_item(acc.id, draft(dec!(400), "3.3.90.30"), &requester).await.unwrap();
        assert_eq!(ledger.totals(acc.id).await.unwrap().balance, dec!(600.00));
        ledger.remove_item(acc.id, item.id, &requester).await.unwrap();
        assert_eq!(ledger.totals(acc.id).await.unwrap().balance, dec!(1000.00));

        let changes = engine.store().list_changes(acc.process_id).await.unwrap();
        assert_eq!(changes.len(), 2);
    }

    #[tokio::test]
    async fn submit_rejects_empty_and_overspent() {
        let engine = engine();
        let requester = Actor::new("Ana Souza", "ana@tjpa.jus.br", Role::Requester);
        let acc = paid_accountability(&engine, &requester).await;
        let ledger = engine.ledger();

        assert!(matches!(
            ledger.submit(acc.id, &requester, None).await,
            Err(SuprimentoError::ValidationFailed(_))
        ));
        ledger.add_item(acc.id, draft(dec!(1000.50), "3.3.90.30"), &requester).await.unwrap();
        assert!(matches!(
            ledger.submit(acc.id, &requester, None).await,
            Err(SuprimentoError::ValidationFailed(_))
        ));
    }

    #[tokio::test]
    async fn gdr_requires_number_and_proof_and_is_confirmed_by_sosfu() {
        let engine = engine();
        let requester = Actor::new("Ana Souza", "ana@tjpa.jus.br", Role::Requester);
        let acc = paid_accountability(&engine, &requester).await;
        let ledger = engine.ledger();
        ledger.add_item(acc.id, draft(dec!(700.00), "3.3.90.30"), &requester).await.unwrap();

        let no_proof = GdrReturn {
            number: "GDR-1".into(),
            paid_on: NaiveDate::from_ymd_opt(2026, 4, 5).unwrap(),
            proof: None,
        };
        assert!(matches!(
            ledger.submit(acc.id, &requester, Some(no_proof)).await,
            Err(SuprimentoError::MissingRequiredReceipt(_))
        ));

        let gdr = GdrReturn {
            number: "GDR-1".into(),
            paid_on: NaiveDate::from_ymd_opt(2026, 4, 5).unwrap(),
            proof: Some(receipt()),
        };
        let submitted = ledger.submit(acc.id, &requester, Some(gdr)).await.unwrap();
        assert_eq!(submitted.returned_balance, dec!(300.00));

        let records = ledger.gdrs(acc.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, GdrStatus::Pending);

        assert!(matches!(
            ledger.confirm_gdr(records[0].id, &requester).await,
            Err(SuprimentoError::Unauthorized { .. })
        ));
        let sosfu = Actor::new("SOSFU", "sosfu@tjpa.jus.br", Role::Sosfu);
        let confirmed = ledger.confirm_gdr(records[0].id, &sosfu).await.unwrap();
        assert_eq!(confirmed.status, GdrStatus::Confirmed);
        assert!(ledger.confirm_gdr(records[0].id, &sosfu).await.is_err());
    }

    #[tokio::test]
    async fn tax_rows_are_projected_once_per_item() {
        let engine = engine();
        let requester = Actor::new("Ana Souza", "ana@tjpa.jus.br", Role::Requester);
        let acc = paid_accountability(&engine, &requester).await;
        let ledger = engine.ledger();
        let mut pf = draft(dec!(1000.00), "3.3.90.36");
        pf.receipt = Some(receipt());
        let item = ledger.add_item(acc.id, pf, &requester).await.unwrap();

        engine.store().fail_next(StoreOp::AppendHistory);
        assert!(ledger.submit(acc.id, &requester, None).await.is_err());
        ledger.submit(acc.id, &requester, None).await.unwrap();

        let rows = ledger.tax_rows(acc.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].item_id, item.id);
        assert_eq!(rows[0].total_due, dec!(360.00));
    }

    #[tokio::test]
    async fn store_failure_keeps_draft_and_resume_pushes_it() {
        let tmp = TempDir::new().unwrap();
        let cache = DraftCache::open(tmp.path(), Duration::from_millis(0)).await.unwrap();
        let engine = engine().with_drafts(cache.clone());
        let requester = Actor::new("Ana Souza", "ana@tjpa.jus.br", Role::Requester);
        let acc = paid_accountability(&engine, &requester).await;
        let ledger = engine.ledger();

        engine.store().fail_next(StoreOp::InsertItem);
        let offline = ledger.add_item(acc.id, draft(dec!(250.00), "3.3.90.30"), &requester).await;
        assert!(matches!(offline, Err(SuprimentoError::NetworkFailure(_))));
        assert_eq!(cache.status(), SyncStatus::Error);
        cache.flush_all().await;
        assert_eq!(cache.list_unsynced().await.unwrap().len(), 1);

        assert_eq!(ledger.resume_sync(acc.id).await.unwrap().pushed, 1);
        assert_eq!(ledger.items(acc.id).await.unwrap().len(), 1);
        assert!(cache.list_unsynced().await.unwrap().is_empty());
        assert_eq!(ledger.resume_sync(acc.id).await.unwrap(), SyncReport::default());
    }

    #[tokio::test]
    async fn online_add_after_offline_add_keeps_both_items() {
        let tmp = TempDir::new().unwrap();
        let cache = DraftCache::open(tmp.path(), Duration::from_secs(2)).await.unwrap();
        let engine = engine().with_drafts(cache.clone());
        let requester = Actor::new("Ana Souza", "ana@tjpa.jus.br", Role::Requester);
        let acc = paid_accountability(&engine, &requester).await;
        let ledger = engine.ledger();

        engine.store().fail_next(StoreOp::InsertItem);
        assert!(ledger.add_item(acc.id, draft(dec!(250.00), "3.3.90.30"), &requester).await.is_err());
        assert_eq!(cache.pending_count().await.unwrap(), 1);

        ledger.add_item(acc.id, draft(dec!(100.00), "3.3.90.30"), &requester).await.unwrap();
        assert_eq!(cache.pending_count().await.unwrap(), 0);

        let mut values: Vec<Decimal> = ledger.items(acc.id).await.unwrap().iter().map(|i| i.value).collect();
        values.sort();
        assert_eq!(values, vec![dec!(100.00), dec!(250.00)]);
        assert_eq!(ledger.resume_sync(acc.id).await.unwrap(), SyncReport::default());
    }

    #[tokio::test]
    async fn offline_removal_is_applied_on_resume() {
        let tmp = TempDir::new().unwrap();
        let cache = DraftCache::open(tmp.path(), Duration::from_secs(2)).await.unwrap();
        let engine = engine().with_drafts(cache.clone());
        let requester = Actor::new("Ana Souza", "ana@tjpa.jus.br", Role::Requester);
        let acc = paid_accountability(&engine, &requester).await;
        let ledger = engine.ledger();
        let item = ledger.add_item(acc.id, draft(dec!(400.00), "3.3.90.30"), &requester).await.unwrap();

        engine.store().fail_next(StoreOp::DeleteItem);
        let offline = ledger.remove_item(acc.id, item.id, &requester).await;
        assert!(matches!(offline, Err(SuprimentoError::NetworkFailure(_))));
        assert_eq!(ledger.items(acc.id).await.unwrap().len(), 1);
        cache.flush_all().await;

        let report = ledger.resume_sync(acc.id).await.unwrap();
        assert_eq!(report, SyncReport { pushed: 0, removed: 1 });
        assert!(ledger.items(acc.id).await.unwrap().is_empty());
        assert!(cache.list_unsynced().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn edits_are_cached_while_store_is_unreachable() {
        let tmp = TempDir::new().unwrap();
        let cache = DraftCache::open(tmp.path(), Duration::from_secs(2)).await.unwrap();
        let engine = engine().with_drafts(cache.clone());
        let requester = Actor::new("Ana Souza", "ana@tjpa.jus.br", Role::Requester);
        let acc = paid_accountability(&engine, &requester).await;
        let ledger = engine.ledger();
        let kept = ledger.add_item(acc.id, draft(dec!(300.00), "3.3.90.30"), &requester).await.unwrap();

        engine.store().fail_next(StoreOp::InsertItem);
        let first = ledger.add_item(acc.id, draft(dec!(120.00), "3.3.90.30"), &requester).await;
        assert!(first.is_err());

        // Store down for every step: header and items come from the draft.
        let store = engine.store();
        store.fail_next(StoreOp::GetAccountability);
        store.fail_next(StoreOp::InsertItem);
        let second = ledger.add_item(acc.id, draft(dec!(80.00), "3.3.90.30"), &requester).await;
        assert!(matches!(second, Err(SuprimentoError::NetworkFailure(_))));
        store.fail_next(StoreOp::GetAccountability);
        store.fail_next(StoreOp::DeleteItem);
        assert!(ledger.remove_item(acc.id, kept.id, &requester).await.is_err());

        let draft_items = cache.latest(acc.id).await.unwrap().unwrap().items;
        let mut values: Vec<Decimal> = draft_items.iter().map(|i| i.value).collect();
        values.sort();
        assert_eq!(values, vec![dec!(80.00), dec!(120.00)]);

        let report = ledger.resume_sync(acc.id).await.unwrap();
        assert_eq!(report, SyncReport { pushed: 2, removed: 1 });
        assert_eq!(ledger.totals(acc.id).await.unwrap().spent, dec!(200.00));
    }

    #[tokio::test]
    async fn unreachable_store_without_draft_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let cache = DraftCache::open(tmp.path(), Duration::from_secs(2)).await.unwrap();
        let engine = engine().with_drafts(cache.clone());
        let requester = Actor::new("Ana Souza", "ana@tjpa.jus.br", Role::Requester);
        let acc = paid_accountability(&engine, &requester).await;

        engine.store().fail_next(StoreOp::ListItems);
        let result = engine.ledger().add_item(acc.id, draft(dec!(50.00), "3.3.90.30"), &requester).await;
        assert!(matches!(result, Err(SuprimentoError::NetworkFailure(_))));
        assert_eq!(cache.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn submit_pushes_pending_draft_first() {
        let tmp = TempDir::new().unwrap();
        let cache = DraftCache::open(tmp.path(), Duration::from_secs(2)).await.unwrap();
        let engine = engine().with_drafts(cache.clone());
        let requester = Actor::new("Ana Souza", "ana@tjpa.jus.br", Role::Requester);
        let acc = paid_accountability(&engine, &requester).await;
        let ledger = engine.ledger();

        engine.store().fail_next(StoreOp::InsertItem);
        assert!(ledger.add_item(acc.id, draft(dec!(1000.00), "3.3.90.30"), &requester).await.is_err());

        let submitted = ledger.submit(acc.id, &requester, None).await.unwrap();
        assert_eq!(submitted.status, AccountabilityStatus::WaitingManager);
        assert_eq!(submitted.total_spent, dec!(1000.00));
        assert_eq!(cache.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mark_overdue_moves_to_late_and_stays_editable() {
        let engine = engine();
        let requester = Actor::new("Ana Souza", "ana@tjpa.jus.br", Role::Requester);
        let acc = paid_accountability(&engine, &requester).await;
        let ledger = engine.ledger();

        assert!(ledger.mark_overdue(acc.id, Utc::now()).await.unwrap().is_none());
        let late = ledger
            .mark_overdue(acc.id, acc.deadline + chrono::Duration::days(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(late.status, AccountabilityStatus::Late);
        ledger.add_item(acc.id, draft(dec!(1000.00), "3.3.90.30"), &requester).await.unwrap();
        let submitted = ledger.submit(acc.id, &requester, None).await.unwrap();
        assert_eq!(submitted.status, AccountabilityStatus::WaitingManager);
    }

    #[tokio::test]
    async fn open_twice_is_rejected() {
        let engine = engine();
        let requester = Actor::new("Ana Souza", "ana@tjpa.jus.br", Role::Requester);
        let acc = paid_accountability(&engine, &requester).await;
        let again = engine.ledger().open(acc.process_id, &requester).await;
        assert!(matches!(again, Err(SuprimentoError::AlreadyExists { .. })));
    }
}
