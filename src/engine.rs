//! Process state machine orchestrator.
//!
//! Every status change goes through a compare-and-set write on the store.
//! Side effects and the history entry follow; if any of them fails, the
//! writes already made are compensated and the status is set back, so the
//! caller never observes a half-applied transition. Change records and
//! notifications come after the commit point and never fail a transition.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{self, AuditEntry, AuditQuery, AuditView};
use crate::collab::{Notification, Notifier, Recipient};
use crate::config::EngineSettings;
use crate::custody::{DocumentCustody, DocumentKind, ProcessDocument};
use crate::drafts::DraftCache;
use crate::error::{Result, SuprimentoError};
use crate::ledger::{AccountabilityLedger, Submission, submission_target};
use crate::optimistic::SnapshotCache;
use crate::reconciliation::{self, ReconciliationReport};
use crate::state_machine::{
    Accountability, AccountabilityStatus, Actor, ChangeAction, ChangeRecord, EntityRef,
    NewProcess, Process, ProcessStatus, Role, StatusRef, TramitHistoryEntry, TransitionTable,
};
use crate::store::{Pagination, ProcessFilter, ProcessSort, Store};

/// History note of the automatic routing after the manager signs the last minuta.
pub const AUTO_ROUTE_NOTE: &str =
    "Encaminhado automaticamente à SOSFU após assinatura de todas as minutas pelo gestor";

/// Writes made inside a transition before its commit point.
#[derive(Debug, Default)]
pub(crate) struct Undo {
    documents: Vec<Uuid>,
    gdrs: Vec<Uuid>,
    accountabilities: Vec<Uuid>,
    processes: Vec<Uuid>,
    process_snapshot: Option<Process>,
    accountability_snapshot: Option<Accountability>,
}

impl Undo {
    pub(crate) fn document(&mut self, id: Uuid) {
        self.documents.push(id);
    }

    pub(crate) fn gdr(&mut self, id: Uuid) {
        self.gdrs.push(id);
    }

    pub(crate) fn accountability(&mut self, id: Uuid) {
        self.accountabilities.push(id);
    }

    pub(crate) fn process(&mut self, id: Uuid) {
        self.processes.push(id);
    }

    pub(crate) fn restore_process(&mut self, snapshot: Process) {
        self.process_snapshot.get_or_insert(snapshot);
    }

    pub(crate) fn restore_accountability(&mut self, snapshot: Accountability) {
        self.accountability_snapshot.get_or_insert(snapshot);
    }

    async fn run<S: Store>(self, store: &S) {
        if let Some(snapshot) = self.process_snapshot
            && let Err(err) = store.update_process(snapshot).await
        {
            warn!(error = %err, "compensation: failed to restore process fields");
        }
        if let Some(snapshot) = self.accountability_snapshot
            && let Err(err) = store.update_accountability(snapshot).await
        {
            warn!(error = %err, "compensation: failed to restore accountability fields");
        }
        for id in self.documents.into_iter().rev() {
            if let Err(err) = store.discard_document(id).await {
                warn!(document_id = %id, error = %err, "compensation: failed to discard document");
            }
        }
        for id in self.gdrs {
            if let Err(err) = store.discard_gdr(id).await {
                warn!(gdr_id = %id, error = %err, "compensation: failed to discard GDR");
            }
        }
        for id in self.accountabilities {
            if let Err(err) = store.discard_accountability(id).await {
                warn!(accountability_id = %id, error = %err, "compensation: failed to discard accountability");
            }
        }
        for id in self.processes {
            if let Err(err) = store.discard_process(id).await {
                warn!(process_id = %id, error = %err, "compensation: failed to discard process");
            }
        }
    }
}

/// Archival data recorded on PAID → ARCHIVED.
#[derive(Debug, Clone)]
struct Archival {
    ledger_reference: String,
    write_off_date: NaiveDate,
}

/// Result of signing a document through the engine.
#[derive(Debug, Clone)]
pub struct SignResult {
    pub document: ProcessDocument,
    /// Set when the signature routed the process to SOSFU.
    pub advanced: Option<Process>,
}

/// A process with no movement for longer than the threshold.
#[derive(Debug, Clone, Serialize)]
pub struct StaleProcess {
    pub process: Process,
    pub days_stuck: i64,
}

fn default_description(from: StatusRef, to: StatusRef) -> String {
    format!("Tramitou de \"{}\" → \"{}\"", from.label(), to.label())
}

fn unauthorized(actor: &Actor, action: impl Into<String>) -> SuprimentoError {
    SuprimentoError::Unauthorized {
        role: actor.role.to_string(),
        action: action.into(),
    }
}

fn conflict(entity: String, expected: impl ToString, actual: impl ToString) -> SuprimentoError {
    SuprimentoError::ConcurrencyConflict {
        entity,
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}

fn is_forward(from: ProcessStatus, to: ProcessStatus) -> bool {
    matches!((from.rank(), to.rank()), (Some(a), Some(b)) if b > a)
}

fn is_submission(from: AccountabilityStatus, to: AccountabilityStatus) -> bool {
    from.is_editable()
        && matches!(
            to,
            AccountabilityStatus::WaitingManager | AccountabilityStatus::WaitingSosfu
        )
}

fn manager_recipient(process: &Process) -> Recipient {
    match &process.manager_email {
        Some(email) => Recipient::Email(email.clone()),
        None => Recipient::Role(Role::Manager),
    }
}

/// Who must act next after a process enters `to`.
pub fn process_notifications(process: &Process, to: ProcessStatus) -> Vec<Notification> {
    let requester = Recipient::User(process.requester_id);
    let (recipient, title, message) = match to {
        ProcessStatus::WaitingManager => (
            manager_recipient(process),
            "Solicitação aguardando atesto",
            "Uma solicitação de suprimento aguarda o seu atesto.",
        ),
        ProcessStatus::WaitingSosfuAnalysis => (
            Recipient::Role(Role::Sosfu),
            "Nova Solicitação SOSFU",
            "Solicitação atestada pelo gestor aguarda análise técnica.",
        ),
        ProcessStatus::WaitingSosfuExecution => (
            Recipient::Role(Role::Sefin),
            "Solicitação aguardando execução",
            "Solicitação analisada aguarda assinatura da portaria e execução orçamentária.",
        ),
        ProcessStatus::WaitingSosfuPayment => (
            Recipient::Role(Role::Sosfu),
            "Execução concluída",
            "Documentos de execução assinados; proceder ao pagamento.",
        ),
        ProcessStatus::WaitingSupridoConfirmation => (
            requester,
            "Pagamento realizado",
            "O valor foi creditado. Confirme o recebimento.",
        ),
        ProcessStatus::Paid => (
            Recipient::Role(Role::Sosfu),
            "Recebimento confirmado",
            "O suprido confirmou o recebimento dos recursos.",
        ),
        ProcessStatus::WaitingCorrection => (
            requester,
            "Solicitação devolvida",
            "Sua solicitação foi devolvida para correção.",
        ),
        ProcessStatus::Rejected => (
            requester,
            "Solicitação rejeitada",
            "Sua solicitação foi rejeitada.",
        ),
        ProcessStatus::Archived => (requester, "Processo arquivado", "O processo foi arquivado."),
        ProcessStatus::Pending => return Vec::new(),
    };
    vec![Notification {
        recipient,
        title: title.to_string(),
        message: message.to_string(),
        process_nup: process.nup.clone(),
    }]
}

pub fn accountability_notifications(process: &Process, to: AccountabilityStatus) -> Vec<Notification> {
    let requester = Recipient::User(process.requester_id);
    let (recipient, title, message) = match to {
        AccountabilityStatus::WaitingManager => (
            manager_recipient(process),
            "Prestação de contas aguardando atesto",
            "Uma prestação de contas aguarda o seu atesto.",
        ),
        AccountabilityStatus::WaitingSosfu => (
            Recipient::Role(Role::Sosfu),
            "Prestação de contas para análise",
            "Prestação de contas atestada aguarda análise.",
        ),
        AccountabilityStatus::Approved => (
            requester,
            "Prestação de contas aprovada",
            "Sua prestação de contas foi aprovada.",
        ),
        AccountabilityStatus::Correction => (
            requester,
            "Prestação de contas devolvida",
            "Sua prestação de contas foi devolvida para correção.",
        ),
        AccountabilityStatus::Late => (
            requester,
            "Prestação de contas em atraso",
            "O prazo da prestação de contas expirou.",
        ),
        AccountabilityStatus::Draft => return Vec::new(),
    };
    vec![Notification {
        recipient,
        title: title.to_string(),
        message: message.to_string(),
        process_nup: process.nup.clone(),
    }]
}

/// Drives processes and accountabilities through their lifecycles.
pub struct ProcessEngine<S: Store, N: Notifier> {
    store: S,
    notifier: N,
    settings: EngineSettings,
    drafts: Option<DraftCache>,
}

impl<S: Store, N: Notifier> ProcessEngine<S, N> {
    pub fn new(store: S, notifier: N, settings: EngineSettings) -> Self {
        Self {
            store,
            notifier,
            settings,
            drafts: None,
        }
    }

    /// Enables the local draft cache for ledger writes.
    pub fn with_drafts(mut self, cache: DraftCache) -> Self {
        self.drafts = Some(cache);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn drafts(&self) -> Option<&DraftCache> {
        self.drafts.as_ref()
    }

    pub fn custody(&self) -> DocumentCustody<'_, S> {
        DocumentCustody::new(&self.store)
    }

    pub fn ledger(&self) -> AccountabilityLedger<'_, S, N> {
        AccountabilityLedger::new(self)
    }

    /// Opens the accountability explicitly, before receipt confirmation creates it.
    pub async fn open_accountability(&self, process_id: Uuid, actor: &Actor) -> Result<Accountability> {
        self.ledger().open(process_id, actor).await
    }

    /// Appends a change record. Failures are logged, never propagated.
    pub async fn record_change(&self, record: ChangeRecord) {
        let action = record.action;
        if let Err(err) = self.store.append_change(record).await {
            warn!(?action, error = %err, "failed to record change");
        }
    }

    async fn dispatch(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            let title = notification.title.clone();
            if let Err(err) = self.notifier.notify(notification).await {
                warn!(%title, error = %err, "notification failed");
            }
        }
    }

    /// Creates a process with its cover and request documents. A manager
    /// requester self-attests and the process starts at WAITING_MANAGER.
    pub async fn submit_request(&self, requester: &Actor, mut input: NewProcess) -> Result<Process> {
        if !matches!(requester.role, Role::Requester | Role::Manager) {
            return Err(unauthorized(requester, "submit a request"));
        }
        if input.granted_value < rust_decimal::Decimal::ZERO {
            return Err(SuprimentoError::validation("granted value must not be negative"));
        }
        if input.beneficiary.trim().is_empty() {
            return Err(SuprimentoError::validation("beneficiary is required"));
        }
        if let (Some(start), Some(end)) = (input.event_start, input.event_end)
            && end < start
        {
            return Err(SuprimentoError::validation("event ends before it starts"));
        }

        let self_attest = requester.role == Role::Manager;
        if self_attest {
            input.manager_email.get_or_insert_with(|| requester.email.clone());
            if input.manager_name.trim().is_empty() {
                input.manager_name = requester.name.clone();
            }
        }
        let status = if self_attest {
            ProcessStatus::WaitingManager
        } else {
            ProcessStatus::Pending
        };

        let year = Utc::now().year();
        let sequence = self.store.next_sequence(year).await?;
        let nup = format!("TJPA-ADM-{year}/{sequence:06}");
        let process = self
            .store
            .insert_process(Process::new(nup, requester, input, status))
            .await?;

        let mut undo = Undo::default();
        undo.process(process.id);
        let outcome = self.creation_effects(&process, requester, self_attest, &mut undo).await;
        let outcome = match outcome {
            Ok(()) => {
                self.store
                    .append_history(TramitHistoryEntry::new(
                        process.id,
                        EntityRef::Process(process.id),
                        None,
                        StatusRef::Process(status),
                        requester,
                        "Solicitação criada",
                    ))
                    .await
            }
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            warn!(nup = %process.nup, error = %err, "request creation failed, compensating");
            undo.run(&self.store).await;
            return Err(err);
        }

        info!(nup = %process.nup, %status, value = %process.granted_value, "request submitted");
        self.record_change(
            ChangeRecord::new(process.id, ChangeAction::ProcessCreated, requester)
                .describe(format!("Solicitação {} criada", process.nup))
                .field("valor_concedido", None, Some(process.granted_value.to_string())),
        )
        .await;
        if !self_attest {
            self.dispatch(process_notifications(&process, status)).await;
        }
        Ok(process)
    }

    async fn creation_effects(&self, process: &Process, requester: &Actor, self_attest: bool, undo: &mut Undo) -> Result<()> {
        let custody = self.custody();
        let cover = custody
            .generate_signed(
                process.id,
                DocumentKind::Cover,
                DocumentKind::Cover.label(),
                &format!("{}\n{}\n{}", process.nup, process.unit, process.beneficiary),
                requester,
            )
            .await?;
        undo.document(cover.id);
        let request = custody
            .generate_signed(
                process.id,
                DocumentKind::Request,
                DocumentKind::Request.label(),
                &format!(
                    "Solicito a concessão de suprimento de fundos no valor de {}.\n{}",
                    process.granted_value, process.justification
                ),
                requester,
            )
            .await?;
        undo.document(request.id);
        if self_attest {
            let attestation = custody
                .generate_signed(
                    process.id,
                    DocumentKind::Attestation,
                    DocumentKind::Attestation.label(),
                    &format!("Atesto a necessidade da despesa do processo {}.", process.nup),
                    requester,
                )
                .await?;
            undo.document(attestation.id);
        }
        Ok(())
    }

    /// Applies a status change to either entity.
    pub async fn transition(
        &self,
        entity: EntityRef,
        from: StatusRef,
        to: StatusRef,
        actor: &Actor,
        note: Option<&str>,
    ) -> Result<StatusRef> {
        match (entity, from, to) {
            (EntityRef::Process(id), StatusRef::Process(from), StatusRef::Process(to)) => self
                .transition_process(id, from, to, actor, note)
                .await
                .map(|p| StatusRef::Process(p.status)),
            (
                EntityRef::Accountability(id),
                StatusRef::Accountability(from),
                StatusRef::Accountability(to),
            ) => self
                .transition_accountability(id, from, to, actor, note)
                .await
                .map(|a| StatusRef::Accountability(a.status)),
            _ => Err(SuprimentoError::validation("status kind does not match the entity")),
        }
    }

    pub async fn transition_process(
        &self,
        id: Uuid,
        from: ProcessStatus,
        to: ProcessStatus,
        actor: &Actor,
        note: Option<&str>,
    ) -> Result<Process> {
        let process = self.store.get_process(id).await?;
        if process.status != from {
            return Err(conflict(format!("process {}", process.nup), from, process.status));
        }
        if to == ProcessStatus::Archived {
            return Err(SuprimentoError::validation(
                "archiving requires a ledger reference and write-off date",
            ));
        }
        self.commit_process(process, to, actor, note, None).await
    }

    fn authorize_process(&self, process: &Process, to: ProcessStatus, actor: &Actor) -> Result<()> {
        let from = process.status;
        if !TransitionTable::process_edge_exists(from, to) {
            return Err(SuprimentoError::validation(format!(
                "no transition from {from} to {to}"
            )));
        }
        let owner = actor.id == process.requester_id;
        if owner && TransitionTable::allows_process(from, Role::Requester, to) {
            return Ok(());
        }
        if !TransitionTable::allows_process(from, actor.role, to) {
            return Err(unauthorized(actor, format!("move {from} to {to}")));
        }
        match actor.role {
            Role::Requester => Err(unauthorized(actor, "act on another requester's process")),
            Role::Manager if !process.is_assigned_to(actor) => {
                Err(unauthorized(actor, "attest a process assigned to another manager"))
            }
            _ => Ok(()),
        }
    }

    async fn check_gate(&self, process: &Process, to: ProcessStatus) -> Result<()> {
        if !(to.is_past_manager() && is_forward(process.status, to)) {
            return Ok(());
        }
        let drafts = self.custody().outstanding_drafts(process.id).await?;
        if drafts > 0 {
            return Err(SuprimentoError::validation(format!(
                "{drafts} minuta(s) awaiting signature on {}",
                process.nup
            )));
        }
        if to == ProcessStatus::Archived {
            let approved = self
                .store
                .find_accountability(process.id)
                .await?
                .is_some_and(|a| a.status == AccountabilityStatus::Approved);
            if !approved {
                return Err(SuprimentoError::validation(format!(
                    "{} cannot be archived before its accountability is approved",
                    process.nup
                )));
            }
        }
        Ok(())
    }

    async fn commit_process(
        &self,
        process: Process,
        to: ProcessStatus,
        actor: &Actor,
        note: Option<&str>,
        archival: Option<Archival>,
    ) -> Result<Process> {
        let from = process.status;
        self.authorize_process(&process, to, actor)?;
        self.check_gate(&process, to).await?;

        let committed = self.store.update_process_status(process.id, from, to).await?;
        let mut undo = Undo::default();
        let description = note
            .map(str::to_string)
            .unwrap_or_else(|| default_description(StatusRef::Process(from), StatusRef::Process(to)));

        let outcome = match self
            .process_effects(&committed, from, to, actor, archival.as_ref(), &mut undo)
            .await
        {
            Ok(()) => {
                self.store
                    .append_history(TramitHistoryEntry::new(
                        process.id,
                        EntityRef::Process(process.id),
                        Some(StatusRef::Process(from)),
                        StatusRef::Process(to),
                        actor,
                        description,
                    ))
                    .await
            }
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            warn!(nup = %process.nup, %from, %to, error = %err, "transition failed, compensating");
            undo.run(&self.store).await;
            if let Err(revert) = self.store.update_process_status(process.id, to, from).await {
                error!(nup = %process.nup, error = %revert, "failed to revert process status");
            }
            return Err(err);
        }

        info!(nup = %process.nup, %from, %to, actor = %actor.name, "process transitioned");
        self.after_process_commit(&committed, from, to, actor).await;
        self.store.get_process(process.id).await
    }

    async fn process_effects(
        &self,
        process: &Process,
        from: ProcessStatus,
        to: ProcessStatus,
        actor: &Actor,
        archival: Option<&Archival>,
        undo: &mut Undo,
    ) -> Result<()> {
        let custody = self.custody();
        match (from, to) {
            (ProcessStatus::WaitingManager, ProcessStatus::WaitingSosfuAnalysis) => {
                let existing = custody.find_kind(process.id, DocumentKind::Attestation).await?;
                let doc = custody
                    .generate_signed(
                        process.id,
                        DocumentKind::Attestation,
                        DocumentKind::Attestation.label(),
                        &format!(
                            "Atesto a necessidade da despesa do processo {}, no valor de {}.",
                            process.nup, process.granted_value
                        ),
                        actor,
                    )
                    .await?;
                if existing.is_none() {
                    undo.document(doc.id);
                }
            }
            (ProcessStatus::WaitingSosfuAnalysis, ProcessStatus::WaitingSosfuExecution) => {
                if custody.find_kind(process.id, DocumentKind::GrantAct).await?.is_none() {
                    let doc = custody
                        .create_draft(
                            process.id,
                            DocumentKind::GrantAct,
                            DocumentKind::GrantAct.label(),
                            &format!(
                                "Concede suprimento de fundos a {} no valor de {} (processo {}).",
                                process.beneficiary, process.granted_value, process.nup
                            ),
                            actor,
                        )
                        .await?;
                    undo.document(doc.id);
                }
            }
            (ProcessStatus::WaitingSupridoConfirmation, ProcessStatus::Paid) => {
                if self.store.find_accountability(process.id).await?.is_none() {
                    let opened = self
                        .store
                        .insert_accountability(Accountability::open(process, self.settings.deadline_days))
                        .await?;
                    undo.accountability(opened.id);
                    debug!(nup = %process.nup, deadline = %opened.deadline, "accountability created on receipt");
                }
            }
            (ProcessStatus::Paid, ProcessStatus::Archived) => {
                let Some(archival) = archival else {
                    return Err(SuprimentoError::validation("archival data missing"));
                };
                let current = self.store.get_process(process.id).await?;
                undo.restore_process(current.clone());
                self.store
                    .update_process(Process {
                        ledger_reference: Some(archival.ledger_reference.clone()),
                        write_off_date: Some(archival.write_off_date),
                        ..current
                    })
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn after_process_commit(&self, process: &Process, from: ProcessStatus, to: ProcessStatus, actor: &Actor) {
        let record = match to {
            ProcessStatus::WaitingSupridoConfirmation => Some(
                ChangeRecord::new(process.id, ChangeAction::PaymentConfirmed, actor)
                    .describe(format!("Pagamento de {} comunicado ao suprido", process.granted_value)),
            ),
            ProcessStatus::WaitingSosfuExecution => Some(
                ChangeRecord::new(process.id, ChangeAction::AnalysisCompleted, actor)
                    .describe("Análise técnica concluída"),
            ),
            ProcessStatus::Archived => Some(
                ChangeRecord::new(process.id, ChangeAction::Archived, actor).field(
                    "status",
                    Some(from.to_string()),
                    Some(to.to_string()),
                ),
            ),
            _ => None,
        };
        if let Some(record) = record {
            self.record_change(record).await;
        }
        self.dispatch(process_notifications(process, to)).await;
    }

    pub async fn transition_accountability(
        &self,
        id: Uuid,
        from: AccountabilityStatus,
        to: AccountabilityStatus,
        actor: &Actor,
        note: Option<&str>,
    ) -> Result<Accountability> {
        let accountability = self.store.get_accountability(id).await?;
        if accountability.status != from {
            return Err(conflict(format!("accountability {id}"), from, accountability.status));
        }
        let submission = if is_submission(from, to) {
            if to != submission_target(actor) {
                return Err(unauthorized(actor, format!("submit to {to}")));
            }
            let items = self.store.list_items(id).await?;
            Some(self.ledger().prepare_submission(&accountability, items, actor, None)?)
        } else {
            None
        };
        self.commit_accountability(accountability, to, actor, note, submission)
            .await
    }

    fn authorize_accountability(
        &self,
        process: &Process,
        accountability: &Accountability,
        to: AccountabilityStatus,
        actor: &Actor,
    ) -> Result<()> {
        let from = accountability.status;
        if !TransitionTable::accountability_edge_exists(from, to) {
            return Err(SuprimentoError::validation(format!(
                "no transition from {from} to {to}"
            )));
        }
        let owner = actor.id == accountability.requester_id;
        if owner && TransitionTable::allows_accountability(from, Role::Requester, to) {
            return Ok(());
        }
        if !TransitionTable::allows_accountability(from, actor.role, to) {
            return Err(unauthorized(actor, format!("move accountability {from} to {to}")));
        }
        match actor.role {
            Role::Requester => Err(unauthorized(actor, "act on another requester's accountability")),
            // Self-submission by a manager owner.
            Role::Manager if is_submission(from, to) => {
                if owner {
                    Ok(())
                } else {
                    Err(unauthorized(actor, "submit another requester's accountability"))
                }
            }
            Role::Manager if !process.is_assigned_to(actor) => {
                Err(unauthorized(actor, "attest an accountability assigned to another manager"))
            }
            _ => Ok(()),
        }
    }

    pub(crate) async fn commit_accountability(
        &self,
        accountability: Accountability,
        to: AccountabilityStatus,
        actor: &Actor,
        note: Option<&str>,
        submission: Option<Submission>,
    ) -> Result<Accountability> {
        let from = accountability.status;
        let process = self.store.get_process(accountability.process_id).await?;
        self.authorize_accountability(&process, &accountability, to, actor)?;
        if is_submission(from, to) && submission.is_none() {
            return Err(SuprimentoError::validation("submission was not validated"));
        }

        self.store
            .update_accountability_status(accountability.id, from, to)
            .await?;
        let mut undo = Undo::default();
        let description = note.map(str::to_string).unwrap_or_else(|| {
            default_description(StatusRef::Accountability(from), StatusRef::Accountability(to))
        });

        let outcome = match self
            .accountability_effects(&process, &accountability, to, actor, submission.as_ref(), &mut undo)
            .await
        {
            Ok(()) => {
                self.store
                    .append_history(TramitHistoryEntry::new(
                        process.id,
                        EntityRef::Accountability(accountability.id),
                        Some(StatusRef::Accountability(from)),
                        StatusRef::Accountability(to),
                        actor,
                        description,
                    ))
                    .await
            }
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            warn!(nup = %process.nup, %from, %to, error = %err, "accountability transition failed, compensating");
            undo.run(&self.store).await;
            if let Err(revert) = self
                .store
                .update_accountability_status(accountability.id, to, from)
                .await
            {
                error!(nup = %process.nup, error = %revert, "failed to revert accountability status");
            }
            return Err(err);
        }

        info!(nup = %process.nup, %from, %to, actor = %actor.name, "accountability transitioned");
        if let Some(gdr) = submission.as_ref().and_then(|s| s.gdr.as_ref()) {
            self.record_change(
                ChangeRecord::new(process.id, ChangeAction::GdrRegistered, actor)
                    .describe(format!("GDR {} registrada", gdr.number))
                    .field("saldo_devolvido", None, Some(gdr.value.to_string())),
            )
            .await;
        }
        if to == AccountabilityStatus::Approved {
            self.record_change(
                ChangeRecord::new(process.id, ChangeAction::AnalysisCompleted, actor)
                    .describe("Prestação de contas aprovada"),
            )
            .await;
        }
        self.dispatch(accountability_notifications(&process, to)).await;
        self.store.get_accountability(accountability.id).await
    }

    async fn accountability_effects(
        &self,
        process: &Process,
        accountability: &Accountability,
        to: AccountabilityStatus,
        actor: &Actor,
        submission: Option<&Submission>,
        undo: &mut Undo,
    ) -> Result<()> {
        let from = accountability.status;
        if let Some(submission) = submission {
            return self
                .ledger()
                .apply_submission(process, accountability, submission, actor, undo)
                .await;
        }
        let custody = self.custody();
        match (from, to) {
            (AccountabilityStatus::WaitingManager, AccountabilityStatus::WaitingSosfu) => {
                let doc = custody
                    .generate_signed(
                        process.id,
                        DocumentKind::Generic,
                        "Certidão de Atesto da Prestação de Contas",
                        &format!(
                            "Atesto a regular aplicação dos recursos do processo {}.",
                            process.nup
                        ),
                        actor,
                    )
                    .await?;
                undo.document(doc.id);
            }
            (AccountabilityStatus::WaitingSosfu, AccountabilityStatus::Approved) => {
                let existing = custody
                    .find_kind(process.id, DocumentKind::RegularityCertificate)
                    .await?;
                let doc = custody
                    .generate_signed(
                        process.id,
                        DocumentKind::RegularityCertificate,
                        DocumentKind::RegularityCertificate.label(),
                        &format!(
                            "Certifico a regularidade da prestação de contas do processo {}.",
                            process.nup
                        ),
                        actor,
                    )
                    .await?;
                if existing.is_none() {
                    undo.document(doc.id);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Signs a document; the manager's last signature routes the process to SOSFU.
    pub async fn sign_document(&self, document_id: Uuid, actor: &Actor) -> Result<SignResult> {
        let outcome = self.custody().sign(document_id, actor).await?;
        let mut advanced = None;
        if outcome.ready_to_advance {
            match self
                .transition_process(
                    outcome.document.process_id,
                    ProcessStatus::WaitingManager,
                    ProcessStatus::WaitingSosfuAnalysis,
                    actor,
                    Some(AUTO_ROUTE_NOTE),
                )
                .await
            {
                Ok(process) => advanced = Some(process),
                Err(err) => warn!(
                    process_id = %outcome.document.process_id,
                    error = %err,
                    "automatic routing after signature failed"
                ),
            }
        }
        Ok(SignResult {
            document: outcome.document,
            advanced,
        })
    }

    /// SOSFU declares the payment executed.
    pub async fn confirm_payment(&self, process_id: Uuid, actor: &Actor) -> Result<Process> {
        self.transition_process(
            process_id,
            ProcessStatus::WaitingSosfuPayment,
            ProcessStatus::WaitingSupridoConfirmation,
            actor,
            None,
        )
        .await
    }

    /// The requester confirms the funds arrived; opens the accountability if needed.
    pub async fn confirm_receipt(&self, process_id: Uuid, actor: &Actor) -> Result<Process> {
        self.transition_process(
            process_id,
            ProcessStatus::WaitingSupridoConfirmation,
            ProcessStatus::Paid,
            actor,
            Some("Recebimento dos recursos confirmado pelo suprido"),
        )
        .await
    }

    pub async fn archive(
        &self,
        process_id: Uuid,
        actor: &Actor,
        ledger_reference: &str,
        write_off_date: NaiveDate,
    ) -> Result<Process> {
        let ledger_reference = ledger_reference.trim();
        if ledger_reference.is_empty() {
            return Err(SuprimentoError::validation("ledger reference is required"));
        }
        let process = self.store.get_process(process_id).await?;
        if process.status != ProcessStatus::Paid {
            return Err(conflict(format!("process {}", process.nup), ProcessStatus::Paid, process.status));
        }
        let note = format!("Arquivado com baixa contábil {ledger_reference}");
        self.commit_process(
            process,
            ProcessStatus::Archived,
            actor,
            Some(&note),
            Some(Archival {
                ledger_reference: ledger_reference.to_string(),
                write_off_date,
            }),
        )
        .await
    }

    /// Processes in `statuses` with no movement for longer than the threshold, oldest first.
    pub async fn stale_processes(&self, statuses: &[ProcessStatus], now: DateTime<Utc>) -> Result<Vec<StaleProcess>> {
        let filter = ProcessFilter {
            statuses: statuses.to_vec(),
            updated_before: Some(now - chrono::Duration::days(self.settings.stale_threshold_days)),
            sort: ProcessSort::UpdatedAsc,
            ..Default::default()
        };
        let mut stale = Vec::new();
        let mut page = Pagination::default();
        loop {
            let batch = self.store.list_processes(&filter, page).await?;
            let fetched = batch.items.len() as u64;
            stale.extend(batch.items.into_iter().map(|process| StaleProcess {
                days_stuck: (now - process.updated_at).num_days(),
                process,
            }));
            page.offset += fetched;
            if fetched == 0 || page.offset >= batch.total {
                break;
            }
        }
        Ok(stale)
    }

    /// Unified timeline of a process, newest first.
    pub async fn audit_trail(&self, process_id: Uuid) -> Result<Vec<AuditEntry>> {
        let changes = self.store.list_changes(process_id).await?;
        let history = self.store.list_history(process_id).await?;
        let documents = self.store.list_documents(process_id).await?;
        Ok(audit::merge(&changes, &history, &documents))
    }

    pub async fn audit_view(&self, process_id: Uuid, query: &AuditQuery) -> Result<AuditView> {
        let entries = self.audit_trail(process_id).await?;
        Ok(audit::view(&entries, query, self.settings.audit_page_size))
    }

    pub async fn reconcile(&self, process_id: Uuid) -> Result<ReconciliationReport> {
        let process = self.store.get_process(process_id).await?;
        let documents = self.custody().documents(process_id).await?;
        Ok(reconciliation::reconcile(
            process.granted_value,
            &documents,
            self.settings.balance_epsilon,
        ))
    }

    /// Renders the target status in `view` before the store confirms it and
    /// restores the previous snapshot when the transition fails.
    pub async fn transition_optimistic(
        &self,
        view: &mut SnapshotCache<Uuid, Process>,
        id: Uuid,
        to: ProcessStatus,
        actor: &Actor,
        note: Option<&str>,
    ) -> Result<Process> {
        let observed = match view.get(&id) {
            Some(process) => process.clone(),
            None => {
                let fetched = self.store.get_process(id).await?;
                view.put(id, fetched.clone());
                fetched
            }
        };
        view.apply(
            id,
            Process {
                status: to,
                ..observed.clone()
            },
        )?;

        match self.transition_process(id, observed.status, to, actor, note).await {
            Ok(process) => {
                view.put(id, process.clone());
                Ok(process)
            }
            Err(err) => {
                view.rollback(&id);
                if err.requires_refetch()
                    && let Ok(fresh) = self.store.get_process(id).await
                {
                    view.put(id, fresh);
                }
                Err(err)
            }
        }
    }
}
