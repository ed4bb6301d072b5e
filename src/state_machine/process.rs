use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::{AccountabilityStatus, ProcessStatus, Role};

/// Someone acting on a process, as resolved by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub role: Role,
}

impl Actor {
    pub fn new(name: &str, email: &str, role: Role) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            email: email.to_string(),
            role,
        }
    }

    /// Actor used for automatic routines.
    pub fn system() -> Self {
        Self {
            id: Uuid::nil(),
            name: "Sistema".to_string(),
            email: String::new(),
            role: Role::System,
        }
    }
}

/// Input for a new cash-advance request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProcess {
    pub beneficiary: String,
    pub unit: String,
    pub granted_value: Decimal,
    pub justification: String,
    pub manager_name: String,
    pub manager_email: Option<String>,
    pub event_start: Option<NaiveDate>,
    pub event_end: Option<NaiveDate>,
}

/// A cash-advance request (solicitação de suprimento de fundos).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub id: Uuid,
    /// Protocol number (NUP).
    pub nup: String,
    pub requester_id: Uuid,
    pub beneficiary: String,
    pub unit: String,
    pub granted_value: Decimal,
    pub justification: String,
    pub manager_name: String,
    pub manager_email: Option<String>,
    pub status: ProcessStatus,
    pub event_start: Option<NaiveDate>,
    pub event_end: Option<NaiveDate>,
    /// Accounting ledger reference recorded at archival.
    pub ledger_reference: Option<String>,
    pub write_off_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Process {
    pub fn new(nup: String, requester: &Actor, input: NewProcess, status: ProcessStatus) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            nup,
            requester_id: requester.id,
            beneficiary: input.beneficiary,
            unit: input.unit,
            granted_value: input.granted_value,
            justification: input.justification,
            manager_name: input.manager_name,
            manager_email: input.manager_email,
            status,
            event_start: input.event_start,
            event_end: input.event_end,
            ledger_reference: None,
            write_off_date: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `actor` is the manager designated for this process. Any manager
    /// qualifies when no email was recorded.
    pub fn is_assigned_to(&self, actor: &Actor) -> bool {
        self.manager_email
            .as_deref()
            .is_none_or(|email| email.eq_ignore_ascii_case(&actor.email))
    }
}

/// Spending justification tied 1:1 to a paid process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Accountability {
    pub id: Uuid,
    pub process_id: Uuid,
    pub requester_id: Uuid,
    pub granted_value: Decimal,
    /// Last persisted totals. The ledger recomputes them from items on demand.
    pub total_spent: Decimal,
    pub total_withheld: Decimal,
    pub returned_balance: Decimal,
    pub deadline: DateTime<Utc>,
    pub status: AccountabilityStatus,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
}

impl Accountability {
    pub fn open(process: &Process, deadline_days: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            process_id: process.id,
            requester_id: process.requester_id,
            granted_value: process.granted_value,
            total_spent: Decimal::ZERO,
            total_withheld: Decimal::ZERO,
            returned_balance: Decimal::ZERO,
            deadline: now + Duration::days(deadline_days),
            status: AccountabilityStatus::Draft,
            created_at: now,
            submitted_at: None,
        }
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status.is_editable() && self.status != AccountabilityStatus::Late && now > self.deadline
    }
}

/// Which entity a status change applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EntityRef {
    Process(Uuid),
    Accountability(Uuid),
}

/// A status of either entity, as recorded in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusRef {
    Process(ProcessStatus),
    Accountability(AccountabilityStatus),
}

impl StatusRef {
    pub fn label(self) -> &'static str {
        match self {
            StatusRef::Process(s) => s.label(),
            StatusRef::Accountability(s) => s.label(),
        }
    }

    /// True for returns to the requester and rejections.
    pub fn is_setback(self) -> bool {
        matches!(
            self,
            StatusRef::Process(ProcessStatus::Rejected)
                | StatusRef::Process(ProcessStatus::WaitingCorrection)
                | StatusRef::Accountability(AccountabilityStatus::Correction)
        )
    }
}

impl std::fmt::Display for StatusRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusRef::Process(s) => write!(f, "{s}"),
            StatusRef::Accountability(s) => write!(f, "{s}"),
        }
    }
}

/// Immutable record of one status transition (histórico de tramitação).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TramitHistoryEntry {
    pub id: Uuid,
    pub process_id: Uuid,
    pub entity: EntityRef,
    /// `None` for the entry that records creation.
    pub status_from: Option<StatusRef>,
    pub status_to: StatusRef,
    pub actor_id: Uuid,
    pub actor_name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl TramitHistoryEntry {
    pub fn new(
        process_id: Uuid,
        entity: EntityRef,
        status_from: Option<StatusRef>,
        status_to: StatusRef,
        actor: &Actor,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            process_id,
            entity,
            status_from,
            status_to,
            actor_id: actor.id,
            actor_name: actor.name.clone(),
            description: description.into(),
            created_at: Utc::now(),
        }
    }
}

/// Kind of a structured field-change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeAction {
    ProcessCreated,
    ValueChanged,
    PaymentConfirmed,
    ItemAdded,
    ItemRemoved,
    AnalysisCompleted,
    GdrRegistered,
    Archived,
}

impl ChangeAction {
    pub fn label(self) -> &'static str {
        match self {
            ChangeAction::ProcessCreated => "Processo Criado",
            ChangeAction::ValueChanged => "Valor Alterado",
            ChangeAction::PaymentConfirmed => "Pagamento",
            ChangeAction::ItemAdded => "Item Adicionado",
            ChangeAction::ItemRemoved => "Item Removido",
            ChangeAction::AnalysisCompleted => "Análise",
            ChangeAction::GdrRegistered => "GDR Registrada",
            ChangeAction::Archived => "Arquivamento",
        }
    }
}

/// Structured field-change record (audit_logs source).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: Uuid,
    pub process_id: Uuid,
    pub action: ChangeAction,
    pub actor_name: String,
    pub description: Option<String>,
    pub field_name: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn new(process_id: Uuid, action: ChangeAction, actor: &Actor) -> Self {
        Self {
            id: Uuid::new_v4(),
            process_id,
            action,
            actor_name: actor.name.clone(),
            description: None,
            field_name: None,
            old_value: None,
            new_value: None,
            created_at: Utc::now(),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn field(mut self, name: &str, old: Option<String>, new: Option<String>) -> Self {
        self.field_name = Some(name.to_string());
        self.old_value = old;
        self.new_value = new;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_process() -> Process {
        let requester = Actor::new("Ana Souza", "ana@tjpa.jus.br", Role::Requester);
        Process::new(
            "TJPA-ADM-2026/000001".into(),
            &requester,
            NewProcess {
                beneficiary: "Ana Souza".into(),
                unit: "Comarca de Marabá".into(),
                granted_value: dec!(1000.00),
                justification: "Despesas miúdas de pronto pagamento".into(),
                manager_name: "Carlos Lima".into(),
                manager_email: Some("carlos@tjpa.jus.br".into()),
                event_start: None,
                event_end: None,
            },
            ProcessStatus::Pending,
        )
    }

    #[test]
    fn accountability_deadline_uses_window() {
        let process = sample_process();
        let pc = Accountability::open(&process, 30);
        let days = (pc.deadline - pc.created_at).num_days();
        assert_eq!(days, 30);
        assert_eq!(pc.status, AccountabilityStatus::Draft);
        assert_eq!(pc.granted_value, dec!(1000.00));
    }

    #[test]
    fn overdue_only_for_editable_records() {
        let process = sample_process();
        let mut pc = Accountability::open(&process, 30);
        let later = Utc::now() + Duration::days(31);
        assert!(pc.is_overdue(later));
        pc.status = AccountabilityStatus::WaitingManager;
        assert!(!pc.is_overdue(later));
        pc.status = AccountabilityStatus::Late;
        assert!(!pc.is_overdue(later));
    }

    #[test]
    fn status_ref_serializes_as_plain_code() {
        let json = serde_json::to_string(&StatusRef::Process(ProcessStatus::Paid)).unwrap();
        assert_eq!(json, "\"PAID\"");
        let back: StatusRef = serde_json::from_str("\"WAITING_SOSFU\"").unwrap();
        assert_eq!(back, StatusRef::Accountability(AccountabilityStatus::WaitingSosfu));
    }

    #[test]
    fn setbacks_are_recognised() {
        assert!(StatusRef::Process(ProcessStatus::Rejected).is_setback());
        assert!(StatusRef::Accountability(AccountabilityStatus::Correction).is_setback());
        assert!(!StatusRef::Process(ProcessStatus::Paid).is_setback());
    }

    #[test]
    fn change_record_builder() {
        let actor = Actor::new("SOSFU", "sosfu@tjpa.jus.br", Role::Sosfu);
        let record = ChangeRecord::new(Uuid::new_v4(), ChangeAction::ValueChanged, &actor).field(
            "granted_value",
            Some("1000.00".into()),
            Some("900.00".into()),
        );
        assert_eq!(record.field_name.as_deref(), Some("granted_value"));
        assert_eq!(record.new_value.as_deref(), Some("900.00"));
        assert_eq!(record.actor_name, "SOSFU");
    }
}
