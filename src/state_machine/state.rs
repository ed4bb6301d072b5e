use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a cash-advance process.
///
/// Main line: PENDING → WAITING_MANAGER → WAITING_SOSFU_ANALYSIS →
/// WAITING_SOSFU_EXECUTION → WAITING_SOSFU_PAYMENT →
/// WAITING_SUPRIDO_CONFIRMATION → PAID → ARCHIVED, with the
/// WAITING_CORRECTION side branch and the terminal REJECTED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    Pending,
    WaitingManager,
    WaitingSosfuAnalysis,
    WaitingSosfuExecution,
    WaitingSosfuPayment,
    WaitingSupridoConfirmation,
    Paid,
    Archived,
    WaitingCorrection,
    Rejected,
}

impl ProcessStatus {
    pub const ALL: [ProcessStatus; 10] = [
        ProcessStatus::Pending,
        ProcessStatus::WaitingManager,
        ProcessStatus::WaitingSosfuAnalysis,
        ProcessStatus::WaitingSosfuExecution,
        ProcessStatus::WaitingSosfuPayment,
        ProcessStatus::WaitingSupridoConfirmation,
        ProcessStatus::Paid,
        ProcessStatus::Archived,
        ProcessStatus::WaitingCorrection,
        ProcessStatus::Rejected,
    ];

    /// Position on the main line; side branches have none.
    pub fn rank(self) -> Option<u8> {
        match self {
            ProcessStatus::Pending => Some(0),
            ProcessStatus::WaitingManager => Some(1),
            ProcessStatus::WaitingSosfuAnalysis => Some(2),
            ProcessStatus::WaitingSosfuExecution => Some(3),
            ProcessStatus::WaitingSosfuPayment => Some(4),
            ProcessStatus::WaitingSupridoConfirmation => Some(5),
            ProcessStatus::Paid => Some(6),
            ProcessStatus::Archived => Some(7),
            ProcessStatus::WaitingCorrection | ProcessStatus::Rejected => None,
        }
    }

    /// True for targets that lie beyond the manager's attestation step.
    pub fn is_past_manager(self) -> bool {
        self.rank()
            .is_some_and(|r| r > ProcessStatus::WaitingManager.rank().unwrap_or(1))
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessStatus::Rejected | ProcessStatus::Archived)
    }

    /// Label shown in timelines and notifications.
    pub fn label(self) -> &'static str {
        match self {
            ProcessStatus::Pending => "Pendente",
            ProcessStatus::WaitingManager => "Aguardando Atesto",
            ProcessStatus::WaitingSosfuAnalysis => "Em Análise SOSFU",
            ProcessStatus::WaitingSosfuExecution => "Em Execução (SOSFU)",
            ProcessStatus::WaitingSosfuPayment => "Aguardando Pagamento",
            ProcessStatus::WaitingSupridoConfirmation => "Pagamento Comunicado",
            ProcessStatus::Paid => "Pago",
            ProcessStatus::Archived => "Arquivado",
            ProcessStatus::WaitingCorrection => "Devolvida p/ Correção",
            ProcessStatus::Rejected => "Rejeitado",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.to_string() == code)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            ProcessStatus::Pending => "PENDING",
            ProcessStatus::WaitingManager => "WAITING_MANAGER",
            ProcessStatus::WaitingSosfuAnalysis => "WAITING_SOSFU_ANALYSIS",
            ProcessStatus::WaitingSosfuExecution => "WAITING_SOSFU_EXECUTION",
            ProcessStatus::WaitingSosfuPayment => "WAITING_SOSFU_PAYMENT",
            ProcessStatus::WaitingSupridoConfirmation => "WAITING_SUPRIDO_CONFIRMATION",
            ProcessStatus::Paid => "PAID",
            ProcessStatus::Archived => "ARCHIVED",
            ProcessStatus::WaitingCorrection => "WAITING_CORRECTION",
            ProcessStatus::Rejected => "REJECTED",
        };
        write!(f, "{code}")
    }
}

/// Lifecycle status of an accountability (prestação de contas).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountabilityStatus {
    Draft,
    WaitingManager,
    WaitingSosfu,
    Approved,
    Correction,
    Late,
}

impl AccountabilityStatus {
    pub const ALL: [AccountabilityStatus; 6] = [
        AccountabilityStatus::Draft,
        AccountabilityStatus::WaitingManager,
        AccountabilityStatus::WaitingSosfu,
        AccountabilityStatus::Approved,
        AccountabilityStatus::Correction,
        AccountabilityStatus::Late,
    ];

    /// The requester may still add or remove items.
    pub fn is_editable(self) -> bool {
        matches!(
            self,
            AccountabilityStatus::Draft
                | AccountabilityStatus::Correction
                | AccountabilityStatus::Late
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            AccountabilityStatus::Draft => "Rascunho",
            AccountabilityStatus::WaitingManager => "Aguardando Atesto",
            AccountabilityStatus::WaitingSosfu => "Em Análise SOSFU",
            AccountabilityStatus::Approved => "PC Aprovada",
            AccountabilityStatus::Correction => "Em Ajuste",
            AccountabilityStatus::Late => "Em Atraso",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.to_string() == code)
    }
}

impl fmt::Display for AccountabilityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            AccountabilityStatus::Draft => "DRAFT",
            AccountabilityStatus::WaitingManager => "WAITING_MANAGER",
            AccountabilityStatus::WaitingSosfu => "WAITING_SOSFU",
            AccountabilityStatus::Approved => "APPROVED",
            AccountabilityStatus::Correction => "CORRECTION",
            AccountabilityStatus::Late => "LATE",
        };
        write!(f, "{code}")
    }
}

/// Closed set of roles acting on a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// The suprido drawing the funds.
    Requester,
    /// The gestor who attests the request.
    Manager,
    Sosfu,
    Sefin,
    /// Automatic routines (deadline sweeps).
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Requester => write!(f, "REQUESTER"),
            Role::Manager => write!(f, "MANAGER"),
            Role::Sosfu => write!(f, "SOSFU"),
            Role::Sefin => write!(f, "SEFIN"),
            Role::System => write!(f, "SYSTEM"),
        }
    }
}

use AccountabilityStatus as A;
use ProcessStatus as P;

/// Legal process edges: (from, role, to).
const PROCESS_EDGES: &[(ProcessStatus, Role, ProcessStatus)] = &[
    (P::Pending, Role::Requester, P::WaitingManager),
    (P::WaitingCorrection, Role::Requester, P::WaitingManager),
    (P::WaitingManager, Role::Manager, P::WaitingSosfuAnalysis),
    (P::WaitingManager, Role::Manager, P::WaitingCorrection),
    (P::WaitingManager, Role::Manager, P::Rejected),
    (P::WaitingSosfuAnalysis, Role::Sosfu, P::WaitingSosfuExecution),
    (P::WaitingSosfuAnalysis, Role::Sosfu, P::WaitingCorrection),
    (P::WaitingSosfuAnalysis, Role::Sosfu, P::Rejected),
    (P::WaitingSosfuExecution, Role::Sefin, P::WaitingSosfuPayment),
    (P::WaitingSosfuExecution, Role::Sefin, P::WaitingCorrection),
    (P::WaitingSosfuPayment, Role::Sosfu, P::WaitingSupridoConfirmation),
    (P::WaitingSupridoConfirmation, Role::Requester, P::Paid),
    (P::Paid, Role::Sosfu, P::Archived),
];

/// Legal accountability edges: (from, role, to).
const ACCOUNTABILITY_EDGES: &[(AccountabilityStatus, Role, AccountabilityStatus)] = &[
    (A::Draft, Role::Requester, A::WaitingManager),
    (A::Correction, Role::Requester, A::WaitingManager),
    (A::Late, Role::Requester, A::WaitingManager),
    (A::Draft, Role::Manager, A::WaitingSosfu),
    (A::Correction, Role::Manager, A::WaitingSosfu),
    (A::Late, Role::Manager, A::WaitingSosfu),
    (A::Draft, Role::System, A::Late),
    (A::Correction, Role::System, A::Late),
    (A::WaitingManager, Role::Manager, A::WaitingSosfu),
    (A::WaitingManager, Role::Manager, A::Correction),
    (A::WaitingSosfu, Role::Sosfu, A::Approved),
    (A::WaitingSosfu, Role::Sosfu, A::Correction),
];

/// Lookup over the fixed transition tables.
pub struct TransitionTable;

impl TransitionTable {
    pub fn allows_process(from: ProcessStatus, role: Role, to: ProcessStatus) -> bool {
        PROCESS_EDGES.contains(&(from, role, to))
    }

    pub fn allows_accountability(
        from: AccountabilityStatus,
        role: Role,
        to: AccountabilityStatus,
    ) -> bool {
        ACCOUNTABILITY_EDGES.contains(&(from, role, to))
    }

    /// Targets reachable from `from` by `role`, in table order.
    pub fn process_targets(from: ProcessStatus, role: Role) -> Vec<ProcessStatus> {
        PROCESS_EDGES
            .iter()
            .filter(|(f, r, _)| *f == from && *r == role)
            .map(|(_, _, to)| *to)
            .collect()
    }

    /// True when some role could perform the edge at all.
    pub fn process_edge_exists(from: ProcessStatus, to: ProcessStatus) -> bool {
        PROCESS_EDGES.iter().any(|(f, _, t)| *f == from && *t == to)
    }

    pub fn accountability_edge_exists(from: AccountabilityStatus, to: AccountabilityStatus) -> bool {
        ACCOUNTABILITY_EDGES
            .iter()
            .any(|(f, _, t)| *f == from && *t == to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_owns_attestation_edge() {
        assert!(TransitionTable::allows_process(
            P::WaitingManager,
            Role::Manager,
            P::WaitingSosfuAnalysis
        ));
        assert!(!TransitionTable::allows_process(
            P::WaitingManager,
            Role::Requester,
            P::WaitingSosfuAnalysis
        ));
        assert!(!TransitionTable::allows_process(
            P::WaitingManager,
            Role::Sosfu,
            P::WaitingSosfuAnalysis
        ));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for role in [Role::Requester, Role::Manager, Role::Sosfu, Role::Sefin, Role::System] {
            assert!(TransitionTable::process_targets(P::Rejected, role).is_empty());
            assert!(TransitionTable::process_targets(P::Archived, role).is_empty());
        }
    }

    #[test]
    fn every_edge_targets_a_defined_status() {
        for (from, _, to) in PROCESS_EDGES {
            assert!(P::ALL.contains(from));
            assert!(P::ALL.contains(to));
        }
        for (from, _, to) in ACCOUNTABILITY_EDGES {
            assert!(A::ALL.contains(from));
            assert!(A::ALL.contains(to));
        }
    }

    #[test]
    fn past_manager_classification() {
        assert!(!P::Pending.is_past_manager());
        assert!(!P::WaitingManager.is_past_manager());
        assert!(P::WaitingSosfuAnalysis.is_past_manager());
        assert!(P::Archived.is_past_manager());
        assert!(!P::WaitingCorrection.is_past_manager());
        assert!(!P::Rejected.is_past_manager());
    }

    #[test]
    fn status_codes_round_trip_through_parse() {
        for s in P::ALL {
            assert_eq!(P::parse(&s.to_string()), Some(s));
        }
        for s in A::ALL {
            assert_eq!(A::parse(&s.to_string()), Some(s));
        }
        assert_eq!(P::parse("WAITING_SEFIN_SIGNATURE"), None);
    }

    #[test]
    fn serde_uses_status_codes() {
        let json = serde_json::to_string(&P::WaitingSupridoConfirmation).unwrap();
        assert_eq!(json, "\"WAITING_SUPRIDO_CONFIRMATION\"");
        let parsed: A = serde_json::from_str("\"LATE\"").unwrap();
        assert_eq!(parsed, A::Late);
    }

    #[test]
    fn editable_accountability_states() {
        assert!(A::Draft.is_editable());
        assert!(A::Correction.is_editable());
        assert!(A::Late.is_editable());
        assert!(!A::WaitingManager.is_editable());
        assert!(!A::Approved.is_editable());
    }

    #[test]
    fn labels_are_display_text() {
        assert_eq!(P::WaitingManager.label(), "Aguardando Atesto");
        assert_eq!(A::Approved.label(), "PC Aprovada");
    }
}
