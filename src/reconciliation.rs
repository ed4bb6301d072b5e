//! Execution reconciliation over the NE, DL and OB documents.
//!
//! Advisory only: the report never blocks a transition.

use rust_decimal::Decimal;
use serde::Serialize;

use crate::custody::{DocumentKind, ProcessDocument};

/// Verdict of one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Ok,
    /// A document is missing.
    Pending,
    /// Values or numbers disagree.
    Mismatch,
}

impl Verdict {
    pub fn label(self) -> &'static str {
        match self {
            Verdict::Ok => "OK",
            Verdict::Pending => "PENDENTE",
            Verdict::Mismatch => "DIVERGENTE",
        }
    }
}

pub const EXECUTION_KINDS: [DocumentKind; 3] = [
    DocumentKind::CommitmentNote,
    DocumentKind::LiquidationNote,
    DocumentKind::PaymentOrder,
];

/// One execution document as seen by the reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionLine {
    pub kind: DocumentKind,
    pub present: bool,
    pub number: Option<String>,
    pub value: Option<Decimal>,
    pub signed: bool,
    /// value − granted
    pub delta: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub granted: Decimal,
    pub lines: Vec<ExecutionLine>,
    pub presence: Verdict,
    pub values_agree: Verdict,
    pub matches_granted: Verdict,
    pub numbers: Verdict,
    pub all_signed: bool,
}

impl ReconciliationReport {
    /// Worst verdict across the checks.
    pub fn overall(&self) -> Verdict {
        let checks = [self.presence, self.values_agree, self.matches_granted, self.numbers];
        if checks.contains(&Verdict::Mismatch) {
            Verdict::Mismatch
        } else if checks.contains(&Verdict::Pending) {
            Verdict::Pending
        } else {
            Verdict::Ok
        }
    }
}

fn within(a: Decimal, b: Decimal, epsilon: Decimal) -> bool {
    (a - b).abs() <= epsilon
}

// Mismatch among what is present wins over missing.
fn verdict(consistent: bool, complete: bool) -> Verdict {
    match (consistent, complete) {
        (false, _) => Verdict::Mismatch,
        (true, false) => Verdict::Pending,
        (true, true) => Verdict::Ok,
    }
}

pub fn reconcile(granted: Decimal, documents: &[ProcessDocument], epsilon: Decimal) -> ReconciliationReport {
    let lines: Vec<ExecutionLine> = EXECUTION_KINDS
        .iter()
        .map(|kind| {
            let doc = documents.iter().find(|d| d.is_live() && d.kind == *kind);
            let execution = doc.and_then(|d| d.execution.as_ref());
            let value = execution.map(|e| e.value);
            ExecutionLine {
                kind: *kind,
                present: doc.is_some(),
                number: execution.map(|e| e.number.clone()),
                value,
                signed: doc.is_some_and(|d| d.signature.is_some()),
                delta: value.map(|v| v - granted),
            }
        })
        .collect();

    let complete = lines.iter().all(|l| l.present);
    let values: Vec<Decimal> = lines.iter().filter_map(|l| l.value).collect();
    let values_complete = values.len() == lines.len();

    let agree = values.windows(2).all(|w| within(w[0], w[1], epsilon));
    let match_granted = values.iter().all(|v| within(*v, granted, epsilon));
    let numbers_filled = lines
        .iter()
        .filter(|l| l.present)
        .all(|l| l.number.as_deref().is_some_and(|n| !n.trim().is_empty()));

    ReconciliationReport {
        granted,
        presence: if complete { Verdict::Ok } else { Verdict::Pending },
        values_agree: verdict(agree, values_complete),
        matches_granted: verdict(match_granted, values_complete),
        numbers: verdict(numbers_filled, complete),
        all_signed: lines.iter().all(|l| l.signed),
        lines,
    }
}
