//! Audit trail aggregator.
//!
//! Pure projection over three sources: structured change records, the
//! transition history and each document's audit sub-log. Owns no storage.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::custody::{DocumentAction, ProcessDocument};
use crate::state_machine::{ChangeRecord, TramitHistoryEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSource {
    Change,
    Transition,
    Document,
}

impl AuditSource {
    pub fn label(self) -> &'static str {
        match self {
            AuditSource::Change => "Alteração",
            AuditSource::Transition => "Tramitação",
            AuditSource::Document => "Documento",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub source: AuditSource,
    pub timestamp: DateTime<Utc>,
    /// Machine code, e.g. `TRAMITACAO`, `DOCUMENT_SIGN`, `ITEM_ADDED`.
    pub action: String,
    pub actor_name: String,
    pub description: String,
    pub field_name: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

fn change_code(record: &ChangeRecord) -> String {
    serde_json::to_value(record.action)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn from_change(record: &ChangeRecord) -> AuditEntry {
    AuditEntry {
        source: AuditSource::Change,
        timestamp: record.created_at,
        action: change_code(record),
        actor_name: record.actor_name.clone(),
        description: record
            .description
            .clone()
            .unwrap_or_else(|| record.action.label().to_string()),
        field_name: record.field_name.clone(),
        old_value: record.old_value.clone(),
        new_value: record.new_value.clone(),
    }
}

fn from_transition(entry: &TramitHistoryEntry) -> AuditEntry {
    let action = if entry.status_to.is_setback() {
        "REJECTION"
    } else {
        "TRAMITACAO"
    };
    AuditEntry {
        source: AuditSource::Transition,
        timestamp: entry.created_at,
        action: action.to_string(),
        actor_name: entry.actor_name.clone(),
        description: entry.description.clone(),
        field_name: Some("status".to_string()),
        old_value: entry.status_from.map(|s| s.label().to_string()),
        new_value: Some(entry.status_to.label().to_string()),
    }
}

fn from_document(doc: &ProcessDocument) -> impl Iterator<Item = AuditEntry> + '_ {
    doc.audit_log.iter().map(move |log| {
        let (code, verb) = match log.action {
            DocumentAction::Create => ("DOCUMENT_CREATE", "criado"),
            DocumentAction::Update => ("DOCUMENT_UPDATE", "editado"),
            DocumentAction::Sign => ("DOCUMENT_SIGN", "assinado"),
            DocumentAction::Delete => ("DOCUMENT_DELETE", "excluído"),
        };
        AuditEntry {
            source: AuditSource::Document,
            timestamp: log.timestamp,
            action: code.to_string(),
            actor_name: log.actor_name.clone(),
            description: format!("Documento \"{}\" {verb}", doc.title),
            field_name: None,
            old_value: None,
            new_value: None,
        }
    })
}

/// Merges the three sources and sorts newest first. Ties keep source order.
pub fn merge(
    changes: &[ChangeRecord],
    history: &[TramitHistoryEntry],
    documents: &[ProcessDocument],
) -> Vec<AuditEntry> {
    let mut entries: Vec<AuditEntry> = changes
        .iter()
        .map(from_change)
        .chain(history.iter().map(from_transition))
        .chain(documents.iter().flat_map(from_document))
        .collect();
    entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    entries
}

/// Filter, search and pagination state of the timeline view.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub source: Option<AuditSource>,
    pub search: String,
    /// "Carregar mais" was requested.
    pub show_all: bool,
}

impl AuditQuery {
    fn matches(&self, entry: &AuditEntry) -> bool {
        if self.source.is_some_and(|s| s != entry.source) {
            return false;
        }
        let needle = self.search.trim().to_lowercase();
        needle.is_empty()
            || entry.description.to_lowercase().contains(&needle)
            || entry.actor_name.to_lowercase().contains(&needle)
            || entry.action.to_lowercase().contains(&needle)
    }
}

/// Per-source counts over the unfiltered trail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AuditStats {
    pub total: usize,
    pub transitions: usize,
    pub documents: usize,
    pub changes: usize,
}

impl AuditStats {
    pub fn of(entries: &[AuditEntry]) -> Self {
        let count = |source| entries.iter().filter(|e| e.source == source).count();
        Self {
            total: entries.len(),
            transitions: count(AuditSource::Transition),
            documents: count(AuditSource::Document),
            changes: count(AuditSource::Change),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditView {
    pub entries: Vec<AuditEntry>,
    pub matching: usize,
    pub has_more: bool,
    pub stats: AuditStats,
}

pub fn view(entries: &[AuditEntry], query: &AuditQuery, page_size: usize) -> AuditView {
    let filtered: Vec<&AuditEntry> = entries.iter().filter(|e| query.matches(e)).collect();
    let matching = filtered.len();
    let shown = if query.show_all {
        matching
    } else {
        matching.min(page_size)
    };
    AuditView {
        entries: filtered.into_iter().take(shown).cloned().collect(),
        matching,
        has_more: shown < matching,
        stats: AuditStats::of(entries),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custody::{DocumentAuditEntry, DocumentKind, DocumentState};
    use crate::state_machine::{
        Actor, ChangeAction, EntityRef, ProcessStatus, Role, StatusRef,
    };
    use chrono::Duration;
    use uuid::Uuid;

    fn actor() -> Actor {
        Actor::new("Ana Souza", "ana@tjpa.jus.br", Role::Requester)
    }

    fn history(to: ProcessStatus, at: DateTime<Utc>) -> TramitHistoryEntry {
        let mut entry = TramitHistoryEntry::new(
            Uuid::nil(),
            EntityRef::Process(Uuid::nil()),
            Some(StatusRef::Process(ProcessStatus::WaitingManager)),
            StatusRef::Process(to),
            &actor(),
            "Tramitou",
        );
        entry.created_at = at;
        entry
    }

    fn document(at: DateTime<Utc>) -> ProcessDocument {
        let log = |action, offset| DocumentAuditEntry {
            action,
            actor_id: Uuid::nil(),
            actor_name: "Carlos Lima".into(),
            timestamp: at + Duration::seconds(offset),
        };
        ProcessDocument {
            id: Uuid::new_v4(),
            process_id: Uuid::nil(),
            kind: DocumentKind::Attestation,
            title: "Certidão de Atesto".into(),
            content: String::new(),
            attachment: None,
            state: DocumentState::Signed,
            author_id: Uuid::nil(),
            signature: None,
            execution: None,
            audit_log: vec![log(DocumentAction::Create, 0), log(DocumentAction::Sign, 5)],
            created_at: at,
        }
    }

    fn trail() -> Vec<AuditEntry> {
        let t0 = Utc::now() - Duration::hours(1);
        let mut change = ChangeRecord::new(Uuid::nil(), ChangeAction::ProcessCreated, &actor())
            .describe("Processo criado");
        change.created_at = t0;
        merge(
            &[change],
            &[
                history(ProcessStatus::WaitingSosfuAnalysis, t0 + Duration::minutes(10)),
                history(ProcessStatus::WaitingCorrection, t0 + Duration::minutes(20)),
            ],
            &[document(t0 + Duration::minutes(5))],
        )
    }

    #[test]
    fn merge_sorts_newest_first_and_projects_sub_logs() {
        let entries = trail();
        assert_eq!(entries.len(), 5);
        assert!(entries.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
        assert_eq!(entries[0].action, "REJECTION");
        assert_eq!(entries[0].new_value.as_deref(), Some("Devolvida p/ Correção"));
        assert_eq!(entries.last().unwrap().action, "PROCESS_CREATED");
        assert!(entries.iter().any(|e| e.action == "DOCUMENT_SIGN"));
    }

    #[test]
    fn filter_by_source_and_search() {
        let entries = trail();
        let docs = view(
            &entries,
            &AuditQuery {
                source: Some(AuditSource::Document),
                ..Default::default()
            },
            20,
        );
        assert_eq!(docs.matching, 2);

        let search = view(
            &entries,
            &AuditQuery {
                search: "carlos".into(),
                ..Default::default()
            },
            20,
        );
        assert_eq!(search.matching, 2);
        assert_eq!(search.stats.total, 5);
        assert_eq!(search.stats.transitions, 2);
        assert_eq!(search.stats.changes, 1);
    }

    #[test]
    fn page_cutoff_then_show_all() {
        let entries = trail();
        let first = view(&entries, &AuditQuery::default(), 3);
        assert_eq!(first.entries.len(), 3);
        assert!(first.has_more);

        let all = view(
            &entries,
            &AuditQuery {
                show_all: true,
                ..Default::default()
            },
            3,
        );
        assert_eq!(all.entries.len(), 5);
        assert!(!all.has_more);
    }
}
