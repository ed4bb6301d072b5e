//! Document custody: the draft/signed lifecycle of process documents.
//!
//! Every mutation appends exactly one entry to the document's audit sub-log.
//! Entries are never rewritten. Structural document kinds exist at most once
//! per process; generation requests for an existing kind return it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use crate::collab::{ObjectStorage, StorageRef, scoped_path};
use crate::error::{Result, SuprimentoError};
use crate::state_machine::{Actor, ProcessStatus, Role};
use crate::store::Store;

/// Kind of a process document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentKind {
    Cover,
    Request,
    Attestation,
    GrantAct,
    CommitmentNote,
    LiquidationNote,
    PaymentOrder,
    RegularityCertificate,
    Generic,
}

impl DocumentKind {
    /// Structural kinds are at-most-one-per-process.
    pub fn is_structural(self) -> bool {
        self != DocumentKind::Generic
    }

    /// Roles that may sign a draft of this kind.
    pub fn signer_roles(self) -> &'static [Role] {
        match self {
            DocumentKind::Cover | DocumentKind::Request => &[Role::Requester, Role::Manager],
            DocumentKind::Attestation => &[Role::Manager],
            DocumentKind::GrantAct
            | DocumentKind::CommitmentNote
            | DocumentKind::LiquidationNote
            | DocumentKind::PaymentOrder => &[Role::Sefin],
            DocumentKind::RegularityCertificate => &[Role::Sosfu],
            DocumentKind::Generic => &[Role::Manager, Role::Sosfu, Role::Sefin],
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            DocumentKind::Cover => "Capa do Processo",
            DocumentKind::Request => "Requerimento",
            DocumentKind::Attestation => "Certidão de Atesto",
            DocumentKind::GrantAct => "Portaria de Concessão",
            DocumentKind::CommitmentNote => "Nota de Empenho",
            DocumentKind::LiquidationNote => "Documento de Liquidação",
            DocumentKind::PaymentOrder => "Ordem Bancária",
            DocumentKind::RegularityCertificate => "Certidão de Regularidade",
            DocumentKind::Generic => "Documento",
        }
    }
}

/// Lifecycle flag of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentState {
    Draft,
    Signed,
    /// Soft-deletion tombstone.
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentAction {
    Create,
    Update,
    Sign,
    Delete,
}

/// One entry of a document's append-only audit sub-log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentAuditEntry {
    pub action: DocumentAction,
    pub actor_id: Uuid,
    pub actor_name: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub signer_id: Uuid,
    pub signer_name: String,
    pub role: Role,
    pub signed_at: DateTime<Utc>,
    /// Short verification token printed in the document footer.
    pub token: String,
}

/// Number and value carried by NE, DL and OB documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionData {
    pub number: String,
    pub value: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDocument {
    pub id: Uuid,
    pub process_id: Uuid,
    pub kind: DocumentKind,
    pub title: String,
    pub content: String,
    pub attachment: Option<StorageRef>,
    pub state: DocumentState,
    pub author_id: Uuid,
    pub signature: Option<Signature>,
    pub execution: Option<ExecutionData>,
    pub audit_log: Vec<DocumentAuditEntry>,
    pub created_at: DateTime<Utc>,
}

impl ProcessDocument {
    fn new(process_id: Uuid, kind: DocumentKind, title: &str, content: &str, author: &Actor) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            process_id,
            kind,
            title: title.to_string(),
            content: content.to_string(),
            attachment: None,
            state: DocumentState::Draft,
            author_id: author.id,
            signature: None,
            execution: None,
            audit_log: vec![DocumentAuditEntry {
                action: DocumentAction::Create,
                actor_id: author.id,
                actor_name: author.name.clone(),
                timestamp: now,
            }],
            created_at: now,
        }
    }

    fn record(&mut self, action: DocumentAction, actor: &Actor) {
        self.audit_log.push(DocumentAuditEntry {
            action,
            actor_id: actor.id,
            actor_name: actor.name.clone(),
            timestamp: Utc::now(),
        });
    }

    fn stamp_signature(&mut self, actor: &Actor) {
        let signed_at = Utc::now();
        self.signature = Some(Signature {
            signer_id: actor.id,
            signer_name: actor.name.clone(),
            role: actor.role,
            signed_at,
            token: verification_token(self.id, &actor.name, &self.content),
        });
        self.state = DocumentState::Signed;
    }

    pub fn is_draft(&self) -> bool {
        self.state == DocumentState::Draft
    }

    pub fn is_live(&self) -> bool {
        self.state != DocumentState::Deleted
    }
}

/// First 8 hex chars of SHA-256 over document id, signer and content.
pub fn verification_token(document_id: Uuid, signer: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(signer.as_bytes());
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())[..8].to_uppercase()
}

/// Result of a signature.
#[derive(Debug, Clone)]
pub struct SignOutcome {
    pub document: ProcessDocument,
    /// The last draft bound to a process awaiting its manager was signed.
    pub ready_to_advance: bool,
}

/// Owns every mutation of process documents.
pub struct DocumentCustody<'a, S: Store> {
    store: &'a S,
}

impl<'a, S: Store> DocumentCustody<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Live documents of a process, tombstones excluded.
    pub async fn documents(&self, process_id: Uuid) -> Result<Vec<ProcessDocument>> {
        let docs = self.store.list_documents(process_id).await?;
        Ok(docs.into_iter().filter(ProcessDocument::is_live).collect())
    }

    pub async fn find_kind(&self, process_id: Uuid, kind: DocumentKind) -> Result<Option<ProcessDocument>> {
        Ok(self
            .documents(process_id)
            .await?
            .into_iter()
            .find(|d| d.kind == kind))
    }

    /// Number of unsigned minutas still bound to the process. Uploaded
    /// attachments are not minutas and never count.
    pub async fn outstanding_drafts(&self, process_id: Uuid) -> Result<usize> {
        Ok(self
            .documents(process_id)
            .await?
            .iter()
            .filter(|d| d.is_draft() && d.attachment.is_none())
            .count())
    }

    /// Creates a draft (minuta). Returns the existing document when the
    /// structural kind is already bound to the process.
    pub async fn create_draft(
        &self,
        process_id: Uuid,
        kind: DocumentKind,
        title: &str,
        content: &str,
        author: &Actor,
    ) -> Result<ProcessDocument> {
        if kind.is_structural()
            && let Some(existing) = self.find_kind(process_id, kind).await?
        {
            debug!(%process_id, ?kind, "document kind already bound, returning existing");
            return Ok(existing);
        }
        let doc = ProcessDocument::new(process_id, kind, title, content, author);
        self.store.insert_document(doc).await
    }

    /// Generates a system document already signed by `actor`.
    pub async fn generate_signed(
        &self,
        process_id: Uuid,
        kind: DocumentKind,
        title: &str,
        content: &str,
        actor: &Actor,
    ) -> Result<ProcessDocument> {
        if kind.is_structural()
            && let Some(existing) = self.find_kind(process_id, kind).await?
        {
            return Ok(existing);
        }
        let mut doc = ProcessDocument::new(process_id, kind, title, content, actor);
        doc.stamp_signature(actor);
        doc.record(DocumentAction::Sign, actor);
        self.store.insert_document(doc).await
    }

    /// Registers an execution document (NE, DL or OB) as a draft for SEFIN.
    pub async fn register_execution_document(
        &self,
        process_id: Uuid,
        kind: DocumentKind,
        number: &str,
        value: Decimal,
        actor: &Actor,
    ) -> Result<ProcessDocument> {
        if !matches!(
            kind,
            DocumentKind::CommitmentNote | DocumentKind::LiquidationNote | DocumentKind::PaymentOrder
        ) {
            return Err(SuprimentoError::validation(format!(
                "{} is not an execution document",
                kind.label()
            )));
        }
        if actor.role != Role::Sosfu {
            return Err(SuprimentoError::Unauthorized {
                role: actor.role.to_string(),
                action: format!("register {}", kind.label()),
            });
        }
        if let Some(existing) = self.find_kind(process_id, kind).await? {
            return Ok(existing);
        }
        let title = format!("{} {number}", kind.label());
        let mut doc = ProcessDocument::new(process_id, kind, &title, "", actor);
        doc.execution = Some(ExecutionData {
            number: number.trim().to_string(),
            value,
        });
        self.store.insert_document(doc).await
    }

    /// Uploads a binary and binds it to the process as a generic document.
    pub async fn attach_upload(
        &self,
        storage: &impl ObjectStorage,
        process_id: Uuid,
        file_name: &str,
        bytes: &[u8],
        actor: &Actor,
    ) -> Result<ProcessDocument> {
        let reference = storage.upload(&scoped_path(process_id, file_name), bytes).await?;
        let mut doc = ProcessDocument::new(process_id, DocumentKind::Generic, file_name, "", actor);
        doc.attachment = Some(reference);
        self.store.insert_document(doc).await
    }

    /// Signs a draft. A second signature is rejected with `AlreadySigned`.
    pub async fn sign(&self, document_id: Uuid, actor: &Actor) -> Result<SignOutcome> {
        let mut doc = self.store.get_document(document_id).await?;
        match doc.state {
            DocumentState::Signed => return Err(SuprimentoError::AlreadySigned(document_id.to_string())),
            DocumentState::Deleted => {
                return Err(SuprimentoError::validation("cannot sign a deleted document"));
            }
            DocumentState::Draft => {}
        }
        if !doc.kind.signer_roles().contains(&actor.role) {
            return Err(SuprimentoError::Unauthorized {
                role: actor.role.to_string(),
                action: format!("sign {}", doc.kind.label()),
            });
        }
        let process = self.store.get_process(doc.process_id).await?;
        if actor.role == Role::Manager && !process.is_assigned_to(actor) {
            return Err(SuprimentoError::Unauthorized {
                role: actor.role.to_string(),
                action: format!("sign {} for another manager's process", doc.kind.label()),
            });
        }

        doc.stamp_signature(actor);
        doc.record(DocumentAction::Sign, actor);
        let document = match self.store.update_document(doc, DocumentState::Draft).await {
            Ok(document) => document,
            Err(SuprimentoError::ConcurrencyConflict { .. }) => {
                // Another signer won the race.
                let current = self.store.get_document(document_id).await?;
                if current.state == DocumentState::Signed {
                    return Err(SuprimentoError::AlreadySigned(document_id.to_string()));
                }
                return Err(SuprimentoError::validation("document changed while signing"));
            }
            Err(err) => return Err(err),
        };
        info!(document_id = %document.id, signer = %actor.name, "document signed");

        let ready_to_advance = actor.role == Role::Manager
            && self.outstanding_drafts(document.process_id).await? == 0
            && process.status == ProcessStatus::WaitingManager;

        Ok(SignOutcome {
            document,
            ready_to_advance,
        })
    }

    /// Replaces the content of a draft.
    pub async fn edit(&self, document_id: Uuid, content: &str, actor: &Actor) -> Result<ProcessDocument> {
        let mut doc = self.store.get_document(document_id).await?;
        match doc.state {
            DocumentState::Signed => return Err(SuprimentoError::AlreadySigned(document_id.to_string())),
            DocumentState::Deleted => {
                return Err(SuprimentoError::validation("cannot edit a deleted document"));
            }
            DocumentState::Draft => {}
        }
        if doc.author_id != actor.id && !doc.kind.signer_roles().contains(&actor.role) {
            return Err(SuprimentoError::Unauthorized {
                role: actor.role.to_string(),
                action: format!("edit {}", doc.kind.label()),
            });
        }
        doc.content = content.to_string();
        doc.record(DocumentAction::Update, actor);
        self.store.update_document(doc, DocumentState::Draft).await
    }

    /// Marks a document deleted. The record and its audit sub-log remain.
    pub async fn soft_delete(&self, document_id: Uuid, actor: &Actor) -> Result<ProcessDocument> {
        let mut doc = self.store.get_document(document_id).await?;
        if doc.state == DocumentState::Deleted {
            return Err(SuprimentoError::validation("document already deleted"));
        }
        if doc.author_id != actor.id && !doc.kind.signer_roles().contains(&actor.role) {
            return Err(SuprimentoError::Unauthorized {
                role: actor.role.to_string(),
                action: format!("delete {}", doc.kind.label()),
            });
        }
        let expected = doc.state;
        doc.state = DocumentState::Deleted;
        doc.record(DocumentAction::Delete, actor);
        self.store.update_document(doc, expected).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::LocalStorage;
    use crate::state_machine::{NewProcess, Process};
    use crate::store::MemoryStore;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    async fn seeded(status: ProcessStatus) -> (MemoryStore, Process, Actor) {
        let store = MemoryStore::new();
        let requester = Actor::new("Ana Souza", "ana@tjpa.jus.br", Role::Requester);
        let process = Process::new(
            "TJPA-ADM-2026/000001".into(),
            &requester,
            NewProcess {
                beneficiary: "Ana Souza".into(),
                unit: "Comarca de Marabá".into(),
                granted_value: dec!(1000.00),
                justification: "Pronto pagamento".into(),
                manager_name: "Carlos Lima".into(),
                manager_email: Some("carlos@tjpa.jus.br".into()),
                event_start: None,
                event_end: None,
            },
            status,
        );
        let process = store.insert_process(process).await.unwrap();
        (store, process, requester)
    }

    fn manager() -> Actor {
        Actor::new("Carlos Lima", "carlos@tjpa.jus.br", Role::Manager)
    }

    #[tokio::test]
    async fn create_draft_deduplicates_structural_kinds() {
        let (store, process, requester) = seeded(ProcessStatus::Pending).await;
        let custody = DocumentCustody::new(&store);

        let first = custody
            .create_draft(process.id, DocumentKind::Attestation, "Atesto", "minuta", &requester)
            .await
            .unwrap();
        let second = custody
            .create_draft(process.id, DocumentKind::Attestation, "Atesto 2", "outra", &requester)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);

        custody
            .create_draft(process.id, DocumentKind::Generic, "Ofício", "a", &requester)
            .await
            .unwrap();
        custody
            .create_draft(process.id, DocumentKind::Generic, "Ofício", "b", &requester)
            .await
            .unwrap();
        assert_eq!(custody.documents(process.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn sign_twice_is_rejected() {
        let (store, process, requester) = seeded(ProcessStatus::Pending).await;
        let custody = DocumentCustody::new(&store);
        let doc = custody
            .create_draft(process.id, DocumentKind::Attestation, "Atesto", "minuta", &requester)
            .await
            .unwrap();

        let outcome = custody.sign(doc.id, &manager()).await.unwrap();
        assert_eq!(outcome.document.state, DocumentState::Signed);
        let token = &outcome.document.signature.as_ref().unwrap().token;
        assert_eq!(token.len(), 8);

        let again = custody.sign(doc.id, &manager()).await;
        assert!(matches!(again, Err(SuprimentoError::AlreadySigned(_))));
    }

    #[tokio::test]
    async fn sign_requires_signer_role() {
        let (store, process, requester) = seeded(ProcessStatus::Pending).await;
        let custody = DocumentCustody::new(&store);
        let doc = custody
            .create_draft(process.id, DocumentKind::Attestation, "Atesto", "minuta", &requester)
            .await
            .unwrap();
        let result = custody.sign(doc.id, &requester).await;
        assert!(matches!(result, Err(SuprimentoError::Unauthorized { .. })));
    }

    #[tokio::test]
    async fn signature_write_loses_to_concurrent_signer() {
        let (store, process, requester) = seeded(ProcessStatus::WaitingManager).await;
        let custody = DocumentCustody::new(&store);
        let doc = custody
            .create_draft(process.id, DocumentKind::Attestation, "Atesto", "minuta", &requester)
            .await
            .unwrap();
        let stale = store.get_document(doc.id).await.unwrap();

        custody.sign(doc.id, &manager()).await.unwrap();

        let mut late = stale.clone();
        late.stamp_signature(&manager());
        late.record(DocumentAction::Sign, &manager());
        let result = store.update_document(late, DocumentState::Draft).await;
        assert!(matches!(result, Err(SuprimentoError::ConcurrencyConflict { .. })));

        let stored = store.get_document(doc.id).await.unwrap();
        let signs = stored
            .audit_log
            .iter()
            .filter(|e| e.action == DocumentAction::Sign)
            .count();
        assert_eq!(signs, 1);
    }

    #[tokio::test]
    async fn another_manager_cannot_sign() {
        let (store, process, requester) = seeded(ProcessStatus::WaitingManager).await;
        let custody = DocumentCustody::new(&store);
        let doc = custody
            .create_draft(process.id, DocumentKind::Attestation, "Atesto", "minuta", &requester)
            .await
            .unwrap();
        let outsider = Actor::new("Beatriz Rocha", "beatriz@tjpa.jus.br", Role::Manager);

        let result = custody.sign(doc.id, &outsider).await;
        assert!(matches!(result, Err(SuprimentoError::Unauthorized { .. })));
        assert!(store.get_document(doc.id).await.unwrap().is_draft());
        assert_eq!(custody.outstanding_drafts(process.id).await.unwrap(), 1);

        assert!(custody.sign(doc.id, &manager()).await.unwrap().ready_to_advance);
    }

    #[tokio::test]
    async fn last_draft_signal_only_while_waiting_manager() {
        let (store, process, requester) = seeded(ProcessStatus::WaitingManager).await;
        let custody = DocumentCustody::new(&store);
        let a = custody
            .create_draft(process.id, DocumentKind::Attestation, "Atesto", "x", &requester)
            .await
            .unwrap();
        let b = custody
            .create_draft(process.id, DocumentKind::Generic, "Justificativa", "y", &requester)
            .await
            .unwrap();

        assert!(!custody.sign(a.id, &manager()).await.unwrap().ready_to_advance);
        assert!(custody.sign(b.id, &manager()).await.unwrap().ready_to_advance);
    }

    #[tokio::test]
    async fn edit_only_while_draft_and_log_is_appended() {
        let (store, process, requester) = seeded(ProcessStatus::Pending).await;
        let custody = DocumentCustody::new(&store);
        let doc = custody
            .create_draft(process.id, DocumentKind::Request, "Requerimento", "v1", &requester)
            .await
            .unwrap();

        let edited = custody.edit(doc.id, "v2", &requester).await.unwrap();
        assert_eq!(edited.content, "v2");
        assert_eq!(edited.audit_log.len(), 2);
        assert_eq!(edited.audit_log[0], doc.audit_log[0]);

        custody.sign(doc.id, &manager()).await.unwrap();
        let result = custody.edit(doc.id, "v3", &requester).await;
        assert!(matches!(result, Err(SuprimentoError::AlreadySigned(_))));
    }

    #[tokio::test]
    async fn soft_delete_keeps_tombstone_and_frees_kind() {
        let (store, process, requester) = seeded(ProcessStatus::Pending).await;
        let custody = DocumentCustody::new(&store);
        let doc = custody
            .create_draft(process.id, DocumentKind::Attestation, "Atesto", "x", &requester)
            .await
            .unwrap();

        let deleted = custody.soft_delete(doc.id, &requester).await.unwrap();
        assert_eq!(deleted.state, DocumentState::Deleted);
        assert_eq!(deleted.audit_log.last().unwrap().action, DocumentAction::Delete);
        assert_eq!(custody.outstanding_drafts(process.id).await.unwrap(), 0);
        assert_eq!(store.list_documents(process.id).await.unwrap().len(), 1);

        let replacement = custody
            .create_draft(process.id, DocumentKind::Attestation, "Atesto", "y", &requester)
            .await
            .unwrap();
        assert_ne!(replacement.id, doc.id);
    }

    #[tokio::test]
    async fn execution_documents_are_registered_by_sosfu() {
        let (store, process, requester) = seeded(ProcessStatus::WaitingSosfuExecution).await;
        let custody = DocumentCustody::new(&store);
        let sosfu = Actor::new("Analista SOSFU", "sosfu@tjpa.jus.br", Role::Sosfu);

        let ne = custody
            .register_execution_document(process.id, DocumentKind::CommitmentNote, " 2026NE0001 ", dec!(1000.00), &sosfu)
            .await
            .unwrap();
        assert_eq!(ne.execution.as_ref().unwrap().number, "2026NE0001");
        assert!(ne.is_draft());

        let denied = custody
            .register_execution_document(process.id, DocumentKind::PaymentOrder, "OB1", dec!(1), &requester)
            .await;
        assert!(matches!(denied, Err(SuprimentoError::Unauthorized { .. })));

        let wrong = custody
            .register_execution_document(process.id, DocumentKind::Cover, "X", dec!(1), &sosfu)
            .await;
        assert!(matches!(wrong, Err(SuprimentoError::ValidationFailed(_))));
    }

    #[tokio::test]
    async fn attach_upload_binds_storage_reference() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path());
        let (store, process, requester) = seeded(ProcessStatus::Pending).await;
        let custody = DocumentCustody::new(&store);

        let doc = custody
            .attach_upload(&storage, process.id, "orcamento.pdf", b"%PDF", &requester)
            .await
            .unwrap();
        let reference = doc.attachment.unwrap();
        assert!(reference.path.starts_with(&format!("processes/{}/", process.id)));
    }

    #[test]
    fn verification_token_is_deterministic() {
        let id = Uuid::nil();
        let a = verification_token(id, "Carlos Lima", "conteúdo");
        let b = verification_token(id, "Carlos Lima", "conteúdo");
        assert_eq!(a, b);
        assert_eq!(a, a.to_uppercase());
        assert_ne!(a, verification_token(id, "Outra Pessoa", "conteúdo"));
    }
}
