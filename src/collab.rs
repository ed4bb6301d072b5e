//! Colaboradores externos: notificações e armazenamento de objetos.
//!
//! O motor de estados depende apenas dos traits [`Notifier`] e
//! [`ObjectStorage`]. As implementações locais ([`MemoryNotifier`],
//! [`LocalStorage`]) atendem a CLI de demonstração e os testes.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SuprimentoError};
use crate::state_machine::Role;

/// Destinatário de uma notificação: um usuário específico ou todos de um papel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipient {
    Email(String),
    User(Uuid),
    Role(Role),
}

/// Notificação disparada após uma tramitação.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub recipient: Recipient,
    pub title: String,
    pub message: String,
    pub process_nup: String,
}

/// Entrega de notificações (fire-and-forget do ponto de vista do motor).
#[allow(async_fn_in_trait)]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<()>;
}

/// Notificador em memória que registra as entregas.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    // Notificações entregues, na ordem de envio.
    sent: Mutex<Vec<Notification>>,
    // Quando ativo, toda entrega falha com erro de rede.
    offline: Mutex<bool>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simula indisponibilidade do serviço de notificações.
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut flag) = self.offline.lock() {
            *flag = offline;
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Notifier for MemoryNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        let offline = self.offline.lock().map(|f| *f).unwrap_or(false);
        if offline {
            return Err(SuprimentoError::NetworkFailure(
                "notification service unreachable".into(),
            ));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(notification);
        }
        Ok(())
    }
}

/// Referência recuperável a um objeto armazenado.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRef {
    /// Caminho lógico, sempre com escopo do processo.
    pub path: String,
    /// URL ou caminho absoluto para leitura.
    pub url: String,
}

/// Armazenamento de binários (comprovantes, GDR, anexos).
#[allow(async_fn_in_trait)]
pub trait ObjectStorage: Send + Sync {
    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<StorageRef>;
}

/// Caminho de upload com escopo do processo: `processes/{id}/{arquivo}`.
pub fn scoped_path(process_id: Uuid, file_name: &str) -> String {
    let clean: String = file_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    format!("processes/{process_id}/{clean}")
}

/// Armazenamento em disco sob um diretório raiz.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl ObjectStorage for LocalStorage {
    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<StorageRef> {
        if path.split('/').any(|part| part == "..") {
            return Err(SuprimentoError::validation(format!(
                "storage path escapes root: {path}"
            )));
        }
        let target = self.root.join(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, bytes).await?;
        Ok(StorageRef {
            path: path.to_string(),
            url: format!("file://{}", target.display()),
        })
    }
}
