//! Cache local de rascunhos de prestação de contas.
//!
//! Cada rascunho é gravado como um arquivo JSON por prestação de contas.
//! As gravações passam por um [`DebounceScheduler`]: chamadas repetidas dentro
//! da janela adiam a gravação, que acontece uma única vez. O cache não sabe
//! se o dispositivo está online; ele sempre grava localmente primeiro.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::ledger::ExpenseItem;
use crate::state_machine::Accountability;

/// Comprovante ainda não enviado ao armazenamento.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftAttachment {
    pub item_index: usize,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Instantâneo durável de uma prestação de contas em edição.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftEntry {
    /// Id da prestação de contas.
    pub id: Uuid,
    /// Cabeçalho conhecido da prestação de contas, para validar edições sem rede.
    #[serde(default)]
    pub accountability: Option<Accountability>,
    pub items: Vec<ExpenseItem>,
    pub attachments: Vec<DraftAttachment>,
    pub updated_at: DateTime<Utc>,
    pub synced: bool,
}

/// Estado de sincronização exibido ao usuário.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    Saved,
    Syncing,
    Synced,
    Error,
}

/// Conectividade observada externamente; só altera a mensagem exibida.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

/// Agendador puro de gravações com debounce.
///
/// Cada `touch` reinicia o prazo da chave. `take_due` devolve as chaves cujo
/// prazo venceu e as remove do conjunto pendente.
#[derive(Debug)]
pub struct DebounceScheduler {
    window: Duration,
    deadlines: HashMap<Uuid, Instant>,
}

impl DebounceScheduler {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadlines: HashMap::new(),
        }
    }

    pub fn touch(&mut self, key: Uuid, now: Instant) {
        self.deadlines.insert(key, now + self.window);
    }

    pub fn cancel(&mut self, key: Uuid) {
        self.deadlines.remove(&key);
    }

    pub fn is_pending(&self, key: Uuid) -> bool {
        self.deadlines.contains_key(&key)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    pub fn take_due(&mut self, now: Instant) -> Vec<Uuid> {
        let due: Vec<Uuid> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| *key)
            .collect();
        for key in &due {
            self.deadlines.remove(key);
        }
        due
    }

    /// Remove e devolve todas as chaves pendentes, vencidas ou não.
    pub fn take_all(&mut self) -> Vec<Uuid> {
        self.deadlines.drain().map(|(key, _)| key).collect()
    }
}

struct CacheState {
    scheduler: DebounceScheduler,
    // Instantâneos aguardando gravação (ainda não duráveis).
    pending: HashMap<Uuid, DraftEntry>,
    status: SyncStatus,
}

/// Cache durável de rascunhos, um arquivo JSON por chave.
#[derive(Clone)]
pub struct DraftCache {
    dir: Arc<PathBuf>,
    state: Arc<Mutex<CacheState>>,
}

impl DraftCache {
    /// Abre (criando se preciso) o diretório do cache.
    pub async fn open(dir: impl AsRef<Path>, debounce: Duration) -> Result<Self> {
        tokio::fs::create_dir_all(dir.as_ref()).await?;
        Ok(Self {
            dir: Arc::new(dir.as_ref().to_path_buf()),
            state: Arc::new(Mutex::new(CacheState {
                scheduler: DebounceScheduler::new(debounce),
                pending: HashMap::new(),
                status: SyncStatus::Idle,
            })),
        })
    }

    fn path_for(&self, key: Uuid) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut CacheState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Agenda a gravação do instantâneo. Nunca bloqueia.
    pub fn save(&self, key: Uuid, items: Vec<ExpenseItem>, attachments: Vec<DraftAttachment>) {
        self.save_at(key, items, attachments, Instant::now());
    }

    pub fn save_at(
        &self,
        key: Uuid,
        items: Vec<ExpenseItem>,
        attachments: Vec<DraftAttachment>,
        now: Instant,
    ) {
        let entry = DraftEntry {
            id: key,
            accountability: None,
            items,
            attachments,
            updated_at: Utc::now(),
            synced: false,
        };
        self.schedule(entry, now);
    }

    /// Agenda o instantâneo junto com o cabeçalho da prestação de contas.
    pub fn save_for(&self, accountability: &Accountability, items: Vec<ExpenseItem>, attachments: Vec<DraftAttachment>) {
        let entry = DraftEntry {
            id: accountability.id,
            accountability: Some(accountability.clone()),
            items,
            attachments,
            updated_at: Utc::now(),
            synced: false,
        };
        self.schedule(entry, Instant::now());
    }

    fn schedule(&self, entry: DraftEntry, now: Instant) {
        let key = entry.id;
        self.with_state(|state| {
            state.pending.insert(key, entry);
            state.scheduler.touch(key, now);
        });
    }

    /// Grava os instantâneos cujo prazo venceu. Falhas ficam pendentes para nova tentativa.
    pub async fn flush_due(&self, now: Instant) -> usize {
        let batch = self.with_state(|state| {
            let due = state.scheduler.take_due(now);
            due.into_iter()
                .filter_map(|key| state.pending.remove(&key))
                .collect::<Vec<_>>()
        });
        self.write_batch(batch, now).await
    }

    /// Grava todos os pendentes imediatamente (encerramento, testes).
    pub async fn flush_all(&self) -> usize {
        let batch = self.with_state(|state| {
            let keys = state.scheduler.take_all();
            keys.into_iter()
                .filter_map(|key| state.pending.remove(&key))
                .collect::<Vec<_>>()
        });
        self.write_batch(batch, Instant::now()).await
    }

    async fn write_batch(&self, batch: Vec<DraftEntry>, now: Instant) -> usize {
        if batch.is_empty() {
            return 0;
        }
        let mut written = 0;
        for entry in batch {
            match self.write_entry(&entry).await {
                Ok(()) => {
                    written += 1;
                    debug!(key = %entry.id, items = entry.items.len(), "draft persisted");
                }
                Err(err) => {
                    warn!(key = %entry.id, error = %err, "draft write failed, will retry");
                    let key = entry.id;
                    self.with_state(|state| {
                        // A newer snapshot saved meanwhile wins.
                        state.pending.entry(key).or_insert(entry);
                        state.scheduler.touch(key, now);
                        state.status = SyncStatus::Error;
                    });
                }
            }
        }
        if written > 0 {
            self.with_state(|state| {
                if state.status != SyncStatus::Error {
                    state.status = SyncStatus::Saved;
                }
            });
        }
        written
    }

    async fn write_entry(&self, entry: &DraftEntry) -> Result<()> {
        let target = self.path_for(entry.id);
        let tmp = target.with_extension("json.tmp");
        let json = serde_json::to_vec(entry)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &target).await?;
        Ok(())
    }

    /// Último instantâneo durável, se houver.
    pub async fn load(&self, key: Uuid) -> Result<Option<DraftEntry>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Instantâneo mais recente: o pendente em memória ou, na falta dele, o durável.
    pub async fn latest(&self, key: Uuid) -> Result<Option<DraftEntry>> {
        if let Some(entry) = self.with_state(|state| state.pending.get(&key).cloned()) {
            return Ok(Some(entry));
        }
        self.load(key).await
    }

    /// Descarta o rascunho local depois que o servidor aceitou os mesmos dados.
    pub async fn mark_synced(&self, key: Uuid) -> Result<()> {
        self.with_state(|state| {
            state.pending.remove(&key);
            state.scheduler.cancel(key);
        });
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.with_state(|state| state.status = SyncStatus::Synced);
        Ok(())
    }

    /// Descarta o rascunho sem sincronizá-lo. Retorna se havia algo a descartar.
    pub async fn discard(&self, key: Uuid) -> Result<bool> {
        let had_pending = self.with_state(|state| {
            state.scheduler.cancel(key);
            state.pending.remove(&key).is_some()
        });
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(had_pending),
            Err(err) => Err(err.into()),
        }
    }

    /// Rascunhos duráveis ainda não confirmados pelo servidor.
    pub async fn list_unsynced(&self) -> Result<Vec<DraftEntry>> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(self.dir.as_ref()).await?;
        while let Some(file) = dir.next_entry().await? {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<DraftEntry>(&bytes) {
                Ok(entry) if !entry.synced => entries.push(entry),
                Ok(_) => {}
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable draft"),
            }
        }
        entries.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(entries)
    }

    /// Rascunhos não confirmados, duráveis ou ainda em debounce.
    pub async fn pending_count(&self) -> Result<usize> {
        let mut keys: Vec<Uuid> = self.list_unsynced().await?.into_iter().map(|e| e.id).collect();
        let in_memory: Vec<Uuid> = self.with_state(|state| state.pending.keys().copied().collect());
        for key in in_memory {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        Ok(keys.len())
    }

    pub fn status(&self) -> SyncStatus {
        self.with_state(|state| state.status)
    }

    pub fn set_status(&self, status: SyncStatus) {
        self.with_state(|state| state.status = status);
    }

    /// Laço em segundo plano que grava os rascunhos vencidos a cada `tick`.
    pub fn spawn_flusher(&self, tick: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                cache.flush_due(Instant::now()).await;
            }
        })
    }
}

/// Mensagem do indicador de sincronização.
pub fn sync_banner(connectivity: Connectivity, status: SyncStatus, pending: usize) -> String {
    match (connectivity, status) {
        (Connectivity::Offline, _) if pending > 0 => {
            format!("Offline: {pending} rascunho(s) salvos neste dispositivo")
        }
        (Connectivity::Offline, _) => "Offline: alterações serão salvas localmente".to_string(),
        (Connectivity::Online, SyncStatus::Syncing) => "Sincronizando...".to_string(),
        (Connectivity::Online, SyncStatus::Error) => {
            "Falha ao salvar rascunho; nova tentativa automática".to_string()
        }
        (Connectivity::Online, _) if pending > 0 => {
            format!("{pending} rascunho(s) aguardando sincronização")
        }
        (Connectivity::Online, SyncStatus::Synced) => "Sincronizado".to_string(),
        (Connectivity::Online, _) => String::new(),
    }
}
