//! Configuração carregada a partir de `suprimento.toml`.
//!
//! A struct [`SuprimentoConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `ANTHROPIC_API_KEY` tem precedência sobre o arquivo.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;

/// Configuração de nível superior carregada de `suprimento.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuprimentoConfig {
    /// Prazo, em dias, para a prestação de contas após o pagamento.
    #[serde(default = "default_deadline_days")]
    pub accountability_deadline_days: i64,

    /// Saldo abaixo do qual a devolução (GDR) não é exigida.
    #[serde(default = "default_balance_epsilon", with = "rust_decimal::serde::str")]
    pub balance_epsilon: Decimal,

    /// Janela de debounce do cache de rascunhos, em milissegundos.
    #[serde(default = "default_draft_debounce_ms")]
    pub draft_debounce_ms: u64,

    /// Diretório dos rascunhos locais.
    #[serde(default = "default_draft_dir")]
    pub draft_dir: PathBuf,

    /// Entradas exibidas na trilha de auditoria antes de "carregar mais".
    #[serde(default = "default_audit_page_size")]
    pub audit_page_size: usize,

    /// Dias sem movimentação para um processo ser considerado parado.
    #[serde(default = "default_stale_threshold_days")]
    pub stale_threshold_days: i64,

    /// Modelo usado na leitura de comprovantes.
    #[serde(default = "default_assistant_model")]
    pub assistant_model: String,

    /// Chave da API Anthropic.
    #[serde(default)]
    pub api_key: String,
}

// Prazo legal padrão: 30 dias.
fn default_deadline_days() -> i64 {
    30
}

// Um centavo.
fn default_balance_epsilon() -> Decimal {
    dec!(0.01)
}

fn default_draft_debounce_ms() -> u64 {
    2000
}

fn default_draft_dir() -> PathBuf {
    PathBuf::from(".suprimento/drafts")
}

fn default_audit_page_size() -> usize {
    20
}

fn default_stale_threshold_days() -> i64 {
    7
}

fn default_assistant_model() -> String {
    "claude-haiku-4-5-20251001".to_string()
}

impl Default for SuprimentoConfig {
    fn default() -> Self {
        Self {
            accountability_deadline_days: default_deadline_days(),
            balance_epsilon: default_balance_epsilon(),
            draft_debounce_ms: default_draft_debounce_ms(),
            draft_dir: default_draft_dir(),
            audit_page_size: default_audit_page_size(),
            stale_threshold_days: default_stale_threshold_days(),
            assistant_model: default_assistant_model(),
            api_key: String::new(),
        }
    }
}

impl SuprimentoConfig {
    /// Carrega a configuração de `suprimento.toml` no diretório atual.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("suprimento.toml"))
    }

    /// Carrega de um caminho explícito. Usa valores padrão se o arquivo não existir.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<SuprimentoConfig>(&contents)?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo de configuração para a chave API.
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY")
            && !key.is_empty()
        {
            config.api_key = key;
        }

        Ok(config)
    }

    pub fn draft_debounce(&self) -> Duration {
        Duration::from_millis(self.draft_debounce_ms)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            deadline_days: self.accountability_deadline_days,
            balance_epsilon: self.balance_epsilon,
            audit_page_size: self.audit_page_size,
            stale_threshold_days: self.stale_threshold_days,
        }
    }
}

/// Parâmetros de regra de negócio repassados ao motor, ao livro-razão e à auditoria.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub deadline_days: i64,
    pub balance_epsilon: Decimal,
    pub audit_page_size: usize,
    pub stale_threshold_days: i64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        SuprimentoConfig::default().engine_settings()
    }
}
