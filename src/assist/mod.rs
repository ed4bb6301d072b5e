//! Leitura assistida de comprovantes de despesa.
//!
//! Acelerador opcional do formulário de lançamento: a sugestão só
//! pré-preenche campos e nunca alimenta o cálculo de retenções.

pub mod client;
pub mod error;
pub mod types;

pub use client::AnthropicReceiptReader;
pub use error::AssistError;
pub use types::{MessagesRequest, MessagesResponse, ReceiptSuggestion};

use tracing::warn;

use crate::collab::StorageRef;
use crate::config::SuprimentoConfig;
use crate::ledger::ExpenseDraft;
use crate::state_machine::Role;

/// Serviço que lê a imagem de um comprovante e devolve um palpite estruturado.
#[allow(async_fn_in_trait)]
pub trait ReceiptReader: Send + Sync {
    async fn read_receipt(&self, image: &StorageRef, role_prompt: &str) -> Result<ReceiptSuggestion, AssistError>;
}

/// Instrução de sistema conforme quem está lendo o comprovante.
pub fn role_prompt(role: Role) -> &'static str {
    match role {
        Role::Requester | Role::System => {
            "Você auxilia um servidor do TJPA a lançar despesas de suprimento de fundos. \
             Leia o comprovante e extraia os dados do documento fiscal."
        }
        Role::Manager => {
            "Você auxilia o gestor responsável pelo atesto de despesas de suprimento de fundos. \
             Leia o comprovante e aponte se ele comprova uma despesa de pronto pagamento."
        }
        Role::Sosfu | Role::Sefin => {
            "Você é um analista de conformidade financeira do TJPA. Leia o comprovante, \
             extraia os dados e indique qualquer irregularidade fiscal, como falta de \
             identificação do fornecedor, data fora do período ou prestador pessoa física \
             sem retenções."
        }
    }
}

/// Leitor configurado, ou `None` quando não há chave da API.
pub fn configured_reader(config: &SuprimentoConfig) -> Result<Option<AnthropicReceiptReader>, AssistError> {
    if config.api_key.is_empty() {
        return Ok(None);
    }
    AnthropicReceiptReader::new(config.api_key.clone(), config.assistant_model.clone()).map(Some)
}

fn keep_typed(typed: String, suggested: String) -> String {
    if typed.trim().is_empty() { suggested } else { typed }
}

/// Completa o formulário digitado com a leitura do comprovante.
///
/// Campos já preenchidos prevalecem. Se o serviço falhar, o formulário segue
/// como foi digitado, apenas com o comprovante anexado.
pub async fn complete_expense(
    reader: &impl ReceiptReader,
    role: Role,
    receipt: &StorageRef,
    typed: ExpenseDraft,
) -> ExpenseDraft {
    let suggestion = match reader.read_receipt(receipt, role_prompt(role)).await {
        Ok(suggestion) => suggestion,
        Err(err) => {
            warn!(path = %receipt.path, error = %err, "receipt reading unavailable, keeping typed form");
            return ExpenseDraft {
                receipt: Some(receipt.clone()),
                ..typed
            };
        }
    };
    if !suggestion.compliant {
        warn!(
            path = %receipt.path,
            issue = suggestion.compliance_issue.as_deref().unwrap_or("-"),
            "receipt flagged as non-compliant"
        );
    }
    let suggested = suggestion.prefill(receipt);
    ExpenseDraft {
        date: typed.date.or(suggested.date),
        description: keep_typed(typed.description, suggested.description),
        supplier: keep_typed(typed.supplier, suggested.supplier),
        doc_type: keep_typed(typed.doc_type, suggested.doc_type),
        doc_number: keep_typed(typed.doc_number, suggested.doc_number),
        value: typed.value.or(suggested.value),
        element: keep_typed(typed.element, suggested.element),
        receipt: Some(receipt.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    struct Fixed(Option<ReceiptSuggestion>);

    impl ReceiptReader for Fixed {
        async fn read_receipt(&self, _image: &StorageRef, _role_prompt: &str) -> Result<ReceiptSuggestion, AssistError> {
            self.0
                .clone()
                .ok_or(AssistError::ApiError {
                    status: 503,
                    message: "overloaded".into(),
                })
        }
    }

    fn receipt() -> StorageRef {
        StorageRef {
            path: "processes/abc/recibo.jpg".into(),
            url: "https://files.tjpa.jus.br/processes/abc/recibo.jpg".into(),
        }
    }

    #[tokio::test]
    async fn suggestion_fills_only_blank_fields() {
        let reader = Fixed(Some(ReceiptSuggestion {
            doc_type: Some("Recibo".into()),
            doc_number: Some("12".into()),
            date: NaiveDate::from_ymd_opt(2026, 5, 4),
            supplier: Some("J. Silva".into()),
            value: Some(dec!(320.00)),
            suggested_element: Some("3.3.90.36".into()),
            compliant: true,
            compliance_issue: None,
        }));
        let typed = ExpenseDraft {
            description: "Reparo elétrico".into(),
            supplier: "João Silva".into(),
            value: Some(dec!(300.00)),
            ..Default::default()
        };

        let form = complete_expense(&reader, Role::Requester, &receipt(), typed).await;
        assert_eq!(form.supplier, "João Silva");
        assert_eq!(form.value, Some(dec!(300.00)));
        assert_eq!(form.element, "3.3.90.36");
        assert_eq!(form.doc_number, "12");
        assert_eq!(form.date, NaiveDate::from_ymd_opt(2026, 5, 4));
        assert_eq!(form.receipt, Some(receipt()));
    }

    #[tokio::test]
    async fn service_failure_keeps_typed_form() {
        let typed = ExpenseDraft {
            supplier: "João Silva".into(),
            value: Some(dec!(300.00)),
            element: "3.3.90.36".into(),
            ..Default::default()
        };
        let form = complete_expense(&Fixed(None), Role::Requester, &receipt(), typed.clone()).await;
        assert_eq!(form, ExpenseDraft { receipt: Some(receipt()), ..typed });
    }

    #[test]
    fn no_reader_without_api_key() {
        let config = SuprimentoConfig {
            api_key: String::new(),
            ..SuprimentoConfig::default()
        };
        assert!(configured_reader(&config).unwrap().is_none());
    }
}
