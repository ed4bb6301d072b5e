//! Tipos da API Messages e da sugestão extraída de um comprovante.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::error::AssistError;
use crate::collab::StorageRef;
use crate::ledger::ExpenseDraft;

/// Corpo da requisição para `/v1/messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// "user" ou "assistant".
    pub role: String,
    pub content: Vec<ContentPart>,
}

/// Parte de uma mensagem enviada: texto ou imagem referenciada por URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    Url { url: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    pub content: Vec<ContentBlock>,
    pub model: String,
    pub stop_reason: Option<String>,
    pub usage: Usage,
}

impl MessagesResponse {
    /// Concatenação dos blocos de texto da resposta.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter(|b| b.content_type == "text")
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Bloco de conteúdo da resposta. `type` no JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Leitura estruturada de um comprovante. Todos os campos são palpites.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiptSuggestion {
    pub doc_type: Option<String>,
    pub doc_number: Option<String>,
    pub date: Option<NaiveDate>,
    pub supplier: Option<String>,
    pub value: Option<Decimal>,
    /// Código do elemento de despesa sugerido, ex. `3.3.90.30`.
    pub suggested_element: Option<String>,
    pub compliant: bool,
    pub compliance_issue: Option<String>,
}

impl ReceiptSuggestion {
    /// Extrai o primeiro objeto JSON do texto do modelo, tolerando cercas de código.
    pub fn parse(text: &str) -> Result<Self, AssistError> {
        let start = text.find('{');
        let end = text.rfind('}');
        let (Some(start), Some(end)) = (start, end) else {
            return Err(AssistError::Parse("no JSON object in answer".into()));
        };
        if end < start {
            return Err(AssistError::Parse("malformed JSON object in answer".into()));
        }
        serde_json::from_str(&text[start..=end]).map_err(|e| AssistError::Parse(e.to_string()))
    }

    /// Pré-preenche o formulário de despesa. Retenções nunca vêm da sugestão;
    /// o livro as recalcula a partir do valor bruto.
    pub fn prefill(&self, receipt: &StorageRef) -> ExpenseDraft {
        ExpenseDraft {
            date: self.date,
            description: self.doc_type.clone().unwrap_or_default(),
            supplier: self.supplier.clone().unwrap_or_default(),
            doc_type: self.doc_type.clone().unwrap_or_default(),
            doc_number: self.doc_number.clone().unwrap_or_default(),
            value: self.value,
            element: self.suggested_element.clone().unwrap_or_default(),
            receipt: Some(receipt.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn image_part_serializes_in_api_shape() {
        let part = ContentPart::Image {
            source: ImageSource::Url {
                url: "https://files.example/r.jpg".into(),
            },
        };
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["type"], "image");
        assert_eq!(json["source"]["type"], "url");
        assert_eq!(json["source"]["url"], "https://files.example/r.jpg");
    }

    #[test]
    fn response_text_joins_blocks() {
        let api_json = r#"{
            "id": "msg_123",
            "content": [{"type": "text", "text": "{\"supplier\":"}, {"type": "text", "text": " \"Posto\"}"}],
            "model": "claude-haiku-4-5-20251001",
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 5, "output_tokens": 15}
        }"#;
        let resp: MessagesResponse = serde_json::from_str(api_json).unwrap();
        assert_eq!(resp.text(), "{\"supplier\": \"Posto\"}");
    }

    #[test]
    fn parse_tolerates_code_fences_and_numbers() {
        let text = "```json\n{\"doc_type\": \"NF\", \"date\": \"2026-05-04\", \"supplier\": \"Papelaria Central\", \"value\": 150.5, \"suggested_element\": \"3.3.90.30\", \"compliant\": true}\n```";
        let suggestion = ReceiptSuggestion::parse(text).unwrap();
        assert_eq!(suggestion.value, Some(dec!(150.5)));
        assert_eq!(suggestion.date, NaiveDate::from_ymd_opt(2026, 5, 4));
        assert!(suggestion.compliant);
        assert!(suggestion.compliance_issue.is_none());
    }

    #[test]
    fn parse_rejects_prose() {
        let err = ReceiptSuggestion::parse("Não consegui ler o documento.").unwrap_err();
        assert!(matches!(err, AssistError::Parse(_)));
    }

    #[test]
    fn prefill_carries_receipt_and_no_withholding() {
        let receipt = StorageRef {
            path: "processes/x/recibo.jpg".into(),
            url: "file:///tmp/recibo.jpg".into(),
        };
        let suggestion = ReceiptSuggestion {
            supplier: Some("João Silva".into()),
            value: Some(dec!(500.00)),
            suggested_element: Some("3.3.90.36".into()),
            ..Default::default()
        };
        let draft = suggestion.prefill(&receipt);
        assert_eq!(draft.receipt, Some(receipt));
        assert_eq!(draft.element, "3.3.90.36");
        assert_eq!(draft.value, Some(dec!(500.00)));
    }
}
