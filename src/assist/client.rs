use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use super::error::AssistError;
use super::types::{ContentPart, ImageSource, Message, MessagesRequest, MessagesResponse, ReceiptSuggestion};
use super::ReceiptReader;
use crate::collab::StorageRef;

const API_URL: &str = "https://api.anthropic.com/v1/messages";

const ANSWER_FORMAT: &str = "Responda APENAS com um objeto JSON com os campos: \
doc_type (NF, Recibo, Cupom Fiscal ou outro), doc_number, date (YYYY-MM-DD), \
supplier, value (número, valor total), suggested_element (um de 3.3.90.30, \
3.3.90.33, 3.3.90.36, 3.3.90.39), compliant (booleano) e compliance_issue \
(texto curto ou null).";

/// Leitor de comprovantes sobre a API Messages da Anthropic.
pub struct AnthropicReceiptReader {
    api_key: String,
    model: String,
    client: Client,
    base_url: String,
}

impl AnthropicReceiptReader {
    pub fn new(api_key: String, model: String) -> Result<Self, AssistError> {
        Self::with_base_url(api_key, model, API_URL.to_string())
    }

    /// Cliente apontando para outra URL base (testes).
    pub fn with_base_url(api_key: String, model: String, base_url: String) -> Result<Self, AssistError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            api_key,
            model,
            client,
            base_url,
        })
    }

    pub async fn send_message(&self, req: &MessagesRequest) -> Result<MessagesResponse, AssistError> {
        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(req)
            .send()
            .await?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(1000);
            return Err(AssistError::RateLimited {
                retry_after_ms: retry_after,
            });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(AssistError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json::<MessagesResponse>().await?)
    }

    fn receipt_request(&self, image: &StorageRef, role_prompt: &str) -> MessagesRequest {
        MessagesRequest {
            model: self.model.clone(),
            max_tokens: 512,
            system: Some(role_prompt.to_string()),
            messages: vec![Message {
                role: "user".into(),
                content: vec![
                    ContentPart::Image {
                        source: ImageSource::Url {
                            url: image.url.clone(),
                        },
                    },
                    ContentPart::Text {
                        text: ANSWER_FORMAT.to_string(),
                    },
                ],
            }],
        }
    }
}

impl ReceiptReader for AnthropicReceiptReader {
    async fn read_receipt(&self, image: &StorageRef, role_prompt: &str) -> Result<ReceiptSuggestion, AssistError> {
        let response = self.send_message(&self.receipt_request(image, role_prompt)).await?;
        debug!(
            path = %image.path,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "receipt read"
        );
        ReceiptSuggestion::parse(&response.text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assist::role_prompt;
    use crate::state_machine::Role;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{body_partial_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn receipt() -> StorageRef {
        StorageRef {
            path: "processes/abc/recibo.jpg".into(),
            url: "https://files.tjpa.jus.br/processes/abc/recibo.jpg".into(),
        }
    }

    fn answer(text: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "msg_1",
            "content": [{"type": "text", "text": text}],
            "model": "claude-haiku-4-5-20251001",
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 900, "output_tokens": 80}
        })
    }

    async fn reader(server: &MockServer) -> AnthropicReceiptReader {
        AnthropicReceiptReader::with_base_url(
            "test-key".into(),
            "claude-haiku-4-5-20251001".into(),
            format!("{}/v1/messages", server.uri()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn reads_suggestion_from_image_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-api-key", "test-key"))
            .and(body_partial_json(serde_json::json!({
                "model": "claude-haiku-4-5-20251001",
                "messages": [{"role": "user", "content": [{
                    "type": "image",
                    "source": {"type": "url", "url": "https://files.tjpa.jus.br/processes/abc/recibo.jpg"}
                }]}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(answer(
                r#"{"doc_type": "Recibo", "date": "2026-05-04", "supplier": "João Silva", "value": 500.00, "suggested_element": "3.3.90.36", "compliant": false, "compliance_issue": "Recibo sem CPF do prestador"}"#,
            )))
            .mount(&server)
            .await;

        let suggestion = reader(&server)
            .await
            .read_receipt(&receipt(), role_prompt(Role::Requester))
            .await
            .unwrap();
        assert_eq!(suggestion.supplier.as_deref(), Some("João Silva"));
        assert_eq!(suggestion.value, Some(dec!(500.00)));
        assert!(!suggestion.compliant);
        assert_eq!(suggestion.compliance_issue.as_deref(), Some("Recibo sem CPF do prestador"));
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
            .mount(&server)
            .await;

        let err = reader(&server)
            .await
            .read_receipt(&receipt(), role_prompt(Role::Sosfu))
            .await
            .unwrap_err();
        assert!(matches!(err, AssistError::RateLimited { retry_after_ms: 3000 }));
    }

    #[tokio::test]
    async fn api_error_keeps_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid x-api-key"))
            .mount(&server)
            .await;

        let err = reader(&server)
            .await
            .read_receipt(&receipt(), role_prompt(Role::Requester))
            .await
            .unwrap_err();
        assert!(matches!(err, AssistError::ApiError { status: 401, .. }));
    }

    #[tokio::test]
    async fn prose_answer_is_a_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(answer("Imagem ilegível.")))
            .mount(&server)
            .await;

        let err = reader(&server)
            .await
            .read_receipt(&receipt(), role_prompt(Role::Requester))
            .await
            .unwrap_err();
        assert!(matches!(err, AssistError::Parse(_)));
    }
}
