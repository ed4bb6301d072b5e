//! Erros do cliente de leitura assistida de comprovantes.

use thiserror::Error;

/// Falhas ao consultar o serviço de leitura de comprovantes.
///
/// Nenhuma delas bloqueia o lançamento de despesas: o formulário continua
/// disponível para preenchimento manual.
#[derive(Debug, Error)]
pub enum AssistError {
    /// O servidor retornou HTTP 429.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Erro HTTP retornado pela API (4xx/5xx).
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Falha de rede subjacente (DNS, conexão recusada, timeout).
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// A resposta não continha o JSON esperado.
    #[error("unreadable suggestion: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SuprimentoError;

    #[test]
    fn rate_limited_display() {
        let err = AssistError::RateLimited {
            retry_after_ms: 5000,
        };
        assert_eq!(err.to_string(), "rate limited, retry after 5000ms");
    }

    #[test]
    fn converts_to_network_failure() {
        let err: SuprimentoError = AssistError::Parse("no JSON object".into()).into();
        assert!(matches!(err, SuprimentoError::NetworkFailure(ref m) if m.contains("no JSON object")));
        assert!(!err.is_blocking());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AssistError>();
    }
}
