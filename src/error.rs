use thiserror::Error;

const DIAGNOSTIC_BODY_LIMIT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Configuration,
    Transport,
    Payload,
    Upstream,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Transport => "transport",
            Self::Payload => "payload",
            Self::Upstream => "upstream",
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("missing configuration: {0}")]
    MissingConfiguration(&'static str),
    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("json decode error: {0}")]
    SimdJson(#[from] simd_json::Error),
    #[error("float parse error: {0}")]
    ParseFloat(#[from] std::num::ParseFloatError),
    #[error("upstream responded with status {status} (content-type: {content_type}): {body}")]
    UpstreamStatus {
        status: u16,
        content_type: String,
        body: String,
    },
    #[error("upstream responded with non-json content-type {content_type}: {body}")]
    UnexpectedContentType { content_type: String, body: String },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("transport closed: {0}")]
    TransportClosed(String),
    #[error("timed out while {0}")]
    Timeout(&'static str),
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}

impl AppError {
    pub fn failure_class(&self) -> FailureClass {
        match self {
            Self::InvalidArgument(_) | Self::MissingConfiguration(_) => {
                FailureClass::Configuration
            }
            Self::SimdJson(_) | Self::ParseFloat(_) | Self::InvalidPayload(_) => {
                FailureClass::Payload
            }
            Self::UpstreamStatus { .. } | Self::UnexpectedContentType { .. } => {
                FailureClass::Upstream
            }
            Self::Reqwest(error) if error.is_decode() => FailureClass::Payload,
            Self::Reqwest(_) | Self::WebSocket(_) | Self::TransportClosed(_) | Self::Timeout(_) => {
                FailureClass::Transport
            }
        }
    }
}

pub fn truncate_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= DIAGNOSTIC_BODY_LIMIT {
        return trimmed.to_string();
    }

    let mut end = DIAGNOSTIC_BODY_LIMIT;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &trimmed[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errors_by_recovery_path() {
        assert_eq!(
            AppError::MissingConfiguration("base url").failure_class(),
            FailureClass::Configuration
        );
        assert_eq!(
            AppError::InvalidPayload("price missing".to_string()).failure_class(),
            FailureClass::Payload
        );
        assert_eq!(
            AppError::UpstreamStatus {
                status: 502,
                content_type: "text/html".to_string(),
                body: "bad gateway".to_string(),
            }
            .failure_class(),
            FailureClass::Upstream
        );
        assert_eq!(
            AppError::TransportClosed("eof".to_string()).failure_class(),
            FailureClass::Transport
        );
    }

    #[test]
    fn truncates_long_bodies_on_char_boundary() {
        let body = "é".repeat(400);
        let truncated = truncate_body(&body);
        assert!(truncated.ends_with('…'));
        assert!(truncated.len() <= DIAGNOSTIC_BODY_LIMIT + '…'.len_utf8());
    }

    #[test]
    fn keeps_short_bodies_intact() {
        assert_eq!(truncate_body("  <html>oops</html>\n"), "<html>oops</html>");
    }
}
