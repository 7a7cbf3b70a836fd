//! Transactional email gateway abstraction and its HTTP implementation.

use std::time::Duration;

use futures_util::future::BoxFuture;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::error::GatewayError;
use crate::config::{DeliveryConfig, GatewayConfig};
use crate::models::enums::Severity;

/// One outbound alert. HTML body with a plain-text fallback, no attachments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
    pub priority: Severity,
}

impl EmailMessage {
    /// Headers that flag the message as high importance in mail clients.
    pub fn priority_headers(&self) -> [(&'static str, &'static str); 2] {
        [("X-Priority", "1"), ("Importance", "high")]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReceipt {
    /// Gateway-assigned id, when the gateway returns one.
    pub message_id: Option<String>,
}

/// Sends one message. Implementations classify every failure as
/// transient or permanent; the worker owns retries.
pub trait EmailGateway: Send + Sync {
    fn name(&self) -> &str;

    fn send<'a>(&'a self, message: &'a EmailMessage)
        -> BoxFuture<'a, Result<SendReceipt, GatewayError>>;
}

/// `"Name <address>"` sender line.
pub fn sender_line(config: &DeliveryConfig) -> String {
    format!("{} <{}>", config.sender_name, config.sender_email)
}

// ═══════════════════════════════════════════
// HTTP gateway
// ═══════════════════════════════════════════

#[derive(Serialize)]
struct SendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
    text: &'a str,
    headers: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct SendResponse {
    #[serde(default)]
    id: Option<String>,
}

/// JSON-over-HTTP transactional email API with bearer-token auth.
pub struct HttpEmailGateway {
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
    timeout_secs: u64,
}

impl HttpEmailGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            endpoint: config.endpoint.trim().to_string(),
            api_key: config.api_key.clone(),
            client,
            timeout_secs: config.timeout_secs,
        })
    }

    async fn post(&self, message: &EmailMessage) -> Result<SendReceipt, GatewayError> {
        let headers = message
            .priority_headers()
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::from(*v)))
            .collect();
        let body = SendRequest {
            from: &message.from,
            to: [&message.to],
            subject: &message.subject,
            html: &message.html,
            text: &message.text,
            headers,
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        for (name, value) in message.priority_headers() {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Transient(format!("request timed out after {}s", self.timeout_secs))
            } else if e.is_connect() {
                GatewayError::Transient(format!("cannot connect to email gateway: {e}"))
            } else {
                GatewayError::Transient(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        // A 2xx without a parsable body still means accepted.
        let parsed = response.json::<SendResponse>().await.ok();
        Ok(SendReceipt {
            message_id: parsed.and_then(|r| r.id),
        })
    }
}

impl EmailGateway for HttpEmailGateway {
    fn name(&self) -> &str {
        "http"
    }

    fn send<'a>(
        &'a self,
        message: &'a EmailMessage,
    ) -> BoxFuture<'a, Result<SendReceipt, GatewayError>> {
        Box::pin(self.post(message))
    }
}

/// Map a non-2xx response to retry semantics. Auth and throttling
/// problems are the gateway's, not the message's, so they retry.
pub fn classify_status(status: StatusCode, body: &str) -> GatewayError {
    let body: String = body.chars().take(200).collect();
    let detail = format!("HTTP {}: {}", status.as_u16(), body.trim());
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
    {
        GatewayError::Transient(detail)
    } else {
        GatewayError::Permanent(detail)
    }
}

// ═══════════════════════════════════════════
// Unconfigured gateway
// ═══════════════════════════════════════════

/// Stand-in when no endpoint is configured. Every send fails transiently,
/// so rows keep their retry budget until an operator fixes the config.
pub struct UnconfiguredGateway;

impl EmailGateway for UnconfiguredGateway {
    fn name(&self) -> &str {
        "unconfigured"
    }

    fn send<'a>(
        &'a self,
        _message: &'a EmailMessage,
    ) -> BoxFuture<'a, Result<SendReceipt, GatewayError>> {
        Box::pin(async {
            Err(GatewayError::Transient(
                "email gateway not configured (gateway.endpoint is empty)".into(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_throttling_are_transient() {
        for code in [500, 502, 503, 429, 408, 401, 403] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(classify_status(status, "").is_transient(), "{code}");
        }
    }

    #[test]
    fn rejected_messages_are_permanent() {
        for code in [400, 404, 422] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(!classify_status(status, "bad address").is_transient(), "{code}");
        }
    }

    #[test]
    fn error_detail_is_bounded() {
        let err = classify_status(StatusCode::BAD_REQUEST, &"x".repeat(5000));
        assert!(err.to_string().len() < 300);
    }

    #[test]
    fn sender_line_format() {
        assert_eq!(
            sender_line(&DeliveryConfig::default()),
            "Redflag Critical Findings <alerts@redflag.local>"
        );
    }

    #[tokio::test]
    async fn unconfigured_gateway_fails_transiently() {
        let msg = EmailMessage {
            from: "a@b.org".into(),
            to: "c@d.org".into(),
            subject: "s".into(),
            html: "<p>h</p>".into(),
            text: "t".into(),
            priority: Severity::Critical,
        };
        let err = UnconfiguredGateway.send(&msg).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transient() {
        let gateway = HttpEmailGateway::new(&GatewayConfig {
            // Port 9 (discard) on localhost: connection refused.
            endpoint: "http://127.0.0.1:9/send".into(),
            api_key: "k".into(),
            timeout_secs: 2,
        })
        .unwrap();
        let msg = EmailMessage {
            from: "a@b.org".into(),
            to: "c@d.org".into(),
            subject: "s".into(),
            html: "<p>h</p>".into(),
            text: "t".into(),
            priority: Severity::Critical,
        };
        let err = gateway.send(&msg).await.unwrap_err();
        assert!(err.is_transient(), "{err}");
    }
}
