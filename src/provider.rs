//! Client for the WhatsApp Cloud API templated-message endpoint.
//!
//! Credentials are read from the [`SettingsStore`] on every call so that a
//! settings change takes effect without restarting a run.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::db::SettingsStore;
use crate::error::NotifyError;
use crate::models::{DispatchParameters, Settings};

const TEMPLATE_LANGUAGE: &str = "en_US";

/// Fields the send path cannot work without.
const REQUIRED_FOR_SEND: [&str; 3] = ["phone_number_id", "access_token", "endpoint"];
const REQUIRED_FOR_PROBE: [&str; 3] = ["waba_id", "access_token", "endpoint"];

/// One templated message to one recipient.
#[derive(Debug, Clone, Copy)]
pub struct OutboundMessage<'a> {
    pub recipient: &'a str,
    pub template_name: &'a str,
    pub parameters: &'a DispatchParameters,
}

/// Delivery boundary used by the dispatch loop. Every failure comes back as an
/// error value; nothing panics past this point.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_templated_message(&self, message: &OutboundMessage<'_>) -> Result<(), NotifyError>;
}

pub struct WhatsAppClient<S> {
    http: reqwest::Client,
    store: S,
}

impl<S: SettingsStore> WhatsAppClient<S> {
    /// `timeout` of `None` keeps reqwest's default (no overall timeout).
    pub fn new(store: S, timeout: Option<Duration>) -> Result<Self, NotifyError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self::with_client(builder.build()?, store))
    }

    /// Reuses an existing [`reqwest::Client`].
    pub fn with_client(http: reqwest::Client, store: S) -> Self {
        Self { http, store }
    }

    async fn settings_with(&self, required: &[&'static str]) -> Result<Settings, NotifyError> {
        let settings = self
            .store
            .load()
            .await?
            .ok_or(NotifyError::SettingsUnavailable)?;
        let missing = settings.blank_fields(required);
        if !missing.is_empty() {
            return Err(NotifyError::IncompleteSettings { missing });
        }
        Ok(settings)
    }

    /// Verifies the credentials by fetching the business profile name.
    pub async fn check_connection(&self) -> Result<String, NotifyError> {
        let settings = self.settings_with(&REQUIRED_FOR_PROBE).await?;
        let url = format!(
            "{}/{}/business_profiles",
            api_base(&settings.endpoint),
            settings.waba_id.trim()
        );

        let response = self
            .http
            .get(url)
            .query(&[("fields", "name")])
            .bearer_auth(settings.access_token.trim())
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        interpret_response(status, &body)?;

        business_name(&body).ok_or_else(|| NotifyError::ProviderRequestFailed {
            status: status.as_u16(),
            message: "connection succeeded but no business name came back, check the WABA ID"
                .to_string(),
        })
    }
}

#[async_trait]
impl<S: SettingsStore> MessageSender for WhatsAppClient<S> {
    async fn send_templated_message(&self, message: &OutboundMessage<'_>) -> Result<(), NotifyError> {
        let settings = self.settings_with(&REQUIRED_FOR_SEND).await?;
        let url = messages_url(&settings.endpoint, &settings.phone_number_id);

        let response = self
            .http
            .post(url)
            .bearer_auth(settings.access_token.trim())
            .json(&template_payload(message))
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        interpret_response(status, &body)
    }
}

pub fn messages_url(endpoint: &str, phone_number_id: &str) -> String {
    format!(
        "{}/{}/messages",
        endpoint.trim().trim_end_matches('/'),
        phone_number_id.trim()
    )
}

/// Endpoint with a trailing API version segment (`/v19.0`) removed.
pub fn api_base(endpoint: &str) -> &str {
    let trimmed = endpoint.trim().trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((base, segment)) if is_version_segment(segment) => base,
        _ => trimmed,
    }
}

fn is_version_segment(segment: &str) -> bool {
    let Some(version) = segment.strip_prefix('v') else {
        return false;
    };
    !version.is_empty()
        && version.chars().all(|c| c.is_ascii_digit() || c == '.')
        && version.starts_with(|c: char| c.is_ascii_digit())
}

pub fn template_payload(message: &OutboundMessage<'_>) -> Value {
    let parameters: Vec<Value> = message
        .parameters
        .as_slice()
        .iter()
        .map(|text| json!({ "type": "text", "text": text }))
        .collect();

    json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": message.recipient,
        "type": "template",
        "template": {
            "name": message.template_name,
            "language": { "code": TEMPLATE_LANGUAGE },
            "components": [
                { "type": "body", "parameters": parameters }
            ]
        }
    })
}

#[derive(Debug, Deserialize)]
struct BusinessProfiles {
    #[serde(default)]
    data: Vec<BusinessProfile>,
}

#[derive(Debug, Deserialize)]
struct BusinessProfile {
    name: Option<String>,
}

/// A request succeeded only with a 2xx status and no `error` value in the body.
pub fn interpret_response(status: StatusCode, body: &str) -> Result<(), NotifyError> {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let provider_error = parsed
        .as_ref()
        .and_then(|value| value.get("error"))
        .filter(|error| !error.is_null());

    if status.is_success() && provider_error.is_none() {
        return Ok(());
    }

    let message = match provider_error {
        Some(error) => provider_message(error, status),
        None if parsed.is_none() && !body.trim().is_empty() => body.trim().to_string(),
        None => fallback_message(status),
    };
    tracing::debug!(status = status.as_u16(), %message, "provider rejected request");

    Err(NotifyError::ProviderRequestFailed {
        status: status.as_u16(),
        message,
    })
}

/// Reads `message` and `error_data.details` when they are strings; any other
/// shape falls back to the status text.
fn provider_message(error: &Value, status: StatusCode) -> String {
    if let Some(text) = error.as_str().filter(|text| !text.is_empty()) {
        return text.to_string();
    }

    let mut message = error
        .get("message")
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| fallback_message(status));
    if let Some(details) = error
        .pointer("/error_data/details")
        .and_then(Value::as_str)
    {
        message.push_str(" Details: ");
        message.push_str(details);
    }
    message
}

fn fallback_message(status: StatusCode) -> String {
    format!(
        "API Error: {}",
        status.canonical_reason().unwrap_or(status.as_str())
    )
}

fn business_name(body: &str) -> Option<String> {
    let profiles: BusinessProfiles = serde_json::from_str(body).ok()?;
    profiles
        .data
        .into_iter()
        .next()
        .and_then(|profile| profile.name)
        .filter(|name| !name.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::models::DEFAULT_ENDPOINT;

    fn settings() -> Settings {
        Settings {
            phone_number_id: "1234".to_string(),
            waba_id: "5678".to_string(),
            access_token: "token".to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            fees_template_name: "fee_reminder".to_string(),
            marks_template_name: "marks_report".to_string(),
            lock_password: None,
        }
    }

    fn parameters() -> DispatchParameters {
        DispatchParameters(vec!["Asha (5A)".to_string(), "Term Fee".to_string()])
    }

    #[test]
    fn payload_carries_positional_text_parameters() {
        let parameters = parameters();
        let message = OutboundMessage {
            recipient: "+1555",
            template_name: "fee_reminder",
            parameters: &parameters,
        };

        let payload = template_payload(&message);
        assert_eq!(payload["messaging_product"], "whatsapp");
        assert_eq!(payload["to"], "+1555");
        assert_eq!(payload["template"]["name"], "fee_reminder");
        assert_eq!(payload["template"]["language"]["code"], "en_US");
        assert_eq!(
            payload["template"]["components"][0],
            json!({
                "type": "body",
                "parameters": [
                    { "type": "text", "text": "Asha (5A)" },
                    { "type": "text", "text": "Term Fee" }
                ]
            })
        );
    }

    #[test]
    fn messages_url_tolerates_trailing_slash() {
        assert_eq!(
            messages_url("https://graph.facebook.com/v19.0/", "1234"),
            "https://graph.facebook.com/v19.0/1234/messages"
        );
        assert_eq!(
            messages_url("https://proxy.example.com/wa", "1234"),
            "https://proxy.example.com/wa/1234/messages"
        );
    }

    #[test]
    fn api_base_drops_version_segment_only() {
        assert_eq!(api_base("https://graph.facebook.com/v19.0/"), "https://graph.facebook.com");
        assert_eq!(api_base("https://proxy.example.com/wa/"), "https://proxy.example.com/wa");
        assert_eq!(api_base("https://graph.facebook.com"), "https://graph.facebook.com");
    }

    #[test]
    fn unauthorized_response_surfaces_provider_message() {
        let err = interpret_response(
            StatusCode::UNAUTHORIZED,
            r#"{"error":{"message":"Invalid token","code":190}}"#,
        )
        .unwrap_err();
        match err {
            NotifyError::ProviderRequestFailed { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "Invalid token");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn provider_details_are_appended() {
        let err = interpret_response(
            StatusCode::BAD_REQUEST,
            r#"{"error":{"message":"Invalid parameter","error_data":{"details":"Parameter count mismatch"}}}"#,
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid parameter Details: Parameter count mismatch"
        );
    }

    #[test]
    fn error_object_on_success_status_is_a_failure() {
        let result = interpret_response(StatusCode::OK, r#"{"error":{"message":"Template paused"}}"#);
        assert_eq!(result.unwrap_err().to_string(), "Template paused");
        assert!(interpret_response(StatusCode::OK, r#"{"messages":[{"id":"wamid.1"}]}"#).is_ok());
    }

    #[test]
    fn error_object_with_odd_field_types_still_fails() {
        let err = interpret_response(
            StatusCode::OK,
            r#"{"error":{"message":131047,"type":"OAuthException"}}"#,
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "API Error: OK");

        let err = interpret_response(
            StatusCode::BAD_REQUEST,
            r#"{"error":{"message":"Invalid parameter","error_data":"bad"}}"#,
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Invalid parameter");
    }

    #[test]
    fn null_error_on_success_is_fine() {
        assert!(interpret_response(StatusCode::OK, r#"{"error":null,"messages":[]}"#).is_ok());
    }

    #[test]
    fn non_json_failures_fall_back_to_text() {
        let err = interpret_response(StatusCode::BAD_GATEWAY, "upstream timed out").unwrap_err();
        assert_eq!(err.to_string(), "upstream timed out");

        let err = interpret_response(StatusCode::SERVICE_UNAVAILABLE, "").unwrap_err();
        assert_eq!(err.to_string(), "API Error: Service Unavailable");
    }

    #[test]
    fn business_name_comes_from_first_profile() {
        assert_eq!(
            business_name(r#"{"data":[{"name":"Springfield School"}]}"#),
            Some("Springfield School".to_string())
        );
        assert_eq!(business_name(r#"{"data":[]}"#), None);
    }

    #[tokio::test]
    async fn absent_settings_fail_before_any_request() {
        let client = WhatsAppClient::new(MemoryStore::default(), None).expect("client");
        let parameters = parameters();
        let message = OutboundMessage {
            recipient: "+1555",
            template_name: "fee_reminder",
            parameters: &parameters,
        };

        let err = client.send_templated_message(&message).await.unwrap_err();
        assert!(matches!(err, NotifyError::SettingsUnavailable));
    }

    #[tokio::test]
    async fn blank_credentials_are_reported_by_name() {
        let mut incomplete = settings();
        incomplete.access_token = " ".to_string();
        incomplete.endpoint = String::new();
        let client = WhatsAppClient::new(MemoryStore::with(incomplete), None).expect("client");
        let parameters = parameters();
        let message = OutboundMessage {
            recipient: "+1555",
            template_name: "fee_reminder",
            parameters: &parameters,
        };

        let err = client.send_templated_message(&message).await.unwrap_err();
        match err {
            NotifyError::IncompleteSettings { missing } => {
                assert_eq!(missing, vec!["access_token", "endpoint"])
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn connection_check_needs_waba_id() {
        let mut incomplete = settings();
        incomplete.waba_id = String::new();
        let client = WhatsAppClient::new(MemoryStore::with(incomplete), None).expect("client");

        let err = client.check_connection().await.unwrap_err();
        assert!(matches!(err, NotifyError::IncompleteSettings { .. }));
    }

    /// Serves one canned response on a local port and hands back the raw request.
    async fn serve_once(
        status_line: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            while !request_complete(&request) {
                let read = socket.read(&mut buf).await.expect("read request");
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..read]);
            }
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket
                .write_all(response.as_bytes())
                .await
                .expect("write response");
            let _ = socket.shutdown().await;
            String::from_utf8_lossy(&request).into_owned()
        });
        (format!("http://{addr}/v19.0/"), handle)
    }

    fn request_complete(raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        let Some((head, body)) = text.split_once("\r\n\r\n") else {
            return false;
        };
        let length = head
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        body.len() >= length
    }

    fn client_for(endpoint: String) -> WhatsAppClient<MemoryStore> {
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .expect("http client");
        let mut settings = settings();
        settings.endpoint = endpoint;
        WhatsAppClient::with_client(http, MemoryStore::with(settings))
    }

    #[tokio::test]
    async fn rejected_send_carries_provider_message_over_http() {
        let (endpoint, server) =
            serve_once("401 Unauthorized", r#"{"error":{"message":"Invalid token"}}"#).await;
        let client = client_for(endpoint);
        let parameters = parameters();
        let message = OutboundMessage {
            recipient: "+1555",
            template_name: "fee_reminder",
            parameters: &parameters,
        };

        let err = client.send_templated_message(&message).await.unwrap_err();
        let request = server.await.expect("stub task");

        assert!(request.starts_with("POST /v19.0/1234/messages HTTP/1.1\r\n"));
        assert!(request
            .to_ascii_lowercase()
            .contains("authorization: bearer token\r\n"));
        assert!(request.contains(r#""name":"fee_reminder""#));
        assert!(request.contains(r#""to":"+1555""#));
        match err {
            NotifyError::ProviderRequestFailed { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "Invalid token");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn accepted_send_is_ok_over_http() {
        let (endpoint, server) =
            serve_once("200 OK", r#"{"messages":[{"id":"wamid.1"}]}"#).await;
        let client = client_for(endpoint);
        let parameters = parameters();
        let message = OutboundMessage {
            recipient: "+1555",
            template_name: "fee_reminder",
            parameters: &parameters,
        };

        client
            .send_templated_message(&message)
            .await
            .expect("send succeeds");
        server.await.expect("stub task");
    }
}
