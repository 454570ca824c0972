use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::credentials::{CredentialsError, TokenSource};

/// Upper bound for one FCM or OAuth round trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds the HTTP client shared by the token exchange and message sends.
/// Every request is bounded by `request_timeout` so a stalled endpoint
/// surfaces as a transport failure instead of blocking the caller.
pub fn http_client(request_timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(request_timeout)
        .connect_timeout(CONNECT_TIMEOUT.min(request_timeout))
        .build()
}

/// Content pushed to every device of a notification.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    pub image_url: Option<String>,
    pub data: BTreeMap<String, String>,
}

impl PushMessage {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            ..Self::default()
        }
    }

    /// Flattens a JSON object into the string map FCM expects.
    /// Non-string values are serialised as JSON text.
    pub fn with_data(mut self, data: &Value) -> Self {
        if let Some(object) = data.as_object() {
            for (key, value) in object {
                let text = match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                self.data.insert(key.clone(), text);
            }
        }
        self
    }

    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

#[derive(Serialize)]
struct SendRequest<'a> {
    message: WireMessage<'a>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    token: &'a str,
    notification: WireNotification<'a>,
    #[serde(skip_serializing_if = "no_entries")]
    data: &'a BTreeMap<String, String>,
}

fn no_entries(data: &&BTreeMap<String, String>) -> bool {
    data.is_empty()
}

#[derive(Serialize)]
struct WireNotification<'a> {
    title: &'a str,
    body: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<&'a str>,
}

#[derive(Deserialize)]
struct SendResponse {
    name: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(rename = "errorCode", default)]
    error_code: Option<String>,
}

/// Why FCM refused a single device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub status: Option<StatusCode>,
    pub code: String,
    pub message: String,
}

impl DeliveryFailure {
    /// The token is gone for good and should be forgotten.
    pub fn is_unregistered(&self) -> bool {
        matches!(self.code.as_str(), "UNREGISTERED" | "NOT_FOUND")
    }
}

/// Per-device result of a multicast send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenOutcome {
    pub token: String,
    pub result: Result<String, DeliveryFailure>,
}

/// Aggregated result of sending one message to many devices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub outcomes: Vec<TokenOutcome>,
}

impl DeliveryReport {
    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.outcomes.len() - self.success_count()
    }

    /// Message id of the first accepted device, if any.
    pub fn first_message_id(&self) -> Option<&str> {
        self.outcomes
            .iter()
            .find_map(|o| o.result.as_ref().ok().map(String::as_str))
    }

    pub fn unregistered_tokens(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| matches!(&o.result, Err(failure) if failure.is_unregistered()))
            .map(|o| o.token.clone())
            .collect()
    }
}

/// Errors that abort a send before any device is contacted.
#[derive(Debug, Error)]
pub enum PushError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("failed to obtain access token: {0}")]
    Credentials(#[from] CredentialsError),
}

/// Client for the FCM HTTP v1 `messages:send` endpoint.
#[derive(Clone)]
pub struct FcmClient {
    http: Client,
    base_url: Url,
    project_id: String,
    tokens: TokenSource,
}

impl FcmClient {
    pub fn new(project_id: impl Into<String>, base_url: Url, tokens: TokenSource, http: Client) -> Self {
        Self {
            http,
            base_url,
            project_id: project_id.into(),
            tokens,
        }
    }

    /// Sends `message` to each device token individually.
    ///
    /// Per-device failures, including transport errors, are recorded in the report
    /// rather than returned as errors.
    pub async fn send_multicast(
        &self,
        message: &PushMessage,
        device_tokens: &[String],
        now: DateTime<Utc>,
    ) -> Result<DeliveryReport, PushError> {
        if device_tokens.is_empty() {
            return Ok(DeliveryReport::default());
        }

        let url = self
            .base_url
            .join(&format!("v1/projects/{}/messages:send", self.project_id))?;
        let access_token = self.tokens.access_token(now).await?;

        let mut outcomes = Vec::with_capacity(device_tokens.len());
        for token in device_tokens {
            let result = self.send_one(&url, &access_token, message, token).await;
            if let Err(failure) = &result {
                tracing::warn!(
                    stage = "push",
                    code = %failure.code,
                    message = %failure.message,
                    "fcm rejected device"
                );
            }
            outcomes.push(TokenOutcome {
                token: token.clone(),
                result,
            });
        }

        Ok(DeliveryReport { outcomes })
    }

    async fn send_one(
        &self,
        url: &Url,
        access_token: &str,
        message: &PushMessage,
        token: &str,
    ) -> Result<String, DeliveryFailure> {
        let request = SendRequest {
            message: WireMessage {
                token,
                notification: WireNotification {
                    title: &message.title,
                    body: &message.body,
                    image: message.image_url.as_deref(),
                },
                data: &message.data,
            },
        };

        let response = self
            .http
            .post(url.clone())
            .bearer_auth(access_token)
            .json(&request)
            .send()
            .await
            .map_err(transport_failure)?;

        let status = response.status();
        if status.is_success() {
            let body: SendResponse = response.json().await.map_err(transport_failure)?;
            return Ok(body.name);
        }

        let text = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        Err(classify_failure(status, &text))
    }
}

fn transport_failure(err: reqwest::Error) -> DeliveryFailure {
    DeliveryFailure {
        status: err.status(),
        code: "TRANSPORT".to_string(),
        message: err.to_string(),
    }
}

fn classify_failure(status: StatusCode, body: &str) -> DeliveryFailure {
    let parsed = serde_json::from_str::<ErrorEnvelope>(body).ok();
    let code = parsed
        .as_ref()
        .and_then(|env| env.error.details.iter().find_map(|d| d.error_code.clone()))
        .or_else(|| parsed.as_ref().and_then(|env| env.error.status.clone()))
        .unwrap_or_else(|| status.as_str().to_string());
    let message = parsed
        .and_then(|env| env.error.message)
        .unwrap_or_else(|| body.to_string());
    DeliveryFailure {
        status: Some(status),
        code,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{tests::test_key, ServiceAccountTokenSource};
    use httpmock::prelude::*;
    use serde_json::json;

    fn client(server: &MockServer, tokens: TokenSource) -> FcmClient {
        FcmClient::new(
            "classroom",
            Url::parse(&server.url("/")).expect("url"),
            tokens,
            Client::new(),
        )
    }

    #[test]
    fn data_values_are_flattened_to_strings() {
        let message = PushMessage::new("t", "b")
            .with_data(&json!({ "lessonId": 7, "kind": "lesson", "nested": { "a": true } }))
            .with_entry("notificationId", "3");
        assert_eq!(message.data["lessonId"], "7");
        assert_eq!(message.data["kind"], "lesson");
        assert_eq!(message.data["nested"], "{\"a\":true}");
        assert_eq!(message.data["notificationId"], "3");
    }

    #[tokio::test]
    async fn reports_per_device_results() {
        let server = MockServer::start_async().await;
        let accepted = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/projects/classroom/messages:send")
                    .header("Authorization", "Bearer static-token")
                    .body_contains("\"token\":\"good-device\"")
                    .body_contains("\"title\":\"Hello\"");
                then.status(200)
                    .json_body(json!({ "name": "projects/classroom/messages/42" }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/projects/classroom/messages:send")
                    .body_contains("\"token\":\"stale-device\"");
                then.status(404).json_body(json!({
                    "error": {
                        "code": 404,
                        "message": "Requested entity was not found.",
                        "status": "NOT_FOUND",
                        "details": [{
                            "@type": "type.googleapis.com/google.firebase.fcm.v1.FcmError",
                            "errorCode": "UNREGISTERED"
                        }]
                    }
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/projects/classroom/messages:send")
                    .body_contains("\"token\":\"bad-device\"");
                then.status(400).body("garbage");
            })
            .await;

        let client = client(&server, TokenSource::Static("static-token".into()));
        let tokens = vec![
            "good-device".to_string(),
            "stale-device".to_string(),
            "bad-device".to_string(),
        ];
        let report = client
            .send_multicast(&PushMessage::new("Hello", "World"), &tokens, Utc::now())
            .await
            .expect("send");

        accepted.assert_async().await;
        assert_eq!(report.success_count(), 1);
        assert_eq!(report.failure_count(), 2);
        assert_eq!(report.first_message_id(), Some("projects/classroom/messages/42"));
        assert_eq!(report.unregistered_tokens(), vec!["stale-device".to_string()]);

        let bad = report.outcomes[2].result.as_ref().unwrap_err();
        assert_eq!(bad.code, "400");
        assert_eq!(bad.message, "garbage");
    }

    #[tokio::test]
    async fn stalled_endpoint_times_out_as_device_failure() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/projects/classroom/messages:send");
                then.status(200)
                    .delay(std::time::Duration::from_secs(5))
                    .json_body(json!({ "name": "projects/classroom/messages/1" }));
            })
            .await;

        let client = FcmClient::new(
            "classroom",
            Url::parse(&server.url("/")).expect("url"),
            TokenSource::Static("static-token".into()),
            http_client(Duration::from_millis(200)).expect("http client"),
        );
        let report = tokio::time::timeout(
            Duration::from_secs(3),
            client.send_multicast(&PushMessage::new("a", "b"), &["slow-device".to_string()], Utc::now()),
        )
        .await
        .expect("send is bounded by the request timeout")
        .expect("send");

        assert_eq!(report.success_count(), 0);
        assert_eq!(report.failure_count(), 1);
        let failure = report.outcomes[0].result.as_ref().unwrap_err();
        assert_eq!(failure.code, "TRANSPORT");
    }

    #[tokio::test]
    async fn empty_token_list_skips_network() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST);
                then.status(500);
            })
            .await;

        let client = client(&server, TokenSource::Static("t".into()));
        let report = client
            .send_multicast(&PushMessage::new("a", "b"), &[], Utc::now())
            .await
            .expect("send");
        assert_eq!(report, DeliveryReport::default());
        mock.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn credential_failure_aborts_send() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(500).body("down");
            })
            .await;
        let source = ServiceAccountTokenSource::new(test_key(server.url("/token")), Client::new())
            .expect("source");

        let client = client(&server, TokenSource::ServiceAccount(source));
        let err = client
            .send_multicast(&PushMessage::new("a", "b"), &["device".to_string()], Utc::now())
            .await
            .expect_err("credentials fail");
        assert!(matches!(err, PushError::Credentials(_)));
    }
}
