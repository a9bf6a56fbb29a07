//! HTTP bridge implementation of the automation capability.
//!
//! MTProto itself lives in a sidecar process; this module talks to the
//! sidecar's small REST surface. One bridge session maps to one live
//! `AutomationClient` handle.

use async_trait::async_trait;

use crate::automation::{AutomationClient, ClientConnector, CodeVerification, CreateOutcome};
use crate::error::ClientError;
use crate::models::ClientCredentials;

/// Connector that opens sessions against the bridge sidecar.
pub struct BridgeConnector {
    base_url: String,
    http: reqwest::Client,
}

impl BridgeConnector {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ClientConnector for BridgeConnector {
    async fn connect(
        &self,
        creds: &ClientCredentials,
    ) -> Result<Box<dyn AutomationClient>, ClientError> {
        let body = serde_json::json!({
            "api_id": creds.api_id,
            "api_hash": creds.api_hash,
            "phone": creds.phone,
            "session": creds.session,
        });

        let resp = self
            .http
            .post(format!("{}/sessions", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let data = read_bridge_response(resp).await?;
        let session_id = data
            .get("session_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ClientError::InvalidResponse("connect response missing session_id".into())
            })?
            .to_string();

        tracing::debug!(phone = %creds.phone, %session_id, "Bridge session opened");

        Ok(Box::new(BridgeClient {
            base_url: self.base_url.clone(),
            http: self.http.clone(),
            session_id,
            connected: true,
        }))
    }
}

/// One live bridge session.
struct BridgeClient {
    base_url: String,
    http: reqwest::Client,
    session_id: String,
    connected: bool,
}

impl BridgeClient {
    fn session_url(&self, tail: &str) -> String {
        format!("{}/sessions/{}/{tail}", self.base_url, self.session_id)
    }

    async fn post(
        &self,
        tail: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, ClientError> {
        let resp = self
            .http
            .post(self.session_url(tail))
            .json(&body)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        read_bridge_response(resp).await
    }
}

#[async_trait]
impl AutomationClient for BridgeClient {
    async fn request_code(&mut self) -> Result<(), ClientError> {
        self.post("request-code", serde_json::json!({})).await?;
        Ok(())
    }

    async fn verify_code(&mut self, code: &str) -> Result<CodeVerification, ClientError> {
        let data = self
            .post("verify-code", serde_json::json!({ "code": code }))
            .await?;
        match data.get("status").and_then(|v| v.as_str()) {
            Some("verified") => Ok(CodeVerification::Verified),
            Some("second_factor_required") => Ok(CodeVerification::SecondFactorRequired),
            other => Err(ClientError::InvalidResponse(format!(
                "unknown verify-code status {other:?}"
            ))),
        }
    }

    async fn verify_second_factor(&mut self, secret: &str) -> Result<(), ClientError> {
        self.post("verify-password", serde_json::json!({ "password": secret }))
            .await?;
        Ok(())
    }

    async fn export_session(&mut self) -> Result<String, ClientError> {
        let data = self.post("export", serde_json::json!({})).await?;
        data.get("session")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| ClientError::InvalidResponse("export response missing session".into()))
    }

    async fn create_group(&mut self, name: &str) -> Result<CreateOutcome, ClientError> {
        let data = self
            .post("groups", serde_json::json!({ "name": name }))
            .await?;

        if data.get("ok").and_then(|v| v.as_bool()) == Some(false) {
            let reason = data
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unspecified failure")
                .to_string();
            return Ok(CreateOutcome::Failed { reason });
        }

        let remote_id = data
            .get("remote_id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| ClientError::InvalidResponse("create missing remote_id".into()))?;
        let invite_ref = data
            .get("invite_ref")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let member_count = data
            .get("member_count")
            .and_then(|v| v.as_u64())
            .unwrap_or(1) as u32;

        Ok(CreateOutcome::Created {
            remote_id,
            invite_ref,
            member_count,
        })
    }

    async fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        let url = format!("{}/sessions/{}", self.base_url, self.session_id);
        let result = self.http.delete(url).send().await;
        if let Err(e) = result {
            tracing::debug!(session_id = %self.session_id, "Bridge disconnect failed: {e}");
        }
    }
}

/// Pull a JSON body out of a bridge response, translating HTTP and
/// bridge-level failures into the client error taxonomy.
async fn read_bridge_response(resp: reqwest::Response) -> Result<serde_json::Value, ClientError> {
    let status = resp.status();
    let data: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| ClientError::InvalidResponse(format!("non-JSON bridge response: {e}")))?;

    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        let reason = bridge_error(&data).unwrap_or_else(|| status.to_string());
        return Err(ClientError::Auth(reason));
    }
    if !status.is_success() {
        let reason = bridge_error(&data).unwrap_or_else(|| status.to_string());
        return Err(ClientError::Transport(reason));
    }
    Ok(data)
}

fn bridge_error(data: &serde_json::Value) -> Option<String> {
    data.get("error").and_then(|v| v.as_str()).map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_trims_trailing_slash() {
        let connector = BridgeConnector::new("http://localhost:8484/".into());
        assert_eq!(connector.base_url, "http://localhost:8484");
    }

    #[test]
    fn session_url_layout() {
        let client = BridgeClient {
            base_url: "http://localhost:8484".into(),
            http: reqwest::Client::new(),
            session_id: "abc123".into(),
            connected: true,
        };
        assert_eq!(
            client.session_url("verify-code"),
            "http://localhost:8484/sessions/abc123/verify-code"
        );
    }

    #[tokio::test]
    async fn connect_against_nothing_is_transport_error() {
        let connector = BridgeConnector::new("http://127.0.0.1:1".into());
        let creds = ClientCredentials {
            api_id: "1".into(),
            api_hash: "h".into(),
            phone: "+1".into(),
            session: None,
        };
        let err = connector.connect(&creds).await.err().unwrap();
        assert!(matches!(err, ClientError::Transport(_)));
    }
}
