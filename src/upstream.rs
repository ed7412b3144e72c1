use reqwest::Client;
use reqwest::multipart::Form;
use serde_json::{Value, json};

use crate::config::RealtimeConfig;
use crate::error::BrokerError;

/// Path of the WebRTC session-establishment endpoint, relative to the API base
pub const REALTIME_CALLS_PATH: &str = "/v1/realtime/calls";

/// Forwards session offers to the realtime voice API using the server-held key.
pub struct RealtimeClient {
    http: Client,
    config: RealtimeConfig,
}

impl RealtimeClient {
    pub fn new(http: Client, config: RealtimeConfig) -> Self {
        Self { http, config }
    }

    pub fn is_configured(&self) -> bool {
        self.config.api_key.is_some()
    }

    fn session_config(&self) -> Value {
        json!({
            "type": "realtime",
            "model": self.config.model,
            "audio": { "output": { "voice": self.config.voice } },
        })
    }

    /// Post the SDP offer verbatim. The raw response is handed back so the
    /// caller can relay upstream status codes.
    pub async fn create_session(&self, sdp: &str) -> Result<reqwest::Response, BrokerError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(BrokerError::UpstreamNotConfigured)?;

        let form = Form::new()
            .text("sdp", sdp.to_string())
            .text("session", self.session_config().to_string());

        let url = format!("{}{}", self.config.api_base, REALTIME_CALLS_PATH);
        let response = self
            .http
            .post(url)
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await?;

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(api_key: Option<&str>) -> RealtimeConfig {
        RealtimeConfig {
            api_key: api_key.map(str::to_string),
            api_base: "http://127.0.0.1:9".into(),
            model: "gpt-realtime".into(),
            voice: "marin".into(),
        }
    }

    #[test]
    fn test_session_config() {
        let client = RealtimeClient::new(Client::new(), config(Some("sk-test")));
        let session = client.session_config();
        assert_eq!(session["type"], "realtime");
        assert_eq!(session["model"], "gpt-realtime");
        assert_eq!(session["audio"]["output"]["voice"], "marin");
        assert!(client.is_configured());
    }

    #[tokio::test]
    async fn test_missing_api_key() {
        let client = RealtimeClient::new(Client::new(), config(None));
        assert!(!client.is_configured());
        let result = client.create_session("v=0\r\n").await;
        assert!(matches!(result, Err(BrokerError::UpstreamNotConfigured)));
    }
}
