use std::time::Duration;

use async_trait::async_trait;
use queenlive_core::ids::{ConverterId, StreamId};
use queenlive_core::{Role, SessionError, Uid};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// A started YouTube restream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YoutubeStream {
    pub converter_id: ConverterId,
    pub youtube_link: String,
}

/// Token issuance and restream orchestration endpoints.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn fetch_rtc_token(&self, channel: &str, uid: Uid, role: Role) -> Result<SecretString, SessionError>;
    async fn start_youtube_stream(&self, stream_id: &StreamId) -> Result<YoutubeStream, SessionError>;
    async fn stop_rtmp(&self, converter_id: &ConverterId) -> Result<(), SessionError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest<'a> {
    stream_id: &'a StreamId,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StopRequest<'a> {
    converter_id: &'a ConverterId,
}

/// reqwest-backed [`ControlPlane`].
pub struct HttpControlPlane {
    base_url: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpControlPlane {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SessionError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SessionError::Network(format!("http client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn map_send_error(&self, e: reqwest::Error) -> SessionError {
        if e.is_timeout() {
            SessionError::Timeout(self.timeout)
        } else if e.is_decode() {
            SessionError::Protocol(e.to_string())
        } else {
            SessionError::Network(e.to_string())
        }
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, SessionError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(SessionError::from_status(status.as_u16(), body))
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    #[instrument(skip_all, fields(channel = %channel, uid = %uid, role = %role))]
    async fn fetch_rtc_token(&self, channel: &str, uid: Uid, role: Role) -> Result<SecretString, SessionError> {
        let uid_param = uid.to_string();
        let response = self
            .http
            .get(self.url("/token/rtc"))
            .query(&[("channel", channel), ("uid", uid_param.as_str()), ("role", role.as_str())])
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let body: TokenResponse = self
            .check(response)
            .await?
            .json()
            .await
            .map_err(|e| self.map_send_error(e))?;
        if body.token.is_empty() {
            return Err(SessionError::Auth("token service returned an empty token".into()));
        }
        debug!("rtc token issued");
        Ok(SecretString::from(body.token))
    }

    #[instrument(skip_all, fields(stream_id = %stream_id))]
    async fn start_youtube_stream(&self, stream_id: &StreamId) -> Result<YoutubeStream, SessionError> {
        let response = self
            .http
            .post(self.url("/orchestrate/start-youtube-stream"))
            .json(&StartRequest { stream_id })
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let stream: YoutubeStream = self
            .check(response)
            .await?
            .json()
            .await
            .map_err(|e| self.map_send_error(e))?;
        if stream.converter_id.is_empty() || stream.youtube_link.is_empty() {
            return Err(SessionError::Protocol("start-youtube-stream response is missing fields".into()));
        }
        Ok(stream)
    }

    #[instrument(skip_all, fields(converter_id = %converter_id))]
    async fn stop_rtmp(&self, converter_id: &ConverterId) -> Result<(), SessionError> {
        let response = self
            .http
            .post(self.url("/stop-rtmp"))
            .json(&StopRequest { converter_id })
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        self.check(response).await?;
        Ok(())
    }
}
