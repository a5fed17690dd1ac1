use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use queenlive_core::ids::{ConverterId, StreamId};
use queenlive_core::settings::RetrySettings;
use queenlive_core::{Role, SessionError, Uid};
use rand::Rng;
use secrecy::SecretString;
use tracing::warn;

use crate::api::{ControlPlane, YoutubeStream};

/// Retry behavior for [`ReliableControlPlane`].
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(s: &RetrySettings) -> Self {
        Self {
            max_retries: s.max_retries,
            base_delay: Duration::from_millis(s.base_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms),
            jitter_factor: s.jitter_factor.clamp(0.0, 1.0),
        }
    }
}

impl RetryConfig {
    /// Exponential backoff with jitter: `base * 2^attempt`, capped, then `± jitter_factor`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp_delay = self.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt.min(30) as i32);
        let capped = exp_delay.min(self.max_delay.as_millis() as f64);

        let jitter_range = capped * self.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

/// Wraps a [`ControlPlane`] with bounded retry for idempotent calls.
///
/// Token fetch and stream start retry on retryable errors (network,
/// timeout, 5xx). `stop_rtmp` is passed through untouched.
pub struct ReliableControlPlane<P: ControlPlane> {
    inner: P,
    config: RetryConfig,
    total_retries: AtomicU64,
}

impl<P: ControlPlane> ReliableControlPlane<P> {
    pub fn new(inner: P, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, SessionError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, SessionError>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(v) => return Ok(v),
                Err(e) if !e.is_retryable() || attempt >= self.config.max_retries => return Err(e),
                Err(e) => {
                    let delay = self.config.delay_for(attempt);
                    self.total_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        op,
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl<P: ControlPlane> ControlPlane for ReliableControlPlane<P> {
    async fn fetch_rtc_token(&self, channel: &str, uid: Uid, role: Role) -> Result<SecretString, SessionError> {
        self.with_retry("fetch_rtc_token", || self.inner.fetch_rtc_token(channel, uid, role))
            .await
    }

    async fn start_youtube_stream(&self, stream_id: &StreamId) -> Result<YoutubeStream, SessionError> {
        self.with_retry("start_youtube_stream", || self.inner.start_youtube_stream(stream_id))
            .await
    }

    async fn stop_rtmp(&self, converter_id: &ConverterId) -> Result<(), SessionError> {
        self.inner.stop_rtmp(converter_id).await
    }
}
