//! Backchannel HTTP client used for federation metadata retrieval.
//!
//! The client is owned by the middleware, built once at construction and
//! reused for every fetch. Transport is pluggable through
//! [`HttpMessageHandler`]; only the platform transport exposes a server
//! certificate hook.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use url::Url;

use super::{
    certificate::{CertificateValidator, tls_config_with_validator},
    middleware::ConfigurationError,
};

/// Maximum buffered response body for backchannel calls (10 MiB).
pub const MAX_RESPONSE_CONTENT_BUFFER_SIZE: usize = 10 * 1024 * 1024;

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, thiserror::Error)]
pub enum BackchannelError {
    #[error("Backchannel request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Backchannel response exceeded {limit} bytes")]
    ResponseTooLarge { limit: usize },

    #[error("Backchannel transport error: {0}")]
    Transport(String),
}

/// Outgoing backchannel request.
#[derive(Debug, Clone)]
pub struct BackchannelRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    /// Handlers must stop reading once the body grows past this.
    pub max_response_bytes: usize,
}

/// Fully buffered backchannel response.
#[derive(Debug, Clone)]
pub struct BackchannelResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Transport for backchannel requests.
#[async_trait]
pub trait HttpMessageHandler: Send + Sync {
    async fn send(&self, request: BackchannelRequest)
    -> Result<BackchannelResponse, BackchannelError>;
}

/// Selects the transport behind the backchannel client.
#[derive(Clone)]
pub enum BackchannelHttpHandler {
    /// reqwest over rustls. Accepts a server certificate validator.
    Platform(PlatformHandlerBuilder),
    /// Caller-provided transport without a certificate hook.
    Custom(Arc<dyn HttpMessageHandler>),
}

impl fmt::Debug for BackchannelHttpHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Platform(builder) => f.debug_tuple("Platform").field(builder).finish(),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl Default for BackchannelHttpHandler {
    fn default() -> Self {
        Self::Platform(PlatformHandlerBuilder::default())
    }
}

/// Settings for the platform transport.
#[derive(Debug, Clone)]
pub struct PlatformHandlerBuilder {
    connect_timeout: Duration,
    user_agent: String,
    certificate_validator: Option<Arc<dyn CertificateValidator>>,
}

impl Default for PlatformHandlerBuilder {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            user_agent: default_user_agent(),
            certificate_validator: None,
        }
    }
}

impl PlatformHandlerBuilder {
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Server certificate callback for every TLS handshake.
    pub fn server_certificate_validator(mut self, validator: Arc<dyn CertificateValidator>) -> Self {
        self.certificate_validator = Some(validator);
        self
    }

    pub fn build(self) -> Result<PlatformHandler, ConfigurationError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .user_agent(&self.user_agent);

        if let Some(validator) = self.certificate_validator {
            builder = builder.use_preconfigured_tls(tls_config_with_validator(validator)?);
        }

        let client = builder
            .build()
            .map_err(|e| ConfigurationError::HttpClient(e.to_string()))?;

        Ok(PlatformHandler { client })
    }
}

/// reqwest-backed transport.
#[derive(Debug, Clone)]
pub struct PlatformHandler {
    client: reqwest::Client,
}

#[async_trait]
impl HttpMessageHandler for PlatformHandler {
    async fn send(
        &self,
        request: BackchannelRequest,
    ) -> Result<BackchannelResponse, BackchannelError> {
        let limit = request.max_response_bytes;

        let mut response = self
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .send()
            .await
            .map_err(|e| BackchannelError::Transport(e.to_string()))?;

        if response.content_length().is_some_and(|len| len > limit as u64) {
            return Err(BackchannelError::ResponseTooLarge { limit });
        }

        let status = response.status();
        let headers = std::mem::take(response.headers_mut());

        let mut body = BytesMut::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| BackchannelError::Transport(e.to_string()))?
        {
            if body.len() + chunk.len() > limit {
                return Err(BackchannelError::ResponseTooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(BackchannelResponse {
            status,
            headers,
            body: body.freeze(),
        })
    }
}

/// Resolve the configured transport, installing the certificate validator
/// when one is set. A validator paired with a custom transport is a
/// configuration error.
pub fn resolve_http_message_handler(
    handler: Option<BackchannelHttpHandler>,
    certificate_validator: Option<Arc<dyn CertificateValidator>>,
) -> Result<Arc<dyn HttpMessageHandler>, ConfigurationError> {
    let handler = handler.unwrap_or_default();

    match (handler, certificate_validator) {
        (BackchannelHttpHandler::Custom(_), Some(_)) => {
            Err(ConfigurationError::ValidatorHandlerMismatch)
        }
        (BackchannelHttpHandler::Custom(custom), None) => Ok(custom),
        (BackchannelHttpHandler::Platform(builder), Some(validator)) => Ok(Arc::new(
            builder.server_certificate_validator(validator).build()?,
        )),
        (BackchannelHttpHandler::Platform(builder), None) => Ok(Arc::new(builder.build()?)),
    }
}

/// HTTP client for server-to-server calls to the identity provider.
#[derive(Clone)]
pub struct BackchannelClient {
    handler: Arc<dyn HttpMessageHandler>,
    timeout: Duration,
    max_response_content_buffer_size: usize,
}

impl BackchannelClient {
    pub fn new(handler: Arc<dyn HttpMessageHandler>, timeout: Duration) -> Self {
        Self {
            handler,
            timeout,
            max_response_content_buffer_size: MAX_RESPONSE_CONTENT_BUFFER_SIZE,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_response_content_buffer_size(&self) -> usize {
        self.max_response_content_buffer_size
    }

    /// GET `url`, buffering at most [`MAX_RESPONSE_CONTENT_BUFFER_SIZE`] bytes.
    pub async fn get(&self, url: &Url) -> Result<BackchannelResponse, BackchannelError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/xml, text/xml, */*"),
        );

        self.send(BackchannelRequest {
            method: Method::GET,
            url: url.clone(),
            headers,
            max_response_bytes: self.max_response_content_buffer_size,
        })
        .await
    }

    pub async fn send(
        &self,
        request: BackchannelRequest,
    ) -> Result<BackchannelResponse, BackchannelError> {
        tracing::debug!(method = %request.method, url = %request.url, "Backchannel request");

        let response = tokio::time::timeout(self.timeout, self.handler.send(request))
            .await
            .map_err(|_| BackchannelError::Timeout(self.timeout))??;

        // Custom transports are not required to honour the cap while reading.
        if response.body.len() > self.max_response_content_buffer_size {
            return Err(BackchannelError::ResponseTooLarge {
                limit: self.max_response_content_buffer_size,
            });
        }

        Ok(response)
    }
}

impl fmt::Debug for BackchannelClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackchannelClient")
            .field("timeout", &self.timeout)
            .field(
                "max_response_content_buffer_size",
                &self.max_response_content_buffer_size,
            )
            .finish()
    }
}

fn default_user_agent() -> String {
    format!("wsfed/{}", env!("CARGO_PKG_VERSION"))
}
