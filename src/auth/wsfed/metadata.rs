//! Federation metadata retrieval.
//!
//! The document format itself is handled by a [`MetadataParser`]; this module
//! only covers getting the bytes over the backchannel and reporting what a
//! refresh did.

use async_trait::async_trait;
use http::StatusCode;
use url::Url;

use super::{
    backchannel::{BackchannelClient, BackchannelError},
    options::SigningKey,
};

/// Issuer data extracted from a federation metadata document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FederationData {
    pub issuer_signing_keys: Vec<SigningKey>,
    pub token_issuer_name: Option<String>,
    pub passive_token_endpoint: Option<Url>,
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("Failed to fetch federation metadata: {0}")]
    Backchannel(#[from] BackchannelError),

    #[error("Federation metadata endpoint returned {0}")]
    Status(StatusCode),

    #[error("Malformed federation metadata: {0}")]
    Malformed(String),

    #[error("Federation metadata refresh task aborted: {0}")]
    Aborted(String),
}

/// Fetches and interprets federation metadata.
#[async_trait]
pub trait MetadataRetriever: Send + Sync {
    async fn retrieve(
        &self,
        address: &Url,
        client: &BackchannelClient,
    ) -> Result<FederationData, MetadataError>;
}

/// Turns a raw metadata document into [`FederationData`].
pub trait MetadataParser: Send + Sync {
    fn parse(&self, document: &[u8]) -> Result<FederationData, MetadataError>;
}

/// Retriever that GETs the metadata address and hands the body to a parser.
#[derive(Debug, Clone)]
pub struct HttpMetadataRetriever<P> {
    parser: P,
}

impl<P: MetadataParser> HttpMetadataRetriever<P> {
    pub fn new(parser: P) -> Self {
        Self { parser }
    }
}

#[async_trait]
impl<P: MetadataParser> MetadataRetriever for HttpMetadataRetriever<P> {
    async fn retrieve(
        &self,
        address: &Url,
        client: &BackchannelClient,
    ) -> Result<FederationData, MetadataError> {
        tracing::debug!(url = %address, "Fetching federation metadata");

        let response = client.get(address).await?;

        if !response.status.is_success() {
            tracing::error!(status = %response.status, url = %address, "Federation metadata endpoint returned error");
            return Err(MetadataError::Status(response.status));
        }

        self.parser.parse(&response.body)
    }
}

/// Why a refresh did not contact the metadata endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    KeysAvailable,
    NoMetadataAddress,
}

/// Outcome of one best-effort metadata refresh.
///
/// Failures are values here, never errors: handler creation logs and drops
/// them and carries on with the configuration it already has.
#[derive(Debug)]
pub enum MetadataRefresh {
    Skipped(SkipReason),
    Applied { signing_keys: usize },
    /// The document was fetched but carried no signing keys; nothing was copied.
    NoSigningKeys,
    Failed { address: Url, error: MetadataError },
}

impl MetadataRefresh {
    /// Whether the metadata endpoint was contacted.
    pub fn fetched(&self) -> bool {
        !matches!(self, Self::Skipped(_))
    }
}
