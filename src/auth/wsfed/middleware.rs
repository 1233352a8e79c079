//! WS-Federation middleware construction and per-request handler creation.
//!
//! Construction resolves everything that must hold for the lifetime of the
//! middleware: the sign-in state format, the backchannel transport and its
//! certificate validation. Handler creation refreshes federation metadata
//! when the options do not yet carry issuer signing keys.

use std::sync::Arc;

use tokio::sync::RwLock;

use super::{
    backchannel::{BackchannelClient, resolve_http_message_handler},
    handler::WsFederationHandler,
    metadata::{MetadataError, MetadataRefresh, MetadataRetriever, SkipReason},
    options::WsFederationOptions,
};
use crate::{
    auth::data_protection::{DataProtectionError, DataProtectionProvider, PropertiesDataFormat},
    validation::url::require_https,
};

/// Purpose under which sign-in state is protected when no format is supplied.
const STATE_PROTECTOR_PURPOSE: &str = "wsfed::WsFederationMiddleware";
const STATE_PROTECTOR_VERSION: &str = "v1";

/// Errors raised while constructing the middleware.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    /// A certificate validator needs the platform transport to hook into.
    #[error(
        "A backchannel certificate validator was configured with a custom backchannel HTTP handler; \
         certificate validation requires the platform handler"
    )]
    ValidatorHandlerMismatch,

    #[error("Metadata address must use https when require_https_metadata is set: {0}")]
    InsecureMetadataAddress(String),

    #[error("Failed to create sign-in state protector: {0}")]
    DataProtection(#[from] DataProtectionError),

    #[error("Failed to build backchannel TLS configuration: {0}")]
    Tls(String),

    #[error("Failed to build backchannel HTTP client: {0}")]
    HttpClient(String),
}

/// Long-lived WS-Federation middleware.
///
/// Options are owned here and only mutated by metadata refreshes. Handlers get
/// an immutable snapshot, so a refresh never changes a request in flight.
pub struct WsFederationMiddleware {
    refresher: MetadataRefresher,
    span: tracing::Span,
}

/// Shared state a metadata refresh needs. Cloned into a spawned task so the
/// fetch outlives the request that started it.
#[derive(Clone)]
struct MetadataRefresher {
    options: Arc<RwLock<Arc<WsFederationOptions>>>,
    backchannel: BackchannelClient,
    metadata_retriever: Arc<dyn MetadataRetriever>,
}

impl WsFederationMiddleware {
    pub fn new(
        mut options: WsFederationOptions,
        data_protection: &dyn DataProtectionProvider,
        metadata_retriever: Arc<dyn MetadataRetriever>,
    ) -> Result<Self, ConfigurationError> {
        if options.state_data_format.is_none() {
            let protector = data_protection.create_protector(&[
                STATE_PROTECTOR_PURPOSE,
                &options.authentication_type,
                STATE_PROTECTOR_VERSION,
            ])?;
            options.state_data_format = Some(Arc::new(PropertiesDataFormat::new(protector)));
        }

        if options.require_https_metadata
            && let Some(address) = &options.metadata_address
        {
            require_https(address)
                .map_err(|_| ConfigurationError::InsecureMetadataAddress(address.to_string()))?;
        }

        let handler = resolve_http_message_handler(
            options.backchannel_http_handler.clone(),
            options.backchannel_certificate_validator.clone(),
        )?;
        let backchannel = BackchannelClient::new(handler, options.backchannel_timeout);

        let span = tracing::info_span!(
            "wsfed",
            authentication_type = %options.authentication_type,
        );

        tracing::debug!(
            authentication_type = %options.authentication_type,
            metadata_address = ?options.metadata_address.as_ref().map(|u| u.as_str()),
            callback_path = %options.callback_path,
            "WS-Federation middleware configured"
        );

        Ok(Self {
            refresher: MetadataRefresher {
                options: Arc::new(RwLock::new(Arc::new(options))),
                backchannel,
                metadata_retriever,
            },
            span,
        })
    }

    /// Snapshot of the current options.
    pub async fn options(&self) -> Arc<WsFederationOptions> {
        self.refresher.options().await
    }

    pub fn backchannel(&self) -> &BackchannelClient {
        &self.refresher.backchannel
    }

    /// Fetch federation metadata if the options lack signing keys.
    ///
    /// Best effort: failures are returned as [`MetadataRefresh::Failed`] and
    /// leave the options untouched. The fetch runs on its own task, so
    /// dropping this future (a request timeout, a client disconnect) does not
    /// cancel it; the keys are still applied once the backchannel answers.
    pub async fn refresh_metadata(&self) -> MetadataRefresh {
        let refresher = self.refresher.clone();
        let address = refresher.options().await.metadata_address.clone();

        match tokio::spawn(refresher.refresh()).await {
            Ok(refresh) => refresh,
            Err(join_error) => match address {
                Some(address) => MetadataRefresh::Failed {
                    address,
                    error: MetadataError::Aborted(join_error.to_string()),
                },
                None => MetadataRefresh::Skipped(SkipReason::NoMetadataAddress),
            },
        }
    }

    /// Create the handler for one request.
    ///
    /// Never fails: a metadata refresh failure is reported through
    /// [`super::WsFederationEvents::metadata_fetch_failed`] and the handler is built
    /// from whatever options are in place.
    pub async fn create_handler(&self) -> WsFederationHandler {
        let refresh = self.refresh_metadata().await;
        if refresh.fetched() {
            tracing::debug!(parent: &self.span, outcome = ?refresh, "Federation metadata refresh finished");
        }
        if let MetadataRefresh::Failed { address, error } = refresh {
            self.options()
                .await
                .events
                .metadata_fetch_failed(&address, &error);
        }
        WsFederationHandler::new(self.options().await, self.span.clone())
    }
}

impl MetadataRefresher {
    async fn options(&self) -> Arc<WsFederationOptions> {
        self.options.read().await.clone()
    }

    async fn refresh(self) -> MetadataRefresh {
        let current = self.options().await;
        if current
            .token_validation_parameters
            .are_issuer_signing_keys_available()
        {
            return MetadataRefresh::Skipped(SkipReason::KeysAvailable);
        }
        let Some(address) = current.metadata_address.clone() else {
            return MetadataRefresh::Skipped(SkipReason::NoMetadataAddress);
        };

        let data = match self
            .metadata_retriever
            .retrieve(&address, &self.backchannel)
            .await
        {
            Ok(data) => data,
            Err(error) => return MetadataRefresh::Failed { address, error },
        };

        if data.issuer_signing_keys.is_empty() {
            tracing::debug!(url = %address, "Federation metadata carried no signing keys");
            return MetadataRefresh::NoSigningKeys;
        }

        let mut guard = self.options.write().await;
        // Another request may have refreshed while we were fetching
        if guard
            .token_validation_parameters
            .are_issuer_signing_keys_available()
        {
            return MetadataRefresh::Skipped(SkipReason::KeysAvailable);
        }

        let mut updated = WsFederationOptions::clone(&guard);
        let signing_keys = data.issuer_signing_keys.len();
        updated.token_validation_parameters.issuer_signing_keys = data.issuer_signing_keys;
        if let Some(issuer) = data.token_issuer_name {
            updated.token_validation_parameters.valid_issuer = Some(issuer);
        }
        if let Some(endpoint) = data.passive_token_endpoint {
            updated.issuer_address = Some(endpoint);
        }
        *guard = Arc::new(updated);

        tracing::info!(url = %address, signing_keys, "Applied federation metadata");
        MetadataRefresh::Applied { signing_keys }
    }
}

impl std::fmt::Debug for WsFederationMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsFederationMiddleware")
            .field("backchannel", &self.refresher.backchannel)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use url::Url;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;
    use crate::auth::{
        data_protection::{
            AuthenticationProperties, KeyedDataProtectionProvider, SecureDataFormat,
        },
        wsfed::{
            backchannel::{
                BackchannelError, BackchannelHttpHandler, BackchannelRequest, BackchannelResponse,
                HttpMessageHandler, MAX_RESPONSE_CONTENT_BUFFER_SIZE,
            },
            certificate::ThumbprintCertificateValidator,
            events::WsFederationEvents,
            metadata::{FederationData, HttpMetadataRetriever, MetadataError, MetadataParser},
            options::SigningKey,
        },
    };

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    #[derive(Default)]
    struct CountingRetriever {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl MetadataRetriever for CountingRetriever {
        async fn retrieve(
            &self,
            _address: &Url,
            _client: &BackchannelClient,
        ) -> Result<FederationData, MetadataError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(MetadataError::Malformed("unreachable".into()));
            }
            Ok(FederationData {
                issuer_signing_keys: vec![SigningKey::from_der(b"idp-cert".to_vec())],
                token_issuer_name: Some("http://sts.example.com/adfs/services/trust".into()),
                passive_token_endpoint: Some(
                    Url::parse("https://sts.example.com/adfs/ls/").unwrap(),
                ),
            })
        }
    }

    #[derive(Default)]
    struct RecordingEvents {
        failures: Mutex<Vec<String>>,
    }

    impl WsFederationEvents for RecordingEvents {
        fn metadata_fetch_failed(&self, address: &Url, _error: &MetadataError) {
            self.failures.lock().unwrap().push(address.to_string());
        }
    }

    struct StaticHandler;

    #[async_trait]
    impl HttpMessageHandler for StaticHandler {
        async fn send(
            &self,
            _request: BackchannelRequest,
        ) -> Result<BackchannelResponse, BackchannelError> {
            Err(BackchannelError::Transport("offline".into()))
        }
    }

    fn options_with_metadata() -> WsFederationOptions {
        WsFederationOptions::default().with_metadata_address(
            Url::parse("https://sts.example.com/FederationMetadata/2007-06/FederationMetadata.xml")
                .unwrap(),
        )
    }

    fn middleware(
        options: WsFederationOptions,
        retriever: Arc<CountingRetriever>,
    ) -> WsFederationMiddleware {
        WsFederationMiddleware::new(
            options,
            &KeyedDataProtectionProvider::new(SECRET),
            retriever,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_installs_state_format_when_absent() {
        let mw = middleware(WsFederationOptions::default(), Arc::default());
        let options = mw.options().await;
        let format = options.state_data_format.as_ref().unwrap();

        let protected = format
            .protect(&AuthenticationProperties::with_redirect_uri("/"))
            .unwrap();
        assert_eq!(
            format.unprotect(&protected).unwrap().redirect_uri.as_deref(),
            Some("/")
        );
    }

    #[tokio::test]
    async fn test_state_format_is_bound_to_authentication_type() {
        let provider = KeyedDataProtectionProvider::new(SECRET);
        let retriever: Arc<CountingRetriever> = Arc::default();
        let a = WsFederationMiddleware::new(
            WsFederationOptions::new("CorpA"),
            &provider,
            retriever.clone(),
        )
        .unwrap();
        let b =
            WsFederationMiddleware::new(WsFederationOptions::new("CorpB"), &provider, retriever)
                .unwrap();

        let protected = a
            .options()
            .await
            .state_data_format
            .as_ref()
            .unwrap()
            .protect(&AuthenticationProperties::default())
            .unwrap();
        assert!(
            b.options()
                .await
                .state_data_format
                .as_ref()
                .unwrap()
                .unprotect(&protected)
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_keeps_supplied_state_format() {
        let provider = KeyedDataProtectionProvider::new(SECRET);
        let supplied: Arc<dyn SecureDataFormat<AuthenticationProperties>> =
            Arc::new(PropertiesDataFormat::new(
                provider.create_protector(&["custom"]).unwrap(),
            ));
        let mut options = WsFederationOptions::default();
        options.state_data_format = Some(supplied.clone());

        let mw = middleware(options, Arc::default());
        let installed = mw.options().await.state_data_format.clone().unwrap();
        assert!(Arc::ptr_eq(&installed, &supplied));
    }

    #[test]
    fn test_rejects_validator_with_custom_handler() {
        let mut options = WsFederationOptions::default();
        options.backchannel_http_handler =
            Some(BackchannelHttpHandler::Custom(Arc::new(StaticHandler)));
        options.backchannel_certificate_validator =
            Some(Arc::new(ThumbprintCertificateValidator::new(["ab"])));

        let err = WsFederationMiddleware::new(
            options,
            &KeyedDataProtectionProvider::new(SECRET),
            Arc::new(CountingRetriever::default()),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::ValidatorHandlerMismatch));
    }

    #[test]
    fn test_accepts_validator_with_platform_handler() {
        let mut options = WsFederationOptions::default();
        options.backchannel_certificate_validator =
            Some(Arc::new(ThumbprintCertificateValidator::new(["ab"])));
        let _ = middleware(options, Arc::default());
    }

    #[test]
    fn test_rejects_plain_http_metadata_when_https_required() {
        let options = WsFederationOptions::default()
            .with_metadata_address(Url::parse("http://sts.example.com/metadata.xml").unwrap());

        let err = WsFederationMiddleware::new(
            options,
            &KeyedDataProtectionProvider::new(SECRET),
            Arc::new(CountingRetriever::default()),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::InsecureMetadataAddress(_)));
    }

    #[test]
    fn test_backchannel_uses_configured_timeout_and_cap() {
        let mut options = WsFederationOptions::default();
        options.backchannel_timeout = Duration::from_secs(7);

        let mw = middleware(options, Arc::default());
        assert_eq!(mw.backchannel().timeout(), Duration::from_secs(7));
        assert_eq!(
            mw.backchannel().max_response_content_buffer_size(),
            MAX_RESPONSE_CONTENT_BUFFER_SIZE
        );
        assert_eq!(MAX_RESPONSE_CONTENT_BUFFER_SIZE, 10_485_760);
    }

    #[tokio::test]
    async fn test_no_fetch_when_keys_configured() {
        let retriever: Arc<CountingRetriever> = Arc::default();
        let mut options = options_with_metadata();
        options.token_validation_parameters.issuer_signing_keys =
            vec![SigningKey::from_der(b"pinned".to_vec())];

        let mw = middleware(options, retriever.clone());
        let _handler = mw.create_handler().await;

        assert_eq!(retriever.calls.load(Ordering::SeqCst), 0);
        assert!(matches!(
            mw.refresh_metadata().await,
            MetadataRefresh::Skipped(SkipReason::KeysAvailable)
        ));
    }

    #[tokio::test]
    async fn test_no_fetch_without_metadata_address() {
        let retriever: Arc<CountingRetriever> = Arc::default();
        let mw = middleware(WsFederationOptions::default(), retriever.clone());

        let _handler = mw.create_handler().await;
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 0);
        assert!(matches!(
            mw.refresh_metadata().await,
            MetadataRefresh::Skipped(SkipReason::NoMetadataAddress)
        ));
    }

    #[tokio::test]
    async fn test_metadata_applied_once() {
        let retriever: Arc<CountingRetriever> = Arc::default();
        let mw = middleware(options_with_metadata(), retriever.clone());

        let handler = mw.create_handler().await;
        let _second = mw.create_handler().await;
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 1);

        let options = handler.options();
        assert_eq!(
            options.token_validation_parameters.issuer_signing_keys.len(),
            1
        );
        assert_eq!(
            options.token_validation_parameters.valid_issuer.as_deref(),
            Some("http://sts.example.com/adfs/services/trust")
        );
        assert_eq!(
            options.issuer_address.as_ref().map(Url::as_str),
            Some("https://sts.example.com/adfs/ls/")
        );
    }

    #[tokio::test]
    async fn test_metadata_keeps_configured_issuer_when_absent_from_document() {
        struct KeysOnly;

        #[async_trait]
        impl MetadataRetriever for KeysOnly {
            async fn retrieve(
                &self,
                _address: &Url,
                _client: &BackchannelClient,
            ) -> Result<FederationData, MetadataError> {
                Ok(FederationData {
                    issuer_signing_keys: vec![SigningKey::from_der(b"k".to_vec())],
                    ..FederationData::default()
                })
            }
        }

        let mut options = options_with_metadata();
        options.issuer_address = Some(Url::parse("https://configured.example.com/").unwrap());
        options.token_validation_parameters.valid_issuer = Some("configured".into());

        let mw = WsFederationMiddleware::new(
            options,
            &KeyedDataProtectionProvider::new(SECRET),
            Arc::new(KeysOnly),
        )
        .unwrap();
        let handler = mw.create_handler().await;

        assert_eq!(
            handler.options().issuer_address.as_ref().map(Url::as_str),
            Some("https://configured.example.com/")
        );
        assert_eq!(
            handler
                .options()
                .token_validation_parameters
                .valid_issuer
                .as_deref(),
            Some("configured")
        );
    }

    #[tokio::test]
    async fn test_fetch_failure_still_yields_handler() {
        let retriever = Arc::new(CountingRetriever {
            fail: true,
            ..CountingRetriever::default()
        });
        let events = Arc::new(RecordingEvents::default());
        let options = options_with_metadata().with_events(events.clone());

        let mw = middleware(options, retriever.clone());
        let handler = mw.create_handler().await;

        assert!(
            !handler
                .options()
                .token_validation_parameters
                .are_issuer_signing_keys_available()
        );
        assert_eq!(events.failures.lock().unwrap().len(), 1);

        // Retried on the next handler since keys are still missing
        let _again = mw.create_handler().await;
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_handler_creation_still_applies_keys() {
        struct SlowRetriever {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl MetadataRetriever for SlowRetriever {
            async fn retrieve(
                &self,
                _address: &Url,
                _client: &BackchannelClient,
            ) -> Result<FederationData, MetadataError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(FederationData {
                    issuer_signing_keys: vec![SigningKey::from_der(b"late".to_vec())],
                    ..FederationData::default()
                })
            }
        }

        let retriever = Arc::new(SlowRetriever {
            calls: AtomicUsize::new(0),
        });
        let mw = WsFederationMiddleware::new(
            options_with_metadata(),
            &KeyedDataProtectionProvider::new(SECRET),
            retriever.clone(),
        )
        .unwrap();

        // The caller gives up long before the metadata host answers
        let abandoned = tokio::time::timeout(Duration::from_millis(20), mw.create_handler()).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(400)).await;

        let handler = mw.create_handler().await;
        assert!(
            handler
                .options()
                .token_validation_parameters
                .are_issuer_signing_keys_available()
        );
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_oversized_metadata_is_a_refresh_failure() {
        struct AnyParser;

        impl MetadataParser for AnyParser {
            fn parse(&self, _document: &[u8]) -> Result<FederationData, MetadataError> {
                Ok(FederationData::default())
            }
        }

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metadata.xml"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![b'x'; MAX_RESPONSE_CONTENT_BUFFER_SIZE + 1]),
            )
            .mount(&server)
            .await;

        let mut options = WsFederationOptions::default().with_metadata_address(
            Url::parse(&format!("{}/metadata.xml", server.uri())).unwrap(),
        );
        options.require_https_metadata = false;

        let mw = WsFederationMiddleware::new(
            options,
            &KeyedDataProtectionProvider::new(SECRET),
            Arc::new(HttpMetadataRetriever::new(AnyParser)),
        )
        .unwrap();

        match mw.refresh_metadata().await {
            MetadataRefresh::Failed { error, .. } => assert!(matches!(
                error,
                MetadataError::Backchannel(BackchannelError::ResponseTooLarge { .. })
            )),
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
