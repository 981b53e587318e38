//! Fetching signed statements over HTTP, with caching and request coalescing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::constants::ENTITY_STATEMENT_MEDIA_TYPE;
use crate::entity_id::{EntityId, EntityIdError};
use crate::statement::{EntityStatement, StatementError};
use crate::verify::{self, VerifyError};

/// A plain HTTP response, as far as this crate cares about it.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Value of the `Content-Type` header, if present.
    pub content_type: Option<String>,
    /// Response body.
    pub body: String,
}

/// Transport seam for fetching federation documents.
///
/// The production implementation is [`ReqwestFetcher`]; tests substitute an
/// in-memory map of canned responses.
#[async_trait]
pub trait HttpFetch: Send + Sync {
    /// Performs a GET request.
    async fn get(&self, url: &Url) -> Result<HttpResponse, FetchError>;
}

/// An error that can arise fetching a federation document.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FetchError {
    /// The request failed below the HTTP layer (DNS, connect, TLS).
    #[error("request to {url} failed")]
    Network {
        /// The requested URL.
        url: String,
        /// The transport error.
        #[source]
        source: reqwest::Error,
    },

    /// The request did not complete within the per-request timeout.
    #[error("request to {url} timed out")]
    Timeout {
        /// The requested URL.
        url: String,
    },

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The server answered with a non-200 status.
    #[error("unexpected HTTP status {status} from {url}")]
    Status {
        /// The requested URL.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The server answered with a body that is not an entity statement.
    #[error("unexpected content type '{content_type}' from {url}")]
    ContentType {
        /// The requested URL.
        url: String,
        /// The offending `Content-Type` value.
        content_type: String,
    },

    /// An endpoint URL could not be built.
    #[error("invalid endpoint URL")]
    Url(#[from] url::ParseError),

    /// The response body is not a parseable entity statement.
    #[error("malformed entity statement from {url}")]
    Statement {
        /// The requested URL.
        url: String,
        /// The parse failure.
        #[source]
        source: StatementError,
    },

    /// The fetched statement fails signature or temporal verification.
    #[error("statement verification failed for {subject}")]
    Verify {
        /// The statement subject.
        subject: EntityId,
        /// The verification failure.
        #[source]
        source: VerifyError,
    },

    /// A self-signed configuration carries no federation keys.
    #[error("entity configuration for {0} carries no federation keys")]
    MissingJwks(EntityId),

    /// The statement names an unexpected issuer.
    #[error("issuer mismatch: expected {expected}, found {found}")]
    IssuerMismatch {
        /// The issuer that was required.
        expected: EntityId,
        /// The issuer the statement names.
        found: EntityId,
    },

    /// The statement names an unexpected subject.
    #[error("subject mismatch: expected {expected}, found {found}")]
    SubjectMismatch {
        /// The subject that was required.
        expected: EntityId,
        /// The subject the statement names.
        found: EntityId,
    },

    /// The entity does not advertise a federation fetch endpoint.
    #[error("{0} does not expose a federation fetch endpoint")]
    NoFetchEndpoint(EntityId),

    /// The entity does not advertise a federation list endpoint.
    #[error("{0} does not expose a federation list endpoint")]
    NoListEndpoint(EntityId),

    /// A subordinate listing is not a JSON array of entity IDs.
    #[error("malformed subordinate listing from {url}")]
    List {
        /// The requested URL.
        url: String,
        /// The parse failure.
        #[source]
        source: serde_json::Error,
    },

    /// A listed subordinate is not a valid entity ID.
    #[error("invalid entity id in subordinate listing")]
    ListedEntityId(#[from] EntityIdError),

    /// The HTTP client could not be constructed.
    #[error("cannot build HTTP client")]
    Client(#[source] reqwest::Error),
}

/// Production [`HttpFetch`] implementation backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    /// Builds a fetcher with the given per-request timeout.
    ///
    /// With `insecure_tls` set, server certificates are not verified; this
    /// exists for test federations running on self-signed certificates.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Client`] if the underlying client cannot be
    /// constructed.
    pub fn new(http_timeout: std::time::Duration, insecure_tls: bool) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(http_timeout)
            .danger_accept_invalid_certs(insecure_tls)
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpFetch for ReqwestFetcher {
    async fn get(&self, url: &Url) -> Result<HttpResponse, FetchError> {
        let response = self.client.get(url.clone()).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout {
                    url: url.to_string(),
                }
            } else {
                FetchError::Network {
                    url: url.to_string(),
                    source: e,
                }
            }
        })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = response.text().await.map_err(|e| FetchError::Network {
            url: url.to_string(),
            source: e,
        })?;

        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }
}

struct CacheEntry {
    statement: Arc<EntityStatement>,
    fresh_until: OffsetDateTime,
}

type CacheKey = (EntityId, EntityId);
type CacheSlot = Arc<tokio::sync::Mutex<Option<CacheEntry>>>;

/// Retrieves and verifies entity statements, caching them by `(iss, sub)`.
///
/// Concurrent requests for the same key coalesce: the first caller fetches
/// while holding the per-key lock, later callers wait on that lock and then
/// read the cached result. A global semaphore bounds in-flight HTTP
/// requests across all keys.
pub(crate) struct Fetcher {
    http: Arc<dyn HttpFetch>,
    slots: Mutex<HashMap<CacheKey, CacheSlot>>,
    permits: Arc<Semaphore>,
    skew: time::Duration,
    cache_ttl: Option<time::Duration>,
}

impl Fetcher {
    pub(crate) fn new(
        http: Arc<dyn HttpFetch>,
        max_concurrency: usize,
        skew: time::Duration,
        cache_ttl: Option<time::Duration>,
    ) -> Self {
        Self {
            http,
            slots: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            skew,
            cache_ttl,
        }
    }

    /// Fetches and verifies the self-signed entity configuration of
    /// `entity` from its well-known URL.
    pub(crate) async fn configuration(
        &self,
        entity: &EntityId,
        cancel: &CancellationToken,
    ) -> Result<Arc<EntityStatement>, FetchError> {
        let slot = self.slot((entity.clone(), entity.clone()));
        let mut guard = slot.lock().await;

        let now = OffsetDateTime::now_utc();
        if let Some(entry) = guard.as_ref() {
            if entry.fresh_until > now {
                return Ok(Arc::clone(&entry.statement));
            }
        }

        let url = Url::parse(&entity.well_known_url())?;
        tracing::debug!(entity = %entity, %url, "fetching entity configuration");
        let response = self.get_checked(&url, cancel, true).await?;

        let statement =
            EntityStatement::parse_insecure(&response.body).map_err(|source| {
                FetchError::Statement {
                    url: url.to_string(),
                    source,
                }
            })?;

        if statement.iss() != entity {
            return Err(FetchError::IssuerMismatch {
                expected: entity.clone(),
                found: statement.iss().clone(),
            });
        }
        if statement.sub() != entity {
            return Err(FetchError::SubjectMismatch {
                expected: entity.clone(),
                found: statement.sub().clone(),
            });
        }

        // Self-signed bootstrap: the configuration verifies under the keys
        // embedded in its own payload.
        let keys = statement
            .jwks()
            .ok_or_else(|| FetchError::MissingJwks(entity.clone()))?;
        verify::verify(statement.raw(), keys, now, self.skew).map_err(|source| {
            FetchError::Verify {
                subject: entity.clone(),
                source,
            }
        })?;

        let statement = Arc::new(statement);
        *guard = Some(CacheEntry {
            statement: Arc::clone(&statement),
            fresh_until: self.fresh_until(statement.exp(), now),
        });
        Ok(statement)
    }

    /// Fetches and verifies the subordinate statement `issuer` publishes
    /// about `subject` via its federation fetch endpoint.
    pub(crate) async fn subordinate(
        &self,
        issuer: &EntityId,
        subject: &EntityId,
        cancel: &CancellationToken,
    ) -> Result<Arc<EntityStatement>, FetchError> {
        let slot = self.slot((issuer.clone(), subject.clone()));
        let mut guard = slot.lock().await;

        let now = OffsetDateTime::now_utc();
        if let Some(entry) = guard.as_ref() {
            if entry.fresh_until > now {
                return Ok(Arc::clone(&entry.statement));
            }
        }

        // Locks the (issuer, issuer) slot, never this one; no lock cycle.
        let issuer_configuration = self.configuration(issuer, cancel).await?;
        let endpoint = issuer_configuration
            .federation_fetch_endpoint()
            .ok_or_else(|| FetchError::NoFetchEndpoint(issuer.clone()))?;

        let mut url = Url::parse(endpoint)?;
        url.query_pairs_mut()
            .append_pair("sub", subject.as_str())
            .append_pair("iss", issuer.as_str());
        tracing::debug!(issuer = %issuer, subject = %subject, %url, "fetching subordinate statement");
        let response = self.get_checked(&url, cancel, true).await?;

        let statement =
            EntityStatement::parse_insecure(&response.body).map_err(|source| {
                FetchError::Statement {
                    url: url.to_string(),
                    source,
                }
            })?;

        if statement.iss() != issuer {
            return Err(FetchError::IssuerMismatch {
                expected: issuer.clone(),
                found: statement.iss().clone(),
            });
        }
        if statement.sub() != subject {
            return Err(FetchError::SubjectMismatch {
                expected: subject.clone(),
                found: statement.sub().clone(),
            });
        }

        let keys = issuer_configuration
            .jwks()
            .ok_or_else(|| FetchError::MissingJwks(issuer.clone()))?;
        verify::verify(statement.raw(), keys, now, self.skew).map_err(|source| {
            FetchError::Verify {
                subject: subject.clone(),
                source,
            }
        })?;

        let statement = Arc::new(statement);
        *guard = Some(CacheEntry {
            statement: Arc::clone(&statement),
            fresh_until: self.fresh_until(statement.exp(), now),
        });
        Ok(statement)
    }

    /// Lists the subordinates of `entity` via its federation list endpoint,
    /// optionally filtered by entity type.
    pub(crate) async fn list_subordinates(
        &self,
        entity: &EntityId,
        entity_type: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<EntityId>, FetchError> {
        let configuration = self.configuration(entity, cancel).await?;
        let endpoint = configuration
            .federation_list_endpoint()
            .ok_or_else(|| FetchError::NoListEndpoint(entity.clone()))?;

        let mut url = Url::parse(endpoint)?;
        if let Some(tag) = entity_type {
            url.query_pairs_mut().append_pair("entity_type", tag);
        }
        let response = self.get_checked(&url, cancel, false).await?;

        let listed: Vec<String> =
            serde_json::from_str(&response.body).map_err(|source| FetchError::List {
                url: url.to_string(),
                source,
            })?;
        listed
            .iter()
            .map(|s| EntityId::parse(s).map_err(FetchError::from))
            .collect()
    }

    async fn get_checked(
        &self,
        url: &Url,
        cancel: &CancellationToken,
        expect_statement: bool,
    ) -> Result<HttpResponse, FetchError> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Cancelled)?;

        let response = tokio::select! {
            () = cancel.cancelled() => return Err(FetchError::Cancelled),
            response = self.http.get(url) => response?,
        };

        if response.status != 200 {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: response.status,
            });
        }

        if expect_statement {
            if let Some(content_type) = &response.content_type {
                let essence = content_type
                    .split(';')
                    .next()
                    .unwrap_or_default()
                    .trim();
                // An absent header is tolerated; a lying one is not.
                if essence != ENTITY_STATEMENT_MEDIA_TYPE && essence != "application/jwt" {
                    return Err(FetchError::ContentType {
                        url: url.to_string(),
                        content_type: content_type.clone(),
                    });
                }
            }
        }

        Ok(response)
    }

    fn slot(&self, key: CacheKey) -> CacheSlot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(slots.entry(key).or_default())
    }

    fn fresh_until(&self, exp: OffsetDateTime, now: OffsetDateTime) -> OffsetDateTime {
        match self.cache_ttl {
            Some(ttl) => exp.min(now + ttl),
            None => exp,
        }
    }
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("skew", &self.skew)
            .field("cache_ttl", &self.cache_ttl)
            .finish_non_exhaustive()
    }
}
