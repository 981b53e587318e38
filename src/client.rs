//! High-level federation client.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::constants::{
    DEFAULT_CLOCK_SKEW, DEFAULT_HTTP_TIMEOUT, DEFAULT_MAX_CONCURRENCY, DEFAULT_MAX_DEPTH,
    DEFAULT_OPERATION_TIMEOUT,
};
use crate::discovery;
use crate::entity_id::EntityId;
use crate::error::FederationError;
use crate::explore::{self, ChainSet, Subtree};
use crate::fetch::{Fetcher, HttpFetch, ReqwestFetcher};
use crate::resolver::{self, ResolvedEntity};
use crate::statement::{EntityStatement, EntityType};

/// Explores and evaluates OpenID Connect federations.
///
/// A client owns a statement cache keyed by `(iss, sub)`; statements fetched
/// once are reused across operations for the lifetime of the client (or
/// until their TTL expires). Concurrent requests for the same statement
/// coalesce into a single HTTP fetch.
///
/// All operations run under the configured overall timeout and can be
/// aborted through [`FederationClient::cancel`]; a cancelled operation
/// returns an error rather than partial results.
#[derive(Debug)]
pub struct FederationClient {
    fetcher: Fetcher,
    max_depth: u32,
    skew: time::Duration,
    operation_timeout: Duration,
    cancel: CancellationToken,
}

/// Builder for [`FederationClient`].
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use oidcfed::FederationClient;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = FederationClient::builder()
///     .http_timeout(Duration::from_secs(5))
///     .max_depth(4)
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct FederationClientBuilder {
    insecure_tls: bool,
    http_timeout: Option<Duration>,
    operation_timeout: Option<Duration>,
    max_concurrency: Option<usize>,
    max_depth: Option<u32>,
    clock_skew: Option<Duration>,
    cache_ttl: Option<Duration>,
    transport: Option<Arc<dyn HttpFetch>>,
}

impl std::fmt::Debug for FederationClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederationClientBuilder")
            .field("insecure_tls", &self.insecure_tls)
            .field("http_timeout", &self.http_timeout)
            .field("operation_timeout", &self.operation_timeout)
            .field("max_concurrency", &self.max_concurrency)
            .field("max_depth", &self.max_depth)
            .field("clock_skew", &self.clock_skew)
            .field("cache_ttl", &self.cache_ttl)
            .field("transport", &self.transport.as_ref().map(|_| "<HttpFetch>"))
            .finish()
    }
}

impl FederationClientBuilder {
    /// Creates a builder with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Disables TLS certificate verification. Off by default; only for test
    /// federations on self-signed certificates.
    #[must_use]
    pub fn insecure_tls(mut self, insecure: bool) -> Self {
        self.insecure_tls = insecure;
        self
    }

    /// Sets the per-request HTTP timeout (default 10 s).
    #[must_use]
    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = Some(timeout);
        self
    }

    /// Sets the overall timeout for a single operation (default 60 s).
    #[must_use]
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Caps concurrently in-flight HTTP requests (default 32).
    #[must_use]
    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    /// Bounds upward discovery in superior hops (default 10).
    #[must_use]
    pub fn max_depth(mut self, depth: u32) -> Self {
        self.max_depth = Some(depth);
        self
    }

    /// Sets the clock skew tolerated on temporal claims (default 60 s).
    #[must_use]
    pub fn clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew = Some(skew);
        self
    }

    /// Caps how long fetched statements are reused. Without a TTL a cached
    /// statement stays fresh until its own `exp`.
    #[must_use]
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Replaces the HTTP transport. Intended for tests and for embedders
    /// with their own connection handling.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn HttpFetch>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Builds the client.
    ///
    /// # Errors
    ///
    /// Returns a [`FederationError`] if the HTTP client cannot be
    /// constructed.
    pub fn build(self) -> Result<FederationClient, FederationError> {
        let http_timeout = self.http_timeout.unwrap_or(DEFAULT_HTTP_TIMEOUT);
        let transport: Arc<dyn HttpFetch> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestFetcher::new(http_timeout, self.insecure_tls)?),
        };

        let skew = self.clock_skew.unwrap_or(DEFAULT_CLOCK_SKEW);
        let skew = time::Duration::try_from(skew).unwrap_or(time::Duration::MAX);
        let cache_ttl = self
            .cache_ttl
            .map(|ttl| time::Duration::try_from(ttl).unwrap_or(time::Duration::MAX));

        Ok(FederationClient {
            fetcher: Fetcher::new(
                transport,
                self.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY),
                skew,
                cache_ttl,
            ),
            max_depth: self.max_depth.unwrap_or(DEFAULT_MAX_DEPTH),
            skew,
            operation_timeout: self.operation_timeout.unwrap_or(DEFAULT_OPERATION_TIMEOUT),
            cancel: CancellationToken::new(),
        })
    }
}

impl FederationClient {
    /// Creates a client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`FederationError`] if the HTTP client cannot be
    /// constructed.
    pub fn new() -> Result<Self, FederationError> {
        Self::builder().build()
    }

    /// Creates a builder for configuring a client.
    pub fn builder() -> FederationClientBuilder {
        FederationClientBuilder::new()
    }

    /// Fetches and verifies an entity's self-signed configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`FederationError`] on network, protocol, signature or
    /// temporal failure.
    pub async fn entity_configuration(
        &self,
        entity: &EntityId,
    ) -> Result<Arc<EntityStatement>, FederationError> {
        self.guard(async {
            self.fetcher
                .configuration(entity, &self.cancel)
                .await
                .map_err(FederationError::from)
        })
        .await
    }

    /// Fetches and verifies the statement `issuer` publishes about
    /// `subject`.
    ///
    /// # Errors
    ///
    /// Returns a [`FederationError`] on network, protocol, signature,
    /// temporal or linkage failure.
    pub async fn subordinate_statement(
        &self,
        issuer: &EntityId,
        subject: &EntityId,
    ) -> Result<Arc<EntityStatement>, FederationError> {
        self.guard(async {
            self.fetcher
                .subordinate(issuer, subject, &self.cancel)
                .await
                .map_err(FederationError::from)
        })
        .await
    }

    /// Lists an entity's subordinates, optionally filtered by entity type.
    ///
    /// # Errors
    ///
    /// Returns a [`FederationError`] if the entity exposes no list endpoint
    /// or the listing cannot be fetched or parsed.
    pub async fn list_subordinates(
        &self,
        entity: &EntityId,
        entity_type: Option<EntityType>,
    ) -> Result<Vec<EntityId>, FederationError> {
        self.guard(async {
            self.fetcher
                .list_subordinates(entity, entity_type.map(|t| t.as_str()), &self.cancel)
                .await
                .map_err(FederationError::from)
        })
        .await
    }

    /// Enumerates all trust chains from `leaf` to the given anchors, or to
    /// every reachable root when `anchors` is empty.
    ///
    /// The returned chains are valid (signatures, linkage, temporal
    /// validity, constraints) and deterministically ordered; per-branch and
    /// per-chain failures are collected on the result instead of aborting
    /// sibling chains.
    ///
    /// # Errors
    ///
    /// Returns a [`FederationError`] only when the leaf configuration
    /// itself cannot be fetched, or on timeout/cancellation.
    pub async fn trust_chains(
        &self,
        leaf: &EntityId,
        anchors: &[EntityId],
    ) -> Result<ChainSet, FederationError> {
        self.guard(explore::enumerate_chains(
            &self.fetcher,
            leaf,
            anchors,
            self.max_depth,
            self.skew,
            &self.cancel,
        ))
        .await
    }

    /// Discovers the federation subtree rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns a [`FederationError`] only when the root configuration
    /// itself cannot be fetched, or on timeout/cancellation.
    pub async fn subtree(&self, root: &EntityId) -> Result<Subtree, FederationError> {
        self.guard(explore::enumerate_subtree(&self.fetcher, root, &self.cancel))
            .await
    }

    /// Resolves an entity's metadata of the given type against a trust
    /// anchor, applying the metadata policies along the shortest valid
    /// chain, and filters the entity's trust marks.
    ///
    /// # Errors
    ///
    /// Returns a [`FederationError`] when no valid chain exists, the leaf
    /// declares no metadata of the requested type, or the composed policy
    /// conflicts or is violated.
    pub async fn resolve(
        &self,
        leaf: &EntityId,
        anchor: &EntityId,
        entity_type: EntityType,
    ) -> Result<ResolvedEntity, FederationError> {
        self.guard(resolver::resolve(
            &self.fetcher,
            leaf,
            anchor,
            entity_type.as_str(),
            self.max_depth,
            self.skew,
            &self.cancel,
        ))
        .await
    }

    /// Discovers all OpenID Providers available to a relying party through
    /// its trust anchors.
    ///
    /// # Errors
    ///
    /// Returns a [`FederationError`] when the starting entity is not a
    /// relying party or no trust anchor is configured or discoverable.
    pub async fn discover(
        &self,
        relying_party: &EntityId,
        anchors: &[EntityId],
    ) -> Result<Vec<EntityId>, FederationError> {
        self.guard(discovery::discover(
            &self.fetcher,
            relying_party,
            anchors,
            self.max_depth,
            self.skew,
            &self.cancel,
        ))
        .await
    }

    /// Aborts outstanding operations. Cancellation is permanent for this
    /// client.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns `true` once the client has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn guard<T, F>(&self, operation: F) -> Result<T, FederationError>
    where
        F: Future<Output = Result<T, FederationError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(FederationError::Cancelled);
        }
        tokio::select! {
            // Dropping the operation future on cancel keeps partial results
            // from ever being emitted.
            () = self.cancel.cancelled() => Err(FederationError::Cancelled),
            outcome = tokio::time::timeout(self.operation_timeout, operation) => match outcome {
                Ok(result) => result,
                Err(_) => Err(FederationError::OperationTimeout),
            },
        }
    }
}
