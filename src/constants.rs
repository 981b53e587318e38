//! Default limits and protocol constants.

use std::time::Duration;

/// Maximum number of superior hops followed during upward chain discovery.
pub const DEFAULT_MAX_DEPTH: u32 = 10;

/// Clock skew tolerated when checking `iat`/`exp` claims.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(60);

/// Per-request HTTP timeout.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Overall timeout for a single public operation (chain build, resolve, ...).
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Cap on concurrently in-flight HTTP requests.
pub const DEFAULT_MAX_CONCURRENCY: usize = 32;

/// Well-known path at which an entity publishes its configuration.
pub const WELL_KNOWN_PATH: &str = "/.well-known/openid-federation";

/// Media type of a signed entity statement.
pub const ENTITY_STATEMENT_MEDIA_TYPE: &str = "application/entity-statement+jwt";
