//! Federation entity identifiers.

use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use thiserror::Error;
use url::Url;

use crate::constants::WELL_KNOWN_PATH;

/// Identifies a participant in an OpenID Connect federation.
///
/// An entity ID is an absolute `https` URL. Construction normalises it:
/// scheme and host are lowercased, a default port is dropped, and trailing
/// slashes are trimmed so that `https://example.org` and
/// `https://example.org/` compare equal. The path is otherwise kept verbatim.
/// Queries, fragments and userinfo are rejected.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EntityId {
    normalized: String,
}

/// An error that can arise parsing an entity ID.
#[derive(Debug, Error, PartialEq, Clone)]
#[non_exhaustive]
pub enum EntityIdError {
    /// An empty string cannot be parsed as an entity ID.
    #[error("cannot be empty")]
    Empty,

    /// The input is not a valid absolute URL.
    #[error("not a valid URL")]
    Parse(#[from] url::ParseError),

    /// Entity IDs must use the `https` scheme (`http` is tolerated for
    /// loopback hosts only).
    #[error("scheme must be https")]
    SchemeNotHttps,

    /// The URL carries no host.
    #[error("host is missing")]
    MissingHost,

    /// Entity IDs must not carry a query component.
    #[error("must not include query values")]
    HasQuery,

    /// Entity IDs must not carry a fragment.
    #[error("must not include a fragment")]
    HasFragment,

    /// Entity IDs must not carry userinfo.
    #[error("must not include user info")]
    HasUserInfo,
}

impl EntityId {
    /// Parses and normalises an entity ID.
    ///
    /// # Errors
    ///
    /// Returns an [`EntityIdError`] if the input is not an absolute `https`
    /// URL without query, fragment or userinfo.
    ///
    /// # Examples
    ///
    /// ```
    /// use oidcfed::EntityId;
    ///
    /// let id = EntityId::parse("https://Example.org/op/").unwrap();
    /// assert_eq!("https://example.org/op", id.as_str());
    /// ```
    pub fn parse(input: &str) -> Result<Self, EntityIdError> {
        if input.is_empty() {
            return Err(EntityIdError::Empty);
        }

        let url = Url::parse(input)?;

        match url.scheme() {
            "https" => {}
            // Loopback deployments commonly run without TLS.
            "http" if is_loopback_host(url.host_str()) => {}
            _ => return Err(EntityIdError::SchemeNotHttps),
        }

        if url.host_str().is_none() {
            return Err(EntityIdError::MissingHost);
        }
        if url.query().is_some() {
            return Err(EntityIdError::HasQuery);
        }
        if url.fragment().is_some() {
            return Err(EntityIdError::HasFragment);
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(EntityIdError::HasUserInfo);
        }

        // Url has already lowercased scheme/host and dropped a default port.
        let mut normalized = url.to_string();
        while normalized.ends_with('/') {
            normalized.pop();
        }

        Ok(Self { normalized })
    }

    /// Returns the normalised entity ID string.
    pub fn as_str(&self) -> &str {
        &self.normalized
    }

    /// Returns the URL at which this entity publishes its configuration.
    pub fn well_known_url(&self) -> String {
        format!("{}{}", self.normalized, WELL_KNOWN_PATH)
    }
}

fn is_loopback_host(host: Option<&str>) -> bool {
    matches!(host, Some("localhost" | "127.0.0.1" | "[::1]"))
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized)
    }
}

impl FromStr for EntityId {
    type Err = EntityIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityId::parse(s)
    }
}

impl TryFrom<&str> for EntityId {
    type Error = EntityIdError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        EntityId::parse(s)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}
