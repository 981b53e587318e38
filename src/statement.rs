//! Entity statements, trust marks and related claim structures.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::entity_id::{EntityId, EntityIdError};
use crate::keys::FederationKeys;

/// A JSON object, as used for per-entity-type metadata and raw policies.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// The well-known entity types a federation entity can declare metadata for.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum EntityType {
    /// An OpenID Provider.
    OpenidProvider,
    /// An OpenID Relying Party.
    OpenidRelyingParty,
    /// A federation entity (trust anchor or intermediate).
    FederationEntity,
    /// An OAuth 2.0 authorization server.
    OauthAuthorizationServer,
    /// An OAuth 2.0 protected resource.
    OauthResource,
}

impl EntityType {
    /// Returns the metadata tag for this entity type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::OpenidProvider => "openid_provider",
            EntityType::OpenidRelyingParty => "openid_relying_party",
            EntityType::FederationEntity => "federation_entity",
            EntityType::OauthAuthorizationServer => "oauth_authorization_server",
            EntityType::OauthResource => "oauth_resource",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = StatementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openid_provider" => Ok(EntityType::OpenidProvider),
            "openid_relying_party" => Ok(EntityType::OpenidRelyingParty),
            "federation_entity" => Ok(EntityType::FederationEntity),
            "oauth_authorization_server" => Ok(EntityType::OauthAuthorizationServer),
            "oauth_resource" => Ok(EntityType::OauthResource),
            other => Err(StatementError::UnknownEntityType(other.to_owned())),
        }
    }
}

/// An error that can arise parsing an entity statement or trust mark.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StatementError {
    /// The compact JWS could not be decoded.
    #[error("cannot decode statement")]
    Malformed(#[from] jsonwebtoken::errors::Error),

    /// A timestamp claim is outside the representable range.
    #[error("invalid '{0}' timestamp claim")]
    InvalidTimestamp(&'static str),

    /// An entity-ID-valued claim does not hold a valid entity ID.
    #[error("invalid entity id in '{claim}' claim")]
    EntityId {
        /// The claim holding the offending value.
        claim: &'static str,
        /// The underlying parse failure.
        #[source]
        source: EntityIdError,
    },

    /// The string is not one of the well-known entity type tags.
    #[error("unknown entity type '{0}'")]
    UnknownEntityType(String),
}

/// One entry of the `trust_marks` claim: a mark identifier plus the signed
/// trust mark JWT.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct TrustMarkRecord {
    /// The trust mark identifier.
    pub id: String,
    /// The signed trust mark, as a compact JWS.
    pub trust_mark: String,
}

/// Naming constraints a superior imposes on the entity IDs below it.
#[derive(Debug, Clone, Default, Eq, PartialEq, Deserialize)]
pub struct NamingConstraints {
    /// Entity IDs below the constrainer must match one of these prefixes.
    #[serde(default)]
    pub permitted: Vec<String>,
    /// Entity IDs below the constrainer must match none of these prefixes.
    #[serde(default)]
    pub excluded: Vec<String>,
}

/// Constraints a superior imposes on trust chains passing through it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Constraints {
    /// Maximum number of superiors allowed between the constrainer and a
    /// leaf (the constrainer itself does not count).
    #[serde(default)]
    pub max_path_length: Option<u32>,
    /// Naming constraints on subordinate entity IDs.
    #[serde(default)]
    pub naming_constraints: Option<NamingConstraints>,
}

#[derive(Deserialize)]
struct RawClaims {
    iss: String,
    sub: String,
    iat: i64,
    exp: i64,
    #[serde(default)]
    jwks: Option<JwkSet>,
    #[serde(default)]
    authority_hints: Vec<String>,
    #[serde(default)]
    metadata: BTreeMap<String, JsonMap>,
    #[serde(default)]
    metadata_policy: BTreeMap<String, BTreeMap<String, JsonMap>>,
    #[serde(default)]
    trust_marks: Vec<TrustMarkRecord>,
    #[serde(default)]
    trust_mark_issuers: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    constraints: Option<Constraints>,
}

/// A parsed federation entity statement.
///
/// `iss == sub` identifies a self-signed entity configuration; otherwise the
/// statement is a subordinate statement issued by a superior about `sub`.
///
/// A parsed statement is immutable. Parsing performs **no** signature or
/// temporal checks; those belong to [`crate::verify::verify`], which the
/// fetcher and the chain validator run against the appropriate key set. The
/// original compact JWS is retained verbatim in [`EntityStatement::raw`], so
/// unknown claims survive for display and export.
#[derive(Debug, Clone)]
pub struct EntityStatement {
    iss: EntityId,
    sub: EntityId,
    iat: OffsetDateTime,
    exp: OffsetDateTime,
    jwks: Option<FederationKeys>,
    authority_hints: Vec<EntityId>,
    metadata: BTreeMap<String, JsonMap>,
    metadata_policy: BTreeMap<String, BTreeMap<String, JsonMap>>,
    trust_marks: Vec<TrustMarkRecord>,
    trust_mark_issuers: BTreeMap<String, Vec<EntityId>>,
    constraints: Option<Constraints>,
    raw: String,
}

impl EntityStatement {
    /// Parses an entity statement from a compact JWS **without verifying the
    /// signature**.
    ///
    /// Any result of this function is untrusted until it has been verified
    /// against the right key set.
    ///
    /// # Errors
    ///
    /// Returns a [`StatementError`] if the JWS cannot be decoded, a required
    /// claim is missing or malformed, or an entity-ID claim does not parse.
    pub fn parse_insecure(jws: &str) -> Result<Self, StatementError> {
        let mut validation = Validation::default();
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let data = jsonwebtoken::decode::<RawClaims>(
            jws,
            &DecodingKey::from_secret(&[]),
            &validation,
        )?;
        let claims = data.claims;

        let iss = parse_entity_claim(&claims.iss, "iss")?;
        let sub = parse_entity_claim(&claims.sub, "sub")?;
        let iat = OffsetDateTime::from_unix_timestamp(claims.iat)
            .map_err(|_| StatementError::InvalidTimestamp("iat"))?;
        let exp = OffsetDateTime::from_unix_timestamp(claims.exp)
            .map_err(|_| StatementError::InvalidTimestamp("exp"))?;

        let authority_hints = claims
            .authority_hints
            .iter()
            .map(|h| parse_entity_claim(h, "authority_hints"))
            .collect::<Result<Vec<_>, _>>()?;

        let mut trust_mark_issuers = BTreeMap::new();
        for (mark_id, issuers) in claims.trust_mark_issuers {
            let issuers = issuers
                .iter()
                .map(|i| parse_entity_claim(i, "trust_mark_issuers"))
                .collect::<Result<Vec<_>, _>>()?;
            trust_mark_issuers.insert(mark_id, issuers);
        }

        Ok(Self {
            iss,
            sub,
            iat,
            exp,
            jwks: claims.jwks.map(FederationKeys::from_jwk_set),
            authority_hints,
            metadata: claims.metadata,
            metadata_policy: claims.metadata_policy,
            trust_marks: claims.trust_marks,
            trust_mark_issuers,
            constraints: claims.constraints,
            raw: jws.to_owned(),
        })
    }

    /// Returns the issuer of the statement.
    pub fn iss(&self) -> &EntityId {
        &self.iss
    }

    /// Returns the subject of the statement.
    pub fn sub(&self) -> &EntityId {
        &self.sub
    }

    /// Returns the issue time.
    pub fn iat(&self) -> OffsetDateTime {
        self.iat
    }

    /// Returns the expiry time.
    pub fn exp(&self) -> OffsetDateTime {
        self.exp
    }

    /// Returns `true` if this is a self-signed entity configuration.
    pub fn is_self_signed(&self) -> bool {
        self.iss == self.sub
    }

    /// Returns the subject's federation keys, if the statement carries any.
    pub fn jwks(&self) -> Option<&FederationKeys> {
        self.jwks.as_ref()
    }

    /// Returns the superiors this entity names as possible statement issuers.
    pub fn authority_hints(&self) -> &[EntityId] {
        &self.authority_hints
    }

    /// Returns the per-entity-type metadata map.
    pub fn metadata(&self) -> &BTreeMap<String, JsonMap> {
        &self.metadata
    }

    /// Returns the metadata declared for one entity type, if any.
    pub fn metadata_for(&self, entity_type: &str) -> Option<&JsonMap> {
        self.metadata.get(entity_type)
    }

    /// Returns the entity types this statement declares metadata for.
    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.metadata.keys().map(String::as_str)
    }

    /// Returns the raw (not yet operator-checked) metadata policy map.
    pub fn metadata_policy(&self) -> &BTreeMap<String, BTreeMap<String, JsonMap>> {
        &self.metadata_policy
    }

    /// Returns the raw policy slice for one entity type, if any.
    pub fn metadata_policy_for(&self, entity_type: &str) -> Option<&BTreeMap<String, JsonMap>> {
        self.metadata_policy.get(entity_type)
    }

    /// Returns the trust marks attached to the statement.
    pub fn trust_marks(&self) -> &[TrustMarkRecord] {
        &self.trust_marks
    }

    /// Returns the trust mark issuers this entity recognises, keyed by mark
    /// identifier. An empty issuer list delegates to any issuer.
    pub fn trust_mark_issuers(&self) -> &BTreeMap<String, Vec<EntityId>> {
        &self.trust_mark_issuers
    }

    /// Returns the chain constraints carried by the statement, if any.
    pub fn constraints(&self) -> Option<&Constraints> {
        self.constraints.as_ref()
    }

    /// Returns the original compact JWS.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Returns the subject's federation fetch endpoint, if advertised.
    pub fn federation_fetch_endpoint(&self) -> Option<&str> {
        self.federation_entity_claim("federation_fetch_endpoint")
    }

    /// Returns the subject's federation list endpoint, if advertised.
    pub fn federation_list_endpoint(&self) -> Option<&str> {
        self.federation_entity_claim("federation_list_endpoint")
    }

    fn federation_entity_claim(&self, claim: &str) -> Option<&str> {
        self.metadata
            .get(EntityType::FederationEntity.as_str())
            .and_then(|md| md.get(claim))
            .and_then(|v| v.as_str())
    }
}

/// A parsed trust mark JWT.
///
/// Only the claims needed for filtering are extracted; the raw JWS is kept
/// for verification and reporting.
#[derive(Debug, Clone)]
pub struct TrustMark {
    iss: EntityId,
    sub: EntityId,
    id: String,
    iat: OffsetDateTime,
    exp: Option<OffsetDateTime>,
    raw: String,
}

#[derive(Deserialize)]
struct RawTrustMarkClaims {
    iss: String,
    sub: String,
    id: String,
    iat: i64,
    #[serde(default)]
    exp: Option<i64>,
}

impl TrustMark {
    /// Parses a trust mark from a compact JWS **without verifying the
    /// signature**.
    ///
    /// # Errors
    ///
    /// Returns a [`StatementError`] if decoding fails or a required claim is
    /// missing or malformed.
    pub fn parse_insecure(jws: &str) -> Result<Self, StatementError> {
        let mut validation = Validation::default();
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let data = jsonwebtoken::decode::<RawTrustMarkClaims>(
            jws,
            &DecodingKey::from_secret(&[]),
            &validation,
        )?;
        let claims = data.claims;

        let exp = claims
            .exp
            .map(OffsetDateTime::from_unix_timestamp)
            .transpose()
            .map_err(|_| StatementError::InvalidTimestamp("exp"))?;

        Ok(Self {
            iss: parse_entity_claim(&claims.iss, "iss")?,
            sub: parse_entity_claim(&claims.sub, "sub")?,
            id: claims.id,
            iat: OffsetDateTime::from_unix_timestamp(claims.iat)
                .map_err(|_| StatementError::InvalidTimestamp("iat"))?,
            exp,
            raw: jws.to_owned(),
        })
    }

    /// Returns the mark issuer.
    pub fn iss(&self) -> &EntityId {
        &self.iss
    }

    /// Returns the entity the mark is about.
    pub fn sub(&self) -> &EntityId {
        &self.sub
    }

    /// Returns the trust mark identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the issue time.
    pub fn iat(&self) -> OffsetDateTime {
        self.iat
    }

    /// Returns the expiry time, if the mark carries one.
    pub fn exp(&self) -> Option<OffsetDateTime> {
        self.exp
    }

    /// Returns the original compact JWS.
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

fn parse_entity_claim(value: &str, claim: &'static str) -> Result<EntityId, StatementError> {
    EntityId::parse(value).map_err(|source| StatementError::EntityId { claim, source })
}
