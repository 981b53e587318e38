//! Metadata resolution along a validated trust chain.

use time::{Duration, OffsetDateTime};
use tokio_util::sync::CancellationToken;

use crate::chain::{ChainError, TrustChain};
use crate::entity_id::EntityId;
use crate::error::FederationError;
use crate::explore;
use crate::fetch::Fetcher;
use crate::policy;
use crate::statement::{JsonMap, TrustMark};
use crate::verify;

/// The outcome of resolving an entity against a trust anchor: the metadata
/// that results from applying the composed chain policy to the leaf's
/// self-asserted metadata, the trust marks surviving the chain's issuer
/// filter, the chain that was used, and the non-fatal errors collected
/// along the way.
#[derive(Debug)]
pub struct ResolvedEntity {
    entity_id: EntityId,
    trust_anchor: EntityId,
    entity_type: String,
    metadata: JsonMap,
    trust_marks: Vec<TrustMark>,
    chain: TrustChain,
    errors: Vec<FederationError>,
}

impl ResolvedEntity {
    /// Returns the resolved entity's ID.
    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    /// Returns the trust anchor the resolution ran against.
    pub fn trust_anchor(&self) -> &EntityId {
        &self.trust_anchor
    }

    /// Returns the entity type the metadata was resolved for.
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Returns the resolved metadata.
    pub fn metadata(&self) -> &JsonMap {
        &self.metadata
    }

    /// Returns the trust marks that survived verification and issuer
    /// filtering.
    pub fn trust_marks(&self) -> &[TrustMark] {
        &self.trust_marks
    }

    /// Returns the trust chain the resolution used.
    pub fn chain(&self) -> &TrustChain {
        &self.chain
    }

    /// Returns the non-fatal errors collected during resolution, such as
    /// rejected sibling chains and dropped trust marks.
    pub fn errors(&self) -> &[FederationError] {
        &self.errors
    }
}

/// Resolves `leaf` against `anchor` for one entity type: builds the chains,
/// picks the shortest valid one (ties broken lexicographically on superior
/// IDs), composes and applies the metadata policy, and filters the leaf's
/// trust marks.
pub(crate) async fn resolve(
    fetcher: &Fetcher,
    leaf: &EntityId,
    anchor: &EntityId,
    entity_type: &str,
    max_depth: u32,
    skew: Duration,
    cancel: &CancellationToken,
) -> Result<ResolvedEntity, FederationError> {
    let set = explore::enumerate_chains(
        fetcher,
        leaf,
        std::slice::from_ref(anchor),
        max_depth,
        skew,
        cancel,
    )
    .await?;
    let (chains, mut errors) = set.into_parts();

    // Chains arrive sorted; the first is the shortest with the smallest
    // superior concatenation.
    let chain = chains
        .into_iter()
        .next()
        .ok_or_else(|| FederationError::AnchorNotReached {
            leaf: leaf.clone(),
            anchor: anchor.clone(),
        })?;

    let leaf_metadata = chain
        .leaf()
        .metadata_for(entity_type)
        .ok_or_else(|| FederationError::NoMetadata {
            entity: leaf.clone(),
            entity_type: entity_type.to_owned(),
        })?
        .clone();

    let effective_policy = policy::compose_chain_policy(&chain, entity_type)?;
    let metadata = effective_policy.apply(&leaf_metadata)?;

    let now = OffsetDateTime::now_utc();
    let trust_marks = filter_trust_marks(fetcher, &chain, now, skew, cancel, &mut errors).await;

    Ok(ResolvedEntity {
        entity_id: leaf.clone(),
        trust_anchor: anchor.clone(),
        entity_type: entity_type.to_owned(),
        metadata,
        trust_marks,
        chain,
        errors,
    })
}

// A leaf trust mark survives iff some chain statement recognises its issuer
// for the mark's identifier, the mark is about the leaf, and it verifies
// under the issuer's published federation keys. Marks with unrecognised
// issuers are dropped silently; marks failing parsing or verification are
// dropped and reported.
async fn filter_trust_marks(
    fetcher: &Fetcher,
    chain: &TrustChain,
    now: OffsetDateTime,
    skew: Duration,
    cancel: &CancellationToken,
    errors: &mut Vec<FederationError>,
) -> Vec<TrustMark> {
    let leaf = chain.leaf();
    let mut surviving = Vec::new();

    for record in leaf.trust_marks() {
        let mark = match TrustMark::parse_insecure(&record.trust_mark) {
            Ok(mark) => mark,
            Err(e) => {
                errors.push(e.into());
                continue;
            }
        };

        if mark.sub() != leaf.sub() {
            errors.push(
                ChainError::SubjectMismatch {
                    expected: leaf.sub().clone(),
                    found: mark.sub().clone(),
                }
                .into(),
            );
            continue;
        }

        let authorized = chain.statements().iter().any(|statement| {
            match statement.trust_mark_issuers().get(mark.id()) {
                // An empty issuer list delegates to any issuer.
                Some(issuers) => issuers.is_empty() || issuers.contains(mark.iss()),
                None => false,
            }
        });
        if !authorized {
            tracing::debug!(mark = mark.id(), issuer = %mark.iss(), "dropping trust mark from unrecognised issuer");
            continue;
        }

        match fetcher.configuration(mark.iss(), cancel).await {
            Ok(issuer_configuration) => match issuer_configuration.jwks() {
                Some(keys) => match verify::verify(mark.raw(), keys, now, skew) {
                    Ok(_) => surviving.push(mark),
                    Err(e) => {
                        errors.push(
                            ChainError::Verify {
                                subject: mark.sub().clone(),
                                source: e,
                            }
                            .into(),
                        );
                    }
                },
                None => {
                    errors.push(crate::fetch::FetchError::MissingJwks(mark.iss().clone()).into());
                }
            },
            Err(e) => errors.push(e.into()),
        }
    }

    surviving
}
