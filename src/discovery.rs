//! Provider discovery through a relying party's trust anchors.

use std::collections::BTreeSet;

use time::Duration;
use tokio_util::sync::CancellationToken;

use crate::entity_id::EntityId;
use crate::error::FederationError;
use crate::explore;
use crate::fetch::Fetcher;
use crate::statement::EntityType;

/// Discovers all OpenID Providers reachable through a relying party's trust
/// anchors.
///
/// When `anchors` is empty, the anchors are inferred by unconstrained chain
/// building from the relying party. Every candidate provider found in an
/// anchor's subtree must itself build at least one valid chain to that
/// anchor to be emitted. The result is sorted and duplicate-free.
pub(crate) async fn discover(
    fetcher: &Fetcher,
    relying_party: &EntityId,
    anchors: &[EntityId],
    max_depth: u32,
    skew: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<EntityId>, FederationError> {
    let configuration = fetcher.configuration(relying_party, cancel).await?;
    if configuration
        .metadata_for(EntityType::OpenidRelyingParty.as_str())
        .is_none()
    {
        return Err(FederationError::NotARelyingParty(relying_party.clone()));
    }

    let anchors: Vec<EntityId> = if anchors.is_empty() {
        let set = explore::enumerate_chains(fetcher, relying_party, &[], max_depth, skew, cancel)
            .await?;
        let inferred: BTreeSet<EntityId> = set
            .chains()
            .iter()
            .map(|chain| chain.anchor().sub().clone())
            .collect();
        if inferred.is_empty() {
            return Err(FederationError::NoTrustAnchor);
        }
        tracing::debug!(count = inferred.len(), "inferred trust anchors from chain building");
        inferred.into_iter().collect()
    } else {
        anchors.to_vec()
    };

    let mut providers = BTreeSet::new();
    for anchor in &anchors {
        let subtree = explore::enumerate_subtree(fetcher, anchor, cancel).await?;
        for candidate in subtree.entities_of_type(EntityType::OpenidProvider.as_str()) {
            if providers.contains(&candidate) {
                continue;
            }
            let set = explore::enumerate_chains(
                fetcher,
                &candidate,
                std::slice::from_ref(anchor),
                max_depth,
                skew,
                cancel,
            )
            .await?;
            if set.chains().is_empty() {
                tracing::debug!(provider = %candidate, anchor = %anchor, "provider has no valid chain to anchor");
            } else {
                providers.insert(candidate);
            }
        }
    }

    Ok(providers.into_iter().collect())
}
