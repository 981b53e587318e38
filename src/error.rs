//! Crate-level error type.

use thiserror::Error;

use crate::chain::ChainError;
use crate::entity_id::{EntityId, EntityIdError};
use crate::fetch::FetchError;
use crate::keys::KeysError;
use crate::policy::PolicyError;
use crate::statement::StatementError;
use crate::verify::VerifyError;

/// Any error produced by federation exploration and resolution.
///
/// Module-level errors convert into this type via `From`; the handful of
/// orchestration failures that belong to no single module live here
/// directly.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FederationError {
    /// An entity ID failed to parse.
    #[error(transparent)]
    EntityId(#[from] EntityIdError),

    /// A statement failed to parse.
    #[error(transparent)]
    Statement(#[from] StatementError),

    /// A key set failed to parse.
    #[error(transparent)]
    Keys(#[from] KeysError),

    /// A signature or temporal check failed.
    #[error(transparent)]
    Verify(#[from] VerifyError),

    /// A fetch failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// A chain failed validation.
    #[error(transparent)]
    Chain(#[from] ChainError),

    /// Policy composition or application failed.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// No valid chain links the leaf to the requested trust anchor.
    #[error("no valid trust chain from {leaf} to {anchor}")]
    AnchorNotReached {
        /// The leaf entity.
        leaf: EntityId,
        /// The requested trust anchor.
        anchor: EntityId,
    },

    /// The leaf declares no metadata for the requested entity type.
    #[error("{entity} declares no '{entity_type}' metadata")]
    NoMetadata {
        /// The leaf entity.
        entity: EntityId,
        /// The requested entity type tag.
        entity_type: String,
    },

    /// Discovery was started from an entity that is not a relying party.
    #[error("{0} is not an OpenID Relying Party")]
    NotARelyingParty(EntityId),

    /// No trust anchor was supplied and none could be discovered.
    #[error("no trust anchor configured or discoverable")]
    NoTrustAnchor,

    /// The overall operation timeout elapsed.
    #[error("operation timed out")]
    OperationTimeout,

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}
