//! Trust chains and chain validation.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use time::{Duration, OffsetDateTime};

use crate::entity_id::EntityId;
use crate::statement::EntityStatement;
use crate::verify::{self, VerifyError};

/// An ordered sequence of statements linking a leaf to a trust anchor.
///
/// The canonical form interleaves self-signed and subordinate statements:
/// `[leaf_self, sub_about_leaf, superior_self, sub_about_superior, …,
/// anchor_self]`. A chain over a single entity (the leaf being its own
/// anchor) consists of just the leaf configuration.
#[derive(Debug, Clone)]
pub struct TrustChain {
    statements: Vec<Arc<EntityStatement>>,
}

/// An error that can arise validating a trust chain.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChainError {
    /// A chain must contain at least the leaf configuration.
    #[error("trust chain is empty")]
    Empty,

    /// The chain does not follow the canonical interleaved form.
    #[error("trust chain is structurally malformed")]
    Malformed,

    /// The first statement is not a self-signed configuration.
    #[error("leaf statement is not self-signed")]
    LeafNotSelfSigned,

    /// A statement expected to be a self-signed configuration is not.
    #[error("statement for {0} is not self-signed")]
    NotSelfSigned(EntityId),

    /// A self-signed configuration carries no federation keys.
    #[error("entity configuration for {0} carries no federation keys")]
    MissingJwks(EntityId),

    /// A statement in the chain fails signature or temporal verification.
    #[error("statement about {subject} fails verification")]
    Verify {
        /// The statement subject.
        subject: EntityId,
        /// The verification failure.
        #[source]
        source: VerifyError,
    },

    /// A subordinate statement is not issued by the superior above it.
    #[error("subordinate statement issued by {found} where {expected} was required")]
    IssuerMismatch {
        /// The issuer the chain position requires.
        expected: EntityId,
        /// The issuer the statement names.
        found: EntityId,
    },

    /// A subordinate statement is not about the entity below it.
    #[error("subordinate statement about {found} where {expected} was required")]
    SubjectMismatch {
        /// The subject the chain position requires.
        expected: EntityId,
        /// The subject the statement names.
        found: EntityId,
    },

    /// The chain terminates at an entity outside the configured anchor set.
    #[error("chain terminates at {0}, which is not a configured trust anchor")]
    AnchorMismatch(EntityId),

    /// A superior's `max_path_length` constraint is exceeded.
    #[error("path below {constrainer} exceeds its max_path_length of {limit}")]
    PathTooLong {
        /// The entity imposing the constraint.
        constrainer: EntityId,
        /// The constraint value.
        limit: u32,
    },

    /// A superior's naming constraints reject an entity below it.
    #[error("{entity} violates the naming constraints imposed by {constrainer}")]
    NamingConstraint {
        /// The entity imposing the constraint.
        constrainer: EntityId,
        /// The rejected entity.
        entity: EntityId,
    },

    /// An entity reappeared on the path it was discovered on.
    #[error("cycle through {0} detected during chain discovery")]
    CycleDetected(EntityId),

    /// Upward discovery hit the depth bound before reaching an anchor.
    #[error("chain discovery above {entity} exceeded the depth limit of {limit}")]
    MaxDepthExceeded {
        /// The entity whose superiors were not explored.
        entity: EntityId,
        /// The configured depth limit.
        limit: u32,
    },

    /// The leaf names no superiors at all.
    #[error("{0} names no authority hints")]
    NoAuthorityHint(EntityId),
}

impl TrustChain {
    pub(crate) fn new(statements: Vec<Arc<EntityStatement>>) -> Self {
        debug_assert!(!statements.is_empty());
        debug_assert!(statements.len() % 2 == 1);
        Self { statements }
    }

    /// Returns the statements in canonical leaf-to-anchor order.
    pub fn statements(&self) -> &[Arc<EntityStatement>] {
        &self.statements
    }

    /// Returns the leaf's self-signed configuration.
    pub fn leaf(&self) -> &EntityStatement {
        &self.statements[0]
    }

    /// Returns the anchor's self-signed configuration.
    pub fn anchor(&self) -> &EntityStatement {
        &self.statements[self.statements.len() - 1]
    }

    /// Returns the number of superior hops between leaf and anchor.
    pub fn hops(&self) -> usize {
        (self.statements.len() - 1) / 2
    }

    /// Iterates over the entity IDs along the chain, leaf first.
    pub fn entity_ids(&self) -> impl Iterator<Item = &EntityId> {
        self.statements.iter().step_by(2).map(|s| s.sub())
    }

    /// Returns the earliest expiry among the chain's statements.
    pub fn expires_at(&self) -> OffsetDateTime {
        self.statements
            .iter()
            .map(|s| s.exp())
            .min()
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    /// Returns the raw compact JWSs of the chain, leaf first.
    pub fn raw_jws(&self) -> Vec<String> {
        self.statements.iter().map(|s| s.raw().to_owned()).collect()
    }

    pub(crate) fn sort_key(&self) -> (usize, String, String) {
        let superiors = self
            .entity_ids()
            .skip(1)
            .map(EntityId::as_str)
            .collect::<Vec<_>>()
            .join(" ");
        (
            self.hops(),
            self.anchor().sub().as_str().to_owned(),
            superiors,
        )
    }

    /// Validates the chain: statement signatures, issuer/subject linkage,
    /// temporal validity, anchor identity, and superior constraints.
    ///
    /// With an empty `anchors` slice, any self-signed top-of-chain entity is
    /// accepted as the terminating root.
    ///
    /// # Errors
    ///
    /// Returns the first [`ChainError`] encountered, leaf to anchor.
    pub fn validate(
        &self,
        anchors: &[EntityId],
        now: OffsetDateTime,
        skew: Duration,
    ) -> Result<(), ChainError> {
        let leaf = self.statements.first().ok_or(ChainError::Empty)?;
        if self.statements.len() % 2 == 0 {
            return Err(ChainError::Malformed);
        }
        if !leaf.is_self_signed() {
            return Err(ChainError::LeafNotSelfSigned);
        }
        verify_self_signed(leaf, now, skew)?;

        for k in (1..self.statements.len()).step_by(2) {
            let below = &self.statements[k - 1];
            let subordinate = &self.statements[k];
            let superior = &self.statements[k + 1];

            if !superior.is_self_signed() {
                return Err(ChainError::NotSelfSigned(superior.sub().clone()));
            }
            verify_self_signed(superior, now, skew)?;

            let keys = superior
                .jwks()
                .ok_or_else(|| ChainError::MissingJwks(superior.sub().clone()))?;
            verify::verify(subordinate.raw(), keys, now, skew).map_err(|source| {
                ChainError::Verify {
                    subject: subordinate.sub().clone(),
                    source,
                }
            })?;

            if subordinate.iss() != superior.sub() {
                return Err(ChainError::IssuerMismatch {
                    expected: superior.sub().clone(),
                    found: subordinate.iss().clone(),
                });
            }
            if subordinate.sub() != below.sub() {
                return Err(ChainError::SubjectMismatch {
                    expected: below.sub().clone(),
                    found: subordinate.sub().clone(),
                });
            }
        }

        let top = self.anchor();
        if !anchors.is_empty() && !anchors.contains(top.sub()) {
            return Err(ChainError::AnchorMismatch(top.sub().clone()));
        }

        self.check_constraints()
    }

    // Constraint positions count in superior hops from the leaf: the leaf
    // sits at position 0, the anchor at position hops(). A subordinate
    // statement's constraints belong to its issuer.
    fn check_constraints(&self) -> Result<(), ChainError> {
        for (index, statement) in self.statements.iter().enumerate() {
            let Some(constraints) = statement.constraints() else {
                continue;
            };
            let position = if index % 2 == 0 {
                index / 2
            } else {
                (index + 1) / 2
            };
            let constrainer = if index % 2 == 0 {
                statement.sub()
            } else {
                statement.iss()
            };

            if let Some(limit) = constraints.max_path_length {
                let below = position.saturating_sub(1) as u32;
                if below > limit {
                    return Err(ChainError::PathTooLong {
                        constrainer: constrainer.clone(),
                        limit,
                    });
                }
            }

            if let Some(naming) = &constraints.naming_constraints {
                for q in 0..position {
                    let entity = self.statements[2 * q].sub();
                    let permitted_ok = naming.permitted.is_empty()
                        || naming.permitted.iter().any(|p| entity.as_str().starts_with(p.as_str()));
                    let excluded_hit = naming
                        .excluded
                        .iter()
                        .any(|p| entity.as_str().starts_with(p.as_str()));
                    if !permitted_ok || excluded_hit {
                        return Err(ChainError::NamingConstraint {
                            constrainer: constrainer.clone(),
                            entity: entity.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

fn verify_self_signed(
    statement: &EntityStatement,
    now: OffsetDateTime,
    skew: Duration,
) -> Result<(), ChainError> {
    let keys = statement
        .jwks()
        .ok_or_else(|| ChainError::MissingJwks(statement.sub().clone()))?;
    verify::verify(statement.raw(), keys, now, skew)
        .map(|_| ())
        .map_err(|source| ChainError::Verify {
            subject: statement.sub().clone(),
            source,
        })
}

impl fmt::Display for TrustChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids = self
            .entity_ids()
            .map(EntityId::as_str)
            .collect::<Vec<_>>()
            .join(" -> ");
        write!(f, "* {ids}")
    }
}
