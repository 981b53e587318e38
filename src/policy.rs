//! Metadata policy composition and application.
//!
//! Superiors constrain a subordinate's metadata through *policy operators*
//! attached to individual claims. Along a validated trust chain the
//! per-statement policies are composed top-down (anchor toward leaf) into a
//! single effective policy, which is then applied to the leaf's
//! self-asserted metadata.
//!
//! Operators form a closed set; composition and application are defined per
//! operator. Application order is fixed: `default`, `add`, `value`,
//! `one_of`, `subset_of`, `superset_of`, `essential`, so defaults populate
//! absent claims before constraint checks fire and `value` overrides
//! whatever `add` contributed.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

use crate::chain::TrustChain;
use crate::statement::JsonMap;

/// An error that can arise composing or applying metadata policies.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PolicyError {
    /// Two policies place irreconcilable operators on the same claim.
    #[error("conflicting policy operators for claim '{claim}': {detail}")]
    Conflict {
        /// The claim carrying the conflict.
        claim: String,
        /// What could not be reconciled.
        detail: String,
    },

    /// A metadata value does not satisfy the composed policy.
    #[error("claim '{claim}' violates the metadata policy: {detail}")]
    Violation {
        /// The offending claim.
        claim: String,
        /// The failed check.
        detail: String,
    },

    /// A claim marked essential is absent after policy application.
    #[error("essential claim '{claim}' is missing")]
    EssentialClaimMissing {
        /// The missing claim.
        claim: String,
    },

    /// A policy uses an operator outside the federation-defined set.
    #[error("unknown policy operator '{operator}' for claim '{claim}'")]
    UnknownOperator {
        /// The claim the operator was attached to.
        claim: String,
        /// The unrecognised operator name.
        operator: String,
    },

    /// An operator carries an operand of the wrong shape.
    #[error("malformed operand for operator '{operator}' on claim '{claim}'")]
    Operand {
        /// The claim the operator was attached to.
        claim: String,
        /// The operator with the bad operand.
        operator: String,
    },
}

/// The policy operators attached to a single metadata claim.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClaimPolicy {
    value: Option<Value>,
    add: Option<Vec<Value>>,
    default: Option<Value>,
    one_of: Option<Vec<Value>>,
    subset_of: Option<Vec<Value>>,
    superset_of: Option<Vec<Value>>,
    essential: Option<bool>,
}

impl ClaimPolicy {
    fn from_raw(claim: &str, raw: &JsonMap) -> Result<Self, PolicyError> {
        let mut policy = ClaimPolicy::default();
        for (operator, operand) in raw {
            match operator.as_str() {
                "value" => policy.value = Some(operand.clone()),
                "add" => policy.add = Some(value_list(operand)),
                "default" => policy.default = Some(operand.clone()),
                "one_of" => policy.one_of = Some(value_list(operand)),
                "subset_of" => policy.subset_of = Some(value_list(operand)),
                "superset_of" => policy.superset_of = Some(value_list(operand)),
                "essential" => {
                    policy.essential =
                        Some(operand.as_bool().ok_or_else(|| PolicyError::Operand {
                            claim: claim.to_owned(),
                            operator: operator.clone(),
                        })?);
                }
                other => {
                    return Err(PolicyError::UnknownOperator {
                        claim: claim.to_owned(),
                        operator: other.to_owned(),
                    })
                }
            }
        }
        Ok(policy)
    }

    /// Combines a superior's claim policy with a subordinate's.
    ///
    /// A subordinate can only make the combined policy more restrictive: an
    /// exact `value` admits no further constraining, `one_of` operands
    /// intersect, `add`/`superset_of` operands union, a superior's `default`
    /// cannot be replaced, and `essential` can only be switched on.
    fn combine(claim: &str, superior: &Self, child: &Self) -> Result<Self, PolicyError> {
        if let Some(sup_value) = &superior.value {
            // An exact value cannot be restricted further; only an equal
            // value or an essential flag may ride along.
            if let Some(child_value) = &child.value {
                if child_value != sup_value {
                    return Err(PolicyError::Conflict {
                        claim: claim.to_owned(),
                        detail: "differing 'value' operators".to_owned(),
                    });
                }
            }
            if child.add.is_some()
                || child.default.is_some()
                || child.one_of.is_some()
                || child.subset_of.is_some()
                || child.superset_of.is_some()
            {
                return Err(PolicyError::Conflict {
                    claim: claim.to_owned(),
                    detail: "'value' combines only with 'essential'".to_owned(),
                });
            }
            let mut combined = superior.clone();
            combined.essential = or_essential(superior.essential, child.essential);
            return Ok(combined);
        }

        let one_of = match (&superior.one_of, &child.one_of) {
            (Some(a), Some(b)) => {
                let both = intersect(a, b);
                if both.is_empty() {
                    return Err(PolicyError::Conflict {
                        claim: claim.to_owned(),
                        detail: "'one_of' operands do not overlap".to_owned(),
                    });
                }
                Some(both)
            }
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.clone()),
            (None, None) => None,
        };

        let combined = ClaimPolicy {
            value: child.value.clone(),
            add: merge_option(&superior.add, &child.add, union),
            default: superior.default.clone().or_else(|| child.default.clone()),
            one_of,
            subset_of: merge_option(&superior.subset_of, &child.subset_of, intersect),
            superset_of: merge_option(&superior.superset_of, &child.superset_of, union),
            essential: or_essential(superior.essential, child.essential),
        };
        combined.check_consistency(claim)?;
        Ok(combined)
    }

    // Cross-operator consistency of a combined claim policy.
    fn check_consistency(&self, claim: &str) -> Result<(), PolicyError> {
        let conflict = |detail: &str| PolicyError::Conflict {
            claim: claim.to_owned(),
            detail: detail.to_owned(),
        };

        if self.one_of.is_some() && (self.subset_of.is_some() || self.superset_of.is_some()) {
            return Err(conflict("'one_of' excludes 'subset_of'/'superset_of'"));
        }
        if let (Some(superset), Some(subset)) = (&self.superset_of, &self.subset_of) {
            if !is_subset(superset, subset) {
                return Err(conflict("'superset_of' is not covered by 'subset_of'"));
            }
        }
        if let Some(default) = &self.default {
            let default_values = value_list(default);
            if let Some(subset) = &self.subset_of {
                if !is_subset(&default_values, subset) {
                    return Err(conflict("'default' is not covered by 'subset_of'"));
                }
            }
            if let Some(superset) = &self.superset_of {
                if !is_subset(superset, &default_values) {
                    return Err(conflict("'default' does not cover 'superset_of'"));
                }
            }
            if let Some(one_of) = &self.one_of {
                if !is_subset(&default_values, one_of) {
                    return Err(conflict("'default' is not among 'one_of'"));
                }
            }
        }
        Ok(())
    }

    /// Applies this claim policy to `metadata`, in the fixed operator order.
    fn apply(&self, claim: &str, metadata: &mut JsonMap) -> Result<(), PolicyError> {
        if !metadata.contains_key(claim) {
            if let Some(default) = &self.default {
                metadata.insert(claim.to_owned(), default.clone());
            }
        }

        if let Some(add) = &self.add {
            match metadata.get_mut(claim) {
                Some(Value::Array(existing)) => {
                    for item in add {
                        if !existing.contains(item) {
                            existing.push(item.clone());
                        }
                    }
                }
                Some(scalar) => {
                    let mut list = vec![scalar.clone()];
                    for item in add {
                        if !list.contains(item) {
                            list.push(item.clone());
                        }
                    }
                    *scalar = Value::Array(list);
                }
                None => {
                    metadata.insert(claim.to_owned(), Value::Array(add.clone()));
                }
            }
        }

        if let Some(value) = &self.value {
            metadata.insert(claim.to_owned(), value.clone());
        }

        if let Some(allowed) = &self.one_of {
            if let Some(current) = metadata.get(claim) {
                for item in value_list(current) {
                    if !allowed.contains(&item) {
                        return Err(PolicyError::Violation {
                            claim: claim.to_owned(),
                            detail: format!("{item} is not among the permitted values"),
                        });
                    }
                }
            }
        }

        if let Some(allowed) = &self.subset_of {
            if let Some(current) = metadata.get_mut(claim) {
                match current {
                    Value::Array(items) => {
                        let was_populated = !items.is_empty();
                        items.retain(|item| allowed.contains(item));
                        if was_populated && items.is_empty() {
                            return Err(PolicyError::Violation {
                                claim: claim.to_owned(),
                                detail: "no value remains after 'subset_of' filtering".to_owned(),
                            });
                        }
                    }
                    scalar => {
                        if !allowed.contains(scalar) {
                            return Err(PolicyError::Violation {
                                claim: claim.to_owned(),
                                detail: format!("{scalar} is outside the permitted subset"),
                            });
                        }
                    }
                }
            }
        }

        if let Some(required) = &self.superset_of {
            if let Some(current) = metadata.get(claim) {
                let present = value_list(current);
                if !is_subset(required, &present) {
                    return Err(PolicyError::Violation {
                        claim: claim.to_owned(),
                        detail: "required values are missing".to_owned(),
                    });
                }
            }
        }

        if self.essential == Some(true) && !metadata.contains_key(claim) {
            return Err(PolicyError::EssentialClaimMissing {
                claim: claim.to_owned(),
            });
        }

        Ok(())
    }

    fn is_identity(&self) -> bool {
        *self == ClaimPolicy::default()
    }
}

/// The effective metadata policy for one entity type: a claim-to-operators
/// map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Policy {
    claims: BTreeMap<String, ClaimPolicy>,
}

impl Policy {
    /// Builds a policy from the raw per-claim operator maps of a statement's
    /// `metadata_policy` slice.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::UnknownOperator`] for operators outside the
    /// federation-defined set.
    pub fn from_raw(raw: &BTreeMap<String, JsonMap>) -> Result<Self, PolicyError> {
        let mut claims = BTreeMap::new();
        for (claim, operators) in raw {
            claims.insert(claim.clone(), ClaimPolicy::from_raw(claim, operators)?);
        }
        Ok(Self { claims })
    }

    /// Returns `true` if the policy constrains nothing.
    pub fn is_empty(&self) -> bool {
        self.claims.values().all(ClaimPolicy::is_identity)
    }

    /// Combines a superior's policy with a subordinate's, claim by claim.
    ///
    /// The empty policy is the identity of this operation.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Conflict`] when operators on a shared claim
    /// cannot be reconciled.
    pub fn combine(superior: &Policy, child: &Policy) -> Result<Policy, PolicyError> {
        let mut claims = superior.claims.clone();
        for (claim, child_policy) in &child.claims {
            let combined = match superior.claims.get(claim) {
                Some(superior_policy) => {
                    ClaimPolicy::combine(claim, superior_policy, child_policy)?
                }
                None => child_policy.clone(),
            };
            claims.insert(claim.clone(), combined);
        }
        Ok(Policy { claims })
    }

    /// Applies the policy to a metadata document, returning the resolved
    /// metadata. Claims without a policy pass through untouched.
    ///
    /// # Errors
    ///
    /// Returns a [`PolicyError`] when a constraint is violated or an
    /// essential claim is missing.
    pub fn apply(&self, metadata: &JsonMap) -> Result<JsonMap, PolicyError> {
        let mut resolved = metadata.clone();
        for (claim, policy) in &self.claims {
            policy.apply(claim, &mut resolved)?;
        }
        Ok(resolved)
    }
}

/// Composes the metadata policies of a chain's statements for one entity
/// type, anchor toward leaf. The leaf's own configuration contributes no
/// policy.
pub(crate) fn compose_chain_policy(
    chain: &TrustChain,
    entity_type: &str,
) -> Result<Policy, PolicyError> {
    let mut combined = Policy::default();
    for (index, statement) in chain.statements().iter().enumerate().rev() {
        if index == 0 {
            break;
        }
        let Some(raw) = statement.metadata_policy_for(entity_type) else {
            continue;
        };
        let policy = Policy::from_raw(raw)?;
        combined = Policy::combine(&combined, &policy)?;
    }
    Ok(combined)
}

fn value_list(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

fn intersect(a: &[Value], b: &[Value]) -> Vec<Value> {
    a.iter().filter(|v| b.contains(v)).cloned().collect()
}

fn union(a: &[Value], b: &[Value]) -> Vec<Value> {
    let mut merged = a.to_vec();
    for item in b {
        if !merged.contains(item) {
            merged.push(item.clone());
        }
    }
    merged
}

fn is_subset(a: &[Value], b: &[Value]) -> bool {
    a.iter().all(|v| b.contains(v))
}

fn merge_option(
    a: &Option<Vec<Value>>,
    b: &Option<Vec<Value>>,
    merge: fn(&[Value], &[Value]) -> Vec<Value>,
) -> Option<Vec<Value>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(merge(a, b)),
        (Some(a), None) => Some(a.clone()),
        (None, Some(b)) => Some(b.clone()),
        (None, None) => None,
    }
}

fn or_essential(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (None, None) => None,
        _ => Some(a.unwrap_or(false) || b.unwrap_or(false)),
    }
}
