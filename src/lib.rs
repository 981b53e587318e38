#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! This crate explores and evaluates OpenID Connect Federation trust
//! structures.
//!
//! Starting from an entity identifier it discovers the federation topology
//! through signed entity statements, builds every valid trust chain to one
//! or more trust anchors, validates each chain's signatures, linkage and
//! temporal integrity, and composes the per-entity metadata resulting from
//! the federation metadata policies along a chain.
//!
//! The entry point is [`FederationClient`]:
//!
//! ```no_run
//! use oidcfed::{EntityId, EntityType, FederationClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = FederationClient::new()?;
//!
//! let leaf = EntityId::parse("https://rp.example.org")?;
//! let anchor = EntityId::parse("https://fed.example.org")?;
//!
//! // Enumerate every valid chain from the leaf to the anchor.
//! let chains = client.trust_chains(&leaf, std::slice::from_ref(&anchor)).await?;
//! for chain in chains.chains() {
//!     println!("{chain}");
//! }
//!
//! // Resolve the relying party metadata the federation agrees on.
//! let resolved = client
//!     .resolve(&leaf, &anchor, EntityType::OpenidRelyingParty)
//!     .await?;
//! println!("{}", serde_json::to_string_pretty(resolved.metadata())?);
//! # Ok(())
//! # }
//! ```

pub mod chain;
pub mod constants;
pub mod entity_id;
pub mod error;
pub mod explore;
pub mod fetch;
pub mod graph;
pub mod keys;
pub mod policy;
pub mod statement;
pub mod verify;

mod client;
mod discovery;
mod resolver;

// Core identifiers and statements
pub use crate::entity_id::{EntityId, EntityIdError};
pub use crate::keys::{FederationKeys, KeysError};
pub use crate::statement::{
    Constraints, EntityStatement, EntityType, JsonMap, NamingConstraints, StatementError,
    TrustMark, TrustMarkRecord,
};

// Verification and fetching
pub use crate::fetch::{FetchError, HttpFetch, HttpResponse, ReqwestFetcher};
pub use crate::verify::VerifyError;

// Chains, policies, exploration results
pub use crate::chain::{ChainError, TrustChain};
pub use crate::explore::{ChainSet, Subtree, SubtreeNode};
pub use crate::policy::{Policy, PolicyError};

// High-level surfaces
pub use crate::client::{FederationClient, FederationClientBuilder};
pub use crate::error::FederationError;
pub use crate::resolver::ResolvedEntity;
