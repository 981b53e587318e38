//! Federation graph exploration: upward chain discovery and downward
//! subtree enumeration.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use time::{Duration, OffsetDateTime};
use tokio_util::sync::CancellationToken;

use crate::chain::{ChainError, TrustChain};
use crate::entity_id::EntityId;
use crate::error::FederationError;
use crate::fetch::{FetchError, Fetcher};
use crate::statement::EntityStatement;

/// The outcome of upward chain discovery: the valid chains, sorted by
/// (hops, anchor ID, superior IDs), plus the non-fatal errors collected
/// along rejected branches. A failing branch or chain never suppresses its
/// siblings.
#[derive(Debug)]
pub struct ChainSet {
    chains: Vec<TrustChain>,
    errors: Vec<FederationError>,
}

impl ChainSet {
    /// Returns the valid chains, in deterministic order.
    pub fn chains(&self) -> &[TrustChain] {
        &self.chains
    }

    /// Returns the errors collected from rejected branches and chains.
    pub fn errors(&self) -> &[FederationError] {
        &self.errors
    }

    /// Consumes the set, returning chains and errors.
    pub fn into_parts(self) -> (Vec<TrustChain>, Vec<FederationError>) {
        (self.chains, self.errors)
    }
}

/// One node of a discovered federation subtree.
#[derive(Debug)]
pub struct SubtreeNode {
    statement: Arc<EntityStatement>,
    subordinate_statement: Option<Arc<EntityStatement>>,
    children: Vec<SubtreeNode>,
}

impl SubtreeNode {
    /// Returns the node's entity ID.
    pub fn entity_id(&self) -> &EntityId {
        self.statement.sub()
    }

    /// Returns the node's self-signed configuration.
    pub fn statement(&self) -> &EntityStatement {
        &self.statement
    }

    /// Returns the statement the superior issued about this node, absent
    /// only on the subtree root.
    pub fn subordinate_statement(&self) -> Option<&EntityStatement> {
        self.subordinate_statement.as_deref()
    }

    /// Returns the node's discovered subordinates.
    pub fn children(&self) -> &[SubtreeNode] {
        &self.children
    }

    fn collect_of_type(&self, entity_type: &str, into: &mut Vec<EntityId>) {
        if self.statement.metadata_for(entity_type).is_some() {
            into.push(self.statement.sub().clone());
        }
        for child in &self.children {
            child.collect_of_type(entity_type, into);
        }
    }
}

/// A federation subtree discovered by downward enumeration, plus the
/// non-fatal errors hit along the way.
#[derive(Debug)]
pub struct Subtree {
    root: SubtreeNode,
    errors: Vec<FederationError>,
}

impl Subtree {
    /// Returns the subtree root.
    pub fn root(&self) -> &SubtreeNode {
        &self.root
    }

    /// Returns the errors collected from unreachable branches.
    pub fn errors(&self) -> &[FederationError] {
        &self.errors
    }

    /// Returns all entities in the subtree declaring metadata for the given
    /// entity type, in tree order.
    pub fn entities_of_type(&self, entity_type: &str) -> Vec<EntityId> {
        let mut entities = Vec::new();
        self.root.collect_of_type(entity_type, &mut entities);
        entities
    }
}

type ChainSuffix = Vec<Arc<EntityStatement>>;
type ExpandOutput = (Vec<ChainSuffix>, Vec<FederationError>);

/// Enumerates all trust chains from `leaf` upward.
///
/// With a non-empty `anchors` set only chains terminating at a configured
/// anchor are emitted; otherwise every reachable root (an entity without
/// authority hints) terminates a chain. Distinct superiors are expanded in
/// parallel; a per-path visited set prunes cycles without suppressing other
/// paths through the same entity.
pub(crate) async fn enumerate_chains(
    fetcher: &Fetcher,
    leaf: &EntityId,
    anchors: &[EntityId],
    max_depth: u32,
    skew: Duration,
    cancel: &CancellationToken,
) -> Result<ChainSet, FederationError> {
    let leaf_configuration = fetcher.configuration(leaf, cancel).await?;

    let mut errors = Vec::new();
    let mut candidates: Vec<ChainSuffix> = Vec::new();

    if anchors.contains(leaf) {
        candidates.push(vec![Arc::clone(&leaf_configuration)]);
    }
    if leaf_configuration.authority_hints().is_empty() && candidates.is_empty() {
        errors.push(ChainError::NoAuthorityHint(leaf.clone()).into());
    }

    let mut visited = HashSet::new();
    visited.insert(leaf.clone());

    let (suffixes, branch_errors) = expand(
        fetcher,
        Arc::clone(&leaf_configuration),
        anchors,
        visited,
        0,
        max_depth,
        cancel,
    )
    .await;
    errors.extend(branch_errors);

    candidates.extend(suffixes.into_iter().map(|suffix| {
        let mut statements = vec![Arc::clone(&leaf_configuration)];
        statements.extend(suffix);
        statements
    }));

    let mut discovered: Vec<TrustChain> = candidates.into_iter().map(TrustChain::new).collect();
    discovered.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    let now = OffsetDateTime::now_utc();
    let mut chains = Vec::new();
    for chain in discovered {
        match chain.validate(anchors, now, skew) {
            Ok(()) => chains.push(chain),
            Err(e) => {
                tracing::warn!(chain = %chain, error = %e, "discarding invalid chain");
                errors.push(e.into());
            }
        }
    }

    Ok(ChainSet { chains, errors })
}

// Expands the superiors of `node`, returning chain suffixes of the form
// [subordinate_about_node, superior_self, ...]. Recursion is boxed because
// async fns cannot recurse directly.
fn expand<'a>(
    fetcher: &'a Fetcher,
    node: Arc<EntityStatement>,
    anchors: &'a [EntityId],
    visited: HashSet<EntityId>,
    depth: u32,
    max_depth: u32,
    cancel: &'a CancellationToken,
) -> Pin<Box<dyn Future<Output = ExpandOutput> + Send + 'a>> {
    Box::pin(async move {
        if depth >= max_depth {
            return (
                Vec::new(),
                vec![ChainError::MaxDepthExceeded {
                    entity: node.sub().clone(),
                    limit: max_depth,
                }
                .into()],
            );
        }

        let mut errors = Vec::new();
        let mut branches = Vec::new();
        for parent in node.authority_hints() {
            if visited.contains(parent) {
                errors.push(ChainError::CycleDetected(parent.clone()).into());
                continue;
            }
            branches.push(expand_branch(
                fetcher,
                Arc::clone(&node),
                parent,
                anchors,
                visited.clone(),
                depth,
                max_depth,
                cancel,
            ));
        }

        let mut suffixes = Vec::new();
        for (branch_suffixes, branch_errors) in join_all(branches).await {
            suffixes.extend(branch_suffixes);
            errors.extend(branch_errors);
        }
        (suffixes, errors)
    })
}

#[allow(clippy::too_many_arguments)]
async fn expand_branch(
    fetcher: &Fetcher,
    node: Arc<EntityStatement>,
    parent: &EntityId,
    anchors: &[EntityId],
    mut visited: HashSet<EntityId>,
    depth: u32,
    max_depth: u32,
    cancel: &CancellationToken,
) -> ExpandOutput {
    let parent_configuration = match fetcher.configuration(parent, cancel).await {
        Ok(configuration) => configuration,
        Err(e) => return (Vec::new(), vec![e.into()]),
    };
    let subordinate = match fetcher.subordinate(parent, node.sub(), cancel).await {
        Ok(statement) => statement,
        Err(e) => return (Vec::new(), vec![e.into()]),
    };

    let link = vec![subordinate, Arc::clone(&parent_configuration)];

    if anchors.contains(parent) {
        return (vec![link], Vec::new());
    }
    if parent_configuration.authority_hints().is_empty() {
        if anchors.is_empty() {
            // Unconstrained discovery: a hintless entity is a root.
            return (vec![link], Vec::new());
        }
        tracing::debug!(parent = %parent, "dead end: root outside the anchor set");
        return (Vec::new(), Vec::new());
    }

    visited.insert(parent.clone());
    let (suffixes, errors) = expand(
        fetcher,
        parent_configuration,
        anchors,
        visited,
        depth + 1,
        max_depth,
        cancel,
    )
    .await;

    let extended = suffixes
        .into_iter()
        .map(|suffix| {
            let mut statements = link.clone();
            statements.extend(suffix);
            statements
        })
        .collect();
    (extended, errors)
}

/// Discovers the federation subtree rooted at `root` by breadth-first
/// descent over list and fetch endpoints.
///
/// A global visited set keeps each entity once; the first superior to reach
/// it wins. Entities without a list endpoint are leaves.
pub(crate) async fn enumerate_subtree(
    fetcher: &Fetcher,
    root: &EntityId,
    cancel: &CancellationToken,
) -> Result<Subtree, FederationError> {
    let root_configuration = fetcher.configuration(root, cancel).await?;

    let mut initial = HashSet::new();
    initial.insert(root.clone());
    let visited = Mutex::new(initial);

    let (children, errors) = descend(
        fetcher,
        Arc::clone(&root_configuration),
        &visited,
        cancel,
    )
    .await;

    Ok(Subtree {
        root: SubtreeNode {
            statement: root_configuration,
            subordinate_statement: None,
            children,
        },
        errors,
    })
}

type DescendOutput = (Vec<SubtreeNode>, Vec<FederationError>);

fn descend<'a>(
    fetcher: &'a Fetcher,
    parent: Arc<EntityStatement>,
    visited: &'a Mutex<HashSet<EntityId>>,
    cancel: &'a CancellationToken,
) -> Pin<Box<dyn Future<Output = DescendOutput> + Send + 'a>> {
    Box::pin(async move {
        let listed = match fetcher.list_subordinates(parent.sub(), None, cancel).await {
            Ok(listed) => listed,
            // No list endpoint means a leaf entity, not a failure.
            Err(FetchError::NoListEndpoint(_)) => return (Vec::new(), Vec::new()),
            Err(e) => return (Vec::new(), vec![e.into()]),
        };

        let fresh: Vec<EntityId> = {
            let mut guard = visited.lock().unwrap_or_else(|e| e.into_inner());
            listed
                .into_iter()
                .filter(|child| guard.insert(child.clone()))
                .collect()
        };

        let parent = &parent;
        let branches = fresh.into_iter().map(|child| async move {
            let subordinate = match fetcher.subordinate(parent.sub(), &child, cancel).await {
                Ok(statement) => statement,
                Err(e) => {
                    tracing::warn!(child = %child, error = %e, "cannot fetch subordinate statement");
                    return (None, vec![e.into()]);
                }
            };
            let child_configuration = match fetcher.configuration(&child, cancel).await {
                Ok(configuration) => configuration,
                Err(e) => {
                    tracing::warn!(child = %child, error = %e, "cannot fetch subordinate configuration");
                    return (None, vec![e.into()]);
                }
            };
            let (grandchildren, errors) = descend(
                fetcher,
                Arc::clone(&child_configuration),
                visited,
                cancel,
            )
            .await;
            (
                Some(SubtreeNode {
                    statement: child_configuration,
                    subordinate_statement: Some(subordinate),
                    children: grandchildren,
                }),
                errors,
            )
        });

        let mut children = Vec::new();
        let mut errors = Vec::new();
        for (node, branch_errors) in join_all(branches).await {
            children.extend(node);
            errors.extend(branch_errors);
        }
        (children, errors)
    })
}
