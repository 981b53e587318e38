//! DOT export of trust chains and federation subtrees.
//!
//! Pure functions from discovery results to Graphviz source; no I/O and no
//! coupling to the core types beyond read access.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

use crate::chain::TrustChain;
use crate::explore::{Subtree, SubtreeNode};
use crate::statement::EntityStatement;

/// Renders upward chain discovery as a DOT digraph: one dashed edge per
/// leaf-to-superior hop, nodes labelled by entity ID and coloured by entity
/// type.
pub fn chains_dot(chains: &[TrustChain]) -> String {
    let mut nodes = BTreeMap::new();
    let mut edges = BTreeSet::new();

    for chain in chains {
        let entities: Vec<&EntityStatement> = chain
            .statements()
            .iter()
            .step_by(2)
            .map(AsRef::as_ref)
            .collect();
        for entity in &entities {
            nodes.insert(entity.sub().as_str().to_owned(), node_color(entity));
        }
        for pair in entities.windows(2) {
            edges.insert((
                pair[0].sub().as_str().to_owned(),
                pair[1].sub().as_str().to_owned(),
            ));
        }
    }

    render("trustchains", &nodes, &edges, "style=dashed")
}

/// Renders a discovered subtree as a DOT digraph: one solid edge per
/// superior-to-subordinate link.
pub fn subtree_dot(subtree: &Subtree) -> String {
    let mut nodes = BTreeMap::new();
    let mut edges = BTreeSet::new();
    collect_subtree(subtree.root(), &mut nodes, &mut edges);
    render("subtree", &nodes, &edges, "")
}

fn collect_subtree(
    node: &SubtreeNode,
    nodes: &mut BTreeMap<String, &'static str>,
    edges: &mut BTreeSet<(String, String)>,
) {
    nodes.insert(node.entity_id().as_str().to_owned(), node_color(node.statement()));
    for child in node.children() {
        edges.insert((
            node.entity_id().as_str().to_owned(),
            child.entity_id().as_str().to_owned(),
        ));
        collect_subtree(child, nodes, edges);
    }
}

fn render(
    name: &str,
    nodes: &BTreeMap<String, &'static str>,
    edges: &BTreeSet<(String, String)>,
    edge_attributes: &str,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "digraph {name} {{");
    for (id, color) in nodes {
        let _ = writeln!(
            out,
            "  \"{}\" [label=\"{}\", style=filled, fillcolor={color}];",
            escape(id),
            escape(id)
        );
    }
    for (from, to) in edges {
        if edge_attributes.is_empty() {
            let _ = writeln!(out, "  \"{}\" -> \"{}\";", escape(from), escape(to));
        } else {
            let _ = writeln!(
                out,
                "  \"{}\" -> \"{}\" [{edge_attributes}];",
                escape(from),
                escape(to)
            );
        }
    }
    out.push_str("}\n");
    out
}

fn node_color(statement: &EntityStatement) -> &'static str {
    // The first well-known type wins when an entity declares several.
    if statement.metadata_for("openid_provider").is_some() {
        "lightblue"
    } else if statement.metadata_for("openid_relying_party").is_some() {
        "lightgreen"
    } else if statement.metadata_for("oauth_authorization_server").is_some() {
        "gold"
    } else if statement.metadata_for("oauth_resource").is_some() {
        "plum"
    } else if statement.metadata_for("federation_entity").is_some() {
        "orange"
    } else {
        "gray"
    }
}

fn escape(id: &str) -> String {
    id.replace('"', "\\\"")
}
