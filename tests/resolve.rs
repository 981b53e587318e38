//! Metadata resolution and trust-mark filtering.

mod common;

use common::{client_for, id, FederationBuilder};
use oidcfed::{EntityType, FederationError, PolicyError};
use serde_json::json;

const OP: &str = "https://op.example.org";
const INTERMEDIATE: &str = "https://intermediate.example.org";
const ANCHOR: &str = "https://anchor.example.org";
const MARK_ISSUER: &str = "https://marks.example.org";
const MARK_ID: &str = "https://marks.example.org/certified";

#[tokio::test]
async fn test_one_of_policies_intersect_and_reject_leaf_metadata() {
    let mut federation = FederationBuilder::new();
    federation
        .entity(ANCHOR)
        .subordinates(&[INTERMEDIATE])
        .metadata_policy(json!({
            "openid_provider": {
                "scopes_supported": {"one_of": ["openid", "email", "profile"]}
            }
        }));
    federation
        .entity(INTERMEDIATE)
        .authority_hints(&[ANCHOR])
        .subordinates(&[OP])
        .metadata_policy(json!({
            "openid_provider": {
                "scopes_supported": {"one_of": ["openid", "email"]}
            }
        }));
    federation
        .entity(OP)
        .authority_hints(&[INTERMEDIATE])
        .metadata(json!({
            "openid_provider": {
                "issuer": OP,
                "scopes_supported": ["openid", "email", "address"]
            }
        }));
    let client = client_for(federation.build());

    let error = client
        .resolve(&id(OP), &id(ANCHOR), EntityType::OpenidProvider)
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        FederationError::Policy(PolicyError::Violation { claim, .. })
            if claim == "scopes_supported"
    ));
}

#[tokio::test]
async fn test_subordinate_value_wins_over_superior_default() {
    let mut federation = FederationBuilder::new();
    federation
        .entity(ANCHOR)
        .subordinates(&[INTERMEDIATE])
        .metadata_policy(json!({
            "openid_provider": {
                "token_endpoint_auth_methods_supported": {
                    "default": ["client_secret_basic"]
                }
            }
        }));
    federation
        .entity(INTERMEDIATE)
        .authority_hints(&[ANCHOR])
        .subordinates(&[OP])
        .metadata_policy(json!({
            "openid_provider": {
                "token_endpoint_auth_methods_supported": {
                    "value": ["private_key_jwt"]
                }
            }
        }));
    federation
        .entity(OP)
        .authority_hints(&[INTERMEDIATE])
        .metadata(json!({
            "openid_provider": {"issuer": OP}
        }));
    let client = client_for(federation.build());

    let resolved = client
        .resolve(&id(OP), &id(ANCHOR), EntityType::OpenidProvider)
        .await
        .unwrap();

    assert_eq!(
        &json!(["private_key_jwt"]),
        resolved
            .metadata()
            .get("token_endpoint_auth_methods_supported")
            .unwrap()
    );
    // Claims without a policy pass through untouched.
    assert_eq!(&json!(OP), resolved.metadata().get("issuer").unwrap());
    assert_eq!(2, resolved.chain().hops());
    assert_eq!(5, resolved.chain().raw_jws().len());
}

#[tokio::test]
async fn test_resolve_is_idempotent_within_a_run() {
    let mut federation = FederationBuilder::new();
    federation
        .entity(ANCHOR)
        .subordinates(&[OP])
        .metadata_policy(json!({
            "openid_provider": {
                "scopes_supported": {"subset_of": ["openid", "email"]}
            }
        }));
    federation
        .entity(OP)
        .authority_hints(&[ANCHOR])
        .metadata(json!({
            "openid_provider": {
                "issuer": OP,
                "scopes_supported": ["openid", "email", "address"]
            }
        }));
    let client = client_for(federation.build());

    let first = client
        .resolve(&id(OP), &id(ANCHOR), EntityType::OpenidProvider)
        .await
        .unwrap();
    let second = client
        .resolve(&id(OP), &id(ANCHOR), EntityType::OpenidProvider)
        .await
        .unwrap();

    assert_eq!(
        serde_json::to_string(first.metadata()).unwrap(),
        serde_json::to_string(second.metadata()).unwrap()
    );
}

#[tokio::test]
async fn test_resolve_without_metadata_for_type_fails() {
    let mut federation = FederationBuilder::new();
    federation.entity(ANCHOR).subordinates(&[OP]);
    federation
        .entity(OP)
        .authority_hints(&[ANCHOR])
        .metadata(json!({"openid_provider": {"issuer": OP}}));
    let client = client_for(federation.build());

    let error = client
        .resolve(&id(OP), &id(ANCHOR), EntityType::OpenidRelyingParty)
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        FederationError::NoMetadata { entity_type, .. }
            if entity_type == "openid_relying_party"
    ));
}

#[tokio::test]
async fn test_resolve_against_unreachable_anchor_fails() {
    let mut federation = FederationBuilder::new();
    federation.entity(ANCHOR).subordinates(&[OP]);
    federation.entity("https://elsewhere.example.org").statement_window(-600, 3600);
    federation
        .entity(OP)
        .authority_hints(&[ANCHOR])
        .metadata(json!({"openid_provider": {"issuer": OP}}));
    let client = client_for(federation.build());

    let error = client
        .resolve(
            &id(OP),
            &id("https://elsewhere.example.org"),
            EntityType::OpenidProvider,
        )
        .await
        .unwrap_err();

    assert!(matches!(error, FederationError::AnchorNotReached { .. }));
}

fn mark_federation(mark_exp_offset: i64, recognised: bool) -> FederationBuilder {
    let mut federation = FederationBuilder::new();
    let now = federation.now();

    // The mark issuer publishes its keys but is outside the chain.
    federation.entity(MARK_ISSUER).metadata(json!({
        "federation_entity": {"name": "mark issuer"}
    }));
    let mark = federation.entity(MARK_ISSUER).sign_claims(&json!({
        "iss": MARK_ISSUER,
        "sub": OP,
        "id": MARK_ID,
        "iat": now - 600,
        "exp": now + mark_exp_offset,
    }));

    let anchor = federation.entity(ANCHOR);
    anchor.subordinates(&[OP]);
    if recognised {
        anchor.trust_mark_issuers(json!({ MARK_ID: [MARK_ISSUER] }));
    }
    federation
        .entity(OP)
        .authority_hints(&[ANCHOR])
        .metadata(json!({"openid_provider": {"issuer": OP}}))
        .trust_marks(json!([{"id": MARK_ID, "trust_mark": mark}]));
    federation
}

#[tokio::test]
async fn test_recognised_trust_mark_survives_resolution() {
    let client = client_for(mark_federation(3600, true).build());

    let resolved = client
        .resolve(&id(OP), &id(ANCHOR), EntityType::OpenidProvider)
        .await
        .unwrap();

    assert_eq!(1, resolved.trust_marks().len());
    assert_eq!(MARK_ID, resolved.trust_marks()[0].id());
    assert_eq!(MARK_ISSUER, resolved.trust_marks()[0].iss().as_str());
    assert!(resolved.errors().is_empty());
}

#[tokio::test]
async fn test_unrecognised_trust_mark_is_dropped_silently() {
    let client = client_for(mark_federation(3600, false).build());

    let resolved = client
        .resolve(&id(OP), &id(ANCHOR), EntityType::OpenidProvider)
        .await
        .unwrap();

    assert!(resolved.trust_marks().is_empty());
    assert!(resolved.errors().is_empty());
}

#[tokio::test]
async fn test_expired_trust_mark_is_dropped_and_reported() {
    let client = client_for(mark_federation(-60, true).build());

    let resolved = client
        .resolve(&id(OP), &id(ANCHOR), EntityType::OpenidProvider)
        .await
        .unwrap();

    assert!(resolved.trust_marks().is_empty());
    assert!(!resolved.errors().is_empty());
}
