//! Signature and temporal verification of signed statements.

use jsonwebtoken::jwk::{AlgorithmParameters, Jwk};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use thiserror::Error;
use time::{Duration, OffsetDateTime};

use crate::keys::FederationKeys;
use crate::statement::JsonMap;

/// Signature algorithms permitted for federation statements.
///
/// The federation profile allows the RS/ES/PS families; `none` and the
/// symmetric `HS*` algorithms are never acceptable for statements.
pub const ALLOWED_ALGORITHMS: &[Algorithm; 8] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::ES256,
    Algorithm::ES384,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
];

/// An error that can arise verifying a signed statement.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VerifyError {
    /// The `alg` header names an algorithm that is not allowed for
    /// federation statements.
    #[error("algorithm '{0}' is not allowed for entity statements")]
    AlgNotAllowed(String),

    /// No key in the supplied set carries the `kid` named by the header.
    #[error("cannot find federation key for kid: {0}")]
    KeyNotFound(String),

    /// The header carries no `kid` and no key in the set matches the
    /// signature algorithm family.
    #[error("no key in the set is compatible with the signature algorithm")]
    NoCompatibleKey,

    /// The signature does not verify under any candidate key.
    #[error("statement signature is invalid")]
    SignatureInvalid,

    /// The statement expiry lies in the past.
    #[error("statement has expired")]
    StatementExpired,

    /// The statement issue time lies in the future.
    #[error("statement is not yet valid")]
    StatementNotYetValid,

    /// The token could not be decoded at all.
    #[error("cannot decode token")]
    Malformed(#[from] jsonwebtoken::errors::Error),
}

/// Verifies a compact JWS against a federation key set and a clock.
///
/// Key selection follows the federation rules: when the header carries a
/// `kid` only that key is tried; otherwise every key of a compatible
/// algorithm family is attempted and the first success wins. Temporal claims
/// present in the payload are checked with the given skew: `iat` must not
/// lie more than `skew` in the future and `exp` must lie in the future.
///
/// Returns the decoded payload on success.
///
/// # Errors
///
/// Returns a [`VerifyError`] if the algorithm is not allowed, no suitable
/// key exists, the signature does not verify, or a temporal claim fails.
pub fn verify(
    jws: &str,
    keys: &FederationKeys,
    now: OffsetDateTime,
    skew: Duration,
) -> Result<JsonMap, VerifyError> {
    let header = jsonwebtoken::decode_header(jws)?;

    if !ALLOWED_ALGORITHMS.contains(&header.alg) {
        return Err(VerifyError::AlgNotAllowed(format!("{:?}", header.alg)));
    }

    let payload = match header.kid.as_deref() {
        Some(kid) => {
            let key = keys
                .find(kid)
                .ok_or_else(|| VerifyError::KeyNotFound(kid.to_owned()))?;
            decode_with_key(jws, key, header.alg)?
        }
        None => {
            let candidates: Vec<&Jwk> = keys
                .iter()
                .filter(|k| key_matches_alg(k, header.alg))
                .collect();
            if candidates.is_empty() {
                return Err(VerifyError::NoCompatibleKey);
            }
            let mut payload = None;
            for key in candidates {
                if let Ok(p) = decode_with_key(jws, key, header.alg) {
                    payload = Some(p);
                    break;
                }
            }
            payload.ok_or(VerifyError::SignatureInvalid)?
        }
    };

    check_validity_window(&payload, now, skew)?;

    Ok(payload)
}

/// Checks the `iat`/`exp` claims of a decoded payload against `now`,
/// tolerating `skew` of clock drift. Claims that are absent are not checked.
///
/// # Errors
///
/// Returns [`VerifyError::StatementNotYetValid`] or
/// [`VerifyError::StatementExpired`] on failure.
pub fn check_validity_window(
    payload: &JsonMap,
    now: OffsetDateTime,
    skew: Duration,
) -> Result<(), VerifyError> {
    if let Some(iat) = payload.get("iat").and_then(serde_json::Value::as_i64) {
        if iat > (now + skew).unix_timestamp() {
            return Err(VerifyError::StatementNotYetValid);
        }
    }
    if let Some(exp) = payload.get("exp").and_then(serde_json::Value::as_i64) {
        if now.unix_timestamp() >= exp {
            return Err(VerifyError::StatementExpired);
        }
    }
    Ok(())
}

fn decode_with_key(jws: &str, key: &Jwk, alg: Algorithm) -> Result<JsonMap, VerifyError> {
    let decoding_key = DecodingKey::from_jwk(key)?;

    let mut validation = Validation::new(alg);
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    match jsonwebtoken::decode::<JsonMap>(jws, &decoding_key, &validation) {
        Ok(data) => Ok(data.claims),
        Err(e) => match e.kind() {
            jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                Err(VerifyError::SignatureInvalid)
            }
            _ => Err(VerifyError::Malformed(e)),
        },
    }
}

fn key_matches_alg(key: &Jwk, alg: Algorithm) -> bool {
    match (&key.algorithm, alg) {
        (
            AlgorithmParameters::RSA(_),
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512,
        ) => true,
        (AlgorithmParameters::EllipticCurve(_), Algorithm::ES256 | Algorithm::ES384) => true,
        _ => false,
    }
}

#[cfg(test)]
mod verify_test {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    struct TestKey {
        encoding: EncodingKey,
        keys: FederationKeys,
        kid: String,
    }

    fn generate_key(kid: &str) -> TestKey {
        let key = jsonwebkey::Key::generate_p256();
        let encoding = EncodingKey::from_ec_der(&key.to_der());

        let mut jwk = jsonwebkey::JsonWebKey::new(key);
        jwk.set_algorithm(jsonwebkey::Algorithm::ES256).unwrap();
        jwk.key_id = Some(kid.to_owned());

        let jwks_json = format!(r#"{{"keys": [{}]}}"#, serde_json::to_string(&jwk).unwrap());
        TestKey {
            encoding,
            keys: FederationKeys::from_json(jwks_json.as_bytes()).unwrap(),
            kid: kid.to_owned(),
        }
    }

    fn sign(key: &TestKey, kid: Option<&str>, iat: i64, exp: i64) -> String {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = kid.map(str::to_owned);
        let claims = serde_json::json!({
            "iss": "https://example.org",
            "sub": "https://example.org",
            "iat": iat,
            "exp": exp
        });
        encode(&header, &claims, &key.encoding).unwrap()
    }

    fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    const SKEW: Duration = Duration::seconds(60);

    #[test]
    fn test_verify_with_matching_kid() {
        let key = generate_key("key-1");
        let ts = now().unix_timestamp();
        let jws = sign(&key, Some(&key.kid), ts - 10, ts + 3600);

        let payload = verify(&jws, &key.keys, now(), SKEW).unwrap();
        assert_eq!(
            Some("https://example.org"),
            payload.get("iss").and_then(|v| v.as_str())
        );
    }

    #[test]
    fn test_verify_without_kid_tries_compatible_keys() {
        let key = generate_key("key-1");
        let ts = now().unix_timestamp();
        let jws = sign(&key, None, ts - 10, ts + 3600);

        verify(&jws, &key.keys, now(), SKEW).unwrap();
    }

    #[test]
    fn test_verify_unknown_kid() {
        let key = generate_key("key-1");
        let ts = now().unix_timestamp();
        let jws = sign(&key, Some("other"), ts - 10, ts + 3600);

        assert!(matches!(
            verify(&jws, &key.keys, now(), SKEW).unwrap_err(),
            VerifyError::KeyNotFound(kid) if kid == "other"
        ));
    }

    #[test]
    fn test_verify_wrong_key_fails() {
        let signer = generate_key("key-1");
        let other = generate_key("key-1");
        let ts = now().unix_timestamp();
        let jws = sign(&signer, Some("key-1"), ts - 10, ts + 3600);

        assert!(matches!(
            verify(&jws, &other.keys, now(), SKEW).unwrap_err(),
            VerifyError::SignatureInvalid
        ));
    }

    #[test]
    fn test_verify_rejects_hmac_algorithm() {
        let key = generate_key("key-1");
        let claims = serde_json::json!({"iss": "https://example.org"});
        let jws = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();

        assert!(matches!(
            verify(&jws, &key.keys, now(), SKEW).unwrap_err(),
            VerifyError::AlgNotAllowed(..)
        ));
    }

    #[test]
    fn test_verify_expired() {
        let key = generate_key("key-1");
        let ts = now().unix_timestamp();
        let jws = sign(&key, Some("key-1"), ts - 7200, ts - 3600);

        assert!(matches!(
            verify(&jws, &key.keys, now(), SKEW).unwrap_err(),
            VerifyError::StatementExpired
        ));
    }

    #[test]
    fn test_verify_not_yet_valid() {
        let key = generate_key("key-1");
        let ts = now().unix_timestamp();
        let jws = sign(&key, Some("key-1"), ts + 3600, ts + 7200);

        assert!(matches!(
            verify(&jws, &key.keys, now(), SKEW).unwrap_err(),
            VerifyError::StatementNotYetValid
        ));
    }

    #[test]
    fn test_iat_within_skew_is_accepted() {
        let key = generate_key("key-1");
        let ts = now().unix_timestamp();
        let jws = sign(&key, Some("key-1"), ts + 30, ts + 3600);

        verify(&jws, &key.keys, now(), SKEW).unwrap();
    }
}
