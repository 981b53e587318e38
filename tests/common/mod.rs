//! In-memory federations for integration tests.
//!
//! Entities carry real P-256 keys and sign real ES256 statements; only the
//! HTTP transport is substituted, so everything from JWS verification to
//! policy application runs exactly as against a live federation.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use url::Url;

use oidcfed::{EntityId, FederationClient, FetchError, HttpFetch, HttpResponse};

const ENTITY_STATEMENT_MEDIA_TYPE: &str = "application/entity-statement+jwt";
const DEFAULT_WINDOW: (i64, i64) = (-600, 3600);

/// A federation entity with its signing key.
pub struct Signer {
    encoding: EncodingKey,
    jwk: Value,
    kid: String,
}

impl Signer {
    fn generate() -> Self {
        let key = jsonwebkey::Key::generate_p256();
        let encoding = EncodingKey::from_ec_der(&key.to_der());

        let mut jwk = jsonwebkey::JsonWebKey::new(key);
        jwk.set_algorithm(jsonwebkey::Algorithm::ES256).unwrap();
        jwk.key_id = Some("key-1".to_owned());

        let jwk: Value = serde_json::from_str(&serde_json::to_string(&jwk).unwrap()).unwrap();
        Self {
            encoding,
            jwk,
            kid: "key-1".to_owned(),
        }
    }

    pub fn jwks(&self) -> Value {
        json!({ "keys": [self.jwk] })
    }

    pub fn sign(&self, claims: &Value) -> String {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.kid.clone());
        header.typ = Some("entity-statement+jwt".to_owned());
        encode(&header, claims, &self.encoding).unwrap()
    }
}

/// Declarative definition of one federation entity.
pub struct EntityDef {
    id: String,
    signer: Signer,
    authority_hints: Vec<String>,
    subordinates: Vec<String>,
    metadata: Value,
    metadata_policy: Option<Value>,
    trust_marks: Option<Value>,
    trust_mark_issuers: Option<Value>,
    constraints: Option<Value>,
    window: (i64, i64),
    edge_windows: HashMap<String, (i64, i64)>,
}

impl EntityDef {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            signer: Signer::generate(),
            authority_hints: Vec::new(),
            subordinates: Vec::new(),
            metadata: json!({}),
            metadata_policy: None,
            trust_marks: None,
            trust_mark_issuers: None,
            constraints: None,
            window: DEFAULT_WINDOW,
            edge_windows: HashMap::new(),
        }
    }

    pub fn authority_hints(&mut self, hints: &[&str]) -> &mut Self {
        self.authority_hints = hints.iter().map(|h| (*h).to_owned()).collect();
        self
    }

    pub fn subordinates(&mut self, subordinates: &[&str]) -> &mut Self {
        self.subordinates = subordinates.iter().map(|s| (*s).to_owned()).collect();
        self
    }

    pub fn metadata(&mut self, metadata: Value) -> &mut Self {
        self.metadata = metadata;
        self
    }

    /// Policy this entity stamps into the subordinate statements it issues.
    pub fn metadata_policy(&mut self, policy: Value) -> &mut Self {
        self.metadata_policy = Some(policy);
        self
    }

    pub fn trust_marks(&mut self, marks: Value) -> &mut Self {
        self.trust_marks = Some(marks);
        self
    }

    pub fn trust_mark_issuers(&mut self, issuers: Value) -> &mut Self {
        self.trust_mark_issuers = Some(issuers);
        self
    }

    pub fn constraints(&mut self, constraints: Value) -> &mut Self {
        self.constraints = Some(constraints);
        self
    }

    /// Overrides the `iat`/`exp` offsets of this entity's own configuration.
    pub fn statement_window(&mut self, iat_offset: i64, exp_offset: i64) -> &mut Self {
        self.window = (iat_offset, exp_offset);
        self
    }

    /// Overrides the `iat`/`exp` offsets of the subordinate statement this
    /// entity issues about `subject`.
    pub fn edge_window(&mut self, subject: &str, iat_offset: i64, exp_offset: i64) -> &mut Self {
        self.edge_windows
            .insert(subject.to_owned(), (iat_offset, exp_offset));
        self
    }

    /// Signs arbitrary claims with this entity's key (for trust marks).
    pub fn sign_claims(&self, claims: &Value) -> String {
        self.signer.sign(claims)
    }
}

/// Builds the canned HTTP responses for a whole federation.
pub struct FederationBuilder {
    now: i64,
    entities: BTreeMap<String, EntityDef>,
}

impl FederationBuilder {
    pub fn new() -> Self {
        Self {
            now: time::OffsetDateTime::now_utc().unix_timestamp(),
            entities: BTreeMap::new(),
        }
    }

    pub fn now(&self) -> i64 {
        self.now
    }

    /// Returns the definition for `id`, creating it on first use.
    pub fn entity(&mut self, id: &str) -> &mut EntityDef {
        self.entities
            .entry(id.to_owned())
            .or_insert_with(|| EntityDef::new(id))
    }

    pub fn build(&self) -> Arc<InMemoryHttp> {
        let mut responses = HashMap::new();

        for (id, def) in &self.entities {
            let entity_id = EntityId::parse(id).unwrap();

            let mut metadata = def.metadata.clone();
            if !def.subordinates.is_empty() {
                let federation_entity = metadata
                    .as_object_mut()
                    .unwrap()
                    .entry("federation_entity")
                    .or_insert_with(|| json!({}));
                federation_entity
                    .as_object_mut()
                    .unwrap()
                    .insert("federation_fetch_endpoint".to_owned(), json!(format!("{id}/fetch")));
                federation_entity
                    .as_object_mut()
                    .unwrap()
                    .insert("federation_list_endpoint".to_owned(), json!(format!("{id}/list")));
            }

            let mut claims = json!({
                "iss": id,
                "sub": id,
                "iat": self.now + def.window.0,
                "exp": self.now + def.window.1,
                "jwks": def.signer.jwks(),
            });
            if !def.authority_hints.is_empty() {
                claims["authority_hints"] = json!(def.authority_hints);
            }
            if !metadata.as_object().unwrap().is_empty() {
                claims["metadata"] = metadata;
            }
            if let Some(marks) = &def.trust_marks {
                claims["trust_marks"] = marks.clone();
            }
            if let Some(issuers) = &def.trust_mark_issuers {
                claims["trust_mark_issuers"] = issuers.clone();
            }
            if let Some(constraints) = &def.constraints {
                claims["constraints"] = constraints.clone();
            }

            responses.insert(
                Url::parse(&entity_id.well_known_url()).unwrap().to_string(),
                CannedResponse::statement(def.signer.sign(&claims)),
            );

            if !def.subordinates.is_empty() {
                responses.insert(
                    Url::parse(&format!("{id}/list")).unwrap().to_string(),
                    CannedResponse::json(serde_json::to_string(&def.subordinates).unwrap()),
                );

                for subject in &def.subordinates {
                    let subject_def = self
                        .entities
                        .get(subject)
                        .unwrap_or_else(|| panic!("subordinate {subject} is not defined"));
                    let (iat_offset, exp_offset) = def
                        .edge_windows
                        .get(subject)
                        .copied()
                        .unwrap_or(DEFAULT_WINDOW);

                    let mut claims = json!({
                        "iss": id,
                        "sub": subject,
                        "iat": self.now + iat_offset,
                        "exp": self.now + exp_offset,
                        "jwks": subject_def.signer.jwks(),
                    });
                    if let Some(policy) = &def.metadata_policy {
                        claims["metadata_policy"] = policy.clone();
                    }

                    let mut url = Url::parse(&format!("{id}/fetch")).unwrap();
                    url.query_pairs_mut()
                        .append_pair("sub", subject)
                        .append_pair("iss", id);
                    responses.insert(
                        url.to_string(),
                        CannedResponse::statement(def.signer.sign(&claims)),
                    );
                }
            }
        }

        Arc::new(InMemoryHttp {
            responses,
            hits: Mutex::new(HashMap::new()),
        })
    }
}

struct CannedResponse {
    status: u16,
    content_type: String,
    body: String,
}

impl CannedResponse {
    fn statement(jws: String) -> Self {
        Self {
            status: 200,
            content_type: ENTITY_STATEMENT_MEDIA_TYPE.to_owned(),
            body: jws,
        }
    }

    fn json(body: String) -> Self {
        Self {
            status: 200,
            content_type: "application/json".to_owned(),
            body,
        }
    }
}

/// [`HttpFetch`] implementation over canned responses, counting requests
/// per URL.
pub struct InMemoryHttp {
    responses: HashMap<String, CannedResponse>,
    hits: Mutex<HashMap<String, usize>>,
}

impl InMemoryHttp {
    /// Returns how many requests were made for `url`.
    pub fn hits(&self, url: &str) -> usize {
        *self.hits.lock().unwrap().get(url).unwrap_or(&0)
    }

    /// Returns the total number of requests served.
    pub fn total_hits(&self) -> usize {
        self.hits.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl HttpFetch for InMemoryHttp {
    async fn get(&self, url: &Url) -> Result<HttpResponse, FetchError> {
        let key = url.to_string();
        *self.hits.lock().unwrap().entry(key.clone()).or_insert(0) += 1;

        match self.responses.get(&key) {
            Some(response) => Ok(HttpResponse {
                status: response.status,
                content_type: Some(response.content_type.clone()),
                body: response.body.clone(),
            }),
            None => Ok(HttpResponse {
                status: 404,
                content_type: None,
                body: String::new(),
            }),
        }
    }
}

pub fn id(entity_id: &str) -> EntityId {
    EntityId::parse(entity_id).unwrap()
}

pub fn client_for(http: Arc<InMemoryHttp>) -> FederationClient {
    FederationClient::builder().transport(http).build().unwrap()
}
