//! Firestore document sinks.
//!
//! - `FirestoreClient`: authenticated writes through `documents:commit`, with a
//!   client-chosen document id and a server-side `createdAt` timestamp.
//! - `FirestoreRest`: API-key writes through `createDocument`, used when the
//!   authenticated path is unavailable or failing.
//!
//! Credentials are held in `Zeroizing` buffers and wiped on drop.

use anyhow::{anyhow, Context, Result};
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;
use zeroize::Zeroizing;

use super::value::to_firestore_fields;
use super::DocumentSink;

pub const DEFAULT_FIRESTORE_ENDPOINT: &str = "https://firestore.googleapis.com/v1";
pub const DEFAULT_DATABASE: &str = "(default)";
const CREATED_AT_FIELD: &str = "createdAt";
const DOCUMENT_ID_LEN: usize = 20;
const DOCUMENT_ID_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Random 20-character alphanumeric id, the same shape Firestore assigns.
pub fn new_document_id() -> String {
    let mut rng = rand::thread_rng();
    (0..DOCUMENT_ID_LEN)
        .map(|_| DOCUMENT_ID_ALPHABET[rng.gen_range(0..DOCUMENT_ID_ALPHABET.len())] as char)
        .collect()
}

/// Project/database addressing shared by both Firestore paths.
#[derive(Clone, Debug)]
pub struct FirestoreTarget {
    pub endpoint: String,
    pub project_id: String,
    pub database: String,
}

impl FirestoreTarget {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            endpoint: DEFAULT_FIRESTORE_ENDPOINT.to_string(),
            project_id: project_id.into(),
            database: DEFAULT_DATABASE.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Resource path of the documents root, without the endpoint.
    fn documents_path(&self) -> String {
        format!(
            "projects/{}/databases/{}/documents",
            self.project_id, self.database
        )
    }

    fn documents_url(&self) -> String {
        format!(
            "{}/{}",
            self.endpoint.trim_end_matches('/'),
            self.documents_path()
        )
    }

    fn collection_url(&self, collection: &str) -> Result<Url> {
        validate_collection(collection)?;
        Url::parse(&format!("{}/{}", self.documents_url(), collection))
            .with_context(|| format!("build collection url for '{}'", collection))
    }

    fn commit_url(&self) -> Result<Url> {
        Url::parse(&format!("{}:commit", self.documents_url())).context("build commit url")
    }
}

fn validate_collection(collection: &str) -> Result<()> {
    if collection.is_empty() || collection.contains('/') {
        return Err(anyhow!("invalid collection name '{}'", collection));
    }
    Ok(())
}

fn record_fields(record: &Value) -> Result<&serde_json::Map<String, Value>> {
    record
        .as_object()
        .ok_or_else(|| anyhow!("firestore documents must be JSON objects"))
}

// -------------------- Authenticated client --------------------

/// Primary path: bearer-token authenticated commit.
pub struct FirestoreClient {
    target: FirestoreTarget,
    access_token: Option<Zeroizing<String>>,
    agent: ureq::Agent,
}

impl FirestoreClient {
    pub fn new(target: FirestoreTarget, access_token: Option<String>, agent: ureq::Agent) -> Self {
        Self {
            target,
            access_token: access_token
                .filter(|token| !token.trim().is_empty())
                .map(Zeroizing::new),
            agent,
        }
    }

    /// Commit request creating `collection/doc_id` with a server timestamp.
    pub fn commit_body(&self, collection: &str, doc_id: &str, record: &Value) -> Result<Value> {
        validate_collection(collection)?;
        let fields = to_firestore_fields(record_fields(record)?);
        Ok(json!({
            "writes": [{
                "update": {
                    "name": format!("{}/{}/{}", self.target.documents_path(), collection, doc_id),
                    "fields": fields
                },
                "updateTransforms": [{
                    "fieldPath": CREATED_AT_FIELD,
                    "setToServerValue": "REQUEST_TIME"
                }],
                "currentDocument": { "exists": false }
            }]
        }))
    }
}

impl DocumentSink for FirestoreClient {
    fn name(&self) -> &'static str {
        "firestore-client"
    }

    fn insert(&self, collection: &str, record: &Value) -> Result<String> {
        let token = self
            .access_token
            .as_ref()
            .ok_or_else(|| anyhow!("firestore client unavailable: no access token configured"))?;
        let doc_id = new_document_id();
        let body = self.commit_body(collection, &doc_id, record)?;
        let url = self.target.commit_url()?;
        self.agent
            .post(url.as_str())
            .set("Authorization", &format!("Bearer {}", token.as_str()))
            .send_json(body)
            .context("firestore commit")?;
        Ok(doc_id)
    }
}

// -------------------- REST fallback --------------------

/// Fallback path: `createDocument` authenticated by API key.
pub struct FirestoreRest {
    target: FirestoreTarget,
    api_key: Zeroizing<String>,
    agent: ureq::Agent,
}

#[derive(Deserialize)]
struct CreatedDocument {
    name: String,
}

impl FirestoreRest {
    pub fn new(target: FirestoreTarget, api_key: String, agent: ureq::Agent) -> Self {
        Self {
            target,
            api_key: Zeroizing::new(api_key),
            agent,
        }
    }

    /// `createDocument` body: typed fields plus a client-side `createdAt`.
    pub fn create_body(record: &Value, created_at: chrono::DateTime<chrono::Utc>) -> Result<Value> {
        let mut fields = to_firestore_fields(record_fields(record)?);
        if let Value::Object(map) = &mut fields {
            map.insert(
                CREATED_AT_FIELD.to_string(),
                json!({ "timestampValue": created_at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true) }),
            );
        }
        Ok(json!({ "fields": fields }))
    }
}

impl DocumentSink for FirestoreRest {
    fn name(&self) -> &'static str {
        "firestore-rest"
    }

    fn insert(&self, collection: &str, record: &Value) -> Result<String> {
        let body = Self::create_body(record, crate::now_utc())?;
        let mut url = self.target.collection_url(collection)?;
        url.query_pairs_mut().append_pair("key", self.api_key.as_str());
        let response = self
            .agent
            .post(url.as_str())
            .send_json(body)
            .with_context(|| format!("firestore createDocument in '{}'", collection))?
            .into_string()
            .context("read firestore response")?;
        let created: CreatedDocument =
            serde_json::from_str(&response).context("decode firestore response")?;
        document_id_from_name(&created.name)
    }
}

/// Last path segment of a document resource name.
fn document_id_from_name(name: &str) -> Result<String> {
    name.rsplit('/')
        .next()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("firestore returned an empty document name"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn agent() -> ureq::Agent {
        crate::location::http_agent(Duration::from_millis(200))
    }

    #[test]
    fn document_ids_match_firestore_shape() {
        let id = new_document_id();
        assert_eq!(id.len(), DOCUMENT_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id, new_document_id());
    }

    #[test]
    fn commit_body_names_document_and_requests_server_time() {
        let client = FirestoreClient::new(FirestoreTarget::new("bins"), None, agent());
        let body = client
            .commit_body("model_results", "abc", &json!({"total": 2}))
            .unwrap();
        let write = &body["writes"][0];
        assert_eq!(
            write["update"]["name"],
            "projects/bins/databases/(default)/documents/model_results/abc"
        );
        assert_eq!(write["update"]["fields"]["total"], json!({"integerValue": "2"}));
        assert_eq!(write["updateTransforms"][0]["fieldPath"], CREATED_AT_FIELD);
        assert!(client.commit_body("a/b", "abc", &json!({})).is_err());
        assert!(client.commit_body("c", "abc", &json!([1])).is_err());
    }

    #[test]
    fn client_without_token_is_unavailable() {
        let client = FirestoreClient::new(FirestoreTarget::new("bins"), Some("  ".into()), agent());
        let err = client.insert("model_results", &json!({})).unwrap_err();
        assert!(err.to_string().contains("unavailable"));
    }

    #[test]
    fn create_body_adds_created_at_timestamp() {
        let now = crate::now_utc();
        let body = FirestoreRest::create_body(&json!({"ok": true}), now).unwrap();
        assert_eq!(body["fields"]["ok"], json!({"booleanValue": true}));
        assert!(body["fields"][CREATED_AT_FIELD]["timestampValue"].is_string());
    }

    #[test]
    fn document_id_is_last_name_segment() {
        assert_eq!(
            document_id_from_name("projects/p/databases/(default)/documents/c/XyZ").unwrap(),
            "XyZ"
        );
        assert!(document_id_from_name("projects/p/").is_err());
    }

    #[test]
    fn collection_url_carries_database_path() {
        let target = FirestoreTarget::new("bins").with_endpoint("http://127.0.0.1:9/v1/");
        let url = target.collection_url("detection_logs").unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:9/v1/projects/bins/databases/(default)/documents/detection_logs"
        );
    }
}
