//! Firestore REST v1 backend.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use leadsync_core::{Document, FieldValue, TimestampBound};
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use tracing::debug;

use crate::{CreateOutcome, DocumentStore, StoreError, StoredDocument};

const DEFAULT_BASE_URL: &str = "https://firestore.googleapis.com";
const DEFAULT_DATABASE: &str = "(default)";
const DEFAULT_PAGE_SIZE: u32 = 300;

/// Where the bearer token comes from. Read on every request so an external
/// refresher can rotate it without restarting the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessToken {
    /// No `Authorization` header (emulator).
    None,
    Env(String),
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct FirestoreConfig {
    pub project_id: String,
    pub database: String,
    pub base_url: String,
    pub access_token: AccessToken,
    pub page_size: u32,
    pub timeout: Duration,
}

impl FirestoreConfig {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: DEFAULT_DATABASE.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            access_token: AccessToken::None,
            page_size: DEFAULT_PAGE_SIZE,
            timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug)]
pub struct FirestoreStore {
    client: reqwest::Client,
    config: FirestoreConfig,
}

#[derive(Debug, Deserialize)]
struct RunQueryRow {
    document: Option<FirestoreDocument>,
}

#[derive(Debug, Deserialize)]
struct FirestoreDocument {
    name: String,
    #[serde(default)]
    fields: JsonMap<String, JsonValue>,
}

impl FirestoreStore {
    pub fn new(config: FirestoreConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn documents_url(&self) -> String {
        format!(
            "{}/v1/projects/{}/databases/{}/documents",
            self.config.base_url.trim_end_matches('/'),
            self.config.project_id,
            self.config.database
        )
    }

    /// `documents_url` plus one percent-encoded path segment per entry, so
    /// ids holding `?`, `#`, `%` or `/` still address exactly one document.
    fn document_url(&self, segments: &[&str]) -> Result<Url, StoreError> {
        segment_url(&self.documents_url(), segments)
    }

    async fn authorized(&self, builder: RequestBuilder) -> Result<RequestBuilder, StoreError> {
        Ok(match bearer_from(&self.config.access_token).await? {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        })
    }

    async fn run_query_page(
        &self,
        query: &JsonValue,
    ) -> Result<Vec<FirestoreDocument>, StoreError> {
        let url = format!("{}:runQuery", self.documents_url());
        let request = self.authorized(self.client.post(&url)).await?;
        let response = ensure_success(request.json(query).send().await?).await?;
        let rows: Vec<RunQueryRow> = response.json().await?;
        Ok(rows.into_iter().filter_map(|row| row.document).collect())
    }
}

#[async_trait]
impl DocumentStore for FirestoreStore {
    fn describe(&self) -> String {
        format!("firestore:{}/{}", self.config.project_id, self.config.database)
    }

    async fn query_at_or_after(
        &self,
        collection: &str,
        field: &str,
        bound: TimestampBound,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        let page_size = self.config.page_size.max(1);
        let mut out = Vec::new();
        let mut cursor: Option<(JsonValue, String)> = None;

        loop {
            let query = range_query(collection, field, bound, page_size, cursor.as_ref());
            let page = self.run_query_page(&query).await?;
            debug!(collection, field, fetched = page.len(), "firestore query page");

            let next_cursor = resume_cursor(collection, field, &page, page_size)?;
            for doc in page {
                out.push(decode_document(doc)?);
            }
            match next_cursor {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }

        Ok(out)
    }

    async fn exists(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let url = self.document_url(&[collection, id])?;
        let request = self.authorized(self.client.get(url)).await?;
        let response = request.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        ensure_success(response).await?;
        Ok(true)
    }

    async fn create_if_absent(
        &self,
        collection: &str,
        id: &str,
        document: &Document,
    ) -> Result<CreateOutcome, StoreError> {
        let url = self.document_url(&[collection])?;
        let request = self.authorized(self.client.post(url)).await?;
        let response = request
            .query(&[("documentId", id)])
            .json(&json!({ "fields": encode_map(document) }))
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(CreateOutcome::AlreadyExists);
        }
        ensure_success(response).await?;
        Ok(CreateOutcome::Created)
    }

    async fn append(&self, collection: &str, document: &Document) -> Result<String, StoreError> {
        let url = self.document_url(&[collection])?;
        let request = self.authorized(self.client.post(url)).await?;
        let response = request
            .json(&json!({ "fields": encode_map(document) }))
            .send()
            .await?;
        let created: FirestoreDocument = ensure_success(response).await?.json().await?;
        Ok(document_id(&created.name).to_string())
    }
}

async fn ensure_success(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(StoreError::HttpStatus {
        status: status.as_u16(),
        message: error_message(&body),
    })
}

async fn bearer_from(token: &AccessToken) -> Result<Option<String>, StoreError> {
    match token {
        AccessToken::None => Ok(None),
        AccessToken::Env(name) => std::env::var(name)
            .map(|v| Some(v.trim().to_string()))
            .map_err(|_| StoreError::Credentials(format!("env var {name} is not set"))),
        AccessToken::File(path) => tokio::fs::read_to_string(path)
            .await
            .map(|v| Some(v.trim().to_string()))
            .map_err(|err| StoreError::Credentials(format!("reading {}: {err}", path.display()))),
    }
}

/// Pulls `error.message` out of a Firestore error body, which may be an
/// object or a one-element array.
fn error_message(body: &str) -> String {
    let parsed: Option<JsonValue> = serde_json::from_str(body).ok();
    let error = parsed.as_ref().and_then(|v| match v {
        JsonValue::Array(items) => items.first().and_then(|i| i.get("error")),
        other => other.get("error"),
    });
    error
        .and_then(|e| e.get("message"))
        .and_then(JsonValue::as_str)
        .map(ToString::to_string)
        .unwrap_or_else(|| body.chars().take(200).collect())
}

fn segment_url(base: &str, segments: &[&str]) -> Result<Url, StoreError> {
    let invalid = |reason: String| StoreError::InvalidUrl {
        url: base.to_string(),
        reason,
    };
    let mut url = Url::parse(base).map_err(|err| invalid(err.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| invalid("cannot carry a path".to_string()))?
        .extend(segments);
    Ok(url)
}

/// Cursor for the next page, or `None` once a short page ends the scan. A
/// full page must end with a top-level `field` value, otherwise paging
/// would silently stop early.
fn resume_cursor(
    collection: &str,
    field: &str,
    page: &[FirestoreDocument],
    page_size: u32,
) -> Result<Option<(JsonValue, String)>, StoreError> {
    if page.len() < page_size as usize {
        return Ok(None);
    }
    page.last()
        .and_then(|doc| doc.fields.get(field).map(|value| (value.clone(), doc.name.clone())))
        .map(Some)
        .ok_or_else(|| StoreError::Malformed {
            name: format!("{collection} page"),
            reason: format!("last document has no top-level {field} to resume from"),
        })
}

fn document_id(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

fn bound_value(bound: TimestampBound) -> JsonValue {
    match bound {
        TimestampBound::EpochMillis(ms) => json!({ "integerValue": ms.to_string() }),
        TimestampBound::Timestamp(ts) => json!({ "timestampValue": format_timestamp(ts) }),
    }
}

fn range_query(
    collection: &str,
    field: &str,
    bound: TimestampBound,
    page_size: u32,
    cursor: Option<&(JsonValue, String)>,
) -> JsonValue {
    let mut structured = json!({
        "from": [{ "collectionId": collection }],
        "where": {
            "fieldFilter": {
                "field": { "fieldPath": field },
                "op": "GREATER_THAN_OR_EQUAL",
                "value": bound_value(bound),
            }
        },
        "orderBy": [
            { "field": { "fieldPath": field }, "direction": "ASCENDING" },
            { "field": { "fieldPath": "__name__" }, "direction": "ASCENDING" },
        ],
        "limit": page_size,
    });
    if let Some((value, name)) = cursor {
        structured["startAt"] = json!({
            "values": [value, { "referenceValue": name }],
            "before": false,
        });
    }
    json!({ "structuredQuery": structured })
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn encode_value(value: &FieldValue) -> JsonValue {
    match value {
        FieldValue::Null => json!({ "nullValue": null }),
        FieldValue::Bool(b) => json!({ "booleanValue": b }),
        FieldValue::Integer(i) => json!({ "integerValue": i.to_string() }),
        FieldValue::Double(f) => json!({ "doubleValue": f }),
        FieldValue::String(s) => json!({ "stringValue": s }),
        FieldValue::Timestamp(ts) => json!({ "timestampValue": format_timestamp(*ts) }),
        FieldValue::Array(items) => {
            json!({ "arrayValue": { "values": items.iter().map(encode_value).collect::<Vec<_>>() } })
        }
        FieldValue::Map(fields) => json!({ "mapValue": { "fields": encode_map(fields) } }),
    }
}

fn encode_map(fields: &BTreeMap<String, FieldValue>) -> JsonValue {
    JsonValue::Object(fields.iter().map(|(k, v)| (k.clone(), encode_value(v))).collect())
}

fn decode_document(doc: FirestoreDocument) -> Result<StoredDocument, StoreError> {
    let fields = decode_map(&doc.fields).map_err(|reason| StoreError::Malformed {
        name: doc.name.clone(),
        reason,
    })?;
    Ok(StoredDocument {
        id: document_id(&doc.name).to_string(),
        fields,
    })
}

fn decode_map(fields: &JsonMap<String, JsonValue>) -> Result<Document, String> {
    fields
        .iter()
        .map(|(k, v)| decode_value(v).map(|v| (k.clone(), v)).map_err(|e| format!("{k}: {e}")))
        .collect()
}

fn decode_value(value: &JsonValue) -> Result<FieldValue, String> {
    let Some((kind, inner)) = value.as_object().and_then(|o| o.iter().next()) else {
        return Err(format!("unexpected value {value}"));
    };
    match kind.as_str() {
        "nullValue" => Ok(FieldValue::Null),
        "booleanValue" => inner
            .as_bool()
            .map(FieldValue::Bool)
            .ok_or_else(|| "booleanValue is not a bool".to_string()),
        "integerValue" => match inner {
            JsonValue::String(s) => s.parse().map(FieldValue::Integer).map_err(|e| e.to_string()),
            JsonValue::Number(n) => n
                .as_i64()
                .map(FieldValue::Integer)
                .ok_or_else(|| format!("integerValue out of range: {n}")),
            _ => Err("integerValue is not numeric".to_string()),
        },
        "doubleValue" => match inner {
            JsonValue::Number(n) => n
                .as_f64()
                .map(FieldValue::Double)
                .ok_or_else(|| format!("doubleValue not representable: {n}")),
            JsonValue::String(s) => s.parse().map(FieldValue::Double).map_err(|e| format!("{e}")),
            _ => Err("doubleValue is not numeric".to_string()),
        },
        "timestampValue" => inner
            .as_str()
            .ok_or_else(|| "timestampValue is not a string".to_string())
            .and_then(|s| DateTime::parse_from_rfc3339(s).map_err(|e| e.to_string()))
            .map(|ts| FieldValue::Timestamp(ts.with_timezone(&Utc))),
        "stringValue" | "referenceValue" | "bytesValue" => inner
            .as_str()
            .map(|s| FieldValue::String(s.to_string()))
            .ok_or_else(|| format!("{kind} is not a string")),
        "geoPointValue" => {
            let mut point = BTreeMap::new();
            for axis in ["latitude", "longitude"] {
                let v = inner.get(axis).and_then(JsonValue::as_f64).unwrap_or_default();
                point.insert(axis.to_string(), FieldValue::Double(v));
            }
            Ok(FieldValue::Map(point))
        }
        "arrayValue" => inner
            .get("values")
            .and_then(JsonValue::as_array)
            .map(|items| items.iter().map(decode_value).collect::<Result<Vec<_>, _>>())
            .unwrap_or_else(|| Ok(Vec::new()))
            .map(FieldValue::Array),
        "mapValue" => match inner.get("fields").and_then(JsonValue::as_object) {
            Some(fields) => decode_map(fields).map(FieldValue::Map),
            None => Ok(FieldValue::Map(BTreeMap::new())),
        },
        other => Err(format!("unsupported value type {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;

    fn midnight() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 0, 0, 0).single().unwrap()
    }

    #[test]
    fn range_query_uses_integer_value_for_epoch_sources() {
        let bound = TimestampBound::EpochMillis(midnight().timestamp_millis());
        let q = range_query("leads", "created", bound, 300, None);
        let filter = &q["structuredQuery"]["where"]["fieldFilter"];
        assert_eq!(filter["op"], "GREATER_THAN_OR_EQUAL");
        assert_eq!(filter["field"]["fieldPath"], "created");
        assert_eq!(filter["value"]["integerValue"], "1773446400000");
        assert_eq!(q["structuredQuery"]["limit"], 300);
        assert!(q["structuredQuery"].get("startAt").is_none());
    }

    #[test]
    fn range_query_uses_timestamp_value_and_cursor_for_native_sources() {
        let bound = TimestampBound::Timestamp(midnight());
        let cursor = (
            json!({ "timestampValue": "2026-03-14T08:00:00Z" }),
            "projects/p/databases/(default)/documents/ContactPageForm/abc".to_string(),
        );
        let q = range_query("ContactPageForm", "timestamp", bound, 2, Some(&cursor));
        let structured = &q["structuredQuery"];
        assert_eq!(
            structured["where"]["fieldFilter"]["value"]["timestampValue"],
            "2026-03-14T00:00:00.000000Z"
        );
        assert_eq!(structured["startAt"]["before"], false);
        assert_eq!(
            structured["startAt"]["values"][1]["referenceValue"],
            "projects/p/databases/(default)/documents/ContactPageForm/abc"
        );
    }

    #[test]
    fn decodes_run_query_document_into_typed_fields() {
        let body = json!([
            { "readTime": "2026-03-14T09:00:00Z" },
            {
                "document": {
                    "name": "projects/p/databases/(default)/documents/leads/lead-7",
                    "fields": {
                        "name": { "stringValue": "Ravi" },
                        "created": { "integerValue": "1773446400000" },
                        "timestamp": { "timestampValue": "2026-03-14T00:00:00Z" },
                        "tags": { "arrayValue": { "values": [{ "stringValue": "loan" }] } },
                        "meta": { "mapValue": { "fields": { "score": { "doubleValue": 0.5 } } } },
                        "empty": { "nullValue": null }
                    }
                },
                "readTime": "2026-03-14T09:00:00Z"
            }
        ]);
        let rows: Vec<RunQueryRow> = serde_json::from_value(body).unwrap();
        let docs: Vec<_> = rows.into_iter().filter_map(|r| r.document).collect();
        assert_eq!(docs.len(), 1);

        let doc = decode_document(docs.into_iter().next().unwrap()).unwrap();
        assert_eq!(doc.id, "lead-7");
        assert_eq!(doc.fields["name"], FieldValue::from("Ravi"));
        assert_eq!(doc.fields["created"], FieldValue::Integer(1_773_446_400_000));
        assert_eq!(doc.fields["timestamp"], FieldValue::Timestamp(midnight()));
        assert_eq!(doc.fields["tags"], FieldValue::Array(vec!["loan".into()]));
        assert_eq!(doc.fields["empty"], FieldValue::Null);
        let FieldValue::Map(meta) = &doc.fields["meta"] else {
            panic!("meta should decode as a map");
        };
        assert_eq!(meta["score"], FieldValue::Double(0.5));
    }

    #[test]
    fn encodes_enrichment_fields_in_firestore_shape() {
        let mut doc = Document::new();
        doc.insert("synced_at".into(), FieldValue::Timestamp(midnight()));
        doc.insert("count".into(), FieldValue::Integer(3));
        let encoded = encode_map(&doc);
        assert_eq!(encoded["synced_at"]["timestampValue"], "2026-03-14T00:00:00.000000Z");
        assert_eq!(encoded["count"]["integerValue"], "3");
    }

    #[test]
    fn document_ids_are_encoded_as_single_path_segments() {
        let base = "http://localhost:8080/v1/projects/p/databases/(default)/documents";
        let url = segment_url(base, &["leads", "settleloans_abc?x#y"]).unwrap();
        assert_eq!(url.path(), "/v1/projects/p/databases/(default)/documents/leads/settleloans_abc%3Fx%23y");
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);

        let url = segment_url(base, &["leads", "ama_a/b 50%"]).unwrap();
        assert!(url.path().ends_with("/leads/ama_a%2Fb%2050%25"));
    }

    fn page_doc(n: usize, fields: JsonValue) -> FirestoreDocument {
        FirestoreDocument {
            name: format!("projects/p/databases/(default)/documents/leads/d{n}"),
            fields: fields.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn short_page_ends_the_scan() {
        let page = vec![page_doc(0, json!({ "created": { "integerValue": "5" } }))];
        assert!(resume_cursor("leads", "created", &page, 2).unwrap().is_none());
        assert!(resume_cursor("leads", "created", &[], 2).unwrap().is_none());
    }

    #[test]
    fn full_page_resumes_from_last_document() {
        let page = vec![
            page_doc(0, json!({ "created": { "integerValue": "5" } })),
            page_doc(1, json!({ "created": { "integerValue": "7" } })),
        ];
        let (value, name) = resume_cursor("leads", "created", &page, 2).unwrap().unwrap();
        assert_eq!(value, json!({ "integerValue": "7" }));
        assert!(name.ends_with("/leads/d1"));
    }

    #[test]
    fn full_page_without_cursor_value_is_an_error() {
        let nested = json!({ "meta": { "mapValue": { "fields": { "createdAt": { "integerValue": "7" } } } } });
        let page = vec![page_doc(0, nested.clone()), page_doc(1, nested)];
        let err = resume_cursor("leads", "meta.createdAt", &page, 2).unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }));
    }

    #[test]
    fn error_message_reads_object_and_array_bodies() {
        let obj = r#"{"error":{"code":409,"message":"Document already exists","status":"ALREADY_EXISTS"}}"#;
        let arr = r#"[{"error":{"code":400,"message":"no matching index","status":"FAILED_PRECONDITION"}}]"#;
        assert_eq!(error_message(obj), "Document already exists");
        assert_eq!(error_message(arr), "no matching index");
        assert_eq!(error_message("upstream connect error"), "upstream connect error");
    }

    #[tokio::test]
    async fn access_token_file_is_trimmed() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "ya29.token-value").expect("write token");
        let token = bearer_from(&AccessToken::File(file.path().to_path_buf()))
            .await
            .expect("token");
        assert_eq!(token.as_deref(), Some("ya29.token-value"));
        assert_eq!(bearer_from(&AccessToken::None).await.unwrap(), None);
    }
}
