//! OData v2 JSON entity source.
//!
//! Speaks the flavor of OData v2 the original service exposes: `$count` for
//! totals, `$inlinecount=allpages` plus `__next` continuation URLs for
//! paging, `$filter`/`$select` pass-through, and `/Date(ms)/` encoded
//! timestamps. The server controls page boundaries; the client only follows
//! `__next`, rebased onto the configured service root because some servers
//! return continuation URLs pointing at internal hosts.

use std::time::Duration;

use relsync_config::shared::SourceConfig;
use serde_json::Value as JsonValue;

use crate::bail;
use crate::catalog::{EntityType, FieldType};
use crate::error::{ErrorKind, SyncResult};
use crate::source::{EntitySource, Page, PageCursor, PageRequest};
use crate::sync_error;
use crate::types::{Record, Value};

/// Path suffix every service root is expected to end with.
const SERVICE_ROOT_SUFFIX: &str = "/odata.svc";

/// OData v2 JSON implementation of [`EntitySource`].
#[derive(Debug, Clone)]
pub struct OdataSource {
    http: reqwest::Client,
    base_url: String,
    page_size: Option<u32>,
}

impl OdataSource {
    /// Builds a source from its configuration.
    pub fn new(config: &SourceConfig) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|err| {
                sync_error!(
                    ErrorKind::ConfigError,
                    "Failed to build the HTTP client",
                    source: err
                )
            })?;

        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            page_size: config.page_size,
        })
    }

    fn collection_url(&self, entity_type: &EntityType) -> String {
        format!("{}/{}", self.base_url, entity_type.name)
    }

    /// Rebases a server-provided continuation URL onto the configured
    /// service root.
    fn adjust_next_url(&self, next_url: &str) -> SyncResult<String> {
        if next_url.starts_with(&self.base_url) {
            return Ok(next_url.to_string());
        }

        if let Some(position) = next_url.find(SERVICE_ROOT_SUFFIX) {
            let interesting_part = &next_url[position + SERVICE_ROOT_SUFFIX.len()..];
            return Ok(format!("{}{}", self.base_url, interesting_part));
        }

        bail!(
            ErrorKind::SourceResponseInvalid,
            "Unexpected continuation URL",
            format!("`{next_url}` does not contain `{SERVICE_ROOT_SUFFIX}`")
        )
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> SyncResult<JsonValue> {
        let response = self
            .http
            .get(url)
            .query(query)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| {
                sync_error!(
                    ErrorKind::SourceRequestFailed,
                    "Request to the remote service failed",
                    format!("GET {url}"),
                    source: err
                )
            })?;

        response.json().await.map_err(|err| {
            sync_error!(
                ErrorKind::SourceResponseInvalid,
                "Response body is not valid JSON",
                format!("GET {url}"),
                source: err
            )
        })
    }
}

impl EntitySource for OdataSource {
    async fn total_count(&self, entity_type: &EntityType, filter: Option<&str>) -> SyncResult<u64> {
        let url = format!("{}/$count", self.collection_url(entity_type));
        let mut query = Vec::new();
        if let Some(filter) = filter {
            query.push(("$filter", filter.to_string()));
        }

        let body = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| {
                sync_error!(
                    ErrorKind::SourceRequestFailed,
                    "Count request failed",
                    format!("GET {url}"),
                    source: err
                )
            })?
            .text()
            .await
            .map_err(|err| {
                sync_error!(
                    ErrorKind::SourceResponseInvalid,
                    "Count response could not be read",
                    source: err
                )
            })?;

        body.trim().parse().map_err(|_| {
            sync_error!(
                ErrorKind::SourceResponseInvalid,
                "Count response is not an integer",
                format!("`{}`", body.trim())
            )
        })
    }

    async fn fetch_page(&self, request: PageRequest<'_>) -> SyncResult<Page> {
        let body = match &request.cursor {
            // Continuation URLs already carry every query parameter.
            Some(PageCursor(url)) => self.get_json(url, &[]).await?,
            None => {
                let url = self.collection_url(request.entity_type);
                let mut query = vec![
                    ("$format", "json".to_string()),
                    ("$inlinecount", "allpages".to_string()),
                ];
                if let Some(filter) = request.filter {
                    query.push(("$filter", filter.to_string()));
                }
                if let Some(fields) = request.fields {
                    query.push(("$select", fields.join(",")));
                }
                if let Some(page_size) = self.page_size {
                    query.push(("$top", page_size.to_string()));
                }

                self.get_json(&url, &query).await?
            }
        };

        let envelope = response_envelope(&body)?;
        let records = parse_records(request.entity_type, envelope)?;

        let reported_total = match envelope.get("__count") {
            Some(count) => parse_count(count)?,
            None => records.len() as u64,
        };

        let next = match envelope.get("__next").and_then(JsonValue::as_str) {
            Some(next_url) => Some(PageCursor(self.adjust_next_url(next_url)?)),
            None => None,
        };

        Ok(Page {
            records,
            next,
            reported_total,
        })
    }

    async fn fetch_filtered(
        &self,
        entity_type: &EntityType,
        filter: &str,
    ) -> SyncResult<Vec<Record>> {
        let url = self.collection_url(entity_type);
        let query = vec![
            ("$format", "json".to_string()),
            ("$filter", filter.to_string()),
        ];

        let body = self.get_json(&url, &query).await?;
        let envelope = response_envelope(&body)?;

        parse_records(entity_type, envelope)
    }
}

/// Parses an inline count, which v2 serializes as a string.
fn parse_count(raw: &JsonValue) -> SyncResult<u64> {
    raw.as_u64()
        .or_else(|| raw.as_str().and_then(|s| s.trim().parse().ok()))
        .ok_or_else(|| {
            sync_error!(
                ErrorKind::SourceResponseInvalid,
                "Inline count is not an integer",
                format!("{raw}")
            )
        })
}

/// Unwraps the v2 `{"d": {...}}` envelope.
fn response_envelope(body: &JsonValue) -> SyncResult<&JsonValue> {
    match body.get("d") {
        Some(envelope) => Ok(envelope),
        None => Err(sync_error!(
            ErrorKind::SourceResponseInvalid,
            "Response lacks the `d` envelope"
        )),
    }
}

fn parse_records(entity_type: &EntityType, envelope: &JsonValue) -> SyncResult<Vec<Record>> {
    // Some services put the record array under `results`, plain arrays occur
    // for unpaginated responses.
    let results = match envelope.get("results") {
        Some(results) => results,
        None => envelope,
    };

    let Some(objects) = results.as_array() else {
        bail!(
            ErrorKind::SourceResponseInvalid,
            "Response carries no record array",
            format!("entity type `{}`", entity_type.name)
        );
    };

    let mut records = Vec::with_capacity(objects.len());
    for object in objects {
        let Some(object) = object.as_object() else {
            bail!(
                ErrorKind::SourceResponseInvalid,
                "Record is not a JSON object",
                format!("entity type `{}`", entity_type.name)
            );
        };

        let mut record = Record::new();
        for field in &entity_type.fields {
            if let Some(raw) = object.get(&field.name) {
                record.insert(field.name.clone(), parse_value(raw, field.ty, &field.name)?);
            }
        }
        records.push(record);
    }

    Ok(records)
}

fn parse_value(raw: &JsonValue, ty: FieldType, field: &str) -> SyncResult<Value> {
    if raw.is_null() {
        return Ok(Value::Null);
    }

    let mismatch = || {
        sync_error!(
            ErrorKind::SourceResponseInvalid,
            "Field value does not match its declared type",
            format!("field `{field}`: {raw}")
        )
    };

    let value = match ty {
        FieldType::Bool => Value::Bool(raw.as_bool().ok_or_else(mismatch)?),
        FieldType::Int16 => Value::I16(parse_integer(raw).ok_or_else(mismatch)? as i16),
        FieldType::Int32 => Value::I32(parse_integer(raw).ok_or_else(mismatch)? as i32),
        // v2 serializes 64-bit integers as strings to survive javascript.
        FieldType::Int64 => Value::I64(parse_integer(raw).ok_or_else(mismatch)?),
        FieldType::Double => Value::F64(
            raw.as_f64()
                .or_else(|| raw.as_str().and_then(|s| s.parse().ok()))
                .ok_or_else(mismatch)?,
        ),
        FieldType::Text => Value::Text(raw.as_str().ok_or_else(mismatch)?.to_string()),
        FieldType::Timestamp => {
            let millis = raw
                .as_str()
                .and_then(parse_edm_date_millis)
                .ok_or_else(mismatch)?;
            let timestamp = chrono::DateTime::from_timestamp_millis(millis)
                .ok_or_else(mismatch)?
                .naive_utc();
            Value::Timestamp(timestamp)
        }
        FieldType::TimestampTz => {
            let millis = raw
                .as_str()
                .and_then(parse_edm_date_millis)
                .ok_or_else(mismatch)?;
            let timestamp =
                chrono::DateTime::from_timestamp_millis(millis).ok_or_else(mismatch)?;
            Value::TimestampTz(timestamp)
        }
        FieldType::Uuid => Value::Uuid(
            raw.as_str()
                .and_then(|s| uuid::Uuid::parse_str(s).ok())
                .ok_or_else(mismatch)?,
        ),
    };

    Ok(value)
}

fn parse_integer(raw: &JsonValue) -> Option<i64> {
    raw.as_i64()
        .or_else(|| raw.as_str().and_then(|s| s.parse().ok()))
}

/// Extracts the epoch milliseconds from a `/Date(1634169600000)/` or
/// `/Date(1634169600000+0060)/` literal.
fn parse_edm_date_millis(raw: &str) -> Option<i64> {
    let inner = raw.strip_prefix("/Date(")?.strip_suffix(")/")?;

    // A timezone offset may trail the millisecond value; the milliseconds are
    // UTC either way.
    let end = inner
        .char_indices()
        .skip(1)
        .find(|(_, c)| *c == '+' || *c == '-')
        .map(|(index, _)| index)
        .unwrap_or(inner.len());

    inner[..end].parse().ok()
}
