//! Coffee post records and their validation.
//!
//! Firehose blocks arrive as untyped maps. [`validate_record`] turns one of
//! them into a [`BeanPost`] or explains why it was not one. Almost every block
//! on the network is some other record type, so the `$type` check runs first
//! and yields [`RecordOutcome::NotApplicable`] without touching anything else.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::BEAN_POST_NSID;

/// A validated coffee post, as stored and served.
///
/// Immutable once accepted by the store. `uri` is the primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeanPost {
    /// Record schema discriminator (always [`BEAN_POST_NSID`] for accepted posts).
    pub record_type: String,

    /// `at://<repo-did>/<collection>/<rkey>`.
    pub uri: String,

    /// Content identifier of the record block. Informational only.
    pub cid: String,

    /// Producer-supplied ISO-8601 timestamp. Not trusted to be sane.
    pub created_at: String,

    /// Post body.
    pub text: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bean_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roast_level: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brew_method: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,

    /// When this service accepted the record (RFC 3339).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexed_at: Option<String>,
}

/// Coordinates attached to a post. Both are kept as the strings the producer sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub lat: String,
    pub lng: String,
}

impl BeanPost {
    /// Parse `created_at` as an ISO-8601 timestamp.
    ///
    /// RFC 3339 first, then a compact `+hhmm` offset. Values without an offset
    /// and bare dates are read as UTC. Returns `None` for anything else;
    /// callers decide what that means (eviction keeps such posts, ranking
    /// puts them last).
    pub fn created_at_time(&self) -> Option<DateTime<Utc>> {
        let raw = self.created_at.trim();

        if let Ok(dt) = DateTime::parse_from_rfc3339(raw)
            .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z"))
        {
            return Some(dt.with_timezone(&Utc));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
            return Some(naive.and_utc());
        }
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
    }

    /// The DID of the repository that published this post.
    pub fn author_did(&self) -> Option<&str> {
        author_from_uri(&self.uri)
    }
}

/// Extract the authority (repository DID) from an `at://` URI.
pub fn author_from_uri(uri: &str) -> Option<&str> {
    let rest = uri.strip_prefix("at://")?;
    let authority = rest.split('/').next()?;
    (!authority.is_empty()).then_some(authority)
}

/// Why a payload of the right type was still refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    /// A required field was not present.
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    /// A required field was present with the wrong type or an empty value.
    #[error("invalid required field '{0}'")]
    InvalidField(&'static str),
}

impl Rejection {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::MissingField(_) => "missing_field",
            Self::InvalidField(_) => "invalid_field",
        }
    }
}

/// Result of running a decoded block through [`validate_record`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    /// Not a coffee post at all. The normal case for stream traffic.
    NotApplicable,
    /// Claims to be a coffee post but is missing or mistyping required fields.
    Malformed(Rejection),
    /// A well-formed coffee post.
    Accepted(BeanPost),
}

/// Validate an untyped record payload.
///
/// # Arguments
///
/// * `payload` - Decoded record block
/// * `repo` - DID of the repository the commit came from
/// * `path` - Record path within the repo (`<collection>/<rkey>`)
/// * `cid` - Block identifier the payload was decoded from
pub fn validate_record(payload: &Value, repo: &str, path: &str, cid: &str) -> RecordOutcome {
    let Some(fields) = payload.as_object() else {
        return RecordOutcome::NotApplicable;
    };

    if fields.get("$type").and_then(Value::as_str) != Some(BEAN_POST_NSID) {
        return RecordOutcome::NotApplicable;
    }

    let text = match required_string(fields, "text") {
        Ok(text) => text,
        Err(rejection) => return RecordOutcome::Malformed(rejection),
    };
    let created_at = match required_string(fields, "createdAt") {
        Ok(created_at) => created_at,
        Err(rejection) => return RecordOutcome::Malformed(rejection),
    };

    let uri = fields
        .get("uri")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("at://{repo}/{path}"));

    RecordOutcome::Accepted(BeanPost {
        record_type: BEAN_POST_NSID.to_string(),
        uri,
        cid: cid.to_string(),
        created_at,
        text,
        bean_name: optional_string(fields, "beanName"),
        origin: optional_string(fields, "origin"),
        roast_level: optional_string(fields, "roastLevel"),
        brew_method: optional_string(fields, "brewMethod"),
        rating: fields.get("rating").and_then(Value::as_f64),
        location: location(fields),
        indexed_at: None,
    })
}

fn required_string(fields: &Map<String, Value>, name: &'static str) -> Result<String, Rejection> {
    match fields.get(name) {
        None | Some(Value::Null) => Err(Rejection::MissingField(name)),
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(_) => Err(Rejection::InvalidField(name)),
    }
}

fn optional_string(fields: &Map<String, Value>, name: &str) -> Option<String> {
    fields.get(name).and_then(Value::as_str).map(str::to_string)
}

// Both coordinates or nothing.
fn location(fields: &Map<String, Value>) -> Option<Location> {
    let location = fields.get("location")?.as_object()?;
    let lat = location.get("lat")?.as_str()?;
    let lng = location.get("lng")?.as_str()?;
    Some(Location {
        lat: lat.to_string(),
        lng: lng.to_string(),
    })
}
