//! Core domain model shared by the finfeed sync pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "finfeed-core";

/// A workspace-database property value: text, number, or empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Empty,
}

impl FieldValue {
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Text(s) => s.trim().is_empty(),
            FieldValue::Number(_) => false,
            FieldValue::Empty => true,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Source-supplied, pre-normalization unit. Produced per run, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    pub source_id: String,
    pub title: String,
    pub url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub body: Option<String>,
    /// Source-specific extras riding along with the item (stock code, price,
    /// source label). Secondary identity discriminators are looked up here.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl RawItem {
    pub fn field_text(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(FieldValue::as_text)
    }
}

/// How a source derives the identity key that decides "same logical record".
///
/// Declared once per source in the registry; the engine is strategy-agnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentitySpec {
    /// Canonical absolute URL (lower-cased scheme/host, default port and
    /// trailing slash dropped).
    ByUrl,
    /// Composite of the title plus a named secondary field (ticker, stock
    /// code), for sources where URLs are shared or unstable.
    ByTitleAndField(String),
}

// serde_yaml's `Deserializer::deserialize_enum` only accepts YAML's native
// `!tag` syntax, rejecting the plain `by-url` / `{ by-title-and-field: .. }`
// forms the registry files use. Routing through `deserialize_any` gets the
// same externally-tagged shape the derive would produce, but in a way every
// self-describing format (YAML, JSON, ...) can satisfy.
impl<'de> Deserialize<'de> for IdentitySpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct IdentitySpecVisitor;

        impl<'de> serde::de::Visitor<'de> for IdentitySpecVisitor {
            type Value = IdentitySpec;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("\"by-url\" or a map with a \"by-title-and-field\" key")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                match v {
                    "by-url" => Ok(IdentitySpec::ByUrl),
                    other => Err(E::unknown_variant(
                        other,
                        &["by-url", "by-title-and-field"],
                    )),
                }
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::MapAccess<'de>,
            {
                let key: String = map
                    .next_key()?
                    .ok_or_else(|| serde::de::Error::invalid_length(0, &self))?;
                match key.as_str() {
                    "by-title-and-field" => Ok(IdentitySpec::ByTitleAndField(map.next_value()?)),
                    other => Err(serde::de::Error::unknown_variant(
                        other,
                        &["by-title-and-field"],
                    )),
                }
            }
        }

        deserializer.deserialize_any(IdentitySpecVisitor)
    }
}

/// Normalized, persistence-ready unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub identity_key: String,
    pub source_id: String,
    pub title: String,
    pub url: Option<String>,
    pub extra_fields: BTreeMap<String, FieldValue>,
    pub created_at: DateTime<Utc>,
}

/// One permanently failed item, kept for the end-of-run report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub source_id: String,
    pub title: String,
    pub reason: String,
}

/// Per-run outcome tally. Reported to the caller and the log, not persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Items dropped before the duplicate check (no usable locator).
    pub discarded: usize,
    pub failures: Vec<ItemFailure>,
}

impl SyncResult {
    pub fn merge(&mut self, other: SyncResult) {
        self.created += other.created;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.discarded += other.discarded;
        self.failures.extend(other.failures);
    }

    pub fn processed(&self) -> usize {
        self.created + self.updated + self.skipped + self.failed
    }
}
