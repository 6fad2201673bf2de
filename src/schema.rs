//! The fixed collection schema.
//!
//! askdata answers questions about exactly one collection. Its field list is
//! compiled in; only the database and collection names come from config.
//! The schema drives three things: the schema block embedded in the
//! generation prompt, validation of generated queries, and normalization of
//! imported documents.

use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::models::Document;
use crate::query::eval::number_value;

/// Field holding the document identifier.
pub const ID_FIELD: &str = "_id";

/// Value type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    ObjectId,
    String,
    Double,
    Date,
}

impl FieldType {
    /// Type name as written in the prompt's schema block.
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::ObjectId => "ObjectId",
            FieldType::String => "string",
            FieldType::Double => "double",
            FieldType::Date => "date",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub ty: FieldType,
}

const FINANCIALS_FIELDS: &[Field] = &[
    Field { name: ID_FIELD, ty: FieldType::ObjectId },
    Field { name: "channel", ty: FieldType::String },
    Field { name: "sales_team", ty: FieldType::String },
    Field { name: "platform", ty: FieldType::String },
    Field { name: "strategy", ty: FieldType::String },
    Field { name: "inflows", ty: FieldType::Double },
    Field { name: "outflows", ty: FieldType::Double },
    Field { name: "netflows", ty: FieldType::Double },
    Field { name: "aum", ty: FieldType::Double },
    Field { name: "revenue", ty: FieldType::Double },
    Field { name: "financials_date", ty: FieldType::Date },
];

/// The queried collection: its names and its typed fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSchema {
    pub database: String,
    pub collection: String,
    pub fields: Vec<Field>,
}

impl CollectionSchema {
    /// The financials collection with the given database and collection names.
    pub fn financials(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
            fields: FINANCIALS_FIELDS.to_vec(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Renders the schema block embedded in the generation prompt.
    pub fn describe(&self) -> String {
        let mut out = format!(
            "Database: '{}', collection: '{}'\n{{\n",
            self.database, self.collection
        );
        for field in &self.fields {
            out.push_str(&format!("    {} {}\n", field.name, field.ty.as_str()));
        }
        out.push('}');
        out
    }

    /// Checks a literal against a field's type and converts it to the stored
    /// representation. `Null` passes through for every type.
    pub fn coerce(&self, field: &Field, value: &Value) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        match field.ty {
            FieldType::String => match value {
                Value::String(_) => Ok(value.clone()),
                other => bail!("field `{}` expects a string, got {}", field.name, other),
            },
            FieldType::Double => match value {
                Value::Number(n) => Ok(n.as_f64().map(number_value).unwrap_or(Value::Null)),
                other => bail!("field `{}` expects a number, got {}", field.name, other),
            },
            FieldType::ObjectId => match value {
                Value::String(_) => Ok(value.clone()),
                Value::Object(map) => match map.get("$oid") {
                    Some(Value::String(s)) if map.len() == 1 => Ok(Value::String(s.clone())),
                    _ => bail!("field `{}` expects an ObjectId", field.name),
                },
                other => bail!("field `{}` expects an ObjectId, got {}", field.name, other),
            },
            FieldType::Date => {
                let text = match value {
                    Value::String(s) => s.as_str(),
                    Value::Object(map) => match map.get("$date") {
                        Some(Value::String(s)) if map.len() == 1 => s.as_str(),
                        _ => bail!("field `{}` expects a date", field.name),
                    },
                    other => bail!("field `{}` expects a date, got {}", field.name, other),
                };
                Ok(Value::String(canonical_date(text)?))
            }
        }
    }

    /// Validates an imported document and converts it to stored form.
    ///
    /// Unknown fields are rejected, `null` values are dropped (a stored
    /// field is either present with a value or absent), and a missing `_id`
    /// is generated. Keys come out in schema order.
    pub fn normalize_document(&self, doc: &Document) -> Result<Document> {
        if let Some(key) = doc.keys().find(|k| self.field(k).is_none()) {
            bail!("unknown field `{}` for collection '{}'", key, self.collection);
        }
        let mut out = Document::new();
        for field in &self.fields {
            let Some(value) = doc.get(field.name) else {
                continue;
            };
            let value = self.coerce(field, value)?;
            if !value.is_null() {
                out.insert(field.name.to_string(), value);
            }
        }
        if !matches!(out.get(ID_FIELD), Some(Value::String(_))) {
            let mut with_id = Document::new();
            with_id.insert(
                ID_FIELD.to_string(),
                Value::String(uuid::Uuid::new_v4().simple().to_string()),
            );
            with_id.extend(out);
            out = with_id;
        }
        Ok(out)
    }
}

/// Parses a date literal and renders it as a UTC RFC 3339 string with
/// millisecond precision, the only form dates are stored and compared in.
///
/// Accepts full RFC 3339 timestamps, naive `YYYY-MM-DDTHH:MM:SS` (taken as
/// UTC), `YYYY-MM-DD`, and `YYYY-MM` (first of the month).
pub fn canonical_date(text: &str) -> Result<String> {
    parse_date(text)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .ok_or_else(|| anyhow::anyhow!("invalid date literal: {:?}", text))
}

/// Parses the date forms accepted by [`canonical_date`].
pub fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|d| d.and_utc());
    }
    NaiveDate::parse_from_str(&format!("{}-01", text), "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
}
