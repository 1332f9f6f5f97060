//! Manifest document parsing.
//!
//! The manifest is the metadata document emitted by the analytics pipeline:
//! a JSON object whose `nodes` map contains, among other node kinds, the
//! data models this API exposes. Only nodes with `resource_type == "model"`
//! are indexed; everything else (tests, seeds, sources) is ignored.
//!
//! Parsing is strict about the fields endpoint derivation depends on:
//! a model node missing its name or tag list, or carrying an unparseable
//! column map, fails the whole parse with [`Error::ManifestMalformed`].

use serde_json::Value;

use crate::error::{Error, Result};

/// A single column of a model's schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name as it appears in the backing relation.
    pub name: String,
    /// Semantic type string from the manifest (e.g. `Date`, `UInt64`).
    pub data_type: String,
}

/// Raw unit from the manifest: one named data model.
///
/// Immutable once loaded; endpoint derivation consumes these.
#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    /// Unique model name.
    pub name: String,
    /// Backing relation (`<schema>.<alias>`) the query bridge reads from.
    pub relation: String,
    /// Ordered tag list driving endpoint derivation.
    pub tags: Vec<String>,
    /// Column schema in manifest order.
    pub columns: Vec<Column>,
    /// Optional human description, carried into endpoint metadata.
    pub description: Option<String>,
}

/// Parses manifest bytes into model descriptors.
///
/// # Errors
///
/// Returns [`Error::ManifestMalformed`] when the document is not valid
/// JSON, or when a model node is missing required fields.
pub fn parse_models(bytes: &[u8]) -> Result<Vec<ModelDescriptor>> {
    let document: Value = serde_json::from_slice(bytes)
        .map_err(|e| Error::malformed(format!("invalid manifest JSON: {e}")))?;

    let Some(nodes) = document.get("nodes").and_then(Value::as_object) else {
        return Err(Error::malformed("manifest has no `nodes` object"));
    };

    let mut models = Vec::new();
    for (key, node) in nodes {
        let Some(node) = node.as_object() else {
            return Err(Error::malformed(format!("node {key} is not an object")));
        };
        if node.get("resource_type").and_then(Value::as_str) != Some("model") {
            continue;
        }
        models.push(parse_model_node(key, node)?);
    }
    Ok(models)
}

fn parse_model_node(key: &str, node: &serde_json::Map<String, Value>) -> Result<ModelDescriptor> {
    let name = node
        .get("name")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::malformed(format!("model node {key} has no name")))?;

    let tags = node
        .get("tags")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::malformed(format!("model {name} has no tags list")))?
        .iter()
        .map(|tag| {
            tag.as_str()
                .map(str::to_string)
                .ok_or_else(|| Error::malformed(format!("model {name} has a non-string tag")))
        })
        .collect::<Result<Vec<_>>>()?;

    let columns = parse_columns(name, node.get("columns"))?;

    let schema = node
        .get("schema")
        .and_then(Value::as_str)
        .unwrap_or("default");
    let alias = node.get("alias").and_then(Value::as_str).unwrap_or(name);

    let description = node
        .get("description")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string);

    Ok(ModelDescriptor {
        name: name.to_string(),
        relation: format!("{schema}.{alias}"),
        tags,
        columns,
        description,
    })
}

fn parse_columns(model: &str, columns: Option<&Value>) -> Result<Vec<Column>> {
    let Some(columns) = columns else {
        return Ok(Vec::new());
    };
    let Some(columns) = columns.as_object() else {
        return Err(Error::malformed(format!(
            "model {model} has an unparseable column list"
        )));
    };

    // serde_json is built with `preserve_order`, so iteration follows the
    // manifest's column order; parameter detection relies on this when
    // picking the primary date column.
    columns
        .iter()
        .map(|(name, meta)| {
            let Some(meta) = meta.as_object() else {
                return Err(Error::malformed(format!(
                    "model {model} column {name} is not an object"
                )));
            };
            let data_type = meta
                .get("data_type")
                .and_then(Value::as_str)
                .unwrap_or("String");
            Ok(Column {
                name: name.clone(),
                data_type: data_type.to_string(),
            })
        })
        .collect()
}
