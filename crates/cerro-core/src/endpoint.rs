//! Endpoint derivation from the manifest tag convention.
//!
//! A model is exposed when it carries both the `production` tag and an
//! `api:<resource>` tag. The remaining tags determine where and how:
//!
//! - the first tag that is not reserved becomes the URL category,
//! - an optional `granularity:<value>` tag appends a final path segment,
//! - an optional `tier<N>` tag sets the required access tier.
//!
//! Path shape: `/<category>/<resource>[/<granularity>]`, all lower-case.
//! Derivation is deliberately strict where the source convention was
//! ambiguous: a descriptor with zero or with multiple candidate category
//! tags is excluded with a recorded warning, and two descriptors deriving
//! the same path fail the whole build rather than shadowing one another.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::manifest::{Column, ModelDescriptor};
use crate::tier::Tier;

/// Tag prefix naming the exposed resource.
pub const API_TAG_PREFIX: &str = "api:";
/// Tag prefix naming the optional granularity path segment.
pub const GRANULARITY_TAG_PREFIX: &str = "granularity:";

/// Tags that can never be a category: pipeline materializations and
/// granularity values occasionally used as standalone tags.
const RESERVED_TAGS: &[&str] = &[
    "production",
    "view",
    "table",
    "incremental",
    "staging",
    "intermediate",
    "daily",
    "weekly",
    "monthly",
    "hourly",
    "latest",
    "in_ranges",
    "last_30d",
    "last_7d",
    "all_time",
];

/// Comparison operator a query parameter applies to its bound column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// Equality.
    Eq,
    /// Greater than or equal.
    Gte,
    /// Less than or equal.
    Lte,
    /// Case-insensitive substring match.
    ILike,
}

impl Operator {
    /// SQL rendering of the operator.
    #[must_use]
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Gte => ">=",
            Self::Lte => "<=",
            Self::ILike => "ILIKE",
        }
    }
}

/// Value type of a query parameter, used for typed placeholder binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    /// Calendar date (`YYYY-MM-DD`).
    Date,
    /// Free-form string.
    Text,
}

impl ValueType {
    /// The backend placeholder type for this value.
    #[must_use]
    pub const fn placeholder_type(self) -> &'static str {
        match self {
            Self::Date => "Date",
            Self::Text => "String",
        }
    }
}

/// One accepted query parameter of an endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ParamSpec {
    /// Query-string name.
    pub name: String,
    /// Bound column in the backing relation.
    pub column: String,
    /// Comparison operator applied to the column.
    pub operator: Operator,
    /// Expected value type.
    pub value_type: ValueType,
    /// Whether the parameter must be supplied.
    pub required: bool,
}

impl ParamSpec {
    fn optional(name: &str, column: &str, operator: Operator, value_type: ValueType) -> Self {
        Self {
            name: name.to_string(),
            column: column.to_string(),
            operator,
            value_type,
            required: false,
        }
    }
}

/// Derived endpoint specification, resolved once per table build.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSpec {
    /// Source model name.
    pub model: String,
    /// Backing relation the query bridge reads from.
    pub relation: String,
    /// URL path, `/<category>/<resource>[/<granularity>]`.
    pub path: String,
    /// Display grouping key (the category tag, lower-case).
    pub group: String,
    /// Minimum tier required to invoke this endpoint.
    pub required_tier: Tier,
    /// Accepted query parameters.
    pub params: Vec<ParamSpec>,
    /// Default ordering clause, resolved from the primary date column.
    pub order_by: Option<String>,
    /// Human title for listings.
    pub summary: String,
    /// Model description from the manifest, if any.
    pub description: Option<String>,
}

/// Why a descriptor was excluded from the build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExcludeReason {
    /// No candidate category tag remained after filtering.
    MissingCategory,
    /// More than one candidate category tag; picking one silently would
    /// make the path depend on tag order.
    AmbiguousCategory {
        /// First candidate in tag order.
        first: String,
        /// Second candidate in tag order.
        second: String,
    },
    /// Backing relation is not a plain `schema.table` identifier.
    InvalidRelation {
        /// The offending relation string.
        relation: String,
    },
}

impl fmt::Display for ExcludeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingCategory => write!(f, "no category tag"),
            Self::AmbiguousCategory { first, second } => {
                write!(f, "ambiguous category tags: {first} and {second}")
            }
            Self::InvalidRelation { relation } => {
                write!(f, "invalid relation identifier: {relation}")
            }
        }
    }
}

/// A recorded per-descriptor derivation warning.
#[derive(Debug, Clone)]
pub struct DeriveWarning {
    /// The excluded model.
    pub model: String,
    /// Why it was excluded.
    pub reason: ExcludeReason,
}

/// Result of deriving a whole manifest: the endpoints plus any
/// per-descriptor exclusion warnings.
#[derive(Debug, Default)]
pub struct Derived {
    /// Endpoints for all eligible, unambiguous descriptors.
    pub endpoints: Vec<EndpointSpec>,
    /// Descriptors excluded with a reason (never fatal to the build).
    pub warnings: Vec<DeriveWarning>,
}

/// Derives endpoint specifications from model descriptors.
///
/// Descriptors are processed in name order so that path collisions are
/// reported deterministically.
///
/// # Errors
///
/// Returns [`Error::DuplicatePath`] when two descriptors derive the same
/// path. Per-descriptor problems (no category, ambiguous category) are
/// recorded as warnings instead.
pub fn derive_endpoints(descriptors: &[ModelDescriptor], default_tier: Tier) -> Result<Derived> {
    let mut ordered: Vec<&ModelDescriptor> = descriptors.iter().collect();
    ordered.sort_by(|a, b| a.name.cmp(&b.name));

    let mut derived = Derived::default();
    let mut paths: HashMap<String, String> = HashMap::new();

    for descriptor in ordered {
        let Some(endpoint) = derive_one(descriptor, default_tier, &mut derived.warnings) else {
            continue;
        };

        if let Some(first) = paths.get(&endpoint.path) {
            return Err(Error::DuplicatePath {
                path: endpoint.path,
                first: first.clone(),
                second: descriptor.name.clone(),
            });
        }
        paths.insert(endpoint.path.clone(), descriptor.name.clone());
        derived.endpoints.push(endpoint);
    }

    Ok(derived)
}

fn derive_one(
    descriptor: &ModelDescriptor,
    default_tier: Tier,
    warnings: &mut Vec<DeriveWarning>,
) -> Option<EndpointSpec> {
    // Eligibility: both tags required, silently excluded otherwise.
    if !descriptor.tags.iter().any(|t| t == "production") {
        return None;
    }
    let resource = extract_resource(&descriptor.tags)?;

    let mut exclude = |reason: ExcludeReason| {
        tracing::warn!(model = %descriptor.name, reason = %reason, "excluding model from route table");
        warnings.push(DeriveWarning {
            model: descriptor.name.clone(),
            reason,
        });
        None
    };

    let category = match extract_category(&descriptor.tags) {
        CategoryMatch::One(category) => category,
        CategoryMatch::None => return exclude(ExcludeReason::MissingCategory),
        CategoryMatch::Ambiguous { first, second } => {
            return exclude(ExcludeReason::AmbiguousCategory { first, second });
        }
    };

    if !is_safe_relation(&descriptor.relation) {
        return exclude(ExcludeReason::InvalidRelation {
            relation: descriptor.relation.clone(),
        });
    }

    let granularity = extract_granularity(&descriptor.tags);
    let required_tier = descriptor
        .tags
        .iter()
        .find_map(|tag| Tier::from_tag(tag))
        .unwrap_or(default_tier);

    let mut path = format!("/{category}/{}", resource.to_ascii_lowercase());
    let mut summary = title_case(&resource);
    if let Some(granularity) = &granularity {
        path.push('/');
        path.push_str(granularity);
        summary.push_str(&format!(" ({granularity})"));
    }

    Some(EndpointSpec {
        model: descriptor.name.clone(),
        relation: descriptor.relation.clone(),
        path,
        group: category,
        required_tier,
        params: derive_params(&descriptor.columns),
        order_by: default_order_by(&descriptor.columns),
        summary,
        description: descriptor.description.clone(),
    })
}

fn extract_resource(tags: &[String]) -> Option<String> {
    tags.iter().find_map(|tag| {
        tag.strip_prefix(API_TAG_PREFIX)
            .map(str::trim)
            .filter(|resource| !resource.is_empty())
            .map(str::to_string)
    })
}

fn extract_granularity(tags: &[String]) -> Option<String> {
    tags.iter().find_map(|tag| {
        tag.strip_prefix(GRANULARITY_TAG_PREFIX)
            .map(|g| g.trim().to_ascii_lowercase())
            .filter(|g| !g.is_empty())
    })
}

enum CategoryMatch {
    None,
    One(String),
    Ambiguous { first: String, second: String },
}

fn extract_category(tags: &[String]) -> CategoryMatch {
    let mut candidates = tags.iter().filter_map(|tag| {
        let lower = tag.to_ascii_lowercase();
        if RESERVED_TAGS.contains(&lower.as_str()) || is_tier_tag(&lower) || tag.contains(':') {
            None
        } else {
            Some(lower)
        }
    });

    match (candidates.next(), candidates.next()) {
        (None, _) => CategoryMatch::None,
        (Some(category), None) => CategoryMatch::One(category),
        (Some(first), Some(second)) => CategoryMatch::Ambiguous { first, second },
    }
}

fn is_tier_tag(tag: &str) -> bool {
    tag.strip_prefix("tier")
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

fn is_safe_relation(relation: &str) -> bool {
    !relation.is_empty()
        && relation
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.')
}

fn is_date_column(column: &Column) -> bool {
    column.data_type.contains("Date")
        || column.data_type.contains("Time")
        || matches!(column.name.as_str(), "date" | "timestamp" | "block_timestamp")
}

/// Detects query parameters from the column schema: a date-range pair on
/// the primary date column, a substring filter on `address`, and equality
/// filters on a fixed set of common dimension columns.
fn derive_params(columns: &[Column]) -> Vec<ParamSpec> {
    let mut params = Vec::new();

    if let Some(date_column) = columns.iter().find(|c| is_date_column(c)) {
        params.push(ParamSpec::optional(
            "start_date",
            &date_column.name,
            Operator::Gte,
            ValueType::Date,
        ));
        params.push(ParamSpec::optional(
            "end_date",
            &date_column.name,
            Operator::Lte,
            ValueType::Date,
        ));
    }

    if columns.iter().any(|c| c.name == "address") {
        params.push(ParamSpec::optional(
            "address",
            "address",
            Operator::ILike,
            ValueType::Text,
        ));
    }

    for dimension in ["project", "sector", "label", "status"] {
        if columns.iter().any(|c| c.name == dimension) {
            params.push(ParamSpec::optional(
                dimension,
                dimension,
                Operator::Eq,
                ValueType::Text,
            ));
        }
    }

    params
}

fn default_order_by(columns: &[Column]) -> Option<String> {
    columns
        .iter()
        .find(|c| is_date_column(c))
        .map(|c| format!("{} DESC", c.name))
}

fn title_case(value: &str) -> String {
    value
        .split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, tags: &[&str]) -> ModelDescriptor {
        ModelDescriptor {
            name: name.to_string(),
            relation: format!("analytics.{name}"),
            tags: tags.iter().map(|t| (*t).to_string()).collect(),
            columns: Vec::new(),
            description: None,
        }
    }

    fn descriptor_with_columns(
        name: &str,
        tags: &[&str],
        columns: &[(&str, &str)],
    ) -> ModelDescriptor {
        let mut d = descriptor(name, tags);
        d.columns = columns
            .iter()
            .map(|(name, data_type)| Column {
                name: (*name).to_string(),
                data_type: (*data_type).to_string(),
            })
            .collect();
        d
    }

    #[test]
    fn full_tag_set_round_trip() {
        let d = descriptor(
            "blob_commitments_daily",
            &[
                "production",
                "consensus",
                "tier1",
                "api:blob_commitments",
                "granularity:daily",
            ],
        );
        let derived = derive_endpoints(&[d], Tier::Tier0).unwrap();
        assert_eq!(derived.endpoints.len(), 1);
        let endpoint = &derived.endpoints[0];
        assert_eq!(endpoint.path, "/consensus/blob_commitments/daily");
        assert_eq!(endpoint.group, "consensus");
        assert_eq!(endpoint.required_tier, Tier::Tier1);
        assert_eq!(endpoint.summary, "Blob Commitments (daily)");
        assert!(derived.warnings.is_empty());
    }

    #[test]
    fn missing_production_tag_excludes_silently() {
        let d = descriptor("m", &["consensus", "api:things"]);
        let derived = derive_endpoints(&[d], Tier::Tier0).unwrap();
        assert!(derived.endpoints.is_empty());
        assert!(derived.warnings.is_empty());
    }

    #[test]
    fn missing_api_tag_excludes_silently() {
        let d = descriptor("m", &["production", "consensus"]);
        let derived = derive_endpoints(&[d], Tier::Tier0).unwrap();
        assert!(derived.endpoints.is_empty());
        assert!(derived.warnings.is_empty());
    }

    #[test]
    fn missing_category_is_a_recorded_warning() {
        let d = descriptor("m", &["production", "api:things", "tier2", "view"]);
        let derived = derive_endpoints(&[d], Tier::Tier0).unwrap();
        assert!(derived.endpoints.is_empty());
        assert_eq!(derived.warnings.len(), 1);
        assert_eq!(derived.warnings[0].reason, ExcludeReason::MissingCategory);
    }

    #[test]
    fn ambiguous_category_is_a_recorded_warning() {
        let d = descriptor("m", &["production", "consensus", "execution", "api:things"]);
        let derived = derive_endpoints(&[d], Tier::Tier0).unwrap();
        assert!(derived.endpoints.is_empty());
        assert_eq!(
            derived.warnings[0].reason,
            ExcludeReason::AmbiguousCategory {
                first: "consensus".to_string(),
                second: "execution".to_string(),
            }
        );
    }

    #[test]
    fn duplicate_paths_fail_naming_both_models() {
        let a = descriptor("alpha", &["production", "consensus", "api:things"]);
        let b = descriptor("beta", &["production", "consensus", "api:things"]);
        let err = derive_endpoints(&[b, a], Tier::Tier0).unwrap_err();
        match err {
            Error::DuplicatePath { path, first, second } => {
                assert_eq!(path, "/consensus/things");
                // Name-sorted processing makes the report deterministic
                // regardless of manifest order.
                assert_eq!(first, "alpha");
                assert_eq!(second, "beta");
            }
            other => panic!("expected DuplicatePath, got {other}"),
        }
    }

    #[test]
    fn tier_defaults_when_untagged() {
        let d = descriptor("m", &["production", "consensus", "api:things"]);
        let derived = derive_endpoints(&[d], Tier::Tier2).unwrap();
        assert_eq!(derived.endpoints[0].required_tier, Tier::Tier2);
    }

    #[test]
    fn unknown_granularity_passes_through() {
        let d = descriptor(
            "m",
            &["production", "consensus", "api:things", "granularity:fortnightly"],
        );
        let derived = derive_endpoints(&[d], Tier::Tier0).unwrap();
        assert_eq!(derived.endpoints[0].path, "/consensus/things/fortnightly");
    }

    #[test]
    fn path_is_lower_cased() {
        let d = descriptor("m", &["production", "Consensus", "api:Things"]);
        let derived = derive_endpoints(&[d], Tier::Tier0).unwrap();
        assert_eq!(derived.endpoints[0].path, "/consensus/things");
    }

    #[test]
    fn date_columns_drive_range_params_and_ordering() {
        let d = descriptor_with_columns(
            "m",
            &["production", "consensus", "api:things"],
            &[("block_timestamp", "DateTime"), ("value", "UInt64")],
        );
        let derived = derive_endpoints(&[d], Tier::Tier0).unwrap();
        let endpoint = &derived.endpoints[0];
        let names: Vec<&str> = endpoint.params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["start_date", "end_date"]);
        assert_eq!(endpoint.params[0].column, "block_timestamp");
        assert_eq!(endpoint.params[0].operator, Operator::Gte);
        assert_eq!(endpoint.order_by.as_deref(), Some("block_timestamp DESC"));
    }

    #[test]
    fn dimension_columns_get_equality_filters() {
        let d = descriptor_with_columns(
            "m",
            &["production", "consensus", "api:things"],
            &[("address", "String"), ("project", "String")],
        );
        let derived = derive_endpoints(&[d], Tier::Tier0).unwrap();
        let endpoint = &derived.endpoints[0];
        let address = endpoint.params.iter().find(|p| p.name == "address").unwrap();
        assert_eq!(address.operator, Operator::ILike);
        let project = endpoint.params.iter().find(|p| p.name == "project").unwrap();
        assert_eq!(project.operator, Operator::Eq);
    }

    #[test]
    fn granularity_value_as_standalone_tag_is_not_a_category() {
        let d = descriptor("m", &["production", "daily", "consensus", "api:things"]);
        let derived = derive_endpoints(&[d], Tier::Tier0).unwrap();
        assert_eq!(derived.endpoints[0].group, "consensus");
    }
}
