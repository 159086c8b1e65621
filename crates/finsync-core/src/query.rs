//! # Query Types
//!
//! Data-driven filters, sort orders and limits for reading the entity store.
//!
//! A [`Filter`] doubles as the reconciler's scope predicate: when a remote
//! batch is authoritative for "all bills of account 42", the scope is
//! `Filter::eq("account_id", 42)` and only local records matching it are
//! eligible for deletion.
//!
//! ## Field Paths
//! Fields are addressed by dotted paths into the record's JSON body
//! (`account_id`, `amount.currency`). Paths are validated before they reach
//! SQL; anything other than `[A-Za-z0-9_]` segments joined by single dots is
//! rejected with [`CoreError::InvalidFieldPath`].

use serde::{Deserialize, Serialize};

use crate::entity::PrimaryKey;
use crate::error::{CoreError, CoreResult};

// =============================================================================
// Scalar Values
// =============================================================================

/// A value a filter can compare a field against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    Text(String),
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        ScalarValue::Bool(v)
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        ScalarValue::Int(v)
    }
}

impl From<i32> for ScalarValue {
    fn from(v: i32) -> Self {
        ScalarValue::Int(i64::from(v))
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        ScalarValue::Real(v)
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        ScalarValue::Text(v.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(v: String) -> Self {
        ScalarValue::Text(v)
    }
}

impl ScalarValue {
    /// Converts a JSON value, rejecting arrays and objects.
    pub fn from_json(field: &str, value: &serde_json::Value) -> CoreResult<Self> {
        use serde_json::Value;

        match value {
            Value::Null => Ok(ScalarValue::Null),
            Value::Bool(b) => Ok(ScalarValue::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(ScalarValue::Int(i)),
                None => n.as_f64().map(ScalarValue::Real).ok_or_else(|| {
                    CoreError::UnsupportedFilterValue {
                        field: field.to_string(),
                        reason: format!("number {} is out of range", n),
                    }
                }),
            },
            Value::String(s) => Ok(ScalarValue::Text(s.clone())),
            Value::Array(_) | Value::Object(_) => Err(CoreError::UnsupportedFilterValue {
                field: field.to_string(),
                reason: "arrays and objects cannot be compared".to_string(),
            }),
        }
    }
}

// =============================================================================
// Filter
// =============================================================================

/// Predicate over stored records of one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    /// Matches every record.
    All,
    /// `field == value`. Comparing against `Null` matches missing fields too.
    FieldEq { field: String, value: ScalarValue },
    /// `field` equals any of `values`. An empty list matches nothing.
    FieldIn { field: String, values: Vec<ScalarValue> },
    /// Primary key is one of `keys`. An empty list matches nothing.
    KeyIn { keys: Vec<PrimaryKey> },
    /// All sub-filters match. An empty list matches everything.
    And { filters: Vec<Filter> },
    /// Any sub-filter matches. An empty list matches nothing.
    Or { filters: Vec<Filter> },
}

impl Default for Filter {
    fn default() -> Self {
        Filter::All
    }
}

impl Filter {
    /// `field == value`.
    pub fn eq(field: impl Into<String>, value: impl Into<ScalarValue>) -> Self {
        Filter::FieldEq {
            field: field.into(),
            value: value.into(),
        }
    }

    /// `field IN (values...)`.
    pub fn any_of<V: Into<ScalarValue>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Filter::FieldIn {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Primary key in `keys`.
    pub fn keys(keys: impl IntoIterator<Item = PrimaryKey>) -> Self {
        Filter::KeyIn {
            keys: keys.into_iter().collect(),
        }
    }

    /// Conjunction of `self` and `other`, flattening nested `And`s.
    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (Filter::And { mut filters }, Filter::And { filters: more }) => {
                filters.extend(more);
                Filter::And { filters }
            }
            (Filter::And { mut filters }, f) => {
                filters.push(f);
                Filter::And { filters }
            }
            (a, b) => Filter::And {
                filters: vec![a, b],
            },
        }
    }

    /// Disjunction of `self` and `other`.
    pub fn or(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::Or { mut filters }, f) => {
                filters.push(f);
                Filter::Or { filters }
            }
            (a, b) => Filter::Or {
                filters: vec![a, b],
            },
        }
    }

    /// Returns true when the filter trivially matches every record.
    pub fn is_all(&self) -> bool {
        match self {
            Filter::All => true,
            Filter::And { filters } => filters.iter().all(Filter::is_all),
            _ => false,
        }
    }

    /// Checks every field path referenced by this filter.
    pub fn validate(&self) -> CoreResult<()> {
        match self {
            Filter::All | Filter::KeyIn { .. } => Ok(()),
            Filter::FieldEq { field, .. } | Filter::FieldIn { field, .. } => {
                validate_field_path(field)
            }
            Filter::And { filters } | Filter::Or { filters } => {
                filters.iter().try_for_each(Filter::validate)
            }
        }
    }
}

// =============================================================================
// Sort
// =============================================================================

/// What to order results by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    PrimaryKey,
    Field(String),
}

/// Sort order. Ties on a field sort are broken by primary key ascending so
/// results are deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub field: SortField,
    pub ascending: bool,
}

impl Default for Sort {
    fn default() -> Self {
        Sort::by_key()
    }
}

impl Sort {
    /// Primary key ascending (the reconciler's merge order).
    pub fn by_key() -> Self {
        Sort {
            field: SortField::PrimaryKey,
            ascending: true,
        }
    }

    /// Ascending by a body field.
    pub fn asc(field: impl Into<String>) -> Self {
        Sort {
            field: SortField::Field(field.into()),
            ascending: true,
        }
    }

    /// Descending by a body field.
    pub fn desc(field: impl Into<String>) -> Self {
        Sort {
            field: SortField::Field(field.into()),
            ascending: false,
        }
    }

    fn validate(&self) -> CoreResult<()> {
        match &self.field {
            SortField::PrimaryKey => Ok(()),
            SortField::Field(f) => validate_field_path(f),
        }
    }
}

// =============================================================================
// Query Spec
// =============================================================================

/// A complete read request: filter, sort, optional limit.
///
/// ## Example
/// ```rust
/// use finsync_core::{Filter, QuerySpec, Sort};
///
/// let spec = QuerySpec::new()
///     .filter(Filter::eq("account_id", 42))
///     .sort(Sort::desc("due_date"))
///     .limit(20);
/// assert_eq!(spec.limit, Some(20));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub filter: Filter,
    pub sort: Sort,
    pub limit: Option<u32>,
}

impl QuerySpec {
    /// Every record, primary key ascending.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn sort(mut self, sort: Sort) -> Self {
        self.sort = sort;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Validates filter and sort field paths.
    pub fn validate(&self) -> CoreResult<()> {
        self.filter.validate()?;
        self.sort.validate()
    }
}

// =============================================================================
// Field Paths
// =============================================================================

/// Validates a dotted field path.
pub fn validate_field_path(path: &str) -> CoreResult<()> {
    let valid = !path.is_empty()
        && path.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        });

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidFieldPath(path.to_string()))
    }
}

/// Converts a validated field path into an SQLite JSON path (`$.a.b`).
pub fn json_path(field: &str) -> String {
    format!("$.{}", field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_field_path_validation() {
        assert!(validate_field_path("account_id").is_ok());
        assert!(validate_field_path("amount.currency").is_ok());

        assert!(validate_field_path("").is_err());
        assert!(validate_field_path("a..b").is_err());
        assert!(validate_field_path(".a").is_err());
        assert!(validate_field_path("a'); DROP TABLE records; --").is_err());
        assert!(validate_field_path("a[0]").is_err());
    }

    #[test]
    fn test_and_flattens_and_drops_all() {
        let f = Filter::All.and(Filter::eq("a", 1));
        assert_eq!(f, Filter::eq("a", 1));

        let f = Filter::eq("a", 1).and(Filter::eq("b", 2)).and(Filter::eq("c", 3));
        match f {
            Filter::And { filters } => assert_eq!(filters.len(), 3),
            other => panic!("expected And, got {:?}", other),
        }
    }

    #[test]
    fn test_nested_filter_validation() {
        let f = Filter::eq("ok", 1).or(Filter::any_of("bad field", [1, 2]));
        assert_eq!(
            f.validate(),
            Err(CoreError::InvalidFieldPath("bad field".to_string()))
        );
    }

    #[test]
    fn test_scalar_from_json() {
        let v = serde_json::json!(42);
        assert_eq!(ScalarValue::from_json("n", &v).unwrap(), ScalarValue::Int(42));

        let v = serde_json::json!([1, 2]);
        assert!(ScalarValue::from_json("n", &v).is_err());
    }

    #[test]
    fn test_query_spec_rejects_bad_sort() {
        let spec = QuerySpec::new().sort(Sort::asc("due date"));
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_json_path() {
        assert_eq!(json_path("amount.currency"), "$.amount.currency");
    }
}
