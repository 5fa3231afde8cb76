//! Query and mutation specs shared verbatim by every connector.
//!
//! Construction validates everything that can be checked without I/O:
//! operators, operand shapes, filter nesting depth and pagination bounds.

use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use super::value::{Record, Value};
use crate::error::{DataError, Result};

/// Maximum nesting depth of a filter tree. A top-level list has depth 1.
pub const MAX_FILTER_DEPTH: usize = 10;

/// Comparison operator of a leaf condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    In,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Like => "like",
            Operator::In => "in",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eq" | "=" | "==" => Ok(Operator::Eq),
            "ne" | "!=" | "<>" => Ok(Operator::Ne),
            "gt" | ">" => Ok(Operator::Gt),
            "gte" | ">=" => Ok(Operator::Gte),
            "lt" | "<" => Ok(Operator::Lt),
            "lte" | "<=" => Ok(Operator::Lte),
            "like" => Ok(Operator::Like),
            "in" => Ok(Operator::In),
            _ => Err(DataError::InvalidOperator(s.to_string())),
        }
    }
}

impl Serialize for Operator {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Right-hand side of a condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    List(Vec<Value>),
    Scalar(Value),
}

impl From<Value> for Operand {
    fn from(v: Value) -> Self {
        Operand::Scalar(v)
    }
}

impl From<Vec<Value>> for Operand {
    fn from(v: Vec<Value>) -> Self {
        Operand::List(v)
    }
}

impl From<&str> for Operand {
    fn from(v: &str) -> Self {
        Operand::Scalar(Value::from(v))
    }
}

impl From<i64> for Operand {
    fn from(v: i64) -> Self {
        Operand::Scalar(Value::Integer(v))
    }
}

/// Leaf predicate: `field op value`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Condition {
    field: String,
    op: Operator,
    value: Operand,
}

impl Condition {
    pub fn new(field: impl Into<String>, op: Operator, value: impl Into<Operand>) -> Result<Self> {
        let field = field.into();
        let value = value.into();

        if field.trim().is_empty() {
            return Err(DataError::QuerySyntax("condition field must not be empty".into()));
        }

        match (op, &value) {
            (Operator::In, Operand::List(items)) if items.is_empty() => {
                return Err(DataError::QuerySyntax("`in` requires a non-empty list".into()));
            }
            (Operator::In, Operand::List(items)) if items.iter().any(Value::is_null) => {
                return Err(DataError::QuerySyntax("`in` list must not contain null".into()));
            }
            (Operator::In, Operand::List(_)) => {}
            (Operator::In, Operand::Scalar(_)) => {
                return Err(DataError::QuerySyntax("`in` requires a list operand".into()));
            }
            (op, Operand::List(_)) => {
                return Err(DataError::QuerySyntax(format!("`{op}` requires a single value")));
            }
            (Operator::Like, Operand::Scalar(Value::Text(_))) => {}
            (Operator::Like, Operand::Scalar(_)) => {
                return Err(DataError::QuerySyntax("`like` requires a text pattern".into()));
            }
            (Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte, Operand::Scalar(Value::Null)) => {
                return Err(DataError::QuerySyntax(format!("`{op}` cannot compare against null")));
            }
            _ => {}
        }

        Ok(Self { field, op, value })
    }

    /// Build a condition from an operator name or symbol.
    pub fn parse(field: impl Into<String>, op: &str, value: impl Into<Operand>) -> Result<Self> {
        Self::new(field, op.parse()?, value)
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Result<Self> {
        Self::new(field, Operator::Eq, Operand::Scalar(value.into()))
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn op(&self) -> Operator {
        self.op
    }

    pub fn value(&self) -> &Operand {
        &self.value
    }
}

/// How the children of a condition list are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Combinator {
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

/// Child of a condition list.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FilterNode {
    Condition(Condition),
    List(ConditionList),
}

impl From<Condition> for FilterNode {
    fn from(c: Condition) -> Self {
        FilterNode::Condition(c)
    }
}

impl From<ConditionList> for FilterNode {
    fn from(l: ConditionList) -> Self {
        FilterNode::List(l)
    }
}

/// Recursive filter tree, at most [`MAX_FILTER_DEPTH`] lists deep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionList {
    combinator: Combinator,
    children: Vec<FilterNode>,
    #[serde(skip)]
    depth: usize,
}

impl ConditionList {
    pub fn new(combinator: Combinator, children: Vec<FilterNode>) -> Result<Self> {
        if children.is_empty() {
            return Err(DataError::QuerySyntax("condition list must not be empty".into()));
        }

        let depth = 1 + children
            .iter()
            .map(|child| match child {
                FilterNode::List(list) => list.depth,
                FilterNode::Condition(_) => 0,
            })
            .max()
            .unwrap_or(0);

        if depth > MAX_FILTER_DEPTH {
            return Err(DataError::MaxDepthExceeded {
                depth,
                max: MAX_FILTER_DEPTH,
            });
        }

        Ok(Self {
            combinator,
            children,
            depth,
        })
    }

    pub fn and(children: Vec<FilterNode>) -> Result<Self> {
        Self::new(Combinator::And, children)
    }

    pub fn or(children: Vec<FilterNode>) -> Result<Self> {
        Self::new(Combinator::Or, children)
    }

    pub fn combinator(&self) -> Combinator {
        self.combinator
    }

    pub fn children(&self) -> &[FilterNode] {
        &self.children
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// Sort direction of an order item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub field: String,
    #[serde(default)]
    pub direction: Direction,
}

impl OrderItem {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Desc,
        }
    }
}

/// Caps applied when building a [`QuerySpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryLimits {
    /// Largest accepted `limit`.
    pub max_limit: u32,
    /// Largest accepted `offset`.
    pub max_offset: u64,
    /// `limit` used when the caller does not provide one.
    pub default_limit: u32,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            max_limit: 10_000,
            max_offset: 10_000_000,
            default_limit: 100,
        }
    }
}

/// Backend-neutral description of a read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawQuerySpec")]
pub struct QuerySpec {
    filter: Option<ConditionList>,
    order: Vec<OrderItem>,
    limit: u32,
    offset: u64,
}

impl Default for QuerySpec {
    fn default() -> Self {
        Self {
            filter: None,
            order: Vec::new(),
            limit: QueryLimits::default().default_limit,
            offset: 0,
        }
    }
}

impl QuerySpec {
    pub fn builder() -> QuerySpecBuilder {
        QuerySpecBuilder::default()
    }

    /// Parse and validate a JSON query spec with the default limits.
    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_json_with(json, &QueryLimits::default())
    }

    /// Parse and validate a JSON query spec.
    ///
    /// Operator, depth and range violations surface as their specific error
    /// variants rather than a generic parse failure.
    pub fn from_json_with(json: &str, limits: &QueryLimits) -> Result<Self> {
        let raw: RawQuerySpec = serde_json::from_str(json)
            .map_err(|e| DataError::QuerySyntax(format!("malformed query spec: {e}")))?;
        raw.into_spec(limits)
    }

    pub fn filter(&self) -> Option<&ConditionList> {
        self.filter.as_ref()
    }

    pub fn order(&self) -> &[OrderItem] {
        &self.order
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// Builder for [`QuerySpec`]; validation happens in [`QuerySpecBuilder::build`].
#[derive(Debug, Default)]
pub struct QuerySpecBuilder {
    filter: Option<ConditionList>,
    order: Vec<OrderItem>,
    limit: Option<i64>,
    offset: i64,
}

impl QuerySpecBuilder {
    pub fn filter(mut self, filter: ConditionList) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn order_by(mut self, item: OrderItem) -> Self {
        self.order.push(item);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    pub fn build(self) -> Result<QuerySpec> {
        self.build_with(&QueryLimits::default())
    }

    pub fn build_with(self, limits: &QueryLimits) -> Result<QuerySpec> {
        let limit = self.limit.unwrap_or(i64::from(limits.default_limit));
        if limit < 0 || limit > i64::from(limits.max_limit) {
            return Err(DataError::InvalidRange {
                field: "limit",
                value: limit,
                max: u64::from(limits.max_limit),
            });
        }

        let max_offset = i64::try_from(limits.max_offset).unwrap_or(i64::MAX);
        if self.offset < 0 || self.offset > max_offset {
            return Err(DataError::InvalidRange {
                field: "offset",
                value: self.offset,
                max: limits.max_offset,
            });
        }

        if let Some(item) = self.order.iter().find(|o| o.field.trim().is_empty()) {
            return Err(DataError::QuerySyntax(format!(
                "order field must not be empty (direction {:?})",
                item.direction
            )));
        }

        Ok(QuerySpec {
            filter: self.filter,
            order: self.order,
            limit: limit as u32,
            offset: self.offset as u64,
        })
    }
}

/// Unvalidated wire shape of a query spec.
#[derive(Debug, Deserialize)]
struct RawQuerySpec {
    #[serde(default)]
    filter: Option<RawFilter>,
    #[serde(default)]
    order: Vec<OrderItem>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: i64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawFilter {
    Condition {
        field: String,
        op: String,
        value: Operand,
    },
    List {
        combinator: Combinator,
        children: Vec<RawFilter>,
    },
}

impl RawFilter {
    fn build(self, level: usize) -> Result<FilterNode> {
        match self {
            RawFilter::Condition { field, op, value } => {
                Condition::parse(field, &op, value).map(FilterNode::Condition)
            }
            RawFilter::List {
                combinator,
                children,
            } => {
                // Reject before recursing further into adversarial input.
                if level > MAX_FILTER_DEPTH {
                    return Err(DataError::MaxDepthExceeded {
                        depth: level,
                        max: MAX_FILTER_DEPTH,
                    });
                }
                let children = children
                    .into_iter()
                    .map(|child| child.build(level + 1))
                    .collect::<Result<Vec<_>>>()?;
                ConditionList::new(combinator, children).map(FilterNode::List)
            }
        }
    }
}

impl RawQuerySpec {
    fn into_spec(self, limits: &QueryLimits) -> Result<QuerySpec> {
        let mut builder = QuerySpec::builder().offset(self.offset);
        if let Some(limit) = self.limit {
            builder = builder.limit(limit);
        }
        for item in self.order {
            builder = builder.order_by(item);
        }
        if let Some(raw) = self.filter {
            let filter = match raw.build(1)? {
                FilterNode::List(list) => list,
                condition @ FilterNode::Condition(_) => ConditionList::and(vec![condition])?,
            };
            builder = builder.filter(filter);
        }
        builder.build_with(limits)
    }
}

impl TryFrom<RawQuerySpec> for QuerySpec {
    type Error = DataError;

    fn try_from(raw: RawQuerySpec) -> Result<Self> {
        raw.into_spec(&QueryLimits::default())
    }
}

/// Values for a new row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InsertSpec {
    values: Record,
}

impl InsertSpec {
    pub fn new<K, V, I>(values: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            values: values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn values(&self) -> &Record {
        &self.values
    }
}

/// New values for the row identified by its primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateSpec {
    key: Value,
    values: Record,
}

impl UpdateSpec {
    pub fn new<K, V, I>(key: impl Into<Value>, values: I) -> Result<Self>
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let key = key.into();
        if key.is_null() {
            return Err(DataError::QuerySyntax("update key must not be null".into()));
        }
        let values: Record = values
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        if values.is_empty() {
            return Err(DataError::QuerySyntax(
                "update requires at least one column value".into(),
            ));
        }
        Ok(Self { key, values })
    }

    pub fn key(&self) -> &Value {
        &self.key
    }

    pub fn values(&self) -> &Record {
        &self.values
    }

    /// Same values retargeted at another key representation of the same row.
    pub(crate) fn with_key(mut self, key: Value) -> Self {
        self.key = key;
        self
    }
}

/// Row to delete, identified by its primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteSpec {
    key: Value,
}

impl DeleteSpec {
    pub fn new(key: impl Into<Value>) -> Result<Self> {
        let key = key.into();
        if key.is_null() {
            return Err(DataError::QuerySyntax("delete key must not be null".into()));
        }
        Ok(Self { key })
    }

    pub fn key(&self) -> &Value {
        &self.key
    }
}
