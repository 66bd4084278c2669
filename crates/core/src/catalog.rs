//! The host-facing side of the engine: relation metadata, row values, and
//! the collaborator traits a host implements.
//!
//! The engine never stores rows itself. A host hands it a [`Relation`] and
//! one or two [`Row`]s per call, answers catalog and transaction-state
//! questions, and executes the prepared archive insert.

use serde::{Deserialize, Serialize};

use crate::{Period, Result, Timestamp};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Opaque, stable identity of a table. Survives renames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationId(pub u64);

/// Identity of a top-level transaction; rows carry the id of the
/// transaction that last wrote them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

/// Identity of one transaction nesting level. The top level of a
/// transaction has its own id; each savepoint opens a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubTransactionId(pub u32);

impl std::fmt::Display for RelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A possibly schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QualifiedName {
    pub schema: Option<String>,
    pub name: String,
}

impl QualifiedName {
    pub fn new(schema: Option<&str>, name: &str) -> Self {
        Self {
            schema: schema.map(str::to_string),
            name: name.to_string(),
        }
    }

    /// Parse `name`, `schema.name`, or their double-quoted forms.
    pub fn parse(input: &str) -> Option<Self> {
        let parts = split_identifiers(input)?;
        match parts.as_slice() {
            [name] => Some(Self {
                schema: None,
                name: name.clone(),
            }),
            [schema, name] => Some(Self {
                schema: Some(schema.clone()),
                name: name.clone(),
            }),
            _ => None,
        }
    }

    /// The name rendered for SQL text, quoting where needed.
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_identifier(schema), quote_identifier(&self.name)),
            None => quote_identifier(&self.name),
        }
    }
}

impl std::fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{schema}.{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

fn split_identifiers(input: &str) -> Option<Vec<String>> {
    let mut parts = Vec::new();
    let mut chars = input.trim().chars().peekable();
    loop {
        let mut ident = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            loop {
                match chars.next()? {
                    '"' if chars.peek() == Some(&'"') => {
                        chars.next();
                        ident.push('"');
                    }
                    '"' => break,
                    c => ident.push(c),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == '.' {
                    break;
                }
                ident.extend(c.to_lowercase());
                chars.next();
            }
            ident = ident.trim().to_string();
        }
        if ident.is_empty() {
            return None;
        }
        parts.push(ident);
        match chars.next() {
            None => return Some(parts),
            Some('.') => continue,
            Some(_) => return None,
        }
    }
}

/// Double-quote an identifier unless it is a plain lower-case word.
pub fn quote_identifier(ident: &str) -> String {
    let plain = ident
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && ident
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if plain {
        ident.to_string()
    } else {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
}

// ---------------------------------------------------------------------------
// Types and layouts
// ---------------------------------------------------------------------------

/// Column data types known to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Integer,
    BigInt,
    Double,
    Numeric,
    Text,
    Varchar,
    Timestamp,
    Timestamptz,
    Date,
    Range(Box<DataType>),
}

impl DataType {
    /// `tstzrange`, the only valid system period type.
    pub fn tstzrange() -> Self {
        DataType::Range(Box::new(DataType::Timestamptz))
    }

    pub fn range_subtype(&self) -> Option<&DataType> {
        match self {
            DataType::Range(subtype) => Some(subtype),
            _ => None,
        }
    }

    /// Render with a type modifier, e.g. `character varying(20)`.
    pub fn display_with_modifier(&self, modifier: Option<u32>) -> String {
        match modifier {
            Some(m) => format!("{self}({m})"),
            None => self.to_string(),
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::Boolean => write!(f, "boolean"),
            DataType::Integer => write!(f, "integer"),
            DataType::BigInt => write!(f, "bigint"),
            DataType::Double => write!(f, "double precision"),
            DataType::Numeric => write!(f, "numeric"),
            DataType::Text => write!(f, "text"),
            DataType::Varchar => write!(f, "character varying"),
            DataType::Timestamp => write!(f, "timestamp without time zone"),
            DataType::Timestamptz => write!(f, "timestamp with time zone"),
            DataType::Date => write!(f, "date"),
            DataType::Range(subtype) => match subtype.as_ref() {
                DataType::Timestamptz => write!(f, "tstzrange"),
                DataType::Timestamp => write!(f, "tsrange"),
                DataType::Date => write!(f, "daterange"),
                DataType::Integer => write!(f, "int4range"),
                DataType::BigInt => write!(f, "int8range"),
                DataType::Numeric => write!(f, "numrange"),
                other => write!(f, "range of {other}"),
            },
        }
    }
}

/// One column of a table, including dropped ones: positions never shift.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub data_type: DataType,
    /// Array dimensions; `0` for scalars.
    pub dimensions: u16,
    /// Type modifier such as a varchar length.
    pub modifier: Option<u32>,
    pub dropped: bool,
}

impl Attribute {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            dimensions: 0,
            modifier: None,
            dropped: false,
        }
    }

    pub fn with_modifier(mut self, modifier: u32) -> Self {
        self.modifier = Some(modifier);
        self
    }

    pub fn with_dimensions(mut self, dimensions: u16) -> Self {
        self.dimensions = dimensions;
        self
    }

    /// Same type, dimensionality and modifier.
    pub fn same_type_as(&self, other: &Attribute) -> bool {
        self.data_type == other.data_type
            && self.dimensions == other.dimensions
            && self.modifier == other.modifier
    }

    pub fn type_display(&self) -> String {
        let base = self.data_type.display_with_modifier(self.modifier);
        format!("{base}{}", "[]".repeat(self.dimensions as usize))
    }
}

/// Ordered column layout of a table. Equality is structural.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TupleLayout {
    attributes: Vec<Attribute>,
}

impl TupleLayout {
    pub fn new(attributes: Vec<Attribute>) -> Self {
        Self { attributes }
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut Vec<Attribute> {
        &mut self.attributes
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Zero-based position of the live (non-dropped) column named `name`.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.attributes
            .iter()
            .position(|a| !a.dropped && a.name == name)
    }

    pub fn attribute(&self, position: usize) -> Option<&Attribute> {
        self.attributes.get(position)
    }
}

/// A table as seen by the engine at the moment of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub id: RelationId,
    pub name: QualifiedName,
    pub layout: TupleLayout,
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// A single column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Text(String),
    Timestamp(Timestamp),
    Period(Period),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_period(&self) -> Option<&Period> {
        match self {
            Value::Period(p) => Some(p),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}
impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}
impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Double(n)
    }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}
impl From<Timestamp> for Value {
    fn from(t: Timestamp) -> Self {
        Value::Timestamp(t)
    }
}
impl From<Period> for Value {
    fn from(p: Period) -> Self {
        Value::Period(p)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Integer(n) => write!(f, "{n}"),
            Value::Double(n) => write!(f, "{n}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Timestamp(t) => write!(f, "{t}"),
            Value::Period(p) => write!(f, "{p}"),
        }
    }
}

/// A row version: positional values plus its origin marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Value>,
    /// Transaction that wrote this version.
    pub origin: TransactionId,
}

impl Row {
    pub fn new(values: Vec<Value>, origin: TransactionId) -> Self {
        Self { values, origin }
    }

    /// Value at `position`; positions past the end read as null.
    pub fn get(&self, position: usize) -> &Value {
        static NULL: Value = Value::Null;
        self.values.get(position).unwrap_or(&NULL)
    }

    /// A copy of this row with one column replaced.
    pub fn with_value(&self, position: usize, value: Value) -> Row {
        let mut row = self.clone();
        row.set(position, value);
        row
    }

    pub fn set(&mut self, position: usize, value: Value) {
        if self.values.len() <= position {
            self.values.resize(position + 1, Value::Null);
        }
        self.values[position] = value;
    }
}

// ---------------------------------------------------------------------------
// Archive statement
// ---------------------------------------------------------------------------

/// `INSERT INTO <history> (<cols>) VALUES ($1, ...)` over the columns shared
/// by a main table and its history table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertStatement {
    pub target: RelationId,
    pub target_name: QualifiedName,
    /// Column names in parameter order, with their history-side types.
    pub columns: Vec<(String, DataType)>,
}

impl InsertStatement {
    pub fn sql(&self) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|(name, _)| quote_identifier(name))
            .collect();
        let params: Vec<String> = (1..=self.columns.len()).map(|i| format!("${i}")).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.target_name.quoted(),
            columns.join(", "),
            params.join(", ")
        )
    }
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Table metadata lookup.
pub trait Catalog {
    /// Resolve a table by name. Unqualified names use the host's default
    /// schema. `Ok(None)` when no such table exists.
    fn relation_by_name(&self, name: &QualifiedName) -> Result<Option<Relation>>;
}

/// What the engine needs to know about the calling transaction.
pub trait TransactionState {
    fn current_transaction(&self) -> TransactionId;

    /// The innermost open nesting level.
    fn current_subtransaction(&self) -> SubTransactionId;

    /// Start instant of the current top-level transaction.
    fn transaction_start(&self) -> Timestamp;

    /// Whether a row with origin `origin` was written by the current
    /// transaction (any of its levels).
    fn is_current_transaction(&self, origin: TransactionId) -> bool {
        origin == self.current_transaction()
    }
}

/// Executes the archive insert.
///
/// A `Plan` is a prepared statement handle. The engine's relation cache owns
/// plans and hands each one back through [`StatementBackend::release`]
/// before rebuilding or discarding it.
pub trait StatementBackend {
    type Plan;

    fn prepare(&mut self, statement: &InsertStatement) -> Result<Self::Plan>;

    /// Run `plan` with one value per statement column.
    fn execute(&mut self, plan: &Self::Plan, args: &[Value]) -> Result<()>;

    fn release(&mut self, plan: Self::Plan) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_qualified_names() {
        assert_eq!(
            QualifiedName::parse("employees_history"),
            Some(QualifiedName::new(None, "employees_history"))
        );
        assert_eq!(
            QualifiedName::parse("hr.Employees_History"),
            Some(QualifiedName::new(Some("hr"), "employees_history")),
            "unquoted identifiers fold to lower case"
        );
        assert_eq!(
            QualifiedName::parse("\"Audit\".\"odd\"\"name\""),
            Some(QualifiedName::new(Some("Audit"), "odd\"name"))
        );
        assert_eq!(QualifiedName::parse("a.b.c"), None);
        assert_eq!(QualifiedName::parse(""), None);
        assert_eq!(QualifiedName::parse("a."), None);
    }

    #[test]
    fn insert_statement_renders_quoted_sql() {
        let stmt = InsertStatement {
            target: RelationId(7),
            target_name: QualifiedName::new(Some("public"), "Employees History"),
            columns: vec![
                ("name".into(), DataType::Text),
                ("Salary".into(), DataType::Integer),
                ("sys_period".into(), DataType::tstzrange()),
            ],
        };
        assert_eq!(
            stmt.sql(),
            "INSERT INTO public.\"Employees History\" (name, \"Salary\", sys_period) VALUES ($1, $2, $3)"
        );
    }

    #[test]
    fn layout_position_skips_dropped_columns() {
        let mut dropped = Attribute::new("salary", DataType::Integer);
        dropped.dropped = true;
        let layout = TupleLayout::new(vec![
            Attribute::new("name", DataType::Text),
            dropped,
            Attribute::new("salary", DataType::BigInt),
        ]);
        assert_eq!(layout.position("name"), Some(0));
        assert_eq!(layout.position("salary"), Some(2));
        assert_eq!(layout.position("missing"), None);
    }

    #[test]
    fn attribute_type_display_includes_modifier_and_dimensions() {
        let attr = Attribute::new("tags", DataType::Varchar)
            .with_modifier(20)
            .with_dimensions(1);
        assert_eq!(attr.type_display(), "character varying(20)[]");
        assert_eq!(DataType::tstzrange().to_string(), "tstzrange");
    }

    #[test]
    fn row_reads_past_end_as_null() {
        let mut row = Row::new(vec![Value::from("a")], TransactionId(1));
        assert!(row.get(3).is_null());
        row.set(2, Value::Integer(5));
        assert_eq!(row.values.len(), 3);
        assert!(row.get(1).is_null());
    }
}
