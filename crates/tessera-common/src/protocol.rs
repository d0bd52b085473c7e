//! Request and response documents exchanged over the framed TCP protocol
//!
//! A request frame carries one [`Command`]; the matching response frame carries
//! exactly one [`CommandResult`]. Both are serialized as JSON documents and
//! optionally compressed as a whole (see [`crate::codec`]).

use crate::descriptor::ConnectionDescriptor;
use crate::error::TesseraError;
use serde::{Deserialize, Serialize};

/// How a query's rows are returned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultMode {
    /// Whole result in one response
    #[default]
    Snapshot,
    /// Server-side cursor, paged across round-trips
    Cursor,
}

/// Per-command execution options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionOptions {
    pub result_mode: ResultMode,
    /// Rows per cursor page; the server default applies when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch_size: Option<usize>,
    /// Truncate snapshot results after this many rows
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_rows: Option<usize>,
    /// Execution-phase timeout override, capped by the server limit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl ExecutionOptions {
    pub fn cursor(fetch_size: usize) -> Self {
        Self {
            result_mode: ResultMode::Cursor,
            fetch_size: Some(fetch_size),
            ..Default::default()
        }
    }
}

/// One client request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    /// Connection descriptor string
    pub connection: String,
    /// Free-form command text, matched against registered patterns
    pub text: String,
    #[serde(default)]
    pub options: ExecutionOptions,
}

impl Command {
    pub fn new(descriptor: &ConnectionDescriptor, text: impl Into<String>) -> Self {
        Self {
            connection: descriptor.to_string(),
            text: text.into(),
            options: ExecutionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    /// Parse the embedded connection descriptor
    pub fn descriptor(&self) -> Result<ConnectionDescriptor, TesseraError> {
        ConnectionDescriptor::parse(&self.connection)
    }
}

/// Kind tag of a [`CommandResult`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Snapshot,
    CursorOpened,
    CursorPage,
    Ack,
    Error,
}

/// Response to exactly one [`Command`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub command_name: String,
    pub kind: ResultKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rowset: Option<Rowset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_more: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
}

impl CommandResult {
    fn empty(command_name: impl Into<String>, kind: ResultKind) -> Self {
        Self {
            command_name: command_name.into(),
            kind,
            error_message: None,
            rowset: None,
            cursor_id: None,
            has_more: None,
            rows_affected: None,
        }
    }

    pub fn error(command_name: impl Into<String>, message: impl Into<String>) -> Self {
        let mut result = Self::empty(command_name, ResultKind::Error);
        result.error_message = Some(message.into());
        result
    }

    pub fn from_error(command_name: impl Into<String>, err: &TesseraError) -> Self {
        Self::error(command_name, err.to_string())
    }

    pub fn ack(command_name: impl Into<String>, rows_affected: Option<u64>) -> Self {
        let mut result = Self::empty(command_name, ResultKind::Ack);
        result.rows_affected = rows_affected;
        result
    }

    pub fn snapshot(command_name: impl Into<String>, rowset: Rowset, has_more: bool) -> Self {
        let mut result = Self::empty(command_name, ResultKind::Snapshot);
        result.rowset = Some(rowset);
        result.has_more = Some(has_more);
        result
    }

    pub fn cursor_opened(
        command_name: impl Into<String>,
        cursor_id: impl Into<String>,
        first_page: Rowset,
        has_more: bool,
    ) -> Self {
        let mut result = Self::empty(command_name, ResultKind::CursorOpened);
        result.cursor_id = Some(cursor_id.into());
        result.rowset = Some(first_page);
        result.has_more = Some(has_more);
        result
    }

    pub fn cursor_page(
        command_name: impl Into<String>,
        cursor_id: impl Into<String>,
        page: Rowset,
        has_more: bool,
    ) -> Self {
        let mut result = Self::empty(command_name, ResultKind::CursorPage);
        result.cursor_id = Some(cursor_id.into());
        result.rowset = Some(page);
        result.has_more = Some(has_more);
        result
    }

    pub fn is_error(&self) -> bool {
        self.kind == ResultKind::Error
    }

    /// Drop the payload, keeping name and identifiers (used for oversize fallback)
    pub fn stripped_to_error(&self, message: impl Into<String>) -> Self {
        let mut result = Self::error(self.command_name.clone(), message);
        result.cursor_id = self.cursor_id.clone();
        result
    }
}

/// Declared column type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Blob,
    Boolean,
    Numeric,
    DateTime,
    /// Expression columns with no declared type
    Any,
}

/// Column definition of a rowset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            max_length: None,
        }
    }
}

/// A typed scalar cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum Value {
    Null,
    Integer(i64),
    Real(#[serde(with = "real_number")] f64),
    Text(String),
    Blob(#[serde(with = "base64_bytes")] Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

/// One row, aligned to the rowset's columns
pub type Row = Vec<Value>;

/// Ordered columns plus ordered rows
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rowset {
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Row>,
}

impl Rowset {
    pub fn new(columns: Vec<ColumnDef>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    /// Single text column listing, used by the SHOW commands
    pub fn from_names(column: &str, names: impl IntoIterator<Item = String>) -> Self {
        let mut def = ColumnDef::new(column, ColumnType::Text);
        def.nullable = false;
        Self {
            columns: vec![def],
            rows: names.into_iter().map(|n| vec![Value::Text(n)]).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Finite reals as JSON numbers; infinities and NaN as string tokens, since
/// JSON has no literal for them
mod real_number {
    use serde::{Deserialize, Deserializer, Serializer};

    const INFINITY: &str = "Infinity";
    const NEG_INFINITY: &str = "-Infinity";
    const NAN: &str = "NaN";

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Token(String),
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else if value.is_nan() {
            serializer.serialize_str(NAN)
        } else if value.is_sign_positive() {
            serializer.serialize_str(INFINITY)
        } else {
            serializer.serialize_str(NEG_INFINITY)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(value),
            Repr::Token(token) => match token.as_str() {
                INFINITY => Ok(f64::INFINITY),
                NEG_INFINITY => Ok(f64::NEG_INFINITY),
                NAN => Ok(f64::NAN),
                other => Err(serde::de::Error::custom(format!("invalid real value '{}'", other))),
            },
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
