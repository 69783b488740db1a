//! Field-Coded Value Types
//!
//! Value objects shared by the query and push protocols: request handles,
//! field codes, comma-joined output lists, paging parameters and the
//! string-keyed field maps carried by structured push blocks.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

/// Upper bound on rows requested by a single paged query.
pub const MAX_REQUEST_COUNT: u16 = 9999;

// =============================================================================
// Errors
// =============================================================================

/// Errors produced while parsing field-coded values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldParseError {
    /// Field code was empty.
    #[error("field code cannot be empty")]
    EmptyCode,
    /// Field code contained a separator character.
    #[error("field code {0:?} contains a separator")]
    InvalidCode(String),
    /// A `code=value` pair had no `=`.
    #[error("expected code=value, got {0:?}")]
    MissingValue(String),
    /// Request count above the terminal's limit.
    #[error("request count {0} exceeds {MAX_REQUEST_COUNT}")]
    CountTooLarge(u32),
    /// Unknown paging mode.
    #[error("unknown paging mode {0:?}")]
    UnknownPagingMode(String),
}

// =============================================================================
// Request Handle
// =============================================================================

/// Opaque handle identifying one query transaction with the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RequestId(i64);

impl RequestId {
    /// Wrap a raw terminal handle.
    #[must_use]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// Raw terminal handle.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Field Codes
// =============================================================================

/// Terminal-defined key for one queryable or pushable attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct FieldCode(String);

impl FieldCode {
    /// Validate and wrap a field code.
    ///
    /// # Errors
    ///
    /// Returns an error if the code is empty or contains `,`, `=`, `|` or
    /// whitespace.
    pub fn new(code: impl Into<String>) -> Result<Self, FieldParseError> {
        let code = code.into();
        if code.is_empty() {
            return Err(FieldParseError::EmptyCode);
        }
        if code
            .chars()
            .any(|c| c == ',' || c == '=' || c == '|' || c.is_whitespace())
        {
            return Err(FieldParseError::InvalidCode(code));
        }
        Ok(Self(code))
    }

    /// The code as sent to the terminal.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FieldCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for FieldCode {
    type Err = FieldParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.trim())
    }
}

/// One `(code, value)` input applied to a request, in caller order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInput {
    /// Field code.
    pub code: FieldCode,
    /// Value to encode.
    pub value: String,
}

impl FieldInput {
    /// Create an input pair.
    #[must_use]
    pub fn new(code: FieldCode, value: impl Into<String>) -> Self {
        Self {
            code,
            value: value.into(),
        }
    }

    /// Parse a comma-separated `code=value` list, preserving order.
    ///
    /// # Errors
    ///
    /// Returns an error if any entry lacks `=` or has an invalid code.
    pub fn parse_list(text: &str) -> Result<Vec<Self>, FieldParseError> {
        text.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let (code, value) = entry
                    .split_once('=')
                    .ok_or_else(|| FieldParseError::MissingValue(entry.to_string()))?;
                Ok(Self::new(code.parse()?, value.trim()))
            })
            .collect()
    }
}

/// Ordered list of output field codes, sent comma-joined.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldList(Vec<FieldCode>);

impl FieldList {
    /// Build from codes in output order.
    #[must_use]
    pub const fn new(codes: Vec<FieldCode>) -> Self {
        Self(codes)
    }

    /// Codes in output order.
    #[must_use]
    pub fn codes(&self) -> &[FieldCode] {
        &self.0
    }

    /// Whether no codes are listed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for FieldList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, code) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(code.as_str())?;
        }
        Ok(())
    }
}

impl FromStr for FieldList {
    type Err = FieldParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .map(FieldCode::new)
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

// =============================================================================
// Paging
// =============================================================================

/// Continuous-query classification sent with a paged request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PagingMode {
    /// Plain query.
    Normal,
    /// First page of a continuous query.
    #[default]
    First,
    /// Backward continuation.
    Backward,
    /// Next page, using the cursor from the previous response.
    Next,
}

impl PagingMode {
    /// Wire value for the terminal.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "0",
            Self::First => "1",
            Self::Backward => "2",
            Self::Next => "3",
        }
    }
}

impl FromStr for PagingMode {
    type Err = FieldParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "0" => Ok(Self::Normal),
            "1" => Ok(Self::First),
            "2" => Ok(Self::Backward),
            "3" => Ok(Self::Next),
            other => Err(FieldParseError::UnknownPagingMode(other.to_string())),
        }
    }
}

/// Opaque continuation token; empty on a first request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PagingCursor(String);

impl PagingCursor {
    /// Wrap a continuation token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The token text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Screen identifier reused across requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenSlot(String);

impl ScreenSlot {
    /// Wrap a screen identifier.
    #[must_use]
    pub fn new(slot: impl Into<String>) -> Self {
        Self(slot.into())
    }

    /// The identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ScreenSlot {
    fn default() -> Self {
        Self("9999".to_string())
    }
}

/// Number of rows requested, bounded by [`MAX_REQUEST_COUNT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestCount(u16);

impl RequestCount {
    /// The largest count the terminal accepts.
    pub const MAX: Self = Self(MAX_REQUEST_COUNT);

    /// Validate a row count.
    ///
    /// # Errors
    ///
    /// Returns an error if `count` exceeds [`MAX_REQUEST_COUNT`].
    pub fn new(count: u32) -> Result<Self, FieldParseError> {
        u16::try_from(count)
            .ok()
            .filter(|c| *c <= MAX_REQUEST_COUNT)
            .map(Self)
            .ok_or(FieldParseError::CountTooLarge(count))
    }

    /// The count.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl Default for RequestCount {
    fn default() -> Self {
        Self::MAX
    }
}

// =============================================================================
// Field Maps
// =============================================================================

/// String-keyed field values, as carried by a structured push block.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct FieldMap(BTreeMap<FieldCode, String>);

impl FieldMap {
    /// Empty map.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Parse whitespace-separated `code=value` tokens.
    ///
    /// # Errors
    ///
    /// Returns an error if a token lacks `=` or carries an invalid code.
    pub fn parse(text: &str) -> Result<Self, FieldParseError> {
        let mut map = Self::new();
        for token in text.split_whitespace() {
            let (code, value) = token
                .split_once('=')
                .ok_or_else(|| FieldParseError::MissingValue(token.to_string()))?;
            map.insert(code.parse()?, value);
        }
        Ok(map)
    }

    /// Set a field, replacing any previous value.
    pub fn insert(&mut self, code: FieldCode, value: impl Into<String>) {
        self.0.insert(code, value.into());
    }

    /// Value of a field, if present.
    #[must_use]
    pub fn get(&self, code: &FieldCode) -> Option<&str> {
        self.0.get(code).map(String::as_str)
    }

    /// Whether the map holds no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A completed query response, decoded lazily per `(code, row)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldResponse {
    /// Request the response belongs to.
    pub request_id: RequestId,
    /// Rows available.
    pub row_count: usize,
}

/// One decoded response row, values in output-list order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedRow {
    /// Row index within the response.
    pub index: usize,
    /// `(code, value)` pairs in output-list order.
    pub values: Vec<(FieldCode, String)>,
}

impl DecodedRow {
    /// Value for a code, if it was decoded.
    #[must_use]
    pub fn get(&self, code: &FieldCode) -> Option<&str> {
        self.values
            .iter()
            .find(|(c, _)| c == code)
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("" => Err(FieldParseError::EmptyCode); "empty")]
    #[test_case("9001" => Ok("9001".to_string()); "numeric")]
    #[test_case("GID" => Ok("GID".to_string()); "alpha")]
    #[test_case("8,9" => Err(FieldParseError::InvalidCode("8,9".to_string())); "comma")]
    #[test_case("a b" => Err(FieldParseError::InvalidCode("a b".to_string())); "space")]
    fn field_code_validation(raw: &str) -> Result<String, FieldParseError> {
        FieldCode::new(raw).map(|c| c.as_str().to_string())
    }

    #[test]
    fn field_list_round_trips_comma_joined() {
        let list: FieldList = "8, 9,30,666".parse().unwrap();
        assert_eq!(list.codes().len(), 4);
        assert_eq!(list.to_string(), "8,9,30,666");
    }

    #[test]
    fn field_inputs_preserve_order() {
        let inputs = FieldInput::parse_list("9001=FX,9002=D05GBP/AUD,GID=1003,9119=1").unwrap();
        let codes: Vec<_> = inputs.iter().map(|i| i.code.as_str()).collect();
        assert_eq!(codes, ["9001", "9002", "GID", "9119"]);
        assert_eq!(inputs[1].value, "D05GBP/AUD");
    }

    #[test]
    fn field_inputs_reject_missing_value() {
        let err = FieldInput::parse_list("9001=FX,9002").unwrap_err();
        assert_eq!(err, FieldParseError::MissingValue("9002".to_string()));
    }

    #[test_case("0" => PagingMode::Normal)]
    #[test_case("1" => PagingMode::First)]
    #[test_case("2" => PagingMode::Backward)]
    #[test_case(" 3 " => PagingMode::Next)]
    fn paging_mode_parsing(raw: &str) -> PagingMode {
        raw.parse().unwrap()
    }

    #[test]
    fn request_count_bounds() {
        assert_eq!(RequestCount::new(9999).unwrap().get(), 9999);
        assert_eq!(RequestCount::new(0).unwrap().get(), 0);
        assert_eq!(
            RequestCount::new(10_000),
            Err(FieldParseError::CountTooLarge(10_000))
        );
        assert_eq!(
            RequestCount::new(u32::MAX),
            Err(FieldParseError::CountTooLarge(u32::MAX))
        );
    }

    #[test]
    fn field_map_parses_pairs() {
        let map = FieldMap::parse("ID=42  SRC=fx").unwrap();
        assert_eq!(map.get(&FieldCode::new("ID").unwrap()), Some("42"));
        assert_eq!(map.get(&FieldCode::new("SRC").unwrap()), Some("fx"));
        assert!(FieldMap::parse("").unwrap().is_empty());
        assert!(FieldMap::parse("ID").is_err());
    }

    #[test]
    fn decoded_row_lookup() {
        let time = FieldCode::new("8").unwrap();
        let row = DecodedRow {
            index: 0,
            values: vec![(time.clone(), "093015".to_string())],
        };
        assert_eq!(row.get(&time), Some("093015"));
        assert_eq!(row.get(&FieldCode::new("9").unwrap()), None);
    }
}
