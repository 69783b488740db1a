//! Push Transactions
//!
//! Raw push payloads as delivered by the terminal, the normalized
//! [`Transaction`] record handed to consumers, and the 14-digit date-time
//! sequence format the terminal stamps them with.

use std::fmt;

use chrono::{NaiveDateTime, Timelike};
use rust_decimal::Decimal;
use serde::{Serialize, Serializer};

use super::fields::FieldMap;

const SEQUENCE_FORMAT: &str = "%Y%m%d%H%M%S";
const SEQUENCE_LEN: usize = 14;

// =============================================================================
// Date-Time Sequences
// =============================================================================

/// Granularity of a formatted date-time sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceUnit {
    /// `YYYYMMDD`
    Date,
    /// `YYYYMMDDHH`
    Hour,
    /// `YYYYMMDDHHMM`
    Minute,
    /// `YYYYMMDDHHMMSS`
    Second,
}

impl SequenceUnit {
    const fn format(self) -> &'static str {
        match self {
            Self::Date => "%Y%m%d",
            Self::Hour => "%Y%m%d%H",
            Self::Minute => "%Y%m%d%H%M",
            Self::Second => SEQUENCE_FORMAT,
        }
    }
}

/// A terminal date-time sequence such as `20200302093015`.
///
/// The raw text is always kept; `datetime()` is `None` when the text is not
/// a valid 14-digit sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateTimeSeq {
    raw: String,
    parsed: Option<NaiveDateTime>,
}

impl DateTimeSeq {
    /// Parse a sequence, keeping invalid input as-is.
    #[must_use]
    pub fn parse(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let parsed = if raw.len() == SEQUENCE_LEN {
            NaiveDateTime::parse_from_str(&raw, SEQUENCE_FORMAT).ok()
        } else {
            None
        };
        Self { raw, parsed }
    }

    /// Format a date-time as a sequence of the given unit.
    #[must_use]
    pub fn format(datetime: NaiveDateTime, unit: SequenceUnit) -> String {
        datetime
            .with_nanosecond(0)
            .unwrap_or(datetime)
            .format(unit.format())
            .to_string()
    }

    /// The sequence text as received.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Parsed date-time, if valid.
    #[must_use]
    pub const fn datetime(&self) -> Option<NaiveDateTime> {
        self.parsed
    }

    /// Whether the sequence parsed as a date-time.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.parsed.is_some()
    }
}

impl fmt::Display for DateTimeSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for DateTimeSeq {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

// =============================================================================
// Push Channel and Raw Push
// =============================================================================

/// A push subscription target: channel name plus channel key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PushChannel {
    /// Channel ("real") name.
    pub name: String,
    /// Channel key, usually the instrument symbol.
    pub key: String,
}

impl PushChannel {
    /// Create a channel target.
    #[must_use]
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for PushChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.key)
    }
}

/// A push event exactly as the terminal delivered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPush {
    /// Channel name the push arrived on.
    pub real_name: String,
    /// Channel key the push arrived on.
    pub subscription_key: String,
    /// Whitespace-delimited payload text.
    pub block: String,
    /// Structured fields accompanying the block, if the transport has any.
    pub fields: FieldMap,
    /// Length reported by the terminal.
    pub block_length: usize,
}

impl RawPush {
    /// Push with a text block and no structured fields.
    #[must_use]
    pub fn text(channel: &PushChannel, block: impl Into<String>) -> Self {
        let block = block.into();
        Self {
            real_name: channel.name.clone(),
            subscription_key: channel.key.clone(),
            block_length: block.len(),
            block,
            fields: FieldMap::new(),
        }
    }

    /// Attach structured fields.
    #[must_use]
    pub fn with_fields(mut self, fields: FieldMap) -> Self {
        self.fields = fields;
        self
    }

    /// Whether this push belongs to the given channel.
    #[must_use]
    pub fn is_for(&self, channel: &PushChannel) -> bool {
        self.real_name == channel.name && self.subscription_key == channel.key
    }
}

// =============================================================================
// Normalized Transaction
// =============================================================================

/// Canonical transaction record emitted for every ingested push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transaction {
    /// Process-local ingestion sequence, strictly increasing.
    pub local_sequence: u64,
    /// Terminal date-time sequence; `None` when the payload was malformed.
    pub remote_timestamp_seq: Option<DateTimeSeq>,
    /// Remote identifier from the structured block.
    pub remote_id: Option<String>,
    /// Price token as received.
    pub price: Option<String>,
    /// Set when `remote_id` was already seen recently.
    pub repeated_remote_id: bool,
}

impl Transaction {
    /// Record with only the sequence set, used for malformed payloads.
    #[must_use]
    pub const fn unparsed(local_sequence: u64) -> Self {
        Self {
            local_sequence,
            remote_timestamp_seq: None,
            remote_id: None,
            price: None,
            repeated_remote_id: false,
        }
    }

    /// Whether consumers should treat this record as a possible duplicate.
    #[must_use]
    pub const fn is_duplicate_suspect(&self) -> bool {
        self.remote_id.is_none() || self.repeated_remote_id
    }

    /// Price as a decimal, if present and numeric.
    #[must_use]
    pub fn price_value(&self) -> Option<Decimal> {
        self.price.as_deref().and_then(|p| p.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use test_case::test_case;

    #[test]
    fn parses_valid_sequence() {
        let seq = DateTimeSeq::parse("20200302093015");
        let expected = NaiveDate::from_ymd_opt(2020, 3, 2)
            .unwrap()
            .and_hms_opt(9, 30, 15)
            .unwrap();
        assert_eq!(seq.datetime(), Some(expected));
        assert_eq!(seq.as_str(), "20200302093015");
    }

    #[test_case("2020030209301" ; "too short")]
    #[test_case("202003020930150" ; "too long")]
    #[test_case("20201302093015" ; "bad month")]
    #[test_case("X" ; "not numeric")]
    fn keeps_invalid_sequence_raw(raw: &str) {
        let seq = DateTimeSeq::parse(raw);
        assert!(!seq.is_valid());
        assert_eq!(seq.as_str(), raw);
    }

    #[test_case(SequenceUnit::Date => "20200302")]
    #[test_case(SequenceUnit::Hour => "2020030209")]
    #[test_case(SequenceUnit::Minute => "202003020930")]
    #[test_case(SequenceUnit::Second => "20200302093015")]
    fn formats_units(unit: SequenceUnit) -> String {
        let dt = NaiveDate::from_ymd_opt(2020, 3, 2)
            .unwrap()
            .and_hms_milli_opt(9, 30, 15, 250)
            .unwrap();
        DateTimeSeq::format(dt, unit)
    }

    #[test]
    fn duplicate_suspect_rules() {
        let mut tx = Transaction::unparsed(0);
        assert!(tx.is_duplicate_suspect());

        tx.remote_id = Some("77".to_string());
        assert!(!tx.is_duplicate_suspect());

        tx.repeated_remote_id = true;
        assert!(tx.is_duplicate_suspect());
    }

    #[test]
    fn price_value_keeps_scale() {
        let tx = Transaction {
            price: Some("1234.50".to_string()),
            ..Transaction::unparsed(1)
        };
        assert_eq!(tx.price_value().unwrap().to_string(), "1234.50");

        let bad = Transaction {
            price: Some("X".to_string()),
            ..Transaction::unparsed(2)
        };
        assert_eq!(bad.price_value(), None);
    }

    #[test]
    fn raw_push_channel_match() {
        let channel = PushChannel::new("FX_TICK", "GBP/AUD");
        let push = RawPush::text(&channel, "a b c");
        assert!(push.is_for(&channel));
        assert_eq!(push.block_length, 5);
        assert!(!push.is_for(&PushChannel::new("FX_TICK", "EUR/USD")));
    }
}
