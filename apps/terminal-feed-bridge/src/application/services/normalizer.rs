//! Transaction Normalizer
//!
//! Turns raw push text into [`Transaction`] records. Every call consumes the
//! next local sequence number, whether or not the payload parses, so
//! consumers can use the sequence as a gap-free audit trail.
//!
//! # Payload Layout
//!
//! Whitespace-delimited tokens; token 2 is the date-time sequence and token
//! 4 is the price. A leading blank column counts as an empty token 0;
//! trailing whitespace is ignored:
//!
//! ```text
//!   "  A  20200302093015  X  1234.50  "
//!   [""] [A] [20200302093015] [X] [1234.50]
//!    0    1   2                3   4
//! ```

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use crate::domain::{DateTimeSeq, FieldCode, RawPush, SessionError, Transaction};

const TIMESTAMP_POSITION: usize = 2;
const PRICE_POSITION: usize = 4;
const REQUIRED_TOKENS: usize = PRICE_POSITION + 1;

fn tokenize(raw_text: &str) -> Vec<&str> {
    let trimmed = raw_text.trim_end();
    let mut tokens = Vec::new();
    if trimmed.starts_with(char::is_whitespace) {
        tokens.push("");
    }
    tokens.extend(trimmed.split_whitespace());
    tokens
}

/// Normalizer settings.
#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    /// Structured field holding the remote identifier.
    pub remote_id_field: FieldCode,
    /// How many recent remote ids are remembered for repeat detection.
    pub dedup_window: usize,
}

/// A payload that could not be parsed. It still carries its record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error} (local sequence {})", transaction.local_sequence)]
pub struct MalformedPush {
    /// Record with the assigned sequence and every optional field unset.
    pub transaction: Transaction,
    /// Why parsing failed.
    pub error: SessionError,
}

impl From<MalformedPush> for SessionError {
    fn from(malformed: MalformedPush) -> Self {
        malformed.error
    }
}

/// Recently seen remote ids, bounded FIFO.
#[derive(Debug, Default)]
struct RecentIds {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl RecentIds {
    /// Record `id`; returns `true` if it was already present.
    fn observe(&mut self, id: &str, capacity: usize) -> bool {
        if self.seen.contains(id) {
            return true;
        }
        if capacity == 0 {
            return false;
        }
        while self.order.len() >= capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        false
    }
}

/// Assigns local sequences and parses push payloads.
#[derive(Debug)]
pub struct TransactionNormalizer {
    config: NormalizerConfig,
    next_sequence: AtomicU64,
    recent_ids: Mutex<RecentIds>,
}

impl TransactionNormalizer {
    /// Create a normalizer whose first sequence is 0.
    #[must_use]
    pub fn new(config: NormalizerConfig) -> Self {
        Self {
            config,
            next_sequence: AtomicU64::new(0),
            recent_ids: Mutex::new(RecentIds::default()),
        }
    }

    /// Number of sequences handed out so far.
    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.next_sequence.load(Ordering::SeqCst)
    }

    /// Parse push text into a record with no remote id.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedPush`] when fewer than five tokens are present. The
    /// error still holds the record and its sequence.
    pub fn normalize(&self, raw_text: &str) -> Result<Transaction, MalformedPush> {
        let local_sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let tokens = tokenize(raw_text);

        if tokens.len() < REQUIRED_TOKENS {
            return Err(MalformedPush {
                transaction: Transaction::unparsed(local_sequence),
                error: SessionError::MalformedPayload {
                    token_count: tokens.len(),
                    required: REQUIRED_TOKENS,
                },
            });
        }

        Ok(Transaction {
            local_sequence,
            remote_timestamp_seq: Some(DateTimeSeq::parse(tokens[TIMESTAMP_POSITION])),
            remote_id: None,
            price: Some(tokens[PRICE_POSITION].to_string()),
            repeated_remote_id: false,
        })
    }

    /// Normalize a push and attach its remote id from the structured block.
    ///
    /// # Errors
    ///
    /// Same as [`Self::normalize`].
    pub fn ingest(&self, push: &RawPush) -> Result<Transaction, MalformedPush> {
        let mut transaction = self.normalize(&push.block)?;

        if let Some(id) = push.fields.get(&self.config.remote_id_field) {
            transaction.repeated_remote_id =
                self.recent_ids.lock().observe(id, self.config.dedup_window);
            transaction.remote_id = Some(id.to_string());
        }

        Ok(transaction)
    }
}
