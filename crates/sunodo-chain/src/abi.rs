//! Event signatures and the minimal ABI decoding the controller needs.
//!
//! Parameters may be indexed or not: static values are taken from the
//! remaining topics first and then from the data head, in declaration order.
//! Decoding is lenient and yields `None` for anything that is absent or
//! malformed; the ingestion layer decides what to discard.

use sha3::{Digest, Keccak256};
use sunodo_store::Address;

use crate::RawLog;
use crate::ingest::{DeadlineEvent, LocationEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `FinancialRunway(address dapp, uint256 chainid, uint256 until)`
    FinancialRunway,
    /// `MachineLocation(address dapp, uint256 chainid, string location)`
    MachineLocation,
}

impl EventKind {
    pub fn signature(self) -> &'static str {
        match self {
            EventKind::FinancialRunway => "FinancialRunway(address,uint256,uint256)",
            EventKind::MachineLocation => "MachineLocation(address,uint256,string)",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EventKind::FinancialRunway => "FinancialRunway",
            EventKind::MachineLocation => "MachineLocation",
        }
    }

    /// Keccak-256 of the signature, i.e. the log's first topic.
    pub fn topic(self) -> [u8; 32] {
        Keccak256::digest(self.signature().as_bytes()).into()
    }
}

/// Truncate a uint256 word to `u128`, saturating when the high half is set.
pub fn word_to_u128(word: &[u8; 32]) -> u128 {
    if word[..16].iter().any(|b| *b != 0) {
        return u128::MAX;
    }
    let mut low = [0u8; 16];
    low.copy_from_slice(&word[16..]);
    u128::from_be_bytes(low)
}

struct LogDecoder<'a> {
    topics: std::slice::Iter<'a, [u8; 32]>,
    data: &'a [u8],
    head: usize,
}

impl<'a> LogDecoder<'a> {
    fn new(log: &'a RawLog) -> Self {
        let mut topics = log.topics.iter();
        // topic0 is the event selector
        topics.next();
        Self {
            topics,
            data: &log.data,
            head: 0,
        }
    }

    fn word_at(&self, offset: usize) -> Option<[u8; 32]> {
        let end = offset.checked_add(32)?;
        let slice = self.data.get(offset..end)?;
        let mut word = [0u8; 32];
        word.copy_from_slice(slice);
        Some(word)
    }

    fn next_head(&mut self) -> Option<[u8; 32]> {
        let word = self.word_at(self.head);
        self.head += 32;
        word
    }

    fn next_static(&mut self) -> Option<[u8; 32]> {
        match self.topics.next() {
            Some(topic) => Some(*topic),
            None => self.next_head(),
        }
    }

    fn next_string(&mut self) -> Option<String> {
        // indexed strings only carry their hash
        if self.topics.next().is_some() {
            return None;
        }
        let offset = usize::try_from(word_to_u128(&self.next_head()?)).ok()?;
        let len = usize::try_from(word_to_u128(&self.word_at(offset)?)).ok()?;
        let start = offset.checked_add(32)?;
        let bytes = self.data.get(start..start.checked_add(len)?)?;
        String::from_utf8(bytes.to_vec()).ok()
    }
}

fn matches(log: &RawLog, kind: EventKind) -> bool {
    log.topics.first() == Some(&kind.topic())
}

pub fn decode_deadline(log: &RawLog) -> DeadlineEvent {
    let mut event = DeadlineEvent {
        block_number: log.block_number,
        block_hash: log.block_hash.clone(),
        transaction_hash: log.transaction_hash.clone(),
        ..DeadlineEvent::default()
    };
    if !matches(log, EventKind::FinancialRunway) {
        return event;
    }
    let mut decoder = LogDecoder::new(log);
    event.address = decoder.next_static().map(|w| Address::from_word(&w));
    event.chain_id = decoder.next_static().map(|w| word_to_u128(&w));
    event.until = decoder.next_static().map(|w| word_to_u128(&w));
    event
}

pub fn decode_location(log: &RawLog) -> LocationEvent {
    let mut event = LocationEvent {
        block_number: log.block_number,
        block_hash: log.block_hash.clone(),
        transaction_hash: log.transaction_hash.clone(),
        ..LocationEvent::default()
    };
    if !matches(log, EventKind::MachineLocation) {
        return event;
    }
    let mut decoder = LogDecoder::new(log);
    event.address = decoder.next_static().map(|w| Address::from_word(&w));
    event.chain_id = decoder.next_static().map(|w| word_to_u128(&w));
    event.location = decoder.next_string();
    event
}

/// ABI encoding helpers for building logs in tests and fixtures.
pub mod encode {
    use sunodo_store::Address;

    pub fn address_word(address: &Address) -> [u8; 32] {
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(address.as_bytes());
        word
    }

    pub fn uint_word(value: u128) -> [u8; 32] {
        let mut word = [0u8; 32];
        word[16..].copy_from_slice(&value.to_be_bytes());
        word
    }

    /// Tail encoding of a dynamic string: length word plus padded bytes.
    pub fn string_tail(value: &str) -> Vec<u8> {
        let mut out = uint_word(value.len() as u128).to_vec();
        out.extend_from_slice(value.as_bytes());
        let pad = (32 - value.len() % 32) % 32;
        out.extend(std::iter::repeat_n(0u8, pad));
        out
    }
}
