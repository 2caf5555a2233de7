//! Typed protocol events and how they are folded into the store.
//!
//! Logs from pending blocks and logs missing a required argument are
//! discarded. The chain will not resend a malformed log, so nothing here is
//! retried.

use sunodo_store::{Address, DApp, DAppStore};

use crate::RawLog;
use crate::abi;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IngestError {
    #[error("ignoring {event} log from pending block")]
    Pending { event: &'static str },
    #[error("ignoring {event} log with undefined {field}")]
    MissingField {
        event: &'static str,
        field: &'static str,
    },
}

/// A funding deadline announcement (`FinancialRunway`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadlineEvent {
    pub address: Option<Address>,
    pub chain_id: Option<u128>,
    /// Deadline in seconds since the Unix epoch.
    pub until: Option<u128>,
    pub block_number: Option<u64>,
    pub block_hash: Option<String>,
    pub transaction_hash: Option<String>,
}

/// A machine snapshot location announcement (`MachineLocation`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationEvent {
    pub address: Option<Address>,
    pub chain_id: Option<u128>,
    pub location: Option<String>,
    pub block_number: Option<u64>,
    pub block_hash: Option<String>,
    pub transaction_hash: Option<String>,
}

impl From<&RawLog> for DeadlineEvent {
    fn from(log: &RawLog) -> Self {
        abi::decode_deadline(log)
    }
}

impl From<&RawLog> for LocationEvent {
    fn from(log: &RawLog) -> Self {
        abi::decode_location(log)
    }
}

const RUNWAY: &str = "FinancialRunway";
const LOCATION: &str = "MachineLocation";

impl DeadlineEvent {
    /// Validate the event and convert it into a store entry.
    ///
    /// The deadline is converted from seconds to milliseconds. A zero deadline
    /// counts as undefined.
    pub fn to_dapp(&self) -> Result<DApp, IngestError> {
        let block_number = self.block_number.ok_or(IngestError::Pending { event: RUNWAY })?;
        let address = self.address.ok_or(IngestError::MissingField {
            event: RUNWAY,
            field: "dapp address",
        })?;
        let until = self.until.filter(|until| *until != 0).ok_or(IngestError::MissingField {
            event: RUNWAY,
            field: "until",
        })?;
        Ok(DApp {
            address,
            shutdown_at: until.saturating_mul(1000),
            block_hash: self.block_hash.clone().unwrap_or_default(),
            block_number,
            transaction_hash: self.transaction_hash.clone().unwrap_or_default(),
        })
    }

    /// Fold into `store`; returns the DApp if its node should start now.
    pub fn apply(&self, store: &mut DAppStore, now: u128) -> Result<Option<DApp>, IngestError> {
        let dapp = self.to_dapp()?;
        Ok(store.upsert_workload(dapp.block_number, now, dapp))
    }
}

impl LocationEvent {
    pub fn to_entry(&self) -> Result<(u64, Address, String), IngestError> {
        let block_number = self.block_number.ok_or(IngestError::Pending { event: LOCATION })?;
        let address = self.address.ok_or(IngestError::MissingField {
            event: LOCATION,
            field: "dapp address",
        })?;
        let location = match self.location.as_deref() {
            Some(location) if !location.is_empty() => location.to_string(),
            _ => {
                return Err(IngestError::MissingField {
                    event: LOCATION,
                    field: "location",
                });
            }
        };
        Ok((block_number, address, location))
    }

    /// Fold into `store`; returns the address whose location changed.
    pub fn apply(&self, store: &mut DAppStore) -> Result<Address, IngestError> {
        let (block, address, location) = self.to_entry()?;
        store.upsert_location(block, address, location);
        Ok(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u128 = 1_700_000_000_000;

    fn dapp() -> Address {
        "0x00000000000000000000000000000000000000d1".parse().unwrap()
    }

    fn runway(until: u128) -> DeadlineEvent {
        DeadlineEvent {
            address: Some(dapp()),
            chain_id: Some(31337),
            until: Some(until),
            block_number: Some(10),
            block_hash: Some("0xb1".into()),
            transaction_hash: Some("0xt1".into()),
        }
    }

    #[test]
    fn deadline_converts_seconds_to_millis() {
        let dapp = runway(1_700_000_100).to_dapp().unwrap();
        assert_eq!(dapp.shutdown_at, 1_700_000_100_000);
        assert_eq!(dapp.block_number, 10);
        assert_eq!(dapp.block_hash, "0xb1");
        assert_eq!(dapp.transaction_hash, "0xt1");
    }

    #[test]
    fn pending_deadline_is_rejected() {
        let event = DeadlineEvent {
            block_number: None,
            ..runway(1)
        };
        assert_eq!(
            event.to_dapp().unwrap_err(),
            IngestError::Pending { event: "FinancialRunway" }
        );
    }

    #[test]
    fn missing_fields_are_rejected() {
        let no_address = DeadlineEvent {
            address: None,
            ..runway(1)
        };
        assert!(matches!(
            no_address.to_dapp(),
            Err(IngestError::MissingField { field: "dapp address", .. })
        ));
        let no_until = DeadlineEvent {
            until: None,
            ..runway(1)
        };
        assert!(matches!(
            no_until.to_dapp(),
            Err(IngestError::MissingField { field: "until", .. })
        ));
    }

    #[test]
    fn zero_deadline_leaves_store_untouched() {
        let mut store = DAppStore::new();
        runway(1_000_000).apply(&mut store, 0).unwrap();

        let zero = DeadlineEvent {
            block_number: Some(11),
            ..runway(0)
        };
        assert_eq!(
            zero.apply(&mut store, 0).unwrap_err(),
            IngestError::MissingField {
                event: "FinancialRunway",
                field: "until",
            }
        );
        assert_eq!(store.get(&dapp()).unwrap().shutdown_at, 1_000_000_000);
        assert_eq!(store.block(), 10);
    }

    #[test]
    fn apply_returns_only_future_deadlines() {
        let mut store = DAppStore::new();
        let future = runway(NOW / 1000 + 60).apply(&mut store, NOW).unwrap();
        assert!(future.is_some());

        let past = runway(NOW / 1000 - 60).apply(&mut store, NOW).unwrap();
        assert!(past.is_none());
        assert_eq!(store.len(), 1);
        assert_eq!(store.block(), 10);
    }

    #[test]
    fn location_requires_non_empty_value() {
        let mut event = LocationEvent {
            address: Some(dapp()),
            location: Some(String::new()),
            block_number: Some(4),
            ..LocationEvent::default()
        };
        let mut store = DAppStore::new();
        assert!(matches!(
            event.apply(&mut store),
            Err(IngestError::MissingField { field: "location", .. })
        ));

        event.location = Some("QmSnapshot".into());
        assert_eq!(event.apply(&mut store).unwrap(), dapp());
        assert_eq!(store.location(&dapp()), Some("QmSnapshot"));
        assert_eq!(store.block(), 4);
    }

    #[test]
    fn pending_location_is_rejected() {
        let event = LocationEvent {
            address: Some(dapp()),
            location: Some("Qm".into()),
            ..LocationEvent::default()
        };
        assert_eq!(
            event.to_entry().unwrap_err(),
            IngestError::Pending { event: "MachineLocation" }
        );
    }
}
