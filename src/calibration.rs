//! Zero-reference calibration state, one record per measurement channel.
//!
//! Records live only as long as the tester session. They are written by a
//! successful calibrate response and invalidated on reconnect or reset;
//! nothing here is ever loaded back from disk.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A resistance measurement channel with its own zero reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Channel {
    Ts,
    XlrPin2,
    XlrPin3,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Ts, Channel::XlrPin2, Channel::XlrPin3];

    fn index(self) -> usize {
        match self {
            Channel::Ts => 0,
            Channel::XlrPin2 => 1,
            Channel::XlrPin3 => 2,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Ts => f.write_str("TS"),
            Channel::XlrPin2 => f.write_str("XLR pin 2"),
            Channel::XlrPin3 => f.write_str("XLR pin 3"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CalibrationRecord {
    pub channel: Channel,
    pub zero_adc: u16,
    pub captured_at: DateTime<Utc>,
    pub valid: bool,
}

impl CalibrationRecord {
    pub fn captured_now(channel: Channel, zero_adc: u16) -> Self {
        Self {
            channel,
            zero_adc,
            captured_at: Utc::now(),
            valid: true,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct CalibrationStore {
    records: [Option<CalibrationRecord>; 3],
}

impl CalibrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, channel: Channel) -> Option<CalibrationRecord> {
        self.records[channel.index()]
    }

    /// Returns the record only while it is still valid.
    pub fn valid(&self, channel: Channel) -> Option<CalibrationRecord> {
        self.get(channel).filter(|record| record.valid)
    }

    pub fn is_valid(&self, channel: Channel) -> bool {
        self.valid(channel).is_some()
    }

    /// Stores `record` under `channel`. The channel argument wins over the
    /// record's own field so a record can never land in the wrong slot.
    pub fn set(&mut self, channel: Channel, record: CalibrationRecord) {
        self.records[channel.index()] = Some(CalibrationRecord { channel, ..record });
    }

    pub fn invalidate(&mut self, channel: Channel) {
        if let Some(record) = self.records[channel.index()].as_mut() {
            record.valid = false;
        }
    }

    pub fn invalidate_all(&mut self) {
        for channel in Channel::ALL {
            self.invalidate(channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_store_has_no_records() {
        let store = CalibrationStore::new();
        for channel in Channel::ALL {
            assert_eq!(store.get(channel), None);
            assert!(!store.is_valid(channel));
        }
    }

    #[test]
    fn calibration_is_per_channel() {
        let mut store = CalibrationStore::new();
        store.set(Channel::Ts, CalibrationRecord::captured_now(Channel::Ts, 60));
        assert!(store.is_valid(Channel::Ts));
        assert!(!store.is_valid(Channel::XlrPin2));
        assert!(!store.is_valid(Channel::XlrPin3));

        store.set(Channel::XlrPin2, CalibrationRecord::captured_now(Channel::XlrPin2, 58));
        store.invalidate(Channel::XlrPin2);
        assert!(store.is_valid(Channel::Ts));
        assert_eq!(store.get(Channel::XlrPin2).map(|r| r.valid), Some(false));
        assert_eq!(store.valid(Channel::XlrPin2), None);
    }

    #[test]
    fn set_overwrites_and_revalidates() {
        let mut store = CalibrationStore::new();
        store.set(Channel::Ts, CalibrationRecord::captured_now(Channel::Ts, 60));
        store.invalidate_all();
        assert!(!store.is_valid(Channel::Ts));

        store.set(Channel::Ts, CalibrationRecord::captured_now(Channel::Ts, 61));
        assert_eq!(store.valid(Channel::Ts).map(|r| r.zero_adc), Some(61));
    }

    #[test]
    fn set_files_record_under_given_channel() {
        let mut store = CalibrationStore::new();
        store.set(Channel::XlrPin3, CalibrationRecord::captured_now(Channel::Ts, 62));
        assert_eq!(store.get(Channel::XlrPin3).map(|r| r.channel), Some(Channel::XlrPin3));
        assert_eq!(store.get(Channel::Ts), None);
    }
}
