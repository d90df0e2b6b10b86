// src/receive/table.rs
//
// Received-frame table.
//
// `FrameTable` is the single writer and is handed to the receive worker at
// construction. Consumers (display, logging) get a `FrameTableView` which can
// only read. Readers see each insert as soon as it lands; there is no
// transaction across several keys.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard};

use crate::io::{
    dlc_to_len, message_type, HwTimestamp, IoError, RawFrame, MAX_EXTENDED_ID, MAX_STANDARD_ID,
};

// ============================================================================
// Keys and Policy
// ============================================================================

/// Table key. Under `KeyPolicy::Sequence` this is the receipt sequence number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageKey(pub u64);

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bit set on `ByCanId` keys for 29-bit identifiers, so 0x100 std and 0x100 ext differ
const EXTENDED_KEY_BIT: u64 = 1 << 32;

/// How received frames are keyed in the table
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPolicy {
    /// Fresh record per receipt under a monotonically increasing key.
    /// Nothing is overwritten; the counter keeps counting across clears.
    #[default]
    Sequence,
    /// One record per CAN id, updated in place with a running receipt count
    ByCanId,
}

// ============================================================================
// Records
// ============================================================================

/// One received frame as stored in the table
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub frame: RawFrame,
    /// Present iff timestamp capture was enabled when the frame was read
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timestamp: Option<HwTimestamp>,
    /// Times this record has been received (always >= 1)
    pub receipt_count: u32,
}

impl FrameRecord {
    /// Check a driver frame and wrap it in a record with `receipt_count = 1`.
    ///
    /// A frame that cannot be stored faithfully (length disagreeing with its
    /// DLC, classic frame over 8 bytes, FD remote frame, id too wide for its
    /// format) means the receive path is corrupt; that is reported as
    /// `IoError::Fatal`.
    pub fn from_raw(
        device: &str,
        frame: RawFrame,
        timestamp: Option<HwTimestamp>,
    ) -> Result<Self, IoError> {
        let fd = frame.is_fd();
        let max_id = if frame.is_extended() {
            MAX_EXTENDED_ID
        } else {
            MAX_STANDARD_ID
        };
        if frame.msg_type & message_type::STATUS == 0 && frame.id > max_id {
            return Err(IoError::fatal(
                device,
                format!("id 0x{:X} out of range for {} frame", frame.id, if frame.is_extended() { "extended" } else { "standard" }),
            ));
        }
        if fd && frame.is_rtr() {
            return Err(IoError::fatal(device, format!("remote request flagged as FD (id 0x{:X})", frame.id)));
        }
        let len = dlc_to_len(frame.dlc, fd).ok_or_else(|| {
            IoError::fatal(
                device,
                format!("dlc {} invalid for {} frame 0x{:X}", frame.dlc, if fd { "FD" } else { "classic" }, frame.id),
            )
        })?;
        let data_ok = if frame.is_rtr() {
            frame.data.is_empty() || frame.data.len() == len
        } else {
            frame.data.len() == len
        };
        if !data_ok {
            return Err(IoError::fatal(
                device,
                format!("frame 0x{:X}: dlc {} expects {} bytes, got {}", frame.id, frame.dlc, len, frame.data.len()),
            ));
        }

        Ok(Self {
            frame,
            timestamp,
            receipt_count: 1,
        })
    }

    /// Payload as upper-case hex, for log lines and plain-text consumers
    pub fn payload_hex(&self) -> String {
        hex::encode_upper(&self.frame.data)
    }
}

// ============================================================================
// Table
// ============================================================================

#[derive(Debug, Default)]
struct TableInner {
    records: BTreeMap<MessageKey, FrameRecord>,
    /// Next sequence key; never reset
    next_key: u64,
    /// Number of clears so far, lets readers notice a table that emptied
    clears: u64,
}

/// Writer side of the frame table
#[derive(Debug)]
pub struct FrameTable {
    inner: Arc<RwLock<TableInner>>,
    policy: KeyPolicy,
}

impl FrameTable {
    pub fn new(policy: KeyPolicy) -> Self {
        Self {
            inner: Arc::new(RwLock::new(TableInner::default())),
            policy,
        }
    }

    pub fn policy(&self) -> KeyPolicy {
        self.policy
    }

    /// Read-only handle for consumers
    pub fn view(&self) -> FrameTableView {
        FrameTableView {
            inner: self.inner.clone(),
        }
    }

    /// Store a record according to the key policy. Returns the key used.
    pub fn insert(&self, record: FrameRecord) -> Result<MessageKey, IoError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| IoError::fatal("frame_table", "table lock poisoned"))?;

        match self.policy {
            KeyPolicy::Sequence => {
                let key = MessageKey(inner.next_key);
                inner.next_key += 1;
                inner.records.insert(key, record);
                Ok(key)
            }
            KeyPolicy::ByCanId => {
                let mut key = record.frame.id as u64;
                if record.frame.is_extended() {
                    key |= EXTENDED_KEY_BIT;
                }
                let key = MessageKey(key);
                match inner.records.get_mut(&key) {
                    Some(existing) => {
                        let count = existing.receipt_count.saturating_add(1);
                        *existing = record;
                        existing.receipt_count = count;
                    }
                    None => {
                        inner.records.insert(key, record);
                    }
                }
                Ok(key)
            }
        }
    }

    /// Remove every record. Returns how many were removed.
    pub fn clear(&self) -> Result<usize, IoError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| IoError::fatal("frame_table", "table lock poisoned"))?;
        let removed = inner.records.len();
        inner.records.clear();
        inner.clears += 1;
        Ok(removed)
    }
}

/// Read-only, cloneable view of a frame table
#[derive(Clone, Debug)]
pub struct FrameTableView {
    inner: Arc<RwLock<TableInner>>,
}

impl FrameTableView {
    // Readers only copy data out, so a poisoned lock is still safe to read
    fn read(&self) -> RwLockReadGuard<'_, TableInner> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().records.is_empty()
    }

    pub fn get(&self, key: MessageKey) -> Option<FrameRecord> {
        self.read().records.get(&key).cloned()
    }

    pub fn keys(&self) -> Vec<MessageKey> {
        self.read().records.keys().copied().collect()
    }

    /// All records in key order (receipt order under `KeyPolicy::Sequence`)
    pub fn snapshot(&self) -> Vec<(MessageKey, FrameRecord)> {
        self.read()
            .records
            .iter()
            .map(|(k, r)| (*k, r.clone()))
            .collect()
    }

    /// The `n` records with the highest keys, oldest first
    pub fn latest(&self, n: usize) -> Vec<(MessageKey, FrameRecord)> {
        let inner = self.read();
        let mut out: Vec<_> = inner
            .records
            .iter()
            .rev()
            .take(n)
            .map(|(k, r)| (*k, r.clone()))
            .collect();
        out.reverse();
        out
    }

    /// How many times the table has been cleared
    pub fn clear_count(&self) -> u64 {
        self.read().clears
    }

    /// Snapshot as JSON for UI bridges: `{ "clears": n, "records": [{ "key", ... }] }`
    pub fn to_json(&self) -> serde_json::Value {
        let inner = self.read();
        let records: Vec<serde_json::Value> = inner
            .records
            .iter()
            .map(|(key, record)| {
                let mut value = serde_json::to_value(record).unwrap_or(serde_json::Value::Null);
                if let serde_json::Value::Object(ref mut map) = value {
                    map.insert("key".to_string(), serde_json::json!(key.0));
                }
                value
            })
            .collect();
        serde_json::json!({
            "clears": inner.clears,
            "records": records,
        })
    }
}
