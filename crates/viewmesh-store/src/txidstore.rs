//! Append-ordered transaction-id index
//!
//! Every txid gets a sequence number the first time it is written. The
//! sequence defines iteration order, so cursors replay commit history rather
//! than sorting ids. Layout in the `txids` namespace:
//!
//! | key | value |
//! |-----|-------|
//! | `ctr` | last allocated sequence |
//! | `last` | txid holding that sequence |
//! | `n<seq, 20 digits>` | `{txid, code}` |
//! | `t<txid>` | `{pos, code}` |

use crate::persistence::Persistence;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, trace};
use viewmesh_core::{Result, ValidationCode, ViewMeshError};

const NAMESPACE: &str = "txids";
const COUNTER_KEY: &str = "ctr";
const LAST_KEY: &str = "last";
const SEQ_PREFIX: &str = "n";
const TXID_PREFIX: &str = "t";
const SCAN_BATCH: u64 = 64;

fn seq_key(pos: u64) -> String {
    format!("{SEQ_PREFIX}{pos:020}")
}

fn txid_key(txid: &str) -> String {
    format!("{TXID_PREFIX}{txid}")
}

#[derive(Debug, Serialize, Deserialize)]
struct SeqRecord {
    txid: String,
    code: u8,
}

#[derive(Debug, Serialize, Deserialize)]
struct TxRecord {
    pos: u64,
    code: u8,
}

/// Where a new cursor starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeekPosition {
    /// First entry ever written
    Start,
    /// Last committed entry; followed by anything committed later
    End,
    /// The entry of the given txid
    At(String),
}

impl FromStr for SeekPosition {
    type Err = ViewMeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start" => Ok(Self::Start),
            "end" => Ok(Self::End),
            _ => match s.strip_prefix("at:") {
                Some(txid) if !txid.is_empty() => Ok(Self::At(txid.to_string())),
                _ => Err(ViewMeshError::invalid(format!("invalid position {s}"))),
            },
        }
    }
}

impl fmt::Display for SeekPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("start"),
            Self::End => f.write_str("end"),
            Self::At(txid) => write!(f, "at:{txid}"),
        }
    }
}

/// Counter state; sequence 0 means nothing written
#[derive(Debug, Clone, Default)]
struct Tally {
    seq: u64,
    last: Option<String>,
}

#[derive(Debug)]
struct Pending {
    tally: Tally,
    allocated: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct Counters {
    committed: Tally,
    pending: Option<Pending>,
}

/// Durable txid to finality-status index
pub struct TxIdStore {
    persistence: Arc<dyn Persistence>,
    counters: Mutex<Counters>,
}

impl TxIdStore {
    /// Open the index over `persistence`, recovering the counter and last txid
    pub fn new(persistence: Arc<dyn Persistence>) -> Result<Self> {
        let seq = match persistence.get_state(NAMESPACE, COUNTER_KEY)? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| ViewMeshError::storage(format!("corrupt sequence counter: {e}")))?,
            None => 0,
        };
        let last = persistence
            .get_state(NAMESPACE, LAST_KEY)?
            .map(|bytes| {
                String::from_utf8(bytes)
                    .map_err(|e| ViewMeshError::storage(format!("corrupt last txid: {e}")))
            })
            .transpose()?;
        debug!(seq, last = ?last, "opened txid store");
        Ok(Self {
            persistence,
            counters: Mutex::new(Counters {
                committed: Tally { seq, last },
                pending: None,
            }),
        })
    }

    /// Open an update; writes become visible on [`TxIdStore::commit`]
    pub fn begin_update(&self) -> Result<()> {
        let mut counters = self.counters.lock();
        self.persistence.begin_update()?;
        counters.pending = Some(Pending {
            tally: counters.committed.clone(),
            allocated: HashMap::new(),
        });
        Ok(())
    }

    /// Commit the open update
    pub fn commit(&self) -> Result<()> {
        let mut counters = self.counters.lock();
        self.persistence.commit()?;
        if let Some(pending) = counters.pending.take() {
            debug!(seq = pending.tally.seq, new = pending.allocated.len(), "committed txids");
            counters.committed = pending.tally;
        }
        Ok(())
    }

    /// Drop the open update, releasing any sequence numbers it allocated
    pub fn discard(&self) -> Result<()> {
        let mut counters = self.counters.lock();
        self.persistence.discard()?;
        counters.pending = None;
        Ok(())
    }

    /// Record `code` for `txid`
    ///
    /// # Panics
    ///
    /// Panics when no update is open. Writes must always be bracketed by
    /// [`TxIdStore::begin_update`] and [`TxIdStore::commit`].
    pub fn set(&self, txid: &str, code: ValidationCode) -> Result<()> {
        let mut counters = self.counters.lock();
        let Some(pending) = counters.pending.as_mut() else {
            panic!("programming error, writing without ongoing update");
        };

        let known = match pending.allocated.get(txid) {
            Some(pos) => Some(*pos),
            None => self.record(txid)?.map(|r| r.pos),
        };
        let pos = match known {
            Some(pos) => pos,
            None => {
                let pos = pending.tally.seq + 1;
                self.persistence
                    .set_state(NAMESPACE, COUNTER_KEY, bincode::serialize(&pos)?)?;
                self.persistence
                    .set_state(NAMESPACE, LAST_KEY, txid.as_bytes().to_vec())?;
                pending.tally = Tally {
                    seq: pos,
                    last: Some(txid.to_string()),
                };
                pending.allocated.insert(txid.to_string(), pos);
                pos
            }
        };

        let code = code.as_u8();
        let seq_record = SeqRecord {
            txid: txid.to_string(),
            code,
        };
        self.persistence
            .set_state(NAMESPACE, &seq_key(pos), bincode::serialize(&seq_record)?)?;
        self.persistence
            .set_state(NAMESPACE, &txid_key(txid), bincode::serialize(&TxRecord { pos, code })?)?;
        trace!(txid = %txid, pos, code, "staged txid");
        Ok(())
    }

    /// Last committed status of `txid`; `Unknown` if never written
    pub fn get(&self, txid: &str) -> Result<ValidationCode> {
        match self.record(txid)? {
            Some(record) => ValidationCode::from_u8(record.code),
            None => Ok(ValidationCode::Unknown),
        }
    }

    /// Txid with the highest committed sequence
    pub fn get_last_tx_id(&self) -> Option<String> {
        self.counters.lock().committed.last.clone()
    }

    /// Forward cursor in sequence order starting at `position`
    pub fn iterator(&self, position: SeekPosition) -> Result<TxIdIterator> {
        let next_pos = match &position {
            SeekPosition::Start => 1,
            SeekPosition::End => self.counters.lock().committed.seq.max(1),
            SeekPosition::At(txid) => self
                .record(txid)?
                .map(|r| r.pos)
                .ok_or_else(|| ViewMeshError::not_found(format!("txid {txid} was not found")))?,
        };
        debug!(position = %position, next_pos, "opened txid cursor");
        Ok(TxIdIterator {
            persistence: self.persistence.clone(),
            next_pos,
            buffer: VecDeque::new(),
            closed: false,
        })
    }

    fn record(&self, txid: &str) -> Result<Option<TxRecord>> {
        self.persistence
            .get_state(NAMESPACE, &txid_key(txid))?
            .map(|bytes| bincode::deserialize::<TxRecord>(&bytes))
            .transpose()
            .map_err(|e| ViewMeshError::storage(format!("corrupt record for txid {txid}: {e}")))
    }
}

/// One step of a [`TxIdIterator`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIdEntry {
    /// Transaction id
    pub txid: String,
    /// Sequence number assigned at first write
    pub pos: u64,
    /// Status at the time the entry was read
    pub code: ValidationCode,
}

/// Live forward cursor over committed txids
///
/// Reaching the head yields `None` without losing the position; entries
/// committed later are returned by subsequent calls.
pub struct TxIdIterator {
    persistence: Arc<dyn Persistence>,
    next_pos: u64,
    buffer: VecDeque<TxIdEntry>,
    closed: bool,
}

impl TxIdIterator {
    /// Next committed entry, or `None` at the current head
    pub fn next(&mut self) -> Result<Option<TxIdEntry>> {
        if self.closed {
            return Ok(None);
        }
        if self.buffer.is_empty() {
            self.fill()?;
        }
        let entry = self.buffer.pop_front();
        if let Some(entry) = &entry {
            self.next_pos = entry.pos + 1;
        }
        Ok(entry)
    }

    /// Release the cursor; idempotent
    pub fn close(&mut self) {
        self.closed = true;
        self.buffer.clear();
    }

    fn fill(&mut self) -> Result<()> {
        let start = seq_key(self.next_pos);
        let end = seq_key(self.next_pos + SCAN_BATCH);
        for (key, bytes) in self
            .persistence
            .get_state_range_scan_iterator(NAMESPACE, &start, &end)?
        {
            let pos = key[SEQ_PREFIX.len()..]
                .parse::<u64>()
                .map_err(|e| ViewMeshError::storage(format!("corrupt sequence key {key}: {e}")))?;
            let record: SeqRecord = bincode::deserialize(&bytes)
                .map_err(|e| ViewMeshError::storage(format!("corrupt entry at {pos}: {e}")))?;
            self.buffer.push_back(TxIdEntry {
                txid: record.txid,
                pos,
                code: ValidationCode::from_u8(record.code)?,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;

    fn store() -> TxIdStore {
        TxIdStore::new(Arc::new(MemoryPersistence::new())).unwrap()
    }

    fn drain(it: &mut TxIdIterator) -> Vec<String> {
        let mut txids = Vec::new();
        while let Some(entry) = it.next().unwrap() {
            txids.push(entry.txid);
        }
        txids
    }

    #[test]
    fn test_positions_parse() {
        assert_eq!("start".parse::<SeekPosition>().unwrap(), SeekPosition::Start);
        assert_eq!("end".parse::<SeekPosition>().unwrap(), SeekPosition::End);
        assert_eq!(
            "at:tx9".parse::<SeekPosition>().unwrap(),
            SeekPosition::At("tx9".to_string())
        );
        let err = "middle".parse::<SeekPosition>().unwrap_err();
        assert_eq!(err.message(), "invalid position middle");
    }

    #[test]
    fn test_rewrite_keeps_sequence() {
        let store = store();
        store.begin_update().unwrap();
        store.set("a", ValidationCode::Busy).unwrap();
        store.set("b", ValidationCode::Valid).unwrap();
        store.set("a", ValidationCode::Invalid).unwrap();
        store.commit().unwrap();

        let mut it = store.iterator(SeekPosition::Start).unwrap();
        let first = it.next().unwrap().unwrap();
        assert_eq!((first.txid.as_str(), first.pos, first.code), ("a", 1, ValidationCode::Invalid));
        assert_eq!(it.next().unwrap().unwrap().pos, 2);
        assert_eq!(store.get("a").unwrap(), ValidationCode::Invalid);
        assert_eq!(store.get_last_tx_id().as_deref(), Some("b"));
    }

    #[test]
    fn test_cursor_crosses_batches() {
        let store = store();
        store.begin_update().unwrap();
        let expected: Vec<String> = (0..(SCAN_BATCH * 2 + 5)).map(|i| format!("tx-{i}")).collect();
        for txid in &expected {
            store.set(txid, ValidationCode::Valid).unwrap();
        }
        store.commit().unwrap();

        let mut it = store.iterator(SeekPosition::Start).unwrap();
        assert_eq!(drain(&mut it), expected);
    }

    #[test]
    fn test_closed_cursor_yields_nothing() {
        let store = store();
        store.begin_update().unwrap();
        store.set("a", ValidationCode::Valid).unwrap();
        store.commit().unwrap();

        let mut it = store.iterator(SeekPosition::Start).unwrap();
        it.close();
        it.close();
        assert!(it.next().unwrap().is_none());
    }
}
