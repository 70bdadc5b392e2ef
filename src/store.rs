//! Append-only record store and versioning engine over sled
//!
//! Two trees: `records` maps record id to the CBOR-encoded
//! [`OperationalRecord`]; `chains` is the secondary index
//! `(chain_root, version_no) -> id` whose insert-if-absent compare-and-swap
//! is the store-level unique constraint that serializes version assignment
//! per chain. Edits never mutate a row in place.

use crate::error::LedgerError;
use crate::record::{OperationalRecord, TimeStamp};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Batch, IVec};
use std::collections::HashMap;
use std::sync::Arc;

const RECORDS_TREE: &str = "records";
const CHAINS_TREE: &str = "chains";

// separator sorts below the bech32 alphabet, so chain keys group cleanly
const CHAIN_SEP: u8 = b'/';

#[derive(Clone)]
pub struct RecordStore {
    records: sled::Tree,
    chains: sled::Tree,
}

fn chain_key(root: &str, version: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(root.len() + 5);
    key.extend_from_slice(root.as_bytes());
    key.push(CHAIN_SEP);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

fn chain_prefix(root: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(root.len() + 1);
    prefix.extend_from_slice(root.as_bytes());
    prefix.push(CHAIN_SEP);
    prefix
}

pub(crate) fn encode(record: &OperationalRecord) -> Result<Vec<u8>, LedgerError> {
    minicbor::to_vec(record).map_err(|e| LedgerError::Codec(e.to_string()))
}

pub(crate) fn decode(raw: &[u8]) -> Result<OperationalRecord, LedgerError> {
    minicbor::decode(raw).map_err(|e| LedgerError::Codec(e.to_string()))
}

impl RecordStore {
    pub fn open(db: Arc<sled::Db>) -> Result<Self, LedgerError> {
        Ok(Self {
            records: db.open_tree(RECORDS_TREE)?,
            chains: db.open_tree(CHAINS_TREE)?,
        })
    }

    /// Claim the chain slot `(root, version)` for a record id with a
    /// compare-and-swap from empty. Losing the swap means a concurrent edit
    /// claimed the same version and the caller must re-read the chain.
    pub fn claim_version(&self, root: &str, version: u32, id: &str) -> Result<(), LedgerError> {
        let claimed = self.chains.compare_and_swap(
            chain_key(root, version),
            None::<&[u8]>,
            Some(id.as_bytes()),
        )?;
        if claimed.is_err() {
            return Err(LedgerError::VersionConflict {
                chain: root.to_string(),
                version,
            });
        }
        Ok(())
    }

    /// Insert a new record, claiming its chain slot first.
    pub fn append(&self, record: &OperationalRecord) -> Result<String, LedgerError> {
        self.claim_version(record.chain_root(), record.version_no, &record.id)?;
        self.records.insert(record.id.as_bytes(), encode(record)?)?;
        Ok(record.id.clone())
    }

    pub fn get(&self, id: &str) -> Result<Option<OperationalRecord>, LedgerError> {
        match self.records.get(id.as_bytes())? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Fetch a record together with its stored bytes, for guarded swaps.
    pub fn get_with_raw(&self, id: &str) -> Result<Option<(OperationalRecord, IVec)>, LedgerError> {
        match self.records.get(id.as_bytes())? {
            Some(raw) => Ok(Some((decode(&raw)?, raw))),
            None => Ok(None),
        }
    }

    /// All non-deleted versions of a chain, ascending by version.
    pub fn chain_versions(&self, root: &str) -> Result<Vec<OperationalRecord>, LedgerError> {
        let mut versions = Vec::new();
        for entry in self.chains.scan_prefix(chain_prefix(root)) {
            let (_, id) = entry?;
            let id = String::from_utf8_lossy(&id).to_string();
            if let Some(record) = self.get(&id)? {
                if record.is_visible() {
                    versions.push(record);
                }
            }
        }
        Ok(versions)
    }

    /// Latest visible member of a chain: highest `version_no`, ties broken
    /// by latest `created_at`, deleted rows skipped. A chain whose every
    /// version is deleted resolves to `None`.
    pub fn latest(&self, root: &str) -> Result<Option<OperationalRecord>, LedgerError> {
        let versions = self.chain_versions(root)?;
        Ok(versions
            .into_iter()
            .max_by_key(|r| (r.version_no, r.created_at)))
    }

    /// Next free version number for a chain. Soft-deleted versions still
    /// occupy their slot; version numbers are never reused.
    pub fn next_version(&self, root: &str) -> Result<u32, LedgerError> {
        match self.chains.scan_prefix(chain_prefix(root)).last() {
            Some(entry) => {
                let (key, _) = entry?;
                let tail: [u8; 4] = key[key.len() - 4..]
                    .try_into()
                    .map_err(|_| LedgerError::Codec("malformed chain index key".into()))?;
                Ok(u32::from_be_bytes(tail) + 1)
            }
            None => Ok(0),
        }
    }

    /// The live projection every read path works from: one head per chain,
    /// each the highest non-deleted version. Records submitted as a group
    /// are separate chains, so every member surfaces here independently.
    pub fn latest_visible(&self) -> Result<Vec<OperationalRecord>, LedgerError> {
        let mut heads: HashMap<String, OperationalRecord> = HashMap::new();
        for entry in self.chains.iter() {
            let (_, id) = entry?;
            let id = String::from_utf8_lossy(&id).to_string();
            let Some(record) = self.get(&id)? else {
                continue;
            };
            if !record.is_visible() {
                continue;
            }
            let key = record.chain_root().to_string();
            match heads.get(&key) {
                Some(current)
                    if (current.version_no, current.created_at)
                        >= (record.version_no, record.created_at) => {}
                _ => {
                    heads.insert(key, record);
                }
            }
        }
        let mut live: Vec<OperationalRecord> = heads.into_values().collect();
        live.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(live)
    }

    /// Conditional replace: succeeds only if the stored bytes still equal
    /// `old_raw`. Concurrent transitions on the same record lose the swap
    /// and get a state conflict carrying the state they raced against.
    pub fn swap_guarded(
        &self,
        id: &str,
        old_raw: &[u8],
        new: &OperationalRecord,
        expected: &str,
    ) -> Result<(), LedgerError> {
        let swapped =
            self.records
                .compare_and_swap(id.as_bytes(), Some(old_raw), Some(encode(new)?))?;
        if swapped.is_err() {
            let found = match self.get(id)? {
                Some(current) if !current.is_visible() => "deleted".to_string(),
                Some(current) => current.status.label().to_string(),
                None => "missing".to_string(),
            };
            return Err(LedgerError::StateConflict {
                id: id.to_string(),
                expected: expected.to_string(),
                found,
            });
        }
        Ok(())
    }

    /// Apply one transition to every listed record inside a single sled
    /// transaction. Any member not in `Pending` aborts the whole group;
    /// nothing is left half-applied.
    pub fn transition_group<F>(&self, ids: &[String], mutate: F) -> Result<(), LedgerError>
    where
        F: Fn(OperationalRecord) -> Result<OperationalRecord, LedgerError>,
    {
        let result = self.records.transaction(|tx| {
            for id in ids {
                let raw = tx.get(id.as_bytes())?.ok_or_else(|| {
                    ConflictableTransactionError::Abort(LedgerError::NotFound(id.clone()))
                })?;
                let record = decode(&raw).map_err(ConflictableTransactionError::Abort)?;
                if !record.status.is_pending() || !record.is_visible() {
                    return Err(ConflictableTransactionError::Abort(
                        LedgerError::StateConflict {
                            id: id.clone(),
                            expected: "pending".into(),
                            found: record.status.label().into(),
                        },
                    ));
                }
                let updated = mutate(record).map_err(ConflictableTransactionError::Abort)?;
                let bytes = encode(&updated).map_err(ConflictableTransactionError::Abort)?;
                tx.insert(id.as_bytes(), bytes)?;
            }
            Ok(())
        });
        result.map_err(|e| match e {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => LedgerError::Storage(err),
        })
    }

    /// Two-write conversion: flip the reservation to its terminal state and
    /// insert the already-version-claimed booking row, atomically from any
    /// reader's point of view.
    pub fn commit_conversion(
        &self,
        reservation: &OperationalRecord,
        booking: &OperationalRecord,
    ) -> Result<(), LedgerError> {
        let reservation_bytes = encode(reservation)?;
        let booking_bytes = encode(booking)?;
        let result = self.records.transaction(|tx| {
            let raw = tx.get(reservation.id.as_bytes())?.ok_or_else(|| {
                ConflictableTransactionError::Abort(LedgerError::NotFound(reservation.id.clone()))
            })?;
            let current = decode(&raw).map_err(ConflictableTransactionError::Abort)?;
            if !current.status.is_approved() || !current.is_visible() {
                return Err(ConflictableTransactionError::Abort(
                    LedgerError::StateConflict {
                        id: reservation.id.clone(),
                        expected: "approved".into(),
                        found: current.status.label().into(),
                    },
                ));
            }
            tx.insert(reservation.id.as_bytes(), reservation_bytes.clone())?;
            tx.insert(booking.id.as_bytes(), booking_bytes.clone())?;
            Ok(())
        });
        result.map_err(|e| match e {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => LedgerError::Storage(err),
        })
    }

    /// Mark a single row deleted. Status is left untouched; the row stays
    /// queryable for audit but drops out of every projection.
    pub fn soft_delete(&self, id: &str) -> Result<(), LedgerError> {
        let (mut record, raw) = self
            .get_with_raw(id)?
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        if !record.is_visible() {
            return Ok(()); // already deleted, nothing to do
        }
        let expected = record.status.label().to_string();
        record.deleted_at = Some(TimeStamp::new());
        self.swap_guarded(id, &raw, &record, &expected)
    }

    /// Batch soft-delete for cascades. Rows are re-encoded with their
    /// `deleted_at` set and applied in one atomic batch.
    pub fn soft_delete_batch(&self, records: &[OperationalRecord]) -> Result<usize, LedgerError> {
        let now = TimeStamp::new();
        let mut batch = Batch::default();
        let mut count = 0usize;
        for record in records {
            if !record.is_visible() {
                continue;
            }
            let mut tombstoned = record.clone();
            tombstoned.deleted_at = Some(now);
            batch.insert(record.id.as_bytes(), encode(&tombstoned)?);
            count += 1;
        }
        self.records.apply_batch(batch)?;
        Ok(count)
    }

    /// Every record in the store, deleted rows included. Audit surface.
    pub fn all_records(&self) -> Result<Vec<OperationalRecord>, LedgerError> {
        let mut out = Vec::new();
        for entry in self.records.iter() {
            let (_, raw) = entry?;
            out.push(decode(&raw)?);
        }
        Ok(out)
    }
}
