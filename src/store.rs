//! The authorization ledger.
//!
//! One record per `(chainId, nonce)`, created `pending`. A record moves at most once, to
//! `used` or `cancelled`, through compare-and-set transitions taken under the record's map
//! entry lock, and is immutable afterwards. `expired` is never written: it is derived on
//! read for pending records whose window has closed, and never overrides `used`.
//!
//! Submission attempts are logged separately from the records so that rejected or failed
//! attempts leave an audit trail without touching the record.
//!
//! With a journal path configured, every change is queued to a JSON-lines file, in order,
//! before it is applied in memory, and the file is replayed on startup.
//! [`AuthorizationStore::sync`] waits until everything queued so far is on disk.

use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTimeError;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::authorization::SignedAuthorization;
use crate::timestamp::{Clock, UnixTimestamp};
use crate::types::{EvmAddress, HexEncodedNonce, TransactionHash};

type RecordKey = (u64, HexEncodedNonce);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Used,
    Cancelled,
    /// Read-time only: a pending record whose `validBefore` has passed.
    Expired,
}

impl std::fmt::Display for AuthorizationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuthorizationStatus::Pending => "pending",
            AuthorizationStatus::Used => "used",
            AuthorizationStatus::Cancelled => "cancelled",
            AuthorizationStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("nonce {nonce} is already recorded on chain {chain_id}")]
    DuplicateNonce {
        chain_id: u64,
        nonce: HexEncodedNonce,
    },
    #[error("authorization not found")]
    NotFound,
    #[error("authorization {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: AuthorizationStatus,
        to: AuthorizationStatus,
    },
    #[error("nonce {nonce} on chain {chain_id} is being submitted by another request")]
    AlreadyClaimed {
        chain_id: u64,
        nonce: HexEncodedNonce,
    },
    #[error("journal error: {0}")]
    Journal(String),
    #[error("clock error: {0}")]
    Clock(#[from] SystemTimeError),
}

impl From<std::io::Error> for StoreError {
    fn from(error: std::io::Error) -> Self {
        StoreError::Journal(error.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        StoreError::Journal(error.to_string())
    }
}

/// An authorization record as seen by readers, with `expired` already derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    pub id: Uuid,
    #[serde(flatten)]
    pub signed: SignedAuthorization,
    pub status: AuthorizationStatus,
    pub created_at: UnixTimestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_at: Option<UnixTimestamp>,
    /// Hash of the successful transaction once used; before that, of the latest attempt
    /// that reached the chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<TransactionHash>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<UnixTimestamp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Refused before any chain interaction.
    Rejected,
    /// Simulation reverted.
    SimulationReverted,
    /// Transaction accepted by the node.
    Broadcast,
    Confirmed,
    Reverted,
    NetworkError,
    /// The chain outcome arrived after the record was cancelled.
    CancelledInFlight,
}

/// One entry of the attempt log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionAttempt {
    pub chain_id: u64,
    pub nonce: HexEncodedNonce,
    pub at: UnixTimestamp,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<TransactionHash>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredRecord {
    id: Uuid,
    seq: u64,
    #[serde(flatten)]
    signed: SignedAuthorization,
    status: AuthorizationStatus,
    created_at: UnixTimestamp,
    used_at: Option<UnixTimestamp>,
    tx_hash: Option<TransactionHash>,
    cancelled_at: Option<UnixTimestamp>,
}

impl StoredRecord {
    fn key(&self) -> RecordKey {
        (self.signed.chain_id, self.signed.message.nonce)
    }

    fn status_at(&self, at: UnixTimestamp) -> AuthorizationStatus {
        match self.status {
            AuthorizationStatus::Pending if at >= self.signed.message.valid_before => {
                AuthorizationStatus::Expired
            }
            status => status,
        }
    }

    fn view(&self, now: UnixTimestamp) -> Authorization {
        Authorization {
            id: self.id,
            signed: self.signed,
            status: self.status_at(now),
            created_at: self.created_at,
            used_at: self.used_at,
            tx_hash: self.tx_hash,
            cancelled_at: self.cancelled_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
enum JournalEntry {
    Created {
        record: StoredRecord,
    },
    #[serde(rename_all = "camelCase")]
    Used {
        id: Uuid,
        tx_hash: TransactionHash,
        used_at: UnixTimestamp,
    },
    #[serde(rename_all = "camelCase")]
    Cancelled {
        id: Uuid,
        cancelled_at: UnixTimestamp,
    },
    #[serde(rename_all = "camelCase")]
    AttemptTx {
        id: Uuid,
        tx_hash: TransactionHash,
    },
    Attempt {
        attempt: SubmissionAttempt,
    },
}

enum JournalCommand {
    Append { line: String, durable: bool },
    Sync(oneshot::Sender<Result<(), String>>),
}

/// Appends journal lines from a dedicated task so request handlers never wait on the disk.
/// Terminal transitions are synced to storage as they are written.
struct Journal {
    commands: mpsc::UnboundedSender<JournalCommand>,
}

impl Journal {
    async fn open(path: &Path) -> Result<(Self, Vec<JournalEntry>), StoreError> {
        let mut entries = Vec::new();
        if fs::try_exists(path).await? {
            let contents = fs::read_to_string(path).await?;
            for (index, line) in contents.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let entry = serde_json::from_str(line).map_err(|e| {
                    StoreError::Journal(format!("{}:{}: {e}", path.display(), index + 1))
                })?;
                entries.push(entry);
            }
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let (commands, receiver) = mpsc::unbounded_channel();
        tokio::spawn(Self::run(file, receiver));
        Ok((Self { commands }, entries))
    }

    async fn run(mut file: fs::File, mut commands: mpsc::UnboundedReceiver<JournalCommand>) {
        let mut failure: Option<String> = None;
        while let Some(command) = commands.recv().await {
            match command {
                JournalCommand::Append { line, durable } => {
                    let written = async {
                        file.write_all(line.as_bytes()).await?;
                        file.flush().await?;
                        if durable {
                            file.sync_data().await?;
                        }
                        Ok::<_, std::io::Error>(())
                    }
                    .await;
                    if let Err(error) = written {
                        tracing::error!(%error, "failed to append to authorization journal");
                        failure.get_or_insert_with(|| error.to_string());
                    }
                }
                JournalCommand::Sync(done) => {
                    let result = match &failure {
                        Some(error) => Err(error.clone()),
                        None => file.sync_data().await.map_err(|e| e.to_string()),
                    };
                    let _ = done.send(result);
                }
            }
        }
    }

    fn append(&self, entry: &JournalEntry) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let durable = matches!(
            entry,
            JournalEntry::Used { .. } | JournalEntry::Cancelled { .. }
        );
        self.commands
            .send(JournalCommand::Append { line, durable })
            .map_err(|_| StoreError::Journal("journal writer stopped".to_string()))
    }

    async fn sync(&self) -> Result<(), StoreError> {
        let (done, result) = oneshot::channel();
        self.commands
            .send(JournalCommand::Sync(done))
            .map_err(|_| StoreError::Journal("journal writer stopped".to_string()))?;
        result
            .await
            .map_err(|_| StoreError::Journal("journal writer stopped".to_string()))?
            .map_err(StoreError::Journal)
    }
}

/// Exclusive right to submit one `(chainId, nonce)`. Released on drop.
#[derive(Debug)]
pub struct SubmissionClaim {
    claims: Arc<DashSet<RecordKey>>,
    key: RecordKey,
}

impl Drop for SubmissionClaim {
    fn drop(&mut self) {
        self.claims.remove(&self.key);
    }
}

pub struct AuthorizationStore {
    records: DashMap<RecordKey, StoredRecord>,
    ids: DashMap<Uuid, RecordKey>,
    attempts: DashMap<RecordKey, Vec<SubmissionAttempt>>,
    claims: Arc<DashSet<RecordKey>>,
    next_seq: AtomicU64,
    clock: Arc<dyn Clock>,
    journal: Option<Journal>,
}

impl AuthorizationStore {
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            ids: DashMap::new(),
            attempts: DashMap::new(),
            claims: Arc::new(DashSet::new()),
            next_seq: AtomicU64::new(0),
            clock,
            journal: None,
        }
    }

    /// Opens (creating if needed) a journal-backed store and replays its history.
    pub async fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let (journal, entries) = Journal::open(path.as_ref()).await?;
        let mut store = Self::in_memory(clock);
        let replayed = entries.len();
        for entry in entries {
            store.replay(entry);
        }
        store.journal = Some(journal);
        tracing::info!(
            path = %path.as_ref().display(),
            entries = replayed,
            records = store.records.len(),
            "Replayed authorization journal"
        );
        Ok(store)
    }

    fn replay(&self, entry: JournalEntry) {
        match entry {
            JournalEntry::Created { record } => {
                self.next_seq.fetch_max(record.seq + 1, Ordering::SeqCst);
                self.ids.insert(record.id, record.key());
                self.records.insert(record.key(), record);
            }
            JournalEntry::Used {
                id,
                tx_hash,
                used_at,
            } => self.replay_update(id, |record| {
                record.status = AuthorizationStatus::Used;
                record.used_at = Some(used_at);
                record.tx_hash = Some(tx_hash);
            }),
            JournalEntry::Cancelled { id, cancelled_at } => self.replay_update(id, |record| {
                record.status = AuthorizationStatus::Cancelled;
                record.cancelled_at = Some(cancelled_at);
            }),
            JournalEntry::AttemptTx { id, tx_hash } => {
                self.replay_update(id, |record| record.tx_hash = Some(tx_hash))
            }
            JournalEntry::Attempt { attempt } => {
                self.attempts
                    .entry((attempt.chain_id, attempt.nonce))
                    .or_default()
                    .push(attempt);
            }
        }
    }

    fn replay_update(&self, id: Uuid, apply: impl FnOnce(&mut StoredRecord)) {
        let Some(key) = self.ids.get(&id).map(|key| *key) else {
            tracing::warn!(%id, "journal references unknown authorization, skipping");
            return;
        };
        if let Some(mut record) = self.records.get_mut(&key) {
            apply(record.value_mut());
        }
    }

    fn write(&self, entry: &JournalEntry) -> Result<(), StoreError> {
        match &self.journal {
            Some(journal) => journal.append(entry),
            None => Ok(()),
        }
    }

    /// Resolves once every change made so far is durable. A no-op without a journal.
    pub async fn sync(&self) -> Result<(), StoreError> {
        match &self.journal {
            Some(journal) => journal.sync().await,
            None => Ok(()),
        }
    }

    fn key_for(&self, id: Uuid) -> Result<RecordKey, StoreError> {
        self.ids.get(&id).map(|key| *key).ok_or(StoreError::NotFound)
    }

    fn new_record(&self, signed: &SignedAuthorization, now: UnixTimestamp) -> StoredRecord {
        StoredRecord {
            id: Uuid::new_v4(),
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            signed: *signed,
            status: AuthorizationStatus::Pending,
            created_at: now,
            used_at: None,
            tx_hash: None,
            cancelled_at: None,
        }
    }

    /// Inserts a new pending record. Fails if `(chainId, nonce)` already exists, whatever
    /// its sender.
    pub fn create(&self, signed: &SignedAuthorization) -> Result<Authorization, StoreError> {
        let now = self.clock.now()?;
        let key = (signed.chain_id, signed.message.nonce);
        match self.records.entry(key) {
            dashmap::Entry::Occupied(_) => Err(StoreError::DuplicateNonce {
                chain_id: key.0,
                nonce: key.1,
            }),
            dashmap::Entry::Vacant(vacant) => {
                let record = self.new_record(signed, now);
                self.write(&JournalEntry::Created {
                    record: record.clone(),
                })?;
                self.ids.insert(record.id, key);
                let view = record.view(now);
                vacant.insert(record);
                Ok(view)
            }
        }
    }

    /// Returns the record for this exact signed payload, creating it if absent. A different
    /// payload under the same `(chainId, nonce)` is a [`StoreError::DuplicateNonce`].
    pub fn get_or_create(&self, signed: &SignedAuthorization) -> Result<Authorization, StoreError> {
        let now = self.clock.now()?;
        let key = (signed.chain_id, signed.message.nonce);
        match self.records.entry(key) {
            dashmap::Entry::Occupied(occupied) => {
                let record = occupied.get();
                if record.signed != *signed {
                    return Err(StoreError::DuplicateNonce {
                        chain_id: key.0,
                        nonce: key.1,
                    });
                }
                Ok(record.view(now))
            }
            dashmap::Entry::Vacant(vacant) => {
                let record = self.new_record(signed, now);
                self.write(&JournalEntry::Created {
                    record: record.clone(),
                })?;
                self.ids.insert(record.id, key);
                let view = record.view(now);
                vacant.insert(record);
                Ok(view)
            }
        }
    }

    pub fn get(&self, chain_id: u64, nonce: HexEncodedNonce) -> Result<Authorization, StoreError> {
        let now = self.clock.now()?;
        self.records
            .get(&(chain_id, nonce))
            .map(|record| record.view(now))
            .ok_or(StoreError::NotFound)
    }

    pub fn get_by_id(&self, id: Uuid) -> Result<Authorization, StoreError> {
        let key = self.key_for(id)?;
        let now = self.clock.now()?;
        self.records
            .get(&key)
            .map(|record| record.view(now))
            .ok_or(StoreError::NotFound)
    }

    /// `pending -> used`, atomically with respect to every other transition on the record.
    ///
    /// `broadcast_at` is when the successful transaction was sent; the record must still have
    /// been inside its window then.
    pub fn mark_used(
        &self,
        id: Uuid,
        tx_hash: TransactionHash,
        broadcast_at: UnixTimestamp,
    ) -> Result<Authorization, StoreError> {
        let key = self.key_for(id)?;
        let now = self.clock.now()?;
        let mut entry = self.records.get_mut(&key).ok_or(StoreError::NotFound)?;
        let record = entry.value_mut();
        let status = record.status_at(broadcast_at);
        if status != AuthorizationStatus::Pending {
            return Err(StoreError::InvalidTransition {
                id,
                from: status,
                to: AuthorizationStatus::Used,
            });
        }
        self.write(&JournalEntry::Used {
            id,
            tx_hash,
            used_at: now,
        })?;
        record.status = AuthorizationStatus::Used;
        record.used_at = Some(now);
        record.tx_hash = Some(tx_hash);
        Ok(record.view(now))
    }

    /// `pending -> cancelled`. A pending record past its window may still be cancelled.
    pub fn mark_cancelled(&self, id: Uuid) -> Result<Authorization, StoreError> {
        let key = self.key_for(id)?;
        let now = self.clock.now()?;
        let mut entry = self.records.get_mut(&key).ok_or(StoreError::NotFound)?;
        let record = entry.value_mut();
        if record.status != AuthorizationStatus::Pending {
            return Err(StoreError::InvalidTransition {
                id,
                from: record.status,
                to: AuthorizationStatus::Cancelled,
            });
        }
        self.write(&JournalEntry::Cancelled {
            id,
            cancelled_at: now,
        })?;
        record.status = AuthorizationStatus::Cancelled;
        record.cancelled_at = Some(now);
        Ok(record.view(now))
    }

    /// Remembers the hash of the first attempt that reached the chain. Only pending records
    /// without a hash are touched; returns whether the record was updated. Later hashes live
    /// in the attempt log.
    pub fn record_attempt_tx(&self, id: Uuid, tx_hash: TransactionHash) -> Result<bool, StoreError> {
        let key = self.key_for(id)?;
        let mut entry = self.records.get_mut(&key).ok_or(StoreError::NotFound)?;
        let record = entry.value_mut();
        if record.status != AuthorizationStatus::Pending || record.tx_hash.is_some() {
            return Ok(false);
        }
        self.write(&JournalEntry::AttemptTx { id, tx_hash })?;
        record.tx_hash = Some(tx_hash);
        Ok(true)
    }

    /// Every authorization sent or received by `party`, newest first.
    pub fn list_by_party(&self, party: EvmAddress) -> Result<Vec<Authorization>, StoreError> {
        let now = self.clock.now()?;
        let mut matches: Vec<(u64, Authorization)> = self
            .records
            .iter()
            .filter(|record| {
                record.signed.message.from == party || record.signed.message.to == party
            })
            .map(|record| (record.seq, record.view(now)))
            .collect();
        matches.sort_by(|(seq_a, a), (seq_b, b)| {
            b.created_at.cmp(&a.created_at).then(seq_b.cmp(seq_a))
        });
        Ok(matches.into_iter().map(|(_, view)| view).collect())
    }

    /// Takes the in-flight lease for `(chainId, nonce)`.
    pub fn claim(&self, chain_id: u64, nonce: HexEncodedNonce) -> Result<SubmissionClaim, StoreError> {
        let key = (chain_id, nonce);
        if !self.claims.insert(key) {
            return Err(StoreError::AlreadyClaimed { chain_id, nonce });
        }
        Ok(SubmissionClaim {
            claims: Arc::clone(&self.claims),
            key,
        })
    }

    pub fn record_attempt(&self, attempt: SubmissionAttempt) -> Result<(), StoreError> {
        self.write(&JournalEntry::Attempt {
            attempt: attempt.clone(),
        })?;
        self.attempts
            .entry((attempt.chain_id, attempt.nonce))
            .or_default()
            .push(attempt);
        Ok(())
    }

    pub fn attempts(&self, chain_id: u64, nonce: HexEncodedNonce) -> Vec<SubmissionAttempt> {
        self.attempts
            .get(&(chain_id, nonce))
            .map(|attempts| attempts.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{address, record_fixture};
    use crate::timestamp::ManualClock;

    fn store(now: u64) -> (Arc<ManualClock>, AuthorizationStore) {
        let clock = Arc::new(ManualClock::at(now));
        let store = AuthorizationStore::in_memory(clock.clone());
        (clock, store)
    }

    #[test]
    fn nonce_is_unique_per_chain_across_senders() {
        let (_, store) = store(1_000);
        let first = record_fixture(42220, 1, 2, 0xaa, 2_000);
        store.create(&first).unwrap();

        let other_sender = record_fixture(42220, 3, 2, 0xaa, 2_000);
        assert!(matches!(
            store.create(&other_sender),
            Err(StoreError::DuplicateNonce { chain_id: 42220, .. })
        ));

        let other_chain = record_fixture(8453, 1, 2, 0xaa, 2_000);
        assert!(store.create(&other_chain).is_ok());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn get_or_create_is_idempotent_for_identical_payloads() {
        let (_, store) = store(1_000);
        let signed = record_fixture(42220, 1, 2, 0x01, 2_000);
        let first = store.get_or_create(&signed).unwrap();
        let second = store.get_or_create(&signed).unwrap();
        assert_eq!(first.id, second.id);

        let mut tampered = signed;
        tampered.message.to = address(9);
        assert!(matches!(
            store.get_or_create(&tampered),
            Err(StoreError::DuplicateNonce { .. })
        ));
    }

    #[test]
    fn exactly_one_concurrent_mark_used_wins() {
        let (_, store) = store(1_000);
        let record = store.create(&record_fixture(42220, 1, 2, 0x02, 2_000)).unwrap();
        let winners = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16u8)
                .map(|i| {
                    let store = &store;
                    scope.spawn(move || {
                        store
                            .mark_used(record.id, TransactionHash([i; 32]), UnixTimestamp(1_500))
                            .is_ok()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or(false))
                .filter(|won| *won)
                .count()
        });
        assert_eq!(winners, 1);
        let stored = store.get_by_id(record.id).unwrap();
        assert_eq!(stored.status, AuthorizationStatus::Used);
        assert_eq!(stored.used_at, Some(UnixTimestamp(1_000)));
        assert!(stored.tx_hash.is_some());
    }

    #[test]
    fn mark_used_requires_open_window() {
        let (_, store) = store(1_000);
        let record = store.create(&record_fixture(42220, 1, 2, 0x03, 2_000)).unwrap();
        let result = store.mark_used(record.id, TransactionHash([1; 32]), UnixTimestamp(2_000));
        assert!(matches!(
            result,
            Err(StoreError::InvalidTransition {
                from: AuthorizationStatus::Expired,
                to: AuthorizationStatus::Used,
                ..
            })
        ));
        assert_eq!(store.get_by_id(record.id).unwrap().status, AuthorizationStatus::Pending);
    }

    #[test]
    fn terminal_records_are_immutable() {
        let (_, store) = store(1_000);
        let record = store.create(&record_fixture(42220, 1, 2, 0x04, 2_000)).unwrap();
        let used = store
            .mark_used(record.id, TransactionHash([7; 32]), UnixTimestamp(1_000))
            .unwrap();

        assert!(matches!(
            store.mark_cancelled(record.id),
            Err(StoreError::InvalidTransition {
                from: AuthorizationStatus::Used,
                ..
            })
        ));
        assert!(!store.record_attempt_tx(record.id, TransactionHash([8; 32])).unwrap());
        assert!(
            store
                .mark_used(record.id, TransactionHash([9; 32]), UnixTimestamp(1_000))
                .is_err()
        );
        assert_eq!(store.get_by_id(record.id).unwrap(), used);
    }

    #[test]
    fn first_broadcast_hash_is_kept() {
        let (_, store) = store(1_000);
        let record = store.create(&record_fixture(42220, 1, 2, 0x07, 2_000)).unwrap();
        assert!(store.record_attempt_tx(record.id, TransactionHash([1; 32])).unwrap());
        assert!(!store.record_attempt_tx(record.id, TransactionHash([2; 32])).unwrap());
        assert_eq!(
            store.get_by_id(record.id).unwrap().tx_hash,
            Some(TransactionHash([1; 32]))
        );
    }

    #[test]
    fn expired_is_derived_and_used_takes_precedence() {
        let (clock, store) = store(1_000);
        let pending = store.create(&record_fixture(42220, 1, 2, 0x05, 2_000)).unwrap();
        let used = store.create(&record_fixture(42220, 1, 2, 0x06, 2_000)).unwrap();
        store
            .mark_used(used.id, TransactionHash([1; 32]), UnixTimestamp(1_500))
            .unwrap();

        clock.set(2_000);
        assert_eq!(store.get_by_id(pending.id).unwrap().status, AuthorizationStatus::Expired);
        assert_eq!(store.get_by_id(used.id).unwrap().status, AuthorizationStatus::Used);

        let cancelled = store.mark_cancelled(pending.id).unwrap();
        assert_eq!(cancelled.status, AuthorizationStatus::Cancelled);
    }

    #[test]
    fn list_by_party_is_newest_first() {
        let (clock, store) = store(1_000);
        store.create(&record_fixture(42220, 1, 2, 0x10, 9_000)).unwrap();
        clock.advance(10);
        store.create(&record_fixture(42220, 3, 1, 0x11, 9_000)).unwrap();
        clock.advance(10);
        store.create(&record_fixture(42220, 4, 5, 0x12, 9_000)).unwrap();

        let history = store.list_by_party(address(1)).unwrap();
        let nonces: Vec<u8> = history.iter().map(|a| a.signed.message.nonce.0[0]).collect();
        assert_eq!(nonces, vec![0x11, 0x10]);
        assert!(store.list_by_party(address(6)).unwrap().is_empty());
    }

    #[test]
    fn claims_are_exclusive_until_dropped() {
        let (_, store) = store(1_000);
        let nonce = HexEncodedNonce([0x20; 32]);
        let claim = store.claim(42220, nonce).unwrap();
        assert!(matches!(
            store.claim(42220, nonce),
            Err(StoreError::AlreadyClaimed { .. })
        ));
        assert!(store.claim(8453, nonce).is_ok());
        drop(claim);
        assert!(store.claim(42220, nonce).is_ok());
    }

    #[tokio::test]
    async fn journal_replays_records_and_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let clock = Arc::new(ManualClock::at(1_000));
        let signed = record_fixture(42220, 1, 2, 0x30, 2_000);
        let id = {
            let store = AuthorizationStore::open(&path, clock.clone()).await.unwrap();
            let record = store.create(&signed).unwrap();
            store.record_attempt_tx(record.id, TransactionHash([2; 32])).unwrap();
            store
                .mark_used(record.id, TransactionHash([3; 32]), UnixTimestamp(1_100))
                .unwrap();
            store
                .record_attempt(SubmissionAttempt {
                    chain_id: 42220,
                    nonce: signed.message.nonce,
                    at: UnixTimestamp(1_100),
                    outcome: AttemptOutcome::Confirmed,
                    tx_hash: Some(TransactionHash([3; 32])),
                    reason: None,
                })
                .unwrap();
            store.sync().await.unwrap();
            record.id
        };

        let reopened = AuthorizationStore::open(&path, clock).await.unwrap();
        let record = reopened.get(42220, signed.message.nonce).unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.status, AuthorizationStatus::Used);
        assert_eq!(record.tx_hash, Some(TransactionHash([3; 32])));
        assert_eq!(reopened.attempts(42220, signed.message.nonce).len(), 1);
        assert!(matches!(
            reopened.create(&signed),
            Err(StoreError::DuplicateNonce { .. })
        ));
    }

    #[tokio::test]
    async fn terminal_transitions_are_on_disk_after_sync() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let clock = Arc::new(ManualClock::at(1_000));
        let store = AuthorizationStore::open(&path, clock).await.unwrap();
        let used = store.create(&record_fixture(42220, 1, 2, 0x31, 2_000)).unwrap();
        let cancelled = store.create(&record_fixture(42220, 1, 2, 0x32, 2_000)).unwrap();
        store
            .mark_used(used.id, TransactionHash([4; 32]), UnixTimestamp(1_000))
            .unwrap();
        store.mark_cancelled(cancelled.id).unwrap();
        store.sync().await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let events: Vec<String> = contents
            .lines()
            .map(|line| {
                let entry: serde_json::Value = serde_json::from_str(line).unwrap();
                entry["event"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(events, vec!["created", "created", "used", "cancelled"]);
    }
}
