//! In-process implementation of the coordination store client.
//!
//! The real coordination store is an external, strongly-consistent
//! service (spec §1 non-goals: "the core depends on an external
//! strongly-consistent store ... a custom consensus implementation" is
//! explicitly out of scope). This type provides the same CAS / watch /
//! lock / ephemeral-key contract in-process, so the rest of the
//! workspace can be built and tested against the real façade shape
//! without standing up that external service.

use crate::error::{StoreError, StoreResult};
use crate::schema::SchemaRegistry;
use crate::session::{Session, SessionId, SessionIdAllocator};
use crate::watch::{ChangeEvent, ChangeKind, WatchHandle};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, warn};

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    version: u64,
}

#[derive(Debug)]
struct LockState {
    holder_id: String,
    session: SessionId,
    depth: u32,
}

#[derive(Debug, Default)]
struct SessionState {
    ephemeral_paths: BTreeSet<String>,
    locks_held: BTreeSet<String>,
}

struct Inner {
    entries: BTreeMap<String, Entry>,
    schema_version: u32,
    sessions: HashMap<SessionId, SessionState>,
    locks: HashMap<String, LockState>,
}

/// A value read from the store along with its CAS version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

/// A held advisory lock. Must be passed to [`StoreClient::release`] to
/// release it deterministically; dropping it leaks the lock until the
/// holding session ends (same as the real store: "lock is released
/// automatically on session loss", spec §4.1).
#[derive(Debug)]
pub struct LockHandle {
    pub name: String,
    pub holder_id: String,
    session: SessionId,
}

/// Typed, schema-versioned façade over the coordination store (spec
/// §4.1, component C1). Cheap to clone; all clones share the same
/// underlying state.
#[derive(Clone)]
pub struct StoreClient {
    inner: Arc<Mutex<Inner>>,
    changes: broadcast::Sender<ChangeEvent>,
    session_alloc: Arc<SessionIdAllocator>,
    lock_released: Arc<Notify>,
    schema: Arc<SchemaRegistry>,
}

impl StoreClient {
    /// Connects against `schema`, checking the store's declared version.
    /// Fails loudly if the store's declared version isn't one this
    /// binary was built to understand (spec §4.1).
    pub fn connect(schema: SchemaRegistry, declared_schema_version: u32) -> StoreResult<Self> {
        schema.resolve(declared_schema_version)?;
        let (changes, _rx) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: BTreeMap::new(),
                schema_version: declared_schema_version,
                sessions: HashMap::new(),
                locks: HashMap::new(),
            })),
            changes,
            session_alloc: Arc::new(SessionIdAllocator::default()),
            lock_released: Arc::new(Notify::new()),
            schema: Arc::new(schema),
        })
    }

    /// Convenience constructor using the baseline schema at version 1,
    /// for binaries and tests that don't need schema evolution.
    pub fn connect_baseline() -> Self {
        Self::connect(SchemaRegistry::baseline(), 1).expect("baseline schema resolves itself")
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    /// Resolves a logical field to its physical path under the
    /// currently active schema version and appends `id` (spec §4.1:
    /// `get(logical_field, id)`). Rejects fields the active schema
    /// version doesn't know about with `UnknownField` (spec P3).
    pub async fn resolve_path(&self, logical_field: &str, id: &str) -> StoreResult<String> {
        let base = self.resolve_root(logical_field).await?;
        Ok(format!("{base}/{id}"))
    }

    /// Resolves a logical field to its bare physical root, for
    /// singleton entities and prefix scans that have no per-id suffix.
    pub async fn resolve_root(&self, logical_field: &str) -> StoreResult<String> {
        let version = self.schema_version().await;
        let map = self.schema.resolve(version)?;
        Ok(map.resolve(logical_field)?.to_string())
    }

    pub async fn begin_session(&self) -> Session {
        let id = self.session_alloc.next();
        let mut inner = self.inner.lock().await;
        inner.sessions.insert(id, SessionState::default());
        Session { id }
    }

    /// Ends a session: drops all its ephemeral keys and releases all
    /// locks it held (spec I4: "If the session expires, the key
    /// disappears and re-election fires").
    pub async fn end_session(&self, session: Session) {
        let mut inner = self.inner.lock().await;
        let Some(state) = inner.sessions.remove(&session.id) else {
            return;
        };
        for path in state.ephemeral_paths {
            if inner.entries.remove(&path).is_some() {
                let _ = self.changes.send(ChangeEvent {
                    path,
                    version: 0,
                    kind: ChangeKind::Delete,
                });
            }
        }
        for name in state.locks_held {
            inner.locks.remove(&name);
        }
        drop(inner);
        self.lock_released.notify_waiters();
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> StoreResult<Option<Versioned<T>>> {
        let inner = self.inner.lock().await;
        match inner.entries.get(path) {
            None => Ok(None),
            Some(entry) => {
                let value: T =
                    serde_json::from_slice(&entry.value).map_err(|source| StoreError::Codec {
                        path: path.to_string(),
                        source,
                    })?;
                Ok(Some(Versioned {
                    value,
                    version: entry.version,
                }))
            }
        }
    }

    /// Lists all entries whose path starts with `prefix`, for the
    /// initial-reconciliation scans controllers need in addition to
    /// watches (e.g. "every VM currently hosted on this node").
    pub async fn list_prefix<T: DeserializeOwned>(
        &self,
        prefix: &str,
    ) -> StoreResult<Vec<(String, Versioned<T>)>> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .map(|(path, entry)| {
                let value: T =
                    serde_json::from_slice(&entry.value).map_err(|source| StoreError::Codec {
                        path: path.clone(),
                        source,
                    })?;
                Ok((
                    path.clone(),
                    Versioned {
                        value,
                        version: entry.version,
                    },
                ))
            })
            .collect()
    }

    /// Compare-and-set write. `expected_version` of `None` requires the
    /// key to not exist (create-only); `Some(v)` requires the current
    /// version to equal `v`. Returns the new version on success.
    pub async fn cas<T: Serialize>(
        &self,
        path: &str,
        expected_version: Option<u64>,
        value: &T,
    ) -> StoreResult<u64> {
        let encoded = serde_json::to_vec(value).map_err(|source| StoreError::Codec {
            path: path.to_string(),
            source,
        })?;
        let mut inner = self.inner.lock().await;
        let actual = inner.entries.get(path).map(|e| e.version).unwrap_or(0);
        if expected_version.unwrap_or(0) != actual {
            return Err(StoreError::VersionConflict {
                path: path.to_string(),
                expected: expected_version,
                actual,
            });
        }
        let new_version = actual + 1;
        inner.entries.insert(
            path.to_string(),
            Entry {
                value: Bytes::from(encoded),
                version: new_version,
            },
        );
        debug!(path, new_version, "store cas applied");
        let _ = self.changes.send(ChangeEvent {
            path: path.to_string(),
            version: new_version,
            kind: ChangeKind::Put,
        });
        Ok(new_version)
    }

    pub async fn delete(&self, path: &str, expected_version: u64) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let actual = inner.entries.get(path).map(|e| e.version).unwrap_or(0);
        if actual != expected_version {
            return Err(StoreError::VersionConflict {
                path: path.to_string(),
                expected: Some(expected_version),
                actual,
            });
        }
        inner.entries.remove(path);
        let _ = self.changes.send(ChangeEvent {
            path: path.to_string(),
            version: 0,
            kind: ChangeKind::Delete,
        });
        Ok(())
    }

    /// Writes a key whose lifetime is tied to `session` (spec §4.1). The
    /// key is removed automatically when the session ends.
    pub async fn ephemeral_put<T: Serialize>(
        &self,
        session: &Session,
        path: &str,
        value: &T,
    ) -> StoreResult<u64> {
        let encoded = serde_json::to_vec(value).map_err(|source| StoreError::Codec {
            path: path.to_string(),
            source,
        })?;
        let mut inner = self.inner.lock().await;
        if !inner.sessions.contains_key(&session.id) {
            return Err(StoreError::SessionLost);
        }
        let actual = inner.entries.get(path).map(|e| e.version).unwrap_or(0);
        let new_version = actual + 1;
        inner.entries.insert(
            path.to_string(),
            Entry {
                value: Bytes::from(encoded),
                version: new_version,
            },
        );
        inner
            .sessions
            .get_mut(&session.id)
            .expect("checked above")
            .ephemeral_paths
            .insert(path.to_string());
        let _ = self.changes.send(ChangeEvent {
            path: path.to_string(),
            version: new_version,
            kind: ChangeKind::Put,
        });
        Ok(new_version)
    }

    /// Creates an ephemeral key only if it does not already exist,
    /// failing with [`StoreError::VersionConflict`] otherwise. This is
    /// the election primitive (spec §4.8: "each coordinator attempts to
    /// create the primary-node key... the winner becomes primary").
    pub async fn ephemeral_create<T: Serialize>(
        &self,
        session: &Session,
        path: &str,
        value: &T,
    ) -> StoreResult<u64> {
        let encoded = serde_json::to_vec(value).map_err(|source| StoreError::Codec {
            path: path.to_string(),
            source,
        })?;
        let mut inner = self.inner.lock().await;
        if !inner.sessions.contains_key(&session.id) {
            return Err(StoreError::SessionLost);
        }
        if let Some(existing) = inner.entries.get(path) {
            return Err(StoreError::VersionConflict {
                path: path.to_string(),
                expected: None,
                actual: existing.version,
            });
        }
        inner.entries.insert(
            path.to_string(),
            Entry {
                value: Bytes::from(encoded),
                version: 1,
            },
        );
        inner
            .sessions
            .get_mut(&session.id)
            .expect("checked above")
            .ephemeral_paths
            .insert(path.to_string());
        let _ = self.changes.send(ChangeEvent {
            path: path.to_string(),
            version: 1,
            kind: ChangeKind::Put,
        });
        Ok(1)
    }

    /// Subscribes to changes under `path_prefix`. Delivery is
    /// at-least-once and serial per path (spec §4.1, §5).
    pub fn watch(&self, path_prefix: impl Into<String>) -> WatchHandle {
        WatchHandle::new(path_prefix.into(), self.changes.subscribe())
    }

    /// Acquires the named advisory lock, reentrant by `holder_id`
    /// (spec §4.1). Blocks up to `timeout` if held by a different
    /// holder. The lock is tied to `session`: it is released
    /// automatically when that session ends, even without an explicit
    /// `release` call (spec §4.1, design notes "lock loss mid-operation
    /// is treated as a failure").
    pub async fn lock(
        &self,
        name: &str,
        holder_id: &str,
        session: &Session,
        timeout: Duration,
    ) -> StoreResult<LockHandle> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut inner = self.inner.lock().await;
                if !inner.sessions.contains_key(&session.id) {
                    return Err(StoreError::SessionLost);
                }
                match inner.locks.get_mut(name) {
                    None => {
                        inner.locks.insert(
                            name.to_string(),
                            LockState {
                                holder_id: holder_id.to_string(),
                                session: session.id,
                                depth: 1,
                            },
                        );
                        inner
                            .sessions
                            .get_mut(&session.id)
                            .expect("checked above")
                            .locks_held
                            .insert(name.to_string());
                        return Ok(LockHandle {
                            name: name.to_string(),
                            holder_id: holder_id.to_string(),
                            session: session.id,
                        });
                    }
                    Some(state) if state.holder_id == holder_id && state.session == session.id => {
                        state.depth += 1;
                        return Ok(LockHandle {
                            name: name.to_string(),
                            holder_id: holder_id.to_string(),
                            session: session.id,
                        });
                    }
                    Some(state) => {
                        warn!(name, held_by = %state.holder_id, requested_by = holder_id, "lock contended");
                    }
                }
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(StoreError::Timeout(format!("lock {name}")));
            }
            let _ = tokio::time::timeout(remaining, self.lock_released.notified()).await;
        }
    }

    /// Releases a held lock. Idempotent: releasing an already-released
    /// handle (or one whose lock was dropped on session loss) is a
    /// no-op (spec §4.1: "release(handle) is idempotent").
    pub async fn release(&self, handle: LockHandle) {
        let mut inner = self.inner.lock().await;
        let mut removed = false;
        if let Some(state) = inner.locks.get_mut(&handle.name) {
            if state.holder_id == handle.holder_id {
                state.depth = state.depth.saturating_sub(1);
                if state.depth == 0 {
                    inner.locks.remove(&handle.name);
                    removed = true;
                }
            }
        }
        if removed {
            if let Some(session_state) = inner.sessions.get_mut(&handle.session) {
                session_state.locks_held.remove(&handle.name);
            }
        }
        drop(inner);
        self.lock_released.notify_waiters();
    }

    pub async fn schema_version(&self) -> u32 {
        self.inner.lock().await.schema_version
    }
}
