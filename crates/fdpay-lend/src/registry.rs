//! Per-client bookkeeping of lent descriptor-backed resources.
//!
//! One [`FdRegistry`] is shared by every connection of a producer. Each
//! `(client, lend_id)` pair holds a reference count and a release closure;
//! the closure runs exactly once, outside the registry lock, when the count
//! drops to zero or the client is torn down.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use fdpay_wire::LendId;
use tracing::{debug, trace, warn};

type Release = Box<dyn FnOnce() + Send>;

struct LendEntry {
    refcount: u32,
    release: Release,
}

#[derive(Default)]
struct State {
    clients: HashMap<String, HashMap<LendId, LendEntry>>,
    /// Client entries plus the outstanding reservation for each lend id.
    live: HashMap<LendId, usize>,
    next_id: LendId,
}

impl State {
    fn forget(&mut self, lend_id: LendId) {
        if let Some(holders) = self.live.get_mut(&lend_id) {
            *holders -= 1;
            if *holders == 0 {
                self.live.remove(&lend_id);
            }
        }
    }
}

/// Result of [`FdRegistry::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The entry is still referenced `n` more times.
    Decremented(u32),
    /// The last reference went away and the release closure ran.
    Released,
    /// No such entry; duplicate or late release.
    Unknown,
}

/// Process-wide table of lends, keyed by client identity and lend id.
pub struct FdRegistry {
    state: Mutex<State>,
}

impl FdRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 1,
                ..State::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that `client` holds `resource` under `lend_id`.
    ///
    /// If the pair already exists its count is incremented and the extra
    /// `resource` is dropped without calling `release`. Returns the new count.
    pub fn add<R, F>(&self, client: &str, lend_id: LendId, resource: R, release: F) -> u32
    where
        R: Send + 'static,
        F: FnOnce(R) + Send + 'static,
    {
        let mut state = self.lock();
        let existing = state
            .clients
            .get_mut(client)
            .and_then(|lends| lends.get_mut(&lend_id));
        if let Some(entry) = existing {
            entry.refcount += 1;
            let refcount = entry.refcount;
            drop(state);
            trace!(client, lend_id, refcount, "lend re-sent");
            return refcount;
        }

        state.clients.entry(client.to_string()).or_default().insert(
            lend_id,
            LendEntry {
                refcount: 1,
                release: Box::new(move || release(resource)),
            },
        );
        *state.live.entry(lend_id).or_default() += 1;
        drop(state);
        trace!(client, lend_id, "lend added");
        1
    }

    /// Drop one reference of `client` on `lend_id`.
    ///
    /// Unknown pairs are tolerated: remote peers may release twice or late.
    pub fn remove(&self, client: &str, lend_id: LendId) -> Removal {
        let mut state = self.lock();
        let Some(lends) = state.clients.get_mut(client) else {
            debug!(client, lend_id, "release from client without lends");
            return Removal::Unknown;
        };
        let Some(entry) = lends.get_mut(&lend_id) else {
            warn!(client, lend_id, "release of unknown lend");
            return Removal::Unknown;
        };
        if entry.refcount > 1 {
            entry.refcount -= 1;
            return Removal::Decremented(entry.refcount);
        }

        let entry = lends.remove(&lend_id);
        if lends.is_empty() {
            state.clients.remove(client);
        }
        state.forget(lend_id);
        drop(state);

        if let Some(entry) = entry {
            trace!(client, lend_id, "lend released");
            (entry.release)();
        }
        Removal::Released
    }

    /// Drop every lend held by `client`, running each release closure once.
    ///
    /// Call this when a connection goes away without releasing. Returns the
    /// number of entries removed.
    pub fn remove_client(&self, client: &str) -> usize {
        let mut state = self.lock();
        let Some(lends) = state.clients.remove(client) else {
            return 0;
        };
        for lend_id in lends.keys() {
            state.forget(*lend_id);
        }
        drop(state);

        let count = lends.len();
        for (_, entry) in lends {
            (entry.release)();
        }
        debug!(client, count, "dropped client lends");
        count
    }

    /// Reserve a lend id that no entry or earlier reservation still uses.
    ///
    /// Ids increase monotonically, wrap around past `u32::MAX`, and never
    /// take the value 0. The id stays reserved until
    /// [`FdRegistry::release_lend_id`], whether or not any client ever
    /// confirms delivery. Returns `None` when every id is in use.
    pub fn next_lend_id(&self) -> Option<LendId> {
        let mut state = self.lock();
        // `next_id` is never 0, so one pass covers every usable id once.
        for _ in 0..LendId::MAX {
            let id = state.next_id;
            state.next_id = match id.wrapping_add(1) {
                0 => 1,
                next => next,
            };
            if !state.live.contains_key(&id) {
                state.live.insert(id, 1);
                return Some(id);
            }
        }
        warn!("every lend id is in use");
        None
    }

    /// Drop the reservation taken by [`FdRegistry::next_lend_id`].
    ///
    /// Client entries under the same id keep it in use until they go away.
    pub fn release_lend_id(&self, lend_id: LendId) {
        self.lock().forget(lend_id);
    }

    /// Whether `lend_id` is reserved or held by any client.
    pub fn is_lend_id_in_use(&self, lend_id: LendId) -> bool {
        self.lock().live.contains_key(&lend_id)
    }

    /// Current count of `client` on `lend_id`, or `None` if not held.
    pub fn refcount(&self, client: &str, lend_id: LendId) -> Option<u32> {
        self.lock()
            .clients
            .get(client)
            .and_then(|lends| lends.get(&lend_id))
            .map(|entry| entry.refcount)
    }

    /// Number of `(client, lend_id)` entries.
    pub fn len(&self) -> usize {
        self.lock().clients.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().clients.is_empty()
    }

    /// Number of clients holding at least one lend.
    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }
}

impl Default for FdRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FdRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("FdRegistry")
            .field("clients", &state.clients.len())
            .field("lends", &state.live.len())
            .finish()
    }
}
