//! The nexus holds the one current Database snapshot. All reads and
//! updates in the process go through it: updates follow the state-reducer
//! pattern and are serialized under a single mutex, committed snapshots
//! fan out to registered listeners.

use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::database::Database;
use crate::seed::DatabaseSeed;
use crate::validation::{self, ValidationError};

/// Optional behavior for `Nexus::update`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    /// If true, conflicts with the seed are reported as validation errors.
    /// If false (default), they are corrected silently.
    pub conflict_with_seed_is_error: bool,
}

type ListenerCallback = Box<dyn Fn(&Database) + Send>;

struct Listener {
    token: CancellationToken,
    callback: ListenerCallback,
}

pub struct Nexus {
    seed: Option<DatabaseSeed>,
    // guards the snapshot and the listener list; listener callbacks run
    // while it is held, so they must not call back into the nexus
    inner: Mutex<NexusInner>,
}

#[derive(Default)]
struct NexusInner {
    db: Database,
    listeners: Vec<Listener>,
}

impl Nexus {
    pub fn new(seed: Option<DatabaseSeed>) -> Self {
        Nexus { seed, inner: Mutex::new(NexusInner::default()) }
    }

    /// Registers a listener. Whenever the database changes, the callback is
    /// invoked with the committed snapshot; if the database is already
    /// populated, the callback fires once immediately. The listener is
    /// skipped (and eventually dropped) once `token` is cancelled.
    ///
    /// Callbacks run on whatever thread performs the update and under the
    /// nexus mutex. They must be cheap and must not re-enter the nexus;
    /// anything nontrivial should be queued onto the listener's own task.
    pub fn add_listener<F>(&self, token: CancellationToken, callback: F)
    where
        F: Fn(&Database) + Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        if !inner.db.is_empty() && !token.is_cancelled() {
            callback(&inner.db);
        }
        inner.listeners.push(Listener { token, callback: Box::new(callback) });
    }

    /// Runs a closure against the current snapshot. Used for reads; the
    /// closure must not block.
    pub fn read<T>(&self, f: impl FnOnce(&Database) -> T) -> T {
        let inner = self.inner.lock().unwrap();
        f(&inner.db)
    }

    /// Applies a reducer to a clone of the current database, then
    /// normalizes, enforces the seed, and validates the result. On any
    /// error the old snapshot stays current and listeners are not
    /// notified. A committed result that equals the current snapshot also
    /// produces no notification — this breaks the
    /// update → disk write → watch event → disk read → update cycle.
    pub fn update<R>(&self, reducer: R, opts: UpdateOptions) -> Result<(), Vec<ValidationError>>
    where
        R: FnOnce(&mut Database) -> Result<(), ValidationError>,
    {
        let mut inner = self.inner.lock().unwrap();

        let mut candidate = inner.db.clone();
        if let Err(err) = reducer(&mut candidate) {
            return Err(vec![err]);
        }
        candidate.normalize();

        let mut errors = Vec::new();
        if let Some(seed) = &self.seed {
            if opts.conflict_with_seed_is_error {
                errors.extend(seed.check_conflicts(&candidate));
            } else {
                seed.apply_to(&mut candidate);
                candidate.normalize();
            }
        }
        errors.extend(validation::validate(&candidate));
        if !errors.is_empty() {
            return Err(errors);
        }

        if candidate == inner.db {
            return Ok(());
        }
        inner.db = candidate;

        inner.listeners.retain(|l| !l.token.is_cancelled());
        let NexusInner { db, listeners } = &*inner;
        for listener in listeners {
            (listener.callback)(db);
        }
        Ok(())
    }
}
