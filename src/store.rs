//! The file store: a single JSON file is the durable truth between
//! process restarts. Saves go through a sibling temp file, fsync and an
//! atomic rename; a directory watch picks up outside edits. A fingerprint
//! of the last written snapshot lets the store tell its own writes apart
//! from external ones.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::database::Database;
use crate::errors::PortunusError;
use crate::nexus::{Nexus, UpdateOptions};

pub struct FileStore {
    path: PathBuf,
    // fingerprint of the snapshot this store last wrote (or found on disk
    // at startup); watch events whose contents match it are self-echoes
    last_written: Mutex<Option<Database>>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileStore { path: path.into(), last_written: Mutex::new(None) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the database file, or creates it from `initial` when missing.
    /// Called once at startup, before the watch loop runs.
    pub fn initialize(
        &self,
        initial: impl FnOnce() -> Result<Database, PortunusError>,
    ) -> Result<Database, PortunusError> {
        if self.path.exists() {
            let db = self.read_file()?;
            tracing::info!(
                path = %self.path.display(),
                users = db.users.len(),
                groups = db.groups.len(),
                "loaded database file"
            );
            *self.last_written.lock().unwrap() = Some(db.clone());
            Ok(db)
        } else {
            let db = initial()?;
            self.save(&db)?;
            tracing::info!(path = %self.path.display(), "created initial database file");
            Ok(db)
        }
    }

    fn read_file(&self) -> Result<Database, PortunusError> {
        let contents = std::fs::read_to_string(&self.path)?;
        let mut db: Database = serde_json::from_str(&contents)?;
        db.normalize();
        Ok(db)
    }

    /// Writes the snapshot to disk atomically: temp file in the same
    /// directory, fsync, rename over the target. A snapshot equal to the
    /// last written one is skipped outright.
    pub fn save(&self, db: &Database) -> Result<(), PortunusError> {
        if self.last_written.lock().unwrap().as_ref() == Some(db) {
            return Ok(());
        }

        let json = db.to_canonical_json()?;
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|err| PortunusError::Io(err.error))?;

        *self.last_written.lock().unwrap() = Some(db.clone());
        tracing::debug!(path = %self.path.display(), "wrote database file");
        Ok(())
    }

    /// Reacts to a change notification for the database file. A parse
    /// error keeps the last known good state; a self-echo (contents equal
    /// to what we last wrote) is ignored; everything else is pushed into
    /// the nexus as a regular update.
    pub fn handle_external_change(&self, nexus: &Nexus) {
        let db = match self.read_file() {
            Ok(db) => db,
            Err(err) => {
                tracing::error!(
                    path = %self.path.display(),
                    %err,
                    "cannot re-read database file; keeping last known good state"
                );
                return;
            }
        };

        if self.last_written.lock().unwrap().as_ref() == Some(&db) {
            tracing::debug!(path = %self.path.display(), "ignoring watch event for our own write");
            return;
        }

        tracing::info!(path = %self.path.display(), "database file changed on disk, reloading");
        let result = nexus.update(
            move |current| {
                *current = db;
                Ok(())
            },
            UpdateOptions::default(),
        );
        if let Err(errors) = result {
            for error in errors {
                tracing::error!(%error, "rejecting changed database file");
            }
        }
    }

    /// The store's event loop: persists snapshots queued by the nexus
    /// listener and reloads on watch events, until `cancel` fires.
    pub async fn run(
        self: Arc<Self>,
        nexus: Arc<Nexus>,
        mut save_rx: mpsc::UnboundedReceiver<Database>,
        cancel: CancellationToken,
    ) -> Result<(), PortunusError> {
        let (watch_tx, mut watch_rx) = mpsc::unbounded_channel();
        let watched = self.path.clone();
        let mut watcher =
            notify::recommended_watcher(move |result: Result<notify::Event, notify::Error>| {
                match result {
                    Ok(event) => {
                        if event.paths.is_empty() || event.paths.iter().any(|p| p == &watched) {
                            let _ = watch_tx.send(());
                        }
                    }
                    Err(err) => tracing::warn!(%err, "file watch error"),
                }
            })?;
        let dir = self.path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        tracing::debug!(path = %dir.display(), "watching state directory");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                Some(db) = save_rx.recv() => {
                    // coalesce bursts down to the newest snapshot
                    let mut db = db;
                    while let Ok(next) = save_rx.try_recv() {
                        db = next;
                    }
                    if let Err(err) = self.save(&db) {
                        tracing::error!(
                            %err,
                            "cannot persist database; in-memory state remains authoritative"
                        );
                    }
                }
                Some(()) = watch_rx.recv() => {
                    while watch_rx.try_recv().is_ok() {}
                    self.handle_external_change(&nexus);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::User;
    use crate::validation::ValidationError;

    fn test_db(login: &str) -> Database {
        let mut db = Database {
            users: vec![User {
                login_name: login.into(),
                given_name: "Jane".into(),
                family_name: "Doe".into(),
                email: None,
                ssh_public_keys: vec![],
                password_hash: "$6$salt$hash".into(),
                posix: None,
            }],
            groups: vec![],
        };
        db.normalize();
        db
    }

    fn replace_with(
        db: Database,
    ) -> impl FnOnce(&mut Database) -> Result<(), ValidationError> {
        move |current| {
            *current = db;
            Ok(())
        }
    }

    #[test]
    fn test_initialize_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("database.json"));
        let db = store.initialize(|| Ok(test_db("alice"))).unwrap();
        assert!(store.path().exists());
        assert_eq!(db.users.len(), 1);

        let reread = store.read_file().unwrap();
        assert_eq!(reread, db);
    }

    #[test]
    fn test_initialize_reads_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.json");
        std::fs::write(&path, test_db("bob").to_canonical_json().unwrap()).unwrap();

        let store = FileStore::new(&path);
        let db = store
            .initialize(|| panic!("initializer must not run for an existing file"))
            .unwrap();
        assert_eq!(db.users[0].login_name, "bob");
    }

    #[test]
    fn test_save_is_byte_stable() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("database.json"));
        store.save(&test_db("alice")).unwrap();
        let first = std::fs::read(store.path()).unwrap();

        let other = FileStore::new(store.path());
        other.save(&test_db("alice")).unwrap();
        assert_eq!(std::fs::read(store.path()).unwrap(), first);
    }

    #[test]
    fn test_own_write_is_recognized_as_echo() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("database.json"));
        let nexus = Nexus::new(None);
        let db = test_db("alice");
        nexus.update(replace_with(db.clone()), UpdateOptions::default()).unwrap();
        store.save(&db).unwrap();

        // a watch event for our own write must not ripple back
        let seen = std::sync::Arc::new(Mutex::new(0));
        let sink = seen.clone();
        nexus.add_listener(CancellationToken::new(), move |_| {
            *sink.lock().unwrap() += 1;
        });
        assert_eq!(*seen.lock().unwrap(), 1);
        store.handle_external_change(&nexus);
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn test_external_change_reaches_the_nexus() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("database.json"));
        let nexus = Nexus::new(None);
        store.save(&test_db("alice")).unwrap();

        std::fs::write(store.path(), test_db("mallory").to_canonical_json().unwrap()).unwrap();
        store.handle_external_change(&nexus);
        assert!(nexus.read(|db| db.user("mallory").is_some()));
    }

    #[test]
    fn test_parse_error_keeps_last_known_good_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("database.json"));
        let nexus = Nexus::new(None);
        let db = test_db("alice");
        nexus.update(replace_with(db.clone()), UpdateOptions::default()).unwrap();
        store.save(&db).unwrap();

        std::fs::write(store.path(), "{ not json").unwrap();
        store.handle_external_change(&nexus);
        assert!(nexus.read(|db| db.user("alice").is_some()));
    }

    #[tokio::test]
    async fn test_run_persists_queued_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path().join("database.json")));
        let nexus = Arc::new(Nexus::new(None));
        let (save_tx, save_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(store.clone().run(nexus, save_rx, cancel.clone()));
        save_tx.send(test_db("alice")).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        assert!(store.path().exists());
        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
