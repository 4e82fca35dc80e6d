//! The LDAP projector: a listener that continuously mirrors committed
//! Database snapshots into the directory server. It owns the connection,
//! remembers the last successfully projected tree, and only ever sends
//! the difference.

use std::collections::HashSet;
use std::time::Duration;

use ldap3::{LdapConnAsync, LdapError, Mod};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::database::Database;
use crate::ldap::tree::{self, AttributeMod, LdapTree};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct LdapProjector {
    url: String,
    bind_dn: String,
    password: String,
    suffix: String,
}

impl LdapProjector {
    pub fn new(suffix: &str, url: String, password: String) -> Self {
        LdapProjector {
            url,
            bind_dn: tree::service_user_dn(suffix),
            password,
            suffix: suffix.to_string(),
        }
    }

    /// The projector's event loop. Receives snapshots queued by the nexus
    /// listener; bursts are coalesced down to the newest snapshot, since
    /// intermediate states need not be materialized on the server.
    ///
    /// After every (re)connect the last-projected tree is reset to empty,
    /// so the first projection resynchronizes the full tree. Per-object
    /// failures are logged and retried on the next projection; connection
    /// failures trigger a reconnect with exponential backoff.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<Database>, cancel: CancellationToken) {
        let mut latest: Option<Database> = None;
        let mut backoff = INITIAL_BACKOFF;

        'reconnect: loop {
            if latest.is_none() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    received = rx.recv() => match received {
                        Some(db) => latest = Some(db),
                        None => return,
                    },
                }
            }

            let mut ldap = match self.connect().await {
                Ok(ldap) => {
                    backoff = INITIAL_BACKOFF;
                    ldap
                }
                Err(err) => {
                    tracing::warn!(url = %self.url, %err, "cannot reach LDAP server, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };
            tracing::info!(url = %self.url, "connected to LDAP server");
            let mut projected = LdapTree::new();

            loop {
                while let Ok(db) = rx.try_recv() {
                    latest = Some(db);
                }
                if let Some(db) = latest.take() {
                    let target = tree::render_tree(&db, &self.suffix);
                    if let Err(err) = apply(&mut ldap, &mut projected, target).await {
                        // put the snapshot back so it is retried after
                        // the reconnect
                        latest = Some(db);
                        tracing::warn!(%err, "LDAP connection failed, reconnecting");
                        continue 'reconnect;
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = ldap.unbind().await;
                        return;
                    }
                    received = rx.recv() => match received {
                        Some(db) => latest = Some(db),
                        None => {
                            let _ = ldap.unbind().await;
                            return;
                        }
                    },
                }
            }
        }
    }

    async fn connect(&self) -> Result<ldap3::Ldap, LdapError> {
        let (conn, mut ldap) = LdapConnAsync::new(&self.url).await?;
        ldap3::drive!(conn);
        ldap.simple_bind(&self.bind_dn, &self.password).await?.success()?;
        Ok(ldap)
    }
}

/// Applies the difference between `projected` and `target`. Entries are
/// moved into `projected` only once the server has acknowledged them, so
/// a failed object stays part of the next diff. An `Err` from the client
/// itself (as opposed to an error result from the server) means the
/// connection is gone and bubbles up to trigger a reconnect.
async fn apply(
    ldap: &mut ldap3::Ldap,
    projected: &mut LdapTree,
    target: LdapTree,
) -> Result<(), LdapError> {
    let plan = tree::diff_trees(projected, &target);
    if plan.is_empty() {
        return Ok(());
    }
    tracing::debug!(
        adds = plan.adds.len(),
        modifies = plan.modifies.len(),
        deletes = plan.deletes.len(),
        "projecting database to LDAP"
    );

    for object in plan.adds {
        let attrs: Vec<(String, HashSet<String>)> = object
            .attributes
            .iter()
            .map(|(name, values)| (name.clone(), values.iter().cloned().collect()))
            .collect();
        match ldap.add(&object.dn, attrs).await?.success() {
            Ok(_) => {
                projected.insert(object.dn.clone(), object);
            }
            Err(err) => tracing::error!(dn = %object.dn, %err, "cannot create LDAP object"),
        }
    }

    for (dn, changes) in plan.modifies {
        match ldap.modify(&dn, mods_for(&changes)).await?.success() {
            Ok(_) => {
                if let Some(object) = target.get(&dn) {
                    projected.insert(dn.clone(), object.clone());
                }
            }
            Err(err) => tracing::error!(dn = %dn, %err, "cannot modify LDAP object"),
        }
    }

    for dn in plan.deletes {
        match ldap.delete(&dn).await?.success() {
            Ok(_) => {
                projected.remove(&dn);
            }
            Err(err) => tracing::error!(dn = %dn, %err, "cannot delete LDAP object"),
        }
    }

    Ok(())
}

fn mods_for(changes: &[AttributeMod]) -> Vec<Mod<String>> {
    changes
        .iter()
        .map(|change| match change {
            AttributeMod::Replace(name, values) => {
                Mod::Replace(name.clone(), values.iter().cloned().collect())
            }
            AttributeMod::Remove(name) => Mod::Delete(name.clone(), HashSet::new()),
        })
        .collect()
}
