//! The database seed: a declarative overlay loaded once at startup. Every
//! field present in the seed file is pinned — updates may change anything
//! else, but pinned fields are either silently reverted or rejected,
//! depending on the update options.

use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;

use crate::crypt;
use crate::database::{Database, Group, Permissions, PosixAttributes, User};
use crate::errors::PortunusError;
use crate::validation::{
    self, FieldRef, ValidationError, ERR_IS_DUPLICATE_IN_SEED, ERR_IS_MISSING,
};

pub const ERR_IS_PINNED: &str = "is pinned by the seed";
pub const ERR_IS_SEEDED: &str = "is seeded and may not be deleted";

/// The parsed seed file. Same shape as the database file; any present field
/// counts as pinned.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseSeed {
    #[serde(default)]
    pub users: Vec<UserSeed>,
    #[serde(default)]
    pub groups: Vec<GroupSeed>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserSeed {
    pub login_name: String,
    #[serde(default)]
    pub given_name: Option<String>,
    #[serde(default)]
    pub family_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub ssh_public_keys: Option<Vec<String>>,
    #[serde(default)]
    pub password_hash: Option<String>,
    #[serde(default)]
    pub posix: Option<PosixSeed>,
}

/// A pinned POSIX block must always pin uid, gid and home together; a
/// partial pin would force the overlay to invent values for a record the
/// update did not supply.
#[derive(Debug, Clone, Deserialize)]
pub struct PosixSeed {
    pub uid: u16,
    pub gid: u16,
    pub home: String,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub gecos: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupSeed {
    pub name: String,
    #[serde(default)]
    pub long_name: Option<String>,
    #[serde(default)]
    pub member_login_names: Option<BTreeSet<String>>,
    #[serde(default)]
    pub posix_gid: Option<u16>,
    #[serde(default)]
    pub permissions: Option<Permissions>,
}

impl DatabaseSeed {
    /// Reads and self-validates the seed file. A malformed seed is an
    /// unrecoverable startup error, never a silently ignored one.
    pub fn load(path: impl AsRef<Path>) -> Result<DatabaseSeed, PortunusError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let seed: DatabaseSeed = serde_json::from_str(&contents)?;
        let errors = seed.self_check();
        if !errors.is_empty() {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            return Err(PortunusError::Seed(messages.join("; ")));
        }
        tracing::info!(
            path = %path.display(),
            users = seed.users.len(),
            groups = seed.groups.len(),
            "loaded database seed"
        );
        Ok(seed)
    }

    /// Validates the seed against itself: no duplicate entities, pinned
    /// fields have acceptable shapes, seeded entities are complete enough
    /// to exist on their own, and pinned POSIX GIDs resolve within the seed.
    pub fn self_check(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        let mut seen_logins = BTreeSet::new();
        for user in &self.users {
            let login = user.login_name.as_str();
            let login_ref = FieldRef::user(login, "login_name");
            if !seen_logins.insert(login) {
                errors.push(login_ref.error(ERR_IS_DUPLICATE_IN_SEED));
            }
            errors.extend(login_ref.first_error([
                validation::must_not_be_empty(login),
                validation::must_be_posix_account_name(login),
            ]));
            match &user.given_name {
                None => errors.push(FieldRef::user(login, "given_name").error(ERR_IS_MISSING)),
                Some(val) => errors.extend(FieldRef::user(login, "given_name").first_error([
                    validation::must_not_be_empty(val),
                    validation::must_not_have_surrounding_spaces(val),
                ])),
            }
            match &user.family_name {
                None => errors.push(FieldRef::user(login, "family_name").error(ERR_IS_MISSING)),
                Some(val) => errors.extend(FieldRef::user(login, "family_name").first_error([
                    validation::must_not_be_empty(val),
                    validation::must_not_have_surrounding_spaces(val),
                ])),
            }
            if let Some(keys) = &user.ssh_public_keys {
                for key in keys {
                    if let Err(message) = validation::must_be_ssh_public_key(key) {
                        errors.push(FieldRef::user(login, "ssh_public_keys").error(message));
                        break;
                    }
                }
            }
            if let Some(posix) = &user.posix {
                errors.extend(FieldRef::user(login, "posix_home").first_error([
                    validation::must_not_be_empty(&posix.home),
                    validation::must_be_absolute_path(&posix.home),
                ]));
                if let Some(shell) = &posix.shell {
                    errors.extend(
                        FieldRef::user(login, "posix_shell")
                            .first_error([validation::must_be_absolute_path(shell)]),
                    );
                }
                let gid_seeded = self.groups.iter().any(|g| g.posix_gid == Some(posix.gid));
                if !gid_seeded {
                    errors.push(
                        FieldRef::user(login, "posix_gid")
                            .error("does not match any seeded group's POSIX GID"),
                    );
                }
            }
        }

        let mut seen_names = BTreeSet::new();
        for group in &self.groups {
            let name = group.name.as_str();
            if !seen_names.insert(name) {
                errors.push(FieldRef::group(name, "name").error(ERR_IS_DUPLICATE_IN_SEED));
            }
            errors.extend(FieldRef::group(name, "name").first_error([
                validation::must_not_be_empty(name),
                validation::must_be_posix_account_name(name),
            ]));
            match &group.long_name {
                None => errors.push(FieldRef::group(name, "long_name").error(ERR_IS_MISSING)),
                Some(val) => errors.extend(FieldRef::group(name, "long_name").first_error([
                    validation::must_not_be_empty(val),
                    validation::must_not_have_surrounding_spaces(val),
                ])),
            }
        }

        errors
    }

    /// Reports every disagreement between a candidate snapshot and the
    /// pinned fields, without modifying the snapshot.
    pub fn check_conflicts(&self, db: &Database) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for seed in &self.users {
            let login = seed.login_name.as_str();
            let Some(user) = db.user(login) else {
                errors.push(FieldRef::user(login, "login_name").error(ERR_IS_SEEDED));
                continue;
            };
            let mut pin = |field: &str, differs: bool| {
                if differs {
                    errors.push(FieldRef::user(login, field).error(ERR_IS_PINNED));
                }
            };
            if let Some(val) = &seed.given_name {
                pin("given_name", user.given_name != *val);
            }
            if let Some(val) = &seed.family_name {
                pin("family_name", user.family_name != *val);
            }
            if let Some(val) = &seed.email {
                pin("email", user.email.as_deref() != Some(val.as_str()));
            }
            if let Some(val) = &seed.ssh_public_keys {
                pin("ssh_public_keys", user.ssh_public_keys != *val);
            }
            if let Some(val) = &seed.password_hash {
                pin("password", user.password_hash != *val);
            }
            if let Some(posix_seed) = &seed.posix {
                match &user.posix {
                    None => pin("posix", true),
                    Some(posix) => {
                        pin("posix_uid", posix.uid != posix_seed.uid);
                        pin("posix_gid", posix.gid != posix_seed.gid);
                        pin("posix_home", posix.home != posix_seed.home);
                        if let Some(shell) = &posix_seed.shell {
                            pin("posix_shell", posix.shell != *shell);
                        }
                        if let Some(gecos) = &posix_seed.gecos {
                            pin("posix_gecos", posix.gecos != *gecos);
                        }
                    }
                }
            }
        }

        for seed in &self.groups {
            let name = seed.name.as_str();
            let Some(group) = db.group(name) else {
                errors.push(FieldRef::group(name, "name").error(ERR_IS_SEEDED));
                continue;
            };
            let mut pin = |field: &str, differs: bool| {
                if differs {
                    errors.push(FieldRef::group(name, field).error(ERR_IS_PINNED));
                }
            };
            if let Some(val) = &seed.long_name {
                pin("long_name", group.long_name != *val);
            }
            if let Some(val) = &seed.member_login_names {
                pin("member_login_names", group.member_login_names != *val);
            }
            if let Some(val) = seed.posix_gid {
                pin("posix_gid", group.posix_gid != Some(val));
            }
            if let Some(val) = seed.permissions {
                pin("permissions", group.permissions != val);
            }
        }

        errors
    }

    /// Forces every pinned field back to its seed value, inserting missing
    /// seeded entities along the way. Non-seeded entities are never touched.
    pub fn apply_to(&self, db: &mut Database) {
        for seed in &self.users {
            if db.user(&seed.login_name).is_none() {
                db.users.push(User {
                    login_name: seed.login_name.clone(),
                    given_name: String::new(),
                    family_name: String::new(),
                    email: None,
                    ssh_public_keys: vec![],
                    password_hash: String::new(),
                    posix: None,
                });
            }
            let user = db.user_mut(&seed.login_name).unwrap();
            if let Some(val) = &seed.given_name {
                user.given_name = val.clone();
            }
            if let Some(val) = &seed.family_name {
                user.family_name = val.clone();
            }
            if let Some(val) = &seed.email {
                user.email = Some(val.clone());
            }
            if let Some(val) = &seed.ssh_public_keys {
                user.ssh_public_keys = val.clone();
            }
            if let Some(val) = &seed.password_hash {
                user.password_hash = val.clone();
            }
            if let Some(posix_seed) = &seed.posix {
                let posix = user.posix.get_or_insert_with(|| PosixAttributes {
                    uid: posix_seed.uid,
                    gid: posix_seed.gid,
                    home: posix_seed.home.clone(),
                    shell: String::new(),
                    gecos: String::new(),
                });
                posix.uid = posix_seed.uid;
                posix.gid = posix_seed.gid;
                posix.home = posix_seed.home.clone();
                if let Some(shell) = &posix_seed.shell {
                    posix.shell = shell.clone();
                }
                if let Some(gecos) = &posix_seed.gecos {
                    posix.gecos = gecos.clone();
                }
            }
        }

        for seed in &self.groups {
            if db.group(&seed.name).is_none() {
                db.groups.push(Group {
                    name: seed.name.clone(),
                    long_name: String::new(),
                    member_login_names: BTreeSet::new(),
                    posix_gid: None,
                    permissions: Permissions::default(),
                });
            }
            let group = db.group_mut(&seed.name).unwrap();
            if let Some(val) = &seed.long_name {
                group.long_name = val.clone();
            }
            if let Some(val) = &seed.member_login_names {
                group.member_login_names = val.clone();
            }
            if let Some(val) = seed.posix_gid {
                group.posix_gid = Some(val);
            }
            if let Some(val) = seed.permissions {
                group.permissions = val;
            }
        }
    }
}

/// Builds the database that a fresh state directory starts out with: the
/// seed overlay applied to an empty snapshot, plus a bootstrapped admin
/// account when the seed does not provide one.
pub fn initial_database(seed: Option<&DatabaseSeed>) -> Result<Database, PortunusError> {
    let mut db = Database::default();
    if let Some(seed) = seed {
        seed.apply_to(&mut db);
    }
    bootstrap_admin(&mut db)?;
    db.normalize();
    Ok(db)
}

/// Ensures that at least one admin group contains at least one existing
/// user. Without that, the directory would be born unadministrable.
fn bootstrap_admin(db: &mut Database) -> Result<(), PortunusError> {
    let admin_covered = db.groups.iter().any(|g| {
        g.permissions.is_admin && g.member_login_names.iter().any(|m| db.user(m).is_some())
    });
    if admin_covered {
        return Ok(());
    }

    if db.user("admin").is_none() {
        let password = crypt::generate_password();
        tracing::warn!(
            login_name = "admin",
            password = %password,
            "creating initial admin user; change this password immediately"
        );
        db.users.push(User {
            login_name: "admin".into(),
            given_name: "Initial".into(),
            family_name: "Administrator".into(),
            email: None,
            ssh_public_keys: vec![],
            password_hash: crypt::hash_password(&password)?,
            posix: None,
        });
    }

    match db.groups.iter_mut().find(|g| g.permissions.is_admin) {
        Some(group) => {
            group.member_login_names.insert("admin".into());
        }
        None => {
            db.groups.push(Group {
                name: "admins".into(),
                long_name: "Administrators".into(),
                member_login_names: BTreeSet::from(["admin".to_string()]),
                posix_gid: None,
                permissions: Permissions { is_admin: true, can_read_ldap: false },
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED_JSON: &str = r#"{
        "users": [
            {"login_name": "admin", "given_name": "A", "family_name": "D",
             "password_hash": "$6$rounds=1000$abc$def"}
        ],
        "groups": [
            {"name": "admins", "long_name": "Admins",
             "member_login_names": ["admin"],
             "permissions": {"is_admin": true}}
        ]
    }"#;

    fn seed() -> DatabaseSeed {
        let seed: DatabaseSeed = serde_json::from_str(SEED_JSON).unwrap();
        assert!(seed.self_check().is_empty());
        seed
    }

    #[test]
    fn test_duplicate_entities_in_seed_are_rejected() {
        let seed: DatabaseSeed = serde_json::from_str(
            r#"{"users": [
                {"login_name": "a", "given_name": "A", "family_name": "B"},
                {"login_name": "a", "given_name": "A", "family_name": "B"}
            ]}"#,
        )
        .unwrap();
        let errors = seed.self_check();
        assert!(errors
            .contains(&FieldRef::user("a", "login_name").error(ERR_IS_DUPLICATE_IN_SEED)));
    }

    #[test]
    fn test_seeded_posix_gid_must_resolve_within_seed() {
        let seed: DatabaseSeed = serde_json::from_str(
            r#"{"users": [
                {"login_name": "a", "given_name": "A", "family_name": "B",
                 "posix": {"uid": 1000, "gid": 1000, "home": "/home/a"}}
            ]}"#,
        )
        .unwrap();
        let errors = seed.self_check();
        assert_eq!(
            errors,
            vec![FieldRef::user("a", "posix_gid")
                .error("does not match any seeded group's POSIX GID")]
        );
    }

    #[test]
    fn test_apply_to_inserts_missing_entities() {
        let mut db = Database::default();
        seed().apply_to(&mut db);
        assert_eq!(db.user("admin").unwrap().given_name, "A");
        assert!(db.group("admins").unwrap().contains_user("admin"));
    }

    #[test]
    fn test_apply_to_leaves_no_conflicts() {
        let seed = seed();
        let mut db = Database::default();
        seed.apply_to(&mut db);
        assert!(seed.check_conflicts(&db).is_empty());

        // also after an update that fights the pins
        db.user_mut("admin").unwrap().given_name = "B".into();
        seed.apply_to(&mut db);
        assert!(seed.check_conflicts(&db).is_empty());
    }

    #[test]
    fn test_check_conflicts_reports_pinned_field() {
        let seed = seed();
        let mut db = Database::default();
        seed.apply_to(&mut db);
        db.user_mut("admin").unwrap().given_name = "B".into();
        assert_eq!(
            seed.check_conflicts(&db),
            vec![FieldRef::user("admin", "given_name").error(ERR_IS_PINNED)]
        );
    }

    #[test]
    fn test_check_conflicts_reports_deleted_seeded_entity() {
        let seed = seed();
        let mut db = Database::default();
        seed.apply_to(&mut db);
        db.users.clear();
        let errors = seed.check_conflicts(&db);
        assert!(errors.contains(&FieldRef::user("admin", "login_name").error(ERR_IS_SEEDED)));
    }

    #[test]
    fn test_apply_to_corrects_only_pinned_fields() {
        let seed = seed();
        let mut db = Database::default();
        seed.apply_to(&mut db);
        {
            let user = db.user_mut("admin").unwrap();
            user.given_name = "B".into();
            user.email = Some("admin@example.org".into());
        }
        seed.apply_to(&mut db);
        let user = db.user("admin").unwrap();
        assert_eq!(user.given_name, "A");
        assert_eq!(user.email.as_deref(), Some("admin@example.org"));
    }

    #[test]
    fn test_initial_database_bootstraps_admin_without_seed() {
        let db = initial_database(None).unwrap();
        assert!(db.user("admin").is_some());
        let admins = db.group("admins").unwrap();
        assert!(admins.permissions.is_admin);
        assert!(admins.contains_user("admin"));
        assert!(crate::validation::validate(&db).is_empty());
    }

    #[test]
    fn test_initial_database_respects_seeded_admin() {
        let db = initial_database(Some(&seed())).unwrap();
        assert_eq!(db.users.len(), 1);
        assert_eq!(db.user("admin").unwrap().given_name, "A");
        assert!(crate::validation::validate(&db).is_empty());
    }
}
