//! Stateless validation: per-field shape rules and the cross-entity checks
//! that run on every candidate snapshot before it is committed.

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use crate::database::Database;

// this pattern copied from the useradd(8) manpage
const POSIX_ACCOUNT_NAME_PATTERN: &str = r"[a-z_][a-z0-9_-]*\$?";

static POSIX_ACCOUNT_NAME_RX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(&format!("^{POSIX_ACCOUNT_NAME_PATTERN}$")).unwrap()
});

pub const ERR_IS_DUPLICATE: &str = "is already in use";
pub const ERR_IS_DUPLICATE_IN_SEED: &str = "is defined multiple times";
pub const ERR_IS_MISSING: &str = "is missing";
pub const ERR_DOES_NOT_EXIST: &str = "does not exist";

/// The kind of entity a validation error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    User,
    Group,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::User => write!(f, "user"),
            ObjectKind::Group => write!(f, "group"),
        }
    }
}

/// Identifies a field within a user or group. Field names match the input
/// names of the respective HTTP payloads, so the UI can attach errors to
/// the offending form field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRef {
    pub object_kind: ObjectKind,
    pub object_name: String,
    pub field_name: String,
}

impl FieldRef {
    pub fn user(object_name: impl Into<String>, field_name: impl Into<String>) -> Self {
        FieldRef {
            object_kind: ObjectKind::User,
            object_name: object_name.into(),
            field_name: field_name.into(),
        }
    }

    pub fn group(object_name: impl Into<String>, field_name: impl Into<String>) -> Self {
        FieldRef {
            object_kind: ObjectKind::Group,
            object_name: object_name.into(),
            field_name: field_name.into(),
        }
    }

    pub fn error(&self, message: impl Into<String>) -> ValidationError {
        ValidationError {
            object_kind: self.object_kind,
            object_name: self.object_name.clone(),
            field_name: self.field_name.clone(),
            message: message.into(),
        }
    }

    /// Runs a sequence of increasingly strict checks and reports only the
    /// first failure, so the broadest applicable message wins.
    pub fn first_error<I>(&self, checks: I) -> Option<ValidationError>
    where
        I: IntoIterator<Item = Result<(), String>>,
    {
        checks
            .into_iter()
            .find_map(|check| check.err())
            .map(|message| self.error(message))
    }
}

/// A structured, per-field validation failure. These are values: they are
/// returned from `Nexus::update` as a set, never kill the process, and are
/// surfaced to the UI next to the offending field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("field {field_name:?} in {object_kind} {object_name:?} {message}")]
pub struct ValidationError {
    pub object_kind: ObjectKind,
    pub object_name: String,
    pub field_name: String,
    pub message: String,
}

pub fn must_not_be_empty(val: &str) -> Result<(), String> {
    if val.trim().is_empty() {
        return Err(ERR_IS_MISSING.into());
    }
    Ok(())
}

pub fn must_not_have_surrounding_spaces(val: &str) -> Result<(), String> {
    if !val.is_empty() {
        if val.trim_start() != val {
            return Err("may not start with a space character".into());
        }
        if val.trim_end() != val {
            return Err("may not end with a space character".into());
        }
    }
    Ok(())
}

pub fn must_be_posix_account_name(val: &str) -> Result<(), String> {
    if POSIX_ACCOUNT_NAME_RX.is_match(val) {
        return Ok(());
    }
    Err(format!(
        "is not an acceptable user/group name matching the pattern /{POSIX_ACCOUNT_NAME_PATTERN}/"
    ))
}

/// String-level counterpart of the `u16` fields, for form-shaped input.
pub fn must_be_posix_uid_or_gid(val: &str) -> Result<(), String> {
    if !val.is_empty() && val.parse::<u16>().is_err() {
        return Err("is not a number between 0 and 65535 inclusive".into());
    }
    Ok(())
}

pub fn must_be_absolute_path(val: &str) -> Result<(), String> {
    if !val.is_empty() && !val.starts_with('/') {
        return Err("must be an absolute path, i.e. start with a /".into());
    }
    Ok(())
}

/// Splits textarea-shaped input into one SSH public key per entry.
pub fn split_ssh_public_keys(val: &str) -> Vec<String> {
    val.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn must_be_ssh_public_key(val: &str) -> Result<(), String> {
    match val.parse::<ssh_key::PublicKey>() {
        Ok(_) => Ok(()),
        Err(_) => Err("must be a valid SSH public key".into()),
    }
}

pub fn must_be_ssh_public_keys(val: &str) -> Result<(), String> {
    for (idx, line) in split_ssh_public_keys(val).iter().enumerate() {
        if must_be_ssh_public_key(line).is_err() {
            return Err(format!(
                "must have a valid SSH public key on each line (parse error on line {})",
                idx + 1
            ));
        }
    }
    Ok(())
}

/// Checks a candidate snapshot: key uniqueness, field shapes, POSIX GID
/// references and GID uniqueness. Dangling group members are tolerated to
/// ease mass-import; they are reported as warnings only.
pub fn validate(db: &Database) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let mut seen_logins = BTreeSet::new();
    for user in &db.users {
        if !seen_logins.insert(user.login_name.as_str()) {
            errors.push(FieldRef::user(&user.login_name, "login_name").error(ERR_IS_DUPLICATE));
        }
    }
    let mut seen_names = BTreeSet::new();
    for group in &db.groups {
        if !seen_names.insert(group.name.as_str()) {
            errors.push(FieldRef::group(&group.name, "name").error(ERR_IS_DUPLICATE));
        }
    }

    for user in &db.users {
        let login = user.login_name.as_str();
        errors.extend(FieldRef::user(login, "login_name").first_error([
            must_not_be_empty(login),
            must_be_posix_account_name(login),
        ]));
        errors.extend(FieldRef::user(login, "given_name").first_error([
            must_not_be_empty(&user.given_name),
            must_not_have_surrounding_spaces(&user.given_name),
        ]));
        errors.extend(FieldRef::user(login, "family_name").first_error([
            must_not_be_empty(&user.family_name),
            must_not_have_surrounding_spaces(&user.family_name),
        ]));
        if let Some(email) = &user.email {
            errors.extend(
                FieldRef::user(login, "email")
                    .first_error([must_not_have_surrounding_spaces(email)]),
            );
        }
        for key in &user.ssh_public_keys {
            if let Err(message) = must_be_ssh_public_key(key) {
                errors.push(FieldRef::user(login, "ssh_public_keys").error(message));
                break;
            }
        }
        if let Some(posix) = &user.posix {
            errors.extend(FieldRef::user(login, "posix_home").first_error([
                must_not_be_empty(&posix.home),
                must_be_absolute_path(&posix.home),
            ]));
            errors.extend(
                FieldRef::user(login, "posix_shell")
                    .first_error([must_be_absolute_path(&posix.shell)]),
            );
            let gid_exists = db.groups.iter().any(|g| g.posix_gid == Some(posix.gid));
            if !gid_exists {
                errors.push(
                    FieldRef::user(login, "posix_gid")
                        .error("does not match any group's POSIX GID"),
                );
            }
        }
    }

    let mut seen_gids = BTreeSet::new();
    for group in &db.groups {
        let name = group.name.as_str();
        errors.extend(FieldRef::group(name, "name").first_error([
            must_not_be_empty(name),
            must_be_posix_account_name(name),
        ]));
        errors.extend(FieldRef::group(name, "long_name").first_error([
            must_not_be_empty(&group.long_name),
            must_not_have_surrounding_spaces(&group.long_name),
        ]));
        if let Some(gid) = group.posix_gid {
            if !seen_gids.insert(gid) {
                errors.push(FieldRef::group(name, "posix_gid").error(ERR_IS_DUPLICATE));
            }
        }
        for member in &group.member_login_names {
            if db.user(member).is_none() {
                tracing::warn!(
                    group = name,
                    login_name = member.as_str(),
                    "group contains a member that does not exist"
                );
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Group, Permissions, PosixAttributes, User};

    fn user(login: &str) -> User {
        User {
            login_name: login.into(),
            given_name: "Jane".into(),
            family_name: "Doe".into(),
            email: None,
            ssh_public_keys: vec![],
            password_hash: "$6$salt$hash".into(),
            posix: None,
        }
    }

    fn group(name: &str) -> Group {
        Group {
            name: name.into(),
            long_name: "Some Group".into(),
            member_login_names: BTreeSet::new(),
            posix_gid: None,
            permissions: Permissions::default(),
        }
    }

    #[test]
    fn test_field_rules() {
        assert!(must_not_be_empty("").is_err());
        assert!(must_not_be_empty("   ").is_err());
        assert!(must_not_be_empty("x").is_ok());

        assert!(must_not_have_surrounding_spaces(" x").is_err());
        assert!(must_not_have_surrounding_spaces("x ").is_err());
        assert!(must_not_have_surrounding_spaces("x y").is_ok());
        assert!(must_not_have_surrounding_spaces("").is_ok());

        assert!(must_be_posix_account_name("alice").is_ok());
        assert!(must_be_posix_account_name("_svc-account$").is_ok());
        assert!(must_be_posix_account_name("Alice").is_err());
        assert!(must_be_posix_account_name("1alice").is_err());

        assert!(must_be_posix_uid_or_gid("").is_ok());
        assert!(must_be_posix_uid_or_gid("65535").is_ok());
        assert!(must_be_posix_uid_or_gid("65536").is_err());
        assert!(must_be_posix_uid_or_gid("-1").is_err());

        assert!(must_be_absolute_path("/home/x").is_ok());
        assert!(must_be_absolute_path("").is_ok());
        assert!(must_be_absolute_path("home/x").is_err());
    }

    #[test]
    fn test_split_ssh_public_keys() {
        let keys = split_ssh_public_keys("ssh-ed25519 AAA one\n\n  ssh-rsa BBB two  \n");
        assert_eq!(keys, vec!["ssh-ed25519 AAA one", "ssh-rsa BBB two"]);
    }

    #[test]
    fn test_duplicate_keys_are_reported() {
        let db = Database {
            users: vec![user("alice"), user("alice")],
            groups: vec![group("staff"), group("staff")],
        };
        let errors = validate(&db);
        assert!(errors.contains(&FieldRef::user("alice", "login_name").error(ERR_IS_DUPLICATE)));
        assert!(errors.contains(&FieldRef::group("staff", "name").error(ERR_IS_DUPLICATE)));
    }

    #[test]
    fn test_posix_gid_must_reference_a_group() {
        let mut bob = user("bob");
        bob.posix = Some(PosixAttributes {
            uid: 1001,
            gid: 1001,
            home: "/home/bob".into(),
            shell: String::new(),
            gecos: String::new(),
        });
        let db = Database { users: vec![bob], groups: vec![group("staff")] };
        let errors = validate(&db);
        assert_eq!(
            errors,
            vec![FieldRef::user("bob", "posix_gid").error("does not match any group's POSIX GID")]
        );

        let mut staff = group("staff");
        staff.posix_gid = Some(1001);
        let db = Database { users: db.users, groups: vec![staff] };
        assert!(validate(&db).is_empty());
    }

    #[test]
    fn test_posix_gid_uniqueness_across_groups() {
        let mut g1 = group("one");
        g1.posix_gid = Some(500);
        let mut g2 = group("two");
        g2.posix_gid = Some(500);
        let errors = validate(&Database { users: vec![], groups: vec![g1, g2] });
        assert_eq!(errors, vec![FieldRef::group("two", "posix_gid").error(ERR_IS_DUPLICATE)]);
    }

    #[test]
    fn test_dangling_members_are_not_hard_errors() {
        let mut g = group("staff");
        g.member_login_names.insert("ghost".into());
        let db = Database { users: vec![], groups: vec![g] };
        assert!(validate(&db).is_empty());
    }

    #[test]
    fn test_validation_error_display() {
        let err = FieldRef::user("admin", "given_name").error(ERR_IS_MISSING);
        assert_eq!(err.to_string(), "field \"given_name\" in user \"admin\" is missing");
    }
}
