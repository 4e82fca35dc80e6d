//! The value types that make up the directory: users, groups, and the
//! Database snapshot that holds both. A Database is a plain value; all
//! mutation happens by producing a new snapshot inside a nexus reducer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Access flags granted through group membership.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    /// Members may create, edit and delete any user or group.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_admin: bool,
    /// Members may bind to the LDAP server with full read access.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub can_read_ldap: bool,
}

impl Permissions {
    pub fn is_empty(&self) -> bool {
        *self == Permissions::default()
    }

    /// Combines the flags of two permission sets. A user's effective
    /// permissions are the union over all groups containing them.
    pub fn union(self, other: Permissions) -> Permissions {
        Permissions {
            is_admin: self.is_admin || other.is_admin,
            can_read_ldap: self.can_read_ldap || other.can_read_ldap,
        }
    }
}

/// UNIX account attributes that can be attached to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PosixAttributes {
    pub uid: u16,
    /// Must match the `posix_gid` of an existing group.
    pub gid: u16,
    pub home: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub shell: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gecos: String,
}

/// A single user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub login_name: String,
    pub given_name: String,
    pub family_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_public_keys: Vec<String>,
    /// Opaque crypt(3)-style hash. Never a plaintext password.
    pub password_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posix: Option<PosixAttributes>,
}

impl User {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.given_name, self.family_name)
    }
}

/// A group of users. Membership implicitly grants the group's Permissions
/// to all members. The member edge lives only on the group; "which groups
/// contain this user" is derived on read (see `engine::UserWithPerms`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub long_name: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub member_login_names: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posix_gid: Option<u16>,
    #[serde(default, skip_serializing_if = "Permissions::is_empty")]
    pub permissions: Permissions,
}

impl Group {
    pub fn contains_user(&self, login_name: &str) -> bool {
        self.member_login_names.contains(login_name)
    }
}

/// One consistent snapshot of all users and groups.
///
/// Two snapshots with identical logical content compare equal and, after
/// `normalize()`, serialize to identical bytes. Users are keyed by
/// `login_name` and groups by `name`; duplicate keys are representable
/// (the validator reports them) but never survive a committed update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Database {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub groups: Vec<Group>,
}

impl Database {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.groups.is_empty()
    }

    /// Brings the snapshot into canonical form: collections sorted by key,
    /// empty optionals dropped. Idempotent.
    pub fn normalize(&mut self) {
        self.users.sort_by(|a, b| a.login_name.cmp(&b.login_name));
        self.groups.sort_by(|a, b| a.name.cmp(&b.name));
        for user in &mut self.users {
            if user.email.as_deref() == Some("") {
                user.email = None;
            }
            user.ssh_public_keys.retain(|key| !key.trim().is_empty());
        }
    }

    pub fn user(&self, login_name: &str) -> Option<&User> {
        self.users.iter().find(|u| u.login_name == login_name)
    }

    pub fn user_mut(&mut self, login_name: &str) -> Option<&mut User> {
        self.users.iter_mut().find(|u| u.login_name == login_name)
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn group_mut(&mut self, name: &str) -> Option<&mut Group> {
        self.groups.iter_mut().find(|g| g.name == name)
    }

    /// Serializes into the canonical on-disk representation. Byte-for-byte
    /// stable across restarts as long as the logical content is unchanged.
    pub fn to_canonical_json(&self) -> Result<String, serde_json::Error> {
        let mut buf = serde_json::to_string_pretty(self)?;
        buf.push('\n');
        Ok(buf)
    }
}
