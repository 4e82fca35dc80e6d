use portunus::database::{Group, Permissions, PosixAttributes, User};
use std::collections::BTreeSet;

/// Builder for test users
pub struct UserBuilder {
    login_name: String,
    given_name: String,
    family_name: String,
    email: Option<String>,
    ssh_public_keys: Vec<String>,
    password_hash: String,
    posix: Option<PosixAttributes>,
}

impl UserBuilder {
    pub fn new(login_name: &str) -> Self {
        Self {
            login_name: login_name.to_string(),
            given_name: "Jane".to_string(),
            family_name: "Doe".to_string(),
            email: None,
            ssh_public_keys: vec![],
            password_hash: "$6$testsalt$testhash".to_string(),
            posix: None,
        }
    }

    pub fn with_name(mut self, given_name: &str, family_name: &str) -> Self {
        self.given_name = given_name.to_string();
        self.family_name = family_name.to_string();
        self
    }

    pub fn with_email(mut self, email: &str) -> Self {
        self.email = Some(email.to_string());
        self
    }

    pub fn with_password_hash(mut self, password_hash: &str) -> Self {
        self.password_hash = password_hash.to_string();
        self
    }

    pub fn with_posix(mut self, uid: u16, gid: u16, home: &str) -> Self {
        self.posix = Some(PosixAttributes {
            uid,
            gid,
            home: home.to_string(),
            shell: String::new(),
            gecos: String::new(),
        });
        self
    }

    pub fn build(self) -> User {
        User {
            login_name: self.login_name,
            given_name: self.given_name,
            family_name: self.family_name,
            email: self.email,
            ssh_public_keys: self.ssh_public_keys,
            password_hash: self.password_hash,
            posix: self.posix,
        }
    }
}

/// Builder for test groups
pub struct GroupBuilder {
    name: String,
    long_name: String,
    member_login_names: BTreeSet<String>,
    posix_gid: Option<u16>,
    permissions: Permissions,
}

impl GroupBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            long_name: format!("The {name} group"),
            member_login_names: BTreeSet::new(),
            posix_gid: None,
            permissions: Permissions::default(),
        }
    }

    pub fn with_member(mut self, login_name: &str) -> Self {
        self.member_login_names.insert(login_name.to_string());
        self
    }

    pub fn with_posix_gid(mut self, gid: u16) -> Self {
        self.posix_gid = Some(gid);
        self
    }

    pub fn admin(mut self) -> Self {
        self.permissions.is_admin = true;
        self
    }

    pub fn ldap_reader(mut self) -> Self {
        self.permissions.can_read_ldap = true;
        self
    }

    pub fn build(self) -> Group {
        Group {
            name: self.name,
            long_name: self.long_name,
            member_login_names: self.member_login_names,
            posix_gid: self.posix_gid,
            permissions: self.permissions,
        }
    }
}
