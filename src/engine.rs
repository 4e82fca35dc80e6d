//! The engine: a typed facade over the nexus that translates high-level
//! intent (create this user, edit that group) into reducers. This is the
//! API the HTTP layer talks to.

use std::sync::Arc;

use crate::database::{Database, Group, Permissions, User};
use crate::nexus::{Nexus, UpdateOptions};
use crate::validation::{FieldRef, ValidationError, ERR_DOES_NOT_EXIST, ERR_IS_DUPLICATE};

/// A user record together with everything derived from group membership.
/// Computed on read, never stored: the member edge lives on the group.
#[derive(Debug, Clone)]
pub struct UserWithPerms {
    pub user: User,
    pub group_memberships: Vec<Group>,
    pub perms: Permissions,
}

#[derive(Clone)]
pub struct Engine {
    nexus: Arc<Nexus>,
}

impl Engine {
    pub fn new(nexus: Arc<Nexus>) -> Self {
        Engine { nexus }
    }

    pub fn nexus(&self) -> &Arc<Nexus> {
        &self.nexus
    }

    pub fn list_users(&self) -> Vec<UserWithPerms> {
        self.nexus
            .read(|db| db.users.iter().map(|user| view_of(db, user)).collect())
    }

    pub fn find_user(&self, login_name: &str) -> Option<UserWithPerms> {
        self.nexus
            .read(|db| db.user(login_name).map(|user| view_of(db, user)))
    }

    pub fn list_groups(&self) -> Vec<Group> {
        self.nexus.read(|db| db.groups.clone())
    }

    pub fn find_group(&self, name: &str) -> Option<Group> {
        self.nexus.read(|db| db.group(name).cloned())
    }

    pub fn create_user(
        &self,
        user: User,
        opts: UpdateOptions,
    ) -> Result<(), Vec<ValidationError>> {
        self.nexus.update(
            move |db| {
                if db.user(&user.login_name).is_some() {
                    return Err(
                        FieldRef::user(&user.login_name, "login_name").error(ERR_IS_DUPLICATE)
                    );
                }
                db.users.push(user);
                Ok(())
            },
            opts,
        )
    }

    /// Edits or deletes a user. The closure receives a copy of the current
    /// record and returns the updated copy, `None` to delete, or an error
    /// to abort. Deleting also removes the login from all member lists.
    pub fn change_user<F>(
        &self,
        login_name: &str,
        change: F,
        opts: UpdateOptions,
    ) -> Result<(), Vec<ValidationError>>
    where
        F: FnOnce(User) -> Result<Option<User>, ValidationError>,
    {
        let login_name = login_name.to_string();
        self.nexus.update(
            move |db| {
                let idx = db
                    .users
                    .iter()
                    .position(|u| u.login_name == login_name)
                    .ok_or_else(|| {
                        FieldRef::user(&login_name, "login_name").error(ERR_DOES_NOT_EXIST)
                    })?;
                match change(db.users[idx].clone())? {
                    Some(updated) => db.users[idx] = updated,
                    None => {
                        db.users.remove(idx);
                        for group in &mut db.groups {
                            group.member_login_names.remove(&login_name);
                        }
                    }
                }
                Ok(())
            },
            opts,
        )
    }

    pub fn delete_user(
        &self,
        login_name: &str,
        opts: UpdateOptions,
    ) -> Result<(), Vec<ValidationError>> {
        self.change_user(login_name, |_| Ok(None), opts)
    }

    pub fn create_group(
        &self,
        group: Group,
        opts: UpdateOptions,
    ) -> Result<(), Vec<ValidationError>> {
        self.nexus.update(
            move |db| {
                if db.group(&group.name).is_some() {
                    return Err(FieldRef::group(&group.name, "name").error(ERR_IS_DUPLICATE));
                }
                db.groups.push(group);
                Ok(())
            },
            opts,
        )
    }

    /// Group counterpart of `change_user`.
    pub fn change_group<F>(
        &self,
        name: &str,
        change: F,
        opts: UpdateOptions,
    ) -> Result<(), Vec<ValidationError>>
    where
        F: FnOnce(Group) -> Result<Option<Group>, ValidationError>,
    {
        let name = name.to_string();
        self.nexus.update(
            move |db| {
                let idx = db
                    .groups
                    .iter()
                    .position(|g| g.name == name)
                    .ok_or_else(|| FieldRef::group(&name, "name").error(ERR_DOES_NOT_EXIST))?;
                match change(db.groups[idx].clone())? {
                    Some(updated) => db.groups[idx] = updated,
                    None => {
                        db.groups.remove(idx);
                    }
                }
                Ok(())
            },
            opts,
        )
    }

    pub fn delete_group(
        &self,
        name: &str,
        opts: UpdateOptions,
    ) -> Result<(), Vec<ValidationError>> {
        self.change_group(name, |_| Ok(None), opts)
    }
}

fn view_of(db: &Database, user: &User) -> UserWithPerms {
    let mut perms = Permissions::default();
    let mut group_memberships = Vec::new();
    for group in &db.groups {
        if group.contains_user(&user.login_name) {
            perms = perms.union(group.permissions);
            group_memberships.push(group.clone());
        }
    }
    UserWithPerms { user: user.clone(), group_memberships, perms }
}
