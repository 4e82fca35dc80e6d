//! Pure functions from a Database snapshot to the LDAP tree that should
//! exist, and from two such trees to the operations that turn one into
//! the other. Keeping this free of I/O makes the projector's hard part
//! testable without a directory server.

use std::collections::BTreeMap;

use crate::database::{Database, Group, User};

/// One LDAP entry: a DN plus multi-valued attributes. Attribute order is
/// fixed by the BTreeMap so that rendering is deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapObject {
    pub dn: String,
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl LdapObject {
    fn new(dn: impl Into<String>) -> Self {
        LdapObject { dn: dn.into(), attributes: BTreeMap::new() }
    }

    fn attr<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        if !values.is_empty() {
            self.attributes.insert(name.to_string(), values);
        }
        self
    }
}

/// The full tree keyed by DN.
pub type LdapTree = BTreeMap<String, LdapObject>;

pub fn user_dn(login_name: &str, suffix: &str) -> String {
    format!("uid={login_name},ou=users,{suffix}")
}

pub fn group_dn(name: &str, suffix: &str) -> String {
    format!("cn={name},ou=groups,{suffix}")
}

pub fn service_user_dn(suffix: &str) -> String {
    format!("cn=portunus,{suffix}")
}

/// Renders the tree for one snapshot: the fixed skeleton, one entry per
/// user, one per group, and the virtual `cn=portunus-viewers` group that
/// mirrors the `can_read_ldap` permission.
pub fn render_tree(db: &Database, suffix: &str) -> LdapTree {
    let mut tree = LdapTree::new();
    let service_dn = service_user_dn(suffix);

    // skeleton
    let dc = suffix
        .split(',')
        .next()
        .and_then(|rdn| rdn.strip_prefix("dc="))
        .unwrap_or_default();
    insert(
        &mut tree,
        LdapObject::new(suffix)
            .attr("objectClass", ["dcObject", "organization"])
            .attr("dc", [dc])
            .attr("o", [suffix]),
    );
    insert(
        &mut tree,
        LdapObject::new(format!("ou=users,{suffix}"))
            .attr("objectClass", ["organizationalUnit"])
            .attr("ou", ["users"]),
    );
    insert(
        &mut tree,
        LdapObject::new(format!("ou=groups,{suffix}"))
            .attr("objectClass", ["organizationalUnit"])
            .attr("ou", ["groups"]),
    );
    insert(
        &mut tree,
        LdapObject::new(service_dn.clone())
            .attr("objectClass", ["organizationalRole"])
            .attr("cn", ["portunus"])
            .attr("description", ["Portunus service user"]),
    );

    for user in &db.users {
        insert(&mut tree, render_user(db, user, suffix));
    }
    for group in &db.groups {
        insert(&mut tree, render_group(group, suffix, &service_dn));
    }

    // the virtual group that backs the `can_read_ldap` permission; the
    // service user is always a member, which also keeps groupOfNames happy
    // when nobody holds the permission
    let mut viewer_dns = vec![service_dn];
    for user in &db.users {
        let can_read = db
            .groups
            .iter()
            .any(|g| g.permissions.can_read_ldap && g.contains_user(&user.login_name));
        if can_read {
            viewer_dns.push(user_dn(&user.login_name, suffix));
        }
    }
    insert(
        &mut tree,
        LdapObject::new(format!("cn=portunus-viewers,{suffix}"))
            .attr("objectClass", ["groupOfNames", "top"])
            .attr("cn", ["portunus-viewers"])
            .attr("member", viewer_dns),
    );

    tree
}

fn insert(tree: &mut LdapTree, object: LdapObject) {
    tree.insert(object.dn.clone(), object);
}

fn render_user(db: &Database, user: &User, suffix: &str) -> LdapObject {
    let mut classes =
        vec!["portunusPerson", "inetOrgPerson", "organizationalPerson", "person", "top"];
    if user.posix.is_some() {
        classes.push("posixAccount");
    }

    // the back-reference is computed here instead of via the memberof
    // overlay; see the schema notes in `slapd`
    let member_of: Vec<String> = db
        .groups
        .iter()
        .filter(|g| g.contains_user(&user.login_name))
        .map(|g| group_dn(&g.name, suffix))
        .collect();

    let mut object = LdapObject::new(user_dn(&user.login_name, suffix))
        .attr("objectClass", classes)
        .attr("uid", [user.login_name.as_str()])
        .attr("cn", [user.full_name()])
        .attr("givenName", [user.given_name.as_str()])
        .attr("sn", [user.family_name.as_str()])
        .attr("mail", user.email.as_deref().map(String::from))
        .attr("sshPublicKey", user.ssh_public_keys.clone())
        .attr("isMemberOf", member_of);
    if !user.password_hash.is_empty() {
        object = object.attr("userPassword", [format!("{{CRYPT}}{}", user.password_hash)]);
    }
    if let Some(posix) = &user.posix {
        object = object
            .attr("uidNumber", [posix.uid.to_string()])
            .attr("gidNumber", [posix.gid.to_string()])
            .attr("homeDirectory", [posix.home.as_str()]);
        if !posix.shell.is_empty() {
            object = object.attr("loginShell", [posix.shell.as_str()]);
        }
        if !posix.gecos.is_empty() {
            object = object.attr("gecos", [posix.gecos.as_str()]);
        }
    }
    object
}

fn render_group(group: &Group, suffix: &str, service_dn: &str) -> LdapObject {
    let mut classes = vec!["groupOfNames", "top"];
    if group.posix_gid.is_some() {
        classes.push("posixGroup");
    }

    // groupOfNames requires at least one member
    let mut member_dns: Vec<String> = group
        .member_login_names
        .iter()
        .map(|login| user_dn(login, suffix))
        .collect();
    if member_dns.is_empty() {
        member_dns.push(service_dn.to_string());
    }

    let mut object = LdapObject::new(group_dn(&group.name, suffix))
        .attr("objectClass", classes)
        .attr("cn", [group.name.as_str()])
        .attr("member", member_dns);
    if let Some(gid) = group.posix_gid {
        object = object.attr("gidNumber", [gid.to_string()]);
    }
    object
}

/// One attribute-level change on an existing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeMod {
    Replace(String, Vec<String>),
    Remove(String),
}

/// The operations that turn one tree into another, in safe application
/// order: adds walk down the tree (parents first), deletes walk up
/// (children first).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub adds: Vec<LdapObject>,
    pub modifies: Vec<(String, Vec<AttributeMod>)>,
    pub deletes: Vec<String>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.modifies.is_empty() && self.deletes.is_empty()
    }
}

fn dn_depth(dn: &str) -> usize {
    dn.matches(',').count()
}

pub fn diff_trees(old: &LdapTree, new: &LdapTree) -> SyncPlan {
    let mut plan = SyncPlan::default();

    for (dn, object) in new {
        match old.get(dn) {
            None => plan.adds.push(object.clone()),
            Some(existing) if existing.attributes != object.attributes => {
                let mut mods = Vec::new();
                for (name, values) in &object.attributes {
                    if existing.attributes.get(name) != Some(values) {
                        mods.push(AttributeMod::Replace(name.clone(), values.clone()));
                    }
                }
                for name in existing.attributes.keys() {
                    if !object.attributes.contains_key(name) {
                        mods.push(AttributeMod::Remove(name.clone()));
                    }
                }
                plan.modifies.push((dn.clone(), mods));
            }
            Some(_) => {}
        }
    }

    for dn in old.keys() {
        if !new.contains_key(dn) {
            plan.deletes.push(dn.clone());
        }
    }

    plan.adds.sort_by_key(|obj| (dn_depth(&obj.dn), obj.dn.clone()));
    plan.deletes.sort_by_key(|dn| (usize::MAX - dn_depth(dn), dn.clone()));
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Permissions, PosixAttributes};
    use std::collections::BTreeSet;

    const SUFFIX: &str = "dc=example,dc=org";

    fn sample_db() -> Database {
        let mut db = Database {
            users: vec![User {
                login_name: "admin".into(),
                given_name: "A".into(),
                family_name: "D".into(),
                email: Some("admin@example.org".into()),
                ssh_public_keys: vec![],
                password_hash: "$6$x$y".into(),
                posix: None,
            }],
            groups: vec![Group {
                name: "admins".into(),
                long_name: "Admins".into(),
                member_login_names: BTreeSet::from(["admin".to_string()]),
                posix_gid: None,
                permissions: Permissions { is_admin: true, can_read_ldap: true },
            }],
        };
        db.normalize();
        db
    }

    #[test]
    fn test_render_tree_skeleton_and_entities() {
        let tree = render_tree(&sample_db(), SUFFIX);

        assert!(tree.contains_key("dc=example,dc=org"));
        assert!(tree.contains_key("ou=users,dc=example,dc=org"));
        assert!(tree.contains_key("ou=groups,dc=example,dc=org"));
        assert!(tree.contains_key("cn=portunus,dc=example,dc=org"));

        let user = &tree["uid=admin,ou=users,dc=example,dc=org"];
        assert_eq!(user.attributes["cn"], vec!["A D"]);
        assert_eq!(user.attributes["userPassword"], vec!["{CRYPT}$6$x$y"]);
        assert_eq!(
            user.attributes["isMemberOf"],
            vec!["cn=admins,ou=groups,dc=example,dc=org"]
        );

        let group = &tree["cn=admins,ou=groups,dc=example,dc=org"];
        assert_eq!(
            group.attributes["member"],
            vec!["uid=admin,ou=users,dc=example,dc=org"]
        );
    }

    #[test]
    fn test_viewers_group_mirrors_can_read_ldap() {
        let tree = render_tree(&sample_db(), SUFFIX);
        let viewers = &tree["cn=portunus-viewers,dc=example,dc=org"];
        assert_eq!(
            viewers.attributes["member"],
            vec![
                "cn=portunus,dc=example,dc=org",
                "uid=admin,ou=users,dc=example,dc=org"
            ]
        );
    }

    #[test]
    fn test_empty_group_falls_back_to_service_member() {
        let mut db = sample_db();
        db.groups.push(Group {
            name: "empty".into(),
            long_name: "Empty".into(),
            member_login_names: BTreeSet::new(),
            posix_gid: None,
            permissions: Permissions::default(),
        });
        db.normalize();
        let tree = render_tree(&db, SUFFIX);
        let group = &tree["cn=empty,ou=groups,dc=example,dc=org"];
        assert_eq!(group.attributes["member"], vec!["cn=portunus,dc=example,dc=org"]);
    }

    #[test]
    fn test_posix_attributes_are_projected() {
        let mut db = sample_db();
        db.groups[0].posix_gid = Some(500);
        db.users[0].posix = Some(PosixAttributes {
            uid: 1000,
            gid: 500,
            home: "/home/admin".into(),
            shell: "/bin/sh".into(),
            gecos: String::new(),
        });
        let tree = render_tree(&db, SUFFIX);

        let user = &tree["uid=admin,ou=users,dc=example,dc=org"];
        assert!(user.attributes["objectClass"].contains(&"posixAccount".to_string()));
        assert_eq!(user.attributes["uidNumber"], vec!["1000"]);
        assert_eq!(user.attributes["gidNumber"], vec!["500"]);
        assert_eq!(user.attributes["homeDirectory"], vec!["/home/admin"]);
        assert_eq!(user.attributes["loginShell"], vec!["/bin/sh"]);
        assert!(!user.attributes.contains_key("gecos"));

        let group = &tree["cn=admins,ou=groups,dc=example,dc=org"];
        assert!(group.attributes["objectClass"].contains(&"posixGroup".to_string()));
        assert_eq!(group.attributes["gidNumber"], vec!["500"]);
    }

    #[test]
    fn test_diff_against_empty_tree_adds_parents_first() {
        let target = render_tree(&sample_db(), SUFFIX);
        let plan = diff_trees(&LdapTree::new(), &target);

        assert_eq!(plan.adds.len(), target.len());
        assert!(plan.modifies.is_empty());
        assert!(plan.deletes.is_empty());
        // the suffix entry must come before its children
        assert_eq!(plan.adds[0].dn, "dc=example,dc=org");
        let depths: Vec<usize> = plan.adds.iter().map(|o| dn_depth(&o.dn)).collect();
        let mut sorted = depths.clone();
        sorted.sort();
        assert_eq!(depths, sorted);
    }

    #[test]
    fn test_diff_classifies_modify_and_delete() {
        let old = render_tree(&sample_db(), SUFFIX);

        let mut db = sample_db();
        db.users[0].email = None; // attribute removed
        db.groups.clear(); // entry removed
        db.normalize();
        let new = render_tree(&db, SUFFIX);

        let plan = diff_trees(&old, &new);
        assert!(plan.adds.is_empty());

        let (dn, mods) = plan
            .modifies
            .iter()
            .find(|(dn, _)| dn.starts_with("uid=admin"))
            .unwrap();
        assert_eq!(dn, "uid=admin,ou=users,dc=example,dc=org");
        assert!(mods.contains(&AttributeMod::Remove("mail".into())));
        assert!(mods.contains(&AttributeMod::Remove("isMemberOf".into())));

        assert_eq!(plan.deletes, vec!["cn=admins,ou=groups,dc=example,dc=org".to_string()]);
    }

    #[test]
    fn test_diff_of_identical_trees_is_empty() {
        let tree = render_tree(&sample_db(), SUFFIX);
        assert!(diff_trees(&tree, &tree).is_empty());
    }

    #[test]
    fn test_deletes_remove_children_before_parents() {
        let old = render_tree(&sample_db(), SUFFIX);
        let plan = diff_trees(&old, &LdapTree::new());
        let depths: Vec<usize> = plan.deletes.iter().map(|dn| dn_depth(dn)).collect();
        let mut sorted = depths.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(depths, sorted);
        assert_eq!(plan.deletes.last().unwrap(), "dc=example,dc=org");
    }
}
