//! Everything LDAP: rendering the target tree from a Database snapshot,
//! diffing it against the last projected state, pushing the difference
//! into slapd, and supervising slapd itself.

pub mod projector;
pub mod slapd;
pub mod tree;

pub use projector::LdapProjector;
pub use tree::{diff_trees, render_tree, AttributeMod, LdapObject, LdapTree, SyncPlan};
