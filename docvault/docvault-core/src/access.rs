//! Read, write and admin eligibility.
//!
//! Every answer is computed from the node and the principal store as they
//! are at the time of the call. Missing users answer `false`.

use std::sync::Arc;

use crate::error::{Result, VaultError};
use crate::model::Node;
use crate::principal::{PrincipalStore, ROLE_ADMIN, ROLE_PUBLISHER, ROLE_READER};

pub struct AccessResolver {
    principals: Arc<PrincipalStore>,
}

impl AccessResolver {
    pub fn new(principals: Arc<PrincipalStore>) -> Self {
        Self { principals }
    }

    /// Whether `user` or one of its groups appears in the node's restrictions.
    fn is_listed(&self, node: &Node, user: &str) -> bool {
        let restrictions = &node.base.restrictions;
        restrictions.contains(user)
            || self
                .principals
                .groups_of(user)
                .iter()
                .any(|g| restrictions.contains(g))
    }

    fn active_user(&self, user: &str) -> bool {
        self.principals.get_user(user).map_or(false, |u| u.active)
    }

    pub fn can_read(&self, node: &Node, user: &str) -> bool {
        if node.base.restrictions.is_empty() || !self.active_user(user) {
            return false;
        }
        if self.principals.is_admin(user) {
            return true;
        }
        if !self.is_listed(node, user) {
            return false;
        }
        let roles = self.principals.effective_roles(user);
        [ROLE_READER, ROLE_PUBLISHER, ROLE_ADMIN]
            .iter()
            .any(|r| roles.contains(*r))
    }

    pub fn can_write(&self, node: &Node, user: &str) -> bool {
        if !self.can_read(node, user) {
            return false;
        }
        if self.principals.is_admin(user) {
            return true;
        }
        // nodes created by a system administrator stay admin-only
        let creator_is_admin = self
            .principals
            .get_user(&node.base.creator)
            .map_or(false, |u| u.admin);
        if creator_is_admin {
            return false;
        }
        let roles = self.principals.effective_roles(user);
        roles.contains(ROLE_PUBLISHER) || roles.contains(ROLE_ADMIN)
    }

    /// Administration rights, judged against the repository root.
    pub fn can_admin(&self, root: &Node, user: &str) -> bool {
        if !self.active_user(user) {
            return false;
        }
        if self.principals.is_admin(user) {
            return true;
        }
        self.is_listed(root, user) && self.principals.effective_roles(user).contains(ROLE_ADMIN)
    }

    pub fn require_read(&self, node: &Node, user: &str) -> Result<()> {
        if self.can_read(node, user) {
            Ok(())
        } else {
            Err(VaultError::denied(format!("{user} may not read {}", node.id())))
        }
    }

    pub fn require_write(&self, node: &Node, user: &str) -> Result<()> {
        if self.can_write(node, user) {
            Ok(())
        } else {
            Err(VaultError::denied(format!("{user} may not write {}", node.id())))
        }
    }

    pub fn require_admin(&self, root: &Node, user: &str) -> Result<()> {
        if self.can_admin(root, user) {
            Ok(())
        } else {
            Err(VaultError::denied(format!("{user} is not an administrator")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DirectoryData, Importance, NodeBase, NodeVariant, TypeCode};
    use crate::principal::{PrincipalRef, GROUP_ADMINS, GROUP_PUBLISHERS, GROUP_USERS};
    use chrono::Utc;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn node(creator: &str, restrictions: &[&str]) -> Node {
        Node {
            base: NodeBase {
                id: Uuid::new_v4(),
                name: "dir".into(),
                slot: "0".into(),
                path: "/0".into(),
                parent: Some(Uuid::new_v4()),
                creator: creator.into(),
                created: Utc::now(),
                importance: Importance::Medium,
                type_code: TypeCode::Directory,
                position: 0,
                size: 0,
                restrictions: restrictions.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
                active: true,
            },
            variant: NodeVariant::Directory(DirectoryData::default()),
        }
    }

    fn setup() -> (Arc<PrincipalStore>, AccessResolver) {
        let store = Arc::new(PrincipalStore::new(64, 1).unwrap());
        store.create_user("root", "pw", true).unwrap();
        store.create_user("reader", "pw", false).unwrap();
        store.create_user("writer", "pw", false).unwrap();
        store.add_member(GROUP_PUBLISHERS, "writer").unwrap();
        let resolver = AccessResolver::new(store.clone());
        (store, resolver)
    }

    #[test]
    fn admin_reads_everything() {
        let (_, access) = setup();
        for restrictions in [vec!["reader"], vec!["nobody"], vec![GROUP_PUBLISHERS]] {
            assert!(access.can_read(&node("writer", &restrictions), "root"));
        }
    }

    #[test]
    fn empty_restrictions_deny_everyone() {
        let (_, access) = setup();
        let n = node("writer", &[]);
        assert!(!access.can_read(&n, "root"));
        assert!(!access.can_read(&n, "reader"));
    }

    #[test]
    fn read_needs_listing_and_a_role() {
        let (store, access) = setup();
        assert!(access.can_read(&node("writer", &["reader"]), "reader"));
        assert!(access.can_read(&node("writer", &[GROUP_USERS]), "reader"));
        assert!(!access.can_read(&node("writer", &["writer"]), "reader"));

        store.create_user("norole", "pw", false).unwrap();
        store.remove_member(GROUP_USERS, "norole").unwrap();
        assert!(!access.can_read(&node("writer", &["norole"]), "norole"));
    }

    #[test]
    fn write_needs_publisher_role() {
        let (_, access) = setup();
        let n = node("writer", &[GROUP_USERS]);
        assert!(access.can_write(&n, "writer"));
        assert!(!access.can_write(&n, "reader"));
        assert!(access.can_write(&n, "root"));
    }

    #[test]
    fn failed_read_denies_write() {
        let (_, access) = setup();
        assert!(!access.can_write(&node("writer", &["reader"]), "writer"));
    }

    #[test]
    fn admin_created_nodes_need_an_admin_writer() {
        let (store, access) = setup();
        let n = node("root", &[GROUP_USERS]);
        assert!(!access.can_write(&n, "writer"));
        store
            .grant_role(&PrincipalRef::User("writer".into()), ROLE_ADMIN)
            .unwrap();
        assert!(!access.can_write(&n, "writer"));
        assert!(access.can_write(&n, "root"));
        store.set_admin("writer", true).unwrap();
        assert!(access.can_write(&n, "writer"));
    }

    #[test]
    fn missing_creator_is_treated_as_ordinary() {
        let (_, access) = setup();
        assert!(access.can_write(&node("system", &[GROUP_USERS]), "writer"));
    }

    #[test]
    fn admin_rights_come_from_the_root() {
        let (store, access) = setup();
        let root = node("system", &[GROUP_USERS, GROUP_ADMINS]);
        assert!(access.can_admin(&root, "root"));
        assert!(!access.can_admin(&root, "writer"));
        store.add_member(GROUP_ADMINS, "writer").unwrap();
        assert!(access.can_admin(&root, "writer"));
        assert!(!access.can_admin(&node("system", &["reader"]), "writer"));
    }

    #[test]
    fn role_changes_apply_immediately() {
        let (store, access) = setup();
        let n = node("reader", &[GROUP_USERS]);
        assert!(access.can_write(&n, "writer"));
        store.remove_member(GROUP_PUBLISHERS, "writer").unwrap();
        assert!(!access.can_write(&n, "writer"));
    }

    #[test]
    fn disabled_and_unknown_users_are_denied() {
        let (store, access) = setup();
        let n = node("writer", &[GROUP_USERS]);
        assert!(!access.can_read(&n, "ghost"));
        store.set_active("root", false).unwrap();
        assert!(!access.can_read(&n, "root"));
    }
}
