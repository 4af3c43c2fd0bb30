use uuid::Uuid;

use super::Repository;
use crate::category::{Category, Favorite};
use crate::error::{Result, VaultError};
use crate::model::{NodeId, NodeKind};
use crate::principal::{Bookmark, Group, PrincipalRef, Role, User};
use crate::session::{Session, Ticket};

impl Repository {
    fn admin_session(&self, ticket: &Ticket) -> Result<Session> {
        let session = self.session(ticket)?;
        self.require_admin(&session)?;
        Ok(session)
    }

    pub fn create_user(&self, ticket: &Ticket, id: &str, password: &str, admin: bool) -> Result<User> {
        let session = self.admin_session(ticket)?;
        let user = self.principals.create_user(id, password, admin)?;
        tracing::info!(user = id, admin, by = %session.user, "created user");
        Ok(user)
    }

    /// Remove a user, ending their sessions and dropping their favorites.
    pub fn delete_user(&self, ticket: &Ticket, id: &str) -> Result<()> {
        let session = self.admin_session(ticket)?;
        if session.user == id {
            return Err(VaultError::invalid("users cannot delete themselves"));
        }
        self.principals.delete_user(id)?;
        let sessions = self.registry.revoke_user(id);
        let favorites = self.categories.remove_favorites_of(id);
        tracing::info!(user = id, sessions, favorites, by = %session.user, "deleted user");
        Ok(())
    }

    pub fn get_user(&self, ticket: &Ticket, id: &str) -> Result<User> {
        let session = self.session(ticket)?;
        if session.user != id {
            self.require_admin(&session)?;
        }
        self.principals
            .get_user(id)
            .ok_or_else(|| VaultError::not_found("user", id))
    }

    pub fn list_users(&self, ticket: &Ticket) -> Result<Vec<User>> {
        self.admin_session(ticket)?;
        Ok(self.principals.list_users())
    }

    /// Change a password. Users may change their own; administrators any.
    pub fn set_password(&self, ticket: &Ticket, id: &str, password: &str) -> Result<()> {
        let session = self.session(ticket)?;
        if session.user != id {
            self.require_admin(&session)?;
        }
        self.principals.set_password(id, password)
    }

    pub fn set_user_admin(&self, ticket: &Ticket, id: &str, admin: bool) -> Result<()> {
        let session = self.admin_session(ticket)?;
        if session.user == id && !admin {
            return Err(VaultError::invalid("administrators cannot demote themselves"));
        }
        self.principals.set_admin(id, admin)
    }

    /// Enable or disable a login. Disabling ends the user's sessions.
    pub fn set_user_active(&self, ticket: &Ticket, id: &str, active: bool) -> Result<()> {
        let session = self.admin_session(ticket)?;
        if session.user == id && !active {
            return Err(VaultError::invalid("administrators cannot disable themselves"));
        }
        self.principals.set_active(id, active)?;
        if !active {
            self.registry.revoke_user(id);
        }
        Ok(())
    }

    pub fn set_email(&self, ticket: &Ticket, id: &str, email: Option<String>) -> Result<()> {
        let session = self.session(ticket)?;
        if session.user != id {
            self.require_admin(&session)?;
        }
        self.principals.set_email(id, email)
    }

    pub fn create_group(&self, ticket: &Ticket, id: &str) -> Result<Group> {
        self.admin_session(ticket)?;
        self.principals.create_group(id)
    }

    pub fn delete_group(&self, ticket: &Ticket, id: &str) -> Result<()> {
        self.admin_session(ticket)?;
        self.principals.delete_group(id)
    }

    pub fn add_group_member(&self, ticket: &Ticket, group: &str, user: &str) -> Result<()> {
        self.admin_session(ticket)?;
        self.principals.add_member(group, user)
    }

    pub fn remove_group_member(&self, ticket: &Ticket, group: &str, user: &str) -> Result<()> {
        self.admin_session(ticket)?;
        self.principals.remove_member(group, user)
    }

    pub fn list_groups(&self, ticket: &Ticket) -> Result<Vec<Group>> {
        self.session(ticket)?;
        Ok(self.principals.list_groups())
    }

    pub fn create_role(&self, ticket: &Ticket, id: &str, description: &str) -> Result<Role> {
        self.admin_session(ticket)?;
        self.principals.create_role(id, description)
    }

    pub fn delete_role(&self, ticket: &Ticket, id: &str) -> Result<()> {
        self.admin_session(ticket)?;
        self.principals.delete_role(id)
    }

    pub fn grant_role(&self, ticket: &Ticket, holder: &PrincipalRef, role: &str) -> Result<()> {
        let session = self.admin_session(ticket)?;
        self.principals.grant_role(holder, role)?;
        tracing::info!(?holder, role, by = %session.user, "granted role");
        Ok(())
    }

    pub fn revoke_role(&self, ticket: &Ticket, holder: &PrincipalRef, role: &str) -> Result<()> {
        let session = self.admin_session(ticket)?;
        self.principals.revoke_role(holder, role)?;
        tracing::info!(?holder, role, by = %session.user, "revoked role");
        Ok(())
    }

    pub fn list_roles(&self, ticket: &Ticket) -> Result<Vec<Role>> {
        self.session(ticket)?;
        Ok(self.principals.list_roles())
    }

    pub fn add_bookmark(&self, ticket: &Ticket, name: &str, node: NodeId) -> Result<Bookmark> {
        let session = self.session(ticket)?;
        self.visible(&session, node)?;
        self.principals.add_bookmark(&session.user, name, node)
    }

    pub fn remove_bookmark(&self, ticket: &Ticket, bookmark: Uuid) -> Result<()> {
        let session = self.session(ticket)?;
        self.principals.remove_bookmark(&session.user, bookmark)
    }

    pub fn bookmarks(&self, ticket: &Ticket) -> Result<Vec<Bookmark>> {
        let session = self.session(ticket)?;
        Ok(self.principals.bookmarks(&session.user))
    }

    pub fn create_category(
        &self,
        ticket: &Ticket,
        name: &str,
        description: &str,
        parent: Option<Uuid>,
    ) -> Result<Category> {
        self.admin_session(ticket)?;
        self.categories.create(name, description, parent)
    }

    pub fn rename_category(&self, ticket: &Ticket, id: Uuid, name: &str) -> Result<Category> {
        self.admin_session(ticket)?;
        self.categories.rename(id, name)
    }

    /// Delete a leaf category and unassign it from every document. The
    /// unassignment runs on the privileged session and ignores advisory locks.
    pub fn delete_category(&self, ticket: &Ticket, id: Uuid) -> Result<usize> {
        let session = self.admin_session(ticket)?;
        self.categories.delete(id)?;

        let s = &session.system_session;
        let root = self.tree.root(s)?;
        let tagged: Vec<NodeId> = self
            .tree
            .collect_subtree(s, &root, true)?
            .into_iter()
            .filter(|n| n.as_document().map_or(false, |d| d.categories.contains(&id)))
            .map(|n| n.id())
            .collect();

        let mut stripped = 0;
        for doc in tagged {
            let _guard = self.locks.acquire(doc);
            let Some(mut node) = self.engine.get_node(s, doc)? else {
                continue;
            };
            if let Some(data) = node.as_document_mut() {
                if data.categories.remove(&id) {
                    self.engine.put_node(s, &node)?;
                    stripped += 1;
                }
            }
        }
        tracing::info!(category = %id, documents = stripped, "deleted category");
        self.commit(&session)?;
        Ok(stripped)
    }

    /// Direct children of `parent`, or the top-level categories.
    pub fn category_children(&self, ticket: &Ticket, parent: Option<Uuid>) -> Result<Vec<Category>> {
        self.session(ticket)?;
        self.categories.children(parent)
    }

    pub fn add_favorite(&self, ticket: &Ticket, document: NodeId, category: Uuid) -> Result<Favorite> {
        let session = self.session(ticket)?;
        let node = self.visible(&session, document)?;
        if node.kind() != NodeKind::Document {
            return Err(VaultError::invalid(format!("{document} is not a document")));
        }
        self.categories.add_favorite(&session.user, document, category)
    }

    pub fn remove_favorite(&self, ticket: &Ticket, document: NodeId, category: Uuid) -> Result<()> {
        let session = self.session(ticket)?;
        self.categories.remove_favorite(&session.user, document, category)
    }

    pub fn favorites(&self, ticket: &Ticket) -> Result<Vec<Favorite>> {
        let session = self.session(ticket)?;
        Ok(self.categories.favorites(&session.user))
    }
}
