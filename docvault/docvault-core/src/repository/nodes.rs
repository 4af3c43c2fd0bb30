use std::collections::BTreeSet;
use uuid::Uuid;

use super::Repository;
use crate::category::UNKNOWN_CATEGORY;
use crate::error::{Result, VaultError};
use crate::model::{DirectoryData, Node, NodeAttrs, NodeId, NodeKind, NodeVariant};
use crate::session::{Session, Ticket};

fn expect_kind(node: &Node, kind: NodeKind) -> Result<()> {
    if node.kind() == kind {
        Ok(())
    } else {
        Err(VaultError::invalid(format!(
            "{} is a {}, not a {}",
            node.id(),
            node.kind().as_str(),
            kind.as_str()
        )))
    }
}

impl Repository {
    /// Load a node the caller may see. Deleted nodes are visible to
    /// administrators only.
    pub(crate) fn visible(&self, session: &Session, id: NodeId) -> Result<Node> {
        let node = self.tree.load(&session.user_session, id)?;
        if !node.is_active() && self.require_admin(session).is_err() {
            return Err(VaultError::not_found("node", id));
        }
        self.access.require_read(&node, &session.user)?;
        Ok(node)
    }

    pub(crate) fn check_categories(&self, categories: &BTreeSet<Uuid>) -> Result<()> {
        for id in categories {
            if *id == UNKNOWN_CATEGORY {
                return Err(VaultError::invalid("the unknown category cannot be assigned"));
            }
            if !self.categories.exists(*id) {
                return Err(VaultError::not_found("category", id));
            }
        }
        Ok(())
    }

    pub fn root(&self, ticket: &Ticket) -> Result<Node> {
        let session = self.session(ticket)?;
        let root = self.tree.root(&session.user_session)?;
        self.access.require_read(&root, &session.user)?;
        Ok(root)
    }

    pub fn get_node(&self, ticket: &Ticket, id: NodeId) -> Result<Node> {
        let session = self.session(ticket)?;
        self.visible(&session, id)
    }

    /// Resolve a logical path such as `/0/3/f1`.
    pub fn get_node_by_path(&self, ticket: &Ticket, path: &str) -> Result<Node> {
        let session = self.session(ticket)?;
        let mut node = self.tree.root(&session.user_session)?;
        let relative = path.trim_matches('/');
        if !relative.is_empty() {
            for segment in relative.split('/') {
                node = self
                    .engine
                    .children(&session.user_session, node.id())?
                    .into_iter()
                    .find(|c| c.is_active() && c.base.slot == segment)
                    .ok_or_else(|| VaultError::not_found("path", path))?;
            }
        }
        self.access.require_read(&node, &session.user)?;
        Ok(node)
    }

    /// Load a directory; with `eager` its readable children are attached.
    pub fn get_directory(&self, ticket: &Ticket, id: NodeId, eager: bool) -> Result<Node> {
        let session = self.session(ticket)?;
        let mut node = self.visible(&session, id)?;
        expect_kind(&node, NodeKind::Directory)?;
        if eager {
            let children = self.readable_children(&session, id)?;
            node.variant = NodeVariant::Directory(DirectoryData {
                children: Some(children),
            });
        }
        Ok(node)
    }

    fn readable_children(&self, session: &Session, id: NodeId) -> Result<Vec<Node>> {
        Ok(self
            .engine
            .children(&session.user_session, id)?
            .into_iter()
            .filter(|c| c.is_active() && self.access.can_read(c, &session.user))
            .collect())
    }

    /// Active children the caller may read, in position order.
    pub fn list_children(&self, ticket: &Ticket, id: NodeId) -> Result<Vec<Node>> {
        let session = self.session(ticket)?;
        self.visible(&session, id)?;
        self.readable_children(&session, id)
    }

    pub fn create_directory(&self, ticket: &Ticket, parent: NodeId, name: &str) -> Result<Node> {
        let session = self.session(ticket)?;
        let node = self.tree.create_child(
            &session.user_session,
            parent,
            name,
            NodeKind::Directory,
            NodeAttrs::default(),
        )?;
        self.commit(&session)?;
        Ok(node)
    }

    pub fn create_document(
        &self,
        ticket: &Ticket,
        parent: NodeId,
        name: &str,
        attrs: NodeAttrs,
    ) -> Result<Node> {
        let session = self.session(ticket)?;
        self.check_categories(&attrs.categories)?;
        let node = self
            .tree
            .create_child(&session.user_session, parent, name, NodeKind::Document, attrs)?;
        self.commit(&session)?;
        Ok(node)
    }

    /// Attach a satellite file to a document.
    pub fn create_resource(
        &self,
        ticket: &Ticket,
        document: NodeId,
        name: &str,
        content: Vec<u8>,
    ) -> Result<Node> {
        let session = self.session(ticket)?;
        let attrs = NodeAttrs {
            content,
            ..Default::default()
        };
        let node = self
            .tree
            .create_child(&session.user_session, document, name, NodeKind::Resource, attrs)?;
        self.commit(&session)?;
        Ok(node)
    }

    pub fn get_content(&self, ticket: &Ticket, id: NodeId) -> Result<Vec<u8>> {
        let session = self.session(ticket)?;
        let node = self.visible(&session, id)?;
        if node.is_directory() {
            return Err(VaultError::invalid(format!("{id} is a directory")));
        }
        Ok(self.engine.content(&session.user_session, id)?)
    }

    pub fn remove_document(&self, ticket: &Ticket, id: NodeId) -> Result<()> {
        let session = self.session(ticket)?;
        let node = self.tree.load_active(&session.user_session, id)?;
        expect_kind(&node, NodeKind::Document)?;
        self.tree.delete(&session.user_session, id)?;
        self.commit(&session)
    }

    /// Delete any node under the configured policy.
    pub fn remove_node(&self, ticket: &Ticket, id: NodeId) -> Result<()> {
        let session = self.session(ticket)?;
        self.tree.delete(&session.user_session, id)?;
        self.commit(&session)
    }

    pub fn rename_node(&self, ticket: &Ticket, id: NodeId, name: &str) -> Result<Node> {
        let session = self.session(ticket)?;
        let node = self.tree.rename(&session.user_session, id, name)?;
        self.commit(&session)?;
        Ok(node)
    }

    pub fn move_node(&self, ticket: &Ticket, id: NodeId, dest: NodeId) -> Result<Node> {
        let session = self.session(ticket)?;
        let node = self.tree.move_node(&session.user_session, id, dest)?;
        self.commit(&session)?;
        Ok(node)
    }

    pub fn move_directory(&self, ticket: &Ticket, id: NodeId, dest: NodeId) -> Result<Node> {
        self.move_kind(ticket, id, dest, NodeKind::Directory)
    }

    pub fn move_document(&self, ticket: &Ticket, id: NodeId, dest: NodeId) -> Result<Node> {
        self.move_kind(ticket, id, dest, NodeKind::Document)
    }

    fn move_kind(&self, ticket: &Ticket, id: NodeId, dest: NodeId, kind: NodeKind) -> Result<Node> {
        let session = self.session(ticket)?;
        expect_kind(&self.tree.load_active(&session.user_session, id)?, kind)?;
        let node = self.tree.move_node(&session.user_session, id, dest)?;
        self.commit(&session)?;
        Ok(node)
    }

    pub fn copy_node(&self, ticket: &Ticket, id: NodeId, dest: NodeId) -> Result<Node> {
        let session = self.session(ticket)?;
        let node = self.tree.copy_node(&session.user_session, id, dest)?;
        self.commit(&session)?;
        Ok(node)
    }

    pub fn copy_directory(&self, ticket: &Ticket, id: NodeId, dest: NodeId) -> Result<Node> {
        self.copy_kind(ticket, id, dest, NodeKind::Directory)
    }

    pub fn copy_document(&self, ticket: &Ticket, id: NodeId, dest: NodeId) -> Result<Node> {
        self.copy_kind(ticket, id, dest, NodeKind::Document)
    }

    fn copy_kind(&self, ticket: &Ticket, id: NodeId, dest: NodeId, kind: NodeKind) -> Result<Node> {
        let session = self.session(ticket)?;
        expect_kind(&self.tree.load_active(&session.user_session, id)?, kind)?;
        let node = self.tree.copy_node(&session.user_session, id, dest)?;
        self.commit(&session)?;
        Ok(node)
    }

    /// Undo a soft delete. Administrators only.
    pub fn restore_node(&self, ticket: &Ticket, id: NodeId) -> Result<Node> {
        let session = self.session(ticket)?;
        let node = self.tree.restore(&session.user_session, id)?;
        self.commit(&session)?;
        Ok(node)
    }

    /// Physically remove a soft-deleted subtree. Administrators only.
    pub fn purge_node(&self, ticket: &Ticket, id: NodeId) -> Result<()> {
        let session = self.session(ticket)?;
        self.tree.purge(&session.user_session, id)?;
        self.commit(&session)
    }

    /// Topmost soft-deleted nodes. Administrators only.
    pub fn list_trash(&self, ticket: &Ticket) -> Result<Vec<Node>> {
        let session = self.session(ticket)?;
        self.tree.trash(&session.user_session)
    }
}
