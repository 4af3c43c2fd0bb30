use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

use super::Repository;
use crate::engine::{EngineSession, VersionRecord};
use crate::error::{Result, VaultError};
use crate::events::Event;
use crate::model::{
    DocumentChanges, DocumentData, DocumentUpdate, LockInfo, Node, NodeId, NodeKind, Relation,
};
use crate::session::Ticket;
use crate::tree::check_lock;
use crate::version::VersionTrigger;

/// A change to the reverse edge of a bidirectional relation.
struct MirrorEdit {
    target: NodeId,
    kind: String,
    add: bool,
}

fn mirror_edits(before: &DocumentData, changes: &DocumentChanges) -> Vec<MirrorEdit> {
    let previous = |rel: &Relation| {
        before
            .relations
            .iter()
            .find(|r| r.target == rel.target && r.kind == rel.kind)
    };
    let mut edits = Vec::new();
    for rel in &changes.relations.inserted {
        if rel.bidirectional && previous(rel).is_none() {
            edits.push(MirrorEdit {
                target: rel.target,
                kind: rel.kind.clone(),
                add: true,
            });
        }
    }
    for rel in &changes.relations.updated {
        if let Some(prev) = previous(rel) {
            if prev.bidirectional != rel.bidirectional {
                edits.push(MirrorEdit {
                    target: rel.target,
                    kind: rel.kind.clone(),
                    add: rel.bidirectional,
                });
            }
        }
    }
    for rel in &changes.relations.deleted {
        if previous(rel).map_or(false, |r| r.bidirectional) {
            edits.push(MirrorEdit {
                target: rel.target,
                kind: rel.kind.clone(),
                add: false,
            });
        }
    }
    edits
}

fn expect_document(node: &Node) -> Result<()> {
    if node.kind() == NodeKind::Document {
        Ok(())
    } else {
        Err(VaultError::invalid(format!("{} is not a document", node.id())))
    }
}

impl Repository {
    /// Apply scalar edits, content and the collection diff in `changes` as
    /// one versioned update. `changes` is cleared once the update is stored.
    pub fn update_document(
        &self,
        ticket: &Ticket,
        id: NodeId,
        update: DocumentUpdate,
        changes: &mut DocumentChanges,
    ) -> Result<Node> {
        let session = self.session(ticket)?;
        let s = &session.user_session;
        let user = session.user.as_str();

        let related: Vec<NodeId> = changes
            .relations
            .inserted
            .iter()
            .chain(&changes.relations.updated)
            .chain(&changes.relations.deleted)
            .map(|r| r.target)
            .collect();
        if related.contains(&id) {
            return Err(VaultError::invalid("a document cannot relate to itself"));
        }
        let mut lock_ids = related.clone();
        lock_ids.push(id);
        let _guards = self.locks.acquire_all(&lock_ids);

        let before = self.tree.load_active(s, id)?;
        expect_document(&before)?;
        self.access.require_write(&before, user)?;
        check_lock(&before, user)?;

        let assigned: BTreeSet<Uuid> = changes
            .categories
            .inserted
            .iter()
            .chain(&changes.categories.updated)
            .copied()
            .collect();
        self.check_categories(&assigned)?;
        for target in &changes.relations.inserted {
            let node = self.tree.load_active(s, target.target)?;
            expect_document(&node)?;
            self.access.require_read(&node, user)?;
        }

        let before_data = before
            .as_document()
            .ok_or_else(|| VaultError::invalid(format!("{id} is not a document")))?;
        let mut targets: HashMap<NodeId, (Node, Node)> = HashMap::new();
        for edit in mirror_edits(before_data, changes) {
            if !targets.contains_key(&edit.target) {
                let target = self.tree.load_active(s, edit.target)?;
                expect_document(&target)?;
                self.access.require_write(&target, user)?;
                check_lock(&target, user)?;
                targets.insert(edit.target, (target.clone(), target));
            }
            if let Some(data) = targets
                .get_mut(&edit.target)
                .and_then(|(_, changed)| changed.as_document_mut())
            {
                data.relations.retain(|r| !(r.target == id && r.kind == edit.kind));
                if edit.add {
                    data.relations.push(Relation {
                        target: id,
                        kind: edit.kind,
                        bidirectional: true,
                    });
                }
            }
        }

        let mut after = before.clone();
        if let Some(data) = after.as_document_mut() {
            if let Some(meta) = update.meta {
                data.meta = meta;
            }
            if let Some(properties) = update.properties {
                data.properties = properties;
            }
            changes.apply_to(data)?;
        }
        if let Some(importance) = update.importance {
            after.base.importance = importance;
        }
        if let Some(content) = &update.content {
            after.base.size = content.len() as u64;
        }

        let mut written: Vec<&Node> = Vec::new();
        for (original, changed) in targets.values() {
            if let Err(e) = self.engine.put_node(s, changed) {
                self.put_back(s, &written);
                return Err(e.into());
            }
            written.push(original);
        }
        if let Err(e) = self
            .versions
            .apply(s, &before, &after, update.content.as_deref(), None)
        {
            self.put_back(s, &written);
            return Err(e);
        }
        changes.clear();

        tracing::debug!(id = %id, user, related = targets.len(), "updated document");
        self.notify(Event::Updated { id });
        for target in targets.keys() {
            self.notify(Event::Updated { id: *target });
        }
        self.commit(&session)?;
        Ok(after)
    }

    fn put_back(&self, session: &EngineSession, originals: &[&Node]) {
        for node in originals {
            if let Err(e) = self.engine.put_node(session, node) {
                tracing::warn!(id = %node.id(), "failed to restore related document: {}", e);
            }
        }
    }

    /// Replace the content of a document or resource as a new version.
    pub fn set_content(&self, ticket: &Ticket, id: NodeId, content: Vec<u8>) -> Result<Node> {
        let session = self.session(ticket)?;
        let s = &session.user_session;
        let _guard = self.locks.acquire(id);
        let before = self.tree.load_active(s, id)?;
        if !VersionTrigger::is_versionable(&before) {
            return Err(VaultError::invalid(format!("{id} has no content")));
        }
        self.access.require_write(&before, &session.user)?;
        self.tree.ensure_unlocked(s, &before, &session.user)?;

        let mut after = before.clone();
        after.base.size = content.len() as u64;
        self.versions.apply(s, &before, &after, Some(&content), None)?;
        self.notify(Event::Updated { id });
        self.commit(&session)?;
        Ok(after)
    }

    /// Check a document out to the caller. Locking a document the caller
    /// already holds returns the existing lock.
    pub fn lock_document(&self, ticket: &Ticket, id: NodeId) -> Result<LockInfo> {
        let session = self.session(ticket)?;
        let s = &session.user_session;
        let _guard = self.locks.acquire(id);
        let mut node = self.tree.load_active(s, id)?;
        expect_document(&node)?;
        self.access.require_write(&node, &session.user)?;

        let Some(data) = node.as_document_mut() else {
            return Err(VaultError::invalid(format!("{id} is not a document")));
        };
        if let Some(existing) = &data.lock {
            if existing.owner == session.user {
                return Ok(existing.clone());
            }
            return Err(VaultError::ResourceLocked {
                id,
                owner: existing.owner.clone(),
            });
        }
        let lock = LockInfo {
            owner: session.user.clone(),
            token: Uuid::new_v4(),
            created: Utc::now(),
        };
        data.lock = Some(lock.clone());
        self.engine.put_node(s, &node)?;

        tracing::info!(id = %id, owner = %lock.owner, "document locked");
        self.notify(Event::Locked {
            id,
            owner: lock.owner.clone(),
        });
        self.commit(&session)?;
        Ok(lock)
    }

    /// Release the advisory lock. Only the owner or an administrator may;
    /// unlocking an unlocked document does nothing.
    pub fn unlock_document(&self, ticket: &Ticket, id: NodeId) -> Result<()> {
        let session = self.session(ticket)?;
        let s = &session.user_session;
        let _guard = self.locks.acquire(id);
        let mut node = self.tree.load_active(s, id)?;
        expect_document(&node)?;
        let owner = match node.lock_owner() {
            None => return Ok(()),
            Some(owner) => owner.to_string(),
        };
        if owner != session.user && self.require_admin(&session).is_err() {
            return Err(VaultError::ResourceLocked { id, owner });
        }
        if let Some(data) = node.as_document_mut() {
            data.lock = None;
        }
        self.engine.put_node(s, &node)?;

        tracing::info!(id = %id, owner = %owner, by = %session.user, "document unlocked");
        self.notify(Event::Unlocked { id });
        self.commit(&session)
    }

    pub fn lock_info(&self, ticket: &Ticket, id: NodeId) -> Result<Option<LockInfo>> {
        let session = self.session(ticket)?;
        let node = self.visible(&session, id)?;
        expect_document(&node)?;
        Ok(node.as_document().and_then(|d| d.lock.clone()))
    }

    /// Versions other than the one the working copy came from.
    pub fn get_versions(&self, ticket: &Ticket, id: NodeId) -> Result<Vec<VersionRecord>> {
        let session = self.session(ticket)?;
        let node = self.visible(&session, id)?;
        if !VersionTrigger::is_versionable(&node) {
            return Err(VaultError::invalid(format!("{id} is not versionable")));
        }
        self.versions.versions(&session.user_session, &node)
    }

    pub fn load_version_content(&self, ticket: &Ticket, id: NodeId, version: &str) -> Result<Vec<u8>> {
        let session = self.session(ticket)?;
        let node = self.visible(&session, id)?;
        self.versions.content(&session.user_session, &node, version)
    }

    /// Make the content of `version` current again, as a new version.
    pub fn restore_version(&self, ticket: &Ticket, id: NodeId, version: &str) -> Result<Node> {
        let session = self.session(ticket)?;
        let s = &session.user_session;
        let _guard = self.locks.acquire(id);
        let node = self.tree.load_active(s, id)?;
        self.access.require_write(&node, &session.user)?;
        self.tree.ensure_unlocked(s, &node, &session.user)?;
        let (restored, record) = self.versions.restore(s, &node, version)?;
        tracing::info!(id = %id, from = version, version = %record.name, "restored version");
        self.notify(Event::Updated { id });
        self.commit(&session)?;
        Ok(restored)
    }

    /// Drop all recorded versions. Administrators only.
    pub fn purge_version_history(&self, ticket: &Ticket, id: NodeId) -> Result<()> {
        let session = self.session(ticket)?;
        self.require_admin(&session)?;
        let s = &session.user_session;
        let _guard = self.locks.acquire(id);
        let node = self.tree.load(s, id)?;
        self.versions.purge(s, &node)?;
        tracing::info!(id = %id, "purged version history");
        self.commit(&session)
    }
}
