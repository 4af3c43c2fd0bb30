//! Structural operations on the node tree.
//!
//! Every mutation takes the coordinator token of the affected parent (and of
//! the node itself for rename), then re-reads the node and re-checks
//! permissions while holding it. Edits that rewrite a whole subtree (move,
//! delete, restore and cascading grants) hold the token of every node in it.
//! Sibling display names are made unique by appending `[n]` to the stem.
//! Multi-node edits write a value snapshot back if any step fails.

use chrono::Utc;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

use crate::access::AccessResolver;
use crate::category::CategoryStore;
use crate::config::{DeletePolicy, VaultConfig};
use crate::engine::{ContentEngine, EngineSession};
use crate::error::{Result, VaultError};
use crate::events::{Event, EventBus};
use crate::lock::{LockCoordinator, NodeGuard};
use crate::model::{
    join_path, validate_name, DirectoryData, DocumentData, Node, NodeAttrs, NodeBase, NodeId,
    NodeKind, NodeVariant, TypeCode, ROOT_PATH,
};
use crate::principal::PrincipalStore;
use crate::slot::SlotAllocator;
use crate::version::VersionTrigger;

/// Split `name` into stem and extension, keeping the dot with the extension.
/// Leading-dot names have no extension.
pub fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(at) if at > 0 => name.split_at(at),
        _ => (name, ""),
    }
}

/// First of `name`, `stem[1].ext`, `stem[2].ext`, ... that is not taken.
pub fn disambiguate(
    name: &str,
    directory: bool,
    max_suffix: u32,
    taken: impl Fn(&str) -> bool,
) -> Result<String> {
    if !taken(name) {
        return Ok(name.to_string());
    }
    let (stem, ext) = if directory {
        (name, "")
    } else {
        split_extension(name)
    };
    (1..=max_suffix)
        .map(|n| format!("{stem}[{n}]{ext}"))
        .find(|candidate| !taken(candidate))
        .ok_or_else(|| VaultError::already_exists("node", name))
}

/// Fail if `node` is a document locked by someone other than `user`.
pub fn check_lock(node: &Node, user: &str) -> Result<()> {
    match node.lock_owner() {
        Some(owner) if owner != user => Err(VaultError::ResourceLocked {
            id: node.id(),
            owner: owner.to_string(),
        }),
        _ => Ok(()),
    }
}

fn next_position(siblings: &[Node]) -> u32 {
    siblings
        .iter()
        .map(|n| n.base.position)
        .max()
        .map_or(0, |p| p + 1)
}

/// `subtree` without the descendants failing `keep` and anything below them.
/// `subtree` must list parents before children; its first node is kept.
fn prune(subtree: Vec<Node>, keep: impl Fn(&Node) -> bool) -> Vec<Node> {
    let mut kept: HashSet<NodeId> = HashSet::new();
    let mut out = Vec::with_capacity(subtree.len());
    for (index, node) in subtree.into_iter().enumerate() {
        let under_kept = node.parent().map_or(false, |p| kept.contains(&p));
        if index == 0 || (under_kept && keep(&node)) {
            kept.insert(node.id());
            out.push(node);
        }
    }
    out
}

/// Copy of `subtree` rooted at `new_root`, with every descendant's path
/// recomputed from its parent's. `subtree` must list parents before children.
fn repath(subtree: &[Node], new_root: Node) -> Vec<Node> {
    let mut paths: HashMap<NodeId, String> = HashMap::new();
    paths.insert(new_root.id(), new_root.base.path.clone());
    let mut out = Vec::with_capacity(subtree.len());
    out.push(new_root);
    for node in subtree.iter().skip(1) {
        let mut node = node.clone();
        if let Some(parent_path) = node.parent().and_then(|p| paths.get(&p)) {
            node.base.path = join_path(parent_path, &node.base.slot);
        }
        paths.insert(node.id(), node.base.path.clone());
        out.push(node);
    }
    out
}

pub struct TreeMutator {
    engine: Arc<dyn ContentEngine>,
    locks: Arc<LockCoordinator>,
    access: Arc<AccessResolver>,
    principals: Arc<PrincipalStore>,
    categories: Arc<CategoryStore>,
    slots: SlotAllocator,
    events: EventBus,
    delete_policy: DeletePolicy,
    max_name_suffix: u32,
}

impl TreeMutator {
    pub fn new(
        engine: Arc<dyn ContentEngine>,
        locks: Arc<LockCoordinator>,
        access: Arc<AccessResolver>,
        principals: Arc<PrincipalStore>,
        categories: Arc<CategoryStore>,
        events: EventBus,
        config: &VaultConfig,
    ) -> Self {
        Self {
            slots: SlotAllocator::new(engine.clone()),
            engine,
            locks,
            access,
            principals,
            categories,
            events,
            delete_policy: config.delete_policy,
            max_name_suffix: config.max_name_suffix,
        }
    }

    pub fn delete_policy(&self) -> DeletePolicy {
        self.delete_policy
    }

    /// Return the root, creating it on an empty engine.
    pub fn ensure_root(&self, session: &EngineSession, restrictions: BTreeSet<String>) -> Result<Node> {
        if let Some(id) = self.engine.root_id(session)? {
            return self.load(session, id);
        }
        let root = Node {
            base: NodeBase {
                id: Uuid::new_v4(),
                name: "root".to_string(),
                slot: String::new(),
                path: ROOT_PATH.to_string(),
                parent: None,
                creator: session.user.clone(),
                created: Utc::now(),
                importance: Default::default(),
                type_code: TypeCode::Directory,
                position: 0,
                size: 0,
                restrictions,
                active: true,
            },
            variant: NodeVariant::Directory(DirectoryData::default()),
        };
        self.engine.create_node(session, &root)?;
        tracing::info!(id = %root.id(), "created repository root");
        Ok(root)
    }

    pub fn root(&self, session: &EngineSession) -> Result<Node> {
        let id = self
            .engine
            .root_id(session)?
            .ok_or_else(|| VaultError::not_found("node", ROOT_PATH))?;
        self.load(session, id)
    }

    pub fn load(&self, session: &EngineSession, id: NodeId) -> Result<Node> {
        self.engine
            .get_node(session, id)?
            .ok_or_else(|| VaultError::not_found("node", id))
    }

    /// Load a node that has not been deleted.
    pub fn load_active(&self, session: &EngineSession, id: NodeId) -> Result<Node> {
        let node = self.load(session, id)?;
        if !node.is_active() {
            return Err(VaultError::not_found("node", id));
        }
        Ok(node)
    }

    pub fn require_admin(&self, session: &EngineSession) -> Result<()> {
        let root = self.root(session)?;
        self.access.require_admin(&root, &session.user)
    }

    /// Take the tokens of `id`, its parent and `extra`, and return the node
    /// as read while holding them. Retries if the node moved in between.
    pub fn lock_node(
        &self,
        session: &EngineSession,
        id: NodeId,
        extra: &[NodeId],
    ) -> Result<(Vec<NodeGuard>, Node)> {
        loop {
            let seen = self.load(session, id)?;
            let mut ids = vec![id];
            ids.extend(seen.parent());
            ids.extend_from_slice(extra);
            let guards = self.locks.acquire_all(&ids);
            let node = self.load(session, id)?;
            if node.parent() == seen.parent() {
                return Ok((guards, node));
            }
            tracing::debug!(id = %id, "node moved while locking, retrying");
        }
    }

    /// Take the tokens of `id`, its parent, every node below it and `extra`
    /// in one batch, and return the subtree (deleted nodes included, parents
    /// first) as read while holding them. Retries if the subtree changed
    /// shape in between.
    pub fn lock_subtree(
        &self,
        session: &EngineSession,
        id: NodeId,
        extra: &[NodeId],
    ) -> Result<(Vec<NodeGuard>, Vec<Node>)> {
        loop {
            let seen = self.collect_subtree(session, &self.load(session, id)?, true)?;
            let parent = seen[0].parent();
            let members: HashSet<NodeId> = seen.iter().map(|n| n.id()).collect();
            let mut ids: Vec<NodeId> = members.iter().copied().collect();
            ids.extend(parent);
            ids.extend_from_slice(extra);
            let guards = self.locks.acquire_all(&ids);

            let subtree = self.collect_subtree(session, &self.load(session, id)?, true)?;
            let unchanged = subtree[0].parent() == parent
                && subtree.len() == members.len()
                && subtree.iter().all(|n| members.contains(&n.id()));
            if unchanged {
                return Ok((guards, subtree));
            }
            tracing::debug!(id = %id, "subtree changed while locking, retrying");
        }
    }

    /// Fail if `node`, or the document owning it, is locked by someone else.
    pub fn ensure_unlocked(&self, session: &EngineSession, node: &Node, user: &str) -> Result<()> {
        check_lock(node, user)?;
        if node.kind() == NodeKind::Resource {
            if let Some(owner) = node.parent() {
                if let Some(document) = self.engine.get_node(session, owner)? {
                    check_lock(&document, user)?;
                }
            }
        }
        Ok(())
    }

    fn ensure_subtree_unlocked(nodes: &[Node], user: &str) -> Result<()> {
        nodes.iter().try_for_each(|n| check_lock(n, user))
    }

    /// `root` followed by its descendants, parents before children.
    pub fn collect_subtree(
        &self,
        session: &EngineSession,
        root: &Node,
        include_inactive: bool,
    ) -> Result<Vec<Node>> {
        let mut out = vec![root.clone()];
        let mut queue = VecDeque::from([root.id()]);
        while let Some(id) = queue.pop_front() {
            for child in self.engine.children(session, id)? {
                if !include_inactive && !child.is_active() {
                    continue;
                }
                queue.push_back(child.id());
                out.push(child);
            }
        }
        Ok(out)
    }

    /// Whether `node` is `ancestor` or lies below it.
    fn is_within(&self, session: &EngineSession, node: &Node, ancestor: NodeId) -> Result<bool> {
        let mut current = Some(node.id());
        while let Some(id) = current {
            if id == ancestor {
                return Ok(true);
            }
            current = self.load(session, id)?.parent();
        }
        Ok(false)
    }

    fn unique_name(
        &self,
        siblings: &[Node],
        name: &str,
        directory: bool,
        except: Option<NodeId>,
    ) -> Result<String> {
        disambiguate(name, directory, self.max_name_suffix, |candidate| {
            siblings
                .iter()
                .any(|s| s.is_active() && Some(s.id()) != except && s.name() == candidate)
        })
    }

    /// Write `updated`; on failure put back `originals` and return the error.
    fn write_all(&self, session: &EngineSession, updated: &[Node], originals: &[Node]) -> Result<()> {
        for (written, node) in updated.iter().enumerate() {
            if let Err(e) = self.engine.put_node(session, node) {
                tracing::warn!(id = %node.id(), "write failed, restoring {} nodes: {}", written, e);
                self.restore_snapshot(session, &originals[..written.min(originals.len())]);
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn restore_snapshot(&self, session: &EngineSession, originals: &[Node]) {
        for node in originals {
            if let Err(e) = self.engine.put_node(session, node) {
                tracing::warn!(id = %node.id(), "failed to restore node: {}", e);
            }
        }
    }

    /// Remove freshly created nodes, newest first.
    fn discard(&self, session: &EngineSession, created: &[NodeId]) {
        for id in created.iter().rev() {
            if let Err(e) = self.engine.remove_node(session, *id) {
                tracing::warn!(id = %id, "cleanup of partially created node failed: {}", e);
            }
        }
    }

    pub fn create_child(
        &self,
        session: &EngineSession,
        parent: NodeId,
        name: &str,
        kind: NodeKind,
        attrs: NodeAttrs,
    ) -> Result<Node> {
        validate_name(name)?;
        let user = session.user.as_str();
        let _guard = self.locks.acquire(parent);
        let parent_node = self.load_active(session, parent)?;
        let allowed = matches!(
            (kind, parent_node.kind()),
            (NodeKind::Directory | NodeKind::Document, NodeKind::Directory)
                | (NodeKind::Resource, NodeKind::Document)
        );
        if !allowed {
            return Err(VaultError::invalid(format!(
                "cannot create a {} under a {}",
                kind.as_str(),
                parent_node.kind().as_str()
            )));
        }
        self.access.require_write(&parent_node, user)?;
        check_lock(&parent_node, user)?;

        let directory = kind == NodeKind::Directory;
        let siblings = self.engine.children(session, parent)?;
        let name = self.unique_name(&siblings, name, directory, None)?;
        let slot = self.slots.next_slot(session, parent, directory)?;
        let mut restrictions = parent_node.base.restrictions.clone();
        restrictions.insert(user.to_string());

        let NodeAttrs {
            importance,
            content,
            meta,
            properties,
            categories,
        } = attrs;
        let variant = match kind {
            NodeKind::Directory => NodeVariant::Directory(DirectoryData::default()),
            NodeKind::Document => NodeVariant::Document(DocumentData {
                meta,
                properties,
                categories,
                ..Default::default()
            }),
            NodeKind::Resource => NodeVariant::Resource,
        };
        let node = Node {
            base: NodeBase {
                id: Uuid::new_v4(),
                type_code: if directory {
                    TypeCode::Directory
                } else {
                    TypeCode::from_name(&name)
                },
                name,
                path: join_path(&parent_node.base.path, &slot),
                slot,
                parent: Some(parent),
                creator: user.to_string(),
                created: Utc::now(),
                importance,
                position: next_position(&siblings),
                size: if directory { 0 } else { content.len() as u64 },
                restrictions,
                active: true,
            },
            variant,
        };

        self.engine.create_node(session, &node)?;
        if !directory && !content.is_empty() {
            if let Err(e) = self.engine.set_content(session, node.id(), &content) {
                self.discard(session, &[node.id()]);
                return Err(e.into());
            }
        }
        if kind == NodeKind::Resource {
            let mut document = parent_node;
            if let Some(data) = document.as_document_mut() {
                data.resources.insert(node.id());
            }
            if let Err(e) = self.engine.put_node(session, &document) {
                self.discard(session, &[node.id()]);
                return Err(e.into());
            }
        }

        tracing::debug!(id = %node.id(), path = %node.path(), kind = kind.as_str(), "created node");
        self.events.send(Event::Created {
            id: node.id(),
            parent,
        });
        Ok(node)
    }

    pub fn rename(&self, session: &EngineSession, id: NodeId, new_name: &str) -> Result<Node> {
        validate_name(new_name)?;
        let user = session.user.as_str();
        let (_guards, node) = self.lock_node(session, id, &[])?;
        if !node.is_active() {
            return Err(VaultError::not_found("node", id));
        }
        let Some(parent) = node.parent() else {
            return Err(VaultError::invalid("the root cannot be renamed"));
        };
        self.access.require_write(&node, user)?;
        self.ensure_unlocked(session, &node, user)?;

        let siblings = self.engine.children(session, parent)?;
        let name = self.unique_name(&siblings, new_name, node.is_directory(), Some(id))?;
        if name == node.name() {
            return Ok(node);
        }
        let mut renamed = node;
        renamed.base.name = name;
        if !renamed.is_directory() {
            renamed.base.type_code = TypeCode::from_name(&renamed.base.name);
        }
        self.engine.put_node(session, &renamed)?;

        tracing::debug!(id = %id, name = %renamed.name(), "renamed node");
        self.events.send(Event::Renamed {
            id,
            name: renamed.name().to_string(),
        });
        Ok(renamed)
    }

    pub fn move_node(&self, session: &EngineSession, id: NodeId, dest: NodeId) -> Result<Node> {
        let user = session.user.as_str();
        let (_guards, subtree) = self.lock_subtree(session, id, &[dest])?;
        let node = &subtree[0];
        if !node.is_active() {
            return Err(VaultError::not_found("node", id));
        }
        let Some(old_parent) = node.parent() else {
            return Err(VaultError::invalid("the root cannot be moved"));
        };
        if node.kind() == NodeKind::Resource {
            return Err(VaultError::invalid("resources move with their document"));
        }
        let dest_node = self.load_active(session, dest)?;
        if !dest_node.is_directory() {
            return Err(VaultError::invalid(format!("{dest} is not a directory")));
        }
        // the source's own parent is not write-checked
        self.access.require_read(node, user)?;
        self.access.require_write(&dest_node, user)?;
        if node.is_directory() && self.is_within(session, &dest_node, id)? {
            return Err(VaultError::invalid("cannot move a directory into itself"));
        }
        if old_parent == dest {
            return Ok(node.clone());
        }
        Self::ensure_subtree_unlocked(&subtree, user)?;

        let directory = node.is_directory();
        let siblings = self.engine.children(session, dest)?;
        let mut moved = node.clone();
        moved.base.name = self.unique_name(&siblings, node.name(), directory, None)?;
        moved.base.slot = self
            .slots
            .place(session, dest, &node.base.slot, directory, None)?;
        moved.base.parent = Some(dest);
        moved.base.path = join_path(&dest_node.base.path, &moved.base.slot);
        moved.base.position = next_position(&siblings);

        let updated = repath(&subtree, moved);
        self.write_all(session, &updated, &subtree)?;

        tracing::debug!(id = %id, from = %node.path(), to = %updated[0].path(), "moved node");
        self.events.send(Event::Moved { id, new_parent: dest });
        Ok(updated[0].clone())
    }

    pub fn copy_node(&self, session: &EngineSession, id: NodeId, dest: NodeId) -> Result<Node> {
        let user = session.user.as_str();
        let _guard = self.locks.acquire(dest);
        let source = self.load_active(session, id)?;
        if source.kind() == NodeKind::Resource {
            return Err(VaultError::invalid("resources are copied with their document"));
        }
        let dest_node = self.load_active(session, dest)?;
        if !dest_node.is_directory() {
            return Err(VaultError::invalid(format!("{dest} is not a directory")));
        }
        self.access.require_read(&source, user)?;
        self.access.require_write(&dest_node, user)?;
        if source.is_directory() && self.is_within(session, &dest_node, id)? {
            return Err(VaultError::invalid("cannot copy a directory into itself"));
        }

        let active = self.collect_subtree(session, &source, false)?;
        let total = active.len();
        let subtree = prune(active, |n| self.access.can_read(n, user));
        if subtree.len() < total {
            tracing::debug!(source = %id, skipped = total - subtree.len(), "left unreadable nodes out of copy");
        }
        let siblings = self.engine.children(session, dest)?;
        let name = self.unique_name(&siblings, source.name(), source.is_directory(), None)?;
        let slot = self.slots.next_slot(session, dest, source.is_directory())?;

        let mut created = Vec::with_capacity(subtree.len());
        let result = self.copy_subtree(
            session,
            &subtree,
            &dest_node,
            name,
            slot,
            next_position(&siblings),
            &mut created,
        );
        match result {
            Ok(copy) => {
                tracing::debug!(source = %id, copy = %copy.id(), nodes = created.len(), "copied subtree");
                self.events.send(Event::Copied {
                    id: copy.id(),
                    source: id,
                });
                Ok(copy)
            }
            Err(e) => {
                self.discard(session, &created);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_subtree(
        &self,
        session: &EngineSession,
        subtree: &[Node],
        dest: &Node,
        name: String,
        slot: String,
        position: u32,
        created: &mut Vec<NodeId>,
    ) -> Result<Node> {
        let user = session.user.as_str();
        let ids: HashMap<NodeId, NodeId> = subtree.iter().map(|n| (n.id(), Uuid::new_v4())).collect();
        let mut paths: HashMap<NodeId, String> = HashMap::new();
        let now = Utc::now();
        let mut top = None;

        for (index, original) in subtree.iter().enumerate() {
            let mut copy = original.clone();
            copy.base.id = ids[&original.id()];
            if index == 0 {
                copy.base.name = name.clone();
                copy.base.slot = slot.clone();
                copy.base.parent = Some(dest.id());
                copy.base.path = join_path(&dest.base.path, &slot);
                copy.base.position = position;
            } else {
                let parent = original.parent().and_then(|p| ids.get(&p).copied());
                copy.base.parent = parent;
                if let Some(parent_path) = parent.and_then(|p| paths.get(&p)) {
                    copy.base.path = join_path(parent_path, &copy.base.slot);
                }
            }
            copy.base.creator = user.to_string();
            copy.base.created = now;
            copy.base.active = true;
            copy.base
                .restrictions
                .extend(dest.base.restrictions.iter().cloned());
            copy.base.restrictions.insert(user.to_string());
            match &mut copy.variant {
                NodeVariant::Document(data) => {
                    data.notes.clear();
                    data.relations.clear();
                    data.lock = None;
                    data.resources = data
                        .resources
                        .iter()
                        .filter_map(|r| ids.get(r).copied())
                        .collect();
                }
                NodeVariant::Directory(data) => data.children = None,
                NodeVariant::Resource => {}
            }

            self.engine.create_node(session, &copy)?;
            created.push(copy.id());
            if !copy.is_directory() {
                let bytes = self.engine.content(session, original.id())?;
                if !bytes.is_empty() {
                    self.engine.set_content(session, copy.id(), &bytes)?;
                }
            }
            paths.insert(copy.id(), copy.base.path.clone());
            if index == 0 {
                top = Some(copy);
            }
        }
        top.ok_or_else(|| VaultError::not_found("node", dest.id()))
    }

    /// Delete according to the configured policy. Returns the affected ids.
    pub fn delete(&self, session: &EngineSession, id: NodeId) -> Result<HashSet<NodeId>> {
        let user = session.user.as_str();
        let (_guards, subtree) = self.lock_subtree(session, id, &[])?;
        let node = &subtree[0];
        if !node.is_active() {
            return Err(VaultError::not_found("node", id));
        }
        if node.parent().is_none() {
            return Err(VaultError::invalid("the root cannot be deleted"));
        }
        self.access.require_write(node, user)?;
        self.ensure_unlocked(session, node, user)?;

        match self.delete_policy {
            DeletePolicy::Soft => self.soft_delete(session, prune(subtree, Node::is_active)),
            DeletePolicy::Physical => self.remove_subtree(session, &subtree),
        }
    }

    /// Mark `subtree` deleted. The caller holds the tokens of every node in it.
    fn soft_delete(&self, session: &EngineSession, subtree: Vec<Node>) -> Result<HashSet<NodeId>> {
        Self::ensure_subtree_unlocked(&subtree, &session.user)?;
        let node = &subtree[0];
        let updated: Vec<Node> = subtree
            .iter()
            .cloned()
            .map(|mut n| {
                n.base.active = false;
                n
            })
            .collect();
        self.write_all(session, &updated, &subtree)?;

        let ids: HashSet<NodeId> = subtree.iter().map(|n| n.id()).collect();
        for id in &ids {
            if let Err(e) = self.engine.deindex(session, *id) {
                tracing::warn!(id = %id, "failed to remove node from index: {}", e);
            }
        }
        self.forget(&ids);
        tracing::info!(id = %node.id(), nodes = ids.len(), "soft deleted subtree");
        self.events.send(Event::Deleted {
            id: node.id(),
            physical: false,
        });
        Ok(ids)
    }

    /// Physically remove `subtree`, children first. The caller holds the
    /// tokens of every node in it.
    fn remove_subtree(&self, session: &EngineSession, subtree: &[Node]) -> Result<HashSet<NodeId>> {
        Self::ensure_subtree_unlocked(subtree, &session.user)?;
        let node = &subtree[0];

        for n in subtree.iter().filter(|n| VersionTrigger::is_versionable(n)) {
            if let Err(e) = self.engine.purge_versions(session, n.id()) {
                tracing::warn!(id = %n.id(), "could not purge version history: {}", e);
            }
        }
        for n in subtree.iter().rev() {
            self.engine.remove_node(session, n.id())?;
        }
        if node.kind() == NodeKind::Resource {
            self.detach_resource(session, node);
        }

        let ids: HashSet<NodeId> = subtree.iter().map(|n| n.id()).collect();
        self.forget(&ids);
        tracing::info!(id = %node.id(), nodes = ids.len(), "physically deleted subtree");
        self.events.send(Event::Deleted {
            id: node.id(),
            physical: true,
        });
        Ok(ids)
    }

    fn detach_resource(&self, session: &EngineSession, resource: &Node) {
        let Some(owner) = resource.parent() else {
            return;
        };
        let detached = self.engine.get_node(session, owner).and_then(|document| match document {
            Some(mut document) => {
                if let Some(data) = document.as_document_mut() {
                    data.resources.remove(&resource.id());
                }
                self.engine.put_node(session, &document)
            }
            None => Ok(()),
        });
        if let Err(e) = detached {
            tracing::warn!(id = %resource.id(), "failed to detach resource from its document: {}", e);
        }
    }

    fn forget(&self, ids: &HashSet<NodeId>) {
        let favorites = self.categories.remove_favorites_for(ids);
        let bookmarks = self.principals.remove_bookmarks_for(ids);
        if favorites + bookmarks > 0 {
            tracing::debug!(favorites, bookmarks, "dropped references to deleted nodes");
        }
    }

    /// Undo a soft delete. Administrators only.
    pub fn restore(&self, session: &EngineSession, id: NodeId) -> Result<Node> {
        self.require_admin(session)?;
        let (_guards, subtree) = self.lock_subtree(session, id, &[])?;
        let node = &subtree[0];
        if node.is_active() {
            return Err(VaultError::invalid(format!("node {id} is not deleted")));
        }
        let parent = node
            .parent()
            .ok_or_else(|| VaultError::invalid("the root cannot be restored"))?;
        let parent_node = self.load(session, parent)?;
        if !parent_node.is_active() {
            return Err(VaultError::invalid(format!(
                "parent of {id} is deleted, restore it first"
            )));
        }

        let directory = node.is_directory();
        let siblings = self.engine.children(session, parent)?;
        let mut restored = node.clone();
        restored.base.name = self.unique_name(&siblings, node.name(), directory, Some(id))?;
        let slot = self
            .slots
            .place(session, parent, &node.base.slot, directory, Some(id))?;
        if slot != node.base.slot {
            restored.base.slot = slot;
            restored.base.path = join_path(&parent_node.base.path, &restored.base.slot);
        }

        let updated: Vec<Node> = repath(&subtree, restored)
            .into_iter()
            .map(|mut n| {
                n.base.active = true;
                n
            })
            .collect();
        self.write_all(session, &updated, &subtree)?;
        for n in &updated {
            if let Err(e) = self.engine.reindex(session, n.id()) {
                tracing::warn!(id = %n.id(), "failed to reindex restored node: {}", e);
            }
        }

        tracing::info!(id = %id, nodes = updated.len(), "restored subtree");
        self.events.send(Event::Restored { id });
        Ok(updated[0].clone())
    }

    /// Physically remove a soft-deleted subtree. Administrators only.
    pub fn purge(&self, session: &EngineSession, id: NodeId) -> Result<HashSet<NodeId>> {
        self.require_admin(session)?;
        let (_guards, subtree) = self.lock_subtree(session, id, &[])?;
        if subtree[0].is_active() {
            return Err(VaultError::invalid(format!(
                "node {id} must be deleted before it is purged"
            )));
        }
        self.remove_subtree(session, &subtree)
    }

    /// Topmost soft-deleted nodes. Administrators only.
    pub fn trash(&self, session: &EngineSession) -> Result<Vec<Node>> {
        self.require_admin(session)?;
        let root = self.root(session)?;
        let mut out = Vec::new();
        let mut queue = VecDeque::from([root.id()]);
        while let Some(id) = queue.pop_front() {
            for child in self.engine.children(session, id)? {
                if child.is_active() {
                    queue.push_back(child.id());
                } else {
                    out.push(child);
                }
            }
        }
        Ok(out)
    }

    /// Add `principal` to the restrictions of `id`, and of its active
    /// descendants when `recursive`. Returns how many nodes changed.
    pub fn grant(
        &self,
        session: &EngineSession,
        id: NodeId,
        principal: &str,
        recursive: bool,
    ) -> Result<usize> {
        if !self.principals.principal_exists(principal) {
            return Err(VaultError::not_found("principal", principal));
        }
        let (_guards, targets) = self.restriction_targets(session, id, recursive)?;
        let (originals, updated): (Vec<Node>, Vec<Node>) = targets
            .into_iter()
            .filter(|n| !n.base.restrictions.contains(principal))
            .map(|n| {
                let mut changed = n.clone();
                changed.base.restrictions.insert(principal.to_string());
                (n, changed)
            })
            .unzip();
        self.write_all(session, &updated, &originals)?;

        tracing::debug!(id = %id, principal, changed = updated.len(), "granted access");
        self.events.send(Event::Shared {
            id,
            principal: principal.to_string(),
        });
        Ok(updated.len())
    }

    /// Remove `principal` from the restrictions of `id`, and of its active
    /// descendants when `recursive`. A restriction set is never left empty.
    pub fn revoke(
        &self,
        session: &EngineSession,
        id: NodeId,
        principal: &str,
        recursive: bool,
    ) -> Result<usize> {
        let (_guards, targets) = self.restriction_targets(session, id, recursive)?;
        let holders: Vec<Node> = targets
            .into_iter()
            .filter(|n| n.base.restrictions.contains(principal))
            .collect();
        if let Some(last) = holders.iter().find(|n| n.base.restrictions.len() == 1) {
            return Err(VaultError::invalid(format!(
                "{principal} is the only principal allowed on {}",
                last.id()
            )));
        }
        let updated: Vec<Node> = holders
            .iter()
            .cloned()
            .map(|mut n| {
                n.base.restrictions.remove(principal);
                n
            })
            .collect();
        self.write_all(session, &updated, &holders)?;

        tracing::debug!(id = %id, principal, changed = updated.len(), "revoked access");
        self.events.send(Event::Unshared {
            id,
            principal: principal.to_string(),
        });
        Ok(updated.len())
    }

    /// Lock and return `id`, with its active descendants when `recursive`,
    /// after checking the caller may edit all of them.
    fn restriction_targets(
        &self,
        session: &EngineSession,
        id: NodeId,
        recursive: bool,
    ) -> Result<(Vec<NodeGuard>, Vec<Node>)> {
        let user = session.user.as_str();
        let (guards, nodes) = if recursive {
            self.lock_subtree(session, id, &[])?
        } else {
            let (guards, node) = self.lock_node(session, id, &[])?;
            (guards, vec![node])
        };
        let node = &nodes[0];
        if !node.is_active() {
            return Err(VaultError::not_found("node", id));
        }
        self.access.require_write(node, user)?;
        self.ensure_unlocked(session, node, user)?;
        let targets = prune(nodes, Node::is_active);
        Self::ensure_subtree_unlocked(&targets, user)?;
        Ok((guards, targets))
    }
}
