//! In-memory content engine.
//!
//! Nodes, content and version history live in maps behind a single lock and
//! are optionally written to a JSON file on `flush` and loaded again by
//! [`MemoryEngine::open`].

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use super::{
    ContentEngine, EngineSession, QueryFilter, QueryRow, VersionHistory, VersionRecord,
};
use crate::error::{EngineError, EngineResult};
use crate::model::{Node, NodeId, NodeVariant, ROOT_PATH};

const EXCERPT_RADIUS: usize = 40;

/// Engine calls that can be made to fail on purpose.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateNode,
    PutNode,
    SetContent,
    CheckIn,
    CheckOut,
    PurgeVersions,
    Flush,
}

impl FailPoint {
    fn as_str(&self) -> &'static str {
        match self {
            FailPoint::CreateNode => "create_node",
            FailPoint::PutNode => "put_node",
            FailPoint::SetContent => "set_content",
            FailPoint::CheckIn => "check_in",
            FailPoint::CheckOut => "check_out",
            FailPoint::PurgeVersions => "purge_versions",
            FailPoint::Flush => "flush",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredVersion {
    record: VersionRecord,
    content: Vec<u8>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct StoredHistory {
    versions: Vec<StoredVersion>,
    current: Option<String>,
    checked_out: bool,
}

#[derive(Default, Serialize, Deserialize)]
struct EngineState {
    nodes: HashMap<Uuid, Node>,
    content: HashMap<Uuid, Vec<u8>>,
    history: HashMap<Uuid, StoredHistory>,
    unindexed: HashSet<Uuid>,
}

pub struct MemoryEngine {
    state: RwLock<EngineState>,
    sessions: Mutex<HashMap<Uuid, String>>,
    failpoints: Mutex<HashMap<FailPoint, usize>>,
    file: Option<PathBuf>,
    dirty: AtomicBool,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// Engine without a backing file.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(EngineState::default()),
            sessions: Mutex::new(HashMap::new()),
            failpoints: Mutex::new(HashMap::new()),
            file: None,
            dirty: AtomicBool::new(false),
        }
    }

    /// Engine persisted to `file`, loading its previous contents if present.
    pub fn open(file: impl Into<PathBuf>) -> EngineResult<Self> {
        let file = file.into();
        let state = if file.exists() {
            let data = std::fs::read_to_string(&file)?;
            serde_json::from_str(&data)?
        } else {
            if let Some(dir) = file.parent() {
                std::fs::create_dir_all(dir)?;
            }
            EngineState::default()
        };
        Ok(Self {
            state: RwLock::new(state),
            sessions: Mutex::new(HashMap::new()),
            failpoints: Mutex::new(HashMap::new()),
            file: Some(file),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn data_file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Whether there are writes not yet flushed.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn node_count(&self) -> usize {
        self.state.read().nodes.len()
    }

    /// Let `point` succeed `skip` more times, then fail once.
    pub fn fail_after(&self, point: FailPoint, skip: usize) {
        self.failpoints.lock().insert(point, skip);
    }

    pub fn fail_next(&self, point: FailPoint) {
        self.fail_after(point, 0);
    }

    fn trip(&self, point: FailPoint, id: NodeId) -> EngineResult<()> {
        let mut failpoints = self.failpoints.lock();
        let Some(remaining) = failpoints.get_mut(&point) else {
            return Ok(());
        };
        if *remaining > 0 {
            *remaining -= 1;
            return Ok(());
        }
        failpoints.remove(&point);
        if point == FailPoint::PurgeVersions {
            return Err(EngineError::Referenced(id));
        }
        Err(EngineError::Rejected {
            operation: point.as_str(),
            reason: "injected failure".to_string(),
        })
    }

    fn check(&self, session: &EngineSession) -> EngineResult<()> {
        if self.sessions.lock().contains_key(&session.id) {
            Ok(())
        } else {
            Err(EngineError::SessionClosed(session.id))
        }
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Stored nodes never carry eagerly loaded children.
    fn detached(node: &Node) -> Node {
        let mut node = node.clone();
        if let NodeVariant::Directory(dir) = &mut node.variant {
            dir.children = None;
        }
        node
    }

    fn version_name(index: usize) -> String {
        format!("1.{index}")
    }

    fn in_scope(path: &str, scope: &str) -> bool {
        if scope == ROOT_PATH || scope.is_empty() {
            return true;
        }
        let scope = scope.trim_end_matches('/');
        path == scope || path.starts_with(&format!("{scope}/"))
    }

    fn excerpt(text: &str, needle: &str) -> Option<String> {
        let lower = text.to_lowercase();
        let at = lower.find(needle)?;
        if lower.len() != text.len() {
            // case folding changed byte offsets; fall back to the head of the text
            return Some(text.chars().take(EXCERPT_RADIUS * 2).collect());
        }
        let mut start = at.saturating_sub(EXCERPT_RADIUS);
        while !text.is_char_boundary(start) {
            start -= 1;
        }
        let mut end = (at + needle.len() + EXCERPT_RADIUS).min(text.len());
        while !text.is_char_boundary(end) {
            end += 1;
        }
        Some(text[start..end].to_string())
    }
}

impl ContentEngine for MemoryEngine {
    fn open_session(&self, user: &str) -> EngineResult<EngineSession> {
        let id = Uuid::new_v4();
        self.sessions.lock().insert(id, user.to_string());
        Ok(EngineSession {
            id,
            user: user.to_string(),
        })
    }

    fn close_session(&self, session: &EngineSession) -> EngineResult<()> {
        match self.sessions.lock().remove(&session.id) {
            Some(_) => Ok(()),
            None => Err(EngineError::SessionClosed(session.id)),
        }
    }

    fn root_id(&self, session: &EngineSession) -> EngineResult<Option<NodeId>> {
        self.check(session)?;
        Ok(self
            .state
            .read()
            .nodes
            .values()
            .find(|n| n.base.parent.is_none())
            .map(|n| n.base.id))
    }

    fn create_node(&self, session: &EngineSession, node: &Node) -> EngineResult<()> {
        self.check(session)?;
        self.trip(FailPoint::CreateNode, node.id())?;
        let mut state = self.state.write();
        if state.nodes.contains_key(&node.id()) {
            return Err(EngineError::DuplicateNode(node.id()));
        }
        if let Some(parent) = node.parent() {
            if !state.nodes.contains_key(&parent) {
                return Err(EngineError::MissingNode(parent));
            }
        }
        state.nodes.insert(node.id(), Self::detached(node));
        drop(state);
        self.mark_dirty();
        Ok(())
    }

    fn get_node(&self, session: &EngineSession, id: NodeId) -> EngineResult<Option<Node>> {
        self.check(session)?;
        Ok(self.state.read().nodes.get(&id).cloned())
    }

    fn put_node(&self, session: &EngineSession, node: &Node) -> EngineResult<()> {
        self.check(session)?;
        self.trip(FailPoint::PutNode, node.id())?;
        let mut state = self.state.write();
        let slot = state
            .nodes
            .get_mut(&node.id())
            .ok_or(EngineError::MissingNode(node.id()))?;
        *slot = Self::detached(node);
        drop(state);
        self.mark_dirty();
        Ok(())
    }

    fn remove_node(&self, session: &EngineSession, id: NodeId) -> EngineResult<()> {
        self.check(session)?;
        let mut state = self.state.write();
        if state.nodes.remove(&id).is_none() {
            return Err(EngineError::MissingNode(id));
        }
        state.content.remove(&id);
        state.history.remove(&id);
        state.unindexed.remove(&id);
        drop(state);
        self.mark_dirty();
        Ok(())
    }

    fn children(&self, session: &EngineSession, parent: NodeId) -> EngineResult<Vec<Node>> {
        self.check(session)?;
        let state = self.state.read();
        if !state.nodes.contains_key(&parent) {
            return Err(EngineError::MissingNode(parent));
        }
        let mut out: Vec<Node> = state
            .nodes
            .values()
            .filter(|n| n.base.parent == Some(parent))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.base
                .position
                .cmp(&b.base.position)
                .then_with(|| a.base.name.cmp(&b.base.name))
        });
        Ok(out)
    }

    fn content(&self, session: &EngineSession, id: NodeId) -> EngineResult<Vec<u8>> {
        self.check(session)?;
        let state = self.state.read();
        if !state.nodes.contains_key(&id) {
            return Err(EngineError::MissingNode(id));
        }
        Ok(state.content.get(&id).cloned().unwrap_or_default())
    }

    fn set_content(&self, session: &EngineSession, id: NodeId, bytes: &[u8]) -> EngineResult<()> {
        self.check(session)?;
        self.trip(FailPoint::SetContent, id)?;
        let mut state = self.state.write();
        if !state.nodes.contains_key(&id) {
            return Err(EngineError::MissingNode(id));
        }
        if let Some(history) = state.history.get(&id) {
            if !history.checked_out {
                return Err(EngineError::NotCheckedOut { id });
            }
        }
        state.content.insert(id, bytes.to_vec());
        drop(state);
        self.mark_dirty();
        Ok(())
    }

    fn check_in(
        &self,
        session: &EngineSession,
        id: NodeId,
        comment: Option<&str>,
    ) -> EngineResult<VersionRecord> {
        self.check(session)?;
        self.trip(FailPoint::CheckIn, id)?;
        let mut state = self.state.write();
        if !state.nodes.contains_key(&id) {
            return Err(EngineError::MissingNode(id));
        }
        let content = state.content.get(&id).cloned().unwrap_or_default();
        let history = state.history.entry(id).or_insert_with(|| StoredHistory {
            checked_out: true,
            ..Default::default()
        });
        if !history.checked_out {
            return Err(EngineError::NotCheckedOut { id });
        }
        let record = VersionRecord {
            name: Self::version_name(history.versions.len()),
            author: session.user.clone(),
            created: Utc::now(),
            size: content.len() as u64,
            checksum: crc32fast::hash(&content),
            comment: comment.map(|c| c.to_string()),
        };
        history.versions.push(StoredVersion {
            record: record.clone(),
            content,
        });
        history.current = Some(record.name.clone());
        history.checked_out = false;
        drop(state);
        self.mark_dirty();
        Ok(record)
    }

    fn check_out(&self, session: &EngineSession, id: NodeId) -> EngineResult<()> {
        self.check(session)?;
        self.trip(FailPoint::CheckOut, id)?;
        let mut state = self.state.write();
        let history = state.history.get_mut(&id).ok_or(EngineError::Rejected {
            operation: "check_out",
            reason: format!("node {id} has no version history"),
        })?;
        history.checked_out = true;
        drop(state);
        self.mark_dirty();
        Ok(())
    }

    fn version_history(
        &self,
        session: &EngineSession,
        id: NodeId,
    ) -> EngineResult<VersionHistory> {
        self.check(session)?;
        let state = self.state.read();
        if !state.nodes.contains_key(&id) {
            return Err(EngineError::MissingNode(id));
        }
        Ok(match state.history.get(&id) {
            Some(h) => VersionHistory {
                versions: h.versions.iter().map(|v| v.record.clone()).collect(),
                current: h.current.clone(),
                checked_out: h.checked_out,
            },
            None => VersionHistory::default(),
        })
    }

    fn version_content(
        &self,
        session: &EngineSession,
        id: NodeId,
        version: &str,
    ) -> EngineResult<Vec<u8>> {
        self.check(session)?;
        let state = self.state.read();
        state
            .history
            .get(&id)
            .and_then(|h| h.versions.iter().find(|v| v.record.name == version))
            .map(|v| v.content.clone())
            .ok_or_else(|| EngineError::MissingVersion {
                id,
                version: version.to_string(),
            })
    }

    fn purge_versions(&self, session: &EngineSession, id: NodeId) -> EngineResult<()> {
        self.check(session)?;
        self.trip(FailPoint::PurgeVersions, id)?;
        self.state.write().history.remove(&id);
        self.mark_dirty();
        Ok(())
    }

    fn deindex(&self, session: &EngineSession, id: NodeId) -> EngineResult<()> {
        self.check(session)?;
        self.state.write().unindexed.insert(id);
        Ok(())
    }

    fn reindex(&self, session: &EngineSession, id: NodeId) -> EngineResult<()> {
        self.check(session)?;
        self.state.write().unindexed.remove(&id);
        Ok(())
    }

    fn query(
        &self,
        session: &EngineSession,
        scope: &str,
        filter: &QueryFilter,
    ) -> EngineResult<Vec<QueryRow>> {
        self.check(session)?;
        let needle = filter.text.as_ref().map(|t| t.to_lowercase());
        let state = self.state.read();
        let mut rows = Vec::new();
        for node in state.nodes.values() {
            if state.unindexed.contains(&node.id()) {
                continue;
            }
            if !node.is_active() && !filter.include_inactive {
                continue;
            }
            if !Self::in_scope(node.path(), scope) {
                continue;
            }
            if filter.kind.map_or(false, |k| k != node.kind()) {
                continue;
            }
            if filter.type_code.map_or(false, |t| t != node.base.type_code) {
                continue;
            }
            let Some(needle) = needle.as_deref() else {
                rows.push(QueryRow {
                    id: node.id(),
                    score: 1.0,
                    excerpt: node.name().to_string(),
                });
                continue;
            };

            let mut score = 0.0f32;
            let mut excerpt = None;
            if node.name().to_lowercase().contains(needle) {
                score += 2.0;
                excerpt = Some(node.name().to_string());
            }
            if let Some(doc) = node.as_document() {
                if doc.meta.title.to_lowercase().contains(needle) {
                    score += 1.5;
                    excerpt.get_or_insert_with(|| doc.meta.title.clone());
                }
                if doc.meta.keywords.iter().any(|k| k.to_lowercase() == needle) {
                    score += 1.5;
                }
            }
            if let Some(bytes) = state.content.get(&node.id()) {
                let text = String::from_utf8_lossy(bytes);
                let hits = text.to_lowercase().matches(needle).count();
                if hits > 0 {
                    score += hits.min(10) as f32 * 0.5;
                    if let Some(snippet) = Self::excerpt(&text, needle) {
                        excerpt = Some(snippet);
                    }
                }
            }
            if score > 0.0 {
                rows.push(QueryRow {
                    id: node.id(),
                    score,
                    excerpt: excerpt.unwrap_or_default(),
                });
            }
        }
        rows.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    fn flush(&self, session: &EngineSession) -> EngineResult<()> {
        self.check(session)?;
        self.trip(FailPoint::Flush, Uuid::nil())?;
        let Some(file) = &self.file else {
            self.dirty.store(false, Ordering::SeqCst);
            return Ok(());
        };
        let data = {
            let state = self.state.read();
            serde_json::to_string(&*state)?
        };
        let tmp = file.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, file)?;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DirectoryData, DocumentData, Importance, NodeBase, TypeCode};
    use std::collections::BTreeSet;

    fn node(parent: Option<NodeId>, name: &str, path: &str, document: bool) -> Node {
        Node {
            base: NodeBase {
                id: Uuid::new_v4(),
                name: name.to_string(),
                slot: path.rsplit('/').next().unwrap_or_default().to_string(),
                path: path.to_string(),
                parent,
                creator: "user1".to_string(),
                created: Utc::now(),
                importance: Importance::Medium,
                type_code: if document { TypeCode::from_name(name) } else { TypeCode::Directory },
                position: 0,
                size: 0,
                restrictions: BTreeSet::from(["user1".to_string()]),
                active: true,
            },
            variant: if document {
                NodeVariant::Document(DocumentData::default())
            } else {
                NodeVariant::Directory(DirectoryData::default())
            },
        }
    }

    #[test]
    fn create_and_update_node() {
        let engine = MemoryEngine::new();
        let s = engine.open_session("user1").unwrap();
        let root = node(None, "root", "/", false);
        engine.create_node(&s, &root).unwrap();
        let mut doc = node(Some(root.id()), "test.txt", "/f0", true);
        engine.create_node(&s, &doc).unwrap();
        engine.set_content(&s, doc.id(), b"hello").unwrap();
        assert_eq!(engine.content(&s, doc.id()).unwrap(), b"hello");

        doc.base.name = "renamed.txt".to_string();
        engine.put_node(&s, &doc).unwrap();
        assert_eq!(engine.get_node(&s, doc.id()).unwrap().unwrap().name(), "renamed.txt");
        assert_eq!(engine.root_id(&s).unwrap(), Some(root.id()));

        engine.remove_node(&s, doc.id()).unwrap();
        assert!(engine.get_node(&s, doc.id()).unwrap().is_none());
        assert!(engine.content(&s, doc.id()).is_err());
    }

    #[test]
    fn create_requires_existing_parent() {
        let engine = MemoryEngine::new();
        let s = engine.open_session("user1").unwrap();
        let orphan = node(Some(Uuid::new_v4()), "orphan", "/0", false);
        assert!(matches!(
            engine.create_node(&s, &orphan),
            Err(EngineError::MissingNode(_))
        ));
    }

    #[test]
    fn closed_session_is_rejected() {
        let engine = MemoryEngine::new();
        let s = engine.open_session("user1").unwrap();
        assert_eq!(engine.open_sessions(), 1);
        engine.close_session(&s).unwrap();
        assert_eq!(engine.open_sessions(), 0);
        assert!(matches!(
            engine.root_id(&s),
            Err(EngineError::SessionClosed(_))
        ));
        assert!(engine.close_session(&s).is_err());
    }

    #[test]
    fn children_are_ordered_by_position() {
        let engine = MemoryEngine::new();
        let s = engine.open_session("user1").unwrap();
        let root = node(None, "root", "/", false);
        engine.create_node(&s, &root).unwrap();
        let mut b = node(Some(root.id()), "b", "/1", false);
        b.base.position = 1;
        let a = node(Some(root.id()), "a", "/0", false);
        engine.create_node(&s, &b).unwrap();
        engine.create_node(&s, &a).unwrap();
        let names: Vec<_> = engine
            .children(&s, root.id())
            .unwrap()
            .into_iter()
            .map(|n| n.base.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn check_in_freezes_content_until_check_out() {
        let engine = MemoryEngine::new();
        let s = engine.open_session("user1").unwrap();
        let root = node(None, "root", "/", false);
        engine.create_node(&s, &root).unwrap();
        let doc = node(Some(root.id()), "a.txt", "/f0", true);
        engine.create_node(&s, &doc).unwrap();
        engine.set_content(&s, doc.id(), b"one").unwrap();

        let v1 = engine.check_in(&s, doc.id(), Some("baseline")).unwrap();
        assert_eq!(v1.name, "1.0");
        assert_eq!(v1.checksum, crc32fast::hash(b"one"));
        assert!(matches!(
            engine.set_content(&s, doc.id(), b"two"),
            Err(EngineError::NotCheckedOut { .. })
        ));

        engine.check_out(&s, doc.id()).unwrap();
        engine.set_content(&s, doc.id(), b"two").unwrap();
        let v2 = engine.check_in(&s, doc.id(), None).unwrap();
        assert_eq!(v2.name, "1.1");

        let history = engine.version_history(&s, doc.id()).unwrap();
        assert_eq!(history.versions.len(), 2);
        assert_eq!(history.current.as_deref(), Some("1.1"));
        assert!(!history.checked_out);
        assert_eq!(engine.version_content(&s, doc.id(), "1.0").unwrap(), b"one");

        engine.purge_versions(&s, doc.id()).unwrap();
        assert!(engine.version_history(&s, doc.id()).unwrap().is_empty());
    }

    #[test]
    fn query_respects_scope_and_index() {
        let engine = MemoryEngine::new();
        let s = engine.open_session("user1").unwrap();
        let root = node(None, "root", "/", false);
        engine.create_node(&s, &root).unwrap();
        let dir = node(Some(root.id()), "projects", "/0", false);
        engine.create_node(&s, &dir).unwrap();
        let inside = node(Some(dir.id()), "plan.txt", "/0/f0", true);
        let outside = node(Some(root.id()), "other.txt", "/f0", true);
        engine.create_node(&s, &inside).unwrap();
        engine.create_node(&s, &outside).unwrap();
        engine
            .set_content(&s, inside.id(), b"the quarterly budget plan")
            .unwrap();
        engine.set_content(&s, outside.id(), b"budget too").unwrap();

        let rows = engine.query(&s, "/0", &QueryFilter::text("budget")).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, inside.id());
        assert!(rows[0].excerpt.contains("budget"));

        let rows = engine.query(&s, "/", &QueryFilter::text("budget")).unwrap();
        assert_eq!(rows.len(), 2);

        engine.deindex(&s, outside.id()).unwrap();
        let rows = engine.query(&s, "/", &QueryFilter::text("budget")).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn injected_failure_fires_once() {
        let engine = MemoryEngine::new();
        let s = engine.open_session("user1").unwrap();
        let root = node(None, "root", "/", false);
        engine.fail_after(FailPoint::CreateNode, 1);
        engine.create_node(&s, &root).unwrap();
        let child = node(Some(root.id()), "x", "/0", false);
        assert!(engine.create_node(&s, &child).is_err());
        engine.create_node(&s, &child).unwrap();
    }

    #[test]
    fn store_persists_to_disk() {
        let tempdir = tempfile::tempdir().unwrap();
        let file = tempdir.path().join("vault.json");
        let root = node(None, "root", "/", false);
        {
            let engine = MemoryEngine::open(&file).unwrap();
            let s = engine.open_session("user1").unwrap();
            engine.create_node(&s, &root).unwrap();
            engine.set_content(&s, root.id(), b"kept").unwrap();
            engine.check_in(&s, root.id(), None).unwrap();
            assert!(engine.is_dirty());
            engine.flush(&s).unwrap();
            assert!(!engine.is_dirty());
        }

        let engine = MemoryEngine::open(&file).unwrap();
        let s = engine.open_session("user1").unwrap();
        let loaded = engine.get_node(&s, root.id()).unwrap().unwrap();
        assert_eq!(loaded.name(), "root");
        assert_eq!(engine.content(&s, root.id()).unwrap(), b"kept");
        assert_eq!(engine.version_history(&s, root.id()).unwrap().versions.len(), 1);
    }
}
