//! Boundary to the underlying content engine.
//!
//! The engine owns durability, version history storage and querying. The
//! repository only drives it through [`ContentEngine`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineResult;
use crate::model::{Node, NodeId, NodeKind, TypeCode};

mod memory;

pub use memory::{FailPoint, MemoryEngine};

/// Handle to an open engine session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct EngineSession {
    pub id: Uuid,
    pub user: String,
}

/// One recorded snapshot of a node's content.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VersionRecord {
    pub name: String,
    pub author: String,
    pub created: DateTime<Utc>,
    pub size: u64,
    pub checksum: u32,
    pub comment: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct VersionHistory {
    pub versions: Vec<VersionRecord>,
    /// Version the working copy was last checked in as.
    pub current: Option<String>,
    pub checked_out: bool,
}

impl VersionHistory {
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct QueryFilter {
    /// Case-insensitive text matched against name, metadata and content.
    pub text: Option<String>,
    pub kind: Option<NodeKind>,
    pub type_code: Option<TypeCode>,
    pub include_inactive: bool,
    pub limit: Option<usize>,
}

impl QueryFilter {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueryRow {
    pub id: NodeId,
    pub score: f32,
    pub excerpt: String,
}

/// Tree-structured content engine the repository is built on.
pub trait ContentEngine: Send + Sync {
    fn open_session(&self, user: &str) -> EngineResult<EngineSession>;

    fn close_session(&self, session: &EngineSession) -> EngineResult<()>;

    /// Id of the node without a parent, if the tree has been initialized.
    fn root_id(&self, session: &EngineSession) -> EngineResult<Option<NodeId>>;

    fn create_node(&self, session: &EngineSession, node: &Node) -> EngineResult<()>;

    fn get_node(&self, session: &EngineSession, id: NodeId) -> EngineResult<Option<Node>>;

    fn put_node(&self, session: &EngineSession, node: &Node) -> EngineResult<()>;

    /// Remove a node together with its content. Children are not touched.
    fn remove_node(&self, session: &EngineSession, id: NodeId) -> EngineResult<()>;

    /// Children of `parent`, active or not, ordered by position.
    fn children(&self, session: &EngineSession, parent: NodeId) -> EngineResult<Vec<Node>>;

    fn content(&self, session: &EngineSession, id: NodeId) -> EngineResult<Vec<u8>>;

    fn set_content(&self, session: &EngineSession, id: NodeId, bytes: &[u8]) -> EngineResult<()>;

    /// Record the current content as a new immutable version.
    fn check_in(
        &self,
        session: &EngineSession,
        id: NodeId,
        comment: Option<&str>,
    ) -> EngineResult<VersionRecord>;

    /// Return a checked-in node to a writable state.
    fn check_out(&self, session: &EngineSession, id: NodeId) -> EngineResult<()>;

    fn version_history(&self, session: &EngineSession, id: NodeId)
        -> EngineResult<VersionHistory>;

    fn version_content(
        &self,
        session: &EngineSession,
        id: NodeId,
        version: &str,
    ) -> EngineResult<Vec<u8>>;

    fn purge_versions(&self, session: &EngineSession, id: NodeId) -> EngineResult<()>;

    /// Exclude a node from query results.
    fn deindex(&self, session: &EngineSession, id: NodeId) -> EngineResult<()>;

    fn reindex(&self, session: &EngineSession, id: NodeId) -> EngineResult<()>;

    /// Structural query scoped to the subtree rooted at logical path `scope`.
    fn query(
        &self,
        session: &EngineSession,
        scope: &str,
        filter: &QueryFilter,
    ) -> EngineResult<Vec<QueryRow>>;

    /// Make everything written so far durable.
    fn flush(&self, session: &EngineSession) -> EngineResult<()>;
}
