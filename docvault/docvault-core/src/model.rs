//! Node model shared by the engine boundary and the repository.
//!
//! A [`Node`] is a common [`NodeBase`] plus a kind-specific [`NodeVariant`].
//! Edits to a document's notes, relations and categories travel separately
//! as a [`DocumentChanges`] diff.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::error::{Result, VaultError};

pub type NodeId = Uuid;

pub const ROOT_PATH: &str = "/";

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum Importance {
    Low,
    #[default]
    Medium,
    High,
}

/// Content class of a node.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum TypeCode {
    Directory,
    Html,
    Text,
    Pdf,
    Image,
    Binary,
}

impl TypeCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeCode::Directory => "directory",
            TypeCode::Html => "html",
            TypeCode::Text => "text",
            TypeCode::Pdf => "pdf",
            TypeCode::Image => "image",
            TypeCode::Binary => "binary",
        }
    }

    /// Guess the type of a file from its extension.
    pub fn from_name(name: &str) -> Self {
        let ext = match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
            _ => return TypeCode::Binary,
        };
        match ext.as_str() {
            "htm" | "html" | "xhtml" => TypeCode::Html,
            "txt" | "md" | "csv" | "log" | "xml" | "json" => TypeCode::Text,
            "pdf" => TypeCode::Pdf,
            "png" | "jpg" | "jpeg" | "gif" | "bmp" | "tif" | "tiff" | "svg" => TypeCode::Image,
            _ => TypeCode::Binary,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Directory,
    Document,
    Resource,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Directory => "directory",
            NodeKind::Document => "document",
            NodeKind::Resource => "resource",
        }
    }
}

/// Fields every node carries.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NodeBase {
    pub id: NodeId,
    pub name: String,
    /// This node's own segment of the logical path.
    pub slot: String,
    pub path: String,
    pub parent: Option<NodeId>,
    pub creator: String,
    pub created: DateTime<Utc>,
    pub importance: Importance,
    pub type_code: TypeCode,
    pub position: u32,
    pub size: u64,
    pub restrictions: BTreeSet<String>,
    pub active: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DocumentMeta {
    pub title: String,
    pub author: Option<String>,
    pub keywords: BTreeSet<String>,
    pub source_url: Option<String>,
    pub language: Option<String>,
    /// Language used when indexing the content.
    pub index_language: Option<String>,
    /// Date the content was first recorded, as opposed to node creation.
    pub recorded: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Note {
    pub id: Uuid,
    pub text: String,
    pub author: String,
    pub created: DateTime<Utc>,
}

impl Note {
    pub fn new(text: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            author: author.into(),
            created: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Relation {
    pub target: NodeId,
    pub kind: String,
    pub bidirectional: bool,
}

impl Relation {
    fn same_edge(&self, other: &Relation) -> bool {
        self.target == other.target && self.kind == other.kind
    }
}

/// Advisory checkout marker on a document.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LockInfo {
    pub owner: String,
    pub token: Uuid,
    pub created: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DocumentData {
    pub meta: DocumentMeta,
    pub resources: BTreeSet<NodeId>,
    pub relations: Vec<Relation>,
    pub notes: Vec<Note>,
    pub categories: BTreeSet<Uuid>,
    pub properties: BTreeMap<String, String>,
    pub lock: Option<LockInfo>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DirectoryData {
    /// Only populated when the directory was loaded eagerly.
    #[serde(skip)]
    pub children: Option<Vec<Node>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum NodeVariant {
    Directory(DirectoryData),
    Document(DocumentData),
    Resource,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub base: NodeBase,
    pub variant: NodeVariant,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.base.id
    }

    pub fn name(&self) -> &str {
        &self.base.name
    }

    pub fn path(&self) -> &str {
        &self.base.path
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.base.parent
    }

    pub fn is_active(&self) -> bool {
        self.base.active
    }

    pub fn kind(&self) -> NodeKind {
        match self.variant {
            NodeVariant::Directory(_) => NodeKind::Directory,
            NodeVariant::Document(_) => NodeKind::Document,
            NodeVariant::Resource => NodeKind::Resource,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind() == NodeKind::Directory
    }

    pub fn as_document(&self) -> Option<&DocumentData> {
        match &self.variant {
            NodeVariant::Document(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_document_mut(&mut self) -> Option<&mut DocumentData> {
        match &mut self.variant {
            NodeVariant::Document(d) => Some(d),
            _ => None,
        }
    }

    pub fn children(&self) -> Option<&[Node]> {
        match &self.variant {
            NodeVariant::Directory(d) => d.children.as_deref(),
            _ => None,
        }
    }

    /// Owner of the advisory lock, if this is a locked document.
    pub fn lock_owner(&self) -> Option<&str> {
        self.as_document()
            .and_then(|d| d.lock.as_ref())
            .map(|l| l.owner.as_str())
    }
}

/// Caller-supplied attributes for a new node.
#[derive(Clone, Debug, Default)]
pub struct NodeAttrs {
    pub importance: Importance,
    pub content: Vec<u8>,
    pub meta: DocumentMeta,
    pub properties: BTreeMap<String, String>,
    pub categories: BTreeSet<Uuid>,
}

/// Scalar edits applied by an update call.
#[derive(Clone, Debug, Default)]
pub struct DocumentUpdate {
    pub meta: Option<DocumentMeta>,
    pub importance: Option<Importance>,
    pub properties: Option<BTreeMap<String, String>>,
    pub content: Option<Vec<u8>>,
}

impl DocumentUpdate {
    pub fn content(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            content: Some(bytes.into()),
            ..Default::default()
        }
    }
}

/// Additions, edits and removals of one kind of collection element.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeSet<T> {
    pub inserted: Vec<T>,
    pub updated: Vec<T>,
    pub deleted: Vec<T>,
}

impl<T> Default for ChangeSet<T> {
    fn default() -> Self {
        Self {
            inserted: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
        }
    }
}

impl<T> ChangeSet<T> {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn clear(&mut self) {
        self.inserted.clear();
        self.updated.clear();
        self.deleted.clear();
    }

    pub fn insert(&mut self, item: T) -> &mut Self {
        self.inserted.push(item);
        self
    }

    pub fn update(&mut self, item: T) -> &mut Self {
        self.updated.push(item);
        self
    }

    pub fn delete(&mut self, item: T) -> &mut Self {
        self.deleted.push(item);
        self
    }
}

/// Pending collection edits for a single document update.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DocumentChanges {
    pub notes: ChangeSet<Note>,
    pub relations: ChangeSet<Relation>,
    pub categories: ChangeSet<Uuid>,
}

impl DocumentChanges {
    pub fn is_empty(&self) -> bool {
        self.notes.is_empty() && self.relations.is_empty() && self.categories.is_empty()
    }

    pub fn clear(&mut self) {
        self.notes.clear();
        self.relations.clear();
        self.categories.clear();
    }

    /// Apply the diff to a document. Fails without modifying `doc` if an
    /// updated or deleted element does not exist.
    pub fn apply_to(&self, doc: &mut DocumentData) -> Result<()> {
        for note in self.notes.updated.iter().chain(self.notes.deleted.iter()) {
            if !doc.notes.iter().any(|n| n.id == note.id) {
                return Err(VaultError::not_found("note", note.id));
            }
        }
        for rel in self.relations.updated.iter().chain(self.relations.deleted.iter()) {
            if !doc.relations.iter().any(|r| r.same_edge(rel)) {
                return Err(VaultError::not_found("relation", rel.target));
            }
        }

        for note in &self.notes.inserted {
            doc.notes.push(note.clone());
        }
        for note in &self.notes.updated {
            if let Some(existing) = doc.notes.iter_mut().find(|n| n.id == note.id) {
                existing.text = note.text.clone();
            }
        }
        doc.notes
            .retain(|n| !self.notes.deleted.iter().any(|d| d.id == n.id));

        for rel in &self.relations.inserted {
            if !doc.relations.iter().any(|r| r.same_edge(rel)) {
                doc.relations.push(rel.clone());
            }
        }
        for rel in &self.relations.updated {
            if let Some(existing) = doc.relations.iter_mut().find(|r| r.same_edge(rel)) {
                existing.bidirectional = rel.bidirectional;
            }
        }
        doc.relations
            .retain(|r| !self.relations.deleted.iter().any(|d| d.same_edge(r)));

        for cat in self.categories.inserted.iter().chain(self.categories.updated.iter()) {
            doc.categories.insert(*cat);
        }
        for cat in &self.categories.deleted {
            doc.categories.remove(cat);
        }
        Ok(())
    }
}

/// Join a parent's logical path and a child slot.
pub fn join_path(parent: &str, slot: &str) -> String {
    if parent == ROOT_PATH {
        format!("/{slot}")
    } else {
        format!("{parent}/{slot}")
    }
}

/// Reject names that cannot be displayed as a single path element.
pub fn validate_name(name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(VaultError::invalid("name is empty"));
    }
    if trimmed == "." || trimmed == ".." || name.contains('/') {
        return Err(VaultError::invalid(format!("illegal name {name:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_code_from_extension() {
        assert_eq!(TypeCode::from_name("report.PDF"), TypeCode::Pdf);
        assert_eq!(TypeCode::from_name("index.html"), TypeCode::Html);
        assert_eq!(TypeCode::from_name("photo.jpeg"), TypeCode::Image);
        assert_eq!(TypeCode::from_name(".bashrc"), TypeCode::Binary);
        assert_eq!(TypeCode::from_name("README"), TypeCode::Binary);
    }

    #[test]
    fn join_path_handles_root() {
        assert_eq!(join_path("/", "0"), "/0");
        assert_eq!(join_path("/0/3", "f1"), "/0/3/f1");
    }

    #[test]
    fn validate_name_rejects_separators() {
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("  ").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("notes.txt").is_ok());
    }

    #[test]
    fn changes_apply_and_clear() {
        let mut doc = DocumentData::default();
        let target = Uuid::new_v4();
        let note = Note::new("first", "alice");
        let mut changes = DocumentChanges::default();
        changes.notes.insert(note.clone());
        changes.relations.insert(Relation {
            target,
            kind: "see-also".into(),
            bidirectional: false,
        });
        changes.categories.insert(Uuid::nil());
        changes.apply_to(&mut doc).unwrap();
        assert_eq!(doc.notes.len(), 1);
        assert_eq!(doc.relations.len(), 1);
        assert!(doc.categories.contains(&Uuid::nil()));

        changes.clear();
        assert!(changes.is_empty());

        let mut edited = note.clone();
        edited.text = "second".into();
        changes.notes.update(edited);
        changes.categories.delete(Uuid::nil());
        changes.apply_to(&mut doc).unwrap();
        assert_eq!(doc.notes[0].text, "second");
        assert!(doc.categories.is_empty());
    }

    #[test]
    fn changes_reject_unknown_note_without_side_effects() {
        let mut doc = DocumentData::default();
        let mut changes = DocumentChanges::default();
        changes.notes.insert(Note::new("kept?", "bob"));
        changes.notes.delete(Note::new("ghost", "bob"));
        assert!(matches!(
            changes.apply_to(&mut doc),
            Err(VaultError::NotFound { kind: "note", .. })
        ));
        assert!(doc.notes.is_empty());
    }

    #[test]
    fn duplicate_relation_insert_is_ignored() {
        let mut doc = DocumentData::default();
        let rel = Relation {
            target: Uuid::new_v4(),
            kind: "parent".into(),
            bidirectional: true,
        };
        let mut changes = DocumentChanges::default();
        changes.relations.insert(rel.clone()).insert(rel);
        changes.apply_to(&mut doc).unwrap();
        assert_eq!(doc.relations.len(), 1);
    }
}
