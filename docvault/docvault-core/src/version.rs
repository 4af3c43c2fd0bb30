//! Version snapshots around content changes.
//!
//! A document or resource that has never been snapshotted is checked in
//! as-is before its first change, so its original state becomes the first
//! version. Each change is then checked in and immediately checked out
//! again. If the check-in fails the node is put back the way it was.

use std::sync::Arc;

use crate::engine::{ContentEngine, EngineSession, VersionRecord};
use crate::error::{EngineError, Result, VaultError};
use crate::model::{Node, NodeKind};

const BASELINE_COMMENT: &str = "baseline";

pub struct VersionTrigger {
    engine: Arc<dyn ContentEngine>,
}

impl VersionTrigger {
    pub fn new(engine: Arc<dyn ContentEngine>) -> Self {
        Self { engine }
    }

    pub fn is_versionable(node: &Node) -> bool {
        matches!(node.kind(), NodeKind::Document | NodeKind::Resource)
    }

    /// Make sure `node` has a baseline version and is checked out.
    fn prepare(&self, session: &EngineSession, node: &Node) -> Result<()> {
        let history = self.engine.version_history(session, node.id())?;
        if history.is_empty() {
            let baseline = self
                .engine
                .check_in(session, node.id(), Some(BASELINE_COMMENT))?;
            tracing::debug!(id = %node.id(), version = %baseline.name, "recorded baseline version");
            self.engine.check_out(session, node.id())?;
        } else if !history.checked_out {
            self.engine.check_out(session, node.id())?;
        }
        Ok(())
    }

    /// Replace `before` with `after` (and its content, when given) and record
    /// the result as a new version.
    pub fn apply(
        &self,
        session: &EngineSession,
        before: &Node,
        after: &Node,
        content: Option<&[u8]>,
        comment: Option<&str>,
    ) -> Result<VersionRecord> {
        if !Self::is_versionable(before) {
            return Err(VaultError::invalid(format!(
                "{} {} is not versionable",
                before.kind().as_str(),
                before.id()
            )));
        }
        self.prepare(session, before)?;

        let previous_content = match content {
            Some(_) => Some(self.engine.content(session, before.id())?),
            None => None,
        };

        let written = self.engine.put_node(session, after).and_then(|_| match content {
            Some(bytes) => self.engine.set_content(session, after.id(), bytes),
            None => Ok(()),
        });
        if let Err(e) = written {
            self.rollback(session, before, previous_content.as_deref());
            return Err(e.into());
        }

        let record = match self.engine.check_in(session, after.id(), comment) {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(id = %after.id(), "version check-in failed, rolling back: {}", e);
                self.rollback(session, before, previous_content.as_deref());
                return Err(VaultError::EngineFailure(e));
            }
        };
        self.engine.check_out(session, after.id())?;
        tracing::debug!(id = %after.id(), version = %record.name, "recorded version");
        Ok(record)
    }

    fn rollback(&self, session: &EngineSession, before: &Node, content: Option<&[u8]>) {
        if let Err(e) = self.engine.put_node(session, before) {
            tracing::warn!(id = %before.id(), "failed to restore node: {}", e);
        }
        if let Some(bytes) = content {
            if let Err(e) = self.engine.set_content(session, before.id(), bytes) {
                tracing::warn!(id = %before.id(), "failed to restore content: {}", e);
            }
        }
    }

    /// Recorded versions except the one the working copy was checked out from.
    pub fn versions(&self, session: &EngineSession, node: &Node) -> Result<Vec<VersionRecord>> {
        let history = self.engine.version_history(session, node.id())?;
        let current = history.current;
        Ok(history
            .versions
            .into_iter()
            .filter(|v| Some(&v.name) != current.as_ref())
            .collect())
    }

    pub fn content(&self, session: &EngineSession, node: &Node, version: &str) -> Result<Vec<u8>> {
        self.engine
            .version_content(session, node.id(), version)
            .map_err(|e| match e {
                EngineError::MissingVersion { version, .. } => {
                    VaultError::not_found("version", version)
                }
                other => other.into(),
            })
    }

    /// Bring back the content of `version` as a new version.
    pub fn restore(
        &self,
        session: &EngineSession,
        node: &Node,
        version: &str,
    ) -> Result<(Node, VersionRecord)> {
        let bytes = self.content(session, node, version)?;
        let mut after = node.clone();
        after.base.size = bytes.len() as u64;
        let comment = format!("restored from {version}");
        let record = self.apply(session, node, &after, Some(&bytes), Some(&comment))?;
        Ok((after, record))
    }

    pub fn purge(&self, session: &EngineSession, node: &Node) -> Result<()> {
        self.engine.purge_versions(session, node.id())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{FailPoint, MemoryEngine};
    use crate::model::{DirectoryData, DocumentData, Importance, NodeBase, NodeVariant, TypeCode};
    use chrono::Utc;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn base(name: &str, parent: Option<Uuid>, type_code: TypeCode) -> NodeBase {
        NodeBase {
            id: Uuid::new_v4(),
            name: name.into(),
            slot: "f0".into(),
            path: "/f0".into(),
            parent,
            creator: "alice".into(),
            created: Utc::now(),
            importance: Importance::Medium,
            type_code,
            position: 0,
            size: 0,
            restrictions: BTreeSet::from(["alice".to_string()]),
            active: true,
        }
    }

    fn setup() -> (Arc<MemoryEngine>, VersionTrigger, EngineSession, Node) {
        let engine = Arc::new(MemoryEngine::new());
        let session = engine.open_session("alice").unwrap();
        let root = Node {
            base: base("root", None, TypeCode::Directory),
            variant: NodeVariant::Directory(DirectoryData::default()),
        };
        engine.create_node(&session, &root).unwrap();
        let doc = Node {
            base: base("a.txt", Some(root.id()), TypeCode::Text),
            variant: NodeVariant::Document(DocumentData::default()),
        };
        engine.create_node(&session, &doc).unwrap();
        engine.set_content(&session, doc.id(), b"v0").unwrap();
        let trigger = VersionTrigger::new(engine.clone());
        (engine, trigger, session, doc)
    }

    #[test]
    fn first_change_records_baseline_and_one_version() {
        let (engine, trigger, s, doc) = setup();
        let record = trigger.apply(&s, &doc, &doc, Some(b"v1"), None).unwrap();
        assert_eq!(record.name, "1.1");

        let history = engine.version_history(&s, doc.id()).unwrap();
        assert_eq!(history.versions.len(), 2);
        assert!(history.checked_out);
        assert_eq!(engine.version_content(&s, doc.id(), "1.0").unwrap(), b"v0");
        assert_eq!(engine.content(&s, doc.id()).unwrap(), b"v1");
    }

    #[test]
    fn versions_excludes_the_working_copy() {
        let (_, trigger, s, doc) = setup();
        for n in 1..=3 {
            let bytes = format!("v{n}");
            trigger.apply(&s, &doc, &doc, Some(bytes.as_bytes()), None).unwrap();
            let listed = trigger.versions(&s, &doc).unwrap();
            assert_eq!(listed.len(), n);
            assert!(listed.iter().all(|v| v.name != format!("1.{n}")));
        }
    }

    #[test]
    fn failed_check_in_rolls_back() {
        let (engine, trigger, s, doc) = setup();
        let mut renamed = doc.clone();
        renamed.base.name = "b.txt".into();
        // the baseline check-in succeeds, the change check-in fails
        engine.fail_after(FailPoint::CheckIn, 1);
        let err = trigger
            .apply(&s, &doc, &renamed, Some(b"broken"), None)
            .unwrap_err();
        assert!(matches!(err, VaultError::EngineFailure(_)));
        assert_eq!(engine.get_node(&s, doc.id()).unwrap().unwrap().name(), "a.txt");
        assert_eq!(engine.content(&s, doc.id()).unwrap(), b"v0");
    }

    #[test]
    fn restore_records_a_new_version() {
        let (engine, trigger, s, doc) = setup();
        trigger.apply(&s, &doc, &doc, Some(b"v1"), None).unwrap();
        let (restored, record) = trigger.restore(&s, &doc, "1.0").unwrap();
        assert_eq!(record.name, "1.2");
        assert_eq!(record.comment.as_deref(), Some("restored from 1.0"));
        assert_eq!(restored.base.size, 2);
        assert_eq!(engine.content(&s, doc.id()).unwrap(), b"v0");
        assert!(matches!(
            trigger.content(&s, &doc, "9.9"),
            Err(VaultError::NotFound { kind: "version", .. })
        ));
    }

    #[test]
    fn directories_are_not_versionable() {
        let (engine, trigger, s, _) = setup();
        let root_id = engine.root_id(&s).unwrap().unwrap();
        let root = engine.get_node(&s, root_id).unwrap().unwrap();
        assert!(matches!(
            trigger.apply(&s, &root, &root, None, None),
            Err(VaultError::InvalidArgument(_))
        ));
    }
}
