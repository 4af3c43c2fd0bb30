//! Short numeric path segments for new nodes.
//!
//! Directories get `"0"`, `"1"`, ... and files get `"f0"`, `"f1"`, ...; in
//! both cases the lowest value not used by an active sibling of the same
//! class, so holes left by deletions are filled before the sequence grows.
//! Callers must hold the parent's token while allocating and consuming.

use std::sync::Arc;

use crate::engine::{ContentEngine, EngineSession};
use crate::error::Result;
use crate::model::{Node, NodeId};

const FILE_PREFIX: char = 'f';

/// Parse a directory slot.
pub fn directory_index(slot: &str) -> Option<u64> {
    if slot.is_empty() || !slot.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    slot.parse().ok()
}

/// Parse a file slot.
pub fn file_index(slot: &str) -> Option<u64> {
    slot.strip_prefix(FILE_PREFIX).and_then(directory_index)
}

/// Lowest non-negative integer absent from `used`.
pub fn lowest_free(used: impl IntoIterator<Item = u64>) -> u64 {
    let mut used: Vec<u64> = used.into_iter().collect();
    used.sort_unstable();
    used.dedup();
    let mut next = 0;
    for n in used {
        if n != next {
            break;
        }
        next += 1;
    }
    next
}

fn used_slots<'a>(
    siblings: &'a [Node],
    parse: fn(&str) -> Option<u64>,
    directories: bool,
) -> impl Iterator<Item = u64> + 'a {
    siblings
        .iter()
        .filter(move |n| n.is_active() && n.is_directory() == directories)
        .filter_map(move |n| parse(&n.base.slot))
}

/// Next directory slot among `siblings`.
pub fn next_directory_slot(siblings: &[Node]) -> String {
    lowest_free(used_slots(siblings, directory_index, true)).to_string()
}

/// Next file slot among `siblings`.
pub fn next_file_slot(siblings: &[Node]) -> String {
    format!(
        "{FILE_PREFIX}{}",
        lowest_free(used_slots(siblings, file_index, false))
    )
}

/// Whether `slot` is free for a node of the given class among `siblings`,
/// ignoring `except`.
pub fn slot_is_free(siblings: &[Node], slot: &str, directory: bool, except: Option<NodeId>) -> bool {
    !siblings.iter().any(|n| {
        n.is_active()
            && n.is_directory() == directory
            && Some(n.id()) != except
            && n.base.slot == slot
    })
}

/// Allocates slots by reading the parent's children from the engine.
pub struct SlotAllocator {
    engine: Arc<dyn ContentEngine>,
}

impl SlotAllocator {
    pub fn new(engine: Arc<dyn ContentEngine>) -> Self {
        Self { engine }
    }

    /// Next free slot under `parent` for a directory or a file.
    pub fn next_slot(&self, session: &EngineSession, parent: NodeId, directory: bool) -> Result<String> {
        let siblings = self.engine.children(session, parent)?;
        Ok(Self::pick(&siblings, directory))
    }

    /// `preferred` if no active sibling other than `except` holds it,
    /// otherwise the next free slot.
    pub fn place(
        &self,
        session: &EngineSession,
        parent: NodeId,
        preferred: &str,
        directory: bool,
        except: Option<NodeId>,
    ) -> Result<String> {
        let siblings = self.engine.children(session, parent)?;
        if slot_is_free(&siblings, preferred, directory, except) {
            Ok(preferred.to_string())
        } else {
            Ok(Self::pick(&siblings, directory))
        }
    }

    fn pick(siblings: &[Node], directory: bool) -> String {
        if directory {
            next_directory_slot(siblings)
        } else {
            next_file_slot(siblings)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use crate::model::{join_path, DirectoryData, DocumentData, NodeBase, NodeVariant, TypeCode};
    use chrono::Utc;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn node(parent: Option<&Node>, slot: &str, directory: bool) -> Node {
        Node {
            base: NodeBase {
                id: Uuid::new_v4(),
                name: format!("n{slot}"),
                slot: slot.to_string(),
                path: parent.map_or("/".to_string(), |p| join_path(p.path(), slot)),
                parent: parent.map(|p| p.id()),
                creator: "tester".to_string(),
                created: Utc::now(),
                importance: Default::default(),
                type_code: if directory { TypeCode::Directory } else { TypeCode::Text },
                position: 0,
                size: 0,
                restrictions: BTreeSet::new(),
                active: true,
            },
            variant: if directory {
                NodeVariant::Directory(DirectoryData::default())
            } else {
                NodeVariant::Document(DocumentData::default())
            },
        }
    }

    #[test]
    fn fills_holes_before_extending() {
        assert_eq!(lowest_free([]), 0);
        assert_eq!(lowest_free([0, 1, 2, 3]), 4);
        assert_eq!(lowest_free([0, 1, 3]), 2);
        assert_eq!(lowest_free([3, 1, 0, 1]), 2);
        assert_eq!(lowest_free([1, 2]), 0);
    }

    #[test]
    fn parses_slot_classes() {
        assert_eq!(directory_index("12"), Some(12));
        assert_eq!(directory_index("f3"), None);
        assert_eq!(directory_index(""), None);
        assert_eq!(directory_index("-1"), None);
        assert_eq!(file_index("f3"), Some(3));
        assert_eq!(file_index("3"), None);
        assert_eq!(file_index("f"), None);
    }

    #[test]
    fn allocator_reads_live_siblings() {
        let engine = Arc::new(MemoryEngine::new());
        let session = engine.open_session("tester").unwrap();
        let root = node(None, "", true);
        engine.create_node(&session, &root).unwrap();
        for (slot, directory) in [("0", true), ("2", true), ("f0", false)] {
            engine.create_node(&session, &node(Some(&root), slot, directory)).unwrap();
        }

        let slots = SlotAllocator::new(engine.clone());
        assert_eq!(slots.next_slot(&session, root.id(), true).unwrap(), "1");
        assert_eq!(slots.next_slot(&session, root.id(), false).unwrap(), "f1");
        assert_eq!(slots.place(&session, root.id(), "5", true, None).unwrap(), "5");
        assert_eq!(slots.place(&session, root.id(), "2", true, None).unwrap(), "1");
        assert_eq!(slots.place(&session, root.id(), "f0", false, None).unwrap(), "f1");
    }
}
