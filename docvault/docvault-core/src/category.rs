//! Category tree and per-user favorites.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use uuid::Uuid;

use crate::error::{Result, VaultError};
use crate::model::NodeId;

/// Category reported for documents without an explicit one.
pub const UNKNOWN_CATEGORY: Uuid = Uuid::nil();
pub const UNKNOWN_CATEGORY_NAME: &str = "unknown";

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Category {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub created: DateTime<Utc>,
    pub parent: Option<Uuid>,
    pub children: BTreeSet<Uuid>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq, Hash)]
pub struct Favorite {
    pub user: String,
    pub document: NodeId,
    pub category: Uuid,
}

#[derive(Default)]
struct Catalog {
    categories: BTreeMap<Uuid, Category>,
    favorites: Vec<Favorite>,
}

pub struct CategoryStore {
    inner: RwLock<Catalog>,
}

impl Default for CategoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CategoryStore {
    pub fn new() -> Self {
        let mut catalog = Catalog::default();
        catalog.categories.insert(
            UNKNOWN_CATEGORY,
            Category {
                id: UNKNOWN_CATEGORY,
                name: UNKNOWN_CATEGORY_NAME.to_string(),
                description: "documents without a category".to_string(),
                created: Utc::now(),
                parent: None,
                children: BTreeSet::new(),
            },
        );
        Self {
            inner: RwLock::new(catalog),
        }
    }

    pub fn get(&self, id: Uuid) -> Option<Category> {
        self.inner.read().categories.get(&id).cloned()
    }

    pub fn exists(&self, id: Uuid) -> bool {
        self.inner.read().categories.contains_key(&id)
    }

    fn name_taken(catalog: &Catalog, parent: Option<Uuid>, name: &str, except: Option<Uuid>) -> bool {
        catalog
            .categories
            .values()
            .any(|c| c.parent == parent && c.name == name && Some(c.id) != except)
    }

    pub fn create(&self, name: &str, description: &str, parent: Option<Uuid>) -> Result<Category> {
        if name.trim().is_empty() {
            return Err(VaultError::invalid("category name is empty"));
        }
        let mut catalog = self.inner.write();
        if let Some(parent) = parent {
            if parent == UNKNOWN_CATEGORY {
                return Err(VaultError::invalid("the unknown category cannot have children"));
            }
            if !catalog.categories.contains_key(&parent) {
                return Err(VaultError::not_found("category", parent));
            }
        }
        if Self::name_taken(&catalog, parent, name, None) {
            return Err(VaultError::already_exists("category", name));
        }
        let category = Category {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: description.to_string(),
            created: Utc::now(),
            parent,
            children: BTreeSet::new(),
        };
        if let Some(parent) = parent.and_then(|p| catalog.categories.get_mut(&p)) {
            parent.children.insert(category.id);
        }
        catalog.categories.insert(category.id, category.clone());
        Ok(category)
    }

    pub fn rename(&self, id: Uuid, name: &str) -> Result<Category> {
        if id == UNKNOWN_CATEGORY {
            return Err(VaultError::invalid("the unknown category cannot be renamed"));
        }
        if name.trim().is_empty() {
            return Err(VaultError::invalid("category name is empty"));
        }
        let mut catalog = self.inner.write();
        let parent = catalog
            .categories
            .get(&id)
            .ok_or_else(|| VaultError::not_found("category", id))?
            .parent;
        if Self::name_taken(&catalog, parent, name, Some(id)) {
            return Err(VaultError::already_exists("category", name));
        }
        let category = catalog
            .categories
            .get_mut(&id)
            .ok_or_else(|| VaultError::not_found("category", id))?;
        category.name = name.to_string();
        Ok(category.clone())
    }

    /// Delete a leaf category and the favorites filed under it.
    pub fn delete(&self, id: Uuid) -> Result<()> {
        if id == UNKNOWN_CATEGORY {
            return Err(VaultError::invalid("the unknown category cannot be deleted"));
        }
        let mut catalog = self.inner.write();
        let category = catalog
            .categories
            .get(&id)
            .ok_or_else(|| VaultError::not_found("category", id))?;
        if !category.children.is_empty() {
            return Err(VaultError::invalid(format!("category {id} has children")));
        }
        let parent = category.parent;
        catalog.categories.remove(&id);
        if let Some(parent) = parent.and_then(|p| catalog.categories.get_mut(&p)) {
            parent.children.remove(&id);
        }
        catalog.favorites.retain(|f| f.category != id);
        Ok(())
    }

    /// Direct children of `parent`, or the top-level categories.
    pub fn children(&self, parent: Option<Uuid>) -> Result<Vec<Category>> {
        let catalog = self.inner.read();
        if let Some(p) = parent {
            if !catalog.categories.contains_key(&p) {
                return Err(VaultError::not_found("category", p));
            }
        }
        let mut out: Vec<Category> = catalog
            .categories
            .values()
            .filter(|c| c.parent == parent)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Categories to report for a document's category set.
    pub fn effective(categories: &BTreeSet<Uuid>) -> BTreeSet<Uuid> {
        if categories.is_empty() {
            BTreeSet::from([UNKNOWN_CATEGORY])
        } else {
            categories.clone()
        }
    }

    pub fn add_favorite(&self, user: &str, document: NodeId, category: Uuid) -> Result<Favorite> {
        let mut catalog = self.inner.write();
        if !catalog.categories.contains_key(&category) {
            return Err(VaultError::not_found("category", category));
        }
        let favorite = Favorite {
            user: user.to_string(),
            document,
            category,
        };
        if catalog.favorites.contains(&favorite) {
            return Err(VaultError::already_exists("favorite", document));
        }
        catalog.favorites.push(favorite.clone());
        Ok(favorite)
    }

    pub fn remove_favorite(&self, user: &str, document: NodeId, category: Uuid) -> Result<()> {
        let mut catalog = self.inner.write();
        let before = catalog.favorites.len();
        catalog
            .favorites
            .retain(|f| !(f.user == user && f.document == document && f.category == category));
        if catalog.favorites.len() == before {
            return Err(VaultError::not_found("favorite", document));
        }
        Ok(())
    }

    pub fn favorites(&self, user: &str) -> Vec<Favorite> {
        self.inner
            .read()
            .favorites
            .iter()
            .filter(|f| f.user == user)
            .cloned()
            .collect()
    }

    pub fn remove_favorites_for(&self, documents: &HashSet<NodeId>) -> usize {
        let mut catalog = self.inner.write();
        let before = catalog.favorites.len();
        catalog.favorites.retain(|f| !documents.contains(&f.document));
        before - catalog.favorites.len()
    }

    pub fn remove_favorites_of(&self, user: &str) -> usize {
        let mut catalog = self.inner.write();
        let before = catalog.favorites.len();
        catalog.favorites.retain(|f| f.user != user);
        before - catalog.favorites.len()
    }
}
