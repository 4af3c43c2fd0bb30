//! Users, groups and roles.
//!
//! Group membership is recorded on the group and role assignment on the
//! user or group that holds the role; nothing derived is cached, so edits
//! take effect on the next permission check.

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use uuid::Uuid;

use crate::error::{Result, VaultError};
use crate::model::NodeId;
use crate::session::{Authenticator, Credentials};

pub const ROLE_READER: &str = "reader";
pub const ROLE_PUBLISHER: &str = "publisher";
pub const ROLE_ADMIN: &str = "admin";

pub const GROUP_USERS: &str = "users";
pub const GROUP_PUBLISHERS: &str = "publishers";
pub const GROUP_ADMINS: &str = "admins";

pub const RESERVED_ROLES: [&str; 3] = [ROLE_READER, ROLE_PUBLISHER, ROLE_ADMIN];
pub const RESERVED_GROUPS: [&str; 3] = [GROUP_USERS, GROUP_PUBLISHERS, GROUP_ADMINS];

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Bookmark {
    pub id: Uuid,
    pub name: String,
    pub node: NodeId,
    pub created: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    #[serde(skip)]
    password_hash: String,
    /// System administrator override.
    pub admin: bool,
    pub active: bool,
    pub roles: BTreeSet<String>,
    pub bookmarks: Vec<Bookmark>,
    pub created: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Group {
    pub id: String,
    pub members: BTreeSet<String>,
    pub roles: BTreeSet<String>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Role {
    pub id: String,
    pub description: String,
}

/// A role holder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrincipalRef {
    User(String),
    Group(String),
}

#[derive(Default)]
struct Directory {
    users: BTreeMap<String, User>,
    groups: BTreeMap<String, Group>,
    roles: BTreeMap<String, Role>,
}

pub struct PrincipalStore {
    inner: RwLock<Directory>,
    hasher: Argon2<'static>,
}

impl PrincipalStore {
    /// Store holding only the reserved groups and roles.
    pub fn new(memory_kib: u32, iterations: u32) -> Result<Self> {
        let params = Params::new(memory_kib, iterations, 1, None)
            .map_err(|e| VaultError::invalid(format!("password hashing parameters: {e}")))?;
        let mut dir = Directory::default();
        for (role, description) in [
            (ROLE_READER, "may read nodes it is granted"),
            (ROLE_PUBLISHER, "may write nodes it is granted"),
            (ROLE_ADMIN, "may administer the repository"),
        ] {
            dir.roles.insert(
                role.to_string(),
                Role {
                    id: role.to_string(),
                    description: description.to_string(),
                },
            );
        }
        for (group, role) in [
            (GROUP_USERS, ROLE_READER),
            (GROUP_PUBLISHERS, ROLE_PUBLISHER),
            (GROUP_ADMINS, ROLE_ADMIN),
        ] {
            dir.groups.insert(
                group.to_string(),
                Group {
                    id: group.to_string(),
                    members: BTreeSet::new(),
                    roles: BTreeSet::from([role.to_string()]),
                },
            );
        }
        Ok(Self {
            inner: RwLock::new(dir),
            hasher: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }

    fn hash_password(&self, password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        self.hasher
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| VaultError::invalid(format!("cannot hash password: {e}")))
    }

    fn check_principal_id(id: &str) -> Result<()> {
        if id.trim().is_empty() || id.contains('/') || id.chars().any(char::is_whitespace) {
            return Err(VaultError::invalid(format!("illegal principal id {id:?}")));
        }
        Ok(())
    }

    pub fn create_user(&self, id: &str, password: &str, admin: bool) -> Result<User> {
        Self::check_principal_id(id)?;
        if password.is_empty() {
            return Err(VaultError::invalid("password is empty"));
        }
        let password_hash = self.hash_password(password)?;
        let mut dir = self.inner.write();
        if dir.users.contains_key(id) || dir.groups.contains_key(id) {
            return Err(VaultError::already_exists("principal", id));
        }
        let user = User {
            id: id.to_string(),
            email: None,
            password_hash,
            admin,
            active: true,
            roles: BTreeSet::new(),
            bookmarks: Vec::new(),
            created: Utc::now(),
        };
        dir.users.insert(id.to_string(), user.clone());
        if let Some(users) = dir.groups.get_mut(GROUP_USERS) {
            users.members.insert(id.to_string());
        }
        Ok(user)
    }

    pub fn delete_user(&self, id: &str) -> Result<()> {
        let mut dir = self.inner.write();
        if dir.users.remove(id).is_none() {
            return Err(VaultError::not_found("user", id));
        }
        for group in dir.groups.values_mut() {
            group.members.remove(id);
        }
        Ok(())
    }

    pub fn get_user(&self, id: &str) -> Option<User> {
        self.inner.read().users.get(id).cloned()
    }

    pub fn list_users(&self) -> Vec<User> {
        self.inner.read().users.values().cloned().collect()
    }

    /// Whether `id` names a user or a group.
    pub fn principal_exists(&self, id: &str) -> bool {
        let dir = self.inner.read();
        dir.users.contains_key(id) || dir.groups.contains_key(id)
    }

    pub fn set_password(&self, id: &str, password: &str) -> Result<()> {
        if password.is_empty() {
            return Err(VaultError::invalid("password is empty"));
        }
        let hash = self.hash_password(password)?;
        let mut dir = self.inner.write();
        let user = dir
            .users
            .get_mut(id)
            .ok_or_else(|| VaultError::not_found("user", id))?;
        user.password_hash = hash;
        Ok(())
    }

    pub fn verify_password(&self, id: &str, password: &str) -> bool {
        let hash = match self.inner.read().users.get(id) {
            Some(user) => user.password_hash.clone(),
            None => return false,
        };
        let Ok(parsed) = PasswordHash::new(&hash) else {
            return false;
        };
        self.hasher
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    }

    pub fn set_admin(&self, id: &str, admin: bool) -> Result<()> {
        self.update_user(id, |u| u.admin = admin)
    }

    pub fn set_active(&self, id: &str, active: bool) -> Result<()> {
        self.update_user(id, |u| u.active = active)
    }

    pub fn set_email(&self, id: &str, email: Option<String>) -> Result<()> {
        self.update_user(id, |u| u.email = email)
    }

    fn update_user(&self, id: &str, f: impl FnOnce(&mut User)) -> Result<()> {
        let mut dir = self.inner.write();
        let user = dir
            .users
            .get_mut(id)
            .ok_or_else(|| VaultError::not_found("user", id))?;
        f(user);
        Ok(())
    }

    pub fn is_admin(&self, id: &str) -> bool {
        self.inner
            .read()
            .users
            .get(id)
            .map_or(false, |u| u.admin && u.active)
    }

    pub fn create_group(&self, id: &str) -> Result<Group> {
        Self::check_principal_id(id)?;
        let mut dir = self.inner.write();
        if dir.users.contains_key(id) || dir.groups.contains_key(id) {
            return Err(VaultError::already_exists("principal", id));
        }
        let group = Group {
            id: id.to_string(),
            members: BTreeSet::new(),
            roles: BTreeSet::new(),
        };
        dir.groups.insert(id.to_string(), group.clone());
        Ok(group)
    }

    pub fn delete_group(&self, id: &str) -> Result<()> {
        if RESERVED_GROUPS.contains(&id) {
            return Err(VaultError::invalid(format!("group {id} is reserved")));
        }
        match self.inner.write().groups.remove(id) {
            Some(_) => Ok(()),
            None => Err(VaultError::not_found("group", id)),
        }
    }

    pub fn get_group(&self, id: &str) -> Option<Group> {
        self.inner.read().groups.get(id).cloned()
    }

    pub fn list_groups(&self) -> Vec<Group> {
        self.inner.read().groups.values().cloned().collect()
    }

    pub fn add_member(&self, group: &str, user: &str) -> Result<()> {
        let mut dir = self.inner.write();
        if !dir.users.contains_key(user) {
            return Err(VaultError::not_found("user", user));
        }
        let group = dir
            .groups
            .get_mut(group)
            .ok_or_else(|| VaultError::not_found("group", group))?;
        group.members.insert(user.to_string());
        Ok(())
    }

    pub fn remove_member(&self, group: &str, user: &str) -> Result<()> {
        let mut dir = self.inner.write();
        let group = dir
            .groups
            .get_mut(group)
            .ok_or_else(|| VaultError::not_found("group", group))?;
        if !group.members.remove(user) {
            return Err(VaultError::not_found("group member", user));
        }
        Ok(())
    }

    /// Ids of the groups `user` belongs to.
    pub fn groups_of(&self, user: &str) -> Vec<String> {
        self.inner
            .read()
            .groups
            .values()
            .filter(|g| g.members.contains(user))
            .map(|g| g.id.clone())
            .collect()
    }

    pub fn create_role(&self, id: &str, description: &str) -> Result<Role> {
        Self::check_principal_id(id)?;
        let mut dir = self.inner.write();
        if dir.roles.contains_key(id) {
            return Err(VaultError::already_exists("role", id));
        }
        let role = Role {
            id: id.to_string(),
            description: description.to_string(),
        };
        dir.roles.insert(id.to_string(), role.clone());
        Ok(role)
    }

    pub fn delete_role(&self, id: &str) -> Result<()> {
        if RESERVED_ROLES.contains(&id) {
            return Err(VaultError::invalid(format!("role {id} is reserved")));
        }
        let mut dir = self.inner.write();
        if dir.roles.remove(id).is_none() {
            return Err(VaultError::not_found("role", id));
        }
        for user in dir.users.values_mut() {
            user.roles.remove(id);
        }
        for group in dir.groups.values_mut() {
            group.roles.remove(id);
        }
        Ok(())
    }

    pub fn list_roles(&self) -> Vec<Role> {
        self.inner.read().roles.values().cloned().collect()
    }

    pub fn grant_role(&self, holder: &PrincipalRef, role: &str) -> Result<()> {
        let mut dir = self.inner.write();
        if !dir.roles.contains_key(role) {
            return Err(VaultError::not_found("role", role));
        }
        let roles = Self::roles_of_holder(&mut dir, holder)?;
        roles.insert(role.to_string());
        Ok(())
    }

    pub fn revoke_role(&self, holder: &PrincipalRef, role: &str) -> Result<()> {
        let mut dir = self.inner.write();
        let roles = Self::roles_of_holder(&mut dir, holder)?;
        if !roles.remove(role) {
            return Err(VaultError::not_found("role assignment", role));
        }
        Ok(())
    }

    fn roles_of_holder<'a>(
        dir: &'a mut Directory,
        holder: &PrincipalRef,
    ) -> Result<&'a mut BTreeSet<String>> {
        match holder {
            PrincipalRef::User(id) => dir
                .users
                .get_mut(id)
                .map(|u| &mut u.roles)
                .ok_or_else(|| VaultError::not_found("user", id)),
            PrincipalRef::Group(id) => dir
                .groups
                .get_mut(id)
                .map(|g| &mut g.roles)
                .ok_or_else(|| VaultError::not_found("group", id)),
        }
    }

    /// Roles held directly by `user` or through any of its groups.
    pub fn effective_roles(&self, user: &str) -> BTreeSet<String> {
        let dir = self.inner.read();
        let mut roles = BTreeSet::new();
        if let Some(u) = dir.users.get(user) {
            roles.extend(u.roles.iter().cloned());
        }
        for group in dir.groups.values().filter(|g| g.members.contains(user)) {
            roles.extend(group.roles.iter().cloned());
        }
        roles
    }

    /// Users holding `role` directly or through a group.
    pub fn role_members(&self, role: &str) -> BTreeSet<String> {
        let dir = self.inner.read();
        let mut members: BTreeSet<String> = dir
            .users
            .values()
            .filter(|u| u.roles.contains(role))
            .map(|u| u.id.clone())
            .collect();
        for group in dir.groups.values().filter(|g| g.roles.contains(role)) {
            members.extend(group.members.iter().cloned());
        }
        members
    }

    pub fn add_bookmark(&self, user: &str, name: &str, node: NodeId) -> Result<Bookmark> {
        let bookmark = Bookmark {
            id: Uuid::new_v4(),
            name: name.to_string(),
            node,
            created: Utc::now(),
        };
        let stored = bookmark.clone();
        self.update_user(user, move |u| u.bookmarks.push(stored))?;
        Ok(bookmark)
    }

    pub fn remove_bookmark(&self, user: &str, bookmark: Uuid) -> Result<()> {
        let mut dir = self.inner.write();
        let u = dir
            .users
            .get_mut(user)
            .ok_or_else(|| VaultError::not_found("user", user))?;
        let before = u.bookmarks.len();
        u.bookmarks.retain(|b| b.id != bookmark);
        if u.bookmarks.len() == before {
            return Err(VaultError::not_found("bookmark", bookmark));
        }
        Ok(())
    }

    pub fn bookmarks(&self, user: &str) -> Vec<Bookmark> {
        self.inner
            .read()
            .users
            .get(user)
            .map(|u| u.bookmarks.clone())
            .unwrap_or_default()
    }

    /// Drop every bookmark pointing at one of `nodes`.
    pub fn remove_bookmarks_for(&self, nodes: &HashSet<NodeId>) -> usize {
        let mut removed = 0;
        for user in self.inner.write().users.values_mut() {
            let before = user.bookmarks.len();
            user.bookmarks.retain(|b| !nodes.contains(&b.node));
            removed += before - user.bookmarks.len();
        }
        removed
    }
}

impl Authenticator for PrincipalStore {
    fn authenticate(&self, credentials: &Credentials) -> Result<String> {
        let active = match self.get_user(&credentials.user) {
            Some(user) => user.active,
            None => return Err(VaultError::denied("invalid credentials")),
        };
        if !self.verify_password(&credentials.user, &credentials.password) {
            return Err(VaultError::denied("invalid credentials"));
        }
        if !active {
            return Err(VaultError::denied(format!("user {} is disabled", credentials.user)));
        }
        Ok(credentials.user.clone())
    }
}
