#![allow(dead_code)]

use docvault_core::model::{Node, NodeAttrs, NodeId};
use docvault_core::principal::GROUP_PUBLISHERS;
use docvault_core::{Credentials, DeletePolicy, MemoryEngine, Repository, Ticket, VaultConfig};
use std::sync::Arc;

pub const PASSWORD: &str = "correct horse";

/// Defaults with a cheap password hash.
pub fn config(policy: DeletePolicy) -> VaultConfig {
    VaultConfig {
        delete_policy: policy,
        password_memory_kib: 64,
        password_iterations: 1,
        ..Default::default()
    }
}

pub struct Harness {
    pub repo: Arc<Repository>,
    pub engine: Arc<MemoryEngine>,
    pub admin: Ticket,
}

impl Harness {
    pub fn new(policy: DeletePolicy) -> Self {
        Self::with_config(config(policy))
    }

    pub fn with_config(config: VaultConfig) -> Self {
        let engine = Arc::new(MemoryEngine::new());
        let repo = Repository::open(config, engine.clone()).expect("open repository");
        let admin = repo
            .login(&Credentials::new("admin", "admin"), "default", true)
            .expect("admin login");
        Self {
            repo: Arc::new(repo),
            engine,
            admin,
        }
    }

    /// Create a user, optionally in `publishers`, and log them in.
    pub fn user(&self, id: &str, publisher: bool) -> Ticket {
        self.repo
            .create_user(&self.admin, id, PASSWORD, false)
            .expect("create user");
        if publisher {
            self.repo
                .add_group_member(&self.admin, GROUP_PUBLISHERS, id)
                .expect("join publishers");
        }
        self.repo
            .login(&Credentials::new(id, PASSWORD), "default", true)
            .expect("user login")
    }

    pub fn root(&self) -> NodeId {
        self.repo.root(&self.admin).expect("root").id()
    }

    pub fn mkdir(&self, ticket: &Ticket, parent: NodeId, name: &str) -> Node {
        self.repo
            .create_directory(ticket, parent, name)
            .expect("create directory")
    }

    pub fn mkdoc(&self, ticket: &Ticket, parent: NodeId, name: &str, content: &[u8]) -> Node {
        let attrs = NodeAttrs {
            content: content.to_vec(),
            ..Default::default()
        };
        self.repo
            .create_document(ticket, parent, name, attrs)
            .expect("create document")
    }
}
