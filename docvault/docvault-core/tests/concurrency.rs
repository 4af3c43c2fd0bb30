//! Concurrent callers against one repository.

mod common;

use anyhow::Result;
use common::Harness;
use docvault_core::{DeletePolicy, VaultError};
use std::collections::HashSet;
use std::thread;
use std::time::Duration;

#[test]
fn concurrent_creates_never_share_a_name() -> Result<()> {
    let h = Harness::new(DeletePolicy::Soft);
    let tickets: Vec<_> = (0..8).map(|i| h.user(&format!("writer{i}"), true)).collect();
    let owner = h.user("owner", true);
    let inbox = h.mkdir(&owner, h.root(), "inbox");

    let names: Vec<String> = thread::scope(|scope| {
        let handles: Vec<_> = tickets
            .iter()
            .map(|ticket| {
                let repo = &h.repo;
                let parent = inbox.id();
                scope.spawn(move || {
                    repo.create_directory(ticket, parent, "upload")
                        .map(|n| n.name().to_string())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("worker panicked"))
            .collect::<docvault_core::Result<Vec<_>>>()
    })?;

    let distinct: HashSet<&String> = names.iter().collect();
    assert_eq!(distinct.len(), names.len());
    assert_eq!(names.iter().filter(|n| *n == "upload").count(), 1);

    let slots: HashSet<String> = h
        .repo
        .list_children(&h.admin, inbox.id())?
        .into_iter()
        .map(|n| n.base.slot)
        .collect();
    assert_eq!(slots.len(), 8);
    Ok(())
}

#[test]
fn crossing_moves_do_not_deadlock() -> Result<()> {
    let h = Harness::new(DeletePolicy::Soft);
    let alice = h.user("alice", true);
    let left = h.mkdir(&alice, h.root(), "left");
    let right = h.mkdir(&alice, h.root(), "right");
    let one = h.mkdoc(&alice, left.id(), "one.txt", b"1");
    let two = h.mkdoc(&alice, right.id(), "two.txt", b"2");

    thread::scope(|scope| {
        for (doc, from, to) in [(one.id(), left.id(), right.id()), (two.id(), right.id(), left.id())] {
            let repo = &h.repo;
            let alice = &alice;
            scope.spawn(move || {
                for round in 0..50 {
                    let dest = if round % 2 == 0 { to } else { from };
                    repo.move_document(alice, doc, dest).expect("move");
                }
            });
        }
    });

    for id in [one.id(), two.id()] {
        let node = h.repo.get_node(&alice, id)?;
        let parent = h.repo.get_node(&alice, node.parent().expect("parent"))?;
        assert_eq!(node.path(), format!("{}/{}", parent.path(), node.base.slot));
    }
    Ok(())
}

#[test]
fn parallel_updates_each_record_a_version() -> Result<()> {
    let h = Harness::new(DeletePolicy::Soft);
    let alice = h.user("alice", true);
    let doc = h.mkdoc(&alice, h.root(), "counter.txt", b"0");

    thread::scope(|scope| {
        for i in 1..=6 {
            let repo = &h.repo;
            let alice = &alice;
            let id = doc.id();
            scope.spawn(move || {
                repo.set_content(alice, id, i.to_string().into_bytes())
                    .expect("update");
            });
        }
    });

    assert_eq!(h.repo.get_versions(&alice, doc.id())?.len(), 6);
    Ok(())
}

#[test]
fn cascading_grant_keeps_concurrent_descendant_edits() -> Result<()> {
    let h = Harness::new(DeletePolicy::Soft);
    let alice = h.user("alice", true);
    let bulk = h.mkdir(&alice, h.root(), "bulk");
    let docs: Vec<_> = (0..300)
        .map(|i| h.mkdoc(&alice, bulk.id(), &format!("d{i}.txt"), b""))
        .collect();

    for round in 0..5usize {
        let group = format!("team{round}");
        h.repo.create_group(&h.admin, &group)?;
        let target = docs[round * 60 + 30].id();
        let granted = thread::scope(|scope| {
            let repo = &h.repo;
            let alice = &alice;
            let group = group.as_str();
            let dir = bulk.id();
            let cascade = scope.spawn(move || repo.grant_restriction(alice, dir, group, true));
            thread::sleep(Duration::from_millis(round as u64));
            repo.lock_document(alice, target).expect("lock");
            cascade.join().expect("grant panicked")
        })?;
        assert_eq!(granted, 301);

        let node = h.repo.get_node(&alice, target)?;
        assert_eq!(node.lock_owner(), Some("alice"));
        assert!(node.base.restrictions.contains(&group));
    }
    let still_locked = docs
        .iter()
        .filter(|d| matches!(h.repo.lock_info(&alice, d.id()), Ok(Some(_))))
        .count();
    assert_eq!(still_locked, 5);
    Ok(())
}

#[test]
fn move_keeps_concurrent_rename_of_a_descendant() -> Result<()> {
    let h = Harness::new(DeletePolicy::Soft);
    let alice = h.user("alice", true);
    let from = h.mkdir(&alice, h.root(), "from");
    let to = h.mkdir(&alice, h.root(), "to");
    let docs: Vec<_> = (0..200)
        .map(|i| h.mkdoc(&alice, from.id(), &format!("d{i}.txt"), b""))
        .collect();
    let target = docs[100].id();

    thread::scope(|scope| {
        let repo = &h.repo;
        let alice = &alice;
        let (source, dest) = (from.id(), to.id());
        let mover = scope.spawn(move || repo.move_directory(alice, source, dest));
        thread::sleep(Duration::from_millis(2));
        repo.rename_node(alice, target, "renamed.txt").expect("rename");
        mover.join().expect("move panicked")
    })?;

    let moved = h.repo.get_node(&alice, from.id())?;
    assert_eq!(moved.parent(), Some(to.id()));
    let node = h.repo.get_node(&alice, target)?;
    assert_eq!(node.name(), "renamed.txt");
    assert_eq!(node.path(), format!("{}/{}", moved.path(), node.base.slot));
    Ok(())
}

#[test]
fn soft_delete_and_lock_race_has_one_winner() -> Result<()> {
    let h = Harness::new(DeletePolicy::Soft);
    let alice = h.user("alice", true);
    let bob = h.user("bob", true);
    let dir = h.mkdir(&alice, h.root(), "shared");
    let docs: Vec<_> = (0..200)
        .map(|i| h.mkdoc(&alice, dir.id(), &format!("d{i}.txt"), b""))
        .collect();
    let target = docs[150].id();

    let (deleted, locked) = thread::scope(|scope| {
        let repo = &h.repo;
        let alice = &alice;
        let doomed = dir.id();
        let deleter = scope.spawn(move || repo.remove_node(alice, doomed));
        thread::sleep(Duration::from_millis(1));
        let locked = repo.lock_document(&bob, target);
        (deleter.join().expect("delete panicked"), locked)
    });

    match (deleted, locked) {
        (Ok(()), Err(VaultError::NotFound { .. })) => {
            assert!(matches!(
                h.repo.get_node(&alice, target),
                Err(VaultError::NotFound { .. })
            ));
        }
        (Err(VaultError::ResourceLocked { owner, .. }), Ok(lock)) => {
            assert_eq!(owner, "bob");
            assert_eq!(h.repo.lock_info(&alice, target)?, Some(lock));
            assert!(h.repo.get_node(&alice, dir.id())?.is_active());
        }
        (deleted, locked) => panic!("unexpected outcome: {deleted:?} / {locked:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn eviction_task_expires_idle_sessions() -> Result<()> {
    let mut config = common::config(DeletePolicy::Soft);
    config.session_idle_timeout_secs = 0;
    config.eviction_period_secs = 1;
    let h = Harness::with_config(config);
    h.repo.start_eviction();
    assert!(h.repo.session_registry().is_running());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(matches!(h.repo.root(&h.admin), Err(VaultError::SessionExpired)));

    h.repo.shutdown()?;
    assert!(!h.repo.session_registry().is_running());
    Ok(())
}
