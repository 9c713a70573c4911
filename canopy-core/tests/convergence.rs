//! Convergence tests: several sessions edit concurrently, exchange their
//! updates in different orders, and must end with identical trees.

use canopy_core::replica::TreeAction;
use canopy_core::{
    topological_order, CollabSession, LocalHandle, ParentRef, PropertyMap, StableId, TreeEvent,
    TEXT_KEY,
};
use proptest::prelude::*;
use serde_json::json;

fn text(s: &str) -> PropertyMap {
    let mut props = PropertyMap::new();
    props.insert(TEXT_KEY.into(), json!(s));
    props
}

fn add_paragraph(session: &mut CollabSession, s: &str) -> LocalHandle {
    session
        .edit(|w| {
            let p = w.append(LocalHandle::ROOT, "paragraph", PropertyMap::new())?;
            w.append(p, "text", text(s))?;
            Ok(p)
        })
        .unwrap()
}

/// Push every peer's pending update to every other peer.
fn exchange(peers: &mut [CollabSession]) {
    let updates: Vec<Option<Vec<u8>>> = peers.iter_mut().map(|p| p.flush().unwrap()).collect();
    for (from, update) in updates.iter().enumerate() {
        let Some(update) = update else { continue };
        for (to, peer) in peers.iter_mut().enumerate() {
            if from != to {
                peer.apply_remote_update(update).unwrap();
            }
        }
    }
}

fn assert_converged(peers: &[CollabSession]) {
    let first = peers[0].tree().to_value();
    for peer in peers {
        assert_eq!(peer.tree().to_value(), first, "peer {} diverged", peer.peer());
        peer.check_invariants().unwrap();
    }
}

// ── concurrent structure ───────────────────────────────

#[test]
fn test_three_peers_concurrent_inserts_converge() {
    let mut peers: Vec<CollabSession> = (1..=3)
        .map(|id| CollabSession::with_defaults(id).unwrap())
        .collect();

    for (i, peer) in peers.iter_mut().enumerate() {
        add_paragraph(peer, &format!("from {i}"));
    }
    exchange(&mut peers);

    assert_converged(&peers);
    assert_eq!(peers[0].tree().children(LocalHandle::ROOT).len(), 3);
}

#[test]
fn test_late_joiner_bootstraps_from_snapshot() {
    let mut a = CollabSession::with_defaults(1).unwrap();
    add_paragraph(&mut a, "one");
    add_paragraph(&mut a, "two");

    let mut late = CollabSession::with_defaults(9).unwrap();
    let report = late.bootstrap(&a.snapshot().unwrap()).unwrap();
    assert_eq!(report.created, 4);
    assert_converged(&[a, late]);
}

#[test]
fn test_concurrent_moves_converge() {
    let mut a = CollabSession::with_defaults(1).unwrap();
    let mut b = CollabSession::with_defaults(2).unwrap();
    let first = add_paragraph(&mut a, "first");
    add_paragraph(&mut a, "second");
    b.bootstrap(&a.snapshot().unwrap()).unwrap();
    a.flush().unwrap();

    // a moves the first paragraph to the end, b edits its text.
    a.edit(|w| w.move_node(first, LocalHandle::ROOT, 1)).unwrap();
    let b_first = b.tree().children(LocalHandle::ROOT)[0];
    let b_leaf = b.tree().children(b_first)[0];
    b.edit(|w| w.insert_text(b_leaf, 5, "!")).unwrap();

    let mut peers = vec![a, b];
    exchange(&mut peers);
    assert_converged(&peers);
}

#[test]
fn test_out_of_order_delivery_converges() {
    let mut a = CollabSession::with_defaults(1).unwrap();
    let mut b = CollabSession::with_defaults(2).unwrap();

    let p = add_paragraph(&mut a, "base");
    let first = a.flush().unwrap().unwrap();
    a.edit(|w| w.append(p, "text", text(" more"))).unwrap();
    let second = a.flush().unwrap().unwrap();

    // The second update depends on the first; the replica holds it back
    // until its dependencies arrive.
    b.apply_remote_update(&second).unwrap();
    b.apply_remote_update(&first).unwrap();
    assert_converged(&[a, b]);
}

// ── integration order ──────────────────────────────────

fn chain(len: usize) -> Vec<TreeEvent> {
    let id = |n: usize| StableId::new(7, n as i32);
    (0..len)
        .map(|n| {
            let parent = if n == 0 {
                ParentRef::Root
            } else {
                ParentRef::Node(id(n - 1))
            };
            TreeEvent::create(id(n), parent, 0)
        })
        .collect()
}

proptest! {
    #[test]
    fn prop_topological_order_places_parents_first(
        order in Just((0..8usize).collect::<Vec<_>>()).prop_shuffle()
    ) {
        let events = chain(8);
        let shuffled: Vec<TreeEvent> = order.iter().map(|i| events[*i].clone()).collect();
        let sorted = topological_order(shuffled);

        prop_assert_eq!(sorted.len(), 8);
        for (position, event) in sorted.iter().enumerate() {
            prop_assert_eq!(event.action, TreeAction::Create);
            if let Some(ParentRef::Node(parent)) = event.parent {
                let parent_at = sorted.iter().position(|e| e.target == parent).unwrap();
                prop_assert!(parent_at < position);
            }
        }
    }
}
