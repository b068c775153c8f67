//! Strong eventual consistency of the replicated document: the same set of
//! updates delivered in different orders yields the same content.

use pointer_core::{Node, ReplicatedDocument, Snapshot};

/// Every permutation of `0..n`.
fn permutations(n: usize) -> Vec<Vec<usize>> {
    if n == 0 {
        return vec![Vec::new()];
    }
    let mut out = Vec::new();
    for rest in permutations(n - 1) {
        for pos in 0..=rest.len() {
            let mut p = rest.clone();
            p.insert(pos, n - 1);
            out.push(p);
        }
    }
    out
}

/// Produce concurrent edits on three replicas that all start from `base`.
fn concurrent_updates(base: &[u8]) -> Vec<Vec<u8>> {
    let edits: Vec<Box<dyn Fn(&ReplicatedDocument)>> = vec![
        Box::new(|d| d.insert_text(0, 0, "A-").unwrap()),
        Box::new(|d| d.append_block(&Node::paragraph("from B")).unwrap()),
        Box::new(|d| {
            d.insert_text(1, 3, "[C]").unwrap();
            d.remove_blocks(2, 1).unwrap();
        }),
    ];

    edits
        .iter()
        .map(|edit| {
            let replica = ReplicatedDocument::new();
            replica.apply_remote(base).unwrap();
            let before = replica.state_vector();
            edit(&replica);
            replica.encode_diff(&before).unwrap()
        })
        .collect()
}

#[test]
fn test_permuted_delivery_converges() {
    let origin = ReplicatedDocument::new();
    let base = origin
        .seed(&Snapshot::from_paragraphs(&["alpha", "beta", "gamma"]))
        .unwrap();
    let updates = concurrent_updates(&base);

    let mut results = Vec::new();
    for order in permutations(updates.len()) {
        let replica = ReplicatedDocument::new();
        replica.apply_remote(&base).unwrap();
        for i in order {
            replica.apply_remote(&updates[i]).unwrap();
        }
        results.push(replica.plain_text().unwrap());
    }

    assert_eq!(results.len(), 6);
    assert!(results.windows(2).all(|w| w[0] == w[1]), "diverged: {results:?}");
    assert!(results[0].starts_with("A-alpha"));
    assert!(results[0].contains("bet[C]a"));
    assert!(results[0].contains("from B"));
    assert!(!results[0].contains("gamma"));
}

#[test]
fn test_updates_before_base_still_converge() {
    // Causally dependent updates arriving before their base are held as
    // pending and integrated once the base shows up.
    let origin = ReplicatedDocument::new();
    let base = origin.seed(&Snapshot::from_paragraphs(&["one"])).unwrap();
    let updates = typed_suffix_update(&base);

    let early = ReplicatedDocument::new();
    early.apply_remote(&updates).unwrap();
    early.apply_remote(&base).unwrap();

    let late = ReplicatedDocument::new();
    late.apply_remote(&base).unwrap();
    late.apply_remote(&updates).unwrap();

    assert_eq!(early.plain_text().unwrap(), late.plain_text().unwrap());
    assert_eq!(late.plain_text().unwrap(), "one two");
}

fn typed_suffix_update(base: &[u8]) -> Vec<u8> {
    let replica = ReplicatedDocument::new();
    replica.apply_remote(base).unwrap();
    let before = replica.state_vector();
    replica.insert_text(0, 3, " two").unwrap();
    replica.encode_diff(&before).unwrap()
}

#[test]
fn test_duplicate_delivery_is_idempotent() {
    let a = ReplicatedDocument::new();
    let update = a.seed(&Snapshot::from_paragraphs(&["once"])).unwrap();

    let b = ReplicatedDocument::new();
    b.apply_remote(&update).unwrap();
    b.apply_remote(&update).unwrap();
    b.apply_remote(&a.encode_state_as_update()).unwrap();

    assert_eq!(b.plain_text().unwrap(), "once");
    assert_eq!(b.block_count(), 1);
}
