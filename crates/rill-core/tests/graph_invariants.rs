//! Structural invariants of the dependency graph under long edit sequences.
//!
//! A seeded generator drives register/replace/delete over a small name
//! alphabet so conflicts and cycles come and go; the graph is checked
//! against a from-scratch recomputation after every step.

use std::collections::BTreeSet;

use rill_core::graph::{Cell, CellBody, CellId, DependencyGraph};

// =============================================================================
// Test Helpers
// =============================================================================

const NAMES: [&str; 5] = ["a", "b", "c", "d", "e"];

/// Small deterministic generator (64-bit LCG).
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }

    fn names(&mut self, max: usize) -> Vec<&'static str> {
        let count = self.below(max + 1);
        (0..count).map(|_| NAMES[self.below(NAMES.len())]).collect()
    }
}

fn random_cell(rng: &mut Lcg, id: CellId) -> Cell {
    let defs = rng.names(2);
    let refs: Vec<&str> = rng.names(2).into_iter().filter(|r| !defs.contains(r)).collect();
    Cell::new(id, format!("{defs:?} <- {refs:?}"), CellBody::empty())
        .defines(defs)
        .references(refs)
}

fn check_invariants(graph: &DependencyGraph) {
    let cells = graph.cells();
    let ids: BTreeSet<CellId> = cells.iter().map(|c| c.id()).collect();

    for u in &cells {
        for v in &cells {
            if u.id() == v.id() {
                continue;
            }
            let expected = u.defs().intersection(v.refs()).next().is_some();
            let child = graph.children_of(u.id()).contains(&v.id());
            let parent = graph.parents_of(v.id()).contains(&u.id());
            assert_eq!(child, expected, "edge {} -> {}", u.id(), v.id());
            assert_eq!(parent, child, "children/parents disagree on {} -> {}", u.id(), v.id());
        }
        assert!(graph.children_of(u.id()).is_subset(&ids));
        assert!(graph.parents_of(u.id()).is_subset(&ids));

        let shares_a_name = cells
            .iter()
            .any(|o| o.id() != u.id() && o.defs().intersection(u.defs()).next().is_some());
        assert_eq!(!graph.siblings_of(u.id()).is_empty(), shares_a_name);
    }

    for (name, definers) in graph.definitions() {
        assert!(!definers.is_empty(), "empty definer set for {name}");
        for id in definers {
            assert!(graph.get(*id).unwrap().defs().contains(name));
        }
    }

    for cycle in graph.cycles() {
        assert!(!cycle.is_empty());
        for &(from, to) in cycle {
            assert!(graph.children_of(from).contains(&to), "dangling cycle edge");
        }
        // Closed walk
        for pair in cycle.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
        assert_eq!(cycle.last().map(|e| e.1), cycle.first().map(|e| e.0));
    }

    // Every cell appears once in a full topological sort, and edges not
    // downstream of a cycle point forward
    let order = graph.topological_sort(&ids);
    assert_eq!(order.len(), ids.len());
    let mut tainted: BTreeSet<CellId> = graph.cycle_groups().into_iter().flatten().collect();
    for id in tainted.clone() {
        tainted.extend(graph.descendants(id));
    }
    let position = |id: CellId| order.iter().position(|&o| o == id).unwrap();
    for &u in &ids {
        for &v in graph.children_of(u) {
            if !tainted.contains(&u) && !tainted.contains(&v) {
                assert!(position(u) < position(v), "{u} must precede {v}");
            }
        }
    }
}

// =============================================================================
// Invariants
// =============================================================================

#[test]
fn test_invariants_hold_under_random_edits() {
    for seed in 0..20 {
        let mut rng = Lcg(seed);
        let mut graph = DependencyGraph::new();
        let mut live: Vec<CellId> = Vec::new();

        for _ in 0..60 {
            match rng.below(4) {
                0 | 1 => {
                    let id = CellId::new();
                    graph.register(random_cell(&mut rng, id)).unwrap();
                    live.push(id);
                }
                2 if !live.is_empty() => {
                    let id = live[rng.below(live.len())];
                    let replacement = random_cell(&mut rng, id);
                    graph.replace(replacement).unwrap();
                }
                _ if !live.is_empty() => {
                    let id = live.swap_remove(rng.below(live.len()));
                    graph.delete(id).unwrap();
                }
                _ => {}
            }
            check_invariants(&graph);
        }
    }
}

#[test]
fn test_delete_everything_leaves_empty_graph() {
    let mut rng = Lcg(7);
    let mut graph = DependencyGraph::new();
    let ids: Vec<CellId> = (0..25)
        .map(|_| {
            let id = CellId::new();
            graph.register(random_cell(&mut rng, id)).unwrap();
            id
        })
        .collect();

    for id in ids {
        graph.delete(id).unwrap();
        check_invariants(&graph);
    }
    assert!(graph.is_empty());
    assert!(graph.definitions().is_empty());
    assert!(graph.cycles().is_empty());
}

#[test]
fn test_descendants_and_ancestors_are_dual() {
    let mut rng = Lcg(42);
    let mut graph = DependencyGraph::new();
    let ids: Vec<CellId> = (0..15)
        .map(|_| {
            let id = CellId::new();
            graph.register(random_cell(&mut rng, id)).unwrap();
            id
        })
        .collect();

    for &u in &ids {
        for v in graph.descendants(u) {
            assert!(graph.ancestors(v).contains(&u) || v == u);
        }
    }
}
