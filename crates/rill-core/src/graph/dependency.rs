//! The reactive dependency graph.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, VecDeque};

use petgraph::graphmap::DiGraphMap;
use rustc_hash::{FxHashMap, FxHashSet};

use super::cell::{Cell, CellId, CellStatus};
use super::fault::{Edge, Fault};
use crate::error::{Error, Result};

static EMPTY: BTreeSet<CellId> = BTreeSet::new();

/// Dependency graph over registered cells.
///
/// An edge `(u, v)` exists iff `u` defines a name `v` references. The graph
/// tolerates multiple definitions and cycles; both are reported through
/// [`structural_faults`](Self::structural_faults) instead of being rejected.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Cells by ID
    cells: FxHashMap<CellId, Cell>,
    /// Registration order, used to break ties deterministically
    sequence: FxHashMap<CellId, u64>,
    next_seq: u64,
    /// Edges go from definer to reader
    children: FxHashMap<CellId, BTreeSet<CellId>>,
    parents: FxHashMap<CellId, BTreeSet<CellId>>,
    /// Cells defining at least one common name
    siblings: FxHashMap<CellId, BTreeSet<CellId>>,
    /// Name to defining cells
    definitions: BTreeMap<String, BTreeSet<CellId>>,
    /// Each cycle as a closed walk of edges, rotated to start at its smallest edge
    cycles: BTreeSet<Vec<Edge>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cell, wiring edges to every existing cell that shares a name.
    pub fn register(&mut self, cell: Cell) -> Result<()> {
        let id = cell.id();
        if self.cells.contains_key(&id) {
            return Err(Error::DuplicateCell(id));
        }

        self.children.entry(id).or_default();
        self.parents.entry(id).or_default();
        self.siblings.entry(id).or_default();

        let mut new_edges = BTreeSet::new();

        for name in cell.defs() {
            let definers = self.definitions.entry(name.clone()).or_default();
            for &other in definers.iter() {
                if other != id {
                    link(&mut self.siblings, id, other);
                    link(&mut self.siblings, other, id);
                }
            }
            definers.insert(id);
            if definers.len() > 1 {
                tracing::warn!("'{}' is defined by {} cells", name, definers.len());
            }

            for (&other_id, other) in &self.cells {
                if other.refs().contains(name) {
                    link(&mut self.children, id, other_id);
                    link(&mut self.parents, other_id, id);
                    new_edges.insert((id, other_id));
                }
            }
        }

        for name in cell.refs() {
            let Some(definers) = self.definitions.get(name) else {
                continue;
            };
            for &other_id in definers {
                if other_id == id {
                    continue;
                }
                link(&mut self.parents, id, other_id);
                link(&mut self.children, other_id, id);
                new_edges.insert((other_id, id));
            }
        }

        for &(from, to) in &new_edges {
            if let Some(path) = self.path(to, from) {
                let mut cycle = Vec::with_capacity(path.len() + 1);
                cycle.push((from, to));
                cycle.extend(path);
                let cycle = normalize_cycle(cycle);
                tracing::warn!("cycle detected through {} edges", cycle.len());
                self.cycles.insert(cycle);
            }
        }

        self.sequence.insert(id, self.next_seq);
        self.next_seq += 1;
        self.cells.insert(id, cell);

        let ancestors = self.ancestors(id);
        let stale = ancestors.iter().any(|a| self.cells[a].is_stale());
        let disabled = ancestors.iter().any(|a| {
            let ancestor = &self.cells[a];
            ancestor.is_user_disabled() || ancestor.status() == CellStatus::DisabledTransitively
        });
        let cell = self.cells.get_mut(&id).ok_or(Error::CellNotFound(id))?;
        if stale {
            cell.set_stale(true);
        }
        if disabled {
            cell.set_status(CellStatus::DisabledTransitively);
        }

        tracing::debug!(
            "registered {} ({} parents, {} children)",
            id,
            self.parents[&id].len(),
            self.children[&id].len()
        );
        Ok(())
    }

    /// Remove a cell, returning it together with its former children.
    pub fn delete(&mut self, id: CellId) -> Result<(Cell, BTreeSet<CellId>)> {
        let cell = self.cells.remove(&id).ok_or(Error::CellNotFound(id))?;

        for name in cell.defs() {
            if let Some(definers) = self.definitions.get_mut(name) {
                definers.remove(&id);
                if definers.is_empty() {
                    self.definitions.remove(name);
                }
            }
        }

        for sibling in self.siblings.remove(&id).unwrap_or_default() {
            if let Some(set) = self.siblings.get_mut(&sibling) {
                set.remove(&id);
            }
        }

        let children = self.children.remove(&id).unwrap_or_default();
        let parents = self.parents.remove(&id).unwrap_or_default();

        let removed: FxHashSet<Edge> = children
            .iter()
            .map(|&child| (id, child))
            .chain(parents.iter().map(|&parent| (parent, id)))
            .collect();
        self.cycles
            .retain(|cycle| !cycle.iter().any(|edge| removed.contains(edge)));

        for child in &children {
            if let Some(set) = self.parents.get_mut(child) {
                set.remove(&id);
            }
        }
        for parent in &parents {
            if let Some(set) = self.children.get_mut(parent) {
                set.remove(&id);
            }
        }
        self.sequence.remove(&id);

        tracing::debug!("deleted {} ({} former children)", id, children.len());
        Ok((cell, children))
    }

    /// Replace the cell sharing `cell`'s id, keeping its position in
    /// registration order and its user-disabled flag.
    ///
    /// Returns the previous cell and its former children, if there was one.
    pub fn replace(&mut self, mut cell: Cell) -> Result<Option<(Cell, BTreeSet<CellId>)>> {
        let id = cell.id();
        let seq = self.sequence.get(&id).copied();
        let previous = if self.cells.contains_key(&id) {
            let (old, children) = self.delete(id)?;
            cell.set_user_disabled(old.is_user_disabled());
            Some((old, children))
        } else {
            None
        };
        self.register(cell)?;
        if let Some(seq) = seq {
            self.sequence.insert(id, seq);
        }
        Ok(previous)
    }

    /// Disable a cell; its descendants become disabled-transitively.
    pub fn disable(&mut self, id: CellId) -> Result<()> {
        self.cell_mut(id)?.set_user_disabled(true);
        for descendant in self.descendants(id) {
            self.cells[&descendant].set_status(CellStatus::DisabledTransitively);
        }
        tracing::debug!("disabled {}", id);
        Ok(())
    }

    /// Enable a cell and unblock descendants no longer behind a disabled ancestor.
    ///
    /// Returns the unblocked cells that are stale and need to run. Nothing is executed.
    pub fn enable(&mut self, id: CellId) -> Result<BTreeSet<CellId>> {
        self.cell_mut(id)?.set_user_disabled(false);

        let mut to_run = BTreeSet::new();
        let candidates = std::iter::once(id).chain(self.descendants(id));
        for cid in candidates.collect::<Vec<_>>() {
            if self.is_disabled(cid) {
                continue;
            }
            let cell = &self.cells[&cid];
            if cell.status() == CellStatus::DisabledTransitively {
                cell.set_status(CellStatus::Idle);
            }
            if cell.is_stale() {
                to_run.insert(cid);
            }
        }
        tracing::debug!("enabled {} ({} cells to run)", id, to_run.len());
        Ok(to_run)
    }

    /// Whether the cell or any of its ancestors is disabled by the user.
    pub fn is_disabled(&self, id: CellId) -> bool {
        let Some(cell) = self.cells.get(&id) else {
            return false;
        };
        cell.is_user_disabled()
            || self
                .ancestors(id)
                .iter()
                .any(|a| self.cells[a].is_user_disabled())
    }

    /// Transitive closure over parents, excluding `id`.
    pub fn ancestors(&self, id: CellId) -> BTreeSet<CellId> {
        self.closure(id, &self.parents)
    }

    /// Transitive closure over children, excluding `id`.
    pub fn descendants(&self, id: CellId) -> BTreeSet<CellId> {
        self.closure(id, &self.children)
    }

    fn closure(&self, id: CellId, edges: &FxHashMap<CellId, BTreeSet<CellId>>) -> BTreeSet<CellId> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            for &next in edges.get(&current).unwrap_or(&EMPTY) {
                if next != id && seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }

    /// Expand free names into every name they recursively depend on.
    ///
    /// Each name is expanded through its definers' per-name dependency data
    /// (or a definer's full reference set when it has none for that name).
    /// Expansion stops at names for which `predicate` returns false; those
    /// names are still part of the result.
    pub fn transitive_references<'a>(
        &self,
        names: impl IntoIterator<Item = &'a String>,
        predicate: impl Fn(&str) -> bool,
    ) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<String> = names.into_iter().cloned().collect();
        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.clone()) || !predicate(&name) {
                continue;
            }
            for definer in self.definitions.get(&name).unwrap_or(&EMPTY) {
                let cell = &self.cells[definer];
                let deps = cell.name_deps().get(&name).unwrap_or(cell.refs());
                queue.extend(deps.iter().filter(|d| !seen.contains(*d)).cloned());
            }
        }
        seen
    }

    /// Order `subset` so every cell precedes its descendants within it.
    ///
    /// Kahn's algorithm, ties broken by registration order. Cells stuck on a
    /// cycle are appended in registration order.
    pub fn topological_sort<'a>(&self, subset: impl IntoIterator<Item = &'a CellId>) -> Vec<CellId> {
        let subset: FxHashSet<CellId> = subset
            .into_iter()
            .copied()
            .filter(|id| self.cells.contains_key(id))
            .collect();

        let mut in_degree: FxHashMap<CellId, usize> = subset
            .iter()
            .map(|&id| {
                let degree = self
                    .parents_of(id)
                    .iter()
                    .filter(|p| **p != id && subset.contains(*p))
                    .count();
                (id, degree)
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<(u64, CellId)>> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(&id, _)| Reverse((self.seq(id), id)))
            .collect();

        let mut order = Vec::with_capacity(subset.len());
        while let Some(Reverse((_, id))) = ready.pop() {
            order.push(id);
            for &child in self.children_of(id) {
                if child == id {
                    continue;
                }
                if let Some(degree) = in_degree.get_mut(&child) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse((self.seq(child), child)));
                    }
                }
            }
        }

        if order.len() < subset.len() {
            let placed: FxHashSet<CellId> = order.iter().copied().collect();
            let mut leftover: Vec<CellId> = subset.difference(&placed).copied().collect();
            leftover.sort_by_key(|&id| (self.seq(id), id));
            tracing::warn!("{} cells are on a cycle; appending in registration order", leftover.len());
            order.extend(leftover);
        }
        order
    }

    /// Structural faults for every cell that has any.
    pub fn structural_faults(&self) -> BTreeMap<CellId, Vec<Fault>> {
        let mut faults: BTreeMap<CellId, Vec<Fault>> = BTreeMap::new();

        for (name, definers) in &self.definitions {
            if definers.len() < 2 {
                continue;
            }
            for &id in definers {
                faults.entry(id).or_default().push(Fault::MultipleDefinition {
                    name: name.clone(),
                    others: definers.iter().copied().filter(|&d| d != id).collect(),
                });
            }
        }

        for cycle in &self.cycles {
            let participants: BTreeSet<CellId> = cycle.iter().flat_map(|&(a, b)| [a, b]).collect();
            for id in participants {
                faults.entry(id).or_default().push(Fault::Cycle {
                    edges: cycle.clone(),
                });
            }
        }

        for (&id, cell) in &self.cells {
            for name in cell.deleted_refs() {
                let defined_by: Vec<CellId> = self
                    .definitions
                    .get(name)
                    .unwrap_or(&EMPTY)
                    .iter()
                    .copied()
                    .filter(|&d| d != id)
                    .collect();
                if !defined_by.is_empty() {
                    faults.entry(id).or_default().push(Fault::DeleteNonlocal {
                        name: name.clone(),
                        defined_by,
                    });
                }
            }
        }

        faults
    }

    /// Groups of mutually dependent cells (strongly connected components with more than one cell).
    pub fn cycle_groups(&self) -> Vec<Vec<CellId>> {
        let mut graph: DiGraphMap<CellId, ()> = DiGraphMap::new();
        for &id in self.cells.keys() {
            graph.add_node(id);
        }
        for (&from, targets) in &self.children {
            for &to in targets {
                graph.add_edge(from, to, ());
            }
        }

        let mut groups: Vec<Vec<CellId>> = petgraph::algo::tarjan_scc(&graph)
            .into_iter()
            .filter(|group| group.len() > 1)
            .map(|mut group| {
                group.sort_by_key(|&id| self.seq(id));
                group
            })
            .collect();
        groups.sort_by_key(|group| group.first().map(|&id| self.seq(id)));
        groups
    }

    /// Mark cells stale (or fresh).
    pub fn set_stale<'a>(&mut self, ids: impl IntoIterator<Item = &'a CellId>, stale: bool) {
        for id in ids {
            if let Some(cell) = self.cells.get_mut(id) {
                cell.set_stale(stale);
            }
        }
    }

    /// Stale cells in registration order.
    pub fn stale_cells(&self) -> Vec<CellId> {
        let mut stale: Vec<CellId> = self
            .cells
            .values()
            .filter(|c| c.is_stale())
            .map(Cell::id)
            .collect();
        stale.sort_by_key(|&id| self.seq(id));
        stale
    }

    /// Shortest path of edges from `from` to `to`, if any.
    fn path(&self, from: CellId, to: CellId) -> Option<Vec<Edge>> {
        if from == to {
            return Some(Vec::new());
        }
        let mut previous: FxHashMap<CellId, CellId> = FxHashMap::default();
        let mut queue = VecDeque::from([from]);
        while let Some(current) = queue.pop_front() {
            for &next in self.children_of(current) {
                if next == from || previous.contains_key(&next) {
                    continue;
                }
                previous.insert(next, current);
                if next == to {
                    let mut path = Vec::new();
                    let mut node = to;
                    while node != from {
                        let prev = previous[&node];
                        path.push((prev, node));
                        node = prev;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(next);
            }
        }
        None
    }

    fn seq(&self, id: CellId) -> u64 {
        self.sequence.get(&id).copied().unwrap_or(u64::MAX)
    }

    /// Get a cell by ID.
    pub fn cell(&self, id: CellId) -> Option<&Cell> {
        self.cells.get(&id)
    }

    /// Get a cell by ID, or `Error::CellNotFound`.
    pub fn get(&self, id: CellId) -> Result<&Cell> {
        self.cells.get(&id).ok_or(Error::CellNotFound(id))
    }

    pub(crate) fn cell_mut(&mut self, id: CellId) -> Result<&mut Cell> {
        self.cells.get_mut(&id).ok_or(Error::CellNotFound(id))
    }

    pub fn contains(&self, id: CellId) -> bool {
        self.cells.contains_key(&id)
    }

    /// All cells in registration order.
    pub fn cells(&self) -> Vec<&Cell> {
        let mut cells: Vec<&Cell> = self.cells.values().collect();
        cells.sort_by_key(|c| self.seq(c.id()));
        cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Direct children (cells reading a name this cell defines).
    pub fn children_of(&self, id: CellId) -> &BTreeSet<CellId> {
        self.children.get(&id).unwrap_or(&EMPTY)
    }

    /// Direct parents (cells defining a name this cell reads).
    pub fn parents_of(&self, id: CellId) -> &BTreeSet<CellId> {
        self.parents.get(&id).unwrap_or(&EMPTY)
    }

    /// Other cells defining a name this cell defines.
    pub fn siblings_of(&self, id: CellId) -> &BTreeSet<CellId> {
        self.siblings.get(&id).unwrap_or(&EMPTY)
    }

    /// Cells defining `name`.
    pub fn definers(&self, name: &str) -> &BTreeSet<CellId> {
        self.definitions.get(name).unwrap_or(&EMPTY)
    }

    pub fn definitions(&self) -> &BTreeMap<String, BTreeSet<CellId>> {
        &self.definitions
    }

    pub fn cycles(&self) -> &BTreeSet<Vec<Edge>> {
        &self.cycles
    }
}

fn link(map: &mut FxHashMap<CellId, BTreeSet<CellId>>, from: CellId, to: CellId) {
    map.entry(from).or_default().insert(to);
}

fn normalize_cycle(mut cycle: Vec<Edge>) -> Vec<Edge> {
    if let Some(start) = cycle
        .iter()
        .enumerate()
        .min_by_key(|(_, edge)| **edge)
        .map(|(i, _)| i)
    {
        cycle.rotate_left(start);
    }
    cycle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::CellBody;

    fn make_cell(defs: &[&str], refs: &[&str]) -> Cell {
        Cell::new(CellId::new(), String::new(), CellBody::empty())
            .defines(defs.iter().copied())
            .references(refs.iter().copied())
    }

    fn add(graph: &mut DependencyGraph, defs: &[&str], refs: &[&str]) -> CellId {
        let cell = make_cell(defs, refs);
        let id = cell.id();
        graph.register(cell).unwrap();
        id
    }

    fn assert_consistent(graph: &DependencyGraph) {
        for cell in graph.cells() {
            let u = cell.id();
            for &v in graph.children_of(u) {
                assert!(graph.parents_of(v).contains(&u));
            }
            for &p in graph.parents_of(u) {
                assert!(graph.children_of(p).contains(&u));
            }
            for other in graph.cells() {
                let v = other.id();
                if u == v {
                    continue;
                }
                let shares = cell.defs().intersection(other.refs()).next().is_some();
                assert_eq!(graph.children_of(u).contains(&v), shares);
            }
        }
    }

    #[test]
    fn test_empty_graph() {
        let graph = DependencyGraph::new();
        assert!(graph.is_empty());
        assert_eq!(graph.len(), 0);
    }

    #[test]
    fn test_register_links_both_directions() {
        let mut graph = DependencyGraph::new();
        // Reader registered before its definer
        let b = add(&mut graph, &["y"], &["x"]);
        let a = add(&mut graph, &["x"], &[]);

        assert!(graph.children_of(a).contains(&b));
        assert!(graph.parents_of(b).contains(&a));
        assert_consistent(&graph);
    }

    #[test]
    fn test_register_duplicate_id() {
        let mut graph = DependencyGraph::new();
        let cell = make_cell(&["x"], &[]);
        let id = cell.id();
        graph.register(cell).unwrap();
        let again = Cell::new(id, "", CellBody::empty());
        assert!(matches!(graph.register(again), Err(Error::DuplicateCell(d)) if d == id));
    }

    #[test]
    fn test_linear_dependencies() {
        let mut graph = DependencyGraph::new();
        let c = add(&mut graph, &["c"], &["b"]);
        let a = add(&mut graph, &["a"], &[]);
        let b = add(&mut graph, &["b"], &["a"]);

        let order = graph.topological_sort(&[a, b, c]);
        assert_eq!(order, vec![a, b, c]);
    }

    #[test]
    fn test_diamond_dependencies() {
        let mut graph = DependencyGraph::new();
        let a = add(&mut graph, &["a"], &[]);
        let b = add(&mut graph, &["b"], &["a"]);
        let c = add(&mut graph, &["c"], &["a"]);
        let d = add(&mut graph, &["d"], &["b", "c"]);

        let order = graph.topological_sort(&[d, c, b, a]);
        assert_eq!(order.first(), Some(&a));
        assert_eq!(order.last(), Some(&d));
        // Ties follow registration order
        assert_eq!(order, vec![a, b, c, d]);

        assert_eq!(graph.descendants(a), BTreeSet::from([b, c, d]));
        assert_eq!(graph.ancestors(d), BTreeSet::from([a, b, c]));
    }

    #[test]
    fn test_topological_sort_induced_subgraph() {
        let mut graph = DependencyGraph::new();
        let a = add(&mut graph, &["a"], &[]);
        let b = add(&mut graph, &["b"], &["a"]);
        let c = add(&mut graph, &["c"], &["b"]);

        // b is outside the subset, so a and c are unconstrained
        let order = graph.topological_sort(&[c, a]);
        assert_eq!(order, vec![a, c]);
        assert!(!order.contains(&b));
    }

    #[test]
    fn test_cycle_detection() {
        let mut graph = DependencyGraph::new();
        let a = add(&mut graph, &["a"], &["c"]);
        let b = add(&mut graph, &["b"], &["a"]);
        let c = add(&mut graph, &["c"], &["b"]);

        assert_eq!(graph.cycles().len(), 1);
        let cycle = graph.cycles().iter().next().unwrap();
        assert_eq!(cycle.len(), 3);

        let faults = graph.structural_faults();
        for id in [a, b, c] {
            assert!(matches!(faults[&id][0], Fault::Cycle { .. }));
        }
        assert_eq!(graph.cycle_groups(), vec![vec![a, b, c]]);

        // Sorting still returns every cell
        assert_eq!(graph.topological_sort(&[a, b, c]).len(), 3);
    }

    #[test]
    fn test_delete_breaks_cycle() {
        let mut graph = DependencyGraph::new();
        let a = add(&mut graph, &["x"], &["y"]);
        let b = add(&mut graph, &["y"], &["x"]);
        assert_eq!(graph.cycles().len(), 1);

        let (_, children) = graph.delete(b).unwrap();
        assert_eq!(children, BTreeSet::from([a]));
        assert!(graph.cycles().is_empty());
        assert!(graph.parents_of(a).is_empty());
        assert_consistent(&graph);
    }

    #[test]
    fn test_multiple_definitions() {
        let mut graph = DependencyGraph::new();
        let a = add(&mut graph, &["x"], &[]);
        let b = add(&mut graph, &["x"], &[]);
        let reader = add(&mut graph, &[], &["x"]);

        assert_eq!(graph.siblings_of(a), &BTreeSet::from([b]));
        assert_eq!(graph.parents_of(reader), &BTreeSet::from([a, b]));

        let faults = graph.structural_faults();
        assert_eq!(
            faults[&a],
            vec![Fault::MultipleDefinition { name: "x".into(), others: vec![b] }]
        );
        assert!(!faults.contains_key(&reader));

        graph.delete(b).unwrap();
        assert!(graph.siblings_of(a).is_empty());
        assert!(graph.structural_faults().is_empty());
    }

    #[test]
    fn test_delete_nonlocal() {
        let mut graph = DependencyGraph::new();
        let a = add(&mut graph, &["x"], &[]);
        let b = Cell::new(CellId::new(), "del x", CellBody::empty()).deletes(["x"]);
        let b_id = b.id();
        graph.register(b).unwrap();

        let faults = graph.structural_faults();
        assert_eq!(
            faults[&b_id],
            vec![Fault::DeleteNonlocal { name: "x".into(), defined_by: vec![a] }]
        );
        assert!(!faults.contains_key(&a));
    }

    #[test]
    fn test_register_then_delete_restores_state() {
        let mut graph = DependencyGraph::new();
        let a = add(&mut graph, &["x"], &[]);
        let b = add(&mut graph, &["y"], &["x"]);
        let definitions = graph.definitions().clone();
        let cycles = graph.cycles().clone();

        let c = add(&mut graph, &["x", "z"], &["y"]);
        graph.delete(c).unwrap();

        assert_eq!(graph.definitions(), &definitions);
        assert_eq!(graph.cycles(), &cycles);
        assert_eq!(graph.children_of(a), &BTreeSet::from([b]));
        assert_eq!(graph.parents_of(b), &BTreeSet::from([a]));
        assert!(graph.siblings_of(a).is_empty());
        assert_consistent(&graph);
    }

    #[test]
    fn test_replace_keeps_position() {
        let mut graph = DependencyGraph::new();
        let a = add(&mut graph, &["a"], &[]);
        let b = add(&mut graph, &["b"], &[]);

        graph.disable(a).unwrap();
        let edited = Cell::new(a, "a = 2", CellBody::empty()).defines(["a"]);
        let previous = graph.replace(edited).unwrap();
        assert!(previous.is_some());
        assert!(graph.get(a).unwrap().is_user_disabled());

        let ids: Vec<CellId> = graph.cells().iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn test_disable_and_enable() {
        let mut graph = DependencyGraph::new();
        let a = add(&mut graph, &["x"], &[]);
        let b = add(&mut graph, &["y"], &["x"]);
        let c = add(&mut graph, &[], &["y"]);

        graph.disable(a).unwrap();
        assert!(graph.is_disabled(a));
        assert_eq!(graph.get(b).unwrap().status(), CellStatus::DisabledTransitively);
        assert_eq!(graph.get(c).unwrap().status(), CellStatus::DisabledTransitively);

        // A cell registered below a disabled cell starts disabled
        let d = add(&mut graph, &[], &["x"]);
        assert_eq!(graph.get(d).unwrap().status(), CellStatus::DisabledTransitively);

        graph.set_stale(&[a, c], true);
        let to_run = graph.enable(a).unwrap();
        assert_eq!(to_run, BTreeSet::from([a, c]));
        assert_eq!(graph.get(b).unwrap().status(), CellStatus::Idle);
        assert_eq!(graph.children_of(a), &BTreeSet::from([b, d]));
    }

    #[test]
    fn test_enable_respects_other_disabled_ancestor() {
        let mut graph = DependencyGraph::new();
        let a = add(&mut graph, &["x"], &[]);
        let b = add(&mut graph, &["y"], &[]);
        let c = add(&mut graph, &[], &["x", "y"]);

        graph.disable(a).unwrap();
        graph.disable(b).unwrap();
        graph.enable(a).unwrap();
        assert!(graph.is_disabled(c));
        assert_eq!(graph.get(c).unwrap().status(), CellStatus::DisabledTransitively);
    }

    #[test]
    fn test_stale_propagates_on_register() {
        let mut graph = DependencyGraph::new();
        let a = add(&mut graph, &["x"], &[]);
        graph.set_stale(&[a], true);
        let b = add(&mut graph, &[], &["x"]);
        assert!(graph.get(b).unwrap().is_stale());
        assert_eq!(graph.stale_cells(), vec![a, b]);
    }

    #[test]
    fn test_transitive_references() {
        let mut graph = DependencyGraph::new();
        let helper = Cell::new(CellId::new(), "", CellBody::empty())
            .defines(["f", "unused"])
            .references(["data", "other"])
            .with_name_deps("f", ["data"]);
        graph.register(helper).unwrap();
        add(&mut graph, &["data"], &["raw"]);

        let names = vec!["f".to_string()];
        let all = graph.transitive_references(&names, |_| true);
        assert_eq!(
            all,
            BTreeSet::from(["f".to_string(), "data".to_string(), "raw".to_string()])
        );

        let halted = graph.transitive_references(&names, |name| name != "data");
        assert_eq!(halted, BTreeSet::from(["f".to_string(), "data".to_string()]));
    }

    #[test]
    fn test_ancestors_of_descendants_contains_self() {
        let mut graph = DependencyGraph::new();
        let a = add(&mut graph, &["x"], &[]);
        add(&mut graph, &["y"], &["x"]);
        add(&mut graph, &[], &["y"]);

        for d in graph.descendants(a) {
            assert!(graph.ancestors(d).contains(&a));
        }
    }
}
