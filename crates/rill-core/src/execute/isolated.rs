//! Isolated execution on private copies of a cell's inputs.

use super::context::Scope;
use super::strategy::ExecutionStrategy;
use crate::graph::{Cell, DependencyGraph, Fault};
use crate::state::{DuplicationRegistry, Namespace, Value, ValueKind};

/// Runs each cell against deep copies of the values it can reach.
///
/// The inputs are the transitive reference closure of the cell's free
/// names. Functions, modules and primitive values are passed through
/// unchanged; everything else is copied through the [`DuplicationRegistry`],
/// honouring `NoCopy` and `ShallowCopy` markers. The shared namespace is
/// only touched when the cell's declared definitions are committed back.
#[derive(Clone, Default)]
pub struct Isolated {
    registry: DuplicationRegistry,
}

impl Isolated {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a registry with host object kinds registered.
    pub fn with_registry(registry: DuplicationRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &DuplicationRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut DuplicationRegistry {
        &mut self.registry
    }

    fn isolate(&self, name: &str, value: &Value) -> Result<Value, Fault> {
        if value.kind().is_safe() {
            return Ok(value.clone());
        }
        self.registry.duplicate(value).map_err(|e| Fault::Duplication {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }
}

impl ExecutionStrategy for Isolated {
    fn name(&self) -> &'static str {
        "isolated"
    }

    fn prepare(&self, cell: &Cell, namespace: &Namespace, graph: &DependencyGraph) -> Result<Scope, Fault> {
        // Expansion stops at values that cannot reach other names
        let reachable = graph.transitive_references(cell.refs(), |name| {
            namespace.get(name).is_none_or(|value| {
                let kind = value.kind();
                !kind.is_primitive() && kind != ValueKind::Module
            })
        });

        let mut scope = Scope::for_cell(cell);
        for name in &reachable {
            if let Some(value) = namespace.get(name) {
                scope.insert_input(name.clone(), self.isolate(name, value)?);
            }
        }
        tracing::debug!("isolated {} with {} input(s)", cell.id(), reachable.len());
        Ok(scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execute::AbortHandle;
    use crate::graph::{CellBody, CellId};

    fn mutator(name: &'static str) -> Cell {
        Cell::new(
            CellId::new(),
            "xs.append(99)",
            CellBody::blocking(move |scope| {
                scope.get(name)?.push(Value::Int(99))?;
                Ok(None)
            }),
        )
        .references([name])
    }

    #[test]
    fn test_mutation_does_not_leak() {
        let mut graph = DependencyGraph::new();
        let cell = mutator("xs");
        let id = cell.id();
        graph.register(cell).unwrap();

        let xs = Value::list([Value::Int(1)]);
        let mut ns: Namespace = [("xs", xs.clone())].into_iter().collect();
        let record = Isolated::new().execute(graph.get(id).unwrap(), &mut ns, &graph, &AbortHandle::new());

        assert!(record.is_success());
        assert_eq!(xs.len(), Some(1));
        assert!(ns.get("xs").unwrap().same_storage(&xs));
    }

    #[test]
    fn test_no_copy_is_shared() {
        let mut graph = DependencyGraph::new();
        let cell = mutator("xs");
        let id = cell.id();
        graph.register(cell).unwrap();

        let xs = Value::list([Value::Int(1)]).no_copy();
        let mut ns: Namespace = [("xs", xs.clone())].into_iter().collect();
        Isolated::new().execute(graph.get(id).unwrap(), &mut ns, &graph, &AbortHandle::new());
        assert_eq!(xs.len(), Some(2));
    }

    #[derive(Clone)]
    struct Handle;

    #[test]
    fn test_unregistered_object_faults_locally() {
        let mut graph = DependencyGraph::new();
        let cell = Cell::new(CellId::new(), "use(h)", CellBody::empty()).references(["h"]);
        let id = cell.id();
        graph.register(cell).unwrap();

        let mut ns: Namespace = [("h", Value::object("handle", Handle))].into_iter().collect();
        let record = Isolated::new().execute(graph.get(id).unwrap(), &mut ns, &graph, &AbortHandle::new());
        assert!(matches!(record.fault(), Some(Fault::Duplication { name, .. }) if name == "h"));

        let mut registry = DuplicationRegistry::new();
        registry.register_clone::<Handle>("handle");
        let record = Isolated::with_registry(registry).execute(graph.get(id).unwrap(), &mut ns, &graph, &AbortHandle::new());
        assert!(record.is_success());
    }

    #[test]
    fn test_previous_definition_is_flushed() {
        let mut graph = DependencyGraph::new();
        let cell = Cell::new(
            CellId::new(),
            "if cond: x = 1",
            CellBody::blocking(|scope| {
                if scope.get("cond")?.as_bool() == Some(true) {
                    scope.set("x", 1_i64);
                }
                Ok(None)
            }),
        )
        .defines(["x"])
        .references(["cond"]);
        let id = cell.id();
        graph.register(cell).unwrap();

        let strategy = Isolated::new();
        let abort = AbortHandle::new();
        let mut ns: Namespace = [("cond", Value::Bool(true))].into_iter().collect();
        strategy.execute(graph.get(id).unwrap(), &mut ns, &graph, &abort);
        assert_eq!(ns.get("x"), Some(&Value::Int(1)));

        ns.insert("cond", Value::Bool(false));
        strategy.execute(graph.get(id).unwrap(), &mut ns, &graph, &abort);
        assert!(!ns.contains("x"));
    }

    #[test]
    fn test_copies_transitive_inputs() {
        let mut graph = DependencyGraph::new();
        // `total` is computed from `data`; a reader of `total` also gets `data`
        let producer = Cell::new(CellId::new(), "", CellBody::empty())
            .defines(["total"])
            .references(["data"])
            .with_name_deps("total", ["data"]);
        graph.register(producer).unwrap();
        let reader = Cell::new(
            CellId::new(),
            "data.append(0)",
            CellBody::blocking(|scope| {
                scope.get("data")?.push(Value::Int(0))?;
                Ok(None)
            }),
        )
        .references(["total"]);
        let id = reader.id();
        graph.register(reader).unwrap();

        let data = Value::list([]);
        let mut ns: Namespace = [("total", Value::list([])), ("data", data.clone())]
            .into_iter()
            .collect();
        let record = Isolated::new().execute(graph.get(id).unwrap(), &mut ns, &graph, &AbortHandle::new());
        assert!(record.is_success());
        assert_eq!(data.len(), Some(0));
    }
}
