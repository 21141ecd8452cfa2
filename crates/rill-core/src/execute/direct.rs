//! Direct execution against the shared namespace.

use super::context::Scope;
use super::strategy::ExecutionStrategy;
use crate::graph::{Cell, DependencyGraph, Fault};
use crate::state::Namespace;

/// Runs cells against the namespace values as they are.
///
/// Containers are aliased, so a body that mutates one of its inputs in
/// place mutates it for every cell. Fast, and offers no protection against
/// undeclared cross-cell mutation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Direct;

impl Direct {
    pub fn new() -> Self {
        Self
    }
}

impl ExecutionStrategy for Direct {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn prepare(&self, cell: &Cell, namespace: &Namespace, _graph: &DependencyGraph) -> Result<Scope, Fault> {
        let mut scope = Scope::for_cell(cell);
        for name in cell.refs() {
            if let Some(value) = namespace.get(name) {
                scope.insert_input(name.clone(), value.clone());
            }
        }
        Ok(scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execute::{AbortHandle, CellError, Outcome};
    use crate::graph::{CellBody, CellId};
    use crate::state::Value;

    fn register(graph: &mut DependencyGraph, cell: Cell) -> CellId {
        let id = cell.id();
        graph.register(cell).unwrap();
        id
    }

    #[test]
    fn test_binds_only_declared_definitions() {
        let mut graph = DependencyGraph::new();
        let id = register(
            &mut graph,
            Cell::new(
                CellId::new(),
                "x = 1; tmp = 2",
                CellBody::blocking(|scope| {
                    scope.set("x", 1_i64);
                    scope.set("tmp", 2_i64);
                    Ok(Some(Value::Int(3)))
                }),
            )
            .defines(["x"]),
        );

        let mut ns = Namespace::new();
        let record = Direct.execute(graph.get(id).unwrap(), &mut ns, &graph, &AbortHandle::new());
        assert_eq!(record.outcome, Outcome::Success);
        assert_eq!(record.output, Some(Value::Int(3)));
        assert_eq!(ns.get("x"), Some(&Value::Int(1)));
        assert!(!ns.contains("tmp"));
    }

    #[test]
    fn test_aliases_containers() {
        let mut graph = DependencyGraph::new();
        let id = register(
            &mut graph,
            Cell::new(
                CellId::new(),
                "xs.append(2)",
                CellBody::blocking(|scope| {
                    scope.get("xs")?.push(Value::Int(2))?;
                    Ok(None)
                }),
            )
            .references(["xs"]),
        );

        let xs = Value::list([Value::Int(1)]);
        let mut ns: Namespace = [("xs", xs.clone())].into_iter().collect();
        Direct.execute(graph.get(id).unwrap(), &mut ns, &graph, &AbortHandle::new());
        assert_eq!(xs.len(), Some(2));
    }

    #[test]
    fn test_unresolved_name_classification() {
        let mut graph = DependencyGraph::new();
        let reader = |name: &'static str| {
            Cell::new(
                CellId::new(),
                name,
                CellBody::blocking(move |scope| scope.get(name).map(Some)),
            )
            .references([name])
        };
        let definer = register(&mut graph, Cell::new(CellId::new(), "x = 1", CellBody::empty()).defines(["x"]));
        let missing = register(&mut graph, reader("x"));
        let undefined = register(&mut graph, reader("nope"));

        let mut ns = Namespace::new();
        let abort = AbortHandle::new();
        let record = Direct.execute(graph.get(missing).unwrap(), &mut ns, &graph, &abort);
        assert_eq!(
            record.fault(),
            Some(&Fault::MissingReference { name: "x".into(), definers: vec![definer] })
        );

        let record = Direct.execute(graph.get(undefined).unwrap(), &mut ns, &graph, &abort);
        assert_eq!(record.fault(), Some(&Fault::UndefinedName { name: "nope".into() }));
    }

    #[test]
    fn test_blocking_entry_refuses_suspending_cell() {
        let mut graph = DependencyGraph::new();
        let id = register(
            &mut graph,
            Cell::new(
                CellId::new(),
                "await f()",
                CellBody::suspending(|scope| async move { (scope, Ok(None)) }),
            ),
        );
        let mut ns = Namespace::new();
        let record = Direct.execute(graph.get(id).unwrap(), &mut ns, &graph, &AbortHandle::new());
        assert_eq!(record.fault(), Some(&Fault::RequiresSuspension));
    }

    #[test]
    fn test_panic_becomes_exception() {
        let mut graph = DependencyGraph::new();
        let id = register(
            &mut graph,
            Cell::new(CellId::new(), "boom", CellBody::blocking(|_| panic!("boom"))),
        );
        let mut ns = Namespace::new();
        let record = Direct.execute(graph.get(id).unwrap(), &mut ns, &graph, &AbortHandle::new());
        assert!(matches!(record.fault(), Some(Fault::Exception { message }) if message.contains("boom")));
    }

    #[test]
    fn test_stop_commits_and_reports_output() {
        let mut graph = DependencyGraph::new();
        let id = register(
            &mut graph,
            Cell::new(
                CellId::new(),
                "x = 1; stop",
                CellBody::blocking(|scope| {
                    scope.set("x", 1_i64);
                    Err(CellError::Stop(Some(Value::str("halted"))))
                }),
            )
            .defines(["x"]),
        );
        let mut ns = Namespace::new();
        let record = Direct.execute(graph.get(id).unwrap(), &mut ns, &graph, &AbortHandle::new());
        assert_eq!(record.outcome, Outcome::Stopped);
        assert_eq!(record.output, Some(Value::str("halted")));
        assert_eq!(ns.get("x"), Some(&Value::Int(1)));
    }

    #[tokio::test]
    async fn test_suspending_entry_runs_both_kinds() {
        let mut graph = DependencyGraph::new();
        let a = register(
            &mut graph,
            Cell::new(
                CellId::new(),
                "x = await one()",
                CellBody::suspending(|mut scope| async move {
                    tokio::task::yield_now().await;
                    scope.set("x", 1_i64);
                    (scope, Ok(None))
                }),
            )
            .defines(["x"]),
        );
        let b = register(
            &mut graph,
            Cell::new(
                CellId::new(),
                "y = x + 1",
                CellBody::blocking(|scope| {
                    let x = scope.get("x")?.as_int().unwrap_or_default();
                    scope.set("y", x + 1);
                    Ok(None)
                }),
            )
            .defines(["y"])
            .references(["x"]),
        );

        let mut ns = Namespace::new();
        let abort = AbortHandle::new();
        for id in [a, b] {
            let record = Direct
                .execute_suspending(graph.get(id).unwrap(), &mut ns, &graph, &abort)
                .await;
            assert!(record.is_success());
        }
        assert_eq!(ns.get("y"), Some(&Value::Int(2)));
    }
}
