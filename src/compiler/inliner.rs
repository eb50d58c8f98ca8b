//! Call graph construction and recursion detection
//!
//! Ordinary calls are always inlined, so every program needs an acyclic call
//! graph. The graph is built from the entry function over ordinary functions
//! and other entry functions; helper calls are leaves and do not appear.

use super::resolver::ResolvedUnit;
use crate::error::{SemanticError, SemanticErrorKind};
use crate::parser::{Expr, ExprKind, FunctionDef, Initializer, Location, Stmt, StmtKind};
use std::collections::{BTreeMap, HashSet};

/// A call from one function to another, at a source location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEdge {
    /// Called function
    pub callee: String,
    /// First call site
    pub location: Location,
}

/// Call graph reachable from one program
#[derive(Debug, Clone, Default)]
pub struct CallGraph {
    root: String,
    edges: BTreeMap<String, Vec<CallEdge>>,
}

impl CallGraph {
    /// Build the graph reachable from `root`
    pub fn build(unit: &ResolvedUnit, root: &str) -> CallGraph {
        let mut graph = CallGraph {
            root: root.to_string(),
            edges: BTreeMap::new(),
        };
        let mut worklist = vec![root.to_string()];
        while let Some(name) = worklist.pop() {
            if graph.edges.contains_key(&name) {
                continue;
            }
            let Some(def) = unit.function(&name) else {
                continue;
            };
            let mut edges: Vec<CallEdge> = Vec::new();
            visit_calls(&def.body, &mut |callee, location| {
                if unit.function(callee).is_some() && !edges.iter().any(|e| e.callee == callee) {
                    edges.push(CallEdge {
                        callee: callee.to_string(),
                        location,
                    });
                }
            });
            for edge in edges.iter().rev() {
                worklist.push(edge.callee.clone());
            }
            graph.edges.insert(name, edges);
        }
        graph
    }

    /// Entry function the graph was built from
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Direct callees of `name` in call order
    pub fn callees(&self, name: &str) -> &[CallEdge] {
        self.edges.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Functions reachable from the root, the root included
    pub fn functions(&self) -> impl Iterator<Item = &String> {
        self.edges.keys()
    }

    /// First cycle found by depth-first search from the root
    ///
    /// Returns the cycle as a path that starts and ends at the same function,
    /// along with the call site that closes it.
    pub fn find_cycle(&self) -> Option<(Vec<String>, Location)> {
        let mut done = HashSet::new();
        let mut path = Vec::new();
        self.dfs(&self.root, &mut path, &mut done)
    }

    fn dfs<'a>(
        &'a self,
        name: &'a str,
        path: &mut Vec<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> Option<(Vec<String>, Location)> {
        path.push(name);
        for edge in self.callees(name) {
            if let Some(start) = path.iter().position(|f| *f == edge.callee) {
                let mut cycle: Vec<String> = path[start..].iter().map(|f| f.to_string()).collect();
                cycle.push(edge.callee.clone());
                return Some((cycle, edge.location));
            }
            if done.contains(edge.callee.as_str()) {
                continue;
            }
            if let Some(found) = self.dfs(&edge.callee, path, done) {
                return Some(found);
            }
        }
        path.pop();
        done.insert(name);
        None
    }
}

/// Build the call graph of a program and reject recursion
pub fn check_program(unit: &ResolvedUnit, entry: &str) -> Result<CallGraph, SemanticError> {
    let graph = CallGraph::build(unit, entry);
    if let Some((cycle, location)) = graph.find_cycle() {
        return Err(SemanticError::new(
            SemanticErrorKind::UnsupportedRecursion,
            format!(
                "call cycle reachable from `{}`: {}",
                entry,
                cycle.join(" -> ")
            ),
            location,
        ));
    }
    tracing::debug!(
        program = entry,
        functions = graph.edges.len(),
        "call graph is acyclic"
    );
    Ok(graph)
}

/// Pair a callee's parameters with call arguments, checking arity
pub fn bind_arguments<'a>(
    callee: &'a FunctionDef,
    args: &'a [Expr],
    location: Location,
) -> Result<Vec<(&'a str, &'a Expr)>, SemanticError> {
    if callee.params.len() != args.len() {
        return Err(SemanticError::new(
            SemanticErrorKind::UnsupportedConstruct,
            format!(
                "function `{}` takes {} argument(s) but {} were given",
                callee.name,
                callee.params.len(),
                args.len()
            ),
            location,
        ));
    }
    callee
        .params
        .iter()
        .zip(args)
        .map(|(param, arg)| match &param.name {
            Some(name) => Ok((name.as_str(), arg)),
            None => Err(SemanticError::new(
                SemanticErrorKind::UnsupportedConstruct,
                format!("parameter of `{}` has no name", callee.name),
                param.loc,
            )),
        })
        .collect()
}

/// Call `f` for every direct call in a statement list, in source order
pub fn visit_calls(stmts: &[Stmt], f: &mut dyn FnMut(&str, Location)) {
    for stmt in stmts {
        visit_stmt(stmt, f);
    }
}

fn visit_stmt(stmt: &Stmt, f: &mut dyn FnMut(&str, Location)) {
    match &stmt.kind {
        StmtKind::Decl(decls) => {
            for decl in decls {
                if let Some(init) = &decl.init {
                    visit_init(init, f);
                }
            }
        }
        StmtKind::Expr(expr) => visit_expr(expr, f),
        StmtKind::Block(stmts) => visit_calls(stmts, f),
        StmtKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            visit_expr(cond, f);
            visit_stmt(then_branch, f);
            if let Some(else_branch) = else_branch {
                visit_stmt(else_branch, f);
            }
        }
        StmtKind::While { cond, body } | StmtKind::DoWhile { body, cond } => {
            visit_expr(cond, f);
            visit_stmt(body, f);
        }
        StmtKind::For {
            init,
            cond,
            step,
            body,
        } => {
            if let Some(init) = init {
                visit_stmt(init, f);
            }
            for expr in cond.iter().chain(step.iter()) {
                visit_expr(expr, f);
            }
            visit_stmt(body, f);
        }
        StmtKind::Return(Some(expr)) => visit_expr(expr, f),
        StmtKind::Return(None) | StmtKind::Break | StmtKind::Continue | StmtKind::Empty => {}
    }
}

fn visit_init(init: &Initializer, f: &mut dyn FnMut(&str, Location)) {
    match init {
        Initializer::Expr(expr) => visit_expr(expr, f),
        Initializer::List { items, .. } => {
            for item in items {
                visit_init(&item.value, f);
            }
        }
    }
}

fn visit_expr(expr: &Expr, f: &mut dyn FnMut(&str, Location)) {
    match &expr.kind {
        ExprKind::Call { callee, args } => {
            for arg in args {
                visit_expr(arg, f);
            }
            f(callee, expr.loc);
        }
        ExprKind::Unary { operand, .. } => visit_expr(operand, f),
        ExprKind::Binary { lhs, rhs, .. } | ExprKind::Comma(lhs, rhs) => {
            visit_expr(lhs, f);
            visit_expr(rhs, f);
        }
        ExprKind::Assign { target, value, .. } => {
            visit_expr(target, f);
            visit_expr(value, f);
        }
        ExprKind::Conditional {
            cond,
            then_expr,
            else_expr,
        } => {
            visit_expr(cond, f);
            visit_expr(then_expr, f);
            visit_expr(else_expr, f);
        }
        ExprKind::Member { base, .. } => visit_expr(base, f),
        ExprKind::Index { base, index } => {
            visit_expr(base, f);
            visit_expr(index, f);
        }
        ExprKind::Cast { expr, .. } | ExprKind::IncDec { target: expr, .. } => visit_expr(expr, f),
        // sizeof operands are not evaluated
        ExprKind::SizeofExpr(_) | ExprKind::SizeofType(_) => {}
        ExprKind::IntLiteral { .. }
        | ExprKind::CharLiteral(_)
        | ExprKind::StringLiteral(_)
        | ExprKind::Ident(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::resolver::resolve;
    use crate::compiler::CompileOptions;
    use crate::parser::parse_source;

    fn unit(source: &str) -> ResolvedUnit {
        resolve(
            &parse_source(source).unwrap(),
            "t.bpf.c",
            &CompileOptions::default(),
        )
    }

    #[test]
    fn test_acyclic_graph() {
        let unit = unit(
            "static int leaf(int x) { return x + 1; }\n\
             static int mid(int x) { return leaf(x) + leaf(2); }\n\
             SEC(\"xdp\") int prog(void *ctx) { bpf_printk(\"hi\"); return mid(1); }",
        );
        let graph = check_program(&unit, "prog").unwrap();
        assert_eq!(graph.callees("prog").len(), 1);
        assert_eq!(graph.callees("mid").len(), 1);
        assert_eq!(graph.functions().count(), 3);
    }

    #[test]
    fn test_mutual_recursion_through_entry() {
        let unit = unit(
            "SEC(\"xdp\") int first(void *ctx) { return 2; }\n\
             static int ping(void *ctx);\n\
             SEC(\"xdp\") int second(void *ctx) { return ping(ctx); }\n\
             static int ping(void *ctx) { return second(ctx); }",
        );
        assert!(check_program(&unit, "first").is_ok());
        let err = check_program(&unit, "second").unwrap_err();
        assert_eq!(err.kind, SemanticErrorKind::UnsupportedRecursion);
        assert!(err.message.contains("second -> ping -> second"));
    }

    #[test]
    fn test_self_recursion() {
        let unit = unit(
            "static int fact(int n) { return n ? n * fact(n - 1) : 1; }\n\
             SEC(\"xdp\") int prog(void *ctx) { return fact(3); }",
        );
        let err = check_program(&unit, "prog").unwrap_err();
        assert!(err.message.contains("fact -> fact"));
        assert_eq!(err.location.line, 1);
    }

    #[test]
    fn test_bind_arguments_arity() {
        let unit = unit("static int add(int a, int b) { return a + b; }");
        let def = unit.function("add").unwrap();
        let args = vec![Expr::new(ExprKind::Ident("x".to_string()), Location::new(1, 1))];
        let err = bind_arguments(def, &args, Location::new(3, 4)).unwrap_err();
        assert_eq!(err.kind, SemanticErrorKind::UnsupportedConstruct);
    }
}
