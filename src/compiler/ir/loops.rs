//! Static trip bounds for loops
//!
//! A loop is accepted only when it has the shape of a counted loop: one
//! counter compared against a constant, moved by a constant step in the
//! direction of the comparison, and written nowhere else. The initial value
//! is supplied by the caller, which knows the counter's slot.

use crate::compiler::const_eval::{self, ConstEnv};
use crate::compiler::types::IntType;
use crate::parser::{BinaryOp, Expr, ExprKind, Initializer, Stmt, StmtKind, UnaryOp};

/// Loop statement form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    /// `for (init; cond; step)`
    For,
    /// `while (cond)`
    While,
    /// `do ... while (cond)`
    DoWhile,
}

/// Counter, comparison and step of a counted loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopShape<'a> {
    /// Counter variable
    pub counter: &'a str,
    /// Comparison with the counter on the left
    pub cmp: BinaryOp,
    /// Constant the counter is compared against
    pub limit: i64,
    /// Signed step per iteration
    pub step: i64,
}

/// Recognize a counted loop
///
/// `step` is the `for` step clause; `while` loops must step the counter in a
/// top-level statement of the body instead.
pub fn analyze<'a>(
    kind: LoopKind,
    cond: Option<&'a Expr>,
    step: Option<&'a Expr>,
    body: &'a Stmt,
    env: &dyn ConstEnv,
) -> Result<LoopShape<'a>, String> {
    let cond = cond.ok_or_else(|| "loop has no condition".to_string())?;
    let (counter, cmp, limit) = comparison(cond, env).ok_or_else(|| {
        "loop condition does not compare a counter against a constant".to_string()
    })?;

    let (step, allowed_writes) = match kind {
        LoopKind::For => {
            let step = step
                .and_then(|s| step_of(s, counter, env))
                .ok_or_else(|| format!("loop does not step `{}` by a constant", counter))?;
            (step, 0)
        }
        LoopKind::While | LoopKind::DoWhile => {
            if contains_continue(body) {
                return Err(format!(
                    "`continue` may skip the update of loop counter `{}`",
                    counter
                ));
            }
            let steps: Vec<i64> = top_level(body)
                .iter()
                .filter_map(|stmt| match &stmt.kind {
                    StmtKind::Expr(expr) => step_of(expr, counter, env),
                    _ => None,
                })
                .collect();
            match steps.as_slice() {
                [step] => (*step, 1),
                _ => {
                    return Err(format!(
                        "loop body does not step `{}` by a constant exactly once",
                        counter
                    ))
                }
            }
        }
    };

    let mut writes = 0;
    let mut escapes = false;
    walk_stmt(body, &mut |expr| match &expr.kind {
        ExprKind::Assign { target, .. } | ExprKind::IncDec { target, .. }
            if target.as_ident() == Some(counter) =>
        {
            writes += 1
        }
        ExprKind::Unary {
            op: UnaryOp::AddrOf,
            operand,
        } if operand.as_ident() == Some(counter) => escapes = true,
        _ => {}
    });
    if escapes {
        return Err(format!("address of loop counter `{}` escapes", counter));
    }
    if writes != allowed_writes {
        return Err(format!("loop counter `{}` is written inside the body", counter));
    }

    let direction_ok = match cmp {
        BinaryOp::Lt | BinaryOp::Le => step > 0,
        BinaryOp::Gt | BinaryOp::Ge => step < 0,
        BinaryOp::Ne => step != 0,
        _ => false,
    };
    if !direction_ok {
        return Err(format!(
            "step {} of `{}` never satisfies `{} {}`",
            step, counter, cmp, limit
        ));
    }

    Ok(LoopShape {
        counter,
        cmp,
        limit,
        step,
    })
}

/// Number of times the body runs, or `None` when the counter would wrap
/// or skip past the limit
pub fn trip_count(shape: &LoopShape<'_>, init: i64, ty: IntType, do_while: bool) -> Option<u64> {
    let init = i128::from(init);
    let limit = i128::from(shape.limit);
    let step = i128::from(shape.step);
    if !ty.fits(init) || !ty.fits(limit) {
        return None;
    }

    let trips: i128 = match shape.cmp {
        BinaryOp::Lt if init >= limit => 0,
        BinaryOp::Lt => (limit - init + step - 1) / step,
        BinaryOp::Le if init > limit => 0,
        BinaryOp::Le => (limit - init) / step + 1,
        BinaryOp::Gt if init <= limit => 0,
        BinaryOp::Gt => (init - limit + (-step) - 1) / -step,
        BinaryOp::Ge if init < limit => 0,
        BinaryOp::Ge => (init - limit) / -step + 1,
        BinaryOp::Ne => {
            let distance = limit - init;
            if distance % step != 0 || distance / step < 0 {
                return None;
            }
            distance / step
        }
        _ => return None,
    };

    // the counter's final value must be representable, or it wraps around
    if !ty.fits(init + trips * step) {
        return None;
    }
    let trips = if do_while { trips.max(1) } else { trips };
    u64::try_from(trips).ok()
}

fn comparison<'a>(cond: &'a Expr, env: &dyn ConstEnv) -> Option<(&'a str, BinaryOp, i64)> {
    let ExprKind::Binary { op, lhs, rhs } = &cond.kind else {
        return None;
    };
    if !op.is_comparison() || *op == BinaryOp::Eq {
        return None;
    }
    if let Some(counter) = lhs.as_ident() {
        if let Some(limit) = const_eval::eval(rhs, env) {
            return Some((counter, *op, limit.value));
        }
    }
    let counter = rhs.as_ident()?;
    let limit = const_eval::eval(lhs, env)?;
    Some((counter, op.swapped(), limit.value))
}

fn step_of(expr: &Expr, counter: &str, env: &dyn ConstEnv) -> Option<i64> {
    match &expr.kind {
        ExprKind::IncDec {
            target, increment, ..
        } if target.as_ident() == Some(counter) => Some(if *increment { 1 } else { -1 }),
        ExprKind::Assign { op, target, value } if target.as_ident() == Some(counter) => {
            match op {
                Some(BinaryOp::Add) => Some(const_eval::eval(value, env)?.value),
                Some(BinaryOp::Sub) => Some(const_eval::eval(value, env)?.value.checked_neg()?),
                None => match &value.kind {
                    ExprKind::Binary {
                        op: BinaryOp::Add,
                        lhs,
                        rhs,
                    } => {
                        if lhs.as_ident() == Some(counter) {
                            Some(const_eval::eval(rhs, env)?.value)
                        } else if rhs.as_ident() == Some(counter) {
                            Some(const_eval::eval(lhs, env)?.value)
                        } else {
                            None
                        }
                    }
                    ExprKind::Binary {
                        op: BinaryOp::Sub,
                        lhs,
                        rhs,
                    } if lhs.as_ident() == Some(counter) => {
                        Some(const_eval::eval(rhs, env)?.value.checked_neg()?)
                    }
                    _ => None,
                },
                _ => None,
            }
        }
        _ => None,
    }
}

fn top_level(body: &Stmt) -> &[Stmt] {
    match &body.kind {
        StmtKind::Block(stmts) => stmts,
        _ => std::slice::from_ref(body),
    }
}

/// `continue` that belongs to this loop (nested loops own theirs)
fn contains_continue(stmt: &Stmt) -> bool {
    match &stmt.kind {
        StmtKind::Continue => true,
        StmtKind::Block(stmts) => stmts.iter().any(contains_continue),
        StmtKind::If {
            then_branch,
            else_branch,
            ..
        } => {
            contains_continue(then_branch)
                || else_branch.as_deref().is_some_and(contains_continue)
        }
        _ => false,
    }
}

fn walk_stmt(stmt: &Stmt, f: &mut dyn FnMut(&Expr)) {
    match &stmt.kind {
        StmtKind::Decl(decls) => {
            for decl in decls {
                if let Some(init) = &decl.init {
                    walk_init(init, f);
                }
            }
        }
        StmtKind::Expr(expr) => walk_expr(expr, f),
        StmtKind::Block(stmts) => {
            for stmt in stmts {
                walk_stmt(stmt, f);
            }
        }
        StmtKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            walk_expr(cond, f);
            walk_stmt(then_branch, f);
            if let Some(else_branch) = else_branch {
                walk_stmt(else_branch, f);
            }
        }
        StmtKind::While { cond, body } | StmtKind::DoWhile { body, cond } => {
            walk_expr(cond, f);
            walk_stmt(body, f);
        }
        StmtKind::For {
            init,
            cond,
            step,
            body,
        } => {
            if let Some(init) = init {
                walk_stmt(init, f);
            }
            for expr in cond.iter().chain(step.iter()) {
                walk_expr(expr, f);
            }
            walk_stmt(body, f);
        }
        StmtKind::Return(Some(expr)) => walk_expr(expr, f),
        StmtKind::Return(None) | StmtKind::Break | StmtKind::Continue | StmtKind::Empty => {}
    }
}

fn walk_init(init: &Initializer, f: &mut dyn FnMut(&Expr)) {
    match init {
        Initializer::Expr(expr) => walk_expr(expr, f),
        Initializer::List { items, .. } => {
            for item in items {
                walk_init(&item.value, f);
            }
        }
    }
}

fn walk_expr(expr: &Expr, f: &mut dyn FnMut(&Expr)) {
    f(expr);
    match &expr.kind {
        ExprKind::Unary { operand, .. } => walk_expr(operand, f),
        ExprKind::Binary { lhs, rhs, .. } | ExprKind::Comma(lhs, rhs) => {
            walk_expr(lhs, f);
            walk_expr(rhs, f);
        }
        ExprKind::Assign { target, value, .. } => {
            walk_expr(target, f);
            walk_expr(value, f);
        }
        ExprKind::Conditional {
            cond,
            then_expr,
            else_expr,
        } => {
            walk_expr(cond, f);
            walk_expr(then_expr, f);
            walk_expr(else_expr, f);
        }
        ExprKind::Call { args, .. } => {
            for arg in args {
                walk_expr(arg, f);
            }
        }
        ExprKind::Member { base, .. } => walk_expr(base, f),
        ExprKind::Index { base, index } => {
            walk_expr(base, f);
            walk_expr(index, f);
        }
        ExprKind::Cast { expr, .. } | ExprKind::IncDec { target: expr, .. } => walk_expr(expr, f),
        ExprKind::SizeofExpr(_)
        | ExprKind::SizeofType(_)
        | ExprKind::IntLiteral { .. }
        | ExprKind::CharLiteral(_)
        | ExprKind::StringLiteral(_)
        | ExprKind::Ident(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::const_eval::ConstValue;
    use crate::parser::{parse_source, Item, TypeExpr};

    struct Headers;

    impl ConstEnv for Headers {
        fn constant(&self, name: &str) -> Option<ConstValue> {
            match name {
                "MAX" => Some(ConstValue::int(16)),
                other => const_eval::header_constant(other),
            }
        }

        fn int_type_of(&self, _ty: &TypeExpr) -> Option<IntType> {
            None
        }

        fn size_of_type(&self, _ty: &TypeExpr) -> Option<u64> {
            None
        }

        fn size_of_expr(&self, _expr: &Expr) -> Option<u64> {
            None
        }
    }

    fn body_of(source: &str) -> Vec<Stmt> {
        let unit = parse_source(source).unwrap();
        unit.items
            .into_iter()
            .find_map(|item| match item {
                Item::Function(def) => Some(def.body),
                _ => None,
            })
            .unwrap()
    }

    fn shape_of(stmt: &Stmt) -> Result<LoopShape<'_>, String> {
        match &stmt.kind {
            StmtKind::For {
                cond, step, body, ..
            } => analyze(LoopKind::For, cond.as_ref(), step.as_ref(), body, &Headers),
            StmtKind::While { cond, body } => {
                analyze(LoopKind::While, Some(cond), None, body, &Headers)
            }
            StmtKind::DoWhile { body, cond } => {
                analyze(LoopKind::DoWhile, Some(cond), None, body, &Headers)
            }
            _ => Err("not a loop".to_string()),
        }
    }

    #[test]
    fn test_for_loop_bound() {
        let body = body_of("void f(void) { for (int i = 0; i < MAX; i++) { } }");
        let shape = shape_of(&body[0]).unwrap();
        assert_eq!(shape.counter, "i");
        assert_eq!(shape.limit, 16);
        assert_eq!(trip_count(&shape, 0, IntType::S32, false), Some(16));
        assert_eq!(trip_count(&shape, 20, IntType::S32, false), Some(0));
    }

    #[test]
    fn test_countdown_and_strides() {
        let body = body_of("void f(void) { for (int i = 10; 0 < i; i -= 3) { } }");
        let shape = shape_of(&body[0]).unwrap();
        assert_eq!(shape.cmp, BinaryOp::Gt);
        // 10, 7, 4, 1
        assert_eq!(trip_count(&shape, 10, IntType::S32, false), Some(4));

        let body = body_of("void f(void) { for (int i = 0; i != 9; i = i + 3) { } }");
        let shape = shape_of(&body[0]).unwrap();
        assert_eq!(trip_count(&shape, 0, IntType::S32, false), Some(3));
        assert_eq!(trip_count(&shape, 1, IntType::S32, false), None);
    }

    #[test]
    fn test_while_loop_steps_in_body() {
        let body = body_of("void f(void) { int n = 0; while (n < 8) { n++; } }");
        let shape = shape_of(&body[1]).unwrap();
        assert_eq!(shape.step, 1);
        assert_eq!(trip_count(&shape, 0, IntType::S32, false), Some(8));
    }

    #[test]
    fn test_unprovable_loops() {
        for source in [
            "void f(int n) { for (int i = 0; i < n; i++) { } }",
            "void f(void) { for (int i = 0; i < 4; i--) { } }",
            "void f(void) { for (int i = 0; i < 4; i++) { i = 0; } }",
            "void f(void) { for (int i = 0; i < 4; i++) { int *p = &i; } }",
            "void f(void) { while (1) { } }",
            "void f(void) { int i = 0; while (i < 4) { if (i) continue; i++; } }",
        ] {
            let body = body_of(source);
            let stmt = body.last().unwrap();
            assert!(shape_of(stmt).is_err(), "accepted: {}", source);
        }
    }

    #[test]
    fn test_wrapping_counter() {
        let body = body_of("void f(void) { for (unsigned char i = 0; i <= 255; i++) { } }");
        let shape = shape_of(&body[0]).unwrap();
        assert_eq!(trip_count(&shape, 0, IntType::U8, false), None);
        assert_eq!(trip_count(&shape, 0, IntType::S32, false), Some(256));
    }

    #[test]
    fn test_do_while_runs_once() {
        let body = body_of("void f(void) { int i = 5; do { i++; } while (i < 3); }");
        let shape = shape_of(&body[1]).unwrap();
        assert_eq!(trip_count(&shape, 5, IntType::S32, true), Some(1));
    }
}
