//! Integer constant folding
//!
//! Folds constant expressions with C semantics: literal typing, the usual
//! arithmetic conversions and wraparound at the width of the converted
//! operands. The arithmetic never widens into an unbounded integer.

use super::types::IntType;
use crate::parser::{BinaryOp, Expr, ExprKind, TypeExpr, UnaryOp};
use serde::{Deserialize, Serialize};

/// A folded constant and its C type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstValue {
    /// Value, normalized to `ty` (sign- or zero-extended to 64 bits)
    pub value: i64,
    /// Type of the value
    pub ty: IntType,
}

impl ConstValue {
    /// Creates a constant, normalizing the value to the type
    pub fn new(value: i64, ty: IntType) -> Self {
        ConstValue {
            value: ty.normalize(value),
            ty,
        }
    }

    /// `int` constant
    pub fn int(value: i64) -> Self {
        ConstValue::new(value, IntType::S32)
    }

    /// Value converted to another integer type
    pub fn convert(self, ty: IntType) -> Self {
        ConstValue::new(self.value, ty)
    }

    /// Value as an unsigned count, if it is non-negative
    pub fn as_u64(&self) -> Option<u64> {
        if self.ty.signed && self.value < 0 {
            None
        } else {
            Some(self.value as u64)
        }
    }

    /// True when non-zero
    pub fn is_true(&self) -> bool {
        self.value != 0
    }
}

/// Names and types a constant expression may refer to
pub trait ConstEnv {
    /// Named constant (`#define`, enumerator, header constant, const global)
    fn constant(&self, name: &str) -> Option<ConstValue>;

    /// Integer view of a type (for casts); pointers are `u64`
    fn int_type_of(&self, ty: &TypeExpr) -> Option<IntType>;

    /// `sizeof(type)`
    fn size_of_type(&self, ty: &TypeExpr) -> Option<u64>;

    /// `sizeof expr`
    fn size_of_expr(&self, expr: &Expr) -> Option<u64>;
}

/// Constants every program may use without including a header
pub fn header_constant(name: &str) -> Option<ConstValue> {
    let value = match name {
        "BPF_ANY" | "NULL" | "false" | "XDP_ABORTED" => ConstValue::int(0),
        "BPF_NOEXIST" | "true" | "XDP_DROP" => ConstValue::int(1),
        "BPF_EXIST" | "XDP_PASS" => ConstValue::int(2),
        "XDP_TX" => ConstValue::int(3),
        "XDP_REDIRECT" => ConstValue::int(4),
        "BPF_F_CURRENT_CPU" => ConstValue::new(0xffff_ffff, IntType::U64),
        "BPF_F_INDEX_MASK" => ConstValue::new(0xffff_ffff, IntType::U64),
        "BPF_F_NO_PREALLOC" => ConstValue::int(1),
        "TASK_COMM_LEN" => ConstValue::int(16),
        _ => return None,
    };
    Some(value)
}

/// Type of an integer literal: the first candidate that can hold the value
pub fn literal_type(value: u64, unsigned: bool, long: bool, non_decimal: bool) -> IntType {
    let candidates: &[IntType] = match (unsigned, long) {
        (true, true) => &[IntType::U64],
        (true, false) => &[IntType::U32, IntType::U64],
        (false, true) if non_decimal => &[IntType::S64, IntType::U64],
        (false, true) => &[IntType::S64],
        (false, false) if non_decimal => &[IntType::S32, IntType::U32, IntType::S64, IntType::U64],
        (false, false) => &[IntType::S32, IntType::S64],
    };
    candidates
        .iter()
        .copied()
        .find(|ty| ty.fits(i128::from(value)))
        // too large for any signed candidate: treated as unsigned long
        .unwrap_or(IntType::U64)
}

/// Fold a binary operator over two constants
///
/// Returns `None` for division by zero and out-of-range shifts, which are
/// not constant expressions.
pub fn fold_binary(op: BinaryOp, lhs: ConstValue, rhs: ConstValue) -> Option<ConstValue> {
    match op {
        BinaryOp::LogicalAnd => {
            return Some(ConstValue::int(i64::from(lhs.is_true() && rhs.is_true())))
        }
        BinaryOp::LogicalOr => {
            return Some(ConstValue::int(i64::from(lhs.is_true() || rhs.is_true())))
        }
        BinaryOp::Shl | BinaryOp::Shr => {
            let ty = lhs.ty.promote();
            let a = ty.normalize(lhs.value);
            let count = rhs.as_u64()?;
            if count >= u64::from(ty.bits) {
                return None;
            }
            let count = count as u32;
            let value = match (op, ty.signed) {
                (BinaryOp::Shl, _) => (a as u64).wrapping_shl(count) as i64,
                (_, true) => a.wrapping_shr(count),
                (_, false) => ((a as u64) >> count) as i64,
            };
            return Some(ConstValue::new(value, ty));
        }
        _ => {}
    }

    let ty = IntType::common(lhs.ty, rhs.ty);
    let a = ty.normalize(lhs.value);
    let b = ty.normalize(rhs.value);
    let (ua, ub) = (a as u64, b as u64);

    let compare = |result: bool| Some(ConstValue::int(i64::from(result)));
    match op {
        BinaryOp::Add => Some(ConstValue::new(a.wrapping_add(b), ty)),
        BinaryOp::Sub => Some(ConstValue::new(a.wrapping_sub(b), ty)),
        BinaryOp::Mul => Some(ConstValue::new(a.wrapping_mul(b), ty)),
        BinaryOp::Div | BinaryOp::Mod if b == 0 => None,
        BinaryOp::Div if ty.signed => Some(ConstValue::new(a.wrapping_div(b), ty)),
        BinaryOp::Div => Some(ConstValue::new((ua / ub) as i64, ty)),
        BinaryOp::Mod if ty.signed => Some(ConstValue::new(a.wrapping_rem(b), ty)),
        BinaryOp::Mod => Some(ConstValue::new((ua % ub) as i64, ty)),
        BinaryOp::BitAnd => Some(ConstValue::new(a & b, ty)),
        BinaryOp::BitOr => Some(ConstValue::new(a | b, ty)),
        BinaryOp::BitXor => Some(ConstValue::new(a ^ b, ty)),
        BinaryOp::Eq => compare(a == b),
        BinaryOp::Ne => compare(a != b),
        BinaryOp::Lt if ty.signed => compare(a < b),
        BinaryOp::Gt if ty.signed => compare(a > b),
        BinaryOp::Le if ty.signed => compare(a <= b),
        BinaryOp::Ge if ty.signed => compare(a >= b),
        BinaryOp::Lt => compare(ua < ub),
        BinaryOp::Gt => compare(ua > ub),
        BinaryOp::Le => compare(ua <= ub),
        BinaryOp::Ge => compare(ua >= ub),
        BinaryOp::Shl | BinaryOp::Shr | BinaryOp::LogicalAnd | BinaryOp::LogicalOr => None,
    }
}

/// Fold a prefix operator
pub fn fold_unary(op: UnaryOp, operand: ConstValue) -> Option<ConstValue> {
    let ty = operand.ty.promote();
    let v = ty.normalize(operand.value);
    match op {
        UnaryOp::Neg => Some(ConstValue::new(v.wrapping_neg(), ty)),
        UnaryOp::Plus => Some(ConstValue::new(v, ty)),
        UnaryOp::BitNot => Some(ConstValue::new(!v, ty)),
        UnaryOp::Not => Some(ConstValue::int(i64::from(v == 0))),
        UnaryOp::Deref | UnaryOp::AddrOf => None,
    }
}

/// Fold `expr` if it is an integer constant expression
pub fn eval(expr: &Expr, env: &dyn ConstEnv) -> Option<ConstValue> {
    match &expr.kind {
        ExprKind::IntLiteral {
            value,
            unsigned,
            long,
            non_decimal,
        } => Some(ConstValue::new(
            *value as i64,
            literal_type(*value, *unsigned, *long, *non_decimal),
        )),
        ExprKind::CharLiteral(c) => Some(ConstValue::int(i64::from(*c as i8))),
        ExprKind::Ident(name) => env.constant(name),
        ExprKind::Unary { op, operand } => fold_unary(*op, eval(operand, env)?),
        ExprKind::Binary { op, lhs, rhs } => {
            let l = eval(lhs, env)?;
            // `0 && x` and `1 || x` are constant whatever x is
            match op {
                BinaryOp::LogicalAnd if !l.is_true() => return Some(ConstValue::int(0)),
                BinaryOp::LogicalOr if l.is_true() => return Some(ConstValue::int(1)),
                _ => {}
            }
            fold_binary(*op, l, eval(rhs, env)?)
        }
        ExprKind::Conditional {
            cond,
            then_expr,
            else_expr,
        } => {
            let c = eval(cond, env)?;
            let t = eval(then_expr, env)?;
            let e = eval(else_expr, env)?;
            let ty = IntType::common(t.ty, e.ty);
            Some(if c.is_true() { t } else { e }.convert(ty))
        }
        ExprKind::Cast { ty, expr } => {
            let target = env.int_type_of(ty)?;
            Some(eval(expr, env)?.convert(target))
        }
        ExprKind::SizeofType(ty) => env
            .size_of_type(ty)
            .map(|size| ConstValue::new(size as i64, IntType::U64)),
        ExprKind::SizeofExpr(inner) => env
            .size_of_expr(inner)
            .map(|size| ConstValue::new(size as i64, IntType::U64)),
        // the left operand may have side effects, so a comma is never folded
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;
    use crate::parser::{Item, MacroBody};

    struct NoNames;

    impl ConstEnv for NoNames {
        fn constant(&self, name: &str) -> Option<ConstValue> {
            header_constant(name)
        }

        fn int_type_of(&self, ty: &TypeExpr) -> Option<IntType> {
            match ty {
                TypeExpr::Int { bits, signed } => Some(IntType::new(*bits, *signed)),
                TypeExpr::Pointer(_) => Some(IntType::U64),
                _ => None,
            }
        }

        fn size_of_type(&self, ty: &TypeExpr) -> Option<u64> {
            self.int_type_of(ty).map(|it| it.size())
        }

        fn size_of_expr(&self, _expr: &Expr) -> Option<u64> {
            None
        }
    }

    fn fold(text: &str) -> Option<ConstValue> {
        let unit = parse_source(&format!("#define X {}\n", text)).unwrap();
        match &unit.items[0] {
            Item::Define(def) => match &def.body {
                MacroBody::Expr(expr) => eval(expr, &NoNames),
                _ => None,
            },
            _ => None,
        }
    }

    #[test]
    fn test_map_sizes() {
        assert_eq!(fold("1 << 24").unwrap().value, 16_777_216);
        assert_eq!(fold("256 * 1024").unwrap().value, 262_144);
        assert_eq!(fold("sizeof(int)").unwrap().value, 4);
        assert_eq!(fold("(u32)-1").unwrap().value, 0xffff_ffff);
    }

    #[test]
    fn test_int_wraparound() {
        // int arithmetic wraps at 32 bits
        let v = fold("2147483647 + 1").unwrap();
        assert_eq!(v.value, i64::from(i32::MIN));
        assert_eq!(v.ty, IntType::S32);
        // unsigned int
        assert_eq!(fold("0u - 1").unwrap().value, 0xffff_ffff);
        // hex literal that does not fit int is unsigned int
        assert_eq!(fold("0xFFFFFFFF").unwrap().ty, IntType::U32);
        assert_eq!(fold("4294967295").unwrap().ty, IntType::S64);
    }

    #[test]
    fn test_usual_conversions_in_compare() {
        // -1 converts to UINT_MAX against an unsigned operand
        assert_eq!(fold("-1 < 1u").unwrap().value, 0);
        assert_eq!(fold("-1 < 1").unwrap().value, 1);
    }

    #[test]
    fn test_not_constant() {
        assert!(fold("1 / 0").is_none());
        assert!(fold("1 << 40").is_none());
        assert!(fold("foo + 1").is_none());
        assert_eq!(fold("0 && foo").unwrap().value, 0);
    }

    #[test]
    fn test_header_constants() {
        assert_eq!(fold("BPF_F_CURRENT_CPU").unwrap().value, 0xffff_ffff);
        assert_eq!(fold("XDP_PASS").unwrap().value, 2);
        assert_eq!(fold("NULL").unwrap().value, 0);
    }
}
