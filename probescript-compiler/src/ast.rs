//! Typed AST consumed by the code generator.
//!
//! Nodes arrive fully typed from the semantic analysis phase: every
//! expression carries a resolved [`SizedType`] and a source location used for
//! diagnostics and helper-error correlation.

use crate::types::SizedType;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Program {
    pub probes: Vec<Probe>,
}

#[derive(Debug, Clone)]
pub struct Probe {
    pub attach_points: Vec<AttachPoint>,
    pub predicate: Option<Expression>,
    pub stmts: Vec<Statement>,
    /// Set upstream when any attach point contains a wildcard or the body
    /// references per-program state (e.g. the `probe` builtin).
    pub need_expansion: bool,
}

impl Probe {
    /// Canonical probe name: attach point names joined with commas.
    pub fn name(&self) -> String {
        self.attach_points
            .iter()
            .map(AttachPoint::name)
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Begin,
    End,
    Kprobe,
    Kretprobe,
    Uprobe,
    Uretprobe,
    Usdt,
    Tracepoint,
    Profile,
    Interval,
    Software,
    Hardware,
    Kfunc,
    Kretfunc,
    Invalid,
}

#[derive(Debug, Clone, Default)]
pub struct AttachPoint {
    pub provider: String,
    pub target: String,
    pub ns: String,
    pub func: String,
    /// Filled in by the probe driver once the usdt note has been located.
    pub usdt: Option<UsdtInfo>,
}

impl AttachPoint {
    pub fn kind(&self) -> ProbeKind {
        match self.provider.as_str() {
            "BEGIN" => ProbeKind::Begin,
            "END" => ProbeKind::End,
            "kprobe" => ProbeKind::Kprobe,
            "kretprobe" => ProbeKind::Kretprobe,
            "uprobe" => ProbeKind::Uprobe,
            "uretprobe" => ProbeKind::Uretprobe,
            "usdt" => ProbeKind::Usdt,
            "tracepoint" => ProbeKind::Tracepoint,
            "profile" => ProbeKind::Profile,
            "interval" => ProbeKind::Interval,
            "software" => ProbeKind::Software,
            "hardware" => ProbeKind::Hardware,
            "kfunc" => ProbeKind::Kfunc,
            "kretfunc" => ProbeKind::Kretfunc,
            _ => ProbeKind::Invalid,
        }
    }

    /// Name with the declared function part.
    pub fn name(&self) -> String {
        self.name_with(&self.func)
    }

    /// Fully-qualified name with `func` substituted for the declared
    /// function part (used once wildcards are resolved).
    pub fn name_with(&self, func: &str) -> String {
        let mut parts = vec![self.provider.clone()];
        if !self.target.is_empty() {
            parts.push(self.target.clone());
        }
        if !self.ns.is_empty() {
            parts.push(self.ns.clone());
        }
        if !func.is_empty() {
            parts.push(func.to_string());
        }
        parts.join(":")
    }

    /// Name with both category and function substituted (tracepoint and
    /// uprobe matches carry `category:function`).
    pub fn name_with_target(&self, target: &str, func: &str) -> String {
        let mut parts = vec![self.provider.clone()];
        if !target.is_empty() {
            parts.push(target.to_string());
        }
        if !self.ns.is_empty() {
            parts.push(self.ns.clone());
        }
        if !func.is_empty() {
            parts.push(func.to_string());
        }
        parts.join(":")
    }
}

/// Resolved USDT note: one probe can be present at several code locations
/// (e.g. after inlining), each with its own argument recipes.
#[derive(Debug, Clone, Default)]
pub struct UsdtInfo {
    pub locations: Vec<UsdtLocation>,
}

impl UsdtInfo {
    pub fn num_locations(&self) -> usize {
        self.locations.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct UsdtLocation {
    pub args: Vec<UsdtArg>,
}

/// Per-location argument recipe.
#[derive(Debug, Clone)]
pub struct UsdtArg {
    pub size: usize,
    pub signed: bool,
    pub kind: UsdtArgKind,
}

#[derive(Debug, Clone)]
pub enum UsdtArgKind {
    /// N@$imm
    Constant(i64),
    /// N@%reg
    Register { reg: String },
    /// N@off(%reg)
    Memory { reg: String, offset: i64 },
}

#[derive(Debug, Clone)]
pub struct Expression {
    pub kind: ExprKind,
    pub ty: SizedType,
    pub loc: SourceLocation,
}

impl Expression {
    pub fn new(kind: ExprKind, ty: SizedType, loc: SourceLocation) -> Self {
        Self { kind, ty, loc }
    }

    pub fn string_literal(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn integer_literal(&self) -> Option<i64> {
        match &self.kind {
            ExprKind::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_map(&self) -> bool {
        matches!(self.kind, ExprKind::Map(_))
    }

    pub fn is_variable(&self) -> bool {
        matches!(self.kind, ExprKind::Variable(_))
    }
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Integer(i64),
    Str(String),
    /// `$N`
    PositionalParameter { n: usize, is_in_str: bool },
    /// `$#`
    PositionalCount,
    /// Resolved enum constant.
    Identifier(String),
    Builtin(String),
    Call {
        func: String,
        args: Vec<Expression>,
        map: Option<MapAccess>,
    },
    Map(MapAccess),
    Variable(String),
    Unop {
        op: UnaryOp,
        expr: Box<Expression>,
        is_post_op: bool,
    },
    Binop {
        op: BinaryOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Ternary {
        cond: Box<Expression>,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    FieldAccess {
        expr: Box<Expression>,
        field: String,
        /// Element position for tuple access.
        index: usize,
    },
    ArrayAccess {
        expr: Box<Expression>,
        index: Box<Expression>,
    },
    Cast(Box<Expression>),
    Tuple(Vec<Expression>),
}

/// A map reference: `@ident[key, ...]`. `ty` is the map's value type.
#[derive(Debug, Clone)]
pub struct MapAccess {
    pub ident: String,
    pub keys: Vec<Expression>,
    pub ty: SizedType,
    pub loc: SourceLocation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    LogicalNot,
    BitwiseNot,
    Negate,
    Dereference,
    Increment,
    Decrement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Equal,
    NotEqual,
    LessEqual,
    GreaterEqual,
    LessThan,
    GreaterThan,
    ShiftLeft,
    ShiftRight,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    BitAnd,
    BitOr,
    BitXor,
    LogicalAnd,
    LogicalOr,
}

#[derive(Debug, Clone)]
pub enum Statement {
    Expr(Expression),
    AssignMap {
        map: MapAccess,
        expr: Expression,
        loc: SourceLocation,
    },
    AssignVar {
        ident: String,
        ty: SizedType,
        expr: Expression,
    },
    If {
        cond: Expression,
        then_stmts: Vec<Statement>,
        else_stmts: Option<Vec<Statement>>,
    },
    While {
        cond: Expression,
        stmts: Vec<Statement>,
    },
    Unroll {
        count: i64,
        stmts: Vec<Statement>,
    },
    Jump {
        kind: JumpKind,
        loc: SourceLocation,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpKind {
    Return,
    Break,
    Continue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_point_names_skip_empty_parts() {
        let ap = AttachPoint {
            provider: "kprobe".into(),
            func: "vfs_read".into(),
            ..Default::default()
        };
        assert_eq!(ap.name(), "kprobe:vfs_read");
        assert_eq!(ap.name_with("do_sys_open"), "kprobe:do_sys_open");

        let usdt = AttachPoint {
            provider: "usdt".into(),
            target: "/bin/bash".into(),
            ns: "bash".into(),
            func: "readline".into(),
            ..Default::default()
        };
        assert_eq!(usdt.name(), "usdt:/bin/bash:bash:readline");
        assert_eq!(usdt.kind(), ProbeKind::Usdt);
    }

    #[test]
    fn test_probe_name_joins_attach_points() {
        let probe = Probe {
            attach_points: vec![
                AttachPoint {
                    provider: "kprobe".into(),
                    func: "f".into(),
                    ..Default::default()
                },
                AttachPoint {
                    provider: "kretprobe".into(),
                    func: "g".into(),
                    ..Default::default()
                },
            ],
            predicate: None,
            stmts: vec![],
            need_expansion: false,
        };
        assert_eq!(probe.name(), "kprobe:f,kretprobe:g");
    }
}
