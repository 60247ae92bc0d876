//! Syntax tree of the SQL dialect.
//!
//! Rewrite passes consume and return these nodes by value.

use serde_json::Value;

#[derive(Clone, Debug, PartialEq)]
pub enum Statement {
    Select(Select),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Select {
    pub projection: Vec<SelectItem>,
    pub from: Option<FromClause>,
    pub selection: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<Expr>,
    pub offset: Option<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SelectItem {
    Wildcard,
    QualifiedWildcard(String),
    Expr { expr: Expr, alias: Option<String> },
}

#[derive(Clone, Debug, PartialEq)]
pub struct FromClause {
    pub base: TableRef,
    pub joins: Vec<Join>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub table: TableRef,
    pub on: Option<Expr>,
}

/// Equality filters pushed down into a state-table scan.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanHint {
    pub schema_key: Option<String>,
    pub version_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TableRef {
    Table {
        name: String,
        alias: Option<String>,
        hint: Option<ScanHint>,
    },
    Subquery {
        query: Box<Select>,
        alias: String,
    },
}

impl TableRef {
    pub fn table(name: impl Into<String>, alias: Option<String>) -> Self {
        TableRef::Table {
            name: name.into(),
            alias,
            hint: None,
        }
    }

    /// Name rows of this table are qualified with.
    pub fn binding(&self) -> &str {
        match self {
            TableRef::Table { name, alias, .. } => alias.as_deref().unwrap_or(name),
            TableRef::Subquery { alias, .. } => alias,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    pub expr: Expr,
    pub descending: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Insert {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Expr>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Update {
    pub table: String,
    pub assignments: Vec<(String, Expr)>,
    pub selection: Option<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Delete {
    pub table: String,
    pub selection: Option<Expr>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    Concat,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Or => "OR",
            BinaryOp::And => "AND",
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::Plus => "+",
            BinaryOp::Minus => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Concat => "||",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Positional `?`, numbered from zero across the whole input.
    Param(usize),
    Column {
        table: Option<String>,
        name: String,
    },
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
    },
    Function {
        name: String,
        args: Vec<Expr>,
        /// `count(*)`
        wildcard: bool,
    },
    Nested(Box<Expr>),
}

pub const AGGREGATES: &[&str] = &["count", "sum", "min", "max"];

impl Expr {
    pub fn column(name: impl Into<String>) -> Self {
        Expr::Column {
            table: None,
            name: name.into(),
        }
    }

    pub fn qualified(table: impl Into<String>, name: impl Into<String>) -> Self {
        Expr::Column {
            table: Some(table.into()),
            name: name.into(),
        }
    }

    pub fn string(value: impl Into<String>) -> Self {
        Expr::Literal(Value::String(value.into()))
    }

    pub fn function(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Function {
            name: name.into(),
            args,
            wildcard: false,
        }
    }

    pub fn binary(left: Expr, op: BinaryOp, right: Expr) -> Self {
        Expr::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn equals(left: Expr, right: Expr) -> Self {
        Self::binary(left, BinaryOp::Eq, right)
    }

    /// `a AND b`, where either side may be absent.
    pub fn and(left: Option<Expr>, right: Option<Expr>) -> Option<Expr> {
        match (left, right) {
            (Some(l), Some(r)) => Some(Self::binary(l, BinaryOp::And, r)),
            (l, r) => l.or(r),
        }
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, Expr::Function { name, .. } if AGGREGATES.contains(&name.to_ascii_lowercase().as_str()))
    }

    /// True if any node of the tree satisfies `f`.
    pub fn any(&self, f: &impl Fn(&Expr) -> bool) -> bool {
        if f(self) {
            return true;
        }
        match self {
            Expr::Binary { left, right, .. } => left.any(f) || right.any(f),
            Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } | Expr::Nested(expr) => expr.any(f),
            Expr::InList { expr, list, .. } => expr.any(f) || list.iter().any(|e| e.any(f)),
            Expr::Like { expr, pattern, .. } => expr.any(f) || pattern.any(f),
            Expr::Function { args, .. } => args.iter().any(|e| e.any(f)),
            Expr::Literal(_) | Expr::Param(_) | Expr::Column { .. } => false,
        }
    }

    /// Names of every column the tree references.
    pub fn collect_columns(&self, out: &mut Vec<String>) {
        match self {
            Expr::Column { name, .. } => out.push(name.clone()),
            Expr::Binary { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } | Expr::Nested(expr) => {
                expr.collect_columns(out)
            }
            Expr::InList { expr, list, .. } => {
                expr.collect_columns(out);
                list.iter().for_each(|e| e.collect_columns(out));
            }
            Expr::Like { expr, pattern, .. } => {
                expr.collect_columns(out);
                pattern.collect_columns(out);
            }
            Expr::Function { args, .. } => args.iter().for_each(|e| e.collect_columns(out)),
            Expr::Literal(_) | Expr::Param(_) => {}
        }
    }

    /// Replace column references bottom-up.
    pub fn map_columns(self, f: &impl Fn(Option<String>, String) -> Expr) -> Expr {
        let boxed = |e: Box<Expr>| Box::new(e.map_columns(f));
        match self {
            Expr::Column { table, name } => f(table, name),
            Expr::Binary { left, op, right } => Expr::Binary {
                left: boxed(left),
                op,
                right: boxed(right),
            },
            Expr::Unary { op, expr } => Expr::Unary { op, expr: boxed(expr) },
            Expr::IsNull { expr, negated } => Expr::IsNull {
                expr: boxed(expr),
                negated,
            },
            Expr::InList { expr, list, negated } => Expr::InList {
                expr: boxed(expr),
                list: list.into_iter().map(|e| e.map_columns(f)).collect(),
                negated,
            },
            Expr::Like {
                expr,
                pattern,
                negated,
            } => Expr::Like {
                expr: boxed(expr),
                pattern: boxed(pattern),
                negated,
            },
            Expr::Function {
                name,
                args,
                wildcard,
            } => Expr::Function {
                name,
                args: args.into_iter().map(|e| e.map_columns(f)).collect(),
                wildcard,
            },
            Expr::Nested(expr) => Expr::Nested(boxed(expr)),
            other => other,
        }
    }

    /// Top-level `AND` operands.
    pub fn conjuncts(&self) -> Vec<&Expr> {
        match self {
            Expr::Binary {
                left,
                op: BinaryOp::And,
                right,
            } => {
                let mut out = left.conjuncts();
                out.extend(right.conjuncts());
                out
            }
            Expr::Nested(inner) => inner.conjuncts(),
            other => vec![other],
        }
    }
}

impl Select {
    /// Every expression of this select, not descending into subqueries.
    pub fn expressions(&self) -> Vec<&Expr> {
        let mut out = Vec::new();
        for item in &self.projection {
            if let SelectItem::Expr { expr, .. } = item {
                out.push(expr);
            }
        }
        if let Some(from) = &self.from {
            out.extend(from.joins.iter().filter_map(|join| join.on.as_ref()));
        }
        out.extend(self.selection.iter());
        out.extend(self.group_by.iter());
        out.extend(self.order_by.iter().map(|o| &o.expr));
        out
    }

    pub fn has_aggregates(&self) -> bool {
        self.projection.iter().any(|item| match item {
            SelectItem::Expr { expr, .. } => expr.any(&Expr::is_aggregate),
            _ => false,
        })
    }
}
