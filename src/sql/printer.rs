//! SQL text for syntax trees, used to expose rewritten statements.

use super::ast::{
    BinaryOp, Delete, Expr, FromClause, Insert, JoinKind, Select, SelectItem, Statement, TableRef,
    UnaryOp, Update,
};
use serde_json::Value;
use std::fmt::{self, Display, Formatter, Write};

fn precedence(op: BinaryOp) -> u8 {
    match op {
        BinaryOp::Or => 1,
        BinaryOp::And => 2,
        BinaryOp::Eq
        | BinaryOp::NotEq
        | BinaryOp::Lt
        | BinaryOp::LtEq
        | BinaryOp::Gt
        | BinaryOp::GtEq => 4,
        BinaryOp::Plus | BinaryOp::Minus | BinaryOp::Concat => 5,
        BinaryOp::Multiply | BinaryOp::Divide | BinaryOp::Modulo => 6,
    }
}

fn ident(name: &str) -> String {
    let plain = name
        .chars()
        .next()
        .map_or(false, |c| c.is_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_alphanumeric() || c == '_');
    if plain {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

fn comma_list<T: Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl Expr {
    fn write_operand(&self, f: &mut Formatter<'_>, parent: u8) -> fmt::Result {
        match self {
            Expr::Binary { op, .. } if precedence(*op) < parent => write!(f, "({self})"),
            Expr::Unary { op: UnaryOp::Not, .. } if parent > 3 => write!(f, "({self})"),
            _ => write!(f, "{self}"),
        }
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(value) => f.write_str(&literal(value)),
            Expr::Param(_) => f.write_char('?'),
            Expr::Column { table: Some(table), name } => write!(f, "{}.{}", ident(table), ident(name)),
            Expr::Column { table: None, name } => f.write_str(&ident(name)),
            Expr::Binary { left, op, right } => {
                let p = precedence(*op);
                left.write_operand(f, p)?;
                write!(f, " {} ", op.symbol())?;
                right.write_operand(f, p + 1)
            }
            Expr::Unary { op: UnaryOp::Not, expr } => {
                f.write_str("NOT ")?;
                expr.write_operand(f, 3)
            }
            Expr::Unary { op: UnaryOp::Neg, expr } => {
                f.write_char('-')?;
                expr.write_operand(f, 7)
            }
            Expr::IsNull { expr, negated } => {
                expr.write_operand(f, 5)?;
                f.write_str(if *negated { " IS NOT NULL" } else { " IS NULL" })
            }
            Expr::InList { expr, list, negated } => {
                expr.write_operand(f, 5)?;
                let not = if *negated { " NOT" } else { "" };
                write!(f, "{not} IN ({})", comma_list(list))
            }
            Expr::Like { expr, pattern, negated } => {
                expr.write_operand(f, 5)?;
                f.write_str(if *negated { " NOT LIKE " } else { " LIKE " })?;
                pattern.write_operand(f, 5)
            }
            Expr::Function { name, wildcard: true, .. } => write!(f, "{name}(*)"),
            Expr::Function { name, args, .. } => write!(f, "{name}({})", comma_list(args)),
            Expr::Nested(inner) => write!(f, "({inner})"),
        }
    }
}

impl Display for SelectItem {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SelectItem::Wildcard => f.write_char('*'),
            SelectItem::QualifiedWildcard(table) => write!(f, "{}.*", ident(table)),
            SelectItem::Expr { expr, alias: Some(alias) } => write!(f, "{expr} AS {}", ident(alias)),
            SelectItem::Expr { expr, alias: None } => write!(f, "{expr}"),
        }
    }
}

impl Display for TableRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TableRef::Table { name, alias, .. } => {
                f.write_str(&ident(name))?;
                if let Some(alias) = alias {
                    write!(f, " AS {}", ident(alias))?;
                }
                Ok(())
            }
            TableRef::Subquery { query, alias } => write!(f, "({query}) AS {}", ident(alias)),
        }
    }
}

impl Display for FromClause {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base)?;
        for join in &self.joins {
            let kind = match join.kind {
                JoinKind::Inner => "JOIN",
                JoinKind::Left => "LEFT JOIN",
            };
            write!(f, " {kind} {}", join.table)?;
            if let Some(on) = &join.on {
                write!(f, " ON {on}")?;
            }
        }
        Ok(())
    }
}

impl Display for Select {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "SELECT {}", comma_list(&self.projection))?;
        if let Some(from) = &self.from {
            write!(f, " FROM {from}")?;
        }
        if let Some(selection) = &self.selection {
            write!(f, " WHERE {selection}")?;
        }
        if !self.group_by.is_empty() {
            write!(f, " GROUP BY {}", comma_list(&self.group_by))?;
        }
        if !self.order_by.is_empty() {
            let terms: Vec<String> = self
                .order_by
                .iter()
                .map(|o| format!("{}{}", o.expr, if o.descending { " DESC" } else { "" }))
                .collect();
            write!(f, " ORDER BY {}", terms.join(", "))?;
        }
        if let Some(limit) = &self.limit {
            write!(f, " LIMIT {limit}")?;
        }
        if let Some(offset) = &self.offset {
            write!(f, " OFFSET {offset}")?;
        }
        Ok(())
    }
}

impl Display for Insert {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "INSERT INTO {}", ident(&self.table))?;
        if !self.columns.is_empty() {
            let columns: Vec<String> = self.columns.iter().map(|c| ident(c)).collect();
            write!(f, " ({})", columns.join(", "))?;
        }
        let rows: Vec<String> = self
            .rows
            .iter()
            .map(|row| format!("({})", comma_list(row)))
            .collect();
        write!(f, " VALUES {}", rows.join(", "))
    }
}

impl Display for Update {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let assignments: Vec<String> = self
            .assignments
            .iter()
            .map(|(column, expr)| format!("{} = {expr}", ident(column)))
            .collect();
        write!(f, "UPDATE {} SET {}", ident(&self.table), assignments.join(", "))?;
        if let Some(selection) = &self.selection {
            write!(f, " WHERE {selection}")?;
        }
        Ok(())
    }
}

impl Display for Delete {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "DELETE FROM {}", ident(&self.table))?;
        if let Some(selection) = &self.selection {
            write!(f, " WHERE {selection}")?;
        }
        Ok(())
    }
}

impl Display for Statement {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Select(s) => s.fmt(f),
            Statement::Insert(s) => s.fmt(f),
            Statement::Update(s) => s.fmt(f),
            Statement::Delete(s) => s.fmt(f),
        }
    }
}
