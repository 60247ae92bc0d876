//! Final passes: `state_all` onto the internal vtable, then filter pushdown.

use super::{map_tables, on_select, RewriteContext};
use crate::error::Result;
use crate::sql::ast::{BinaryOp, Expr, FromClause, Join, ScanHint, Select, Statement, TableRef};
use serde_json::Value;

/// Public view over live rows of every version.
pub const STATE_ALL_VIEW: &str = "state_all";
/// Resolved rows of every version, tombstones included.
pub const VTABLE: &str = "lix_internal_state_vtable";
/// Rows each version owns, as held by the state cache.
pub const CACHE_TABLE: &str = "lix_internal_state_cache";

pub(super) fn rewrite_cache_table(statement: Statement, _: &RewriteContext) -> Result<Statement> {
    match statement {
        Statement::Select(select) => map_tables(select, &mut |table, filter| match table {
            TableRef::Table { name, alias, hint } if name == STATE_ALL_VIEW => {
                let binding = alias.unwrap_or(name);
                if let Some(filter) = filter {
                    let live = Expr::IsNull {
                        expr: Box::new(Expr::qualified(&binding, "snapshot_content")),
                        negated: true,
                    };
                    *filter = Expr::and(filter.take(), Some(live));
                }
                Ok(TableRef::Table {
                    name: VTABLE.to_string(),
                    alias: Some(binding),
                    hint,
                })
            }
            other => Ok(other),
        })
        .map(Statement::Select),
        Statement::Insert(mut insert) if insert.table == STATE_ALL_VIEW => {
            insert.table = VTABLE.to_string();
            Ok(Statement::Insert(insert))
        }
        Statement::Update(mut update) if update.table == STATE_ALL_VIEW => {
            update.table = VTABLE.to_string();
            Ok(Statement::Update(update))
        }
        Statement::Delete(mut delete) if delete.table == STATE_ALL_VIEW => {
            delete.table = VTABLE.to_string();
            Ok(Statement::Delete(delete))
        }
        other => Ok(other),
    }
}

pub(super) fn rewrite_vtable_select(statement: Statement, _: &RewriteContext) -> Result<Statement> {
    on_select(statement, |select| Ok(push_hints(select)))
}

fn push_hints(mut select: Select) -> Select {
    let Some(from) = select.from.take() else {
        return select;
    };
    let sole = from.joins.is_empty();
    let base = hint_table(from.base, select.selection.as_ref(), sole);
    let joins = from
        .joins
        .into_iter()
        .map(|join| Join {
            table: hint_table(join.table, join.on.as_ref(), false),
            ..join
        })
        .collect();
    select.from = Some(FromClause { base, joins });
    select
}

fn hint_table(table: TableRef, filter: Option<&Expr>, sole: bool) -> TableRef {
    match table {
        TableRef::Table { name, alias, .. } if name == VTABLE => {
            let binding = alias.as_deref().unwrap_or(&name);
            let hint = scan_hint(filter, binding, sole);
            TableRef::Table {
                name,
                alias,
                hint: Some(hint),
            }
        }
        TableRef::Subquery { query, alias } => TableRef::Subquery {
            query: Box::new(push_hints(*query)),
            alias,
        },
        other => other,
    }
}

/// Literal `schema_key` / `version_id` equalities among the top-level
/// conjuncts of `filter` that refer to `binding`. Unqualified columns count
/// only when the table is the sole source.
pub fn scan_hint(filter: Option<&Expr>, binding: &str, sole: bool) -> ScanHint {
    let mut hint = ScanHint::default();
    let Some(filter) = filter else {
        return hint;
    };
    for conjunct in filter.conjuncts() {
        let Expr::Binary {
            left,
            op: BinaryOp::Eq,
            right,
        } = conjunct
        else {
            continue;
        };
        let (column, value) = match (left.as_ref(), right.as_ref()) {
            (Expr::Column { table, name }, Expr::Literal(Value::String(v)))
            | (Expr::Literal(Value::String(v)), Expr::Column { table, name }) => {
                let ours = match table {
                    Some(t) => t == binding,
                    None => sole,
                };
                if !ours {
                    continue;
                }
                (name.as_str(), v.clone())
            }
            _ => continue,
        };
        match column {
            "schema_key" => hint.schema_key = Some(value),
            "version_id" => hint.version_id = Some(value),
            _ => {}
        }
    }
    hint
}
