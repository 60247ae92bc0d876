//! Ordered rewrite passes from entity views down to the state vtable.
//!
//! Each pass is a pure function from statement to statement and returns its
//! input unchanged when no node matches. Later passes rely on the row shape
//! earlier ones produce, so [`PIPELINE`] order is fixed.

mod cache;
mod entity_view;
mod state_view;

pub use cache::{scan_hint, CACHE_TABLE, STATE_ALL_VIEW, VTABLE};
pub use state_view::STATE_VIEW;

use super::ast::{Expr, FromClause, Join, Select, Statement, TableRef};
use crate::error::Result;
use crate::schema::SchemaRegistry;
use crate::types::VersionId;
use tracing::trace;

/// Everything a pass may consult. Built once per preprocessing call.
#[derive(Clone, Debug)]
pub struct RewriteContext {
    pub schemas: SchemaRegistry,
    pub active_version: VersionId,
}

pub type Pass = fn(Statement, &RewriteContext) -> Result<Statement>;

pub const PIPELINE: &[(&str, Pass)] = &[
    ("entity_view_insert", entity_view::rewrite_insert),
    ("entity_view_update", entity_view::rewrite_update),
    ("entity_view_delete", entity_view::rewrite_delete),
    ("entity_view_select", entity_view::rewrite_select),
    ("state_view_expansion", state_view::expand),
    ("cache_table_rewrite", cache::rewrite_cache_table),
    ("vtable_select", cache::rewrite_vtable_select),
];

/// Run every pass in order.
pub fn rewrite(statement: Statement, context: &RewriteContext) -> Result<Statement> {
    PIPELINE.iter().try_fold(statement, |statement, (name, pass)| {
        let out = pass(statement, context)?;
        trace!(pass = name, sql = %out, "rewrite pass");
        Ok(out)
    })
}

/// Apply `f` to every table reference of a select, subqueries first.
pub(crate) fn map_tables(
    select: Select,
    f: &mut impl FnMut(TableRef, Option<&mut Option<Expr>>) -> Result<TableRef>,
) -> Result<Select> {
    let Some(from) = select.from else {
        return Ok(select);
    };
    let mut select = Select { from: None, ..select };

    let base = map_table(from.base, f, Some(&mut select.selection))?;
    let mut joins = Vec::with_capacity(from.joins.len());
    for join in from.joins {
        let mut on = join.on;
        let table = map_table(join.table, f, Some(&mut on))?;
        joins.push(Join {
            kind: join.kind,
            table,
            on,
        });
    }
    select.from = Some(FromClause { base, joins });
    Ok(select)
}

fn map_table(
    table: TableRef,
    f: &mut impl FnMut(TableRef, Option<&mut Option<Expr>>) -> Result<TableRef>,
    filter: Option<&mut Option<Expr>>,
) -> Result<TableRef> {
    match table {
        TableRef::Subquery { query, alias } => {
            let query = map_tables(*query, f)?;
            f(
                TableRef::Subquery {
                    query: Box::new(query),
                    alias,
                },
                filter,
            )
        }
        table => f(table, filter),
    }
}

/// Select-shaped pass helper: only touches `Statement::Select`.
pub(crate) fn on_select(
    statement: Statement,
    f: impl FnOnce(Select) -> Result<Select>,
) -> Result<Statement> {
    match statement {
        Statement::Select(select) => f(select).map(Statement::Select),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::LixSchema;
    use crate::sql::parser::parse_statements;
    use serde_json::json;

    pub(crate) fn context() -> RewriteContext {
        let mut schemas = SchemaRegistry::with_builtins();
        schemas.insert(
            LixSchema::from_definition(json!({
                "x-lix-key": "mock_task",
                "x-lix-primary-key": ["id"],
                "properties": {
                    "id": {"type": "string"},
                    "title": {"type": "string"},
                    "done": {"type": "boolean"}
                }
            }))
            .unwrap(),
        );
        RewriteContext {
            schemas,
            active_version: VersionId::from("main"),
        }
    }

    pub(crate) fn run(sql: &str) -> String {
        let statement = parse_statements(sql).unwrap().remove(0);
        rewrite(statement, &context()).unwrap().to_string()
    }

    #[test]
    fn test_pipeline_order() {
        let names: Vec<&str> = PIPELINE.iter().map(|(name, _)| *name).collect();
        assert_eq!(
            names,
            vec![
                "entity_view_insert",
                "entity_view_update",
                "entity_view_delete",
                "entity_view_select",
                "state_view_expansion",
                "cache_table_rewrite",
                "vtable_select",
            ]
        );
    }

    #[test]
    fn test_unknown_tables_pass_through() {
        assert_eq!(
            run("SELECT a FROM my_table WHERE b = 1"),
            "SELECT a FROM my_table WHERE b = 1"
        );
        assert_eq!(
            run("UPDATE my_table SET a = 2"),
            "UPDATE my_table SET a = 2"
        );
    }

    #[test]
    fn test_entity_view_select_lands_on_vtable() {
        let sql = run("SELECT title FROM mock_task WHERE done = TRUE");
        assert!(sql.contains("FROM lix_internal_state_vtable AS state_all"), "{sql}");
        assert!(sql.contains("lix_json_extract(snapshot_content, '$.title') AS title"), "{sql}");
        assert!(!sql.contains("'$.id'"), "unreferenced properties are pruned: {sql}");
        assert!(sql.contains("state_all.snapshot_content IS NOT NULL"), "{sql}");
    }
}
