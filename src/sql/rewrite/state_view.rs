//! `state`: the active version's slice of `state_all`.

use super::{map_tables, RewriteContext, STATE_ALL_VIEW};
use crate::error::Result;
use crate::sql::ast::{
    Delete, Expr, FromClause, Insert, Select, SelectItem, Statement, TableRef, Update,
};

pub const STATE_VIEW: &str = "state";

fn active_filter(context: &RewriteContext) -> Expr {
    Expr::equals(
        Expr::column("version_id"),
        Expr::string(context.active_version.as_str()),
    )
}

fn narrowed(selection: Option<Expr>, context: &RewriteContext) -> Option<Expr> {
    Expr::and(
        Some(active_filter(context)),
        selection.map(|e| Expr::Nested(Box::new(e))),
    )
}

pub(super) fn expand(statement: Statement, context: &RewriteContext) -> Result<Statement> {
    match statement {
        Statement::Select(select) => map_tables(select, &mut |table, _| match table {
            TableRef::Table { name, alias, .. } if name == STATE_VIEW => {
                let inner = Select {
                    projection: vec![SelectItem::Wildcard],
                    from: Some(FromClause {
                        base: TableRef::table(STATE_ALL_VIEW, None),
                        joins: Vec::new(),
                    }),
                    selection: Some(active_filter(context)),
                    ..Select::default()
                };
                Ok(TableRef::Subquery {
                    query: Box::new(inner),
                    alias: alias.unwrap_or(name),
                })
            }
            other => Ok(other),
        })
        .map(Statement::Select),
        Statement::Insert(insert) if insert.table == STATE_VIEW => {
            let mut insert = Insert {
                table: STATE_ALL_VIEW.to_string(),
                ..insert
            };
            if !insert.columns.iter().any(|c| c == "version_id") {
                insert.columns.push("version_id".to_string());
                for row in &mut insert.rows {
                    row.push(Expr::string(context.active_version.as_str()));
                }
            }
            Ok(Statement::Insert(insert))
        }
        Statement::Update(update) if update.table == STATE_VIEW => Ok(Statement::Update(Update {
            table: STATE_ALL_VIEW.to_string(),
            selection: narrowed(update.selection, context),
            assignments: update.assignments,
        })),
        Statement::Delete(delete) if delete.table == STATE_VIEW => Ok(Statement::Delete(Delete {
            table: STATE_ALL_VIEW.to_string(),
            selection: narrowed(delete.selection, context),
        })),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::run;

    #[test]
    fn test_state_reads_active_version() {
        let sql = run("SELECT entity_id FROM state WHERE schema_key = 'lix_key_value'");
        assert!(
            sql.contains("FROM (SELECT * FROM lix_internal_state_vtable AS state_all WHERE version_id = 'main'"),
            "{sql}"
        );
        assert!(sql.ends_with(") AS state WHERE schema_key = 'lix_key_value'"), "{sql}");
    }

    #[test]
    fn test_state_delete_is_narrowed() {
        assert_eq!(
            run("DELETE FROM state WHERE entity_id = 'a'"),
            "DELETE FROM lix_internal_state_vtable WHERE version_id = 'main' AND (entity_id = 'a')"
        );
    }
}
