//! SQL surface over entity views.
//!
//! Statements are parsed, rewritten by the [`rewrite::PIPELINE`] onto the
//! internal state vtable and evaluated against the engine. Writes become
//! changes in the target version's working change set.

pub mod ast;
mod executor;
pub mod lexer;
pub mod parser;
mod printer;
pub mod rewrite;

use crate::engine::Engine;
use crate::error::Result;
use executor::Executor;
use rewrite::{rewrite, RewriteContext};
use serde_json::{Map, Value};
use tracing::debug;

/// Result of the last statement of an `execute` call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// Rows written by INSERT, UPDATE or DELETE.
    pub rows_affected: usize,
}

impl QueryResult {
    fn affected(rows_affected: usize) -> Self {
        Self {
            rows_affected,
            ..Self::default()
        }
    }

    /// Value of `column` in row `index`.
    pub fn get(&self, index: usize, column: &str) -> Option<&Value> {
        let position = self.columns.iter().position(|c| c == column)?;
        self.rows.get(index)?.get(position)
    }

    /// Rows as JSON objects keyed by column name.
    pub fn objects(&self) -> Vec<Value> {
        self.rows
            .iter()
            .map(|row| {
                let object: Map<String, Value> = self
                    .columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect();
                Value::Object(object)
            })
            .collect()
    }
}

impl Engine {
    fn rewrite_context(&mut self) -> Result<RewriteContext> {
        Ok(RewriteContext {
            schemas: self.schema_registry()?,
            active_version: self.active_version_id()?,
        })
    }

    /// Rewritten SQL for every statement in `sql`, without executing it.
    pub fn preprocess(&mut self, sql: &str) -> Result<Vec<String>> {
        let statements = parser::parse_statements(sql)?;
        let context = self.rewrite_context()?;
        statements
            .into_iter()
            .map(|statement| rewrite(statement, &context).map(|s| s.to_string()))
            .collect()
    }

    /// Execute one or more `;`-separated statements in a single transaction.
    ///
    /// `?` placeholders are numbered across the whole input. Schemas are
    /// reloaded before each statement, so a schema stored by one statement
    /// is usable by the next.
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let statements = parser::parse_statements(sql)?;
        self.transaction(|engine| {
            let mut last = QueryResult::default();
            for statement in statements {
                let context = engine.rewrite_context()?;
                let rewritten = rewrite(statement, &context)?;
                debug!(sql = %rewritten, "executing statement");
                last = Executor::new(engine, &context.schemas, params).run(&rewritten)?;
            }
            Ok(last)
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::Engine;
    use crate::error::LixError;
    use crate::lix::LixConfig;
    use crate::types::VersionId;
    use serde_json::json;

    fn engine() -> Engine {
        Engine::in_memory(&LixConfig::default()).unwrap()
    }

    #[test]
    fn test_key_value_crud() {
        let mut engine = engine();
        let inserted = engine
            .execute(
                "INSERT INTO lix_key_value (key, value) VALUES ('a', 1), ('b', ?)",
                &[json!({"nested": true})],
            )
            .unwrap();
        assert_eq!(inserted.rows_affected, 2);

        let result = engine
            .execute("SELECT key, value FROM lix_key_value ORDER BY key", &[])
            .unwrap();
        assert_eq!(result.columns, vec!["key", "value"]);
        assert_eq!(result.rows, vec![vec![json!("a"), json!(1)], vec![json!("b"), json!({"nested": true})]]);

        let updated = engine
            .execute("UPDATE lix_key_value SET value = value + 1 WHERE key = 'a'", &[])
            .unwrap();
        assert_eq!(updated.rows_affected, 1);
        let result = engine
            .execute("SELECT value FROM lix_key_value WHERE key = 'a'", &[])
            .unwrap();
        assert_eq!(result.rows, vec![vec![json!(2)]]);

        engine
            .execute("DELETE FROM lix_key_value WHERE key = 'b'", &[])
            .unwrap();
        let result = engine
            .execute("SELECT count(*) AS n FROM lix_key_value", &[])
            .unwrap();
        assert_eq!(result.get(0, "n"), Some(&json!(1)));
    }

    #[test]
    fn test_insert_existing_entity_is_upsert() {
        let mut engine = engine();
        engine
            .execute("INSERT INTO lix_key_value (key, value) VALUES ('a', 1)", &[])
            .unwrap();
        engine
            .execute("INSERT INTO lix_key_value (key, value) VALUES ('a', 2)", &[])
            .unwrap();
        let result = engine
            .execute("SELECT value FROM lix_key_value", &[])
            .unwrap();
        assert_eq!(result.rows, vec![vec![json!(2)]]);
    }

    #[test]
    fn test_stored_schema_makes_view_resolvable() {
        let mut engine = engine();
        let schema = json!({
            "x-lix-key": "task",
            "x-lix-primary-key": ["id"],
            "type": "object",
            "properties": {
                "id": {"type": "string"},
                "title": {"type": "string"},
                "done": {"type": "boolean", "default": false}
            },
            "required": ["id", "title"]
        });
        engine
            .execute(
                "INSERT INTO lix_stored_schema (key, version, value) VALUES ('task', '1.0', ?); \
                 INSERT INTO task (id, title) VALUES ('t1', 'write tests')",
                &[schema],
            )
            .unwrap();

        let result = engine
            .execute("SELECT id, done, lixcol_version_id FROM task", &[])
            .unwrap();
        assert_eq!(result.rows, vec![vec![json!("t1"), json!(false), json!("main")]]);

        let err = engine
            .execute("INSERT INTO lix_stored_schema (key, version, value) VALUES ('task', '1.0', lix_json('{}'))", &[])
            .unwrap_err();
        assert!(matches!(err, LixError::ImmutableSchemaViolation { .. }));
    }

    #[test]
    fn test_validation_and_unknown_schema_errors() {
        let mut engine = engine();
        assert!(matches!(
            engine.execute(
                "INSERT INTO lix_internal_state_vtable (schema_key, snapshot_content) VALUES ('nope', lix_json_object('a', 1))",
                &[]
            ),
            Err(LixError::SchemaNotFound(_))
        ));
        assert!(matches!(
            engine.execute("INSERT INTO lix_key_value (key) VALUES ('missing value')", &[]),
            Err(LixError::SchemaValidation { .. })
        ));
        assert!(matches!(
            engine.execute("UPDATE lix_key_value SET key = 'x'", &[]),
            Err(LixError::InvalidOperation(_))
        ));
        assert!(matches!(
            engine.execute("SELECT * FROM no_such_table", &[]),
            Err(LixError::Sql(_))
        ));
    }

    #[test]
    fn test_failed_statement_rolls_back_batch() {
        let mut engine = engine();
        let result = engine.execute(
            "INSERT INTO lix_key_value (key, value) VALUES ('a', 1); SELECT * FROM missing",
            &[],
        );
        assert!(result.is_err());
        let rows = engine.execute("SELECT key FROM lix_key_value", &[]).unwrap();
        assert!(rows.rows.is_empty());
    }

    #[test]
    fn test_all_view_spans_versions() {
        let mut engine = engine();
        engine
            .execute("INSERT INTO lix_key_value_all (key, value, lixcol_version_id) VALUES ('g', 1, 'global')", &[])
            .unwrap();
        let result = engine
            .execute(
                "SELECT lixcol_version_id, lixcol_inherited_from_version_id FROM lix_key_value_all \
                 WHERE key = 'g' ORDER BY lixcol_version_id",
                &[],
            )
            .unwrap();
        assert_eq!(
            result.rows,
            vec![
                vec![json!("global"), json!(null)],
                vec![json!("main"), json!("global")],
            ]
        );

        let main = engine.state_of(&VersionId::from("main"), Some("lix_key_value")).unwrap();
        assert_eq!(main.len(), 1);
    }

    #[test]
    fn test_internal_tables_are_queryable() {
        let mut engine = engine();
        let result = engine
            .execute(
                "SELECT v.name FROM version v JOIN active_version a ON a.version_id = v.id",
                &[],
            )
            .unwrap();
        assert_eq!(result.rows, vec![vec![json!("main")]]);

        let preprocessed = engine.preprocess("SELECT * FROM custom_table").unwrap();
        assert_eq!(preprocessed, vec!["SELECT * FROM custom_table".to_string()]);
    }
}
