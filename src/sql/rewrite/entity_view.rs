//! Entity views: one virtual table per declared schema.
//!
//! `<key>` reads and writes the active version (or the version the schema
//! is pinned to); `<key>_all` spans every version and exposes
//! `lixcol_version_id`. Rows land in `state_all` with the properties packed
//! into `snapshot_content`.

use super::{map_tables, on_select, RewriteContext, STATE_ALL_VIEW};
use crate::error::{LixError, Result};
use crate::schema::{LixSchema, VERSION_SCHEMA_KEY};
use crate::sql::ast::{
    Delete, Expr, FromClause, Insert, Select, SelectItem, Statement, TableRef, Update,
};
use crate::types::{LIX_FILE_ID, LIX_OWN_ENTITY_PLUGIN};

/// Metadata columns every entity view exposes, with their state column.
const LIXCOLS: &[(&str, &str)] = &[
    ("lixcol_entity_id", "entity_id"),
    ("lixcol_schema_key", "schema_key"),
    ("lixcol_file_id", "file_id"),
    ("lixcol_plugin_key", "plugin_key"),
    ("lixcol_schema_version", "schema_version"),
    ("lixcol_version_id", "version_id"),
    ("lixcol_change_id", "change_id"),
    ("lixcol_commit_id", "commit_id"),
    ("lixcol_created_at", "created_at"),
    ("lixcol_updated_at", "updated_at"),
    ("lixcol_inherited_from_version_id", "inherited_from_version_id"),
];

struct View<'a> {
    schema: &'a LixSchema,
    /// `None` for `_all` views.
    version: Option<String>,
}

fn resolve<'a>(name: &str, context: &'a RewriteContext) -> Option<View<'a>> {
    if let Some(schema) = context.schemas.get(name) {
        let version = schema
            .pinned_version()
            .unwrap_or(&context.active_version)
            .to_string();
        return Some(View {
            schema,
            version: Some(version),
        });
    }
    let base = name.strip_suffix("_all")?;
    context.schemas.get(base).map(|schema| View {
        schema,
        version: None,
    })
}

fn reject_version_writes(view: &View<'_>) -> Result<()> {
    if view.schema.key == VERSION_SCHEMA_KEY {
        return Err(LixError::InvalidOperation(
            "versions are changed through the version API, not the lix_version view".into(),
        ));
    }
    Ok(())
}

fn extract(property: &str) -> Expr {
    Expr::function(
        "lix_json_extract",
        vec![Expr::column("snapshot_content"), Expr::string(format!("$.{property}"))],
    )
}

fn lixcol(name: &str) -> Option<&'static str> {
    LIXCOLS.iter().find(|(view, _)| *view == name).map(|(_, state)| *state)
}

/// Rewrite a predicate or value over view columns into one over state columns.
fn map_view_columns(expr: Expr, schema: &LixSchema) -> Expr {
    expr.map_columns(&|table, name| {
        if schema.has_property(&name) {
            extract(&name)
        } else if let Some(column) = lixcol(&name) {
            Expr::column(column)
        } else {
            Expr::Column { table, name }
        }
    })
}

/// `schema_key = '<key>' [AND version_id = '<version>']`
fn scope(view: &View<'_>) -> Expr {
    let by_schema = Expr::equals(Expr::column("schema_key"), Expr::string(&view.schema.key));
    match &view.version {
        Some(version) => Expr::and(
            Some(by_schema),
            Some(Expr::equals(Expr::column("version_id"), Expr::string(version))),
        )
        .unwrap_or_else(|| Expr::Literal(true.into())),
        None => by_schema,
    }
}

fn scoped_selection(view: &View<'_>, selection: Option<Expr>) -> Option<Expr> {
    let mapped = selection.map(|expr| Expr::Nested(Box::new(map_view_columns(expr, view.schema))));
    Expr::and(Some(scope(view)), mapped)
}

pub(super) fn rewrite_insert(statement: Statement, context: &RewriteContext) -> Result<Statement> {
    let Statement::Insert(insert) = statement else {
        return Ok(statement);
    };
    let Some(view) = resolve(&insert.table, context) else {
        return Ok(Statement::Insert(insert));
    };
    reject_version_writes(&view)?;
    let schema = view.schema;

    let columns = if insert.columns.is_empty() {
        schema.properties.clone()
    } else {
        insert.columns.clone()
    };
    for column in &columns {
        if !schema.has_property(column) && lixcol(column).is_none() {
            return Err(LixError::Sql(format!(
                "table {} has no column named {column}",
                insert.table
            )));
        }
    }

    let overrides = &schema.override_lixcols;
    let mut rows = Vec::with_capacity(insert.rows.len());
    for values in insert.rows {
        if values.len() != columns.len() {
            return Err(LixError::Sql(format!(
                "{} values for {} columns",
                values.len(),
                columns.len()
            )));
        }
        let supplied = |name: &str| -> Option<Expr> {
            columns
                .iter()
                .position(|c| c == name)
                .map(|i| values[i].clone())
        };

        let mut object_args = Vec::new();
        for (column, value) in columns.iter().zip(&values) {
            if schema.has_property(column) {
                object_args.push(Expr::string(column));
                object_args.push(value.clone());
            }
        }

        let file_id = match &overrides.file_id {
            Some(file) => Expr::string(file),
            None => supplied("lixcol_file_id").unwrap_or_else(|| Expr::string(LIX_FILE_ID)),
        };
        let plugin_key = match &overrides.plugin_key {
            Some(plugin) => Expr::string(plugin),
            None => supplied("lixcol_plugin_key")
                .unwrap_or_else(|| Expr::string(LIX_OWN_ENTITY_PLUGIN)),
        };
        let version_id = match &view.version {
            Some(version) => Expr::string(version),
            None => match overrides.version_id.as_ref() {
                Some(version) => Expr::string(version.as_str()),
                None => supplied("lixcol_version_id")
                    .unwrap_or_else(|| Expr::string(context.active_version.as_str())),
            },
        };

        let mut row = vec![
            Expr::string(&schema.key),
            file_id,
            plugin_key,
            version_id,
            Expr::string(&schema.version),
            Expr::function("lix_json_object", object_args),
        ];
        if let Some(entity_id) = supplied("lixcol_entity_id") {
            row.push(entity_id);
        }
        rows.push(row);
    }

    let mut state_columns: Vec<String> = [
        "schema_key",
        "file_id",
        "plugin_key",
        "version_id",
        "schema_version",
        "snapshot_content",
    ]
    .iter()
    .map(|c| c.to_string())
    .collect();
    if columns.iter().any(|c| c == "lixcol_entity_id") {
        state_columns.push("entity_id".to_string());
    }

    Ok(Statement::Insert(Insert {
        table: STATE_ALL_VIEW.to_string(),
        columns: state_columns,
        rows,
    }))
}

pub(super) fn rewrite_update(statement: Statement, context: &RewriteContext) -> Result<Statement> {
    let Statement::Update(update) = statement else {
        return Ok(statement);
    };
    let Some(view) = resolve(&update.table, context) else {
        return Ok(Statement::Update(update));
    };
    reject_version_writes(&view)?;
    let schema = view.schema;

    let mut args = vec![Expr::column("snapshot_content")];
    for (column, value) in update.assignments {
        if schema.primary_key.contains(&column) {
            return Err(LixError::InvalidOperation(format!(
                "primary key property '{column}' of {} cannot be updated",
                schema.key
            )));
        }
        if !schema.has_property(&column) {
            return Err(LixError::Sql(format!(
                "table {} has no writable column named {column}",
                update.table
            )));
        }
        args.push(Expr::string(format!("$.{column}")));
        args.push(map_view_columns(value, schema));
    }

    Ok(Statement::Update(Update {
        table: STATE_ALL_VIEW.to_string(),
        assignments: vec![(
            "snapshot_content".to_string(),
            Expr::function("lix_json_set", args),
        )],
        selection: scoped_selection(&view, update.selection),
    }))
}

pub(super) fn rewrite_delete(statement: Statement, context: &RewriteContext) -> Result<Statement> {
    let Statement::Delete(delete) = statement else {
        return Ok(statement);
    };
    let Some(view) = resolve(&delete.table, context) else {
        return Ok(Statement::Delete(delete));
    };
    reject_version_writes(&view)?;

    Ok(Statement::Delete(Delete {
        table: STATE_ALL_VIEW.to_string(),
        selection: scoped_selection(&view, delete.selection),
    }))
}

pub(super) fn rewrite_select(statement: Statement, context: &RewriteContext) -> Result<Statement> {
    on_select(statement, |select| expand_views(select, context))
}

fn expand_views(select: Select, context: &RewriteContext) -> Result<Select> {
    let referenced = referenced_columns(&select);
    map_tables(select, &mut |table, _| {
        let TableRef::Table { name, alias, .. } = &table else {
            return Ok(table);
        };
        let Some(view) = resolve(name, context) else {
            return Ok(table);
        };
        let binding = alias.clone().unwrap_or_else(|| name.clone());
        let wants_all = referenced.wildcard_for(&binding);
        let properties: Vec<&String> = view
            .schema
            .properties
            .iter()
            .filter(|p| wants_all || referenced.names.contains(p))
            .collect();

        let mut projection: Vec<SelectItem> = properties
            .into_iter()
            .map(|property| SelectItem::Expr {
                expr: extract(property),
                alias: Some(property.clone()),
            })
            .collect();
        projection.extend(LIXCOLS.iter().map(|(view_column, state_column)| SelectItem::Expr {
            expr: Expr::column(*state_column),
            alias: Some(view_column.to_string()),
        }));

        let inner = Select {
            projection,
            from: Some(FromClause {
                base: TableRef::table(STATE_ALL_VIEW, None),
                joins: Vec::new(),
            }),
            selection: Some(scope(&view)),
            ..Select::default()
        };
        Ok(TableRef::Subquery {
            query: Box::new(inner),
            alias: binding,
        })
    })
}

struct Referenced {
    names: Vec<String>,
    wildcard: bool,
    qualified_wildcards: Vec<String>,
}

impl Referenced {
    fn wildcard_for(&self, binding: &str) -> bool {
        self.wildcard || self.qualified_wildcards.iter().any(|t| t == binding)
    }
}

fn referenced_columns(select: &Select) -> Referenced {
    let mut names = Vec::new();
    for expr in select.expressions() {
        expr.collect_columns(&mut names);
    }
    let mut qualified_wildcards = Vec::new();
    let mut wildcard = false;
    for item in &select.projection {
        match item {
            SelectItem::Wildcard => wildcard = true,
            SelectItem::QualifiedWildcard(table) => qualified_wildcards.push(table.clone()),
            SelectItem::Expr { .. } => {}
        }
    }
    Referenced {
        names,
        wildcard,
        qualified_wildcards,
    }
}
