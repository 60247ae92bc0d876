//! Evaluates rewritten statements against the engine's tables.
//!
//! Relations are materialized row vectors; joins are nested loops. Writes are
//! accepted only on the state vtable, where they become changes.

use super::ast::{
    BinaryOp, Delete, Expr, FromClause, Insert, Join, JoinKind, Select, SelectItem, Statement,
    TableRef, UnaryOp, Update,
};
use super::rewrite::{scan_hint, CACHE_TABLE, VTABLE};
use super::QueryResult;
use crate::engine::Engine;
use crate::error::{LixError, Result};
use crate::schema::{coerce_content, validate_content, LixSchema, SchemaRegistry, VERSION_SCHEMA_KEY};
use crate::sql::ast::ScanHint;
use crate::types::{
    EntityKey, NewChange, StateRow, VersionId, LIX_FILE_ID, LIX_OWN_ENTITY_PLUGIN,
};
use serde_json::{json, Map, Number, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

const STATE_COLUMNS: &[&str] = &[
    "entity_id",
    "schema_key",
    "file_id",
    "version_id",
    "plugin_key",
    "schema_version",
    "snapshot_content",
    "change_id",
    "commit_id",
    "created_at",
    "updated_at",
    "inherited_from_version_id",
];

#[derive(Clone, Debug)]
struct ColumnRef {
    table: Option<String>,
    name: String,
}

#[derive(Clone, Debug, Default)]
struct Relation {
    columns: Vec<ColumnRef>,
    rows: Vec<Vec<Value>>,
}

impl Relation {
    fn new(names: &[&str], rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns: names
                .iter()
                .map(|name| ColumnRef {
                    table: None,
                    name: name.to_string(),
                })
                .collect(),
            rows,
        }
    }

    fn bound_to(mut self, table: &str) -> Self {
        for column in &mut self.columns {
            column.table = Some(table.to_string());
        }
        self
    }
}

struct Scope<'r> {
    columns: &'r [ColumnRef],
    row: &'r [Value],
    group: Option<&'r [Vec<Value>]>,
}

impl<'r> Scope<'r> {
    fn empty() -> Scope<'static> {
        Scope {
            columns: &[],
            row: &[],
            group: None,
        }
    }

    fn lookup(&self, table: Option<&str>, name: &str) -> Result<Value> {
        let mut found = self.columns.iter().enumerate().filter(|(_, c)| {
            c.name.eq_ignore_ascii_case(name) && table.map_or(true, |t| c.table.as_deref() == Some(t))
        });
        let display = match table {
            Some(t) => format!("{t}.{name}"),
            None => name.to_string(),
        };
        let (index, _) = found
            .next()
            .ok_or_else(|| LixError::Sql(format!("no such column: {display}")))?;
        if table.is_none() && found.next().is_some() {
            return Err(LixError::Sql(format!("ambiguous column name: {display}")));
        }
        Ok(self.row.get(index).cloned().unwrap_or(Value::Null))
    }
}

enum Projected<'s> {
    Index(usize),
    Expr(&'s Expr),
}

pub(crate) struct Executor<'a> {
    engine: &'a mut Engine,
    schemas: &'a SchemaRegistry,
    params: &'a [Value],
}

impl<'a> Executor<'a> {
    pub(crate) fn new(engine: &'a mut Engine, schemas: &'a SchemaRegistry, params: &'a [Value]) -> Self {
        Self {
            engine,
            schemas,
            params,
        }
    }

    pub(crate) fn run(&mut self, statement: &Statement) -> Result<QueryResult> {
        match statement {
            Statement::Select(select) => {
                let (columns, rows) = self.select(select)?;
                Ok(QueryResult {
                    columns,
                    rows,
                    rows_affected: 0,
                })
            }
            Statement::Insert(insert) => self.insert(insert).map(QueryResult::affected),
            Statement::Update(update) => self.update(update).map(QueryResult::affected),
            Statement::Delete(delete) => self.delete(delete).map(QueryResult::affected),
        }
    }

    // --- Reads ---

    fn select(&mut self, select: &Select) -> Result<(Vec<String>, Vec<Vec<Value>>)> {
        let source = match &select.from {
            Some(from) => self.from_clause(from)?,
            None => Relation {
                columns: Vec::new(),
                rows: vec![Vec::new()],
            },
        };

        let mut rows = Vec::with_capacity(source.rows.len());
        for row in source.rows {
            let keep = match &select.selection {
                Some(filter) => {
                    let scope = Scope {
                        columns: &source.columns,
                        row: &row,
                        group: None,
                    };
                    truthy(&self.eval(filter, &scope)?)
                }
                None => true,
            };
            if keep {
                rows.push(row);
            }
        }

        let mut names = Vec::new();
        let mut projected = Vec::new();
        for item in &select.projection {
            match item {
                SelectItem::Wildcard => {
                    for (i, column) in source.columns.iter().enumerate() {
                        names.push(column.name.clone());
                        projected.push(Projected::Index(i));
                    }
                }
                SelectItem::QualifiedWildcard(table) => {
                    let before = projected.len();
                    for (i, column) in source.columns.iter().enumerate() {
                        if column.table.as_deref() == Some(table.as_str()) {
                            names.push(column.name.clone());
                            projected.push(Projected::Index(i));
                        }
                    }
                    if projected.len() == before {
                        return Err(LixError::Sql(format!("no such table: {table}")));
                    }
                }
                SelectItem::Expr { expr, alias } => {
                    names.push(match (alias, expr) {
                        (Some(alias), _) => alias.clone(),
                        (None, Expr::Column { name, .. }) => name.clone(),
                        (None, other) => other.to_string(),
                    });
                    projected.push(Projected::Expr(expr));
                }
            }
        }

        // Each output row with the source row (or group) it came from.
        let grouped = !select.group_by.is_empty() || select.has_aggregates();
        let groups: Vec<(Vec<Value>, Option<Vec<Vec<Value>>>)> = if grouped {
            self.group(&select.group_by, &source.columns, rows)?
                .into_iter()
                .map(|group| {
                    let representative = group
                        .first()
                        .cloned()
                        .unwrap_or_else(|| vec![Value::Null; source.columns.len()]);
                    (representative, Some(group))
                })
                .collect()
        } else {
            rows.into_iter().map(|row| (row, None)).collect()
        };

        let mut output = Vec::with_capacity(groups.len());
        for (row, group) in &groups {
            let scope = Scope {
                columns: &source.columns,
                row,
                group: group.as_deref(),
            };
            let mut values = Vec::with_capacity(projected.len());
            for item in &projected {
                values.push(match item {
                    Projected::Index(i) => row.get(*i).cloned().unwrap_or(Value::Null),
                    Projected::Expr(expr) => self.eval(expr, &scope)?,
                });
            }

            let mut keys = Vec::with_capacity(select.order_by.len());
            for order in &select.order_by {
                keys.push(self.order_key(&order.expr, &names, &values, &scope)?);
            }
            output.push((keys, values));
        }

        if !select.order_by.is_empty() {
            output.sort_by(|(a, _), (b, _)| {
                for ((x, y), order) in a.iter().zip(b).zip(&select.order_by) {
                    let ordering = sort_order(x, y);
                    if ordering != Ordering::Equal {
                        return if order.descending {
                            ordering.reverse()
                        } else {
                            ordering
                        };
                    }
                }
                Ordering::Equal
            });
        }

        let offset = match &select.offset {
            Some(expr) => self.eval(expr, &Scope::empty())?.as_i64().unwrap_or(0).max(0) as usize,
            None => 0,
        };
        let limit = match &select.limit {
            Some(expr) => self
                .eval(expr, &Scope::empty())?
                .as_i64()
                .filter(|l| *l >= 0)
                .map(|l| l as usize),
            None => None,
        };

        let rows = output
            .into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .map(|(_, values)| values)
            .collect();
        Ok((names, rows))
    }

    /// Output alias or 1-based position first, then the source scope.
    fn order_key(&mut self, expr: &Expr, names: &[String], values: &[Value], scope: &Scope<'_>) -> Result<Value> {
        match expr {
            Expr::Column { table: None, name } => {
                if let Some(i) = names.iter().position(|n| n.eq_ignore_ascii_case(name)) {
                    return Ok(values[i].clone());
                }
            }
            Expr::Literal(Value::Number(n)) => {
                if let Some(i) = n.as_u64().filter(|i| *i >= 1 && (*i as usize) <= values.len()) {
                    return Ok(values[i as usize - 1].clone());
                }
            }
            _ => {}
        }
        self.eval(expr, scope)
    }

    fn group(
        &mut self,
        group_by: &[Expr],
        columns: &[ColumnRef],
        rows: Vec<Vec<Value>>,
    ) -> Result<Vec<Vec<Vec<Value>>>> {
        if group_by.is_empty() {
            return Ok(vec![rows]);
        }
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<Vec<Vec<Value>>> = Vec::new();
        for row in rows {
            let scope = Scope {
                columns,
                row: &row,
                group: None,
            };
            let mut key = Vec::with_capacity(group_by.len());
            for expr in group_by {
                key.push(self.eval(expr, &scope)?);
            }
            let key = Value::Array(key).to_string();
            match index.get(&key) {
                Some(&i) => groups[i].push(row),
                None => {
                    index.insert(key, groups.len());
                    groups.push(vec![row]);
                }
            }
        }
        Ok(groups)
    }

    fn from_clause(&mut self, from: &FromClause) -> Result<Relation> {
        let mut relation = self.table(&from.base)?;
        for join in &from.joins {
            let right = self.table(&join.table)?;
            relation = self.join(relation, right, join)?;
        }
        Ok(relation)
    }

    fn join(&mut self, left: Relation, right: Relation, join: &Join) -> Result<Relation> {
        let width = right.columns.len();
        let mut columns = left.columns;
        columns.extend(right.columns);

        let mut rows = Vec::new();
        for l in &left.rows {
            let mut matched = false;
            for r in &right.rows {
                let mut combined = l.clone();
                combined.extend(r.iter().cloned());
                let keep = match &join.on {
                    Some(on) => {
                        let scope = Scope {
                            columns: &columns,
                            row: &combined,
                            group: None,
                        };
                        truthy(&self.eval(on, &scope)?)
                    }
                    None => true,
                };
                if keep {
                    matched = true;
                    rows.push(combined);
                }
            }
            if !matched && join.kind == JoinKind::Left {
                let mut padded = l.clone();
                padded.extend(std::iter::repeat(Value::Null).take(width));
                rows.push(padded);
            }
        }
        Ok(Relation { columns, rows })
    }

    fn table(&mut self, table: &TableRef) -> Result<Relation> {
        match table {
            TableRef::Subquery { query, alias } => {
                let (names, rows) = self.select(query)?;
                let names: Vec<&str> = names.iter().map(String::as_str).collect();
                Ok(Relation::new(&names, rows).bound_to(alias))
            }
            TableRef::Table { name, hint, .. } => {
                let hint = hint.clone().unwrap_or_default();
                Ok(self.scan(name, &hint)?.bound_to(table.binding()))
            }
        }
    }

    fn vtable_rows(&mut self, hint: &ScanHint) -> Result<Vec<StateRow>> {
        let versions: Vec<VersionId> = match &hint.version_id {
            Some(id) => vec![VersionId::from(id.as_str())],
            None => self.engine.db.versions.keys().cloned().collect(),
        };
        let mut rows = Vec::new();
        for version_id in versions {
            if !self.engine.db.versions.contains_key(&version_id) {
                continue;
            }
            rows.extend(
                self.engine
                    .state_with_tombstones(&version_id, hint.schema_key.as_deref())?,
            );
        }
        Ok(rows)
    }

    fn scan(&mut self, name: &str, hint: &ScanHint) -> Result<Relation> {
        let db = &self.engine.db;
        let relation = match name {
            VTABLE => {
                let rows = self.vtable_rows(hint)?;
                Relation::new(STATE_COLUMNS, rows.iter().map(state_values).collect())
            }
            CACHE_TABLE => {
                self.engine.ensure_cache_fresh()?;
                let versions: Vec<VersionId> = self.engine.db.versions.keys().cloned().collect();
                let mut rows = Vec::new();
                for version_id in &versions {
                    for entry in self.engine.cache.own_entries(version_id) {
                        let mut values = state_values(&entry.row);
                        values.push(Value::Bool(entry.inheritance_delete_marker));
                        rows.push(values);
                    }
                }
                let mut columns = STATE_COLUMNS.to_vec();
                columns.push("inheritance_delete_marker");
                Relation::new(&columns, rows)
            }
            "change" => {
                let mut rows = Vec::with_capacity(db.changes.len());
                for change in db.changes.values() {
                    let content = self.engine.snapshots.content(db, &change.snapshot_id)?;
                    rows.push(vec![
                        json!(change.id.as_str()),
                        json!(change.entity_id),
                        json!(change.schema_key),
                        json!(change.schema_version),
                        json!(change.file_id),
                        json!(change.plugin_key),
                        json!(change.snapshot_id.as_str()),
                        json!(change.created_at.0),
                        content.unwrap_or(Value::Null),
                        change.metadata.clone().unwrap_or(Value::Null),
                    ]);
                }
                Relation::new(
                    &[
                        "id",
                        "entity_id",
                        "schema_key",
                        "schema_version",
                        "file_id",
                        "plugin_key",
                        "snapshot_id",
                        "created_at",
                        "snapshot_content",
                        "metadata",
                    ],
                    rows,
                )
            }
            "commit" => Relation::new(
                &["id", "change_set_id", "created_at"],
                db.commits
                    .values()
                    .map(|c| vec![json!(c.id.as_str()), json!(c.change_set_id.as_str()), json!(c.created_at.0)])
                    .collect(),
            ),
            "commit_edge" => Relation::new(
                &["parent_id", "child_id"],
                db.commit_edges
                    .values()
                    .map(|e| vec![json!(e.parent_id.as_str()), json!(e.child_id.as_str())])
                    .collect(),
            ),
            "change_edge" => Relation::new(
                &["parent_id", "child_id"],
                db.change_edges
                    .values()
                    .map(|e| vec![json!(e.parent_id.as_str()), json!(e.child_id.as_str())])
                    .collect(),
            ),
            "change_set" => Relation::new(
                &["id", "immutable_elements"],
                db.change_sets
                    .values()
                    .map(|s| vec![json!(s.id.as_str()), json!(s.immutable_elements)])
                    .collect(),
            ),
            "change_set_element" => Relation::new(
                &["change_set_id", "change_id", "entity_id", "schema_key", "file_id"],
                db.change_set_elements
                    .values()
                    .map(|e| {
                        vec![
                            json!(e.change_set_id.as_str()),
                            json!(e.change_id.as_str()),
                            json!(e.entity_id),
                            json!(e.schema_key),
                            json!(e.file_id),
                        ]
                    })
                    .collect(),
            ),
            "version" => Relation::new(
                &["id", "name", "commit_id", "working_commit_id", "inherits_from_version_id", "hidden"],
                db.versions
                    .values()
                    .map(|v| {
                        vec![
                            json!(v.id.as_str()),
                            json!(v.name),
                            json!(v.commit_id.as_str()),
                            json!(v.working_commit_id.as_str()),
                            json!(v.inherits_from_version_id.as_ref().map(VersionId::as_str)),
                            json!(v.hidden),
                        ]
                    })
                    .collect(),
            ),
            "label" => Relation::new(
                &["id", "name"],
                db.labels
                    .values()
                    .map(|l| vec![json!(l.id.as_str()), json!(l.name)])
                    .collect(),
            ),
            "conflict" => Relation::new(
                &["id", "change_id", "conflicting_change_id", "resolved_by"],
                db.conflicts
                    .values()
                    .map(|c| {
                        vec![
                            json!(c.id.as_str()),
                            json!(c.change_id.as_str()),
                            json!(c.conflicting_change_id.as_str()),
                            json!(c.resolved_by.as_ref().map(|id| id.as_str())),
                        ]
                    })
                    .collect(),
            ),
            "active_version" => Relation::new(
                &["version_id"],
                vec![vec![json!(self.engine.active_version_id()?.as_str())]],
            ),
            other => return Err(LixError::Sql(format!("no such table: {other}"))),
        };
        Ok(relation)
    }

    // --- Writes ---

    fn schema(&self, schema_key: &str) -> Result<LixSchema> {
        if schema_key == VERSION_SCHEMA_KEY {
            return Err(LixError::InvalidOperation(
                "lix_version rows are written by the version API".into(),
            ));
        }
        self.schemas
            .get(schema_key)
            .cloned()
            .ok_or_else(|| LixError::SchemaNotFound(schema_key.to_string()))
    }

    fn insert(&mut self, insert: &Insert) -> Result<usize> {
        if insert.table != VTABLE {
            return Err(LixError::Sql(format!("cannot write to table {}", insert.table)));
        }
        for row in &insert.rows {
            let mut fields = BTreeMap::new();
            for (column, expr) in insert.columns.iter().zip(row) {
                fields.insert(column.as_str(), self.eval(expr, &Scope::empty())?);
            }
            self.insert_state(&fields)?;
        }
        Ok(insert.rows.len())
    }

    /// Upsert one entity from vtable columns.
    fn insert_state(&mut self, fields: &BTreeMap<&str, Value>) -> Result<()> {
        let text = |name: &str| fields.get(name).and_then(Value::as_str).map(str::to_string);
        let schema_key =
            text("schema_key").ok_or_else(|| LixError::Sql("schema_key is required".into()))?;
        let schema = self.schema(&schema_key)?;

        let content = as_json(fields.get("snapshot_content").cloned().unwrap_or(Value::Null));
        let content = coerce_content(&schema, content);
        validate_content(&schema, &content)?;

        let entity_id = match text("entity_id") {
            Some(id) => id,
            None => schema.entity_id_for(&content)?,
        };
        let overrides = &schema.override_lixcols;
        let file_id = overrides
            .file_id
            .clone()
            .or_else(|| text("file_id"))
            .unwrap_or_else(|| LIX_FILE_ID.to_string());
        let plugin_key = overrides
            .plugin_key
            .clone()
            .or_else(|| text("plugin_key"))
            .unwrap_or_else(|| LIX_OWN_ENTITY_PLUGIN.to_string());
        let version_id = match schema.pinned_version() {
            Some(version) => version.clone(),
            None => match text("version_id") {
                Some(id) => VersionId::from(id),
                None => self.engine.active_version_id()?,
            },
        };

        if !schema.immutable {
            let key = EntityKey::new(&entity_id, &schema.key, &file_id);
            if let Some(existing) = self.engine.get_entity(&version_id, &key)? {
                if existing.snapshot_content.as_ref() == Some(&content) {
                    return Ok(());
                }
            }
        }

        let new = NewChange {
            entity_id,
            schema_key: schema.key.clone(),
            schema_version: text("schema_version").unwrap_or_else(|| schema.version.clone()),
            file_id,
            plugin_key,
            snapshot_content: Some(content),
            metadata: fields.get("metadata").filter(|m| !m.is_null()).cloned(),
        };
        self.engine.write_change(&version_id, None, new)?;
        Ok(())
    }

    /// Live vtable rows matching a DML predicate.
    fn matching_rows(&mut self, selection: Option<&Expr>) -> Result<Vec<StateRow>> {
        let hint = scan_hint(selection, VTABLE, true);
        let rows: Vec<StateRow> = self
            .vtable_rows(&hint)?
            .into_iter()
            .filter(|row| !row.is_tombstone())
            .collect();
        let columns = Relation::new(STATE_COLUMNS, Vec::new()).bound_to(VTABLE).columns;

        let mut matched = Vec::new();
        for row in rows {
            let keep = match selection {
                Some(filter) => {
                    let values = state_values(&row);
                    let scope = Scope {
                        columns: &columns,
                        row: &values,
                        group: None,
                    };
                    truthy(&self.eval(filter, &scope)?)
                }
                None => true,
            };
            if keep {
                matched.push(row);
            }
        }
        Ok(matched)
    }

    fn update(&mut self, update: &Update) -> Result<usize> {
        if update.table != VTABLE {
            return Err(LixError::Sql(format!("cannot write to table {}", update.table)));
        }
        let mut content_expr = None;
        for (column, expr) in &update.assignments {
            if column != "snapshot_content" {
                return Err(LixError::InvalidOperation(format!(
                    "state column '{column}' cannot be updated"
                )));
            }
            content_expr = Some(expr);
        }
        let Some(content_expr) = content_expr else {
            return Ok(0);
        };

        let rows = self.matching_rows(update.selection.as_ref())?;
        let columns = Relation::new(STATE_COLUMNS, Vec::new()).bound_to(VTABLE).columns;
        let mut updates = Vec::with_capacity(rows.len());
        for row in rows {
            let values = state_values(&row);
            let scope = Scope {
                columns: &columns,
                row: &values,
                group: None,
            };
            let content = as_json(self.eval(content_expr, &scope)?);
            updates.push((row, content));
        }

        let affected = updates.len();
        for (row, content) in updates {
            let schema = self.schema(&row.schema_key)?;
            let content = coerce_content(&schema, content);
            validate_content(&schema, &content)?;
            if !schema.primary_key.is_empty() && schema.entity_id_for(&content)? != row.entity_id {
                return Err(LixError::InvalidOperation(format!(
                    "update would change the primary key of '{}'",
                    row.entity_id
                )));
            }
            if !schema.immutable && row.snapshot_content.as_ref() == Some(&content) {
                continue;
            }
            let new = NewChange::entity(&row.entity_id, &row.schema_key, Some(content))
                .with_file(&row.file_id, &row.plugin_key)
                .with_schema_version(&row.schema_version);
            self.engine.write_change(&row.version_id, None, new)?;
        }
        Ok(affected)
    }

    fn delete(&mut self, delete: &Delete) -> Result<usize> {
        if delete.table != VTABLE {
            return Err(LixError::Sql(format!("cannot write to table {}", delete.table)));
        }
        let rows = self.matching_rows(delete.selection.as_ref())?;
        for row in &rows {
            if row.schema_key == VERSION_SCHEMA_KEY {
                return Err(LixError::InvalidOperation(
                    "versions are deleted through the version API".into(),
                ));
            }
            let tombstone = NewChange::entity(&row.entity_id, &row.schema_key, None)
                .with_file(&row.file_id, &row.plugin_key)
                .with_schema_version(&row.schema_version);
            self.engine.write_change(&row.version_id, None, tombstone)?;
        }
        Ok(rows.len())
    }

    // --- Expressions ---

    fn eval(&mut self, expr: &Expr, scope: &Scope<'_>) -> Result<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Param(i) => self
                .params
                .get(*i)
                .cloned()
                .ok_or_else(|| LixError::Sql(format!("missing value for parameter {}", i + 1))),
            Expr::Column { table, name } => scope.lookup(table.as_deref(), name),
            Expr::Nested(inner) => self.eval(inner, scope),
            Expr::Unary { op: UnaryOp::Not, expr } => {
                let value = self.eval(expr, scope)?;
                Ok(if value.is_null() {
                    Value::Null
                } else {
                    Value::Bool(!truthy(&value))
                })
            }
            Expr::Unary { op: UnaryOp::Neg, expr } => {
                let value = self.eval(expr, scope)?;
                Ok(arithmetic(BinaryOp::Minus, &json!(0), &value))
            }
            Expr::IsNull { expr, negated } => {
                let value = self.eval(expr, scope)?;
                Ok(Value::Bool(value.is_null() != *negated))
            }
            Expr::InList { expr, list, negated } => {
                let value = self.eval(expr, scope)?;
                if value.is_null() {
                    return Ok(Value::Null);
                }
                let mut found = false;
                for item in list {
                    let item = self.eval(item, scope)?;
                    if compare(&value, &item) == Some(Ordering::Equal) {
                        found = true;
                        break;
                    }
                }
                Ok(Value::Bool(found != *negated))
            }
            Expr::Like { expr, pattern, negated } => {
                let value = self.eval(expr, scope)?;
                let pattern = self.eval(pattern, scope)?;
                match (text_of(&value), text_of(&pattern)) {
                    (Some(value), Some(pattern)) => {
                        Ok(Value::Bool(like(&pattern, &value) != *negated))
                    }
                    _ => Ok(Value::Null),
                }
            }
            Expr::Binary { left, op, right } => self.eval_binary(left, *op, right, scope),
            Expr::Function { name, args, wildcard } => self.eval_function(name, args, *wildcard, scope),
        }
    }

    fn eval_binary(&mut self, left: &Expr, op: BinaryOp, right: &Expr, scope: &Scope<'_>) -> Result<Value> {
        let l = self.eval(left, scope)?;
        match op {
            BinaryOp::And => {
                if !l.is_null() && !truthy(&l) {
                    return Ok(Value::Bool(false));
                }
                let r = self.eval(right, scope)?;
                if !r.is_null() && !truthy(&r) {
                    return Ok(Value::Bool(false));
                }
                Ok(if l.is_null() || r.is_null() {
                    Value::Null
                } else {
                    Value::Bool(true)
                })
            }
            BinaryOp::Or => {
                if truthy(&l) {
                    return Ok(Value::Bool(true));
                }
                let r = self.eval(right, scope)?;
                if truthy(&r) {
                    return Ok(Value::Bool(true));
                }
                Ok(if l.is_null() || r.is_null() {
                    Value::Null
                } else {
                    Value::Bool(false)
                })
            }
            _ => {
                let r = self.eval(right, scope)?;
                Ok(match op {
                    BinaryOp::Eq => comparison(&l, &r, |o| o == Ordering::Equal),
                    BinaryOp::NotEq => comparison(&l, &r, |o| o != Ordering::Equal),
                    BinaryOp::Lt => comparison(&l, &r, |o| o == Ordering::Less),
                    BinaryOp::LtEq => comparison(&l, &r, |o| o != Ordering::Greater),
                    BinaryOp::Gt => comparison(&l, &r, |o| o == Ordering::Greater),
                    BinaryOp::GtEq => comparison(&l, &r, |o| o != Ordering::Less),
                    BinaryOp::Concat => match (text_of(&l), text_of(&r)) {
                        (Some(a), Some(b)) => Value::String(a + &b),
                        _ => Value::Null,
                    },
                    _ => arithmetic(op, &l, &r),
                })
            }
        }
    }

    fn eval_args(&mut self, args: &[Expr], scope: &Scope<'_>) -> Result<Vec<Value>> {
        args.iter().map(|arg| self.eval(arg, scope)).collect()
    }

    fn eval_function(&mut self, name: &str, args: &[Expr], wildcard: bool, scope: &Scope<'_>) -> Result<Value> {
        let name = name.to_ascii_lowercase();
        if matches!(name.as_str(), "count" | "sum" | "min" | "max") {
            return self.aggregate(&name, args, wildcard, scope);
        }
        let values = self.eval_args(args, scope)?;
        let arg = |i: usize| values.get(i).cloned().unwrap_or(Value::Null);

        let value = match name.as_str() {
            "lix_json_extract" => {
                let document = as_json(arg(0));
                let path = text_of(&arg(1)).ok_or_else(|| LixError::Sql("json path must be text".into()))?;
                json_get(&document, &parse_path(&path)?).cloned().unwrap_or(Value::Null)
            }
            "lix_json_object" => {
                if values.len() % 2 != 0 {
                    return Err(LixError::Sql("lix_json_object expects key/value pairs".into()));
                }
                let mut object = Map::new();
                for pair in values.chunks(2) {
                    let key = text_of(&pair[0])
                        .ok_or_else(|| LixError::Sql("lix_json_object keys must be text".into()))?;
                    object.insert(key, pair[1].clone());
                }
                Value::Object(object)
            }
            "lix_json_set" => {
                let mut document = match as_json(arg(0)) {
                    Value::Null => Value::Object(Map::new()),
                    other => other,
                };
                for pair in values.get(1..).unwrap_or(&[]).chunks(2) {
                    let path = pair
                        .first()
                        .and_then(text_of)
                        .ok_or_else(|| LixError::Sql("json path must be text".into()))?;
                    let value = pair.get(1).cloned().unwrap_or(Value::Null);
                    json_set(&mut document, &parse_path(&path)?, value)?;
                }
                document
            }
            "lix_json" => as_json(arg(0)),
            "lix_active_version_id" => json!(self.engine.active_version_id()?.as_str()),
            "lix_uuid_v7" => json!(self.engine.uuid()),
            "lix_timestamp" => json!(self.engine.timestamp().0),
            "lix_random" => Number::from_f64(self.engine.random())
                .map(Value::Number)
                .unwrap_or(Value::Null),
            "coalesce" => values.into_iter().find(|v| !v.is_null()).unwrap_or(Value::Null),
            "lower" => text_of(&arg(0)).map_or(Value::Null, |s| json!(s.to_lowercase())),
            "upper" => text_of(&arg(0)).map_or(Value::Null, |s| json!(s.to_uppercase())),
            "length" => text_of(&arg(0)).map_or(Value::Null, |s| json!(s.chars().count())),
            other => return Err(LixError::Sql(format!("no such function: {other}"))),
        };
        Ok(value)
    }

    fn aggregate(&mut self, name: &str, args: &[Expr], wildcard: bool, scope: &Scope<'_>) -> Result<Value> {
        let group = scope
            .group
            .ok_or_else(|| LixError::Sql(format!("misuse of aggregate function {name}()")))?;
        if wildcard {
            return Ok(json!(group.len()));
        }
        let arg = args
            .first()
            .ok_or_else(|| LixError::Sql(format!("{name}() expects one argument")))?;

        let mut values = Vec::with_capacity(group.len());
        for row in group {
            let row_scope = Scope {
                columns: scope.columns,
                row,
                group: None,
            };
            let value = self.eval(arg, &row_scope)?;
            if !value.is_null() {
                values.push(value);
            }
        }

        Ok(match name {
            "count" => json!(values.len()),
            "sum" => values
                .iter()
                .fold(None, |acc: Option<Value>, v| {
                    Some(match acc {
                        Some(acc) => arithmetic(BinaryOp::Plus, &acc, v),
                        None => arithmetic(BinaryOp::Plus, &json!(0), v),
                    })
                })
                .unwrap_or(Value::Null),
            "min" => values
                .into_iter()
                .min_by(sort_order)
                .unwrap_or(Value::Null),
            _ => values
                .into_iter()
                .max_by(sort_order)
                .unwrap_or(Value::Null),
        })
    }
}

fn state_values(row: &StateRow) -> Vec<Value> {
    vec![
        json!(row.entity_id),
        json!(row.schema_key),
        json!(row.file_id),
        json!(row.version_id.as_str()),
        json!(row.plugin_key),
        json!(row.schema_version),
        row.snapshot_content.clone().unwrap_or(Value::Null),
        json!(row.change_id.as_str()),
        json!(row.commit_id.as_str()),
        json!(row.created_at.0),
        json!(row.updated_at.0),
        json!(row.inherited_from_version_id.as_ref().map(VersionId::as_str)),
    ]
}

/// JSON text becomes its parsed value; everything else is kept.
fn as_json(value: Value) -> Value {
    match value {
        Value::String(text) => match serde_json::from_str::<Value>(&text) {
            Ok(parsed @ (Value::Object(_) | Value::Array(_))) => parsed,
            _ => Value::String(text),
        },
        other => other,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        _ => false,
    }
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn integer_of(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Value {
    if let (Some(a), Some(b)) = (integer_of(l), integer_of(r)) {
        let result = match op {
            BinaryOp::Plus => a.checked_add(b),
            BinaryOp::Minus => a.checked_sub(b),
            BinaryOp::Multiply => a.checked_mul(b),
            BinaryOp::Divide => a.checked_div(b),
            BinaryOp::Modulo => a.checked_rem(b),
            _ => None,
        };
        if let Some(result) = result {
            return json!(result);
        }
        if b == 0 {
            return Value::Null;
        }
    }
    let (Some(a), Some(b)) = (number_of(l), number_of(r)) else {
        return Value::Null;
    };
    let result = match op {
        BinaryOp::Plus => a + b,
        BinaryOp::Minus => a - b,
        BinaryOp::Multiply => a * b,
        BinaryOp::Divide if b != 0.0 => a / b,
        BinaryOp::Modulo if b != 0.0 => a % b,
        _ => return Value::Null,
    };
    Number::from_f64(result).map_or(Value::Null, Value::Number)
}

fn rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) | Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Array(_) | Value::Object(_) => 3,
    }
}

/// Ordering of two non-null values; `None` when either is null.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if a.is_null() || b.is_null() {
        return None;
    }
    Some(match (rank(a), rank(b)) {
        (1, 1) => number_of(a)?.partial_cmp(&number_of(b)?)?,
        (2, 2) => a.as_str().cmp(&b.as_str()),
        (x, y) if x == y => a.to_string().cmp(&b.to_string()),
        (x, y) => x.cmp(&y),
    })
}

/// Total order for sorting: nulls first.
fn sort_order(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => compare(a, b).unwrap_or(Ordering::Equal),
    }
}

fn comparison(a: &Value, b: &Value, accept: impl Fn(Ordering) -> bool) -> Value {
    match compare(a, b) {
        Some(ordering) => Value::Bool(accept(ordering)),
        None => Value::Null,
    }
}

/// Case-insensitive (ASCII) `LIKE` with `%` and `_`.
fn like(pattern: &str, text: &str) -> bool {
    fn matches(p: &[char], t: &[char]) -> bool {
        match p.split_first() {
            None => t.is_empty(),
            Some(('%', rest)) => (0..=t.len()).any(|i| matches(rest, &t[i..])),
            Some(('_', rest)) => !t.is_empty() && matches(rest, &t[1..]),
            Some((c, rest)) => t
                .first()
                .map_or(false, |first| first.eq_ignore_ascii_case(c) && matches(rest, &t[1..])),
        }
    }
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    matches(&p, &t)
}

#[derive(Clone, Debug, PartialEq)]
enum PathSegment {
    Key(String),
    Index(usize),
}

/// `$`, `$.a.b`, `$.list[0]`
fn parse_path(path: &str) -> Result<Vec<PathSegment>> {
    let invalid = || LixError::Sql(format!("invalid json path '{path}'"));
    let rest = path.strip_prefix('$').ok_or_else(invalid)?;
    let mut segments = Vec::new();
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                let mut key = String::new();
                while let Some(&next) = chars.peek() {
                    if next == '.' || next == '[' {
                        break;
                    }
                    key.push(next);
                    chars.next();
                }
                if key.is_empty() {
                    return Err(invalid());
                }
                segments.push(PathSegment::Key(key));
            }
            '[' => {
                let mut digits = String::new();
                for next in chars.by_ref() {
                    if next == ']' {
                        break;
                    }
                    digits.push(next);
                }
                segments.push(PathSegment::Index(digits.parse().map_err(|_| invalid())?));
            }
            _ => return Err(invalid()),
        }
    }
    Ok(segments)
}

fn json_get<'v>(document: &'v Value, path: &[PathSegment]) -> Option<&'v Value> {
    path.iter().try_fold(document, |current, segment| match segment {
        PathSegment::Key(key) => current.get(key.as_str()),
        PathSegment::Index(i) => current.get(*i),
    })
}

fn json_set(document: &mut Value, path: &[PathSegment], value: Value) -> Result<()> {
    let Some((first, rest)) = path.split_first() else {
        *document = value;
        return Ok(());
    };
    match first {
        PathSegment::Key(key) => {
            if !document.is_object() {
                *document = Value::Object(Map::new());
            }
            let Value::Object(map) = document else {
                return Err(LixError::Sql("json_set target is not an object".into()));
            };
            let slot = map.entry(key.clone()).or_insert(Value::Null);
            json_set(slot, rest, value)
        }
        PathSegment::Index(i) => {
            let Value::Array(items) = document else {
                return Err(LixError::Sql("json_set target is not an array".into()));
            };
            if *i > items.len() {
                return Err(LixError::Sql(format!("json array index {i} out of range")));
            }
            if *i == items.len() {
                items.push(Value::Null);
            }
            json_set(&mut items[*i], rest, value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_paths() {
        let doc = json!({"a": {"b": [1, {"c": "x"}]}});
        let path = parse_path("$.a.b[1].c").unwrap();
        assert_eq!(json_get(&doc, &path), Some(&json!("x")));
        assert!(parse_path("a.b").is_err());

        let mut doc = json!({"key": "k"});
        json_set(&mut doc, &parse_path("$.value.nested").unwrap(), json!(2)).unwrap();
        assert_eq!(doc, json!({"key": "k", "value": {"nested": 2}}));
    }

    #[test]
    fn test_like_and_comparison() {
        assert!(like("ab%", "ABC"));
        assert!(like("a_c", "abc"));
        assert!(!like("a_c", "abbc"));
        assert_eq!(compare(&json!(1), &json!(1.0)), Some(Ordering::Equal));
        assert_eq!(compare(&json!(2), &json!("1")), Some(Ordering::Less));
        assert_eq!(compare(&Value::Null, &json!(1)), None);
    }

    #[test]
    fn test_arithmetic_keeps_integers() {
        assert_eq!(arithmetic(BinaryOp::Plus, &json!(1), &json!(2)), json!(3));
        assert_eq!(arithmetic(BinaryOp::Divide, &json!(7), &json!(2)), json!(3));
        assert_eq!(arithmetic(BinaryOp::Divide, &json!(1), &json!(0)), Value::Null);
        assert_eq!(arithmetic(BinaryOp::Multiply, &json!(1.5), &json!(2)), json!(3.0));
    }
}
