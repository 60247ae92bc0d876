//! Minimal CSV plugin.
//!
//! A file becomes three kinds of entities, keyed through the column named
//! by the descriptor metadata `unique_column`:
//! - `header`: `{columnNames}`
//! - `<column>|<value>` rows: `{lineNumber}` (0-based among data rows)
//! - `<column>|<value>|<name>` cells: `{text, rowId}`

use super::{
    three_way, ChangeApplier, ChangeDetector, DetectedChange, Differ, FileData, MergeOutcome,
    Merger, Plugin,
};
use crate::diff::{DiffDetail, DiffStatus};
use crate::error::{LixError, Result};
use crate::types::StateRow;
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub const PLUGIN_KEY: &str = "plugin_csv";
pub const HEADER_SCHEMA_KEY: &str = "plugin_csv_header";
pub const ROW_SCHEMA_KEY: &str = "plugin_csv_row";
pub const CELL_SCHEMA_KEY: &str = "plugin_csv_cell";

const HEADER_ENTITY_ID: &str = "header";

#[derive(Clone, Debug, Default)]
pub struct CsvPlugin;

impl CsvPlugin {
    pub fn new() -> Self {
        Self
    }
}

struct Table {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| LixError::Plugin(format!("csv is not UTF-8: {e}")))?;
        let mut lines = text
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line))
            .filter(|line| !line.is_empty())
            .map(parse_line);
        let header = lines.next().unwrap_or_default();
        Ok(Self {
            header,
            rows: lines.collect(),
        })
    }

    /// Row id to (line number, column -> text).
    fn keyed_rows(&self, unique_column: &str) -> BTreeMap<String, (usize, BTreeMap<String, String>)> {
        let Some(index) = self.header.iter().position(|name| name == unique_column) else {
            return BTreeMap::new();
        };
        let mut keyed = BTreeMap::new();
        for (line, fields) in self.rows.iter().enumerate() {
            let Some(value) = fields.get(index) else {
                continue;
            };
            let cells = self
                .header
                .iter()
                .enumerate()
                .map(|(i, name)| (name.clone(), fields.get(i).cloned().unwrap_or_default()))
                .collect();
            keyed.insert(format!("{unique_column}|{value}"), (line, cells));
        }
        keyed
    }
}

fn parse_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut field)),
            other => field.push(other),
        }
    }
    fields.push(field);
    fields
}

fn quote(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn detected(entity_id: String, schema_key: &str, content: Option<Value>) -> DetectedChange {
    DetectedChange {
        entity_id,
        schema_key: schema_key.to_string(),
        schema_version: "1.0".to_string(),
        snapshot_content: content,
    }
}

impl ChangeDetector for CsvPlugin {
    fn detect_changes(&self, before: Option<&FileData>, after: &FileData) -> Result<Vec<DetectedChange>> {
        let Some(unique_column) = after
            .metadata
            .as_ref()
            .and_then(|m| m.get("unique_column"))
            .and_then(Value::as_str)
        else {
            return Ok(Vec::new());
        };

        let old = match before {
            Some(file) => Table::parse(&file.data)?,
            None => Table {
                header: Vec::new(),
                rows: Vec::new(),
            },
        };
        let new = Table::parse(&after.data)?;
        if !new.header.iter().any(|name| name == unique_column) {
            return Ok(Vec::new());
        }

        let mut changes = Vec::new();
        if old.header != new.header {
            changes.push(detected(
                HEADER_ENTITY_ID.to_string(),
                HEADER_SCHEMA_KEY,
                Some(json!({ "columnNames": new.header })),
            ));
        }

        let old_rows = old.keyed_rows(unique_column);
        let new_rows = new.keyed_rows(unique_column);

        for (row_id, (line, cells)) in &new_rows {
            let previous = old_rows.get(row_id);
            if previous.map_or(true, |(old_line, _)| old_line != line) {
                changes.push(detected(
                    row_id.clone(),
                    ROW_SCHEMA_KEY,
                    Some(json!({ "lineNumber": line })),
                ));
            }
            for name in &new.header {
                let text = cells.get(name).cloned().unwrap_or_default();
                let old_text = previous.and_then(|(_, old_cells)| old_cells.get(name));
                if old_text != Some(&text) {
                    changes.push(detected(
                        format!("{row_id}|{name}"),
                        CELL_SCHEMA_KEY,
                        Some(json!({ "text": text, "rowId": row_id })),
                    ));
                }
            }
            if let Some((_, old_cells)) = previous {
                for name in old_cells.keys().filter(|name| !cells.contains_key(*name)) {
                    changes.push(detected(format!("{row_id}|{name}"), CELL_SCHEMA_KEY, None));
                }
            }
        }

        for (row_id, (_, old_cells)) in &old_rows {
            if new_rows.contains_key(row_id) {
                continue;
            }
            changes.push(detected(row_id.clone(), ROW_SCHEMA_KEY, None));
            for name in old_cells.keys() {
                changes.push(detected(format!("{row_id}|{name}"), CELL_SCHEMA_KEY, None));
            }
        }

        Ok(changes)
    }
}

impl ChangeApplier for CsvPlugin {
    fn apply_changes(&self, _file: &FileData, rows: &[StateRow]) -> Result<Vec<u8>> {
        let mut header: Vec<String> = Vec::new();
        let mut lines: Vec<(u64, String)> = Vec::new();
        let mut cells: BTreeMap<(String, String), String> = BTreeMap::new();

        for row in rows {
            let Some(content) = &row.snapshot_content else {
                continue;
            };
            match row.schema_key.as_str() {
                HEADER_SCHEMA_KEY => {
                    header = content
                        .get("columnNames")
                        .and_then(Value::as_array)
                        .map(|names| names.iter().filter_map(Value::as_str).map(str::to_string).collect())
                        .unwrap_or_default();
                }
                ROW_SCHEMA_KEY => {
                    let line = content.get("lineNumber").and_then(Value::as_u64).unwrap_or(u64::MAX);
                    lines.push((line, row.entity_id.clone()));
                }
                CELL_SCHEMA_KEY => {
                    let Some(row_id) = content.get("rowId").and_then(Value::as_str) else {
                        continue;
                    };
                    let column = row
                        .entity_id
                        .strip_prefix(row_id)
                        .and_then(|rest| rest.strip_prefix('|'))
                        .unwrap_or_default();
                    let text = content.get("text").and_then(Value::as_str).unwrap_or_default();
                    cells.insert((row_id.to_string(), column.to_string()), text.to_string());
                }
                _ => {}
            }
        }

        lines.sort();
        let mut out = vec![header.iter().map(|name| quote(name)).collect::<Vec<_>>().join(",")];
        for (_, row_id) in lines {
            let fields: Vec<String> = header
                .iter()
                .map(|name| {
                    cells
                        .get(&(row_id.clone(), name.clone()))
                        .map(|text| quote(text))
                        .unwrap_or_default()
                })
                .collect();
            out.push(fields.join(","));
        }
        Ok(out.join("\n").into_bytes())
    }
}

impl Merger for CsvPlugin {
    fn merge_cell(
        &self,
        schema_key: &str,
        base: Option<&Value>,
        ours: Option<&Value>,
        theirs: Option<&Value>,
    ) -> MergeOutcome {
        match three_way(base, ours, theirs) {
            // Row order is not content; keep ours.
            MergeOutcome::Conflict if schema_key == ROW_SCHEMA_KEY => match ours {
                Some(value) => MergeOutcome::Content(value.clone()),
                None => MergeOutcome::Deleted,
            },
            outcome => outcome,
        }
    }
}

impl Differ for CsvPlugin {
    fn render_diff(&self, diffs: &[DiffDetail]) -> String {
        let text = |value: &Option<Value>| {
            value
                .as_ref()
                .and_then(|v| v.get("text"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        diffs
            .iter()
            .filter(|detail| detail.row.schema_key == CELL_SCHEMA_KEY)
            .filter_map(|detail| {
                let id = &detail.row.entity_id;
                match detail.row.status {
                    DiffStatus::Created => Some(format!("+ {id}: {}", text(&detail.after))),
                    DiffStatus::Deleted => Some(format!("- {id}: {}", text(&detail.before))),
                    DiffStatus::Updated => Some(format!(
                        "~ {id}: {} -> {}",
                        text(&detail.before),
                        text(&detail.after)
                    )),
                    DiffStatus::Unchanged => None,
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Plugin for CsvPlugin {
    fn key(&self) -> &str {
        PLUGIN_KEY
    }

    fn glob(&self) -> &str {
        "*.csv"
    }

    fn schemas(&self) -> Vec<Value> {
        vec![
            json!({
                "x-lix-key": HEADER_SCHEMA_KEY,
                "x-lix-version": "1.0",
                "type": "object",
                "properties": { "columnNames": { "type": "array" } },
                "required": ["columnNames"]
            }),
            json!({
                "x-lix-key": ROW_SCHEMA_KEY,
                "x-lix-version": "1.0",
                "type": "object",
                "properties": { "lineNumber": { "type": "integer" } },
                "required": ["lineNumber"]
            }),
            json!({
                "x-lix-key": CELL_SCHEMA_KEY,
                "x-lix-version": "1.0",
                "type": "object",
                "properties": {
                    "text": { "type": "string" },
                    "rowId": { "type": "string" }
                },
                "required": ["text", "rowId"]
            }),
        ]
    }

    fn change_detector(&self) -> Option<&dyn ChangeDetector> {
        Some(self)
    }

    fn change_applier(&self) -> Option<&dyn ChangeApplier> {
        Some(self)
    }

    fn merger(&self) -> Option<&dyn Merger> {
        Some(self)
    }

    fn differ(&self) -> Option<&dyn Differ> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeId, CommitId, VersionId, Timestamp};

    fn file(data: &str, unique: Option<&str>) -> FileData {
        FileData {
            id: "f1".into(),
            path: "/people.csv".into(),
            data: data.as_bytes().to_vec(),
            metadata: unique.map(|column| json!({ "unique_column": column })),
        }
    }

    #[test]
    fn test_added_row_yields_row_and_cells() {
        let before = file("Name,Age\nAnna,20\nPeter,50", Some("Name"));
        let after = file("Name,Age\nAnna,20\nPeter,50\nJohn,30", Some("Name"));
        let changes = CsvPlugin.detect_changes(Some(&before), &after).unwrap();

        assert_eq!(
            changes,
            vec![
                detected("Name|John".into(), ROW_SCHEMA_KEY, Some(json!({"lineNumber": 2}))),
                detected(
                    "Name|John|Name".into(),
                    CELL_SCHEMA_KEY,
                    Some(json!({"text": "John", "rowId": "Name|John"}))
                ),
                detected(
                    "Name|John|Age".into(),
                    CELL_SCHEMA_KEY,
                    Some(json!({"text": "30", "rowId": "Name|John"}))
                ),
            ]
        );
    }

    #[test]
    fn test_missing_unique_column_yields_nothing() {
        let after = file("Name,Age\nAnna,20", None);
        assert!(CsvPlugin.detect_changes(None, &after).unwrap().is_empty());
        let after = file("Name,Age\nAnna,20", Some("Email"));
        assert!(CsvPlugin.detect_changes(None, &after).unwrap().is_empty());
    }

    #[test]
    fn test_removed_row_is_tombstoned() {
        let before = file("Name,Age\nAnna,20\nPeter,50", Some("Name"));
        let after = file("Name,Age\nPeter,50", Some("Name"));
        let changes = CsvPlugin.detect_changes(Some(&before), &after).unwrap();
        let deleted: Vec<_> = changes
            .iter()
            .filter(|c| c.snapshot_content.is_none())
            .map(|c| c.entity_id.as_str())
            .collect();
        assert_eq!(deleted, vec!["Name|Anna", "Name|Anna|Age", "Name|Anna|Name"]);
        // Peter moved up one line.
        assert!(changes
            .iter()
            .any(|c| c.entity_id == "Name|Peter" && c.snapshot_content == Some(json!({"lineNumber": 0}))));
    }

    #[test]
    fn test_apply_rebuilds_file() {
        let after = file("Name,Note\n\"Smith, J\",\"say \"\"hi\"\"\"\nAnna,x", Some("Name"));
        let rows: Vec<StateRow> = CsvPlugin
            .detect_changes(None, &after)
            .unwrap()
            .into_iter()
            .map(|change| StateRow {
                entity_id: change.entity_id,
                schema_key: change.schema_key,
                file_id: "f1".into(),
                version_id: VersionId::from("main"),
                plugin_key: PLUGIN_KEY.into(),
                schema_version: change.schema_version,
                snapshot_content: change.snapshot_content,
                change_id: ChangeId::from("c"),
                commit_id: CommitId::from("w"),
                created_at: Timestamp(0),
                updated_at: Timestamp(0),
                inherited_from_version_id: None,
            })
            .collect();
        let bytes = CsvPlugin.apply_changes(&after, &rows).unwrap();
        assert_eq!(bytes, after.data);
    }

    #[test]
    fn test_row_order_conflict_keeps_ours() {
        let base = json!({"lineNumber": 0});
        let ours = json!({"lineNumber": 1});
        let theirs = json!({"lineNumber": 2});
        assert_eq!(
            CsvPlugin.merge_cell(ROW_SCHEMA_KEY, Some(&base), Some(&ours), Some(&theirs)),
            MergeOutcome::Content(ours.clone())
        );
        assert_eq!(
            CsvPlugin.merge_cell(CELL_SCHEMA_KEY, Some(&base), Some(&ours), Some(&theirs)),
            MergeOutcome::Conflict
        );
    }
}
