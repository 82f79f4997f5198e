//! Censoring of the system metadata tables.
//!
//! Invoked for sessions lacking read-everything. Rows are overwritten, not
//! deleted, so clients keep a structurally intact copy: names and formulas
//! blank out, foreign keys to forbidden parents zero out, column types
//! coerce to the universal "Any". Row identity and table shape survive.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::json;

use crate::data::{CellValue, RowId, TableData, TableId};

use super::evaluator::SessionPermissions;
use super::lattice::{MixedState, TableReadState};

pub const META_TABLES: &str = "_Tables";
pub const META_COLUMNS: &str = "_Tables_column";
pub const META_VIEWS: &str = "_Views";
pub const META_SECTIONS: &str = "_Views_section";
pub const META_FIELDS: &str = "_Views_section_field";

fn set_cell(table: &mut TableData, col_id: &str, index: usize, value: CellValue) {
  if let Some(values) = table.columns.get_mut(col_id) {
    if index < values.len() {
      values[index] = value;
    }
  }
}

fn ref_at(table: &TableData, col_id: &str, index: usize) -> RowId {
  return table
    .columns
    .get(col_id)
    .and_then(|values| values.get(index))
    .and_then(|value| value.as_i64())
    .unwrap_or(0);
}

fn text_at<'a>(table: &'a TableData, col_id: &str, index: usize) -> &'a str {
  return table
    .columns
    .get(col_id)
    .and_then(|values| values.get(index))
    .and_then(|value| value.as_str())
    .unwrap_or("");
}

/// Rewrite the metadata tables in place so nothing names or links to
/// objects the session may not read. Idempotent: a censored row never
/// re-triggers censoring, and overwriting is deterministic.
pub fn censor_meta_tables(
  session: &SessionPermissions,
  tables: &mut BTreeMap<TableId, TableData>,
) {
  // Pass 1: forbidden tables and columns, resolved against `_Tables` row
  // ids so the link structure can be walked.
  let mut forbidden_table_refs: HashSet<RowId> = HashSet::new();
  let mut table_id_by_ref: HashMap<RowId, String> = HashMap::new();

  if let Some(meta_tables) = tables.get(META_TABLES) {
    for (index, row_id) in meta_tables.row_ids.iter().enumerate() {
      let table_id = text_at(meta_tables, "tableId", index);
      if table_id.is_empty() {
        continue;
      }
      table_id_by_ref.insert(*row_id, table_id.to_string());
      if session.table_verdict(table_id).read == TableReadState::Deny {
        forbidden_table_refs.insert(*row_id);
      }
    }
  }

  let mut censored_column_refs: HashSet<RowId> = HashSet::new();
  if let Some(meta_columns) = tables.get(META_COLUMNS) {
    for (index, row_id) in meta_columns.row_ids.iter().enumerate() {
      let parent = ref_at(meta_columns, "parentId", index);
      if forbidden_table_refs.contains(&parent) {
        censored_column_refs.insert(*row_id);
        continue;
      }
      let Some(table_id) = table_id_by_ref.get(&parent) else {
        continue;
      };
      let col_id = text_at(meta_columns, "colId", index);
      if col_id.is_empty() {
        continue;
      }
      if session.column_verdict(table_id, col_id).read == MixedState::Deny {
        censored_column_refs.insert(*row_id);
      }
    }
  }

  // Pass 2: propagate through sections, views and fields.
  let mut censored_section_refs: HashSet<RowId> = HashSet::new();
  let mut censored_view_refs: HashSet<RowId> = HashSet::new();
  if let Some(meta_sections) = tables.get(META_SECTIONS) {
    for (index, row_id) in meta_sections.row_ids.iter().enumerate() {
      if forbidden_table_refs.contains(&ref_at(meta_sections, "tableRef", index)) {
        censored_section_refs.insert(*row_id);
        censored_view_refs.insert(ref_at(meta_sections, "parentId", index));
      }
    }
  }
  censored_view_refs.remove(&0);

  let mut censored_field_indexes: Vec<usize> = vec![];
  if let Some(meta_fields) = tables.get(META_FIELDS) {
    for (index, _row_id) in meta_fields.row_ids.iter().enumerate() {
      let section = ref_at(meta_fields, "parentId", index);
      let col = ref_at(meta_fields, "colRef", index);
      if censored_section_refs.contains(&section) || censored_column_refs.contains(&col) {
        censored_field_indexes.push(index);
      }
    }
  }

  // Pass 3: overwrite.
  if let Some(meta_tables) = tables.get_mut(META_TABLES) {
    for index in 0..meta_tables.row_ids.len() {
      if forbidden_table_refs.contains(&meta_tables.row_ids[index]) {
        set_cell(meta_tables, "tableId", index, json!(""));
        set_cell(meta_tables, "primaryViewId", index, json!(0));
      }
    }
  }

  if let Some(meta_columns) = tables.get_mut(META_COLUMNS) {
    for index in 0..meta_columns.row_ids.len() {
      if !censored_column_refs.contains(&meta_columns.row_ids[index]) {
        continue;
      }
      set_cell(meta_columns, "colId", index, json!(""));
      set_cell(meta_columns, "label", index, json!(""));
      set_cell(meta_columns, "formula", index, json!(""));
      set_cell(meta_columns, "widgetOptions", index, json!(""));
      set_cell(meta_columns, "type", index, json!("Any"));
      if forbidden_table_refs.contains(&ref_at(meta_columns, "parentId", index)) {
        set_cell(meta_columns, "parentId", index, json!(0));
      }
    }
  }

  if let Some(meta_views) = tables.get_mut(META_VIEWS) {
    for index in 0..meta_views.row_ids.len() {
      if censored_view_refs.contains(&meta_views.row_ids[index]) {
        set_cell(meta_views, "name", index, json!(""));
      }
    }
  }

  if let Some(meta_sections) = tables.get_mut(META_SECTIONS) {
    for index in 0..meta_sections.row_ids.len() {
      if censored_section_refs.contains(&meta_sections.row_ids[index]) {
        set_cell(meta_sections, "title", index, json!(""));
        set_cell(meta_sections, "tableRef", index, json!(0));
      }
    }
  }

  if let Some(meta_fields) = tables.get_mut(META_FIELDS) {
    for index in censored_field_indexes {
      set_cell(meta_fields, "filter", index, json!(""));
      set_cell(meta_fields, "colRef", index, json!(0));
    }
  }
}
