use std::collections::BTreeMap;

use crate::actions::DocAction;

pub type TableId = String;
pub type ColId = String;
pub type RowId = i64;
pub type SessionId = String;

/// Cell contents are plain JSON values; richer client-side encodings are a
/// transport concern and never reach this crate.
pub type CellValue = serde_json::Value;

pub type ColValues = BTreeMap<ColId, CellValue>;
pub type BulkColValues = BTreeMap<ColId, Vec<CellValue>>;

/// Sentinel written over cells the recipient may know exist but not read.
pub const CENSORED_CELL: &str = "CENSORED";

pub fn censored_cell() -> CellValue {
  return CellValue::String(CENSORED_CELL.to_string());
}

/// System tables (document metadata, access rules) share a leading
/// underscore. User tables may not use the prefix.
pub fn is_system_table(table_id: &str) -> bool {
  return table_id.starts_with('_');
}

/// One row projected out of a table, the `rec` input of rule predicates.
#[derive(Clone, Debug, PartialEq)]
pub struct RowRecord {
  pub row_id: RowId,
  pub values: ColValues,
}

impl RowRecord {
  pub fn get(&self, col_id: &str) -> CellValue {
    return self.values.get(col_id).cloned().unwrap_or(CellValue::Null);
  }
}

/// Full in-memory contents of one table: parallel row-id and column vectors.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TableData {
  pub table_id: TableId,
  pub row_ids: Vec<RowId>,
  pub columns: BulkColValues,
}

impl TableData {
  pub fn new(table_id: &str) -> Self {
    return TableData {
      table_id: table_id.to_string(),
      row_ids: vec![],
      columns: BulkColValues::new(),
    };
  }

  #[inline]
  pub fn len(&self) -> usize {
    return self.row_ids.len();
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    return self.row_ids.is_empty();
  }

  #[inline]
  pub fn row_index(&self, row_id: RowId) -> Option<usize> {
    return self.row_ids.iter().position(|id| *id == row_id);
  }

  pub fn cell(&self, col_id: &str, row_id: RowId) -> Option<&CellValue> {
    let index = self.row_index(row_id)?;
    return self.columns.get(col_id).and_then(|values| values.get(index));
  }

  /// Project the row with the given id, with every known column present.
  pub fn record(&self, row_id: RowId) -> Option<RowRecord> {
    let index = self.row_index(row_id)?;
    let values: ColValues = self
      .columns
      .iter()
      .map(|(col_id, values)| {
        (
          col_id.clone(),
          values.get(index).cloned().unwrap_or(CellValue::Null),
        )
      })
      .collect();
    return Some(RowRecord { row_id, values });
  }

  pub fn records(&self) -> Vec<RowRecord> {
    return self
      .row_ids
      .iter()
      .filter_map(|row_id| self.record(*row_id))
      .collect();
  }

  pub fn find_row(&self, col_id: &str, value: &CellValue) -> Option<RowId> {
    let values = self.columns.get(col_id)?;
    let index = values.iter().position(|v| v == value)?;
    return self.row_ids.get(index).copied();
  }

  fn upsert_row(&mut self, row_id: RowId, values: &ColValues) {
    let index = match self.row_index(row_id) {
      Some(index) => index,
      None => {
        self.row_ids.push(row_id);
        for column in self.columns.values_mut() {
          column.push(CellValue::Null);
        }
        self.row_ids.len() - 1
      }
    };

    let row_count = self.row_ids.len();
    for (col_id, value) in values {
      let column = self
        .columns
        .entry(col_id.clone())
        .or_insert_with(|| vec![CellValue::Null; row_count]);
      column[index] = value.clone();
    }
  }

  fn remove_row(&mut self, row_id: RowId) {
    let Some(index) = self.row_index(row_id) else {
      return;
    };
    self.row_ids.remove(index);
    for column in self.columns.values_mut() {
      if index < column.len() {
        column.remove(index);
      }
    }
  }

  /// Apply a single mutation in memory. Used by snapshot reconstruction to
  /// roll partial table images backwards and forwards; unknown rows are
  /// created, missing rows ignored.
  pub fn apply(&mut self, action: &DocAction) {
    match action {
      DocAction::AddRecord { row_id, values, .. } | DocAction::UpdateRecord { row_id, values, .. } => {
        self.upsert_row(*row_id, values);
      }
      DocAction::BulkAddRecord { row_ids, columns, .. }
      | DocAction::BulkUpdateRecord { row_ids, columns, .. } => {
        for (position, row_id) in row_ids.iter().enumerate() {
          let values: ColValues = columns
            .iter()
            .map(|(col_id, values)| {
              (
                col_id.clone(),
                values.get(position).cloned().unwrap_or(CellValue::Null),
              )
            })
            .collect();
          self.upsert_row(*row_id, &values);
        }
      }
      DocAction::RemoveRecord { row_id, .. } => {
        self.remove_row(*row_id);
      }
      DocAction::BulkRemoveRecord { row_ids, .. } => {
        for row_id in row_ids {
          self.remove_row(*row_id);
        }
      }
      DocAction::ReplaceTableData { row_ids, columns, .. } => {
        self.row_ids = row_ids.clone();
        self.columns = columns.clone();
      }
      DocAction::AddColumn { col_id, .. } => {
        let row_count = self.row_ids.len();
        self
          .columns
          .entry(col_id.clone())
          .or_insert_with(|| vec![CellValue::Null; row_count]);
      }
      DocAction::RemoveColumn { col_id, .. } => {
        self.columns.remove(col_id);
      }
      DocAction::RenameColumn { col_id, new_col_id, .. } => {
        if let Some(values) = self.columns.remove(col_id) {
          self.columns.insert(new_col_id.clone(), values);
        }
      }
      DocAction::RenameTable { new_table_id, .. } => {
        self.table_id = new_table_id.clone();
      }
      DocAction::ModifyColumn { .. }
      | DocAction::AddTable { .. }
      | DocAction::RemoveTable { .. } => {}
    }
  }
}
