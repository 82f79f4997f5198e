use std::collections::HashSet;

use crate::data::{BulkColValues, CellValue, ColId, ColValues, RowId, TableId};

/// Column descriptor carried by schema-shaped mutations.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ColInfo {
  pub col_type: String,
  pub formula: String,
}

/// A single mutation targeting one table, as applied to the authoritative
/// store and broadcast to clients. Wire encoding is the transport's concern.
#[derive(Clone, Debug, PartialEq)]
pub enum DocAction {
  AddRecord {
    table_id: TableId,
    row_id: RowId,
    values: ColValues,
  },
  BulkAddRecord {
    table_id: TableId,
    row_ids: Vec<RowId>,
    columns: BulkColValues,
  },
  UpdateRecord {
    table_id: TableId,
    row_id: RowId,
    values: ColValues,
  },
  BulkUpdateRecord {
    table_id: TableId,
    row_ids: Vec<RowId>,
    columns: BulkColValues,
  },
  RemoveRecord {
    table_id: TableId,
    row_id: RowId,
  },
  BulkRemoveRecord {
    table_id: TableId,
    row_ids: Vec<RowId>,
  },
  ReplaceTableData {
    table_id: TableId,
    row_ids: Vec<RowId>,
    columns: BulkColValues,
  },

  AddTable {
    table_id: TableId,
    columns: Vec<(ColId, ColInfo)>,
  },
  RemoveTable {
    table_id: TableId,
  },
  RenameTable {
    table_id: TableId,
    new_table_id: TableId,
  },
  AddColumn {
    table_id: TableId,
    col_id: ColId,
    info: ColInfo,
  },
  RemoveColumn {
    table_id: TableId,
    col_id: ColId,
  },
  RenameColumn {
    table_id: TableId,
    col_id: ColId,
    new_col_id: ColId,
  },
  ModifyColumn {
    table_id: TableId,
    col_id: ColId,
    info: ColInfo,
  },
}

impl DocAction {
  pub fn table_id(&self) -> &str {
    return match self {
      DocAction::AddRecord { table_id, .. }
      | DocAction::BulkAddRecord { table_id, .. }
      | DocAction::UpdateRecord { table_id, .. }
      | DocAction::BulkUpdateRecord { table_id, .. }
      | DocAction::RemoveRecord { table_id, .. }
      | DocAction::BulkRemoveRecord { table_id, .. }
      | DocAction::ReplaceTableData { table_id, .. }
      | DocAction::AddTable { table_id, .. }
      | DocAction::RemoveTable { table_id }
      | DocAction::RenameTable { table_id, .. }
      | DocAction::AddColumn { table_id, .. }
      | DocAction::RemoveColumn { table_id, .. }
      | DocAction::RenameColumn { table_id, .. }
      | DocAction::ModifyColumn { table_id, .. } => table_id,
    };
  }

  pub fn is_schema_action(&self) -> bool {
    return matches!(
      self,
      DocAction::AddTable { .. }
        | DocAction::RemoveTable { .. }
        | DocAction::RenameTable { .. }
        | DocAction::AddColumn { .. }
        | DocAction::RemoveColumn { .. }
        | DocAction::RenameColumn { .. }
        | DocAction::ModifyColumn { .. }
    );
  }

  pub fn is_record_action(&self) -> bool {
    return !self.is_schema_action();
  }

  /// Mutations that introduce rows the recipient has not seen yet.
  pub fn is_add_shaped(&self) -> bool {
    return matches!(
      self,
      DocAction::AddRecord { .. }
        | DocAction::BulkAddRecord { .. }
        | DocAction::ReplaceTableData { .. }
    );
  }

  /// Mutations that rewrite rows in place.
  pub fn is_update_shaped(&self) -> bool {
    return matches!(
      self,
      DocAction::UpdateRecord { .. } | DocAction::BulkUpdateRecord { .. }
    );
  }

  pub fn is_remove_shaped(&self) -> bool {
    return matches!(
      self,
      DocAction::RemoveRecord { .. } | DocAction::BulkRemoveRecord { .. }
    );
  }

  /// Row ids referenced by a record-shaped mutation; empty for schema shapes.
  pub fn row_ids(&self) -> Vec<RowId> {
    return match self {
      DocAction::AddRecord { row_id, .. }
      | DocAction::UpdateRecord { row_id, .. }
      | DocAction::RemoveRecord { row_id, .. } => vec![*row_id],
      DocAction::BulkAddRecord { row_ids, .. }
      | DocAction::BulkUpdateRecord { row_ids, .. }
      | DocAction::BulkRemoveRecord { row_ids, .. }
      | DocAction::ReplaceTableData { row_ids, .. } => row_ids.clone(),
      _ => vec![],
    };
  }

  /// Column ids a schema-shaped mutation touches.
  pub fn touched_col_ids(&self) -> Vec<&str> {
    return match self {
      DocAction::AddTable { columns, .. } => columns.iter().map(|(id, _)| id.as_str()).collect(),
      DocAction::AddColumn { col_id, .. }
      | DocAction::RemoveColumn { col_id, .. }
      | DocAction::ModifyColumn { col_id, .. } => vec![col_id],
      DocAction::RenameColumn { col_id, new_col_id, .. } => vec![col_id, new_col_id],
      _ => vec![],
    };
  }

  /// Restrict a record-shaped mutation to the given rows, preserving shape.
  /// Returns None when no referenced row survives.
  pub fn restrict_rows(&self, keep: &HashSet<RowId>) -> Option<DocAction> {
    fn filter_bulk(
      row_ids: &[RowId],
      columns: &BulkColValues,
      keep: &HashSet<RowId>,
    ) -> Option<(Vec<RowId>, BulkColValues)> {
      let kept: Vec<usize> = (0..row_ids.len())
        .filter(|i| keep.contains(&row_ids[*i]))
        .collect();
      if kept.is_empty() {
        return None;
      }
      let new_row_ids = kept.iter().map(|i| row_ids[*i]).collect();
      let new_columns = columns
        .iter()
        .map(|(col_id, values)| {
          (
            col_id.clone(),
            kept
              .iter()
              .map(|i| values.get(*i).cloned().unwrap_or(CellValue::Null))
              .collect(),
          )
        })
        .collect();
      return Some((new_row_ids, new_columns));
    }

    return match self {
      DocAction::AddRecord { row_id, .. }
      | DocAction::UpdateRecord { row_id, .. }
      | DocAction::RemoveRecord { row_id, .. } => keep.contains(row_id).then(|| self.clone()),
      DocAction::BulkAddRecord { table_id, row_ids, columns } => {
        filter_bulk(row_ids, columns, keep).map(|(row_ids, columns)| DocAction::BulkAddRecord {
          table_id: table_id.clone(),
          row_ids,
          columns,
        })
      }
      DocAction::BulkUpdateRecord { table_id, row_ids, columns } => {
        filter_bulk(row_ids, columns, keep).map(|(row_ids, columns)| DocAction::BulkUpdateRecord {
          table_id: table_id.clone(),
          row_ids,
          columns,
        })
      }
      DocAction::ReplaceTableData { table_id, row_ids, columns } => {
        filter_bulk(row_ids, columns, keep).map(|(row_ids, columns)| DocAction::ReplaceTableData {
          table_id: table_id.clone(),
          row_ids,
          columns,
        })
      }
      DocAction::BulkRemoveRecord { table_id, row_ids } => {
        let row_ids: Vec<RowId> = row_ids.iter().copied().filter(|id| keep.contains(id)).collect();
        if row_ids.is_empty() {
          None
        } else {
          Some(DocAction::BulkRemoveRecord {
            table_id: table_id.clone(),
            row_ids,
          })
        }
      }
      _ => Some(self.clone()),
    };
  }

  /// Drop value columns the predicate rejects. Returns None when a mutation
  /// carrying values loses all of them; shapes without values pass through.
  pub fn retain_columns(&self, keep: impl Fn(&str) -> bool) -> Option<DocAction> {
    fn filter_values(values: &ColValues, keep: impl Fn(&str) -> bool) -> Option<ColValues> {
      let values: ColValues = values
        .iter()
        .filter(|(col_id, _)| keep(col_id))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
      if values.is_empty() {
        return None;
      }
      return Some(values);
    }

    fn filter_columns(
      columns: &BulkColValues,
      keep: impl Fn(&str) -> bool,
    ) -> Option<BulkColValues> {
      let columns: BulkColValues = columns
        .iter()
        .filter(|(col_id, _)| keep(col_id))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
      if columns.is_empty() {
        return None;
      }
      return Some(columns);
    }

    return match self {
      DocAction::AddRecord { table_id, row_id, values } => {
        filter_values(values, keep).map(|values| DocAction::AddRecord {
          table_id: table_id.clone(),
          row_id: *row_id,
          values,
        })
      }
      DocAction::UpdateRecord { table_id, row_id, values } => {
        filter_values(values, keep).map(|values| DocAction::UpdateRecord {
          table_id: table_id.clone(),
          row_id: *row_id,
          values,
        })
      }
      DocAction::BulkAddRecord { table_id, row_ids, columns } => {
        filter_columns(columns, keep).map(|columns| DocAction::BulkAddRecord {
          table_id: table_id.clone(),
          row_ids: row_ids.clone(),
          columns,
        })
      }
      DocAction::BulkUpdateRecord { table_id, row_ids, columns } => {
        filter_columns(columns, keep).map(|columns| DocAction::BulkUpdateRecord {
          table_id: table_id.clone(),
          row_ids: row_ids.clone(),
          columns,
        })
      }
      DocAction::ReplaceTableData { table_id, row_ids, columns } => {
        filter_columns(columns, keep).map(|columns| DocAction::ReplaceTableData {
          table_id: table_id.clone(),
          row_ids: row_ids.clone(),
          columns,
        })
      }
      _ => Some(self.clone()),
    };
  }

  /// Overwrite cells the predicate selects with the censored sentinel.
  pub fn censor_cells(&mut self, censor: impl Fn(RowId, &str) -> bool) {
    match self {
      DocAction::AddRecord { row_id, values, .. }
      | DocAction::UpdateRecord { row_id, values, .. } => {
        for (col_id, value) in values.iter_mut() {
          if censor(*row_id, col_id) {
            *value = crate::data::censored_cell();
          }
        }
      }
      DocAction::BulkAddRecord { row_ids, columns, .. }
      | DocAction::BulkUpdateRecord { row_ids, columns, .. }
      | DocAction::ReplaceTableData { row_ids, columns, .. } => {
        for (col_id, values) in columns.iter_mut() {
          for (index, value) in values.iter_mut().enumerate() {
            if censor(row_ids[index], col_id) {
              *value = crate::data::censored_cell();
            }
          }
        }
      }
      _ => {}
    }
  }
}

/// A user action as received from a client: positionally encoded, element 0
/// is the action name. Kept loose deliberately; only gating logic looks
/// inside, application happens upstream.
#[derive(Clone, Debug, PartialEq)]
pub struct UserAction(pub Vec<CellValue>);

impl UserAction {
  pub fn name(&self) -> Option<&str> {
    return self.0.first().and_then(|v| v.as_str());
  }

  /// The table argument of table-scoped actions (element 1).
  pub fn table_arg(&self) -> Option<&str> {
    return self.0.get(1).and_then(|v| v.as_str());
  }

  /// Wrapped action lists (apply-undo, apply-doc) carry their payload as an
  /// array of positional actions in element 1.
  pub fn nested(&self) -> Vec<UserAction> {
    let Some(CellValue::Array(items)) = self.0.get(1) else {
      return vec![];
    };
    return items
      .iter()
      .filter_map(|item| match item {
        CellValue::Array(parts) => Some(UserAction(parts.clone())),
        _ => None,
      })
      .collect();
  }
}

/// Summary of an applied bundle as shown in activity feeds. Only ever
/// censored wholesale.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ActionGroup {
  pub action_num: i64,
  pub description: String,
  pub actions: Vec<DocAction>,
}

impl ActionGroup {
  pub fn censored(mut self) -> Self {
    self.description.clear();
    self.actions.clear();
    return self;
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn test_restrict_rows() {
    let action = DocAction::BulkUpdateRecord {
      table_id: "T".to_string(),
      row_ids: vec![1, 2, 3],
      columns: BulkColValues::from([("a".to_string(), vec![json!(1), json!(2), json!(3)])]),
    };

    let keep = HashSet::from([1, 3]);
    let Some(DocAction::BulkUpdateRecord { row_ids, columns, .. }) = action.restrict_rows(&keep)
    else {
      panic!("expected bulk update");
    };
    assert_eq!(row_ids, vec![1, 3]);
    assert_eq!(columns.get("a").unwrap(), &vec![json!(1), json!(3)]);

    assert_eq!(action.restrict_rows(&HashSet::new()), None);
  }

  #[test]
  fn test_retain_columns() {
    let action = DocAction::AddRecord {
      table_id: "T".to_string(),
      row_id: 1,
      values: ColValues::from([("pub".to_string(), json!(1)), ("sec".to_string(), json!(2))]),
    };

    let Some(DocAction::AddRecord { values, .. }) = action.retain_columns(|col| col != "sec")
    else {
      panic!("expected add record");
    };
    assert_eq!(values.keys().collect::<Vec<_>>(), vec!["pub"]);

    assert_eq!(action.retain_columns(|_| false), None);

    // Shapes without values are unaffected.
    let remove = DocAction::RemoveRecord {
      table_id: "T".to_string(),
      row_id: 1,
    };
    assert_eq!(remove.retain_columns(|_| false), Some(remove.clone()));
  }

  #[test]
  fn test_censor_cells() {
    let mut action = DocAction::BulkAddRecord {
      table_id: "T".to_string(),
      row_ids: vec![1, 2],
      columns: BulkColValues::from([("a".to_string(), vec![json!(1), json!(2)])]),
    };
    action.censor_cells(|row_id, _col| row_id == 2);

    let DocAction::BulkAddRecord { columns, .. } = &action else {
      panic!("expected bulk add");
    };
    assert_eq!(
      columns.get("a").unwrap(),
      &vec![json!(1), crate::data::censored_cell()]
    );
  }

  #[test]
  fn test_user_action_accessors() {
    let action = UserAction(vec![json!("UpdateRecord"), json!("T"), json!(1)]);
    assert_eq!(action.name(), Some("UpdateRecord"));
    assert_eq!(action.table_arg(), Some("T"));

    let wrapped = UserAction(vec![
      json!("ApplyUndoActions"),
      json!([["RemoveRecord", "T", 1], ["Calculate"]]),
    ]);
    let nested = wrapped.nested();
    assert_eq!(nested.len(), 2);
    assert_eq!(nested[0].name(), Some("RemoveRecord"));
    assert_eq!(nested[1].name(), Some("Calculate"));
  }
}
