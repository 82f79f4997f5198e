//! Rewriting of outgoing mutations for sessions with partial visibility.
//!
//! The interesting case is a mutation that changes a row's own visibility:
//! the recipient must see a synthetic add or remove instead of the update,
//! so its copy of the table matches what it is allowed to know.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::actions::DocAction;
use crate::data::{ColId, RowId, TableData};
use crate::doc::StoreError;
use crate::session::UserInfo;

use super::evaluator::{RecordEvaluator, SessionPermissions};
use super::lattice::{MixedState, TableReadState};
use super::rules::RuleIndex;

#[derive(Debug, Error)]
pub enum FilterError {
  /// The recipient's schema view has diverged; the caller must drop the
  /// outgoing stream for this session and request a full resync.
  #[error("Client schema view must be reloaded")]
  NeedReload,
  #[error("Snapshot failure: {0}")]
  Snapshot(#[from] StoreError),
  #[error("Broadcast not armed")]
  NotArmed,
}

/// Schema-shaped mutation while filtering is active: invisible columns may
/// change silently, anything else forces a resync.
fn plan_schema_action(
  session: &SessionPermissions,
  action: &DocAction,
) -> Result<Vec<DocAction>, FilterError> {
  let table_id = action.table_id();
  let touched = action.touched_col_ids();
  if !touched.is_empty()
    && touched
      .iter()
      .all(|col_id| session.column_verdict(table_id, col_id).read == MixedState::Deny)
  {
    return Ok(vec![]);
  }
  return Err(FilterError::NeedReload);
}

/// Plan the mutations a restricted recipient should receive for one
/// outgoing mutation. `snapshot` is the (before, after) image of the
/// mutation's target table; only the row-mixed slow path consults it.
pub fn plan_outgoing(
  session: &SessionPermissions,
  index: &RuleIndex,
  action: &DocAction,
  snapshot: Option<&(TableData, TableData)>,
) -> Result<Vec<DocAction>, FilterError> {
  let table_id = action.table_id();
  let verdict = session.table_verdict(table_id);

  match verdict.read {
    TableReadState::Deny => return Ok(vec![]),
    TableReadState::Allow => return Ok(vec![action.clone()]),
    TableReadState::MixedColumns | TableReadState::Mixed => {}
  }

  if action.is_schema_action() {
    return plan_schema_action(session, action);
  }

  if verdict.read == TableReadState::MixedColumns {
    // Column-only mixing: strip forbidden columns, no row work needed.
    return Ok(
      action
        .retain_columns(|col_id| session.column_verdict(table_id, col_id).read != MixedState::Deny)
        .into_iter()
        .collect(),
    );
  }

  // Row-mixed slow path.
  let Some((before, after)) = snapshot else {
    return Err(FilterError::NotArmed);
  };
  let user = session.user();

  let row_forbidden = |table: &TableData, row_id: RowId| -> bool {
    let Some(record) = table.record(row_id) else {
      // A row absent from a snapshot was never visible on that side.
      return true;
    };
    let eval = RecordEvaluator {
      index,
      user,
      rec: &record,
    };
    return eval.row_forbidden(table_id);
  };

  let mut keep: HashSet<RowId> = HashSet::new();
  let mut appearing: Vec<RowId> = vec![];
  let mut disappearing: Vec<RowId> = vec![];

  for row_id in action.row_ids() {
    let forbidden_before = row_forbidden(before, row_id);
    let forbidden_after = row_forbidden(after, row_id);

    match (forbidden_before, forbidden_after) {
      (true, true) => {}
      (false, false) => {
        keep.insert(row_id);
      }
      (false, true) => {
        if action.is_update_shaped() {
          disappearing.push(row_id);
        } else if action.is_remove_shaped() {
          // The mutation already removes the row for everyone.
          keep.insert(row_id);
        }
      }
      (true, false) => {
        if action.is_update_shaped() {
          appearing.push(row_id);
        } else if action.is_add_shaped() {
          keep.insert(row_id);
        }
      }
    }
  }

  let mut planned: Vec<DocAction> = vec![];
  if !appearing.is_empty() {
    planned.push(full_rows_as_bulk_add(table_id, after, &appearing));
  }
  if let Some(mutated) = action.restrict_rows(&keep) {
    planned.push(mutated);
  }
  if !disappearing.is_empty() {
    planned.push(DocAction::BulkRemoveRecord {
      table_id: table_id.to_string(),
      row_ids: disappearing,
    });
  }

  // Column pruning and cell censoring on everything that goes out.
  let mut result: Vec<DocAction> = vec![];
  for planned_action in planned {
    let Some(pruned) = planned_action
      .retain_columns(|col_id| session.column_verdict(table_id, col_id).read != MixedState::Deny)
    else {
      continue;
    };
    if let Some(censored) = censor_rows_and_cells(session, index, table_id, pruned, after) {
      result.push(censored);
    }
  }
  return Ok(result);
}

/// A synthetic bulk-add carrying the full post-state of rows that just
/// became visible.
fn full_rows_as_bulk_add(table_id: &str, after: &TableData, row_ids: &[RowId]) -> DocAction {
  let mut bulk = TableData::new(table_id);
  for row_id in row_ids {
    if let Some(record) = after.record(*row_id) {
      bulk.row_ids.push(*row_id);
      for (col_id, value) in record.values {
        let len = bulk.row_ids.len();
        let column = bulk
          .columns
          .entry(col_id)
          .or_insert_with(|| vec![crate::data::CellValue::Null; len - 1]);
        column.push(value);
      }
    }
  }
  return DocAction::BulkAddRecord {
    table_id: table_id.to_string(),
    row_ids: bulk.row_ids,
    columns: bulk.columns,
  };
}

/// Re-evaluate each row of an outgoing mutation against its post-state:
/// drop rows whose read is denied, blank cells whose per-row column read is
/// anything but allow.
fn censor_rows_and_cells(
  session: &SessionPermissions,
  index: &RuleIndex,
  table_id: &str,
  action: DocAction,
  after: &TableData,
) -> Option<DocAction> {
  if action.is_remove_shaped() {
    return Some(action);
  }

  let user: &UserInfo = session.user();
  let mut keep: HashSet<RowId> = HashSet::new();
  let mut censored_cells: HashSet<(RowId, ColId)> = HashSet::new();

  let col_ids: Vec<ColId> = match &action {
    DocAction::AddRecord { values, .. } | DocAction::UpdateRecord { values, .. } => {
      values.keys().cloned().collect()
    }
    DocAction::BulkAddRecord { columns, .. }
    | DocAction::BulkUpdateRecord { columns, .. }
    | DocAction::ReplaceTableData { columns, .. } => columns.keys().cloned().collect(),
    _ => vec![],
  };

  for row_id in action.row_ids() {
    let Some(record) = after.record(row_id) else {
      continue;
    };
    let eval = RecordEvaluator {
      index,
      user,
      rec: &record,
    };
    if eval.row_forbidden(table_id) {
      continue;
    }
    keep.insert(row_id);
    for col_id in &col_ids {
      if eval.column_verdict(table_id, col_id).read != MixedState::Allow {
        censored_cells.insert((row_id, col_id.clone()));
      }
    }
  }

  let mut action = action.restrict_rows(&keep)?;
  if !censored_cells.is_empty() {
    action.censor_cells(|row_id, col_id| censored_cells.contains(&(row_id, col_id.to_string())));
  }
  return Some(action);
}

/// In-place row and column filtering of a fetched table for one session.
pub fn filter_table_data(
  session: &SessionPermissions,
  index: &RuleIndex,
  data: &mut TableData,
) {
  let table_id = data.table_id.clone();
  let verdict = session.table_verdict(&table_id);

  match verdict.read {
    TableReadState::Allow => return,
    TableReadState::Deny => {
      data.row_ids.clear();
      data.columns.clear();
      return;
    }
    TableReadState::MixedColumns | TableReadState::Mixed => {}
  }

  // Column pruning.
  let denied_cols: Vec<ColId> = data
    .columns
    .keys()
    .filter(|col_id| session.column_verdict(&table_id, col_id).read == MixedState::Deny)
    .cloned()
    .collect();
  for col_id in denied_cols {
    data.columns.remove(&col_id);
  }

  if verdict.read == TableReadState::MixedColumns {
    return;
  }

  // Row filtering and cell censoring against each row's own state.
  let user = session.user();
  let mut kept_indexes: Vec<usize> = vec![];
  let mut censored_cells: HashMap<RowId, Vec<ColId>> = HashMap::new();

  for (row_index, row_id) in data.row_ids.iter().enumerate() {
    let Some(record) = data.record(*row_id) else {
      continue;
    };
    let eval = RecordEvaluator {
      index,
      user,
      rec: &record,
    };
    if eval.row_forbidden(&table_id) {
      continue;
    }
    kept_indexes.push(row_index);
    for col_id in data.columns.keys() {
      if eval.column_verdict(&table_id, col_id).read != MixedState::Allow {
        censored_cells.entry(*row_id).or_default().push(col_id.clone());
      }
    }
  }

  data.row_ids = kept_indexes.iter().map(|i| data.row_ids[*i]).collect();
  for values in data.columns.values_mut() {
    *values = kept_indexes
      .iter()
      .map(|i| values.get(*i).cloned().unwrap_or(crate::data::CellValue::Null))
      .collect();
  }
  for (row_id, col_ids) in censored_cells {
    let Some(row_index) = data.row_index(row_id) else {
      continue;
    };
    for col_id in col_ids {
      if let Some(values) = data.columns.get_mut(&col_id) {
        values[row_index] = crate::data::censored_cell();
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use serde_json::json;

  use super::*;
  use crate::access::evaluator::SessionPermissions;
  use crate::access::rules::build_rule_index;
  use crate::data::{BulkColValues, ColValues};
  use crate::session::Access;
  use crate::test::{doc_with_rules, owner_rules_doc, user, TestCompiler};

  fn owner_table(owners: &[(RowId, &str)]) -> TableData {
    let mut data = TableData::new("T");
    data.row_ids = owners.iter().map(|(id, _)| *id).collect();
    data.columns = BulkColValues::from([
      (
        "owner".to_string(),
        owners.iter().map(|(_, o)| json!(o)).collect(),
      ),
      (
        "x".to_string(),
        owners.iter().map(|(id, _)| json!(id)).collect(),
      ),
    ]);
    return data;
  }

  fn bob_session() -> (Arc<RuleIndex>, SessionPermissions) {
    let doc = owner_rules_doc();
    let index = Arc::new(build_rule_index(&doc, &TestCompiler).unwrap());
    let session = SessionPermissions::new(index.clone(), user(Access::Editors, "bob@x"));
    return (index, session);
  }

  #[test]
  fn test_forbidden_row_update_is_dropped() {
    let (index, session) = bob_session();
    let snapshot = (
      owner_table(&[(1, "alice@x"), (2, "bob@x"), (3, "alice@x")]),
      owner_table(&[(1, "alice@x"), (2, "bob@x"), (3, "alice@x")]),
    );

    let action = DocAction::UpdateRecord {
      table_id: "T".to_string(),
      row_id: 1,
      values: ColValues::from([("x".to_string(), json!(10))]),
    };
    let out = plan_outgoing(&session, &index, &action, Some(&snapshot)).unwrap();
    assert_eq!(out, vec![]);
  }

  #[test]
  fn test_row_becoming_visible_emits_bulk_add() {
    let (index, session) = bob_session();
    let snapshot = (
      owner_table(&[(2, "alice@x")]),
      owner_table(&[(2, "bob@x")]),
    );

    let action = DocAction::UpdateRecord {
      table_id: "T".to_string(),
      row_id: 2,
      values: ColValues::from([("owner".to_string(), json!("bob@x"))]),
    };
    let out = plan_outgoing(&session, &index, &action, Some(&snapshot)).unwrap();

    // The update itself is withheld; the full post-state row appears.
    assert_eq!(
      out,
      vec![DocAction::BulkAddRecord {
        table_id: "T".to_string(),
        row_ids: vec![2],
        columns: BulkColValues::from([
          ("owner".to_string(), vec![json!("bob@x")]),
          ("x".to_string(), vec![json!(2)]),
        ]),
      }]
    );
  }

  #[test]
  fn test_row_becoming_forbidden_emits_bulk_remove() {
    let (index, session) = bob_session();
    let snapshot = (
      owner_table(&[(2, "bob@x")]),
      owner_table(&[(2, "alice@x")]),
    );

    let action = DocAction::UpdateRecord {
      table_id: "T".to_string(),
      row_id: 2,
      values: ColValues::from([("owner".to_string(), json!("alice@x"))]),
    };
    let out = plan_outgoing(&session, &index, &action, Some(&snapshot)).unwrap();

    assert_eq!(
      out,
      vec![DocAction::BulkRemoveRecord {
        table_id: "T".to_string(),
        row_ids: vec![2],
      }]
    );
  }

  #[test]
  fn test_add_and_remove_shapes_keep_their_rows() {
    let (index, session) = bob_session();

    // An add of a row bob may see stays an add.
    let snapshot = (owner_table(&[]), owner_table(&[(5, "bob@x")]));
    let action = DocAction::AddRecord {
      table_id: "T".to_string(),
      row_id: 5,
      values: ColValues::from([("owner".to_string(), json!("bob@x")), ("x".to_string(), json!(5))]),
    };
    let out = plan_outgoing(&session, &index, &action, Some(&snapshot)).unwrap();
    assert_eq!(out, vec![action]);

    // A remove of a visible row stays a remove.
    let snapshot = (owner_table(&[(5, "bob@x")]), owner_table(&[]));
    let action = DocAction::RemoveRecord {
      table_id: "T".to_string(),
      row_id: 5,
    };
    let out = plan_outgoing(&session, &index, &action, Some(&snapshot)).unwrap();
    assert_eq!(out, vec![action]);

    // An add of a foreign row is invisible.
    let snapshot = (owner_table(&[]), owner_table(&[(6, "alice@x")]));
    let action = DocAction::AddRecord {
      table_id: "T".to_string(),
      row_id: 6,
      values: ColValues::from([("owner".to_string(), json!("alice@x"))]),
    };
    let out = plan_outgoing(&session, &index, &action, Some(&snapshot)).unwrap();
    assert_eq!(out, vec![]);
  }

  #[test]
  fn test_denied_table_emits_nothing() {
    let doc = doc_with_rules(&[(1, "T", "*")], &[(1, "", "-R", 1.0)]);
    let index = Arc::new(build_rule_index(&doc, &TestCompiler).unwrap());
    let session = SessionPermissions::new(index.clone(), user(Access::Viewers, "v@x"));

    let actions = [
      DocAction::AddRecord {
        table_id: "T".to_string(),
        row_id: 1,
        values: ColValues::from([("x".to_string(), json!(1))]),
      },
      DocAction::RemoveTable {
        table_id: "T".to_string(),
      },
    ];
    for action in &actions {
      assert_eq!(plan_outgoing(&session, &index, action, None).unwrap(), vec![]);
    }
  }

  #[test]
  fn test_mixed_columns_strips_forbidden_columns() {
    let doc = doc_with_rules(&[(1, "T", "sec")], &[(1, "", "-R", 1.0)]);
    let index = Arc::new(build_rule_index(&doc, &TestCompiler).unwrap());
    let session = SessionPermissions::new(index.clone(), user(Access::Viewers, "v@x"));

    let action = DocAction::BulkAddRecord {
      table_id: "T".to_string(),
      row_ids: vec![1, 2],
      columns: BulkColValues::from([
        ("pub".to_string(), vec![json!("a"), json!("b")]),
        ("sec".to_string(), vec![json!("x"), json!("y")]),
      ]),
    };
    let out = plan_outgoing(&session, &index, &action, None).unwrap();
    assert_eq!(
      out,
      vec![DocAction::BulkAddRecord {
        table_id: "T".to_string(),
        row_ids: vec![1, 2],
        columns: BulkColValues::from([("pub".to_string(), vec![json!("a"), json!("b")])]),
      }]
    );

    // An update touching only the forbidden column vanishes entirely.
    let action = DocAction::UpdateRecord {
      table_id: "T".to_string(),
      row_id: 1,
      values: ColValues::from([("sec".to_string(), json!("z"))]),
    };
    assert_eq!(plan_outgoing(&session, &index, &action, None).unwrap(), vec![]);
  }

  #[test]
  fn test_schema_actions_under_restriction() {
    let doc = doc_with_rules(&[(1, "T", "sec")], &[(1, "", "-R", 1.0)]);
    let index = Arc::new(build_rule_index(&doc, &TestCompiler).unwrap());
    let session = SessionPermissions::new(index.clone(), user(Access::Viewers, "v@x"));

    // Touching only the invisible column: nothing to tell the client.
    let action = DocAction::RenameColumn {
      table_id: "T".to_string(),
      col_id: "sec".to_string(),
      new_col_id: "sec2".to_string(),
    };
    // Renaming to a visible name still only involves a forbidden column if
    // both names are denied; here "sec2" has no rule, so a reload is needed.
    assert!(matches!(
      plan_outgoing(&session, &index, &action, None),
      Err(FilterError::NeedReload)
    ));

    let action = DocAction::ModifyColumn {
      table_id: "T".to_string(),
      col_id: "sec".to_string(),
      info: Default::default(),
    };
    assert_eq!(plan_outgoing(&session, &index, &action, None).unwrap(), vec![]);

    let action = DocAction::AddColumn {
      table_id: "T".to_string(),
      col_id: "fresh".to_string(),
      info: Default::default(),
    };
    assert!(matches!(
      plan_outgoing(&session, &index, &action, None),
      Err(FilterError::NeedReload)
    ));
  }

  #[test]
  fn test_filter_table_data() {
    let (index, session) = bob_session();
    let mut data = owner_table(&[(1, "alice@x"), (2, "bob@x"), (3, "alice@x")]);
    filter_table_data(&session, &index, &mut data);

    assert_eq!(data.row_ids, vec![2]);
    assert_eq!(data.columns.get("owner").unwrap(), &vec![json!("bob@x")]);
    assert_eq!(data.columns.get("x").unwrap(), &vec![json!(2)]);
  }

  #[test]
  fn test_filter_table_data_deny_clears() {
    let doc = doc_with_rules(&[(1, "T", "*")], &[(1, "", "-R", 1.0)]);
    let index = Arc::new(build_rule_index(&doc, &TestCompiler).unwrap());
    let session = SessionPermissions::new(index.clone(), user(Access::Viewers, "v@x"));

    let mut data = owner_table(&[(1, "alice@x")]);
    filter_table_data(&session, &index, &mut data);
    assert!(data.is_empty());
    assert!(data.columns.is_empty());
  }

  #[test]
  fn test_bundle_order_is_preserved() {
    let (index, session) = bob_session();
    let before = owner_table(&[(1, "bob@x"), (2, "alice@x")]);
    let after = owner_table(&[(1, "alice@x"), (2, "bob@x")]);
    let snapshot = (before, after);

    let action = DocAction::BulkUpdateRecord {
      table_id: "T".to_string(),
      row_ids: vec![1, 2],
      columns: BulkColValues::from([(
        "owner".to_string(),
        vec![json!("alice@x"), json!("bob@x")],
      )]),
    };
    let out = plan_outgoing(&session, &index, &action, Some(&snapshot)).unwrap();

    // Synthetic adds precede the (here fully dropped) update, removes last.
    assert_eq!(out.len(), 2);
    assert!(matches!(out[0], DocAction::BulkAddRecord { .. }));
    assert!(matches!(out[1], DocAction::BulkRemoveRecord { .. }));
  }

  #[test]
  fn test_row_dependent_cell_censoring() {
    // Column `sec` readable only on own rows; other columns follow the
    // owner rule. An update touching both rows censors `sec` nowhere it is
    // visible and drops foreign rows outright.
    let doc = doc_with_rules(
      &[(1, "T", "sec"), (2, "T", "*")],
      &[
        (1, "rec.owner == user.Email", "+R", 1.0),
        (1, "", "-R", 2.0),
        (2, "", "+R", 3.0),
      ],
    );
    let index = Arc::new(build_rule_index(&doc, &TestCompiler).unwrap());
    let session = SessionPermissions::new(index.clone(), user(Access::Editors, "bob@x"));

    let mut table = TableData::new("T");
    table.row_ids = vec![1, 2];
    table.columns = BulkColValues::from([
      ("owner".to_string(), vec![json!("alice@x"), json!("bob@x")]),
      ("sec".to_string(), vec![json!("a-secret"), json!("b-secret")]),
    ]);
    let snapshot = (table.clone(), table.clone());

    let action = DocAction::BulkUpdateRecord {
      table_id: "T".to_string(),
      row_ids: vec![1, 2],
      columns: BulkColValues::from([(
        "sec".to_string(),
        vec![json!("a-secret"), json!("b-secret")],
      )]),
    };
    let out = plan_outgoing(&session, &index, &action, Some(&snapshot)).unwrap();

    // Table read is mixed because of the row-dependent `sec` column; both
    // rows stay readable (table default allows), but alice's `sec` cell is
    // blanked.
    assert_eq!(
      out,
      vec![DocAction::BulkUpdateRecord {
        table_id: "T".to_string(),
        row_ids: vec![1, 2],
        columns: BulkColValues::from([(
          "sec".to_string(),
          vec![crate::data::censored_cell(), json!("b-secret")],
        )]),
      }]
    );
  }
}
