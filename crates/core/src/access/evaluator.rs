//! Permission evaluation at column, table and document granularity.
//!
//! A verdict layers up to three rule sets: the column scope, the table
//! default, the document default. Merges are left associative with earlier
//! layers dominating, so collapsing partial evidence at the very end is
//! sound.

use std::collections::HashMap;
use std::sync::Arc;

use log::*;
use parking_lot::Mutex;

use crate::data::{RowRecord, TableId};
use crate::session::UserInfo;

use super::lattice::{
  empty, fold_table, merge, mixed_reduce, to_mixed, weaken, MixedPermissionSet, MixedState,
  PartialPermissionSet, PermissionSet, TablePermissionSet, ALL_BITS,
};
use super::rules::{MatchError, MatchInput, RuleIndex, RuleSet};

/// Evaluate one rule set: walk the body in order, merge matching deltas,
/// then the set's default. A predicate that needs absent row data counts as
/// a match with weakened evidence; any other predicate error is logged and
/// treated as a non-match.
pub fn eval_rule_set(
  rule_set: &RuleSet,
  user: &UserInfo,
  rec: Option<&RowRecord>,
) -> PartialPermissionSet {
  let input = MatchInput { user, rec };
  let mut acc = empty();

  for rule in &rule_set.body {
    match (rule.predicate)(&input) {
      Ok(true) => acc = merge(&acc, &rule.permissions),
      Ok(false) => {}
      Err(MatchError::NeedsRow) => acc = merge(&acc, &weaken(&rule.permissions)),
      Err(err) => {
        warn!("Rule evaluation failed for '{}': {err}", rule.formula);
      }
    }
  }

  return merge(&acc, &rule_set.default);
}

type EvalFn<'a> = dyn FnMut(&Arc<RuleSet>) -> PartialPermissionSet + 'a;

fn column_verdict_with(
  index: &RuleIndex,
  table_id: &str,
  col_id: &str,
  eval: &mut EvalFn<'_>,
) -> MixedPermissionSet {
  let mut merged = empty();
  if let Some(rule_set) = index.column_rule_set(table_id, col_id) {
    merged = merge(&merged, &eval(rule_set));
  }
  if let Some(rule_set) = index.table_default_rule_set(table_id) {
    merged = merge(&merged, &eval(rule_set));
  }
  merged = merge(&merged, &eval(index.doc_default_rule_set()));
  return to_mixed(&merged);
}

fn table_verdict_with(
  index: &RuleIndex,
  table_id: &str,
  eval: &mut EvalFn<'_>,
) -> TablePermissionSet {
  let table_default = index.table_default_rule_set(table_id);
  let doc_default = index.doc_default_rule_set();

  let mut verdicts: Vec<MixedPermissionSet> = vec![];
  for rule_set in index.all_column_rule_sets(table_id) {
    let mut merged = eval(rule_set);
    if let Some(rule_set) = table_default {
      merged = merge(&merged, &eval(rule_set));
    }
    merged = merge(&merged, &eval(doc_default));
    verdicts.push(to_mixed(&merged));
  }

  // Columns without a scoped rule set fall through to the defaults.
  let mut merged = empty();
  if let Some(rule_set) = table_default {
    merged = merge(&merged, &eval(rule_set));
  }
  merged = merge(&merged, &eval(doc_default));
  verdicts.push(to_mixed(&merged));

  return fold_table(&verdicts);
}

fn doc_verdict_with(index: &RuleIndex, eval: &mut EvalFn<'_>) -> MixedPermissionSet {
  let mut verdicts: Vec<MixedPermissionSet> = index
    .all_table_ids()
    .iter()
    .map(|table_id| table_verdict_with(index, table_id, eval).to_mixed())
    .collect();
  verdicts.push(to_mixed(&eval(index.doc_default_rule_set())));

  let slot = |bit| mixed_reduce(verdicts.iter().map(|v| v.get(bit)));
  let mut result = PermissionSet::uniform(MixedState::Mixed);
  for bit in ALL_BITS {
    result.set(bit, slot(bit));
  }
  return result;
}

/// Verdicts for one session, memoized per rule set. Built once per
/// (session, rule-index generation) and cached by the engine; the cache is
/// an explicit side-table evicted on rebuild and session close.
pub struct SessionPermissions {
  index: Arc<RuleIndex>,
  user: UserInfo,
  rule_set_memo: Mutex<HashMap<usize, PartialPermissionSet>>,
  table_memo: Mutex<HashMap<TableId, TablePermissionSet>>,
  doc_memo: Mutex<Option<MixedPermissionSet>>,
}

impl SessionPermissions {
  pub fn new(index: Arc<RuleIndex>, user: UserInfo) -> Self {
    return SessionPermissions {
      index,
      user,
      rule_set_memo: Mutex::new(HashMap::new()),
      table_memo: Mutex::new(HashMap::new()),
      doc_memo: Mutex::new(None),
    };
  }

  pub fn user(&self) -> &UserInfo {
    return &self.user;
  }

  fn partial(&self, rule_set: &Arc<RuleSet>) -> PartialPermissionSet {
    if let Some(cached) = self.rule_set_memo.lock().get(&rule_set.id) {
      return *cached;
    }
    let result = eval_rule_set(rule_set, &self.user, None);
    self.rule_set_memo.lock().insert(rule_set.id, result);
    return result;
  }

  pub fn column_verdict(&self, table_id: &str, col_id: &str) -> MixedPermissionSet {
    return column_verdict_with(&self.index, table_id, col_id, &mut |rs| self.partial(rs));
  }

  pub fn table_verdict(&self, table_id: &str) -> TablePermissionSet {
    if let Some(cached) = self.table_memo.lock().get(table_id) {
      return *cached;
    }
    let result = table_verdict_with(&self.index, table_id, &mut |rs| self.partial(rs));
    self
      .table_memo
      .lock()
      .insert(table_id.to_string(), result);
    return result;
  }

  pub fn doc_verdict(&self) -> MixedPermissionSet {
    if let Some(cached) = *self.doc_memo.lock() {
      return cached;
    }
    let result = doc_verdict_with(&self.index, &mut |rs| self.partial(rs));
    *self.doc_memo.lock() = Some(result);
    return result;
  }
}

/// Short-lived evaluator with a record bound. Never cached: the record
/// permeates every rule's cache key.
pub struct RecordEvaluator<'a> {
  pub index: &'a RuleIndex,
  pub user: &'a UserInfo,
  pub rec: &'a RowRecord,
}

impl RecordEvaluator<'_> {
  fn eval(&self, rule_set: &Arc<RuleSet>) -> PartialPermissionSet {
    return eval_rule_set(rule_set, self.user, Some(self.rec));
  }

  pub fn column_verdict(&self, table_id: &str, col_id: &str) -> MixedPermissionSet {
    return column_verdict_with(self.index, table_id, col_id, &mut |rs| self.eval(rs));
  }

  pub fn table_verdict(&self, table_id: &str) -> TablePermissionSet {
    return table_verdict_with(self.index, table_id, &mut |rs| self.eval(rs));
  }

  /// True when this record is invisible to the user.
  pub fn row_forbidden(&self, table_id: &str) -> bool {
    return self.table_verdict(table_id).read == super::lattice::TableReadState::Deny;
  }
}
