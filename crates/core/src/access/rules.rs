//! Compiled access rules, indexed by scope.
//!
//! Rules are authored in the rule metadata tables (`_Access_resource`,
//! `_Access_rule`) and compiled into match predicates by an external
//! compiler. The index built here is immutable; rebuilds construct a fresh
//! index and swap it in atomically.

use std::collections::HashMap;
use std::sync::Arc;

use itertools::Itertools;
use log::*;
use thiserror::Error;

use crate::data::{ColId, RowRecord, TableId};
use crate::doc::{DocReader, StoreError};
use crate::session::{Access, UserInfo, BUILTIN_USER_FIELDS};

use super::lattice::{
  empty, PartialPermissionSet, PermState, PermissionBit,
};

pub const RESOURCES_TABLE: &str = "_Access_resource";
pub const RULES_TABLE: &str = "_Access_rule";

/// Failure to compile rule source text into a predicate.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct RuleCompileError(pub String);

/// Failure raised by a compiled predicate at evaluation time. `NeedsRow` is
/// the distinguished signal that the rule references record fields and no
/// record was supplied; everything else is treated as a non-match.
#[derive(Debug, Clone, Error)]
pub enum MatchError {
  #[error("row data required")]
  NeedsRow,
  #[error("{0}")]
  Eval(String),
}

/// Input of a match predicate.
pub struct MatchInput<'a> {
  pub user: &'a UserInfo,
  pub rec: Option<&'a RowRecord>,
}

pub type MatchFn = Arc<dyn Fn(&MatchInput<'_>) -> Result<bool, MatchError> + Send + Sync>;

/// External compiler turning rule source text into a match predicate.
pub trait RuleCompiler: Send + Sync {
  fn compile(&self, formula: &str) -> Result<MatchFn, RuleCompileError>;
}

/// Configuration errors surfaced synchronously from a rebuild. The previous
/// rule index stays in force when any of these fire.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("Invalid rule config: {0}")]
  Invalid(String),
  #[error("Document-level rule set cannot name specific columns")]
  DocScopeWithColumns,
  #[error("Duplicate table default rule set for table {0}")]
  DuplicateTableDefault(TableId),
  #[error("Duplicate user attribute: {0}")]
  DuplicateUserAttribute(String),
  #[error("Invalid permissions text: {0}")]
  BadPermissions(String),
  #[error("Rule compile error: {0}")]
  Compile(#[from] RuleCompileError),
  #[error("Store error: {0}")]
  Store(#[from] StoreError),
}

/// Scope a rule set applies to.
#[derive(Clone, Debug, PartialEq)]
pub enum RuleScope {
  Doc,
  TableDefault(TableId),
  Columns(TableId, Vec<ColId>),
}

/// One compiled rule: predicate, source text, permission delta.
#[derive(Clone)]
pub struct Rule {
  pub formula: String,
  pub predicate: MatchFn,
  pub permissions: PartialPermissionSet,
}

impl std::fmt::Debug for Rule {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    return f
      .debug_struct("Rule")
      .field("formula", &self.formula)
      .field("permissions", &self.permissions)
      .finish();
  }
}

/// An ordered bundle of rules plus a default applied after the body.
#[derive(Debug)]
pub struct RuleSet {
  /// Dense id used as memoization key.
  pub id: usize,
  pub scope: RuleScope,
  pub body: Vec<Rule>,
  pub default: PartialPermissionSet,
}

/// A (name, source-table, source-column, lookup-path) quadruple enriching
/// the user record at session evaluation time.
#[derive(Clone, Debug, PartialEq)]
pub struct UserAttributeRule {
  pub name: String,
  pub table_id: TableId,
  pub lookup_col_id: ColId,
  /// Dotted path resolved against the already-enriched user.
  pub char_path: String,
}

/// Immutable index over all compiled rule sets of a document.
pub struct RuleIndex {
  rule_sets: Vec<Arc<RuleSet>>,
  column_index: HashMap<(TableId, ColId), usize>,
  table_columns: HashMap<TableId, Vec<usize>>,
  table_defaults: HashMap<TableId, usize>,
  doc_default: usize,
  table_ids: Vec<TableId>,
  attribute_rules: Vec<UserAttributeRule>,
  have_rules: bool,
}

impl RuleIndex {
  pub fn column_rule_set(&self, table_id: &str, col_id: &str) -> Option<&Arc<RuleSet>> {
    let index = self
      .column_index
      .get(&(table_id.to_string(), col_id.to_string()))?;
    return self.rule_sets.get(*index);
  }

  pub fn all_column_rule_sets(&self, table_id: &str) -> Vec<&Arc<RuleSet>> {
    let Some(indexes) = self.table_columns.get(table_id) else {
      return vec![];
    };
    return indexes.iter().filter_map(|i| self.rule_sets.get(*i)).collect();
  }

  pub fn table_default_rule_set(&self, table_id: &str) -> Option<&Arc<RuleSet>> {
    let index = self.table_defaults.get(table_id)?;
    return self.rule_sets.get(*index);
  }

  pub fn doc_default_rule_set(&self) -> &Arc<RuleSet> {
    return &self.rule_sets[self.doc_default];
  }

  /// Tables carrying any user-authored rule set.
  pub fn all_table_ids(&self) -> &[TableId] {
    return &self.table_ids;
  }

  pub fn attribute_rules(&self) -> &[UserAttributeRule] {
    return &self.attribute_rules;
  }

  /// True iff any user-authored rule set exists. When false, callers skip
  /// row and column filtering entirely.
  pub fn have_rules(&self) -> bool {
    return self.have_rules;
  }

  pub fn rule_set_count(&self) -> usize {
    return self.rule_sets.len();
  }
}

/// Parse a permission delta like `+R`, `-RUCDS` or `+R-U`. `all` and `none`
/// are accepted as shorthands.
pub fn parse_permissions_text(text: &str) -> Result<PartialPermissionSet, ConfigError> {
  let mut permissions = empty();

  match text {
    "all" => return Ok(permissions.map(|_| PermState::Allow)),
    "none" => return Ok(permissions.map(|_| PermState::Deny)),
    _ => {}
  }

  let mut state: Option<PermState> = None;
  for c in text.chars() {
    match c {
      '+' => state = Some(PermState::Allow),
      '-' => state = Some(PermState::Deny),
      _ => {
        let bit = match c {
          'R' => PermissionBit::Read,
          'U' => PermissionBit::Update,
          'C' => PermissionBit::Create,
          'D' => PermissionBit::Delete,
          'S' => PermissionBit::SchemaEdit,
          _ => {
            return Err(ConfigError::BadPermissions(format!(
              "unknown bit '{c}' in '{text}'"
            )));
          }
        };
        let Some(value) = state else {
          return Err(ConfigError::BadPermissions(format!(
            "bit '{c}' before '+' or '-' in '{text}'"
          )));
        };
        permissions.set(bit, value);
      }
    }
  }

  if state.is_none() && !text.is_empty() {
    return Err(ConfigError::BadPermissions(text.to_string()));
  }
  return Ok(permissions);
}

fn builtin_rule(
  formula: &str,
  predicate: impl Fn(&MatchInput<'_>) -> Result<bool, MatchError> + Send + Sync + 'static,
  permissions: PartialPermissionSet,
) -> Rule {
  return Rule {
    formula: formula.to_string(),
    predicate: Arc::new(predicate),
    permissions,
  };
}

/// The two synthetic rules every document-default rule set ends with:
/// owners and editors hold everything, viewers read-only. They come after
/// user rules so user rules can override.
fn builtin_default_rules() -> Vec<Rule> {
  let full = empty().map(|_| PermState::Allow);
  let read_only = {
    let mut p = empty().map(|_| PermState::Deny);
    p.read = PermState::Allow;
    p
  };

  return vec![
    builtin_rule(
      "user.Access in ['owners', 'editors']",
      |input| Ok(matches!(input.user.access, Access::Owners | Access::Editors)),
      full,
    ),
    builtin_rule(
      "user.Access == 'viewers'",
      |input| Ok(input.user.access == Access::Viewers),
      read_only,
    ),
  ];
}

#[derive(Debug)]
struct RawResource {
  row_id: i64,
  table_id: String,
  col_ids: String,
}

#[derive(Debug)]
struct RawRule {
  resource: i64,
  formula: String,
  permissions_text: String,
  user_attributes: Option<serde_json::Value>,
  rule_pos: f64,
}

fn read_resources(doc: &dyn DocReader) -> Vec<RawResource> {
  let Some(table) = doc.table_data(RESOURCES_TABLE) else {
    return vec![];
  };
  return table
    .records()
    .into_iter()
    .map(|rec| RawResource {
      row_id: rec.row_id,
      table_id: rec.get("tableId").as_str().unwrap_or_default().to_string(),
      col_ids: rec.get("colIds").as_str().unwrap_or_default().to_string(),
    })
    .collect();
}

fn read_rules(doc: &dyn DocReader) -> Vec<RawRule> {
  let Some(table) = doc.table_data(RULES_TABLE) else {
    return vec![];
  };
  let mut rules: Vec<RawRule> = table
    .records()
    .into_iter()
    .map(|rec| RawRule {
      resource: rec.get("resource").as_i64().unwrap_or_default(),
      formula: rec.get("formula").as_str().unwrap_or_default().to_string(),
      permissions_text: rec
        .get("permissionsText")
        .as_str()
        .unwrap_or_default()
        .to_string(),
      user_attributes: match rec.get("userAttributes") {
        serde_json::Value::Null => None,
        serde_json::Value::String(text) if text.is_empty() => None,
        serde_json::Value::String(text) => serde_json::from_str(&text).ok(),
        value => Some(value),
      },
      rule_pos: rec.get("rulePos").as_f64().unwrap_or_default(),
    })
    .collect();
  rules.sort_by(|a, b| a.rule_pos.total_cmp(&b.rule_pos));
  return rules;
}

fn parse_attribute_rule(value: &serde_json::Value) -> Result<UserAttributeRule, ConfigError> {
  let get = |key: &str| -> Result<String, ConfigError> {
    return value
      .get(key)
      .and_then(|v| v.as_str())
      .map(str::to_string)
      .ok_or_else(|| ConfigError::Invalid(format!("user attribute misses '{key}': {value}")));
  };
  return Ok(UserAttributeRule {
    name: get("name")?,
    table_id: get("tableId")?,
    lookup_col_id: get("lookupColId")?,
    char_path: get("charId")?,
  });
}

/// Build a fresh index from the current contents of the rule tables.
pub fn build_rule_index(
  doc: &dyn DocReader,
  compiler: &dyn RuleCompiler,
) -> Result<RuleIndex, ConfigError> {
  let resources = read_resources(doc);
  let raw_rules = read_rules(doc);

  // Rules grouped per resource, in rulePos order.
  let mut per_resource: HashMap<i64, Vec<&RawRule>> = HashMap::new();
  let mut attribute_rules: Vec<UserAttributeRule> = vec![];
  let mut user_rule_count: usize = 0;

  for raw in &raw_rules {
    if let Some(ref attributes) = raw.user_attributes {
      let rule = parse_attribute_rule(attributes)?;
      if BUILTIN_USER_FIELDS.contains(&rule.name.as_str()) {
        warn!("Dropping user attribute shadowing built-in field: {}", rule.name);
        continue;
      }
      if attribute_rules.iter().any(|r| r.name == rule.name) {
        return Err(ConfigError::DuplicateUserAttribute(rule.name));
      }
      attribute_rules.push(rule);
      user_rule_count += 1;
      continue;
    }

    per_resource.entry(raw.resource).or_default().push(raw);
    user_rule_count += 1;
  }

  let compile_body = |rules: &[&RawRule]| -> Result<Vec<Rule>, ConfigError> {
    return rules
      .iter()
      .map(|raw| {
        let predicate: MatchFn = if raw.formula.is_empty() {
          // An empty formula is the catch-all rule.
          Arc::new(|_: &MatchInput<'_>| Ok(true))
        } else {
          compiler.compile(&raw.formula)?
        };
        return Ok(Rule {
          formula: raw.formula.clone(),
          predicate,
          permissions: parse_permissions_text(&raw.permissions_text)?,
        });
      })
      .collect();
  };

  let mut rule_sets: Vec<Arc<RuleSet>> = vec![];
  let mut column_index: HashMap<(TableId, ColId), usize> = HashMap::new();
  let mut table_columns: HashMap<TableId, Vec<usize>> = HashMap::new();
  let mut table_defaults: HashMap<TableId, usize> = HashMap::new();
  let mut doc_rules: Vec<Rule> = vec![];
  let mut saw_doc_resource = false;

  for resource in &resources {
    let Some(raw) = per_resource.get(&resource.row_id) else {
      continue;
    };
    let body = compile_body(raw)?;

    if resource.table_id == "*" {
      if resource.col_ids != "*" {
        return Err(ConfigError::DocScopeWithColumns);
      }
      if saw_doc_resource {
        return Err(ConfigError::Invalid(
          "more than one document-default rule set".to_string(),
        ));
      }
      saw_doc_resource = true;
      doc_rules = body;
      continue;
    }

    let table_id = resource.table_id.clone();
    if resource.col_ids == "*" {
      if table_defaults.contains_key(&table_id) {
        return Err(ConfigError::DuplicateTableDefault(table_id));
      }
      let id = rule_sets.len();
      rule_sets.push(Arc::new(RuleSet {
        id,
        scope: RuleScope::TableDefault(table_id.clone()),
        body,
        default: empty(),
      }));
      table_defaults.insert(table_id, id);
    } else {
      let col_ids: Vec<ColId> = resource
        .col_ids
        .split(',')
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
      if col_ids.is_empty() {
        return Err(ConfigError::Invalid(format!(
          "rule resource for table {table_id} names no columns"
        )));
      }

      let id = rule_sets.len();
      rule_sets.push(Arc::new(RuleSet {
        id,
        scope: RuleScope::Columns(table_id.clone(), col_ids.clone()),
        body,
        default: empty(),
      }));
      table_columns.entry(table_id.clone()).or_default().push(id);
      for col_id in col_ids {
        let key = (table_id.clone(), col_id);
        if column_index.contains_key(&key) {
          return Err(ConfigError::Invalid(format!(
            "column {}.{} appears in more than one rule set",
            key.0, key.1
          )));
        }
        column_index.insert(key, id);
      }
    }
  }

  // The document default always exists; built-in rules come after user
  // rules so user rules can override, and its default closes every bit.
  doc_rules.extend(builtin_default_rules());
  let doc_default = rule_sets.len();
  rule_sets.push(Arc::new(RuleSet {
    id: doc_default,
    scope: RuleScope::Doc,
    body: doc_rules,
    default: empty().map(|_| PermState::Deny),
  }));

  let table_ids: Vec<TableId> = table_columns
    .keys()
    .chain(table_defaults.keys())
    .cloned()
    .sorted()
    .dedup()
    .collect();

  debug!(
    "Built rule index: {} rule sets, {} attribute rules, {} tables",
    rule_sets.len(),
    attribute_rules.len(),
    table_ids.len()
  );

  return Ok(RuleIndex {
    rule_sets,
    column_index,
    table_columns,
    table_defaults,
    doc_default,
    table_ids,
    attribute_rules,
    have_rules: user_rule_count > 0,
  });
}
