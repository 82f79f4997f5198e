//! User-attribute resolution against characteristic tables.
//!
//! A user-attribute rule names a source table and column; at session
//! evaluation time a lookup value is resolved against the (already
//! enriched) user record and matched against that column. The matching row
//! becomes visible to rule predicates under the attribute's name.

use std::collections::HashMap;

use log::*;

use crate::data::{CellValue, TableData};
use crate::doc::{StoreFetcher, TableQuery};
use crate::session::{AttrValue, UserInfo};

use super::rules::{ConfigError, UserAttributeRule};

/// Key normalization for characteristic lookups: lowercased JSON
/// stringification. Record-typed values collapse to their `id` field before
/// stringification. Deliberately observable; tests pin the exact behavior.
pub fn normalized_key(value: &CellValue) -> String {
  let value = match value {
    CellValue::Object(map) => map.get("id").unwrap_or(&CellValue::Null),
    other => other,
  };
  return serde_json::to_string(value)
    .unwrap_or_else(|_| "null".to_string())
    .to_lowercase();
}

/// A fully loaded copy of a source table plus a normalized-key index over
/// one of its columns.
pub struct CharacteristicTable {
  pub data: TableData,
  index: HashMap<String, usize>,
}

impl CharacteristicTable {
  pub fn new(data: TableData, lookup_col_id: &str) -> Self {
    let mut index = HashMap::new();
    if let Some(values) = data.columns.get(lookup_col_id) {
      for (row_index, value) in values.iter().enumerate() {
        let key = normalized_key(value);
        if index.contains_key(&key) {
          warn!(
            "Duplicate characteristic key {key} in {}.{lookup_col_id}; keeping first",
            data.table_id
          );
          continue;
        }
        index.insert(key, row_index);
      }
    } else {
      warn!(
        "Characteristic table {} misses lookup column {lookup_col_id}",
        data.table_id
      );
    }
    return CharacteristicTable { data, index };
  }

  pub fn lookup(&self, key: &str) -> Option<usize> {
    return self.index.get(key).copied();
  }
}

/// Fetch every characteristic table named by the attribute rules. Keyed by
/// rule name; duplicate names were rejected at rule load.
pub async fn load_characteristic_tables(
  store: &dyn StoreFetcher,
  rules: &[UserAttributeRule],
) -> Result<HashMap<String, CharacteristicTable>, ConfigError> {
  let mut tables = HashMap::new();
  for rule in rules {
    let data = store
      .fetch_table(&TableQuery::whole_table(&rule.table_id))
      .await?;
    tables.insert(
      rule.name.clone(),
      CharacteristicTable::new(data, &rule.lookup_col_id),
    );
  }
  return Ok(tables);
}

/// Resolve a dotted lookup path against the user record. The first segment
/// reads a user field (built-in or earlier attribute); later segments
/// descend into object values.
fn resolve_path(user: &UserInfo, path: &str) -> CellValue {
  let mut segments = path.split('.');
  let Some(first) = segments.next() else {
    return CellValue::Null;
  };
  let mut value = user.get(first);
  for segment in segments {
    value = match value {
      CellValue::Object(map) => map.get(segment).cloned().unwrap_or(CellValue::Null),
      _ => CellValue::Null,
    };
  }
  return value;
}

/// Bind every attribute rule's value onto the user record, in registration
/// order; later rules may observe earlier ones. Missing lookups bind the
/// empty record view.
pub fn enrich_user(
  user: &mut UserInfo,
  rules: &[UserAttributeRule],
  tables: &HashMap<String, CharacteristicTable>,
) {
  for rule in rules {
    let Some(table) = tables.get(&rule.name) else {
      user.attributes.insert(rule.name.clone(), AttrValue::Empty);
      continue;
    };

    let key = normalized_key(&resolve_path(user, &rule.char_path));
    let value = match table.lookup(&key) {
      Some(row_index) => {
        let row_id = table.data.row_ids[row_index];
        match table.data.record(row_id) {
          Some(record) => AttrValue::Row(record),
          None => AttrValue::Empty,
        }
      }
      None => AttrValue::Empty,
    };
    user.attributes.insert(rule.name.clone(), value);
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::data::BulkColValues;
  use crate::session::Access;

  fn teams_table() -> TableData {
    let mut data = TableData::new("Teams");
    data.row_ids = vec![1, 2];
    data.columns = BulkColValues::from([
      (
        "email".to_string(),
        vec![json!("alice@example.com"), json!("Bob@Example.com")],
      ),
      ("city".to_string(), vec![json!("Oslo"), json!("Lund")]),
    ]);
    return data;
  }

  #[test]
  fn test_normalized_key() {
    assert_eq!(normalized_key(&json!("Bob@Example.com")), "\"bob@example.com\"");
    assert_eq!(normalized_key(&json!(17)), "17");
    assert_eq!(normalized_key(&CellValue::Null), "null");
    // Record-typed values collapse to their id.
    assert_eq!(normalized_key(&json!({"id": 4, "city": "Oslo"})), "4");
  }

  #[test]
  fn test_lookup_is_case_insensitive() {
    let table = CharacteristicTable::new(teams_table(), "email");
    assert_eq!(table.lookup("\"bob@example.com\""), Some(1));
    assert_eq!(table.lookup("\"nobody@example.com\""), None);
  }

  #[test]
  fn test_enrich_user() {
    let rules = vec![UserAttributeRule {
      name: "team".to_string(),
      table_id: "Teams".to_string(),
      lookup_col_id: "email".to_string(),
      char_path: "Email".to_string(),
    }];
    let tables = HashMap::from([(
      "team".to_string(),
      CharacteristicTable::new(teams_table(), "email"),
    )]);

    let mut user = UserInfo::anonymous(Access::Viewers);
    user.email = "BOB@example.com".to_string();
    enrich_user(&mut user, &rules, &tables);
    assert_eq!(user.attribute("team").unwrap().get("city"), json!("Lund"));

    // Unknown user binds the empty record view.
    let mut stranger = UserInfo::anonymous(Access::Viewers);
    stranger.email = "nobody@example.com".to_string();
    enrich_user(&mut stranger, &rules, &tables);
    assert_eq!(stranger.attribute("team"), Some(&AttrValue::Empty));
  }

  #[test]
  fn test_chained_attributes() {
    // A later rule can path through an earlier attribute's record.
    let cities = {
      let mut data = TableData::new("Cities");
      data.row_ids = vec![1];
      data.columns = BulkColValues::from([
        ("name".to_string(), vec![json!("Lund")]),
        ("country".to_string(), vec![json!("SE")]),
      ]);
      data
    };

    let rules = vec![
      UserAttributeRule {
        name: "team".to_string(),
        table_id: "Teams".to_string(),
        lookup_col_id: "email".to_string(),
        char_path: "Email".to_string(),
      },
      UserAttributeRule {
        name: "city".to_string(),
        table_id: "Cities".to_string(),
        lookup_col_id: "name".to_string(),
        char_path: "team.city".to_string(),
      },
    ];
    let tables = HashMap::from([
      (
        "team".to_string(),
        CharacteristicTable::new(teams_table(), "email"),
      ),
      (
        "city".to_string(),
        CharacteristicTable::new(cities, "name"),
      ),
    ]);

    let mut user = UserInfo::anonymous(Access::Viewers);
    user.email = "bob@example.com".to_string();
    enrich_user(&mut user, &rules, &tables);
    assert_eq!(user.attribute("city").unwrap().get("country"), json!("SE"));
  }
}
