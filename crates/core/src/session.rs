use std::collections::BTreeMap;

use serde::Serialize;

use crate::data::{CellValue, RowRecord, SessionId};

/// Role a session holds on the document, as resolved by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Access {
  Owners,
  Editors,
  Viewers,
  None,
}

impl Access {
  pub fn as_str(&self) -> &'static str {
    return match self {
      Access::Owners => "owners",
      Access::Editors => "editors",
      Access::Viewers => "viewers",
      Access::None => "none",
    };
  }

  pub fn can_view(&self) -> bool {
    return !matches!(self, Access::None);
  }
}

/// Identity attached to a session by the host's authentication layer.
#[derive(Clone, Debug, PartialEq)]
pub struct UserProfile {
  pub id: i64,
  pub email: String,
  pub name: String,
}

/// Host-side resolution of sessions to roles and identities. Session
/// lifecycle stays with the host; the engine only ever borrows.
pub trait SessionResolver: Send + Sync {
  fn session_access(&self, session: &SessionId) -> Access;
  fn session_user(&self, session: &SessionId) -> Option<UserProfile>;
}

/// Value of a user attribute: a looked-up characteristic row, or the empty
/// record view when the lookup found nothing. The empty view answers null
/// for every column and serializes to `{}`.
#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
  Row(RowRecord),
  Empty,
}

impl AttrValue {
  pub fn get(&self, col_id: &str) -> CellValue {
    return match self {
      AttrValue::Row(record) => record.get(col_id),
      AttrValue::Empty => CellValue::Null,
    };
  }

  pub fn to_json(&self) -> CellValue {
    return match self {
      AttrValue::Row(record) => CellValue::Object(
        record
          .values
          .iter()
          .map(|(k, v)| (k.clone(), v.clone()))
          .collect(),
      ),
      AttrValue::Empty => CellValue::Object(serde_json::Map::new()),
    };
  }
}

/// The user record rule predicates see: built-in identity fields plus any
/// attributes contributed by user-attribute rules.
#[derive(Clone, Debug, PartialEq)]
pub struct UserInfo {
  pub access: Access,
  pub user_id: i64,
  pub email: String,
  pub name: String,
  pub attributes: BTreeMap<String, AttrValue>,
}

/// Field names reserved for the built-in identity; user-attribute rules may
/// not shadow them.
pub const BUILTIN_USER_FIELDS: [&str; 4] = ["Access", "UserID", "Email", "Name"];

impl UserInfo {
  pub fn anonymous(access: Access) -> Self {
    return UserInfo {
      access,
      user_id: 0,
      email: String::new(),
      name: String::new(),
      attributes: BTreeMap::new(),
    };
  }

  pub fn from_profile(access: Access, profile: &UserProfile) -> Self {
    return UserInfo {
      access,
      user_id: profile.id,
      email: profile.email.clone(),
      name: profile.name.clone(),
      attributes: BTreeMap::new(),
    };
  }

  /// Field lookup as rule predicates see it: built-ins first, then
  /// attributes, null for anything unknown.
  pub fn get(&self, field: &str) -> CellValue {
    return match field {
      "Access" => CellValue::String(self.access.as_str().to_string()),
      "UserID" => CellValue::Number(self.user_id.into()),
      "Email" => CellValue::String(self.email.clone()),
      "Name" => CellValue::String(self.name.clone()),
      _ => match self.attributes.get(field) {
        Some(value) => value.to_json(),
        None => CellValue::Null,
      },
    };
  }

  pub fn attribute(&self, name: &str) -> Option<&AttrValue> {
    return self.attributes.get(name);
  }
}
