//! The engine facade: gating of incoming user actions, filtering of
//! outgoing broadcasts and fetched data, and the rebuild lifecycle.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use lazy_static::lazy_static;
use log::*;
use parking_lot::{Mutex, RwLock};

use crate::actions::{ActionGroup, DocAction, UserAction};
use crate::data::{is_system_table, SessionId, TableData, TableId};
use crate::doc::{DocReader, StoreFetcher, TableQuery};
use crate::session::{SessionResolver, UserInfo};

use super::attributes::{enrich_user, load_characteristic_tables, CharacteristicTable};
use super::broadcast::{BroadcastState, RowSnapshotBundle};
use super::censor::censor_meta_tables;
use super::evaluator::SessionPermissions;
use super::lattice::{MixedState, TableReadState};
use super::planner::{filter_table_data, plan_outgoing, FilterError};
use super::rules::{
  build_rule_index, ConfigError, RuleCompiler, RuleIndex, RULES_TABLE, RESOURCES_TABLE,
};

lazy_static! {
  /// Housekeeping actions any session may issue.
  static ref ALWAYS_OK_ACTIONS: HashSet<&'static str> =
    HashSet::from(["Calculate", "UpdateCurrentTime"]);

  /// Schema- and formula-touching actions; too much leverage for sessions
  /// whose visibility is nuanced.
  static ref SPECIAL_ACTIONS: HashSet<&'static str> = HashSet::from([
    "AddTable",
    "RemoveTable",
    "RenameTable",
    "AddColumn",
    "RemoveColumn",
    "RenameColumn",
    "ModifyColumn",
    "SetDisplayFormula",
    "CreateViewSection",
  ]);

  /// Actions with surprising reach; owners only.
  static ref SURPRISING_ACTIONS: HashSet<&'static str> =
    HashSet::from(["InitNewDoc", "EvalCode"]);

  /// Wrapped action lists; gating recurses into the payload.
  static ref WRAPPED_ACTIONS: HashSet<&'static str> =
    HashSet::from(["ApplyUndoActions", "ApplyDocActions"]);

  /// Table-scoped record mutations, table name in element 1.
  static ref RECORD_ACTIONS: HashSet<&'static str> = HashSet::from([
    "AddRecord",
    "BulkAddRecord",
    "UpdateRecord",
    "BulkUpdateRecord",
    "RemoveRecord",
    "BulkRemoveRecord",
    "ReplaceTableData",
  ]);
}

/// Everything a rebuild swaps in atomically.
struct EngineState {
  index: Arc<RuleIndex>,
  characteristics: HashMap<String, CharacteristicTable>,
}

struct EmptyDoc;

impl DocReader for EmptyDoc {
  fn table_data(&self, _table_id: &str) -> Option<TableData> {
    return None;
  }
}

struct NullCompiler;

impl RuleCompiler for NullCompiler {
  fn compile(&self, formula: &str) -> Result<super::rules::MatchFn, super::rules::RuleCompileError> {
    return Err(super::rules::RuleCompileError(format!(
      "no compiler available for '{formula}'"
    )));
  }
}

impl EngineState {
  /// Pristine state before the first update: built-in defaults only.
  fn empty() -> Self {
    let index = build_rule_index(&EmptyDoc, &NullCompiler)
      .expect("built-in defaults always build");
    return EngineState {
      index: Arc::new(index),
      characteristics: HashMap::new(),
    };
  }
}

struct ControllerState {
  doc: Arc<dyn DocReader>,
  store: Arc<dyn StoreFetcher>,
  compiler: Arc<dyn RuleCompiler>,
  sessions: Arc<dyn SessionResolver>,

  engine: ArcSwap<EngineState>,

  /// Explicit side-table standing in for a weak per-session map: evicted on
  /// rebuild and through the session-close hook, never by the engine
  /// prolonging session lifetime.
  session_cache: RwLock<HashMap<SessionId, Arc<SessionPermissions>>>,

  /// Armed between before_broadcast and after_broadcast.
  broadcast: Mutex<Option<Arc<BroadcastState>>>,
}

/// Granular access control engine for one document.
#[derive(Clone)]
pub struct AccessController {
  state: Arc<ControllerState>,
}

impl AccessController {
  pub async fn new(
    doc: Arc<dyn DocReader>,
    store: Arc<dyn StoreFetcher>,
    compiler: Arc<dyn RuleCompiler>,
    sessions: Arc<dyn SessionResolver>,
  ) -> Result<Self, ConfigError> {
    let controller = AccessController {
      state: Arc::new(ControllerState {
        doc,
        store,
        compiler,
        sessions,
        engine: ArcSwap::from_pointee(EngineState::empty()),
        session_cache: RwLock::new(HashMap::new()),
        broadcast: Mutex::new(None),
      }),
    };
    controller.update().await?;
    return Ok(controller);
  }

  /// Rebuild from the current rule tables. On error the previous rule
  /// store remains in force.
  pub async fn update(&self) -> Result<(), ConfigError> {
    let index = build_rule_index(self.state.doc.as_ref(), self.state.compiler.as_ref())?;
    let characteristics =
      load_characteristic_tables(self.state.store.as_ref(), index.attribute_rules()).await?;

    self.state.engine.store(Arc::new(EngineState {
      index: Arc::new(index),
      characteristics,
    }));
    self.state.session_cache.write().clear();
    debug!("Access rules rebuilt");
    return Ok(());
  }

  /// Session-close hook: drop the cached evaluator for this session.
  pub fn forget_session(&self, session: &SessionId) {
    self.state.session_cache.write().remove(session);
  }

  fn permissions_for(&self, session: &SessionId) -> Arc<SessionPermissions> {
    if let Some(cached) = self.state.session_cache.read().get(session) {
      return cached.clone();
    }

    let engine = self.state.engine.load();
    let access = self.state.sessions.session_access(session);
    let mut user = match self.state.sessions.session_user(session) {
      Some(profile) => UserInfo::from_profile(access, &profile),
      None => UserInfo::anonymous(access),
    };
    enrich_user(&mut user, engine.index.attribute_rules(), &engine.characteristics);

    let permissions = Arc::new(SessionPermissions::new(engine.index.clone(), user));
    self
      .state
      .session_cache
      .write()
      .insert(session.clone(), permissions.clone());
    return permissions;
  }

  fn have_rules(&self) -> bool {
    return self.state.engine.load().index.have_rules();
  }

  pub fn can_read_everything(&self, session: &SessionId) -> bool {
    return self.permissions_for(session).doc_verdict().read == MixedState::Allow;
  }

  pub fn has_full_access(&self, session: &SessionId) -> bool {
    return self.permissions_for(session).doc_verdict().all_allow();
  }

  pub fn has_view_access(&self, session: &SessionId) -> bool {
    return self.state.sessions.session_access(session).can_view();
  }

  /// Access that is real but not owner-level full, in a document carrying
  /// user-authored rules.
  pub fn has_nuanced_access(&self, session: &SessionId) -> bool {
    return self.have_rules() && !self.has_full_access(session);
  }

  pub fn has_table_access(&self, session: &SessionId, table_id: &str) -> bool {
    return self.permissions_for(session).table_verdict(table_id).read != TableReadState::Deny;
  }

  pub fn has_query_access(&self, session: &SessionId, query: &TableQuery) -> bool {
    return self.has_table_access(session, &query.table_id);
  }

  pub fn can_apply_user_actions(&self, session: &SessionId, actions: &[UserAction]) -> bool {
    return actions
      .iter()
      .all(|action| self.can_apply_user_action(session, action));
  }

  pub fn can_apply_user_action(&self, session: &SessionId, action: &UserAction) -> bool {
    let Some(name) = action.name() else {
      return false;
    };

    if ALWAYS_OK_ACTIONS.contains(name) {
      return true;
    }
    if SPECIAL_ACTIONS.contains(name) {
      return !self.has_nuanced_access(session);
    }
    if SURPRISING_ACTIONS.contains(name) {
      return self.has_full_access(session);
    }
    if WRAPPED_ACTIONS.contains(name) {
      return self.can_apply_user_actions(session, &action.nested());
    }
    if RECORD_ACTIONS.contains(name) {
      let Some(table_id) = action.table_arg() else {
        return false;
      };
      if table_id == RULES_TABLE || table_id == RESOURCES_TABLE {
        // Touching the access rules themselves is owner territory.
        return self.has_full_access(session);
      }
      if is_system_table(table_id) {
        return !self.has_nuanced_access(session);
      }
      // Row-mixed reads block writes in this version.
      return self.permissions_for(session).table_verdict(table_id).read == TableReadState::Allow;
    }

    return false;
  }

  /// Censor metadata for sessions lacking read-everything; in place.
  pub fn filter_meta_tables(
    &self,
    session: &SessionId,
    tables: &mut BTreeMap<TableId, TableData>,
  ) {
    if !self.have_rules() || self.can_read_everything(session) {
      return;
    }
    censor_meta_tables(&self.permissions_for(session), tables);
  }

  /// Row and column filtering of a fetched table; in place.
  pub fn filter_data(&self, session: &SessionId, data: &mut TableData) {
    if !self.have_rules() || self.can_read_everything(session) {
      return;
    }
    let engine = self.state.engine.load();
    filter_table_data(&self.permissions_for(session), &engine.index, data);
  }

  /// Rewrite an outgoing bundle for one recipient. The bundle must be the
  /// forward log armed via before_broadcast: snapshot pairs are matched to
  /// mutations by bundle index.
  pub async fn filter_outgoing_doc_actions(
    &self,
    session: &SessionId,
    actions: &[DocAction],
  ) -> Result<Vec<DocAction>, FilterError> {
    if !self.have_rules() {
      return Ok(actions.to_vec());
    }
    let permissions = self.permissions_for(session);
    if permissions.doc_verdict().read == MixedState::Allow {
      return Ok(actions.to_vec());
    }

    let engine = self.state.engine.load_full();
    let broadcast = self.state.broadcast.lock().clone();
    let mut snapshots: Option<Arc<RowSnapshotBundle>> = None;

    let mut result: Vec<DocAction> = vec![];
    for (index, action) in actions.iter().enumerate() {
      let needs_snapshot = action.is_record_action()
        && permissions.table_verdict(action.table_id()).read == TableReadState::Mixed;

      let pair = if needs_snapshot {
        if snapshots.is_none() {
          let Some(ref state) = broadcast else {
            return Err(FilterError::NotArmed);
          };
          snapshots = Some(state.snapshots(self.state.store.as_ref()).await?);
        }
        snapshots.as_ref().and_then(|bundle| bundle.pair(index))
      } else {
        None
      };

      result.extend(plan_outgoing(&permissions, &engine.index, action, pair)?);
    }
    return Ok(result);
  }

  /// Censor an action-group summary.
  pub fn filter_action_group(&self, session: &SessionId, group: ActionGroup) -> ActionGroup {
    // TODO(review): the direction of this check looks inverted (sessions
    // that can read everything get the censored group, everyone else the
    // original); kept bit-for-bit until the activity-feed consumers are
    // audited.
    if !self.can_read_everything(session) {
      return group;
    }
    return group.censored();
  }

  /// Arm the snapshot builder for a bundle. Must be called after the
  /// forward log has been applied to the authoritative store and before
  /// any recipient is served.
  pub fn before_broadcast(&self, forward: Vec<DocAction>, undo: Vec<DocAction>) {
    *self.state.broadcast.lock() = Some(Arc::new(BroadcastState::new(forward, undo)));
  }

  /// Discard the snapshot; called once every recipient is served.
  pub fn after_broadcast(&self) {
    *self.state.broadcast.lock() = None;
  }
}
