//! Before/after row snapshots around a mutation bundle.
//!
//! Snapshots are reconstructed lazily on first use and shared by every
//! recipient of the bundle: the authoritative store is post-bundle when a
//! broadcast starts, so the touched rows are fetched, rolled back through
//! the undo log, then stepped forward again capturing a table image on
//! both sides of each forward action.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use log::*;
use tokio::sync::OnceCell;

use crate::actions::DocAction;
use crate::data::{RowId, TableData, TableId};
use crate::doc::{StoreError, StoreFetcher, TableQuery};

/// Before/after table images, one pair per mutation in the bundle.
pub struct RowSnapshotBundle {
  pairs: Vec<(TableData, TableData)>,
}

impl RowSnapshotBundle {
  /// The snapshot pair for the mutation at this bundle index.
  pub fn pair(&self, index: usize) -> Option<&(TableData, TableData)> {
    return self.pairs.get(index);
  }

  pub fn len(&self) -> usize {
    return self.pairs.len();
  }

  pub fn is_empty(&self) -> bool {
    return self.pairs.is_empty();
  }
}

async fn build_snapshot_bundle(
  store: &dyn StoreFetcher,
  forward: &[DocAction],
  undo: &[DocAction],
) -> Result<RowSnapshotBundle, StoreError> {
  // (a) Every row the bundle touched, per table, from the undo log. The
  // undo log mentions added rows too (as removals), so it is complete.
  let mut touched: HashMap<TableId, BTreeSet<RowId>> = HashMap::new();
  for action in undo {
    let rows = action.row_ids();
    if !rows.is_empty() {
      touched
        .entry(action.table_id().to_string())
        .or_default()
        .extend(rows);
    }
  }

  // (b) Fetch precisely those rows. This is the only suspension point.
  let mut tables: HashMap<TableId, TableData> = HashMap::new();
  for (table_id, row_ids) in &touched {
    let data = store
      .fetch_table(&TableQuery {
        table_id: table_id.clone(),
        row_ids: Some(row_ids.iter().copied().collect()),
      })
      .await?;
    tables.insert(table_id.clone(), data);
  }

  // (c) Roll the in-memory copies back to the pre-bundle state. The undo
  // log is applied in reverse so stacked edits of one row unwind correctly.
  for action in undo.iter().rev() {
    let table = tables
      .entry(action.table_id().to_string())
      .or_insert_with(|| TableData::new(action.table_id()));
    table.apply(action);
  }

  // (d) Step forward again, capturing a deep-cloned image immediately
  // before and after each forward action.
  let mut pairs: Vec<(TableData, TableData)> = Vec::with_capacity(forward.len());
  for action in forward {
    let table = tables
      .entry(action.table_id().to_string())
      .or_insert_with(|| TableData::new(action.table_id()));
    let before = table.clone();
    table.apply(action);
    pairs.push((before, table.clone()));
  }

  debug!("Reconstructed row snapshots for {} mutations", pairs.len());
  return Ok(RowSnapshotBundle { pairs });
}

/// State armed for the duration of one broadcast. The cell has classical
/// once semantics: exactly one builder runs, all waiters observe the same
/// result, and a failed or cancelled build leaves the cell reusable.
pub struct BroadcastState {
  forward: Vec<DocAction>,
  undo: Vec<DocAction>,
  cell: OnceCell<Arc<RowSnapshotBundle>>,
}

impl BroadcastState {
  pub fn new(forward: Vec<DocAction>, undo: Vec<DocAction>) -> Self {
    return BroadcastState {
      forward,
      undo,
      cell: OnceCell::new(),
    };
  }

  pub async fn snapshots(
    &self,
    store: &dyn StoreFetcher,
  ) -> Result<Arc<RowSnapshotBundle>, StoreError> {
    let bundle = self
      .cell
      .get_or_try_init(|| async {
        return Ok(Arc::new(
          build_snapshot_bundle(store, &self.forward, &self.undo).await?,
        ));
      })
      .await?;
    return Ok(bundle.clone());
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use serde_json::json;

  use super::*;
  use crate::data::{BulkColValues, ColValues};
  use crate::test::MemoryDoc;

  fn store_after_bundle() -> MemoryDoc {
    // Post-bundle state: row 1 updated, row 2 freshly added, row 3 gone.
    let mut table = TableData::new("T");
    table.row_ids = vec![1, 2];
    table.columns = BulkColValues::from([(
      "x".to_string(),
      vec![json!("one-new"), json!("two")],
    )]);
    return MemoryDoc::with_tables(vec![table]);
  }

  fn bundle() -> (Vec<DocAction>, Vec<DocAction>) {
    let forward = vec![
      DocAction::UpdateRecord {
        table_id: "T".to_string(),
        row_id: 1,
        values: ColValues::from([("x".to_string(), json!("one-new"))]),
      },
      DocAction::AddRecord {
        table_id: "T".to_string(),
        row_id: 2,
        values: ColValues::from([("x".to_string(), json!("two"))]),
      },
      DocAction::RemoveRecord {
        table_id: "T".to_string(),
        row_id: 3,
      },
    ];
    let undo = vec![
      DocAction::UpdateRecord {
        table_id: "T".to_string(),
        row_id: 1,
        values: ColValues::from([("x".to_string(), json!("one-old"))]),
      },
      DocAction::RemoveRecord {
        table_id: "T".to_string(),
        row_id: 2,
      },
      DocAction::AddRecord {
        table_id: "T".to_string(),
        row_id: 3,
        values: ColValues::from([("x".to_string(), json!("three"))]),
      },
    ];
    return (forward, undo);
  }

  #[tokio::test]
  async fn test_snapshot_reconstruction() {
    let store = store_after_bundle();
    let (forward, undo) = bundle();
    let bundle = build_snapshot_bundle(&store, &forward, &undo).await.unwrap();
    assert_eq!(bundle.len(), 3);

    // Before the first action, row 1 still holds its old value and row 3
    // exists; row 2 does not.
    let (before, after) = bundle.pair(0).unwrap();
    assert_eq!(before.cell("x", 1), Some(&json!("one-old")));
    assert_eq!(before.cell("x", 3), Some(&json!("three")));
    assert!(before.record(2).is_none());
    assert_eq!(after.cell("x", 1), Some(&json!("one-new")));

    // Around the add of row 2.
    let (before, after) = bundle.pair(1).unwrap();
    assert!(before.record(2).is_none());
    assert_eq!(after.cell("x", 2), Some(&json!("two")));

    // Around the removal of row 3.
    let (before, after) = bundle.pair(2).unwrap();
    assert_eq!(before.cell("x", 3), Some(&json!("three")));
    assert!(after.record(3).is_none());
  }

  #[tokio::test]
  async fn test_snapshots_build_once() {
    let store = store_after_bundle();
    let fetches = Arc::new(AtomicUsize::new(0));
    let counting = CountingStore {
      inner: store,
      fetches: fetches.clone(),
    };

    let (forward, undo) = bundle();
    let state = Arc::new(BroadcastState::new(forward, undo));

    let a = state.snapshots(&counting).await.unwrap();
    let b = state.snapshots(&counting).await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
  }

  struct CountingStore {
    inner: MemoryDoc,
    fetches: Arc<AtomicUsize>,
  }

  #[async_trait::async_trait]
  impl StoreFetcher for CountingStore {
    async fn fetch_table(&self, query: &TableQuery) -> Result<TableData, StoreError> {
      self.fetches.fetch_add(1, Ordering::SeqCst);
      return self.inner.fetch_table(query).await;
    }
  }
}
