use async_trait::async_trait;
use thiserror::Error;

use crate::data::{CellValue, RowId, TableData, TableId};

/// Opaque failure of the authoritative store.
///
/// NOTE: Do not use thiserror's #from, all mappings should be explicit.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("Table not found: {0}")]
  TableNotFound(TableId),
  #[error("Internal: {0}")]
  Internal(Box<dyn std::error::Error + Send + Sync>),
}

/// A filtered fetch against the authoritative store.
#[derive(Clone, Debug, PartialEq)]
pub struct TableQuery {
  pub table_id: TableId,
  /// None fetches the whole table.
  pub row_ids: Option<Vec<RowId>>,
}

impl TableQuery {
  pub fn whole_table(table_id: &str) -> Self {
    return TableQuery {
      table_id: table_id.to_string(),
      row_ids: None,
    };
  }
}

/// Synchronous view over the document's current in-memory contents. The
/// engine reads rule and metadata tables through this; it never writes.
pub trait DocReader: Send + Sync {
  fn table_data(&self, table_id: &str) -> Option<TableData>;

  fn find_row(&self, table_id: &str, col_id: &str, value: &CellValue) -> Option<RowId> {
    return self.table_data(table_id)?.find_row(col_id, value);
  }
}

/// Asynchronous fetch from the authoritative store, used for row snapshots
/// and characteristic tables.
#[async_trait]
pub trait StoreFetcher: Send + Sync {
  async fn fetch_table(&self, query: &TableQuery) -> Result<TableData, StoreError>;
}
