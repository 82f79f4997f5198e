#![forbid(unsafe_code)]
#![allow(clippy::needless_return)]
#![warn(clippy::await_holding_lock, clippy::inefficient_to_string)]

//! Granular access control engine for a collaborative grid-document
//! server. Sits between the document's authoritative mutation stream and
//! every external consumer: gates incoming user actions, rewrites outgoing
//! broadcasts per recipient, and censors document metadata.

pub mod access;
pub mod actions;
pub mod data;
pub mod doc;
pub mod session;


pub use access::rules::{
  ConfigError, MatchError, MatchFn, MatchInput, RuleCompileError, RuleCompiler,
};
pub use access::{AccessController, FilterError};
pub use actions::{ActionGroup, ColInfo, DocAction, UserAction};
pub use data::{
  censored_cell, is_system_table, CellValue, ColId, RowId, RowRecord, SessionId, TableData,
  TableId,
};
pub use doc::{DocReader, StoreError, StoreFetcher, TableQuery};
pub use session::{Access, SessionResolver, UserInfo, UserProfile};
