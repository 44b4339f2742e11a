//! # Recordset Engine
//!
//! An event-driven record store for data that is too large to hold at once.
//!
//! A [`Store`] keeps an ordered list of [`Record`]s. When virtualized it
//! fetches pages on demand from a server, holds only some positions in
//! memory, and evicts least recently used records to stay under a limit.
//! Every state change is announced through events that views subscribe to.
//!
//! ## Design Principles
//!
//! - **No transport**: all remote access goes through a [`SyncAdapter`]
//!   supplied by the application
//! - **Stable positions**: a record keeps its index while holes around it
//!   are filled or evicted
//! - **Ordered async**: remote and virtualized operations run one at a time
//!   through a per-store [`Sequencer`], in the order they were issued
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A record is a map of JSON attributes with:
//! - An optional server id derived from the identity attribute(s)
//! - An immutable [`ClientId`] assigned at construction
//! - Change tracking ([`Record::changed`], [`Record::previous`])
//! - Optional validation through a [`Validator`] such as [`RecordSchema`]
//!
//! ### Stores
//!
//! Stores support positional and keyed access, insertion with merge,
//! reconciliation against an incoming list ([`Store::set`]), sorting by a
//! [`Comparator`], and local or server-side queries ([`Query`]).
//!
//! ### Virtualization
//!
//! With a fetch size configured, [`Store::set_range_local`] makes a window
//! of positions resident, fetching only what is missing. Paging metadata
//! from the server ([`PagingInfo`]) sizes the store and tells it when the
//! data ends. A model limit bounds resident records; records with unsaved
//! changes are never evicted.
//!
//! ### Events
//!
//! Records and stores implement [`Observable`]. Store events include `add`,
//! `remove`, `reset`, `sort`, `request`, `sync`, `error` and `ready`; record
//! events (`change`, `change:<attribute>`, `invalid`, `destroy`, ...) are
//! forwarded through the owning store.
//!
//! ## Quick Start
//!
//! ```rust
//! use recordset_engine::{AddOptions, Observable, Store, StoreConfig, StoreEvent};
//! use serde_json::json;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! // 1. Create a store sorted by name
//! let store = Store::new(StoreConfig::new().with_comparator("name"));
//!
//! // 2. Listen for additions
//! let added = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&added);
//! store.on("add", move |_: &StoreEvent| {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! // 3. Add records
//! store
//!     .add(
//!         [json!({"id": 2, "name": "Bea"}), json!({"id": 1, "name": "Ann"})],
//!         AddOptions::default(),
//!     )
//!     .unwrap();
//! assert_eq!(added.load(Ordering::SeqCst), 2);
//!
//! // 4. Read them back in comparator order
//! assert_eq!(store.at(0).unwrap().get("name"), Some(json!("Ann")));
//! assert_eq!(store.get(2).unwrap().get("name"), Some(json!("Bea")));
//! ```
//!
//! ## Remote Data
//!
//! Give the store a URL and an adapter, then use the sequenced API
//! ([`Store::fetch`], [`Store::set_range_local`], [`Store::create`],
//! [`Record::save`], ...). These enqueue at call time and must be called
//! from within a tokio runtime.

pub mod comparator;
pub mod config;
pub mod error;
pub mod events;
pub mod lru;
pub mod paging;
pub mod query;
pub mod reconcile;
pub mod record;
pub mod record_sync;
pub mod remote;
pub mod schema;
pub mod sequencer;
pub mod store;
pub mod sync;
pub mod value;

// Re-export main types at crate root
pub use comparator::{Comparator, SortDirection};
pub use config::{IdAttribute, RecordConfig, RecordSettings, StoreConfig, StoreSettings, Validator};
pub use error::{Error, Result};
pub use events::{Event, EventEmitter, ListenerId, Observable, ALL};
pub use lru::LruChain;
pub use paging::{Page, PagingInfo, PagingState};
pub use query::{Clause, ClauseComparator, Criteria, Query};
pub use reconcile::{ReconcileOptions, Reconciliation};
pub use record::{ClientId, Record, RecordEvent, RecordId, RecordKey, SetOptions};
pub use record_sync::{DestroyOptions, SaveOptions};
pub use remote::FetchOptions;
pub use schema::{FieldDef, FieldType, RecordSchema};
pub use sequencer::{Pending, Sequencer};
pub use store::{AddOptions, Entry, LocalRange, RemoveOptions, SortOptions, Store, StoreEvent};
pub use sync::{
    adapter_fn, FetchParams, FnAdapter, SyncAdapter, SyncError, SyncMethod, SyncRequest,
    SyncTarget,
};

/// Attribute map of a record
pub type Attributes = serde_json::Map<String, serde_json::Value>;
