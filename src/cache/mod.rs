//! Reactive normalized object cache.
//!
//! - **Keys**: structural cache keys interned in a trie, one instance per
//!   distinct `(kind, args)` tuple, reclaimed by a delayed ref-counting GC.
//! - **Layers**: a confirmed truth layer under a stack of optimistic layers
//!   that can be removed to roll back.
//! - **Queries**: per-kind controllers (object, list, aggregation, links,
//!   function) that fetch through an [`OntologyClient`], store results, and
//!   publish payloads to subscribers.
//!
//! ## Configuration
//!
//! Store behavior is controlled via [`CacheConfig`], usually loaded from the
//! `[cache]` section of `livequery.toml`:
//!
//! ```toml
//! [cache]
//! gc_delay_ms = 60000
//! sweep_interval_ms = 1000
//! dedupe_interval_ms = 0
//! page_size = 100
//! bulk_window_ms = 25
//! bulk_max_entries = 100
//! ```

mod action;
mod batch;
mod bulk_loader;
pub mod canonical;
mod changes;
mod config;
mod error;
mod invalidation;
mod keys;
mod layer;
mod lock;
mod metadata;
pub mod metrics_names;
mod network;
mod object;
pub mod query;
mod refcounts;
mod registry;
mod store;
mod where_clause;

pub use action::OptimisticBuilder;
pub use batch::{BatchContext, BatchMeta, BatchOutcome};
pub use canonical::{Canonical, OrderBy, ParamValue, SortDirection};
pub use changes::Changes;
pub use config::CacheConfig;
pub use error::CacheError;
pub use invalidation::{InvalidationSet, object_types_that_invalidate};
pub use keys::{CacheKey, KeyArg, KeyId, KeyKind, object_key_args};
pub use layer::{Collection, Entry, OptimisticId, Status, StoreValue};
pub use metadata::{
    InterfaceDefinition, InterfaceLinkDefinition, LinkDefinition, LinkMultiplicity,
    LinkTargetKind, MetadataError, ObjectDefinition, OntologyMetadata, StaticMetadata,
};
pub use network::{
    ActionEditResponse, ActionValidationResponse, AggregateRequest, NetworkError, OntologyClient,
    PageRequest, PageResult, ValidationResult,
};
pub use object::{ObjectRef, ObjectSet, OsdkObject, PrimaryKey};
pub use query::{
    ListDescriptor, ListPage, ListSource, ObserveMode, ObserveOptions, Payload, Query,
    QueryFuture, QuerySubscription,
};
pub use refcounts::RefCounts;
pub use registry::{CacheKeyRegistry, Interned, KeyHook};
pub use store::{EntrySnapshot, Store, StoreBuilder};
pub use where_clause::{WhereMatch, evaluate as evaluate_where};
