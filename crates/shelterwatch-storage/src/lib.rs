//! Persistence for shelterwatch: run history, the item store, the capture archive
//! and the static HTTP fetcher feeding it.

pub mod archive;
pub mod fetch;
pub mod history;
pub mod items;

pub use archive::{ArchivedCapture, ArchivedKind, CaptureArchive, CaptureMetadata};
pub use fetch::{FetchError, FetcherConfig, HttpFetcher, RetryPolicy};
pub use history::{
    HistoryDocument, HistoryError, HistoryStore, InMemoryHistoryStore, YamlHistoryStore,
};
pub use items::{ApplyOptions, ReconcileReport, StoreError, StoreReconciler, UpsertOutcome};

pub const CRATE_NAME: &str = "shelterwatch-storage";
