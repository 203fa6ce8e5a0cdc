//! Synchronization engine keeping a [`markmirror_store::MirrorStore`] in step
//! with an external bookmark provider.
//!
//! Provider events flow through the [`Normalizer`] into canonical
//! [`Mutation`]s, which the [`reconciler`] applies one transaction per batch.
//! Full syncs ([`bootstrap`]) diff the provider tree against the mirror and
//! push the result through the same reconciler.  The [`SyncCoordinator`]
//! owns the single writer task and its state machine.

pub mod bootstrap;
pub mod coordinator;
pub mod error;
pub mod mutation;
pub mod normalizer;
pub mod provider;
pub mod reconciler;

#[cfg(test)]
pub(crate) mod testing;

pub use bootstrap::{BootstrapOptions, BootstrapOutcome, Snapshot, plan_full_sync, run_full_sync};
pub use coordinator::{
    CoordinatorStatus, StatusMessage, SyncCoordinator, SyncHandle, SyncPhase, SyncState,
};
pub use error::{Result, SyncError};
pub use mutation::{EventKind, Mutation, MutationOp, MutationOrigin};
pub use normalizer::Normalizer;
pub use provider::{
    BookmarkProvider, FileTreeProvider, MemoryProvider, ProviderNode, RawEvent, RawEventKind,
};
pub use reconciler::{Anomaly, AnomalyKind, ApplyMode, ApplyOutcome, apply, apply_batch};
