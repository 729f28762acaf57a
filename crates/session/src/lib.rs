//! Server side of the imgstash chunked upload protocol.
//!
//! A client opens a session, streams chunks in any order, then asks for
//! completion. The [`UploadService`] validates each request, records
//! chunks in the [`SessionStore`], reassembles them with the [`Assembler`]
//! and hands the result to the [`ContentPublisher`].
//!
//! # Lifecycle
//!
//! `Created → Uploading → Completing → Completed | Failed`, with
//! `Cancelled` and `Expired` reachable from any live state. Sessions are
//! process-local and evicted lazily on store access.

pub mod assembler;
pub mod collaborators;
pub mod content;
pub mod error;
pub mod publisher;
pub mod service;
pub mod state;
pub mod store;

pub use assembler::{AssembledObject, Assembler, CompletionTicket};
pub use collaborators::{
    AccessPolicy, BuildReason, BuildTrigger, Caller, GuestPolicy, ImageRecord, MemoryMetadataStore,
    MetadataStore, NoopBuildTrigger,
};
pub use content::{BoxFuture, ContentStore, FsContentStore, MemoryContentStore, VersionToken};
pub use error::{SessionError, StoreError};
pub use publisher::{ContentPublisher, PublishedImage};
pub use service::{DeleteEntry, DeleteFailure, DeleteReport, UploadService};
pub use state::{ChunkReceipt, SessionMeta, UploadSession};
pub use store::{SessionConfig, SessionStore};
