//! codebatch-store — content-addressed storage substrate
//!
//! ## Core Principles
//!
//! 1. **Content is identity**: objects are keyed by the SHA-256 of their
//!    bytes; filenames and locations carry no meaning.
//! 2. **Add-only**: the object store never overwrites or removes a blob.
//! 3. **Snapshots are immutable**: once `snapshot.json` is written, the
//!    manifest never changes; re-ingesting the same bytes reproduces the
//!    same `snapshot_id`.
//! 4. **Atomic replacement**: every mutable file is swapped in whole via
//!    tmp + fsync + rename, so readers never observe a torn write.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use codebatch_store::{build_snapshot, SnapshotOptions, Store};
//!
//! let store = Store::init("./store")?;
//! let meta = build_snapshot(&store, "./src".as_ref(), &SnapshotOptions::default())?;
//! println!("{}", meta.snapshot_id);
//! ```

pub mod cas;
pub mod error;
pub mod fsio;
pub mod paths;
pub mod snapshot;
pub mod store;

pub use cas::{ObjectHash, ObjectStore};
pub use error::{ErrorKind, Result, StoreError};
pub use paths::{canonicalize, path_key_of, CanonicalPath};
pub use snapshot::{
    build_snapshot, load_file_index, load_snapshot_meta, FileEntry, SnapshotMeta, SnapshotOptions,
};
pub use store::{Store, StoreLock, StoreMeta};
