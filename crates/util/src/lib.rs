pub mod command;
pub mod hashing;
pub mod kv_store;
pub mod path_processing;
pub mod sqlite_store;
pub mod text_processing;

pub use command::{CommandOutput, run_shell};
pub use hashing::{content_hash, to_canonical_json};
pub use kv_store::{
    DEFAULT_DATA_DIR, DefaultStoreProvider, INTERNAL_STATE_KEY, InMemoryStore, InMemoryStoreProvider, JsonFileStore, KeyValueStore,
    STATE_KEY, StoreDescriptor, StoreError, StoreProvider,
};
pub use path_processing::{expand_tilde, is_parent_relative, namespace_for, normalize_path, relative_to};
pub use sqlite_store::SqliteStore;
pub use text_processing::{redact_json, redact_sensitive};
