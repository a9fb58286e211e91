mod state_store;

pub use state_store::{KvChange, StateStore, StoreError, default_db_path};
