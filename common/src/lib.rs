// Sundae-sync common library - main library exports

pub mod address;
pub mod asset;
pub mod callbacks;
pub mod configuration;
pub mod context;
pub mod decoder;
pub mod logging;
pub mod metadata;
pub mod script;
pub mod slots;
pub mod types;

// Flattened re-exports
pub use self::callbacks::{ChainSyncCallbacks, TxProcessor};
pub use self::configuration::{Network, SyncOptions};
pub use self::context::{DependencyWaits, SyncContext, TxPosition, WaitError};
pub use self::decoder::{BlockDecoder, ChainBlock, ChainTx};
pub use self::types::*;
