//! chroma-agent-store: persisted state of the storage-server agent.
//!
//! Everything lives in one state directory (default `/var/lib/chroma`):
//! the TLS identity files managed by [`CryptoStore`] at the top level, and the
//! section/key JSON store managed by [`ConfigStore`] in subdirectories.

mod atomic;
pub mod config_store;
pub mod crypto;
pub mod error;

pub use config_store::{ConfigStore, ServerSettings};
pub use crypto::{CryptoStore, TlsMaterial};
pub use error::{CryptoError, CryptoResult, StoreError, StoreResult};
