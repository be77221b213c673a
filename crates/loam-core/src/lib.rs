// Loam Core
// Content addressing, the fact log, patch application, and the space engine

pub mod error;
pub mod patch;
pub mod reference;
pub mod space;
pub mod storage;
pub mod types;

pub use error::{EntityState, StoreError};
pub use patch::{apply_patch, PatchOperation};
pub use reference::{empty_ref, hash_bytes, hash_fact, hash_value, Reference};
pub use space::{Space, SpaceConfig};
pub use types::*;
