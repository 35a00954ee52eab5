//! ISO 11783-6 Virtual Terminal: object pools, upload client, state mirror, version storage.

pub mod client;
pub mod objects;
pub mod state_tracker;
pub mod version_store;

pub use client::{VtClient, VtClientState, PGN_ECU_TO_VT, PGN_VT_TO_ECU};
pub use objects::{ObjectId, ObjectPool, ObjectType, VtObject};
pub use state_tracker::{AlarmEntry, AlarmPriority, VtClientStateTracker};
pub use version_store::{StoredPoolVersion, VersionStore};
