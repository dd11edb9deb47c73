// === Identifiers ===
pub mod ids;

// === Units of work ===
pub mod transaction;
pub mod event;

// === External collaborators ===
pub mod signer;
pub mod pipeline;

// === Re-exports for the other shardline crates ===
pub use ids::{NodeId, ShardId};
pub use transaction::{Transaction, ASSIGN_CONTRACT_KIND, RESPONSE_KIND};
pub use event::Event;
pub use signer::{Ed25519Signer, Signer, SignerError};
pub use pipeline::{CollectingPipeline, Pipeline};
