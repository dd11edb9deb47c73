// === Building blocks ===
pub mod config;
pub mod error;
pub mod event_store;
pub mod tally;

// === State machine ===
pub mod state;

// === Runtime ===
pub mod chain;
pub mod registry;

pub use chain::{Chain, ChainSnapshot};
pub use config::ChainConfig;
pub use error::ChainError;
pub use event_store::{merge_by_timestamp, EventStore};
pub use registry::ChainRegistry;
pub use state::{ChainState, Outbound, RoundPhase, Step};
pub use tally::tally_votes;
