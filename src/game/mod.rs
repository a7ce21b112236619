//! Match instances and the round-based game they run

pub mod action;
pub mod bot;
pub mod combatant;
pub mod engine;
pub mod instance;
pub mod mission;
pub mod names;
pub mod observers;
pub mod priority;
pub mod reconnect;
pub mod round;
pub mod scoring;

pub use engine::EngineCommand;
pub use instance::{InstanceError, InstanceManager, MatchHandle, MatchMember, MatchRegistry};
pub use observers::Outbox;
pub use reconnect::{ReattachOutcome, ReconnectionResolver};
