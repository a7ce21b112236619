//! Public mode queues, ranked admission and private rooms

pub mod admission;
pub mod queue;
pub mod rooms;
pub mod service;

pub use rooms::RoomService;
pub use service::{MatchmakingService, QueueError};
