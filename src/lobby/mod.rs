//! Session actors and the directory that tracks them
//!
//! Each session is owned by one actor task; the directory handles
//! matchmaking and reclaims sessions that went idle.

pub mod actor;
pub mod directory;

pub use actor::{spawn_match, ActorSettings, MatchHandle, SessionSummary, SubmitError};
pub use directory::{spawn_sweeper, DirectoryError, DirectorySettings, SessionDirectory};
