/// Game rule defaults
pub mod rules {
    /// Score a participant must reach (or exceed) by holding to win
    pub const DEFAULT_TARGET_SCORE: u32 = 100;
    /// Participants required before a session starts
    pub const MIN_PARTICIPANTS: usize = 2;
    /// Participants a single session can hold (departed ones keep their seat)
    pub const MAX_PARTICIPANTS: usize = 4;
    /// Number of faces on the die; outcomes are drawn from 1..=DIE_FACES
    pub const DIE_FACES: u32 = 6;
    /// Rolling this face loses the turn accumulator and passes the turn
    pub const FORFEIT_FACE: u32 = 1;
}

/// Actor and directory timing defaults
pub mod lifecycle {
    use std::time::Duration;

    /// Pending events an actor mailbox can hold
    pub const ACTOR_MAILBOX_CAPACITY: usize = 256;
    /// How often an actor checks whether it has been abandoned
    pub const ACTOR_TICK_INTERVAL: Duration = Duration::from_secs(30);
    /// How long an actor survives with zero connections
    pub const IDLE_GRACE: Duration = Duration::from_secs(5 * 60);
    /// How often the directory sweeps stale entries
    pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
    /// Inactivity after which a directory entry is evicted
    pub const EVICTION_TIMEOUT: Duration = Duration::from_secs(30 * 60);
    /// Upper bound on concurrently registered sessions
    pub const MAX_SESSIONS: usize = 10_000;
}

/// Connection constants
pub mod net {
    use std::time::Duration;

    /// Outbound messages buffered per connection before drops start
    pub const CONNECTION_MAILBOX_CAPACITY: usize = 256;
    /// Largest inbound frame accepted from a client
    pub const MAX_INBOUND_FRAME: usize = 512;
    /// Largest outbound frame written to a client
    pub const MAX_OUTBOUND_FRAME: usize = 65536;
    /// Time allowed to write one frame to the peer
    pub const WRITE_WAIT: Duration = Duration::from_secs(10);
    /// Time allowed between two inbound frames
    pub const PONG_WAIT: Duration = Duration::from_secs(60);
    /// Keepalive probe period (must be less than PONG_WAIT)
    pub const PING_PERIOD: Duration = Duration::from_secs(54);
    /// Display name used when a client does not provide one
    pub const DEFAULT_DISPLAY_NAME: &str = "Player";
    /// Maximum display name length after sanitization
    pub const MAX_DISPLAY_NAME_CHARS: usize = 16;
}
