use std::time::Duration;

use crate::cli::ServerArgs;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:5000";
pub const DEFAULT_CAPACITY: usize = 10;

/// Runtime settings for a [`crate::server::Server`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Most sessions connected at once; further connections are turned away.
    pub capacity: usize,
    /// Deadline for writing one frame to a client. `None` waits forever.
    pub write_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            write_timeout: None,
        }
    }
}

impl From<&ServerArgs> for ServerConfig {
    fn from(args: &ServerArgs) -> Self {
        Self {
            capacity: args.capacity,
            write_timeout: args.write_timeout_ms.map(Duration::from_millis),
        }
    }
}
