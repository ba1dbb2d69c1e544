//! Host and client configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::SpaceId;

/// Host configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Address the WebSocket adapter binds to
    pub bind_addr: String,
    /// Space served by the host
    pub space: SpaceId,
    /// Log file for `space`
    pub log_path: PathBuf,
    /// Records replayed into the observer at open (0 = all)
    pub replay_limit: u64,
    /// Outbound packets queued per client and pipe before eviction
    pub client_queue_capacity: usize,
    /// Capacity of the central request channel
    pub request_capacity: usize,
    /// Records read ahead by a catch-up task
    pub catchup_buffer: usize,
    /// Period of the host's leader-clock viewpoint (None = never)
    pub viewpoint_interval: Option<Duration>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9191".to_string(),
            space: SpaceId::default(),
            log_path: PathBuf::from("space.log"),
            replay_limit: 0,
            client_queue_capacity: 256,
            request_capacity: 1024,
            catchup_buffer: 64,
            viewpoint_interval: Some(Duration::from_millis(100)),
        }
    }
}

impl HostConfig {
    /// Config for a host serving `space` from `log_path`.
    pub fn new(space: SpaceId, log_path: impl Into<PathBuf>) -> Self {
        Self {
            space,
            log_path: log_path.into(),
            ..Self::default()
        }
    }

    /// Config for testing (small queues, no periodic viewpoints, ephemeral
    /// port).
    pub fn for_testing(log_path: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            space: SpaceId::new_random(),
            log_path: log_path.into(),
            replay_limit: 0,
            client_queue_capacity: 64,
            request_capacity: 64,
            catchup_buffer: 4,
            viewpoint_interval: None,
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Outbound packets queued per pipe before `send` waits for the writer
    pub outbound_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn for_testing() -> Self {
        Self {
            outbound_capacity: 16,
        }
    }
}
