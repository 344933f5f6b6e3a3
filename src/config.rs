//! Worker configuration.

/// Receive worker configuration.
///
/// Controls resource limits for posted requests and unexpected data
/// buffering.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum number of outstanding receive requests.
    /// Default: 1024
    pub max_requests: usize,
    /// Maximum number of buffered unexpected descriptors (tag and stream
    /// combined).
    /// Default: 4096
    pub max_unexpected: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_requests: 1024,
            max_unexpected: 4096,
        }
    }
}

impl WorkerConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of outstanding receive requests.
    pub fn with_max_requests(mut self, max_requests: usize) -> Self {
        self.max_requests = max_requests;
        self
    }

    /// Set the maximum number of buffered unexpected descriptors.
    pub fn with_max_unexpected(mut self, max_unexpected: usize) -> Self {
        self.max_unexpected = max_unexpected;
        self
    }
}
