use std::env;
use std::time::Duration;

const DEFAULT_ANSWER_COMMIT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_PENDING_CANDIDATES: usize = 64;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a received answer is held waiting for ICE checks to start
    /// before the negotiation is abandoned.
    pub answer_commit_timeout: Duration,
    /// Offers ask the remote side for a video stream.
    pub offer_to_receive_video: bool,
    /// Remote candidates kept while no remote description is applied; the
    /// oldest are dropped beyond this.
    pub max_pending_candidates: usize,
}

impl SessionConfig {
    pub fn from_env() -> Self {
        let answer_commit_timeout = env::var("PEER_SESSION_ANSWER_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(DEFAULT_ANSWER_COMMIT_TIMEOUT_MS));
        Self {
            answer_commit_timeout,
            ..Self::default()
        }
    }

    pub fn with_max_pending_candidates(mut self, limit: usize) -> Self {
        self.max_pending_candidates = limit;
        self
    }

    pub fn with_answer_commit_timeout(mut self, timeout: Duration) -> Self {
        self.answer_commit_timeout = timeout;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            answer_commit_timeout: Duration::from_millis(DEFAULT_ANSWER_COMMIT_TIMEOUT_MS),
            offer_to_receive_video: true,
            max_pending_candidates: DEFAULT_MAX_PENDING_CANDIDATES,
        }
    }
}
