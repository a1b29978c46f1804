use serde::{Deserialize, Deserializer};
use std::{path::PathBuf, time::Duration};

pub const DEFAULT_ROSTER_PATH: &str = "coldstorage/peers.txt";

// Replies that take longer than this to arrive are dropped by broadcasts.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// ClusterConfig holds the knobs of the peer layer. It can be embedded in a
/// larger node configuration; `reply_timeout` is given in milliseconds there.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub roster_path: PathBuf,
    #[serde(rename = "reply_timeout_ms", deserialize_with = "millis")]
    pub reply_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            roster_path: PathBuf::from(DEFAULT_ROSTER_PATH),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }
}

impl ClusterConfig {
    pub fn with_roster_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.roster_path = path.into();
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }
}

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}
