use std::time::Duration;

/// Limits of the publish and maintenance loops
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub publish_interval: Duration,

    /// Queue size above which the oldest records are trimmed
    pub max_queued_records: usize,

    /// Number of records removed per trim
    pub trim_batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            publish_interval: Duration::from_secs(10),
            max_queued_records: 1_000,
            trim_batch_size: 250,
        }
    }
}

/// When a periodic task first runs and how often it repeats
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Period {
    pub delay: Duration,
    pub every: Duration,
}

const fn mins(n: u64) -> Duration {
    Duration::from_secs(n * 60)
}

const fn hours(n: u64) -> Duration {
    mins(n * 60)
}

pub const INVENTORY_REFRESH: Period = Period {
    delay: hours(4),
    every: hours(4),
};

pub const SESSION_REFRESH: Period = Period {
    delay: Duration::ZERO,
    every: hours(1),
};

pub const SESSION_HEARTBEAT: Period = Period {
    delay: mins(2),
    every: mins(2),
};

pub const ALARM_POLLING: Period = Period {
    delay: Duration::ZERO,
    every: hours(1),
};

pub const INVENTORY_SNAPSHOT: Period = Period {
    delay: Duration::ZERO,
    every: hours(2),
};

pub const QUEUE_MAINTENANCE: Period = Period {
    delay: Duration::ZERO,
    every: mins(1),
};

pub const STATUS_REPORT: Period = Period {
    delay: Duration::from_secs(10),
    every: Duration::from_secs(30),
};

pub const CONTROLLER_SUMMARY: Period = Period {
    delay: Duration::from_secs(10),
    every: hours(1),
};
