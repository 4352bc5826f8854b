use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use beacon_queue::ClearScope;
use beacon_util::http::Uri;
use beacon_util::types::SymmetricKey;

fn parse_duration(s: &str) -> Result<Duration, ParseIntError> {
    let millis: u64 = s.parse()?;
    Ok(Duration::from_millis(millis))
}

fn parse_interval(s: &str) -> Result<Duration, String> {
    let interval = parse_duration(s).map_err(|e| e.to_string())?;
    if interval.is_zero() {
        return Err("interval must be greater than zero".into());
    }
    Ok(interval)
}

fn parse_days(s: &str) -> Result<Duration, String> {
    const SECS_PER_DAY: u64 = 24 * 60 * 60;
    let days: u64 = s.parse().map_err(|e: ParseIntError| e.to_string())?;
    days.checked_mul(SECS_PER_DAY)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("{days} days is out of range"))
}

/// Which queued records to delete before starting
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ClearQueue {
    All,
    Claimed,
}

impl From<ClearQueue> for ClearScope {
    fn from(value: ClearQueue) -> Self {
        match value {
            ClearQueue::All => ClearScope::All,
            ClearQueue::Claimed => ClearScope::ClaimedOnly,
        }
    }
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)] // read from Cargo.toml
pub struct Cli {
    /// Provisioning scope of the enrollment group
    #[arg(env = "BEACON_SCOPE_ID", long = "scope-id", value_name = "id")]
    pub scope_id: String,

    /// Registration id of this gateway
    #[arg(env = "BEACON_DEVICE_ID", long = "device-id", value_name = "id")]
    pub device_id: String,

    /// Enrollment group key, the device key is derived from it
    #[arg(
        env = "BEACON_GROUP_KEY",
        long = "group-key",
        value_name = "key",
        hide_env_values = true
    )]
    pub group_key: SymmetricKey,

    /// Provisioning service endpoint URI
    #[arg(
        env = "BEACON_PROVISIONING_ENDPOINT",
        long = "provisioning-endpoint",
        value_name = "uri"
    )]
    pub provisioning_endpoint: Option<Uri>,

    /// Send telemetry to this endpoint instead of the assigned hub
    #[arg(env = "BEACON_HUB_ENDPOINT", long = "hub-endpoint", value_name = "uri")]
    pub hub_endpoint: Option<Uri>,

    /// Lifetime of hub access tokens in days
    #[arg(
        env = "BEACON_SAS_TTL_DAYS",
        long = "sas-ttl-days",
        value_name = "days",
        value_parser = parse_days,
        default_value = "90"
    )]
    pub sas_ttl: Duration,

    /// Directory holding the controllers and points documents
    #[arg(env = "BEACON_CONFIG_DIR", long = "config-dir", value_name = "path")]
    pub config_dir: Option<PathBuf>,

    /// Offline queue database file
    #[arg(env = "BEACON_QUEUE_PATH", long = "queue-path", value_name = "path")]
    pub queue_path: Option<PathBuf>,

    /// Delete queued records and exit
    #[arg(long = "clear-queue", value_name = "scope")]
    pub clear_queue: Option<ClearQueue>,

    /// Queue size above which the oldest records are dropped
    #[arg(
        env = "BEACON_MAX_QUEUED_RECORDS",
        long = "max-queued-records",
        value_name = "int",
        default_value_t = 1_000
    )]
    pub max_queued_records: usize,

    /// Number of records dropped per trim
    #[arg(
        env = "BEACON_TRIM_BATCH_SIZE",
        long = "trim-batch-size",
        value_name = "int",
        default_value_t = 250
    )]
    pub trim_batch_size: usize,

    /// Publish interval in milliseconds
    #[arg(
        env = "BEACON_PUBLISH_INTERVAL_MS",
        long = "publish-interval-ms",
        value_name = "ms",
        value_parser = parse_interval,
        default_value = "10000"
    )]
    pub publish_interval: Duration,

    /// Attempts per controller request
    #[arg(
        env = "BEACON_HTTP_RETRIES",
        long = "http-retries",
        value_name = "int",
        default_value_t = 3
    )]
    pub http_retries: u32,

    /// Delay between controller request attempts in milliseconds
    #[arg(
        env = "BEACON_RETRY_DELAY_MS",
        long = "retry-delay-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "3000"
    )]
    pub retry_delay: Duration,

    /// Controller request timeout in milliseconds
    #[arg(
        env = "BEACON_HTTP_TIMEOUT_MS",
        long = "http-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "3000"
    )]
    pub http_timeout: Duration,

    /// Delay between consecutive controller requests in milliseconds
    #[arg(
        env = "BEACON_REQUEST_DELAY_MS",
        long = "request-delay-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "1000"
    )]
    pub request_delay: Duration,
}

/// Parse CLI arguments
pub fn parse() -> Cli {
    Cli::parse()
}
