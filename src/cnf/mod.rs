use once_cell::sync::Lazy;

/// Specifies how many preprocessing worker threads are started by default.
pub static PREPROC_WORKERS: Lazy<usize> =
	lazy_env_parse_or_else!("SENTINEL_PREPROC_WORKERS", usize, |_| num_cpus::get());

/// Specifies how many checks a single poller keeps in flight at most.
pub static MAX_CONCURRENT_CHECKS_PER_POLLER: Lazy<usize> =
	lazy_env_parse!("SENTINEL_MAX_CONCURRENT_CHECKS_PER_POLLER", usize, 1000);

/// Specifies the per-check network timeout in seconds.
pub static TIMEOUT: Lazy<u64> = lazy_env_parse!("SENTINEL_TIMEOUT", u64, 3);

/// Specifies for how many seconds an interface is skipped once it has been
/// marked unavailable.
pub static UNAVAILABLE_DELAY: Lazy<i64> = lazy_env_parse!("SENTINEL_UNAVAILABLE_DELAY", i64, 60);

/// Specifies for how many seconds an interface is skipped after a single
/// network error, while it is still considered reachable.
pub static UNREACHABLE_DELAY: Lazy<i64> = lazy_env_parse!("SENTINEL_UNREACHABLE_DELAY", i64, 15);

/// Specifies how many seconds of consecutive network errors it takes before
/// an interface is marked unavailable.
pub static UNREACHABLE_PERIOD: Lazy<i64> = lazy_env_parse!("SENTINEL_UNREACHABLE_PERIOD", i64, 45);

/// Specifies the SNMP bulk-walk max-repetitions value re-armed on cache reload.
#[cfg(feature = "snmp")]
pub static SNMP_MAX_REPETITIONS: Lazy<u32> = lazy_env_parse!("SENTINEL_SNMP_MAX_REPETITIONS", u32, 10);

/// The interval of the poller dispatch timer, in seconds.
pub const DISPATCH_INTERVAL: u64 = 1;

/// If a poller is busy and does not sleep then its status counters are
/// reported not faster than once in this many seconds.
pub const STAT_INTERVAL: i64 = 5;
