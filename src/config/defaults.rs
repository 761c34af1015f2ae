//! Default values for configuration

/// Default extraction service base URL
pub fn default_service_url() -> String {
    std::env::var("REQFLOW_SERVICE_URL").unwrap_or_else(|_| "http://127.0.0.1:8000".to_string())
}

/// Default environment variable holding the service API key
pub fn default_service_api_key_env() -> String {
    "REQFLOW_API_KEY".to_string()
}

/// Default timeout for lightweight service calls (status, metadata)
pub fn default_service_request_timeout() -> u64 {
    30
}

/// Default timeout for requirement extraction calls
pub fn default_service_extract_timeout() -> u64 {
    90
}

/// Default timeout for knowledge base build calls
pub fn default_service_build_timeout() -> u64 {
    120
}

/// Default timeout for starting conflict detection
pub fn default_service_conflict_timeout() -> u64 {
    300
}

/// Default maximum characters of document content sent for extraction
pub fn default_ingest_max_content_chars() -> usize {
    8000
}

/// Default bound for the single retry after an unparsable extraction response
pub fn default_ingest_retry_content_chars() -> usize {
    3000
}

/// Default maximum length of a derived requirement title
pub fn default_ingest_title_max_chars() -> usize {
    100
}

/// Default confidence for candidates that carry none
pub fn default_ingest_default_confidence() -> f64 {
    0.8
}

/// Default ingestion attempts
pub fn default_ingest_max_attempts() -> u32 {
    3
}

/// Default backoff between ingestion attempts (seconds)
pub fn default_ingest_backoff_secs() -> Vec<u64> {
    vec![10, 30, 90]
}

/// Default ingestion timeout per attempt (seconds)
pub fn default_ingest_timeout() -> u64 {
    180
}

/// Default TTL of the per-project build lock (seconds)
pub fn default_build_lock_ttl() -> u64 {
    600
}

/// Default build timeout per attempt (seconds)
pub fn default_build_timeout() -> u64 {
    300
}

/// Default build attempts
pub fn default_build_max_attempts() -> u32 {
    1
}

/// Default conflict poll attempt budget
pub fn default_poller_max_attempts() -> u32 {
    20
}

/// Default fixed delay between poll attempts (seconds)
pub fn default_poller_delay() -> u64 {
    5
}

/// Default delay before the first poll, so the service can register the job (seconds)
pub fn default_poller_cascade_delay() -> u64 {
    3
}

/// Default timeout for a single poll attempt (seconds)
pub fn default_poller_timeout() -> u64 {
    60
}

/// Default number of concurrent workers
pub fn default_worker_concurrency() -> usize {
    4
}

/// Default sleep when the queue has nothing due (milliseconds)
pub fn default_worker_idle_poll_ms() -> u64 {
    1000
}

/// Default grace added to a job timeout before its lease is considered abandoned (seconds)
pub fn default_worker_lease_grace() -> u64 {
    60
}
