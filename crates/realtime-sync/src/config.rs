use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub log_filter: String,
    /// Announced with presence so peers can show who is typing.
    pub user_id: Option<String>,
    /// First reconnect ceiling; doubles per attempt.
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// How long a released topic stays open waiting for a new consumer.
    pub release_grace: Duration,
    /// Pending optimistic writes are force-retired after this.
    pub write_timeout: Duration,
    /// Server timestamps this far behind `submitted_at` still confirm a write.
    pub clock_skew_allowance: Duration,
    pub presence_silence: Duration,
    pub presence_tick: Duration,
    pub typing_heartbeat: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            log_filter: "info,realtime_sync=debug".into(),
            user_id: None,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            release_grace: Duration::from_millis(250),
            write_timeout: Duration::from_secs(10),
            clock_skew_allowance: Duration::ZERO,
            presence_silence: Duration::from_secs(1),
            presence_tick: Duration::from_millis(250),
            typing_heartbeat: Duration::from_millis(400),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |key: &str, fallback: Duration| {
            lookup(key)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };
        Self {
            log_filter: lookup("RUST_LOG").unwrap_or(defaults.log_filter),
            user_id: lookup("REALTIME_SYNC_USER_ID").filter(|id| !id.is_empty()),
            backoff_base: millis("REALTIME_SYNC_BACKOFF_BASE_MS", defaults.backoff_base),
            backoff_cap: millis("REALTIME_SYNC_BACKOFF_CAP_MS", defaults.backoff_cap),
            release_grace: millis("REALTIME_SYNC_RELEASE_GRACE_MS", defaults.release_grace),
            write_timeout: millis("REALTIME_SYNC_WRITE_TIMEOUT_MS", defaults.write_timeout),
            clock_skew_allowance: millis(
                "REALTIME_SYNC_CLOCK_SKEW_MS",
                defaults.clock_skew_allowance,
            ),
            presence_silence: millis("REALTIME_SYNC_PRESENCE_SILENCE_MS", defaults.presence_silence),
            presence_tick: millis("REALTIME_SYNC_PRESENCE_TICK_MS", defaults.presence_tick),
            typing_heartbeat: millis("REALTIME_SYNC_TYPING_HEARTBEAT_MS", defaults.typing_heartbeat),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_overrides_and_fallbacks() {
        let vars: HashMap<&str, &str> = [
            ("REALTIME_SYNC_WRITE_TIMEOUT_MS", "2500"),
            ("REALTIME_SYNC_BACKOFF_CAP_MS", "not-a-number"),
            ("RUST_LOG", "warn"),
        ]
        .into_iter()
        .collect();
        let cfg = SyncConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(cfg.write_timeout, Duration::from_millis(2500));
        assert_eq!(cfg.backoff_cap, Duration::from_secs(30));
        assert_eq!(cfg.log_filter, "warn");
        assert_eq!(cfg.presence_silence, Duration::from_secs(1));
        assert_eq!(cfg.user_id, None);
    }
}
