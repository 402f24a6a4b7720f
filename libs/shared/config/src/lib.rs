use std::env;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub api_port: u16,
    pub queue: QueueSettings,
}

/// Tunables for the appointment queue engine.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub appointments_collection: String,
    pub local_cache_key: String,
    /// Directory for the durable local cache. `None` keeps the cache in memory.
    pub local_cache_dir: Option<String>,
    pub slot_duration_minutes: i64,
    /// Offset of the clinic's wall clock from UTC; defines "today" for the live queue.
    pub clinic_utc_offset_minutes: i32,
    pub remote_poll_interval_secs: u64,
    /// Number of equality filters the remote store is trusted to apply server-side.
    pub server_filter_limit: usize,
    pub meeting_base_url: String,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            appointments_collection: "appointments".to_string(),
            local_cache_key: "appointments".to_string(),
            local_cache_dir: None,
            slot_duration_minutes: 60,
            clinic_utc_offset_minutes: 0,
            remote_poll_interval_secs: 5,
            server_filter_limit: 1,
            meeting_base_url: "https://meet.clinic.local/room".to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = QueueSettings::default();

        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using empty value");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            api_port: parse_or("API_PORT", 3000),
            queue: QueueSettings {
                appointments_collection: env::var("APPOINTMENTS_COLLECTION")
                    .unwrap_or(defaults.appointments_collection),
                local_cache_key: env::var("LOCAL_CACHE_KEY")
                    .unwrap_or(defaults.local_cache_key),
                local_cache_dir: env::var("LOCAL_CACHE_DIR").ok().filter(|dir| !dir.is_empty()),
                slot_duration_minutes: parse_or("SLOT_DURATION_MINUTES", defaults.slot_duration_minutes),
                clinic_utc_offset_minutes: parse_or("CLINIC_UTC_OFFSET_MINUTES", defaults.clinic_utc_offset_minutes),
                remote_poll_interval_secs: parse_or("REMOTE_POLL_INTERVAL_SECS", defaults.remote_poll_interval_secs),
                server_filter_limit: parse_or("SERVER_FILTER_LIMIT", defaults.server_filter_limit),
                meeting_base_url: env::var("MEETING_BASE_URL")
                    .unwrap_or_else(|_| {
                        warn!("MEETING_BASE_URL not set, using default");
                        defaults.meeting_base_url
                    }),
            },
        };

        if !config.is_configured() {
            warn!("Remote store not configured - running against the in-memory store");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty() && !self.supabase_anon_key.is_empty()
    }
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} has an invalid value '{}', using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_queue_settings_use_hour_long_slots() {
        let settings = QueueSettings::default();
        assert_eq!(settings.slot_duration_minutes, 60);
        assert_eq!(settings.server_filter_limit, 1);
        assert!(settings.local_cache_dir.is_none());
    }

    #[test]
    fn parse_or_falls_back_on_garbage() {
        env::set_var("QUEUE_CONFIG_TEST_GARBAGE", "not-a-number");
        assert_eq!(parse_or("QUEUE_CONFIG_TEST_GARBAGE", 42u64), 42);
        env::remove_var("QUEUE_CONFIG_TEST_GARBAGE");
    }
}
