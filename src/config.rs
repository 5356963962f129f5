use crate::cache::{CacheConfig, TtlPolicy};
use crate::notify::NotificationConfig;
use crate::provider::ProviderConfig;
use crate::random_tours::RandomToursConfig;
use crate::scheduler::SchedulerConfig;
use crate::session::SessionConfig;
use crate::tour::TourSource;
use crate::warming::WarmingConfig;
use anyhow::{bail, Context, Result};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub provider: ProviderConfig,
    pub cache: CacheConfig,
    pub ttl: TtlPolicy,
    pub session: SessionConfig,
    pub notifications: NotificationConfig,
    pub warming: WarmingConfig,
    pub random_tours: RandomToursConfig,
    pub scheduler: SchedulerConfig,
}

impl EngineConfig {
    /// Load configuration from environment variables. Unset variables keep
    /// their defaults; a set but unparsable value is an error.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut config = Self::default();

        if let Some(url) = env.string("PROVIDER_BASE_URL") {
            config.provider.base_url = url;
        }
        if let Some(login) = env.string("PROVIDER_AUTH_LOGIN") {
            config.provider.auth_login = login;
        }
        if let Some(pass) = env.string("PROVIDER_AUTH_PASS") {
            config.provider.auth_pass = pass;
        }
        if let Some(secs) = env.parsed::<u64>("PROVIDER_TIMEOUT_SECS")? {
            config.provider.timeout = Duration::from_secs(secs);
        }

        if let Some(mb) = env.parsed::<usize>("CACHE_MAX_SIZE_MB")? {
            config.cache.max_size_mb = mb;
        }
        if let Some(secs) = env.parsed::<u64>("SEARCH_CACHE_TTL_SECS")? {
            config.ttl.search = Duration::from_secs(secs);
        }
        if let Some(hours) = env.parsed::<u64>("CACHE_TTL_HOURS")? {
            config.ttl.direction = hours_to_duration(hours);
        }

        if let Some(ms) = env.parsed::<u64>("SEARCH_POLL_INTERVAL_MS")? {
            config.session.poll_interval = Duration::from_millis(ms);
        }
        if let Some(attempts) = env.parsed::<u32>("SEARCH_MAX_POLL_ATTEMPTS")? {
            if attempts == 0 {
                bail!("SEARCH_MAX_POLL_ATTEMPTS must be at least 1");
            }
            config.session.max_poll_attempts = attempts;
        }
        if let Some(secs) = env.parsed::<u64>("POPULAR_SEARCH_WINDOW_SECS")? {
            config.session.dedup_window = Duration::from_secs(secs);
        }

        let warming = &mut config.warming;
        if let Some(hours) = env.parsed::<u64>("CACHE_UPDATE_INTERVAL_HOURS")? {
            warming.update_interval = hours_to_duration(hours);
        }
        if let Some(size) = env.parsed::<usize>("CACHE_UPDATE_BATCH_SIZE")? {
            warming.batch_size = size.max(1);
        }
        if let Some(secs) = env.parsed::<u64>("CACHE_UPDATE_BATCH_PAUSE")? {
            warming.batch_pause = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parsed::<u64>("CACHE_SEARCH_TIMEOUT")? {
            warming.search_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parsed::<f64>("CACHE_SEARCH_DELAY")? {
            warming.search_delay = Duration::try_from_secs_f64(secs)
                .context("CACHE_SEARCH_DELAY must be a non-negative number of seconds")?;
        }
        if let Some(rate) = env.parsed::<f64>("CACHE_MIN_SUCCESS_RATE")? {
            if !(0.0..=100.0).contains(&rate) {
                bail!("CACHE_MIN_SUCCESS_RATE must be between 0 and 100, got {}", rate);
            }
            warming.min_success_rate = rate;
        }
        if let Some(retry) = env.flag("CACHE_RETRY_FAILED")? {
            warming.retry_failed = retry;
        }
        if let Some(auto_start) = env.flag("CACHE_AUTO_START")? {
            warming.auto_start = auto_start;
        }

        let random = &mut config.random_tours;
        if let Some(hours) = env.parsed::<u64>("RANDOM_TOURS_UPDATE_INTERVAL_HOURS")? {
            random.update_interval = hours_to_duration(hours);
        }
        if let Some(count) = env.parsed::<usize>("RANDOM_TOURS_PER_TYPE")? {
            random.tours_per_type = count;
        }
        if let Some(types) = env.string("RANDOM_TOURS_HOTEL_TYPES") {
            random.hotel_types = split_list(&types).map(str::to_string).collect();
        }
        if let Some(countries) = env.list::<u32>("RANDOM_TOURS_COUNTRIES")? {
            random.countries = countries;
        }
        if let Some(cities) = env.list::<u32>("RANDOM_TOURS_CITIES")? {
            random.cities = cities;
        }
        if let Some(raw) = env.string("RANDOM_TOURS_STRATEGIES") {
            random.strategies = parse_strategies(&raw)?;
        }
        if let Some(diversity) = env.flag("RANDOM_TOURS_PRIORITIZE_DIVERSITY")? {
            random.prioritize_diversity = diversity;
        }
        if let Some(auto_start) = env.flag("RANDOM_TOURS_AUTO_START")? {
            random.auto_start = auto_start;
        }

        Ok(config)
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        self.string(name)
            .map(|raw| {
                raw.parse::<T>()
                    .with_context(|| format!("invalid value for {}: {:?}", name, raw))
            })
            .transpose()
    }

    fn flag(&self, name: &str) -> Result<Option<bool>> {
        self.string(name)
            .map(|raw| match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => bail!("invalid boolean for {}: {:?}", name, raw),
            })
            .transpose()
    }

    fn list<T>(&self, name: &str) -> Result<Option<Vec<T>>>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        self.string(name)
            .map(|raw| {
                split_list(&raw)
                    .map(|item| {
                        item.parse::<T>()
                            .with_context(|| format!("invalid item {:?} in {}", item, name))
                    })
                    .collect::<Result<Vec<T>>>()
            })
            .transpose()
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|item| !item.is_empty())
}

fn parse_strategies(raw: &str) -> Result<Vec<TourSource>> {
    let mut strategies = Vec::new();
    for item in split_list(raw) {
        let source = TourSource::parse(item)
            .with_context(|| format!("unknown strategy {:?} in RANDOM_TOURS_STRATEGIES", item))?;
        if !strategies.contains(&source) {
            strategies.push(source);
        }
    }
    if strategies.is_empty() {
        bail!("RANDOM_TOURS_STRATEGIES names no strategy");
    }
    Ok(strategies)
}

fn hours_to_duration(hours: u64) -> Duration {
    Duration::from_secs(hours * 60 * 60)
}
