// Wires the provider, cache, sessions and background jobs into one handle.

use crate::cache::{Cache, CacheKey, CacheStatsReport};
use crate::config::EngineConfig;
use crate::notify::NotificationHub;
use crate::provider::{HotToursQuery, HttpProvider, ProviderError, ReferenceKind, TourProvider};
use crate::random_tours::RandomTourGenerator;
use crate::scheduler::{JobKind, JobStatus, Scheduler};
use crate::session::SessionManager;
use crate::strategy::{build_strategies, SearchOnceConfig};
use crate::tour::{retain_valid, TourResult};
use crate::warming::CacheWarmer;
use crate::wire::ReferenceItem;
use std::sync::Arc;
use tracing::{debug, info};

pub struct Engine {
    provider: Arc<dyn TourProvider>,
    cache: Cache,
    hub: NotificationHub,
    sessions: SessionManager,
    warmer: Arc<CacheWarmer>,
    generator: Arc<RandomTourGenerator>,
    scheduler: Scheduler,
    hot_tours_items: u32,
}

impl Engine {
    /// Engine backed by the HTTP provider described in `config.provider`.
    pub fn new(config: EngineConfig) -> Result<Self, ProviderError> {
        let provider = HttpProvider::new(config.provider.clone())?;
        Ok(Self::with_provider(Arc::new(provider), config))
    }

    pub fn with_provider(provider: Arc<dyn TourProvider>, config: EngineConfig) -> Self {
        let cache = Cache::in_memory(config.cache.clone(), config.ttl.clone());
        let hub = NotificationHub::new(config.notifications.clone());
        let sessions = SessionManager::new(
            Arc::clone(&provider),
            cache.clone(),
            hub.clone(),
            config.session.clone(),
        );

        let warmer = Arc::new(CacheWarmer::new(
            Arc::clone(&provider),
            cache.clone(),
            config.warming.clone(),
            config.session.retry.clone(),
        ));

        let search = SearchOnceConfig {
            timeout: config.warming.search_timeout,
            ..SearchOnceConfig::default()
        };
        let strategies = build_strategies(
            &config.random_tours.strategies,
            Arc::clone(&provider),
            search,
        );
        let generator = Arc::new(RandomTourGenerator::new(
            strategies,
            cache.clone(),
            config.random_tours.clone(),
        ));

        let scheduler = Scheduler::new(
            Arc::clone(&warmer),
            Arc::clone(&generator),
            config.scheduler.clone(),
        );

        Self {
            provider,
            cache,
            hub,
            sessions,
            warmer,
            generator,
            scheduler,
            hot_tours_items: config.warming.hot_tours_items,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn hub(&self) -> &NotificationHub {
        &self.hub
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Starts the background jobs.
    pub fn start(&self) {
        info!("engine starting");
        self.scheduler.start();
    }

    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        info!(
            active_sessions = self.sessions.active_sessions(),
            "engine stopped"
        );
    }

    /// Hot tours for a departure city, optionally narrowed to one country.
    /// Served from cache when warm; concurrent misses share one provider call.
    pub async fn hot_tours(
        &self,
        city: u32,
        country: Option<u32>,
    ) -> Result<Vec<TourResult>, ProviderError> {
        let (key, query) = match country {
            Some(country) => (
                CacheKey::HotToursCityCountry { city, country },
                HotToursQuery::new(city, self.hot_tours_items).with_country(country),
            ),
            None => (
                CacheKey::HotToursCity { city },
                HotToursQuery::new(city, self.hot_tours_items),
            ),
        };

        let provider = Arc::clone(&self.provider);
        self.cache
            .get_or_compute(&key, move || async move {
                let tours = provider.hot_tours(&query).await?;
                let (valid, dropped) = retain_valid(tours);
                if dropped > 0 {
                    debug!(city, dropped, "invalid hot tours discarded");
                }
                Ok(valid)
            })
            .await
    }

    pub async fn reference(&self, kind: ReferenceKind) -> Result<Vec<ReferenceItem>, ProviderError> {
        let key = CacheKey::Reference(kind.cache_name());
        let provider = Arc::clone(&self.provider);
        self.cache
            .get_or_compute(&key, move || async move { provider.references(kind).await })
            .await
    }

    /// Pre-generated tours for a hotel type; `None` until the first cycle stored them.
    pub fn random_tours(&self, hotel_type: &str) -> Option<Vec<TourResult>> {
        self.generator.cached(hotel_type)
    }

    pub fn direction(&self, city: u32, country: u32) -> Option<Vec<TourResult>> {
        self.warmer.cached_direction(city, country)
    }

    pub fn job_status(&self, kind: JobKind) -> JobStatus {
        self.scheduler.status(kind)
    }

    pub fn cache_stats(&self) -> CacheStatsReport {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock_provider::{MockProvider, SearchScript};
    use crate::session::{SessionStatus, SortOrder};
    use crate::tour::{sample_tour, SearchParams};
    use std::time::Duration;

    fn quiet_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.warming.auto_start = false;
        config.random_tours.auto_start = false;
        config.session.poll_interval = Duration::from_millis(100);
        config
    }

    fn engine(provider: &Arc<MockProvider>) -> Engine {
        let provider: Arc<dyn TourProvider> = provider.clone();
        Engine::with_provider(provider, quiet_config())
    }

    #[tokio::test(start_paused = true)]
    async fn hot_tours_read_through_hits_provider_once() {
        let provider = Arc::new(MockProvider::new());
        let mut broken = sample_tour("broken", 4, 100.0);
        broken.price = -1.0;
        provider.set_hot_tours(Some(4), vec![sample_tour("a", 4, 900.0), broken]);
        let engine = engine(&provider);

        let first = engine.hot_tours(1, Some(4)).await.unwrap();
        let second = engine.hot_tours(1, Some(4)).await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(first, second);
        assert_eq!(MockProvider::calls(&provider.hot_calls), 1);
        assert!(engine.cache_stats().hit_count >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reference_failures_are_not_cached() {
        let provider = Arc::new(MockProvider::new());
        provider.set_reference(
            ReferenceKind::Country,
            vec![ReferenceItem {
                id: "4".into(),
                name: "Turkey".into(),
            }],
        );
        provider.fail_next(vec![ProviderError::Unavailable("down".into())]);
        let engine = engine(&provider);

        assert!(engine.reference(ReferenceKind::Country).await.is_err());
        let countries = engine.reference(ReferenceKind::Country).await.unwrap();
        assert_eq!(countries[0].name, "Turkey");
        engine.reference(ReferenceKind::Country).await.unwrap();
        assert_eq!(MockProvider::calls(&provider.reference_calls), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn search_session_runs_through_the_engine() {
        let provider = Arc::new(MockProvider::new());
        provider.set_script(SearchScript::new(
            vec![(40, 1), (100, 2)],
            vec![sample_tour("a", 4, 500.0), sample_tour("b", 4, 300.0)],
        ));
        let engine = engine(&provider);

        let id = engine.sessions().start_search(SearchParams::new(1, 4));
        tokio::time::sleep(Duration::from_secs(5)).await;

        let session = engine.sessions().get_session(&id).unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        let cheapest = engine
            .sessions()
            .results(&id, SortOrder::PriceAscending)
            .unwrap();
        assert_eq!(cheapest[0].hotel_code, "b");
        assert_eq!(engine.hub().total_subscribers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_jobs_fill_the_cache() {
        let provider = Arc::new(MockProvider::new());
        provider.set_script(SearchScript::new(vec![(100, 1)], vec![sample_tour("d", 4, 700.0)]));
        provider.set_hot_tours(None, vec![sample_tour("h", 1, 400.0)]);
        for country in [1, 2, 4, 8, 9] {
            provider.set_hot_tours(Some(country), vec![sample_tour("h", country, 400.0)]);
        }

        let mut config = quiet_config();
        config.warming.cities = vec![1];
        config.warming.countries = vec![4];
        config.random_tours.hotel_types = vec!["beach".to_string()];
        config.random_tours.tours_per_type = 1;
        let provider_dyn: Arc<dyn TourProvider> = provider.clone();
        let engine = Engine::with_provider(provider_dyn, config);

        engine.scheduler().run_warming_now().await;
        engine.scheduler().run_random_tours_now().await;

        assert_eq!(engine.direction(1, 4).unwrap().len(), 1);
        assert_eq!(engine.random_tours("beach").unwrap().len(), 1);
        assert!(engine.random_tours("deluxe").is_none());
        assert_eq!(engine.job_status(JobKind::CacheWarming).cycles_completed, 1);

        // Warmed hot tours are served without another provider call
        let before = MockProvider::calls(&provider.hot_calls);
        engine.hot_tours(1, Some(4)).await.unwrap();
        assert_eq!(MockProvider::calls(&provider.hot_calls), before);
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_shutdown_toggle_the_scheduler() {
        let provider = Arc::new(MockProvider::new());
        let engine = engine(&provider);
        engine.start();
        assert!(engine.scheduler().is_running());
        engine.shutdown().await;
        assert!(!engine.scheduler().is_running());
    }
}
