// Cache warming: reference data, hot tours and popular directions are fetched
// ahead of demand. A cycle always completes; partial warms are reported, not raised.

use crate::cache::{Cache, CacheKey};
use crate::provider::{with_retry, HotToursQuery, ReferenceKind, RetryConfig, TourProvider};
use crate::strategy::{search_once, SearchOnceConfig};
use crate::tour::{retain_valid, stamp_departure, SearchParams, TourResult};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const REPORT_KEY: &str = "directions_cache_update_stats";

// Reference lists that do not depend on a country
const GLOBAL_REFERENCES: [ReferenceKind; 6] = [
    ReferenceKind::Departure,
    ReferenceKind::Country,
    ReferenceKind::Meal,
    ReferenceKind::Stars,
    ReferenceKind::Operator,
    ReferenceKind::Services,
];

#[derive(Debug, Clone)]
pub struct WarmingConfig {
    pub update_interval: Duration,
    pub batch_size: usize,
    pub batch_pause: Duration,
    pub search_timeout: Duration,
    // Stagger between searches inside one batch
    pub search_delay: Duration,
    // Percent of directions that must warm before failures are retried
    pub min_success_rate: f64,
    pub retry_failed: bool,
    pub auto_start: bool,
    pub cities: Vec<u32>,
    pub countries: Vec<u32>,
    pub hot_tours_items: u32,
    pub poll_interval: Duration,
}

impl Default for WarmingConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(24 * 60 * 60),
            batch_size: 3,
            batch_pause: Duration::from_secs(30),
            search_timeout: Duration::from_secs(120),
            search_delay: Duration::from_secs(1),
            min_success_rate: 80.0,
            retry_failed: true,
            auto_start: true,
            cities: vec![1, 2, 3],
            countries: vec![1, 4, 22],
            hot_tours_items: 20,
            poll_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectionOutcome {
    pub city: u32,
    pub country: u32,
    pub tours: usize,
    pub error: Option<String>,
    pub retried: bool,
}

impl DirectionOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmingReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub references_cached: usize,
    pub reference_failures: usize,
    pub hot_tour_keys_cached: usize,
    pub hot_tour_failures: usize,
    pub total_directions: usize,
    pub successful_directions: usize,
    pub failed_directions: usize,
    pub success_rate: f64,
    pub retried_directions: usize,
    pub directions: BTreeMap<String, DirectionOutcome>,
}

pub struct CacheWarmer {
    provider: Arc<dyn TourProvider>,
    cache: Cache,
    config: WarmingConfig,
    retry: RetryConfig,
}

impl CacheWarmer {
    pub fn new(
        provider: Arc<dyn TourProvider>,
        cache: Cache,
        config: WarmingConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            provider,
            cache,
            config,
            retry,
        }
    }

    pub fn config(&self) -> &WarmingConfig {
        &self.config
    }

    pub async fn run_cycle(&self) -> WarmingReport {
        let started_at = Utc::now();
        info!(
            cities = self.config.cities.len(),
            countries = self.config.countries.len(),
            "cache warming started"
        );

        let (references_cached, reference_failures) = self.warm_references().await;
        let (hot_tour_keys_cached, hot_tour_failures) = self.warm_hot_tours().await;
        let directions = self.warm_directions().await;

        let total_directions = directions.len();
        let successful_directions = directions.iter().filter(|d| d.succeeded()).count();
        let retried_directions = directions.iter().filter(|d| d.retried).count();

        let report = WarmingReport {
            started_at,
            finished_at: Utc::now(),
            references_cached,
            reference_failures,
            hot_tour_keys_cached,
            hot_tour_failures,
            total_directions,
            successful_directions,
            failed_directions: total_directions - successful_directions,
            success_rate: success_rate(successful_directions, total_directions),
            retried_directions,
            directions: directions
                .into_iter()
                .map(|d| (format!("{}_{}", d.city, d.country), d))
                .collect(),
        };

        info!(
            success_rate = report.success_rate,
            successful = report.successful_directions,
            failed = report.failed_directions,
            "cache warming finished"
        );
        self.cache.set(&CacheKey::JobReport(REPORT_KEY), &report);
        report
    }

    async fn warm_references(&self) -> (usize, usize) {
        let kinds = GLOBAL_REFERENCES.iter().copied().chain(
            self.config
                .countries
                .iter()
                .map(|&country| ReferenceKind::Region { country }),
        );

        let mut cached = 0;
        let mut failed = 0;
        for kind in kinds {
            let provider = &self.provider;
            match with_retry(&self.retry, || provider.references(kind)).await {
                Ok(items) => {
                    if self.cache.set(&CacheKey::Reference(kind.cache_name()), &items) {
                        cached += 1;
                    }
                }
                Err(err) => {
                    failed += 1;
                    warn!(reference = %kind.cache_name(), error = %err, "reference warm failed");
                }
            }
        }
        debug!(cached, failed, "references warmed");
        (cached, failed)
    }

    async fn warm_hot_tours(&self) -> (usize, usize) {
        let mut cached = 0;
        let mut failed = 0;

        for &city in &self.config.cities {
            let mut queries = vec![(
                CacheKey::HotToursCity { city },
                HotToursQuery::new(city, self.config.hot_tours_items),
            )];
            for &country in &self.config.countries {
                queries.push((
                    CacheKey::HotToursCityCountry { city, country },
                    HotToursQuery::new(city, self.config.hot_tours_items).with_country(country),
                ));
            }

            for (key, query) in queries {
                match self.provider.hot_tours(&query).await {
                    Ok(tours) => {
                        let (valid, _) = retain_valid(tours);
                        if self.cache.set(&key, &valid) {
                            cached += 1;
                        }
                    }
                    Err(err) => {
                        failed += 1;
                        warn!(key = %key.render(), error = %err, "hot tours warm failed");
                    }
                }
            }
        }
        (cached, failed)
    }

    fn direction_params(&self, city: u32, country: u32) -> SearchParams {
        SearchParams::new(city, country).resolved(Utc::now().date_naive())
    }

    async fn warm_direction(&self, city: u32, country: u32, stagger: Duration) -> DirectionOutcome {
        if !stagger.is_zero() {
            tokio::time::sleep(stagger).await;
        }

        let params = self.direction_params(city, country);
        let search = SearchOnceConfig {
            poll_interval: self.config.poll_interval,
            timeout: self.config.search_timeout,
            ..SearchOnceConfig::default()
        };

        match search_once(self.provider.as_ref(), &params, &search).await {
            Ok(mut tours) => {
                stamp_departure(&mut tours, city, self.cache.departure_name(city).as_deref());
                self.store_direction(city, country, &params, &tours);
                DirectionOutcome {
                    city,
                    country,
                    tours: tours.len(),
                    error: None,
                    retried: false,
                }
            }
            Err(err) => {
                warn!(city, country, error = %err, "direction warm failed");
                DirectionOutcome {
                    city,
                    country,
                    tours: 0,
                    error: Some(err.to_string()),
                    retried: false,
                }
            }
        }
    }

    fn store_direction(&self, city: u32, country: u32, params: &SearchParams, tours: &[TourResult]) {
        self.cache.set(&CacheKey::Direction { city, country }, tours);
        // Same criteria a client would send, so sessions can reuse it
        self.cache
            .set(&CacheKey::PopularSearch(params.fingerprint()), tours);
        debug!(city, country, tours = tours.len(), "direction cached");
    }

    async fn run_batches(&self, pairs: &[(u32, u32)]) -> Vec<DirectionOutcome> {
        let batch_size = self.config.batch_size.max(1);
        let batches: Vec<&[(u32, u32)]> = pairs.chunks(batch_size).collect();
        let mut outcomes = Vec::with_capacity(pairs.len());

        for (index, batch) in batches.iter().enumerate() {
            debug!(batch = index + 1, of = batches.len(), "warming batch");
            let futures = batch.iter().enumerate().map(|(slot, &(city, country))| {
                self.warm_direction(city, country, self.config.search_delay * slot as u32)
            });
            outcomes.extend(join_all(futures).await);

            if index + 1 < batches.len() {
                tokio::time::sleep(self.config.batch_pause).await;
            }
        }
        outcomes
    }

    async fn warm_directions(&self) -> Vec<DirectionOutcome> {
        let pairs: Vec<(u32, u32)> = self
            .config
            .cities
            .iter()
            .flat_map(|&city| self.config.countries.iter().map(move |&country| (city, country)))
            .collect();

        let mut outcomes = self.run_batches(&pairs).await;
        let succeeded = outcomes.iter().filter(|o| o.succeeded()).count();
        let rate = success_rate(succeeded, outcomes.len());

        if rate < self.config.min_success_rate && self.config.retry_failed {
            let failed: Vec<(u32, u32)> = outcomes
                .iter()
                .filter(|o| !o.succeeded())
                .map(|o| (o.city, o.country))
                .collect();
            info!(
                success_rate = rate,
                retrying = failed.len(),
                "success rate below threshold, retrying failed directions once"
            );

            tokio::time::sleep(self.config.batch_pause).await;
            for retried in self.run_batches(&failed).await {
                if let Some(slot) = outcomes
                    .iter_mut()
                    .find(|o| o.city == retried.city && o.country == retried.country)
                {
                    *slot = DirectionOutcome {
                        retried: true,
                        ..retried
                    };
                }
            }
        }
        outcomes
    }

    pub fn cached_direction(&self, city: u32, country: u32) -> Option<Vec<TourResult>> {
        self.cache.get(&CacheKey::Direction { city, country })
    }
}

fn success_rate(succeeded: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        succeeded as f64 / total as f64 * 100.0
    }
}
