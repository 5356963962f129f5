// Diversified random tour sets, one per hotel type.
//
// Sampling walks the tracked countries without repeating one until all have
// been tried, then backfills from departure cities when the quota is unmet.

use crate::cache::{Cache, CacheKey};
use crate::strategy::{SampleRequest, TourStrategy};
use crate::tour::{TourResult, TourSource};
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const REPORT_KEY: &str = "random_tours_cache_update_stats";

#[derive(Debug, Clone)]
pub struct RandomToursConfig {
    pub update_interval: Duration,
    pub tours_per_type: usize,
    pub hotel_types: Vec<String>,
    pub countries: Vec<u32>,
    pub cities: Vec<u32>,
    pub strategies: Vec<TourSource>,
    pub prioritize_diversity: bool,
    pub auto_start: bool,
    // Sampling attempts allowed per requested tour
    pub attempts_per_tour: usize,
    // Candidates requested per sampling call
    pub batch: u32,
}

impl Default for RandomToursConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(12 * 60 * 60),
            tours_per_type: 8,
            hotel_types: crate::strategy::HOTEL_TYPES
                .iter()
                .map(|t| t.to_string())
                .collect(),
            countries: vec![1, 2, 4, 9, 8],
            cities: vec![1, 2, 3, 4, 5],
            strategies: vec![TourSource::HotTours],
            prioritize_diversity: true,
            auto_start: true,
            attempts_per_tour: 3,
            batch: 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HotelTypeReport {
    pub tours: usize,
    pub attempts: usize,
    pub backfilled: usize,
    pub provider_errors: usize,
    pub countries: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomToursReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tours_per_type: usize,
    pub total_tours: usize,
    pub successful_types: usize,
    pub empty_types: usize,
    pub strategies_used: BTreeMap<String, usize>,
    pub hotel_types: BTreeMap<String, HotelTypeReport>,
}

// Hands out countries without repeats until every one has been used
struct CountryRotation<'a> {
    countries: &'a [u32],
    used: HashSet<u32>,
    diverse: bool,
}

impl<'a> CountryRotation<'a> {
    fn new(countries: &'a [u32], diverse: bool) -> Self {
        Self {
            countries,
            used: HashSet::new(),
            diverse,
        }
    }

    fn next(&mut self) -> Option<u32> {
        let mut rng = rand::thread_rng();
        if !self.diverse {
            return self.countries.choose(&mut rng).copied();
        }

        let mut fresh: Vec<u32> = self
            .countries
            .iter()
            .copied()
            .filter(|c| !self.used.contains(c))
            .collect();
        if fresh.is_empty() {
            self.used.clear();
            fresh = self.countries.to_vec();
        }
        let picked = fresh.choose(&mut rng).copied()?;
        self.used.insert(picked);
        Some(picked)
    }
}

pub struct RandomTourGenerator {
    strategies: Vec<Box<dyn TourStrategy>>,
    cache: Cache,
    config: RandomToursConfig,
}

struct Collected {
    tours: Vec<TourResult>,
    seen: HashSet<String>,
    report: HotelTypeReport,
}

impl Collected {
    // Keeps the tour if it is valid and not already taken
    fn offer(&mut self, tour: TourResult) -> bool {
        if !tour.is_valid() || !self.seen.insert(tour.identity()) {
            return false;
        }
        self.tours.push(tour);
        true
    }
}

impl RandomTourGenerator {
    pub fn new(
        strategies: Vec<Box<dyn TourStrategy>>,
        cache: Cache,
        config: RandomToursConfig,
    ) -> Self {
        Self {
            strategies,
            cache,
            config,
        }
    }

    pub fn config(&self) -> &RandomToursConfig {
        &self.config
    }

    /// Builds the tour set for one hotel type. Provider failures never abort the run.
    pub async fn generate(&self, hotel_type: &str) -> (Vec<TourResult>, HotelTypeReport) {
        let target = self.config.tours_per_type;
        let max_attempts = target * self.config.attempts_per_tour.max(1);
        let mut collected = Collected {
            tours: Vec::new(),
            seen: HashSet::new(),
            report: HotelTypeReport::default(),
        };
        let mut rotation =
            CountryRotation::new(&self.config.countries, self.config.prioritize_diversity);

        while collected.tours.len() < target && collected.report.attempts < max_attempts {
            collected.report.attempts += 1;
            let Some(country) = rotation.next() else { break };
            let city = self.pick_city();
            let request = SampleRequest {
                city,
                country: Some(country),
                hotel_type: hotel_type.to_string(),
                batch: self.config.batch,
            };

            for strategy in &self.strategies {
                match strategy.candidates(&request).await {
                    Ok(candidates) => {
                        let first = candidates
                            .into_iter()
                            .find(|tour| !collected.seen.contains(&tour.identity()));
                        if let Some(tour) = first {
                            if collected.offer(tour) {
                                debug!(
                                    hotel_type = hotel_type,
                                    country = country,
                                    strategy = strategy.source().as_str(),
                                    "accepted sampled tour"
                                );
                                break;
                            }
                            debug!(
                                hotel_type = hotel_type,
                                country = country,
                                "first candidate failed validation"
                            );
                        }
                    }
                    Err(err) => {
                        collected.report.provider_errors += 1;
                        warn!(
                            hotel_type = hotel_type,
                            country = country,
                            city = city,
                            strategy = strategy.source().as_str(),
                            error = %err,
                            "sampling failed, moving on"
                        );
                    }
                }
            }
        }

        if collected.tours.len() < target {
            self.backfill(hotel_type, &mut collected).await;
        }

        let mut countries: Vec<String> = collected
            .tours
            .iter()
            .map(|t| t.country_code.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        countries.sort();
        collected.report.countries = countries;
        collected.report.tours = collected.tours.len();
        (collected.tours, collected.report)
    }

    async fn backfill(&self, hotel_type: &str, collected: &mut Collected) {
        let target = self.config.tours_per_type;
        debug!(
            hotel_type = hotel_type,
            have = collected.tours.len(),
            target,
            "backfilling from departure cities"
        );

        for &city in &self.config.cities {
            if collected.tours.len() >= target {
                break;
            }
            let request = SampleRequest {
                city,
                country: None,
                hotel_type: hotel_type.to_string(),
                batch: (target - collected.tours.len()) as u32 * 2,
            };

            for strategy in &self.strategies {
                if collected.tours.len() >= target {
                    break;
                }
                match strategy.candidates(&request).await {
                    Ok(candidates) => {
                        for tour in candidates {
                            if collected.tours.len() >= target {
                                break;
                            }
                            if collected.offer(tour) {
                                collected.report.backfilled += 1;
                            }
                        }
                    }
                    Err(err) => {
                        collected.report.provider_errors += 1;
                        warn!(city = city, error = %err, "backfill call failed");
                    }
                }
            }
        }
    }

    fn pick_city(&self) -> u32 {
        let mut rng = rand::thread_rng();
        self.config.cities.choose(&mut rng).copied().unwrap_or(1)
    }

    /// Regenerates every configured hotel type and writes the sets and a report.
    pub async fn run_cycle(&self) -> RandomToursReport {
        let started_at = Utc::now();
        info!(
            hotel_types = self.config.hotel_types.len(),
            tours_per_type = self.config.tours_per_type,
            "random tours update started"
        );

        let mut hotel_types = BTreeMap::new();
        let mut strategies_used: BTreeMap<String, usize> = BTreeMap::new();
        let mut total_tours = 0;
        let mut successful_types = 0;
        let mut empty_types = 0;

        for hotel_type in &self.config.hotel_types {
            let (tours, report) = self.generate(hotel_type).await;

            for tour in &tours {
                let source = tour.source.map(|s| s.as_str()).unwrap_or("unknown");
                *strategies_used.entry(source.to_string()).or_default() += 1;
            }
            if tours.is_empty() {
                empty_types += 1;
                warn!(hotel_type = %hotel_type, "no random tours produced");
            } else {
                successful_types += 1;
            }
            total_tours += tours.len();

            self.cache.set(
                &CacheKey::RandomTours {
                    hotel_type: hotel_type.clone(),
                },
                &tours,
            );
            info!(
                hotel_type = %hotel_type,
                tours = tours.len(),
                attempts = report.attempts,
                backfilled = report.backfilled,
                "random tours stored"
            );
            hotel_types.insert(hotel_type.clone(), report);
        }

        let report = RandomToursReport {
            started_at,
            finished_at: Utc::now(),
            tours_per_type: self.config.tours_per_type,
            total_tours,
            successful_types,
            empty_types,
            strategies_used,
            hotel_types,
        };
        self.cache.set(&CacheKey::JobReport(REPORT_KEY), &report);
        report
    }

    pub fn cached(&self, hotel_type: &str) -> Option<Vec<TourResult>> {
        self.cache.get(&CacheKey::RandomTours {
            hotel_type: hotel_type.to_string(),
        })
    }
}
