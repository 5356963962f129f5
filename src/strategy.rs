// Tour sourcing strategies used by the background jobs.
// Each strategy turns a sampling request into candidate tours tagged with their source.

use crate::provider::{HotToursQuery, ProviderError, TourProvider};
use crate::tour::{retain_valid, SearchParams, TourResult, TourSource, PROVIDER_DATE_FORMAT};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

// Hotel types the provider understands; "any" means no filter
pub const HOTEL_TYPES: [&str; 8] = [
    "any", "active", "relax", "family", "health", "city", "beach", "deluxe",
];

pub fn hotel_type_filter(hotel_type: &str) -> Option<&str> {
    match hotel_type {
        "" | "any" => None,
        other => Some(other),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleRequest {
    pub city: u32,
    // None during backfill
    pub country: Option<u32>,
    pub hotel_type: String,
    pub batch: u32,
}

#[derive(Debug, Clone)]
pub struct SearchOnceConfig {
    pub poll_interval: Duration,
    pub timeout: Duration,
    // Stop waiting once this many hotels showed up past the progress threshold
    pub early_hotels: usize,
    pub early_progress: u8,
}

impl Default for SearchOnceConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(120),
            early_hotels: 3,
            early_progress: 30,
        }
    }
}

/// Runs one bounded provider search and returns its valid tours.
///
/// Unlike a client session nothing is cached or published here; the caller
/// decides where the tours go. Exceeding `timeout` is reported as `Unavailable`.
pub async fn search_once(
    provider: &dyn TourProvider,
    params: &SearchParams,
    config: &SearchOnceConfig,
) -> Result<Vec<TourResult>, ProviderError> {
    let search = async {
        let request_id = provider.start_search(params).await?;
        loop {
            tokio::time::sleep(config.poll_interval).await;
            match provider.poll_status(&request_id).await {
                Ok(progress) => {
                    if progress.is_complete
                        || (progress.hotels_found >= config.early_hotels
                            && progress.progress_percent >= config.early_progress)
                    {
                        break;
                    }
                }
                Err(err) if err.is_retryable() => return Err(err),
                Err(err) => debug!(request_id = %request_id, error = %err, "skipping bad status"),
            }
        }
        let page = provider.fetch_results(&request_id, 0).await?;
        Ok(retain_valid(page.tours).0)
    };

    match tokio::time::timeout(config.timeout, search).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Unavailable(format!(
            "search for {}->{} timed out after {:?}",
            params.departure, params.country, config.timeout
        ))),
    }
}

#[async_trait]
pub trait TourStrategy: Send + Sync {
    fn source(&self) -> TourSource;

    async fn candidates(&self, request: &SampleRequest) -> Result<Vec<TourResult>, ProviderError>;
}

pub struct SearchStrategy {
    provider: Arc<dyn TourProvider>,
    config: SearchOnceConfig,
}

impl SearchStrategy {
    pub fn new(provider: Arc<dyn TourProvider>, config: SearchOnceConfig) -> Self {
        Self { provider, config }
    }
}

#[async_trait]
impl TourStrategy for SearchStrategy {
    fn source(&self) -> TourSource {
        TourSource::Search
    }

    async fn candidates(&self, request: &SampleRequest) -> Result<Vec<TourResult>, ProviderError> {
        // A full search needs a destination
        let Some(country) = request.country else {
            return Ok(Vec::new());
        };

        let mut params = SearchParams::new(request.city, country)
            .resolved(Utc::now().date_naive())
            .with_filter("onpage", request.batch.to_string());
        if let Some(filter) = hotel_type_filter(&request.hotel_type) {
            params = params.with_filter("hoteltypes", filter);
        }

        let tours = search_once(self.provider.as_ref(), &params, &self.config).await?;
        Ok(tag(tours, TourSource::Search))
    }
}

pub struct HotToursStrategy {
    provider: Arc<dyn TourProvider>,
}

impl HotToursStrategy {
    pub fn new(provider: Arc<dyn TourProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl TourStrategy for HotToursStrategy {
    fn source(&self) -> TourSource {
        TourSource::HotTours
    }

    async fn candidates(&self, request: &SampleRequest) -> Result<Vec<TourResult>, ProviderError> {
        let mut query = HotToursQuery::new(request.city, request.batch);
        if let Some(country) = request.country {
            query = query.with_country(country);
        }
        if let Some(filter) = hotel_type_filter(&request.hotel_type) {
            query = query.with_hotel_types(filter);
        }

        let tours = self.provider.hot_tours(&query).await?;
        Ok(tag(tours, TourSource::HotTours))
    }
}

struct MockProfile {
    hotels: [&'static str; 4],
    regions: [&'static str; 4],
    price_range: (u32, u32),
}

fn mock_profile(hotel_type: &str) -> MockProfile {
    match hotel_type {
        "active" => MockProfile {
            hotels: ["Adventure Resort", "Active Sports Hotel", "Mountain View Resort", "Extreme Hotel"],
            regions: ["Antalya", "Krasnaya Polyana", "Bukovel", "Alps"],
            price_range: (30_000, 90_000),
        },
        "relax" => MockProfile {
            hotels: ["Spa Resort", "Wellness Hotel", "Zen Garden Resort", "Tranquil Waters"],
            regions: ["Karlovy Vary", "Baden-Baden", "Marienbad", "Thermal Springs"],
            price_range: (40_000, 120_000),
        },
        "family" => MockProfile {
            hotels: ["Family Resort", "Kids Club Hotel", "Happy Family Resort", "Children Paradise"],
            regions: ["Antalya", "Crete", "Cyprus", "Bulgaria"],
            price_range: (35_000, 95_000),
        },
        "health" => MockProfile {
            hotels: ["Health Resort", "Medical Spa", "Healing Waters Resort", "Wellness Center"],
            regions: ["Karlovy Vary", "Zheleznovodsk", "Essentuki", "Kislovodsk"],
            price_range: (50_000, 150_000),
        },
        "city" => MockProfile {
            hotels: ["City Hotel", "Metropolitan Resort", "Urban Oasis", "Downtown Hotel"],
            regions: ["Istanbul", "Dubai", "Bangkok", "Singapore"],
            price_range: (20_000, 70_000),
        },
        "beach" => MockProfile {
            hotels: ["Beach Resort", "Seaside Hotel", "Ocean Paradise", "Tropical Beach"],
            regions: ["Hurghada", "Phuket", "Maldives", "Bali"],
            price_range: (30_000, 100_000),
        },
        "deluxe" => MockProfile {
            hotels: ["Luxury Resort", "Premium Hotel", "Elite Resort", "VIP Paradise"],
            regions: ["Maldives", "Seychelles", "St Barts", "Monaco"],
            price_range: (80_000, 250_000),
        },
        _ => MockProfile {
            hotels: ["Sunset Resort", "Ocean View Hotel", "Paradise Beach", "Golden Sands"],
            regions: ["Hurghada", "Antalya", "Phuket", "Dubai"],
            price_range: (25_000, 80_000),
        },
    }
}

const MOCK_OPERATORS: [&str; 4] = ["Sunmar", "Coral Travel", "Pegas", "TUI"];
const MOCK_MEALS: [&str; 4] = ["BB", "HB", "FB", "AI"];

// Synthesizes plausible offers without touching the provider
pub struct MockStrategy;

impl MockStrategy {
    pub fn synthesize(request: &SampleRequest) -> Vec<TourResult> {
        let profile = mock_profile(&request.hotel_type);
        let mut rng = rand::thread_rng();
        let country = request.country.unwrap_or(0);
        let today = Utc::now().date_naive();

        (0..request.batch)
            .map(|_| {
                let serial: u32 = rng.gen_range(100_000..1_000_000);
                let hotel = profile.hotels.choose(&mut rng).copied().unwrap_or("Resort");
                let region = profile.regions.choose(&mut rng).copied().unwrap_or("Coast");
                let fly_date = today + ChronoDuration::days(rng.gen_range(7..=30));

                TourResult {
                    hotel_code: format!("mock-{}-{}", request.hotel_type, serial),
                    hotel_name: hotel.to_string(),
                    hotel_stars: rng.gen_range(3..=5),
                    country_code: country.to_string(),
                    country_name: format!("Country {}", country),
                    region_code: String::new(),
                    region_name: region.to_string(),
                    departure_code: request.city.to_string(),
                    departure_name: String::new(),
                    operator_code: String::new(),
                    operator_name: MOCK_OPERATORS
                        .choose(&mut rng)
                        .copied()
                        .unwrap_or("TUI")
                        .to_string(),
                    meal: MOCK_MEALS.choose(&mut rng).copied().unwrap_or("BB").to_string(),
                    price: rng.gen_range(profile.price_range.0..=profile.price_range.1) as f64,
                    currency: Some("RUB".to_string()),
                    fly_date: fly_date.format(PROVIDER_DATE_FORMAT).to_string(),
                    nights: *[7u32, 10, 14].choose(&mut rng).unwrap_or(&7),
                    source: Some(TourSource::Mock),
                }
            })
            .collect()
    }
}

#[async_trait]
impl TourStrategy for MockStrategy {
    fn source(&self) -> TourSource {
        TourSource::Mock
    }

    async fn candidates(&self, request: &SampleRequest) -> Result<Vec<TourResult>, ProviderError> {
        Ok(Self::synthesize(request))
    }
}

/// Builds the configured strategies in order, skipping duplicates.
pub fn build_strategies(
    order: &[TourSource],
    provider: Arc<dyn TourProvider>,
    search: SearchOnceConfig,
) -> Vec<Box<dyn TourStrategy>> {
    let mut strategies: Vec<Box<dyn TourStrategy>> = Vec::new();
    for source in order {
        if strategies.iter().any(|s| s.source() == *source) {
            warn!(strategy = source.as_str(), "duplicate strategy ignored");
            continue;
        }
        let strategy: Box<dyn TourStrategy> = match source {
            TourSource::Search => Box::new(SearchStrategy::new(Arc::clone(&provider), search.clone())),
            TourSource::HotTours => Box::new(HotToursStrategy::new(Arc::clone(&provider))),
            TourSource::Mock => Box::new(MockStrategy),
        };
        strategies.push(strategy);
    }
    strategies
}

fn tag(tours: Vec<TourResult>, source: TourSource) -> Vec<TourResult> {
    tours.into_iter().map(|tour| tour.with_source(source)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock_provider::{MockProvider, SearchScript};
    use crate::tour::sample_tour;

    fn request(country: Option<u32>, hotel_type: &str) -> SampleRequest {
        SampleRequest {
            city: 1,
            country,
            hotel_type: hotel_type.to_string(),
            batch: 3,
        }
    }

    #[test]
    fn mock_tours_are_valid_and_in_range() {
        for hotel_type in HOTEL_TYPES {
            let tours = MockStrategy::synthesize(&request(Some(4), hotel_type));
            let profile = mock_profile(hotel_type);
            assert_eq!(tours.len(), 3);
            for tour in tours {
                assert!(tour.is_valid(), "{:?}", tour);
                assert!(tour.price >= profile.price_range.0 as f64);
                assert!(tour.price <= profile.price_range.1 as f64);
                assert!([7, 10, 14].contains(&tour.nights));
                assert_eq!(tour.source, Some(TourSource::Mock));
            }
        }
    }

    #[tokio::test]
    async fn hot_tours_are_tagged() {
        let provider = Arc::new(MockProvider::new());
        provider.set_hot_tours(Some(4), vec![sample_tour("a", 4, 100.0)]);
        let strategy = HotToursStrategy::new(provider);

        let tours = strategy.candidates(&request(Some(4), "beach")).await.unwrap();
        assert_eq!(tours.len(), 1);
        assert_eq!(tours[0].source, Some(TourSource::HotTours));
    }

    #[tokio::test(start_paused = true)]
    async fn search_once_filters_invalid() {
        let provider = MockProvider::new();
        let mut offers = vec![sample_tour("a", 4, 100.0), sample_tour("b", 4, -1.0)];
        offers.push(sample_tour("c", 4, 200.0));
        provider.set_script(SearchScript::new(vec![(40, 1), (100, 3)], offers));

        let tours = search_once(&provider, &SearchParams::new(1, 4), &SearchOnceConfig::default())
            .await
            .unwrap();
        assert_eq!(tours.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn search_once_times_out() {
        let provider = MockProvider::new();
        provider.set_script(SearchScript::new(vec![(5, 0)], Vec::new()));
        let config = SearchOnceConfig {
            timeout: Duration::from_secs(20),
            ..SearchOnceConfig::default()
        };

        let result = search_once(&provider, &SearchParams::new(1, 4), &config).await;
        assert!(matches!(result, Err(ProviderError::Unavailable(_))));
    }

    #[tokio::test]
    async fn search_strategy_skips_without_country() {
        let provider = Arc::new(MockProvider::new());
        let strategy = SearchStrategy::new(provider.clone(), SearchOnceConfig::default());
        let tours = strategy.candidates(&request(None, "any")).await.unwrap();
        assert!(tours.is_empty());
        assert_eq!(MockProvider::calls(&provider.start_calls), 0);
    }

    #[test]
    fn strategies_keep_configured_order() {
        let provider: Arc<dyn TourProvider> = Arc::new(MockProvider::new());
        let strategies = build_strategies(
            &[TourSource::Mock, TourSource::HotTours, TourSource::Mock],
            provider,
            SearchOnceConfig::default(),
        );
        let order: Vec<_> = strategies.iter().map(|s| s.source()).collect();
        assert_eq!(order, vec![TourSource::Mock, TourSource::HotTours]);
    }
}
