// Tour inventory model shared by search sessions, the cache and the background jobs

use chrono::{Duration as ChronoDuration, NaiveDate};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

// Anything above this is a provider glitch rather than a real offer
pub const MAX_PLAUSIBLE_PRICE: f64 = 10_000_000.0;

// Date format used on the provider wire
pub const PROVIDER_DATE_FORMAT: &str = "%d.%m.%Y";

// Where a tour came from when it was sourced by a background job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TourSource {
    Search,
    HotTours,
    Mock,
}

impl TourSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TourSource::Search => "search",
            TourSource::HotTours => "hot_tours",
            TourSource::Mock => "mock",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "search" => Some(TourSource::Search),
            "hot_tours" | "hottours" | "hot" => Some(TourSource::HotTours),
            "mock" => Some(TourSource::Mock),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TourResult {
    pub hotel_code: String,
    pub hotel_name: String,
    pub hotel_stars: u8,
    pub country_code: String,
    pub country_name: String,
    pub region_code: String,
    pub region_name: String,
    pub departure_code: String,
    pub departure_name: String,
    pub operator_code: String,
    pub operator_name: String,
    pub meal: String,
    pub price: f64,
    pub currency: Option<String>,
    pub fly_date: String,
    pub nights: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<TourSource>,
}

// Reason a tour fails the validity predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidity {
    NonPositivePrice,
    ImplausiblePrice,
    ZeroNights,
    MissingField(&'static str),
}

impl fmt::Display for Invalidity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invalidity::NonPositivePrice => write!(f, "price is not positive"),
            Invalidity::ImplausiblePrice => write!(f, "price above {}", MAX_PLAUSIBLE_PRICE),
            Invalidity::ZeroNights => write!(f, "night count is zero"),
            Invalidity::MissingField(name) => write!(f, "missing {}", name),
        }
    }
}

impl TourResult {
    /// Checks the predicate every cached tour must satisfy.
    pub fn validate(&self) -> Result<(), Invalidity> {
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(Invalidity::NonPositivePrice);
        }
        if self.price >= MAX_PLAUSIBLE_PRICE {
            return Err(Invalidity::ImplausiblePrice);
        }
        if self.nights == 0 {
            return Err(Invalidity::ZeroNights);
        }

        let required = [
            ("hotel_code", &self.hotel_code),
            ("hotel_name", &self.hotel_name),
            ("country_name", &self.country_name),
            ("fly_date", &self.fly_date),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(Invalidity::MissingField(name));
            }
        }

        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    // Two offers for the same hotel, date, length and operator are the same tour
    pub fn identity(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.hotel_code, self.fly_date, self.nights, self.operator_code
        )
    }

    pub fn with_source(mut self, source: TourSource) -> Self {
        self.source = Some(source);
        self
    }
}

/// Drops tours failing the validity predicate, returning the survivors and
/// the number of dropped entries.
pub fn retain_valid(tours: Vec<TourResult>) -> (Vec<TourResult>, usize) {
    let before = tours.len();
    let valid: Vec<TourResult> = tours.into_iter().filter(TourResult::is_valid).collect();
    let dropped = before - valid.len();
    if dropped > 0 {
        tracing::debug!(dropped, kept = valid.len(), "dropped invalid tours");
    }
    (valid, dropped)
}

/// Fills in the departure fields result pages leave blank. Fields the
/// provider already set are kept.
pub fn stamp_departure(tours: &mut [TourResult], city: u32, name: Option<&str>) {
    let code = city.to_string();
    for tour in tours.iter_mut() {
        if tour.departure_code.is_empty() {
            tour.departure_code = code.clone();
        }
        if tour.departure_name.is_empty() {
            if let Some(name) = name {
                tour.departure_name = name.to_string();
            }
        }
    }
}

/// Removes repeated offers, keeping first arrival order.
pub fn dedup_tours(tours: Vec<TourResult>) -> Vec<TourResult> {
    let mut seen = HashSet::new();
    tours
        .into_iter()
        .filter(|tour| seen.insert(tour.identity()))
        .collect()
}

// Stable hash of search parameters
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Immutable search criteria
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParams {
    pub departure: u32,
    pub country: u32,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub nights_from: u8,
    pub nights_to: u8,
    pub adults: u8,
    pub children: u8,
    pub child_ages: Vec<u8>,
    // Extra provider filters (stars, meal, hoteltypes, regions...). Ordered so the
    // fingerprint does not depend on insertion order.
    pub filters: BTreeMap<String, String>,
}

impl SearchParams {
    pub fn new(departure: u32, country: u32) -> Self {
        Self {
            departure,
            country,
            date_from: None,
            date_to: None,
            nights_from: 7,
            nights_to: 10,
            adults: 2,
            children: 0,
            child_ages: Vec::new(),
            filters: BTreeMap::new(),
        }
    }

    pub fn with_dates(mut self, from: NaiveDate, to: NaiveDate) -> Self {
        self.date_from = Some(from);
        self.date_to = Some(to);
        self
    }

    pub fn with_nights(mut self, from: u8, to: u8) -> Self {
        self.nights_from = from;
        self.nights_to = to;
        self
    }

    pub fn with_travelers(mut self, adults: u8, child_ages: Vec<u8>) -> Self {
        self.adults = adults;
        self.children = child_ages.len() as u8;
        self.child_ages = child_ages;
        self
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(key.into(), value.into());
        self
    }

    /// Fills a missing date range with tomorrow .. tomorrow + 7 days.
    pub fn resolved(&self, today: NaiveDate) -> SearchParams {
        let mut params = self.clone();
        if params.date_from.is_none() {
            params.date_from = Some(today + ChronoDuration::days(1));
        }
        if params.date_to.is_none() {
            params.date_to = Some(today + ChronoDuration::days(8));
        }
        params
    }

    pub fn fingerprint(&self) -> Fingerprint {
        // Struct fields serialize in declaration order and filters are a BTreeMap,
        // so the JSON form is canonical.
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        Fingerprint(format!("{:x}", hasher.finalize()))
    }

    /// Query parameters in the provider's wire vocabulary.
    pub fn to_query(&self) -> Vec<(String, String)> {
        let mut query = vec![
            ("departure".to_string(), self.departure.to_string()),
            ("country".to_string(), self.country.to_string()),
            ("nightsfrom".to_string(), self.nights_from.to_string()),
            ("nightsto".to_string(), self.nights_to.to_string()),
            ("adults".to_string(), self.adults.to_string()),
            ("child".to_string(), self.children.to_string()),
        ];
        if let Some(from) = self.date_from {
            query.push((
                "datefrom".to_string(),
                from.format(PROVIDER_DATE_FORMAT).to_string(),
            ));
        }
        if let Some(to) = self.date_to {
            query.push((
                "dateto".to_string(),
                to.format(PROVIDER_DATE_FORMAT).to_string(),
            ));
        }
        for (index, age) in self.child_ages.iter().enumerate().take(3) {
            query.push((format!("childage{}", index + 1), age.to_string()));
        }
        for (key, value) in &self.filters {
            query.push((key.clone(), value.clone()));
        }
        query
    }
}

#[cfg(test)]
pub(crate) fn sample_tour(hotel_code: &str, country: u32, price: f64) -> TourResult {
    TourResult {
        hotel_code: hotel_code.to_string(),
        hotel_name: format!("Hotel {}", hotel_code),
        hotel_stars: 4,
        country_code: country.to_string(),
        country_name: format!("Country {}", country),
        region_code: "10".to_string(),
        region_name: "Coast".to_string(),
        departure_code: "1".to_string(),
        departure_name: "Moscow".to_string(),
        operator_code: "7".to_string(),
        operator_name: "Operator".to_string(),
        meal: "AI".to_string(),
        price,
        currency: Some("RUB".to_string()),
        fly_date: "01.07.2025".to_string(),
        nights: 7,
        source: None,
    }
}

// Tours with any mix of broken prices, night counts and blank fields
#[cfg(test)]
pub(crate) fn arb_tour() -> impl proptest::strategy::Strategy<Value = TourResult> {
    use proptest::prelude::*;

    let text = || prop_oneof![Just(String::new()), Just("  ".to_string()), "[A-Za-z0-9 .]{1,8}"];
    let price = prop_oneof![
        Just(0.0),
        Just(f64::NAN),
        Just(f64::INFINITY),
        Just(MAX_PLAUSIBLE_PRICE),
        -1_000.0..20_000_000.0f64,
    ];
    (text(), text(), text(), text(), price, 0u32..30).prop_map(
        |(hotel_code, hotel_name, country_name, fly_date, price, nights)| {
            let mut tour = sample_tour("x", 4, price);
            tour.hotel_code = hotel_code;
            tour.hotel_name = hotel_name;
            tour.country_name = country_name;
            tour.fly_date = fly_date;
            tour.nights = nights;
            tour
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    proptest! {
        #[test]
        fn retained_tours_are_always_valid(tours in proptest::collection::vec(arb_tour(), 0..20)) {
            let total = tours.len();
            let (kept, dropped) = retain_valid(tours);
            prop_assert!(kept.iter().all(TourResult::is_valid));
            prop_assert_eq!(kept.len() + dropped, total);
        }
    }

    #[test]
    fn valid_tour_passes() {
        assert!(sample_tour("h1", 4, 55_000.0).is_valid());
    }

    #[test_case(0.0, Invalidity::NonPositivePrice ; "zero price")]
    #[test_case(-10.0, Invalidity::NonPositivePrice ; "negative price")]
    #[test_case(f64::NAN, Invalidity::NonPositivePrice ; "nan price")]
    #[test_case(MAX_PLAUSIBLE_PRICE, Invalidity::ImplausiblePrice ; "ceiling price")]
    #[test_case(f64::INFINITY, Invalidity::NonPositivePrice ; "infinite price")]
    fn price_bounds(price: f64, expected: Invalidity) {
        let tour = sample_tour("h1", 4, price);
        assert_eq!(tour.validate(), Err(expected));
    }

    #[test]
    fn zero_nights_is_invalid() {
        let mut tour = sample_tour("h1", 4, 40_000.0);
        tour.nights = 0;
        assert_eq!(tour.validate(), Err(Invalidity::ZeroNights));
    }

    #[test_case("hotel_code" ; "hotel code")]
    #[test_case("hotel_name" ; "hotel name")]
    #[test_case("country_name" ; "country name")]
    #[test_case("fly_date" ; "fly date")]
    fn blank_identifying_field_is_invalid(field: &'static str) {
        let mut tour = sample_tour("h1", 4, 40_000.0);
        match field {
            "hotel_code" => tour.hotel_code = " ".to_string(),
            "hotel_name" => tour.hotel_name.clear(),
            "country_name" => tour.country_name.clear(),
            _ => tour.fly_date.clear(),
        }
        assert_eq!(tour.validate(), Err(Invalidity::MissingField(field)));
    }

    #[test]
    fn retain_valid_counts_dropped() {
        let tours = vec![
            sample_tour("a", 1, 100.0),
            sample_tour("b", 1, 0.0),
            sample_tour("c", 1, 20_000_000.0),
            sample_tour("d", 1, 900.0),
        ];
        let (kept, dropped) = retain_valid(tours);
        assert_eq!(dropped, 2);
        let codes: Vec<_> = kept.iter().map(|t| t.hotel_code.as_str()).collect();
        assert_eq!(codes, vec!["a", "d"]);
    }

    #[test]
    fn fingerprint_ignores_filter_insertion_order() {
        let a = SearchParams::new(1, 4)
            .with_filter("stars", "4")
            .with_filter("meal", "7");
        let b = SearchParams::new(1, 4)
            .with_filter("meal", "7")
            .with_filter("stars", "4");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), SearchParams::new(2, 4).fingerprint());
    }

    #[test]
    fn resolved_fills_default_dates() {
        let today = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        let params = SearchParams::new(1, 4).resolved(today);
        assert_eq!(params.date_from, NaiveDate::from_ymd_opt(2025, 6, 2));
        assert_eq!(params.date_to, NaiveDate::from_ymd_opt(2025, 6, 9));

        let query = params.to_query();
        assert!(query.contains(&("datefrom".to_string(), "02.06.2025".to_string())));
        assert!(query.contains(&("dateto".to_string(), "09.06.2025".to_string())));
    }

    #[test]
    fn dedup_keeps_first_arrival() {
        let mut cheaper = sample_tour("a", 1, 100.0);
        cheaper.price = 90.0;
        let tours = vec![sample_tour("a", 1, 100.0), cheaper, sample_tour("b", 1, 5.0)];
        let deduped = dedup_tours(tours);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].price, 100.0);
    }
}
