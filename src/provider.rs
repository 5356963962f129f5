// Provider client: typed async access to the external tour search API.
// The client never retries beyond one reconnect attempt; callers own retry policy.

use crate::tour::{SearchParams, TourResult};
use crate::wire::{
    parse_reference_list, HotToursResponse, ReferenceItem, XmlHotel, XmlResultEnvelope,
    XmlSearchStart,
};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Provider rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Malformed provider response: {0}")]
    MalformedResponse(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Unavailable(_) | ProviderError::RateLimited(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub auth_login: String,
    pub auth_pass: String,
    pub timeout: Duration,
    // Hotels per result page on the wire
    pub page_size: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://tourvisor.ru/xml".to_string(),
            auth_login: String::new(),
            auth_pass: String::new(),
            timeout: Duration::from_secs(30),
            page_size: 25,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
    // Extra factor applied when the provider throttles us
    pub rate_limit_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            rate_limit_multiplier: 4.0,
        }
    }
}

pub fn calculate_backoff(retry_attempt: u32, config: &RetryConfig) -> Duration {
    let base_backoff_ms = (config.initial_backoff_ms as f64
        * config.backoff_multiplier.powf(retry_attempt as f64))
    .min(config.max_backoff_ms as f64);

    // Apply jitter to prevent thundering herd
    let jitter = rand::random::<f64>() * config.jitter_factor * base_backoff_ms;
    let backoff_ms = base_backoff_ms * (1.0 - config.jitter_factor / 2.0) + jitter;

    Duration::from_millis(backoff_ms as u64)
}

/// Backoff before retrying after `error`. Throttling waits longer than outages.
pub fn backoff_for(error: &ProviderError, retry_attempt: u32, config: &RetryConfig) -> Duration {
    let base = calculate_backoff(retry_attempt, config);
    match error {
        ProviderError::RateLimited(_) => base.mul_f64(config.rate_limit_multiplier.max(1.0)),
        _ => base,
    }
}

/// Runs `operation`, retrying retryable provider errors with backoff.
/// Malformed responses are returned immediately.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: F) -> Result<T, ProviderError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < config.max_retries => {
                let delay = backoff_for(&err, attempt, config);
                warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying provider call after delay"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchProgress {
    pub progress_percent: u8,
    pub is_complete: bool,
    pub hotels_found: usize,
    pub tours_found: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultPage {
    pub tours: Vec<TourResult>,
    // Offset into the provider's arrival-ordered hotel list
    pub next_cursor: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HotToursQuery {
    pub city: u32,
    pub items: u32,
    pub country: Option<u32>,
    pub hotel_types: Option<String>,
}

impl HotToursQuery {
    pub fn new(city: u32, items: u32) -> Self {
        Self {
            city,
            items,
            country: None,
            hotel_types: None,
        }
    }

    pub fn with_country(mut self, country: u32) -> Self {
        self.country = Some(country);
        self
    }

    pub fn with_hotel_types(mut self, hotel_types: impl Into<String>) -> Self {
        self.hotel_types = Some(hotel_types.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    Departure,
    Country,
    Region { country: u32 },
    Meal,
    Stars,
    Operator,
    Services,
}

impl ReferenceKind {
    pub fn wire_type(&self) -> &'static str {
        match self {
            ReferenceKind::Departure => "departure",
            ReferenceKind::Country => "country",
            ReferenceKind::Region { .. } => "region",
            ReferenceKind::Meal => "meal",
            ReferenceKind::Stars => "stars",
            ReferenceKind::Operator => "operator",
            ReferenceKind::Services => "services",
        }
    }

    // Name used as the reference cache key suffix
    pub fn cache_name(&self) -> String {
        match self {
            ReferenceKind::Region { country } => format!("regions_country_{}", country),
            other => other.wire_type().to_string(),
        }
    }

    fn list_names(&self) -> (&'static str, &'static str) {
        match self {
            ReferenceKind::Departure => ("departures", "departure"),
            ReferenceKind::Country => ("countries", "country"),
            ReferenceKind::Region { .. } => ("regions", "region"),
            ReferenceKind::Meal => ("meals", "meal"),
            ReferenceKind::Stars => ("stars", "star"),
            ReferenceKind::Operator => ("operators", "operator"),
            ReferenceKind::Services => ("services", "service"),
        }
    }
}

#[async_trait]
pub trait TourProvider: Send + Sync + 'static {
    async fn start_search(&self, params: &SearchParams) -> Result<String, ProviderError>;

    async fn poll_status(&self, request_id: &str) -> Result<SearchProgress, ProviderError>;

    async fn fetch_results(
        &self,
        request_id: &str,
        cursor: usize,
    ) -> Result<ResultPage, ProviderError>;

    async fn continue_search(&self, request_id: &str) -> Result<(), ProviderError>;

    async fn hot_tours(&self, query: &HotToursQuery) -> Result<Vec<TourResult>, ProviderError>;

    async fn references(&self, kind: ReferenceKind) -> Result<Vec<ReferenceItem>, ProviderError>;
}

pub struct HttpProvider {
    client: reqwest::Client,
    config: ProviderConfig,
}

impl HttpProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Unavailable(format!("HTTP client init failed: {}", e)))?;

        Ok(Self { client, config })
    }

    async fn get(&self, endpoint: &str, params: &[(String, String)]) -> Result<String, ProviderError> {
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), endpoint);
        let mut query: Vec<(String, String)> = vec![
            ("authlogin".to_string(), self.config.auth_login.clone()),
            ("authpass".to_string(), self.config.auth_pass.clone()),
        ];
        query.extend_from_slice(params);

        debug!(endpoint = endpoint, "Calling provider");

        let response = match self.client.get(&url).query(&query).send().await {
            Ok(response) => response,
            Err(err) if err.is_connect() => {
                warn!(endpoint = endpoint, error = %err, "Provider connect failed, reconnecting once");
                self.client
                    .get(&url)
                    .query(&query)
                    .send()
                    .await
                    .map_err(map_transport_error)?
            }
            Err(err) => return Err(map_transport_error(err)),
        };

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimited(format!("{} returned 429", endpoint)));
        }
        if status.is_server_error() {
            return Err(ProviderError::Unavailable(format!(
                "{} returned {}",
                endpoint, status
            )));
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            error!(endpoint = endpoint, "Provider rejected credentials");
        }
        if !status.is_success() {
            return Err(ProviderError::MalformedResponse(format!(
                "{} returned {}",
                endpoint, status
            )));
        }

        response.text().await.map_err(map_transport_error)
    }

    async fn get_result_data(
        &self,
        request_id: &str,
        extra: &[(String, String)],
    ) -> Result<crate::wire::XmlResultData, ProviderError> {
        let mut params = vec![
            ("requestid".to_string(), request_id.to_string()),
            ("format".to_string(), "xml".to_string()),
        ];
        params.extend_from_slice(extra);

        let body = self.get("result.php", &params).await?;
        let envelope: XmlResultEnvelope = quick_xml::de::from_str(&body)
            .map_err(|e| ProviderError::MalformedResponse(format!("result.php: {}", e)))?;
        Ok(envelope.into_data())
    }
}

fn map_transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Unavailable(format!("timeout: {}", err))
    } else if err.is_decode() || err.is_body() {
        ProviderError::MalformedResponse(err.to_string())
    } else {
        ProviderError::Unavailable(err.to_string())
    }
}

/// Reads the request id from a search start body: a bare number or XML.
pub fn parse_request_id(body: &str) -> Result<String, ProviderError> {
    let trimmed = body.trim();
    if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
        return Ok(trimmed.to_string());
    }

    let parsed: XmlSearchStart = quick_xml::de::from_str(trimmed)
        .map_err(|e| ProviderError::MalformedResponse(format!("search.php: {}", e)))?;
    parsed
        .request_id()
        .map(str::to_string)
        .ok_or_else(|| ProviderError::MalformedResponse("search.php: no request id".to_string()))
}

#[async_trait]
impl TourProvider for HttpProvider {
    async fn start_search(&self, params: &SearchParams) -> Result<String, ProviderError> {
        let mut query = params.to_query();
        query.push(("format".to_string(), "xml".to_string()));

        let body = self.get("search.php", &query).await?;
        let request_id = parse_request_id(&body)?;
        debug!(request_id = %request_id, "Provider search started");
        Ok(request_id)
    }

    async fn poll_status(&self, request_id: &str) -> Result<SearchProgress, ProviderError> {
        let data = self
            .get_result_data(request_id, &[("type".to_string(), "status".to_string())])
            .await?;
        let status = data
            .status
            .ok_or_else(|| ProviderError::MalformedResponse("status block missing".to_string()))?;
        let progress_percent = status
            .progress_percent()
            .ok_or_else(|| ProviderError::MalformedResponse("progress missing".to_string()))?;
        let is_complete = status.is_finished();

        Ok(SearchProgress {
            progress_percent: if is_complete { 100 } else { progress_percent },
            is_complete,
            hotels_found: status.hotels_found(),
            tours_found: status.tours_found(),
        })
    }

    async fn fetch_results(
        &self,
        request_id: &str,
        cursor: usize,
    ) -> Result<ResultPage, ProviderError> {
        let page_size = self.config.page_size.max(1);
        let page = cursor / page_size + 1;
        let skip = cursor % page_size;

        let data = self
            .get_result_data(
                request_id,
                &[
                    ("type".to_string(), "result".to_string()),
                    ("page".to_string(), page.to_string()),
                    ("onpage".to_string(), page_size.to_string()),
                ],
            )
            .await?;

        let hotels_found = data.status.as_ref().map(|s| s.hotels_found()).unwrap_or(0);
        let hotels = data.result.map(|r| r.hotels).unwrap_or_default();

        let returned: Vec<_> = hotels.into_iter().skip(skip).collect();
        let next_cursor = cursor + returned.len();
        let tours = returned
            .into_iter()
            .flat_map(XmlHotel::into_tours)
            .collect();

        Ok(ResultPage {
            tours,
            next_cursor,
            has_more: next_cursor < hotels_found,
        })
    }

    async fn continue_search(&self, request_id: &str) -> Result<(), ProviderError> {
        self.get(
            "search.php",
            &[
                ("continue".to_string(), request_id.to_string()),
                ("format".to_string(), "xml".to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn hot_tours(&self, query: &HotToursQuery) -> Result<Vec<TourResult>, ProviderError> {
        let mut params = vec![
            ("city".to_string(), query.city.to_string()),
            ("items".to_string(), query.items.to_string()),
            ("format".to_string(), "json".to_string()),
        ];
        if let Some(country) = query.country {
            params.push(("countries".to_string(), country.to_string()));
        }
        if let Some(hotel_types) = &query.hotel_types {
            params.push(("hoteltypes".to_string(), hotel_types.clone()));
        }

        let body = self.get("hottours.php", &params).await?;
        let parsed: HotToursResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::MalformedResponse(format!("hottours.php: {}", e)))?;
        Ok(parsed.into_tours())
    }

    async fn references(&self, kind: ReferenceKind) -> Result<Vec<ReferenceItem>, ProviderError> {
        let mut params = vec![
            ("type".to_string(), kind.wire_type().to_string()),
            ("format".to_string(), "json".to_string()),
        ];
        if let ReferenceKind::Region { country } = kind {
            params.push(("regcountry".to_string(), country.to_string()));
        }

        let body = self.get("list.php", &params).await?;
        let value: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| ProviderError::MalformedResponse(format!("list.php: {}", e)))?;
        let (plural, singular) = kind.list_names();
        parse_reference_list(&value, plural, singular).ok_or_else(|| {
            ProviderError::MalformedResponse(format!("list.php: no {} list", plural))
        })
    }
}


#[cfg(test)]
mod tests {
    use super::mock_provider::*;
    use super::*;
    use crate::tour::sample_tour;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn backoff_grows_and_caps() {
        let config = RetryConfig {
            jitter_factor: 0.0,
            ..RetryConfig::default()
        };
        assert_eq!(calculate_backoff(0, &config), Duration::from_millis(500));
        assert_eq!(calculate_backoff(1, &config), Duration::from_millis(1000));
        assert_eq!(calculate_backoff(10, &config), Duration::from_millis(10_000));
    }

    #[test]
    fn rate_limited_backs_off_longer() {
        let config = RetryConfig {
            jitter_factor: 0.0,
            ..RetryConfig::default()
        };
        let outage = backoff_for(&ProviderError::Unavailable("x".into()), 1, &config);
        let throttled = backoff_for(&ProviderError::RateLimited("x".into()), 1, &config);
        assert_eq!(throttled, outage * 4);
    }

    #[test]
    fn request_id_from_number_or_xml() {
        assert_eq!(parse_request_id(" 987654\n").unwrap(), "987654");
        assert_eq!(
            parse_request_id("<result><requestid>42</requestid></result>").unwrap(),
            "42"
        );
        assert!(matches!(
            parse_request_id("<result><error>auth</error></result>"),
            Err(ProviderError::MalformedResponse(_))
        ));
    }

    #[test]
    fn reference_names() {
        assert_eq!(ReferenceKind::Meal.cache_name(), "meal");
        assert_eq!(
            ReferenceKind::Region { country: 4 }.cache_name(),
            "regions_country_4"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn with_retry_recovers_from_outage() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&RetryConfig::default(), || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(ProviderError::Unavailable("down".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn with_retry_does_not_retry_malformed() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&RetryConfig::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::MalformedResponse("junk".into())) }
        })
        .await;
        assert_err!(result);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // Answers one request per entry, in order, and hands back the request lines
    async fn stub_server(
        responses: Vec<(u16, String)>,
    ) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let mut request_lines = Vec::new();
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut head = Vec::new();
                let mut chunk = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    let read = socket.read(&mut chunk).await.unwrap();
                    if read == 0 {
                        break;
                    }
                    head.extend_from_slice(&chunk[..read]);
                }
                let head = String::from_utf8_lossy(&head).to_string();
                request_lines.push(head.lines().next().unwrap_or_default().to_string());

                let response = format!(
                    "HTTP/1.1 {} Stub\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
            request_lines
        });
        (base_url, handle)
    }

    fn http_provider(base_url: String, page_size: usize) -> HttpProvider {
        HttpProvider::new(ProviderConfig {
            base_url,
            timeout: Duration::from_secs(5),
            page_size,
            ..ProviderConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn http_status_classes_map_to_errors() {
        let (base_url, server) = stub_server(vec![
            (429, String::new()),
            (503, String::new()),
            (404, String::new()),
        ])
        .await;
        let provider = http_provider(base_url, 25);
        let query = HotToursQuery::new(1, 5);

        let throttled = provider.hot_tours(&query).await;
        assert!(matches!(throttled, Err(ProviderError::RateLimited(_))));
        let outage = provider.hot_tours(&query).await;
        assert!(matches!(outage, Err(ProviderError::Unavailable(_))));
        let missing = provider.hot_tours(&query).await;
        assert!(matches!(missing, Err(ProviderError::MalformedResponse(_))));

        let lines = server.await.unwrap();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("GET /hottours.php?"));
    }

    #[tokio::test]
    async fn refused_connection_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let provider = http_provider(base_url, 25);
        let result = provider.continue_search("42").await;
        assert!(matches!(result, Err(ProviderError::Unavailable(_))));
        assert!(result.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn cursor_inside_a_page_skips_hotels_already_seen() {
        let hotel = |code: &str| {
            format!(
                "<hotel><hotelcode>{code}</hotelcode><hotelname>Hotel {code}</hotelname>\
                 <countryname>Turkey</countryname><tours><tour><flydate>01.07.2025</flydate>\
                 <nights>7</nights><price>41000</price></tour></tours></hotel>"
            )
        };
        let body = format!(
            "<data><status><state>searching</state><hotelsfound>5</hotelsfound>\
             <progress>60</progress></status><result>{}{}</result></data>",
            hotel("H3"),
            hotel("H4")
        );
        let (base_url, server) = stub_server(vec![(200, body)]).await;
        let provider = http_provider(base_url, 2);

        // Hotels 0..3 were already read; the fourth sits mid-way through page 2
        let page = assert_ok!(provider.fetch_results("77", 3).await);
        let codes: Vec<&str> = page.tours.iter().map(|t| t.hotel_code.as_str()).collect();
        assert_eq!(codes, vec!["H4"]);
        assert_eq!(page.next_cursor, 4);
        assert!(page.has_more);
        assert!(page.tours.iter().all(|t| t.departure_code.is_empty()));

        let lines = server.await.unwrap();
        let request = &lines[0];
        assert!(request.starts_with("GET /result.php?"));
        assert!(request.contains("requestid=77"));
        assert!(request.contains("&page=2&"));
        assert!(request.contains("&onpage=2"));
        assert!(request.contains("type=result"));
    }

    #[tokio::test]
    async fn mock_follows_script() {
        let provider = MockProvider::new();
        let tours: Vec<_> = (0..4).map(|i| sample_tour(&format!("h{}", i), 4, 100.0)).collect();
        provider.set_script(SearchScript::new(vec![(50, 2), (100, 4)], tours));

        let id = assert_ok!(provider.start_search(&SearchParams::new(1, 4)).await);
        let first = provider.poll_status(&id).await.unwrap();
        assert_eq!(first.progress_percent, 50);
        let page = provider.fetch_results(&id, 0).await.unwrap();
        assert_eq!(page.tours.len(), 2);
        assert_eq!(page.next_cursor, 2);

        let done = provider.poll_status(&id).await.unwrap();
        assert!(done.is_complete);
        let rest = provider.fetch_results(&id, page.next_cursor).await.unwrap();
        assert_eq!(rest.tours.len(), 2);
        assert!(!rest.has_more);
    }
}
