//! Integration tests for the async batch scanner.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::result::Result;

use chrono::NaiveDate;
use sapta::prelude::*;
use sapta::scanner::DEFAULT_CONCURRENCY;

fn trending(n: usize, drift: f64) -> PriceWindow {
    (0..n)
        .map(|i| {
            let base = 50.0 + i as f64 * drift + (i as f64 * 0.4).sin();
            Bar::new(base - 0.2, base + 0.8, base - 0.9, base + 0.3, 2_000_000.0 + (i % 5) as f64 * 1e5)
        })
        .collect::<Vec<_>>()
        .into()
}

fn engine() -> Engine {
    EngineBuilder::new()
        .with_default_modules()
        .model_slot(Arc::new(ModelSlot::new()))
        .build()
        .unwrap()
}

fn fixed_range() -> FetchRange {
    FetchRange::new(
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
    )
}

/// In-memory provider; tickers missing from the map return `Ok(None)`.
#[derive(Default)]
struct MapProvider {
    windows: HashMap<String, PriceWindow>,
    failing: Vec<String>,
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl DataProvider for MapProvider {
    async fn fetch_window(
        &self,
        ticker: &str,
        _start: NaiveDate,
        _end: NaiveDate,
    ) -> Result<Option<PriceWindow>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.iter().any(|t| t == ticker) {
            return Err(ProviderError::Unavailable(format!("no route to {ticker}")));
        }
        Ok(self.windows.get(ticker).cloned())
    }
}

/// Provider that records how many fetches overlap.
#[derive(Default)]
struct SlowProvider {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait::async_trait]
impl DataProvider for SlowProvider {
    async fn fetch_window(
        &self,
        _ticker: &str,
        _start: NaiveDate,
        _end: NaiveDate,
    ) -> Result<Option<PriceWindow>, ProviderError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(Some(trending(150, 0.05)))
    }
}

/// Releases its in-flight slot when the fetch future is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Provider whose fetches outlast any reasonable deadline.
#[derive(Default)]
struct HangingProvider {
    in_flight: AtomicUsize,
    started: AtomicUsize,
}

#[async_trait::async_trait]
impl DataProvider for HangingProvider {
    async fn fetch_window(
        &self,
        _ticker: &str,
        _start: NaiveDate,
        _end: NaiveDate,
    ) -> Result<Option<PriceWindow>, ProviderError> {
        let _guard = InFlight::enter(&self.in_flight);
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Some(trending(150, 0.05)))
    }
}

#[tokio::test]
async fn test_empty_ticker_list() {
    let provider = MapProvider::default();
    let tickers: Vec<String> = Vec::new();
    let results = engine().scan(&provider, &tickers, &ScanOptions::default()).await;
    assert!(results.is_empty());
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_mixed_outcomes_are_reported() {
    let mut provider = MapProvider::default();
    provider.windows.insert("AAAA".into(), trending(200, 0.1));
    provider.windows.insert("BBBB".into(), trending(160, -0.05));
    provider.windows.insert("SHRT".into(), trending(40, 0.1));
    provider.failing.push("DOWN".into());

    let tickers = ["AAAA", "NONE", "BBBB", "DOWN", "SHRT"];
    let opts = ScanOptions::default().with_min_status(Status::Abaikan).with_range(fixed_range());
    let report = engine().scan_detailed(&provider, &tickers, &opts).await;

    assert_eq!(provider.calls.load(Ordering::SeqCst), 5);
    assert_eq!(report.outcomes.len(), 5);
    let order: Vec<&str> = report.outcomes.iter().map(|(t, _)| t.as_str()).collect();
    assert_eq!(order, tickers.to_vec());

    assert_eq!(report.scored(), 2);
    assert_eq!(report.insufficient(), 2);
    assert_eq!(report.failed(), 1);
    assert!(matches!(
        report.outcomes[3].1,
        TickerOutcome::Failed(ProviderError::Unavailable(_))
    ));
    assert_eq!(report.outcomes[4].1, TickerOutcome::InsufficientData);

    assert_eq!(report.results.len(), 2);
    assert!(report.results[0].final_score >= report.results[1].final_score);
}

#[tokio::test]
async fn test_min_status_filters_results() {
    let mut provider = MapProvider::default();
    for (i, t) in ["A", "B", "C", "D"].iter().enumerate() {
        provider.windows.insert(t.to_string(), trending(150 + i * 10, 0.02 * i as f64));
    }
    let tickers = ["A", "B", "C", "D"];
    let all = engine()
        .scan(&provider, &tickers, &ScanOptions::default().with_min_status(Status::Abaikan))
        .await;
    let siap = engine()
        .scan(&provider, &tickers, &ScanOptions::default().with_min_status(Status::Siap))
        .await;

    assert_eq!(all.len(), 4);
    assert!(siap.iter().all(|r| r.status >= Status::Siap));
    let expected = all.iter().filter(|r| r.status >= Status::Siap).count();
    assert_eq!(siap.len(), expected);
}

#[tokio::test]
async fn test_results_sorted_with_ticker_tiebreak() {
    let mut provider = MapProvider::default();
    let same = trending(150, 0.03);
    for t in ["ZETA", "ALFA", "MIKE"] {
        provider.windows.insert(t.into(), same.clone());
    }
    let opts = ScanOptions::default().with_min_status(Status::Abaikan);
    let results = engine().scan(&provider, &["ZETA", "ALFA", "MIKE"], &opts).await;
    let order: Vec<&str> = results.iter().map(|r| r.ticker.as_str()).collect();
    assert_eq!(order, vec!["ALFA", "MIKE", "ZETA"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_is_bounded() {
    let provider = SlowProvider::default();
    let tickers: Vec<String> = (0..50).map(|i| format!("T{i:02}")).collect();
    let opts = ScanOptions::default().with_min_status(Status::Abaikan);
    let report = engine().scan_detailed(&provider, &tickers, &opts).await;

    assert_eq!(report.scored(), 50);
    let peak = provider.peak.load(Ordering::SeqCst);
    assert!(peak <= DEFAULT_CONCURRENCY, "peak {peak}");
    assert!(peak > 1);
}

#[tokio::test]
async fn test_custom_concurrency_limit() {
    let provider = SlowProvider::default();
    let tickers: Vec<String> = (0..12).map(|i| format!("T{i}")).collect();
    let opts = ScanOptions::default().with_concurrency(3).with_min_status(Status::Abaikan);
    engine().scan(&provider, &tickers, &opts).await;
    assert!(provider.peak.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn test_analyze_ticker_propagates_errors() {
    let provider = MapProvider {
        failing: vec!["ERR".into()],
        ..Default::default()
    };
    let e = engine();
    let err = e.analyze_ticker(&provider, "ERR", fixed_range()).await;
    assert!(err.is_err());
    let missing = e.analyze_ticker(&provider, "NOPE", fixed_range()).await;
    assert_eq!(missing, Ok(None));
}

#[tokio::test]
async fn test_dropped_scan_cancels_pending_fetches() {
    let provider = HangingProvider::default();
    let tickers: Vec<String> = (0..20).map(|i| format!("T{i}")).collect();
    let opts = ScanOptions::default().with_concurrency(4).with_min_status(Status::Abaikan);
    let e = engine();

    let outcome =
        tokio::time::timeout(Duration::from_millis(50), e.scan(&provider, &tickers, &opts)).await;

    assert!(outcome.is_err());
    assert_eq!(provider.started.load(Ordering::SeqCst), 4);
    assert_eq!(provider.in_flight.load(Ordering::SeqCst), 0);
}
