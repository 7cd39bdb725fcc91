//! Async batch scanner
//!
//! Fetches one window per ticker through a [`DataProvider`], scores it and
//! returns the survivors ranked by final score. Fetches run concurrently up
//! to `ScanOptions::concurrency`; scoring itself is synchronous.

use std::cmp::Ordering;

use chrono::{Duration, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::{Engine, EngineResult, PriceWindow, Status};

pub const DEFAULT_CONCURRENCY: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("data source unavailable: {0}")]
    Unavailable(String),

    #[error("request timed out")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

/// Source of OHLCV history. `Ok(None)` means the source has nothing for the
/// ticker; the scanner reports that as insufficient data.
#[async_trait::async_trait]
pub trait DataProvider: Send + Sync {
    async fn fetch_window(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Option<PriceWindow>, ProviderError>;
}

/// Inclusive calendar range to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl FetchRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// `days` calendar days ending at `end`.
    pub fn trailing(end: NaiveDate, days: usize) -> Self {
        let start = end - Duration::days(days as i64);
        Self { start, end }
    }

    /// Twice the minimum history, ending today (UTC), to cover non-trading days.
    pub fn default_for(min_history_days: usize) -> Self {
        Self::trailing(Utc::now().date_naive(), 2 * min_history_days)
    }
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub min_status: Status,
    pub concurrency: usize,
    /// `None` uses [`FetchRange::default_for`] with the engine's history requirement
    pub range: Option<FetchRange>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            min_status: Status::Watchlist,
            concurrency: DEFAULT_CONCURRENCY,
            range: None,
        }
    }
}

impl ScanOptions {
    pub fn with_min_status(mut self, status: Status) -> Self {
        self.min_status = status;
        self
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = limit;
        self
    }

    pub fn with_range(mut self, range: FetchRange) -> Self {
        self.range = Some(range);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickerOutcome {
    Scored { final_score: f64, status: Status },
    InsufficientData,
    Failed(ProviderError),
}

/// Ranked results plus what happened to every ticker, in input order.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub results: Vec<EngineResult>,
    pub outcomes: Vec<(String, TickerOutcome)>,
}

impl ScanReport {
    pub fn scored(&self) -> usize {
        self.count(|o| matches!(o, TickerOutcome::Scored { .. }))
    }

    pub fn insufficient(&self) -> usize {
        self.count(|o| matches!(o, TickerOutcome::InsufficientData))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, TickerOutcome::Failed(_)))
    }

    fn count(&self, pred: impl Fn(&TickerOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| pred(o)).count()
    }
}

/// Highest final score first; ties by ticker ascending.
pub fn rank_order(a: &EngineResult, b: &EngineResult) -> Ordering {
    b.final_score
        .total_cmp(&a.final_score)
        .then_with(|| a.ticker.cmp(&b.ticker))
}

impl Engine {
    /// Fetch and score one ticker. `Ok(None)` is insufficient data.
    pub async fn analyze_ticker<P>(
        &self,
        provider: &P,
        ticker: &str,
        range: FetchRange,
    ) -> Result<Option<EngineResult>, ProviderError>
    where
        P: DataProvider + ?Sized,
    {
        let window = provider.fetch_window(ticker, range.start, range.end).await?;
        Ok(window.and_then(|w| self.analyze(ticker, &w)))
    }

    pub async fn scan<P, T>(&self, provider: &P, tickers: &[T], opts: &ScanOptions) -> Vec<EngineResult>
    where
        P: DataProvider + ?Sized,
        T: AsRef<str> + Sync,
    {
        self.scan_detailed(provider, tickers, opts).await.results
    }

    /// Dropping the future (a timeout, say) drops every pending fetch with
    /// it and yields no partial report.
    pub async fn scan_detailed<P, T>(
        &self,
        provider: &P,
        tickers: &[T],
        opts: &ScanOptions,
    ) -> ScanReport
    where
        P: DataProvider + ?Sized,
        T: AsRef<str> + Sync,
    {
        if tickers.is_empty() {
            return ScanReport::default();
        }
        let range = opts
            .range
            .unwrap_or_else(|| FetchRange::default_for(self.config().min_history_days));
        let limit = opts.concurrency.max(1);

        let mut finished: Vec<(usize, String, Result<Option<EngineResult>, ProviderError>)> =
            stream::iter(tickers.iter().enumerate())
                .map(|(index, ticker)| async move {
                    let ticker = ticker.as_ref();
                    let outcome = self.analyze_ticker(provider, ticker, range).await;
                    (index, ticker.to_string(), outcome)
                })
                .buffer_unordered(limit)
                .collect()
                .await;
        finished.sort_by_key(|(index, _, _)| *index);

        let mut report = ScanReport::default();
        for (_, ticker, outcome) in finished {
            let outcome = match outcome {
                Ok(Some(result)) => {
                    let summary = TickerOutcome::Scored {
                        final_score: result.final_score,
                        status: result.status,
                    };
                    if result.status >= opts.min_status {
                        report.results.push(result);
                    }
                    summary
                }
                Ok(None) => {
                    debug!(ticker = %ticker, "skipped: insufficient data");
                    TickerOutcome::InsufficientData
                }
                Err(e) => {
                    warn!(ticker = %ticker, error = %e, "fetch failed");
                    TickerOutcome::Failed(e)
                }
            };
            report.outcomes.push((ticker, outcome));
        }
        report.results.sort_by(rank_order);

        info!(
            tickers = tickers.len(),
            scored = report.scored(),
            insufficient = report.insufficient(),
            failed = report.failed(),
            matched = report.results.len(),
            "scan complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;

    #[test]
    fn test_trailing_range() {
        let end = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let r = FetchRange::trailing(end, 240);
        assert_eq!(r.end, end);
        assert_eq!((r.end - r.start).num_days(), 240);
    }

    #[test]
    fn test_default_options() {
        let opts = ScanOptions::default();
        assert_eq!(opts.min_status, Status::Watchlist);
        assert_eq!(opts.concurrency, 10);
        assert!(opts.range.is_none());
    }

    #[test]
    fn test_rank_order_breaks_ties_by_ticker() {
        let config = Config::default();
        let mut v = vec![
            EngineResult::from_scores("BBB", 70.0, 70.0, 0.0, 100.0, &config),
            EngineResult::from_scores("AAA", 70.0, 70.0, 0.0, 100.0, &config),
            EngineResult::from_scores("CCC", 90.0, 90.0, 0.0, 100.0, &config),
        ];
        v.sort_by(rank_order);
        let order: Vec<&str> = v.iter().map(|r| r.ticker.as_str()).collect();
        assert_eq!(order, vec!["CCC", "AAA", "BBB"]);
    }
}
