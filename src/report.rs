//! Plain-text reports for single results and scan batches.

use std::fmt::Write as _;

use crate::{scanner::rank_order, EngineResult, MetaValue, ModuleScore, Status};

const RULE: &str = "==================================================";
const THIN_RULE: &str = "--------------------------------------------------";
const TOP_MODULES: usize = 3;

pub fn describe_missing(ticker: &str) -> String {
    format!("insufficient data for {ticker}")
}

fn meta_text(value: &MetaValue) -> String {
    match value {
        MetaValue::Number(v) if v.fract() == 0.0 && v.abs() < 1e9 => format!("{v:.0}"),
        MetaValue::Number(v) => format!("{v:.4}"),
        MetaValue::Flag(b) => if *b { "yes" } else { "no" }.to_string(),
        MetaValue::Text(s) => s.clone(),
    }
}

/// Modules ordered by share of their maximum, strongest first.
fn strongest(modules: &[ModuleScore]) -> Vec<&ModuleScore> {
    let mut sorted: Vec<&ModuleScore> = modules.iter().collect();
    sorted.sort_by(|a, b| {
        b.fraction()
            .total_cmp(&a.fraction())
            .then_with(|| a.module_name.cmp(&b.module_name))
    });
    sorted
}

fn push_list(out: &mut String, title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    let _ = writeln!(out, "\n{title}:");
    for item in items {
        let _ = writeln!(out, "  - {item}");
    }
}

pub fn format_result(result: &EngineResult, detailed: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "SAPTA Analysis: {}", result.ticker);
    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(
        out,
        "Status:      {} (confidence: {})",
        result.status, result.confidence
    );
    let _ = writeln!(
        out,
        "Final score: {:.1} / {:.1} ({:.1}%)",
        result.final_score,
        result.max_possible_score,
        result.score_pct()
    );
    let _ = writeln!(
        out,
        "Raw: {:.1} | Weighted: {:.1} | Penalty: {:.1}",
        result.total_score, result.weighted_score, result.penalty_score
    );
    if let Some(phase) = &result.wave_phase {
        let _ = writeln!(out, "Wave phase:  {phase}");
    }
    if let (Some(p), Some(blended)) = (result.ml_probability, result.blended_score) {
        let _ = writeln!(out, "Model:       p={p:.2} (blended score {blended:.1})");
    }

    let _ = writeln!(out, "\nTop modules:");
    for (i, m) in strongest(&result.module_scores).iter().take(TOP_MODULES).enumerate() {
        let _ = writeln!(
            out,
            "  {}. {:<18} {:>5.1} / {:<5.1}",
            i + 1,
            m.module_name,
            m.score,
            m.max_score
        );
    }

    if detailed {
        let _ = writeln!(out, "\nModules:\n{THIN_RULE}");
        for m in &result.module_scores {
            let mark = if m.status { "+" } else { " " };
            let _ = writeln!(
                out,
                "[{mark}] {:<18} {:>5.1} / {:<5.1}",
                m.module_name, m.score, m.max_score
            );
            for (key, value) in &m.metadata {
                let _ = writeln!(out, "      {key}: {}", meta_text(value));
            }
        }
        push_list(&mut out, "Signals", &result.reasons);
        push_list(&mut out, "Warnings", &result.warnings);
        push_list(&mut out, "Penalties", &result.penalties);
        push_list(&mut out, "Notes", &result.notes);
    } else if let Some(reason) = result.reasons.first() {
        let _ = writeln!(out, "\nKey signal: {reason}");
    }
    out
}

pub fn format_scan_results(results: &[EngineResult]) -> String {
    if results.is_empty() {
        return "No stocks matched the scan criteria.".to_string();
    }
    let mut ranked: Vec<&EngineResult> = results.iter().collect();
    ranked.sort_by(|a, b| rank_order(a, b));

    let mut out = String::new();
    let _ = writeln!(out, "SAPTA Scan Results");
    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(
        out,
        "{:>3}  {:<10} {:>6}  {:<11} {:<7} Wave",
        "#", "Ticker", "Score", "Status", "Conf"
    );
    for (i, r) in ranked.iter().enumerate() {
        let _ = writeln!(
            out,
            "{:>3}  {:<10} {:>6.1}  {:<11} {:<7} {}",
            i + 1,
            r.ticker,
            r.final_score,
            r.status.label(),
            r.confidence.label(),
            r.wave_phase.as_deref().unwrap_or("-")
        );
    }
    let _ = writeln!(out, "{THIN_RULE}");

    let count = |s: Status| results.iter().filter(|r| r.status == s).count();
    let _ = write!(
        out,
        "Total: {} | PRE-MARKUP: {} | SIAP: {} | WATCHLIST: {}",
        results.len(),
        count(Status::PreMarkup),
        count(Status::Siap),
        count(Status::Watchlist)
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, Confidence};

    fn sample(ticker: &str, weighted: f64) -> EngineResult {
        let mut r = EngineResult::from_scores(ticker, weighted, weighted, 0.0, 100.0, &Config::default());
        let mut m = ModuleScore::new("absorption", 16.0, 20.0).with_status(true);
        m.insert_meta("price_held", 1.0);
        r.module_scores = vec![m, ModuleScore::new("compression", 3.0, 15.0)];
        r.reasons.push("absorption: Support held".into());
        r
    }

    #[test]
    fn test_format_result_summary() {
        let text = format_result(&sample("2330", 72.0), false);
        assert!(text.contains("2330"));
        assert!(text.contains("SIAP"));
        assert!(text.contains("72.0"));
        assert!(text.contains("confidence: MEDIUM"));
        assert!(text.contains("1. absorption"));
        assert!(!text.contains("price_held"));
    }

    #[test]
    fn test_format_result_detailed() {
        let mut r = sample("2330", 72.0);
        r.penalties.push("Compression without accumulation (-5.0)".into());
        r.confidence = Confidence::High;
        let text = format_result(&r, true);
        assert!(text.contains("price_held: 1"));
        assert!(text.contains("Penalties:"));
        assert!(text.contains("HIGH"));
    }

    #[test]
    fn test_format_scan_results() {
        let text = format_scan_results(&[sample("BBCA", 70.0), sample("TLKM", 85.0)]);
        assert!(text.contains("Total: 2"));
        assert!(text.contains("PRE-MARKUP: 1"));
        let tlkm = text.find("TLKM").unwrap();
        let bbca = text.find("BBCA").unwrap();
        assert!(tlkm < bbca);
    }

    #[test]
    fn test_empty_scan_and_missing() {
        assert!(format_scan_results(&[]).contains("No stocks matched"));
        assert_eq!(describe_missing("2330"), "insufficient data for 2330");
    }
}
