//! Detection rules for the three monitor passes.
//!
//! Each rule is a pure function from signals to anomalies, so the monitor can
//! run them concurrently and tests can drive them without a signal source.
//! Output order is deterministic (grouped through `BTreeMap`).

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde_json::json;

use super::anomaly::Samples;
use super::normalize::{message_template, route_template};
use super::{Anomaly, Category, Severity};
use crate::config::{ErrorRateConfig, LatencyConfig, LogAnomalyConfig};
use crate::signals::{ErrorEvent, LatencySample, LineLevel, LogLine};

// ---------------------------------------------------------------------------
// Error patterns
// ---------------------------------------------------------------------------

struct ErrorGroup<'a> {
    route: String,
    status: Option<u16>,
    count: usize,
    sample: &'a str,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

/// Group error events by status and route template and flag groups whose
/// hourly rate over the window reaches the warning threshold.
pub fn error_patterns(events: &[ErrorEvent], window_minutes: u64, cfg: &ErrorRateConfig) -> Vec<Anomaly> {
    let mut groups: BTreeMap<String, ErrorGroup<'_>> = BTreeMap::new();
    for event in events {
        let route = route_template(&event.route);
        let status = event
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "none".to_string());
        let signature = format!("{}:{}:{}", Category::ErrorPattern, status, route);
        groups
            .entry(signature)
            .and_modify(|g| {
                g.count += 1;
                g.first_seen = g.first_seen.min(event.timestamp);
                g.last_seen = g.last_seen.max(event.timestamp);
            })
            .or_insert(ErrorGroup {
                route,
                status: event.status,
                count: 1,
                sample: &event.message,
                first_seen: event.timestamp,
                last_seen: event.timestamp,
            });
    }

    let hours = window_minutes.max(1) as f64 / 60.0;
    groups
        .into_iter()
        .filter_map(|(signature, g)| {
            let rate = g.count as f64 / hours;
            let severity = if rate >= cfg.critical_per_hour {
                Severity::Critical
            } else if rate >= cfg.warning_per_hour {
                Severity::Warning
            } else {
                return None;
            };
            Some(Anomaly {
                category: Category::ErrorPattern,
                severity,
                signature,
                evidence: json!({
                    "route": g.route,
                    "status": g.status,
                    "count": g.count,
                    "rate_per_hour": rate,
                    "window_minutes": window_minutes,
                    "sample_error": g.sample,
                    "first_seen": g.first_seen,
                    "last_seen": g.last_seen,
                }),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Performance
// ---------------------------------------------------------------------------

/// Flag endpoints whose p95 latency exceeds the ceiling.
pub fn slow_endpoints(samples: &[LatencySample], cfg: &LatencyConfig) -> Vec<Anomaly> {
    let mut by_endpoint: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for s in samples {
        by_endpoint
            .entry(route_template(&s.endpoint))
            .or_default()
            .push(s.latency_ms);
    }

    by_endpoint
        .into_iter()
        .filter_map(|(endpoint, values)| {
            let samples = Samples::new(values);
            if samples.is_empty() || samples.len() < cfg.min_samples {
                return None;
            }
            let p95 = samples.p95();
            if p95 <= cfg.ceiling_ms {
                return None;
            }
            let severity = if p95 >= cfg.ceiling_ms * cfg.critical_multiplier {
                Severity::Critical
            } else {
                Severity::Warning
            };
            Some(Anomaly {
                category: Category::Performance,
                severity,
                signature: format!("{}:{}", Category::Performance, endpoint),
                evidence: json!({
                    "endpoint": endpoint,
                    "p95_ms": p95,
                    "mean_ms": samples.mean(),
                    "max_ms": samples.max(),
                    "samples": samples.len(),
                    "ceiling_ms": cfg.ceiling_ms,
                }),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Log anomalies
// ---------------------------------------------------------------------------

struct LogGroup<'a> {
    count: usize,
    level: LineLevel,
    sample: &'a str,
    keyword: Option<&'a str>,
}

/// Heuristics over free-text logs: security keywords, repeated warnings and
/// error strings absent from the baseline period.
pub fn log_anomalies(recent: &[LogLine], baseline: &[LogLine], cfg: &LogAnomalyConfig) -> Vec<Anomaly> {
    let known_errors: BTreeSet<String> = baseline
        .iter()
        .filter(|l| l.level >= LineLevel::Warn)
        .map(|l| message_template(&l.message))
        .collect();
    let keywords: Vec<(String, &str)> = cfg
        .security_keywords
        .iter()
        .map(|k| (k.to_lowercase(), k.as_str()))
        .collect();

    let mut groups: BTreeMap<String, LogGroup<'_>> = BTreeMap::new();
    for line in recent {
        let template = message_template(&line.message);
        let lowered = line.message.to_lowercase();
        let keyword = keywords
            .iter()
            .find(|(k, _)| !k.is_empty() && lowered.contains(k.as_str()))
            .map(|(_, original)| *original);
        let group = groups.entry(template).or_insert(LogGroup {
            count: 0,
            level: line.level,
            sample: &line.message,
            keyword: None,
        });
        group.count += 1;
        if line.level > group.level {
            group.level = line.level;
            group.sample = &line.message;
        }
        if group.keyword.is_none() {
            group.keyword = keyword;
        }
    }

    let mut anomalies = Vec::new();
    for (template, g) in groups {
        if let Some(keyword) = g.keyword {
            anomalies.push(Anomaly {
                category: Category::Security,
                severity: Severity::Warning,
                signature: format!("{}:{}", Category::Security, template),
                evidence: json!({
                    "reason": "security-keyword",
                    "keyword": keyword,
                    "template": template,
                    "count": g.count,
                    "level": g.level.as_str(),
                    "log_excerpt": g.sample,
                }),
            });
            continue;
        }

        let (severity, reason) = if g.level >= LineLevel::Warn && g.count >= cfg.repeat_threshold {
            (Severity::Warning, "repeated")
        } else if g.level == LineLevel::Error && !known_errors.contains(&template) {
            (Severity::Info, "novel")
        } else {
            continue;
        };
        anomalies.push(Anomaly {
            category: Category::LogAnomaly,
            severity,
            signature: format!("{}:{}", Category::LogAnomaly, template),
            evidence: json!({
                "reason": reason,
                "template": template,
                "count": g.count,
                "level": g.level.as_str(),
                "log_excerpt": g.sample,
            }),
        });
    }
    anomalies
}

#[cfg(test)]
mod tests {
    use super::*;

    fn errors(route: &str, status: u16, n: usize) -> Vec<ErrorEvent> {
        let now = Utc::now();
        (0..n)
            .map(|i| ErrorEvent {
                timestamp: now - chrono::Duration::seconds(i as i64),
                route: route.to_string(),
                status: Some(status),
                message: "internal error".to_string(),
            })
            .collect()
    }

    fn line(level: LineLevel, message: &str) -> LogLine {
        LogLine {
            timestamp: Utc::now(),
            level,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_error_rate_thresholds() {
        let cfg = ErrorRateConfig::default();

        let found = error_patterns(&errors("/x", 500, 50), 60, &cfg);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].severity, Severity::Warning);
        assert_eq!(found[0].signature, "error-pattern:500:/x");
        assert_eq!(found[0].evidence["count"], 50);

        assert!(error_patterns(&errors("/x", 500, 5), 60, &cfg).is_empty());
        assert_eq!(
            error_patterns(&errors("/x", 500, 250), 60, &cfg)[0].severity,
            Severity::Critical
        );
    }

    #[test]
    fn test_error_rate_scales_with_window() {
        let cfg = ErrorRateConfig::default();
        // 10 events in 15 minutes is 40/hour.
        let found = error_patterns(&errors("/x", 502, 10), 15, &cfg);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_error_groups_use_route_templates() {
        let cfg = ErrorRateConfig::default();
        let mut events = errors("/users/1", 500, 15);
        events.extend(errors("/users/2", 500, 15));
        events.extend(errors("/users/3", 404, 15));
        let found = error_patterns(&events, 60, &cfg);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].signature, "error-pattern:500:/users/:id");
    }

    #[test]
    fn test_slow_endpoint_over_ceiling() {
        let cfg = LatencyConfig::default();
        let now = Utc::now();
        let samples = vec![
            LatencySample { timestamp: now, endpoint: "/y".into(), latency_ms: 6_000.0 },
            LatencySample { timestamp: now, endpoint: "/z".into(), latency_ms: 120.0 },
        ];
        let found = slow_endpoints(&samples, &cfg);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].category, Category::Performance);
        assert_eq!(found[0].severity, Severity::Warning);
        assert_eq!(found[0].signature, "performance:/y");

        let very_slow = vec![LatencySample { timestamp: now, endpoint: "/y".into(), latency_ms: 12_000.0 }];
        assert_eq!(slow_endpoints(&very_slow, &cfg)[0].severity, Severity::Critical);
    }

    #[test]
    fn test_slow_endpoint_respects_min_samples() {
        let cfg = LatencyConfig { min_samples: 3, ..LatencyConfig::default() };
        let now = Utc::now();
        let samples = vec![LatencySample { timestamp: now, endpoint: "/y".into(), latency_ms: 9_000.0 }];
        assert!(slow_endpoints(&samples, &cfg).is_empty());
    }

    #[test]
    fn test_repeated_warnings() {
        let cfg = LogAnomalyConfig::default();
        let recent: Vec<LogLine> = (0..12)
            .map(|i| line(LineLevel::Warn, &format!("cache miss storm on shard {i}")))
            .collect();
        let found = log_anomalies(&recent, &[], &cfg);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].severity, Severity::Warning);
        assert_eq!(found[0].evidence["reason"], "repeated");
        assert_eq!(found[0].signature, "log-anomaly:cache miss storm on shard <n>");
    }

    #[test]
    fn test_novel_errors_are_info() {
        let cfg = LogAnomalyConfig::default();
        let baseline = vec![line(LineLevel::Error, "db timeout after 30ms")];
        let recent = vec![
            line(LineLevel::Error, "db timeout after 45ms"),
            line(LineLevel::Error, "null pointer in renderer"),
        ];
        let found = log_anomalies(&recent, &baseline, &cfg);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].severity, Severity::Info);
        assert_eq!(found[0].evidence["reason"], "novel");
    }

    #[test]
    fn test_security_keyword() {
        let cfg = LogAnomalyConfig::default();
        let recent = vec![line(LineLevel::Info, "Unauthorized access to /admin from 10.0.0.7")];
        let found = log_anomalies(&recent, &[], &cfg);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].category, Category::Security);
        assert_eq!(found[0].evidence["keyword"], "unauthorized");
    }

    #[test]
    fn test_quiet_logs_produce_nothing() {
        let cfg = LogAnomalyConfig::default();
        let recent = vec![line(LineLevel::Info, "request served"), line(LineLevel::Warn, "slow query")];
        assert!(log_anomalies(&recent, &[], &cfg).is_empty());
    }
}
