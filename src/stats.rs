//! Statistics calculator (component G): pure `compute(sessions, pricing) ->
//! DashboardStats`. No I/O, no side effects — every field is derived
//! straight from the session list handed in.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{
    metric_key, Attributes, Session, EVENT_API_ERROR, EVENT_API_REQUEST, EVENT_TOOL_DECISION,
    EVENT_TOOL_RESULT, METRIC_CODE_EDIT_DECISION, METRIC_COMMIT_COUNT, METRIC_LINES_OF_CODE,
    METRIC_PULL_REQUEST_COUNT, METRIC_TOKEN_USAGE,
};

/// Per-million-token USD pricing for a model: `[input, output, cache_read,
/// cache_creation]`.
pub type ModelPricing = HashMap<String, [f64; 4]>;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolAcceptance {
    pub accepted: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelUsage {
    pub model: String,
    pub cost_usd: f64,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolCount {
    pub tool: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolPerformance {
    pub tool: String,
    pub mean_ms: f64,
    pub p95_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DashboardStats {
    pub lines_added: i64,
    pub lines_removed: i64,
    pub commits: i64,
    pub pull_requests: i64,
    pub cache_efficiency: f64,
    pub avg_api_latency_secs: f64,
    pub error_rate: f64,
    pub retry_rate: f64,
    pub tool_acceptance: HashMap<String, f64>,
    pub model_breakdown: Vec<ModelUsage>,
    pub top_tools: Vec<ToolCount>,
    pub tool_performance: Vec<ToolPerformance>,
    pub p50_latency_secs: f64,
    pub p95_latency_secs: f64,
    pub p99_latency_secs: f64,
    pub language_breakdown: HashMap<String, u64>,
    pub decision_sources: HashMap<String, u64>,
    pub error_categories: HashMap<String, u64>,
    pub token_breakdown: HashMap<String, i64>,
    pub cache_savings_usd: f64,
    pub mcp_tool_usage: HashMap<String, u64>,
}

/// The persisted form of a dashboard snapshot: `DashboardStats`'s fields
/// decomposed into the `daily_stats` table's primitive/JSON columns, plus
/// the dashboard-wide totals (`total_sessions`/`total_cost`/`total_tokens`)
/// that `DashboardStats` itself doesn't carry. Latency columns are stored
/// in milliseconds, matching `duration_ms`'s native unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DailyStatsRow {
    pub date: String,
    pub total_sessions: i64,
    pub total_cost: f64,
    pub total_tokens: i64,
    pub lines_added: i64,
    pub lines_removed: i64,
    pub commits: i64,
    pub pull_requests: i64,
    pub cache_efficiency: f64,
    pub avg_api_latency_ms: f64,
    pub error_rate: f64,
    pub retry_rate: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub model_breakdown_json: String,
    pub top_tools_json: String,
    pub error_categories_json: String,
    pub language_breakdown_json: String,
    pub decision_sources_json: String,
    pub mcp_tool_usage_json: String,
}

/// Builds the row that gets persisted for `date`: runs `compute` then
/// decomposes it into individual columns instead of one opaque blob.
pub fn daily_stats_row(sessions: &[Session], pricing: Option<&ModelPricing>, date: String) -> DailyStatsRow {
    let computed = compute(sessions, pricing);
    let total_cost: f64 = sessions.iter().map(|s| s.total_cost).sum();
    let total_tokens: i64 = sessions.iter().map(|s| s.total_tokens).sum();

    DailyStatsRow {
        date,
        total_sessions: sessions.len() as i64,
        total_cost,
        total_tokens,
        lines_added: computed.lines_added,
        lines_removed: computed.lines_removed,
        commits: computed.commits,
        pull_requests: computed.pull_requests,
        cache_efficiency: computed.cache_efficiency,
        avg_api_latency_ms: computed.avg_api_latency_secs * 1000.0,
        error_rate: computed.error_rate,
        retry_rate: computed.retry_rate,
        p50_latency_ms: computed.p50_latency_secs * 1000.0,
        p95_latency_ms: computed.p95_latency_secs * 1000.0,
        p99_latency_ms: computed.p99_latency_secs * 1000.0,
        model_breakdown_json: serde_json::to_string(&computed.model_breakdown).unwrap_or_else(|_| "[]".to_string()),
        top_tools_json: serde_json::to_string(&computed.top_tools).unwrap_or_else(|_| "[]".to_string()),
        error_categories_json: serde_json::to_string(&computed.error_categories).unwrap_or_else(|_| "{}".to_string()),
        language_breakdown_json: serde_json::to_string(&computed.language_breakdown)
            .unwrap_or_else(|_| "{}".to_string()),
        decision_sources_json: serde_json::to_string(&computed.decision_sources).unwrap_or_else(|_| "{}".to_string()),
        mcp_tool_usage_json: serde_json::to_string(&computed.mcp_tool_usage).unwrap_or_else(|_| "{}".to_string()),
    }
}

/// Latest value per `(name, attributes)` key within one session, for
/// metrics whose semantics are cumulative counters — never sum within a
/// session, only across sessions.
fn latest_by_key(session: &Session, name: &str) -> HashMap<String, f64> {
    let mut latest: HashMap<String, f64> = HashMap::new();
    for metric in &session.metrics {
        if metric.name == name {
            latest.insert(metric_key(&metric.name, &metric.attributes), metric.value);
        }
    }
    latest
}

fn latest_by_attr(session: &Session, name: &str, attr: &str) -> HashMap<String, f64> {
    let mut latest: HashMap<String, f64> = HashMap::new();
    for metric in &session.metrics {
        if metric.name == name {
            if let Some(v) = metric.attributes.get(attr) {
                latest.insert(v.clone(), metric.value);
            }
        }
    }
    latest
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((p * sorted.len() as f64).floor() as usize).min(sorted.len() - 1);
    sorted[idx]
}

fn attr_f64(attrs: &Attributes, key: &str) -> Option<f64> {
    attrs.get(key).and_then(|v| v.parse::<f64>().ok())
}

fn attr_i64(attrs: &Attributes, key: &str) -> Option<i64> {
    attrs.get(key).and_then(|v| v.parse::<i64>().ok())
}

fn is_accept(decision: &str) -> bool {
    decision.eq_ignore_ascii_case("accept")
}

fn error_category(attrs: &Attributes) -> &'static str {
    let code = attrs.get("status_code").or_else(|| attrs.get("http.status_code"));
    match code.and_then(|c| c.parse::<i64>().ok()) {
        Some(429) => "rate_limit",
        Some(401) | Some(403) => "auth_failure",
        Some(code) if (500..=599).contains(&code) => "server_error",
        _ => "other",
    }
}

/// Pure computation over the full session list. Cumulative metrics use only
/// each session's latest value per `(name, attributes)` grouping, summed
/// across sessions; per-event fields (cost/tokens on `api_request`,
/// durations) are additive across every event everywhere.
pub fn compute(sessions: &[Session], pricing: Option<&ModelPricing>) -> DashboardStats {
    let mut stats = DashboardStats::default();

    let mut lines_added = 0i64;
    let mut lines_removed = 0i64;
    let mut commits = 0i64;
    let mut pull_requests = 0i64;
    let mut cache_read_total = 0f64;
    let mut input_total = 0f64;
    let mut durations_secs: Vec<f64> = Vec::new();
    let mut request_count = 0u64;
    let mut error_count = 0u64;
    let mut retryable_errors = 0u64;
    let mut tool_decisions: HashMap<String, (f64, f64)> = HashMap::new(); // tool -> (accept, total)
    let mut model_usage: HashMap<String, ModelUsage> = HashMap::new();
    let mut top_tools: HashMap<String, u64> = HashMap::new();
    let mut tool_durations: HashMap<String, Vec<f64>> = HashMap::new();
    let mut language_breakdown: HashMap<String, u64> = HashMap::new();
    let mut decision_sources: HashMap<String, u64> = HashMap::new();
    let mut error_categories: HashMap<String, u64> = HashMap::new();
    let mut token_breakdown: HashMap<String, i64> = HashMap::new();
    let mut mcp_tool_usage: HashMap<String, u64> = HashMap::new();

    for session in sessions {
        for (key, value) in latest_by_attr(session, METRIC_LINES_OF_CODE, "type") {
            match key.as_str() {
                "added" => lines_added += value as i64,
                "removed" => lines_removed += value as i64,
                _ => {}
            }
        }
        for value in latest_by_key(session, METRIC_COMMIT_COUNT).values() {
            commits += *value as i64;
        }
        for value in latest_by_key(session, METRIC_PULL_REQUEST_COUNT).values() {
            pull_requests += *value as i64;
        }

        for metric in &session.metrics {
            if metric.name == METRIC_CODE_EDIT_DECISION {
                if let Some(lang) = metric.attributes.get("language") {
                    if !lang.is_empty() {
                        *language_breakdown.entry(lang.clone()).or_insert(0) += 1;
                    }
                }
            }
        }
        let mut per_tool_latest: HashMap<(String, String), f64> = HashMap::new();
        for metric in &session.metrics {
            if metric.name == METRIC_CODE_EDIT_DECISION {
                if let (Some(tool), Some(decision)) = (
                    metric.attributes.get("tool"),
                    metric.attributes.get("decision"),
                ) {
                    per_tool_latest.insert(
                        (tool.clone(), metric_key(&metric.name, &metric.attributes)),
                        if is_accept(decision) { 1.0 } else { 0.0 },
                    );
                }
            }
        }
        for ((tool, _key), is_accept_value) in per_tool_latest {
            let entry = tool_decisions.entry(tool).or_insert((0.0, 0.0));
            entry.0 += is_accept_value;
            entry.1 += 1.0;
        }

        for (type_name, value) in latest_by_attr(session, METRIC_TOKEN_USAGE, "type") {
            *token_breakdown.entry(type_name.clone()).or_insert(0) += value as i64;
            if type_name == "cacheRead" || type_name == "cache_read" {
                cache_read_total += value;
            }
            if type_name == "input" {
                input_total += value;
            }
        }

        for event in &session.events {
            match event.name.as_str() {
                n if n == EVENT_API_REQUEST => {
                    request_count += 1;
                    if let Some(duration_ms) = attr_f64(&event.attributes, "duration_ms") {
                        durations_secs.push(duration_ms / 1000.0);
                    }
                    if let Some(model) = event.attributes.get("model") {
                        let entry = model_usage.entry(model.clone()).or_insert_with(|| ModelUsage {
                            model: model.clone(),
                            ..Default::default()
                        });
                        entry.cost_usd += attr_f64(&event.attributes, "cost_usd").unwrap_or(0.0);
                        entry.input_tokens += attr_i64(&event.attributes, "input_tokens").unwrap_or(0);
                        entry.output_tokens += attr_i64(&event.attributes, "output_tokens").unwrap_or(0);
                    }
                }
                n if n == EVENT_API_ERROR => {
                    error_count += 1;
                    if attr_i64(&event.attributes, "attempt").unwrap_or(0) >= 2 {
                        retryable_errors += 1;
                    }
                    *error_categories
                        .entry(error_category(&event.attributes).to_string())
                        .or_insert(0) += 1;
                }
                n if n == EVENT_TOOL_RESULT => {
                    if let Some(tool_name) = event.attributes.get("tool_name") {
                        *top_tools.entry(tool_name.clone()).or_insert(0) += 1;
                        if let Some(duration_ms) = attr_f64(&event.attributes, "duration_ms") {
                            tool_durations.entry(tool_name.clone()).or_default().push(duration_ms);
                        }
                        if tool_name == "mcp_tool" {
                            if let Some(params) = event.attributes.get("tool_parameters") {
                                if let Ok(v) = serde_json::from_str::<serde_json::Value>(params) {
                                    let server = v.get("mcp_server_name").and_then(|x| x.as_str()).unwrap_or("");
                                    let tool = v.get("mcp_tool_name").and_then(|x| x.as_str()).unwrap_or("");
                                    if !server.is_empty() || !tool.is_empty() {
                                        *mcp_tool_usage.entry(format!("{server}:{tool}")).or_insert(0) += 1;
                                    }
                                }
                            }
                        }
                    }
                }
                n if n == EVENT_TOOL_DECISION => {
                    if let Some(source) = event.attributes.get("source") {
                        if !source.is_empty() {
                            *decision_sources.entry(source.clone()).or_insert(0) += 1;
                        }
                    }
                }
                _ => {}
            }
        }
    }

    stats.lines_added = lines_added;
    stats.lines_removed = lines_removed;
    stats.commits = commits;
    stats.pull_requests = pull_requests;

    stats.cache_efficiency = if cache_read_total + input_total > 0.0 {
        cache_read_total / (cache_read_total + input_total)
    } else {
        0.0
    };

    stats.avg_api_latency_secs = if durations_secs.is_empty() {
        0.0
    } else {
        durations_secs.iter().sum::<f64>() / durations_secs.len() as f64
    };

    stats.error_rate = if request_count > 0 {
        error_count as f64 / request_count as f64
    } else {
        0.0
    };
    stats.retry_rate = if error_count > 0 {
        retryable_errors as f64 / error_count as f64
    } else {
        0.0
    };

    stats.tool_acceptance = tool_decisions
        .into_iter()
        .map(|(tool, (accept, total))| (tool, if total > 0.0 { accept / total } else { 0.0 }))
        .collect();

    let mut model_breakdown: Vec<ModelUsage> = model_usage.into_values().collect();
    model_breakdown.sort_by(|a, b| b.cost_usd.partial_cmp(&a.cost_usd).unwrap_or(std::cmp::Ordering::Equal));
    stats.model_breakdown = model_breakdown;

    let mut top_tools_vec: Vec<ToolCount> = top_tools
        .into_iter()
        .map(|(tool, count)| ToolCount { tool, count })
        .collect();
    top_tools_vec.sort_by(|a, b| b.count.cmp(&a.count));
    stats.top_tools = top_tools_vec;

    let mut tool_perf: Vec<ToolPerformance> = tool_durations
        .into_iter()
        .map(|(tool, mut durations)| {
            durations.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let mean = durations.iter().sum::<f64>() / durations.len() as f64;
            let p95 = percentile(&durations, 0.95);
            ToolPerformance { tool, mean_ms: mean, p95_ms: p95 }
        })
        .collect();
    tool_perf.sort_by(|a, b| b.mean_ms.partial_cmp(&a.mean_ms).unwrap_or(std::cmp::Ordering::Equal));
    stats.tool_performance = tool_perf;

    durations_secs.sort_by(|a, b| a.partial_cmp(b).unwrap());
    stats.p50_latency_secs = percentile(&durations_secs, 0.50);
    stats.p95_latency_secs = percentile(&durations_secs, 0.95);
    stats.p99_latency_secs = percentile(&durations_secs, 0.99);

    stats.language_breakdown = language_breakdown;
    stats.decision_sources = decision_sources;
    stats.error_categories = error_categories;
    stats.token_breakdown = token_breakdown;
    stats.mcp_tool_usage = mcp_tool_usage;

    stats.cache_savings_usd = compute_cache_savings(sessions, pricing);

    stats
}

fn compute_cache_savings(sessions: &[Session], pricing: Option<&ModelPricing>) -> f64 {
    let Some(pricing) = pricing else { return 0.0 };
    let mut total = 0.0;
    for session in sessions {
        let Some(model) = &session.model else { continue };
        let Some(prices) = pricing.get(model) else { continue };
        let [input_price, _output_price, cache_read_price, _cache_creation_price] = *prices;
        if session.cache_read_tokens <= 0 {
            continue;
        }
        total += session.cache_read_tokens as f64 * (input_price - cache_read_price) / 1_000_000.0;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Event, Metric};
    use chrono::Utc;

    fn metric(name: &str, value: f64, attrs: &[(&str, &str)]) -> Metric {
        Metric {
            name: name.to_string(),
            value,
            attributes: attrs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            timestamp: Utc::now(),
        }
    }

    fn event(name: &str, attrs: &[(&str, &str)]) -> Event {
        Event::new(
            name,
            attrs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            Utc::now(),
        )
    }

    #[test]
    fn empty_sessions_yield_zeroed_stats() {
        let stats = compute(&[], None);
        assert_eq!(stats.error_rate, 0.0);
        assert_eq!(stats.p50_latency_secs, 0.0);
        assert_eq!(stats.cache_efficiency, 0.0);
    }

    #[test]
    fn cumulative_counters_use_latest_value_within_session() {
        let mut session = Session::new("s1");
        session.metrics.push(metric(METRIC_COMMIT_COUNT, 3.0, &[]));
        session.metrics.push(metric(METRIC_COMMIT_COUNT, 7.0, &[]));
        let stats = compute(&[session], None);
        assert_eq!(stats.commits, 7);
    }

    #[test]
    fn commits_sum_across_sessions() {
        let mut s1 = Session::new("s1");
        s1.metrics.push(metric(METRIC_COMMIT_COUNT, 3.0, &[]));
        let mut s2 = Session::new("s2");
        s2.metrics.push(metric(METRIC_COMMIT_COUNT, 4.0, &[]));
        let stats = compute(&[s1, s2], None);
        assert_eq!(stats.commits, 7);
    }

    #[test]
    fn error_rate_is_zero_with_no_requests() {
        let session = Session::new("s1");
        let stats = compute(&[session], None);
        assert_eq!(stats.error_rate, 0.0);
    }

    #[test]
    fn error_rate_divides_errors_by_requests() {
        let mut session = Session::new("s1");
        session.events.push(event(EVENT_API_REQUEST, &[]));
        session.events.push(event(EVENT_API_REQUEST, &[]));
        session.events.push(event(EVENT_API_ERROR, &[]));
        let stats = compute(&[session], None);
        assert_eq!(stats.error_rate, 0.5);
    }

    #[test]
    fn error_categories_bucket_by_status_code() {
        let mut session = Session::new("s1");
        session.events.push(event(EVENT_API_ERROR, &[("status_code", "429")]));
        session.events.push(event(EVENT_API_ERROR, &[("status_code", "401")]));
        session.events.push(event(EVENT_API_ERROR, &[("status_code", "503")]));
        session.events.push(event(EVENT_API_ERROR, &[]));
        let stats = compute(&[session], None);
        assert_eq!(stats.error_categories.get("rate_limit"), Some(&1));
        assert_eq!(stats.error_categories.get("auth_failure"), Some(&1));
        assert_eq!(stats.error_categories.get("server_error"), Some(&1));
        assert_eq!(stats.error_categories.get("other"), Some(&1));
    }

    #[test]
    fn percentile_is_nearest_rank_clamped() {
        let sorted = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&sorted, 0.0), 1.0);
        assert_eq!(percentile(&sorted, 0.99), 5.0);
        assert_eq!(percentile(&[], 0.5), 0.0);
    }

    #[test]
    fn cache_savings_zero_without_pricing() {
        let mut session = Session::new("s1");
        session.model = Some("claude-3".to_string());
        session.cache_read_tokens = 1000;
        let stats = compute(&[session], None);
        assert_eq!(stats.cache_savings_usd, 0.0);
    }

    #[test]
    fn cache_savings_computed_from_pricing_table() {
        let mut session = Session::new("s1");
        session.model = Some("claude-3".to_string());
        session.cache_read_tokens = 1_000_000;
        let mut pricing = ModelPricing::new();
        pricing.insert("claude-3".to_string(), [3.0, 15.0, 0.3, 3.75]);
        let stats = compute(&[session], Some(&pricing));
        assert!((stats.cache_savings_usd - 2.7).abs() < 1e-9);
    }

    #[test]
    fn daily_stats_row_decomposes_totals_and_converts_latency_to_ms() {
        let mut session = Session::new("s1");
        session.total_cost = 4.0;
        session.total_tokens = 1000;
        session.events.push(event(EVENT_API_REQUEST, &[("duration_ms", "250")]));
        let row = daily_stats_row(&[session], None, "2026-07-28".to_string());
        assert_eq!(row.date, "2026-07-28");
        assert_eq!(row.total_sessions, 1);
        assert_eq!(row.total_cost, 4.0);
        assert_eq!(row.total_tokens, 1000);
        assert_eq!(row.avg_api_latency_ms, 250.0);
    }

    #[test]
    fn tool_acceptance_is_case_insensitive_on_accept() {
        let mut session = Session::new("s1");
        session.metrics.push(metric(
            METRIC_CODE_EDIT_DECISION,
            1.0,
            &[("tool", "edit"), ("decision", "Accept"), ("seq", "1")],
        ));
        session.metrics.push(metric(
            METRIC_CODE_EDIT_DECISION,
            1.0,
            &[("tool", "edit"), ("decision", "reject"), ("seq", "2")],
        ));
        let stats = compute(&[session], None);
        assert_eq!(stats.tool_acceptance.get("edit"), Some(&0.5));
    }
}
