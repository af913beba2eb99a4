use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

pub struct RelayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    connections_admitted_total: AtomicU64,
    connections_rejected_total: Mutex<HashMap<String, u64>>,
    connections_evicted_total: AtomicU64,
    peers_pruned_total: AtomicU64,
    messages_relayed_total: AtomicU64,
}

/// Point-in-time registry sizes, sampled by the `/metrics` handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoomGauges {
    pub active_rooms: usize,
    pub active_connections: usize,
}

const REJECTION_REASONS: [&str; 5] =
    ["protocol", "token", "unknown_user", "unknown_project", "internal"];
static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

impl Default for RelayMetrics {
    fn default() -> Self {
        let mut connections_rejected_total = HashMap::new();
        for reason in REJECTION_REASONS {
            connections_rejected_total.insert(reason.to_string(), 0);
        }

        Self {
            request_duration_count: Mutex::new(HashMap::new()),
            request_duration_sum_ms: Mutex::new(HashMap::new()),
            request_errors_total: Mutex::new(HashMap::new()),
            request_rate_total: Mutex::new(HashMap::new()),
            connections_admitted_total: AtomicU64::new(0),
            connections_rejected_total: Mutex::new(connections_rejected_total),
            connections_evicted_total: AtomicU64::new(0),
            peers_pruned_total: AtomicU64::new(0),
            messages_relayed_total: AtomicU64::new(0),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code, latency_ms);
    }
}

pub fn increment_connections_admitted() {
    if let Some(metrics) = global_metrics() {
        metrics.connections_admitted_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn increment_connections_rejected(reason: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.increment_connections_rejected(reason);
    }
}

pub fn increment_connections_evicted() {
    if let Some(metrics) = global_metrics() {
        metrics.connections_evicted_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn increment_peers_pruned() {
    if let Some(metrics) = global_metrics() {
        metrics.peers_pruned_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn add_messages_relayed(count: u64) {
    if count == 0 {
        return;
    }
    if let Some(metrics) = global_metrics() {
        metrics.messages_relayed_total.fetch_add(count, Ordering::SeqCst);
    }
}

impl RelayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn increment_connections_rejected(&self, reason: &str) {
        let mut guard = self.connections_rejected_total.lock().expect("metrics map lock poisoned");
        let normalized = normalize_rejection_reason(reason);
        let value = guard.entry(normalized).or_insert(0);
        *value = value.saturating_add(1);
    }

    pub fn render_prometheus(&self, gauges: RoomGauges) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE relay_request_rate_total counter\n");
        append_counter_lines(&mut output, "relay_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP relay_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE relay_request_errors_total counter\n");
        append_counter_lines(&mut output, "relay_request_errors_total", &self.request_errors_total);

        output.push_str("# HELP relay_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP relay_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_count",
            &self.request_duration_count,
        );

        append_plain_counter(
            &mut output,
            "collab_connections_admitted_total",
            "Connections admitted to a room.",
            self.connections_admitted_total.load(Ordering::SeqCst),
        );

        output.push_str(
            "# HELP collab_connections_rejected_total Handshakes rejected before admission by reason.\n",
        );
        output.push_str("# TYPE collab_connections_rejected_total counter\n");
        append_reason_lines(&mut output, &self.connections_rejected_total);

        append_plain_counter(
            &mut output,
            "collab_connections_evicted_total",
            "Connections closed because the same user reconnected.",
            self.connections_evicted_total.load(Ordering::SeqCst),
        );
        append_plain_counter(
            &mut output,
            "collab_peers_pruned_total",
            "Peers removed after a failed delivery.",
            self.peers_pruned_total.load(Ordering::SeqCst),
        );
        append_plain_counter(
            &mut output,
            "collab_messages_relayed_total",
            "Messages delivered to peers.",
            self.messages_relayed_total.load(Ordering::SeqCst),
        );

        output.push_str("# HELP collab_active_rooms Rooms with at least one member.\n");
        output.push_str("# TYPE collab_active_rooms gauge\n");
        output.push_str(&format!("collab_active_rooms {}\n", gauges.active_rooms));

        output.push_str("# HELP collab_active_connections Connections currently in a room.\n");
        output.push_str("# TYPE collab_active_connections gauge\n");
        output.push_str(&format!("collab_active_connections {}\n", gauges.active_connections));

        output
    }
}

fn normalize_endpoint(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut normalized_segments = Vec::new();
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        if uuid::Uuid::parse_str(segment).is_ok() {
            normalized_segments.push("{uuid}".to_string());
            continue;
        }

        if segment.chars().all(|character| character.is_ascii_digit()) {
            normalized_segments.push("{number}".to_string());
            continue;
        }

        normalized_segments.push(segment.to_string());
    }

    if normalized_segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", normalized_segments.join("/"))
    }
}

fn normalize_rejection_reason(reason: &str) -> String {
    let normalized = reason.trim().to_ascii_lowercase();
    if REJECTION_REASONS.contains(&normalized.as_str()) {
        normalized
    } else {
        "unknown".to_string()
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_plain_counter(output: &mut String, name: &str, help: &str, value: u64) {
    output.push_str(&format!("# HELP {name} {help}\n"));
    output.push_str(&format!("# TYPE {name} counter\n"));
    output.push_str(&format!("{name} {value}\n"));
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_reason_lines(output: &mut String, map: &Mutex<HashMap<String, u64>>) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (reason, value) in entries {
        output.push_str(&format!(
            "collab_connections_rejected_total{{reason=\"{}\"}} {value}\n",
            escape_label_value(reason),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
