use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "relay.request.duration",
    metric_type: MetricType::Histogram,
    description: "Inbound request duration in milliseconds. Tagged with status.",
};

pub const AUTH_DENIED: MetricDef = MetricDef {
    name: "relay.auth.denied",
    metric_type: MetricType::Counter,
    description: "Inbound requests rejected by the api key check",
};

pub const UPSTREAM_FAILURES: MetricDef = MetricDef {
    name: "relay.upstream.failures",
    metric_type: MetricType::Counter,
    description: "Per-instance dispatch failures. Tagged with kind.",
};

pub const ALL_METRICS: &[MetricDef] = &[REQUEST_DURATION, AUTH_DENIED, UPSTREAM_FAILURES];
