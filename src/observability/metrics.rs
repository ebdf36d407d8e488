use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub bookings_created_total: IntCounterVec,
    pub assignments_total: IntCounterVec,
    pub status_transitions_total: IntCounterVec,
    pub rematch_queue_depth: IntGauge,
    pub matching_latency_seconds: HistogramVec,
    pub live_connections: IntGaugeVec,
    pub realtime_events_dropped_total: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let bookings_created_total = IntCounterVec::new(
            Opts::new("bookings_created_total", "Bookings created by initial outcome"),
            &["outcome"],
        )
        .expect("valid bookings_created_total metric");

        let assignments_total = IntCounterVec::new(
            Opts::new("assignments_total", "Matching attempts by outcome"),
            &["outcome"],
        )
        .expect("valid assignments_total metric");

        let status_transitions_total = IntCounterVec::new(
            Opts::new(
                "status_transitions_total",
                "Booking status transitions by target status",
            ),
            &["to"],
        )
        .expect("valid status_transitions_total metric");

        let rematch_queue_depth =
            IntGauge::new("rematch_queue_depth", "Bookings waiting in the rematch queue")
                .expect("valid rematch_queue_depth metric");

        let matching_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "matching_latency_seconds",
                "Latency of a matching attempt in seconds",
            ),
            &["outcome"],
        )
        .expect("valid matching_latency_seconds metric");

        let live_connections = IntGaugeVec::new(
            Opts::new("live_connections", "Authenticated realtime connections"),
            &["role"],
        )
        .expect("valid live_connections metric");

        let realtime_events_dropped_total = IntCounter::new(
            "realtime_events_dropped_total",
            "Realtime events dropped because the connection was full or closed",
        )
        .expect("valid realtime_events_dropped_total metric");

        registry
            .register(Box::new(bookings_created_total.clone()))
            .expect("register bookings_created_total");
        registry
            .register(Box::new(assignments_total.clone()))
            .expect("register assignments_total");
        registry
            .register(Box::new(status_transitions_total.clone()))
            .expect("register status_transitions_total");
        registry
            .register(Box::new(rematch_queue_depth.clone()))
            .expect("register rematch_queue_depth");
        registry
            .register(Box::new(matching_latency_seconds.clone()))
            .expect("register matching_latency_seconds");
        registry
            .register(Box::new(live_connections.clone()))
            .expect("register live_connections");
        registry
            .register(Box::new(realtime_events_dropped_total.clone()))
            .expect("register realtime_events_dropped_total");

        Self {
            registry,
            bookings_created_total,
            assignments_total,
            status_transitions_total,
            rematch_queue_depth,
            matching_latency_seconds,
            live_connections,
            realtime_events_dropped_total,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}
