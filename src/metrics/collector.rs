// src/metrics/collector.rs
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;
use anyhow::Result;

pub struct MetricsRegistry {
    registry: Registry,
    collector: Arc<MetricsCollector>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let collector = Arc::new(MetricsCollector::new(&registry)?);

        Ok(Self {
            registry,
            collector,
        })
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    /// Text exposition of everything registered. Empty if encoding fails.
    pub fn gather(&self) -> Vec<u8> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
            buffer.clear();
        }
        buffer
    }
}

pub struct MetricsCollector {
    // Connection lifecycle
    pub connections_accepted_total: IntCounter,
    pub connections_active: IntGauge,
    pub connections_closed_total: IntCounterVec,

    // Traffic
    pub messages_total: IntCounter,
    pub bytes_received_total: IntCounter,
    pub bytes_sent_total: IntCounter,
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self> {
        let connections_accepted_total = IntCounter::new(
            "echo_connections_accepted_total",
            "Total number of accepted connections",
        )?;
        registry.register(Box::new(connections_accepted_total.clone()))?;

        let connections_active =
            IntGauge::new("echo_connections_active", "Currently open connections")?;
        registry.register(Box::new(connections_active.clone()))?;

        let connections_closed_total = IntCounterVec::new(
            Opts::new(
                "echo_connections_closed_total",
                "Closed connections by reason (peer_closed, error, drained, aborted)",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(connections_closed_total.clone()))?;

        let messages_total =
            IntCounter::new("echo_messages_total", "Total number of echoed messages")?;
        registry.register(Box::new(messages_total.clone()))?;

        let bytes_received_total =
            IntCounter::new("echo_bytes_received_total", "Bytes read from clients")?;
        registry.register(Box::new(bytes_received_total.clone()))?;

        let bytes_sent_total =
            IntCounter::new("echo_bytes_sent_total", "Bytes written to clients")?;
        registry.register(Box::new(bytes_sent_total.clone()))?;

        Ok(Self {
            connections_accepted_total,
            connections_active,
            connections_closed_total,
            messages_total,
            bytes_received_total,
            bytes_sent_total,
        })
    }

    pub fn record_accept(&self) {
        self.connections_accepted_total.inc();
        self.connections_active.inc();
    }

    pub fn record_close(&self, reason: &str) {
        self.connections_active.dec();
        self.connections_closed_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn record_echo(&self, received: usize, sent: usize) {
        self.messages_total.inc();
        self.bytes_received_total.inc_by(received as u64);
        self.bytes_sent_total.inc_by(sent as u64);
    }
}
