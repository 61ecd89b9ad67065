//! Prometheus counters for the dispatch engine

use mailcast_common::{Error, Result};
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

/// Engine counters in a dedicated registry
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,
    sends: IntCounterVec,
    transport_attempts: IntCounterVec,
    cycles: IntCounterVec,
    webhook_events: IntCounterVec,
}

impl EngineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("mailcast".to_string()), None)
            .map_err(|e| Error::Internal(e.to_string()))?;

        let sends = IntCounterVec::new(
            Opts::new("sends_total", "Recipients processed by the orchestrator"),
            &["outcome"],
        )
        .map_err(|e| Error::Internal(e.to_string()))?;
        let transport_attempts = IntCounterVec::new(
            Opts::new("transport_attempts_total", "Transport calls by result"),
            &["result"],
        )
        .map_err(|e| Error::Internal(e.to_string()))?;
        let cycles = IntCounterVec::new(
            Opts::new("dispatch_cycles_total", "Dispatch cycles by report"),
            &["report"],
        )
        .map_err(|e| Error::Internal(e.to_string()))?;
        let webhook_events = IntCounterVec::new(
            Opts::new("webhook_events_total", "Provider webhook events by outcome"),
            &["provider", "outcome"],
        )
        .map_err(|e| Error::Internal(e.to_string()))?;

        for collector in [&sends, &transport_attempts, &cycles, &webhook_events] {
            registry
                .register(Box::new(collector.clone()))
                .map_err(|e| Error::Internal(e.to_string()))?;
        }

        Ok(Self {
            registry,
            sends,
            transport_attempts,
            cycles,
            webhook_events,
        })
    }

    /// `outcome` is one of sent, failed, skipped, deferred
    pub fn record_send(&self, outcome: &str) {
        self.sends.with_label_values(&[outcome]).inc();
    }

    pub fn record_transport_attempt(&self, result: &str) {
        self.transport_attempts.with_label_values(&[result]).inc();
    }

    pub fn record_cycle(&self, report: &str) {
        self.cycles.with_label_values(&[report]).inc();
    }

    pub fn record_webhook(&self, provider: &str, outcome: &str) {
        self.webhook_events
            .with_label_values(&[provider, outcome])
            .inc();
    }

    /// Text exposition format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }

    #[cfg(test)]
    pub(crate) fn sends(&self, outcome: &str) -> u64 {
        self.sends.with_label_values(&[outcome]).get()
    }

    #[cfg(test)]
    pub(crate) fn webhook_events(&self, provider: &str, outcome: &str) -> u64 {
        self.webhook_events
            .with_label_values(&[provider, outcome])
            .get()
    }
}
