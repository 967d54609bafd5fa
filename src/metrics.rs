//! Prometheus metrics, served at `/metrics`.

use anyhow::{Context, Result};
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub messages: IntCounter,
    pub calls: IntCounter,
    pub rejected: IntCounter,
    pub send_failures: IntCounter,
    pub commands: IntCounter,
    pub request_time: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let messages = IntCounter::new("webhook_message_count", "Total number of messages processed")?;
        let calls = IntCounter::new("webhook_call_count", "Total number of calls processed")?;
        let rejected = IntCounter::new(
            "webhook_rejected_count",
            "Webhook requests that failed signature validation",
        )?;
        let send_failures = IntCounter::new(
            "relay_send_failures_total",
            "Outbound Telegram sends that failed",
        )?;
        let commands =
            IntCounter::new("telegram_command_count", "Total number of commands processed")?;
        let request_time = Histogram::with_opts(HistogramOpts::new(
            "webhook_request_processing_seconds",
            "Time spent processing request",
        ))?;

        registry.register(Box::new(messages.clone()))?;
        registry.register(Box::new(calls.clone()))?;
        registry.register(Box::new(rejected.clone()))?;
        registry.register(Box::new(send_failures.clone()))?;
        registry.register(Box::new(commands.clone()))?;
        registry.register(Box::new(request_time.clone()))?;

        Ok(Self {
            registry,
            messages,
            calls,
            rejected,
            send_failures,
            commands,
            request_time,
        })
    }

    /// Encode all metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("Failed to encode metrics")?;
        String::from_utf8(buffer).context("Metrics output was not UTF-8")
    }
}
