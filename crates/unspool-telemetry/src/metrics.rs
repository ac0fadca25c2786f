//! Prometheus-backed metrics registry and snapshot helpers.
//!
//! # Design
//! - Encapsulates collector registration to keep the public API small.
//! - Exposes the counters the status line and an exporter need.

use std::sync::Arc;

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use serde::Serialize;

use crate::error::{Result, TelemetryError};

const OK: &str = "ok";
const FAILED: &str = "failed";

/// Prometheus-backed metrics registry shared across tasks.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    items_finished_total: IntCounter,
    items_retried_total: IntCounter,
    events_dropped_total: IntCounter,
    extractions_total: IntCounterVec,
    hook_deliveries_total: IntCounterVec,
    queue_polls_total: IntCounterVec,
    ledger_items: IntGaugeVec,
    watched_folders: IntGauge,
}

/// Kind of notification hook, used as a metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// HTTP webhook.
    Webhook,
    /// Local command.
    Command,
}

impl HookKind {
    const fn label(self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Command => "cmdhook",
        }
    }
}

/// Snapshot of the counters reported on the status line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Items reclaimed after their deletion phase.
    pub finished: u64,
    /// Automatic re-extraction attempts.
    pub retried: u64,
    /// Successful extractions.
    pub extractions_ok: u64,
    /// Failed extractions.
    pub extractions_failed: u64,
    /// Successful webhook deliveries.
    pub webhooks_ok: u64,
    /// Failed webhook deliveries.
    pub webhooks_failed: u64,
    /// Successful command hook runs.
    pub cmdhooks_ok: u64,
    /// Failed command hook runs.
    pub cmdhooks_failed: u64,
    /// Events a slow subscriber skipped.
    pub events_dropped: u64,
    /// Folders currently tracked by the watcher.
    pub watched_folders: i64,
}

impl Metrics {
    /// Construct a new metrics registry with the standard collectors registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the Prometheus collectors cannot be
    /// registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let items_finished_total = IntCounter::with_opts(Opts::new(
            "items_finished_total",
            "Items reclaimed after their deletion phase",
        ))
        .map_err(TelemetryError::register("items_finished_total"))?;
        let items_retried_total = IntCounter::with_opts(Opts::new(
            "items_retried_total",
            "Automatic re-extraction attempts",
        ))
        .map_err(TelemetryError::register("items_retried_total"))?;
        let events_dropped_total = IntCounter::with_opts(Opts::new(
            "events_dropped_total",
            "Events skipped by subscribers that fell behind",
        ))
        .map_err(TelemetryError::register("events_dropped_total"))?;
        let extractions_total = IntCounterVec::new(
            Opts::new("extractions_total", "Finished extractions by result"),
            &["result"],
        )
        .map_err(TelemetryError::register("extractions_total"))?;
        let hook_deliveries_total = IntCounterVec::new(
            Opts::new(
                "hook_deliveries_total",
                "Notification hook deliveries by kind and result",
            ),
            &["kind", "result"],
        )
        .map_err(TelemetryError::register("hook_deliveries_total"))?;
        let queue_polls_total = IntCounterVec::new(
            Opts::new("queue_polls_total", "Upstream queue polls by source and result"),
            &["source", "result"],
        )
        .map_err(TelemetryError::register("queue_polls_total"))?;
        let ledger_items = IntGaugeVec::new(
            Opts::new("ledger_items", "Tracked items by lifecycle status"),
            &["status"],
        )
        .map_err(TelemetryError::register("ledger_items"))?;
        let watched_folders = IntGauge::with_opts(Opts::new(
            "watched_folders",
            "Folders currently tracked by the watcher",
        ))
        .map_err(TelemetryError::register("watched_folders"))?;

        registry
            .register(Box::new(items_finished_total.clone()))
            .map_err(TelemetryError::register("items_finished_total"))?;
        registry
            .register(Box::new(items_retried_total.clone()))
            .map_err(TelemetryError::register("items_retried_total"))?;
        registry
            .register(Box::new(events_dropped_total.clone()))
            .map_err(TelemetryError::register("events_dropped_total"))?;
        registry
            .register(Box::new(extractions_total.clone()))
            .map_err(TelemetryError::register("extractions_total"))?;
        registry
            .register(Box::new(hook_deliveries_total.clone()))
            .map_err(TelemetryError::register("hook_deliveries_total"))?;
        registry
            .register(Box::new(queue_polls_total.clone()))
            .map_err(TelemetryError::register("queue_polls_total"))?;
        registry
            .register(Box::new(ledger_items.clone()))
            .map_err(TelemetryError::register("ledger_items"))?;
        registry
            .register(Box::new(watched_folders.clone()))
            .map_err(TelemetryError::register("watched_folders"))?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                items_finished_total,
                items_retried_total,
                events_dropped_total,
                extractions_total,
                hook_deliveries_total,
                queue_polls_total,
                ledger_items,
                watched_folders,
            }),
        })
    }

    /// Count an item reclaimed after its deletion phase.
    pub fn inc_finished(&self) {
        self.inner.items_finished_total.inc();
    }

    /// Count an automatic re-extraction attempt.
    pub fn inc_retried(&self) {
        self.inner.items_retried_total.inc();
    }

    /// Add `count` events skipped by a lagging subscriber.
    pub fn add_events_dropped(&self, count: u64) {
        self.inner.events_dropped_total.inc_by(count);
    }

    /// Count a finished extraction.
    pub fn inc_extraction(&self, succeeded: bool) {
        self.inner
            .extractions_total
            .with_label_values(&[result_label(succeeded)])
            .inc();
    }

    /// Count a hook delivery attempt that reached a final result.
    pub fn inc_hook_delivery(&self, kind: HookKind, succeeded: bool) {
        self.inner
            .hook_deliveries_total
            .with_label_values(&[kind.label(), result_label(succeeded)])
            .inc();
    }

    /// Count an upstream queue poll.
    pub fn inc_queue_poll(&self, source: &str, succeeded: bool) {
        self.inner
            .queue_polls_total
            .with_label_values(&[source, result_label(succeeded)])
            .inc();
    }

    /// Set the number of ledger items in `status`.
    pub fn set_ledger_items(&self, status: &str, count: usize) {
        self.inner
            .ledger_items
            .with_label_values(&[status])
            .set(saturating_i64(count));
    }

    /// Set the number of tracked folders.
    pub fn set_watched_folders(&self, count: usize) {
        self.inner.watched_folders.set(saturating_i64(count));
    }

    /// Render the metrics registry using the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be encoded or if the encoded
    /// buffer is not valid UTF-8.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|source| TelemetryError::MetricsEncode { source })?;
        String::from_utf8(buffer).map_err(|source| TelemetryError::MetricsUtf8 { source })
    }

    /// Take a point-in-time snapshot of the status-line counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        let hooks = |kind: HookKind, succeeded: bool| {
            inner
                .hook_deliveries_total
                .with_label_values(&[kind.label(), result_label(succeeded)])
                .get()
        };
        MetricsSnapshot {
            finished: inner.items_finished_total.get(),
            retried: inner.items_retried_total.get(),
            extractions_ok: inner.extractions_total.with_label_values(&[OK]).get(),
            extractions_failed: inner.extractions_total.with_label_values(&[FAILED]).get(),
            webhooks_ok: hooks(HookKind::Webhook, true),
            webhooks_failed: hooks(HookKind::Webhook, false),
            cmdhooks_ok: hooks(HookKind::Command, true),
            cmdhooks_failed: hooks(HookKind::Command, false),
            events_dropped: inner.events_dropped_total.get(),
            watched_folders: inner.watched_folders.get(),
        }
    }
}

const fn result_label(succeeded: bool) -> &'static str {
    if succeeded { OK } else { FAILED }
}

fn saturating_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
