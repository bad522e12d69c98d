//! Bridges per-instance `activity` notifications into
//! the host observability gauges, independent of the `last_active_at`/
//! `active_connections` bookkeeping the Lifecycle Manager does with the
//! same samples.

use super::MetricsCollector;
use aegis_protocol::ActivityNotification;

/// Feeds [`ActivityNotification`] samples into a [`MetricsCollector`],
/// tagging every metric with the originating instance id.
pub struct ActivityIngest {
    metrics: std::sync::Arc<MetricsCollector>,
}

impl ActivityIngest {
    pub fn new(metrics: std::sync::Arc<MetricsCollector>) -> Self {
        Self { metrics }
    }

    pub fn record(&self, instance_id: &str, sample: &ActivityNotification) {
        let labels = [("instance_id", instance_id)];
        self.metrics
            .set_gauge("aegis_instance_established_conns", sample.conns as f64, &labels);
        self.metrics
            .add_counter("aegis_instance_cpu_ticks_total", sample.cpu_ticks as f64, &labels);
        self.metrics.record_network_io(
            sample.rx_bytes_delta,
            sample.tx_bytes_delta,
            &labels,
        );
    }
}
