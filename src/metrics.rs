//! Minimal metrics emission helpers.
//!
//! Emissions go through a swappable sink; the default forwards to `tracing`
//! under the `metrics` target. Tests install a capturing sink.

use std::sync::{Arc, OnceLock, RwLock};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetricValue {
    Counter(u64),
    Gauge(u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricLabel {
    pub key: &'static str,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricEvent {
    pub name: &'static str,
    pub value: MetricValue,
    pub labels: Vec<MetricLabel>,
}

pub trait MetricSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&self, event: MetricEvent) {
        match event.value {
            MetricValue::Counter(value) | MetricValue::Gauge(value) => {
                tracing::info!(
                    target: "metrics",
                    metric = event.name,
                    value,
                    labels = ?event.labels
                );
            }
        }
    }
}

static METRIC_SINK: OnceLock<RwLock<Arc<dyn MetricSink>>> = OnceLock::new();

fn sink() -> Arc<dyn MetricSink> {
    METRIC_SINK
        .get_or_init(|| RwLock::new(Arc::new(TracingSink)))
        .read()
        .expect("metrics sink lock poisoned")
        .clone()
}

pub fn set_sink(new_sink: Arc<dyn MetricSink>) {
    let lock = METRIC_SINK.get_or_init(|| RwLock::new(Arc::new(TracingSink)));
    *lock.write().expect("metrics sink lock poisoned") = new_sink;
}

fn emit(name: &'static str, value: MetricValue, labels: Vec<MetricLabel>) {
    sink().record(MetricEvent { name, value, labels });
}

fn label(key: &'static str, value: impl Into<String>) -> MetricLabel {
    MetricLabel {
        key,
        value: value.into(),
    }
}

pub fn action_dropped(action: &str) {
    emit(
        "reactor_action_dropped",
        MetricValue::Counter(1),
        vec![label("action", action)],
    );
}

pub fn channel_created() {
    emit("reactor_channel_created", MetricValue::Counter(1), Vec::new());
}

pub fn channel_closed() {
    emit("reactor_channel_closed", MetricValue::Counter(1), Vec::new());
}

pub fn channel_msg_dropped(channel: &str) {
    emit(
        "reactor_channel_msg_dropped",
        MetricValue::Counter(1),
        vec![label("channel", channel)],
    );
}

pub fn channel_batch_abandoned(channel: &str, stage: &'static str) {
    emit(
        "reactor_batch_abandoned",
        MetricValue::Counter(1),
        vec![label("channel", channel), label("stage", stage)],
    );
}

pub fn forward_ok(messages: usize) {
    emit(
        "reactor_forward_ok",
        MetricValue::Counter(messages as u64),
        Vec::new(),
    );
}

pub fn forward_err() {
    emit("reactor_forward_err", MetricValue::Counter(1), Vec::new());
}

pub fn storage_append_ok(messages: usize) {
    emit(
        "reactor_storage_append_ok",
        MetricValue::Counter(messages as u64),
        Vec::new(),
    );
}

pub fn storage_append_err() {
    emit(
        "reactor_storage_append_err",
        MetricValue::Counter(1),
        Vec::new(),
    );
}

pub fn sendack_forwarded(packets: usize) {
    emit(
        "reactor_sendack_forwarded",
        MetricValue::Counter(packets as u64),
        Vec::new(),
    );
}

pub fn election_started(term: u32) {
    emit(
        "consensus_election_started",
        MetricValue::Counter(1),
        vec![label("term", term.to_string())],
    );
}

pub fn leader_elected(term: u32) {
    emit(
        "consensus_leader_elected",
        MetricValue::Counter(1),
        vec![label("term", term.to_string())],
    );
}

pub fn config_committed(version: u64) {
    emit(
        "consensus_config_committed",
        MetricValue::Gauge(version),
        Vec::new(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CaptureSink {
        events: Mutex<Vec<MetricEvent>>,
    }

    impl MetricSink for CaptureSink {
        fn record(&self, event: MetricEvent) {
            self.events.lock().expect("capture lock").push(event);
        }
    }

    #[test]
    fn sink_captures_emissions() {
        let capture = Arc::new(CaptureSink {
            events: Mutex::new(Vec::new()),
        });
        set_sink(capture.clone());
        action_dropped("forward_resp");
        let events = capture.events.lock().expect("capture lock");
        assert!(
            events
                .iter()
                .any(|event| event.name == "reactor_action_dropped")
        );
    }
}
