/// Fire-and-forget event log of what happened to each workload.
pub trait EventWriter: Send + Sync {
    fn log_event(&self, namespace: &str, name: &str, msg: &str);
}

/// Default sink: a structured tracing event.
pub struct TracingEventWriter;

impl EventWriter for TracingEventWriter {
    fn log_event(&self, namespace: &str, name: &str, msg: &str) {
        tracing::info!(namespace = %namespace, workload = %name, "{}", msg);
    }
}
