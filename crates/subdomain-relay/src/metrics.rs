use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    next_session_id: AtomicU64,

    // Sessions
    sessions_active: AtomicU64,
    sessions_total: AtomicU64,
    rejected_hosts_total: AtomicU64,
    idle_timeouts_total: AtomicU64,
    bridge_errors_total: AtomicU64,

    // Backend connects
    connect_attempts_total: AtomicU64,
    connect_timeout_total: AtomicU64,
    connect_fail_total: AtomicU64,

    // Traffic
    bytes_client_to_target_total: AtomicU64,
    bytes_target_to_client_total: AtomicU64,
    messages_client_to_target_total: AtomicU64,
    messages_target_to_client_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_session_id(&self) -> u64 {
        self.inner.next_session_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn session_opened(&self) {
        self.inner.sessions_total.fetch_add(1, Ordering::Relaxed);
        self.inner.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.inner.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn host_rejected(&self) {
        self.inner
            .rejected_hosts_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn idle_timeout(&self) {
        self.inner
            .idle_timeouts_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn bridge_error(&self) {
        self.inner
            .bridge_errors_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn connect_attempt(&self) {
        self.inner
            .connect_attempts_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn connect_timed_out(&self) {
        self.inner
            .connect_timeout_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn connect_failed(&self) {
        self.inner
            .connect_fail_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_to_target(&self, bytes: usize) {
        self.inner
            .messages_client_to_target_total
            .fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_client_to_target_total
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn target_to_client(&self, bytes: usize) {
        self.inner
            .messages_target_to_client_total
            .fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_target_to_client_total
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let inner = &*self.inner;

        let mut out = String::new();

        push_gauge(&mut out, "relay_sessions_active", load(&inner.sessions_active));
        push_counter(&mut out, "relay_sessions_total", load(&inner.sessions_total));
        push_counter(
            &mut out,
            "relay_rejected_hosts_total",
            load(&inner.rejected_hosts_total),
        );
        push_counter(
            &mut out,
            "relay_idle_timeouts_total",
            load(&inner.idle_timeouts_total),
        );
        push_counter(
            &mut out,
            "relay_bridge_errors_total",
            load(&inner.bridge_errors_total),
        );

        push_counter(
            &mut out,
            "relay_connect_attempts_total",
            load(&inner.connect_attempts_total),
        );
        push_counter(
            &mut out,
            "relay_connect_timeout_total",
            load(&inner.connect_timeout_total),
        );
        push_counter(
            &mut out,
            "relay_connect_fail_total",
            load(&inner.connect_fail_total),
        );

        push_counter(
            &mut out,
            "relay_bytes_client_to_target_total",
            load(&inner.bytes_client_to_target_total),
        );
        push_counter(
            &mut out,
            "relay_bytes_target_to_client_total",
            load(&inner.bytes_target_to_client_total),
        );
        push_counter(
            &mut out,
            "relay_messages_client_to_target_total",
            load(&inner.messages_client_to_target_total),
        );
        push_counter(
            &mut out,
            "relay_messages_target_to_client_total",
            load(&inner.messages_target_to_client_total),
        );

        out
    }
}

fn push_gauge(out: &mut String, name: &str, val: u64) {
    push_metric(out, name, "gauge", val);
}

fn push_counter(out: &mut String, name: &str, val: u64) {
    push_metric(out, name, "counter", val);
}

fn push_metric(out: &mut String, name: &str, kind: &str, val: u64) {
    out.push_str("# TYPE ");
    out.push_str(name);
    out.push(' ');
    out.push_str(kind);
    out.push('\n');
    out.push_str(name);
    out.push(' ');
    out.push_str(&val.to_string());
    out.push('\n');
}
