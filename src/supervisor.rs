//! Connection supervision: state machine, heartbeat, statistics.
//!
//! A [`ConnectionSupervisor`] is embedded in every driver. It owns the
//! link state, the rolling statistics and the listener registry, and runs
//! the heartbeat/reconnect task while the driver is connected.
//!
//! State machine:
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──ok──▶ Connected
//!                                    │err
//!                                    ▼
//!                                  Error ──auto?──▶ Reconnecting ──ok──▶ Connected
//!                                                          │exhausted
//!                                                          ▼
//!                                                     Disconnected
//! Connected ──disconnect()──▶ Disconnected
//! Connected ──heartbeat_fail──▶ Error
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ProtocolConfig;
use crate::driver::{LinkState, ProtocolDriver, ProtocolStatus};
use crate::error::GatewayError;

/// Sink for connection up/down transitions.
pub trait ConnectionListener: Send + Sync {
    fn on_connection_change(&self, connected: bool);
}

/// Sink for every observed driver error. No duplicate suppression.
pub trait ErrorListener: Send + Sync {
    fn on_error(&self, error: &GatewayError);
}

/// Sink for successful heartbeat probes.
pub trait HeartbeatListener: Send + Sync {
    fn on_heartbeat(&self, at: DateTime<Utc>);
}

/// Listener fan-out. Lists are append-only; registration takes the
/// registry's own lock so live-adds are permitted.
#[derive(Default)]
struct Listeners {
    connection: Mutex<Vec<Arc<dyn ConnectionListener>>>,
    error: Mutex<Vec<Arc<dyn ErrorListener>>>,
    heartbeat: Mutex<Vec<Arc<dyn HeartbeatListener>>>,
}

/// Per-driver supervisor: state, statistics, callbacks, heartbeat.
pub struct ConnectionSupervisor {
    config: ProtocolConfig,
    status: Mutex<ProtocolStatus>,
    listeners: Listeners,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    heartbeat_live: AtomicBool,
}

impl ConnectionSupervisor {
    pub fn new(config: ProtocolConfig) -> Self {
        let status = ProtocolStatus::new(config.protocol_kind);
        ConnectionSupervisor {
            config,
            status: Mutex::new(status),
            listeners: Listeners::default(),
            heartbeat_task: Mutex::new(None),
            heartbeat_live: AtomicBool::new(false),
        }
    }

    /// The driver configuration this supervisor enforces.
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    /// Current state.
    pub fn state(&self) -> LinkState {
        self.status.lock().unwrap().state
    }

    pub fn is_connected(&self) -> bool {
        self.status.lock().unwrap().is_connected
    }

    /// Snapshot of the rolling status.
    pub fn status(&self) -> ProtocolStatus {
        self.status.lock().unwrap().clone()
    }

    /// Enter `Connecting` unless already connected or mid-reconnect.
    ///
    /// Returns `false` when the driver is already connected, which makes
    /// `connect()` on a connected driver a successful no-op.
    pub fn begin_connect(&self) -> bool {
        let mut status = self.status.lock().unwrap();
        match status.state {
            LinkState::Connected => false,
            // A reconnect attempt keeps its state until it succeeds or
            // the retry budget is exhausted.
            LinkState::Reconnecting => true,
            _ => {
                status.state = LinkState::Connecting;
                true
            }
        }
    }

    /// Transition to `Connected`, reset the reconnect counter and notify.
    pub fn mark_connected(&self) {
        {
            let mut status = self.status.lock().unwrap();
            status.state = LinkState::Connected;
            status.is_connected = true;
            status.reconnect_count = 0;
        }
        debug!(protocol = %self.config.protocol_kind, "link connected");
        self.notify_connection(true);
    }

    /// Transition to `Error` (failed connect or heartbeat failure).
    ///
    /// While `Reconnecting`, failures keep the state; only exhaustion of
    /// the retry budget leaves it, via [`mark_retries_exhausted`].
    ///
    /// [`mark_retries_exhausted`]: ConnectionSupervisor::mark_retries_exhausted
    pub fn mark_error(&self) {
        let was_connected;
        {
            let mut status = self.status.lock().unwrap();
            if status.state == LinkState::Reconnecting {
                return;
            }
            was_connected = status.is_connected;
            status.state = LinkState::Error;
            status.is_connected = false;
        }
        if was_connected {
            self.notify_connection(false);
        }
    }

    /// Transition to `Reconnecting` and count the attempt.
    pub fn mark_reconnecting(&self) -> u32 {
        let mut status = self.status.lock().unwrap();
        status.state = LinkState::Reconnecting;
        status.is_connected = false;
        status.reconnect_count += 1;
        status.reconnect_count
    }

    /// Retry budget exhausted: rest at `Disconnected`.
    pub fn mark_retries_exhausted(&self) {
        let mut status = self.status.lock().unwrap();
        status.state = LinkState::Disconnected;
        status.is_connected = false;
    }

    /// Explicit disconnect. Returns whether the driver was connected, so
    /// `disconnect()` on a disconnected driver is a successful no-op.
    pub fn mark_disconnected(&self) -> bool {
        let was_connected;
        {
            let mut status = self.status.lock().unwrap();
            was_connected = status.is_connected;
            status.state = LinkState::Disconnected;
            status.is_connected = false;
        }
        if was_connected {
            self.notify_connection(false);
        }
        was_connected
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    /// Record one completed operation.
    ///
    /// The response-time mean is updated incrementally:
    /// `mean' = mean + (sample − mean) / n` with `n` the total of
    /// success and error counts.
    pub fn record(&self, success: bool, elapsed_ms: f64) {
        let mut status = self.status.lock().unwrap();
        if success {
            status.success_count += 1;
        } else {
            status.error_count += 1;
        }
        let n = (status.success_count + status.error_count) as f64;
        status.response_time_avg_ms += (elapsed_ms - status.response_time_avg_ms) / n;
        status.last_communication = Some(Utc::now());
    }

    /// Record a failure and fan it out to error listeners.
    pub fn record_failure(&self, error: &GatewayError, elapsed_ms: f64) {
        self.record(false, elapsed_ms);
        self.notify_error(error);
    }

    /// Reset counters and the latency mean. Connection state is untouched.
    pub fn reset_statistics(&self) {
        let mut status = self.status.lock().unwrap();
        status.success_count = 0;
        status.error_count = 0;
        status.response_time_avg_ms = 0.0;
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.connection.lock().unwrap().push(listener);
    }

    pub fn add_error_listener(&self, listener: Arc<dyn ErrorListener>) {
        self.listeners.error.lock().unwrap().push(listener);
    }

    pub fn add_heartbeat_listener(&self, listener: Arc<dyn HeartbeatListener>) {
        self.listeners.heartbeat.lock().unwrap().push(listener);
    }

    fn notify_connection(&self, connected: bool) {
        let listeners = self.listeners.connection.lock().unwrap().clone();
        for listener in listeners {
            listener.on_connection_change(connected);
        }
    }

    /// Fan an error out to every registered error listener.
    pub fn notify_error(&self, error: &GatewayError) {
        let listeners = self.listeners.error.lock().unwrap().clone();
        for listener in listeners {
            listener.on_error(error);
        }
    }

    fn notify_heartbeat(&self, at: DateTime<Utc>) {
        let listeners = self.listeners.heartbeat.lock().unwrap().clone();
        for listener in listeners {
            listener.on_heartbeat(at);
        }
    }

    // ------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------

    /// Spawn the heartbeat task for `driver` if one is not already live
    /// and the configured interval is nonzero.
    ///
    /// Drivers call this from `connect()` with a weak handle to
    /// themselves; the task pings through the driver's serializing gate,
    /// so a heartbeat is never interleaved inside another operation.
    pub fn ensure_heartbeat(self: Arc<Self>, driver: Weak<dyn ProtocolDriver>) {
        if self.config.heartbeat_interval_ms == 0 {
            return;
        }
        if self.heartbeat_live.swap(true, Ordering::SeqCst) {
            return;
        }

        let supervisor = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            supervisor.heartbeat_loop(driver).await;
            supervisor.heartbeat_live.store(false, Ordering::SeqCst);
        });
        *self.heartbeat_task.lock().unwrap() = Some(handle);
    }

    /// Abort the heartbeat task, if any. Called from `disconnect()`
    /// before the transport is torn down.
    pub fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat_task.lock().unwrap().take() {
            handle.abort();
        }
        self.heartbeat_live.store(false, Ordering::SeqCst);
    }

    async fn heartbeat_loop(&self, driver: Weak<dyn ProtocolDriver>) {
        let interval = Duration::from_millis(self.config.heartbeat_interval_ms);
        let retry_delay = Duration::from_millis(self.config.retry_delay_ms);

        loop {
            tokio::time::sleep(interval).await;

            if !self.is_connected() {
                return;
            }
            let Some(driver) = driver.upgrade() else {
                return;
            };

            if driver.ping().await {
                let now = Utc::now();
                self.notify_heartbeat(now);
                continue;
            }

            warn!(
                protocol = %self.config.protocol_kind,
                "heartbeat failed, link in error state"
            );
            self.mark_error();
            self.notify_error(&GatewayError::connection("Heartbeat probe failed"));

            if !self.config.auto_reconnect {
                return;
            }

            // Exactly retry_count reconnect attempts, spaced by the retry
            // delay, then rest at Disconnected.
            let mut recovered = false;
            for _attempt in 0..self.config.retry_count {
                tokio::time::sleep(retry_delay).await;
                let attempt = self.mark_reconnecting();
                info!(
                    protocol = %self.config.protocol_kind,
                    attempt,
                    max = self.config.retry_count,
                    "reconnecting"
                );
                match driver.connect().await {
                    Ok(()) => {
                        recovered = true;
                        break;
                    }
                    Err(e) => {
                        self.notify_error(&e);
                    }
                }
            }

            if !recovered {
                warn!(
                    protocol = %self.config.protocol_kind,
                    "reconnect attempts exhausted"
                );
                self.mark_retries_exhausted();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolKind;
    use std::sync::atomic::AtomicU32;

    fn supervisor() -> ConnectionSupervisor {
        ConnectionSupervisor::new(ProtocolConfig::new(ProtocolKind::ModbusTcp, "test"))
    }

    #[test]
    fn test_connect_lifecycle_transitions() {
        let sup = supervisor();
        assert_eq!(sup.state(), LinkState::Disconnected);

        assert!(sup.begin_connect());
        assert_eq!(sup.state(), LinkState::Connecting);

        sup.mark_connected();
        assert_eq!(sup.state(), LinkState::Connected);
        assert!(sup.is_connected());

        // connect() while connected is a no-op
        assert!(!sup.begin_connect());
        assert_eq!(sup.state(), LinkState::Connected);

        assert!(sup.mark_disconnected());
        assert_eq!(sup.state(), LinkState::Disconnected);
        // disconnect() while disconnected is a no-op
        assert!(!sup.mark_disconnected());
    }

    #[test]
    fn test_error_and_reconnect_transitions() {
        let sup = supervisor();
        sup.begin_connect();
        sup.mark_connected();

        // heartbeat failure
        sup.mark_error();
        assert_eq!(sup.state(), LinkState::Error);
        assert!(!sup.is_connected());

        assert_eq!(sup.mark_reconnecting(), 1);
        assert_eq!(sup.state(), LinkState::Reconnecting);
        // failures during reconnect keep the state
        sup.mark_error();
        assert_eq!(sup.state(), LinkState::Reconnecting);
        assert_eq!(sup.mark_reconnecting(), 2);

        sup.mark_connected();
        assert_eq!(sup.state(), LinkState::Connected);
        assert_eq!(sup.status().reconnect_count, 0);
    }

    #[test]
    fn test_retries_exhausted_rests_disconnected() {
        let sup = supervisor();
        sup.begin_connect();
        sup.mark_connected();
        sup.mark_error();
        sup.mark_reconnecting();
        sup.mark_retries_exhausted();
        assert_eq!(sup.state(), LinkState::Disconnected);
    }

    #[test]
    fn test_running_mean() {
        let sup = supervisor();
        let samples = [10.0, 20.0, 30.0, 40.0, 50.0];
        for (i, s) in samples.iter().enumerate() {
            sup.record(i % 2 == 0, *s);
        }
        let status = sup.status();
        assert_eq!(status.success_count + status.error_count, 5);
        let true_mean = samples.iter().sum::<f64>() / samples.len() as f64;
        assert!((status.response_time_avg_ms - true_mean).abs() < 1e-9);
        assert!(status.last_communication.is_some());
    }

    #[test]
    fn test_running_mean_does_not_drift() {
        let sup = supervisor();
        for _ in 0..100_000 {
            sup.record(true, 5.0);
        }
        assert!((sup.status().response_time_avg_ms - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_reset_statistics() {
        let sup = supervisor();
        sup.record(true, 12.0);
        sup.record(false, 8.0);
        sup.reset_statistics();
        let status = sup.status();
        assert_eq!(status.success_count, 0);
        assert_eq!(status.error_count, 0);
        assert_eq!(status.response_time_avg_ms, 0.0);
    }

    struct CountingListener {
        ups: AtomicU32,
        downs: AtomicU32,
    }

    impl ConnectionListener for CountingListener {
        fn on_connection_change(&self, connected: bool) {
            if connected {
                self.ups.fetch_add(1, Ordering::SeqCst);
            } else {
                self.downs.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_connection_listener_fanout() {
        let sup = supervisor();
        let listener = Arc::new(CountingListener {
            ups: AtomicU32::new(0),
            downs: AtomicU32::new(0),
        });
        sup.add_connection_listener(listener.clone());

        sup.begin_connect();
        sup.mark_connected();
        sup.mark_disconnected();
        sup.mark_disconnected(); // no-op, no extra callback

        assert_eq!(listener.ups.load(Ordering::SeqCst), 1);
        assert_eq!(listener.downs.load(Ordering::SeqCst), 1);
    }

    struct CountingErrors(AtomicU32);

    impl ErrorListener for CountingErrors {
        fn on_error(&self, _error: &GatewayError) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_error_listener_fires_per_error() {
        let sup = supervisor();
        let listener = Arc::new(CountingErrors(AtomicU32::new(0)));
        sup.add_error_listener(listener.clone());

        let err = GatewayError::connection("lost");
        sup.record_failure(&err, 3.0);
        sup.record_failure(&err, 3.0);
        assert_eq!(listener.0.load(Ordering::SeqCst), 2);
        assert_eq!(sup.status().error_count, 2);
    }

    // ------------------------------------------------------------------
    // Heartbeat task behavior, exercised through the mock driver
    // ------------------------------------------------------------------

    use crate::driver::mock::MockDriver;
    use crate::driver::ProtocolDriver;

    #[tokio::test]
    async fn test_heartbeat_failure_without_auto_reconnect_rests_in_error() {
        let config = ProtocolConfig::new(ProtocolKind::ModbusTcp, "mock")
            .with_heartbeat_interval_ms(20)
            .with_auto_reconnect(false);
        let driver = MockDriver::with_config(config);
        driver.connect().await.unwrap();

        *driver.fail_ping.lock().unwrap() = true;
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(driver.supervisor().state(), LinkState::Error);
        // Exactly one heartbeat failure, no reconnect attempted.
        assert_eq!(*driver.connect_attempts.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_reconnect_exhausts_retry_budget() {
        let config = ProtocolConfig::new(ProtocolKind::ModbusTcp, "mock")
            .with_heartbeat_interval_ms(20)
            .with_retries(3, 10);
        let driver = MockDriver::with_config(config);
        driver.connect().await.unwrap();

        // Both the probe and the reconnect now fail.
        *driver.fail_ping.lock().unwrap() = true;
        *driver.fail_connect.lock().unwrap() = true;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // One initial connect plus exactly retry_count attempts.
        assert_eq!(*driver.connect_attempts.lock().unwrap(), 4);
        assert_eq!(driver.supervisor().state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_heartbeat_reconnect_recovers_and_resets_counter() {
        let config = ProtocolConfig::new(ProtocolKind::ModbusTcp, "mock")
            .with_heartbeat_interval_ms(20)
            .with_retries(5, 10);
        let driver = MockDriver::with_config(config);
        driver.connect().await.unwrap();

        *driver.fail_ping.lock().unwrap() = true;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The probe recovers; the first reconnect attempt succeeds.
        *driver.fail_ping.lock().unwrap() = false;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(driver.supervisor().state(), LinkState::Connected);
        assert_eq!(driver.status().reconnect_count, 0);
        driver.disconnect().await.unwrap();
    }
}
