//! VFD control facade.
//!
//! Projects a canonical start/stop/frequency/speed interface over a
//! register-map table so dissimilar drives behave alike. A background
//! monitor polls the feedback registers once a second, decodes the
//! status word and fans out status-change and fault callbacks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::driver::{ProtocolDriver, ReadRequest, WriteRequest};
use crate::error::{GatewayError, GatewayResult};
use crate::value::{DataType, PlcValue};

/// Drive status decoded from the status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfdStatus {
    Stopped,
    Running,
    Accelerating,
    Decelerating,
    Fault,
    Warning,
    Ready,
    Unknown,
}

/// Status word bit assignments.
const BIT_RUNNING: u16 = 1 << 0;
const BIT_ACCELERATING: u16 = 1 << 1;
const BIT_DECELERATING: u16 = 1 << 2;
const BIT_READY: u16 = 1 << 3;
const BIT_WARNING: u16 = 1 << 14;
const BIT_FAULT: u16 = 1 << 15;

/// Decode the status word. Priority: Fault > Warning > Running >
/// Accelerating > Decelerating > Ready > Stopped.
pub fn decode_status(word: u16) -> VfdStatus {
    if word & BIT_FAULT != 0 {
        VfdStatus::Fault
    } else if word & BIT_WARNING != 0 {
        VfdStatus::Warning
    } else if word & BIT_RUNNING != 0 {
        VfdStatus::Running
    } else if word & BIT_ACCELERATING != 0 {
        VfdStatus::Accelerating
    } else if word & BIT_DECELERATING != 0 {
        VfdStatus::Decelerating
    } else if word & BIT_READY != 0 {
        VfdStatus::Ready
    } else {
        VfdStatus::Stopped
    }
}

/// Register layout of a drive: each logical name maps to an address and
/// a data type. The default is the generic layout; manufacturers
/// override individual registers as needed.
#[derive(Debug, Clone)]
pub struct VfdRegisterMap {
    pub start_command: u16,
    pub stop_command: u16,
    pub fault_reset: u16,
    pub frequency_setpoint: u16,
    pub speed_setpoint: u16,
    pub torque_setpoint: u16,
    pub output_frequency: u16,
    pub output_speed: u16,
    pub output_current: u16,
    pub output_voltage: u16,
    pub output_power: u16,
    pub output_torque: u16,
    pub status: u16,
    pub fault_code: u16,
    pub warning_code: u16,
    pub motor_temperature: u16,
    pub drive_temperature: u16,
}

impl Default for VfdRegisterMap {
    fn default() -> Self {
        VfdRegisterMap {
            start_command: 0x0001,
            stop_command: 0x0002,
            frequency_setpoint: 0x2000,
            speed_setpoint: 0x2001,
            torque_setpoint: 0x2002,
            output_frequency: 0x2100,
            output_speed: 0x2101,
            output_current: 0x2102,
            output_voltage: 0x2103,
            output_power: 0x2104,
            output_torque: 0x2105,
            status: 0x2200,
            fault_code: 0x2201,
            warning_code: 0x2202,
            motor_temperature: 0x2300,
            drive_temperature: 0x2301,
            fault_reset: 0x2400,
        }
    }
}

/// Drive identity and limits.
#[derive(Debug, Clone)]
pub struct VfdConfig {
    pub id: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub power_rating_kw: f64,
    pub max_frequency_hz: f64,
    pub max_speed_rpm: f64,
    pub enabled: bool,
}

impl VfdConfig {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        VfdConfig {
            name: id.clone(),
            id,
            manufacturer: "Unknown".to_string(),
            model: "Unknown".to_string(),
            power_rating_kw: 0.0,
            max_frequency_hz: 60.0,
            max_speed_rpm: 1750.0,
            enabled: true,
        }
    }
}

/// Live parameter image of the drive.
#[derive(Debug, Clone)]
pub struct VfdParameters {
    pub frequency_setpoint: f64,
    pub speed_setpoint: f64,
    pub torque_setpoint: f64,
    pub output_frequency: f64,
    pub output_speed: f64,
    pub output_current: f64,
    pub output_voltage: f64,
    pub output_power: f64,
    pub output_torque: f64,
    pub status: VfdStatus,
    pub running: bool,
    pub fault_code: u16,
    pub warning_code: u16,
    pub motor_temperature: f64,
    pub drive_temperature: f64,
    pub last_update: Option<DateTime<Utc>>,
}

impl Default for VfdParameters {
    fn default() -> Self {
        VfdParameters {
            frequency_setpoint: 0.0,
            speed_setpoint: 0.0,
            torque_setpoint: 0.0,
            output_frequency: 0.0,
            output_speed: 0.0,
            output_current: 0.0,
            output_voltage: 0.0,
            output_power: 0.0,
            output_torque: 0.0,
            status: VfdStatus::Unknown,
            running: false,
            fault_code: 0,
            warning_code: 0,
            motor_temperature: 0.0,
            drive_temperature: 0.0,
            last_update: None,
        }
    }
}

/// Sink for drive state transitions and faults.
pub trait VfdListener: Send + Sync {
    /// Fired when the decoded status or the running flag changes.
    fn on_status_change(&self, new: VfdStatus, old: VfdStatus);
    /// Fired each monitor interval while `fault_code != 0`.
    fn on_fault(&self, fault_code: u16);
}

/// Default monitor cadence.
const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Unified control interface over one drive.
pub struct VfdController {
    config: VfdConfig,
    driver: Arc<dyn ProtocolDriver>,
    map: VfdRegisterMap,
    parameters: Mutex<VfdParameters>,
    listeners: Mutex<Vec<Arc<dyn VfdListener>>>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
    monitoring: AtomicBool,
    monitor_interval: Mutex<Duration>,
    self_ref: std::sync::Weak<VfdController>,
}

impl VfdController {
    pub fn new(config: VfdConfig, driver: Arc<dyn ProtocolDriver>) -> Arc<Self> {
        Self::with_register_map(config, driver, VfdRegisterMap::default())
    }

    /// Build a controller with its own driver from a protocol
    /// configuration (typically Modbus or Ethernet/IP).
    pub fn from_protocol_config(
        config: VfdConfig,
        protocol: crate::config::ProtocolConfig,
    ) -> GatewayResult<Arc<Self>> {
        let driver = crate::network::driver_for_protocol(protocol)?;
        Ok(Self::new(config, driver))
    }

    /// Build with a manufacturer-specific register layout.
    pub fn with_register_map(
        config: VfdConfig,
        driver: Arc<dyn ProtocolDriver>,
        map: VfdRegisterMap,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| VfdController {
            config,
            driver,
            map,
            parameters: Mutex::new(VfdParameters::default()),
            listeners: Mutex::new(Vec::new()),
            monitor_task: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            monitoring: AtomicBool::new(false),
            monitor_interval: Mutex::new(MONITOR_INTERVAL),
            self_ref: weak.clone(),
        })
    }

    /// Test hook: shorten the monitor cadence.
    #[cfg(test)]
    fn set_monitor_interval(&self, interval: Duration) {
        *self.monitor_interval.lock().unwrap() = interval;
    }

    pub fn config(&self) -> &VfdConfig {
        &self.config
    }

    pub fn add_listener(&self, listener: Arc<dyn VfdListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Snapshot of the last-read parameters.
    pub fn parameters(&self) -> VfdParameters {
        self.parameters.lock().unwrap().clone()
    }

    /// Connect the underlying driver and start the monitor.
    pub async fn connect(&self) -> GatewayResult<()> {
        self.driver.connect().await?;
        info!(vfd = %self.config.id, "VFD connected");
        self.start_monitoring();
        Ok(())
    }

    /// Stop the monitor, then disconnect the driver.
    pub async fn disconnect(&self) -> GatewayResult<()> {
        self.stop_monitoring();
        self.driver.disconnect().await?;
        info!(vfd = %self.config.id, "VFD disconnected");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Control operations
    // ------------------------------------------------------------------

    async fn write_command(&self, register: u16, value: u16) -> GatewayResult<()> {
        let request = WriteRequest::new(register.to_string(), value, DataType::UInt16);
        self.driver.write(&request).await
    }

    async fn write_setpoint(&self, register: u16, value: f64) -> GatewayResult<()> {
        let request = WriteRequest::new(register.to_string(), value, DataType::Float32);
        self.driver.write(&request).await
    }

    /// Write `1` to the start command register.
    pub async fn start_drive(&self) -> GatewayResult<()> {
        self.write_command(self.map.start_command, 1).await?;
        info!(vfd = %self.config.id, "drive started");
        Ok(())
    }

    /// Write `1` to the stop command register.
    pub async fn stop_drive(&self) -> GatewayResult<()> {
        self.write_command(self.map.stop_command, 1).await?;
        info!(vfd = %self.config.id, "drive stopped");
        Ok(())
    }

    /// Write `1` to the fault reset register.
    pub async fn reset_fault(&self) -> GatewayResult<()> {
        self.write_command(self.map.fault_reset, 1).await?;
        info!(vfd = %self.config.id, "fault reset issued");
        Ok(())
    }

    /// Set the frequency setpoint. Bounded by `max_frequency_hz`.
    pub async fn set_frequency(&self, hz: f64) -> GatewayResult<()> {
        if !(0.0..=self.config.max_frequency_hz).contains(&hz) {
            return Err(GatewayError::data(format!(
                "Frequency {} Hz outside 0..={} Hz",
                hz, self.config.max_frequency_hz
            )));
        }
        self.write_setpoint(self.map.frequency_setpoint, hz).await?;
        self.parameters.lock().unwrap().frequency_setpoint = hz;
        debug!(vfd = %self.config.id, hz, "frequency setpoint written");
        Ok(())
    }

    /// Set the speed setpoint. Bounded by `max_speed_rpm`.
    pub async fn set_speed(&self, rpm: f64) -> GatewayResult<()> {
        if !(0.0..=self.config.max_speed_rpm).contains(&rpm) {
            return Err(GatewayError::data(format!(
                "Speed {} RPM outside 0..={} RPM",
                rpm, self.config.max_speed_rpm
            )));
        }
        self.write_setpoint(self.map.speed_setpoint, rpm).await?;
        self.parameters.lock().unwrap().speed_setpoint = rpm;
        debug!(vfd = %self.config.id, rpm, "speed setpoint written");
        Ok(())
    }

    /// Set the torque setpoint. No hard bound at this layer.
    pub async fn set_torque(&self, nm: f64) -> GatewayResult<()> {
        self.write_setpoint(self.map.torque_setpoint, nm).await?;
        self.parameters.lock().unwrap().torque_setpoint = nm;
        debug!(vfd = %self.config.id, nm, "torque setpoint written");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Feedback
    // ------------------------------------------------------------------

    /// Read every feedback register in one batched fan-out. A register
    /// that fails to read keeps its previous value; the failure is
    /// already recorded at the driver.
    pub async fn read_parameters(&self) -> VfdParameters {
        let map = &self.map;
        let requests = vec![
            ReadRequest::new(map.output_frequency.to_string(), 1, DataType::Float32),
            ReadRequest::new(map.output_speed.to_string(), 1, DataType::Float32),
            ReadRequest::new(map.output_current.to_string(), 1, DataType::Float32),
            ReadRequest::new(map.output_voltage.to_string(), 1, DataType::Float32),
            ReadRequest::new(map.output_power.to_string(), 1, DataType::Float32),
            ReadRequest::new(map.output_torque.to_string(), 1, DataType::Float32),
            ReadRequest::new(map.status.to_string(), 1, DataType::UInt16),
            ReadRequest::new(map.fault_code.to_string(), 1, DataType::UInt16),
            ReadRequest::new(map.warning_code.to_string(), 1, DataType::UInt16),
            ReadRequest::new(map.motor_temperature.to_string(), 1, DataType::Float32),
            ReadRequest::new(map.drive_temperature.to_string(), 1, DataType::Float32),
        ];

        let results = self.driver.read_many(&requests).await;

        let float_at = |index: usize| -> Option<f64> {
            results.get(index).and_then(|r| match r {
                Ok(values) => values.first().map(|v| v.as_f64()),
                Err(_) => None,
            })
        };
        let word_at = |index: usize| -> Option<u16> {
            results.get(index).and_then(|r| match r {
                Ok(values) => values.first().map(|v| v.as_u64() as u16),
                Err(_) => None,
            })
        };

        let mut parameters = self.parameters.lock().unwrap();
        if let Some(v) = float_at(0) {
            parameters.output_frequency = v;
        }
        if let Some(v) = float_at(1) {
            parameters.output_speed = v;
        }
        if let Some(v) = float_at(2) {
            parameters.output_current = v;
        }
        if let Some(v) = float_at(3) {
            parameters.output_voltage = v;
        }
        if let Some(v) = float_at(4) {
            parameters.output_power = v;
        }
        if let Some(v) = float_at(5) {
            parameters.output_torque = v;
        }
        if let Some(word) = word_at(6) {
            parameters.status = decode_status(word);
            parameters.running = word & BIT_RUNNING != 0;
        }
        if let Some(v) = word_at(7) {
            parameters.fault_code = v;
        }
        if let Some(v) = word_at(8) {
            parameters.warning_code = v;
        }
        if let Some(v) = float_at(9) {
            parameters.motor_temperature = v;
        }
        if let Some(v) = float_at(10) {
            parameters.drive_temperature = v;
        }
        parameters.last_update = Some(Utc::now());
        parameters.clone()
    }

    // ------------------------------------------------------------------
    // Monitor
    // ------------------------------------------------------------------

    /// Start the background monitor if it is not already running.
    pub fn start_monitoring(&self) {
        if self.monitoring.swap(true, Ordering::SeqCst) {
            return;
        }
        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap() = cancel.clone();

        let controller = self.self_ref.clone();
        let handle = tokio::spawn(async move {
            if let Some(controller) = controller.upgrade() {
                controller.monitor_loop(cancel).await;
            }
        });
        *self.monitor_task.lock().unwrap() = Some(handle);
        debug!(vfd = %self.config.id, "monitor started");
    }

    /// Stop the background monitor.
    pub fn stop_monitoring(&self) {
        if !self.monitoring.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancel.lock().unwrap().cancel();
        if let Some(handle) = self.monitor_task.lock().unwrap().take() {
            handle.abort();
        }
        debug!(vfd = %self.config.id, "monitor stopped");
    }

    async fn monitor_loop(&self, cancel: CancellationToken) {
        loop {
            let interval = *self.monitor_interval.lock().unwrap();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let (old_status, old_running) = {
                let parameters = self.parameters.lock().unwrap();
                (parameters.status, parameters.running)
            };

            let current = self.read_parameters().await;

            if current.status != old_status || current.running != old_running {
                self.notify_status_change(current.status, old_status);
            }
            if current.fault_code != 0 {
                error!(
                    vfd = %self.config.id,
                    fault = current.fault_code,
                    "drive reports fault"
                );
                self.notify_fault(current.fault_code);
            }
        }
    }

    fn notify_status_change(&self, new: VfdStatus, old: VfdStatus) {
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.on_status_change(new, old);
        }
    }

    fn notify_fault(&self, fault_code: u16) {
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.on_fault(fault_code);
        }
    }
}

impl Drop for VfdController {
    fn drop(&mut self) {
        if let Some(handle) = self.monitor_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockDriver;
    use std::sync::atomic::AtomicU32;

    fn controller(driver: Arc<MockDriver>) -> Arc<VfdController> {
        VfdController::new(VfdConfig::new("vfd1"), driver)
    }

    #[test]
    fn test_decode_status_priority() {
        assert_eq!(decode_status(0x0000), VfdStatus::Stopped);
        assert_eq!(decode_status(0x0001), VfdStatus::Running);
        assert_eq!(decode_status(0x0002), VfdStatus::Accelerating);
        assert_eq!(decode_status(0x0004), VfdStatus::Decelerating);
        assert_eq!(decode_status(0x0008), VfdStatus::Ready);
        assert_eq!(decode_status(0x4000), VfdStatus::Warning);
        assert_eq!(decode_status(0x8000), VfdStatus::Fault);
        // Fault beats everything else.
        assert_eq!(decode_status(0x8001), VfdStatus::Fault);
        assert_eq!(decode_status(0xC00F), VfdStatus::Fault);
        // Warning beats running.
        assert_eq!(decode_status(0x4001), VfdStatus::Warning);
        // Running beats acceleration.
        assert_eq!(decode_status(0x0003), VfdStatus::Running);
    }

    #[tokio::test]
    async fn test_start_stop_write_one() {
        let driver = MockDriver::new();
        driver.connect().await.unwrap();
        let vfd = controller(driver.clone());

        vfd.start_drive().await.unwrap();
        assert_eq!(driver.cell("1"), Some(PlcValue::UInt(1)));

        vfd.stop_drive().await.unwrap();
        assert_eq!(driver.cell("2"), Some(PlcValue::UInt(1)));

        vfd.reset_fault().await.unwrap();
        assert_eq!(driver.cell(&0x2400u16.to_string()), Some(PlcValue::UInt(1)));
    }

    #[tokio::test]
    async fn test_set_frequency_validation() {
        let driver = MockDriver::new();
        driver.connect().await.unwrap();
        let vfd = controller(driver.clone());

        assert!(vfd.set_frequency(-1.0).await.is_err());
        assert!(vfd.set_frequency(60.1).await.is_err());
        vfd.set_frequency(50.0).await.unwrap();
        assert_eq!(
            driver.cell(&0x2000u16.to_string()),
            Some(PlcValue::Float(50.0))
        );
        assert_eq!(vfd.parameters().frequency_setpoint, 50.0);
    }

    #[tokio::test]
    async fn test_set_torque_unbounded() {
        let driver = MockDriver::new();
        driver.connect().await.unwrap();
        let vfd = controller(driver.clone());
        vfd.set_torque(5000.0).await.unwrap();
        assert_eq!(vfd.parameters().torque_setpoint, 5000.0);
    }

    #[tokio::test]
    async fn test_read_parameters_partial_failure_retains_previous() {
        let driver = MockDriver::new();
        driver.connect().await.unwrap();
        let vfd = controller(driver.clone());

        driver.set_cell(&0x2100u16.to_string(), PlcValue::Float(47.5));
        driver.set_cell(&0x2200u16.to_string(), PlcValue::UInt(0x0001));
        let parameters = vfd.read_parameters().await;
        assert_eq!(parameters.output_frequency, 47.5);
        assert_eq!(parameters.status, VfdStatus::Running);
        assert!(parameters.running);
        assert!(parameters.last_update.is_some());

        // Next poll: the frequency read fails, the field keeps 47.5.
        driver.push_read_fault(GatewayError::timeout("read", 100));
        let parameters = vfd.read_parameters().await;
        assert_eq!(parameters.output_frequency, 47.5);
    }

    struct RecordingListener {
        changes: Mutex<Vec<(VfdStatus, VfdStatus)>>,
        faults: Mutex<Vec<u16>>,
        fault_count: AtomicU32,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(RecordingListener {
                changes: Mutex::new(Vec::new()),
                faults: Mutex::new(Vec::new()),
                fault_count: AtomicU32::new(0),
            })
        }
    }

    impl VfdListener for RecordingListener {
        fn on_status_change(&self, new: VfdStatus, old: VfdStatus) {
            self.changes.lock().unwrap().push((new, old));
        }
        fn on_fault(&self, fault_code: u16) {
            self.faults.lock().unwrap().push(fault_code);
            self.fault_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_monitor_detects_fault_transition() {
        let driver = MockDriver::new();
        driver.connect().await.unwrap();

        // Drive is running, no fault.
        driver.set_cell(&0x2200u16.to_string(), PlcValue::UInt(0x0001));
        driver.set_cell(&0x2201u16.to_string(), PlcValue::UInt(0));

        let vfd = controller(driver.clone());
        vfd.set_monitor_interval(Duration::from_millis(20));
        let listener = RecordingListener::new();
        vfd.add_listener(listener.clone());

        vfd.start_monitoring();
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Fault hits: status word 0x8000, fault code 17.
        driver.set_cell(&0x2200u16.to_string(), PlcValue::UInt(0x8000));
        driver.set_cell(&0x2201u16.to_string(), PlcValue::UInt(17));
        tokio::time::sleep(Duration::from_millis(40)).await;
        vfd.stop_monitoring();

        let changes = listener.changes.lock().unwrap().clone();
        assert!(
            changes.contains(&(VfdStatus::Fault, VfdStatus::Running)),
            "expected Running→Fault transition, saw {:?}",
            changes
        );
        let faults = listener.faults.lock().unwrap().clone();
        assert!(faults.contains(&17));
    }

    #[tokio::test]
    async fn test_monitor_stops_cleanly() {
        let driver = MockDriver::new();
        driver.connect().await.unwrap();
        let vfd = controller(driver.clone());
        vfd.set_monitor_interval(Duration::from_millis(10));
        let listener = RecordingListener::new();
        vfd.add_listener(listener.clone());

        vfd.start_monitoring();
        tokio::time::sleep(Duration::from_millis(40)).await;
        vfd.stop_monitoring();

        let faults_at_stop = listener.fault_count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(
            listener.fault_count.load(Ordering::SeqCst),
            faults_at_stop,
            "no callbacks after stop"
        );
    }
}
