//! Simulated Bench
//!
//! Stand-ins for the power supply and the device-control channel so the
//! engine can run end to end without hardware. The simulated DAQ lives in
//! `acquisition::synthetic` because it doubles as the pipeline's fallback.
//!
//! # Available Mocks
//!
//! - `SimulatedPowerSupply` - programmable supply with read-back
//! - `SimulatedHandset` - device-control channel tracking screen, radios and apps
//!
//! Both support failure injection so fault policies can be exercised:
//! operations can be made to fail (`false`), to panic, or the whole port can
//! be reported disconnected.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::debug;

use crate::error::{HarnessError, HarnessResult, Port};
use crate::hardware::capabilities::{
    DeviceCheck, DeviceControl, PowerControl, SettingsReport, WifiNetwork,
};

/// Settings applied by `apply_default_settings` on the simulated handset.
pub const DEFAULT_SETTINGS: [&str; 10] = [
    "screen_off_timeout",
    "brightness",
    "auto_brightness",
    "volume",
    "bluetooth_off",
    "wifi_off",
    "auto_sync_off",
    "location_off",
    "always_on_display_off",
    "haptics_off",
];

/// Timing behaviour of simulated devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MockMode {
    /// Zero delays, deterministic - for unit tests
    #[default]
    Instant,
    /// Hardware-like command latency and paced acquisition - for bench demos
    Realistic,
}

impl MockMode {
    /// Latency added to every simulated command.
    pub fn command_latency(&self) -> Duration {
        match self {
            MockMode::Instant => Duration::ZERO,
            MockMode::Realistic => Duration::from_millis(40),
        }
    }

    async fn delay(&self) {
        let latency = self.command_latency();
        if !latency.is_zero() {
            sleep(latency).await;
        }
    }
}

/// Per-operation failure injection
///
/// Clones share their call counters.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Operation -> calls that succeed before it starts failing
    failing: HashMap<&'static str, usize>,
    panicking: HashSet<&'static str>,
    issued: Arc<Mutex<HashMap<&'static str, usize>>>,
}

impl FaultPlan {
    /// No injected faults.
    pub fn none() -> Self {
        Self::default()
    }

    /// Make `operation` report failure.
    pub fn fail(self, operation: &'static str) -> Self {
        self.fail_after(operation, 0)
    }

    /// Let `operation` succeed `successes` times, then report failure.
    pub fn fail_after(mut self, operation: &'static str, successes: usize) -> Self {
        self.failing.insert(operation, successes);
        self
    }

    /// Make `operation` panic.
    pub fn panic(mut self, operation: &'static str) -> Self {
        self.panicking.insert(operation);
        self
    }

    fn fails(&self, operation: &'static str) -> bool {
        let Some(&successes) = self.failing.get(operation) else {
            return false;
        };
        let mut issued = self.issued.lock();
        let count = issued.entry(operation).or_insert(0);
        *count += 1;
        *count > successes
    }

    fn panics(&self, operation: &str) -> bool {
        self.panicking.contains(operation)
    }
}

// =============================================================================
// SimulatedPowerSupply
// =============================================================================

/// Simulated programmable supply.
///
/// # Example
///
/// ```rust,ignore
/// let supply = SimulatedPowerSupply::new(MockMode::Instant);
/// assert!(supply.set_voltage(4.0).await);
/// assert_eq!(supply.read_voltage().await?, 4.0);
/// ```
pub struct SimulatedPowerSupply {
    output: RwLock<f64>,
    connected: AtomicBool,
    faults: FaultPlan,
    mode: MockMode,
}

impl SimulatedPowerSupply {
    /// Create a connected supply at 0 V.
    pub fn new(mode: MockMode) -> Self {
        Self {
            output: RwLock::new(0.0),
            connected: AtomicBool::new(true),
            faults: FaultPlan::none(),
            mode,
        }
    }

    /// Attach failure injection.
    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    /// Simulate a cable pull or power-on of the supply.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Current programmed output.
    pub fn output(&self) -> f64 {
        *self.output.read()
    }
}

#[async_trait]
impl PowerControl for SimulatedPowerSupply {
    #[allow(clippy::panic)]
    async fn set_voltage(&self, volts: f64) -> bool {
        self.mode.delay().await;
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        if self.faults.panics("set_voltage") {
            panic!("simulated supply fault while programming {volts} V");
        }
        if self.faults.fails("set_voltage") || !(0.0..=5.5).contains(&volts) {
            return false;
        }
        *self.output.write() = volts;
        debug!(volts, "Supply output programmed");
        true
    }

    async fn read_voltage(&self) -> HarnessResult<f64> {
        self.mode.delay().await;
        if !self.connected.load(Ordering::SeqCst) {
            return Err(HarnessError::unavailable(Port::Power, "supply not responding"));
        }
        Ok(*self.output.read())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

// =============================================================================
// SimulatedHandset
// =============================================================================

/// Observable state of the simulated device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandsetState {
    /// Display on
    pub screen_on: bool,
    /// Keyguard dismissed
    pub unlocked: bool,
    /// Airplane mode
    pub flight_mode: bool,
    /// Associated SSID
    pub wifi: Option<String>,
    /// Bluetooth radio
    pub bluetooth: bool,
    /// Battery slate mode
    pub slate_mode: bool,
    /// App in the foreground
    pub foreground_app: Option<String>,
    /// Recent-apps list
    pub recent_apps: Vec<String>,
    /// Display sleep timeout
    pub screen_timeout: Option<Duration>,
}

/// Simulated device-control channel.
///
/// Every accepted command is appended to a command log that tests inspect.
pub struct SimulatedHandset {
    state: Mutex<HandsetState>,
    commands: Mutex<Vec<&'static str>>,
    connected: AtomicBool,
    settings_applied: usize,
    faults: FaultPlan,
    mode: MockMode,
}

impl SimulatedHandset {
    /// Create a connected, locked handset with the screen off.
    pub fn new(mode: MockMode) -> Self {
        Self {
            state: Mutex::new(HandsetState {
                recent_apps: vec!["com.android.chrome".to_string()],
                ..Default::default()
            }),
            commands: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            settings_applied: DEFAULT_SETTINGS.len(),
            faults: FaultPlan::none(),
            mode,
        }
    }

    /// Attach failure injection.
    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    /// Only `applied` of the default settings take effect.
    pub fn with_partial_settings(mut self, applied: usize) -> Self {
        self.settings_applied = applied.min(DEFAULT_SETTINGS.len());
        self
    }

    /// Simulate the control channel dropping or returning.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Snapshot of the device state.
    pub fn state(&self) -> HandsetState {
        self.state.lock().clone()
    }

    /// Commands accepted so far, in order.
    pub fn commands(&self) -> Vec<&'static str> {
        self.commands.lock().clone()
    }

    /// How many times `operation` was issued.
    pub fn count(&self, operation: &str) -> usize {
        self.commands.lock().iter().filter(|c| **c == operation).count()
    }

    #[allow(clippy::panic)]
    async fn command(&self, operation: &'static str, apply: impl FnOnce(&mut HandsetState)) -> bool {
        self.mode.delay().await;
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        self.commands.lock().push(operation);
        if self.faults.panics(operation) {
            panic!("simulated device fault during {operation}");
        }
        if self.faults.fails(operation) {
            debug!(operation, "Injected command failure");
            return false;
        }
        apply(&mut self.state.lock());
        true
    }
}

#[async_trait]
impl DeviceControl for SimulatedHandset {
    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn turn_screen_on(&self) -> bool {
        self.command("turn_screen_on", |s| s.screen_on = true).await
    }

    async fn turn_screen_off(&self) -> bool {
        self.command("turn_screen_off", |s| {
            s.screen_on = false;
            s.unlocked = false;
        })
        .await
    }

    async fn unlock(&self) -> bool {
        self.command("unlock", |s| {
            if s.screen_on {
                s.unlocked = true;
            }
        })
        .await
    }

    async fn press_home(&self) -> bool {
        self.command("press_home", |s| s.foreground_app = None).await
    }

    async fn press_back(&self) -> bool {
        self.command("press_back", |s| s.foreground_app = None).await
    }

    async fn clear_recent_apps(&self) -> bool {
        self.command("clear_recent_apps", |s| s.recent_apps.clear())
            .await
    }

    async fn enable_flight_mode(&self) -> bool {
        self.command("enable_flight_mode", |s| {
            s.flight_mode = true;
            s.wifi = None;
            s.bluetooth = false;
        })
        .await
    }

    async fn connect_wifi(&self, network: &WifiNetwork) -> bool {
        let ssid = network.ssid.clone();
        self.command("connect_wifi", move |s| s.wifi = Some(ssid)).await
    }

    async fn enable_bluetooth(&self) -> bool {
        self.command("enable_bluetooth", |s| s.bluetooth = true).await
    }

    async fn apply_default_settings(&self) -> SettingsReport {
        let total = DEFAULT_SETTINGS.len();
        let applied = self.settings_applied;
        let accepted = self
            .command("apply_default_settings", |s| {
                s.screen_timeout = Some(Duration::from_millis(600_000));
                s.bluetooth = false;
                s.wifi = None;
            })
            .await;

        SettingsReport {
            applied: if accepted { applied } else { 0 },
            total,
        }
    }

    async fn open_app(&self, identifier: &str) -> bool {
        let app = identifier.to_string();
        self.command("open_app", move |s| {
            if !s.recent_apps.contains(&app) {
                s.recent_apps.push(app.clone());
            }
            s.foreground_app = Some(app);
        })
        .await
    }

    async fn set_screen_timeout(&self, timeout: Duration) -> bool {
        self.command("set_screen_timeout", move |s| s.screen_timeout = Some(timeout))
            .await
    }

    async fn set_battery_slate_mode(&self, enabled: bool) -> bool {
        self.command("set_battery_slate_mode", move |s| s.slate_mode = enabled)
            .await
    }

    async fn check(&self, check: DeviceCheck) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        let state = self.state.lock();
        match check {
            DeviceCheck::ScreenOn => state.screen_on,
            DeviceCheck::ScreenOff => !state.screen_on,
            DeviceCheck::Unlocked => state.unlocked,
            DeviceCheck::FlightMode => state.flight_mode,
            DeviceCheck::WifiConnected(ssid) => state.wifi.as_deref() == Some(ssid.as_str()),
            DeviceCheck::BluetoothOn => state.bluetooth,
            DeviceCheck::RecentsCleared => state.recent_apps.is_empty(),
            DeviceCheck::SlateMode(enabled) => state.slate_mode == enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::WifiBand;

    #[tokio::test]
    async fn test_supply_set_and_read() {
        let supply = SimulatedPowerSupply::new(MockMode::Instant);
        assert!(supply.set_voltage(4.0).await);
        assert_eq!(supply.read_voltage().await.unwrap(), 4.0);
        assert!(!supply.set_voltage(12.0).await);
        assert_eq!(supply.output(), 4.0);
    }

    #[tokio::test]
    async fn test_supply_disconnected() {
        let supply = SimulatedPowerSupply::new(MockMode::Instant);
        supply.set_connected(false);
        assert!(!supply.set_voltage(4.0).await);
        assert!(matches!(
            supply.read_voltage().await,
            Err(HarnessError::ConnectionUnavailable { port: Port::Power, .. })
        ));
    }

    #[tokio::test]
    async fn test_handset_tracks_state() {
        let handset = SimulatedHandset::new(MockMode::Instant);
        assert!(handset.turn_screen_on().await);
        assert!(handset.unlock().await);
        assert!(handset.check(DeviceCheck::Unlocked).await);

        let net = WifiNetwork {
            ssid: "lab".to_string(),
            password: String::new(),
            band: WifiBand::Ghz5,
        };
        assert!(handset.connect_wifi(&net).await);
        assert!(handset.check(DeviceCheck::WifiConnected("lab".into())).await);

        assert!(handset.enable_flight_mode().await);
        assert!(!handset.check(DeviceCheck::WifiConnected("lab".into())).await);
        assert_eq!(handset.commands(), vec![
            "turn_screen_on",
            "unlock",
            "connect_wifi",
            "enable_flight_mode"
        ]);
    }

    #[tokio::test]
    async fn test_handset_partial_settings() {
        let handset = SimulatedHandset::new(MockMode::Instant).with_partial_settings(7);
        let report = handset.apply_default_settings().await;
        assert_eq!(report, SettingsReport { applied: 7, total: 10 });
    }

    #[tokio::test]
    async fn test_handset_injected_failure() {
        let handset = SimulatedHandset::new(MockMode::Instant)
            .with_faults(FaultPlan::none().fail("enable_bluetooth"));
        assert!(!handset.enable_bluetooth().await);
        assert!(!handset.check(DeviceCheck::BluetoothOn).await);
        assert_eq!(handset.count("enable_bluetooth"), 1);
    }

    #[tokio::test]
    async fn test_handset_disconnected_rejects_everything() {
        let handset = SimulatedHandset::new(MockMode::Instant);
        handset.set_connected(false);
        assert!(!handset.turn_screen_on().await);
        assert!(handset.commands().is_empty());
    }

    #[tokio::test]
    async fn test_fault_after_successes() {
        let handset = SimulatedHandset::new(MockMode::Instant)
            .with_faults(FaultPlan::none().fail_after("open_app", 1));
        assert!(handset.open_app("com.android.dialer").await);
        assert!(!handset.open_app("com.android.dialer").await);
        assert!(!handset.open_app("com.android.dialer").await);
        assert_eq!(handset.count("open_app"), 3);
    }
}
