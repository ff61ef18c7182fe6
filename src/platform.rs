//! Linux platform context backed by sysfs.
//!
//! Reads the hottest thermal zone and battery charging status. Low-power
//! mode has no kernel equivalent, so it is pushed by the host.

use crate::thermal::{DeviceContext, ThermalState};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Thermal zone root
const THERMAL_PATH: &str = "/sys/class/thermal";

/// Power supply root
const POWER_SUPPLY_PATH: &str = "/sys/class/power_supply";

/// Files combined into the device identity token
const MACHINE_ID_PATH: &str = "/etc/machine-id";
const PRODUCT_NAME_PATH: &str = "/sys/class/dmi/id/product_name";

/// Zone temperature thresholds in millidegrees Celsius
const FAIR_MILLI_C: i64 = 50_000;
const SERIOUS_MILLI_C: i64 = 65_000;
const CRITICAL_MILLI_C: i64 = 80_000;

/// Device context reading thermal zones and power supplies from sysfs.
pub struct SysfsDeviceContext {
    /// Cached `temp` files of every thermal zone
    zone_paths: Vec<PathBuf>,
    /// Cached `status` files of every battery
    battery_paths: Vec<PathBuf>,
    low_power: AtomicBool,
}

impl SysfsDeviceContext {
    pub fn new() -> Self {
        Self::with_roots(Path::new(THERMAL_PATH), Path::new(POWER_SUPPLY_PATH))
    }

    /// Build against alternative sysfs roots.
    pub fn with_roots(thermal_root: &Path, power_root: &Path) -> Self {
        let zone_paths = find_entries(thermal_root, "thermal_zone", "temp");
        let battery_paths = find_entries(power_root, "BAT", "status");
        debug!(
            "Found {} thermal zones and {} batteries",
            zone_paths.len(),
            battery_paths.len()
        );
        Self {
            zone_paths,
            battery_paths,
            low_power: AtomicBool::new(false),
        }
    }

    pub fn set_low_power_mode(&self, low_power: bool) {
        self.low_power.store(low_power, Ordering::SeqCst);
    }

    /// Hottest zone temperature in millidegrees, if any zone is readable.
    fn max_zone_temp(&self) -> Option<i64> {
        self.zone_paths
            .iter()
            .filter_map(|path| match std::fs::read_to_string(path) {
                Ok(contents) => contents.trim().parse::<i64>().ok(),
                Err(e) => {
                    debug!("Failed to read {:?}: {}", path, e);
                    None
                }
            })
            .max()
    }
}

impl Default for SysfsDeviceContext {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceContext for SysfsDeviceContext {
    fn thermal_state(&self) -> ThermalState {
        match self.max_zone_temp() {
            Some(temp) => classify_temperature(temp),
            None => ThermalState::Unknown,
        }
    }

    fn is_charging(&self) -> bool {
        self.battery_paths.iter().any(|path| {
            std::fs::read_to_string(path)
                .map(|status| status.trim().eq_ignore_ascii_case("charging"))
                .unwrap_or(false)
        })
    }

    fn is_low_power_mode(&self) -> bool {
        self.low_power.load(Ordering::SeqCst)
    }
}

/// Bucket a zone temperature into a thermal state.
pub fn classify_temperature(milli_c: i64) -> ThermalState {
    if milli_c >= CRITICAL_MILLI_C {
        ThermalState::Critical
    } else if milli_c >= SERIOUS_MILLI_C {
        ThermalState::Serious
    } else if milli_c >= FAIR_MILLI_C {
        ThermalState::Fair
    } else {
        ThermalState::Nominal
    }
}

/// Token identifying the hardware the learned profiles belong to.
pub fn device_identity() -> String {
    identity_from(Path::new(MACHINE_ID_PATH), Path::new(PRODUCT_NAME_PATH))
}

fn identity_from(machine_id: &Path, product_name: &Path) -> String {
    let read = |path: &Path| {
        std::fs::read_to_string(path)
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    };
    let machine = read(machine_id);
    let product = read(product_name);

    if machine.is_empty() && product.is_empty() {
        warn!("No device identity source readable, using a fixed token");
        return "unknown-device".to_string();
    }
    format!("{}:{}", product, machine)
}

fn find_entries(root: &Path, prefix: &str, file: &str) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if !root.exists() {
        warn!("Sysfs path {:?} does not exist", root);
        return paths;
    }

    if let Ok(entries) = std::fs::read_dir(root) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let candidate = entry.path().join(file);
            if name.starts_with(prefix) && candidate.exists() {
                paths.push(candidate);
            }
        }
    }
    paths.sort();
    paths
}
