use crate::domain::opcodes::OpcodeTable;
use crate::domain::telemetry::DEFAULT_LOG_CAPACITY;
use crate::infrastructure::bluetooth::protocol;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "wand_controller".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Link parameters for the wand itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WandSettings {
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,
    #[serde(default = "default_write_uuid")]
    pub write_char_uuid: String,
    #[serde(default = "default_notify_uuid")]
    pub notify_char_uuid: String,
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    #[serde(default = "default_heartbeat_byte")]
    pub heartbeat_byte: u8,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
    #[serde(default = "default_error_revert_ms")]
    pub error_revert_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
}

impl Default for WandSettings {
    fn default() -> Self {
        Self {
            name_prefix: default_name_prefix(),
            service_uuid: default_service_uuid(),
            write_char_uuid: default_write_uuid(),
            notify_char_uuid: default_notify_uuid(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            heartbeat_byte: default_heartbeat_byte(),
            chunk_size: default_chunk_size(),
            chunk_delay_ms: default_chunk_delay_ms(),
            error_revert_ms: default_error_revert_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            scan_timeout_ms: default_scan_timeout_ms(),
        }
    }
}

fn default_name_prefix() -> String {
    protocol::DEVICE_NAME_PREFIX.to_string()
}
fn default_service_uuid() -> String {
    protocol::SERVICE_UUID.to_string()
}
fn default_write_uuid() -> String {
    protocol::WRITE_CHAR_UUID.to_string()
}
fn default_notify_uuid() -> String {
    protocol::NOTIFY_CHAR_UUID.to_string()
}
fn default_keepalive_interval_ms() -> u64 {
    protocol::KEEPALIVE_INTERVAL_MS
}
fn default_heartbeat_byte() -> u8 {
    protocol::HEARTBEAT
}
fn default_chunk_size() -> usize {
    protocol::CHUNK_SIZE
}
fn default_chunk_delay_ms() -> u64 {
    protocol::CHUNK_DELAY_MS
}
fn default_error_revert_ms() -> u64 {
    protocol::ERROR_REVERT_MS
}
fn default_connect_timeout_ms() -> u64 {
    protocol::CONNECT_TIMEOUT_MS
}
fn default_scan_timeout_ms() -> u64 {
    10_000
}

/// Sniffer discovery parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnifferSettings {
    /// Characteristics never subscribed to
    #[serde(default = "default_denylist")]
    pub denylist: Vec<String>,
    /// Services the platform should expose for enumeration
    #[serde(default = "default_optional_services")]
    pub optional_services: Vec<String>,
}

impl Default for SnifferSettings {
    fn default() -> Self {
        Self {
            denylist: default_denylist(),
            optional_services: default_optional_services(),
        }
    }
}

fn default_denylist() -> Vec<String> {
    // Service Changed
    vec!["00002a05-0000-1000-8000-00805f9b34fb".to_string()]
}
fn default_optional_services() -> Vec<String> {
    vec![
        // Vendor
        protocol::VENDOR_SERVICE_UUID.to_string(),
        // Generic Access, Generic Attribute, Device Information, Battery
        "00001800-0000-1000-8000-00805f9b34fb".to_string(),
        "00001801-0000-1000-8000-00805f9b34fb".to_string(),
        "0000180a-0000-1000-8000-00805f9b34fb".to_string(),
        "0000180f-0000-1000-8000-00805f9b34fb".to_string(),
    ]
}
fn default_telemetry_capacity() -> usize {
    DEFAULT_LOG_CAPACITY
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Wand link
    #[serde(default)]
    pub wand: WandSettings,
    #[serde(default)]
    pub opcodes: OpcodeTable,

    // Sniffer
    #[serde(default)]
    pub sniffer: SnifferSettings,

    #[serde(default = "default_telemetry_capacity")]
    pub telemetry_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            wand: WandSettings::default(),
            opcodes: OpcodeTable::default(),
            sniffer: SnifferSettings::default(),
            telemetry_capacity: default_telemetry_capacity(),
        }
    }
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();

        Ok(Self {
            settings,
            settings_path,
        })
    }

    /// Service backed by an explicit file, used when the default location is unsuitable
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("WandController");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &PathBuf) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn update_opcodes(&mut self, opcodes: OpcodeTable) -> anyhow::Result<()> {
        self.settings.opcodes = opcodes;
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.wand.name_prefix, "MCW");
        assert_eq!(settings.wand.keepalive_interval_ms, 5000);
        assert_eq!(settings.wand.chunk_size, 20);
        assert_eq!(settings.wand.chunk_delay_ms, 20);
        assert_eq!(settings.wand.error_revert_ms, 3000);
        assert_eq!(settings.opcodes, OpcodeTable::default());
        assert_eq!(settings.telemetry_capacity, 200);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let json = r#"{ "wand": { "name_prefix": "MCW-2" }, "opcodes": { "clear_leds": 1, "buzz": 2, "change_led": 3 } }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.wand.name_prefix, "MCW-2");
        assert_eq!(settings.wand.chunk_size, 20);
        assert_eq!(settings.opcodes.buzz, 2);
        assert_eq!(settings.sniffer.denylist.len(), 1);
        assert_eq!(settings.telemetry_capacity, 200);
    }

    #[test]
    fn test_save_and_reload() {
        let path = std::env::temp_dir().join(format!(
            "wand_controller_settings_{}.json",
            std::process::id()
        ));
        let mut service = SettingsService::with_path(path.clone());
        service.get_mut().wand.keepalive_interval_ms = 1234;
        service.save().unwrap();

        let reloaded = SettingsService::with_path(path.clone());
        assert_eq!(reloaded.get().wand.keepalive_interval_ms, 1234);
        let _ = fs::remove_file(path);
    }
}
