use serde::{Deserialize, Serialize};

/// Protocol family a device speaks. Selects which `ProtocolDriver` the
/// supervisor instantiates for the device (§4.1, §9 — factory by `tipo` string).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Controllogix,
    ModbusTcp,
    Mqtt,
    Sql,
}

/// Device (driver) configuration, immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub name: String,
    pub protocol: Protocol,
    /// host:port, broker/topic-root, or a connection string depending on `protocol`.
    pub endpoint: String,

    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_true")]
    pub log_enabled: bool,

    // Protocol-specific options. All optional; the owning driver validates
    // the ones it needs at `open` time.
    #[serde(default)]
    pub slave_id: Option<u8>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub table_name: Option<String>,
    #[serde(default)]
    pub db_kind: Option<String>,
}

fn default_scan_interval_ms() -> u64 {
    1000
}
fn default_timeout_ms() -> u64 {
    5000
}
fn default_retry_count() -> u32 {
    3
}
fn default_true() -> bool {
    true
}

/// Data kind declared for a tag; drives coercion on read and write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Bool,
    Int,
    Float,
    String,
}

/// Tag configuration, immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagConfig {
    pub id: String,
    pub device_id: String,
    pub name: String,
    /// Opaque address: tag path, register index, topic, or column name.
    pub address: String,
    pub data_kind: DataKind,

    #[serde(default = "default_true")]
    pub scan_enabled: bool,
    #[serde(default)]
    pub writable: bool,

    /// Display-only passthrough, not interpreted by the runtime.
    #[serde(default)]
    pub display_field: Option<String>,
}

/// One configured project: a set of devices and the tags that belong to them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub id: String,
    #[serde(default)]
    pub drivers: Vec<DeviceConfig>,
    #[serde(default)]
    pub tags: Vec<TagConfig>,
}

/// Top-level configuration document, already decoded by the external
/// collaborator (spec §1 — decryption is out of scope here).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub projetos: Vec<ProjectConfig>,
}

impl GatewayConfig {
    pub fn all_devices(&self) -> Vec<&DeviceConfig> {
        self.projetos.iter().flat_map(|p| p.drivers.iter()).collect()
    }

    pub fn all_tags(&self) -> Vec<&TagConfig> {
        self.projetos.iter().flat_map(|p| p.tags.iter()).collect()
    }

    pub fn tags_for_device<'a>(&'a self, device_id: &str) -> Vec<&'a TagConfig> {
        self.all_tags()
            .into_iter()
            .filter(|t| t.device_id == device_id)
            .collect()
    }
}
