use std::path::Path;

use config::{Config, ConfigError, File};

use super::model::GatewayConfig;

impl GatewayConfig {
    /// Load configuration from a TOML document already decoded by the
    /// external collaborator (spec §1, §6). Missing optional fields pick up
    /// the defaults declared on the model types.
    pub fn load(config_path: &Path) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::from(config_path))
            .build()?;

        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp_toml(contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "scadagate-test-{}-{}.toml",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_devices_and_tags_with_defaults() {
        let path = write_temp_toml(
            r#"
            [[projetos]]
            id = "line1"

            [[projetos.drivers]]
            id = "plc1"
            name = "Main PLC"
            protocol = "modbus_tcp"
            endpoint = "127.0.0.1:1502"

            [[projetos.tags]]
            id = "tag1"
            device_id = "plc1"
            name = "Speed"
            address = "40001"
            data_kind = "int"
            "#,
        );

        let cfg = GatewayConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(cfg.all_devices().len(), 1);
        let device = cfg.all_devices()[0];
        assert_eq!(device.scan_interval_ms, 1000);
        assert_eq!(device.connect_timeout_ms, 5000);
        assert_eq!(device.retry_count, 3);

        let tag = cfg.all_tags()[0];
        assert!(tag.scan_enabled);
        assert!(!tag.writable);
    }

    #[test]
    fn rejects_unknown_protocol() {
        let path = write_temp_toml(
            r#"
            [[projetos]]
            id = "line1"

            [[projetos.drivers]]
            id = "plc1"
            name = "Main PLC"
            protocol = "fieldbus_9000"
            endpoint = "x"
            "#,
        );

        let result = GatewayConfig::load(&path);
        std::fs::remove_file(&path).ok();
        assert!(result.is_err());
    }
}
