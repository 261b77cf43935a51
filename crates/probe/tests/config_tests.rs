//! Integration tests for probe configuration files
//!
//! Checks the documented TOML layout parses and that the `[target]`
//! section feeds `TargetOptions` directly.

use std::time::Duration;
use usbtarget::TargetOptions;

const MINIMAL_PROBE_CONFIG: &str = r#"
[probe]
log_level = "info"

[usb]
"#;

const FULL_PROBE_CONFIG: &str = r#"
[probe]
log_level = "debug"

[usb]
device = "0x0781:0x5567"
transfer_timeout_ms = 2000

[target]
client_contract_version = 1538
quiesce_timeout_ms = 250
"#;

#[test]
fn test_parse_minimal_probe_config() {
    let config: toml::Value = toml::from_str(MINIMAL_PROBE_CONFIG).unwrap();

    let probe = config.get("probe").unwrap();
    assert_eq!(probe.get("log_level").unwrap().as_str().unwrap(), "info");

    let usb = config.get("usb").unwrap();
    assert!(usb.get("device").is_none());
    assert!(config.get("target").is_none());
}

#[test]
fn test_parse_full_probe_config() {
    let config: toml::Value = toml::from_str(FULL_PROBE_CONFIG).unwrap();

    let probe = config.get("probe").unwrap();
    assert_eq!(probe.get("log_level").unwrap().as_str().unwrap(), "debug");

    let usb = config.get("usb").unwrap();
    assert_eq!(
        usb.get("device").unwrap().as_str().unwrap(),
        "0x0781:0x5567"
    );
    assert_eq!(
        usb.get("transfer_timeout_ms")
            .unwrap()
            .as_integer()
            .unwrap(),
        2000
    );

    let target = config.get("target").unwrap();
    assert_eq!(
        target
            .get("client_contract_version")
            .unwrap()
            .as_integer()
            .unwrap(),
        0x602
    );
}

#[test]
fn test_target_section_deserializes_into_options() {
    let config: toml::Value = toml::from_str(FULL_PROBE_CONFIG).unwrap();
    let options: TargetOptions = config.get("target").unwrap().clone().try_into().unwrap();

    assert_eq!(options.client_contract_version, 0x602);
    assert_eq!(options.quiesce_timeout(), Duration::from_millis(250));
}

#[test]
fn test_empty_target_section_uses_defaults() {
    let options: TargetOptions = toml::from_str("").unwrap();
    assert_eq!(options, TargetOptions::default());
    assert_eq!(options.quiesce_timeout(), Duration::from_secs(5));
}

#[test]
fn test_invalid_toml_is_rejected() {
    let result: Result<toml::Value, _> = toml::from_str("[usb\ndevice = ");
    assert!(result.is_err());
}
