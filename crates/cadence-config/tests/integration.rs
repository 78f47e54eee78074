//! Integration tests for cadence-config.
//!
//! These tests verify on-disk round trips and that a loaded configuration
//! drives a real container.

use cadence_config::{
    ConfigError, ContainerConfig, FrameSizeConfig, SystemConfig, ValidationError,
    validate_system,
};
use cadence_core::{AckPayload, Command, Container, ContainerServices, Envelope, PortKey};
use tempfile::TempDir;

const SYSTEM: &str = r#"
name = "playback"

[[containers]]
name = "decoder"
instance = 0x4000
frame_size = { kind = "time_us", value = 5000 }

[containers.policy]
ingress_prebuffer_retention = 0

[[containers.subgraphs]]
id = 1

[[containers.modules]]
id = 0x10
subgraph = 1
propagates_metadata = true
delay_us = 250
inputs = [0]
outputs = [1]

[[containers.external_inputs]]
port = { module = 0x10, port = 0 }
media = { sample_rate = 48000, channels = 2, bits_per_sample = 16 }

[[containers.external_outputs]]
module = 0x10
port = 1

[[containers]]
name = "renderer"
instance = 0x4100
signal_triggered = true

[[containers.subgraphs]]
id = 2

[[containers.modules]]
id = 0x20
subgraph = 2
sink = true
real_time = true
inputs = [0]

[[containers.external_inputs]]
port = { module = 0x20, port = 0 }

[[connections]]
from = { module = 0x10, port = 1 }
to = { module = 0x20, port = 0 }

[[paths]]
id = 1
vertices = [
    { module = 0x10, port = 0 },
    { module = 0x10, port = 1 },
    { module = 0x20, port = 0 },
]
"#;

/// Test parsing a full system description.
#[test]
fn test_system_parses_and_validates() {
    let sys = SystemConfig::from_toml(SYSTEM).expect("system should parse");
    assert_eq!(sys.containers.len(), 2);
    assert_eq!(sys.connections.len(), 1);
    assert_eq!(sys.paths[0].vertices.len(), 3);
    assert_eq!(
        sys.containers[0].frame_size,
        FrameSizeConfig::TimeUs(5_000)
    );
    assert!(sys.containers[1].graph.modules[0].sink);
    validate_system(&sys).expect("system should be valid");
    assert_eq!(sys.downstream_first(), vec![1, 0]);
}

/// Test saving and loading through the filesystem.
#[test]
fn test_system_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested/dir/system.toml");

    let sys = SystemConfig::from_toml(SYSTEM).unwrap();
    sys.save(&path).expect("save should create parent dirs");
    let loaded = SystemConfig::load(&path).expect("saved file should load");
    assert_eq!(loaded, sys);
}

/// Test container save/load round trip.
#[test]
fn test_container_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("decoder.toml");

    let sys = SystemConfig::from_toml(SYSTEM).unwrap();
    let decoder = sys.container("decoder").unwrap();
    decoder.save(&path).unwrap();
    assert_eq!(&ContainerConfig::load(&path).unwrap(), decoder);
}

/// Test missing files and bad TOML map to the right errors.
#[test]
fn test_load_errors() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("missing.toml");
    assert!(matches!(
        SystemConfig::load(&missing),
        Err(ConfigError::ReadFile { .. })
    ));

    let bad = dir.path().join("bad.toml");
    std::fs::write(&bad, "name = \"x\"\ninstance = \"not a number\"").unwrap();
    assert!(matches!(
        ContainerConfig::load(&bad),
        Err(ConfigError::TomlParse(_))
    ));
}

/// Test a dangling connection is reported through `ConfigError`.
#[test]
fn test_invalid_connection() {
    let mut sys = SystemConfig::from_toml(SYSTEM).unwrap();
    sys.connections[0].to.port = 9;
    let err: ConfigError = validate_system(&sys).unwrap_err().into();
    assert!(matches!(
        err,
        ConfigError::Validation(ValidationError::UnknownPort { .. })
    ));
}

/// Test a loaded container opens its graph in a real container.
#[test]
fn test_config_drives_container() {
    let sys = SystemConfig::from_toml(SYSTEM).unwrap();
    let decoder = sys.container("decoder").unwrap();

    let mut cntr = Container::new(decoder.settings(), ContainerServices::default()).unwrap();
    let (env, rx) = Envelope::with_reply(Command::GraphOpen(decoder.graph.open_request()));
    cntr.command_sender().push(env).unwrap();
    let _ = cntr.run_until_idle();

    let ack = rx.try_recv().expect("graph open should be acknowledged");
    assert!(ack.result.is_ok());
    let AckPayload::Endpoints(eps) = ack.payload else {
        panic!("endpoints expected");
    };
    assert_eq!(eps.len(), 2);
    assert!(cntr.ext_input(PortKey::new(0x10, 0)).is_some());
    assert_eq!(cntr.frame().us, 5_000);
}
