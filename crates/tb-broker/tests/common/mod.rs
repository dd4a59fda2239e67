//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::io::Write;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use tb_broker::BrokerState;
use tb_core::config::{load_broker_config, BrokerConfig, PrincipalConfig};

pub const LAB_CONFIG: &str = r#"
bind_address = "127.0.0.1:0"
driver_timeout = 5

[[targets]]
id = "qemu-01"
name = "QEMU x86 #1"
type = "qemu"
arch = "x86_64"
toolchains = ["zephyr"]
ram = 65536
flash = 0
power_cycle_wait = 0.0

[[targets.power]]
name = "vm"
driver = { kind = "simulated" }

[[targets.consoles]]
name = "ttyS0"
driver = { kind = "loopback" }

[[targets]]
id = "qemu-02"
name = "QEMU x86 #2"
type = "qemu"
arch = "x86_64"
toolchains = ["zephyr"]
ram = 65536
flash = 0
power_cycle_wait = 0.0

[[targets.power]]
name = "vm"
driver = { kind = "simulated" }

[[targets.consoles]]
name = "ttyS0"
driver = { kind = "loopback" }

[[targets]]
id = "board-01"
name = "Dev board"
type = "mcu"
arch = "arm"
toolchains = ["zephyr", "gnuarmemb"]
ram = 262144
flash = 1048576
power_cycle_wait = 0.0

[[targets.power]]
name = "relay"
driver = { kind = "simulated" }

[[targets.power]]
name = "usb"
driver = { kind = "simulated" }

[[targets.power]]
name = "jtag"
driver = { kind = "simulated" }
explicit = "on"

[[targets.consoles]]
name = "uart0"
driver = { kind = "loopback" }
enabled = false
"#;

/// Load the lab configuration through the regular config path and add
/// principals `alice`, `bob` and `admin` with tokens `<name>-token`
pub fn lab_config() -> BrokerConfig {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(LAB_CONFIG.as_bytes()).unwrap();
    let mut config = load_broker_config(file.path()).unwrap();

    for (name, admin) in [("alice", false), ("bob", false), ("admin", true)] {
        config.principals.push(PrincipalConfig {
            name: name.into(),
            token_sha256: PrincipalConfig::hash_token(&format!("{}-token", name)),
            admin,
        });
    }
    config
}

/// Broker state with consoles configured as enabled already running
pub async fn lab_state() -> Arc<BrokerState> {
    let state = Arc::new(BrokerState::new(lab_config(), CancellationToken::new()));
    state.consoles.start().await;
    state
}
