#![allow(dead_code)]

mod fixture_engine;

pub use fixture_engine::*;

use rand::Rng;
use std::path::PathBuf;

pub const TEST_DATA_DIR: &str = "generated-test-data";

pub fn rid() -> String {
    let mut rng = rand::rng();
    let rid: String = (0..10)
        .map(|_| rng.sample(rand::distr::Alphanumeric) as char)
        .collect();
    rid
}

/// A fresh scratch directory under the shared test-data root.
pub fn scratch_dir(prefix: &str) -> PathBuf {
    let dir = PathBuf::from(TEST_DATA_DIR).join(format!("{}-{}", prefix, rid()));
    std::fs::create_dir_all(&dir).expect("Failed to create scratch dir");
    dir
}

/// Drop a minimal but complete config.json/runtime.json pair into `dir`
/// so a manager can compile a config from it.
pub fn write_container_documents(dir: &std::path::Path) {
    let config = r#"{
        "root": { "path": "rootfs" },
        "process": {
            "user": { "uid": 0, "gid": 0 },
            "args": [ "/bin/true" ]
        },
        "mounts": [ { "name": "proc", "path": "/proc" } ]
    }"#;
    let runtime = r#"{
        "mounts": {
            "proc": {
                "type": "proc",
                "source": "proc",
                "options": [ "nodev", "noexec", "nosuid" ]
            }
        },
        "linux": {
            "uidMappings": "0 0 1",
            "gidMappings": "0 0 1",
            "altSysCallTable": "default",
            "devices": []
        }
    }"#;
    std::fs::write(dir.join("config.json"), config)
        .expect("Failed to write config.json");
    std::fs::write(dir.join("runtime.json"), runtime)
        .expect("Failed to write runtime.json");
}
