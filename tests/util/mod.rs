// Not all functions are used by all tests.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Once;

use rand::Rng;

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

/// A path in the system temp directory that does not exist yet.
pub fn temp_path(prefix: &str) -> PathBuf {
    let mut rng = rand::rng();
    let suffix: u64 = rng.random();
    std::env::temp_dir().join(format!("{}-{}-{:x}", prefix, std::process::id(), suffix))
}

/// A local TCP port that had no listener at probe time.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe listener");
    let port = listener.local_addr().expect("probe local_addr").port();
    drop(listener);
    port
}
