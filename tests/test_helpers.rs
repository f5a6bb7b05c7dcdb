//! Shared helpers for integration tests
#![allow(dead_code)]

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use cloudlink::config::AgentConfig;
use std::path::Path;

/// Configuration pointing every endpoint at `host` and storing data under `data_dir`
pub fn test_config(data_dir: &Path, host: &str) -> AgentConfig {
    let toml_content = format!(
        r#"
[device]
id = "dev1"
data_dir = "{}"

[cloud]
auth_host = "{host}"
data_host = "{host}"
retry_delay_secs = 0

[mqtt]
broker_url = "mqtt://localhost:1883"
connect_timeout_secs = 1

[queue]
idle_period_secs = 1
throttle_delay_secs = 0

[health]
enabled = false

[update]
max_download_retries = 2
download_retry_delay_ms = 10
shutdown_timeout_secs = 1

[crash]
paths = []
"#,
        data_dir.display()
    );
    let config: AgentConfig = toml::from_str(&toml_content).unwrap();
    config.validate().unwrap();
    config
}

/// Same as [`test_config`] with authentication off and a fixed organization
pub fn unauthenticated_config(data_dir: &Path) -> AgentConfig {
    let mut config = test_config(data_dir, "http://127.0.0.1:9");
    config.cloud.use_authentication = false;
    config.cloud.organization_id = Some("org1".to_string());
    config
}

/// Unsigned JWT carrying the given organization claim
pub fn jwt_with_oid(oid: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"oid":"{oid}","sub":"DEV1"}}"#));
    format!("{header}.{payload}.c2lnbmF0dXJl")
}

/// Poll `check` until it holds or three seconds pass
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    check()
}
