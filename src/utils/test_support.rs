use std::path::Path;

use crate::config::GatewayConfig;

/// Mock upstreams need a loopback listener; some sandboxes refuse one.
pub fn should_skip_httpmock() -> bool {
    match std::net::TcpListener::bind(("127.0.0.1", 0)) {
        Ok(_) => false,
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            eprintln!("skipping: loopback listeners are not permitted here");
            true
        }
        Err(err) => panic!("unexpected loopback bind failure: {err}"),
    }
}

/// A config whose flow platform and direct vendor URLs all point at `base_url`.
pub fn config_for_mock(base_url: &str, state_path: &Path) -> GatewayConfig {
    let mut config = GatewayConfig {
        flow_base_url: Some(base_url.to_string()),
        session_token: Some("test-session".to_string()),
        forward_timeout_secs: 5,
        exchange_timeout_secs: 5,
        ..GatewayConfig::default()
    };
    config.direct.amazon_bedrock = Some(base_url.to_string());
    config.direct.azure_foundry = Some(base_url.to_string());
    config.direct.azure_openai = Some(base_url.to_string());
    config.direct.google_gemini = Some(base_url.to_string());
    config.store.state_path = Some(state_path.to_path_buf());
    config
}
