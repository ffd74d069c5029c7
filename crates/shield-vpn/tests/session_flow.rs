//! End-to-end session flow over a scripted tunnel

use shield_net::mock::{MockTunnelFactory, http_response, parse_request};
use shield_vpn::{
    Collaborators, CredentialStore, Credentials, DataPlaneEvent, DirectDataPlane, FailureReason, KeyPair,
    MemoryCredentialStore, ProtocolFlags, ServerDescriptor, SessionConfig, SessionManager, SessionState,
    StaticDirectory, VpnProtocol,
};
use shield_vpn::{Prober, default_port_table};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

struct OnlyUdp;

#[async_trait::async_trait]
impl Prober for OnlyUdp {
    async fn probe(&self, _server: &ServerDescriptor, protocol: VpnProtocol, _ip: IpAddr, _port: u16) -> bool {
        protocol == VpnProtocol::WireGuardUdp
    }
}

fn epoch_secs(offset: u64) -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() + offset
}

/// API that rejects the stale token once and issues a certificate to the renewed one
fn api_handler(raw: &[u8]) -> Vec<u8> {
    let request = parse_request(raw).expect("well-formed request");
    let auth = request.headers.get("Authorization").unwrap_or_default();

    match request.target.as_str() {
        "/vpn/v1/certificate" if auth == "Bearer fresh" => {
            let body = format!(
                r#"{{"Certificate":"-----BEGIN CERTIFICATE-----","ExpirationTime":{},"RefreshTime":{}}}"#,
                epoch_secs(86_400),
                epoch_secs(43_200)
            );
            http_response(200, &[], body.as_bytes())
        }
        "/vpn/v1/certificate" => http_response(401, &[], br#"{"Code":401,"Error":"Invalid access token"}"#),
        "/auth/v4/sessions/refresh" => http_response(200, &[], br#"{"UID":"uid-2","RefreshToken":"r2"}"#),
        "/auth/v4/refresh" => http_response(
            200,
            &[],
            br#"{"AccessToken":"fresh","RefreshToken":"r3","ExpiresIn":3600,"Scopes":["vpn"]}"#,
        ),
        _ => http_response(404, &[], b""),
    }
}

fn stale_credentials() -> Credentials {
    Credentials {
        session_id: "uid-1".to_string(),
        access_token: "stale".to_string(),
        refresh_token: "r1".to_string(),
        expiration: SystemTime::now() + Duration::from_secs(60),
        scopes: vec!["vpn".to_string()],
    }
}

struct Harness {
    session: SessionManager,
    data_plane: Arc<DirectDataPlane>,
    factory: Arc<MockTunnelFactory>,
    store: Arc<MemoryCredentialStore>,
}

fn harness() -> Harness {
    let factory = Arc::new(MockTunnelFactory::with_handler(api_handler));
    let data_plane = Arc::new(DirectDataPlane::new(factory.clone()));
    let store = Arc::new(MemoryCredentialStore::with_credentials(stale_credentials()));
    let server = ServerDescriptor::new("CH#4", IpAddr::V4(Ipv4Addr::new(185, 159, 157, 4)));
    let directory = StaticDirectory::new(vec![server], default_port_table(), ProtocolFlags::default());

    let session = SessionManager::new(
        SessionConfig::default(),
        Collaborators {
            directory: Arc::new(directory),
            prober: Arc::new(OnlyUdp),
            data_plane: data_plane.clone(),
            credentials: store.clone(),
        },
        KeyPair::generate(),
    );

    Harness {
        session,
        data_plane,
        factory,
        store,
    }
}

async fn settled(rx: &mut watch::Receiver<SessionState>) -> SessionState {
    rx.wait_for(|s| s.is_terminal() || s.is_connected())
        .await
        .unwrap()
        .clone()
}

#[tokio::test]
async fn test_connect_renews_credentials_through_tunnel() {
    let h = harness();

    let mut rx = h.session.connect("CH#4").await;
    assert_eq!(settled(&mut rx).await, SessionState::Connected);

    let targets: Vec<String> = h.factory.recorded().into_iter().map(|r| r.target).collect();
    assert_eq!(
        targets,
        vec![
            "/vpn/v1/certificate",
            "/auth/v4/sessions/refresh",
            "/auth/v4/refresh",
            "/vpn/v1/certificate",
        ]
    );

    let stored = h.store.load().await.unwrap().unwrap();
    assert_eq!(stored.session_id, "uid-2");
    assert_eq!(stored.access_token, "fresh");

    let certificate = h.session.current_certificate().unwrap();
    assert_eq!(h.data_plane.installed_certificate().await, Some(certificate));

    let attempt = h.session.attempt().unwrap();
    assert_eq!(attempt.choice.unwrap().protocol, VpnProtocol::WireGuardUdp);
}

#[tokio::test]
async fn test_tunnel_drop_fails_session_then_cancel_returns_to_idle() {
    let h = harness();

    let mut rx = h.session.connect("CH#4").await;
    assert_eq!(settled(&mut rx).await, SessionState::Connected);

    h.data_plane.notify(DataPlaneEvent::TunnelDown("peer timeout".to_string()));
    let failed = rx.wait_for(|s| s.is_failed()).await.unwrap().clone();
    assert_eq!(failed, SessionState::Failed(FailureReason::Unreachable));

    h.session.cancel().await;
    h.session.cancel().await;
    assert_eq!(h.session.state(), SessionState::Idle);
    assert!(h.session.current_certificate().is_none());
}

#[tokio::test]
async fn test_reconnect_after_cancel() {
    let h = harness();

    let mut rx = h.session.connect("CH#4").await;
    assert_eq!(settled(&mut rx).await, SessionState::Connected);
    h.session.cancel().await;
    assert!(!h.data_plane.is_up());

    // Credentials are fresh now, so no re-authentication this time
    let before = h.factory.recorded().len();
    let mut rx = h.session.connect("CH#4").await;
    assert_eq!(settled(&mut rx).await, SessionState::Connected);
    assert_eq!(h.factory.recorded().len(), before + 1);
}
