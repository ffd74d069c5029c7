//! Reachability Probes
//!
//! A probe answers one question: does anything speaking this protocol
//! answer on this address and port? Probes carry no deadline of their own;
//! the resolver bounds them.
//!
//! # Probe Packets
//!
//! | Protocol | Probe | Success |
//! |----------|-------|---------|
//! | WireGuardUDP | handshake initiation (148 bytes) | any datagram back |
//! | WireGuardTCP / TLS | TCP connect | connected |
//! | OpenVPNUDP | `P_CONTROL_HARD_RESET_CLIENT_V2` | any datagram back |
//! | OpenVPNTCP | length-prefixed hard reset | at least one byte back |
//! | IKEv2 | `IKE_SA_INIT` header | any datagram back |

use crate::keys::{KeyPair, PublicKey};
use crate::protocol::{ServerDescriptor, VpnProtocol};
use async_trait::async_trait;
use blake2::digest::Mac;
use blake2::digest::consts::U16;
use blake2::{Blake2s256, Blake2sMac, Digest};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, trace};

const WG_LABEL_MAC1: &[u8] = b"mac1----";
const WG_HANDSHAKE_INIT_LEN: usize = 148;

const OPENVPN_HARD_RESET_CLIENT_V2: u8 = 7 << 3;

const IKE_HEADER_LEN: u32 = 28;
const IKE_SA_INIT: u8 = 34;
const IKE_FLAG_INITIATOR: u8 = 0x08;
const IKE_VERSION_2: u8 = 0x20;

/// One reachability check
#[async_trait]
pub trait Prober: Send + Sync {
    /// `true` if `protocol` answered on `ip:port`
    async fn probe(&self, server: &ServerDescriptor, protocol: VpnProtocol, ip: IpAddr, port: u16) -> bool;
}

/// Probes over the host network stack
#[derive(Debug, Default, Clone)]
pub struct NetworkProber;

impl NetworkProber {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(&self, server: &ServerDescriptor, protocol: VpnProtocol, ip: IpAddr, port: u16) -> bool {
        let addr = SocketAddr::new(ip, port);
        let result = match protocol {
            VpnProtocol::WireGuardUdp => {
                let server_key = server
                    .x25519_public_key
                    .as_deref()
                    .and_then(|k| PublicKey::from_base64(k).ok());
                udp_exchange(addr, &wireguard_initiation(server_key.as_ref())).await
            }
            VpnProtocol::OpenVpnUdp => udp_exchange(addr, &openvpn_hard_reset(false)).await,
            VpnProtocol::Ikev2 => udp_exchange(addr, &ikev2_sa_init()).await,
            VpnProtocol::OpenVpnTcp => tcp_exchange(addr, &openvpn_hard_reset(true)).await,
            VpnProtocol::WireGuardTcp | VpnProtocol::WireGuardTls => {
                TcpStream::connect(addr).await.map(|_| ())
            }
        };

        match result {
            Ok(()) => {
                debug!("{} available on {}", protocol, addr);
                true
            }
            Err(e) => {
                trace!("{} not available on {}: {}", protocol, addr, e);
                false
            }
        }
    }
}

async fn udp_exchange(addr: SocketAddr, packet: &[u8]) -> std::io::Result<()> {
    let bind: SocketAddr = match addr {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(addr).await?;
    socket.send(packet).await?;

    let mut buf = [0u8; 2048];
    socket.recv(&mut buf).await?;
    Ok(())
}

async fn tcp_exchange(addr: SocketAddr, packet: &[u8]) -> std::io::Result<()> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(packet).await?;

    let mut byte = [0u8; 1];
    let n = stream.read(&mut byte).await?;
    if n == 0 {
        return Err(std::io::ErrorKind::UnexpectedEof.into());
    }
    Ok(())
}

/// WireGuard handshake initiation with a fresh ephemeral key.
///
/// The encrypted fields are random. When the server key is known, `mac1` is
/// valid so the server does not drop the packet before looking at it.
pub fn wireguard_initiation(server_key: Option<&PublicKey>) -> Vec<u8> {
    let mut msg = Vec::with_capacity(WG_HANDSHAKE_INIT_LEN);

    // Type: handshake initiation, 3 reserved bytes
    msg.extend_from_slice(&[0x01, 0x00, 0x00, 0x00]);

    let sender_index: u32 = rand::random();
    msg.extend_from_slice(&sender_index.to_le_bytes());

    let ephemeral = KeyPair::generate();
    msg.extend_from_slice(&ephemeral.public.to_bytes());

    // Encrypted static (48) + encrypted timestamp (28)
    let filler: [u8; 32] = rand::random();
    let filler2: [u8; 32] = rand::random();
    let filler3: [u8; 12] = rand::random();
    msg.extend_from_slice(&filler);
    msg.extend_from_slice(&filler2);
    msg.extend_from_slice(&filler3);

    let mac1 = match server_key {
        Some(key) => wireguard_mac1(key, &msg),
        None => [0u8; 16],
    };
    msg.extend_from_slice(&mac1);

    // No cookie yet
    msg.extend_from_slice(&[0u8; 16]);
    msg
}

fn wireguard_mac1(server_key: &PublicKey, msg: &[u8]) -> [u8; 16] {
    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, WG_LABEL_MAC1);
    Digest::update(&mut hasher, server_key.to_bytes());
    let mac_key = hasher.finalize();

    let mut out = [0u8; 16];
    if let Ok(mut mac) = <Blake2sMac<U16> as Mac>::new_from_slice(&mac_key) {
        Mac::update(&mut mac, msg);
        out.copy_from_slice(&mac.finalize().into_bytes());
    }
    out
}

/// OpenVPN client hard reset (no tls-auth), optionally length-prefixed for TCP
pub fn openvpn_hard_reset(with_length: bool) -> Vec<u8> {
    let session_id: [u8; 8] = rand::random();

    let mut packet = Vec::with_capacity(16);
    packet.push(OPENVPN_HARD_RESET_CLIENT_V2);
    packet.extend_from_slice(&session_id);
    // Empty ack array, message packet id 0
    packet.push(0);
    packet.extend_from_slice(&0u32.to_be_bytes());

    if !with_length {
        return packet;
    }
    let mut framed = (packet.len() as u16).to_be_bytes().to_vec();
    framed.extend_from_slice(&packet);
    framed
}

/// Bare IKE_SA_INIT header from a random initiator SPI
pub fn ikev2_sa_init() -> Vec<u8> {
    let initiator_spi: [u8; 8] = rand::random();

    let mut packet = Vec::with_capacity(IKE_HEADER_LEN as usize);
    packet.extend_from_slice(&initiator_spi);
    packet.extend_from_slice(&[0u8; 8]); // responder SPI
    packet.push(0); // next payload: none
    packet.push(IKE_VERSION_2);
    packet.push(IKE_SA_INIT);
    packet.push(IKE_FLAG_INITIATOR);
    packet.extend_from_slice(&0u32.to_be_bytes()); // message id
    packet.extend_from_slice(&IKE_HEADER_LEN.to_be_bytes());
    packet
}
