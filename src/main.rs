//! Rune Relic Auth Daemon
//!
//! UDP listener that admits peers through the session handshake and logs the
//! verified traffic they send. Set `AUTHD_DEMO=1` to run an in-process
//! initiator against a loopback listener instead.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing::info;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use rune_relic_auth::{
    auth::{
        directory::{LocalIdentity, PeerRecord, PreSharedKeyExchange, StaticDirectory},
        handshake::VerifiedMessage,
        peer::Transport,
    },
    network::{AuthServer, ServerConfig},
    AuthStage, HandshakeOutcome, HandshakeProtocol, Initiator, VERSION,
};

const DEMO_CLIENT_ID: u64 = 1001;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Rune Relic Auth v{}", VERSION);

    if std::env::var("AUTHD_DEMO").is_ok_and(|v| v == "1" || v == "true") {
        return demo_handshake().await;
    }

    let config = ServerConfig::from_env();
    let directory = match &config.directory_path {
        Some(path) => StaticDirectory::from_json_file(path)
            .with_context(|| format!("loading directory {}", path.display()))?,
        None => StaticDirectory::new(),
    };
    info!("Loaded {} peers", directory.len());
    info!("Local entity: {}", config.auth.local_entity_id);

    let (tx, rx) = unbounded_channel();
    spawn_message_logger(rx);

    let protocol = HandshakeProtocol::new(directory, PreSharedKeyExchange, tx, config.auth.clone());
    let server = Arc::new(AuthServer::bind(config, protocol).await.context("binding listener")?);

    let runner = server.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    server.shutdown();
    handle.await.context("server task panicked")??;

    Ok(())
}

fn spawn_message_logger(mut rx: UnboundedReceiver<VerifiedMessage>) {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            info!(
                "Entity {} on socket {}: {} bytes ({})",
                message.peer,
                message.socket,
                message.payload.len(),
                hex::encode(&message.payload[..message.payload.len().min(8)])
            );
        }
    });
}

/// Demo: authenticate an in-process initiator over loopback UDP.
async fn demo_handshake() -> Result<()> {
    info!("=== Starting Demo Handshake ===");

    let psk: [u8; 32] = rand::random();
    info!("Pre-shared key fingerprint: {}", hex::encode(&psk[..4]));

    let mut directory = StaticDirectory::new();
    directory.insert(DEMO_CLIENT_ID, psk.to_vec());

    let mut config = ServerConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        ..ServerConfig::default()
    };
    config.auth.local_entity_id = 1;

    let (tx, rx) = unbounded_channel();
    spawn_message_logger(rx);

    let protocol = HandshakeProtocol::new(directory, PreSharedKeyExchange, tx, config.auth.clone());
    let server = Arc::new(AuthServer::bind(config, protocol).await?);
    let server_addr = server.local_addr()?;
    let runner = server.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    let socket = UdpSocket::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let client = Initiator::new(
        LocalIdentity {
            entity_id: DEMO_CLIENT_ID,
        },
        PeerRecord {
            entity_id: 1,
            key_material: Zeroizing::new(psk.to_vec()),
        },
        server_addr,
        PreSharedKeyExchange,
        Default::default(),
    );

    socket.send_to(&client.identity_claim()?, server_addr).await?;
    let salt = Initiator::<PreSharedKeyExchange>::fresh_salt();
    socket.send_to(&client.key_agreement(&salt)?, server_addr).await?;
    socket.send_to(&client.confirmation()?, server_addr).await?;

    let acceptance = recv_with_timeout(&socket).await?;
    match client.handle_acceptance(&acceptance)? {
        HandshakeOutcome::Advanced(AuthStage::Authenticated) => info!("Client authenticated"),
        other => bail!("handshake did not complete: {:?}", other),
    }

    for i in 0..3u8 {
        socket
            .send_to(&client.seal_udp(&[b'm', b's', b'g', b'0' + i])?, server_addr)
            .await?;
    }

    server.send(socket.local_addr()?, b"welcome").await?;
    if let Some(reply) = client.open(&recv_with_timeout(&socket).await?, Transport::Udp)? {
        info!("Server says: {}", String::from_utf8_lossy(&reply));
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    info!("=== Demo Results ===");
    for entry in server.connections().reap_view(rune_relic_auth::auth::peer::unix_millis()) {
        info!(
            "{} socket {} stage {} age {}ms",
            entry.remote, entry.socket, entry.stage, entry.age_millis
        );
    }

    server.shutdown();
    handle.await??;
    Ok(())
}

async fn recv_with_timeout(socket: &UdpSocket) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; 2048];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .context("timed out waiting for server")??;
    buf.truncate(len);
    Ok(buf)
}
