use crate::{
    context::ServerContext,
    error::{ServerError, ServerResult},
    messages::{DataCodec, DataMessage, DataMessageType},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const MAX_DATAGRAM: usize = 64 * 1024;
const SEND_QUEUE: usize = 1024;

/// Best-effort outbound side of the data channel. Callers never wait: datagrams
/// are queued for a writer task, and dropped when the queue is full.
#[derive(Clone)]
pub struct DataSender {
    tx: mpsc::Sender<(SocketAddr, Vec<u8>)>,
}

impl DataSender {
    /// Spawns the writer task; it stops once every sender is dropped.
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        let (tx, rx) = mpsc::channel(SEND_QUEUE);
        tokio::spawn(handle_data_writer(socket, rx));
        Self { tx }
    }

    pub fn send(&self, addr: SocketAddr, message: &DataMessage, codec: DataCodec) -> bool {
        let bytes = match message.encode(codec) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode {:?} for {}: {}", message.kind, addr, e);
                return false;
            }
        };
        match self.tx.try_send((addr, bytes)) {
            Ok(()) => true,
            Err(e) => {
                debug!("Dropped {:?} datagram to {}: {}", message.kind, addr, e);
                false
            }
        }
    }
}

async fn handle_data_writer(
    socket: Arc<UdpSocket>,
    mut rx: mpsc::Receiver<(SocketAddr, Vec<u8>)>,
) {
    while let Some((addr, bytes)) = rx.recv().await {
        if let Err(e) = socket.send_to(&bytes, addr).await {
            debug!("Failed to send datagram to {}: {}", addr, e);
        }
    }
    trace!("Data writer stopped");
}

/// Receives datagrams until shutdown. A bad datagram is logged and skipped.
pub async fn run_data_channel(
    ctx: Arc<ServerContext>,
    socket: Arc<UdpSocket>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!("Data channel listening on {}", socket.local_addr()?);
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (len, from) = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    // ICMP errors from earlier sends surface here on some platforms
                    debug!("Data channel receive error: {}", e);
                    continue;
                }
            },
        };

        if let Err(e) = handle_datagram(&ctx, &buf[..len], from) {
            debug!("Datagram from {} rejected: {}", from, e);
        }
    }

    debug!("Data channel stopped");
    Ok(())
}

pub fn handle_datagram(ctx: &ServerContext, bytes: &[u8], from: SocketAddr) -> ServerResult<()> {
    let (message, codec) = DataMessage::decode(bytes)?;
    trace!("{:?} from {}", message.kind, from);

    match message.kind {
        DataMessageType::Enter => {
            let code = message
                .enter_code()
                .ok_or_else(|| ServerError::Protocol("ENTER without a code".into()))?;
            let client_id = ctx
                .enter_codes
                .redeem(code)
                .ok_or_else(|| ServerError::NotFound("enter code".into()))?;
            ctx.registry.bind_data_address(&client_id, from)?;
            ctx.registry.touch_heartbeat(&client_id)?;
            info!("Client {} bound data address {}", client_id, from);

            let reply = DataMessage::new(DataMessageType::Enter)
                .with_actor(client_id)
                .with_timestamp(ctx.time_sync.now_ms());
            ctx.data.send(from, &reply, codec);
        }
        DataMessageType::Ping => {
            let pong = DataMessage::new(DataMessageType::Pong)
                .with_timestamp(ctx.time_sync.now_ms())
                .with_sequence(message.sequence_number);
            ctx.data.send(from, &pong, codec);
        }
        DataMessageType::Heartbeat => {
            let client = ctx
                .registry
                .lookup_by_data_address(from)
                .ok_or_else(|| ServerError::NotFound(format!("client at {}", from)))?;
            ctx.registry.touch_heartbeat(&client.id)?;
            let echo = DataMessage::new(DataMessageType::Heartbeat)
                .with_timestamp(ctx.time_sync.now_ms())
                .with_sequence(message.sequence_number);
            ctx.data.send(from, &echo, codec);
        }
        DataMessageType::UserInput => {
            let client = ctx
                .registry
                .lookup_by_data_address(from)
                .ok_or_else(|| ServerError::NotFound(format!("client at {}", from)))?;
            ctx.games.handle_action(&client.id, &message, codec)?;
        }
        DataMessageType::Pong | DataMessageType::Sync => {
            return Err(ServerError::Protocol(format!(
                "{:?} is server-to-client only",
                message.kind
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::registry::ClientIdentity;
    use serde_json::Value;
    use std::time::Duration;

    struct Harness {
        ctx: Arc<ServerContext>,
        server: SocketAddr,
        shutdown: CancellationToken,
    }

    async fn start() -> Harness {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let server = socket.local_addr().unwrap();
        let ctx = ServerContext::new(&ServerConfig::default(), Arc::clone(&socket));
        let shutdown = CancellationToken::new();
        tokio::spawn(run_data_channel(Arc::clone(&ctx), socket, shutdown.clone()));
        Harness {
            ctx,
            server,
            shutdown,
        }
    }

    async fn exchange(
        client: &UdpSocket,
        server: SocketAddr,
        message: &DataMessage,
        codec: DataCodec,
    ) -> (DataMessage, DataCodec) {
        client
            .send_to(&message.encode(codec).unwrap(), server)
            .await
            .unwrap();
        let mut buf = [0u8; 2048];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        DataMessage::decode(&buf[..len]).unwrap()
    }

    #[tokio::test]
    async fn test_sender_delivers_from_idle_socket() {
        // Nothing has been received on this socket yet
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let sender = DataSender::new(socket);
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        for sequence in 0..3 {
            let message = DataMessage::new(DataMessageType::Sync).with_sequence(sequence);
            assert!(sender.send(peer.local_addr().unwrap(), &message, DataCodec::MsgPack));
        }
        for sequence in 0..3 {
            let mut buf = [0u8; 2048];
            let (len, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let (received, _) = DataMessage::decode(&buf[..len]).unwrap();
            assert_eq!(received.sequence_number, sequence);
        }
    }

    #[tokio::test]
    async fn test_ping_answered_in_same_codec() {
        let h = start().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        for codec in [DataCodec::Json, DataCodec::MsgPack] {
            let ping = DataMessage::new(DataMessageType::Ping).with_sequence(41);
            let (pong, reply_codec) = exchange(&client, h.server, &ping, codec).await;
            assert_eq!(pong.kind, DataMessageType::Pong);
            assert_eq!(pong.sequence_number, 41);
            assert!(pong.timestamp > 0);
            assert_eq!(reply_codec, codec);
        }
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_enter_binds_address_once() {
        let h = start().await;
        h.ctx
            .registry
            .register(ClientIdentity::new("alice", None))
            .unwrap();
        let code = h.ctx.enter_codes.issue("alice");
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let enter = DataMessage::new(DataMessageType::Enter).with_data(Value::String(code.clone()));
        let (reply, _) = exchange(&client, h.server, &enter, DataCodec::MsgPack).await;
        assert_eq!(reply.kind, DataMessageType::Enter);
        assert_eq!(reply.actor.as_deref(), Some("alice"));

        let bound = h
            .ctx
            .registry
            .lookup_by_data_address(client.local_addr().unwrap())
            .unwrap();
        assert_eq!(bound.id, "alice");

        // Codes are single use
        let err = handle_datagram(
            &h.ctx,
            &enter.encode(DataCodec::Json).unwrap(),
            client.local_addr().unwrap(),
        )
        .unwrap_err();
        assert!(err.is_not_found());
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_bad_datagrams_do_not_stop_the_loop() {
        let h = start().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        client.send_to(b"\xc1 not a message", h.server).await.unwrap();
        client.send_to(b"{\"type\":\"NOPE\"}", h.server).await.unwrap();
        let input = DataMessage::new(DataMessageType::UserInput);
        client
            .send_to(&input.encode(DataCodec::Json).unwrap(), h.server)
            .await
            .unwrap();

        let ping = DataMessage::new(DataMessageType::Ping).with_sequence(1);
        let (pong, _) = exchange(&client, h.server, &ping, DataCodec::Json).await;
        assert_eq!(pong.kind, DataMessageType::Pong);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unbound_heartbeat_rejected() {
        let h = start().await;
        let bytes = DataMessage::new(DataMessageType::Heartbeat)
            .encode(DataCodec::Json)
            .unwrap();
        let from: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert!(handle_datagram(&h.ctx, &bytes, from).unwrap_err().is_not_found());
    }
}
