use crate::{
    context::ServerContext,
    error::{ServerError, ServerResult},
    messages::{ControlMessage, MessageType},
    registry::{ClientId, ClientIdentity, ControlHandle},
};
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// Accepts control connections until shutdown, one task per client.
pub async fn serve_control(
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!("Control channel listening on {}", listener.local_addr()?);
    loop {
        let (socket, addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept control connection: {}", e);
                    continue;
                }
            },
        };

        // Configure TCP keep-alive
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(10))
            .with_interval(Duration::from_secs(1));
        let sf = SockRef::from(&socket);
        if let Err(e) = sf.set_tcp_keepalive(&keepalive) {
            debug!("Keep-alive not set for {}: {}", addr, e);
        }

        let (reader, writer) = socket.into_split();
        tokio::spawn(handle_client(Arc::clone(&ctx), reader, writer, addr));
    }
    debug!("Control channel stopped");
    Ok(())
}

/// One control socket. Which identity it speaks for is whatever the
/// registry has bound to its handle.
struct Connection {
    ctx: Arc<ServerContext>,
    handle: ControlHandle,
}

impl Connection {
    async fn handle_line(&self, line: &str) -> Option<ControlMessage> {
        let request = match ControlMessage::from_json(line) {
            Ok(request) => request,
            Err(e) => {
                debug!("Unparseable control message: {}", e);
                return Some(ControlMessage::error(e.to_string()));
            }
        };

        match self.dispatch(&request).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!("{:?} failed: {}", request.kind, e);
                let mut reply = ControlMessage::error(e.to_string());
                reply.lobby_id = request.lobby_id.clone();
                Some(reply)
            }
        }
    }

    async fn dispatch(&self, request: &ControlMessage) -> ServerResult<Option<ControlMessage>> {
        request.validate()?;
        match request.kind {
            MessageType::Enter => self.enter(None).map(Some),
            MessageType::EnterWithId => self.enter(Some(request.player()?)).map(Some),
            MessageType::Reconnect => {
                self.reconnect(request.player()?)?;
                Ok(None)
            }
            MessageType::Heartbeat => {
                let id = self.identity()?;
                self.ctx.registry.touch_heartbeat(&id)?;
                Ok(Some(
                    ControlMessage::new(MessageType::Heartbeat)
                        .with_timestamp(self.ctx.time_sync.now_ms()),
                ))
            }
            MessageType::Exit => {
                let id = self.identity()?;
                info!("Client {} exiting", id);
                self.ctx.registry.remove(&id);
                Ok(Some(ControlMessage::success().with_player(id)))
            }
            MessageType::Ping => Ok(Some(
                ControlMessage::new(MessageType::Pong).with_timestamp(self.ctx.time_sync.now_ms()),
            )),
            _ => {
                let id = self.identity()?;
                self.ctx.facade.handle(&id, request).await.map(Some)
            }
        }
    }

    /// Allocates or reuses an identity for this connection and hands out an
    /// enter code for the data channel.
    fn enter(&self, requested: Option<&str>) -> ServerResult<ControlMessage> {
        let ctx = &self.ctx;
        let target = requested
            .map(str::to_string)
            .or_else(|| self.identity().ok());
        let id = match target {
            Some(id) if ctx.registry.contains(&id) => {
                self.release_other_identity(&id);
                ctx.registry.attach_control(&id, self.handle.clone())?;
                id
            }
            Some(id) => {
                self.release_other_identity(&id);
                ctx.registry
                    .register(ClientIdentity::new(id.clone(), Some(self.handle.clone())))?;
                id
            }
            None => {
                let identity = ClientIdentity::generate(Some(self.handle.clone()));
                let id = identity.id.clone();
                ctx.registry.register(identity)?;
                id
            }
        };

        Ok(self.enter_reply(&id))
    }

    fn reconnect(&self, id: &str) -> ServerResult<()> {
        if !self.ctx.registry.contains(id) {
            return Err(ServerError::client_not_found(id));
        }
        self.release_other_identity(id);
        self.ctx.registry.attach_control(id, self.handle.clone())?;
        info!("Client {} reconnected", id);

        // The code goes out before any replayed game or lobby state
        self.handle.send(Arc::new(self.enter_reply(id)));
        self.ctx.games.on_client_reconnect(id);
        Ok(())
    }

    fn enter_reply(&self, id: &str) -> ControlMessage {
        let code = self.ctx.enter_codes.issue(id);
        ControlMessage::new(MessageType::Enter)
            .with_player(id)
            .with_message(code)
    }

    /// A connection speaks for one identity at a time.
    fn release_other_identity(&self, next: &str) {
        if self.identity().is_ok_and(|current| current != next) {
            self.ctx.registry.detach_control(self.handle.connection_id);
        }
    }

    fn identity(&self) -> ServerResult<ClientId> {
        self.ctx
            .registry
            .lookup_by_control_handle(self.handle.connection_id)
            .map(|client| client.id)
            .ok_or_else(|| ServerError::NotFound("identity for this connection".into()))
    }
}

/// Reads newline-delimited JSON from one control connection until it
/// closes. The identity outlives the socket until it exits or times out.
pub async fn handle_client(
    ctx: Arc<ServerContext>,
    socket_reader: OwnedReadHalf,
    socket_writer: OwnedWriteHalf,
    addr: SocketAddr,
) {
    let connection_id = Uuid::new_v4();
    let (writer_tx, writer_rx) = mpsc::unbounded_channel::<Arc<ControlMessage>>();
    let mut write_task = tokio::spawn(handle_client_writer(socket_writer, writer_rx));

    info!("Connection {} opened from {}", connection_id, addr);
    let conn = Connection {
        ctx: Arc::clone(&ctx),
        handle: ControlHandle::new(connection_id, writer_tx),
    };

    let mut reader = tokio::io::BufReader::new(socket_reader);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Some(reply) = conn.handle_line(trimmed).await {
                    conn.handle.send(Arc::new(reply));
                }
            }
            Err(e) => {
                error!("Connection {} read error: {}", addr, e);
                break;
            }
        }
    }

    match ctx.registry.detach_control(connection_id) {
        Some(id) => info!("Client {} lost its control connection", id),
        None => debug!("Connection {} closed", connection_id),
    }

    drop(conn);
    if tokio::time::timeout(WRITER_DRAIN, &mut write_task)
        .await
        .is_err()
    {
        write_task.abort();
    }
}

/// Handle writing messages to the client socket
async fn handle_client_writer(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Arc<ControlMessage>>,
) {
    while let Some(message) = rx.recv().await {
        let line = format!("{}\n", message.to_json());
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            error!("Failed to write to client: {}", e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::data_channel::run_data_channel;
    use crate::messages::{DataCodec, DataMessage, DataMessageType};
    use serde_json::Value;
    use tokio::io::{BufReader, Lines};
    use tokio::net::{TcpStream, UdpSocket};

    struct Server {
        ctx: Arc<ServerContext>,
        control: SocketAddr,
        data: SocketAddr,
        shutdown: CancellationToken,
    }

    async fn start_server() -> Server {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let control = listener.local_addr().unwrap();
        let udp = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let data = udp.local_addr().unwrap();
        let ctx = ServerContext::new(&ServerConfig::default(), Arc::clone(&udp));
        let shutdown = CancellationToken::new();
        tokio::spawn(serve_control(Arc::clone(&ctx), listener, shutdown.clone()));
        tokio::spawn(run_data_channel(Arc::clone(&ctx), udp, shutdown.clone()));
        Server {
            ctx,
            control,
            data,
            shutdown,
        }
    }

    struct TestConnection {
        lines: Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl TestConnection {
        async fn open(addr: SocketAddr) -> Self {
            let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
            Self {
                lines: BufReader::new(reader).lines(),
                writer,
            }
        }

        async fn send(&mut self, json: &str) {
            self.writer
                .write_all(format!("{}\n", json).as_bytes())
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> ControlMessage {
            let line = tokio::time::timeout(Duration::from_secs(2), self.lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            ControlMessage::from_json(&line).unwrap()
        }

        /// Reads until a message of `kind` arrives.
        async fn expect(&mut self, kind: MessageType) -> ControlMessage {
            loop {
                let msg = self.recv().await;
                if msg.kind == kind {
                    return msg;
                }
            }
        }

        async fn request(&mut self, json: &str) -> ControlMessage {
            self.send(json).await;
            self.recv().await
        }
    }

    #[tokio::test]
    async fn test_enter_then_bind_data_channel() {
        let server = start_server().await;
        let mut conn = TestConnection::open(server.control).await;

        let entered = conn.request(r#"{"type":"ENTER"}"#).await;
        assert_eq!(entered.kind, MessageType::Enter);
        let id = entered.player_id.unwrap();
        let code = entered.message.unwrap();
        assert!(server.ctx.registry.contains(&id));

        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let enter = DataMessage::new(DataMessageType::Enter).with_data(Value::String(code));
        udp.send_to(&enter.encode(DataCodec::Json).unwrap(), server.data)
            .await
            .unwrap();
        let mut buf = [0u8; 2048];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), udp.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let (reply, codec) = DataMessage::decode(&buf[..len]).unwrap();
        assert_eq!(reply.actor.as_deref(), Some(id.as_str()));
        assert_eq!(codec, DataCodec::Json);

        let identity = server.ctx.registry.lookup_by_id(&id).unwrap();
        assert_eq!(identity.data_address, Some(udp.local_addr().unwrap()));

        let pong = conn.request(r#"{"type":"PING"}"#).await;
        assert_eq!(pong.kind, MessageType::Pong);
        let beat = conn.request(r#"{"type":"HEARTBEAT"}"#).await;
        assert_eq!(beat.kind, MessageType::Heartbeat);
        server.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_errors_are_replies() {
        let server = start_server().await;
        let mut conn = TestConnection::open(server.control).await;

        let garbage = conn.request("this is not json").await;
        assert_eq!(garbage.kind, MessageType::Error);

        // Requests need an identity first
        let anonymous = conn.request(r#"{"type":"GET_LOBBIES"}"#).await;
        assert_eq!(anonymous.kind, MessageType::Error);

        conn.request(r#"{"type":"ENTER_WITH_ID","playerId":"admin"}"#)
            .await;
        let missing = conn
            .request(r#"{"type":"JOIN_LOBBY","lobbyId":"ABCDE"}"#)
            .await;
        assert_eq!(missing.kind, MessageType::Error);
        assert!(missing.message.unwrap().contains("playerId"));

        let unknown = conn
            .request(r#"{"type":"JOIN_LOBBY","lobbyId":"ABCDE","playerId":"admin"}"#)
            .await;
        assert_eq!(unknown.kind, MessageType::Error);
        assert_eq!(unknown.lobby_id.as_deref(), Some("ABCDE"));

        // Still serving after all of the above
        let created = conn
            .request(r#"{"type":"CREATE_LOBBY","gameType":"WATER_RIPPLES"}"#)
            .await;
        assert_eq!(created.kind, MessageType::Success);
        assert!(created.lobby_id.is_some());
        server.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_reconnect_keeps_identity_and_lobby() {
        let server = start_server().await;
        let mut first = TestConnection::open(server.control).await;
        first
            .request(r#"{"type":"ENTER_WITH_ID","playerId":"alice"}"#)
            .await;
        let lobby_id = server
            .ctx
            .lobbies
            .create(crate::game::GameType::WaterRipples);
        server.ctx.lobbies.join(&lobby_id, "alice").unwrap();
        first.expect(MessageType::JoinedLobby).await;
        drop(first);

        // Closing the socket keeps the identity for a later reconnect
        tokio::time::timeout(Duration::from_secs(2), async {
            while server
                .ctx
                .registry
                .lookup_by_id("alice")
                .is_some_and(|c| c.control.is_some())
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(server.ctx.registry.contains("alice"));

        let mut second = TestConnection::open(server.control).await;
        let entered = second
            .request(r#"{"type":"RECONNECT","playerId":"alice"}"#)
            .await;
        assert_eq!(entered.kind, MessageType::Enter);
        assert!(entered.message.is_some());
        let joined = second.expect(MessageType::JoinedLobby).await;
        assert_eq!(joined.lobby_id, Some(lobby_id));

        second.send(r#"{"type":"EXIT"}"#).await;
        second.expect(MessageType::Success).await;
        assert!(!server.ctx.registry.contains("alice"));

        second
            .send(r#"{"type":"RECONNECT","playerId":"alice"}"#)
            .await;
        second.expect(MessageType::Error).await;
        server.shutdown.cancel();
    }
}
