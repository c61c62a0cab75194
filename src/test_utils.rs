use crate::messages::{ControlMessage, MessageType};
use crate::registry::{ClientIdentity, ClientRegistry, ControlHandle};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

pub fn contains_response_of_type(responses: &[Arc<ControlMessage>], kind: MessageType) -> bool {
    responses.iter().any(|msg| msg.kind == kind)
}

pub fn find_response(
    responses: &[Arc<ControlMessage>],
    kind: MessageType,
) -> Option<Arc<ControlMessage>> {
    responses.iter().find(|msg| msg.kind == kind).cloned()
}

/// A registered client whose control channel is an in-memory queue.
pub struct TestClient {
    pub id: String,
    pub connection_id: Uuid,
    rx: mpsc::UnboundedReceiver<Arc<ControlMessage>>,
}

impl TestClient {
    pub fn register(registry: &ClientRegistry, id: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = Uuid::new_v4();
        registry
            .register(ClientIdentity::new(id, Some(ControlHandle::new(connection_id, tx))))
            .expect("test client registers");
        Self {
            id: id.to_string(),
            connection_id,
            rx,
        }
    }

    pub fn drain(&mut self) -> Vec<Arc<ControlMessage>> {
        let mut received = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            received.push(msg);
        }
        received
    }
}
