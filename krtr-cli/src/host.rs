//! A minimal reference `LinkLayer` + `Delegate` pair: loopback over a single
//! process, so `krtr-cli` can exercise a live `MeshEngine` without a real
//! BLE adapter. Not a chat UI — frames are handed straight back to the same
//! engine's `handle_inbound_frame`, and delegate events are logged.

use krtr_mesh::transport::{ConnectionHandle, Delegate, DelegateEvent, LinkError, LinkLayer};
use krtr_proto::PeerId;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Captures frames a single-node demo would have written to the radio, so
/// `main` can feed them back in as the "other side" of a loopback link.
#[derive(Default)]
pub struct LoopbackLink {
    outbox: Mutex<VecDeque<(Option<ConnectionHandle>, Vec<u8>)>>,
}

impl LoopbackLink {
    pub fn drain(&self) -> Vec<(Option<ConnectionHandle>, Vec<u8>)> {
        self.outbox.lock().drain(..).collect()
    }
}

impl LinkLayer for LoopbackLink {
    fn send_frame(&self, connection: ConnectionHandle, frame: &[u8]) -> Result<(), LinkError> {
        self.outbox.lock().push_back((Some(connection), frame.to_vec()));
        Ok(())
    }

    fn broadcast_frame(&self, frame: &[u8], except: Option<ConnectionHandle>) -> Result<(), LinkError> {
        let _ = except;
        self.outbox.lock().push_back((None, frame.to_vec()));
        Ok(())
    }

    fn start_services(&self) -> Result<(), LinkError> {
        tracing::info!("loopback link: start_services");
        Ok(())
    }

    fn stop_services(&self) -> Result<(), LinkError> {
        tracing::info!("loopback link: stop_services");
        Ok(())
    }
}

/// Logs every delegate event at `info`, matching the host/UI boundary
/// described in §6 without implementing an actual view-model.
pub struct LoggingDelegate {
    nickname: Option<String>,
    user_id: PeerId,
}

impl LoggingDelegate {
    pub fn new(nickname: Option<String>, user_id: PeerId) -> Self {
        Self { nickname, user_id }
    }
}

impl Delegate for LoggingDelegate {
    fn on_event(&self, event: DelegateEvent) {
        match event {
            DelegateEvent::MessageReceived { message } | DelegateEvent::PrivateMessageReceived { message } => {
                println!("<{}> {}", message.sender_nickname.as_deref().unwrap_or("?"), message.content);
            }
            other => tracing::info!(?other, "delegate event"),
        }
    }

    fn current_nickname(&self) -> Option<String> {
        self.nickname.clone()
    }

    fn current_user_id(&self) -> PeerId {
        self.user_id
    }
}
