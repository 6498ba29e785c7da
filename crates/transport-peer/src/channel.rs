use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::config::ChannelOptions;
use crate::error::TransportResult;
use crate::transport::{ChannelEvent, ChannelHandle, ChannelPayload, ChannelState};

/// User-facing data channel. Republishes the native channel's
/// open/message/error/close signals and forwards send/close.
pub struct DataChannel {
    handle: Arc<dyn ChannelHandle>,
    events: AsyncMutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

impl DataChannel {
    pub fn new(handle: Arc<dyn ChannelHandle>) -> Self {
        let events = handle.take_events();
        Self {
            handle,
            events: AsyncMutex::new(events),
        }
    }

    pub fn label(&self) -> String {
        self.handle.label()
    }

    pub fn options(&self) -> ChannelOptions {
        self.handle.options()
    }

    pub fn ordered(&self) -> bool {
        self.handle.options().ordered
    }

    pub fn max_packet_life_time(&self) -> Option<u16> {
        self.handle.options().max_packet_life_time
    }

    pub fn max_retransmits(&self) -> Option<u16> {
        self.handle.options().max_retransmits
    }

    pub fn protocol(&self) -> String {
        self.handle.options().protocol
    }

    pub fn negotiated(&self) -> Option<u16> {
        self.handle.options().negotiated
    }

    pub fn id(&self) -> Option<u16> {
        self.handle.id()
    }

    pub fn ready_state(&self) -> ChannelState {
        self.handle.ready_state()
    }

    pub fn buffered_amount(&self) -> usize {
        self.handle.buffered_amount()
    }

    pub fn send(&self, payload: impl Into<ChannelPayload>) -> TransportResult<()> {
        self.handle.send(payload.into())
    }

    pub fn close(&self) -> TransportResult<()> {
        self.handle.close()
    }

    /// Next channel event; `None` once the native channel is gone.
    pub async fn recv(&self) -> Option<ChannelEvent> {
        let mut guard = self.events.lock().await;
        guard.as_mut()?.recv().await
    }

    /// Next message, skipping open/error notifications. `None` after close.
    pub async fn recv_message(&self) -> Option<ChannelPayload> {
        loop {
            match self.recv().await? {
                ChannelEvent::Message(payload) => return Some(payload),
                ChannelEvent::Close => return None,
                ChannelEvent::Open | ChannelEvent::Error(_) => continue,
            }
        }
    }

    /// Resolves once the channel is open. Returns `false` if it closed first.
    pub async fn opened(&self) -> bool {
        if self.ready_state() == ChannelState::Open {
            return true;
        }
        loop {
            match self.recv().await {
                Some(ChannelEvent::Open) => return true,
                Some(ChannelEvent::Close) | None => return false,
                Some(_) => continue,
            }
        }
    }
}

impl fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannel")
            .field("label", &self.label())
            .field("ready_state", &self.ready_state())
            .finish()
    }
}
