//! Per-session attachment to the four session queues.
//!
//! A [`RelayChannel`] is exclusively owned by the task pumping one tunnel.
//! It publishes on the two outbound queues of its role and holds the
//! subscriptions of the two inbound ones; inbound envelopes arrive on the
//! receivers of the paired [`RelayInbound`].

use relaytun_core::queue::QueueNames;
use relaytun_core::{
    ControlCommand, Cryptographer, GatewayPublicKey, GatewayResult, MessageType, QueueProducer,
    RelayLink, Role, Subscription,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Inbound envelope streams of one session.
pub struct RelayInbound {
    pub data: mpsc::UnboundedReceiver<Vec<u8>>,
    pub control: mpsc::UnboundedReceiver<Vec<u8>>,
}

pub struct RelayChannel {
    queue_id: String,
    link: Arc<dyn RelayLink>,
    crypto: Arc<Cryptographer>,
    peer_key: GatewayPublicKey,
    data_out: QueueProducer,
    control_out: QueueProducer,
    control_in: String,
    subscriptions: Vec<Subscription>,
}

impl RelayChannel {
    /// Subscribe to the inbound queues of `role` and bind producers to the
    /// outbound ones.
    pub async fn attach(
        link: Arc<dyn RelayLink>,
        crypto: Arc<Cryptographer>,
        peer_key: GatewayPublicKey,
        role: Role,
        queue_id: &str,
        names: &QueueNames,
    ) -> GatewayResult<(Self, RelayInbound)> {
        let inbound = names.inbound(role);
        let outbound = names.outbound(role);

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        // Control first, so a CLOSE is never delivered to a session that has
        // not yet got a way to hear it.
        let control_sub = link.subscribe(inbound.control, control_tx).await?;
        let data_sub = link.subscribe(inbound.data, data_tx).await?;

        debug!(
            %queue_id,
            %role,
            data_in = inbound.data,
            data_out = outbound.data,
            "attached to session queues"
        );

        let channel = Self {
            queue_id: queue_id.to_string(),
            data_out: QueueProducer::new(link.clone(), outbound.data),
            control_out: QueueProducer::new(link.clone(), outbound.control),
            control_in: inbound.control.to_string(),
            link,
            crypto,
            peer_key,
            subscriptions: vec![control_sub, data_sub],
        };
        Ok((
            channel,
            RelayInbound {
                data: data_rx,
                control: control_rx,
            },
        ))
    }

    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }

    /// Largest plaintext chunk one envelope may carry.
    pub fn max_chunk(&self) -> usize {
        self.crypto.max_message_size()
    }

    pub async fn send_data(&self, chunk: &[u8]) -> GatewayResult<()> {
        self.data_out
            .send(&self.crypto, MessageType::Raw, chunk, &self.peer_key)
            .await
    }

    pub async fn send_control(&self, command: &ControlCommand) -> GatewayResult<()> {
        self.control_out
            .send(
                &self.crypto,
                MessageType::Control,
                command.to_wire().as_bytes(),
                &self.peer_key,
            )
            .await
    }

    pub async fn send_close(&self) -> GatewayResult<()> {
        self.send_control(&ControlCommand::close(&self.queue_id)).await
    }

    /// Decrypt an envelope from the inbound data queue.
    pub fn open_data(&self, raw: &[u8]) -> GatewayResult<Vec<u8>> {
        self.crypto.open(raw, MessageType::Raw, &self.peer_key)
    }

    /// Decrypt an envelope from the inbound control queue. The plaintext
    /// still has to go through [`parse_control`](Self::parse_control).
    pub fn open_control(&self, raw: &[u8]) -> GatewayResult<Vec<u8>> {
        self.crypto.open(raw, MessageType::Control, &self.peer_key)
    }

    /// Parse a decrypted control payload against the queue it arrived on.
    pub fn parse_control(&self, plaintext: &[u8]) -> GatewayResult<ControlCommand> {
        ControlCommand::parse_for_queue(plaintext, &self.control_in)
    }

    /// Stop consuming the inbound queues. The link itself stays up; it
    /// belongs to the pool.
    pub fn detach(&mut self) {
        self.subscriptions.clear();
    }
}

impl std::fmt::Debug for RelayChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayChannel")
            .field("queue_id", &self.queue_id)
            .field("relay", self.link.endpoint())
            .field("peer", &self.peer_key.short_fingerprint())
            .finish()
    }
}
