//! The core dispatcher.
//!
//! One task owns the bus, the communication area, the channel table, and
//! the client registry, and reconciles three event sources: interrupts
//! from the board, traffic from client I/O tasks, and new connections on
//! the listener. Everything below runs to completion between awaits, so
//! no protocol state is ever observed half-updated.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

use a314_wire::framing::Frame;
use a314_wire::layout::r_event;
use a314_wire::message::Message;
use a314_wire::packet::{self, Packet, PacketBody, CONNECT_OK, CONNECT_UNKNOWN_SERVICE};
use a314_wire::WireError;

use crate::bus::{BusTransport, MAX_TRANSFER, READ_SRAM_HDR_LEN, WRITE_SRAM_HDR_LEN};
use crate::channels::ChannelTable;
use crate::clients::{ClientEvent, ClientId, ClientRegistry};
use crate::comm::CommArea;
use crate::config::OnDemandStart;
use crate::gpio::GpioIrq;
use crate::launcher;

/// How long a shutdown waits for the Amiga to drain open channels.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

/// Anything that ends the daemon. Client connections dying is routine and
/// handled inline; these are the conditions with no recovery path.
#[derive(Debug)]
pub enum BridgeError {
    /// A bus transfer failed; the peer state is unknowable afterwards.
    Bus(io::Error),
    /// Setup or event-loop level I/O failure.
    Io(io::Error),
    /// The Amiga side put something unparseable on the ring.
    Peer(WireError),
    /// CONNECT for a channel id that is already open.
    ChannelReused(u8),
    /// A client write failed with something other than a reset.
    ClientWrite(io::Error),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Bus(e) => write!(f, "bus transfer failed: {e}"),
            BridgeError::Io(e) => write!(f, "i/o failure: {e}"),
            BridgeError::Peer(e) => write!(f, "protocol violation from the Amiga: {e}"),
            BridgeError::ChannelReused(id) => {
                write!(f, "connect on channel {id} which is already open")
            }
            BridgeError::ClientWrite(e) => write!(f, "client write failed unexpectedly: {e}"),
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BridgeError::Bus(e) | BridgeError::Io(e) | BridgeError::ClientWrite(e) => Some(e),
            BridgeError::Peer(e) => Some(e),
            BridgeError::ChannelReused(_) => None,
        }
    }
}

/// The daemon core. Generic over the bus so the whole protocol stack runs
/// against an in-memory bus in tests.
pub struct Bridge<B> {
    bus: B,
    comm: CommArea,
    channels: ChannelTable,
    clients: ClientRegistry,
    on_demand: Vec<OnDemandStart>,
    events_rx: Option<mpsc::UnboundedReceiver<ClientEvent>>,
}

impl<B: BusTransport> Bridge<B> {
    pub fn new(bus: B, on_demand: Vec<OnDemandStart>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Bridge {
            bus,
            comm: CommArea::new(),
            channels: ChannelTable::new(),
            clients: ClientRegistry::new(events_tx),
            on_demand,
            events_rx: Some(events_rx),
        }
    }

    /// Run until SIGTERM, then drain.
    pub async fn run(mut self, listener: TcpListener, mut irq: GpioIrq) -> Result<(), BridgeError> {
        let mut sigterm = signal(SignalKind::terminate()).map_err(BridgeError::Io)?;
        let mut events_rx = match self.events_rx.take() {
            Some(rx) => rx,
            None => return Ok(()),
        };

        // Service whatever queued up before the first edge arrives.
        self.handle_irq()?;

        loop {
            tokio::select! {
                waited = irq.wait() => {
                    waited.map_err(BridgeError::Io)?;
                    self.handle_irq()?;
                }
                accepted = listener.accept() => {
                    let (stream, addr) = accepted.map_err(BridgeError::Io)?;
                    self.add_tcp_client(stream, addr)?;
                }
                Some(event) = events_rx.recv() => {
                    self.handle_client_event(event)?;
                    self.flush_and_post()?;
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM");
                    break;
                }
            }
        }

        drop(listener);
        self.drain(irq).await
    }

    fn add_tcp_client(&mut self, stream: TcpStream, addr: SocketAddr) -> Result<(), BridgeError> {
        stream.set_nodelay(true).map_err(BridgeError::Io)?;
        let id = self.clients.add(stream);
        tracing::info!(%id, %addr, "client connected");
        Ok(())
    }

    /// Tear down remaining clients, push the resulting resets toward the
    /// Amiga, and give it up to ten seconds to finish the conversation.
    async fn drain(mut self, mut irq: GpioIrq) -> Result<(), BridgeError> {
        for client in self.clients.ids() {
            self.remove_client(client);
        }
        self.flush_and_post()?;

        if self.channels.is_empty() {
            return Ok(());
        }

        tracing::info!(channels = self.channels.len(), "waiting for channels to drain");
        let deadline = Instant::now() + SHUTDOWN_DRAIN;
        while !self.channels.is_empty() {
            match tokio::time::timeout_at(deadline, irq.wait()).await {
                Ok(waited) => {
                    waited.map_err(BridgeError::Io)?;
                    self.handle_irq()?;
                }
                Err(_) => {
                    tracing::warn!("shutdown drain timed out");
                    break;
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // IRQ path: acknowledge, rediscover if needed, drain A2R, flush R2A
    // ========================================================================

    pub fn handle_irq(&mut self) -> Result<(), BridgeError> {
        let events = self.comm.ack_events(&mut self.bus).map_err(BridgeError::Bus)?;
        if events == 0 {
            return Ok(());
        }

        if events & r_event::BASE_ADDRESS != 0 || !self.comm.has_base_address() {
            if self.comm.has_base_address() && !self.channels.is_empty() {
                tracing::info!("base address updated while channels are open, closing channels");
            }
            self.close_all_channels();
            self.comm.rediscover(&mut self.bus).map_err(BridgeError::Bus)?;
            if let Some(base) = self.comm.base_address() {
                tracing::info!(base = format_args!("{base:#x}"), "communication area located");
            }
        }

        if !self.comm.has_base_address() {
            return Ok(());
        }

        self.comm.read_status(&mut self.bus).map_err(BridgeError::Bus)?;

        let received = self.receive_from_a2r()?;
        let sent = self.flush_send_queue()?;
        if received || sent {
            self.comm.write_status(&mut self.bus).map_err(BridgeError::Bus)?;
        }
        Ok(())
    }

    fn receive_from_a2r(&mut self) -> Result<bool, BridgeError> {
        let Some(buf) = self
            .comm
            .drain_a2r(&mut self.bus)
            .map_err(BridgeError::Bus)?
        else {
            return Ok(false);
        };

        for pkt in packet::decode_all(&buf).map_err(BridgeError::Peer)? {
            self.handle_packet(pkt)?;
        }
        Ok(true)
    }

    /// Serialize queued packets into the free part of the R2A ring,
    /// round-robin across channels, stopping at the first packet that does
    /// not fit. Returns whether anything was written.
    fn flush_send_queue(&mut self) -> Result<bool, BridgeError> {
        if !self.comm.has_base_address() {
            return Ok(false);
        }

        let mut space = self.comm.r2a_space();
        let mut chunk = Vec::with_capacity(space);
        while let Some(pkt) = self.channels.pop_fitting(space) {
            space -= pkt.encoded_len();
            pkt.encode_into(&mut chunk);
            self.channels.remove_if_idle(pkt.channel_id);
        }

        if chunk.is_empty() {
            return Ok(false);
        }
        self.comm
            .write_r2a(&mut self.bus, &chunk)
            .map_err(BridgeError::Bus)?;
        Ok(true)
    }

    /// Flush and, if anything moved, publish the new pointers and event
    /// bits. The client-event path ends here; the IRQ path folds the same
    /// publication into `handle_irq`.
    pub fn flush_and_post(&mut self) -> Result<(), BridgeError> {
        if self.flush_send_queue()? {
            self.comm.write_status(&mut self.bus).map_err(BridgeError::Bus)?;
        }
        Ok(())
    }

    // ========================================================================
    // Packets from the Amiga
    // ========================================================================

    fn handle_packet(&mut self, pkt: Packet) -> Result<(), BridgeError> {
        let channel_id = pkt.channel_id;
        match pkt.body {
            PacketBody::Connect(service) => self.handle_pkt_connect(channel_id, service)?,
            PacketBody::ConnectResponse(_) => {
                // Only meaningful for daemon-initiated connects, which are
                // not implemented; see the MSG_CONNECT no-op below.
                tracing::warn!(channel_id, "ignoring connect response from the Amiga");
            }
            PacketBody::Data(payload) => self.handle_pkt_data(channel_id, payload),
            PacketBody::Eos => self.handle_pkt_eos(channel_id),
            PacketBody::Reset => self.handle_pkt_reset(channel_id),
        }
        self.channels.remove_if_idle(channel_id);
        Ok(())
    }

    fn handle_pkt_connect(&mut self, channel_id: u8, service: Vec<u8>) -> Result<(), BridgeError> {
        if self.channels.contains(channel_id) {
            tracing::error!(channel_id, "connect on a channel believed to be allocated");
            return Err(BridgeError::ChannelReused(channel_id));
        }
        self.channels.create(channel_id);

        if let Some(owner) = self.clients.service_owner(&service) {
            self.associate(channel_id, owner, &service);
            return Ok(());
        }

        let entry = self
            .on_demand
            .iter()
            .find(|e| e.service_name.as_bytes() == service.as_slice())
            .cloned();
        if let Some(entry) = entry {
            match launcher::launch(&entry) {
                Ok(stream) => {
                    let owner = self.clients.add(stream);
                    self.clients.register_service(service.clone(), owner);
                    self.associate(channel_id, owner, &service);
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!(
                        service = %String::from_utf8_lossy(&service),
                        error = %e,
                        "failed to launch on-demand service"
                    );
                }
            }
        }

        self.channels.enqueue_packet(
            channel_id,
            PacketBody::ConnectResponse(vec![CONNECT_UNKNOWN_SERVICE]),
        );
        Ok(())
    }

    /// Wire a channel to a client: allocate the stream id, cross-link the
    /// records, and forward the connect request.
    fn associate(&mut self, channel_id: u8, owner: ClientId, service: &[u8]) {
        let Some(cc) = self.clients.get_mut(owner) else {
            return;
        };
        let stream_id = cc.allocate_stream_id();
        cc.associations.push(channel_id);
        cc.send(Message::Connect {
            stream_id,
            service: service.to_vec(),
        });

        if let Some(ch) = self.channels.get_mut(channel_id) {
            ch.association = Some(owner);
            ch.stream_id = stream_id;
        }
        tracing::debug!(
            channel_id,
            stream_id,
            %owner,
            service = %String::from_utf8_lossy(service),
            "channel associated"
        );
    }

    /// Undo a channel/client association from both sides.
    fn dissociate(&mut self, channel_id: u8) {
        let Some(ch) = self.channels.get_mut(channel_id) else {
            return;
        };
        let Some(owner) = ch.association.take() else {
            return;
        };
        ch.stream_id = 0;
        if let Some(cc) = self.clients.get_mut(owner) {
            cc.associations.retain(|&id| id != channel_id);
        }
    }

    fn handle_pkt_data(&mut self, channel_id: u8, payload: Vec<u8>) {
        let Some(ch) = self.channels.get(channel_id) else {
            return;
        };
        // After the Amiga's EOS no more data may reach the client.
        if ch.got_eos_from_amiga {
            return;
        }
        let Some(owner) = ch.association else {
            return;
        };
        let stream_id = ch.stream_id;
        if let Some(cc) = self.clients.get(owner) {
            cc.send(Message::Data { stream_id, payload });
        }
    }

    fn handle_pkt_eos(&mut self, channel_id: u8) {
        let Some(ch) = self.channels.get_mut(channel_id) else {
            return;
        };
        let Some(owner) = ch.association else {
            return;
        };
        if ch.got_eos_from_amiga {
            return;
        }
        ch.got_eos_from_amiga = true;
        let stream_id = ch.stream_id;
        let both_closed = ch.got_eos_from_client;

        if let Some(cc) = self.clients.get(owner) {
            cc.send(Message::Eos { stream_id });
        }
        if both_closed {
            self.dissociate(channel_id);
        }
    }

    fn handle_pkt_reset(&mut self, channel_id: u8) {
        if !self.channels.contains(channel_id) {
            return;
        }
        self.channels.clear_packet_queue(channel_id);

        let assoc = self
            .channels
            .get(channel_id)
            .and_then(|ch| ch.association.map(|owner| (owner, ch.stream_id)));
        if let Some((owner, stream_id)) = assoc {
            if let Some(cc) = self.clients.get(owner) {
                cc.send(Message::Reset { stream_id });
            }
            self.dissociate(channel_id);
        }
    }

    /// Force-close every channel; used when the Amiga republished its base
    /// address, which means the firmware restarted and the ring contents
    /// are gone.
    fn close_all_channels(&mut self) {
        for ch in self.channels.take_all() {
            if let Some(owner) = ch.association {
                if let Some(cc) = self.clients.get(owner) {
                    cc.send(Message::Reset {
                        stream_id: ch.stream_id,
                    });
                }
                if let Some(cc) = self.clients.get_mut(owner) {
                    cc.associations.retain(|&id| id != ch.channel_id);
                }
            }
        }
    }

    // ========================================================================
    // Messages from clients
    // ========================================================================

    pub fn handle_client_event(&mut self, event: ClientEvent) -> Result<(), BridgeError> {
        match event {
            ClientEvent::Frame { client, frame } => self.handle_client_frame(client, frame)?,
            ClientEvent::Closed { client } => self.remove_client(client),
            ClientEvent::WriteFailed { client, error } => {
                tracing::error!(%client, error = %error, "client write failed unexpectedly");
                return Err(BridgeError::ClientWrite(error));
            }
        }
        Ok(())
    }

    fn handle_client_frame(&mut self, client: ClientId, frame: Frame) -> Result<(), BridgeError> {
        let msg = match frame.parse() {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(%client, error = %e, "dropping client message");
                return Ok(());
            }
        };

        match msg {
            Message::RegisterReq { name } => {
                let ok = self.clients.register_service(name, client);
                if let Some(cc) = self.clients.get(client) {
                    cc.send(Message::RegisterRes { ok });
                }
            }
            Message::DeregisterReq { name } => {
                let ok = self.clients.deregister_service(&name, client);
                if let Some(cc) = self.clients.get(client) {
                    cc.send(Message::DeregisterRes { ok });
                }
            }
            Message::ReadMemReq { address, length } => {
                self.handle_read_mem(client, address, length)?;
            }
            Message::WriteMemReq { address, data } => {
                self.handle_write_mem(client, address, data)?;
            }
            Message::Connect { .. } => {
                // Connecting to a service on the Amiga is not implemented.
                tracing::debug!(%client, "ignoring connect request toward the Amiga");
            }
            Message::ConnectResponse { stream_id, payload } => {
                if payload.len() > packet::MAX_PAYLOAD {
                    tracing::warn!(%client, "oversized connect response dropped");
                } else if let Some(channel_id) = self.find_channel(client, stream_id) {
                    let status = payload[0];
                    self.channels
                        .enqueue_packet(channel_id, PacketBody::ConnectResponse(payload));
                    if status != CONNECT_OK {
                        self.dissociate(channel_id);
                    }
                }
            }
            Message::Data { stream_id, payload } => {
                if payload.len() > packet::MAX_PAYLOAD {
                    // A ring packet cannot carry it and splitting is the
                    // client library's job.
                    tracing::warn!(%client, len = payload.len(), "oversized data message dropped");
                } else if let Some(channel_id) = self.find_channel(client, stream_id) {
                    self.channels
                        .enqueue_packet(channel_id, PacketBody::Data(payload));
                }
            }
            Message::Eos { stream_id } => self.handle_msg_eos(client, stream_id),
            Message::Reset { stream_id } => {
                if let Some(channel_id) = self.find_channel(client, stream_id) {
                    self.dissociate(channel_id);
                    self.channels.clear_packet_queue(channel_id);
                    self.channels.enqueue_packet(channel_id, PacketBody::Reset);
                }
            }
            other => {
                // Response types only ever flow toward clients.
                tracing::warn!(%client, kind = other.type_byte(), "unexpected message from client");
            }
        }
        Ok(())
    }

    fn handle_msg_eos(&mut self, client: ClientId, stream_id: u32) {
        let Some(channel_id) = self.find_channel(client, stream_id) else {
            return;
        };
        let already = self
            .channels
            .get(channel_id)
            .is_none_or(|ch| ch.got_eos_from_client);
        if already {
            return;
        }

        if let Some(ch) = self.channels.get_mut(channel_id) {
            ch.got_eos_from_client = true;
        }
        self.channels.enqueue_packet(channel_id, PacketBody::Eos);

        let both_closed = self
            .channels
            .get(channel_id)
            .is_some_and(|ch| ch.got_eos_from_amiga);
        if both_closed {
            self.dissociate(channel_id);
        }
    }

    fn handle_read_mem(
        &mut self,
        client: ClientId,
        address: u32,
        length: u32,
    ) -> Result<(), BridgeError> {
        let length = length as usize;
        if length + READ_SRAM_HDR_LEN > MAX_TRANSFER {
            tracing::warn!(%client, length, "memory read larger than one transfer dropped");
            return Ok(());
        }
        let data = self
            .bus
            .read_sram(address, length)
            .map_err(BridgeError::Bus)?;
        if let Some(cc) = self.clients.get(client) {
            cc.send(Message::ReadMemRes { data });
        }
        Ok(())
    }

    fn handle_write_mem(
        &mut self,
        client: ClientId,
        address: u32,
        data: Vec<u8>,
    ) -> Result<(), BridgeError> {
        if data.len() + WRITE_SRAM_HDR_LEN > MAX_TRANSFER {
            tracing::warn!(%client, length = data.len(), "memory write larger than one transfer dropped");
            return Ok(());
        }
        self.bus
            .write_sram(address, &data)
            .map_err(BridgeError::Bus)?;
        if let Some(cc) = self.clients.get(client) {
            cc.send(Message::WriteMemRes);
        }
        Ok(())
    }

    /// Resolve a client's stream id to the associated channel.
    fn find_channel(&self, client: ClientId, stream_id: u32) -> Option<u8> {
        let cc = self.clients.get(client)?;
        cc.associations.iter().copied().find(|&id| {
            self.channels
                .get(id)
                .is_some_and(|ch| ch.stream_id == stream_id)
        })
    }

    /// Close a client: reset every channel it was serving, drop its
    /// services, stop its I/O task.
    fn remove_client(&mut self, client: ClientId) {
        let Some(cc) = self.clients.remove(client) else {
            return;
        };
        tracing::info!(%client, "client removed");

        for channel_id in cc.associations {
            self.channels.clear_packet_queue(channel_id);
            self.channels.enqueue_packet(channel_id, PacketBody::Reset);
            if let Some(ch) = self.channels.get_mut(channel_id) {
                ch.association = None;
                ch.stream_id = 0;
            }
        }
    }

    // ========================================================================
    // Test access
    // ========================================================================

    #[cfg(test)]
    pub(crate) fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    #[cfg(test)]
    pub(crate) fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    #[cfg(test)]
    pub(crate) fn clients_mut(&mut self) -> &mut ClientRegistry {
        &mut self.clients
    }

    #[cfg(test)]
    pub(crate) fn comm(&self) -> &CommArea {
        &self.comm
    }

    #[cfg(test)]
    pub(crate) async fn expect_event(&mut self) -> ClientEvent {
        self.events_rx
            .as_mut()
            .expect("event receiver taken")
            .recv()
            .await
            .expect("event channel closed")
    }
}
