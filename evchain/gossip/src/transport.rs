use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::GossipConfig;
use crate::crypto::PacketCipher;
use crate::error::GossipError;
use crate::membership::{ControlMessage, Member, Membership};
use crate::queue::FrameQueue;
use crate::router::{FrameRouter, InboundMessage};

const PACKET_CONTROL: u8 = 0x00;
const PACKET_FRAME: u8 = 0x01;

/// Maximum accepted length of a reliable-unicast payload.
const MAX_TCP_MESSAGE: u32 = 64 * 1024 * 1024;

/// Frames popped per gossip tick before yielding back to the timer.
const GOSSIP_BATCH: usize = 32;

/// The cluster transport: SWIM-style membership plus the fragmenting,
/// compressing, retransmitting datagram bus.
pub struct GossipTransport {
    config: GossipConfig,
    local: Member,
    membership: Arc<Membership>,
    router: Arc<FrameRouter>,
    udp: Arc<UdpSocket>,
    cipher: Option<Arc<PacketCipher>>,
    seq: AtomicU64,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
}

impl GossipTransport {
    /// Binds the UDP gossip socket and the TCP unicast listener on one
    /// port, then starts the transport's background loops.
    pub async fn bind(config: GossipConfig) -> Result<Arc<Self>, GossipError> {
        let (udp, tcp) = bind_pair(&config).await?;
        let udp = Arc::new(udp);

        let advertised = match config.advertise_addr {
            Some(addr) => addr,
            None => udp.local_addr()?,
        };
        let local = Member {
            name: config.node_name.clone(),
            addr: advertised,
        };

        let membership = Arc::new(Membership::new(local.clone(), config.suspicion_timeout));
        let (router, inbound) = FrameRouter::new(
            config.node_name.clone(),
            config.retransmit_multiplier,
            config.wait_timeout,
        );
        let cipher = config
            .shared_key
            .as_ref()
            .map(|key| Arc::new(PacketCipher::new(key)));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let transport = Arc::new(GossipTransport {
            config,
            local,
            membership,
            router,
            udp,
            cipher,
            seq: AtomicU64::new(0),
            shutdown,
            handles: Mutex::new(Vec::new()),
            inbound: Mutex::new(Some(inbound)),
        });

        let mut handles = vec![
            tokio::spawn(udp_read_loop(Arc::clone(&transport), shutdown_rx.clone())),
            tokio::spawn(tcp_accept_loop(
                Arc::clone(&transport),
                tcp,
                shutdown_rx.clone(),
            )),
            tokio::spawn(gossip_pump(Arc::clone(&transport), shutdown_rx.clone())),
            tokio::spawn(probe_loop(Arc::clone(&transport), shutdown_rx.clone())),
            tokio::spawn(prune_loop(Arc::clone(&transport), shutdown_rx.clone())),
        ];
        if !transport.config.peers.is_empty() {
            handles.push(tokio::spawn(join_loop(
                Arc::clone(&transport),
                shutdown_rx,
            )));
        }
        *transport.handles.lock() = handles;

        info!(
            name = %transport.local.name,
            addr = %transport.local.addr,
            "gossip transport started"
        );
        Ok(transport)
    }

    /// This replica's name inside the cluster.
    pub fn identifier(&self) -> &str {
        &self.local.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local.addr
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    /// Takes the stream of reassembled inbound messages. Single consumer.
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<InboundMessage>> {
        self.inbound.lock().take()
    }

    /// Enqueues a message for fragmented delivery to all members. With
    /// gossip disabled, falls back to one reliable unicast per member.
    pub async fn broadcast(&self, bytes: Vec<u8>) -> Result<(), GossipError> {
        if self.config.use_gossip {
            self.router.enqueue(bytes);
            return Ok(());
        }

        for member in self.membership.peers() {
            if let Err(err) = self.unicast_to_member(&member, bytes.clone()).await {
                warn!(%err, destination = %member.name, "failed to send fallback unicast");
            }
        }
        Ok(())
    }

    /// Reliable single-frame delivery to a named member over TCP.
    pub async fn unicast(&self, target: &str, bytes: Vec<u8>) -> Result<(), GossipError> {
        let member = self
            .membership
            .get(target)
            .ok_or_else(|| GossipError::TargetNotFound(target.to_string()))?;
        self.unicast_to_member(&member, bytes).await
    }

    /// Reliable delivery to a uniformly random member other than self.
    pub async fn unicast_random_neighbour(&self, bytes: Vec<u8>) -> Result<(), GossipError> {
        let member = self
            .membership
            .random_neighbour()
            .ok_or(GossipError::ClusterEmpty)?;
        self.unicast_to_member(&member, bytes).await
    }

    async fn unicast_to_member(
        &self,
        member: &Member,
        bytes: Vec<u8>,
    ) -> Result<(), GossipError> {
        // TCP needs no fragmentation: encode one jumbo frame.
        let mut queue = FrameQueue::new(self.local.name.clone(), bytes);
        let frame = queue
            .next_frame(usize::MAX)?
            .ok_or(GossipError::EmptyMessage)?;
        let mut payload = frame.encode();
        if let Some(cipher) = &self.cipher {
            payload = cipher.seal(&payload)?;
        }

        let send = async {
            let mut stream = TcpStream::connect(member.addr).await?;
            stream.write_all(&(payload.len() as u32).to_le_bytes()).await?;
            stream.write_all(&payload).await?;
            stream.flush().await?;
            stream.shutdown().await?;
            Ok::<(), std::io::Error>(())
        };

        match tokio::time::timeout(self.config.unicast_timeout, send).await {
            Ok(result) => {
                result.map_err(|err| {
                    warn!(%err, destination = %member.name, destination_addr = %member.addr,
                        "failed to send unicast message");
                    GossipError::Io(err)
                })?;
                Ok(())
            }
            Err(_) => Err(GossipError::Timeout("unicast delivery")),
        }
    }

    /// Announces departure and stops every background loop.
    pub async fn shutdown(&self) {
        info!(name = %self.local.name, "shutting down gossip transport");
        let leave = ControlMessage::Leave {
            name: self.local.name.clone(),
        };
        for member in self.membership.peers() {
            if let Err(err) = self.send_control(member.addr, &leave).await {
                debug!(%err, destination = %member.name, "failed to send leave");
            }
        }

        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn send_control(
        &self,
        addr: SocketAddr,
        message: &ControlMessage,
    ) -> Result<(), GossipError> {
        let mut packet = vec![PACKET_CONTROL];
        packet.extend_from_slice(&serde_json::to_vec(message)?);
        self.send_packet(addr, packet).await
    }

    async fn send_frame_bytes(
        &self,
        addr: SocketAddr,
        frame_bytes: &[u8],
    ) -> Result<(), GossipError> {
        let mut packet = Vec::with_capacity(1 + frame_bytes.len());
        packet.push(PACKET_FRAME);
        packet.extend_from_slice(frame_bytes);
        self.send_packet(addr, packet).await
    }

    async fn send_packet(&self, addr: SocketAddr, packet: Vec<u8>) -> Result<(), GossipError> {
        let packet = match &self.cipher {
            Some(cipher) => cipher.seal(&packet)?,
            None => packet,
        };
        self.udp.send_to(&packet, addr).await?;
        Ok(())
    }

    /// Budget left for frame bytes inside one datagram after transport
    /// overhead (packet kind byte, optional encryption).
    fn frame_mtu(&self) -> usize {
        let overhead = 1 + if self.cipher.is_some() {
            PacketCipher::OVERHEAD
        } else {
            0
        };
        self.config.mtu.saturating_sub(overhead).max(128)
    }

    fn handle_control(&self, from: SocketAddr, message: ControlMessage) {
        match message {
            ControlMessage::Join { member } => {
                self.membership.observe(member.clone());
                let ack = ControlMessage::JoinAck {
                    members: self.all_members(),
                };
                self.spawn_control_reply(member.addr, ack);
            }
            ControlMessage::JoinAck { members } => {
                self.membership.merge(members);
            }
            ControlMessage::Ping { from: sender, seq } => {
                self.membership.observe(sender.clone());
                let ack = ControlMessage::Ack {
                    from: self.local.clone(),
                    seq,
                    members: self.all_members(),
                };
                self.spawn_control_reply(sender.addr, ack);
            }
            ControlMessage::Ack { from: sender, members, .. } => {
                self.membership.observe(sender);
                self.membership.merge(members);
            }
            ControlMessage::Leave { name } => {
                debug!(%from, name = %name, "member announced departure");
                self.membership.remove(&name);
            }
        }
    }

    fn all_members(&self) -> Vec<Member> {
        let mut members = self.membership.peers();
        members.push(self.local.clone());
        members
    }

    fn spawn_control_reply(&self, addr: SocketAddr, message: ControlMessage) {
        // Replies run detached so the UDP read loop never blocks.
        let udp = Arc::clone(&self.udp);
        let cipher = self.cipher.clone();
        tokio::spawn(async move {
            let Ok(mut packet) = serde_json::to_vec(&message) else {
                return;
            };
            packet.insert(0, PACKET_CONTROL);
            let packet = match &cipher {
                Some(cipher) => match cipher.seal(&packet) {
                    Ok(sealed) => sealed,
                    Err(_) => return,
                },
                None => packet,
            };
            if let Err(err) = udp.send_to(&packet, addr).await {
                debug!(%err, %addr, "failed to send control reply");
            }
        });
    }
}

async fn bind_pair(config: &GossipConfig) -> Result<(UdpSocket, TcpListener), GossipError> {
    // UDP and TCP share the port number. With an ephemeral port the pair
    // may collide with an existing TCP listener, so retry a few times.
    let mut last_err: Option<std::io::Error> = None;
    for _ in 0..8 {
        let udp = UdpSocket::bind((config.bind_addr, config.bind_port)).await?;
        let port = udp.local_addr()?.port();
        match TcpListener::bind((config.bind_addr, port)).await {
            Ok(tcp) => return Ok((udp, tcp)),
            Err(err) if config.bind_port == 0 => {
                last_err = Some(err);
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(last_err
        .map(GossipError::Io)
        .unwrap_or(GossipError::Timeout("port pair allocation")))
}

async fn udp_read_loop(transport: Arc<GossipTransport>, mut shutdown: watch::Receiver<bool>) {
    let mut buf = vec![0u8; 65536];
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            received = transport.udp.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(received) => received,
                    Err(err) => {
                        warn!(%err, "udp receive failed");
                        continue;
                    }
                };

                let packet = match &transport.cipher {
                    Some(cipher) => match cipher.open(&buf[..len]) {
                        Ok(packet) => packet,
                        Err(_) => {
                            warn!(%from, "dropping packet that failed decryption");
                            continue;
                        }
                    },
                    None => buf[..len].to_vec(),
                };

                let Some((&kind, body)) = packet.split_first() else {
                    continue;
                };
                match kind {
                    PACKET_CONTROL => match serde_json::from_slice::<ControlMessage>(body) {
                        Ok(message) => transport.handle_control(from, message),
                        Err(err) => warn!(%err, %from, "undecodable control message"),
                    },
                    PACKET_FRAME => transport.router.handle_frame(body),
                    other => debug!(kind = other, %from, "unknown packet kind"),
                }
            }
        }
    }
}

async fn tcp_accept_loop(
    transport: Arc<GossipTransport>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(%err, "tcp accept failed");
                        continue;
                    }
                };
                let transport = Arc::clone(&transport);
                tokio::spawn(async move {
                    if let Err(err) = read_reliable(&transport, stream).await {
                        warn!(%err, %peer, "failed to read unicast message");
                    }
                });
            }
        }
    }
}

async fn read_reliable(
    transport: &GossipTransport,
    mut stream: TcpStream,
) -> Result<(), GossipError> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_TCP_MESSAGE {
        return Err(GossipError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "unicast message exceeds size limit",
        )));
    }

    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;

    let frame_bytes = match &transport.cipher {
        Some(cipher) => cipher.open(&payload)?,
        None => payload,
    };
    transport.router.handle_frame(&frame_bytes);
    Ok(())
}

async fn gossip_pump(transport: Arc<GossipTransport>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(transport.config.gossip_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                let member_count = transport.membership.member_count();
                let fanout = transport.config.retransmit_multiplier.max(1);
                let mtu = transport.frame_mtu();

                for _ in 0..GOSSIP_BATCH {
                    let Some(frame_bytes) = transport.router.next_outbound(mtu, member_count)
                    else {
                        break;
                    };
                    let targets = transport.membership.random_peers(fanout);
                    if targets.is_empty() {
                        debug!("outbound gossip frame with no peers to send to");
                        continue;
                    }
                    for target in targets {
                        if let Err(err) =
                            transport.send_frame_bytes(target.addr, &frame_bytes).await
                        {
                            warn!(%err, destination = %target.name, "failed to gossip frame");
                        }
                    }
                }
            }
        }
    }
}

async fn probe_loop(transport: Arc<GossipTransport>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(transport.config.probe_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                transport.membership.sweep();
                let Some(target) = transport.membership.random_neighbour() else {
                    continue;
                };
                let ping = ControlMessage::Ping {
                    from: transport.local.clone(),
                    seq: transport.seq.fetch_add(1, Ordering::Relaxed),
                };
                if let Err(err) = transport.send_control(target.addr, &ping).await {
                    debug!(%err, destination = %target.name, "failed to send probe");
                }
            }
        }
    }
}

async fn prune_loop(transport: Arc<GossipTransport>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(transport.config.prune_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                transport.router.prune();
            }
        }
    }
}

async fn join_loop(transport: Arc<GossipTransport>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(transport.config.join_retry_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        if !transport.membership.peers().is_empty() {
            return;
        }

        let join = ControlMessage::Join {
            member: transport.local.clone(),
        };
        for peer in &transport.config.peers {
            if let Err(err) = transport.send_control(*peer, &join).await {
                warn!(%err, peer = %peer, "failed to contact seed peer, will keep retrying");
            }
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {}
        }
    }
}
