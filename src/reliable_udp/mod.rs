//! Reliable, ordered delivery of discrete messages on top of UDP datagrams, which may be lost,
//!  duplicated or reordered on the way.
//!
//! ## Protocol
//!
//! Every message is sent in a single datagram (see [packet::Packet] for the wire format),
//!  numbered with a per-sender sequence number starting at 0. The receiver acknowledges
//!  cumulatively: an ACK for `N` confirms that everything up to and including `N` arrived.
//!
//! *Sender*
//! * At most `window_size` data packets are unacknowledged at any time. `send()` waits for a
//!    free window credit (optionally bounded by a timeout), transmits the packet and returns
//!    without waiting for the ACK.
//! * Unacknowledged packets are kept in a retransmission table. A background task re-sends
//!    every packet that waited longer than `base_retry_timeout * 2^retries` for its ACK. There
//!    is no upper limit for retries: callers that want to give up do so with their own timeouts.
//! * An ACK for `N` retires all pending packets up to `N`, even if ACKs for some of them were
//!    lost, and returns their window credits. Stale and duplicate ACKs are ignored, and so are
//!    ACKs from an address the acknowledged packets were not sent to.
//!
//! *Receiver*
//! * Data packets are put into a reorder buffer keyed by sequence number. Whenever the
//!    lowest buffered sequence number is the expected one, it is moved to the delivery queue.
//!    A gap stops delivery until the missing packet is re-sent.
//! * Packets below the expected sequence number are duplicates and are dropped - but they are
//!    acknowledged again, since the sender evidently did not get the previous ACK.
//!
//! There is no congestion control beyond the fixed window: loss triggers retransmission only.
//!
//! NB: Sequence numbers wrap around to 0 after `u32::MAX`, but ordering comparisons do not take
//!      wrap-around into account. Sessions exchanging more than 2^32 messages are not supported.
//!
//! NB: A socket has a single outgoing sequence space, so it is meant to send to one peer at a
//!      time; `stop()` / `start()` reset all sequencing state before switching to a new peer.
//!      The receiving side keeps track of sequence numbers per sending address, so stray
//!      packets from an earlier peer can not interfere with the current one.

pub mod config;
pub mod packet;
pub mod datagram_socket;
pub mod send_window;
pub mod receive_sequencer;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::TransportError;
use crate::reliable_udp::config::ReliableUdpConfig;
use crate::reliable_udp::datagram_socket::DatagramSocket;
use crate::reliable_udp::packet::Packet;
use crate::reliable_udp::receive_sequencer::{ReceiveSequencer, ReceivedMessage};
use crate::reliable_udp::send_window::SendWindow;


/// State shared between callers of `send()` / `receive()`, the receiver task and the retry
///  task. It is created fresh on each `start()`.
struct SharedState {
    /// one permit per free slot in the send window
    window_credits: Semaphore,
    send_window: Mutex<SendWindow>,
    sequencers: Mutex<FxHashMap<SocketAddr, ReceiveSequencer>>,
    delivery_tx: mpsc::UnboundedSender<ReceivedMessage>,
    delivery_rx: Mutex<mpsc::UnboundedReceiver<ReceivedMessage>>,
    cancel: CancellationToken,
}

impl SharedState {
    fn new(config: &ReliableUdpConfig) -> SharedState {
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        SharedState {
            window_credits: Semaphore::new(config.window_size as usize),
            send_window: Mutex::new(SendWindow::new(config.window_size)),
            sequencers: Mutex::new(FxHashMap::default()),
            delivery_tx,
            delivery_rx: Mutex::new(delivery_rx),
            cancel: CancellationToken::new(),
        }
    }

    /// wakes up all callers blocked in `send()` or `receive()`, making them fail with `Closed`
    fn shut_down(&self) {
        self.cancel.cancel();
        self.window_credits.close();
    }
}

struct Running {
    shared: Arc<SharedState>,
    tasks: Vec<JoinHandle<()>>,
}


pub struct ReliableUdpSocket {
    socket: Arc<dyn DatagramSocket>,
    config: Arc<ReliableUdpConfig>,
    running: std::sync::Mutex<Option<Running>>,
}

impl ReliableUdpSocket {
    /// Binds a UDP socket. The socket needs to be started before it can send or receive.
    pub async fn bind(addr: SocketAddr, config: Arc<ReliableUdpConfig>) -> anyhow::Result<ReliableUdpSocket> {
        let socket = UdpSocket::bind(addr).await?;
        info!("bound reliable UDP socket to {:?}", socket.local_addr()?);
        Self::with_socket(Arc::new(socket), config)
    }

    pub fn with_socket(socket: Arc<dyn DatagramSocket>, config: Arc<ReliableUdpConfig>) -> anyhow::Result<ReliableUdpSocket> {
        config.validate()?;
        Ok(ReliableUdpSocket {
            socket,
            config,
            running: std::sync::Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn config(&self) -> &ReliableUdpConfig {
        &self.config
    }

    pub fn max_payload_len(&self) -> usize {
        self.config.max_payload_len()
    }

    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        // the lock is never held across an await or a call that can panic
        self.running.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn shared(&self) -> Result<Arc<SharedState>, TransportError> {
        self.lock_running()
            .as_ref()
            .map(|r| r.shared.clone())
            .ok_or(TransportError::Closed)
    }

    /// (Re-)starts the socket: all sequencing, window and buffer state is reset, and fresh
    ///  receiver and retry tasks are spawned. If the socket was running, it is stopped first.
    pub async fn start(&self) {
        self.stop().await;

        let shared = Arc::new(SharedState::new(&self.config));
        let tasks = vec![
            tokio::spawn(receive_loop(self.socket.clone(), shared.clone(), self.config.clone())),
            tokio::spawn(retry_loop(self.socket.clone(), shared.clone(), self.config.clone())),
        ];

        debug!("started reliable UDP socket {:?}", self.socket.local_addr().ok());
        *self.lock_running() = Some(Running { shared, tasks });
    }

    /// Stops the background tasks and discards all state. Callers blocked in `send()` or
    ///  `receive()` fail with [TransportError::Closed]. Calling this on a stopped socket does
    ///  nothing.
    pub async fn stop(&self) {
        let running = self.lock_running().take();

        if let Some(running) = running {
            running.shared.shut_down();
            for task in running.tasks {
                if let Err(e) = task.await {
                    error!("reliable UDP background task failed: {}", e);
                }
            }
            running.shared.send_window.lock().await.clear();
            debug!("stopped reliable UDP socket {:?}", self.socket.local_addr().ok());
        }
    }

    /// Sends a message, waiting for a free window credit if necessary. This returns as soon as
    ///  the packet is on the wire - it does *not* wait for an acknowledgement.
    pub async fn send(&self, payload: &[u8], to: SocketAddr, timeout: Option<Duration>) -> anyhow::Result<()> {
        if payload.len() > self.config.max_payload_len() {
            bail!("message of {} bytes exceeds the maximum payload of {} bytes", payload.len(), self.config.max_payload_len());
        }

        let shared = self.shared()?;

        let acquire = shared.window_credits.acquire();
        let permit = match timeout {
            None => acquire.await,
            Some(timeout) => match time::timeout(timeout, acquire).await {
                Ok(permit) => permit,
                Err(_) => {
                    debug!("no window credit available for sending to {:?} within {:?}", to, timeout);
                    return Err(TransportError::Timeout.into());
                }
            },
        }.map_err(|_| TransportError::Closed)?;

        let mut send_window = shared.send_window.lock().await;
        if shared.cancel.is_cancelled() {
            return Err(TransportError::Closed.into());
        }

        let sequence_number = send_window.next_seq();
        let packet_buf = Packet::data(sequence_number, Bytes::copy_from_slice(payload)).to_bytes();

        // NB: if sending fails, the permit is dropped and returns to the pool, and nothing is
        //      registered for re-sending
        self.socket.send_to(&packet_buf, to).await?;
        send_window.on_sent(sequence_number, packet_buf, to, Instant::now());
        permit.forget();

        trace!("sent packet {} ({} bytes) to {:?}", sequence_number, payload.len(), to);
        Ok(())
    }

    pub async fn send_text(&self, text: &str, to: SocketAddr, timeout: Option<Duration>) -> anyhow::Result<()> {
        self.send(text.as_bytes(), to, timeout).await
    }

    /// Returns the next message in sequence. Without an explicit timeout, the configured
    ///  default receive timeout applies (which may be 'forever').
    pub async fn receive(&self, timeout: Option<Duration>) -> anyhow::Result<ReceivedMessage> {
        let shared = self.shared()?;

        let next = async {
            let mut delivery_rx = shared.delivery_rx.lock().await;
            select! {
                _ = shared.cancel.cancelled() => None,
                msg = delivery_rx.recv() => msg,
            }
        };

        let msg = match timeout.or(self.config.default_receive_timeout) {
            None => next.await,
            Some(timeout) => time::timeout(timeout, next).await
                .map_err(|_| TransportError::Timeout)?,
        };

        Ok(msg.ok_or(TransportError::Closed)?)
    }

    /// Waits until all sent packets are acknowledged
    pub async fn flush(&self, timeout: Duration) -> anyhow::Result<()> {
        let shared = self.shared()?;

        let all_acked = async {
            while shared.send_window.lock().await.pending_count() > 0 {
                if shared.cancel.is_cancelled() {
                    return Err(TransportError::Closed);
                }
                time::sleep(self.config.retry_check_interval).await;
            }
            Ok(())
        };

        time::timeout(timeout, all_acked).await
            .map_err(|_| TransportError::Timeout)??;
        Ok(())
    }

    /// the number of data packets that can be sent right now without waiting for an ACK
    pub fn window_available(&self) -> usize {
        self.shared()
            .map(|shared| shared.window_credits.available_permits())
            .unwrap_or(0)
    }

    pub async fn pending_count(&self) -> usize {
        match self.shared() {
            Ok(shared) => shared.send_window.lock().await.pending_count(),
            Err(_) => 0,
        }
    }
}

impl Drop for ReliableUdpSocket {
    fn drop(&mut self) {
        if let Some(running) = self.lock_running().take() {
            running.shared.shut_down();
        }
    }
}


async fn receive_loop(socket: Arc<dyn DatagramSocket>, shared: Arc<SharedState>, config: Arc<ReliableUdpConfig>) {
    let mut buf = vec![0u8; config.packet_size];

    loop {
        let (len, from) = select! {
            _ = shared.cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(x) => x,
                Err(e) => {
                    // a persistent error must not make this loop spin
                    warn!("error receiving on socket: {} - retrying after {:?}", e, config.retry_check_interval);
                    select! {
                        _ = shared.cancel.cancelled() => break,
                        _ = time::sleep(config.retry_check_interval) => {}
                    }
                    continue;
                }
            },
        };

        let packet = match Packet::deser(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("dropping packet from {:?}: {}", from, e);
                continue;
            }
        };
        trace!("received {:?} from {:?}", packet, from);

        if packet.is_ack {
            let credits = shared.send_window.lock().await
                .on_ack(packet.sequence_number, from);
            if credits > 0 {
                shared.window_credits.add_permits(credits as usize);
            }
            continue;
        }

        let result = shared.sequencers.lock().await
            .entry(from)
            .or_default()
            .on_data_packet(packet.sequence_number, packet.payload, from);

        for msg in result.deliverable {
            // the receiver is owned by the shared state, so this can not fail while we are running
            let _ = shared.delivery_tx.send(msg);
        }

        if let Some(ack) = result.ack {
            if let Err(e) = socket.send_to(&Packet::ack(ack).to_bytes(), from).await {
                debug!("error sending ACK {} to {:?}: {}", ack, from, e);
            }
        }
    }

    trace!("receive loop terminated");
}

async fn retry_loop(socket: Arc<dyn DatagramSocket>, shared: Arc<SharedState>, config: Arc<ReliableUdpConfig>) {
    let mut interval = time::interval(config.retry_check_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            _ = shared.cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        resend_due_packets(socket.as_ref(), &shared.send_window, &config).await;
    }

    trace!("retry loop terminated");
}

/// NB: The send window lock is released before re-sending, so a slow socket does not block
///      ACK processing or new sends
async fn resend_due_packets(socket: &dyn DatagramSocket, send_window: &Mutex<SendWindow>, config: &ReliableUdpConfig) {
    let due = send_window.lock().await
        .due_for_retry(Instant::now(), config);

    for (sequence_number, pending) in due {
        match socket.send_to(&pending.packet_buf, pending.to).await {
            Ok(()) => debug!("re-sent packet {} to {:?} (retry #{})", sequence_number, pending.to, pending.retries),
            Err(e) => error!("failed to re-send packet {} to {:?}: {}", sequence_number, pending.to, e),
        }
    }
}
