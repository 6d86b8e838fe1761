//! UDP command server for the simulated device
//!
//! Owns the socket and a single receive task. Pixel commands mutate the
//! runtime; query commands synthesize (possibly fragmented) replies. A
//! malformed datagram never takes the loop down.

use anyhow::{Context, Result};
use ledsim_core::{DeviceConfig, DeviceRuntime};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::protocol::{self, Command};

/// Bounded socket poll so a stop request is observed promptly
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long `stop` waits for the receive task before abandoning it
const STOP_TIMEOUT: Duration = Duration::from_secs(1);
/// Largest datagram we accept
const RECV_BUFFER_LEN: usize = 65535;

struct Running {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// The protocol server: `Stopped -> Running -> Stopped`, no intermediate
/// states. `start` and `stop` are no-ops when already in the target state.
pub struct DeviceServer {
    runtime: Arc<DeviceRuntime>,
    config_payload: Arc<Vec<u8>>,
    message_id: Arc<AtomicU8>,
    running: Option<Running>,
}

impl DeviceServer {
    /// Create a stopped server for one runtime. The config reply payload is
    /// precomputed here; the topology cannot change for the server's
    /// lifetime.
    pub fn new(runtime: Arc<DeviceRuntime>, config: &DeviceConfig) -> Self {
        Self {
            runtime,
            config_payload: Arc::new(config.config_payload()),
            message_id: Arc::new(AtomicU8::new(0)),
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Address the socket is actually bound to, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Bind the socket and start the receive loop.
    ///
    /// A bind failure (e.g. port already in use) is fatal to startup and
    /// surfaces to the caller.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }

        let port = self.runtime.udp_port();
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind UDP port {port}"))?;
        let local_addr = socket.local_addr().context("failed to read local address")?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(receive_loop(
            socket,
            self.runtime.clone(),
            self.config_payload.clone(),
            self.message_id.clone(),
            stop_rx,
        ));

        self.running = Some(Running {
            stop_tx,
            task,
            local_addr,
        });
        info!(
            addr = %local_addr,
            name = self.runtime.name(),
            serial = self.runtime.serial(),
            "Device server started"
        );
        Ok(())
    }

    /// Signal the receive loop to stop and wait for it with a bounded
    /// timeout.
    pub async fn stop(&mut self) {
        let Some(mut running) = self.running.take() else {
            return;
        };

        let _ = running.stop_tx.send(true);
        match timeout(STOP_TIMEOUT, &mut running.task).await {
            Ok(Ok(())) => info!("Device server stopped"),
            Ok(Err(e)) => warn!(error = %e, "Receive task ended abnormally"),
            Err(_) => {
                running.task.abort();
                warn!("Receive task did not stop in time, aborted");
            }
        }
    }
}

async fn receive_loop(
    socket: UdpSocket,
    runtime: Arc<DeviceRuntime>,
    config_payload: Arc<Vec<u8>>,
    message_id: Arc<AtomicU8>,
    stop_rx: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];

    while !*stop_rx.borrow() {
        match timeout(POLL_INTERVAL, socket.recv_from(&mut buf)).await {
            // Poll window elapsed with nothing queued; re-check the run flag.
            Err(_) => continue,
            Ok(Err(e)) => {
                warn!(error = %e, "UDP receive failed");
                continue;
            }
            Ok(Ok((len, addr))) => {
                handle_datagram(&socket, &runtime, &config_payload, &message_id, &buf[..len], addr)
                    .await;

                // Drain everything already queued before waiting again.
                loop {
                    match socket.try_recv_from(&mut buf) {
                        Ok((len, addr)) => {
                            handle_datagram(
                                &socket,
                                &runtime,
                                &config_payload,
                                &message_id,
                                &buf[..len],
                                addr,
                            )
                            .await;
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            warn!(error = %e, "UDP drain failed");
                            break;
                        }
                    }
                }
            }
        }
    }

    debug!("Receive loop exited");
}

async fn handle_datagram(
    socket: &UdpSocket,
    runtime: &DeviceRuntime,
    config_payload: &[u8],
    message_id: &AtomicU8,
    data: &[u8],
    addr: SocketAddr,
) {
    let Some(command) = Command::decode(data) else {
        trace!(from = %addr, len = data.len(), "Ignoring unknown datagram");
        return;
    };

    match command {
        Command::QueryInfo => {
            let (width, height) = runtime.primary_dimensions();
            let response = protocol::encode_info_response(
                width,
                height,
                runtime.pixel_size(),
                runtime.name(),
                runtime.description(),
                runtime.serial(),
            );
            if let Err(e) = socket.send_to(&response, addr).await {
                warn!(to = %addr, error = %e, "Failed to send info reply");
            }
        }
        Command::QueryConfig => {
            let msg_id = message_id.fetch_add(1, Ordering::Relaxed);
            match protocol::config_fragments(config_payload, msg_id) {
                Ok(fragments) => {
                    trace!(to = %addr, msg_id, fragments = fragments.len(), "Sending config");
                    for fragment in fragments {
                        if let Err(e) = socket.send_to(&fragment, addr).await {
                            warn!(to = %addr, error = %e, "Failed to send config fragment");
                            break;
                        }
                    }
                }
                Err(e) => warn!(to = %addr, error = %e, "Config reply not sent"),
            }
        }
        Command::FragmentPixels {
            frame_id,
            total_fragments,
            fragment_index,
            updates,
        } => {
            runtime.apply_fragment(frame_id, total_fragments, fragment_index, &updates);
        }
        Command::FrameEnd { frame_id } => {
            runtime.apply_frame_end(frame_id);
        }
    }
}
