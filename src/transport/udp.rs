//! UDP implementation of the transport contract on top of tokio, for
//! running fleets on ordinary kernel networking. Unlike the NIC-bypass
//! packet transport it makes no latency promises; it exists so the drivers
//! run end-to-end without special hardware.
//!
//! Layout follows a task-per-concern scheme: one recv task per registered
//! participant socket (the ingress workers), one worker task draining the
//! sequential channel, and a small pool of concurrent workers. Sends are
//! fire-and-forget datagrams; UDP loss shows up as protocol retries.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time;

use crate::transport::{
    CancelHandle, FleetConfig, ReceiverFn, Transport,
};
use crate::types::{ChannelId, SEQUENTIAL_CHANNEL};
use crate::utils::ReplicoreError;

tokio::task_local! {
    /// Channel ID of the worker task the current callback runs on.
    static CHANNEL: ChannelId;
}

type Task = Box<dyn FnOnce() + Send>;

/// Owner of one received datagram's bytes.
pub struct UdpDescriptor(Bytes);

impl AsRef<[u8]> for UdpDescriptor {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

struct UdpInner {
    sockets: Mutex<HashMap<SocketAddr, Arc<UdpSocket>>>,
    seq_tx: mpsc::UnboundedSender<Task>,
    conc_txs: Vec<mpsc::UnboundedSender<Task>>,
    conc_next: AtomicUsize,
    runtime: Handle,
}

/// UDP transport handle. Cloning yields another handle onto the same
/// socket set and worker pool.
#[derive(Clone)]
pub struct UdpTransport {
    config: Arc<FleetConfig<SocketAddr>>,
    inner: Arc<UdpInner>,
}

impl UdpTransport {
    /// Creates the transport and spawns its worker tasks. Must be called
    /// from within a tokio runtime.
    pub fn new_and_setup(
        config: FleetConfig<SocketAddr>,
        n_concurrent: usize,
    ) -> Result<Self, ReplicoreError> {
        let runtime = Handle::try_current().map_err(ReplicoreError::msg)?;

        let (seq_tx, seq_rx) = mpsc::unbounded_channel::<Task>();
        runtime.spawn(CHANNEL.scope(
            SEQUENTIAL_CHANNEL,
            Self::worker_loop(seq_rx),
        ));

        let mut conc_txs = Vec::with_capacity(n_concurrent);
        for channel in 0..n_concurrent {
            let (conc_tx, conc_rx) = mpsc::unbounded_channel::<Task>();
            runtime.spawn(CHANNEL.scope(
                channel as ChannelId,
                Self::worker_loop(conc_rx),
            ));
            conc_txs.push(conc_tx);
        }

        Ok(UdpTransport {
            config: Arc::new(config),
            inner: Arc::new(UdpInner {
                sockets: Mutex::new(HashMap::new()),
                seq_tx,
                conc_txs,
                conc_next: AtomicUsize::new(0),
                runtime,
            }),
        })
    }

    async fn worker_loop(mut rx: mpsc::UnboundedReceiver<Task>) {
        while let Some(task) = rx.recv().await {
            task();
        }
    }

    /// Binds a socket for `address` (port 0 picks an ephemeral port) and
    /// returns the bound address with the socket.
    fn bind_socket(
        &self,
        address: SocketAddr,
    ) -> Result<(SocketAddr, Arc<UdpSocket>), ReplicoreError> {
        let socket = std::net::UdpSocket::bind(address)?;
        socket.set_nonblocking(true)?;

        let _guard = self.inner.runtime.enter();
        let socket = UdpSocket::from_std(socket)?;
        let bound = socket.local_addr()?;

        // replicas listen on the group's multicast address as well
        if let Some(multicast) = self.config.multicast {
            if let (IpAddr::V4(group), IpAddr::V4(_)) =
                (multicast.ip(), bound.ip())
            {
                if group.is_multicast() {
                    socket.join_multicast_v4(
                        group,
                        std::net::Ipv4Addr::UNSPECIFIED,
                    )?;
                }
            }
        }

        let socket = Arc::new(socket);
        let mut sockets = self.inner.sockets.lock().unwrap();
        sockets.insert(bound, socket.clone());
        Ok((bound, socket))
    }

    fn socket_of(
        &self,
        address: &SocketAddr,
    ) -> Result<Arc<UdpSocket>, ReplicoreError> {
        let sockets = self.inner.sockets.lock().unwrap();
        sockets.get(address).cloned().ok_or_else(|| {
            ReplicoreError(format!("no socket bound at '{}'", address))
        })
    }
}

impl Transport for UdpTransport {
    type Address = SocketAddr;
    type Descriptor = UdpDescriptor;

    // fits a common 1500-byte MTU with headroom for IP/UDP headers
    const BUFFER_SIZE: usize = 1400;

    fn config(&self) -> &FleetConfig<SocketAddr> {
        &self.config
    }

    fn allocate_address(&self) -> SocketAddr {
        // ephemeral participants always bind fresh local ports; failures
        // here mean the host is out of ports, which nothing above us can
        // recover from
        match self.bind_socket("127.0.0.1:0".parse().unwrap()) {
            Ok((bound, _socket)) => bound,
            Err(e) => panic!("address allocation failed: {}", e),
        }
    }

    fn register_receiver(
        &self,
        address: SocketAddr,
        mut receiver: ReceiverFn<Self>,
    ) {
        let socket = match self.socket_of(&address) {
            Ok(socket) => socket,
            Err(_) => match self.bind_socket(address) {
                Ok((_bound, socket)) => socket,
                Err(e) => {
                    panic!("cannot bind receiver at '{}': {}", address, e)
                }
            },
        };

        self.inner.runtime.spawn(async move {
            let mut buffer = vec![0u8; Self::BUFFER_SIZE];
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((length, remote)) => {
                        let payload =
                            Bytes::copy_from_slice(&buffer[..length]);
                        receiver(remote, UdpDescriptor(payload));
                    }
                    Err(e) => {
                        pf_warn!(address; "ingress recv error: {}", e);
                    }
                }
            }
        });
    }

    fn send_buffer(
        &self,
        source: &SocketAddr,
        dest: &SocketAddr,
        payload: &[u8],
    ) -> Result<(), ReplicoreError> {
        let socket = self.socket_of(source)?;
        let payload = payload.to_vec();
        let dest = *dest;
        self.inner.runtime.spawn(async move {
            if let Err(e) = socket.send_to(&payload, dest).await {
                // UDP losing datagrams is expected; sender-side errors are
                // only worth a debug line
                pf_debug!(dest; "send error: {}", e);
            }
        });
        Ok(())
    }

    fn spawn(&self, callback: impl FnOnce() + Send + 'static) {
        let _ = self.inner.seq_tx.send(Box::new(callback));
    }

    fn spawn_concurrent(&self, callback: impl FnOnce() + Send + 'static) {
        if self.inner.conc_txs.is_empty() {
            self.spawn(callback);
            return;
        }
        let index = self.inner.conc_next.fetch_add(1, Ordering::Relaxed)
            % self.inner.conc_txs.len();
        let _ = self.inner.conc_txs[index].send(Box::new(callback));
    }

    fn spawn_after(
        &self,
        delay: Duration,
        callback: impl FnOnce() + Send + 'static,
    ) -> CancelHandle {
        let handle = CancelHandle::new();
        let fire_handle = handle.clone();
        let seq_tx = self.inner.seq_tx.clone();
        self.inner.runtime.spawn(async move {
            time::sleep(delay).await;
            // the armed-or-cancelled decision is taken on the sequential
            // channel, totally ordered with any cancel() issued there
            let _ = seq_tx.send(Box::new(move || {
                if fire_handle.try_fire() {
                    callback();
                }
            }));
        });
        handle
    }

    fn channel(&self) -> ChannelId {
        CHANNEL.try_with(|c| *c).unwrap_or(SEQUENTIAL_CHANNEL)
    }
}

#[cfg(test)]
mod udp_tests {
    use super::*;

    fn loopback_fleet() -> FleetConfig<SocketAddr> {
        FleetConfig {
            n_fault: 0,
            replicas: vec![],
            multicast: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn api_send_recv() -> Result<(), ReplicoreError> {
        let transport = UdpTransport::new_and_setup(loopback_fleet(), 1)?;
        let addr_a = transport.allocate_address();
        let addr_b = transport.allocate_address();

        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.register_receiver(
            addr_b,
            Box::new(move |remote, descriptor| {
                let _ = tx.send((remote, descriptor.as_ref().to_vec()));
            }),
        );

        transport.send_buffer(&addr_a, &addr_b, &[4, 5, 6])?;
        let received =
            time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert_eq!(
            received.map_err(ReplicoreError::msg)?,
            Some((addr_a, vec![4, 5, 6]))
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sequential_spawn_is_fifo() -> Result<(), ReplicoreError> {
        let transport = UdpTransport::new_and_setup(loopback_fleet(), 1)?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        for i in 0..10 {
            let tx = tx.clone();
            transport.spawn(move || {
                let _ = tx.send(i);
            });
        }
        for i in 0..10 {
            let received =
                time::timeout(Duration::from_secs(2), rx.recv()).await;
            assert_eq!(received.map_err(ReplicoreError::msg)?, Some(i));
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_fire_and_cancel() -> Result<(), ReplicoreError> {
        let transport = UdpTransport::new_and_setup(loopback_fleet(), 1)?;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let tx_fire = tx.clone();
        transport.spawn_after(Duration::from_millis(20), move || {
            let _ = tx_fire.send("fired");
        });
        let cancelled = transport
            .spawn_after(Duration::from_millis(20), move || {
                let _ = tx.send("leaked");
            });
        assert!(cancelled.cancel());

        let received =
            time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert_eq!(received.map_err(ReplicoreError::msg)?, Some("fired"));
        // nothing else may arrive
        let extra =
            time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(extra.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_channel_ids() -> Result<(), ReplicoreError> {
        let transport = UdpTransport::new_and_setup(loopback_fleet(), 2)?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport_ref = transport.clone();
        transport.spawn_concurrent(move || {
            let _ = tx.send(transport_ref.channel());
        });
        let received =
            time::timeout(Duration::from_secs(2), rx.recv()).await;
        let channel = received.map_err(ReplicoreError::msg)?.unwrap();
        assert!(channel >= 0);
        Ok(())
    }
}
