use crate::message::{self, Envelope};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::warn;
use std::io;
use std::net::UdpSocket;
use std::thread;

// Largest possible datagram; one receive buffer is reused for every read.
const MAX_DATAGRAM: usize = 65535;

/// Interface a replica uses to talk to the rest of the cluster and to its
/// clients. Outbound records are fire-and-forget: the channel underneath is
/// lossy by contract, so there are no retries or acknowledgments here.
pub trait Cluster {
    fn send_message(&mut self, msg: Envelope);

    /// Polled by the event loop; a true return stops the replica.
    fn halt(&self) -> bool {
        false
    }
}

/// Datagram transport to the simulator's relay address. A background thread
/// blocks on the socket, decodes each datagram, and feeds the event loop's
/// channel; sends go straight out from the loop thread.
pub struct UdpCluster {
    socket: UdpSocket,
}

impl UdpCluster {
    /// Bind an ephemeral local port and connect it to the relay at
    /// `localhost:port`. Returns the transport and the inbound channel.
    pub fn connect(port: u16) -> io::Result<(UdpCluster, Receiver<Envelope>)> {
        let socket = UdpSocket::bind(("127.0.0.1", 0))?;
        socket.connect(("127.0.0.1", port))?;
        let reader = socket.try_clone()?;
        let (tx, rx) = unbounded();
        thread::Builder::new()
            .name("transport".to_string())
            .spawn(move || read_loop(reader, tx))?;
        Ok((UdpCluster { socket }, rx))
    }
}

impl Cluster for UdpCluster {
    fn send_message(&mut self, msg: Envelope) {
        let raw = match message::encode(&msg) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("dropping unencodable record to {}: {}", msg.dst, err);
                return;
            }
        };
        if let Err(err) = self.socket.send(&raw) {
            // Loss is already part of the channel's contract.
            warn!("send to {} failed: {}", msg.dst, err);
        }
    }
}

fn read_loop(socket: UdpSocket, tx: Sender<Envelope>) {
    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        let len = match socket.recv(&mut buf) {
            Ok(len) => len,
            Err(err) => {
                warn!("transport receive failed: {}", err);
                continue;
            }
        };
        match message::decode(&buf[..len]) {
            Ok(msg) => {
                // A send error means the replica hung up; stop reading.
                if tx.send(msg).is_err() {
                    return;
                }
            }
            Err(err) => warn!("discarding malformed datagram: {}", err),
        }
    }
}
