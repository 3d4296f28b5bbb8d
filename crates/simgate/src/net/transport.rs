use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;

use tokio::net::UdpSocket;

use super::protocol::MAX_PACKET_SIZE;

/// Outbound half of the UDP socket as seen by a circuit.
pub trait DatagramSink: Send + Sync + 'static {
    fn send_datagram(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize>;
}

impl DatagramSink for UdpSocket {
    fn send_datagram(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.try_send_to(data, addr)
    }
}

/// Reusable receive buffers for the dispatcher loop.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    max_pooled: usize,
}

impl BufferPool {
    pub fn new(max_pooled: usize) -> Self {
        Self::with_buffer_size(max_pooled, MAX_PACKET_SIZE)
    }

    pub fn with_buffer_size(max_pooled: usize, buffer_size: usize) -> Self {
        let buffers = (0..max_pooled).map(|_| vec![0u8; buffer_size]).collect();
        Self {
            buffers: Mutex::new(buffers),
            buffer_size,
            max_pooled,
        }
    }

    pub fn acquire(&self) -> Vec<u8> {
        self.buffers
            .lock()
            .ok()
            .and_then(|mut buffers| buffers.pop())
            .unwrap_or_else(|| vec![0u8; self.buffer_size])
    }

    pub fn release(&self, mut buffer: Vec<u8>) {
        buffer.resize(self.buffer_size, 0);
        if let Ok(mut buffers) = self.buffers.lock() {
            if buffers.len() < self.max_pooled {
                buffers.push(buffer);
            }
        }
    }

    pub fn available(&self) -> usize {
        self.buffers.lock().map(|b| b.len()).unwrap_or(0)
    }
}

#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    pub sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn packets(&self) -> Vec<super::protocol::Packet> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(data, _)| super::protocol::Packet::deserialize(data).unwrap())
            .collect()
    }
}

#[cfg(test)]
impl DatagramSink for RecordingSink {
    fn send_datagram(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.sent.lock().unwrap().push((data.to_vec(), addr));
        Ok(data.len())
    }
}
