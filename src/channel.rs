//! In-memory stand-in for the socket a TLS session would normally own.
//!
//! The session never touches the network. The poll loop puts peer bytes into
//! `received` and takes datagrams out of `to_send`; that is what lets one
//! physical socket back any number of sessions.

use std::collections::VecDeque;
use std::fmt;

use crate::buffer::{Buf, BufferPool};
use crate::Error;

pub struct HandshakeChannel {
    /// Bytes of the datagram currently being processed.
    received: Buf,

    /// Datagrams the caller must transmit to the peer.
    to_send: VecDeque<Buf>,

    max_queue_tx: usize,

    pool: BufferPool,
}

impl HandshakeChannel {
    pub(crate) fn new(max_queue_tx: usize) -> Self {
        HandshakeChannel {
            received: Buf::new(),
            to_send: VecDeque::new(),
            max_queue_tx,
            pool: BufferPool::default(),
        }
    }

    /// Feed one datagram from the network.
    ///
    /// Anything left over from a previous step is discarded first; a step
    /// consumes exactly the datagram it was given.
    pub fn feed(&mut self, datagram: &[u8]) {
        self.received.clear();
        self.received.extend_from_slice(datagram);
    }

    /// Take the received bytes out for a handshake step.
    ///
    /// Hand the buffer back with [`Self::finish_received`] once the step is done.
    pub fn take_received(&mut self) -> Buf {
        std::mem::take(&mut self.received)
    }

    /// Return the buffer from [`Self::take_received`], dropping unconsumed bytes.
    pub fn finish_received(&mut self, mut received: Buf) {
        received.clear();
        self.received = received;
    }

    pub fn has_received(&self) -> bool {
        !self.received.is_empty()
    }

    /// A cleared buffer to build a datagram in.
    pub fn buffer(&mut self) -> Buf {
        self.pool.pop()
    }

    pub fn recycle(&mut self, buf: Buf) {
        self.pool.push(buf);
    }

    /// Queue a datagram for transmission.
    pub fn push_datagram(&mut self, datagram: Buf) -> Result<(), Error> {
        if self.to_send.len() >= self.max_queue_tx {
            warn!(
                "Transmit queue full (max {}): {:?}",
                self.max_queue_tx, self.to_send
            );
            self.pool.push(datagram);
            return Err(Error::TransmitQueueFull);
        }
        trace!("Queue datagram of {} bytes", datagram.len());
        self.to_send.push_back(datagram);
        Ok(())
    }

    pub fn pop_datagram(&mut self) -> Option<Buf> {
        self.to_send.pop_front()
    }

    pub fn drain(&mut self) -> Vec<Buf> {
        self.to_send.drain(..).collect()
    }

    pub fn pending(&self) -> usize {
        self.to_send.len()
    }
}

impl fmt::Debug for HandshakeChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeChannel")
            .field("received", &self.received.len())
            .field("to_send", &self.to_send.len())
            .finish()
    }
}
