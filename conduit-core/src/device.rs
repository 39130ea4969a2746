//! What an interface reads frames from and writes frames to.
//!
//! Two in-memory devices are provided: [`Loopback`], which hands every
//! written frame back to its reader, and [`Segment`], a shared medium every
//! attached [`SegmentPort`] sees the frames of.

use crate::wire::Mac;
use async_trait::async_trait;
use std::{
    io,
    sync::atomic::{AtomicUsize, Ordering},
};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::warn;

/// The frames a segment buffers for a slow port before it starts losing
/// them.
const SEGMENT_BACKLOG: usize = 256;

#[async_trait]
pub trait Device: Send + Sync {
    /// Waits for the next frame and copies as much of it as fits into
    /// `buffer`. Returns the number of bytes copied.
    async fn read(&self, buffer: &mut [u8]) -> io::Result<usize>;

    /// Puts one frame on the wire.
    fn write(&self, frame: &[u8]) -> io::Result<()>;

    /// The device's link address.
    fn mac(&self) -> Mac;
}

fn copy_frame(frame: &[u8], buffer: &mut [u8]) -> usize {
    let len = frame.len().min(buffer.len());
    buffer[..len].copy_from_slice(&frame[..len]);
    len
}

/// A device whose output is its input.
pub struct Loopback {
    send: mpsc::UnboundedSender<Vec<u8>>,
    receive: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl Loopback {
    pub fn new() -> Self {
        let (send, receive) = mpsc::unbounded_channel();
        Self {
            send,
            receive: Mutex::new(receive),
        }
    }
}

impl Default for Loopback {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Device for Loopback {
    async fn read(&self, buffer: &mut [u8]) -> io::Result<usize> {
        match self.receive.lock().await.recv().await {
            Some(frame) => Ok(copy_frame(&frame, buffer)),
            None => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }

    fn write(&self, frame: &[u8]) -> io::Result<()> {
        self.send
            .send(frame.to_vec())
            .map_err(|_| io::ErrorKind::BrokenPipe.into())
    }

    fn mac(&self) -> Mac {
        Mac::ZERO
    }
}

/// A frame seen on a [`Segment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The port that sent it. Frames put on the segment with
    /// [`Segment::inject`] carry [`Segment::OUTSIDE`].
    pub port: usize,
    pub bytes: Vec<u8>,
}

/// An Ethernet segment in memory. Every frame written by one port is read
/// by every other port.
pub struct Segment {
    frames: broadcast::Sender<Frame>,
    next_port: AtomicUsize,
}

impl Segment {
    /// The sender of frames that did not come from a port.
    pub const OUTSIDE: usize = usize::MAX;

    pub fn new() -> Self {
        let (frames, _) = broadcast::channel(SEGMENT_BACKLOG);
        Self {
            frames,
            next_port: AtomicUsize::new(0),
        }
    }

    /// Attaches a new port with the link address `mac`.
    pub fn port(&self, mac: Mac) -> SegmentPort {
        SegmentPort {
            id: self.next_port.fetch_add(1, Ordering::Relaxed),
            mac,
            frames: self.frames.clone(),
            receive: Mutex::new(self.frames.subscribe()),
        }
    }

    /// Every frame put on the segment from now on.
    pub fn monitor(&self) -> broadcast::Receiver<Frame> {
        self.frames.subscribe()
    }

    /// Puts a frame on the segment as if some host outside the simulation
    /// had sent it.
    pub fn inject(&self, bytes: &[u8]) {
        let _ = self.frames.send(Frame {
            port: Self::OUTSIDE,
            bytes: bytes.to_vec(),
        });
    }
}

impl Default for Segment {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SegmentPort {
    id: usize,
    mac: Mac,
    frames: broadcast::Sender<Frame>,
    receive: Mutex<broadcast::Receiver<Frame>>,
}

#[async_trait]
impl Device for SegmentPort {
    async fn read(&self, buffer: &mut [u8]) -> io::Result<usize> {
        let mut receive = self.receive.lock().await;
        loop {
            match receive.recv().await {
                Ok(frame) if frame.port == self.id => continue,
                Ok(frame) => return Ok(copy_frame(&frame.bytes, buffer)),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(port = self.id, missed, "segment port fell behind, frames lost");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(io::ErrorKind::BrokenPipe.into())
                }
            }
        }
    }

    fn write(&self, frame: &[u8]) -> io::Result<()> {
        // Nobody listening is not an error on a shared medium.
        let _ = self.frames.send(Frame {
            port: self.id,
            bytes: frame.to_vec(),
        });
        Ok(())
    }

    fn mac(&self) -> Mac {
        self.mac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_returns_what_was_written() -> anyhow::Result<()> {
        let device = Loopback::new();
        device.write(b"frame")?;
        let mut buffer = [0u8; 3];
        assert_eq!(device.read(&mut buffer).await?, 3);
        assert_eq!(&buffer, b"fra");
        Ok(())
    }

    #[tokio::test]
    async fn ports_do_not_hear_themselves() -> anyhow::Result<()> {
        let segment = Segment::new();
        let a = segment.port(Mac::new([2, 0, 0, 0, 0, 1]));
        let b = segment.port(Mac::new([2, 0, 0, 0, 0, 2]));
        a.write(b"from a")?;
        b.write(b"from b")?;

        let mut buffer = [0u8; 16];
        let len = a.read(&mut buffer).await?;
        assert_eq!(&buffer[..len], b"from b");
        let len = b.read(&mut buffer).await?;
        assert_eq!(&buffer[..len], b"from a");
        Ok(())
    }

    #[tokio::test]
    async fn injected_frames_reach_every_port() -> anyhow::Result<()> {
        let segment = Segment::new();
        let port = segment.port(Mac::ZERO);
        let mut monitor = segment.monitor();
        segment.inject(b"outside");
        assert_eq!(monitor.recv().await?.port, Segment::OUTSIDE);
        let mut buffer = [0u8; 16];
        let len = port.read(&mut buffer).await?;
        assert_eq!(&buffer[..len], b"outside");
        Ok(())
    }
}
