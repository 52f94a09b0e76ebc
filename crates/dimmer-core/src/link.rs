//! Control channel transport
//!
//! The host and the worker are connected by two unidirectional byte
//! streams. For an in-process worker these are [`pipe`]s: chunks of encoded
//! bytes moved through a flume channel, so nothing but bytes crosses the
//! boundary. For a worker process they are the child's stdin and stdout.
//!
//! [`ControlLink`] is the host end. It performs strict request/response
//! calls: one request in flight, the reply read before anything else is
//! sent. There is no timeout; an unresponsive worker stalls the caller
//! until the worker side of the link closes.

use crate::pipeline::LevelSink;
use crate::protocol::{ProtocolError, Request, Response};
use flume::{Receiver, RecvTimeoutError, Sender};
use std::io::{self, Read, Write};
use std::time::Duration;

/// Create a unidirectional in-memory byte pipe
pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = flume::unbounded();
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            chunk: Vec::new(),
            pos: 0,
        },
    )
}

/// Write end of a [`pipe`]; each `write` call becomes one chunk
pub struct PipeWriter {
    tx: Sender<Vec<u8>>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Read end of a [`pipe`]
///
/// Reads block until data arrives; a closed writer reads as end-of-file.
pub struct PipeReader {
    rx: Receiver<Vec<u8>>,
    chunk: Vec<u8>,
    pos: usize,
}

impl PipeReader {
    fn buffered(&self) -> usize {
        self.chunk.len() - self.pos
    }

    fn refill(&mut self, chunk: Vec<u8>) {
        self.chunk = chunk;
        self.pos = 0;
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.buffered() == 0 {
            match self.rx.recv() {
                Ok(chunk) => self.refill(chunk),
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.buffered());
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Worker-side inbound stream that supports a bounded wait for data
pub trait Inbound: Read + Send {
    /// Wait up to `timeout` for readable data
    ///
    /// Returns `Ok(false)` on timeout and `BrokenPipe` once the host end
    /// is gone and everything buffered has been consumed.
    fn poll(&mut self, timeout: Duration) -> io::Result<bool>;
}

impl Inbound for PipeReader {
    fn poll(&mut self, timeout: Duration) -> io::Result<bool> {
        if self.buffered() > 0 {
            return Ok(true);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(chunk) => {
                self.refill(chunk);
                Ok(true)
            }
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }
}

/// Host end of the control channel
pub struct ControlLink {
    tx: Box<dyn Write + Send>,
    rx: Box<dyn Read + Send>,
}

impl ControlLink {
    pub fn new(tx: Box<dyn Write + Send>, rx: Box<dyn Read + Send>) -> Self {
        Self { tx, rx }
    }

    /// Send a request and block until its reply arrives
    ///
    /// Requests without a reply (SET_CHANNEL) are posted and reported as
    /// [`Response::Compliance`].
    pub fn call(&mut self, request: &Request) -> Result<Response, ProtocolError> {
        request.write_to(&mut self.tx)?;
        if !request.expects_reply() {
            return Ok(Response::Compliance);
        }
        let response = Response::read_from(&mut self.rx, request.tag())?;
        log::debug!("[link] {:?} -> {:?}", request, response);
        Ok(response)
    }

    /// Send a request that has no reply
    pub fn post(&mut self, request: &Request) -> Result<(), ProtocolError> {
        log::trace!("[link] post {:?}", request);
        request.write_to(&mut self.tx)
    }

    /// Liveness handshake; returns the worker's process/task id
    ///
    /// Must be the first exchange on a fresh link.
    pub fn handshake(&mut self) -> Result<u32, ProtocolError> {
        match self.call(&Request::AreYouAlive)? {
            Response::Alive { worker_id } => Ok(worker_id),
            other => Err(ProtocolError::Handshake(format!(
                "expected I_AM_ALIVE, got {:?}",
                other
            ))),
        }
    }
}

impl LevelSink for ControlLink {
    fn send_level(&mut self, channel: usize, level: u8) -> Result<(), ProtocolError> {
        let channel = u32::try_from(channel).map_err(|_| {
            ProtocolError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("channel {} does not fit the wire format", channel),
            ))
        })?;
        self.post(&Request::SetChannel { channel, level })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Tag;
    use std::thread;

    /// Host link plus the raw worker-side ends
    fn linked() -> (ControlLink, PipeReader, PipeWriter) {
        let (host_tx, worker_rx) = pipe();
        let (worker_tx, host_rx) = pipe();
        let link = ControlLink::new(Box::new(host_tx), Box::new(host_rx));
        (link, worker_rx, worker_tx)
    }

    #[test]
    fn test_pipe_reassembles_across_chunks() {
        let (mut tx, mut rx) = pipe();
        tx.write_all(&[1, 2, 3]).unwrap();
        tx.write_all(&[4, 5]).unwrap();
        drop(tx);

        let mut all = Vec::new();
        rx.read_to_end(&mut all).unwrap();
        assert_eq!(all, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_poll_times_out_then_sees_data() {
        let (mut tx, mut rx) = pipe();
        assert!(!rx.poll(Duration::from_millis(5)).unwrap());

        tx.write_all(&[9]).unwrap();
        assert!(rx.poll(Duration::from_millis(5)).unwrap());
        // Still readable until consumed
        assert!(rx.poll(Duration::ZERO).unwrap());

        let mut byte = [0u8; 1];
        rx.read_exact(&mut byte).unwrap();
        assert_eq!(byte, [9]);
    }

    #[test]
    fn test_poll_reports_closed_host() {
        let (tx, mut rx) = pipe();
        drop(tx);
        let err = rx.poll(Duration::from_millis(5)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_write_to_closed_pipe_fails() {
        let (mut tx, rx) = pipe();
        drop(rx);
        assert_eq!(
            tx.write(&[1]).unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
    }

    #[test]
    fn test_handshake_reads_worker_id() {
        let (mut link, mut worker_rx, mut worker_tx) = linked();

        let responder = thread::spawn(move || {
            let req = Request::read_from(&mut worker_rx).unwrap();
            assert_eq!(req, Request::AreYouAlive);
            Response::Alive { worker_id: 77 }
                .write_to(&mut worker_tx)
                .unwrap();
        });

        assert_eq!(link.handshake().unwrap(), 77);
        responder.join().unwrap();
    }

    #[test]
    fn test_handshake_rejects_non_compliance() {
        let (mut link, mut worker_rx, mut worker_tx) = linked();

        let responder = thread::spawn(move || {
            let _ = Request::read_from(&mut worker_rx).unwrap();
            Response::NonCompliance.write_to(&mut worker_tx).unwrap();
        });

        assert!(matches!(link.handshake(), Err(ProtocolError::Handshake(_))));
        responder.join().unwrap();
    }

    #[test]
    fn test_handshake_fails_when_worker_dies() {
        let (mut link, worker_rx, worker_tx) = linked();
        drop(worker_tx);
        drop(worker_rx);
        assert!(matches!(link.handshake(), Err(ProtocolError::Disconnected)));
    }

    #[test]
    fn test_set_channel_is_fire_and_forget() {
        let (mut link, mut worker_rx, _worker_tx) = linked();

        link.send_level(5, 128).unwrap();
        assert_eq!(
            link.call(&Request::SetChannel { channel: 6, level: 1 }).unwrap(),
            Response::Compliance
        );

        assert_eq!(
            Request::read_from(&mut worker_rx).unwrap(),
            Request::SetChannel { channel: 5, level: 128 }
        );
        assert_eq!(
            Request::read_from(&mut worker_rx).unwrap(),
            Request::SetChannel { channel: 6, level: 1 }
        );
    }

    #[test]
    fn test_unresponsive_worker_stalls_call_until_link_closes() {
        let (mut link, worker_rx, worker_tx) = linked();
        let (done_tx, done_rx) = flume::bounded(1);

        let caller = thread::spawn(move || {
            let result = link.call(&Request::QueryDevice);
            let _ = done_tx.send(result.map(|_| ()).map_err(|e| e.to_string()));
        });

        // No reply and no timeout: the call is still blocked
        assert!(matches!(
            done_rx.recv_timeout(Duration::from_millis(100)),
            Err(RecvTimeoutError::Timeout)
        ));

        drop(worker_tx);
        drop(worker_rx);
        let result = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(result.is_err());
        caller.join().unwrap();
    }

    #[test]
    fn test_reply_decoded_against_request_tag() {
        let (mut link, mut worker_rx, mut worker_tx) = linked();

        let responder = thread::spawn(move || {
            let req = Request::read_from(&mut worker_rx).unwrap();
            assert_eq!(req.tag(), Tag::QueryDevMods);
            Response::ModuleCount(2).write_to(&mut worker_tx).unwrap();
        });

        assert_eq!(
            link.call(&Request::QueryDevMods).unwrap(),
            Response::ModuleCount(2)
        );
        responder.join().unwrap();
    }
}
