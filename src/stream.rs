//! Buffered, pipelined endpoint streams.
//!
//! A single blocking transfer per packet cannot keep a USB link busy: the
//! bus idles between the completion of one transfer and the submission of
//! the next. [`EndpointWriter`] and [`EndpointReader`] therefore keep
//! several transfers in flight per endpoint so that submission of the next
//! chunk never waits for completion of the previous one, while still
//! presenting plain ordered `std::io` streams.
//!
//! Using raw [`Device`](crate::Device) transfer calls and a stream on the
//! same endpoint at the same time is unsupported; the interleaving would be
//! undefined.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use crate::descriptor::{Direction, Endpoint};
use crate::transfer::{InFlight, TransferEngine};
use crate::Result;

/// Number of transfers kept in flight per streamed endpoint.
const PIPELINE_DEPTH: usize = 4;

/// Round the requested buffer size to a whole number of packets, at least
/// one.
fn chunk_size(endpoint: &Endpoint, buffer_size: usize) -> usize {
    let packet = usize::from(endpoint.max_packet_size()).max(1);
    buffer_size.max(packet) / packet * packet
}

/// Buffered writer over a bulk or interrupt OUT endpoint.
///
/// Writes accumulate until a full chunk (a whole number of packets) is
/// available, which is then submitted without waiting for earlier chunks to
/// complete. [`flush`](Write::flush) submits whatever is buffered and waits
/// for every outstanding transfer. If the most recently submitted chunk was
/// a positive exact multiple of the endpoint's maximum packet size, flushing
/// also sends a zero-length packet, the USB convention for marking the end
/// of a data unit. The ZLP is sent only on flush, never on intermediate
/// writes.
///
/// Dropping the writer runs the flush path best-effort; errors found there
/// are lost, so call `flush` explicitly when they matter.
pub struct EndpointWriter {
    engine: Arc<TransferEngine>,
    endpoint: Endpoint,
    chunk_size: usize,
    buffer: Vec<u8>,
    in_flight: VecDeque<InFlight>,
    /// Length of the most recently submitted chunk; 0 when nothing has been
    /// submitted since the last flush.
    last_submitted: usize,
}

impl EndpointWriter {
    pub(crate) fn new(engine: Arc<TransferEngine>, endpoint: Endpoint, buffer_size: usize) -> Self {
        let chunk_size = chunk_size(&endpoint, buffer_size);
        EndpointWriter {
            engine,
            endpoint,
            chunk_size,
            buffer: Vec::with_capacity(chunk_size),
            in_flight: VecDeque::with_capacity(PIPELINE_DEPTH),
            last_submitted: 0,
        }
    }

    fn submit_chunk(&mut self, chunk: Vec<u8>) -> Result<()> {
        if self.in_flight.len() >= PIPELINE_DEPTH {
            self.reap_oldest()?;
        }
        self.last_submitted = chunk.len();
        let in_flight = self.engine.submit(
            self.endpoint.address(),
            self.endpoint.transfer_type(),
            Direction::Out,
            None,
            chunk,
            Duration::ZERO,
        )?;
        self.in_flight.push_back(in_flight);
        Ok(())
    }

    fn reap_oldest(&mut self) -> Result<()> {
        if let Some(in_flight) = self.in_flight.pop_front() {
            self.engine.wait(in_flight, Duration::ZERO)?;
        }
        Ok(())
    }
}

impl Write for EndpointWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut consumed = 0;
        while consumed < buf.len() {
            let room = self.chunk_size - self.buffer.len();
            let take = room.min(buf.len() - consumed);
            self.buffer.extend_from_slice(&buf[consumed..consumed + take]);
            consumed += take;
            if self.buffer.len() == self.chunk_size {
                let chunk = mem::replace(&mut self.buffer, Vec::with_capacity(self.chunk_size));
                self.submit_chunk(chunk)?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            let chunk = mem::replace(&mut self.buffer, Vec::with_capacity(self.chunk_size));
            self.submit_chunk(chunk)?;
        }
        let packet = usize::from(self.endpoint.max_packet_size());
        if self.last_submitted > 0 && packet > 0 && self.last_submitted % packet == 0 {
            // the last chunk exactly filled its packets; the device needs a
            // zero-length packet to see the end of the data unit
            self.submit_chunk(Vec::new())?;
        }
        self.last_submitted = 0;
        while !self.in_flight.is_empty() {
            self.reap_oldest()?;
        }
        Ok(())
    }
}

impl Drop for EndpointWriter {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            log::warn!(
                "flush on drop failed for endpoint {:#04x}: {err}",
                self.endpoint.address()
            );
        }
    }
}

/// Buffered reader over a bulk or interrupt IN endpoint.
///
/// The reader keeps several read transfers outstanding and delivers their
/// data in submission order. A zero-length packet received
/// from the device is surfaced as a read returning `Ok(0)`; unlike most
/// `Read` implementations **this does not mean end-of-stream**; a USB
/// endpoint stream has no end short of an error.
///
/// Dropping the reader cancels the outstanding transfers and discards any
/// data received but not yet consumed.
pub struct EndpointReader {
    engine: Arc<TransferEngine>,
    endpoint: Endpoint,
    chunk_size: usize,
    in_flight: VecDeque<InFlight>,
    current: Vec<u8>,
    position: usize,
}

impl EndpointReader {
    pub(crate) fn new(
        engine: Arc<TransferEngine>,
        endpoint: Endpoint,
        buffer_size: usize,
    ) -> Result<Self> {
        let chunk_size = chunk_size(&endpoint, buffer_size);
        let mut reader = EndpointReader {
            engine,
            endpoint,
            chunk_size,
            in_flight: VecDeque::with_capacity(PIPELINE_DEPTH),
            current: Vec::new(),
            position: 0,
        };
        for _ in 0..PIPELINE_DEPTH {
            reader.prime()?;
        }
        Ok(reader)
    }

    fn prime(&mut self) -> Result<()> {
        let in_flight = self.engine.submit(
            self.endpoint.address(),
            self.endpoint.transfer_type(),
            Direction::In,
            None,
            vec![0; self.chunk_size],
            Duration::ZERO,
        )?;
        self.in_flight.push_back(in_flight);
        Ok(())
    }
}

impl Read for EndpointReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.position >= self.current.len() {
            if self.in_flight.is_empty() {
                self.prime()?;
            }
            let in_flight = match self.in_flight.pop_front() {
                Some(in_flight) => in_flight,
                None => return Err(io::Error::new(io::ErrorKind::Other, "read pipeline empty")),
            };
            let data = self.engine.wait(in_flight, Duration::ZERO)?;
            // keep the pipeline full; a failure here surfaces on a later read
            if let Err(err) = self.prime() {
                log::debug!(
                    "could not resubmit read on endpoint {:#04x}: {err}",
                    self.endpoint.address()
                );
            }
            if data.is_empty() {
                // zero-length packet; not end-of-stream
                return Ok(0);
            }
            self.current = data;
            self.position = 0;
        }
        let available = self.current.len() - self.position;
        let count = available.min(buf.len());
        buf[..count].copy_from_slice(&self.current[self.position..self.position + count]);
        self.position += count;
        Ok(count)
    }
}

impl Drop for EndpointReader {
    fn drop(&mut self) {
        // cancel the outstanding reads, then reap their completions so no
        // request survives the reader
        if let Err(err) = self.engine.abort(self.endpoint.address()) {
            log::debug!(
                "aborting reads on endpoint {:#04x} failed: {err}",
                self.endpoint.address()
            );
        }
        while let Some(in_flight) = self.in_flight.pop_front() {
            let _ = self.engine.wait(in_flight, Duration::ZERO);
        }
    }
}
