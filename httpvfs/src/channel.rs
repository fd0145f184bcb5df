//! The blocking side of the dispatcher protocol.
//!
//! Each consumer owns a [`Region`] shared with the dispatcher: a status cell,
//! a scalar cell and a data buffer sized for the largest page. A consumer arms
//! the status cell, posts a request and parks on the cell until the
//! dispatcher publishes a status. The dispatcher is the only writer while a
//! request is outstanding and the consumer the only reader once it completes,
//! so the cells are never accessed concurrently by both sides.

use std::sync::Arc;

use futures::channel::mpsc::UnboundedSender;
use log::trace;
use parking_lot::{Condvar, Mutex};

use crate::{
    dispatcher::{ConsumerId, Message, Op, Request},
    registry::{parse_page_size, HEADER_SIZE},
    Error, Result,
};

/// The request succeeded.
pub const STATUS_OK: u32 = 0;
/// The request failed. The dispatcher logs the cause.
pub const STATUS_ERROR: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Status {
    Idle,
    Waiting,
    Done(u32),
}

struct Cells {
    status: Status,
    value: u64,
    data: Box<[u8]>,
}

/// Memory shared between one consumer and the dispatcher.
pub(crate) struct Region {
    id: ConsumerId,
    cells: Mutex<Cells>,
    cond: Condvar,
}

impl Region {
    pub(crate) fn new(id: ConsumerId, buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            cells: Mutex::new(Cells {
                status: Status::Idle,
                value: 0,
                data: vec![0u8; buffer_size].into_boxed_slice(),
            }),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn id(&self) -> ConsumerId {
        self.id
    }

    pub(crate) fn buffer_size(&self) -> usize {
        self.cells.lock().data.len()
    }

    /// Prepares the status cell for a new request.
    fn arm(&self) {
        self.cells.lock().status = Status::Waiting;
    }

    /// Blocks until the dispatcher publishes a status, then copies the data
    /// buffer into `out`.
    fn wait(&self, out: Option<&mut [u8]>) -> (u32, u64) {
        let mut cells = self.cells.lock();
        while cells.status == Status::Waiting {
            self.cond.wait(&mut cells);
        }
        let status = match cells.status {
            Status::Done(status) => status,
            Status::Idle | Status::Waiting => STATUS_ERROR,
        };
        cells.status = Status::Idle;
        if let (STATUS_OK, Some(out)) = (status, out) {
            let len = (cells.value as usize).min(out.len()).min(cells.data.len());
            out[..len].copy_from_slice(&cells.data[..len]);
            out[len..].fill(0);
        }
        (status, cells.value)
    }

    fn publish(&self, status: u32, value: u64, data: Option<&[u8]>) {
        let mut cells = self.cells.lock();
        if let Some(data) = data {
            cells.data[..data.len()].copy_from_slice(data);
        }
        cells.value = value;
        cells.status = Status::Done(status);
        drop(cells);
        self.cond.notify_all();
    }
}

/// Answers exactly one request.
///
/// A responder dropped without an answer publishes [`STATUS_ERROR`], so the
/// consumer is released on every path, including dispatcher shutdown.
pub(crate) struct Responder {
    region: Option<Arc<Region>>,
}

impl Responder {
    pub(crate) fn new(region: Arc<Region>) -> Self {
        Self {
            region: Some(region),
        }
    }

    pub(crate) fn consumer(&self) -> Option<ConsumerId> {
        self.region.as_ref().map(|r| r.id())
    }

    /// Publishes a successful status with a scalar result.
    pub(crate) fn ok(mut self, value: u64) {
        if let Some(region) = self.region.take() {
            region.publish(STATUS_OK, value, None);
        }
    }

    /// Publishes a successful status with a payload.
    ///
    /// A payload larger than the data buffer is a failure.
    pub(crate) fn data(mut self, data: &[u8]) {
        if let Some(region) = self.region.take() {
            if data.len() > region.buffer_size() {
                region.publish(STATUS_ERROR, 0, None);
            } else {
                region.publish(STATUS_OK, data.len() as u64, Some(data));
            }
        }
    }

    pub(crate) fn fail(mut self) {
        if let Some(region) = self.region.take() {
            region.publish(STATUS_ERROR, 0, None);
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            trace!("consumer {} released without an answer", region.id());
            region.publish(STATUS_ERROR, 0, None);
        }
    }
}

/// A blocking client of a dispatcher.
///
/// Each operation posts one request and parks the calling thread until the
/// dispatcher answers. Operations take `&mut self`, so a consumer has at most
/// one request in flight. Use one consumer per thread.
pub struct Consumer {
    region: Arc<Region>,
    sender: UnboundedSender<Message>,
}

impl Consumer {
    pub(crate) fn new(region: Arc<Region>, sender: UnboundedSender<Message>) -> Self {
        Self { region, sender }
    }

    /// Returns the id assigned during the handshake.
    pub fn id(&self) -> ConsumerId {
        self.region.id()
    }

    /// Opens the file at `url`, probing its size on first use.
    pub fn open(&mut self, url: &str) -> Result<()> {
        self.call(Op::Open(url.to_owned()), None).map(|_| ())
    }

    /// Returns true if the file at `url` has been opened.
    pub fn access(&mut self, url: &str) -> Result<bool> {
        self.call(Op::Access(url.to_owned()), None).map(|v| v != 0)
    }

    /// Returns the size of an opened file.
    pub fn file_size(&mut self, url: &str) -> Result<u64> {
        self.call(Op::FileSize(url.to_owned()), None)
    }

    /// Reads `buf.len()` bytes at `offset` within a single page.
    ///
    /// Returns the number of bytes read. Bytes past the end of the file are
    /// zero-filled.
    pub fn read(&mut self, url: &str, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let op = Op::Read {
            url: url.to_owned(),
            offset,
            len: buf.len(),
        };
        self.call(op, Some(buf)).map(|n| n as usize)
    }

    /// Reads the page size declared in the header of an opened file.
    pub fn page_size(&mut self, url: &str) -> Result<u32> {
        let mut header = [0u8; HEADER_SIZE];
        let n = self.read(url, 0, &mut header)?;
        parse_page_size(&header[..n])
    }

    fn call(&mut self, op: Op, out: Option<&mut [u8]>) -> Result<u64> {
        self.region.arm();
        let request = Request {
            consumer: self.id(),
            op,
            responder: Responder::new(self.region.clone()),
        };
        if self.sender.unbounded_send(Message::Data(request)).is_err() {
            return Err(Error::Closed);
        }
        match self.region.wait(out) {
            (STATUS_OK, value) => Ok(value),
            _ => Err(Error::Failed),
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.sender
            .unbounded_send(Message::Release(self.id()))
            .unwrap_or_default();
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;

    #[test]
    fn publish_wakes_waiter() {
        let region = Region::new(1, 8);
        region.arm();
        let responder = Responder::new(region.clone());
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            responder.data(&[1, 2, 3]);
        });
        let mut out = [9u8; 5];
        assert_eq!(region.wait(Some(&mut out)), (STATUS_OK, 3));
        assert_eq!(out, [1, 2, 3, 0, 0]);
        handle.join().unwrap();
    }

    #[test]
    fn dropped_responder_fails() {
        let region = Region::new(1, 8);
        region.arm();
        drop(Responder::new(region.clone()));
        assert_eq!(region.wait(None).0, STATUS_ERROR);
    }

    #[test]
    fn oversized_payload_fails() {
        let region = Region::new(1, 2);
        region.arm();
        Responder::new(region.clone()).data(&[1, 2, 3]);
        let mut out = [0u8; 2];
        assert_eq!(region.wait(Some(&mut out)).0, STATUS_ERROR);
        assert_eq!(out, [0, 0]);
    }

    #[test]
    fn scalar_result() {
        let region = Region::new(7, 0);
        region.arm();
        let responder = Responder::new(region.clone());
        assert_eq!(responder.consumer(), Some(7));
        responder.ok(8192);
        assert_eq!(region.wait(None), (STATUS_OK, 8192));
    }
}
