//! Block I/O requests
//!
//! A [`Bio`] is owned by whoever delivered it. The remapper rewrites its
//! destination and hands it to a submitter; the submitter completes it by
//! sending the outcome on the completion channel, if one was attached.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::device::BlockDevice;

/// Outcome of a completed request; carries the data for reads
pub type BioResult = std::io::Result<Bytes>;

/// Request operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BioOp {
    Read,
    Write,
    Flush,
    Discard,
    WriteZeroes,
}

impl BioOp {
    /// Direction of the data transfer. Everything but a read counts as a
    /// write-direction operation, even when it carries no data.
    pub const fn data_dir(self) -> DataDir {
        match self {
            Self::Read => DataDir::Read,
            Self::Write | Self::Flush | Self::Discard | Self::WriteZeroes => DataDir::Write,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Flush => "flush",
            Self::Discard => "discard",
            Self::WriteZeroes => "write-zeroes",
        }
    }
}

/// Data direction flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDir {
    Read,
    Write,
}

pub struct Bio {
    device: Option<Arc<BlockDevice>>,
    sector: u64,
    op: BioOp,
    size: u32,
    payload: Bytes,
    completion: Option<oneshot::Sender<BioResult>>,
}

impl Bio {
    fn new(op: BioOp, sector: u64, size: u32, payload: Bytes) -> Self {
        Self {
            device: None,
            sector,
            op,
            size,
            payload,
            completion: None,
        }
    }

    /// Read `size` bytes starting at `sector`
    pub fn read(sector: u64, size: u32) -> Self {
        Self::new(BioOp::Read, sector, size, Bytes::new())
    }

    /// Write `data` starting at `sector`. Payloads are capped at `u32::MAX`
    /// bytes, the largest size a single request can describe.
    pub fn write(sector: u64, data: Bytes) -> Self {
        let size = u32::try_from(data.len()).unwrap_or(u32::MAX);
        let data = data.slice(..size as usize);
        Self::new(BioOp::Write, sector, size, data)
    }

    /// Flush volatile caches of the device
    pub fn flush() -> Self {
        Self::new(BioOp::Flush, 0, 0, Bytes::new())
    }

    /// Discard `size` bytes starting at `sector`
    pub fn discard(sector: u64, size: u32) -> Self {
        Self::new(BioOp::Discard, sector, size, Bytes::new())
    }

    /// Zero `size` bytes starting at `sector`
    pub fn write_zeroes(sector: u64, size: u32) -> Self {
        Self::new(BioOp::WriteZeroes, sector, size, Bytes::new())
    }

    /// Attach a completion channel and return its receiving end
    #[must_use]
    pub fn with_completion(mut self) -> (Self, oneshot::Receiver<BioResult>) {
        let (tx, rx) = oneshot::channel();
        self.completion = Some(tx);
        (self, rx)
    }

    /// Target device, once remapped
    pub const fn device(&self) -> Option<&Arc<BlockDevice>> {
        self.device.as_ref()
    }

    /// Target sector
    pub const fn sector(&self) -> u64 {
        self.sector
    }

    pub const fn op(&self) -> BioOp {
        self.op
    }

    /// Size in bytes
    pub const fn size(&self) -> u32 {
        self.size
    }

    pub const fn data_dir(&self) -> DataDir {
        self.op.data_dir()
    }

    /// Data carried by a write
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Whether the request transfers data
    pub const fn has_data(&self) -> bool {
        self.size != 0 && matches!(self.op, BioOp::Read | BioOp::Write)
    }

    pub(crate) fn set_device(&mut self, device: Arc<BlockDevice>) {
        self.device = Some(device);
    }

    pub(crate) const fn set_sector(&mut self, sector: u64) {
        self.sector = sector;
    }

    /// End the request, notifying the waiter if there is one
    pub fn complete(mut self, result: BioResult) {
        if let Some(tx) = self.completion.take() {
            // The waiter may have gone away; nothing left to notify then.
            let _ = tx.send(result);
        }
    }
}

impl fmt::Debug for Bio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bio")
            .field("device", &self.device.as_ref().map(|d| d.id()))
            .field("sector", &self.sector)
            .field("op", &self.op)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_dir() {
        assert_eq!(BioOp::Read.data_dir(), DataDir::Read);
        assert_eq!(BioOp::Write.data_dir(), DataDir::Write);
        assert_eq!(BioOp::Discard.data_dir(), DataDir::Write);
        assert_eq!(BioOp::Flush.data_dir(), DataDir::Write);
    }

    #[test]
    fn test_has_data() {
        assert!(Bio::read(0, 4096).has_data());
        assert!(Bio::write(0, Bytes::from_static(b"abc")).has_data());
        assert!(!Bio::write(0, Bytes::new()).has_data());
        assert!(!Bio::flush().has_data());
        assert!(!Bio::discard(0, 4096).has_data());
        assert!(!Bio::write_zeroes(8, 512).has_data());
    }

    #[test]
    fn test_write_size_from_payload() {
        let bio = Bio::write(3, Bytes::from(vec![7u8; 1000]));
        assert_eq!(bio.size(), 1000);
        assert_eq!(bio.sector(), 3);
        assert!(bio.device().is_none());
    }

    #[tokio::test]
    async fn test_complete_notifies_waiter() {
        let (bio, rx) = Bio::read(0, 4).with_completion();
        bio.complete(Ok(Bytes::from_static(b"data")));
        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from_static(b"data"));
    }

    #[test]
    fn test_complete_without_waiter() {
        Bio::flush().complete(Ok(Bytes::new()));
    }
}
