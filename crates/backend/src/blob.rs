//! Reference-counted tensor buffers
//!
//! A [`Blob`] is a byte-range view over shared storage. Clones alias the
//! same allocation, which is what lets the batch collector hand every
//! logical request a zero-copy slice of one batched backend buffer.

use crate::DeviceName;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::trace;

/// Tensor memory layout
///
/// Layouts whose first dimension is the batch axis can be sliced into
/// per-batch-element views; the rest (constants broadcast across the batch)
/// are shared whole between batch members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Nc,
    Nchw,
    Nhwc,
    Ncdhw,
    Ndhwc,
    Chw,
    Scalar,
    Any,
}

impl Layout {
    /// Whether the leading dimension is a batch axis
    pub fn has_batch_axis(self) -> bool {
        matches!(
            self,
            Layout::Nc | Layout::Nchw | Layout::Nhwc | Layout::Ncdhw | Layout::Ndhwc
        )
    }
}

/// A byte-range view over reference-counted storage
///
/// Cheap to clone; clones share the underlying allocation. A blob may carry
/// a device affinity, which pins any logical request holding it to that
/// device during scheduling.
#[derive(Clone)]
pub struct Blob {
    storage: Arc<RwLock<Vec<u8>>>,
    offset: usize,
    len: usize,
    layout: Layout,
    device: Option<DeviceName>,
}

impl std::fmt::Debug for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blob")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("layout", &self.layout)
            .field("device", &self.device)
            .finish()
    }
}

impl Blob {
    /// Allocate a zero-filled host blob
    pub fn allocate(len: usize, layout: Layout) -> Self {
        Self {
            storage: Arc::new(RwLock::new(vec![0u8; len])),
            offset: 0,
            len,
            layout,
            device: None,
        }
    }

    /// Allocate a blob that is resident on (and pinned to) a device
    pub fn on_device(len: usize, layout: Layout, device: impl Into<DeviceName>) -> Self {
        Self {
            device: Some(device.into()),
            ..Self::allocate(len, layout)
        }
    }

    /// A sub-view sharing this blob's storage; `offset` is relative to
    /// this view
    pub fn view(&self, offset: usize, len: usize) -> Self {
        assert!(
            offset + len <= self.len,
            "view [{}, {}) out of bounds for blob of {} bytes",
            offset,
            offset + len,
            self.len
        );
        Self {
            storage: Arc::clone(&self.storage),
            offset: self.offset + offset,
            len,
            layout: self.layout,
            device: self.device.clone(),
        }
    }

    /// The per-batch-element view of a batched buffer
    ///
    /// Batch-axis layouts slice out element `batch_id`'s region; everything
    /// else (constants) aliases the full buffer for every member.
    pub fn batch_view(&self, batch_id: usize, batch_num: usize) -> Self {
        if self.layout.has_batch_axis() && batch_num > 0 && self.len % batch_num == 0 {
            let per = self.len / batch_num;
            self.view(per * batch_id, per)
        } else {
            self.clone()
        }
    }

    /// Byte length of this view
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the view is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Tensor layout
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Device this blob is resident on, if any
    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    /// Whether two blobs share one allocation (regardless of offsets)
    pub fn aliases(&self, other: &Blob) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Whether two blobs are the same view of the same allocation
    pub fn same_view(&self, other: &Blob) -> bool {
        self.aliases(other) && self.offset == other.offset && self.len == other.len
    }

    /// Snapshot the view's bytes
    pub fn bytes(&self) -> Vec<u8> {
        let guard = self.storage.read();
        guard[self.offset..self.offset + self.len].to_vec()
    }

    /// Overwrite the view's bytes. Panics on length mismatch; callers that
    /// tolerate mismatches go through [`copy_if_needed`].
    pub fn copy_from_slice(&self, src: &[u8]) {
        assert_eq!(src.len(), self.len, "blob write length mismatch");
        let mut guard = self.storage.write();
        guard[self.offset..self.offset + self.len].copy_from_slice(src);
    }

    /// A deep copy backed by fresh storage
    pub fn deep_copy(&self) -> Self {
        let copy = Blob::allocate(self.len, self.layout);
        copy.copy_from_slice(&self.bytes());
        copy
    }
}

/// Copy `src` into `dst` unless nothing needs copying
///
/// Shared storage means the data is already where it needs to be. A
/// byte-size mismatch means one side is a pre-aliased batch view of the
/// other's storage; that is not an error, there is just nothing to copy.
pub fn copy_if_needed(src: &Blob, dst: &Blob) {
    if src.aliases(dst) {
        return;
    }
    if src.len() != dst.len() {
        trace!(
            src_len = src.len(),
            dst_len = dst.len(),
            "skipping copy between differently sized blobs"
        );
        return;
    }
    dst.copy_from_slice(&src.bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_view_slices_batch_axis() {
        let batched = Blob::allocate(16, Layout::Nchw);
        batched.copy_from_slice(&(0u8..16).collect::<Vec<_>>());

        let member = batched.batch_view(2, 4);

        assert_eq!(member.len(), 4);
        assert_eq!(member.bytes(), vec![8, 9, 10, 11]);
        assert!(member.aliases(&batched));
    }

    #[test]
    fn test_batch_view_shares_constants() {
        let constant = Blob::allocate(8, Layout::Scalar);

        let member = constant.batch_view(3, 4);

        assert_eq!(member.len(), 8);
        assert!(member.same_view(&constant));
    }

    #[test]
    fn test_view_writes_through_to_storage() {
        let batched = Blob::allocate(8, Layout::Nc);
        let member = batched.batch_view(1, 2);

        member.copy_from_slice(&[7, 7, 7, 7]);

        assert_eq!(batched.bytes(), vec![0, 0, 0, 0, 7, 7, 7, 7]);
    }

    #[test]
    fn test_copy_if_needed_skips_aliases_and_mismatches() {
        let batched = Blob::allocate(8, Layout::Nc);
        let member = batched.batch_view(0, 2);

        // aliased: no copy, no panic
        copy_if_needed(&batched, &member);

        // size mismatch against a distinct allocation: skipped
        let user = Blob::allocate(3, Layout::Nc);
        user.copy_from_slice(&[1, 2, 3]);
        copy_if_needed(&user, &member);
        assert_eq!(member.bytes(), vec![0, 0, 0, 0]);

        // matching distinct allocation: copied
        let user = Blob::allocate(4, Layout::Nc);
        user.copy_from_slice(&[1, 2, 3, 4]);
        copy_if_needed(&user, &member);
        assert_eq!(member.bytes(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_device_affinity() {
        let remote = Blob::on_device(4, Layout::Nchw, "GPU.1");

        assert_eq!(remote.device(), Some("GPU.1"));
        assert_eq!(remote.view(0, 2).device(), Some("GPU.1"));
    }
}
