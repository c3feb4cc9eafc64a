//! Memory regions: page-aligned buffers, their registration with a backend,
//! and the descriptors that let a peer address them remotely.

use std::{
    alloc::{self, Layout},
    fmt::{Debug, Formatter},
    ptr::NonNull,
    sync::Arc,
};

use bitflags::bitflags;

use crate::{
    backend::{LocalSge, MrKeys, RdmaBackend, RemoteSge},
    error::{Result, RpmaError},
};

pub const PAGE_SIZE: usize = 4096;

/// Encoded size of a memory region descriptor: addr, len, rkey, usage.
pub const MR_DESCRIPTOR_BYTES: usize = 8 + 8 + 4 + 1;

bitflags! {
    /// What a registered region may be used for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MrUsage: u8 {
        /// Remote peers may RDMA-read from it.
        const READ_SRC = 1 << 0;
        /// Local RDMA reads land in it.
        const READ_DST = 1 << 1;
        /// Local RDMA writes are sourced from it.
        const WRITE_SRC = 1 << 2;
        /// Remote peers may RDMA-write (and flush) into it.
        const WRITE_DST = 1 << 3;
    }
}

/// Zeroed, page-aligned heap allocation suitable for registration.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

impl AlignedBuffer {
    pub fn new(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(RpmaError::InvalidArgument("buffer len must be non-zero"));
        }
        let layout = Layout::from_size_align(len, PAGE_SIZE)
            .map_err(|_| RpmaError::InvalidArgument("buffer len overflows layout"))?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            RpmaError::Backend(format!("aligned allocation of {len} bytes failed"))
        })?;
        Ok(Self { ptr, len, layout })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len bytes for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for len bytes and uniquely borrowed.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl Debug for AlignedBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("ptr", &format!("{:p}", self.ptr.as_ptr()))
            .field("len", &self.len)
            .finish()
    }
}

// SAFETY: the buffer is a plain heap allocation owned by this value.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

pub(crate) struct MrInner {
    backend: Arc<dyn RdmaBackend>,
    buffer: Option<AlignedBuffer>,
    addr: u64,
    len: usize,
    keys: MrKeys,
    usage: MrUsage,
}

impl MrInner {
    pub(crate) fn sge(&self, offset: usize) -> LocalSge {
        LocalSge {
            lkey: self.keys.lkey,
            addr: self.addr + offset as u64,
        }
    }

    fn release(&mut self) -> Option<AlignedBuffer> {
        let buffer = self.buffer.take()?;
        if let Err(error) = self.backend.deregister_memory(self.keys) {
            log::warn!(
                "deregister mr failed: backend={}, addr={:#x}, len={}, error={}",
                self.backend.name(),
                self.addr,
                self.len,
                error
            );
        } else {
            log::debug!("deregistered mr: addr={:#x}, len={}", self.addr, self.len);
        }
        Some(buffer)
    }
}

impl Drop for MrInner {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// A locally registered memory region.
///
/// In-flight operations keep a reference to the region, so the backend
/// registration outlives every operation that names it.
pub struct LocalMr {
    inner: Arc<MrInner>,
}

impl LocalMr {
    pub(crate) fn register(
        backend: Arc<dyn RdmaBackend>,
        buffer: AlignedBuffer,
        usage: MrUsage,
    ) -> Result<Self> {
        if usage.is_empty() {
            return Err(RpmaError::RegistrationDenied(
                "usage flags are empty".to_string(),
            ));
        }
        let addr = buffer.as_ptr() as u64;
        let len = buffer.len();
        let keys = backend.register_memory(addr, len, usage)?;
        log::debug!(
            "registered mr: backend={}, addr={:#x}, len={}, usage={:?}, rkey={:#x}",
            backend.name(),
            addr,
            len,
            usage,
            keys.rkey
        );
        Ok(Self {
            inner: Arc::new(MrInner {
                backend,
                buffer: Some(buffer),
                addr,
                len,
                keys,
                usage,
            }),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    pub fn usage(&self) -> MrUsage {
        self.inner.usage
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the buffer lives as long as `inner`; remote writers only
        // touch it through the backend while the registration is alive.
        unsafe { std::slice::from_raw_parts(self.inner.addr as *const u8, self.inner.len) }
    }

    /// Mutable view of the registered bytes. Do not modify ranges that an
    /// outstanding operation is reading or writing.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: see `as_slice`; `&mut self` excludes other local borrows.
        unsafe { std::slice::from_raw_parts_mut(self.inner.addr as *mut u8, self.inner.len) }
    }

    /// Number of in-flight operations referencing this region.
    pub fn inflight(&self) -> usize {
        Arc::strong_count(&self.inner) - 1
    }

    pub fn descriptor(&self) -> [u8; MR_DESCRIPTOR_BYTES] {
        encode_descriptor(
            self.inner.addr,
            self.inner.len as u64,
            self.inner.keys.rkey,
            self.inner.usage,
        )
    }

    /// Deregisters the region and hands the buffer back.
    ///
    /// With operations still in flight this fails with `RegionBusy`; the
    /// region is then deregistered once the last of them retires.
    pub fn deregister(self) -> Result<AlignedBuffer> {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => inner
                .release()
                .ok_or(RpmaError::Backend("region already released".to_string())),
            Err(shared) => Err(RpmaError::RegionBusy {
                inflight: Arc::strong_count(&shared) - 1,
            }),
        }
    }

    pub(crate) fn shared(&self) -> Arc<MrInner> {
        Arc::clone(&self.inner)
    }
}

impl Debug for LocalMr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMr")
            .field("addr", &format!("{:#x}", self.inner.addr))
            .field("len", &self.inner.len)
            .field("usage", &self.inner.usage)
            .field("rkey", &format!("{:#x}", self.inner.keys.rkey))
            .finish()
    }
}

/// A peer's memory region as described by its exported descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteMr {
    addr: u64,
    len: u64,
    rkey: u32,
    usage: MrUsage,
}

impl RemoteMr {
    pub fn from_descriptor(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != MR_DESCRIPTOR_BYTES {
            return Err(RpmaError::Malformed("mr descriptor has wrong size"));
        }
        let usage = MrUsage::from_bits(bytes[20])
            .ok_or(RpmaError::Malformed("mr descriptor has unknown usage bits"))?;
        if !usage.intersects(MrUsage::READ_SRC | MrUsage::WRITE_DST) {
            return Err(RpmaError::Malformed(
                "mr descriptor grants no remote access",
            ));
        }
        Ok(Self {
            addr: u64::from_le_bytes(read_array(&bytes[0..8])),
            len: u64::from_le_bytes(read_array(&bytes[8..16])),
            rkey: u32::from_le_bytes(read_array(&bytes[16..20])),
            usage,
        })
    }

    pub fn size(&self) -> u64 {
        self.len
    }

    pub fn usage(&self) -> MrUsage {
        self.usage
    }

    pub fn to_descriptor(&self) -> [u8; MR_DESCRIPTOR_BYTES] {
        encode_descriptor(self.addr, self.len, self.rkey, self.usage)
    }

    pub(crate) fn sge(&self, offset: usize) -> RemoteSge {
        RemoteSge {
            rkey: self.rkey,
            addr: self.addr + offset as u64,
        }
    }
}

/// Imports a descriptor received in serialized form, requiring at least
/// `expected_min_length` bytes to be present.
pub fn import_descriptor(bytes: &[u8], expected_min_length: usize) -> Result<RemoteMr> {
    let need = expected_min_length.max(MR_DESCRIPTOR_BYTES);
    if bytes.len() < need {
        return Err(RpmaError::Malformed("mr descriptor shorter than expected"));
    }
    RemoteMr::from_descriptor(&bytes[..MR_DESCRIPTOR_BYTES])
}

fn encode_descriptor(addr: u64, len: u64, rkey: u32, usage: MrUsage) -> [u8; MR_DESCRIPTOR_BYTES] {
    let mut bytes = [0_u8; MR_DESCRIPTOR_BYTES];
    bytes[0..8].copy_from_slice(&addr.to_le_bytes());
    bytes[8..16].copy_from_slice(&len.to_le_bytes());
    bytes[16..20].copy_from_slice(&rkey.to_le_bytes());
    bytes[20] = usage.bits();
    bytes
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::{AlignedBuffer, LocalMr, MR_DESCRIPTOR_BYTES, MrUsage, PAGE_SIZE, RemoteMr};
    use crate::{
        backend::{MrKeys, RdmaBackend},
        error::{Result, RpmaError},
        mr::import_descriptor,
    };

    /// Backend double that only records registrations.
    #[derive(Default)]
    pub(crate) struct RecordingBackend {
        pub(crate) live: Mutex<Vec<u32>>,
    }

    impl RdmaBackend for RecordingBackend {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn register_memory(&self, _addr: u64, _len: usize, _usage: MrUsage) -> Result<MrKeys> {
            let mut live = self.live.lock();
            let key = live.len() as u32 + 0x100;
            live.push(key);
            Ok(MrKeys { lkey: key, rkey: key })
        }

        fn deregister_memory(&self, keys: MrKeys) -> Result<()> {
            let mut live = self.live.lock();
            let before = live.len();
            live.retain(|key| *key != keys.lkey);
            if live.len() == before {
                return Err(RpmaError::Backend("unknown key".to_string()));
            }
            Ok(())
        }
    }

    fn register(backend: &Arc<RecordingBackend>, len: usize, usage: MrUsage) -> LocalMr {
        let buffer = AlignedBuffer::new(len).expect("alloc");
        LocalMr::register(Arc::clone(backend) as Arc<dyn RdmaBackend>, buffer, usage)
            .expect("register")
    }

    #[test]
    fn aligned_buffer_is_page_aligned_and_zeroed() {
        let buffer = AlignedBuffer::new(100).expect("alloc");
        assert_eq!(buffer.as_ptr() as usize % PAGE_SIZE, 0);
        assert!(buffer.as_slice().iter().all(|byte| *byte == 0));
        assert!(AlignedBuffer::new(0).is_err());
    }

    #[test]
    fn descriptor_roundtrip_preserves_fields() {
        let backend = Arc::new(RecordingBackend::default());
        let mr = register(&backend, 4096, MrUsage::WRITE_DST | MrUsage::READ_SRC);
        let remote = RemoteMr::from_descriptor(&mr.descriptor()).expect("decode");
        assert_eq!(remote.size(), 4096);
        assert_eq!(remote.usage(), MrUsage::WRITE_DST | MrUsage::READ_SRC);
        assert_eq!(remote.to_descriptor(), mr.descriptor());
    }

    #[test]
    fn descriptor_rejects_bad_input() {
        assert_eq!(
            RemoteMr::from_descriptor(&[0_u8; MR_DESCRIPTOR_BYTES - 1]),
            Err(RpmaError::Malformed("mr descriptor has wrong size"))
        );

        let mut bytes = [0_u8; MR_DESCRIPTOR_BYTES];
        bytes[20] = 0x80;
        assert_eq!(
            RemoteMr::from_descriptor(&bytes),
            Err(RpmaError::Malformed("mr descriptor has unknown usage bits"))
        );

        bytes[20] = MrUsage::WRITE_SRC.bits();
        assert_eq!(
            RemoteMr::from_descriptor(&bytes),
            Err(RpmaError::Malformed("mr descriptor grants no remote access"))
        );
    }

    #[test]
    fn import_descriptor_checks_expected_length() {
        let backend = Arc::new(RecordingBackend::default());
        let mr = register(&backend, 64, MrUsage::WRITE_DST);
        let mut bytes = mr.descriptor().to_vec();
        assert!(import_descriptor(&bytes, MR_DESCRIPTOR_BYTES).is_ok());
        assert!(import_descriptor(&bytes, MR_DESCRIPTOR_BYTES + 1).is_err());
        bytes.truncate(10);
        assert!(import_descriptor(&bytes, 0).is_err());
    }

    #[test]
    fn register_rejects_empty_usage() {
        let backend = Arc::new(RecordingBackend::default());
        let buffer = AlignedBuffer::new(64).expect("alloc");
        let err = LocalMr::register(backend as Arc<dyn RdmaBackend>, buffer, MrUsage::empty())
            .expect_err("must fail");
        assert!(matches!(err, RpmaError::RegistrationDenied(_)));
    }

    #[test]
    fn deregister_waits_for_inflight_references() {
        let backend = Arc::new(RecordingBackend::default());
        let mr = register(&backend, 64, MrUsage::WRITE_SRC);
        let inflight = mr.shared();
        assert_eq!(mr.inflight(), 1);
        assert_eq!(
            mr.deregister().expect_err("busy"),
            RpmaError::RegionBusy { inflight: 1 }
        );
        assert_eq!(backend.live.lock().len(), 1);

        drop(inflight);
        assert!(backend.live.lock().is_empty());
    }

    #[test]
    fn deregister_returns_buffer() {
        let backend = Arc::new(RecordingBackend::default());
        let mut mr = register(&backend, 64, MrUsage::WRITE_SRC);
        mr.as_mut_slice()[..5].copy_from_slice(b"hello");
        let buffer = mr.deregister().expect("idle region");
        assert_eq!(&buffer.as_slice()[..5], b"hello");
        assert!(backend.live.lock().is_empty());
    }
}
