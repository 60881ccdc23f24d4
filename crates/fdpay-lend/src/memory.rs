//! Descriptor-backed memory and the media buffers built from it.

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use bytes::Bytes;

/// A region `[offset, offset + size)` of a descriptor-backed file.
///
/// `exclusive` regions belong to a single buffer. `pooled` regions share
/// their file with other regions and may be recycled by whoever owns the
/// pool once this reference is dropped.
#[derive(Clone)]
pub struct FdMemory {
    file: Arc<File>,
    offset: u64,
    size: u64,
    reusable: bool,
}

impl FdMemory {
    pub fn exclusive(file: File, offset: u64, size: u64) -> Self {
        Self {
            file: Arc::new(file),
            offset,
            size,
            reusable: false,
        }
    }

    pub fn pooled(file: Arc<File>, offset: u64, size: u64) -> Self {
        Self {
            file,
            offset,
            size,
            reusable: true,
        }
    }

    /// Whether the region may be recycled by someone else after this
    /// reference goes away.
    pub fn is_reusable(&self) -> bool {
        self.reusable
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    /// Write `data` at `pos` bytes into the region.
    pub fn write_at(&self, pos: u64, data: &[u8]) -> io::Result<()> {
        let end = pos.checked_add(data.len() as u64);
        if end.is_none_or(|end| end > self.size) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write past end of region",
            ));
        }
        self.file.write_all_at(data, self.offset + pos)
    }

    /// Read the whole region.
    pub fn read(&self) -> io::Result<Vec<u8>> {
        read_region(&self.file, self.offset, self.size)
    }
}

impl AsFd for FdMemory {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl std::fmt::Debug for FdMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdMemory")
            .field("fd", &self.file.as_fd())
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("reusable", &self.reusable)
            .finish()
    }
}

pub(crate) fn read_region(file: &File, offset: u64, size: u64) -> io::Result<Vec<u8>> {
    let len = usize::try_from(size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "region too large"))?;
    let mut out = vec![0u8; len];
    file.read_exact_at(&mut out, offset)?;
    Ok(out)
}

/// One memory block of a [`MediaBuffer`].
#[derive(Debug, Clone)]
pub enum Memory {
    Fd(FdMemory),
    Heap(Bytes),
}

impl Memory {
    pub fn is_fd_backed(&self) -> bool {
        matches!(self, Memory::Fd(_))
    }

    pub fn len(&self) -> u64 {
        match self {
            Memory::Fd(memory) => memory.size(),
            Memory::Heap(bytes) => bytes.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<FdMemory> for Memory {
    fn from(memory: FdMemory) -> Self {
        Memory::Fd(memory)
    }
}

impl From<Bytes> for Memory {
    fn from(bytes: Bytes) -> Self {
        Memory::Heap(bytes)
    }
}

/// Timing and position metadata of a media buffer, in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferMeta {
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: Option<i64>,
    /// Position of the buffer in its stream; travels as the header sequence.
    pub offset: Option<u64>,
    pub offset_end: Option<u64>,
}

/// An ordered list of memory blocks plus timing metadata.
#[derive(Debug, Clone, Default)]
pub struct MediaBuffer {
    memories: Vec<Memory>,
    meta: BufferMeta,
}

impl MediaBuffer {
    pub fn new(meta: BufferMeta) -> Self {
        Self {
            memories: Vec::new(),
            meta,
        }
    }

    pub fn with_memory(memory: impl Into<Memory>, meta: BufferMeta) -> Self {
        Self {
            memories: vec![memory.into()],
            meta,
        }
    }

    pub fn push(&mut self, memory: impl Into<Memory>) {
        self.memories.push(memory.into());
    }

    pub fn memories(&self) -> &[Memory] {
        &self.memories
    }

    pub fn meta(&self) -> &BufferMeta {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut BufferMeta {
        &mut self.meta
    }

    /// Total content size in bytes.
    pub fn size(&self) -> u64 {
        self.memories.iter().map(Memory::len).sum()
    }

    /// The single descriptor-backed block, if that is all the buffer holds.
    pub fn single_fd_memory(&self) -> Option<&FdMemory> {
        match self.memories.as_slice() {
            [Memory::Fd(memory)] => Some(memory),
            _ => None,
        }
    }

    /// Copy every block, in order, to the start of `dst`.
    pub fn copy_into(&self, dst: &FdMemory) -> io::Result<()> {
        let mut pos = 0u64;
        for memory in &self.memories {
            match memory {
                Memory::Heap(bytes) => {
                    dst.write_at(pos, bytes)?;
                    pos += bytes.len() as u64;
                }
                Memory::Fd(src) => {
                    let content = src.read()?;
                    dst.write_at(pos, &content)?;
                    pos += content.len() as u64;
                }
            }
        }
        Ok(())
    }
}

/// Source of fresh descriptor-backed memory.
pub trait FdAllocator: Send + Sync {
    /// Allocate an exclusive region of exactly `size` bytes.
    fn allocate(&self, size: u64) -> io::Result<FdMemory>;
}

/// Allocates each region in its own anonymous file: `memfd_create` on
/// Linux, an unlinked temporary file elsewhere.
#[derive(Debug, Clone, Default)]
pub struct TmpfileAllocator {
    _private: (),
}

impl TmpfileAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an anonymous file of `size` bytes.
    pub fn create_file(&self, size: u64) -> io::Result<File> {
        let file = anonymous_file()?;
        file.set_len(size)?;
        Ok(file)
    }
}

impl FdAllocator for TmpfileAllocator {
    fn allocate(&self, size: u64) -> io::Result<FdMemory> {
        Ok(FdMemory::exclusive(self.create_file(size)?, 0, size))
    }
}

#[cfg(target_os = "linux")]
fn anonymous_file() -> io::Result<File> {
    use std::os::fd::FromRawFd;

    // SAFETY: the name is a valid NUL-terminated string.
    let fd = unsafe { libc::memfd_create(c"fdpay-tmpfile".as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just returned by memfd_create and is owned by nobody else.
    Ok(unsafe { File::from_raw_fd(fd) })
}

#[cfg(not(target_os = "linux"))]
fn anonymous_file() -> io::Result<File> {
    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT: AtomicU64 = AtomicU64::new(0);
    let mut attempts = 0;
    loop {
        let path = std::env::temp_dir().join(format!(
            "fdpay-tmpfile-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ));
        match std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => {
                std::fs::remove_file(&path)?;
                return Ok(file);
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists && attempts < 16 => {
                attempts += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_returns_exclusive_region_of_requested_size() {
        let memory = TmpfileAllocator::new().allocate(64).unwrap();
        assert!(!memory.is_reusable());
        assert_eq!(memory.offset(), 0);
        assert_eq!(memory.size(), 64);
        assert_eq!(memory.file().metadata().unwrap().len(), 64);
    }

    #[test]
    fn write_and_read_region() {
        let memory = TmpfileAllocator::new().allocate(8).unwrap();
        memory.write_at(2, b"abc").unwrap();
        assert_eq!(memory.read().unwrap(), b"\0\0abc\0\0\0");
        assert!(memory.write_at(6, b"abc").is_err());
    }

    #[test]
    fn pooled_regions_share_a_file() {
        let file = Arc::new(TmpfileAllocator::new().create_file(16).unwrap());
        let first = FdMemory::pooled(Arc::clone(&file), 0, 8);
        let second = FdMemory::pooled(Arc::clone(&file), 8, 8);
        first.write_at(0, b"first---").unwrap();
        second.write_at(0, b"second--").unwrap();

        assert!(first.is_reusable());
        assert_eq!(second.read().unwrap(), b"second--");
        assert_eq!(read_region(&file, 0, 16).unwrap(), b"first---second--");
    }

    #[test]
    fn copy_into_concatenates_blocks() {
        let allocator = TmpfileAllocator::new();
        let fd_block = allocator.allocate(3).unwrap();
        fd_block.write_at(0, b"def").unwrap();

        let mut buffer = MediaBuffer::new(BufferMeta::default());
        buffer.push(Bytes::from_static(b"abc"));
        buffer.push(fd_block);
        assert_eq!(buffer.size(), 6);
        assert!(buffer.single_fd_memory().is_none());

        let dst = allocator.allocate(buffer.size()).unwrap();
        buffer.copy_into(&dst).unwrap();
        assert_eq!(dst.read().unwrap(), b"abcdef");
    }

    #[test]
    fn single_fd_memory_requires_exactly_one_fd_block() {
        let memory = TmpfileAllocator::new().allocate(4).unwrap();
        let buffer = MediaBuffer::with_memory(memory, BufferMeta::default());
        assert!(buffer.single_fd_memory().is_some());

        let heap = MediaBuffer::with_memory(Bytes::from_static(b"x"), BufferMeta::default());
        assert!(heap.single_fd_memory().is_none());
        assert!(MediaBuffer::default().single_fd_memory().is_none());
    }
}
