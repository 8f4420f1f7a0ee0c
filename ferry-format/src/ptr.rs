use crate::FormatError;
use ferry_storage::HostBuffer;
use std::{
    fmt,
    marker::PhantomData,
    mem,
    num::NonZeroU64,
    sync::atomic::{AtomicU64, Ordering},
};

/// Byte offset of a `T`, relative to the start of its region.
#[repr(transparent)]
pub struct Offset<T> {
    raw: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Offset<T> {
    pub const fn new(raw: u64) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    pub const fn get(self) -> u64 {
        self.raw
    }
}

impl<T> Clone for Offset<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Offset<T> {}
impl<T> PartialEq for Offset<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}
impl<T> Eq for Offset<T> {}
impl<T> Default for Offset<T> {
    fn default() -> Self {
        Self::new(0)
    }
}
impl<T> fmt::Debug for Offset<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "Offset({:#x})", self.raw)
    }
}
unsafe impl<T> bytemuck::Zeroable for Offset<T> {}
unsafe impl<T: 'static> bytemuck::Pod for Offset<T> {}

/// Identity of a `MemoryRegion`, unique for the process lifetime.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct RegionId(NonZeroU64);

impl RegionId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let raw = COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }
}

/// A pointer that has been checked against a particular region.
pub struct Resolved<T> {
    region: RegionId,
    start: usize,
    len: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Resolved<T> {
    pub fn region(&self) -> RegionId {
        self.region
    }

    /// Byte offset of the first element within the region.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> Clone for Resolved<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Resolved<T> {}
impl<T> fmt::Debug for Resolved<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter
            .debug_struct("Resolved")
            .field("region", &self.region)
            .field("start", &self.start)
            .field("len", &self.len)
            .finish()
    }
}

/// A pointer field of a container structure.
///
/// It starts as the serialized offset and becomes resolved by `fixup`.
/// The two states never overlap in representation, so there is no way
/// to use an offset as an address or to resolve an address again.
pub enum Ptr<T> {
    Offset(Offset<T>),
    Resolved(Resolved<T>),
}

impl<T> Clone for Ptr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Ptr<T> {}
impl<T> fmt::Debug for Ptr<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Offset(ref offset) => offset.fmt(formatter),
            Self::Resolved(ref resolved) => resolved.fmt(formatter),
        }
    }
}

impl<T> From<Offset<T>> for Ptr<T> {
    fn from(offset: Offset<T>) -> Self {
        Self::Offset(offset)
    }
}

impl<T: bytemuck::Pod> Ptr<T> {
    /// Resolve against `region`, covering `count` elements.
    ///
    /// Resolving again against the same region is a no-op,
    /// while a different region is rejected.
    pub fn fixup(&mut self, region: &MemoryRegion, count: usize) -> Result<Resolved<T>, FormatError> {
        match *self {
            Self::Offset(offset) => {
                let resolved = region.resolve(offset, count)?;
                *self = Self::Resolved(resolved);
                Ok(resolved)
            }
            Self::Resolved(resolved) if resolved.region == region.id() => Ok(resolved),
            Self::Resolved(_) => Err(FormatError::ForeignRegion),
        }
    }

    pub fn resolved(&self) -> Option<Resolved<T>> {
        match *self {
            Self::Offset(_) => None,
            Self::Resolved(resolved) => Some(resolved),
        }
    }
}

impl Ptr<u8> {
    /// Resolve a NUL-terminated string, excluding the terminator.
    pub fn fixup_str(&mut self, region: &MemoryRegion) -> Result<Resolved<u8>, FormatError> {
        let offset = match *self {
            Self::Offset(offset) => offset.get(),
            Self::Resolved(resolved) if resolved.region == region.id() => return Ok(resolved),
            Self::Resolved(_) => return Err(FormatError::ForeignRegion),
        };
        let tail = usize::try_from(offset)
            .ok()
            .and_then(|start| region.as_bytes().get(start..))
            .ok_or(FormatError::PointerOutOfBounds {
                offset,
                size: 1,
                region_size: region.len() as u64,
            })?;
        let count = tail
            .iter()
            .position(|&byte| byte == 0)
            .ok_or(FormatError::UnterminatedString(offset))?;
        if std::str::from_utf8(&tail[..count]).is_err() {
            return Err(FormatError::InvalidString(offset));
        }
        self.fixup(region, count)
    }
}

/// Decompressed contents of a container region.
///
/// Keeps the backing storage 8-byte aligned, so that any record
/// at a properly aligned offset can be viewed in place.
pub struct MemoryRegion {
    id: RegionId,
    buffer: HostBuffer,
}

impl MemoryRegion {
    pub fn new(buffer: HostBuffer) -> Self {
        Self {
            id: RegionId::next(),
            buffer,
        }
    }

    pub fn id(&self) -> RegionId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.as_bytes()
    }

    /// Read a structure stored at the very start of the region.
    pub fn header<H: bytemuck::Pod>(&self, what: &'static str) -> Result<H, FormatError> {
        self.as_bytes()
            .get(..mem::size_of::<H>())
            .map(bytemuck::pod_read_unaligned)
            .ok_or(FormatError::Truncated(what))
    }

    fn resolve<T: bytemuck::Pod>(&self, offset: Offset<T>, count: usize) -> Result<Resolved<T>, FormatError> {
        let region_size = self.len() as u64;
        let size = (count as u64).saturating_mul(mem::size_of::<T>() as u64);
        let end = offset.get().checked_add(size);
        if end.map_or(true, |end| end > region_size) {
            return Err(FormatError::PointerOutOfBounds {
                offset: offset.get(),
                size,
                region_size,
            });
        }
        let alignment = mem::align_of::<T>();
        if offset.get() % alignment as u64 != 0 {
            return Err(FormatError::Misaligned {
                offset: offset.get(),
                alignment,
            });
        }
        Ok(Resolved {
            region: self.id,
            start: offset.get() as usize,
            len: count,
            _marker: PhantomData,
        })
    }

    /// View the elements of a pointer resolved against this region.
    ///
    /// # Panics
    /// If the pointer belongs to another region.
    pub fn slice<T: bytemuck::Pod>(&self, resolved: &Resolved<T>) -> &[T] {
        assert_eq!(resolved.region, self.id, "pointer of a foreign region");
        let end = resolved.start + resolved.len * mem::size_of::<T>();
        bytemuck::cast_slice(&self.as_bytes()[resolved.start..end])
    }

    /// View a string resolved with `Ptr::fixup_str`.
    pub fn str(&self, resolved: &Resolved<u8>) -> &str {
        std::str::from_utf8(self.slice(resolved)).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoryRegion, Offset, Ptr};
    use crate::FormatError;
    use ferry_storage::HostBuffer;

    fn region(bytes: &[u8]) -> MemoryRegion {
        let mut buffer = HostBuffer::new(bytes.len());
        buffer.as_bytes_mut().copy_from_slice(bytes);
        MemoryRegion::new(buffer)
    }

    #[test]
    fn fixup_within_bounds() {
        let region = region(&[0u8; 64]);
        let mut ptr = Ptr::from(Offset::<u32>::new(16));
        let resolved = ptr.fixup(&region, 12).unwrap();
        let slice = region.slice(&resolved);
        assert_eq!(slice.len(), 12);
        let range = region.as_bytes().as_ptr_range();
        assert!(range.contains(&slice.as_ptr().cast()));
        // the last element ends exactly at the region end
        assert_eq!(resolved.start() + 12 * 4, region.len());

        assert!(matches!(
            Ptr::from(Offset::<u32>::new(16)).fixup(&region, 13),
            Err(FormatError::PointerOutOfBounds { .. })
        ));
        assert!(matches!(
            Ptr::from(Offset::<u32>::new(2)).fixup(&region, 1),
            Err(FormatError::Misaligned { alignment: 4, .. })
        ));
        assert!(matches!(
            Ptr::from(Offset::<u8>::new(u64::MAX)).fixup(&region, 2),
            Err(FormatError::PointerOutOfBounds { .. })
        ));
    }

    #[test]
    fn fixup_is_idempotent() {
        let region = region(&[1u8; 32]);
        let mut ptr = Ptr::from(Offset::<u64>::new(8));
        let first = ptr.fixup(&region, 2).unwrap();
        let second = ptr.fixup(&region, 2).unwrap();
        assert_eq!(first.start(), second.start());
        assert_eq!(region.slice(&second), &[0x0101010101010101u64; 2]);

        let other = self::region(&[1u8; 32]);
        assert!(matches!(
            ptr.fixup(&other, 2),
            Err(FormatError::ForeignRegion)
        ));
    }

    #[test]
    fn strings() {
        let region = region(b"\0name\0bad");
        let mut name = Ptr::from(Offset::<u8>::new(1));
        let resolved = name.fixup_str(&region).unwrap();
        assert_eq!(region.str(&resolved), "name");
        let mut empty = Ptr::from(Offset::<u8>::new(0));
        assert_eq!(region.str(&empty.fixup_str(&region).unwrap()), "");
        assert!(matches!(
            Ptr::from(Offset::<u8>::new(6)).fixup_str(&region),
            Err(FormatError::UnterminatedString(6))
        ));
    }
}
