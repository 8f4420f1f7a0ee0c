use crate::{FormatError, Header, MemoryRegion, Region};
use ferry_storage::{Codec, CompressionFormat, HostBuffer};
use std::io::{Read, Seek, SeekFrom};

/// Read and validate the container header.
pub fn read_header<R: Read + Seek>(reader: &mut R) -> Result<Header, FormatError> {
    let mut bytes = [0u8; Header::SIZE];
    reader.seek(SeekFrom::Start(0))?;
    reader.read_exact(&mut bytes).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => FormatError::Truncated("header"),
        _ => FormatError::Io(e),
    })?;
    Header::parse(&bytes)
}

/// Synchronously read and decompress a region.
#[profiling::function]
pub fn read_region<R: Read + Seek, T>(
    reader: &mut R,
    region: &Region<T>,
    codec: &Codec,
) -> Result<MemoryRegion, FormatError> {
    let format = region.validate()?;
    let mut stored = vec![0u8; region.compressed_size as usize];
    reader.seek(SeekFrom::Start(region.data.get()))?;
    reader.read_exact(&mut stored)?;
    let mut buffer = HostBuffer::new(region.uncompressed_size as usize);
    match format {
        CompressionFormat::None => buffer.as_bytes_mut().copy_from_slice(&stored),
        CompressionFormat::Tiled => codec.decompress(&stored, buffer.as_bytes_mut())?,
    }
    Ok(MemoryRegion::new(buffer))
}
