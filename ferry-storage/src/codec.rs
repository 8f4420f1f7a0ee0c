use rayon::prelude::*;

/// Uncompressed size of a single tile.
pub const TILE_SIZE: usize = 1 << 16;

const STREAM_HEADER_SIZE: usize = 16;

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("compressed stream is truncated")]
    Truncated,
    #[error("stream holds {declared} bytes but {expected} were declared")]
    SizeMismatch { declared: u64, expected: u64 },
    #[error("invalid tile layout: {count} tiles of {size} bytes")]
    InvalidTiles { count: u32, size: u32 },
    #[error("tile {index} is corrupt: {message}")]
    CorruptTile { index: usize, message: String },
}

fn read_u32(src: &[u8], offset: usize) -> Result<u32, CodecError> {
    src.get(offset..offset + 4)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or(CodecError::Truncated)
}

fn read_u64(src: &[u8], offset: usize) -> Result<u64, CodecError> {
    src.get(offset..offset + 8)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or(CodecError::Truncated)
}

/// Block codec splitting the payload into independently compressed tiles.
///
/// Stream layout, little endian:
///   - tile count: `u32`
///   - uncompressed tile size: `u32`
///   - total uncompressed size: `u64`
///   - compressed size of every tile: `[u32; tile count]`
///   - LZ4 blocks of every tile, back to back
///
/// Tiles are encoded and decoded in parallel on a dedicated thread pool.
pub struct Codec {
    pool: rayon::ThreadPool,
    tile_size: usize,
}

impl Codec {
    /// Create a codec with `thread_count` workers. Zero picks the number of cores.
    pub fn new(thread_count: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(thread_count)
            .thread_name(|index| format!("Codec-{}", index))
            .build()?;
        log::info!("Created codec with {} threads", pool.current_num_threads());
        Ok(Self {
            pool,
            tile_size: TILE_SIZE,
        })
    }

    /// Upper bound of the compressed stream size for `size` input bytes.
    pub fn compress_bound(&self, size: usize) -> usize {
        let tile_count = size.div_ceil(self.tile_size);
        STREAM_HEADER_SIZE
            + tile_count * 4
            + tile_count * lz4_flex::block::get_maximum_output_size(self.tile_size)
    }

    #[profiling::function]
    pub fn compress(&self, data: &[u8]) -> Vec<u8> {
        let tiles: Vec<Vec<u8>> = self.pool.install(|| {
            data.par_chunks(self.tile_size)
                .map(lz4_flex::block::compress)
                .collect()
        });
        let payload_size = tiles.iter().map(|tile| tile.len()).sum::<usize>();
        let mut stream = Vec::with_capacity(STREAM_HEADER_SIZE + tiles.len() * 4 + payload_size);
        stream.extend_from_slice(&(tiles.len() as u32).to_le_bytes());
        stream.extend_from_slice(&(self.tile_size as u32).to_le_bytes());
        stream.extend_from_slice(&(data.len() as u64).to_le_bytes());
        for tile in tiles.iter() {
            stream.extend_from_slice(&(tile.len() as u32).to_le_bytes());
        }
        for tile in tiles.iter() {
            stream.extend_from_slice(tile);
        }
        stream
    }

    /// Decompress a stream into `dst`, which has to match the declared size exactly.
    #[profiling::function]
    pub fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<(), CodecError> {
        let tile_count = read_u32(src, 0)?;
        let tile_size = read_u32(src, 4)?;
        let declared = read_u64(src, 8)?;
        if declared != dst.len() as u64 {
            return Err(CodecError::SizeMismatch {
                declared,
                expected: dst.len() as u64,
            });
        }
        if tile_size == 0 || dst.len().div_ceil(tile_size as usize) != tile_count as usize {
            return Err(CodecError::InvalidTiles {
                count: tile_count,
                size: tile_size,
            });
        }

        let mut tiles = Vec::with_capacity(tile_count as usize);
        let mut offset = STREAM_HEADER_SIZE + tile_count as usize * 4;
        for index in 0..tile_count as usize {
            let size = read_u32(src, STREAM_HEADER_SIZE + index * 4)? as usize;
            let tile = src.get(offset..offset + size).ok_or(CodecError::Truncated)?;
            tiles.push(tile);
            offset += size;
        }

        self.pool.install(|| {
            dst.par_chunks_mut(tile_size as usize)
                .zip(tiles.par_iter())
                .enumerate()
                .try_for_each(|(index, (out, &tile))| {
                    let count = lz4_flex::block::decompress_into(tile, out).map_err(|e| {
                        CodecError::CorruptTile {
                            index,
                            message: e.to_string(),
                        }
                    })?;
                    if count != out.len() {
                        return Err(CodecError::CorruptTile {
                            index,
                            message: format!("{} bytes decoded, {} expected", count, out.len()),
                        });
                    }
                    Ok(())
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Codec, CodecError, TILE_SIZE};

    fn pattern(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i % 251) as u8 ^ (i / 4096) as u8).collect()
    }

    fn roundtrip(codec: &Codec, data: &[u8]) {
        let compressed = codec.compress(data);
        assert!(compressed.len() <= codec.compress_bound(data.len()));
        let mut out = vec![0xAAu8; data.len()];
        codec.decompress(&compressed, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn roundtrip_sizes() {
        let codec = Codec::new(2).unwrap();
        roundtrip(&codec, &[]);
        roundtrip(&codec, b"hello, hello, hello");
        roundtrip(&codec, &pattern(TILE_SIZE - 1));
        roundtrip(&codec, &pattern(TILE_SIZE));
        roundtrip(&codec, &pattern(3 * TILE_SIZE + 17));
    }

    #[test]
    fn declared_size_mismatch() {
        let codec = Codec::new(1).unwrap();
        let compressed = codec.compress(&pattern(1000));
        let mut out = vec![0u8; 999];
        assert_eq!(
            codec.decompress(&compressed, &mut out),
            Err(CodecError::SizeMismatch {
                declared: 1000,
                expected: 999
            })
        );
    }

    #[test]
    fn truncated_stream() {
        let codec = Codec::new(1).unwrap();
        let compressed = codec.compress(&pattern(2 * TILE_SIZE));
        let mut out = vec![0u8; 2 * TILE_SIZE];
        let result = codec.decompress(&compressed[..compressed.len() - 1], &mut out);
        assert_eq!(result, Err(CodecError::Truncated));
    }
}
