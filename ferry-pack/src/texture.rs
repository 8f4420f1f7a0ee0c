use anyhow::{bail, Context as _, Result};
use ferry_format::TextureData;
use ferry_graphics as gpu;

/// An uncompressed RGBA8 image.
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Image {
    /// Expand a decoded glTF image into RGBA8.
    pub fn from_gltf(data: &gltf::image::Data) -> Result<Self> {
        use gltf::image::Format as Gf;
        let texel_count = data.width as usize * data.height as usize;
        let (channels, bytes_per_channel) = match data.format {
            Gf::R8 => (1, 1),
            Gf::R8G8 => (2, 1),
            Gf::R8G8B8 => (3, 1),
            Gf::R8G8B8A8 => (4, 1),
            Gf::R16 => (1, 2),
            Gf::R16G16 => (2, 2),
            Gf::R16G16B16 => (3, 2),
            Gf::R16G16B16A16 => (4, 2),
            other => bail!("Unsupported image format {:?}", other),
        };
        let texel_size = channels * bytes_per_channel;
        if data.pixels.len() < texel_count * texel_size {
            bail!("Image holds {} bytes for {} texels", data.pixels.len(), texel_count);
        }
        let mut pixels = Vec::with_capacity(texel_count * 4);
        for texel in data.pixels.chunks_exact(texel_size).take(texel_count) {
            // 16-bit channels are little endian, keep the high byte
            let channel = |index: usize| texel[index * bytes_per_channel + bytes_per_channel - 1];
            let rgba = match channels {
                1 => [channel(0), channel(0), channel(0), !0],
                2 => [channel(0), channel(1), 0, !0],
                3 => [channel(0), channel(1), channel(2), !0],
                _ => [channel(0), channel(1), channel(2), channel(3)],
            };
            pixels.extend_from_slice(&rgba);
        }
        Ok(Self {
            width: data.width,
            height: data.height,
            pixels,
        })
    }

    /// Downsample by averaging 2x2 texel boxes, clamping at odd edges.
    pub fn next_mip(&self) -> Self {
        let width = (self.width / 2).max(1);
        let height = (self.height / 2).max(1);
        let texel = |x: u32, y: u32| {
            let x = x.min(self.width - 1) as usize;
            let y = y.min(self.height - 1) as usize;
            let offset = (y * self.width as usize + x) * 4;
            &self.pixels[offset..offset + 4]
        };
        let mut pixels = Vec::with_capacity(width as usize * height as usize * 4);
        for y in 0..height {
            for x in 0..width {
                let samples = [
                    texel(2 * x, 2 * y),
                    texel(2 * x + 1, 2 * y),
                    texel(2 * x, 2 * y + 1),
                    texel(2 * x + 1, 2 * y + 1),
                ];
                for channel in 0..4 {
                    let sum: u32 = samples.iter().map(|sample| sample[channel] as u32).sum();
                    pixels.push(((sum + 2) / 4) as u8);
                }
            }
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    /// The image followed by every smaller level, down to 1x1.
    pub fn mip_chain(self) -> Vec<Self> {
        let level_count = self.width.max(self.height).ilog2() + 1;
        let mut chain = vec![self];
        for _ in 1..level_count {
            let next = chain[chain.len() - 1].next_mip();
            chain.push(next);
        }
        chain
    }

    fn compress_bc3(&self) -> Vec<u8> {
        let format = texpresso::Format::Bc3;
        let (width, height) = (self.width as usize, self.height as usize);
        let mut buf = vec![0u8; format.compressed_size(width, height)];
        let params = texpresso::Params::default();
        format.compress(&self.pixels, width, height, params, &mut buf);
        buf
    }
}

/// Build a texture with a full mip chain, optionally block compressed.
#[profiling::function]
pub fn build(name: &str, image: Image, block_compress: bool) -> Result<TextureData> {
    let (width, height) = (image.width, image.height);
    if width == 0 || height == 0 {
        bail!("Texture '{}' is empty", name);
    }
    let chain = image.mip_chain();
    let (format, mips) = if block_compress {
        let mips = chain.iter().map(Image::compress_bc3).collect::<Vec<_>>();
        (gpu::TextureFormat::Bc3Unorm, mips)
    } else {
        let mips = chain.into_iter().map(|mip| mip.pixels).collect::<Vec<_>>();
        (gpu::TextureFormat::Rgba8Unorm, mips)
    };
    let desc = gpu::ResourceDesc::texture_2d(format, width, height, mips.len() as u16);
    let texture = TextureData::from_mips(name, desc, &mips)
        .with_context(|| format!("Laying out texture '{}'", name))?;
    log::debug!(
        "Texture '{}' {}x{} with {} mips as {:?}",
        name,
        width,
        height,
        mips.len(),
        format
    );
    Ok(texture)
}
