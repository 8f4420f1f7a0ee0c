#![warn(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications,
    // We don't match on a reference, unless required.
    clippy::pattern_type_mismatch,
)]

//! Offline converter of glTF models into streaming containers.

pub mod import;
pub mod texture;

use anyhow::{Context as _, Result};
use ferry_format::{ContainerWriter, WriteSummary};
use ferry_storage::{Codec, CompressionFormat};
use std::{
    fs,
    io::{BufWriter, Write as _},
    path::{Path, PathBuf},
};

/// How the container payload gets compressed.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, clap::ValueEnum)]
pub enum PackType {
    /// Every region goes through the tiled block codec.
    #[default]
    Gdeflate,
    /// Everything is stored raw.
    Uncompress,
    /// Textures are BC3 encoded, then every region goes through the block codec.
    Texcompress,
}

impl PackType {
    pub fn compression(self) -> CompressionFormat {
        match self {
            Self::Gdeflate | Self::Texcompress => CompressionFormat::Tiled,
            Self::Uncompress => CompressionFormat::None,
        }
    }

    pub fn block_compress_textures(self) -> bool {
        self == Self::Texcompress
    }
}

/// The output path, with the `pak` extension if none is given.
pub fn output_path(output: &Path) -> PathBuf {
    match output.extension() {
        Some(_) => output.to_path_buf(),
        None => output.with_extension("pak"),
    }
}

/// Convert a glTF file into a container at `output`.
pub fn pack(input: &Path, output: &Path, pack_type: PackType) -> Result<WriteSummary> {
    if !input.exists() {
        anyhow::bail!("Input {:?} is not found", input);
    }
    let model = import::import(input, pack_type.block_compress_textures())?;

    let codec = Codec::new(0).context("Creating the codec")?;
    let file = fs::File::create(output).with_context(|| format!("Creating {:?}", output))?;
    let mut writer = BufWriter::new(file);
    let summary = ContainerWriter::new(&codec, pack_type.compression())
        .write(&model, &mut writer)
        .with_context(|| format!("Writing {:?}", output))?;
    writer.flush()?;
    log::info!(
        "Wrote {:?}: {} regions ({} compressed), {} bytes from {}",
        output,
        summary.region_count,
        summary.compressed_region_count,
        summary.total_size,
        summary.uncompressed_size
    );
    Ok(summary)
}
