use std::{fs, path::Path};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read the config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse the config: {0}")]
    Parse(#[from] ron::error::SpannedError),
}

fn default_queue_capacity() -> usize {
    0x2000
}
fn default_resource_descriptors() -> u32 {
    ferry_graphics::limits::RESOURCE_DESCRIPTORS
}
fn default_sampler_descriptors() -> u32 {
    ferry_graphics::limits::SAMPLER_DESCRIPTORS
}

#[derive(Debug, serde::Deserialize)]
pub struct Storage {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Zero picks the number of cores.
    #[serde(default)]
    pub codec_threads: usize,
}
impl Default for Storage {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            codec_threads: 0,
        }
    }
}

#[derive(Debug, serde::Deserialize)]
pub struct Device {
    #[serde(default)]
    pub validation: bool,
    #[serde(default = "default_resource_descriptors")]
    pub resource_descriptors: u32,
    #[serde(default = "default_sampler_descriptors")]
    pub sampler_descriptors: u32,
    #[serde(default)]
    pub memory_budget: Option<u64>,
}
impl Default for Device {
    fn default() -> Self {
        Self {
            validation: false,
            resource_descriptors: default_resource_descriptors(),
            sampler_descriptors: default_sampler_descriptors(),
            memory_budget: None,
        }
    }
}

#[derive(Debug, Default, serde::Deserialize)]
pub struct Engine {
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub device: Device,
    /// Zero derives the count from the number of cores.
    #[serde(default)]
    pub worker_count: usize,
    /// Create model heaps synchronously ahead of their loads.
    #[serde(default)]
    pub prefetch_allocations: bool,
    #[serde(default)]
    pub models: Vec<String>,
}

impl Engine {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Ok(ron::de::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }
}
