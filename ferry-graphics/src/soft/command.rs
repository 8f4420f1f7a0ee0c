use crate::{BufferPiece, DescriptorHandle, DeviceError};
use std::mem;

/// A recorded command.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    CopyBufferToBuffer {
        src: BufferPiece,
        dst: BufferPiece,
        size: u64,
    },
    CopyBufferToTexture {
        src: BufferPiece,
        dst: super::Resource,
        subresource: u32,
    },
    SetIndexBuffer {
        piece: BufferPiece,
        size: u64,
    },
    SetVertexBuffer {
        slot: u32,
        piece: BufferPiece,
        size: u64,
        stride: u32,
    },
    SetConstantBuffer {
        slot: u32,
        piece: BufferPiece,
    },
    SetDescriptorTable {
        slot: u32,
        table: DescriptorHandle,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
    },
}

pub struct CommandEncoder {
    name: String,
    commands: Vec<Command>,
}

impl CommandEncoder {
    pub(super) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            commands: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&mut self) {
        self.commands.clear();
    }

    /// Commands recorded since the last `start` or submission.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub(super) fn take_commands(&mut self) -> Vec<Command> {
        mem::take(&mut self.commands)
    }

    pub fn transfer(&mut self) -> TransferCommandEncoder<'_> {
        TransferCommandEncoder {
            commands: &mut self.commands,
        }
    }

    pub fn render(&mut self) -> RenderCommandEncoder<'_> {
        RenderCommandEncoder {
            commands: &mut self.commands,
        }
    }
}

pub struct TransferCommandEncoder<'a> {
    commands: &'a mut Vec<Command>,
}

impl TransferCommandEncoder<'_> {
    pub fn copy_buffer_to_buffer(&mut self, src: BufferPiece, dst: BufferPiece, size: u64) {
        self.commands
            .push(Command::CopyBufferToBuffer { src, dst, size });
    }

    /// Copy one subresource worth of linearly laid out data into a texture.
    pub fn copy_buffer_to_texture(&mut self, src: BufferPiece, dst: super::Resource, subresource: u32) {
        self.commands.push(Command::CopyBufferToTexture {
            src,
            dst,
            subresource,
        });
    }
}

pub struct RenderCommandEncoder<'a> {
    commands: &'a mut Vec<Command>,
}

impl RenderCommandEncoder<'_> {
    pub fn set_index_buffer(&mut self, piece: BufferPiece, size: u64) {
        self.commands.push(Command::SetIndexBuffer { piece, size });
    }

    pub fn set_vertex_buffer(&mut self, slot: u32, piece: BufferPiece, size: u64, stride: u32) {
        self.commands.push(Command::SetVertexBuffer {
            slot,
            piece,
            size,
            stride,
        });
    }

    pub fn set_constant_buffer(&mut self, slot: u32, piece: BufferPiece) {
        self.commands
            .push(Command::SetConstantBuffer { slot, piece });
    }

    pub fn set_descriptor_table(&mut self, slot: u32, table: DescriptorHandle) {
        self.commands
            .push(Command::SetDescriptorTable { slot, table });
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
    ) {
        self.commands.push(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            base_vertex,
        });
    }
}

impl super::Context {
    pub(super) fn execute(&self, command: &Command) -> Result<(), DeviceError> {
        match *command {
            Command::CopyBufferToBuffer { src, dst, size } => {
                let bytes = self.read_buffer(src.resource, src.offset, size)?;
                self.write_buffer(dst.resource, dst.offset, &bytes)
            }
            Command::CopyBufferToTexture {
                src,
                dst,
                subresource,
            } => {
                let desc = self
                    .resource_desc(dst)
                    .ok_or(DeviceError::InvalidHandle("texture"))?;
                let (footprints, _) = crate::copyable_footprints(&desc);
                let footprint = footprints
                    .get(subresource as usize)
                    .ok_or(DeviceError::InvalidDesc("subresource index"))?;
                let bytes = self.read_buffer(src.resource, src.offset, footprint.size())?;
                self.write_buffer(dst, footprint.offset, &bytes)
            }
            // state setting and draws have no side effects on memory
            _ => Ok(()),
        }
    }
}
