use super::{Descriptor, DescriptorHandle, DescriptorKind, DeviceError};
use std::sync::Mutex;

struct FreeRun {
    start: u32,
    count: u32,
}

struct Inner {
    slots: Box<[Descriptor]>,
    used: u32,
    free_list: Vec<FreeRun>,
}

/// Shader-visible descriptor heap shared by every user of the context.
///
/// Slots are handed out by bumping a cursor. Released runs are kept on a
/// free list and only reused by requests of exactly the same size.
pub(crate) struct DescriptorAllocator {
    kind: DescriptorKind,
    inner: Mutex<Inner>,
}

impl DescriptorAllocator {
    pub fn new(kind: DescriptorKind, capacity: u32) -> Self {
        Self {
            kind,
            inner: Mutex::new(Inner {
                slots: vec![Descriptor::Empty; capacity as usize].into_boxed_slice(),
                used: 0,
                free_list: Vec::new(),
            }),
        }
    }

    pub fn allocate(&self, count: u32) -> Result<DescriptorHandle, DeviceError> {
        if count == 0 {
            return Err(DeviceError::InvalidDesc("empty descriptor range"));
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(index) = inner.free_list.iter().rposition(|run| run.count == count) {
            let run = inner.free_list.swap_remove(index);
            return Ok(DescriptorHandle {
                kind: self.kind,
                start: run.start,
                count,
            });
        }

        let capacity = inner.slots.len() as u32;
        let available = capacity - inner.used;
        if count > available {
            log::error!(
                "{:?} descriptors exhausted: {} requested, {} available",
                self.kind,
                count,
                available
            );
            return Err(DeviceError::DescriptorHeapFull {
                kind: self.kind,
                requested: count,
                available,
            });
        }
        let start = inner.used;
        inner.used += count;
        Ok(DescriptorHandle {
            kind: self.kind,
            start,
            count,
        })
    }

    pub fn free(&self, handle: DescriptorHandle) {
        assert_eq!(handle.kind, self.kind);
        let mut inner = self.inner.lock().unwrap();
        let end = handle.start + handle.count;
        debug_assert!(
            end <= inner.used
                && !inner
                    .free_list
                    .iter()
                    .any(|run| run.start < end && handle.start < run.start + run.count),
            "{:?} descriptors {}..{} are freed twice",
            self.kind,
            handle.start,
            end
        );
        let range = handle.start as usize..end as usize;
        for slot in inner.slots[range].iter_mut() {
            *slot = Descriptor::Empty;
        }
        inner.free_list.push(FreeRun {
            start: handle.start,
            count: handle.count,
        });
    }

    pub fn write(
        &self,
        handle: DescriptorHandle,
        index: u32,
        descriptor: Descriptor,
    ) -> Result<(), DeviceError> {
        if handle.kind != self.kind || index >= handle.count {
            return Err(DeviceError::InvalidHandle("descriptor"));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.slots[(handle.start + index) as usize] = descriptor;
        Ok(())
    }

    pub fn read(&self, handle: DescriptorHandle, index: u32) -> Option<Descriptor> {
        if handle.kind != self.kind || index >= handle.count {
            return None;
        }
        let inner = self.inner.lock().unwrap();
        inner.slots.get((handle.start + index) as usize).copied()
    }

    pub fn available(&self) -> u32 {
        let inner = self.inner.lock().unwrap();
        inner.slots.len() as u32 - inner.used
            + inner.free_list.iter().map(|run| run.count).sum::<u32>()
    }
}
