use std::sync::{Arc, Mutex};

/// Result of a group of requests, as reported by a status entry.
#[derive(Clone, Debug, PartialEq)]
pub enum Status {
    Pending,
    Complete,
    Failed(crate::RequestError),
}

/// Table of completion results, filled in by the queues.
#[derive(Clone)]
pub struct StatusArray {
    slots: Arc<Mutex<Vec<Status>>>,
}

impl StatusArray {
    pub fn new(count: usize) -> Self {
        Self {
            slots: Arc::new(Mutex::new(vec![Status::Pending; count])),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Status {
        self.slots.lock().unwrap()[index].clone()
    }

    pub fn is_complete(&self, index: usize) -> bool {
        self.get(index) == Status::Complete
    }

    /// Return the failure of a slot, if any.
    pub fn check(&self, index: usize) -> Result<(), crate::RequestError> {
        match self.get(index) {
            Status::Failed(e) => Err(e),
            Status::Pending | Status::Complete => Ok(()),
        }
    }

    pub(crate) fn set(&self, index: usize, status: Status) {
        match self.slots.lock().unwrap().get_mut(index) {
            Some(slot) => *slot = status,
            None => log::error!("Status slot {} is out of range", index),
        }
    }
}
