use std::{
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

type Continuation = Box<dyn FnOnce() + Send>;

struct State {
    signaled: bool,
    continuation: Option<Continuation>,
}

struct Inner {
    name: String,
    state: Mutex<State>,
    condvar: Condvar,
}

/// Single-shot wait object signaled by a queue.
///
/// An armed continuation runs exactly once on a worker thread of the
/// queue's `choir`, after every entry enqueued ahead of the signal
/// has been processed. Disarming before the signal drops it unrun.
#[derive(Clone)]
pub struct Event {
    inner: Arc<Inner>,
}

impl Event {
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                state: Mutex::new(State {
                    signaled: false,
                    continuation: None,
                }),
                condvar: Condvar::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Reset the event and register the continuation to run on signal.
    pub fn arm(&self, continuation: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.state.lock().unwrap();
        if state.continuation.is_some() {
            log::warn!("Event '{}' is re-armed before firing", self.inner.name);
        }
        state.signaled = false;
        state.continuation = Some(Box::new(continuation));
    }

    /// Drop the pending continuation. Returns `true` if there was one.
    pub fn disarm(&self) -> bool {
        self.inner.state.lock().unwrap().continuation.take().is_some()
    }

    pub fn is_set(&self) -> bool {
        self.inner.state.lock().unwrap().signaled
    }

    /// Block until the event is signaled, or the timeout passes.
    pub fn wait(&self, timeout: Duration) -> bool {
        let state = self.inner.state.lock().unwrap();
        let (state, _) = self
            .inner
            .condvar
            .wait_timeout_while(state, timeout, |state| !state.signaled)
            .unwrap();
        state.signaled
    }

    pub(crate) fn signal(&self, choir: &Arc<choir::Choir>) {
        let continuation = {
            let mut state = self.inner.state.lock().unwrap();
            state.signaled = true;
            state.continuation.take()
        };
        self.inner.condvar.notify_all();
        if let Some(continuation) = continuation {
            log::trace!("Firing '{}'", self.inner.name);
            choir
                .spawn(format!("{} continuation", self.inner.name))
                .init(move |_| continuation())
                .run();
        }
    }
}
