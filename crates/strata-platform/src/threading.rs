//! Threading Primitives
//!
//! Named OS threads used by the streaming worker pools.

use std::thread::{self, JoinHandle};

use crate::{PlatformError, PlatformResult};

/// Named thread handle
pub struct Thread {
    handle: Option<JoinHandle<()>>,
    name: String,
}

impl Thread {
    /// Spawn a new thread with the given name and function
    pub fn spawn<F>(name: impl Into<String>, f: F) -> PlatformResult<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(f)
            .map_err(|e| PlatformError::ThreadSpawn(format!("{}: {}", name, e)))?;

        log::trace!("Spawned thread '{}'", name);

        Ok(Self {
            handle: Some(handle),
            name,
        })
    }

    /// Get the thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Join the thread, waiting for it to complete
    pub fn join(mut self) -> PlatformResult<()> {
        self.join_inner()
    }

    /// Check if the thread has finished
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    fn join_inner(&mut self) -> PlatformResult<()> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| PlatformError::ThreadPanicked(self.name.clone())),
            None => Ok(()),
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if let Err(e) = self.join_inner() {
            log::error!("{}", e);
        }
    }
}

/// Join every thread in `threads`, logging any that panicked
pub fn join_all(threads: &mut Vec<Thread>) {
    for thread in threads.drain(..) {
        if let Err(e) = thread.join() {
            log::error!("{}", e);
        }
    }
}
