//! Named background threads for the pools and the reactor.

use std::thread::{Builder, JoinHandle};

use crate::error::{PalError, Result};

/// Spawns a thread called `name`. A spawn failure carries the name.
pub(crate) fn spawn_named<F>(name: String, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|source| PalError::ThreadSpawn { name, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawned_thread_carries_its_name() {
        let handle = spawn_named("yot-pal-test-thread".to_string(), || {
            assert_eq!(std::thread::current().name(), Some("yot-pal-test-thread"));
        })
        .unwrap();
        assert_eq!(handle.thread().name(), Some("yot-pal-test-thread"));
        handle.join().unwrap();
    }
}
