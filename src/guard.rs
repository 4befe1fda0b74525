//! An explicit stack of resource guards.
//!
//! Build resources (isolation scope, then loopback mount) are pushed as they are acquired, and
//! released strictly in reverse order, whichever step failed.

use log::{debug, warn};

use crate::error::Result;

type Release = Box<dyn FnOnce() -> Result<()> + Send>;

#[derive(Default)]
pub struct GuardStack {
    guards: Vec<(&'static str, Release)>,
}

impl GuardStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the release action of a freshly-acquired resource.
    pub fn push(&mut self, name: &'static str, release: impl FnOnce() -> Result<()> + Send + 'static) {
        debug!("acquired {name}");
        self.guards.push((name, Box::new(release)));
    }

    /// Releases everything, innermost first.  Every guard is released even if an earlier one
    /// fails; the first failure is returned.
    pub fn unwind(mut self) -> Result<()> {
        self.release_all()
    }

    fn release_all(&mut self) -> Result<()> {
        let mut first_error = None;
        while let Some((name, release)) = self.guards.pop() {
            debug!("releasing {name}");
            if let Err(e) = release() {
                warn!("failed to release {name}: {e}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for GuardStack {
    fn drop(&mut self) {
        let _ = self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use similar_asserts::assert_eq;

    use super::*;
    use crate::error::PackageError;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Release) {
        let log = Arc::new(Mutex::new(vec![]));
        let make = {
            let log = Arc::clone(&log);
            move |name: &'static str| -> Release {
                let log = Arc::clone(&log);
                Box::new(move || {
                    log.lock().unwrap().push(name);
                    Ok(())
                })
            }
        };
        (log, make)
    }

    #[test]
    fn test_reverse_order() {
        let (log, make) = recorder();
        let mut stack = GuardStack::new();
        stack.push("scope", make("scope"));
        stack.push("loopback", make("loopback"));
        stack.unwind().unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["loopback", "scope"]);
    }

    #[test]
    fn test_drop_releases() {
        let (log, make) = recorder();
        {
            let mut stack = GuardStack::new();
            stack.push("scope", make("scope"));
            stack.push("loopback", make("loopback"));
        }
        assert_eq!(*log.lock().unwrap(), vec!["loopback", "scope"]);
    }

    #[test]
    fn test_failure_does_not_stop_unwind() {
        let (log, make) = recorder();
        let mut stack = GuardStack::new();
        stack.push("scope", make("scope"));
        stack.push("loopback", || Err(PackageError::validation("umount failed")));
        let err = stack.unwind().unwrap_err();
        assert_eq!(err.to_string(), "invalid package request: umount failed");
        assert_eq!(*log.lock().unwrap(), vec!["scope"]);
    }
}
