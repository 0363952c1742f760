use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Error;

use crate::RepositoryError;

struct Inner {
    flag: AtomicBool,
    parent: Option<CancelToken>,
}

/// Cooperative cancellation flag carried by the application context.
///
/// Tokens are parented: cancelling a parent cancels all children. The flag
/// is polled at record boundaries and between queue operations; tight CPU
/// loops are not interrupted.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                flag: AtomicBool::new(false),
                parent: None,
            }),
        }
    }

    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                flag: AtomicBool::new(false),
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.inner.flag.load(Ordering::SeqCst) {
            return true;
        }
        match &self.inner.parent {
            Some(parent) => parent.is_cancelled(),
            None => false,
        }
    }

    /// Poll-style check used between pipeline operations.
    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            return Err(RepositoryError::Cancelled.into());
        }
        Ok(())
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parent_cancels_children() {
        let parent = CancelToken::new();
        let child = parent.child();
        assert!(child.check().is_ok());

        parent.cancel();
        assert!(child.is_cancelled());
        assert!(child.check().is_err());

        // cancelling a child leaves the parent alone
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
    }
}
