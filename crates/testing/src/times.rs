use crate::error::Error;

use std::fmt::{self, Debug};

/// A call gate that runs a callback on exactly the k-th call.
///
/// Calls beyond k fail with [`Error::Overinvocation`].
pub struct Times<F>
where
    F: FnOnce(),
{
    count: usize,
    expected: usize,
    on_complete: Option<F>,
}

/// Arms a gate that runs `on_complete` on the `expected`-th call.
///
/// A gate armed with `0` fails on its first call.
pub fn times<F>(expected: usize, on_complete: F) -> Times<F>
where
    F: FnOnce(),
{
    Times {
        count: 0,
        expected,
        on_complete: Some(on_complete),
    }
}

impl<F> Times<F>
where
    F: FnOnce(),
{
    /// Records one call, running the callback if this is the k-th one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Overinvocation`] once the gate has been called more
    /// than k times.
    pub fn call(&mut self) -> Result<(), Error> {
        self.count += 1;

        if self.count > self.expected {
            return Err(Error::Overinvocation {
                actual: self.count,
                expected: self.expected,
            });
        }

        if self.count == self.expected
            && let Some(on_complete) = self.on_complete.take()
        {
            on_complete();
        }

        Ok(())
    }

    /// Number of calls made so far.
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Whether the callback has run.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.count >= self.expected && self.expected > 0
    }
}

impl<F> Debug for Times<F>
where
    F: FnOnce(),
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Times")
            .field("count", &self.count)
            .field("expected", &self.expected)
            .finish_non_exhaustive()
    }
}
