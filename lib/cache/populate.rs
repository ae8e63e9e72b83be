//! Deduplicated population of freshly indexed entries.
//!
//! When a lookup misses, the new entry is indexed immediately with a [`PopulateFut`] attached.
//! Every concurrent lookup for the same identity finds the entry, clones the [`Shared`] future,
//! and awaits the single backend call instead of issuing its own. Whichever waiter resumes first
//! stores the attributes on the entry; the rest find them already there.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;

use futures::FutureExt as _;
use futures::future::Shared;

use crate::error::CacheError;

/// An in-flight attribute fetch shared between all waiters for one identity.
///
/// Resolves to `Err(CacheError::BackendPanicked)` if the backend panicked, so a poisoned
/// populate never takes down the callers that joined it.
pub(crate) type PopulateFut<A> =
    Shared<Pin<Box<dyn Future<Output = Result<A, CacheError>> + Send>>>;

/// Wrap a backend fetch in `catch_unwind` and make it shareable.
///
/// The fetch does not start until the first waiter polls it, so this can be called with a lane
/// lock held without calling into the backend.
pub(crate) fn make_shared<A, Fut>(fetch: Fut) -> PopulateFut<A>
where
    A: Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<A, std::io::Error>> + Send + 'static,
{
    let fut = AssertUnwindSafe(fetch).catch_unwind();
    let boxed: Pin<Box<dyn Future<Output = Result<A, CacheError>> + Send>> =
        Box::pin(async move {
            match fut.await {
                Ok(Ok(attrs)) => Ok(attrs),
                Ok(Err(err)) => Err(CacheError::from(err)),
                Err(_) => Err(CacheError::BackendPanicked),
            }
        });
    boxed.shared()
}

/// Where an entry's attributes stand.
pub(crate) enum AttrSlot<A: Clone + Send + Sync + 'static> {
    /// The backend fetch is still running.
    Populating(PopulateFut<A>),
    /// Attributes are known.
    Ready(A),
}

impl<A: Clone + Send + Sync + 'static> AttrSlot<A> {
    pub(crate) fn ready(&self) -> Option<&A> {
        match self {
            Self::Ready(attrs) => Some(attrs),
            Self::Populating(_) => None,
        }
    }
}

impl<A: Clone + Send + Sync + 'static> std::fmt::Debug for AttrSlot<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Populating(_) => f.write_str("Populating"),
            Self::Ready(_) => f.write_str("Ready"),
        }
    }
}
