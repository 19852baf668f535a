/// Counting semaphore for threads waiting on a free context entry.
pub(crate) mod sema;

/// Binary event for sweep completion.
pub(crate) mod event;
