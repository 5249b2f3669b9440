//! Dispatch Context
//!
//! The dispatch context tracks which cells are currently broadcasting on
//! this thread. A listener that writes into another cell starts a nested
//! broadcast, so the stack depth is the length of the synchronous
//! propagation chain in progress.
//!
//! # Implementation
//!
//! We use a thread-local stack of handle IDs. Entering a dispatch pushes the
//! cell's handle ID and returns a guard; dropping the guard pops it.
//!
//! An acyclic chain pushes each handle once, however long it is. A handle
//! that is already on the stack more than the allowed number of times can
//! only get there through a cycle, so entering fails and the cycle becomes a
//! logged stall instead of a stack overflow. An optional overall depth limit
//! can be configured on top.

use std::cell::RefCell;

use super::HandleId;

thread_local! {
    static DISPATCH_STACK: RefCell<Vec<HandleId>> = const { RefCell::new(Vec::new()) };
}

/// Guard that pops the dispatch stack when dropped.
///
/// This keeps the stack balanced even if a listener panics.
pub struct DispatchContext {
    handle: HandleId,
}

impl DispatchContext {
    /// Enter a broadcast of the given handle's cell.
    ///
    /// Returns `None` if the handle has already re-entered its own broadcast
    /// `max_reentries` times, or if the stack already holds `max_depth`
    /// entries.
    pub fn enter(
        handle: HandleId,
        max_depth: Option<usize>,
        max_reentries: usize,
    ) -> Option<Self> {
        DISPATCH_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if max_depth.is_some_and(|max| stack.len() >= max) {
                return None;
            }
            if occurrences_in(&stack, handle) > max_reentries {
                return None;
            }
            stack.push(handle);
            Some(Self { handle })
        })
    }

    /// How many times the handle's cell is broadcasting on this thread.
    pub fn occurrences(handle: HandleId) -> usize {
        DISPATCH_STACK.with(|stack| occurrences_in(&stack.borrow(), handle))
    }

    #[cfg(test)]
    fn current() -> Option<HandleId> {
        DISPATCH_STACK.with(|stack| stack.borrow().last().copied())
    }

    /// Current nesting depth.
    pub fn depth() -> usize {
        DISPATCH_STACK.with(|stack| stack.borrow().len())
    }
}

fn occurrences_in(stack: &[HandleId], handle: HandleId) -> usize {
    stack.iter().filter(|entry| **entry == handle).count()
}

impl Drop for DispatchContext {
    fn drop(&mut self) {
        DISPATCH_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();

            if let Some(handle) = popped {
                debug_assert_eq!(
                    handle, self.handle,
                    "DispatchContext mismatch: expected {:?}, got {:?}",
                    self.handle, handle
                );
            }
        });
    }
}
