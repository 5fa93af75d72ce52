use std::cell::Cell;
use std::rc::Rc;

/// Blocks late callbacks once their logical owner is gone.
///
/// A `Guard` owns a shared flag. Tokens handed out with [`Guard::token`]
/// observe the flag and stay readable after the guard itself is dropped,
/// which is exactly the window a stale callback arrives in: the callback
/// checks its token and bails out instead of touching freed state.
pub struct Guard {
    blocked: Rc<Cell<bool>>,
}

impl Guard {
    pub fn new() -> Self {
        Self {
            blocked: Rc::new(Cell::new(false)),
        }
    }

    /// Hands out an observer for this guard's flag.
    pub fn token(&self) -> GuardToken {
        GuardToken {
            blocked: Rc::clone(&self.blocked),
        }
    }

    /// Blocks all tokens. Idempotent.
    pub fn block(&self) {
        self.blocked.set(true);
    }
}

impl Default for Guard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.block();
    }
}

/// Read side of a [`Guard`].
#[derive(Clone)]
pub struct GuardToken {
    blocked: Rc<Cell<bool>>,
}

impl GuardToken {
    /// A token that was blocked from the start; useful when the owner is
    /// already gone by the time a token is requested.
    pub fn blocked() -> Self {
        Self {
            blocked: Rc::new(Cell::new(true)),
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_outlives_guard() {
        let guard = Guard::new();
        let token = guard.token();

        assert!(!token.is_blocked());

        drop(guard);
        assert!(token.is_blocked(), "dropping the guard must block tokens");
    }

    #[test]
    fn explicit_block() {
        let guard = Guard::new();
        let token = guard.token();

        guard.block();
        assert!(token.is_blocked());
    }
}
