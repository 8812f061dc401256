//! Generation counter used to discard results of superseded async work.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Generation captured when an operation was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(u64);

impl Token {
  pub fn generation(self) -> u64 {
    self.0
  }
}

/// One counter per logical target owner (a poller, a playback controller).
///
/// Clones share the counter.
#[derive(Debug, Clone, Default)]
pub struct StaleGuard {
  generation: Arc<AtomicU64>,
}

impl StaleGuard {
  pub fn new() -> Self {
    Self::default()
  }

  /// Capture the current generation. Does not advance the counter.
  pub fn begin(&self) -> Token {
    Token(self.generation.load(Ordering::Acquire))
  }

  /// Whether work issued under `token` may still apply its result.
  pub fn is_current(&self, token: Token) -> bool {
    self.generation.load(Ordering::Acquire) == token.0
  }

  /// Invalidate every token handed out so far. Returns the new generation.
  pub fn supersede(&self) -> Token {
    Token(self.generation.fetch_add(1, Ordering::AcqRel) + 1)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_begin_does_not_advance() {
    let guard = StaleGuard::new();
    let a = guard.begin();
    let b = guard.begin();
    assert_eq!(a, b);
    assert!(guard.is_current(a));
  }

  #[test]
  fn test_supersede_invalidates_earlier_tokens() {
    let guard = StaleGuard::new();
    let old = guard.begin();
    let new = guard.supersede();
    assert!(!guard.is_current(old));
    assert!(guard.is_current(new));
    assert_eq!(new, guard.begin());
  }

  #[test]
  fn test_clones_share_the_counter() {
    let guard = StaleGuard::new();
    let token = guard.begin();
    guard.clone().supersede();
    assert!(!guard.is_current(token));
  }
}
