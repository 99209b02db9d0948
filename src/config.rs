use std::env;

use log::warn;

pub const CHECK_HEAP_VAR: &str = "RMALLOC_CHECK_HEAP";
pub const VALIDATE_VAR: &str = "RMALLOC_VALIDATE";

/// Debug switches of a [`Heap`](crate::Heap).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapConfig {
  /// Run the heap checker after every mutating operation and panic on
  /// the first broken invariant.
  pub check_heap: bool,
  /// Verify pointers handed to `free` and `resize` refer to live blocks.
  pub validate_pointers: bool,
}

impl HeapConfig {
  /// Both checks follow the build profile.
  pub const fn new() -> Self {
    Self {
      check_heap: cfg!(debug_assertions),
      validate_pointers: cfg!(debug_assertions),
    }
  }

  /// No checks at all.
  pub const fn unchecked() -> Self {
    Self {
      check_heap: false,
      validate_pointers: false,
    }
  }

  /// Every check enabled, regardless of profile.
  pub const fn paranoid() -> Self {
    Self {
      check_heap: true,
      validate_pointers: true,
    }
  }

  /// Starts from [`HeapConfig::new`] and applies `RMALLOC_CHECK_HEAP` and
  /// `RMALLOC_VALIDATE` when set.
  pub fn from_env() -> Self {
    let mut config = Self::new();

    if let Some(value) = flag_from_env(CHECK_HEAP_VAR) {
      config.check_heap = value;
    }
    if let Some(value) = flag_from_env(VALIDATE_VAR) {
      config.validate_pointers = value;
    }

    config
  }
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self::new()
  }
}

fn flag_from_env(name: &str) -> Option<bool> {
  let raw = env::var(name).ok()?;
  let parsed = parse_flag(&raw);
  if parsed.is_none() {
    warn!("ignoring {}={:?}: expected a boolean", name, raw);
  }
  parsed
}

fn parse_flag(raw: &str) -> Option<bool> {
  match raw.trim().to_ascii_lowercase().as_str() {
    "1" | "true" | "on" | "yes" => Some(true),
    "0" | "false" | "off" | "no" => Some(false),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_flag() {
    assert_eq!(parse_flag("1"), Some(true));
    assert_eq!(parse_flag(" TRUE "), Some(true));
    assert_eq!(parse_flag("off"), Some(false));
    assert_eq!(parse_flag("No"), Some(false));
    assert_eq!(parse_flag("maybe"), None);
    assert_eq!(parse_flag(""), None);
  }

  #[test]
  fn test_defaults_follow_profile() {
    let config = HeapConfig::default();
    assert_eq!(config.check_heap, cfg!(debug_assertions));
    assert_eq!(config.validate_pointers, cfg!(debug_assertions));
    assert!(!HeapConfig::unchecked().check_heap);
    assert!(HeapConfig::paranoid().validate_pointers);
  }
}
