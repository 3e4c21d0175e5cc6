//! Entry names and the scoped uniqueness registry.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use ahash::RandomState;

/// Stable name of an entry.
///
/// Keys are cheap to clone and compare by string identity. Two keys with the
/// same text address the same entry in a store.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(Rc<str>);

impl Key {
    /// Create a key from a name.
    pub fn new(name: impl AsRef<str>) -> Self {
        Key(Rc::from(name.as_ref()))
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Key::new(name)
    }
}

impl From<String> for Key {
    fn from(name: String) -> Self {
        Key::new(name)
    }
}

impl From<&Key> for Key {
    fn from(key: &Key) -> Self {
        key.clone()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

/// Scoped registry that guards against accidental duplicate entry names.
///
/// Whichever component constructs entry definitions owns a `KeySpace` and
/// mints keys through it. Minting the same name twice is a protocol error.
/// Separate spaces are independent, so uniqueness stays testable instead of
/// living in global mutable state.
///
/// # Example
///
/// ```
/// use value_flow::{Input, KeySpace};
///
/// let keys = KeySpace::new();
/// let counter = Input::new(keys.key("counter")).with_default(0);
/// ```
#[derive(Default)]
pub struct KeySpace {
    used: RefCell<HashSet<Key, RandomState>>,
}

impl KeySpace {
    /// Create an empty key space.
    pub fn new() -> Self {
        Self {
            used: RefCell::new(HashSet::with_hasher(RandomState::new())),
        }
    }

    /// Mint a key, panicking if the name was already used in this space.
    pub fn key(&self, name: impl AsRef<str>) -> Key {
        let key = Key::new(name);
        if !self.used.borrow_mut().insert(key.clone()) {
            panic!("entry name `{}` is already used in this key space", key);
        }
        key
    }

    /// Returns `true` if the name was already minted in this space.
    pub fn contains(&self, name: impl AsRef<str>) -> bool {
        self.used.borrow().contains(&Key::new(name))
    }
}
