//! Ambient execution context - an immutable property bag.
//!
//! Every run of an [`Effect`](super::Effect) carries a [`Context`]: an
//! opaque, immutable, string-keyed map of values. The interpreter threads
//! the context through the whole run and swaps it at context-switch
//! instructions ([`Effect::continue_on`](super::Effect::continue_on),
//! [`Effect::update_context`](super::Effect::update_context),
//! [`Effect::scoped_context`](super::Effect::scoped_context)). User code
//! observes the current context through
//! [`Effect::read_context`](super::Effect::read_context).
//!
//! Updates are persistent: [`Context::with`] and [`Context::without`]
//! return a new context and leave the original untouched, so a context held
//! by an earlier scope can always be restored verbatim. The entries live in
//! a hash array mapped trie (HAMT) with 32-way branching and `Arc`-shared
//! nodes, so an update copies only the O(log32 N) path from the root to the
//! touched slot and shares everything else with the original.
//!
//! # Examples
//!
//! ```rust
//! use eddy::effect::Context;
//!
//! let base = Context::new().with("region", "eu-west-1");
//! let widened = base.with("tenant", 42u32);
//!
//! assert_eq!(*widened.get::<&str>("region").unwrap(), "eu-west-1");
//! assert_eq!(*widened.get::<u32>("tenant").unwrap(), 42);
//! assert!(base.get::<u32>("tenant").is_none());
//! ```

use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A stored context value, type-erased and shareable.
type ContextValue = Arc<dyn Any + Send + Sync>;

// =============================================================================
// Trie internals
// =============================================================================

/// Branching factor (2^5 = 32).
const BRANCHING_BITS: usize = 5;

/// Bit mask for extracting a slot index from a hash.
const SLOT_MASK: u64 = (1 << BRANCHING_BITS) - 1;

/// Computes the hash of a key.
fn compute_hash(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Extracts the slot index at a given depth from a hash.
#[inline]
const fn hash_index(hash: u64, depth: usize) -> usize {
    ((hash >> (depth * BRANCHING_BITS)) & SLOT_MASK) as usize
}

/// Internal trie node. Shared between contexts via `Arc`; an update
/// re-allocates only the nodes along the touched path.
#[derive(Clone)]
enum Node {
    /// Empty trie (used as the root sentinel).
    Empty,
    /// A single entry.
    Entry {
        hash: u64,
        key: String,
        value: ContextValue,
    },
    /// Bitmap-indexed branch; `children` is compressed to occupied slots.
    Bitmap {
        bitmap: u32,
        children: Arc<[Child]>,
    },
    /// Entries whose full hashes collide.
    Collision {
        hash: u64,
        entries: Arc<[(String, ContextValue)]>,
    },
}

/// A slot of a bitmap node.
#[derive(Clone)]
enum Child {
    Entry { key: String, value: ContextValue },
    Node(Arc<Node>),
}

impl Node {
    fn get<'a>(&'a self, key: &str, hash: u64, depth: usize) -> Option<&'a ContextValue> {
        match self {
            Self::Empty => None,
            Self::Entry {
                hash: entry_hash,
                key: entry_key,
                value,
            } => (*entry_hash == hash && entry_key == key).then_some(value),
            Self::Bitmap { bitmap, children } => {
                let bit = 1u32 << hash_index(hash, depth);
                if bitmap & bit == 0 {
                    return None;
                }
                let position = (bitmap & (bit - 1)).count_ones() as usize;
                match &children[position] {
                    Child::Entry {
                        key: child_key,
                        value,
                    } => (child_key == key).then_some(value),
                    Child::Node(subnode) => subnode.get(key, hash, depth + 1),
                }
            }
            Self::Collision { entries, .. } => entries
                .iter()
                .find(|(entry_key, _)| entry_key == key)
                .map(|(_, value)| value),
        }
    }

    /// Returns the updated node and whether a new entry was added.
    fn insert(&self, key: String, value: ContextValue, hash: u64, depth: usize) -> (Self, bool) {
        match self {
            Self::Empty => (Self::Entry { hash, key, value }, true),
            Self::Entry {
                hash: existing_hash,
                key: existing_key,
                value: existing_value,
            } => {
                if *existing_hash == hash && *existing_key == key {
                    (Self::Entry { hash, key, value }, false)
                } else if *existing_hash == hash {
                    let entries: Arc<[(String, ContextValue)]> = Arc::from(vec![
                        (existing_key.clone(), Arc::clone(existing_value)),
                        (key, value),
                    ]);
                    (Self::Collision { hash, entries }, true)
                } else {
                    Self::branch_two_entries(
                        *existing_hash,
                        existing_key,
                        existing_value,
                        key,
                        value,
                        hash,
                        depth,
                    )
                }
            }
            Self::Bitmap { bitmap, children } => {
                Self::insert_into_bitmap(*bitmap, children, key, value, hash, depth)
            }
            Self::Collision {
                hash: collision_hash,
                entries,
            } => {
                if hash == *collision_hash {
                    let mut updated = entries.to_vec();
                    let existing = updated.iter_mut().find(|(entry_key, _)| *entry_key == key);
                    let added = match existing {
                        Some(entry) => {
                            entry.1 = value;
                            false
                        }
                        None => {
                            updated.push((key, value));
                            true
                        }
                    };
                    (
                        Self::Collision {
                            hash: *collision_hash,
                            entries: Arc::from(updated),
                        },
                        added,
                    )
                } else {
                    Self::branch_collision(self, *collision_hash, key, value, hash, depth)
                }
            }
        }
    }

    /// Splits two entries with distinct hashes into a bitmap node, recursing
    /// while they land in the same slot at this depth.
    fn branch_two_entries(
        existing_hash: u64,
        existing_key: &str,
        existing_value: &ContextValue,
        key: String,
        value: ContextValue,
        hash: u64,
        depth: usize,
    ) -> (Self, bool) {
        let existing_index = hash_index(existing_hash, depth);
        let new_index = hash_index(hash, depth);

        if existing_index == new_index {
            let entry = Self::Entry {
                hash: existing_hash,
                key: existing_key.to_string(),
                value: Arc::clone(existing_value),
            };
            let (subnode, added) = entry.insert(key, value, hash, depth + 1);
            let children: Arc<[Child]> = Arc::from(vec![Child::Node(Arc::new(subnode))]);
            (
                Self::Bitmap {
                    bitmap: 1u32 << existing_index,
                    children,
                },
                added,
            )
        } else {
            let existing_child = Child::Entry {
                key: existing_key.to_string(),
                value: Arc::clone(existing_value),
            };
            let new_child = Child::Entry { key, value };
            let children: Vec<Child> = if existing_index < new_index {
                vec![existing_child, new_child]
            } else {
                vec![new_child, existing_child]
            };
            (
                Self::Bitmap {
                    bitmap: (1u32 << existing_index) | (1u32 << new_index),
                    children: Arc::from(children),
                },
                true,
            )
        }
    }

    /// Pushes a collision node down under a bitmap when a different hash
    /// arrives.
    fn branch_collision(
        node: &Self,
        collision_hash: u64,
        key: String,
        value: ContextValue,
        hash: u64,
        depth: usize,
    ) -> (Self, bool) {
        let collision_index = hash_index(collision_hash, depth);
        let new_index = hash_index(hash, depth);

        if collision_index == new_index {
            let (subnode, added) = node.insert(key, value, hash, depth + 1);
            let children: Arc<[Child]> = Arc::from(vec![Child::Node(Arc::new(subnode))]);
            (
                Self::Bitmap {
                    bitmap: 1u32 << collision_index,
                    children,
                },
                added,
            )
        } else {
            let collision_child = Child::Node(Arc::new(node.clone()));
            let new_child = Child::Entry { key, value };
            let children: Vec<Child> = if collision_index < new_index {
                vec![collision_child, new_child]
            } else {
                vec![new_child, collision_child]
            };
            (
                Self::Bitmap {
                    bitmap: (1u32 << collision_index) | (1u32 << new_index),
                    children: Arc::from(children),
                },
                true,
            )
        }
    }

    fn insert_into_bitmap(
        bitmap: u32,
        children: &Arc<[Child]>,
        key: String,
        value: ContextValue,
        hash: u64,
        depth: usize,
    ) -> (Self, bool) {
        let bit = 1u32 << hash_index(hash, depth);
        let position = (bitmap & (bit - 1)).count_ones() as usize;

        if bitmap & bit == 0 {
            let mut updated = children.to_vec();
            updated.insert(position, Child::Entry { key, value });
            return (
                Self::Bitmap {
                    bitmap: bitmap | bit,
                    children: Arc::from(updated),
                },
                true,
            );
        }

        match &children[position] {
            Child::Entry {
                key: existing_key,
                value: existing_value,
            } => {
                if *existing_key == key {
                    let mut updated = children.to_vec();
                    updated[position] = Child::Entry { key, value };
                    (
                        Self::Bitmap {
                            bitmap,
                            children: Arc::from(updated),
                        },
                        false,
                    )
                } else {
                    let entry = Self::Entry {
                        hash: compute_hash(existing_key),
                        key: existing_key.clone(),
                        value: Arc::clone(existing_value),
                    };
                    let (subnode, added) = entry.insert(key, value, hash, depth + 1);
                    let mut updated = children.to_vec();
                    updated[position] = Child::Node(Arc::new(subnode));
                    (
                        Self::Bitmap {
                            bitmap,
                            children: Arc::from(updated),
                        },
                        added,
                    )
                }
            }
            Child::Node(subnode) => {
                let (new_subnode, added) = subnode.insert(key, value, hash, depth + 1);
                let mut updated = children.to_vec();
                updated[position] = Child::Node(Arc::new(new_subnode));
                (
                    Self::Bitmap {
                        bitmap,
                        children: Arc::from(updated),
                    },
                    added,
                )
            }
        }
    }

    /// Returns the updated node, or `None` when the key is absent and
    /// nothing changed.
    fn remove(&self, key: &str, hash: u64, depth: usize) -> Option<Self> {
        match self {
            Self::Empty => None,
            Self::Entry {
                hash: entry_hash,
                key: entry_key,
                ..
            } => (*entry_hash == hash && entry_key == key).then_some(Self::Empty),
            Self::Bitmap { bitmap, children } => {
                Self::remove_from_bitmap(*bitmap, children, key, hash, depth)
            }
            Self::Collision {
                hash: collision_hash,
                entries,
            } => {
                if hash != *collision_hash {
                    return None;
                }
                let remaining: Vec<(String, ContextValue)> = entries
                    .iter()
                    .filter(|(entry_key, _)| entry_key != key)
                    .cloned()
                    .collect();
                if remaining.len() == entries.len() {
                    return None;
                }
                match <[_; 1]>::try_from(remaining) {
                    Ok([(last_key, last_value)]) => Some(Self::Entry {
                        hash: *collision_hash,
                        key: last_key,
                        value: last_value,
                    }),
                    Err(remaining) => Some(Self::Collision {
                        hash: *collision_hash,
                        entries: Arc::from(remaining),
                    }),
                }
            }
        }
    }

    fn remove_from_bitmap(
        bitmap: u32,
        children: &Arc<[Child]>,
        key: &str,
        hash: u64,
        depth: usize,
    ) -> Option<Self> {
        let bit = 1u32 << hash_index(hash, depth);
        if bitmap & bit == 0 {
            return None;
        }
        let position = (bitmap & (bit - 1)).count_ones() as usize;

        match &children[position] {
            Child::Entry { key: child_key, .. } => {
                if child_key != key {
                    return None;
                }
                let remaining_bitmap = bitmap & !bit;
                if remaining_bitmap == 0 {
                    return Some(Self::Empty);
                }
                let mut updated = children.to_vec();
                updated.remove(position);
                Some(Self::Bitmap {
                    bitmap: remaining_bitmap,
                    children: Arc::from(updated),
                })
            }
            Child::Node(subnode) => {
                let new_subnode = subnode.remove(key, hash, depth + 1)?;
                if matches!(new_subnode, Self::Empty) {
                    let remaining_bitmap = bitmap & !bit;
                    if remaining_bitmap == 0 {
                        return Some(Self::Empty);
                    }
                    let mut updated = children.to_vec();
                    updated.remove(position);
                    return Some(Self::Bitmap {
                        bitmap: remaining_bitmap,
                        children: Arc::from(updated),
                    });
                }
                let mut updated = children.to_vec();
                updated[position] = Child::Node(Arc::new(new_subnode));
                Some(Self::Bitmap {
                    bitmap,
                    children: Arc::from(updated),
                })
            }
        }
    }

    fn collect_keys<'a>(&'a self, keys: &mut Vec<&'a str>) {
        match self {
            Self::Empty => {}
            Self::Entry { key, .. } => keys.push(key),
            Self::Bitmap { children, .. } => {
                for child in children.iter() {
                    match child {
                        Child::Entry { key, .. } => keys.push(key),
                        Child::Node(subnode) => subnode.collect_keys(keys),
                    }
                }
            }
            Self::Collision { entries, .. } => {
                keys.extend(entries.iter().map(|(key, _)| key.as_str()));
            }
        }
    }
}

// =============================================================================
// Context
// =============================================================================

/// An immutable, string-keyed bag of ambient values.
///
/// `Context` is cheap to clone (the trie root is shared behind an `Arc`)
/// and never mutated in place; every update produces a fresh value that
/// shares all untouched structure with the original. This is what lets the
/// interpreter's context-switch instructions save a context on entry and
/// restore it, unchanged, on every exit path.
///
/// # Time complexity
///
/// | Operation | Complexity |
/// |---|---|
/// | `get` / `contains_key` | O(log32 N) |
/// | `with` / `without` | O(log32 N) |
/// | `len` / `is_empty` | O(1) |
#[derive(Clone)]
pub struct Context {
    root: Arc<Node>,
    length: usize,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            root: Arc::new(Node::Empty),
            length: 0,
        }
    }
}

impl Context {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new context with `value` stored under `key`.
    ///
    /// An existing entry under the same key is replaced in the copy; the
    /// original context keeps the old entry.
    #[must_use]
    pub fn with<V>(&self, key: impl Into<String>, value: V) -> Self
    where
        V: Any + Send + Sync,
    {
        let key = key.into();
        let hash = compute_hash(&key);
        let (root, added) = self.root.insert(key, Arc::new(value), hash, 0);
        Self {
            root: Arc::new(root),
            length: if added { self.length + 1 } else { self.length },
        }
    }

    /// Returns a new context without an entry under `key`.
    #[must_use]
    pub fn without(&self, key: &str) -> Self {
        let hash = compute_hash(key);
        match self.root.remove(key, hash, 0) {
            Some(root) => Self {
                root: Arc::new(root),
                length: self.length.saturating_sub(1),
            },
            None => self.clone(),
        }
    }

    /// Looks up the entry under `key`, downcast to `V`.
    ///
    /// Returns `None` when the key is absent or the stored value has a
    /// different type.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use eddy::effect::Context;
    ///
    /// let context = Context::new().with("retries", 3u32);
    /// assert_eq!(*context.get::<u32>("retries").unwrap(), 3);
    /// assert!(context.get::<String>("retries").is_none());
    /// ```
    #[must_use]
    pub fn get<V>(&self, key: &str) -> Option<Arc<V>>
    where
        V: Any + Send + Sync,
    {
        self.root
            .get(key, compute_hash(key), 0)
            .cloned()
            .and_then(|value| value.downcast::<V>().ok())
    }

    /// Whether an entry exists under `key`, regardless of its type.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.root.get(key, compute_hash(key), 0).is_some()
    }

    /// The number of entries.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.length
    }

    /// Whether the context has no entries.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys = Vec::with_capacity(self.length);
        self.root.collect_keys(&mut keys);
        keys.sort_unstable();
        formatter.debug_struct("Context").field("keys", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_empty() {
        let context = Context::new();
        assert!(context.is_empty());
        assert_eq!(context.len(), 0);
    }

    #[test]
    fn test_with_is_persistent() {
        let base = Context::new().with("name", "base");
        let updated = base.with("name", "updated");

        assert_eq!(*base.get::<&str>("name").unwrap(), "base");
        assert_eq!(*updated.get::<&str>("name").unwrap(), "updated");
        assert_eq!(base.len(), 1);
        assert_eq!(updated.len(), 1);
    }

    #[test]
    fn test_without_removes_only_in_copy() {
        let base = Context::new().with("keep", 1u8).with("drop", 2u8);
        let narrowed = base.without("drop");

        assert!(base.contains_key("drop"));
        assert!(!narrowed.contains_key("drop"));
        assert!(narrowed.contains_key("keep"));
        assert_eq!(narrowed.len(), 1);
    }

    #[test]
    fn test_without_missing_key_is_identity() {
        let base = Context::new().with("keep", 1u8);
        let same = base.without("absent");
        assert_eq!(same.len(), 1);
        assert!(same.contains_key("keep"));
    }

    #[test]
    fn test_get_with_wrong_type_is_none() {
        let context = Context::new().with("count", 7u64);
        assert!(context.get::<String>("count").is_none());
        assert_eq!(*context.get::<u64>("count").unwrap(), 7);
    }

    #[test]
    fn test_many_entries_populate_deep_branches() {
        let mut context = Context::new();
        for index in 0..200u32 {
            context = context.with(format!("key-{index}"), index);
        }

        assert_eq!(context.len(), 200);
        for index in 0..200u32 {
            assert_eq!(*context.get::<u32>(&format!("key-{index}")).unwrap(), index);
        }
    }

    #[test]
    fn test_update_shares_untouched_entries() {
        let mut base = Context::new();
        for index in 0..100u32 {
            base = base.with(format!("key-{index}"), index);
        }

        // A single-key update leaves every other entry visible in both maps.
        let updated = base.with("key-50", 5000u32);
        assert_eq!(*base.get::<u32>("key-50").unwrap(), 50);
        assert_eq!(*updated.get::<u32>("key-50").unwrap(), 5000);
        for index in (0..100u32).filter(|index| *index != 50) {
            assert_eq!(*updated.get::<u32>(&format!("key-{index}")).unwrap(), index);
        }
    }

    #[test]
    fn test_removal_keeps_siblings_reachable() {
        let mut context = Context::new();
        for index in 0..64u32 {
            context = context.with(format!("key-{index}"), index);
        }

        let narrowed = context.without("key-31");
        assert_eq!(narrowed.len(), 63);
        assert!(!narrowed.contains_key("key-31"));
        for index in (0..64u32).filter(|index| *index != 31) {
            assert!(narrowed.contains_key(&format!("key-{index}")));
        }
    }

    #[test]
    fn test_debug_lists_sorted_keys() {
        let context = Context::new().with("beta", 1u8).with("alpha", 2u8);
        let rendered = format!("{context:?}");
        assert!(rendered.contains("alpha"));
        assert!(rendered.contains("beta"));
    }
}
