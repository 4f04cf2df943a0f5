//! Data structures for passing keys and values into and out of a batch.

use std::collections::hash_map::{Entry, HashMap};
use std::hash::Hash;
use std::mem;
use std::num::NonZeroUsize;

#[repr(transparent)]
#[derive(Debug, PartialEq, Eq, Hash)]
pub(crate) struct Token(NonZeroUsize);

impl Token {
    fn duplicate(&self) -> Self {
        Token(self.0)
    }
}

/// The set of keys accumulated by one open batch. Every waiter holds a
/// [`Token`] for its key; several waiters asking for the same key share a
/// token, so each distinct key is fetched once.
#[derive(Debug)]
pub(crate) struct KeySet<Key: Eq + Hash> {
    // Each key maps to a token, and each live token maps to the number of
    // waiters *past the first* that hold it. That count is the number of
    // times the fetched value will need to be cloned.
    //
    // Tokens are derived from the len of `keys`, so keys are never removed
    // from that table; a key whose waiters all left just loses its token
    // entry. KeySets live for one batch, so this doesn't grow unbounded.
    keys: HashMap<Key, Token>,
    tokens: HashMap<Token, usize>,
}

impl<Key: Eq + Hash> KeySet<Key> {
    pub(crate) fn new() -> Self {
        Self {
            keys: HashMap::new(),
            tokens: HashMap::new(),
        }
    }

    /// Add a key to this KeySet, and return the token associated with that
    /// key. This token is later used to pull the value out of the ValueSet.
    pub(crate) fn add_key(&mut self, key: Key) -> Token {
        let new_token = Token(NonZeroUsize::MIN.saturating_add(self.keys.len()));
        let token = self.keys.entry(key).or_insert(new_token).duplicate();
        self.tokens
            .entry(token.duplicate())
            .and_modify(|count| *count += 1)
            .or_insert(0);

        token
    }

    /// Give up one waiter's interest in a key. When the last waiter of a key
    /// leaves, the key is no longer part of the batch.
    pub(crate) fn discard_token(&mut self, token: Token) {
        match self.tokens.entry(token) {
            Entry::Occupied(entry) if *entry.get() == 0 => {
                entry.remove();
            }
            Entry::Occupied(mut entry) => {
                *entry.get_mut() -= 1;
            }
            Entry::Vacant(_) => panic!("Attempted to remove nonexistent token from KeySet"),
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Number of distinct keys that still have at least one waiter.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Iterate over the live keys, unique and in arbitrary order.
    pub(crate) fn keys(&self) -> impl Iterator<Item = &Key> + Clone {
        let tokens = &self.tokens;

        self.keys
            .iter()
            .filter(move |(_key, token)| tokens.contains_key(token))
            .map(|(key, _token)| key)
    }

    /// Pair every live key with a value. This is the only way to create a
    /// ValueSet, which guarantees that each token has exactly one entry.
    pub(crate) fn into_values<Value>(
        self,
        mut get_value: impl FnMut(&Key) -> Value,
    ) -> ValueSet<Value> {
        let KeySet { keys, tokens } = self;

        let values = keys
            .into_iter()
            .filter_map(move |(key, token)| {
                let count = *tokens.get(&token)?;
                Some((key, token, count))
            })
            .map(move |(key, token, count)| {
                let value = get_value(&key);
                (token, ValueSetEntry { value, count })
            })
            .collect();

        ValueSet { values }
    }

    /// Take the keyset out of this particular &mut self instance, replacing
    /// it with an empty set. Used when the batch leaves the accumulating
    /// state.
    pub(crate) fn take(&mut self) -> Self {
        Self {
            keys: mem::take(&mut self.keys),
            tokens: mem::take(&mut self.tokens),
        }
    }
}

impl<Key: Eq + Hash + Clone> KeySet<Key> {
    /// The live keys, cloned into the list handed to the batch function.
    pub(crate) fn to_vec(&self) -> Vec<Key> {
        self.keys().cloned().collect()
    }
}

#[derive(Debug)]
struct ValueSetEntry<Value> {
    count: usize,
    value: Value,
}

/// The result of a completed batch, indexed by waiter token.
#[derive(Debug)]
pub(crate) struct ValueSet<Value> {
    values: HashMap<Token, ValueSetEntry<Value>>,
}

impl<Value> ValueSet<Value> {
    /// Discard a token associated with this ValueSet without getting the
    /// value. No-op if the token isn't present.
    pub(crate) fn discard(&mut self, token: Token) {
        match self.values.entry(token) {
            Entry::Vacant(..) => {}
            Entry::Occupied(entry) if entry.get().count == 0 => {
                entry.remove();
            }
            Entry::Occupied(mut entry) => {
                entry.get_mut().count -= 1;
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.values.len()
    }
}

impl<Value: Clone> ValueSet<Value> {
    /// Take the value for a token. The last holder of a token gets the value
    /// itself; everyone before gets a clone.
    pub(crate) fn take(&mut self, token: Token) -> Option<Value> {
        match self.values.entry(token) {
            Entry::Vacant(..) => None,
            Entry::Occupied(entry) if entry.get().count == 0 => Some(entry.remove().value),
            Entry::Occupied(mut entry) => {
                let entry = entry.get_mut();
                entry.count -= 1;
                Some(entry.value.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_keys_share_a_token() {
        let mut keys = KeySet::new();
        let a1 = keys.add_key("a");
        let b = keys.add_key("b");
        let a2 = keys.add_key("a");

        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert_eq!(keys.len(), 2);

        let mut listed = keys.to_vec();
        listed.sort_unstable();
        assert_eq!(listed, ["a", "b"]);
    }

    #[test]
    fn discarding_every_waiter_removes_the_key() {
        let mut keys = KeySet::new();
        let a1 = keys.add_key("a");
        let a2 = keys.add_key("a");
        let b = keys.add_key("b");

        keys.discard_token(a1);
        assert_eq!(keys.len(), 2);

        keys.discard_token(a2);
        assert_eq!(keys.to_vec(), ["b"]);

        keys.discard_token(b);
        assert!(keys.is_empty());
    }

    #[test]
    fn rejoining_a_discarded_key_revives_it() {
        let mut keys = KeySet::new();
        let a = keys.add_key("a");
        keys.discard_token(a);
        assert!(keys.is_empty());

        let again = keys.add_key("a");
        assert_eq!(keys.to_vec(), ["a"]);

        let mut values = keys.into_values(|key| key.len());
        assert_eq!(values.take(again), Some(1));
    }

    #[test]
    fn values_are_cloned_until_the_last_holder() {
        let mut keys = KeySet::new();
        let t1 = keys.add_key(7);
        let t2 = keys.add_key(7);
        let other = keys.add_key(8);

        let mut values = keys.into_values(|key| key.to_string());
        assert_eq!(values.len(), 2);

        assert_eq!(values.take(t1), Some("7".to_string()));
        assert_eq!(values.take(t2), Some("7".to_string()));
        assert_eq!(values.len(), 1);

        values.discard(other);
        assert_eq!(values.len(), 0);
    }
}
