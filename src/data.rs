//! Data structures for passing keys and values into and out of a batch.

use std::collections::hash_map::{Entry, HashMap};
use std::hash::Hash;
use std::mem;
use std::num::NonZeroUsize;

use tracing::warn;

/// Tokens are handed out in the order keys are first seen, so sorting by
/// token recovers first-seen order.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Token(NonZeroUsize);

/// A set of keys passed into a batch function. Use the `keys` method to get
/// the set of keys, all of which will be unique, so that you can execute your
/// request. Then, use one of the `into_values` family of methods to transform
/// your response data into a ValueSet, which is handed back to the batch
/// loader.
#[derive(Debug)]
pub struct KeySet<Key: Eq + Hash> {
    // In order to not require cloneable keys, this structure associates each
    // key with two pieces of information:
    //
    // - a Token, which is held by each future. The token is uniquely associated
    // with a key for a given KeySet.
    // - A count of how many futures are requesting the same key. This count
    // specifically is the number of futures *past the first* that are awaiting
    // the key; in other words, it's the number of times the value will need
    // to be cloned.
    //
    // Keys are never removed from `keys`, since token numbering depends on its
    // length. A key whose token is gone from `tokens` was abandoned by all of
    // its futures and is not passed to the batch function.
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
    /// key. This token can then be used to pull a value out of the ValueSet
    /// associated with the key.
    pub(crate) fn add_key(&mut self, key: Key) -> Token {
        let new_token = Token(NonZeroUsize::new(self.keys.len() + 1).unwrap());
        let token = *self.keys.entry(key).or_insert(new_token);
        self.tokens
            .entry(token)
            .and_modify(|count| *count += 1)
            .or_insert(0);

        token
    }

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

    /// Take the keyset out of this particular &mut self instance, replacing it
    /// with an empty set. Helper method for when the state transitions out
    /// of Accumulating.
    pub(crate) fn take(&mut self) -> Self {
        Self {
            keys: mem::take(&mut self.keys),
            tokens: mem::take(&mut self.tokens),
        }
    }

    /// Check if there are any keys in this keyset
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Get the number of unique keys in this keyset.
    #[inline]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Get an iterator over all the keys in this keyset. These are guaranteed
    /// to be:
    ///
    /// - Unique
    /// - Between 1 and the configured max_keys of the related BatchRules
    /// - In the order they were first requested
    pub fn keys(&self) -> impl Iterator<Item = &Key> + Clone {
        let mut live: Vec<(Token, &Key)> = self
            .keys
            .iter()
            .filter(|(_key, token)| self.tokens.contains_key(*token))
            .map(|(key, &token)| (token, key))
            .collect();

        live.sort_unstable_by_key(|&(token, _key)| token);
        live.into_iter().map(|(_token, key)| key)
    }

    fn live_entries(self) -> impl Iterator<Item = (Key, Token, usize)> {
        let KeySet { keys, tokens } = self;

        keys.into_iter().filter_map(move |(key, token)| {
            let count = tokens.get(&token)?;
            Some((key, token, *count))
        })
    }

    /// After you've completed your request, use this method to pair each value
    /// in your result with its key. Every key gets a value.
    pub fn into_values<Value, Error>(
        self,
        mut get_value: impl FnMut(&Key) -> Value,
    ) -> ValueSet<Value, Error> {
        let values = self
            .live_entries()
            .map(|(key, token, count)| {
                let value = Ok(get_value(&key));
                (token, ValueSetEntry { value, count })
            })
            .collect();

        ValueSet { values }
    }

    /// Fallible version of into_values. Same as into_values, but will return
    /// an error the first time `get_value` returns an error. Use this when a
    /// single failure should fail the whole batch.
    pub fn try_into_values<Value, Error>(
        self,
        mut get_value: impl FnMut(&Key) -> Result<Value, Error>,
    ) -> Result<ValueSet<Value, Error>, Error> {
        let values: Result<HashMap<Token, ValueSetEntry<Value, Error>>, Error> = self
            .live_entries()
            .map(|(key, token, count)| {
                let value = Ok(get_value(&key)?);
                Ok((token, ValueSetEntry { value, count }))
            })
            .collect();

        values.map(|values| ValueSet { values })
    }

    /// Correlate a downstream response with the requested keys by key
    /// identity. Requested keys missing from `pairs` have no value; keys that
    /// were never requested are ignored. If a key appears more than once, the
    /// first pair wins.
    pub fn values_from_pairs<Value, Error>(
        self,
        pairs: impl IntoIterator<Item = (Key, Value)>,
    ) -> ValueSet<Value, Error> {
        self.results_from_pairs(pairs.into_iter().map(|(key, value)| (key, Ok(value))))
    }

    /// Same as values_from_pairs, but each key may carry its own error. A
    /// per-key error is delivered only to the futures waiting on that key.
    pub fn results_from_pairs<Value, Error>(
        self,
        pairs: impl IntoIterator<Item = (Key, Result<Value, Error>)>,
    ) -> ValueSet<Value, Error> {
        let mut values = HashMap::with_capacity(self.tokens.len());
        let mut unrequested = 0usize;

        for (key, value) in pairs {
            let token = match self.keys.get(&key) {
                Some(token) => *token,
                None => {
                    unrequested += 1;
                    continue;
                }
            };

            if let Some(&count) = self.tokens.get(&token) {
                values
                    .entry(token)
                    .or_insert(ValueSetEntry { value, count });
            }
        }

        if unrequested > 0 {
            warn!(unrequested, "batch response contained keys that were not requested");
        }

        ValueSet { values }
    }
}

#[derive(Debug)]
struct ValueSetEntry<Value, Error> {
    count: usize,
    value: Result<Value, Error>,
}

/// A value set is an opaque data structure that contains the result of a
/// batch operation. It is created with one of the `KeySet::into_values`
/// methods, and is used by the BatchController to distribute the values to
/// the correct waiting futures. A key with no entry in the ValueSet has no
/// value.
#[derive(Debug)]
pub struct ValueSet<Value, Error> {
    values: HashMap<Token, ValueSetEntry<Value, Error>>,
}

impl<Value, Error> ValueSet<Value, Error> {
    /// Number of keys that received a value or an error.
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

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
}

impl<Value: Clone, Error: Clone> ValueSet<Value, Error> {
    /// Take the result associated with a token out of this ValueSet. If the
    /// count of this token is > 0, the result is cloned. Returns None if the
    /// batch produced nothing for this token's key.
    pub(crate) fn take(&mut self, token: Token) -> Option<Result<Value, Error>> {
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
