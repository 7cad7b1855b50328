use std::{collections::HashMap, default::Default, num::NonZeroUsize, task::Waker};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub(crate) struct Token(NonZeroUsize);

/// Data structure for managing a collection of wakers that are all interested
/// in a single shared computation. In particular, it is designed so that only
/// a single task needs to actually do the work of driving the future to
/// completion, but other tasks can take its place if that one is dropped.
///
/// Wakers can be added to a wakerset; when added, a token associated with the
/// Waker is returned. This token should be associated with a running future
/// and can be used to:
/// - replace the waker on subsequent polls
/// - discard the waker from the wakerset.
///
/// The WakerSet maintains the notion of the "driving waker"; this is the
/// waker that most recently polled the relevant future. This is always the
/// most recently added or replaced waker in the set; it is assumed that a
/// waker will be upserted into the set, and then used to poll the underlying
/// future. If the driving waker is discarded from the set, another can be
/// selected as the driving waker. In this way, we create an ambiguous but
/// nevertheless unbroken chain of wakers. So long as futures take care to
/// discard their stored tokens when dropped, the shared computation will
/// always have a "path forward".
#[derive(Debug)]
pub(crate) struct WakerSet {
    wakers: HashMap<Token, Waker>,
    driving_waker: Option<Token>,

    // Tokens are an ever-increasing integer. We assume that WakerSets are
    // relatively short-lived and that there's no chance of running out of
    // these.
    next_token: NonZeroUsize,
}

impl Default for WakerSet {
    fn default() -> Self {
        Self {
            wakers: HashMap::with_capacity(1),
            next_token: NonZeroUsize::new(1).unwrap(),
            driving_waker: None,
        }
    }
}

impl WakerSet {
    /// Add a new waker to this set. Return the token associated with this
    /// waker's entry in the set.
    ///
    /// This waker is set as the current driving waker, on the assumption that
    /// it has just been used to poll a future.
    #[must_use]
    pub(crate) fn add_waker(&mut self, waker: Waker) -> Token {
        let token = self.insert_waker(waker);
        self.driving_waker = Some(token);
        token
    }

    fn insert_waker(&mut self, waker: Waker) -> Token {
        let token = Token(self.next_token);
        self.next_token = self
            .next_token
            .get()
            .checked_add(1)
            .and_then(NonZeroUsize::new)
            .expect("Overflow when creating token");

        self.wakers.insert(token, waker);
        token
    }

    /// Set a waker with an existing token in this set. Panics if the token
    /// is not present in the set. The waker is passed by reference and is set
    /// with clone_from because it comes from a Context.
    ///
    /// This waker is set as the current driving waker.
    pub(crate) fn replace_waker(&mut self, token: Token, waker: &Waker) {
        self.wakers
            .get_mut(&token)
            .expect("Attempted to add Waker to WakerSet with an invalid token")
            .clone_from(waker);

        self.driving_waker = Some(token);
    }

    /// Upsert a waker: replace it if we already have a token, otherwise add
    /// it and store the new token.
    pub(crate) fn register(&mut self, token: &mut Option<Token>, waker: &Waker) {
        match *token {
            Some(existing) => self.replace_waker(existing, waker),
            None => *token = Some(self.add_waker(waker.clone())),
        }
    }

    /// Upsert a waker without taking over from the current driving waker.
    /// If there is no driving waker, this one becomes it. Returns true if
    /// this waker is the driving waker.
    ///
    /// This is for shared work that must only be polled by its driver, such
    /// as a batch window.
    pub(crate) fn register_waiter(&mut self, token: &mut Option<Token>, waker: &Waker) -> bool {
        let current = match *token {
            Some(existing) => {
                self.wakers
                    .get_mut(&existing)
                    .expect("Attempted to add Waker to WakerSet with an invalid token")
                    .clone_from(waker);
                existing
            }
            None => {
                let added = self.insert_waker(waker.clone());
                *token = Some(added);
                added
            }
        };

        *self.driving_waker.get_or_insert(current) == current
    }

    /// Discard a waker from this set. If that waker was the current driving
    /// waker (or there is currently no driving waker), an arbitrary waker is
    /// made the current driving waker and awoken.
    ///
    /// We create a new driving waker immediately because if a series of drops
    /// happen at the same time we need to ensure that at least one non-dropped
    /// waker is awoken.
    pub(crate) fn discard_and_wake(&mut self, token: Token) {
        self.wakers.remove(&token);
        if self.driving_waker == Some(token) || self.driving_waker.is_none() {
            match self.wakers.iter().next() {
                None => self.driving_waker = None,
                Some((&token, waker)) => {
                    self.driving_waker = Some(token);
                    waker.wake_by_ref();
                }
            }
        }
    }

    /// Wake the current driving waker, if there is one. Used when something
    /// other than a poll (such as hitting the key limit) makes progress
    /// possible.
    pub(crate) fn wake_driver(&self) {
        if let Some(waker) = self
            .driving_waker
            .as_ref()
            .and_then(|token| self.wakers.get(token))
        {
            waker.wake_by_ref();
        }
    }

    pub(crate) fn wake_all(self) {
        self.wakers
            .into_iter()
            .for_each(|(_token, waker)| waker.wake());
    }

    /// Wake every waker except the one associated with `token`. Used by the
    /// future that completed the shared computation, which doesn't need to
    /// wake itself.
    pub(crate) fn discard_wake_all(mut self, token: Token) {
        self.wakers.remove(&token);
        self.wake_all();
    }

    /// Finish with this set: wake everyone except the caller's own waker, if
    /// it has one.
    pub(crate) fn finish(self, token: Option<Token>) {
        match token {
            Some(token) => self.discard_wake_all(token),
            None => self.wake_all(),
        }
    }
}
