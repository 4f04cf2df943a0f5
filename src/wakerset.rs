use std::{collections::HashMap, default::Default, num::NonZeroUsize, task::Waker};

#[derive(Debug, Eq, PartialEq, Hash)]
pub(crate) struct Token(NonZeroUsize);

impl Token {
    fn duplicate(&self) -> Token {
        Token(self.0)
    }
}

/// Data structure for managing a collection of wakers that are all interested
/// in a single shared computation. In particular, it is designed so that only
/// a single task needs to actually do the work of driving the batch to
/// completion, but other tasks can take its place if that one is dropped.
///
/// Wakers can be added to a wakerset; when added, a token associated with the
/// Waker is returned. This token should be associated with a waiting future
/// and can be used to:
/// - replace the waker on subsequent polls
/// - discard the waker from the wakerset.
/// These tokens cannot be cloned or otherwise duplicated; this helps to ensure
/// that their lifespan are correctly associated with a particular task.
///
/// The WakerSet maintains the notion of the "driving waker"; this is the
/// waker that most recently polled the shared batch. If the driving waker is
/// discarded from the set, another is selected and woken. So long as futures
/// discard their stored tokens when dropped, the batch always has a path
/// forward.
#[derive(Debug)]
pub(crate) struct WakerSet {
    wakers: HashMap<Token, Waker>,
    driving_waker: Option<Token>,

    // Tokens are an ever-increasing integer. WakerSets live for one batch,
    // so there's no chance of running out of these.
    next_token: NonZeroUsize,
}

impl Default for WakerSet {
    fn default() -> Self {
        Self {
            wakers: HashMap::with_capacity(1),
            next_token: NonZeroUsize::MIN,
            driving_waker: None,
        }
    }
}

impl WakerSet {
    /// Add a new waker to this set and make it the driving waker, on the
    /// assumption that it is about to be used to poll the batch.
    #[must_use]
    pub(crate) fn add_waker(&mut self, waker: Waker) -> Token {
        let token = Token(self.next_token);
        self.next_token = self
            .next_token
            .checked_add(1)
            .expect("Overflow when creating token");

        self.wakers.insert(token.duplicate(), waker);
        self.driving_waker = Some(token.duplicate());
        token
    }

    /// Set a waker with an existing token in this set, and make it the
    /// driving waker. Panics if the token is not present in the set. The
    /// waker is set with clone_from because it comes from a Context and
    /// would need to be cloned anyway.
    pub(crate) fn replace_waker(&mut self, token: &Token, waker: &Waker) {
        self.wakers
            .get_mut(token)
            .expect("Attempted to add Waker to WakerSet with an invalid token")
            .clone_from(waker);

        self.driving_waker = Some(token.duplicate());
    }

    /// Register the waker for the future holding `token`, adding it if the
    /// future has never polled this batch before.
    pub(crate) fn upsert(&mut self, token: &mut Option<Token>, waker: &Waker) {
        match token.as_ref() {
            Some(token) => self.replace_waker(token, waker),
            None => *token = Some(self.add_waker(waker.clone())),
        }
    }

    /// Discard a waker from this set. If that waker was the current driving
    /// waker, the current driving waker is unset. Only use this when a future
    /// is completing; otherwise prefer discard_and_wake, so that another
    /// task takes over if this one was the driver.
    pub(crate) fn discard_waker(&mut self, token: Token) {
        self.wakers.remove(&token);
        if self.driving_waker.as_ref() == Some(&token) {
            self.driving_waker = None;
        }
    }

    /// Discard a waker from this set. If that waker was the current driving
    /// waker (or there is currently no driving waker), an arbitrary waker is
    /// made the current driving waker and awoken.
    ///
    /// The replacement is chosen immediately because if a series of drops
    /// happen at the same time at least one non-dropped waker must be awoken.
    pub(crate) fn discard_and_wake(&mut self, token: Token) {
        self.wakers.remove(&token);
        if self.driving_waker.as_ref() == Some(&token) || self.driving_waker.is_none() {
            match self.wakers.iter().next() {
                None => self.driving_waker = None,
                Some((token, waker)) => {
                    self.driving_waker = Some(token.duplicate());
                    waker.wake_by_ref();
                }
            }
        }
    }

    /// Wake the driving waker, or an arbitrary one if there is no driver.
    /// Used when the batch must make progress right away (the key limit was
    /// reached, or the batch is being flushed).
    pub(crate) fn wake_driver(&self) {
        let driver = self
            .driving_waker
            .as_ref()
            .and_then(|token| self.wakers.get(token))
            .or_else(|| self.wakers.values().next());

        if let Some(waker) = driver {
            waker.wake_by_ref();
        }
    }

    pub(crate) fn wake_all(self) {
        self.wakers
            .into_iter()
            .for_each(|(_token, waker)| waker.wake());
    }

    pub(crate) fn len(&self) -> usize {
        self.wakers.len()
    }
}
