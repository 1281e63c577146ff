//! A typed state word.
//!
//! Objects with a lifecycle (timers, sockets) keep their state in one `AtomicU32` and move it
//! only by compare-and-swap. `StateCell` wraps that word with the enum it encodes, and pairs
//! every successful transition with a wake so threads parked in
//! [`wait_while`](StateCell::wait_while) re-check.

use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

use super::{INFINITE, wait_on_address, wake_by_address_all};

/// An enum that round-trips through a `u32`.
pub trait StateWord: Copy + Eq + Debug {
    fn into_word(self) -> u32;
    fn from_word(word: u32) -> Self;
}

pub struct StateCell<S> {
    word: AtomicU32,
    _state: PhantomData<S>,
}

impl<S: StateWord> StateCell<S> {
    pub fn new(initial: S) -> Self {
        Self {
            word: AtomicU32::new(initial.into_word()),
            _state: PhantomData,
        }
    }

    pub fn get(&self) -> S {
        S::from_word(self.word.load(Ordering::SeqCst))
    }

    /// Moves `from → to`. On failure returns the state actually observed.
    pub fn transition(&self, from: S, to: S) -> Result<(), S> {
        match self.word.compare_exchange(
            from.into_word(),
            to.into_word(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                wake_by_address_all(&self.word);
                Ok(())
            }
            Err(observed) => Err(S::from_word(observed)),
        }
    }

    /// Unconditionally stores `to`. Only the owner of an in-flight transition may do this.
    pub fn set(&self, to: S) {
        self.word.store(to.into_word(), Ordering::SeqCst);
        wake_by_address_all(&self.word);
    }

    /// Blocks until the state is no longer `state`, and returns the new one.
    pub fn wait_while(&self, state: S) -> S {
        let word = state.into_word();
        loop {
            let current = self.word.load(Ordering::SeqCst);
            if current != word {
                return S::from_word(current);
            }
            wait_on_address(&self.word, word, INFINITE);
        }
    }
}

impl<S: StateWord> Debug for StateCell<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StateCell").field(&self.get()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Door {
        Shut,
        Opening,
        Open,
    }

    impl StateWord for Door {
        fn into_word(self) -> u32 {
            self as u32
        }

        fn from_word(word: u32) -> Self {
            match word {
                0 => Door::Shut,
                1 => Door::Opening,
                _ => Door::Open,
            }
        }
    }

    #[test]
    fn losing_transition_reports_observed_state() {
        let cell = StateCell::new(Door::Shut);
        assert_eq!(cell.transition(Door::Shut, Door::Opening), Ok(()));
        assert_eq!(cell.transition(Door::Shut, Door::Opening), Err(Door::Opening));
        assert_eq!(cell.get(), Door::Opening);
    }

    #[test]
    fn wait_while_returns_after_owner_finishes() {
        let cell = Arc::new(StateCell::new(Door::Opening));
        let waiter = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || cell.wait_while(Door::Opening))
        };
        thread::sleep(Duration::from_millis(20));
        cell.set(Door::Open);
        assert_eq!(waiter.join().unwrap(), Door::Open);
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        fn door() -> impl Strategy<Value = Door> {
            prop_oneof![Just(Door::Shut), Just(Door::Opening), Just(Door::Open)]
        }

        proptest! {
            #[test]
            fn transition_succeeds_only_from_the_current_state(
                start in door(), from in door(), to in door()
            ) {
                let cell = StateCell::new(start);
                let outcome = cell.transition(from, to);
                if start == from {
                    prop_assert_eq!(outcome, Ok(()));
                    prop_assert_eq!(cell.get(), to);
                } else {
                    prop_assert_eq!(outcome, Err(start));
                    prop_assert_eq!(cell.get(), start);
                }
            }
        }
    }
}
