//! Short-circuiting voter chains
//!
//! Owners attach voters to a chain; evaluation walks them in connection
//! order and returns the first verdict that differs from the chain's
//! default. An empty chain, or one where every voter agrees with the
//! default, yields the default.

use std::sync::Arc;

use parking_lot::Mutex;

type Voter<A, R> = Arc<dyn Fn(&A) -> R + Send + Sync>;

pub struct PredicateChain<A, R> {
    default: R,
    voters: Mutex<Vec<Voter<A, R>>>,
}

impl<A, R> PredicateChain<A, R>
where
    R: Clone + PartialEq,
{
    pub fn new(default: R) -> Self {
        Self {
            default,
            voters: Mutex::new(Vec::new()),
        }
    }

    pub fn connect<F>(&self, voter: F)
    where
        F: Fn(&A) -> R + Send + Sync + 'static,
    {
        self.voters.lock().push(Arc::new(voter));
    }

    pub fn clear(&self) {
        self.voters.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.voters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evaluate(&self, argument: &A) -> R {
        let voters: Vec<Voter<A, R>> = self.voters.lock().clone();
        for voter in voters {
            let verdict = voter(argument);
            if verdict != self.default {
                return verdict;
            }
        }
        self.default.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GrabbableState;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_empty_chain_permits() {
        let chain: PredicateChain<u32, bool> = PredicateChain::new(true);
        assert!(chain.evaluate(&7));
        assert!(chain.is_empty());
    }

    #[test]
    fn test_first_non_default_wins_and_short_circuits() {
        let chain: PredicateChain<u32, GrabbableState> =
            PredicateChain::new(GrabbableState::Grabbable);
        let later_calls = Arc::new(AtomicUsize::new(0));

        chain.connect(|_| GrabbableState::Grabbable);
        chain.connect(|v| {
            if *v == 1 {
                GrabbableState::UngrabbableTemporarily
            } else {
                GrabbableState::Grabbable
            }
        });
        let calls = Arc::clone(&later_calls);
        chain.connect(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            GrabbableState::UngrabbablePermanently
        });

        assert_eq!(chain.evaluate(&1), GrabbableState::UngrabbableTemporarily);
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);

        assert_eq!(chain.evaluate(&2), GrabbableState::UngrabbablePermanently);
        assert_eq!(later_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_veto() {
        let chain: PredicateChain<&'static str, bool> = PredicateChain::new(true);
        chain.connect(|name| !name.contains("virtual"));
        assert!(chain.evaluate(&"usb keyboard"));
        assert!(!chain.evaluate(&"virtual keyboard"));
    }
}
