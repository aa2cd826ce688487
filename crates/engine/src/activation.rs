//! Ordering between specific-extension rules and catch-all rules.
//!
//! Work is split into rounds. A round opens at startup and again on every
//! resume. Catch-all rules only scan once every specific rule has finished
//! a cycle that it started in the current round, so a catch-all never takes
//! a file a specific rule would have claimed.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Round {
    number: u64,
    pending: usize,
}

pub struct ActivationRounds {
    specific_rules: usize,
    round: watch::Sender<Round>,
}

impl ActivationRounds {
    /// `specific_rules` is the number of active rules that are not
    /// match-all. Round 0 is open from the start.
    pub fn new(specific_rules: usize) -> Self {
        let (round, _) = watch::channel(Round {
            number: 0,
            pending: specific_rules,
        });
        Self {
            specific_rules,
            round,
        }
    }

    pub fn current(&self) -> u64 {
        self.round.borrow().number
    }

    /// Open a new round in which every specific rule owes one cycle.
    pub fn begin(&self) -> u64 {
        let specific_rules = self.specific_rules;
        let mut number = 0;
        self.round.send_modify(|round| {
            round.number += 1;
            round.pending = specific_rules;
            number = round.number;
        });
        number
    }

    /// A specific rule finished a cycle it started in `round`.
    ///
    /// Callers arrive at most once per round. Arrivals for a round that
    /// has since been replaced are ignored.
    pub fn arrive(&self, round: u64) {
        self.round.send_if_modified(|current| {
            if current.number != round || current.pending == 0 {
                return false;
            }
            current.pending -= 1;
            true
        });
    }

    pub fn is_settled(&self) -> bool {
        self.round.borrow().pending == 0
    }

    /// Wait until every specific rule has arrived in the current round.
    pub async fn settled(&self) {
        let mut rx = self.round.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|round| round.pending == 0).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn no_specific_rules_is_settled_immediately() {
        let rounds = ActivationRounds::new(0);
        assert!(rounds.is_settled());
        rounds.begin();
        assert!(rounds.is_settled());
    }

    #[test]
    fn settles_once_every_specific_rule_arrives() {
        let rounds = ActivationRounds::new(2);
        assert!(!rounds.is_settled());

        rounds.arrive(0);
        assert!(!rounds.is_settled());
        rounds.arrive(0);
        assert!(rounds.is_settled());
    }

    #[test]
    fn arrivals_from_an_earlier_round_do_not_count() {
        let rounds = ActivationRounds::new(1);
        let stale = rounds.current();
        let fresh = rounds.begin();
        assert_ne!(stale, fresh);

        rounds.arrive(stale);
        assert!(!rounds.is_settled());
        rounds.arrive(fresh);
        assert!(rounds.is_settled());
    }

    #[test]
    fn new_round_reopens_the_gate() {
        let rounds = ActivationRounds::new(1);
        rounds.arrive(0);
        assert!(rounds.is_settled());

        rounds.begin();
        assert!(!rounds.is_settled());
    }

    #[tokio::test]
    async fn waiter_is_released_by_the_last_arrival() {
        let rounds = std::sync::Arc::new(ActivationRounds::new(1));
        let waiter = {
            let rounds = std::sync::Arc::clone(&rounds);
            tokio::spawn(async move { rounds.settled().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        rounds.arrive(0);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
