//! In-process worker group: one member per thread

use std::sync::{Arc, Condvar, Mutex};

use super::Communicator;
use crate::error::SyncError;

#[derive(Debug)]
struct Round {
    generation: u64,
    arrived: usize,
    slots: Vec<Option<Vec<u8>>>,
    published: Arc<Vec<Vec<u8>>>,
    aborted: bool,
}

#[derive(Debug)]
struct Shared {
    round: Mutex<Round>,
    turned: Condvar,
}

/// Member of a group whose members are threads of this process
#[derive(Debug)]
pub struct LocalGroup {
    rank: usize,
    size: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Create all `size` members; hand one to each thread
    pub fn new(size: usize) -> Vec<LocalGroup> {
        let size = size.max(1);
        let shared = Arc::new(Shared {
            round: Mutex::new(Round {
                generation: 0,
                arrived: 0,
                slots: vec![None; size],
                published: Arc::new(Vec::new()),
                aborted: false,
            }),
            turned: Condvar::new(),
        });

        (0..size)
            .map(|rank| LocalGroup {
                rank,
                size,
                shared: shared.clone(),
            })
            .collect()
    }
}

impl Communicator for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn exchange(&mut self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>, SyncError> {
        let mut round = self.shared.round.lock().map_err(|_| SyncError::Poisoned)?;
        if round.aborted {
            return Err(SyncError::Aborted);
        }

        let generation = round.generation;
        round.slots[self.rank] = Some(payload);
        round.arrived += 1;

        if round.arrived == self.size {
            // Every member of the previous round has read `published`
            // before arriving here, so it can be replaced.
            let gathered: Vec<Vec<u8>> = round
                .slots
                .iter_mut()
                .map(|slot| slot.take().unwrap_or_default())
                .collect();
            round.published = Arc::new(gathered);
            round.arrived = 0;
            round.generation += 1;
            self.shared.turned.notify_all();
            return Ok(round.published.as_ref().clone());
        }

        while round.generation == generation && !round.aborted {
            round = self
                .shared
                .turned
                .wait(round)
                .map_err(|_| SyncError::Poisoned)?;
        }
        if round.generation == generation {
            return Err(SyncError::Aborted);
        }
        Ok(round.published.as_ref().clone())
    }

    fn abort(&mut self) {
        if let Ok(mut round) = self.shared.round.lock() {
            round.aborted = true;
        }
        self.shared.turned.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_all_gather_across_threads() {
        let handles: Vec<_> = LocalGroup::new(3)
            .into_iter()
            .map(|mut member| {
                thread::spawn(move || {
                    let mut rounds = Vec::new();
                    for round in 0..5u8 {
                        let gathered = member.exchange(vec![member.rank() as u8, round]).unwrap();
                        rounds.push(gathered);
                    }
                    rounds
                })
            })
            .collect();

        for handle in handles {
            let rounds = handle.join().unwrap();
            for (round, gathered) in rounds.iter().enumerate() {
                let expected: Vec<Vec<u8>> =
                    (0..3u8).map(|rank| vec![rank, round as u8]).collect();
                assert_eq!(gathered, &expected);
            }
        }
    }

    #[test]
    fn test_abort_releases_waiters() {
        let mut members = LocalGroup::new(2);
        let mut second = members.pop().unwrap();
        let mut first = members.pop().unwrap();

        let waiter = thread::spawn(move || first.barrier());
        thread::sleep(std::time::Duration::from_millis(20));
        second.abort();

        assert!(matches!(waiter.join().unwrap(), Err(SyncError::Aborted)));
        assert!(matches!(second.barrier(), Err(SyncError::Aborted)));
    }

    #[test]
    fn test_single_member() {
        let mut members = LocalGroup::new(1);
        let gathered = members[0].exchange(b"solo".to_vec()).unwrap();
        assert_eq!(gathered, vec![b"solo".to_vec()]);
    }
}
