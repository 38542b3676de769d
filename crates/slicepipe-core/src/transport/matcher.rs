//! Message matching for one receiving stage
//!
//! Incoming messages are matched against posted receives by `(source, tag)`
//! in arrival order. A message without a posted receive waits in the
//! unexpected queue; a receive without a message waits in the posted queue.
//! Whichever side arrives second completes the match.

use crate::transport::Tag;
use crate::{Error, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

type Key = (usize, Tag);

struct Envelope {
    words: Vec<u64>,
    /// Raised once the envelope is matched, for senders that wait on it
    delivered: Option<Arc<AtomicBool>>,
}

impl Envelope {
    fn mark_delivered(&self) {
        if let Some(flag) = &self.delivered {
            flag.store(true, Ordering::Release);
        }
    }
}

#[derive(Default)]
struct MatchState {
    unexpected: HashMap<Key, VecDeque<Envelope>>,
    posted: HashMap<Key, VecDeque<u64>>,
    completed: HashMap<u64, Vec<u64>>,
    next_id: u64,
    closed: Option<String>,
}

pub(crate) struct Matcher {
    state: Mutex<MatchState>,
    changed: Condvar,
}

impl Matcher {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(MatchState::default()),
            changed: Condvar::new(),
        }
    }

    /// Hand an arriving message to the matching engine
    pub(crate) fn deliver(
        &self,
        source: usize,
        tag: Tag,
        words: Vec<u64>,
        delivered: Option<Arc<AtomicBool>>,
    ) {
        let mut state = self.state.lock();
        let key = (source, tag);
        let envelope = Envelope { words, delivered };
        match state.posted.get_mut(&key).and_then(|q| q.pop_front()) {
            Some(id) => {
                envelope.mark_delivered();
                state.completed.insert(id, envelope.words);
            }
            None => state.unexpected.entry(key).or_default().push_back(envelope),
        }
        drop(state);
        self.changed.notify_all();
    }

    /// Post a receive, returning its id
    pub(crate) fn post(&self, source: usize, tag: Tag) -> u64 {
        let mut state = self.state.lock();
        let key = (source, tag);
        let id = state.next_id;
        state.next_id += 1;
        match state.unexpected.get_mut(&key).and_then(|q| q.pop_front()) {
            Some(envelope) => {
                envelope.mark_delivered();
                state.completed.insert(id, envelope.words);
                drop(state);
                self.changed.notify_all();
            }
            None => state.posted.entry(key).or_default().push_back(id),
        }
        id
    }

    /// Take the message of receive `id` if it has arrived
    pub(crate) fn try_take(&self, id: u64) -> Result<Option<Vec<u64>>> {
        let mut state = self.state.lock();
        if let Some(words) = state.completed.remove(&id) {
            return Ok(Some(words));
        }
        match &state.closed {
            Some(reason) => Err(Error::Transport(reason.clone())),
            None => Ok(None),
        }
    }

    /// Block until the message of receive `id` has arrived
    pub(crate) fn take(&self, id: u64, timeout: Option<Duration>) -> Result<Vec<u64>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if let Some(words) = state.completed.remove(&id) {
                return Ok(words);
            }
            if let Some(reason) = &state.closed {
                return Err(Error::Transport(reason.clone()));
            }
            self.block(&mut state, deadline)?;
        }
    }

    /// Block until `flag` is raised by a match on this engine
    pub(crate) fn wait_flag(&self, flag: &AtomicBool, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if flag.load(Ordering::Acquire) {
                return Ok(());
            }
            if let Some(reason) = &state.closed {
                return Err(Error::Transport(reason.clone()));
            }
            self.block(&mut state, deadline)?;
        }
    }

    fn block(
        &self,
        state: &mut MutexGuard<'_, MatchState>,
        deadline: Option<Instant>,
    ) -> Result<()> {
        match deadline {
            None => {
                self.changed.wait(state);
                Ok(())
            }
            Some(deadline) => {
                if Instant::now() >= deadline {
                    return Err(Error::Transport("timed out waiting for a match".to_string()));
                }
                // a timeout is reported on the next turn, after one more check
                let _ = self.changed.wait_until(state, deadline);
                Ok(())
            }
        }
    }

    /// Withdraw posted receive `id`
    pub(crate) fn cancel_posted(&self, source: usize, tag: Tag, id: u64) {
        let mut state = self.state.lock();
        if let Some(q) = state.posted.get_mut(&(source, tag)) {
            q.retain(|&posted| posted != id);
        }
        state.completed.remove(&id);
    }

    /// Withdraw an unmatched message; false if it was already matched
    pub(crate) fn cancel_unexpected(
        &self,
        source: usize,
        tag: Tag,
        flag: &Arc<AtomicBool>,
    ) -> bool {
        let mut state = self.state.lock();
        let Some(q) = state.unexpected.get_mut(&(source, tag)) else {
            return false;
        };
        let position = q.iter().position(|e| {
            e.delivered
                .as_ref()
                .is_some_and(|delivered| Arc::ptr_eq(delivered, flag))
        });
        match position {
            Some(pos) => {
                q.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Fail every current and future wait
    pub(crate) fn close(&self, reason: impl Into<String>) {
        let mut state = self.state.lock();
        if state.closed.is_none() {
            state.closed = Some(reason.into());
        }
        drop(state);
        self.changed.notify_all();
    }

    /// Unmatched messages and unmatched receives
    pub(crate) fn pending(&self) -> (usize, usize) {
        let state = self.state.lock();
        (
            state.unexpected.values().map(VecDeque::len).sum(),
            state.posted.values().map(VecDeque::len).sum(),
        )
    }
}
