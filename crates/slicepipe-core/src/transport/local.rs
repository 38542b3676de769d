//! In-process transport: every stage is a thread of the same process
//!
//! A send completes once the receiving stage has matched it with a posted
//! receive, so a slow consumer keeps the producer's sends in flight the way
//! a rendezvous protocol would. Messages a stage sends to itself are
//! buffered and complete at once.

use super::matcher::Matcher;
use super::{Completion, Tag, Transport};
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Builds the connected endpoints of an in-process pipeline
pub struct LocalFabric;

impl LocalFabric {
    /// One endpoint per stage; blocking waits never give up
    pub fn create(stage_count: usize) -> Vec<LocalTransport> {
        Self::build(stage_count, None)
    }

    /// One endpoint per stage; blocking waits fail after `timeout`
    pub fn create_with_timeout(stage_count: usize, timeout: Duration) -> Vec<LocalTransport> {
        Self::build(stage_count, Some(timeout))
    }

    fn build(stage_count: usize, timeout: Option<Duration>) -> Vec<LocalTransport> {
        let matchers: Arc<Vec<Matcher>> =
            Arc::new((0..stage_count).map(|_| Matcher::new()).collect());
        (0..stage_count)
            .map(|stage_id| LocalTransport {
                stage_id,
                matchers: Arc::clone(&matchers),
                timeout,
            })
            .collect()
    }
}

/// Endpoint of one stage
pub struct LocalTransport {
    stage_id: usize,
    matchers: Arc<Vec<Matcher>>,
    timeout: Option<Duration>,
}

/// Outstanding request on a [`LocalTransport`]
#[derive(Debug)]
pub enum LocalRequest {
    Send {
        dest: usize,
        tag: Tag,
        delivered: Arc<AtomicBool>,
    },
    Recv {
        source: usize,
        tag: Tag,
        id: u64,
        len: usize,
    },
}

impl LocalTransport {
    fn matcher(&self, stage: usize) -> Result<&Matcher> {
        self.matchers.get(stage).ok_or_else(|| {
            Error::Transport(format!(
                "stage {} outside fabric of {} stages",
                stage,
                self.matchers.len()
            ))
        })
    }

    /// Unmatched messages addressed to this stage and its unmatched receives
    pub fn pending(&self) -> (usize, usize) {
        self.matchers[self.stage_id].pending()
    }
}

fn check_len(tag: Tag, expected: usize, words: Vec<u64>) -> Result<Completion> {
    if words.len() != expected {
        return Err(Error::LengthMismatch {
            tag,
            expected,
            actual: words.len(),
        });
    }
    Ok(Completion::Received(words))
}

impl Transport for LocalTransport {
    type Request = LocalRequest;

    fn stage_id(&self) -> usize {
        self.stage_id
    }

    fn stage_count(&self) -> usize {
        self.matchers.len()
    }

    fn device_aware(&self) -> bool {
        true
    }

    fn isend(&mut self, dest: usize, tag: Tag, words: &[u64]) -> Result<LocalRequest> {
        let delivered = Arc::new(AtomicBool::new(dest == self.stage_id));
        self.matcher(dest)?
            .deliver(self.stage_id, tag, words.to_vec(), Some(Arc::clone(&delivered)));
        Ok(LocalRequest::Send {
            dest,
            tag,
            delivered,
        })
    }

    fn irecv(&mut self, source: usize, tag: Tag, len: usize) -> Result<LocalRequest> {
        self.matcher(source)?;
        let id = self.matcher(self.stage_id)?.post(source, tag);
        Ok(LocalRequest::Recv {
            source,
            tag,
            id,
            len,
        })
    }

    fn test(&mut self, request: &mut LocalRequest) -> Result<Option<Completion>> {
        match request {
            LocalRequest::Send { delivered, .. } => Ok(delivered
                .load(Ordering::Acquire)
                .then_some(Completion::Sent)),
            LocalRequest::Recv { tag, id, len, .. } => {
                match self.matcher(self.stage_id)?.try_take(*id)? {
                    Some(words) => check_len(*tag, *len, words).map(Some),
                    None => Ok(None),
                }
            }
        }
    }

    fn wait(&mut self, request: &mut LocalRequest) -> Result<Completion> {
        match request {
            LocalRequest::Send {
                dest, delivered, ..
            } => {
                self.matcher(*dest)?.wait_flag(delivered, self.timeout)?;
                Ok(Completion::Sent)
            }
            LocalRequest::Recv { tag, id, len, .. } => {
                let words = self.matcher(self.stage_id)?.take(*id, self.timeout)?;
                check_len(*tag, *len, words)
            }
        }
    }

    fn cancel(&mut self, request: LocalRequest) -> Result<()> {
        match request {
            LocalRequest::Send {
                dest,
                tag,
                delivered,
            } => {
                // a finished send cannot be withdrawn
                if !delivered.load(Ordering::Acquire) {
                    self.matcher(dest)?
                        .cancel_unexpected(self.stage_id, tag, &delivered);
                }
            }
            LocalRequest::Recv {
                source, tag, id, ..
            } => {
                self.matcher(self.stage_id)?.cancel_posted(source, tag, id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_completes_on_match() {
        let mut eps = LocalFabric::create(2);
        let mut b = eps.pop().unwrap();
        let mut a = eps.pop().unwrap();

        let mut send = a.isend(1, 4, &[1, 2, 3]).unwrap();
        assert_eq!(a.test(&mut send).unwrap(), None);

        let mut recv = b.irecv(0, 4, 3).unwrap();
        assert_eq!(a.test(&mut send).unwrap(), Some(Completion::Sent));
        assert_eq!(
            b.wait(&mut recv).unwrap(),
            Completion::Received(vec![1, 2, 3])
        );
    }

    #[test]
    fn test_length_mismatch() {
        let mut eps = LocalFabric::create(1);
        let mut a = eps.pop().unwrap();
        a.isend(0, 1, &[1, 2]).unwrap();
        let mut recv = a.irecv(0, 1, 3).unwrap();
        let err = a.test(&mut recv).unwrap_err();
        assert!(matches!(
            err,
            Error::LengthMismatch {
                expected: 3,
                actual: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_cancel_unmatched_send() {
        let mut eps = LocalFabric::create_with_timeout(2, Duration::from_millis(20));
        let mut b = eps.pop().unwrap();
        let mut a = eps.pop().unwrap();
        let send = a.isend(1, 2, &[7]).unwrap();
        assert_eq!(b.pending(), (1, 0));
        a.cancel(send).unwrap();
        assert_eq!(b.pending(), (0, 0));

        let mut recv = b.irecv(0, 2, 1).unwrap();
        assert!(b.wait(&mut recv).is_err());
    }

    #[test]
    fn test_unknown_stage() {
        let mut eps = LocalFabric::create(1);
        let mut a = eps.pop().unwrap();
        assert!(a.isend(3, 1, &[1]).is_err());
        assert!(a.irecv(3, 1, 1).is_err());
    }

    #[test]
    fn test_threads_exchange() {
        let mut eps = LocalFabric::create_with_timeout(2, Duration::from_secs(10));
        let mut b = eps.pop().unwrap();
        let mut a = eps.pop().unwrap();
        let consumer = std::thread::spawn(move || {
            let mut recv = b.irecv(0, 9, 2).unwrap();
            b.wait(&mut recv).unwrap()
        });
        let mut send = a.isend(1, 9, &[5, 6]).unwrap();
        assert_eq!(a.wait(&mut send).unwrap(), Completion::Sent);
        assert_eq!(
            consumer.join().unwrap(),
            Completion::Received(vec![5, 6])
        );
    }
}
