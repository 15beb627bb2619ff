//! The in-memory backend: a mutexed map with condition-variable wakeups.
//!
//! Process-local and non-persistent; mostly useful for tests and for
//! workloads that only want in-process coalescing. Waiters block on a
//! condvar that every state change signals, so in-process coalescing does
//! not poll.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Condvar, Mutex};

use crate::entry::{Blob, Claim, Entry};
use crate::error::BackendError;
use crate::key::Fingerprint;

use super::{Backend, WaitOutcome};

#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<Fingerprint, Entry>>,
    changed: Condvar,
}

impl MemoryBackend {
    pub fn new() -> MemoryBackend {
        MemoryBackend::default()
    }
}

impl Backend for MemoryBackend {
    fn get(&self, key: &Fingerprint) -> Result<Option<Entry>, BackendError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&self, key: &Fingerprint, value: Blob, timestamp: SystemTime)
        -> Result<(), BackendError> {
        let mut entries = self.entries.lock();
        entries.insert(*key, Entry::published(value, timestamp));
        self.changed.notify_all();
        Ok(())
    }

    fn publish(
        &self,
        key: &Fingerprint,
        claim: Claim,
        value: Blob,
        timestamp: SystemTime,
    ) -> Result<bool, BackendError> {
        let mut entries = self.entries.lock();
        let held = entries
            .get(key)
            .is_some_and(|entry| entry.claim == Some(claim.0));
        if held {
            entries.insert(*key, Entry::published(value, timestamp));
            self.changed.notify_all();
        }
        Ok(held)
    }

    fn mark_in_flight(&self, key: &Fingerprint) -> Result<Option<Claim>, BackendError> {
        let mut entries = self.entries.lock();
        let now = SystemTime::now();
        match entries.get_mut(key) {
            Some(entry) if entry.in_flight => Ok(None),
            Some(entry) => {
                let claim = Claim::next();
                *entry = entry.clone().with_claim(claim, now);
                Ok(Some(claim))
            }
            None => {
                let claim = Claim::next();
                entries.insert(*key, Entry::claimed(claim, now));
                Ok(Some(claim))
            }
        }
    }

    fn clear_in_flight(&self, key: &Fingerprint) -> Result<(), BackendError> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            if entry.has_value() {
                *entry = entry.clone().released();
            } else {
                entries.remove(key);
            }
            self.changed.notify_all();
        }
        Ok(())
    }

    fn clear_all_in_flight(&self) -> Result<(), BackendError> {
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| entry.has_value());
        for entry in entries.values_mut() {
            *entry = entry.clone().released();
        }
        self.changed.notify_all();
        Ok(())
    }

    fn mark_stale(&self, key: &Fingerprint) -> Result<bool, BackendError> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if !entry.stale => {
                entry.stale = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn clear_stale(&self, key: &Fingerprint) -> Result<(), BackendError> {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.stale = false;
        }
        Ok(())
    }

    fn clear(&self, key: &Fingerprint) -> Result<(), BackendError> {
        self.entries.lock().remove(key);
        self.changed.notify_all();
        Ok(())
    }

    fn clear_all(&self) -> Result<(), BackendError> {
        self.entries.lock().clear();
        self.changed.notify_all();
        Ok(())
    }

    fn wait_until_ready(
        &self,
        key: &Fingerprint,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome, BackendError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut entries = self.entries.lock();
        loop {
            match entries.get(key) {
                None => return Ok(WaitOutcome::Gone),
                Some(entry) if !entry.in_flight => return Ok(WaitOutcome::Ready(entry.clone())),
                Some(_) => {}
            }
            match deadline {
                None => self.changed.wait(&mut entries),
                Some(deadline) => {
                    let result = self.changed.wait_until(&mut entries, deadline);
                    if result.timed_out() {
                        return Ok(WaitOutcome::TimedOut);
                    }
                }
            }
        }
    }

    fn delete_stale_entries(&self, older_than: Duration) -> Result<(), BackendError> {
        let now = SystemTime::now();
        self.entries.lock().retain(|_, entry| {
            entry.in_flight || entry.age(now).map_or(true, |age| age <= older_than)
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(byte: u8) -> Fingerprint {
        Fingerprint::from_bytes([byte; 32])
    }

    #[test]
    fn single_producer_wins_the_claim() {
        let backend = MemoryBackend::new();
        let k = key(1);
        let claim = backend.mark_in_flight(&k).unwrap();
        assert!(claim.is_some());
        assert!(backend.mark_in_flight(&k).unwrap().is_none());

        backend.clear_in_flight(&k).unwrap();
        assert!(backend.mark_in_flight(&k).unwrap().is_some());
    }

    #[test]
    fn publish_requires_live_claim() {
        let backend = MemoryBackend::new();
        let k = key(2);
        let claim = backend.mark_in_flight(&k).unwrap().unwrap();

        backend.clear(&k).unwrap();
        let stored = backend
            .publish(&k, claim, b"late".to_vec(), SystemTime::now())
            .unwrap();
        assert!(!stored);
        assert!(backend.get(&k).unwrap().is_none());
    }

    #[test]
    fn waiters_wake_on_publish() {
        let backend = Arc::new(MemoryBackend::new());
        let k = key(3);
        let claim = backend.mark_in_flight(&k).unwrap().unwrap();

        let waiter = {
            let backend = Arc::clone(&backend);
            std::thread::spawn(move || backend.wait_until_ready(&k, Some(Duration::from_secs(5))))
        };

        std::thread::sleep(Duration::from_millis(50));
        backend
            .publish(&k, claim, b"7".to_vec(), SystemTime::now())
            .unwrap();

        match waiter.join().unwrap().unwrap() {
            WaitOutcome::Ready(entry) => assert_eq!(entry.value.as_deref(), Some(&b"7"[..])),
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[test]
    fn wait_times_out() {
        let backend = MemoryBackend::new();
        let k = key(4);
        backend.mark_in_flight(&k).unwrap().unwrap();
        match backend
            .wait_until_ready(&k, Some(Duration::from_millis(50)))
            .unwrap()
        {
            WaitOutcome::TimedOut => {}
            other => panic!("expected TimedOut, got {other:?}"),
        }
    }

    #[test]
    fn wait_reports_cleared_entry() {
        let backend = Arc::new(MemoryBackend::new());
        let k = key(5);
        backend.mark_in_flight(&k).unwrap().unwrap();

        let waiter = {
            let backend = Arc::clone(&backend);
            std::thread::spawn(move || backend.wait_until_ready(&k, Some(Duration::from_secs(5))))
        };
        std::thread::sleep(Duration::from_millis(50));
        backend.clear(&k).unwrap();

        match waiter.join().unwrap().unwrap() {
            WaitOutcome::Gone => {}
            other => panic!("expected Gone, got {other:?}"),
        }
    }

    #[test]
    fn stale_flag_is_acquired_once() {
        let backend = MemoryBackend::new();
        let k = key(6);
        backend.put(&k, b"1".to_vec(), SystemTime::now()).unwrap();
        assert!(backend.mark_stale(&k).unwrap());
        assert!(!backend.mark_stale(&k).unwrap());
        backend.clear_stale(&k).unwrap();
        assert!(backend.mark_stale(&k).unwrap());
    }

    #[test]
    fn delete_stale_entries_keeps_fresh() {
        let backend = MemoryBackend::new();
        let now = SystemTime::now();
        backend.put(&key(7), b"old".to_vec(), now - Duration::from_secs(60)).unwrap();
        backend.put(&key(8), b"new".to_vec(), now).unwrap();
        backend.delete_stale_entries(Duration::from_secs(30)).unwrap();
        assert!(backend.get(&key(7)).unwrap().is_none());
        assert!(backend.get(&key(8)).unwrap().is_some());
    }
}
