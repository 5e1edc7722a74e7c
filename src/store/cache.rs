//-
// Copyright (c) 2020, 2022, Jason Lingle
//
// This file is part of Maildepot.
//
// Maildepot is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Maildepot is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Maildepot. If not, see <http://www.gnu.org/licenses/>.

//! Shared cache of fully-rendered (CRLF-normalized) message content.
//!
//! FETCH of `RFC822`/`BODY[]` needs the complete wire rendering of a
//! message, which is expensive to produce; clients habitually fetch the
//! same message several times in quick succession. Entries are keyed by
//! UID, reference-counted, and expire on a TTL.
//!
//! Entry lifecycle: `absent → present(ref=0) ⇄ present(ref>0)`, evicted
//! only at `ref == 0` once the deadline has passed. The sweep thread is
//! owned by the instance: started in [`Cache::new`], woken through the
//! cache's own condvar, and joined in [`Cache::close`]. On close every
//! entry is dropped regardless of reference count — no entry survives
//! shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::support::error::Error;

struct Entry {
    bytes: Arc<Vec<u8>>,
    refs: u64,
    deadline: Instant,
}

struct State {
    entries: HashMap<u64, Entry>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    wake: Condvar,
    ttl: Duration,
    sweep_interval: Duration,
}

pub struct Cache {
    shared: Arc<Shared>,
    sweeper: Option<thread::JoinHandle<()>>,
}

impl Cache {
    pub fn new(ttl: Duration, sweep_interval: Duration) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                entries: HashMap::new(),
                shutdown: false,
            }),
            wake: Condvar::new(),
            ttl,
            sweep_interval,
        });

        let sweeper = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("cache-sweep".to_owned())
                .spawn(move || run_sweeper(&shared))
                .expect("failed to spawn cache sweeper")
        };

        Cache {
            shared,
            sweeper: Some(sweeper),
        }
    }

    /// Ensure an entry for `id` exists, rendering through `render` if it
    /// does not, and refresh its TTL. Returns the entry's size in bytes.
    pub fn update_with(
        &self,
        id: u64,
        render: impl FnOnce() -> Result<Vec<u8>, Error>,
    ) -> Result<u64, Error> {
        // Render outside the lock only if needed; probe first.
        {
            let mut state = self.shared.state.lock().unwrap();
            if let Some(entry) = state.entries.get_mut(&id) {
                entry.deadline = Instant::now() + self.shared.ttl;
                return Ok(entry.bytes.len() as u64);
            }
        }

        let bytes = Arc::new(render()?);
        let size = bytes.len() as u64;

        let mut state = self.shared.state.lock().unwrap();
        // A concurrent renderer may have raced us; keep whichever is
        // already installed so outstanding references stay consistent.
        state.entries.entry(id).or_insert_with(|| Entry {
            bytes,
            refs: 0,
            deadline: Instant::now() + self.shared.ttl,
        });
        Ok(size)
    }

    /// Take a reference to the content for `id`, refreshing its TTL.
    ///
    /// Every successful `get_mem` must be paired with [`Cache::unref_mem`]
    /// once the bytes are no longer needed; an entry with outstanding
    /// references is never swept, even past its deadline.
    pub fn get_mem(&self, id: u64) -> Option<Arc<Vec<u8>>> {
        let mut state = self.shared.state.lock().unwrap();
        let ttl = self.shared.ttl;
        state.entries.get_mut(&id).map(|entry| {
            entry.refs += 1;
            entry.deadline = Instant::now() + ttl;
            Arc::clone(&entry.bytes)
        })
    }

    pub fn unref_mem(&self, id: u64) {
        let mut state = self.shared.state.lock().unwrap();
        match state.entries.get_mut(&id) {
            Some(entry) if entry.refs > 0 => entry.refs -= 1,
            Some(_) => warn!("cache unref {} without matching ref", id),
            None => (),
        }
    }

    /// Force-evict `id` regardless of its reference count.
    ///
    /// Used when the stored content was invalidated; the caller ensures no
    /// concurrent reader is relying on the entry staying current.
    pub fn clear(&self, id: u64) {
        let mut state = self.shared.state.lock().unwrap();
        state.entries.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        0 == self.len()
    }

    /// Stop the sweeper and drop every entry unconditionally.
    ///
    /// Idempotent; also run on `Drop`. Outstanding `Arc` handles from
    /// `get_mem` keep their bytes alive but the entries themselves are
    /// gone.
    pub fn close(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.entries.clear();
        }
        self.shared.wake.notify_all();
        if let Some(sweeper) = self.sweeper.take() {
            let _ = sweeper.join();
        }
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_sweeper(shared: &Shared) {
    let mut state = shared.state.lock().unwrap();
    while !state.shutdown {
        let (next, timeout) = shared
            .wake
            .wait_timeout(state, shared.sweep_interval)
            .unwrap();
        state = next;

        if !state.shutdown && timeout.timed_out() {
            sweep(&mut state, Instant::now());
        }
    }
}

fn sweep(state: &mut State, now: Instant) {
    let before = state.entries.len();
    state
        .entries
        .retain(|_, entry| entry.refs > 0 || entry.deadline > now);
    let evicted = before - state.entries.len();
    if evicted > 0 {
        debug!("cache sweep evicted {} of {} entries", evicted, before);
    }
}
