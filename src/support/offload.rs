//-
// Copyright (c) 2020, Jason Lingle
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

//! Command offload for storage-bound work.
//!
//! The event loop driving sessions is single-threaded; SEARCH and FETCH
//! commands can spend a long time waiting on the mail store. The host may
//! hand such work to an [`Offload`] so the I/O thread stays responsive.
//! At most one job per session may be in flight at a time — the session
//! object is not designed for concurrent mutation — which the host enforces
//! by not feeding a session further input until its job's result has been
//! drained from the result channel.
//!
//! The worker pool is an owned resource: threads start in [`Offload::new`]
//! and are joined when the value is dropped.

use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use log::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct Offload {
    send: Option<Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl Offload {
    /// Start a pool of `threads` workers.
    pub fn new(threads: usize) -> Self {
        let (send, recv) = channel::unbounded::<Job>();
        let workers = (0..threads.max(1))
            .map(|n| {
                let recv: Receiver<Job> = recv.clone();
                thread::Builder::new()
                    .name(format!("offload-{}", n))
                    .spawn(move || {
                        for job in recv.iter() {
                            job();
                        }
                        debug!("offload-{} draining complete", n);
                    })
                    .expect("failed to spawn offload worker")
            })
            .collect();

        Offload {
            send: Some(send),
            workers,
        }
    }

    /// Queue `job` for execution on a worker thread.
    ///
    /// Jobs deliver their results themselves, normally through a crossbeam
    /// channel paired with the host's wakeup mechanism.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        self.send
            .as_ref()
            .expect("execute() after close")
            .send(Box::new(job))
            .expect("offload workers gone");
    }
}

impl Drop for Offload {
    fn drop(&mut self) {
        // Closing the channel lets the workers drain and exit.
        self.send = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn executes_jobs_and_joins() {
        let (send, recv) = channel::unbounded();
        {
            let offload = Offload::new(2);
            for i in 0..16 {
                let send = send.clone();
                offload.execute(move || {
                    send.send(i).unwrap();
                });
            }
            // Dropping joins the workers, so all jobs have run.
        }

        let mut results = recv.try_iter().collect::<Vec<i32>>();
        results.sort_unstable();
        assert_eq!((0..16).collect::<Vec<i32>>(), results);
    }
}
