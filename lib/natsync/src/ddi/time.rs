// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Periodic callbacks.

use core::time::Duration;
use std::io;
use std::sync::mpsc;
use std::sync::mpsc::RecvTimeoutError;
use std::thread::JoinHandle;

/// Execute a callback periodically.
///
/// The `Box<T>` is owned by the periodic itself and the callback is
/// passed an `&mut T` from a dedicated thread. The callback is never
/// run concurrently with itself.
///
/// Dropping the periodic stops the thread and waits for any
/// in-flight callback to return.
///
/// NOTE: A periodic **cannot** implement `Clone` as it represents a
/// unique resource on the system.
#[derive(Debug)]
pub struct Periodic {
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Periodic {
    /// Create a new periodic.
    ///
    /// The first callback fires one `interval` after creation.
    pub fn new<T: Send + 'static>(
        name: &str,
        cb: fn(&mut T),
        arg: Box<T>,
        interval: Duration,
    ) -> io::Result<Self> {
        let (stop, stop_rx) = mpsc::channel::<()>();
        let mut arg = arg;

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => cb(&mut arg),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;

        Ok(Self {
            stop: Some(stop),
            thread: Some(thread),
        })
    }
}

impl Drop for Periodic {
    fn drop(&mut self) {
        // Hanging up the channel wakes the thread immediately.
        drop(self.stop.take());

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
