//! Asynchronous event notification dispatch
//!
//! Each session queues AENs under its own lock and is handed to a small pool
//! of worker threads at most once at a time: a report only schedules the
//! session when its queue is [`Idle`](DispatchState::Idle). A worker drains
//! the queue in FIFO order, rescans the session's adapter for each item and
//! acknowledges the item back to the engine.
//!
//! Every accepted item is acknowledged exactly once, either by a worker or by
//! the cleanup drain that runs during session teardown. Items popped after
//! the session's `unregistering` latch is set are acknowledged without a
//! rescan; an item popped before the latch flips may still finish its rescan.

use crate::engine::{Aen, AenKind, InitiatorHost, TargetEngine};
use crate::error::{LoopbackError, LoopbackResult};
use crate::session::{AenItem, AenState, DispatchState, Session, SessionHandle};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

/// Side effects of consuming an AEN item
struct Delivery {
    engine: Arc<dyn TargetEngine>,
    host: Arc<dyn InitiatorHost>,
}

impl Delivery {
    /// Worker entry for a scheduled session
    fn run(&self, session: &Session) {
        let mut state = session.lock_aen();
        if state.dispatch != DispatchState::Scheduled {
            // Cancelled by teardown after it was queued
            log::debug!("Skipping cancelled AEN work for session {}", session.number());
            return;
        }
        state.dispatch = DispatchState::Draining;

        log::debug!("AEN work for session {}", session.number());
        let mut state = self.process(session, state, false);
        state.dispatch = DispatchState::Idle;
        drop(state);
        session.notify_aen_idle();
    }

    /// Pop and consume items until the queue is empty
    ///
    /// Called and returns with the AEN lock held; the lock is released
    /// around the rescan and the acknowledgement.
    fn process<'a>(
        &self,
        session: &'a Session,
        mut state: MutexGuard<'a, AenState>,
        cleanup_only: bool,
    ) -> MutexGuard<'a, AenState> {
        while let Some(AenItem { aen }) = state.pending.pop_front() {
            let rescan = if cleanup_only || state.unregistering {
                None
            } else {
                state.adapter
            };
            drop(state);

            match rescan {
                Some(adapter) => {
                    log::debug!(
                        "Session {}: rescanning {} for AEN {:?}",
                        session.number(),
                        adapter,
                        aen
                    );
                    self.host.scan_target(adapter);
                }
                None => log::debug!("Session {}: discarding AEN {:?}", session.number(), aen),
            }
            self.engine.aen_done(aen);

            state = session.lock_aen();
        }
        state
    }
}

/// Pool of AEN worker threads
pub struct EventDispatcher {
    delivery: Arc<Delivery>,
    queue: Mutex<Option<Sender<SessionHandle>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl EventDispatcher {
    /// Spawn `workers` threads
    pub fn start(
        workers: usize,
        engine: Arc<dyn TargetEngine>,
        host: Arc<dyn InitiatorHost>,
    ) -> LoopbackResult<Self> {
        let delivery = Arc::new(Delivery { engine, host });
        let (tx, rx) = mpsc::channel::<SessionHandle>();
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let rx = Arc::clone(&rx);
            let delivery = Arc::clone(&delivery);
            let handle = thread::Builder::new()
                .name(format!("loopback-aen-{}", i))
                .spawn(move || worker_loop(rx, delivery))
                .map_err(|e| {
                    LoopbackError::ResourceExhausted(format!("unable to spawn AEN worker: {}", e))
                });
            match handle {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    drop(tx);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(e);
                }
            }
        }
        log::debug!("AEN dispatcher started with {} worker(s)", workers);

        Ok(EventDispatcher {
            delivery,
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        })
    }

    /// Queue a notification for a session
    ///
    /// Fails with `NotSupported` for non-SCSI events and for sessions that
    /// are unregistering; in both cases the engine keeps ownership of the
    /// notification.
    pub fn report(&self, session: &SessionHandle, aen: Aen) -> LoopbackResult<()> {
        if let AenKind::Other(event) = aen.kind {
            log::debug!("Unsupported AEN {}", event);
            return Err(LoopbackError::NotSupported(format!("AEN event {}", event)));
        }

        let schedule = {
            let mut state = session.lock_aen();
            if state.unregistering {
                return Err(LoopbackError::NotSupported(format!(
                    "session {} is unregistering",
                    session.number()
                )));
            }
            state.pending.try_reserve(1).map_err(|e| {
                LoopbackError::ResourceExhausted(format!("AEN queue: {}", e))
            })?;
            state.pending.push_back(AenItem { aen: aen.handle });

            let idle = state.dispatch == DispatchState::Idle;
            if idle {
                state.dispatch = DispatchState::Scheduled;
            }
            idle
        };

        if schedule {
            self.schedule(session);
        }
        Ok(())
    }

    fn schedule(&self, session: &SessionHandle) {
        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let sent = match queue.as_ref() {
            Some(tx) => tx.send(Arc::clone(session)).is_ok(),
            None => false,
        };
        if !sent {
            // Left Scheduled; the teardown drain acknowledges the items
            log::error!(
                "AEN dispatcher stopped, session {} work left for teardown",
                session.number()
            );
        }
    }

    /// Stop AEN processing for an unregistering session and discard what
    /// is still queued
    ///
    /// Cancels scheduled work, waits for a running worker to finish, then
    /// acknowledges the remaining items without rescanning.
    pub fn cancel_and_drain(&self, session: &Session) {
        let mut state = session.lock_aen();
        if !state.unregistering {
            log::warn!("Draining AENs of session {} which is not unregistering", session.number());
        }
        if state.dispatch == DispatchState::Scheduled {
            state.dispatch = DispatchState::Idle;
        }
        let state = session.wait_aen_idle(state);

        let remaining = state.pending.len();
        let state = self.delivery.process(session, state, true);
        drop(state);

        if remaining > 0 {
            log::debug!("Session {}: discarded {} queued AEN(s)", session.number(), remaining);
        }
    }

    /// Stop the worker threads once every session is gone
    pub fn shutdown(&self) {
        let tx = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(tx);

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            if worker.join().is_err() {
                log::error!("AEN worker panicked");
            }
        }
        log::debug!("AEN dispatcher stopped");
    }
}

fn worker_loop(rx: Arc<Mutex<Receiver<SessionHandle>>>, delivery: Arc<Delivery>) {
    loop {
        let next = {
            let rx = rx.lock().unwrap_or_else(PoisonError::into_inner);
            rx.recv()
        };
        match next {
            Ok(session) => delivery.run(&session),
            Err(_) => break,
        }
    }
}
