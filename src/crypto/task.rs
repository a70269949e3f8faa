//! The DH task pipeline between the event loop and the crypto workers.
//!
//! A task carries everything the worker needs; the worker never looks up
//! protocol state. Ownership of the DH private key moves event loop ->
//! task -> event loop, with the source nulled before the destination is
//! written at each hop. A task whose state has meanwhile been deleted is
//! dropped on arrival without invoking its continuation; drop wipes the
//! key material.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::crypto::dh::DhSecret;
use crate::crypto::{CryptoError, SymKey};
use crate::engine::state::SerialNumber;

pub type TaskId = u64;

/// What to do on the event loop once the shared secret is in hand.
/// Tagged variants instead of a callback pointer: the tag names the
/// exchange step, the dispatcher owns the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhContinuation {
    /// IKEv2 responder: build and send the IKE_SA_INIT reply.
    V2SaInitResponder,
    /// IKEv2 initiator: key the SA and send IKE_AUTH.
    V2SaInitInitiator,
    /// IKEv1 phase 1: run the SKEYID ladder.
    V1PhaseOne,
    /// IKEv1 quick mode with PFS.
    V1Quick,
}

pub struct DhTask {
    pub task_id: TaskId,
    pub serial: SerialNumber,
    pub remote_ke: Vec<u8>,
    pub local_secret: Option<DhSecret>,
    pub shared_secret: Option<Result<SymKey, CryptoError>>,
    pub continuation: DhContinuation,
}

impl DhTask {
    /// Worker-side compute step. Touches only task-local data.
    fn compute(&mut self) {
        let result = match self.local_secret.as_mut() {
            Some(secret) => secret.compute_shared(&self.remote_ke),
            None => Err(CryptoError::SecretConsumed),
        };
        self.shared_secret = Some(result);
    }
}

impl std::fmt::Debug for DhTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhTask")
            .field("task_id", &self.task_id)
            .field("serial", &self.serial)
            .field("continuation", &self.continuation)
            .field("computed", &self.shared_secret.is_some())
            .finish()
    }
}

/// Fixed pool of compute threads fed from an internal queue. Completed
/// tasks are pushed onto the completion channel in completion order; the
/// event loop drains that channel.
pub struct CryptoPool {
    submit_tx: Option<mpsc::Sender<DhTask>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl CryptoPool {
    pub fn spawn(
        workers: usize,
        completions: tokio::sync::mpsc::UnboundedSender<DhTask>,
    ) -> Self {
        let workers = workers.max(1);
        let (submit_tx, submit_rx) = mpsc::channel::<DhTask>();
        let submit_rx = Arc::new(Mutex::new(submit_rx));

        let mut handles = Vec::with_capacity(workers);
        for n in 0..workers {
            let rx = Arc::clone(&submit_rx);
            let done = completions.clone();
            let handle = thread::Builder::new()
                .name(format!("crypto-{}", n))
                .spawn(move || loop {
                    let task = {
                        let guard = rx.lock().expect("crypto queue poisoned");
                        guard.recv()
                    };
                    match task {
                        Ok(mut task) => {
                            tracing::trace!(
                                "crypto worker {} computing task {} for {}",
                                n,
                                task.task_id,
                                task.serial
                            );
                            task.compute();
                            if done.send(task).is_err() {
                                // Event loop is gone; nothing left to do.
                                break;
                            }
                        }
                        Err(_) => break, // queue closed, shut down
                    }
                })
                .expect("failed to spawn crypto worker");
            handles.push(handle);
        }

        tracing::debug!("started {} crypto worker threads", handles.len());
        CryptoPool {
            submit_tx: Some(submit_tx),
            workers: handles,
        }
    }

    pub fn submit(&self, task: DhTask) {
        if let Some(tx) = &self.submit_tx {
            if tx.send(task).is_err() {
                tracing::error!("crypto pool queue closed, dropping task");
            }
        }
    }

    /// Close the queue and join the workers.
    pub fn shutdown(&mut self) {
        self.submit_tx = None;
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for CryptoPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::dh::{DhGroup, DhSecret};

    #[tokio::test]
    async fn pool_computes_and_delivers() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let pool = CryptoPool::spawn(2, tx);

        let peer = DhSecret::generate(DhGroup::Curve25519).unwrap();
        let local = DhSecret::generate(DhGroup::Curve25519).unwrap();
        let expected_public = local.public_value().to_vec();

        pool.submit(DhTask {
            task_id: 1,
            serial: SerialNumber(7),
            remote_ke: peer.public_value().to_vec(),
            local_secret: Some(local),
            shared_secret: None,
            continuation: DhContinuation::V2SaInitInitiator,
        });

        let task = rx.recv().await.expect("completion");
        assert_eq!(task.task_id, 1);
        assert_eq!(task.serial, SerialNumber(7));
        let secret = task.local_secret.as_ref().expect("secret travels with task");
        assert_eq!(secret.public_value(), &expected_public[..]);
        assert!(task.shared_secret.unwrap().is_ok());
        drop(pool);
    }

    #[tokio::test]
    async fn completions_arrive_for_every_submission() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let pool = CryptoPool::spawn(3, tx);

        let peer = DhSecret::generate(DhGroup::EcpP256).unwrap();
        for i in 0..8u64 {
            pool.submit(DhTask {
                task_id: i,
                serial: SerialNumber(i + 100),
                remote_ke: peer.public_value().to_vec(),
                local_secret: Some(DhSecret::generate(DhGroup::EcpP256).unwrap()),
                shared_secret: None,
                continuation: DhContinuation::V2SaInitResponder,
            });
        }

        let mut seen = std::collections::HashSet::new();
        for _ in 0..8 {
            let task = rx.recv().await.expect("completion");
            assert!(task.shared_secret.as_ref().unwrap().is_ok());
            seen.insert(task.task_id);
        }
        assert_eq!(seen.len(), 8);
        drop(pool);
    }
}
