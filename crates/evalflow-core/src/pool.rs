//! Bounded-parallelism execution over a finite list of items.
//!
//! `parallelism == 1` runs the block inline, in input order, with no channel and
//! no spawned tasks. Above that, `(index, item)` pairs are fed through a bounded
//! channel to a fixed set of spawned workers; closing the channel is the
//! completion signal. `Collect` places every result at its input index, so the
//! output order never depends on completion order.

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Result};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::EvalError;

pub const MAX_PARALLELISM: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Run the block for its side effects; results are dropped.
    Each,
    /// Return every result, in input order.
    Collect,
}

/// Why a worker stopped early.
enum Halt {
    Error(anyhow::Error),
    Panic(Box<dyn Any + Send + 'static>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPool {
    parallelism: usize,
}

impl WorkerPool {
    pub fn new(parallelism: usize) -> Result<Self, EvalError> {
        if parallelism == 0 || parallelism > MAX_PARALLELISM {
            return Err(EvalError::InvalidParallelism {
                value: parallelism,
                max: MAX_PARALLELISM,
            });
        }
        Ok(Self { parallelism })
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub async fn each<T, F, Fut>(&self, items: impl IntoIterator<Item = T>, block: F) -> Result<()>
    where
        T: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.run(items, Strategy::Each, block).await.map(|_| ())
    }

    pub async fn collect<T, R, F, Fut>(&self, items: impl IntoIterator<Item = T>, block: F) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.run(items, Strategy::Collect, block).await
    }

    /// Run `block` over every item. The first error (or panic) from any block is
    /// returned once all workers have stopped; workers take no new items after it.
    /// With `Strategy::Each` the returned vector is empty.
    pub async fn run<T, R, F, Fut>(
        &self,
        items: impl IntoIterator<Item = T>,
        strategy: Strategy,
        block: F,
    ) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let items: Vec<T> = items.into_iter().collect();
        let collect = strategy == Strategy::Collect;

        if self.parallelism == 1 || items.len() <= 1 {
            let mut results = Vec::with_capacity(if collect { items.len() } else { 0 });
            for item in items {
                let result = block(item).await?;
                if collect {
                    results.push(result);
                }
            }
            return Ok(results);
        }

        let total = items.len();
        let workers = self.parallelism.min(total);
        let block = Arc::new(block);
        let slots: Arc<Mutex<Vec<Option<R>>>> = Arc::new(Mutex::new(if collect {
            (0..total).map(|_| None).collect()
        } else {
            Vec::new()
        }));
        let failed = Arc::new(AtomicBool::new(false));

        let (tx, rx) = mpsc::channel::<(usize, T)>(workers);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let handles: Vec<JoinHandle<Result<(), Halt>>> = (0..workers)
            .map(|_| {
                let rx = rx.clone();
                let block = block.clone();
                let slots = slots.clone();
                let failed = failed.clone();
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some((index, item)) = next else {
                            break;
                        };
                        if failed.load(Ordering::SeqCst) {
                            break;
                        }
                        match AssertUnwindSafe(block(item)).catch_unwind().await {
                            Ok(Ok(result)) => {
                                if collect {
                                    slots.lock().unwrap_or_else(PoisonError::into_inner)[index] = Some(result);
                                }
                            }
                            Ok(Err(err)) => {
                                failed.store(true, Ordering::SeqCst);
                                return Err(Halt::Error(err));
                            }
                            Err(payload) => {
                                failed.store(true, Ordering::SeqCst);
                                return Err(Halt::Panic(payload));
                            }
                        }
                    }
                    Ok(())
                })
            })
            .collect();
        // Workers hold the only receivers; once they all exit, sends fail.
        drop(rx);

        for pair in items.into_iter().enumerate() {
            if tx.send(pair).await.is_err() {
                break;
            }
        }
        drop(tx);

        let mut first_halt = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(halt)) => {
                    first_halt.get_or_insert(halt);
                }
                Err(join_err) if join_err.is_panic() => {
                    first_halt.get_or_insert(Halt::Panic(join_err.into_panic()));
                }
                Err(join_err) => {
                    first_halt.get_or_insert(Halt::Error(anyhow!(join_err)));
                }
            }
        }
        match first_halt {
            Some(Halt::Error(err)) => return Err(err),
            Some(Halt::Panic(payload)) => panic::resume_unwind(payload),
            None => {}
        }

        if !collect {
            return Ok(Vec::new());
        }
        let slots = std::mem::take(&mut *slots.lock().unwrap_or_else(PoisonError::into_inner));
        slots
            .into_iter()
            .collect::<Option<Vec<R>>>()
            .ok_or_else(|| anyhow!("worker pool finished with unfilled result slots"))
    }
}
