use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

use super::dispatcher::{Claim, DispatchOutcome, TriggerDispatcher};
use super::evaluator::{ConditionEvaluator, CrossingRules};
use crate::models::{EstimateFilter, PriceTick};
use crate::Result;

struct Worker {
    sender: mpsc::Sender<PriceTick>,
    handle: JoinHandle<()>,
}

/// Per-symbol tick processing
///
/// Each symbol gets its own task, fed through a bounded channel, so ticks of
/// one symbol are evaluated in order while symbols run in parallel. Gateway
/// calls run on tasks spawned by the worker and never stall its tick loop.
pub struct Engine {
    dispatcher: TriggerDispatcher,
    rules: CrossingRules,
    tick_buffer: usize,
    workers: Mutex<HashMap<String, Worker>>,
    shutdown: watch::Sender<bool>,
}

impl Engine {
    pub fn new(dispatcher: TriggerDispatcher, rules: CrossingRules, tick_buffer: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            dispatcher,
            rules,
            tick_buffer: tick_buffer.max(1),
            workers: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Receiver that flips to `true` once shutdown starts
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.workers.lock().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Queue a tick for its symbol's worker
    ///
    /// Returns `false` when the tick was dropped: its price is not a
    /// positive finite number, or shutdown has started.
    pub async fn submit(&self, tick: PriceTick) -> bool {
        if !tick.has_valid_price() {
            tracing::warn!(symbol = %tick.symbol, price = tick.price, "Dropping tick with invalid price");
            return false;
        }

        let sender = {
            let mut workers = self.workers.lock();
            // Checked under the lock so no worker is added after shutdown drains the map
            if self.is_shutting_down() {
                return false;
            }
            workers
                .entry(tick.symbol.clone())
                .or_insert_with(|| self.spawn_worker(&tick.symbol))
                .sender
                .clone()
        };

        sender.send(tick).await.is_ok()
    }

    fn spawn_worker(&self, symbol: &str) -> Worker {
        let (sender, receiver) = mpsc::channel(self.tick_buffer);
        let handle = tokio::spawn(run_worker(
            symbol.to_string(),
            receiver,
            self.dispatcher.clone(),
            self.rules,
        ));

        tracing::info!(symbol = %symbol, "Started symbol worker");
        Worker { sender, handle }
    }

    /// Stop intake and wait for every worker and in-flight dispatch
    ///
    /// Ticks already queued are still evaluated. Every estimate is left at
    /// a settled status once this returns.
    pub async fn shutdown(&self) {
        let workers: Vec<(String, Worker)> = {
            let mut workers = self.workers.lock();
            self.shutdown.send_replace(true);
            workers.drain().collect()
        };
        tracing::info!(workers = workers.len(), "Shutting down engine");

        for (symbol, worker) in workers {
            drop(worker.sender);
            if let Err(e) = worker.handle.await {
                tracing::error!(symbol = %symbol, error = %e, "Symbol worker panicked");
            }
        }

        tracing::info!("Engine stopped");
    }
}

async fn run_worker(
    symbol: String,
    mut receiver: mpsc::Receiver<PriceTick>,
    dispatcher: TriggerDispatcher,
    rules: CrossingRules,
) {
    let mut evaluator = ConditionEvaluator::new(&symbol, rules);
    let mut in_flight: JoinSet<Result<DispatchOutcome>> = JoinSet::new();
    let filter = EstimateFilter::active_for(&symbol);

    loop {
        tokio::select! {
            tick = receiver.recv() => {
                let Some(tick) = tick else { break };

                let estimates = match dispatcher.store().list(&filter).await {
                    Ok(estimates) => estimates,
                    Err(e) => {
                        tracing::error!(symbol = %symbol, error = %e, "Failed to load estimates");
                        continue;
                    }
                };

                for hit in evaluator.evaluate(&tick, &estimates) {
                    match dispatcher.claim(&hit).await {
                        Ok(Claim::Won) => {
                            let dispatcher = dispatcher.clone();
                            in_flight.spawn(async move { dispatcher.execute(&hit).await });
                        }
                        Ok(Claim::Lost) | Ok(Claim::Refused(_)) => {}
                        Err(e) => {
                            tracing::error!(
                                estimate_id = %hit.estimate.id,
                                symbol = %symbol,
                                error = %e,
                                "Claim failed"
                            );
                        }
                    }
                }
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                log_dispatch(&symbol, joined);
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        log_dispatch(&symbol, joined);
    }

    tracing::debug!(symbol = %symbol, "Symbol worker stopped");
}

fn log_dispatch(symbol: &str, joined: std::result::Result<Result<DispatchOutcome>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => tracing::error!(symbol = %symbol, error = %e, "Dispatch store failure"),
        Err(e) => tracing::error!(symbol = %symbol, error = %e, "Dispatch task panicked"),
    }
}
