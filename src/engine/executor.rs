// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::any::type_name;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, trace, warn};

use super::config::ExecutorConfig;
use super::{EngineError, EngineResult, Shutdown};

/// Handler trait for executor tasks
pub trait TaskHandler<T>: Clone + Send + 'static + Sync {
    /// Handle one task
    fn handle(&self, task: T) -> impl Future<Output = ()> + Send;
}

/// Executor with multiple independent task channels.
///
/// Each channel has its own dedicated worker, so tasks routed to the
/// same channel are processed sequentially. The manager routes a
/// connection's work items by `connection_id % channel_count`, which is
/// what keeps at-most-one `work()` per connection cheap to enforce.
pub struct Executor<T> {
    notify_shutdown: broadcast::Sender<()>,
    _shutdown_complete_tx: mpsc::Sender<()>,
    channels: Arc<HashMap<i8, TaskChannel<T>>>,
    shutdown_flag: Arc<AtomicBool>,
}

#[derive(Debug)]
struct TaskChannel<T> {
    sender: async_channel::Sender<T>,
    receiver: async_channel::Receiver<T>,
}

#[derive(Debug)]
struct Worker {
    id: i8,
    handle: JoinHandle<()>,
}

impl<T: Send + 'static> Executor<T> {
    pub fn new<H: TaskHandler<T>>(
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
        handler: H,
        config: &ExecutorConfig,
    ) -> Self {
        let num_channels = if config.num_channels > 0 {
            config.num_channels
        } else {
            num_cpus::get().min(i8::MAX as usize) as i8
        };
        let channel_capacity = config.channel_capacity.max(1);
        let monitor_interval = Duration::from_secs(config.monitor_interval.max(1));
        let worker_check_timeout = Duration::from_millis(config.worker_check_timeout.max(1));

        let channels = Self::spawn_channels_with_monitor(
            num_channels,
            channel_capacity,
            monitor_interval,
            worker_check_timeout,
            notify_shutdown.clone(),
            handler,
        );

        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let flag = shutdown_flag.clone();
        let mut shutdown = Shutdown::new(notify_shutdown.subscribe());
        tokio::spawn(async move {
            shutdown.recv().await;
            flag.store(true, Ordering::SeqCst);
        });

        Self {
            notify_shutdown,
            _shutdown_complete_tx: shutdown_complete_tx,
            channels,
            shutdown_flag,
        }
    }

    /// Route a task to the given channel, waiting while it is full.
    pub async fn dispatch(&self, task: T, channel_id: i8) -> EngineResult<()> {
        let channel = self
            .channels
            .get(&channel_id)
            .ok_or_else(|| EngineError::IllegalState(format!("channel {} not found", channel_id)))?;
        channel
            .sender
            .send(task)
            .await
            .map_err(|e| EngineError::ChannelSend(e.to_string()))
    }

    /// Non-blocking dispatch. `Ok(Some(task))` hands the task back when
    /// the channel is full so the caller can decide what to do with it.
    pub fn try_dispatch(&self, task: T, channel_id: i8) -> EngineResult<Option<T>> {
        let channel = self
            .channels
            .get(&channel_id)
            .ok_or_else(|| EngineError::IllegalState(format!("channel {} not found", channel_id)))?;
        match channel.sender.try_send(task) {
            Ok(()) => Ok(None),
            Err(async_channel::TrySendError::Full(task)) => Ok(Some(task)),
            Err(async_channel::TrySendError::Closed(_)) => {
                Err(EngineError::ChannelSend("executor channel closed".into()))
            }
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn notify_shutdown(&self) -> &broadcast::Sender<()> {
        &self.notify_shutdown
    }

    fn spawn_channels_with_monitor<H: TaskHandler<T>>(
        num_channels: i8,
        channel_capacity: usize,
        monitor_interval: Duration,
        worker_check_timeout: Duration,
        notify_shutdown: broadcast::Sender<()>,
        handler: H,
    ) -> Arc<HashMap<i8, TaskChannel<T>>> {
        let mut workers = Vec::with_capacity(num_channels as usize);
        let mut channels = HashMap::with_capacity(num_channels as usize);

        // one dedicated worker per channel
        for id in 0..num_channels {
            let (sender, receiver) = async_channel::bounded(channel_capacity);
            let worker = Self::spawn_worker(
                id,
                handler.clone(),
                notify_shutdown.clone(),
                receiver.clone(),
            );
            workers.push(worker);
            channels.insert(
                id,
                TaskChannel {
                    sender,
                    receiver: receiver.clone(),
                },
            );
        }

        let channels = Arc::new(channels);
        let channels_clone = channels.clone();

        Self::spawn_monitor(
            workers,
            channels_clone,
            notify_shutdown,
            handler,
            monitor_interval,
            worker_check_timeout,
        );

        channels
    }

    fn spawn_worker<H: TaskHandler<T>>(
        id: i8,
        handler: H,
        notify_shutdown: broadcast::Sender<()>,
        receiver: async_channel::Receiver<T>,
    ) -> Worker {
        let mut shutdown = Shutdown::new(notify_shutdown.subscribe());

        let handle = tokio::spawn(async move {
            debug!("executor worker {id} started");

            loop {
                tokio::select! {
                    Ok(task) = receiver.recv() => {
                        handler.handle(task).await;
                    }
                    _ = shutdown.recv() => {
                        debug!("executor worker {id} shutting down");
                        break;
                    }
                }
            }
        });

        Worker { id, handle }
    }

    fn spawn_monitor<H: TaskHandler<T>>(
        mut workers: Vec<Worker>,
        channels: Arc<HashMap<i8, TaskChannel<T>>>,
        notify_shutdown: broadcast::Sender<()>,
        handler: H,
        monitor_interval: Duration,
        worker_check_timeout: Duration,
    ) {
        tokio::spawn(async move {
            let mut interval = time::interval(monitor_interval);
            let mut shutdown = Shutdown::new(notify_shutdown.subscribe());

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("executor monitor received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        for worker in &mut workers {
                            match time::timeout(worker_check_timeout, &mut worker.handle).await {
                                Ok(join_result) => {
                                    match join_result {
                                        Ok(_) => {
                                            warn!("executor worker {} completed unexpectedly", worker.id);
                                        }
                                        Err(err) => {
                                            if err.is_panic() {
                                                Self::log_worker_panic(worker.id, err);
                                            } else {
                                                error!("executor worker {} failed with non-panic error", worker.id);
                                            }
                                        }
                                    }

                                    let Some(channel) = channels.get(&worker.id) else {
                                        error!("executor worker {} has no channel, not restarted", worker.id);
                                        continue;
                                    };
                                    warn!("executor worker {} failed, restarting...", worker.id);
                                    *worker = Self::spawn_worker(
                                        worker.id,
                                        handler.clone(),
                                        notify_shutdown.clone(),
                                        channel.receiver.clone(),
                                    );
                                    debug!("executor worker {} restarted", worker.id);
                                }
                                Err(_) => {
                                    trace!("executor worker {} is running", worker.id);
                                }
                            }
                        }
                    }
                }
            }
            debug!("executor monitor exiting");
        });
    }

    fn log_worker_panic(worker_id: i8, err: tokio::task::JoinError) {
        let payload = err.into_panic();
        if let Some(message) = payload.downcast_ref::<&'static str>() {
            error!("executor worker {worker_id} panicked with message: {message}");
        } else if let Some(message) = payload.downcast_ref::<String>() {
            error!("executor worker {worker_id} panicked with message: {message}");
        } else {
            error!(
                "executor worker {worker_id} panicked with an unknown type: {}",
                get_type_name(&payload)
            );
        }
    }
}

#[inline]
fn get_type_name<R>(_: &R) -> &'static str {
    type_name::<R>()
}
