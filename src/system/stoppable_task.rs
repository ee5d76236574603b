/* This file is part of AnoNet (https://anonet.dev)
 *
 * Copyright (C) 2023-2025 AnoNet developers
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::{future::Future, sync::Mutex};

use log::debug;

use super::ExecutorPtr;
use crate::{Error, Result};

pub type StoppableTaskPtr = std::sync::Arc<StoppableTask>;

/// A task that can be prematurely (and cooperatively) stopped at any time.
///
/// ```ignore
/// let task = StoppableTask::new();
/// task.clone().start(
///     my_method(),
///     |result| self_.handle_stop(result),
///     Error::MyStopError,
///     executor,
/// );
/// ```
///
/// Then at any time we can call `task.stop()` to close the task.
pub struct StoppableTask {
    stop_send: smol::channel::Sender<()>,
    stop_recv: smol::channel::Receiver<()>,
    task: Mutex<Option<smol::Task<()>>>,
}

impl StoppableTask {
    pub fn new() -> StoppableTaskPtr {
        let (stop_send, stop_recv) = smol::channel::bounded(1);
        std::sync::Arc::new(Self { stop_send, stop_recv, task: Mutex::new(None) })
    }

    /// Starts the task.
    ///
    /// * `main` is a function of the type `async fn foo() -> Result<()>`
    /// * `stop_handler` is called with the result when `main` returns or
    ///   the task is stopped
    /// * `stop_value` is the error code passed to `stop_handler` when
    ///   `stop()` is invoked
    pub fn start<'a, MainFut, StopFut, StopFn>(
        self: std::sync::Arc<Self>,
        main: MainFut,
        stop_handler: StopFn,
        stop_value: Error,
        executor: &ExecutorPtr,
    ) where
        MainFut: Future<Output = Result<()>> + Send + 'static,
        StopFut: Future<Output = ()> + Send + 'static,
        StopFn: FnOnce(Result<()>) -> StopFut + Send + 'static,
    {
        let stop_recv = self.stop_recv.clone();

        let task = executor.spawn(async move {
            let stop_fut = async {
                let _ = stop_recv.recv().await;
                Err(stop_value)
            };

            let result = smol::future::or(main, stop_fut).await;
            stop_handler(result).await;
        });

        *self.task.lock().unwrap() = Some(task);
    }

    /// Stops the task and waits until it winds down.
    pub async fn stop(self: std::sync::Arc<Self>) {
        debug!(target: "system::stoppable_task", "StoppableTask::stop()");

        // A full queue means a stop is already pending.
        let _ = self.stop_send.try_send(());

        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    #[test]
    fn stop_terminates_loop() {
        let executor: ExecutorPtr = Arc::new(smol::Executor::new());
        let finished = Arc::new(AtomicBool::new(false));

        let task = StoppableTask::new();
        let finished_ = finished.clone();
        task.clone().start(
            async {
                loop {
                    super::super::msleep(10).await;
                }
            },
            move |res| async move {
                assert!(matches!(res, Err(Error::DetachedTaskStopped)));
                finished_.store(true, Ordering::SeqCst);
            },
            Error::DetachedTaskStopped,
            &executor,
        );

        smol::block_on(executor.run(async {
            super::super::msleep(50).await;
            task.stop().await;
        }));

        assert!(finished.load(Ordering::SeqCst));
    }
}
