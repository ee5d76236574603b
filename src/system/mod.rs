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

use std::{future::Future, sync::Arc, time::Duration};

use crate::{Error, Result};

/// Publish-subscribe fan-out
pub mod publisher;
pub use publisher::{Publisher, PublisherPtr, Subscription};

/// Cooperatively cancellable background task
pub mod stoppable_task;
pub use stoppable_task::{StoppableTask, StoppableTaskPtr};

/// Alias for the global executor threads share
pub type ExecutorPtr = Arc<smol::Executor<'static>>;

/// Sleep for any number of seconds.
pub async fn sleep(seconds: u64) {
    smol::Timer::after(Duration::from_secs(seconds)).await;
}

/// Sleep for any number of milliseconds.
pub async fn msleep(millis: u64) {
    smol::Timer::after(Duration::from_millis(millis)).await;
}

/// Run a future until it completes or the given duration elapses,
/// whichever comes first. The losing future is dropped.
pub async fn io_timeout<T, F>(duration: Duration, f: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let timer = async {
        smol::Timer::after(duration).await;
        Err(Error::TimedOut)
    };

    smol::future::or(f, timer).await
}
