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

//! Shared executor harness for the end-to-end tests.

use std::{future::Future, sync::Arc};

use anonet::system::ExecutorPtr;

/// Spin up executor threads, run the test future, tear down.
pub fn run<F, Fut>(test: F)
where
    F: FnOnce(ExecutorPtr) -> Fut,
    Fut: Future<Output = ()>,
{
    init_logger();

    let ex: ExecutorPtr = Arc::new(smol::Executor::new());
    let (signal, shutdown) = smol::channel::unbounded::<()>();

    easy_parallel::Parallel::new()
        .each(0..4, {
            let ex = ex.clone();
            move |_| smol::block_on(ex.run(shutdown.recv()))
        })
        .finish(|| {
            smol::block_on(async {
                test(ex.clone()).await;
                drop(signal);
            })
        });
}

fn init_logger() {
    // Tests in one binary share the process; only the first init wins.
    let cfg = simplelog::ConfigBuilder::new().build();
    let _ = simplelog::TermLogger::init(
        simplelog::LevelFilter::Info,
        cfg,
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );
}
