/*
   Copyright 2020 Ilya Grishkov

   Licensed under the Apache License, Version 2.0 (the "License");
   you may not use this file except in compliance with the License.
   You may obtain a copy of the License at

       http://www.apache.org/licenses/LICENSE-2.0

   Unless required by applicable law or agreed to in writing, software
   distributed under the License is distributed on an "AS IS" BASIS,
   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
   See the License for the specific language governing permissions and
   limitations under the License.
*/

use crate::error::{Error, Result};
use crate::TracerouteHop;
use async_std::channel::Receiver;
use async_std::task::block_on;
use futures::{pin_mut, select_biased, FutureExt};

/// How a run ended.
#[derive(Debug)]
pub(crate) enum Terminal {
    /// Every hop up to the last TTL was emitted.
    End,
    /// The run stopped early.
    Failed(Error),
}

/// Ordered hops of a running traceroute.
///
/// Yields one [`TracerouteHop`] per TTL, starting at 1 and without gaps, then either ends or
/// yields a single error. Implements [`Iterator`] by blocking on [`ResultSequence::next_hop`].
#[derive(Debug)]
pub struct ResultSequence {
    rows: Receiver<TracerouteHop>,
    terminal: Receiver<Terminal>,
    finished: bool,
}

impl ResultSequence {
    pub(crate) fn new(rows: Receiver<TracerouteHop>, terminal: Receiver<Terminal>) -> Self {
        ResultSequence {
            rows,
            terminal,
            finished: false,
        }
    }

    /// Waits for the next hop. `None` once the run is over.
    pub async fn next_hop(&mut self) -> Option<Result<TracerouteHop>> {
        if self.finished {
            return None;
        }
        let next = {
            let row = self.rows.recv().fuse();
            let terminal = self.terminal.recv().fuse();
            pin_mut!(row, terminal);
            // Rows go first so none is lost behind an end marker sent right after it.
            select_biased! {
                row = row => match row {
                    Ok(hop) => Some(Ok(hop)),
                    Err(_) => None,
                },
                terminal = terminal => Some(Err(terminal.ok())),
            }
        };
        match next {
            Some(Ok(hop)) => Some(Ok(hop)),
            Some(Err(terminal)) => self.finish(terminal),
            None => {
                // No more rows; a setup failure may still be waiting.
                let terminal = self.terminal.recv().await.ok();
                self.finish(terminal)
            }
        }
    }

    fn finish(&mut self, terminal: Option<Terminal>) -> Option<Result<TracerouteHop>> {
        self.finished = true;
        match terminal {
            Some(Terminal::Failed(e)) => Some(Err(e)),
            Some(Terminal::End) | None => None,
        }
    }
}

impl Iterator for ResultSequence {
    type Item = Result<TracerouteHop>;

    fn next(&mut self) -> Option<Self::Item> {
        block_on(self.next_hop())
    }
}
