use std::mem;
use std::time::{Duration, Instant};

use crossbeam_channel::{at, never, select, Receiver};

/// Collects the items received from `source` and hands them to `callback`
/// once `quiet_period` has elapsed since the first item of the batch. Items
/// arriving in the meantime join the batch without pushing the deadline back.
///
/// Returns when `stop` receives or disconnects, or once `source` disconnects,
/// in which case the pending batch is delivered first.
pub fn batch<T, F>(source: &Receiver<T>, quiet_period: Duration, stop: &Receiver<()>, mut callback: F)
where
    F: FnMut(Vec<T>),
{
    let mut pending = Vec::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let timer = deadline.map_or_else(never, at);
        select! {
            recv(stop) -> _ => return,
            recv(source) -> item => match item {
                Ok(item) => {
                    if deadline.is_none() {
                        deadline = Some(Instant::now() + quiet_period);
                    }
                    pending.push(item);
                }
                Err(_) => {
                    if !pending.is_empty() {
                        callback(mem::take(&mut pending));
                    }
                    return;
                }
            },
            recv(timer) -> _ => {
                deadline = None;
                callback(mem::take(&mut pending));
            }
        }
    }
}
