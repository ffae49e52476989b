/*
 * Copyright (c) 2024-2025 Elide Technologies, Inc.
 *
 * Licensed under the MIT license (the "License"); you may not use this file except in compliance
 * with the License. You may obtain a copy of the License at
 *
 *   https://opensource.org/license/mit/
 *
 * Unless required by applicable law or agreed to in writing, software distributed under the License is distributed on
 * an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. See the
 * License for the specific language governing permissions and limitations under the License.
 */

//! Bounded blocking queues.
//!
//! All inter-worker traffic moves through these; every blocking entry point takes a timeout so
//! cancellation latency stays bounded.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A bounded FIFO with timed blocking push/pop.
pub(crate) struct BoundedQueue<T> {
  items: Mutex<VecDeque<T>>,
  readable: Condvar,
  writable: Condvar,
  capacity: usize,
}

impl<T> BoundedQueue<T> {
  pub fn new(capacity: usize) -> BoundedQueue<T> {
    let capacity = capacity.max(1);
    BoundedQueue {
      items: Mutex::new(VecDeque::with_capacity(capacity)),
      readable: Condvar::new(),
      writable: Condvar::new(),
      capacity,
    }
  }

  /// Append without blocking; hands the item back when the queue is full.
  pub fn try_push(&self, item: T) -> Result<(), T> {
    let mut items = self.items.lock().unwrap();
    if items.len() >= self.capacity {
      return Err(item);
    }
    items.push_back(item);
    self.readable.notify_one();
    Ok(())
  }

  /// Append, waiting up to `timeout` for space; hands the item back on timeout.
  pub fn push_timeout(&self, item: T, timeout: Duration) -> Result<(), T> {
    let items = self.items.lock().unwrap();
    let (mut items, result) = self
      .writable
      .wait_timeout_while(items, timeout, |items| items.len() >= self.capacity)
      .unwrap();
    if result.timed_out() && items.len() >= self.capacity {
      return Err(item);
    }
    items.push_back(item);
    self.readable.notify_one();
    Ok(())
  }

  /// Remove the head, waiting up to `timeout` for an item.
  pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
    let items = self.items.lock().unwrap();
    let (mut items, _) = self
      .readable
      .wait_timeout_while(items, timeout, |items| items.is_empty())
      .unwrap();
    let item = items.pop_front();
    if item.is_some() {
      self.writable.notify_one();
    }
    item
  }

  /// Discard everything queued; returns how many items were dropped.
  pub fn flush(&self) -> usize {
    let mut items = self.items.lock().unwrap();
    let dropped = items.len();
    items.clear();
    if dropped > 0 {
      self.writable.notify_all();
    }
    dropped
  }

  pub fn len(&self) -> usize {
    self.items.lock().unwrap().len()
  }

  pub fn is_full(&self) -> bool {
    self.len() >= self.capacity
  }
}

/// Single-use rendezvous between one command submitter and the send worker.
///
/// The submitter owns the slot; the send worker writes it at most once. A delivery into an
/// abandoned slot is dropped on the floor, which is harmless.
pub(crate) struct ResponseSlot {
  cell: Mutex<Option<Bytes>>,
  ready: Condvar,
}

impl ResponseSlot {
  pub fn new() -> ResponseSlot {
    ResponseSlot {
      cell: Mutex::new(None),
      ready: Condvar::new(),
    }
  }

  /// Deposit the response; only the first write lands.
  pub fn deliver(&self, data: Bytes) {
    let mut cell = self.cell.lock().unwrap();
    if cell.is_none() {
      *cell = Some(data);
      self.ready.notify_one();
    }
  }

  /// Wait up to `timeout` for the response.
  pub fn wait(&self, timeout: Duration) -> Option<Bytes> {
    let cell = self.cell.lock().unwrap();
    let (mut cell, _) = self
      .ready
      .wait_timeout_while(cell, timeout, |cell| cell.is_none())
      .unwrap();
    cell.take()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::thread;

  #[test]
  fn test_fifo_order() {
    let queue = BoundedQueue::new(4);
    queue.try_push(1).unwrap();
    queue.try_push(2).unwrap();
    queue.try_push(3).unwrap();
    assert_eq!(queue.pop_timeout(Duration::ZERO), Some(1));
    assert_eq!(queue.pop_timeout(Duration::ZERO), Some(2));
    assert_eq!(queue.pop_timeout(Duration::ZERO), Some(3));
    assert_eq!(queue.pop_timeout(Duration::ZERO), None);
  }

  #[test]
  fn test_try_push_full_returns_item() {
    let queue = BoundedQueue::new(1);
    queue.try_push(7).unwrap();
    assert!(queue.is_full());
    assert_eq!(queue.try_push(8), Err(8));
  }

  #[test]
  fn test_pop_timeout_empty() {
    let queue: BoundedQueue<u8> = BoundedQueue::new(1);
    let start = std::time::Instant::now();
    assert_eq!(queue.pop_timeout(Duration::from_millis(50)), None);
    assert!(start.elapsed() >= Duration::from_millis(45));
  }

  #[test]
  fn test_push_timeout_unblocks_on_pop() {
    let queue = Arc::new(BoundedQueue::new(1));
    queue.try_push(1u8).unwrap();
    let popper = {
      let queue = Arc::clone(&queue);
      thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        queue.pop_timeout(Duration::ZERO)
      })
    };
    assert_eq!(queue.push_timeout(2, Duration::from_secs(2)), Ok(()));
    assert_eq!(popper.join().unwrap(), Some(1));
    assert_eq!(queue.pop_timeout(Duration::ZERO), Some(2));
  }

  #[test]
  fn test_flush_counts_dropped() {
    let queue = BoundedQueue::new(8);
    for n in 0..5 {
      queue.try_push(n).unwrap();
    }
    assert_eq!(queue.flush(), 5);
    assert_eq!(queue.len(), 0);
  }

  #[test]
  fn test_response_slot_delivery() {
    let slot = Arc::new(ResponseSlot::new());
    let writer = {
      let slot = Arc::clone(&slot);
      thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        slot.deliver(Bytes::from_static(b"ok"));
        // a second delivery into an occupied slot is dropped
        slot.deliver(Bytes::from_static(b"late"));
      })
    };
    writer.join().unwrap();
    assert_eq!(slot.wait(Duration::from_secs(2)), Some(Bytes::from_static(b"ok")));
    assert_eq!(slot.wait(Duration::from_millis(10)), None);
  }

  #[test]
  fn test_response_slot_timeout() {
    let slot = ResponseSlot::new();
    assert_eq!(slot.wait(Duration::from_millis(30)), None);
  }
}
