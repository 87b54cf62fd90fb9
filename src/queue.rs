// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Bounded FIFO connecting pipeline stages on different threads.

use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use kanal::{Receiver, Sender};
use tracing::debug;

/// Whether an end of the queue waits when it cannot make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockMode {
    #[default]
    Blocking,
    NonBlocking,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome<T> {
    Pushed,
    /// Non-blocking push into a full queue; the item is handed back.
    Full(T),
    /// The queue is being torn down; the item is handed back.
    Exit(T),
}

#[derive(Debug, PartialEq, Eq)]
pub enum PopOutcome<T> {
    Item(T),
    /// Non-blocking pop from an empty queue.
    Empty,
    /// The queue is being torn down.
    Exit,
}

/// Thread-safe bounded FIFO with an independent [`BlockMode`] per end.
///
/// Items travel over a bounded `kanal` channel. Producers first take a slot
/// token from a second channel pre-filled with `capacity` tokens, so a
/// producer that is turned away still owns its item and can hand it back.
///
/// [`AsyncQueue::set_wait_exit`] releases every blocked producer and consumer
/// with an `Exit` outcome. It is meant for shutdown only and is permanent.
///
/// ```
/// use edgefirst_codec::queue::{AsyncQueue, BlockMode, PopOutcome, PushOutcome};
///
/// let queue = AsyncQueue::new(1, BlockMode::NonBlocking, BlockMode::NonBlocking);
/// assert_eq!(queue.push(1), PushOutcome::Pushed);
/// assert_eq!(queue.push(2), PushOutcome::Full(2));
/// assert_eq!(queue.pop(), PopOutcome::Item(1));
/// assert_eq!(queue.pop(), PopOutcome::Empty);
/// ```
pub struct AsyncQueue<T> {
    items_tx: Sender<T>,
    items_rx: Receiver<T>,
    slots_tx: Sender<()>,
    slots_rx: Receiver<()>,
    // items still queued when teardown started, kept for drain()
    leftover_tx: Sender<T>,
    leftover_rx: Receiver<T>,
    exiting: AtomicBool,
    capacity: usize,
    push_mode: BlockMode,
    pop_mode: BlockMode,
}

impl<T> AsyncQueue<T> {
    pub fn new(capacity: usize, push_mode: BlockMode, pop_mode: BlockMode) -> Self {
        let capacity = capacity.max(1);
        let (items_tx, items_rx) = kanal::bounded(capacity);
        let (slots_tx, slots_rx) = kanal::bounded(capacity);
        for _ in 0..capacity {
            let _ = slots_tx.try_send(());
        }
        let (leftover_tx, leftover_rx) = kanal::unbounded();
        Self {
            items_tx,
            items_rx,
            slots_tx,
            slots_rx,
            leftover_tx,
            leftover_rx,
            exiting: AtomicBool::new(false),
            capacity,
            push_mode,
            pop_mode,
        }
    }

    pub fn push(&self, item: T) -> PushOutcome<T> {
        if self.is_exiting() {
            return PushOutcome::Exit(item);
        }
        let slot = match self.push_mode {
            BlockMode::Blocking => self.slots_rx.recv().map(Some),
            BlockMode::NonBlocking => self.slots_rx.try_recv(),
        };
        match slot {
            Ok(Some(())) => {}
            Ok(None) => return PushOutcome::Full(item),
            Err(_) => return PushOutcome::Exit(item),
        }

        let mut item = Some(item);
        match self.items_tx.try_send_option(&mut item) {
            Ok(true) => PushOutcome::Pushed,
            result => {
                let _ = self.slots_tx.try_send(());
                match (item, result) {
                    (Some(item), Ok(false)) => PushOutcome::Full(item),
                    (Some(item), _) => PushOutcome::Exit(item),
                    (None, _) => PushOutcome::Pushed,
                }
            }
        }
    }

    pub fn pop(&self) -> PopOutcome<T> {
        if self.is_exiting() {
            return PopOutcome::Exit;
        }
        let item = match self.pop_mode {
            BlockMode::Blocking => self.items_rx.recv().map(Some),
            BlockMode::NonBlocking => self.items_rx.try_recv(),
        };
        match item {
            Ok(Some(item)) => {
                let _ = self.slots_tx.try_send(());
                PopOutcome::Item(item)
            }
            Ok(None) => PopOutcome::Empty,
            Err(_) => PopOutcome::Exit,
        }
    }

    /// Starts teardown: closes both channels, waking every blocked producer
    /// and consumer. Items still queued are kept for [`AsyncQueue::drain`].
    pub fn set_wait_exit(&self) {
        if self.exiting.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.slots_rx.close();
        while let Ok(Some(item)) = self.items_rx.try_recv() {
            let _ = self.leftover_tx.send(item);
        }
        let _ = self.items_rx.close();
        debug!("queue wait-exit");
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    /// Removes every queued item, used to release handles after teardown.
    pub fn drain(&self) -> Vec<T> {
        let mut items = Vec::new();
        while let Ok(Some(item)) = self.leftover_rx.try_recv() {
            items.push(item);
        }
        while let Ok(Some(item)) = self.items_rx.try_recv() {
            let _ = self.slots_tx.try_send(());
            items.push(item);
        }
        items
    }

    pub fn len(&self) -> usize {
        if self.is_exiting() {
            return self.leftover_rx.len();
        }
        self.items_rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push_mode(&self) -> BlockMode {
        self.push_mode
    }

    pub fn pop_mode(&self) -> BlockMode {
        self.pop_mode
    }
}

impl<T> fmt::Debug for AsyncQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AsyncQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("push_mode", &self.push_mode)
            .field("pop_mode", &self.pop_mode)
            .field("exiting", &self.is_exiting())
            .finish()
    }
}
