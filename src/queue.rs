// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crossbeam_channel::{Receiver, Sender};

/// Creates a bounded pipeline of the given capacity.
///
/// Producers block when the pipeline is full; consumers block when it is
/// empty. Dropping the last sender ends the stream; dropping the receiver
/// aborts waiting producers with [`crate::Error::QueueAborted`].
#[must_use]
pub fn pipeline<T>(capacity: usize) -> (PipeSender<T>, PipeReceiver<T>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (PipeSender(tx), PipeReceiver(rx))
}

/// A single-value rendezvous used to hand one task's result downstream in
/// submission order.
#[must_use]
pub fn oneshot<T>() -> (PipeSender<T>, PipeReceiver<T>) {
    pipeline(1)
}

/// Producer half of a bounded pipeline.
pub struct PipeSender<T>(Sender<T>);

impl<T> Clone for PipeSender<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> PipeSender<T> {
    /// Blocking send; fails when the consumer is gone.
    pub fn send(&self, value: T) -> crate::Result<()> {
        self.0.send(value).map_err(|_| crate::Error::QueueAborted)
    }
}

/// Consumer half of a bounded pipeline.
pub struct PipeReceiver<T>(Receiver<T>);

impl<T> PipeReceiver<T> {
    /// Blocking receive; `None` once every producer is done.
    #[must_use]
    pub fn recv(&self) -> Option<T> {
        self.0.recv().ok()
    }
}

impl<T> Iterator for PipeReceiver<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.recv()
    }
}

#[cfg(test)]
mod tests {
    use super::pipeline;
    use test_log::test;

    #[test]
    fn stream_ends_when_producers_finish() {
        let (tx, rx) = pipeline::<u32>(2);

        let producer = std::thread::spawn(move || {
            for i in 0..10 {
                tx.send(i).unwrap();
            }
        });

        let collected: Vec<u32> = rx.collect();
        producer.join().unwrap();
        assert_eq!((0..10).collect::<Vec<_>>(), collected);
    }

    #[test]
    fn dropped_consumer_aborts_producers() {
        let (tx, rx) = pipeline::<u32>(1);
        drop(rx);
        assert!(tx.send(1).is_err());
    }

    #[test]
    fn capacity_blocks_producers_until_drained() {
        let (tx, rx) = pipeline::<u32>(1);
        tx.send(1).unwrap();

        let producer = std::thread::spawn(move || {
            tx.send(2).unwrap();
            tx.send(3).unwrap();
        });

        assert_eq!(Some(1), rx.recv());
        assert_eq!(Some(2), rx.recv());
        assert_eq!(Some(3), rx.recv());
        assert_eq!(None, rx.recv());
        producer.join().unwrap();
    }
}
