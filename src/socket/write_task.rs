//! Write strategies for one flush cycle.
//!
//! A single leased buffer is written as is. Several buffers are first copied
//! into one scratch buffer so they go out with one syscall. Tasks are reused
//! through a [`WriteTaskArena`] owned by the dispatcher; a task that failed is
//! dropped instead of being reused.

use bytes::{Buf, Bytes, BytesMut};
use std::io::{self, ErrorKind, Write};

/// Result of one write attempt.
#[derive(Debug)]
pub(crate) enum TaskProgress {
    /// `n` bytes accepted; `complete` once nothing is left.
    Written { n: usize, complete: bool },
    WouldBlock,
    Failed(io::Error),
}

#[derive(Debug, Default)]
pub(crate) struct DirectWriteTask {
    buffer: Bytes,
    leased: Vec<Bytes>,
}

#[derive(Debug, Default)]
pub(crate) struct MergingWriteTask {
    scratch: BytesMut,
    offset: usize,
    leased: Vec<Bytes>,
}

#[derive(Debug)]
pub(crate) enum WriteTask {
    Empty,
    Direct(DirectWriteTask),
    Merging(MergingWriteTask),
}

impl WriteTask {
    /// Bytes not yet written.
    pub(crate) fn remaining(&self) -> usize {
        match self {
            WriteTask::Empty => 0,
            WriteTask::Direct(task) => task.buffer.len(),
            WriteTask::Merging(task) => task.scratch.len() - task.offset,
        }
    }

    /// Performs a single write syscall.
    pub(crate) fn write<W: Write>(&mut self, sink: &mut W) -> TaskProgress {
        let result = match self {
            WriteTask::Empty => return TaskProgress::Written { n: 0, complete: true },
            WriteTask::Direct(task) => loop {
                match sink.write(&task.buffer) {
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Ok(n) => {
                        task.buffer.advance(n);
                        break Ok(n);
                    }
                    other => break other,
                }
            },
            WriteTask::Merging(task) => loop {
                match sink.write(&task.scratch[task.offset..]) {
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Ok(n) => {
                        task.offset += n;
                        break Ok(n);
                    }
                    other => break other,
                }
            },
        };

        match result {
            Ok(0) if self.remaining() > 0 => TaskProgress::Failed(io::Error::new(
                ErrorKind::WriteZero,
                "socket accepted no bytes",
            )),
            Ok(n) => TaskProgress::Written {
                n,
                complete: self.remaining() == 0,
            },
            Err(err) if err.kind() == ErrorKind::WouldBlock => TaskProgress::WouldBlock,
            Err(err) => TaskProgress::Failed(err),
        }
    }

    /// Takes the buffers this task was created from.
    pub(crate) fn take_buffers(&mut self) -> Vec<Bytes> {
        match self {
            WriteTask::Empty => Vec::new(),
            WriteTask::Direct(task) => std::mem::take(&mut task.leased),
            WriteTask::Merging(task) => std::mem::take(&mut task.leased),
        }
    }
}

/// Per-dispatcher free list of write tasks, one slot per kind.
///
/// **Not thread-safe.** Owned and used by one dispatcher only.
#[derive(Debug, Default)]
pub(crate) struct WriteTaskArena {
    direct: Option<DirectWriteTask>,
    merging: Option<MergingWriteTask>,
}

impl WriteTaskArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Builds the task matching the shape of `leased`.
    pub(crate) fn new_task(&mut self, leased: Vec<Bytes>, send_buffer_size: usize) -> WriteTask {
        match leased.len() {
            0 => WriteTask::Empty,
            1 => {
                let mut task = self.direct.take().unwrap_or_default();
                task.buffer = leased[0].clone();
                task.leased = leased;
                WriteTask::Direct(task)
            }
            _ => {
                let mut task = self.merging.take().unwrap_or_default();
                let total: usize = leased.iter().map(Bytes::len).sum();
                task.scratch.clear();
                task.scratch.reserve(total.max(send_buffer_size));
                for buffer in &leased {
                    task.scratch.extend_from_slice(buffer);
                }
                task.offset = 0;
                task.leased = leased;
                WriteTask::Merging(task)
            }
        }
    }

    /// Returns a completed task to the arena.
    pub(crate) fn release(&mut self, task: WriteTask) {
        match task {
            WriteTask::Empty => {}
            WriteTask::Direct(mut task) => {
                task.buffer = Bytes::new();
                task.leased.clear();
                self.direct = Some(task);
            }
            WriteTask::Merging(mut task) => {
                task.scratch.clear();
                task.offset = 0;
                task.leased.clear();
                self.merging = Some(task);
            }
        }
    }

    #[cfg(test)]
    fn has_merging(&self) -> bool {
        self.merging.is_some()
    }
}
