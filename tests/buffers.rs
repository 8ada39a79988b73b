//! Buffer Pool and Write Queue Tests

use bytes::Bytes;
use std::sync::Arc;
use std::thread;
use streamreactor::buffer::{merge, BufferChain, WriteQueue};
use streamreactor::memory::{SynchronizedPool, UnsynchronizedPool, GROWTH_FACTOR};

// ============================================================================
// Pools
// ============================================================================

#[test]
fn read_remainder_is_recycled() {
    let mut pool = UnsynchronizedPool::new(4096);
    let mut buffer = pool.acquire(1024);
    assert!(buffer.capacity() >= 4096);
    buffer.extend_from_slice(&[7u8; 100]);

    let data = pool.extract_and_recycle(buffer, 100, 1024);
    assert_eq!(data.len(), 100);
    assert_eq!(pool.stats().pooled, 1);

    // The remainder is handed out next and does not alias `data`.
    let mut next = pool.acquire(1024);
    next.extend_from_slice(&[9u8; 10]);
    assert_eq!(pool.stats().hits, 1);
    assert!(data.iter().all(|&b| b == 7));
}

#[test]
fn small_remainders_are_dropped() {
    let mut pool = UnsynchronizedPool::new(1024);
    let mut buffer = pool.acquire(16);
    buffer.extend_from_slice(&[0u8; 1000]);
    let _data = pool.extract_and_recycle(buffer, 1000, 512);
    assert_eq!(pool.stats().pooled, 0);
}

#[test]
fn oversized_request_allocates_with_growth() {
    let mut pool = UnsynchronizedPool::new(1024);
    let buffer = pool.acquire(4096);
    assert!(buffer.capacity() >= 4096 * GROWTH_FACTOR);
    assert_eq!(pool.stats().misses, 1);
}

#[test]
fn shared_pool_respects_capacity_and_shrinks() {
    let pool = SynchronizedPool::new(1024, 4);
    let buffers: Vec<_> = (0..6).map(|_| pool.acquire(512)).collect();
    for buffer in buffers {
        pool.recycle(buffer, 512);
    }
    assert_eq!(pool.stats().pooled, 4);

    assert_eq!(pool.shrink(), 2);
    assert_eq!(pool.stats().pooled, 2);
    assert_eq!(pool.shrink(), 1);
    assert_eq!(pool.shrink(), 1);
    assert_eq!(pool.shrink(), 0);
}

#[test]
fn shared_pool_is_usable_from_many_threads() {
    let pool = Arc::new(SynchronizedPool::new(2048, 16));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let pool = pool.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    let mut buffer = pool.acquire(1024);
                    buffer.extend_from_slice(b"payload");
                    let data = pool.extract_and_recycle(buffer, 7, 1024);
                    assert_eq!(&data[..], b"payload");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    let stats = pool.stats();
    assert_eq!(stats.hits + stats.misses, 400);
    assert!(stats.pooled <= 16);
}

// ============================================================================
// Buffer Chain
// ============================================================================

#[test]
fn chain_skips_empty_buffers() {
    let mut chain = BufferChain::new();
    chain.append(Bytes::new());
    chain.append(Bytes::from_static(b"ab"));
    chain.add_first(vec![Bytes::new(), Bytes::from_static(b"xy")]);
    assert_eq!(chain.buffer_count(), 2);
    assert_eq!(chain.size(), 4);

    let mut head = [0u8; 3];
    assert!(chain.peek_into(&mut head));
    assert_eq!(&head, b"xya");
    assert_eq!(merge(chain.drain()), Bytes::from_static(b"xyab"));
    assert!(chain.is_empty());
}

// ============================================================================
// Write Queue
// ============================================================================

fn queue_of(parts: &[&'static [u8]]) -> WriteQueue {
    let mut queue = WriteQueue::new();
    queue.append(parts.iter().map(|p| Bytes::from_static(p)).collect());
    queue
}

#[test]
fn lease_is_bounded_but_never_empty() {
    let mut queue = queue_of(&[b"0123456789", b"abc", b"def"]);

    let leased = queue.lease(4);
    assert_eq!(leased.len(), 1);
    assert_eq!(queue.leased_size(), 10);

    let leased = queue.lease(14);
    assert_eq!(leased.len(), 2);
    assert_eq!(queue.size(), 16);
}

#[test]
fn short_write_keeps_the_remainder() {
    let mut queue = queue_of(&[b"hello ", b"world"]);
    let leased = queue.lease(64);
    assert_eq!(merge(leased), Bytes::from_static(b"hello world"));

    queue.remove_leased(8);
    assert_eq!(queue.size(), 3);
    assert_eq!(queue.leased_size(), 3);

    let leased = queue.lease(64);
    assert_eq!(merge(leased), Bytes::from_static(b"rld"));
    queue.remove_leased(3);
    assert!(queue.is_empty());
}

#[test]
fn commit_never_exceeds_the_lease() {
    let mut queue = queue_of(&[b"abc", b"defgh"]);
    queue.lease(3);
    queue.remove_leased(100);
    assert_eq!(queue.size(), 5);
}

#[test]
fn add_first_requeues_ahead() {
    let mut queue = queue_of(&[b"second"]);
    queue.add_first(vec![Bytes::from_static(b"first ")]);
    assert_eq!(merge(queue.drain()), Bytes::from_static(b"first second"));
    assert_eq!(queue.leased_size(), 0);
}
