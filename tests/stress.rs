// Multi-threaded traffic through one queue.
// Run with: cargo test --test stress -- --nocapture

mod common;

use common::*;
use memory_stats::memory_stats;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use surface_bufferqueue::Queue::Structs::FlushConfig;
use surface_bufferqueue::{Consumer, Fence, FenceSignal, GSError, Producer};

/// Flush `frames` buffers, cancelling some requests along the way.
fn produce(producer: &Producer, frames: u64, flushed: &AtomicU64) {
    let config = default_config().with_timeout(Duration::from_secs(5));
    let mut done = 0;
    while done < frames {
        let (buffer, fence) = match producer.request_buffer(&config) {
            Ok(granted) => granted,
            Err(GSError::NoBuffer) => continue,
            Err(e) => panic!("request failed: {e}"),
        };
        assert!(fence.wait(Some(Duration::from_secs(5))));
        if fastrand::u8(0..8) == 0 {
            producer.cancel_buffer(&buffer).unwrap();
            continue;
        }
        let write_done = FenceSignal::new();
        let acquire_fence = write_done.fence();
        write_done.signal();
        producer
            .flush_buffer(&buffer, acquire_fence, &FlushConfig::default())
            .unwrap();
        flushed.fetch_add(1, Relaxed);
        done += 1;
    }
}

/// Acquire and release until `total` frames were seen or the deadline passes.
fn consume(consumer: &Consumer, total: u64) -> u64 {
    let deadline = Instant::now() + Duration::from_secs(60);
    let mut seen = 0;
    while seen < total && Instant::now() < deadline {
        let acquired = match consumer.acquire_timeout(Some(Duration::from_millis(100))) {
            Ok(acquired) => acquired,
            Err(GSError::NoBuffer) => continue,
            Err(e) => panic!("acquire failed: {e}"),
        };
        assert!(acquired.fence.wait(Some(Duration::from_secs(5))));
        if fastrand::bool() {
            thread::yield_now();
        }
        consumer.release_buffer(&acquired.buffer, Fence::invalid()).unwrap();
        seen += 1;
    }
    seen
}

#[test]
fn test_many_producers_one_consumer() {
    println!("\n--- Running buffer queue stress test with memory-stats ---");
    let before = memory_stats();
    println!("Memory before: {:?}", before);

    let producers = 4;
    let per_producer = 500;
    let total = producers * per_producer;

    let (producer, consumer) = queue_builder(3).build_pair().unwrap();
    let producer = Arc::new(producer);
    let flushed = Arc::new(AtomicU64::new(0));

    let mut handles = Vec::new();
    for _ in 0..producers {
        let producer = Arc::clone(&producer);
        let flushed = Arc::clone(&flushed);
        handles.push(thread::spawn(move || produce(&producer, per_producer, &flushed)));
    }

    let seen = consume(&consumer, total);
    for h in handles {
        h.join().unwrap();
    }

    let after = memory_stats();
    println!("Memory after: {:?}", after);
    if let (Some(b), Some(a)) = (before, after) {
        let delta = a.physical_mem as i64 - b.physical_mem as i64;
        println!("Memory delta: {} bytes ({:.2} KB)", delta, delta as f64 / 1024.0);
    }

    assert_eq!(flushed.load(Relaxed), total);
    assert_eq!(seen, total);
    let queue = producer.queue();
    assert!(queue.get_used_size() <= queue.get_queue_size());
    assert!(matches!(queue.acquire_buffer(), Err(GSError::NoBuffer)));
}

#[test]
fn test_resizing_under_load() {
    let producers = 3;
    let per_producer = 300;
    let total = producers * per_producer;

    let (producer, consumer) = queue_builder(4).build_pair().unwrap();
    let producer = Arc::new(producer);
    let flushed = Arc::new(AtomicU64::new(0));
    let stop = Arc::new(AtomicBool::new(false));
    let last_size = Arc::new(AtomicU32::new(4));

    let mut handles = Vec::new();
    for _ in 0..producers {
        let producer = Arc::clone(&producer);
        let flushed = Arc::clone(&flushed);
        handles.push(thread::spawn(move || produce(&producer, per_producer, &flushed)));
    }
    let resizer = {
        let queue = Arc::clone(producer.queue());
        let stop = Arc::clone(&stop);
        let last_size = Arc::clone(&last_size);
        thread::spawn(move || {
            while !stop.load(Relaxed) {
                let size = fastrand::u32(1..=4);
                queue.set_queue_size(size).unwrap();
                last_size.store(size, Relaxed);
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    let seen = consume(&consumer, total);
    for h in handles {
        h.join().unwrap();
    }
    stop.store(true, Relaxed);
    resizer.join().unwrap();

    assert_eq!(seen, total);
    // Quiescent: every buffer is free, and none beyond capacity survived.
    let queue = producer.queue();
    assert_eq!(queue.get_queue_size(), last_size.load(Relaxed));
    assert!(queue.get_used_size() <= queue.get_queue_size());
}
