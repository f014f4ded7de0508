// Capacity management: resizing, pre-allocation, reallocation of stale
// buffers and allocator failures.

mod common;

use common::*;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;
use surface_bufferqueue::Core::alloc::{BufferAllocator, SharedMemoryAllocator};
use surface_bufferqueue::Core::handle::BufferHandle;
use surface_bufferqueue::Core::fence::Fence;
use surface_bufferqueue::Queue::Buffer::SlotState;
use surface_bufferqueue::Queue::Structs::{ExtraData, FlushConfig, RequestConfig};
use surface_bufferqueue::{BufferQueue, BufferQueueBuilder, GSError, GSResult};

#[test]
fn builder_rejects_out_of_range_sizes() {
    assert!(matches!(
        BufferQueueBuilder::new().with_queue_size(0).build(),
        Err(GSError::InvalidArguments(_))
    ));
    assert!(matches!(
        BufferQueueBuilder::new().with_queue_size(65).build(),
        Err(GSError::InvalidArguments(_))
    ));
    assert!(matches!(
        BufferQueueBuilder::new().with_name("x".repeat(300)).build(),
        Err(GSError::OutOfRange(_))
    ));
    let queue = BufferQueueBuilder::new().build().unwrap();
    assert_eq!(queue.get_queue_size(), 3);
    assert_eq!(queue.name(), "bufferqueue");
}

#[test]
fn set_queue_size_validates() {
    let queue = queue_builder(3).build().unwrap();
    assert!(matches!(queue.set_queue_size(0), Err(GSError::InvalidArguments(_))));
    assert!(matches!(queue.set_queue_size(65), Err(GSError::InvalidArguments(_))));
    queue.set_queue_size(64).unwrap();
    assert_eq!(queue.get_queue_size(), 64);
}

#[test]
fn shrinking_spares_in_flight_buffers() {
    let k = 3;
    let queue = queue_builder(k).build().unwrap();
    let (deleted, listener) = delete_recorder();
    queue.register_delete_buffer_listener(listener);
    let extra = ExtraData::new();
    let config = default_config().with_timeout(Duration::ZERO);

    let mut seqs = Vec::new();
    for _ in 0..k {
        let seq = queue.request_buffer(&config, &extra).unwrap().sequence;
        queue
            .flush_buffer(seq, &extra, Fence::invalid(), &FlushConfig::default())
            .unwrap();
        seqs.push(seq);
    }

    queue.set_queue_size(k - 1).unwrap();

    // Nothing in flight was touched.
    assert!(deleted.lock().is_empty());
    for seq in &seqs {
        assert_eq!(queue.slot_state(*seq).unwrap(), SlotState::Dirty);
    }
    assert!(matches!(queue.request_buffer(&config, &extra), Err(GSError::NoBuffer)));

    // Every dirty frame is still delivered.
    let acquired: Vec<_> = (0..k).map(|_| queue.acquire_buffer().unwrap()).collect();

    // First release brings the queue back to capacity by destroying the buffer.
    queue.release_buffer(&acquired[0].buffer, Fence::invalid()).unwrap();
    assert_eq!(*deleted.lock(), vec![seqs[0]]);
    assert_eq!(queue.get_used_size(), k - 1);
    assert!(matches!(queue.request_buffer(&config, &extra), Err(GSError::NoBuffer)));

    // The next one is kept and can be handed out again.
    queue.release_buffer(&acquired[1].buffer, Fence::invalid()).unwrap();
    assert_eq!(deleted.lock().len(), 1);
    let ret = queue.request_buffer(&config, &extra).unwrap();
    assert_eq!(ret.sequence, seqs[1]);
    assert_eq!(ret.deleting_buffers, vec![seqs[0]]);
}

#[test]
fn shrinking_destroys_idle_buffers_immediately() {
    let queue = queue_builder(3).build().unwrap();
    let (deleted, listener) = delete_recorder();
    queue.register_delete_buffer_listener(listener);
    let extra = ExtraData::new();

    let a = queue.request_buffer(&default_config(), &extra).unwrap().sequence;
    let b = queue.request_buffer(&default_config(), &extra).unwrap().sequence;
    queue.cancel_buffer(a, &extra).unwrap();
    queue.cancel_buffer(b, &extra).unwrap();

    queue.set_queue_size(1).unwrap();
    assert_eq!(*deleted.lock(), vec![a]);
    assert_eq!(queue.get_used_size(), 1);
}

#[test]
fn growing_wakes_blocked_requests() {
    let queue = queue_builder(1).build().unwrap();
    queue.request_buffer(&default_config(), &ExtraData::new()).unwrap();

    let waiter = {
        let queue = Arc::clone(&queue);
        std::thread::spawn(move || {
            queue.request_buffer(
                &default_config().with_timeout(Duration::from_secs(5)),
                &ExtraData::new(),
            )
        })
    };
    std::thread::sleep(Duration::from_millis(50));
    queue.set_queue_size(2).unwrap();
    assert!(waiter.join().unwrap().is_ok());
    assert_eq!(queue.get_used_size(), 2);
}

#[test]
fn pre_allocation_stops_at_capacity() {
    let queue = queue_builder(3).build().unwrap();
    let extra = ExtraData::new();
    queue.request_buffer(&default_config(), &extra).unwrap();

    assert_eq!(queue.pre_alloc_buffers(&default_config(), 5).unwrap(), 2);
    assert_eq!(queue.get_used_size(), 3);
    assert_eq!(queue.pre_alloc_buffers(&default_config(), 1).unwrap(), 0);
    assert!(matches!(
        queue.pre_alloc_buffers(&default_config(), 0),
        Err(GSError::InvalidArguments(_))
    ));

    // Pre-allocated buffers serve requests without new allocations.
    let ret = queue.request_buffer(&default_config(), &extra).unwrap();
    assert!(ret.buffer.is_some());
}

#[test]
fn allocation_failure_leaves_queue_unchanged() {
    let allocator = Arc::new(FlakyAllocator::failing());
    let queue = queue_builder(2).with_allocator(allocator.clone()).build().unwrap();

    let result = queue.request_buffer(&default_config(), &ExtraData::new());
    assert!(matches!(result, Err(GSError::NoMemory)));
    assert_eq!(queue.get_used_size(), 0);
    assert!(queue.query_if_buffer_available());

    assert!(matches!(
        queue.pre_alloc_buffers(&default_config(), 2),
        Err(GSError::NoMemory)
    ));
    assert_eq!(queue.get_used_size(), 0);

    allocator.set_failing(false);
    assert!(queue.request_buffer(&default_config(), &ExtraData::new()).is_ok());
    assert_eq!(queue.get_used_size(), 1);
}

#[test]
fn stale_buffers_are_reallocated_for_new_configs() {
    let allocator = Arc::new(FlakyAllocator::default());
    let queue = queue_builder(1).with_allocator(allocator.clone()).build().unwrap();
    let (deleted, listener) = delete_recorder();
    queue.register_delete_buffer_listener(listener);
    let extra = ExtraData::new();

    let small = queue.request_buffer(&rgba(64, 64), &extra).unwrap().sequence;
    queue.cancel_buffer(small, &extra).unwrap();

    // A failed reallocation keeps the stale buffer.
    allocator.set_failing(true);
    assert!(queue.request_buffer(&rgba(128, 128), &extra).is_err());
    assert_eq!(queue.slot_state(small).unwrap(), SlotState::Free);
    assert!(deleted.lock().is_empty());

    allocator.set_failing(false);
    let big = queue.request_buffer(&rgba(128, 128), &extra).unwrap();
    assert_ne!(big.sequence, small);
    assert_eq!(big.buffer.unwrap().width(), 128);
    assert_eq!(*deleted.lock(), vec![small]);
    assert_eq!(big.deleting_buffers, vec![small]);
    assert_eq!(queue.get_used_size(), 1);
    assert_eq!(allocator.calls.load(Ordering::SeqCst), 3);
}

#[test]
fn priority_allocation_prefers_the_newest_free_buffer() {
    let queue = queue_builder(2).with_priority_alloc(true).build().unwrap();
    let extra = ExtraData::new();
    let a = queue.request_buffer(&default_config(), &extra).unwrap().sequence;
    let b = queue.request_buffer(&default_config(), &extra).unwrap().sequence;
    queue.cancel_buffer(a, &extra).unwrap();
    queue.cancel_buffer(b, &extra).unwrap();
    assert_eq!(queue.request_buffer(&default_config(), &extra).unwrap().sequence, b);

    queue.set_priority_alloc(false);
    assert_eq!(queue.request_buffer(&default_config(), &extra).unwrap().sequence, a);
}

#[test]
fn clean_cache_keeps_in_flight_buffers_until_returned() {
    let (producer, consumer) = queue_builder(3).build_pair().unwrap();
    let queue = Arc::clone(producer.queue());
    let (deleted, listener) = delete_recorder();
    queue.register_delete_buffer_listener(listener);

    let (idle, _) = producer.request_buffer(&default_config()).unwrap();
    let (held, _) = producer.request_buffer(&default_config()).unwrap();
    let (shown, _) = producer.request_buffer(&default_config()).unwrap();
    producer.cancel_buffer(&idle).unwrap();
    producer
        .flush_buffer(&shown, Fence::invalid(), &FlushConfig::default())
        .unwrap();
    let acquired = consumer.acquire_buffer().unwrap();

    let removed = queue.clean_cache(true).unwrap();
    assert_eq!(removed, vec![idle.seq_num()]);
    assert_eq!(*deleted.lock(), vec![idle.seq_num()]);
    assert_eq!(queue.get_used_size(), 2);

    producer.cancel_buffer(&held).unwrap();
    consumer.release_buffer(&acquired.buffer, Fence::invalid()).unwrap();
    assert_eq!(queue.get_used_size(), 0);
    let mut all = deleted.lock().clone();
    all.sort_unstable();
    let mut expected = vec![idle.seq_num(), held.seq_num(), shown.seq_num()];
    expected.sort_unstable();
    assert_eq!(all, expected);
}

#[test]
fn clean_cache_drops_pending_frames() {
    let (producer, consumer) = queue_builder(2).build_pair().unwrap();
    let (buffer, _) = producer.request_buffer(&default_config()).unwrap();
    producer
        .flush_buffer(&buffer, Fence::invalid(), &FlushConfig::default())
        .unwrap();

    let removed = producer.clean_cache().unwrap();
    assert_eq!(removed, vec![buffer.seq_num()]);
    assert!(matches!(consumer.acquire_buffer(), Err(GSError::NoBuffer)));
    assert_eq!(producer.cached_count(), 0);
    assert!(matches!(
        producer.queue().get_last_flushed_buffer(),
        Err(GSError::NoEntry(_))
    ));
}

#[test]
fn telemetry_sees_flushes_and_acquires() {
    let telemetry = Arc::new(RecordingTelemetry::default());
    let (producer, consumer) = queue_builder(2)
        .with_telemetry(telemetry.clone())
        .build_pair()
        .unwrap();
    let (buffer, _) = producer.request_buffer(&default_config()).unwrap();
    producer
        .flush_buffer(&buffer, Fence::invalid(), &FlushConfig::default())
        .unwrap();
    consumer.acquire_buffer().unwrap();
    assert_eq!(*telemetry.flushes.lock(), vec![buffer.seq_num()]);
    assert_eq!(*telemetry.acquires.lock(), vec![buffer.seq_num()]);
}

/// Disconnects the consumer while a buffer is being allocated.
#[derive(Default)]
struct DisconnectingAllocator {
    inner: SharedMemoryAllocator,
    queue: parking_lot::Mutex<Weak<BufferQueue>>,
}

impl BufferAllocator for DisconnectingAllocator {
    fn allocate(&self, config: &RequestConfig) -> GSResult<BufferHandle> {
        let handle = self.inner.allocate(config)?;
        if let Some(queue) = self.queue.lock().upgrade() {
            queue.set_status(false);
        }
        Ok(handle)
    }

    fn free(&self, handle: &BufferHandle) {
        self.inner.free(handle);
    }
}

#[test]
fn abandoned_allocations_return_their_memory() {
    let allocator = Arc::new(DisconnectingAllocator::default());
    let queue = queue_builder(3)
        .with_allocator(allocator.clone())
        .build()
        .unwrap();
    *allocator.queue.lock() = Arc::downgrade(&queue);

    assert!(matches!(
        queue.request_buffer(&default_config(), &ExtraData::new()),
        Err(GSError::NoConsumer)
    ));
    assert_eq!(allocator.inner.allocation_count(), 1);
    assert_eq!(allocator.inner.used_memory(), 0);

    queue.set_status(true);
    assert!(matches!(
        queue.pre_alloc_buffers(&default_config(), 2),
        Err(GSError::NoConsumer)
    ));
    assert_eq!(allocator.inner.allocation_count(), 3);
    assert_eq!(allocator.inner.used_memory(), 0);
    assert_eq!(queue.get_used_size(), 0);

    drop(queue);
    assert_eq!(allocator.inner.used_memory(), 0);
}
