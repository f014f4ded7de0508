// Low-power video ring: shared layout, binding, acquisition and the
// producer-side publish path.
//
// Every test that opens descriptors is serialised so the fd accounting in
// `unbinding_closes_the_region` is not disturbed.

mod common;

use common::*;
use crossbeam_utils::CachePadded;
use memoffset::offset_of;
use serial_test::serial;
use std::mem::{align_of, size_of};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use surface_bufferqueue::Core::fence::Fence;
use surface_bufferqueue::Core::{create_shared_memory, SharedMemoryBackend};
use surface_bufferqueue::Lpp::{LppRing, LppSlotEntry, LppSlotInfo, LPP_SLOT_SIZE};
use surface_bufferqueue::Queue::Buffer::SlotState;
use surface_bufferqueue::Queue::Structs::{FlushConfig, Rect, SourceType};
use surface_bufferqueue::{Consumer, GSError, Producer};

struct LppFixture {
    producer: Producer,
    consumer: Consumer,
    /// The producer process's view of the shared region.
    writer: LppRing,
    _shm: Box<dyn SharedMemoryBackend>,
}

fn lpp_fixture() -> LppFixture {
    let (producer, consumer) = queue_builder(3)
        .with_source_type(SourceType::LowPowerVideo)
        .build_pair()
        .unwrap();
    let shm = create_shared_memory(size_of::<LppSlotInfo>(), Some("lpp_test")).unwrap();
    consumer
        .set_lpp_share_fd(Some(shm.share_handle().unwrap()), true)
        .unwrap();
    let writer = LppRing::bind(shm.share_handle().unwrap()).unwrap();
    LppFixture {
        producer,
        consumer,
        writer,
        _shm: shm,
    }
}

fn entry(seq_id: u32, timestamp: i64) -> LppSlotEntry {
    LppSlotEntry {
        seq_id,
        reserved: 0,
        timestamp,
        crop: [0, 0, 64, 64],
    }
}

#[test]
fn test_lpp_layout() {
    let padded = size_of::<CachePadded<AtomicU32>>();
    let entry_size = size_of::<LppSlotEntry>();

    println!(
        "LppSlotInfo => size: {}, align: {}, padded counter: {padded}, entry: {entry_size}",
        size_of::<LppSlotInfo>(),
        align_of::<LppSlotInfo>()
    );

    assert_eq!(entry_size, 32);
    assert_eq!(offset_of!(LppSlotEntry, seq_id), 0);
    assert_eq!(offset_of!(LppSlotEntry, timestamp), 8);
    assert_eq!(offset_of!(LppSlotEntry, crop), 16);

    assert_eq!(align_of::<LppSlotInfo>(), 128);
    assert_eq!(offset_of!(LppSlotInfo, read_offset), 0);
    assert_eq!(offset_of!(LppSlotInfo, write_offset), padded);
    assert_eq!(offset_of!(LppSlotInfo, slot), 2 * padded);
    assert_eq!(
        offset_of!(LppSlotInfo, frame_rate),
        2 * padded + LPP_SLOT_SIZE * entry_size
    );
}

#[test]
#[serial]
fn flushes_are_published_to_the_ring() {
    let f = lpp_fixture();
    let queue = Arc::clone(f.producer.queue());
    let (buffer, _) = f.producer.request_buffer(&default_config()).unwrap();
    let crop = Rect { x: 2, y: 4, w: 32, h: 16 };
    f.producer
        .flush_buffer(
            &buffer,
            Fence::invalid(),
            &FlushConfig {
                damages: vec![crop],
                timestamp: 42,
                desired_present_timestamp: 0,
            },
        )
        .unwrap();

    // Absorbed by the ring: back to free, nothing for the regular consumer path.
    assert_eq!(queue.slot_state(buffer.seq_num()).unwrap(), SlotState::Free);
    assert!(matches!(f.consumer.acquire_buffer(), Err(GSError::NoBuffer)));
    assert_eq!(f.writer.offsets(), (0, 1));

    let frame = f.consumer.acquire_lpp_buffer().unwrap();
    assert!(Arc::ptr_eq(&frame.buffer, &buffer));
    assert_eq!(frame.timestamp, 42);
    assert_eq!(frame.crop, crop);
    assert_eq!(frame.skipped, 0);

    // Nothing new since.
    assert!(matches!(f.consumer.acquire_lpp_buffer(), Err(GSError::NoBuffer)));
}

#[test]
#[serial]
fn latest_frame_wins_and_skips_are_counted() {
    let f = lpp_fixture();
    for ts in 1..=3 {
        let (buffer, _) = f.producer.request_buffer(&default_config()).unwrap();
        f.producer
            .flush_buffer(
                &buffer,
                Fence::invalid(),
                &FlushConfig {
                    timestamp: ts,
                    ..FlushConfig::default()
                },
            )
            .unwrap();
    }
    let frame = f.consumer.acquire_lpp_buffer().unwrap();
    assert_eq!(frame.timestamp, 3);
    assert_eq!(frame.skipped, 2);
    assert_eq!(frame.crop, Rect { x: 0, y: 0, w: 0x100, h: 0x100 });
}

#[test]
#[serial]
fn full_ring_rejects_flushes_until_consumed() {
    let f = lpp_fixture();
    for _ in 0..LPP_SLOT_SIZE {
        let (buffer, _) = f.producer.request_buffer(&default_config()).unwrap();
        f.producer
            .flush_buffer(&buffer, Fence::invalid(), &FlushConfig::default())
            .unwrap();
    }
    let (buffer, _) = f.producer.request_buffer(&default_config()).unwrap();
    assert!(matches!(
        f.producer
            .flush_buffer(&buffer, Fence::invalid(), &FlushConfig::default()),
        Err(GSError::NoBuffer)
    ));

    // The hardware path acknowledges everything written.
    f.consumer.flush_lpp_buffer().unwrap();
    assert_eq!(f.writer.offsets(), (8, 8));
    f.producer
        .flush_buffer(&buffer, Fence::invalid(), &FlushConfig::default())
        .unwrap();
}

#[test]
#[serial]
fn inconsistent_offsets_are_rejected() {
    let f = lpp_fixture();
    let (buffer, _) = f.producer.request_buffer(&default_config()).unwrap();

    f.writer.info().read_offset.store(7, Ordering::Release);
    f.writer.info().write_offset.store(1, Ordering::Release);
    assert!(matches!(
        f.consumer.acquire_lpp_buffer(),
        Err(GSError::InvalidArguments(_))
    ));

    f.writer.info().read_offset.store(1, Ordering::Release);
    f.writer.info().write_offset.store(1, Ordering::Release);
    f.writer.publish(entry(buffer.seq_num(), 500)).unwrap();
    let frame = f.consumer.acquire_lpp_buffer().unwrap();
    assert!(Arc::ptr_eq(&frame.buffer, &buffer));
    assert_eq!(frame.timestamp, 500);
}

#[test]
#[serial]
fn unregistered_sequences_are_not_handed_out() {
    let f = lpp_fixture();
    f.writer.publish(entry(0xdead_beef, 1)).unwrap();
    assert!(matches!(f.consumer.acquire_lpp_buffer(), Err(GSError::NoBuffer)));
}

#[test]
#[serial]
fn compositor_draw_advances_the_read_offset() {
    let f = lpp_fixture();
    f.consumer.set_lpp_draw_source(false, true);
    assert!(f.writer.is_stop_shb_draw());
    assert!(matches!(
        f.consumer.flush_lpp_buffer(),
        Err(GSError::InvalidOperating(_))
    ));

    let (buffer, _) = f.producer.request_buffer(&default_config()).unwrap();
    f.writer.publish(entry(buffer.seq_num(), 7)).unwrap();
    f.writer.publish(entry(buffer.seq_num(), 8)).unwrap();
    f.consumer.acquire_lpp_buffer().unwrap();
    assert_eq!(f.writer.offsets(), (2, 2));

    f.consumer.set_lpp_draw_source(true, false);
    assert!(!f.writer.is_stop_shb_draw());
}

#[test]
#[serial]
fn frame_rate_comes_from_the_producer() {
    let f = lpp_fixture();
    f.writer.info().frame_rate.store(30, Ordering::Relaxed);
    assert_eq!(f.producer.queue().lpp_frame_rate().unwrap(), 30);
}

#[test]
#[serial]
fn binding_requires_a_low_power_source() {
    let (_producer, consumer) = queue_builder(2).build_pair().unwrap();
    let shm = create_shared_memory(size_of::<LppSlotInfo>(), None).unwrap();
    assert!(matches!(
        consumer.set_lpp_share_fd(Some(shm.share_handle().unwrap()), true),
        Err(GSError::InvalidOperating(_))
    ));
    assert!(matches!(
        consumer.acquire_lpp_buffer(),
        Err(GSError::InvalidOperating(_))
    ));
}

#[test]
#[serial]
fn undersized_region_is_rejected() {
    let (_producer, consumer) = queue_builder(2)
        .with_source_type(SourceType::LowPowerVideo)
        .build_pair()
        .unwrap();
    let shm = create_shared_memory(16, None).unwrap();
    assert!(matches!(
        consumer.set_lpp_share_fd(Some(shm.share_handle().unwrap()), true),
        Err(GSError::InvalidArguments(_))
    ));
    assert!(matches!(
        consumer.set_lpp_share_fd(None, true),
        Err(GSError::InvalidArguments(_))
    ));
}

#[test]
#[serial]
fn leaving_low_power_mode_drops_the_ring() {
    let f = lpp_fixture();
    let queue = Arc::clone(f.producer.queue());
    queue.set_source_type(SourceType::Video);
    assert!(matches!(queue.lpp_frame_rate(), Err(GSError::NoEntry(_))));

    // Flushes take the regular path again.
    let (buffer, _) = f.producer.request_buffer(&default_config()).unwrap();
    f.producer
        .flush_buffer(&buffer, Fence::invalid(), &FlushConfig::default())
        .unwrap();
    assert_eq!(queue.slot_state(buffer.seq_num()).unwrap(), SlotState::Dirty);
    assert_eq!(f.writer.offsets(), (0, 0));
}

#[test]
#[serial]
fn unbinding_closes_the_region() {
    let (_producer, consumer) = queue_builder(2)
        .with_source_type(SourceType::LowPowerVideo)
        .build_pair()
        .unwrap();
    let before = open_fd_count();

    let shm = create_shared_memory(size_of::<LppSlotInfo>(), None).unwrap();
    consumer
        .set_lpp_share_fd(Some(shm.share_handle().unwrap()), true)
        .unwrap();
    drop(shm);
    assert_eq!(open_fd_count(), before + 1);

    consumer.set_lpp_share_fd(None, false).unwrap();
    assert_eq!(open_fd_count(), before);
}

#[test]
#[serial]
fn offsets_wrap_past_u32_max() {
    let (producer, consumer) = queue_builder(3)
        .with_source_type(SourceType::LowPowerVideo)
        .build_pair()
        .unwrap();
    let shm = create_shared_memory(size_of::<LppSlotInfo>(), Some("lpp_wrap")).unwrap();
    let writer = LppRing::bind(shm.share_handle().unwrap()).unwrap();
    let start = u32::MAX - 1;
    writer.info().read_offset.store(start, Ordering::Release);
    writer.info().write_offset.store(start, Ordering::Release);
    consumer
        .set_lpp_share_fd(Some(shm.share_handle().unwrap()), true)
        .unwrap();

    for ts in 1..=3 {
        let (buffer, _) = producer.request_buffer(&default_config()).unwrap();
        producer
            .flush_buffer(
                &buffer,
                Fence::invalid(),
                &FlushConfig {
                    timestamp: ts,
                    ..FlushConfig::default()
                },
            )
            .unwrap();
    }
    assert_eq!(writer.offsets(), (start, 1));

    let frame = consumer.acquire_lpp_buffer().unwrap();
    assert_eq!(frame.timestamp, 3);
    assert_eq!(frame.skipped, 2);

    consumer.flush_lpp_buffer().unwrap();
    assert_eq!(writer.offsets(), (1, 1));
    assert!(matches!(consumer.acquire_lpp_buffer(), Err(GSError::NoBuffer)));
}
