// Module naming follows project convention (Core / Queue / Lpp / Transport)
#[allow(non_snake_case)]
pub mod Core {
    pub mod SharedMemory;
    pub use SharedMemory::{attach_shared_memory, create_shared_memory, RawHandle, SharedMemoryBackend};
    pub mod alloc;
    pub mod fence;
    pub mod handle;
}
#[allow(non_snake_case)]
pub mod Queue {
    pub mod Buffer {
        pub mod Buffer;
        pub mod Buffer_impl;
        pub use Buffer::{Slot, SlotState, SurfaceBuffer}; // re-export for stable path
    }
    pub mod Structs {
        pub mod Buffer_Structs;
        pub use Buffer_Structs::*; // re-export for stable path
    }
    pub mod buffer_queue;
    pub mod builder;
    pub mod consumer;
    pub mod delegate;
    pub mod producer;
    pub use buffer_queue::{AcquireBufferReturn, BufferQueue, LppAcquired, RequestBufferReturn};
    pub use builder::BufferQueueBuilder;
    pub use consumer::Consumer;
    pub use producer::Producer;
}
#[allow(non_snake_case)]
pub mod Lpp {
    pub mod layout;
    pub mod ring;
    pub use layout::{LppSlotEntry, LppSlotInfo, LPP_SLOT_SIZE};
    pub use ring::{LppFrame, LppRing};
}
#[allow(non_snake_case)]
pub mod Transport {
    pub mod parcel;
    pub mod stub;
    pub use parcel::{read_buffer_handle, write_buffer_handle, Parcel};
    pub use stub::{ProducerStub, RequestCode};
}
#[allow(non_snake_case)]
pub mod Debug {
    pub mod StructDebug;
}
pub mod error;
pub mod ffi;

pub use error::{GSError, GSResult};
pub use Core::fence::{Fence, FenceSignal};
pub use Queue::{BufferQueue, BufferQueueBuilder, Consumer, Producer};
