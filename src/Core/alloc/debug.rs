use super::*;
use std::fmt;

// Debug proxy implementations that call the standalone debug functions
impl fmt::Debug for SharedMemoryAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_shared_memory_allocator(self, f)
    }
}

impl fmt::Debug for SequenceGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequenceGenerator")
            .field("base", &format_args!("{:#x}", self.base))
            .field("counter", &self.counter.load(std::sync::atomic::Ordering::Relaxed))
            .finish()
    }
}
