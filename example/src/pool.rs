//! Buffer pool that accumulates chunks and flushes when full.

const CHUNK_SIZE: usize = 2 * 1024 * 1024;
const MAX_SIZE: usize = 64 * 1024 * 1024;

pub struct BufferPool {
    buffers: Vec<Vec<u8>>,
    total_bytes: usize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            buffers: Vec::new(),
            total_bytes: 0,
        }
    }

    pub fn tick(&mut self) {
        self.allocate_chunk();
        if self.total_bytes >= MAX_SIZE {
            self.flush();
        }
    }

    #[inline(never)]
    fn allocate_chunk(&mut self) {
        let chunk = create_buffer();
        self.total_bytes += chunk.len();
        self.buffers.push(chunk);
    }

    #[inline(never)]
    fn flush(&mut self) {
        self.buffers.clear();
        self.total_bytes = 0;
    }
}

#[inline(never)]
fn create_buffer() -> Vec<u8> {
    // Filled so the allocation is not optimized away
    vec![0xAB; CHUNK_SIZE]
}
