//! Drawing undo history: PackBits run-length coding and a bounded ring
//!
//! Snapshots are RLE-compressed so a deep history of mostly-empty bitmaps
//! stays cheap. The ring has fixed capacity; exceeding it silently evicts
//! the oldest snapshot.

use tracing::debug;

/// Compress a drawing with PackBits run-length encoding.
///
/// Long runs compress up to 64x; worst case output is about 1% larger than
/// the input. Runs cover up to 129 equal bytes, literals up to 128.
pub fn encode_rle(data: &[u8]) -> Vec<u8> {
    let dl = data.len();
    let mut out = Vec::with_capacity(dl / 16 + 8);
    let mut dp = 0usize;
    while dp < dl {
        let v = data[dp];
        dp += 1;
        let mut rl = 1usize;
        while rl < 129 && dp < dl && data[dp] == v {
            dp += 1;
            rl += 1;
        }
        if rl > 1 {
            // run header is negative: -(run length) + 1
            out.push((1i32 - rl as i32) as i8 as u8);
            out.push(v);
            continue;
        }
        // count literal length, stopping where a run of 3 begins
        let mut last = v;
        while dp < dl {
            if rl > 127 {
                break;
            }
            if dp + 2 < dl
                && data[dp] != last
                && data[dp + 2] == data[dp]
                && data[dp + 1] == data[dp]
            {
                break;
            }
            last = data[dp];
            dp += 1;
            rl += 1;
        }
        out.push((rl - 1) as u8);
        for i in 0..rl {
            out.push(data[dp - rl + i]);
        }
    }
    debug!(
        input = dl,
        output = out.len(),
        "PackBits encoded drawing snapshot"
    );
    out
}

/// Decompress a PackBits stream into `decoded_len` bytes.
pub fn decode_rle(rle: &[u8], decoded_len: usize) -> Vec<u8> {
    let mut out = vec![0u8; decoded_len];
    let mut rp = 0usize;
    let mut dp = 0usize;
    while rp < rle.len() && dp < decoded_len {
        let hdr = rle[rp] as i8;
        rp += 1;
        if hdr < 0 {
            // run
            let v = rle[rp];
            rp += 1;
            let n = (1 - hdr as i32) as usize;
            for _ in 0..n {
                if dp >= decoded_len {
                    break;
                }
                out[dp] = v;
                dp += 1;
            }
        } else {
            // literal
            for _ in 0..=(hdr as usize) {
                if rp >= rle.len() || dp >= decoded_len {
                    break;
                }
                out[dp] = rle[rp];
                rp += 1;
                dp += 1;
            }
        }
    }
    out
}

/// Bounded ring of compressed drawing snapshots.
#[derive(Debug, Clone)]
pub struct UndoRing {
    slots: Vec<Option<Vec<u8>>>,
    current: usize,
}

impl UndoRing {
    /// Create a ring holding at most `capacity` snapshots.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![None; capacity],
            // positioned so the first push lands in slot 0
            current: capacity - 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Snapshot the bitmap. Overflow silently evicts the oldest entry.
    pub fn push(&mut self, bitmap: &[u8]) {
        self.current = (self.current + 1) % self.slots.len();
        self.slots[self.current] = Some(encode_rle(bitmap));
    }

    /// Step back one snapshot and decode it, or `None` when history is
    /// exhausted.
    pub fn step_back(&mut self, decoded_len: usize) -> Option<Vec<u8>> {
        let cap = self.slots.len();
        let prev = (self.current + cap - 1) % cap;
        let decoded = self.slots[prev].as_ref().map(|rle| decode_rle(rle, decoded_len))?;
        self.current = prev;
        Some(decoded)
    }

    /// Most recent snapshot without moving the cursor.
    pub fn latest(&self, decoded_len: usize) -> Option<Vec<u8>> {
        self.slots[self.current]
            .as_ref()
            .map(|rle| decode_rle(rle, decoded_len))
    }

    /// Drop every snapshot and reset the cursor.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.current = self.slots.len() - 1;
    }
}
