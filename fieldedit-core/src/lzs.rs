//! FF7's LZS codec, the Okumura LZSS variant used by every field and
//! archive tool for the game: 4096-byte ring dictionary, 18-byte
//! lookahead, 2-byte match threshold. The ring starts zero-filled with
//! the write cursor at 4078, and back-references store absolute ring
//! indices, so both sides must agree on that initial state exactly.

use crate::{Error, Result};

const RING_SIZE: usize = 4096;
const LOOKAHEAD: usize = 18;
const THRESHOLD: usize = 2;
const RING_START: usize = RING_SIZE - LOOKAHEAD; // 4078
const NIL: i32 = RING_SIZE as i32;

/// Decompresses a headerless LZS payload.
///
/// With `min_bytes == 0` the whole stream is decoded. A nonzero
/// `min_bytes` stops decoding as soon as at least that many output bytes
/// exist and returns what was produced, which is always a prefix of the
/// full output. Field files use this to read just enough of the payload
/// to discover the section directory.
pub fn decompress(data: &[u8], min_bytes: usize) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let file_size = data.len();
    // Decoded field data is typically 3-5x the compressed size.
    let mut out: Vec<u8> = Vec::with_capacity(file_size.saturating_mul(5));

    let mut ring = [0u8; RING_SIZE];
    let mut ring_pos: usize = RING_START;

    let mut flags: u16 = 0;
    let mut pos: usize = 0;

    loop {
        if min_bytes > 0 && out.len() >= min_bytes {
            return Ok(out);
        }

        // Reload the control byte once its 8 bits are spent.
        if ((flags >> 1) & 0x100) == 0 {
            if pos >= file_size {
                return Ok(out);
            }
            flags = (data[pos] as u16) | 0xFF00;
            pos += 1;

            if pos >= file_size {
                return Err(Error::CorruptStream(
                    "control byte with no literal or reference after it".to_string(),
                ));
            }
        } else {
            flags >>= 1;
            if pos >= file_size {
                return Ok(out);
            }
        }

        if (flags & 1) != 0 {
            // Literal byte.
            let c = data[pos];
            pos += 1;

            out.push(c);
            ring[ring_pos] = c;
            ring_pos = (ring_pos + 1) & (RING_SIZE - 1);
        } else {
            // Back-reference: 12-bit absolute ring index, 4-bit length.
            if pos + 1 >= file_size {
                return Err(Error::CorruptStream(
                    "reference pair truncated at end of stream".to_string(),
                ));
            }

            let mut offset = data[pos] as u16;
            let length = data[pos + 1] as u16;
            pos += 2;

            offset |= (length & 0xF0) << 4;
            let end_index = (length & 0x0F) + THRESHOLD as u16 + offset;

            let mut i = offset;
            while i <= end_index {
                let c = ring[(i & 0x0FFF) as usize];
                out.push(c);
                ring[ring_pos] = c;
                ring_pos = (ring_pos + 1) & (RING_SIZE - 1);
                i += 1;
            }
        }
    }
}

/// Binary-tree match finder from the reference Okumura encoder. `text`
/// holds the ring plus a 17-byte mirror of its start so matches can run
/// past the wrap point; `lson`/`rson`/`dad` index strings by their ring
/// position, with 256 extra roots in `rson` bucketed by first byte.
struct MatchTree {
    lson: [i32; RING_SIZE + 1],
    rson: [i32; RING_SIZE + 257],
    dad: [i32; RING_SIZE + 1],
    text: [u8; RING_SIZE + LOOKAHEAD - 1],
    match_position: i32,
    match_length: i32,
}

impl MatchTree {
    fn new() -> Box<Self> {
        let mut tree = Box::new(MatchTree {
            lson: [0; RING_SIZE + 1],
            rson: [0; RING_SIZE + 257],
            dad: [0; RING_SIZE + 1],
            text: [0; RING_SIZE + LOOKAHEAD - 1],
            match_position: 0,
            match_length: 0,
        });
        for i in (RING_SIZE + 1)..=(RING_SIZE + 256) {
            tree.rson[i] = NIL;
        }
        for i in 0..RING_SIZE {
            tree.dad[i] = NIL;
        }
        tree
    }

    /// Inserts the string starting at ring index `r`, updating
    /// `match_position`/`match_length` with the longest match found on
    /// the way down.
    fn insert(&mut self, r: i32) {
        let key = r as usize;
        let mut cmp: i32 = 1;
        let mut p: i32 = (RING_SIZE as i32 + 1) + self.text[key] as i32;

        self.lson[key] = NIL;
        self.rson[key] = NIL;
        self.match_length = 0;

        loop {
            let pu = p as usize;
            if cmp >= 0 {
                if self.rson[pu] != NIL {
                    p = self.rson[pu];
                } else {
                    self.rson[pu] = r;
                    self.dad[key] = p;
                    return;
                }
            } else if self.lson[pu] != NIL {
                p = self.lson[pu];
            } else {
                self.lson[pu] = r;
                self.dad[key] = p;
                return;
            }

            let mut i = 1usize;
            while i < LOOKAHEAD {
                let c = self.text[key + i] as i32 - self.text[p as usize + i] as i32;
                cmp = c;
                if cmp != 0 {
                    break;
                }
                i += 1;
            }

            if (i as i32) > self.match_length {
                self.match_position = p;
                self.match_length = i as i32;
                if self.match_length >= LOOKAHEAD as i32 {
                    break;
                }
            }
        }

        // Full-length match: take over p's place in the tree.
        let pu = p as usize;
        self.dad[key] = self.dad[pu];
        self.lson[key] = self.lson[pu];
        self.rson[key] = self.rson[pu];

        let left = self.lson[pu];
        if left != NIL {
            self.dad[left as usize] = r;
        }
        let right = self.rson[pu];
        if right != NIL {
            self.dad[right as usize] = r;
        }

        let parent = self.dad[pu];
        if parent != NIL {
            if self.rson[parent as usize] == p {
                self.rson[parent as usize] = r;
            } else {
                self.lson[parent as usize] = r;
            }
        }

        self.dad[pu] = NIL;
    }

    /// Removes the string at ring index `p` before its bytes are
    /// overwritten by the sliding window.
    fn delete(&mut self, p: i32) {
        let pu = p as usize;
        if self.dad[pu] == NIL {
            return; // not in tree
        }

        let q: i32;
        if self.rson[pu] == NIL {
            q = self.lson[pu];
        } else if self.lson[pu] == NIL {
            q = self.rson[pu];
        } else {
            let mut qt = self.lson[pu];
            if self.rson[qt as usize] != NIL {
                loop {
                    qt = self.rson[qt as usize];
                    if self.rson[qt as usize] == NIL {
                        break;
                    }
                }
                let parent = self.dad[qt as usize] as usize;
                self.rson[parent] = self.lson[qt as usize];
                let child = self.lson[qt as usize];
                if child != NIL {
                    self.dad[child as usize] = self.dad[qt as usize];
                }
                self.lson[qt as usize] = self.lson[pu];
                let left = self.lson[pu];
                if left != NIL {
                    self.dad[left as usize] = qt;
                }
            }
            self.rson[qt as usize] = self.rson[pu];
            let right = self.rson[pu];
            if right != NIL {
                self.dad[right as usize] = qt;
            }
            q = qt;
        }

        let parent = self.dad[pu];
        self.dad[q as usize] = parent;
        if self.rson[parent as usize] == p {
            self.rson[parent as usize] = q;
        } else {
            self.lson[parent as usize] = q;
        }

        self.dad[pu] = NIL;
    }
}

/// Compresses `input` into an LZS bitstream that [`decompress`] restores
/// byte-for-byte. Deterministic; makes no optimality promise beyond what
/// the reference encoder achieves.
pub fn compress(input: &[u8]) -> Vec<u8> {
    if input.is_empty() {
        return Vec::new();
    }

    let mut tree = MatchTree::new();
    let size_data = input.len();
    let mut result: Vec<u8> = Vec::with_capacity(size_data / 2);

    // One control byte followed by up to 8 units of 1 or 2 bytes.
    let mut code_buf = [0u8; 17];
    let mut code_buf_ptr: usize = 1;
    let mut mask: u8 = 1;

    let mut s: i32 = 0;
    let mut r: i32 = RING_START as i32;

    // Prime the lookahead with the first bytes of input.
    let mut data_pos: usize = 0;
    let mut len: i32 = 0;
    while len < LOOKAHEAD as i32 && data_pos < size_data {
        tree.text[(r + len) as usize] = input[data_pos];
        data_pos += 1;
        len += 1;
    }

    for i in 1..=LOOKAHEAD as i32 {
        tree.insert(r - i);
    }
    tree.insert(r);

    loop {
        if tree.match_length > len {
            tree.match_length = len;
        }

        if tree.match_length <= THRESHOLD as i32 {
            // Too short to reference: emit a literal.
            tree.match_length = 1;
            code_buf[0] |= mask;
            code_buf[code_buf_ptr] = tree.text[r as usize];
            code_buf_ptr += 1;
        } else {
            code_buf[code_buf_ptr] = tree.match_position as u8;
            code_buf_ptr += 1;
            code_buf[code_buf_ptr] = (((tree.match_position >> 4) & 0xF0)
                | (tree.match_length - (THRESHOLD as i32 + 1))) as u8;
            code_buf_ptr += 1;
        }

        mask <<= 1;
        if mask == 0 {
            result.extend_from_slice(&code_buf[..code_buf_ptr]);
            code_buf[0] = 0;
            code_buf_ptr = 1;
            mask = 1;
        }

        let last_match_length = tree.match_length;
        let mut consumed = 0;

        while consumed < last_match_length && data_pos < size_data {
            let c = input[data_pos];
            data_pos += 1;

            tree.delete(s);
            tree.text[s as usize] = c;
            if (s as usize) < LOOKAHEAD - 1 {
                // Mirror the ring start so matches can run past the wrap.
                tree.text[s as usize + RING_SIZE] = c;
            }

            s = (s + 1) & (RING_SIZE as i32 - 1);
            r = (r + 1) & (RING_SIZE as i32 - 1);
            tree.insert(r);

            consumed += 1;
        }

        // Past end of input: keep sliding without reading.
        while consumed < last_match_length {
            tree.delete(s);
            s = (s + 1) & (RING_SIZE as i32 - 1);
            r = (r + 1) & (RING_SIZE as i32 - 1);
            len -= 1;
            if len > 0 {
                tree.insert(r);
            }
            consumed += 1;
        }

        if len <= 0 {
            break;
        }
    }

    if code_buf_ptr > 1 {
        result.extend_from_slice(&code_buf[..code_buf_ptr]);
    }

    result
}
