use crate::error::EngineError;

/// A per-piece availability map (own bitfield or a peer's remote bitfield).
/// `num_pieces` is the logical bit count; `payload` is the packed byte
/// representation, `ceil(num_pieces / 8)` bytes long, with any padding bits
/// in the last byte always 0.
#[derive(Debug, Clone, PartialEq)]
pub struct BitField {
    payload: Vec<u8>,
    num_pieces: usize,
}

impl BitField {
    /// A fresh bitfield with every piece marked missing.
    pub fn empty(num_pieces: usize) -> BitField {
        let byte_len = (num_pieces + 7) / 8;
        BitField {
            payload: vec![0; byte_len],
            num_pieces,
        }
    }

    /// A bitfield with every piece marked present (used by the seeding side).
    pub fn full(num_pieces: usize) -> BitField {
        let mut bf = BitField::empty(num_pieces);
        for i in 0..num_pieces {
            bf.set(i);
        }
        bf
    }

    /// Parses the payload of a BITFIELD wire message. Rejects a payload of
    /// the wrong length and masks away any trailing padding bits the
    /// remote may have set, so extra bits beyond `num_pieces` are never
    /// treated as real pieces (spec §8 scenario 5).
    pub fn from_wire(payload: &[u8], num_pieces: usize) -> Result<BitField, EngineError> {
        let expected_len = (num_pieces + 7) / 8;
        if payload.len() != expected_len {
            return Err(EngineError::MalformedInput(format!(
                "bitfield length {} does not match expected {}",
                payload.len(),
                expected_len
            )));
        }
        let mut payload = payload.to_vec();
        let used_bits_in_last_byte = num_pieces % 8;
        if used_bits_in_last_byte != 0 {
            if let Some(last) = payload.last_mut() {
                let mask = 0xFFu8 << (8 - used_bits_in_last_byte);
                *last &= mask;
            }
        }
        Ok(BitField {
            payload,
            num_pieces,
        })
    }

    pub fn to_wire(&self) -> Vec<u8> {
        self.payload.clone()
    }

    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    pub fn is_set(&self, index: usize) -> bool {
        if index >= self.num_pieces {
            return false;
        }
        let byte = index / 8;
        let bit = index % 8;
        let mask = 1 << (7 - bit);
        self.payload[byte] & mask != 0
    }

    pub fn set(&mut self, index: usize) {
        if index >= self.num_pieces {
            return;
        }
        let byte = index / 8;
        let bit = index % 8;
        let mask = 1 << (7 - bit);
        self.payload[byte] |= mask;
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.is_set(index)
    }

    pub fn iter(&self) -> BitfieldIter {
        BitfieldIter {
            bitfield: self,
            index: 0,
        }
    }

    pub fn pieces(&self) -> Vec<usize> {
        self.iter()
            .enumerate()
            .filter(|&(_, b)| b)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.iter().all(|b| b)
    }
}

pub struct BitfieldIter<'a> {
    bitfield: &'a BitField,
    index: usize,
}

impl<'a> Iterator for BitfieldIter<'a> {
    type Item = bool;

    fn next(&mut self) -> Option<bool> {
        if self.index >= self.bitfield.num_pieces {
            return None;
        }
        let bit = self.bitfield.is_set(self.index);
        self.index += 1;
        Some(bit)
    }
}
