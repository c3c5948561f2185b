//! The contract between the protocol engine and the value codec.
//!
//! The engine does not know anything about the structure of values. Type descriptions
//!  ([FieldDesc]) and values ([PvValue]) are opaque objects supplied by a [ValueCodec]; the
//!  engine only asks them to serialize / deserialize themselves, and to collapse change bit sets
//!  according to their structure.
//!
//! Fields are identified by their *offset* in a depth-first numbering of the structure, with
//!  offset 0 being the top level structure itself. A change bit set refers to these offsets.

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use anyhow::bail;
use bit_set::BitSet;
use bytes::{BufMut, BytesMut};

use crate::protocol::wire::WireBuf;
use crate::util::buf_ext::BufMutExt;

pub trait FieldDesc: Debug + Send + Sync {
    fn serialize(&self, buf: &mut BytesMut);

    fn create_value(self: Arc<Self>) -> Box<dyn PvValue>;

    /// number of offsets covered by this field, i.e. the number of nodes in the tree
    fn field_count(&self) -> usize;

    /// Normalizes a change bit set: if all children of a structure are set, they are replaced
    ///  by the structure's bit; bits of fields inside a set structure are cleared. Compressing
    ///  must be idempotent.
    fn compress(&self, bits: &mut BitSet);

    fn as_any(&self) -> &dyn Any;
}

pub trait PvValue: Debug + Send + Sync {
    fn field(&self) -> Arc<dyn FieldDesc>;

    /// Serializes either the full value or only the fields selected by `changed`
    fn serialize(&self, buf: &mut BytesMut, changed: Option<&BitSet>);

    /// The reverse of [PvValue::serialize]: with a change bit set, only the selected fields are
    ///  read and the rest of the value remains unchanged.
    fn deserialize(&mut self, buf: &mut WireBuf, changed: Option<&BitSet>) -> anyhow::Result<()>;

    /// fails if the other value is of a different type
    fn copy_from(&mut self, other: &dyn PvValue) -> anyhow::Result<()>;

    fn as_any(&self) -> &dyn Any;
}

/// Decodes type descriptions received on one connection. Servers may cache type descriptions
///  per connection and refer to them by id later, so there is a registry per transport.
pub trait FieldRegistry: Send {
    /// `None` for a null field (e.g. a request without data)
    fn deserialize_field(&mut self, buf: &mut WireBuf) -> anyhow::Result<Option<Arc<dyn FieldDesc>>>;
}

pub trait ValueCodec: Send + Sync {
    fn new_registry(&self) -> Box<dyn FieldRegistry>;
}

/// Writes a field description followed by the full value, or a null marker
pub fn serialize_full(value: Option<&dyn PvValue>, buf: &mut BytesMut) {
    match value {
        Some(value) => {
            value.field().serialize(buf);
            value.serialize(buf, None);
        }
        None => buf.put_null_size(),
    }
}

/// A bit set is sent as a byte count followed by its 64-bit words. The last (partial) word is
///  trimmed to its significant bytes, which are sent in little endian order.
pub fn serialize_bitset(bits: &BitSet, buf: &mut BytesMut) {
    let mut words: Vec<u64> = Vec::new();
    for bit in bits.iter() {
        let word_idx = bit / 64;
        if words.len() <= word_idx {
            words.resize(word_idx + 1, 0);
        }
        words[word_idx] |= 1u64 << (bit % 64);
    }

    let Some(&last) = words.last() else {
        buf.put_size(0);
        return;
    };

    let last_bytes = (64 - last.leading_zeros() as usize).div_ceil(8);
    buf.put_size((words.len() - 1) * 8 + last_bytes);
    for w in &words[..words.len() - 1] {
        buf.put_u64(*w);
    }
    for i in 0..last_bytes {
        buf.put_u8((last >> (8 * i)) as u8);
    }
}

pub fn deserialize_bitset(buf: &mut WireBuf) -> anyhow::Result<BitSet> {
    let Some(num_bytes) = buf.try_get_size()? else {
        bail!("null bit set");
    };
    if num_bytes > buf.remaining() {
        bail!("bit set of {} bytes exceeds the message", num_bytes);
    }

    let mut result = BitSet::new();
    let mut add_word = |word_idx: usize, mut word: u64| {
        while word != 0 {
            let bit = word.trailing_zeros() as usize;
            result.insert(word_idx * 64 + bit);
            word &= word - 1;
        }
    };

    let num_words = num_bytes / 8;
    for word_idx in 0..num_words {
        add_word(word_idx, buf.try_get_u64()?);
    }
    let mut last = 0u64;
    for i in 0..num_bytes % 8 {
        last |= (buf.try_get_u8()? as u64) << (8 * i);
    }
    add_word(num_words, last);
    Ok(result)
}
