//! A small but complete [ValueCodec]: structures with named children and 32-bit integer
//!  leaves. This is enough to exercise everything the engine does with values (partial
//!  serialization by change bit set, bit set compression, type descriptions on the wire)
//!  without depending on a real type system.

use std::any::Any;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use bit_set::BitSet;
use bytes::{BufMut, BytesMut};

use crate::codec::{FieldDesc, FieldRegistry, PvValue, ValueCodec};
use crate::protocol::wire::WireBuf;
use crate::util::buf_ext::{BufMutExt, NULL_SIZE};

pub const STRUCTURE_TAG: u8 = 0x80;
pub const INT_TAG: u8 = 0x22;

/// A node of a structure type: a leaf if it has no children
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeDesc {
    children: Vec<(String, TreeDesc)>,
}

impl TreeDesc {
    pub fn leaf() -> TreeDesc {
        TreeDesc { children: Vec::new() }
    }

    pub fn structure(children: Vec<(&str, TreeDesc)>) -> TreeDesc {
        TreeDesc {
            children: children.into_iter()
                .map(|(name, desc)| (name.to_string(), desc))
                .collect(),
        }
    }

    /// a structure of `n` leaves, named `f0`, `f1` etc.
    pub fn flat(n: usize) -> TreeDesc {
        TreeDesc {
            children: (0..n).map(|i| (format!("f{}", i), TreeDesc::leaf())).collect(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// (offset, ancestor offsets) of all leaves in depth-first order
    pub fn leaves(&self) -> Vec<(usize, Vec<usize>)> {
        let mut result = Vec::new();
        self.collect_leaves(0, &mut Vec::new(), &mut result);
        result
    }

    fn collect_leaves(&self, offset: usize, ancestors: &mut Vec<usize>, result: &mut Vec<(usize, Vec<usize>)>) {
        if self.is_leaf() {
            result.push((offset, ancestors.clone()));
            return;
        }
        ancestors.push(offset);
        let mut child_offset = offset + 1;
        for (_, child) in &self.children {
            child.collect_leaves(child_offset, ancestors, result);
            child_offset += child.field_count();
        }
        ancestors.pop();
    }

    fn compress_at(&self, offset: usize, bits: &mut BitSet) -> bool {
        if self.is_leaf() {
            return bits.contains(offset);
        }
        let end = offset + self.field_count();
        if bits.contains(offset) {
            for descendant in offset + 1..end {
                bits.remove(descendant);
            }
            return true;
        }

        let mut all_set = true;
        let mut child_offset = offset + 1;
        for (_, child) in &self.children {
            all_set &= child.compress_at(child_offset, bits);
            child_offset += child.field_count();
        }
        if all_set {
            for descendant in offset + 1..end {
                bits.remove(descendant);
            }
            bits.insert(offset);
        }
        all_set
    }

    fn deser(buf: &mut WireBuf) -> anyhow::Result<TreeDesc> {
        match buf.try_get_u8()? {
            INT_TAG => Ok(TreeDesc::leaf()),
            STRUCTURE_TAG => {
                let n = buf.try_get_size()?
                    .ok_or_else(|| anyhow!("null child count"))?;
                let mut children = Vec::with_capacity(n.min(64));
                for _ in 0..n {
                    let name = buf.try_get_string()?;
                    children.push((name, TreeDesc::deser(buf)?));
                }
                Ok(TreeDesc { children })
            }
            other => bail!("unsupported type tag {:#x}", other),
        }
    }
}

impl FieldDesc for TreeDesc {
    fn serialize(&self, buf: &mut BytesMut) {
        if self.is_leaf() {
            buf.put_u8(INT_TAG);
            return;
        }
        buf.put_u8(STRUCTURE_TAG);
        buf.put_size(self.children.len());
        for (name, child) in &self.children {
            buf.put_string(name);
            child.serialize(buf);
        }
    }

    fn create_value(self: Arc<Self>) -> Box<dyn PvValue> {
        Box::new(TreeValue::new(self))
    }

    fn field_count(&self) -> usize {
        1 + self.children.iter().map(|(_, c)| c.field_count()).sum::<usize>()
    }

    fn compress(&self, bits: &mut BitSet) {
        self.compress_at(0, bits);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A value of a [TreeDesc]. Leaf values are indexed by their offset.
#[derive(Debug, Clone)]
pub struct TreeValue {
    desc: Arc<TreeDesc>,
    values: Vec<i32>,
}

impl TreeValue {
    pub fn new(desc: Arc<TreeDesc>) -> TreeValue {
        let values = vec![0; desc.field_count()];
        TreeValue { desc, values }
    }

    pub fn get(&self, offset: usize) -> i32 {
        self.values[offset]
    }

    pub fn set(&mut self, offset: usize, value: i32) {
        self.values[offset] = value;
    }

    pub fn values(&self) -> &[i32] {
        &self.values
    }

    fn selected_leaves(&self, changed: Option<&BitSet>) -> Vec<usize> {
        self.desc.leaves().into_iter()
            .filter(|(offset, ancestors)| match changed {
                None => true,
                Some(bits) => bits.contains(*offset) || ancestors.iter().any(|a| bits.contains(*a)),
            })
            .map(|(offset, _)| offset)
            .collect()
    }
}

impl PvValue for TreeValue {
    fn field(&self) -> Arc<dyn FieldDesc> {
        self.desc.clone()
    }

    fn serialize(&self, buf: &mut BytesMut, changed: Option<&BitSet>) {
        for offset in self.selected_leaves(changed) {
            buf.put_i32(self.values[offset]);
        }
    }

    fn deserialize(&mut self, buf: &mut WireBuf, changed: Option<&BitSet>) -> anyhow::Result<()> {
        for offset in self.selected_leaves(changed) {
            self.values[offset] = buf.try_get_i32()?;
        }
        Ok(())
    }

    fn copy_from(&mut self, other: &dyn PvValue) -> anyhow::Result<()> {
        let Some(other) = other.as_any().downcast_ref::<TreeValue>() else {
            bail!("incompatible value type");
        };
        if other.desc != self.desc {
            bail!("incompatible structure");
        }
        self.values.copy_from_slice(&other.values);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct TreeRegistry;

impl FieldRegistry for TreeRegistry {
    fn deserialize_field(&mut self, buf: &mut WireBuf) -> anyhow::Result<Option<Arc<dyn FieldDesc>>> {
        if buf.rest().first() == Some(&NULL_SIZE) {
            buf.skip(1)?;
            return Ok(None);
        }
        Ok(Some(Arc::new(TreeDesc::deser(buf)?)))
    }
}

#[derive(Default)]
pub struct TreeCodec;

impl ValueCodec for TreeCodec {
    fn new_registry(&self) -> Box<dyn FieldRegistry> {
        Box::new(TreeRegistry)
    }
}

/// convenience for tests: a value of a structure with leaves set to their offset times 10
pub fn sample_value(desc: TreeDesc) -> Box<dyn PvValue> {
    let mut value = TreeValue::new(Arc::new(desc));
    for (offset, _) in value.desc.leaves() {
        value.set(offset, offset as i32 * 10);
    }
    Box::new(value)
}

pub fn tree_value(value: &dyn PvValue) -> &TreeValue {
    value.as_any().downcast_ref::<TreeValue>()
        .expect("not a TreeValue")
}
