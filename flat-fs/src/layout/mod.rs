//! # 磁盘数据结构层
//!
//! flat-fs 的磁盘布局：
//! 超级块 | inode 表 | 数据块(含空闲块栈)
//!
//! - 块 0：超级块，见 [`SuperBlock`]
//! - 块 1 ..= ceil(inode数/16)：inode 表，每块 16 个 32 字节的 [`Inode`]
//! - 其余：数据块、索引块与空闲块；空闲块的前 4 字节存放下一个空闲块的编号
//!
//! 多字节整数一律小端序。

mod inode;
mod super_block;

pub use self::{
    inode::{AccessFlag, IndexBlock, Inode, INODES_PER_BLOCK, INODE_SIZE},
    super_block::SuperBlock,
};

use crate::BlockId;

/// 磁盘上的空指针
pub(crate) const NULL: i32 = -1;

#[inline]
pub(crate) fn read_i32(data: &[u8], offset: usize) -> i32 {
    let mut bytes = [0; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    i32::from_le_bytes(bytes)
}

#[inline]
pub(crate) fn write_i32(data: &mut [u8], offset: usize, value: i32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub(crate) fn read_i16(data: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([data[offset], data[offset + 1]])
}

#[inline]
pub(crate) fn write_i16(data: &mut [u8], offset: usize, value: i16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

/// 2 字节块指针：负数即未分配
#[inline]
pub(crate) fn decode_ptr(raw: i16) -> Option<BlockId> {
    (raw >= 0).then_some(raw as BlockId)
}

#[inline]
pub(crate) fn encode_ptr(block: Option<BlockId>) -> i16 {
    block.map_or(NULL as i16, |id| {
        debug_assert!(id <= i16::MAX as BlockId);
        id as i16
    })
}
