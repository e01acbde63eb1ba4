//! # 块缓冲层
//!
//! 对块的任何操作都先复制到内存中的 [`Block`] 里进行，
//! 被修改过的缓冲在 [`Block::sync`] 或析构时写回块设备。
//!
//! 缓冲不跨调用存活，也不在多个使用者之间共享：
//! 每次 [`Block::load`] 都是一次真实的设备读。

use crate::BlockDevice;
use crate::BlockId;
use crate::DataBlock;
use crate::BLOCK_SIZE;

/// 内存中的块缓冲
pub struct Block<'a> {
    /// 缓冲的数据
    data: DataBlock,
    /// 对应的块ID
    block_id: BlockId,
    /// 底层块设备的引用
    block_device: &'a dyn BlockDevice,
    /// 是否为脏块
    modified: bool,
}

impl<'a> Block<'a> {
    pub fn load(block_id: BlockId, block_device: &'a dyn BlockDevice) -> Self {
        let mut data = [0; BLOCK_SIZE];
        block_device.read_block(block_id as usize, &mut data);

        Self {
            data,
            block_id,
            block_device,
            modified: false,
        }
    }

    /// 整块覆写时无需读出旧内容
    pub fn zeroed(block_id: BlockId, block_device: &'a dyn BlockDevice) -> Self {
        Self {
            data: [0; BLOCK_SIZE],
            block_id,
            block_device,
            modified: true,
        }
    }

    pub fn sync(&mut self) {
        if self.modified {
            self.modified = false;
            self.block_device
                .write_block(self.block_id as usize, &self.data);
        }
    }

    #[inline]
    pub fn map<V>(&self, f: impl FnOnce(&DataBlock) -> V) -> V {
        f(&self.data)
    }

    #[inline]
    pub fn map_mut<V>(&mut self, f: impl FnOnce(&mut DataBlock) -> V) -> V {
        self.modified = true;
        f(&mut self.data)
    }
}

impl Drop for Block<'_> {
    fn drop(&mut self) {
        self.sync();
    }
}

#[cfg(test)]
mod tests {
    use block_dev::MemDisk;

    use super::*;

    #[test]
    fn write_back_on_drop() {
        let disk = MemDisk::new(2);

        Block::load(1, &disk).map_mut(|data| data[7] = 42);
        assert_eq!(disk.writes(), 1);
        assert_eq!(Block::load(1, &disk).map(|data| data[7]), 42);

        // 只读不写回
        assert_eq!(disk.writes(), 1);
    }
}
