use super::{read_i32, write_i32, NULL};
use crate::BlockId;
use crate::DataBlock;

/// 超级块：
/// - 记录设备容量与 inode 个数；
/// - 记录空闲块栈的栈顶
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    /// 文件系统占据块数
    pub total_blocks: u32,
    pub total_inodes: u32,
    /// 空闲块栈顶，`None` 表示空间耗尽
    pub free_list: Option<BlockId>,
}

impl SuperBlock {
    pub fn decode(block: &DataBlock) -> Self {
        let free_list = read_i32(block, 8);
        Self {
            total_blocks: read_i32(block, 0).max(0) as u32,
            total_inodes: read_i32(block, 4).max(0) as u32,
            free_list: (free_list >= 0).then_some(free_list as BlockId),
        }
    }

    pub fn encode(&self, block: &mut DataBlock) {
        block.fill(0);
        write_i32(block, 0, self.total_blocks as i32);
        write_i32(block, 4, self.total_inodes as i32);
        write_i32(block, 8, self.free_list.map_or(NULL, |id| id as i32));
    }

    /// 数据区的首块：紧跟在 inode 表之后
    #[inline]
    pub fn data_start(total_inodes: u32) -> BlockId {
        1 + total_inodes.div_ceil(super::INODES_PER_BLOCK as u32)
    }

    /// 块 0 的内容能否被当作本设备上已格式化的文件系统
    pub fn is_valid(&self, device_blocks: usize) -> bool {
        if self.total_blocks as usize != device_blocks || self.total_inodes == 0 {
            return false;
        }
        let data_start = Self::data_start(self.total_inodes);
        if data_start >= self.total_blocks {
            return false;
        }

        // 栈空也是合法状态：设备恰好写满
        match self.free_list {
            None => true,
            Some(head) => head >= 2 && head >= data_start && head < self.total_blocks,
        }
    }
}
