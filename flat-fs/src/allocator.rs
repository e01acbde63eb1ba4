//! # 磁盘块管理器层
//!
//! 超级块在内存中的副本，以及串在空闲块头 4 字节里的空闲块栈。
//! 元数据只经由 [`BlockAllocator::get_free_block`]、
//! [`BlockAllocator::return_block`] 与 [`BlockAllocator::sync`] 改动，
//! 调用者负责把它放在锁后面。

use std::sync::Arc;

use crate::block::Block;
use crate::layout::{read_i32, write_i32, Inode, SuperBlock, INODE_SIZE, NULL};
use crate::BlockDevice;
use crate::BlockId;
use crate::{Error, Result};
use crate::{DEFAULT_INODES, MAX_DEVICE_BLOCKS, MAX_FILES};

pub struct BlockAllocator {
    super_block: SuperBlock,
    block_device: Arc<dyn BlockDevice>,
}

impl BlockAllocator {
    /// 读出块 0；无法识别时以默认 inode 数格式化整个设备
    pub fn mount(block_device: Arc<dyn BlockDevice>) -> Result<Self> {
        let num_blocks = block_device.num_blocks();
        if num_blocks > MAX_DEVICE_BLOCKS {
            log::error!("device of {num_blocks} blocks exceeds 16-bit block pointers");
            return Err(Error::InvalidArgument);
        }
        if num_blocks == 0 {
            return Err(Error::InvalidArgument);
        }

        let super_block = Block::load(0, &*block_device).map(SuperBlock::decode);
        if super_block.is_valid(num_blocks) {
            log::info!(
                "mounted: {} blocks, {} inodes",
                super_block.total_blocks,
                super_block.total_inodes
            );
            return Ok(Self {
                super_block,
                block_device,
            });
        }

        log::warn!("unrecognized superblock, formatting with {DEFAULT_INODES} inodes");
        let mut allocator = Self {
            super_block: SuperBlock {
                total_blocks: num_blocks as u32,
                total_inodes: 0,
                free_list: None,
            },
            block_device,
        };
        allocator.format(DEFAULT_INODES)?;
        Ok(allocator)
    }

    /// 重写 inode 表，把全部数据块串成空闲块栈
    pub fn format(&mut self, total_inodes: u32) -> Result<()> {
        let total_blocks = self.super_block.total_blocks;
        if total_inodes == 0 || total_inodes > MAX_FILES {
            return Err(Error::InvalidArgument);
        }
        let data_start = SuperBlock::data_start(total_inodes);
        if data_start >= total_blocks {
            return Err(Error::InvalidArgument);
        }

        let block_device = &*self.block_device;

        // 全零的记录会被读成指向块 0 的指针
        let mut record = [0u8; INODE_SIZE];
        Inode::new().encode(&mut record);
        for block_id in 1..data_start {
            Block::zeroed(block_id, block_device).map_mut(|data| {
                for slot in data.chunks_exact_mut(INODE_SIZE) {
                    slot.copy_from_slice(&record);
                }
            });
        }

        for block_id in data_start..total_blocks {
            let next = if block_id + 1 < total_blocks {
                (block_id + 1) as i32
            } else {
                NULL
            };
            Block::zeroed(block_id, block_device).map_mut(|data| write_i32(data, 0, next));
        }

        self.super_block = SuperBlock {
            total_blocks,
            total_inodes,
            free_list: Some(data_start),
        };
        self.sync();
        log::info!("formatted: {total_blocks} blocks, {total_inodes} inodes");

        Ok(())
    }

    /// 弹出空闲块栈顶；`None` 即空间耗尽
    pub fn get_free_block(&mut self) -> Option<BlockId> {
        let head = self.super_block.free_list?;
        let next = Block::load(head, &*self.block_device).map(|data| read_i32(data, 0));

        self.super_block.free_list = match next {
            NULL => None,
            next if self.in_data_area(next) => Some(next as BlockId),
            next => {
                log::error!("free list corrupted: block {head} links to {next}");
                None
            }
        };
        log::debug!("allocated block {head}");

        Some(head)
    }

    /// 压回空闲块栈；同一块不能归还两次
    pub fn return_block(&mut self, block_id: BlockId) {
        debug_assert!(self.in_data_area(block_id as i32));

        let head = self.super_block.free_list.map_or(NULL, |id| id as i32);
        Block::zeroed(block_id, &*self.block_device).map_mut(|data| write_i32(data, 0, head));
        self.super_block.free_list = Some(block_id);
        log::debug!("returned block {block_id}");
    }

    /// 把超级块写回块 0
    pub fn sync(&self) {
        Block::zeroed(0, &*self.block_device).map_mut(|data| self.super_block.encode(data));
    }

    /// 沿空闲块栈数出空闲块个数
    pub fn free_blocks(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.super_block.free_list;
        while let Some(block_id) = cursor {
            count += 1;
            if count > self.super_block.total_blocks as usize {
                log::error!("free list contains a cycle");
                break;
            }
            let next = Block::load(block_id, &*self.block_device).map(|data| read_i32(data, 0));
            cursor = self.in_data_area(next).then_some(next as BlockId);
        }
        count
    }

    #[inline]
    pub fn total_blocks(&self) -> u32 {
        self.super_block.total_blocks
    }

    #[inline]
    pub fn total_inodes(&self) -> u32 {
        self.super_block.total_inodes
    }

    #[inline]
    pub fn data_start(&self) -> BlockId {
        SuperBlock::data_start(self.super_block.total_inodes)
    }

    #[inline]
    pub fn super_block(&self) -> &SuperBlock {
        &self.super_block
    }

    fn in_data_area(&self, block_id: i32) -> bool {
        block_id >= self.data_start() as i32 && block_id < self.super_block.total_blocks as i32
    }
}
