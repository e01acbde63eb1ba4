//! # 块设备接口层
//!
//! 块设备是以**块**为单位存储数据的设备；
//! [`BlockDevice`] 就是对读写块设备的抽象，
//! 实现了此特质的类型称为**块设备驱动**。
//!
//! 读写都是同步的：调用返回时数据已经落到设备上。
//! 块号越界属于调用者的编程错误，驱动直接 panic。

#![no_std]

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;
use core::any::Any;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

pub const BLOCK_SIZE: usize = 512;

/// 块设备驱动特质
pub trait BlockDevice: Send + Sync + Any {
    fn read_block(&self, block_id: usize, buf: &mut [u8]);
    fn write_block(&self, block_id: usize, buf: &[u8]);
    /// 设备总块数
    fn num_blocks(&self) -> usize;
}

/// 内存盘：定长的块数组，供模拟与测试使用
#[derive(Debug)]
pub struct MemDisk {
    data: Mutex<Vec<u8>>,
    num_blocks: usize,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemDisk {
    pub fn new(num_blocks: usize) -> Self {
        Self {
            data: Mutex::new(vec![0; num_blocks * BLOCK_SIZE]),
            num_blocks,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// 已执行的读块次数
    #[inline]
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// 已执行的写块次数
    #[inline]
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    fn range(&self, block_id: usize, len: usize) -> core::ops::Range<usize> {
        assert!(
            block_id < self.num_blocks,
            "block {block_id} out of range (device has {} blocks)",
            self.num_blocks
        );
        assert!(len <= BLOCK_SIZE, "buffer larger than a block");
        let start = block_id * BLOCK_SIZE;
        start..start + len
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        let range = self.range(block_id, buf.len());
        buf.copy_from_slice(&self.data.lock()[range]);
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        let range = self.range(block_id, buf.len());
        self.data.lock()[range].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn num_blocks(&self) -> usize {
        self.num_blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_disk() {
        let disk = MemDisk::new(4);
        let mut buf = [0u8; BLOCK_SIZE];
        buf[0] = 0xAB;
        buf[BLOCK_SIZE - 1] = 0xCD;
        disk.write_block(3, &buf);

        let mut back = [0u8; BLOCK_SIZE];
        disk.read_block(3, &mut back);
        assert_eq!(buf, back);

        disk.read_block(2, &mut back);
        assert!(back.iter().all(|&b| b == 0));
        assert_eq!((disk.reads(), disk.writes()), (2, 1));
    }

    #[test]
    #[should_panic]
    fn out_of_range() {
        let disk = MemDisk::new(4);
        disk.write_block(4, &[0; BLOCK_SIZE]);
    }
}
