//! inode 记录与它的区段
//!
//! - 直接索引：11 个块编号，覆盖文件前 11 块
//! - 间接索引：指向一个索引块，整个块连续存储 256 个 2 字节的块编号
//!
//! 区段必须从头连续分配，不允许空洞。
//!
//! ## 记录布局(32字节)
//!
//! | 偏移 | 字段 |
//! |---|---|
//! | 0..4 | length (i32) |
//! | 4..6 | count (i16) |
//! | 6..8 | flag (i16) |
//! | 8..30 | direct\[11\] (i16) |
//! | 30..32 | indirect (i16) |

use super::{decode_ptr, encode_ptr, read_i16, read_i32, write_i16, write_i32};
use crate::block::Block;
use crate::error::{Error, Result};
use crate::BlockDevice;
use crate::BlockId;
use crate::DataBlock;
use crate::Inumber;
use crate::{BLOCK_SIZE, DIRECT_COUNT, INDIRECT_COUNT, MAX_BLOCKS, MAX_FILE_SIZE};

pub const INODE_SIZE: usize = 32;
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;

/// inode 的访问状态，决定新的打开者能否立即进入
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(i16)]
pub enum AccessFlag {
    /// 无人打开
    #[default]
    Unused = 0,
    /// 只有读者
    Read = 1,
    /// 有一个写者，排斥其它一切打开
    Write = 2,
    /// 无人打开，但有写者在等
    UnusedWriteRequested = 3,
    /// 有读者，且有写者在等
    ReadWriteRequested = 4,
    /// 有写者，且另有写者在等
    WriteWriteRequested = 5,
}

impl AccessFlag {
    pub fn from_raw(raw: i16) -> Option<Self> {
        use AccessFlag::*;
        Some(match raw {
            0 => Unused,
            1 => Read,
            2 => Write,
            3 => UnusedWriteRequested,
            4 => ReadWriteRequested,
            5 => WriteWriteRequested,
            _ => return None,
        })
    }

    #[inline]
    pub fn raw(self) -> i16 {
        self as i16
    }

    #[inline]
    pub fn write_requested(self) -> bool {
        use AccessFlag::*;
        matches!(
            self,
            UnusedWriteRequested | ReadWriteRequested | WriteWriteRequested
        )
    }

    /// 以读(`write == false`)或写的方式请求打开。
    ///
    /// `Ok` 携带放行后的状态；`Err` 携带请求者应当等待时记下的状态。
    /// 有写者在等时，新读者同样需要等待。
    pub fn request(self, write: bool) -> core::result::Result<Self, Self> {
        use AccessFlag::*;
        match (self, write) {
            (Unused | Read, false) => Ok(Read),
            (Unused | UnusedWriteRequested, true) => Ok(Write),
            (Read | ReadWriteRequested, true) => Err(ReadWriteRequested),
            (Write | WriteWriteRequested, true) => Err(WriteWriteRequested),
            (state, false) => Err(state),
        }
    }

    /// 最后一个打开者离开
    #[inline]
    pub fn release(self) -> Self {
        if self.write_requested() {
            Self::UnusedWriteRequested
        } else {
            Self::Unused
        }
    }
}

/// 一个文件的元信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    /// 文件字节数
    pub length: u32,
    /// 引用此 inode 的打开次数
    pub count: u16,
    pub flag: AccessFlag,
    direct: [Option<BlockId>; DIRECT_COUNT],
    indirect: Option<BlockId>,
}

/// 从 inode 上摘下的索引块
#[derive(Debug)]
pub struct IndexBlock {
    pub block_id: BlockId,
    entries: [i16; INDIRECT_COUNT],
}

impl Default for Inode {
    fn default() -> Self {
        Self::new()
    }
}

impl Inode {
    pub fn new() -> Self {
        Self {
            length: 0,
            count: 0,
            flag: AccessFlag::Unused,
            direct: [None; DIRECT_COUNT],
            indirect: None,
        }
    }

    /// 通过编号获取 inode 在磁盘上的位置：**块ID**以及**块内偏移**
    #[inline]
    pub fn position(inumber: Inumber) -> (BlockId, usize) {
        let inumber = inumber as usize;
        (
            (1 + inumber / INODES_PER_BLOCK) as BlockId,
            inumber % INODES_PER_BLOCK * INODE_SIZE,
        )
    }

    pub fn load(inumber: Inumber, block_device: &dyn BlockDevice) -> Self {
        let (block_id, offset) = Self::position(inumber);
        Block::load(block_id, block_device)
            .map(|data| Self::decode(&data[offset..offset + INODE_SIZE]))
    }

    /// 写回所在的 inode 块，同块的其它记录保持原样
    pub fn to_disk(&self, inumber: Inumber, block_device: &dyn BlockDevice) {
        let (block_id, offset) = Self::position(inumber);
        Block::load(block_id, block_device)
            .map_mut(|data| self.encode(&mut data[offset..offset + INODE_SIZE]));
    }

    pub(crate) fn decode(record: &[u8]) -> Self {
        let flag = read_i16(record, 6);
        let flag = AccessFlag::from_raw(flag).unwrap_or_else(|| {
            log::warn!("unknown access flag {flag}, treated as unused");
            AccessFlag::Unused
        });

        let mut direct = [None; DIRECT_COUNT];
        for (i, ptr) in direct.iter_mut().enumerate() {
            *ptr = decode_ptr(read_i16(record, 8 + i * 2));
        }

        let length = read_i32(record, 0).clamp(0, MAX_FILE_SIZE as i32) as u32;

        Self {
            length,
            count: read_i16(record, 4).max(0) as u16,
            flag,
            direct,
            indirect: decode_ptr(read_i16(record, 8 + DIRECT_COUNT * 2)),
        }
    }

    pub(crate) fn encode(&self, record: &mut [u8]) {
        write_i32(record, 0, self.length as i32);
        write_i16(record, 4, self.count as i16);
        write_i16(record, 6, self.flag.raw());
        for (i, &ptr) in self.direct.iter().enumerate() {
            write_i16(record, 8 + i * 2, encode_ptr(ptr));
        }
        write_i16(record, 8 + DIRECT_COUNT * 2, encode_ptr(self.indirect));
    }

    #[inline]
    pub fn direct(&self) -> &[Option<BlockId>; DIRECT_COUNT] {
        &self.direct
    }

    #[inline]
    pub fn find_index_block(&self) -> Option<BlockId> {
        self.indirect
    }

    /// 找到包含字节偏移 `offset` 的数据块
    pub fn find_target_block(
        &self,
        offset: usize,
        block_device: &dyn BlockDevice,
    ) -> Option<BlockId> {
        let block_index = offset / BLOCK_SIZE;

        if block_index < DIRECT_COUNT {
            self.direct[block_index]
        } else if block_index < MAX_BLOCKS {
            let slot = block_index - DIRECT_COUNT;
            Block::load(self.indirect?, block_device)
                .map(|index_block| decode_ptr(read_i16(index_block, slot * 2)))
        } else {
            None
        }
    }

    /// 为字节偏移 `offset` 所在的块登记数据块 `block_id`
    pub fn register_target_block(
        &mut self,
        offset: usize,
        block_id: BlockId,
        block_device: &dyn BlockDevice,
    ) -> Result<()> {
        let block_index = offset / BLOCK_SIZE;

        if block_index < DIRECT_COUNT {
            if self.direct[block_index].is_some() {
                return Err(Error::BlockAlreadyRegistered);
            }
            if self.direct[..block_index].iter().any(Option::is_none) {
                return Err(Error::PrecedingBlockUnused);
            }
            self.direct[block_index] = Some(block_id);
            return Ok(());
        }

        if block_index >= MAX_BLOCKS {
            return Err(Error::FileTooLarge);
        }
        let indirect = self.indirect.ok_or(Error::IndirectNull)?;

        let slot = block_index - DIRECT_COUNT;
        let mut index_block = Block::load(indirect, block_device);
        let (current, preceding) = index_block.map(|data| {
            (
                decode_ptr(read_i16(data, slot * 2)),
                slot.checked_sub(1)
                    .map(|prev| decode_ptr(read_i16(data, prev * 2))),
            )
        });
        if current.is_some() {
            return Err(Error::BlockAlreadyRegistered);
        }
        if let Some(None) = preceding {
            return Err(Error::PrecedingBlockUnused);
        }

        index_block.map_mut(|data| write_i16(data, slot * 2, encode_ptr(Some(block_id))));
        Ok(())
    }

    /// 直接索引全部登记后，才能登记唯一的索引块
    pub fn register_index_block(
        &mut self,
        block_id: BlockId,
        block_device: &dyn BlockDevice,
    ) -> Result<()> {
        if self.direct.iter().any(Option::is_none) {
            return Err(Error::PrecedingBlockUnused);
        }
        if self.indirect.is_some() {
            return Err(Error::BlockAlreadyRegistered);
        }

        Block::zeroed(block_id, block_device).map_mut(|data| {
            for slot in 0..INDIRECT_COUNT {
                write_i16(data, slot * 2, encode_ptr(None));
            }
        });
        self.indirect = Some(block_id);
        Ok(())
    }

    /// 摘下索引块并交出其原始内容
    pub fn unregister_index_block(
        &mut self,
        block_device: &dyn BlockDevice,
    ) -> Option<IndexBlock> {
        let block_id = self.indirect.take()?;
        Some(Block::load(block_id, block_device).map(|data| IndexBlock::decode(block_id, data)))
    }

    /// 从指定位置(字节偏移)读出数据填充`buf`，遇到文件尾或未分配块即停
    pub fn read_at(&self, offset: usize, buf: &mut [u8], block_device: &dyn BlockDevice) -> usize {
        let mut start = offset;
        let end = (offset + buf.len()).min(self.length as usize);

        // 已读取多少字节
        let mut read_size = 0;
        while start < end {
            let block_index = start / BLOCK_SIZE;
            let Some(block_id) = self.find_target_block(start, block_device) else {
                break;
            };
            // 当前块的末地址(字节)
            let current_block_end = ((block_index + 1) * BLOCK_SIZE).min(end);
            let block_read_size = current_block_end - start;
            let dest = &mut buf[read_size..read_size + block_read_size];

            Block::load(block_id, block_device).map(|data_block| {
                // 绝对地址 % 块大小 = 块内偏移
                let src = &data_block[start % BLOCK_SIZE..start % BLOCK_SIZE + block_read_size];
                dest.copy_from_slice(src);
            });

            read_size += block_read_size;
            start = current_block_end;
        }

        read_size
    }

    /// 从指定位置写入`buf`，按需向 `alloc` 要新块(必要时先要索引块)。
    ///
    /// 部分块的写入会保留块内其它字节。
    /// 一个字节都没写进去时才报错，否则返回实际写入的字节数。
    pub fn write_at(
        &mut self,
        offset: usize,
        buf: &[u8],
        block_device: &dyn BlockDevice,
        mut alloc: impl FnMut() -> Option<BlockId>,
    ) -> Result<usize> {
        let mut start = offset;
        let end = offset + buf.len();

        let mut written_size = 0;
        let mut failure = None;
        while start < end {
            let block_index = start / BLOCK_SIZE;
            if block_index >= MAX_BLOCKS {
                failure = Some(Error::FileTooLarge);
                break;
            }

            let block_id = match self.find_target_block(start, block_device) {
                Some(block_id) => block_id,
                None => match self.extend(start, block_device, &mut alloc) {
                    Ok(block_id) => block_id,
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                },
            };

            let current_block_end = ((block_index + 1) * BLOCK_SIZE).min(end);
            let block_write_size = current_block_end - start;
            let src = &buf[written_size..written_size + block_write_size];

            let mut block = if block_write_size == BLOCK_SIZE {
                Block::zeroed(block_id, block_device)
            } else {
                Block::load(block_id, block_device)
            };
            block.map_mut(|data_block| {
                let dest =
                    &mut data_block[start % BLOCK_SIZE..start % BLOCK_SIZE + block_write_size];
                dest.copy_from_slice(src);
            });

            written_size += block_write_size;
            start = current_block_end;
        }

        if written_size > 0 {
            self.length = self.length.max((offset + written_size) as u32);
        }

        match failure {
            Some(err) if written_size == 0 => Err(err),
            _ => Ok(written_size),
        }
    }

    /// 摘下全部数据块与索引块，交给调用者归还
    pub fn clear(&mut self, block_device: &dyn BlockDevice) -> Vec<BlockId> {
        let mut drop_blocks: Vec<BlockId> = self.direct.iter_mut().filter_map(Option::take).collect();

        if let Some(index_block) = self.unregister_index_block(block_device) {
            drop_blocks.extend(index_block.targets());
            drop_blocks.push(index_block.block_id);
        }
        self.length = 0;

        drop_blocks
    }

    /// 计算容纳指定数据量需要多少个**数据块**
    #[inline]
    pub fn count_data_block(size: u32) -> usize {
        (size as usize).div_ceil(BLOCK_SIZE)
    }

    /// 为 `offset` 所在的块分配并登记新块
    fn extend(
        &mut self,
        offset: usize,
        block_device: &dyn BlockDevice,
        alloc: &mut impl FnMut() -> Option<BlockId>,
    ) -> Result<BlockId> {
        if offset / BLOCK_SIZE >= DIRECT_COUNT && self.indirect.is_none() {
            let index_block = alloc().ok_or(Error::NoFreeBlock)?;
            self.register_index_block(index_block, block_device)?;
        }

        let block_id = alloc().ok_or(Error::NoFreeBlock)?;
        self.register_target_block(offset, block_id, block_device)
            .inspect_err(|err| log::error!("block {block_id} leaked: {err}"))?;
        Ok(block_id)
    }
}

impl IndexBlock {
    fn decode(block_id: BlockId, data: &DataBlock) -> Self {
        let mut entries = [0; INDIRECT_COUNT];
        for (slot, entry) in entries.iter_mut().enumerate() {
            *entry = read_i16(data, slot * 2);
        }
        Self { block_id, entries }
    }

    #[inline]
    pub fn get(&self, slot: usize) -> Option<BlockId> {
        decode_ptr(self.entries[slot])
    }

    /// 所有已登记的数据块
    pub fn targets(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.entries.iter().filter_map(|&raw| decode_ptr(raw))
    }
}

#[cfg(test)]
mod tests {
    use block_dev::MemDisk;

    use super::*;

    /// 从 `first` 开始依次发放块号
    fn bump(first: BlockId) -> impl FnMut() -> Option<BlockId> {
        let mut next = first;
        move || {
            next += 1;
            Some(next - 1)
        }
    }

    #[test]
    fn record_size() {
        let mut record = [0u8; INODE_SIZE];
        Inode::new().encode(&mut record);
        assert_eq!(&record[8..10], &(-1i16).to_le_bytes());
        assert_eq!(&record[30..32], &(-1i16).to_le_bytes());
        assert_eq!(INODES_PER_BLOCK, 16);
    }

    #[test]
    fn disk_round_trip() {
        let disk = MemDisk::new(8);
        let mut inode = Inode::new();
        inode.length = 6000;
        inode.count = 3;
        inode.flag = AccessFlag::ReadWriteRequested;
        for (i, ptr) in inode.direct.iter_mut().enumerate() {
            *ptr = Some(100 + i as BlockId);
        }
        inode.indirect = Some(7);

        // 同一块里的相邻记录不应被覆盖
        let neighbour = Inode {
            length: 1,
            ..Inode::new()
        };
        neighbour.to_disk(16, &disk);
        inode.to_disk(17, &disk);

        assert_eq!(Inode::position(17), (2, 32));
        assert_eq!(Inode::load(17, &disk), inode);
        assert_eq!(Inode::load(16, &disk), neighbour);
    }

    #[test]
    fn register_rules() {
        let disk = MemDisk::new(64);
        let mut inode = Inode::new();

        assert_eq!(
            inode.register_target_block(BLOCK_SIZE, 20, &disk),
            Err(Error::PrecedingBlockUnused)
        );
        inode.register_target_block(0, 20, &disk).unwrap();
        assert_eq!(
            inode.register_target_block(10, 21, &disk),
            Err(Error::BlockAlreadyRegistered)
        );
        assert_eq!(inode.find_target_block(BLOCK_SIZE - 1, &disk), Some(20));

        let past_direct = DIRECT_COUNT * BLOCK_SIZE;
        assert_eq!(
            inode.register_target_block(past_direct, 40, &disk),
            Err(Error::IndirectNull)
        );
        assert_eq!(
            inode.register_index_block(40, &disk),
            Err(Error::PrecedingBlockUnused)
        );

        for i in 1..DIRECT_COUNT {
            inode
                .register_target_block(i * BLOCK_SIZE, 20 + i as BlockId, &disk)
                .unwrap();
        }
        inode.register_index_block(40, &disk).unwrap();
        assert_eq!(
            inode.register_index_block(41, &disk),
            Err(Error::BlockAlreadyRegistered)
        );
        assert_eq!(inode.find_target_block(past_direct, &disk), None);

        assert_eq!(
            inode.register_target_block(past_direct + BLOCK_SIZE, 42, &disk),
            Err(Error::PrecedingBlockUnused)
        );
        inode.register_target_block(past_direct, 41, &disk).unwrap();
        assert_eq!(inode.find_target_block(past_direct + 1, &disk), Some(41));
        assert_eq!(
            inode.register_target_block(MAX_BLOCKS * BLOCK_SIZE, 43, &disk),
            Err(Error::FileTooLarge)
        );

        let index = inode.unregister_index_block(&disk).unwrap();
        assert_eq!(index.block_id, 40);
        assert_eq!(index.get(0), Some(41));
        assert_eq!(index.get(1), None);
        assert_eq!(inode.find_index_block(), None);
    }

    #[test]
    fn write_then_read_spanning_indirect() {
        let disk = MemDisk::new(64);
        let mut inode = Inode::new();
        let data: Vec<u8> = (0..13 * BLOCK_SIZE + 100).map(|i| (i % 251) as u8).collect();

        assert_eq!(inode.write_at(0, &data, &disk, bump(10)), Ok(data.len()));
        assert_eq!(inode.length as usize, data.len());
        // 11 个直接块之后，先分配索引块(21)再分配数据块
        assert_eq!(inode.find_index_block(), Some(21));
        assert_eq!(
            inode.find_target_block(DIRECT_COUNT * BLOCK_SIZE, &disk),
            Some(22)
        );

        let mut back = vec![0; data.len() + 50];
        assert_eq!(inode.read_at(0, &mut back, &disk), data.len());
        assert_eq!(&back[..data.len()], &data[..]);

        // 跨块的局部覆写保留两侧字节
        let patch = [0xEE; 700];
        let at = 11 * BLOCK_SIZE - 300;
        assert_eq!(inode.write_at(at, &patch, &disk, || None), Ok(700));
        let mut window = [0u8; 702];
        inode.read_at(at - 1, &mut window, &disk);
        assert_eq!(window[0], data[at - 1]);
        assert!(window[1..701].iter().all(|&b| b == 0xEE));
        assert_eq!(window[701], data[at + 700]);
    }

    #[test]
    fn write_out_of_space() {
        let disk = MemDisk::new(64);
        let mut inode = Inode::new();
        let mut budget = [30, 31].into_iter();

        let data = [1u8; 3 * BLOCK_SIZE];
        assert_eq!(
            inode.write_at(0, &data, &disk, || budget.next()),
            Ok(2 * BLOCK_SIZE)
        );
        assert_eq!(inode.length as usize, 2 * BLOCK_SIZE);
        assert_eq!(
            inode.write_at(2 * BLOCK_SIZE, &data, &disk, || None),
            Err(Error::NoFreeBlock)
        );
    }

    #[test]
    fn clear_returns_everything() {
        let disk = MemDisk::new(64);
        let mut inode = Inode::new();
        let data = vec![7u8; 12 * BLOCK_SIZE + 1];
        inode.write_at(0, &data, &disk, bump(10)).unwrap();

        let mut blocks = inode.clear(&disk);
        blocks.sort_unstable();
        // 13 个数据块 + 1 个索引块
        assert_eq!(blocks, (10..24).collect::<Vec<_>>());
        assert_eq!(inode.length, 0);
        assert_eq!(inode.direct(), &[None; DIRECT_COUNT]);
        assert_eq!(inode.find_index_block(), None);
    }

    #[test]
    fn corrupt_length_is_clamped() {
        let mut record = [0; INODE_SIZE];
        Inode::new().encode(&mut record);

        write_i32(&mut record, 0, i32::MAX);
        assert_eq!(Inode::decode(&record).length, MAX_FILE_SIZE as u32);
        write_i32(&mut record, 0, -5);
        assert_eq!(Inode::decode(&record).length, 0);
    }

    #[test]
    fn access_flag_transitions() {
        use AccessFlag::*;

        assert_eq!(Unused.request(false), Ok(Read));
        assert_eq!(Read.request(false), Ok(Read));
        assert_eq!(Unused.request(true), Ok(Write));
        assert_eq!(Read.request(true), Err(ReadWriteRequested));
        assert_eq!(Write.request(true), Err(WriteWriteRequested));
        assert_eq!(Write.request(false), Err(Write));
        // 写者优先：有写者在等时读者也要等
        assert_eq!(ReadWriteRequested.request(false), Err(ReadWriteRequested));
        assert_eq!(UnusedWriteRequested.request(false), Err(UnusedWriteRequested));
        assert_eq!(UnusedWriteRequested.request(true), Ok(Write));

        assert_eq!(WriteWriteRequested.release(), UnusedWriteRequested);
        assert_eq!(Read.release(), Unused);
        assert_eq!(AccessFlag::from_raw(9), None);
        assert_eq!(AccessFlag::from_raw(4), Some(ReadWriteRequested));
    }
}
