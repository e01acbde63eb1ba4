//! # 文件系统层
//!
//! 对外的文件操作：按名字打开、读写、定位、关闭与删除。
//! 读写在打开项锁与共享 inode 锁之下完成，
//! 同一文件的多个打开项因此串行访问 inode。

use std::sync::Arc;

use spin::Mutex;

use crate::allocator::BlockAllocator;
use crate::directory::Directory;
use crate::file_table::{Access, FileTable, FileTableEntry, Mode};
use crate::layout::Inode;
use crate::BlockDevice;
use crate::Inumber;
use crate::{Error, Result};
use crate::ROOT_INUMBER;

/// 定位的基准
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// 文件头
    Set,
    /// 当前读写指针
    Cur,
    /// 文件尾
    End,
}

impl TryFrom<i32> for Whence {
    type Error = Error;

    fn try_from(whence: i32) -> Result<Self> {
        match whence {
            0 => Ok(Whence::Set),
            1 => Ok(Whence::Cur),
            2 => Ok(Whence::End),
            _ => Err(Error::InvalidWhence),
        }
    }
}

pub struct FileSystem {
    block_device: Arc<dyn BlockDevice>,
    allocator: Arc<Mutex<BlockAllocator>>,
    table: FileTable,
}

impl FileSystem {
    /// 挂载设备；无法识别的设备先被格式化。
    ///
    /// 目录从根文件(inode 0)的内容中恢复。
    pub fn mount(block_device: Arc<dyn BlockDevice>) -> Result<Self> {
        let allocator = BlockAllocator::mount(block_device.clone())?;
        let mut directory = Directory::new(allocator.total_inodes());

        let root = Inode::load(ROOT_INUMBER, &*block_device);
        if root.length > 0 {
            let mut data = vec![0; root.length as usize];
            let read = root.read_at(0, &mut data, &*block_device);
            directory.bytes2directory(&data[..read]);
        }

        let allocator = Arc::new(Mutex::new(allocator));
        Ok(Self {
            table: FileTable::new(directory, allocator.clone(), block_device.clone()),
            block_device,
            allocator,
        })
    }

    /// 以 `max_files` 个 inode 重新格式化；有文件打开时拒绝
    pub fn format(&self, max_files: u32) -> Result<()> {
        self.table.format(max_files)?;
        log::info!("reformatted with {max_files} files");
        Ok(())
    }

    pub fn open(&self, name: &str, mode: Mode) -> Result<Arc<FileTableEntry>> {
        let entry = self.table.falloc(name, mode)?;
        if !mode.access().contains(Access::TRUNCATE) {
            return Ok(entry);
        }

        if self.table.open_count(entry.inumber()) > 1 {
            log::warn!("{name:?} is shared, refusing to truncate");
            self.table.ffree(&entry)?;
            return Err(Error::Busy);
        }
        self.table.truncate(entry.inumber(), &mut entry.inode().lock());

        Ok(entry)
    }

    /// 从读写指针处读入 `buf`，返回读到的字节数；读到文件尾时可能不足
    pub fn read(&self, entry: &FileTableEntry, buf: &mut [u8]) -> Result<usize> {
        let mut state = entry.lock()?;
        if !entry.mode().access().contains(Access::READ) {
            return Err(Error::AccessDenied);
        }

        let inode = entry.inode().lock();
        let read_size = inode.read_at(state.seek as usize, buf, &*self.block_device);
        state.seek += read_size as u32;

        Ok(read_size)
    }

    /// 从读写指针处写入 `buf`，按需分配块。
    ///
    /// 空间不足时返回已写入的字节数；一个字节都没写进去才报错。
    pub fn write(&self, entry: &FileTableEntry, buf: &[u8]) -> Result<usize> {
        let mut state = entry.lock()?;
        let access = entry.mode().access();
        if !access.contains(Access::WRITE) {
            return Err(Error::AccessDenied);
        }

        let mut inode = entry.inode().lock();
        if access.contains(Access::APPEND) {
            state.seek = inode.length;
        }
        let written = inode.write_at(state.seek as usize, buf, &*self.block_device, || {
            self.allocator.lock().get_free_block()
        })?;
        state.seek += written as u32;

        if written < buf.len() {
            log::warn!(
                "short write on inode {}: {written} of {} bytes",
                entry.inumber(),
                buf.len()
            );
        }
        Ok(written)
    }

    /// 移动读写指针，结果夹在 `[0, 文件长度]` 之内
    pub fn seek(&self, entry: &FileTableEntry, offset: i64, whence: Whence) -> Result<u32> {
        let mut state = entry.lock()?;
        let length = entry.inode().lock().length as i64;

        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => state.seek as i64,
            Whence::End => length,
        };
        state.seek = base.saturating_add(offset).clamp(0, length) as u32;

        Ok(state.seek)
    }

    pub fn close(&self, entry: &FileTableEntry) -> Result<()> {
        self.table.release(entry)
    }

    /// 删除文件：名字立即消失，仍被打开的文件在最后一次关闭时回收
    pub fn delete(&self, name: &str) -> Result<()> {
        self.table.delete(name)
    }

    pub fn fsize(&self, entry: &FileTableEntry) -> Result<u32> {
        let _state = entry.lock()?;
        let length = entry.inode().lock().length;
        Ok(length)
    }

    /// 子线程继承打开项
    pub fn dup(&self, entry: &Arc<FileTableEntry>) -> Result<Arc<FileTableEntry>> {
        self.table.dup(entry)
    }

    /// 把目录写入根文件，把超级块写回块 0。
    ///
    /// 根文件被打开着也不会阻塞。
    pub fn sync(&self) -> Result<()> {
        let data = self.table.directory_bytes();
        if self.table.write_root(&data)? < data.len() {
            log::error!("directory does not fit into the root file");
            return Err(Error::NoFreeBlock);
        }

        self.allocator.lock().sync();
        Ok(())
    }

    /// 目录中的 `(inode 编号, 文件名)`，不含根目录
    pub fn list(&self) -> Vec<(Inumber, String)> {
        let mut files = self.table.list();
        files.retain(|&(inumber, _)| inumber != ROOT_INUMBER);
        files
    }

    pub fn free_blocks(&self) -> usize {
        self.allocator.lock().free_blocks()
    }

    pub fn total_blocks(&self) -> u32 {
        self.allocator.lock().total_blocks()
    }

    pub fn total_inodes(&self) -> u32 {
        self.allocator.lock().total_inodes()
    }

    #[inline]
    pub fn table(&self) -> &FileTable {
        &self.table
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        self.table.reclaim_orphans();
        if let Err(err) = self.sync() {
            log::error!("failed to sync on unmount: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use block_dev::{MemDisk, BLOCK_SIZE};

    use super::*;

    fn fs(num_blocks: usize) -> FileSystem {
        let _ = env_logger::builder().is_test(true).try_init();
        FileSystem::mount(Arc::new(MemDisk::new(num_blocks))).unwrap()
    }

    #[test]
    fn whence_codes() {
        assert_eq!(Whence::try_from(2), Ok(Whence::End));
        assert_eq!(Whence::try_from(3), Err(Error::InvalidWhence));
        assert_eq!(Whence::try_from(-1), Err(Error::InvalidWhence));
    }

    #[test]
    fn access_checks() {
        let fs = fs(100);
        let w = fs.open("f", Mode::Write).unwrap();
        assert_eq!(fs.read(&w, &mut [0; 4]), Err(Error::AccessDenied));
        fs.write(&w, b"data").unwrap();
        fs.close(&w).unwrap();

        let r = fs.open("f", Mode::Read).unwrap();
        assert_eq!(fs.write(&r, b"x"), Err(Error::AccessDenied));
        fs.close(&r).unwrap();

        assert_eq!(fs.fsize(&r), Err(Error::TableEntryNotFound));
        assert_eq!(fs.close(&r), Err(Error::TableEntryNotFound));
    }

    #[test]
    fn append_goes_to_end() {
        let fs = fs(100);
        let w = fs.open("log", Mode::Write).unwrap();
        fs.write(&w, b"hello").unwrap();
        fs.close(&w).unwrap();

        let a = fs.open("log", Mode::Append).unwrap();
        fs.write(&a, b", world").unwrap();
        fs.close(&a).unwrap();

        let r = fs.open("log", Mode::Read).unwrap();
        let mut buf = [0; 32];
        let n = fs.read(&r, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello, world");
        fs.close(&r).unwrap();
    }

    #[test]
    fn read_write_mode_keeps_content() {
        let fs = fs(100);
        let w = fs.open("f", Mode::Write).unwrap();
        fs.write(&w, &[1; BLOCK_SIZE + 10]).unwrap();
        fs.close(&w).unwrap();

        let rw = fs.open("f", Mode::ReadWrite).unwrap();
        assert_eq!(fs.fsize(&rw), Ok(BLOCK_SIZE as u32 + 10));
        fs.seek(&rw, 5, Whence::Set).unwrap();
        fs.write(&rw, &[2; 3]).unwrap();
        fs.seek(&rw, 0, Whence::Set).unwrap();

        let mut buf = [0; 10];
        fs.read(&rw, &mut buf).unwrap();
        assert_eq!(buf, [1, 1, 1, 1, 1, 2, 2, 2, 1, 1]);
        fs.close(&rw).unwrap();
    }

    #[test]
    fn sync_while_root_is_open() {
        let fs = fs(100);
        let w = fs.open("f", Mode::Write).unwrap();
        fs.close(&w).unwrap();

        let root = fs.open("/", Mode::Read).unwrap();
        fs.sync().unwrap();

        // 打开着的根文件看到的是刚写入的目录
        let mut blob = vec![0; 64 * Directory::SLOT_BYTES];
        assert_eq!(fs.read(&root, &mut blob), Ok(blob.len()));
        assert_eq!(&blob[4..8], &1i32.to_le_bytes());
        fs.close(&root).unwrap();
        assert!(fs.table().is_empty());
    }

    #[test]
    fn format_refused_while_open() {
        let fs = fs(100);
        let f = fs.open("f", Mode::Write).unwrap();
        assert_eq!(fs.format(16), Err(Error::Busy));
        fs.close(&f).unwrap();

        fs.format(16).unwrap();
        assert_eq!(fs.total_inodes(), 16);
        assert!(fs.list().is_empty());
        assert_eq!(fs.free_blocks(), 100 - 2);
    }
}
