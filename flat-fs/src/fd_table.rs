//! # 文件描述符层
//!
//! 每个线程一张描述符表。0、1、2 留给标准输入输出，从不分配。

use std::sync::Arc;

use crate::file_table::FileTableEntry;
use crate::fs::FileSystem;
use crate::Result;

pub struct FdTable {
    slots: Vec<Option<Arc<FileTableEntry>>>,
}

impl FdTable {
    pub const CAPACITY: usize = 32;
    /// 第一个可分配的描述符
    pub const FIRST_FD: usize = 3;

    pub fn new() -> Self {
        Self {
            slots: vec![None; Self::CAPACITY],
        }
    }

    /// 放进最小的空闲描述符；表满时返回 `None`
    pub fn insert(&mut self, entry: Arc<FileTableEntry>) -> Option<usize> {
        let fd = (Self::FIRST_FD..Self::CAPACITY).find(|&fd| self.slots[fd].is_none())?;
        self.slots[fd] = Some(entry);
        Some(fd)
    }

    pub fn get(&self, fd: usize) -> Option<&Arc<FileTableEntry>> {
        self.slots.get(fd)?.as_ref()
    }

    pub fn remove(&mut self, fd: usize) -> Option<Arc<FileTableEntry>> {
        if fd < Self::FIRST_FD {
            return None;
        }
        self.slots.get_mut(fd)?.take()
    }

    /// 已占用的描述符个数
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 派生子线程：复制每个描述符，共享的打开项各增加一次打开计数
    pub fn inherit(&self, fs: &FileSystem) -> Result<FdTable> {
        let mut child = FdTable::new();
        for (fd, slot) in self.slots.iter().enumerate() {
            if let Some(entry) = slot {
                match fs.dup(entry) {
                    Ok(entry) => child.slots[fd] = Some(entry),
                    Err(err) => {
                        child.drain(fs);
                        return Err(err);
                    }
                }
            }
        }
        Ok(child)
    }

    /// 线程退出：关闭全部描述符
    pub fn drain(&mut self, fs: &FileSystem) {
        for (fd, slot) in self.slots.iter_mut().enumerate() {
            if let Some(entry) = slot.take() {
                if let Err(err) = fs.close(&entry) {
                    log::warn!("fd {fd}: close on exit failed: {err}");
                }
            }
        }
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use block_dev::MemDisk;

    use super::*;
    use crate::Mode;

    #[test]
    fn lowest_free_fd() {
        let fs = FileSystem::mount(Arc::new(MemDisk::new(100))).unwrap();
        let mut fds = FdTable::new();

        let a = fs.open("a", Mode::Write).unwrap();
        let b = fs.open("b", Mode::Write).unwrap();
        assert_eq!(fds.insert(a), Some(3));
        assert_eq!(fds.insert(b), Some(4));
        assert!(fds.remove(1).is_none());

        let a = fds.remove(3).unwrap();
        assert_eq!(fds.insert(a), Some(3));
        assert_eq!(fds.len(), 2);

        fds.drain(&fs);
        assert!(fds.is_empty());
        assert!(fs.table().is_empty());
    }

    #[test]
    fn full_table() {
        let fs = FileSystem::mount(Arc::new(MemDisk::new(100))).unwrap();
        let mut fds = FdTable::new();
        let w = fs.open("f", Mode::Write).unwrap();
        fs.close(&w).unwrap();
        let entry = fs.open("f", Mode::Read).unwrap();

        for _ in FdTable::FIRST_FD..FdTable::CAPACITY {
            let shared = fs.dup(&entry).unwrap();
            assert!(fds.insert(shared).is_some());
        }
        assert_eq!(fds.insert(entry.clone()), None);

        fs.close(&entry).unwrap();
        fds.drain(&fs);
        assert!(fs.table().is_empty());
    }
}
