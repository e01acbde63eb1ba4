//! # 打开文件表
//!
//! 全局唯一，由一把表锁保护打开项、inode 缓存与目录。
//!
//! 同一文件的所有打开项共享一个内存中的 [`Inode`]；
//! 最后一次关闭后 inode 写回磁盘并移出缓存。
//! 打开计数与访问状态放在表里，仲裁从不等待 inode 锁。
//! 表锁从不跨设备调用持有（格式化除外），
//! 从磁盘加载 inode 时靠 `generation` 识别期间发生的淘汰。
//!
//! 加锁顺序：打开项 → 表 → inode → 分配器 → 设备。

use core::ptr;
use core::str::FromStr;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::collections::BTreeMap;
use std::sync::Arc;

use enumflags2::{bitflags, BitFlags};
use spin::{Mutex, MutexGuard};

use crate::allocator::BlockAllocator;
use crate::directory::Directory;
use crate::layout::{AccessFlag, Inode};
use crate::sync::Condvar;
use crate::BlockDevice;
use crate::Inumber;
use crate::{Error, Result};
use crate::{ROOT_INUMBER, ROOT_NAME};

/// 打开模式对应的访问权限
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    READ = 0b0001,
    WRITE = 0b0010,
    /// 每次写之前把读写指针移到文件尾
    APPEND = 0b0100,
    /// 打开时清空文件
    TRUNCATE = 0b1000,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// `"r"`
    Read,
    /// `"w"`
    Write,
    /// `"w+"`
    ReadWrite,
    /// `"a"`
    Append,
}

impl Mode {
    pub fn access(self) -> BitFlags<Access> {
        match self {
            Mode::Read => Access::READ.into(),
            Mode::Write => Access::WRITE | Access::TRUNCATE,
            Mode::ReadWrite => Access::READ | Access::WRITE,
            Mode::Append => Access::WRITE | Access::APPEND,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Read => "r",
            Mode::Write => "w",
            Mode::ReadWrite => "w+",
            Mode::Append => "a",
        }
    }

    #[inline]
    fn writes(self) -> bool {
        self.access().contains(Access::WRITE)
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "r" => Ok(Mode::Read),
            "w" => Ok(Mode::Write),
            "w+" => Ok(Mode::ReadWrite),
            "a" => Ok(Mode::Append),
            _ => Err(Error::InvalidMode),
        }
    }
}

/// 一次成功的打开
pub struct FileTableEntry {
    inumber: Inumber,
    mode: Mode,
    inode: Arc<Mutex<Inode>>,
    state: Mutex<EntryState>,
    /// 持有此打开项的描述符个数
    refs: AtomicUsize,
}

pub(crate) struct EntryState {
    pub seek: u32,
    closed: bool,
}

impl FileTableEntry {
    fn new(inumber: Inumber, mode: Mode, inode: Arc<Mutex<Inode>>) -> Self {
        Self {
            inumber,
            mode,
            inode,
            state: Mutex::new(EntryState {
                seek: 0,
                closed: false,
            }),
            refs: AtomicUsize::new(1),
        }
    }

    #[inline]
    pub fn inumber(&self) -> Inumber {
        self.inumber
    }

    #[inline]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    #[inline]
    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// 打开项锁；已关闭的打开项不可再用
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, EntryState>> {
        let state = self.state.lock();
        if state.closed {
            return Err(Error::TableEntryNotFound);
        }
        Ok(state)
    }

    #[inline]
    pub(crate) fn inode(&self) -> &Mutex<Inode> {
        &self.inode
    }
}

impl core::fmt::Debug for FileTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FileTableEntry")
            .field("inumber", &self.inumber)
            .field("mode", &self.mode)
            .field("refs", &self.refs())
            .finish()
    }
}

pub struct FileTable {
    inner: Mutex<TableInner>,
    condvar: Condvar,
    allocator: Arc<Mutex<BlockAllocator>>,
    block_device: Arc<dyn BlockDevice>,
}

struct TableInner {
    directory: Directory,
    entries: Vec<Arc<FileTableEntry>>,
    inodes: BTreeMap<Inumber, Cached>,
    /// 每次淘汰缓存或在缓存之外改写 inode 都加一
    generation: u64,
    /// 已移出缓存、块还在归还途中的 inode 个数
    reclaiming: usize,
}

struct Cached {
    inode: Arc<Mutex<Inode>>,
    count: u16,
    flag: AccessFlag,
    /// 已关闭但尚未写回的打开项
    settling: usize,
}

impl Cached {
    /// 磁盘上的计数与访问状态属于上一次挂载，不予采用
    fn new(inode: Inode) -> Self {
        Self {
            inode: Arc::new(Mutex::new(inode)),
            count: 0,
            flag: AccessFlag::Unused,
            settling: 0,
        }
    }

    #[inline]
    fn stamp(&self) -> (u16, AccessFlag) {
        (self.count, self.flag)
    }
}

impl FileTable {
    pub fn new(
        directory: Directory,
        allocator: Arc<Mutex<BlockAllocator>>,
        block_device: Arc<dyn BlockDevice>,
    ) -> Self {
        Self {
            inner: Mutex::new(TableInner {
                directory,
                entries: Vec::new(),
                inodes: BTreeMap::new(),
                generation: 0,
                reclaiming: 0,
            }),
            condvar: Condvar::new(),
            allocator,
            block_device,
        }
    }

    /// 按名字打开，写模式下文件不存在则创建。
    ///
    /// 访问状态不允许时阻塞，直到其它打开者关闭。
    pub fn falloc(&self, name: &str, mode: Mode) -> Result<Arc<FileTableEntry>> {
        if name.is_empty() {
            return Err(Error::InvalidName);
        }

        let mut table = self.inner.lock();
        // 每轮都重新解析名字：等待或加载期间文件可能已被删除
        loop {
            let inumber = match table.resolve(name) {
                Some(inumber) => inumber,
                None if mode.writes() => {
                    let inumber = table.directory.ialloc(name).ok_or(Error::NoFreeInode)?;
                    table.inodes.insert(inumber, Cached::new(Inode::new()));
                    log::debug!("created {name:?} as inode {inumber}");
                    inumber
                }
                None => return Err(Error::FileNotFound),
            };

            let cached = match table.inodes.get_mut(&inumber) {
                Some(cached) => cached,
                None => {
                    table = self.load(table, inumber);
                    continue;
                }
            };

            match cached.flag.request(mode.writes()) {
                Ok(flag) => {
                    cached.flag = flag;
                    cached.count += 1;
                    let stamp = cached.stamp();
                    let entry = Arc::new(FileTableEntry::new(inumber, mode, cached.inode.clone()));
                    table.entries.push(entry.clone());
                    drop(table);

                    self.write_back(inumber, &entry.inode, stamp);
                    log::debug!("opened {name:?} ({}) as inode {inumber}", mode.as_str());
                    return Ok(entry);
                }
                Err(flag) => {
                    cached.flag = flag;
                    log::debug!("{name:?} is busy, waiting for {}", mode.as_str());
                    table = self.condvar.wait(&self.inner, table);
                }
            }
        }
    }

    /// 移出打开项，归还它持有的全部打开计数并唤醒等待者
    pub fn ffree(&self, entry: &FileTableEntry) -> Result<()> {
        let mut state = entry.state.lock();
        let mut table = self.inner.lock();

        let position = table
            .entries
            .iter()
            .position(|e| ptr::eq(&**e, entry))
            .ok_or(Error::TableEntryNotFound)?;
        table.entries.swap_remove(position);
        state.closed = true;
        drop(state);

        let shares = entry.refs.swap(0, Ordering::AcqRel).max(1);
        let stamp = table.inodes.get_mut(&entry.inumber).map(|cached| {
            cached.count = cached.count.saturating_sub(shares as u16);
            if cached.count == 0 {
                cached.flag = cached.flag.release();
            }
            cached.settling += 1;
            cached.stamp()
        });
        drop(table);

        self.condvar.notify_all();
        if let Some(stamp) = stamp {
            self.settle(entry.inumber, &entry.inode, stamp);
        }
        log::debug!("closed inode {}", entry.inumber);

        Ok(())
    }

    /// 另一个描述符(通常在子线程里)共享同一打开项
    pub fn dup(&self, entry: &Arc<FileTableEntry>) -> Result<Arc<FileTableEntry>> {
        let _state = entry.lock()?;
        let mut table = self.inner.lock();
        entry.refs.fetch_add(1, Ordering::AcqRel);
        if let Some(cached) = table.inodes.get_mut(&entry.inumber) {
            cached.count += 1;
        }
        Ok(entry.clone())
    }

    /// 一个描述符放弃打开项；最后一个放弃时等同 [`FileTable::ffree`]
    pub fn release(&self, entry: &FileTableEntry) -> Result<()> {
        let state = entry.lock()?;
        if entry.refs.fetch_sub(1, Ordering::AcqRel) > 1 {
            let mut table = self.inner.lock();
            if let Some(cached) = table.inodes.get_mut(&entry.inumber) {
                cached.count = cached.count.saturating_sub(1);
            }
            return Ok(());
        }
        // 恢复计数，由 ffree 统一扣除
        entry.refs.store(1, Ordering::Release);
        drop(state);

        self.ffree(entry)
    }

    /// 删除名字；文件仍被打开时推迟到最后一次关闭才回收块
    pub fn delete(&self, name: &str) -> Result<()> {
        if name == ROOT_NAME {
            return Err(Error::AccessDenied);
        }

        let mut table = self.inner.lock();
        let inumber = table.directory.namei(name).ok_or(Error::FileNotFound)?;
        if inumber == ROOT_INUMBER {
            return Err(Error::AccessDenied);
        }
        table.directory.orphan(inumber);

        let in_use = table
            .inodes
            .get(&inumber)
            .is_some_and(|cached| cached.settling > 0 || cached.count > 0);
        if in_use {
            log::debug!("{name:?} is open, reclaiming inode {inumber} at last close");
            return Ok(());
        }

        table.inodes.remove(&inumber);
        table.generation += 1;
        table.reclaiming += 1;
        drop(table);

        let mut inode = Inode::load(inumber, &*self.block_device);
        self.truncate(inumber, &mut inode);
        self.reclaim_slot(inumber);
        log::debug!("deleted {name:?} (inode {inumber})");

        Ok(())
    }

    /// 清空 inode 的全部区段，块归还分配器，并写回 inode
    pub(crate) fn truncate(&self, inumber: Inumber, inode: &mut Inode) {
        let blocks = inode.clear(&*self.block_device);
        if !blocks.is_empty() {
            let mut allocator = self.allocator.lock();
            for &block_id in &blocks {
                allocator.return_block(block_id);
            }
        }
        inode.to_disk(inumber, &*self.block_device);
        log::debug!("inode {inumber} released {} blocks", blocks.len());
    }

    /// 共享 inode 当前的打开计数；没有打开者时为 0
    pub fn open_count(&self, inumber: Inumber) -> u16 {
        self.inner
            .lock()
            .inodes
            .get(&inumber)
            .map_or(0, |cached| cached.count)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// 打开中的表项个数
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// 重建 inode 表与目录；有打开项或回收未完成时拒绝
    pub(crate) fn format(&self, total_inodes: u32) -> Result<()> {
        let mut table = self.inner.lock();
        if !table.entries.is_empty()
            || table.reclaiming > 0
            || table.inodes.values().any(|cached| cached.settling > 0)
        {
            return Err(Error::Busy);
        }

        self.allocator.lock().format(total_inodes)?;
        table.directory = Directory::new(total_inodes);
        table.inodes.clear();
        table.generation += 1;

        Ok(())
    }

    pub(crate) fn directory_bytes(&self) -> Vec<u8> {
        self.inner.lock().directory.directory2bytes()
    }

    pub(crate) fn list(&self) -> Vec<(Inumber, String)> {
        self.inner.lock().directory.iter().collect()
    }

    /// 把目录写进根文件，返回写入的字节数。
    ///
    /// 不经过访问仲裁：根文件被打开着也照写，
    /// 与它的读写靠 inode 锁串行。
    pub(crate) fn write_root(&self, data: &[u8]) -> Result<usize> {
        let mut table = self.inner.lock();
        let (inode, stamp) = loop {
            if let Some(cached) = table.inodes.get_mut(&ROOT_INUMBER) {
                cached.settling += 1;
                break (cached.inode.clone(), cached.stamp());
            }
            table = self.load(table, ROOT_INUMBER);
        };
        drop(table);

        let written = {
            let mut root = inode.lock();
            self.truncate(ROOT_INUMBER, &mut root);
            root.write_at(0, data, &*self.block_device, || {
                self.allocator.lock().get_free_block()
            })
        };
        self.settle(ROOT_INUMBER, &inode, stamp);

        written
    }

    /// 卸载前回收孤儿：已删除却仍被打开的文件不会再有人关闭
    pub(crate) fn reclaim_orphans(&self) {
        let mut orphans = Vec::new();
        {
            let mut table = self.inner.lock();
            let inumbers: Vec<Inumber> = table.directory.orphans().collect();
            for inumber in inumbers {
                let cached = table.inodes.remove(&inumber).map(|cached| cached.inode);
                table.reclaiming += 1;
                orphans.push((inumber, cached));
            }
            table.generation += 1;
        }

        for (inumber, cached) in orphans {
            match cached {
                Some(inode) => self.truncate(inumber, &mut inode.lock()),
                None => {
                    let mut inode = Inode::load(inumber, &*self.block_device);
                    self.truncate(inumber, &mut inode);
                }
            }
            self.reclaim_slot(inumber);
            log::info!("reclaimed inode {inumber}, deleted while still open");
        }
    }

    /// 放开表锁从磁盘加载 inode；期间没有淘汰发生才放进缓存
    fn load<'a>(
        &'a self,
        table: MutexGuard<'a, TableInner>,
        inumber: Inumber,
    ) -> MutexGuard<'a, TableInner> {
        let generation = table.generation;
        drop(table);

        let loaded = Inode::load(inumber, &*self.block_device);

        let mut table = self.inner.lock();
        if table.generation == generation && !table.inodes.contains_key(&inumber) {
            table.inodes.insert(inumber, Cached::new(loaded));
        }
        table
    }

    /// 带上表里的打开计数与访问状态写回 inode
    fn write_back(
        &self,
        inumber: Inumber,
        inode: &Mutex<Inode>,
        (count, flag): (u16, AccessFlag),
    ) {
        let mut inode = inode.lock();
        inode.count = count;
        inode.flag = flag;
        inode.to_disk(inumber, &*self.block_device);
    }

    /// 关闭后的收尾：写回 inode；无人再用时移出缓存，已删除的文件此时回收
    fn settle(&self, inumber: Inumber, inode: &Mutex<Inode>, stamp: (u16, AccessFlag)) {
        self.write_back(inumber, inode, stamp);

        let mut table = self.inner.lock();
        let Some(cached) = table.inodes.get_mut(&inumber) else {
            return;
        };
        cached.settling -= 1;
        if cached.settling > 0 || cached.count > 0 {
            return;
        }

        table.inodes.remove(&inumber);
        table.generation += 1;
        if !table.directory.is_orphan(inumber) {
            return;
        }
        table.reclaiming += 1;
        drop(table);

        self.truncate(inumber, &mut inode.lock());
        self.reclaim_slot(inumber);
        log::debug!("reclaimed deleted inode {inumber}");
    }

    /// 块已归还，槽位重新可用
    fn reclaim_slot(&self, inumber: Inumber) {
        let mut table = self.inner.lock();
        table.directory.reclaim(inumber);
        table.reclaiming -= 1;
        table.generation += 1;
    }
}

impl TableInner {
    fn resolve(&self, name: &str) -> Option<Inumber> {
        if name == ROOT_NAME {
            return Some(ROOT_INUMBER);
        }
        self.directory.namei(name)
    }
}

#[cfg(test)]
mod tests {
    use block_dev::MemDisk;

    use super::*;

    fn table() -> FileTable {
        let disk: Arc<dyn BlockDevice> = Arc::new(MemDisk::new(200));
        let allocator = BlockAllocator::mount(disk.clone()).unwrap();
        let directory = Directory::new(allocator.total_inodes());
        FileTable::new(directory, Arc::new(Mutex::new(allocator)), disk)
    }

    #[test]
    fn mode_strings() {
        assert_eq!("w+".parse::<Mode>(), Ok(Mode::ReadWrite));
        assert_eq!("rw".parse::<Mode>(), Err(Error::InvalidMode));
        assert_eq!("".parse::<Mode>(), Err(Error::InvalidMode));
        assert!(Mode::Append.access().contains(Access::WRITE | Access::APPEND));
        assert!(!Mode::ReadWrite.access().contains(Access::TRUNCATE));
    }

    #[test]
    fn open_rules() {
        let table = table();
        assert_eq!(table.falloc("nope", Mode::Read).unwrap_err(), Error::FileNotFound);
        assert_eq!(table.falloc("", Mode::Write).unwrap_err(), Error::InvalidName);

        let w = table.falloc("a", Mode::Write).unwrap();
        assert_eq!(w.inumber(), 1);
        table.ffree(&w).unwrap();
        assert_eq!(table.ffree(&w), Err(Error::TableEntryNotFound));

        let r1 = table.falloc("a", Mode::Read).unwrap();
        let r2 = table.falloc("a", Mode::Read).unwrap();
        assert_eq!(table.open_count(1), 2);
        assert_eq!(table.len(), 2);
        table.ffree(&r1).unwrap();
        assert_eq!(table.open_count(1), 1);
        table.ffree(&r2).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.open_count(1), 0);
    }

    #[test]
    fn shares_one_inode() {
        let table = table();
        let a = table.falloc("f", Mode::ReadWrite).unwrap();
        let b = table.dup(&a).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!((a.refs(), table.open_count(a.inumber())), (2, 2));

        table.release(&b).unwrap();
        assert_eq!((a.refs(), table.open_count(a.inumber())), (1, 1));
        table.release(&a).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.release(&a), Err(Error::TableEntryNotFound));
    }

    #[test]
    fn delete_rules() {
        let table = table();
        assert_eq!(table.delete("/"), Err(Error::AccessDenied));
        assert_eq!(table.delete("ghost"), Err(Error::FileNotFound));

        let f = table.falloc("f", Mode::Write).unwrap();
        table.ffree(&f).unwrap();
        table.delete("f").unwrap();
        assert_eq!(table.falloc("f", Mode::Read).unwrap_err(), Error::FileNotFound);
        assert_eq!(table.list(), vec![(0, "/".to_string())]);
    }
}
