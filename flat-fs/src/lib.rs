/* flat-fs 的整体架构，自上而下 */

// 系统调用层：以 -1 作为失败哨兵值的接口
pub mod syscall;

// 文件描述符层：每个线程的描述符表
mod fd_table;

// 文件系统层：open/read/write/seek/close/delete
mod fs;

// 打开文件表：打开项与访问模式仲裁
mod file_table;

// 扁平目录：文件名到 inode 编号的映射
mod directory;

// 磁盘块管理器层：超级块与空闲块栈
mod allocator;

// 磁盘数据结构层：超级块、inode 与索引块的布局
pub mod layout;

// 块缓冲层：单个块的读-改-写
mod block;

mod error;
mod sync;

pub use block_dev::{BlockDevice, BLOCK_SIZE};

pub use self::{
    allocator::BlockAllocator,
    directory::Directory,
    error::{Error, Result},
    fd_table::FdTable,
    file_table::{Access, FileTable, FileTableEntry, Mode},
    fs::{FileSystem, Whence},
    layout::{AccessFlag, Inode},
};

/// 块编号；inode 内以 i16 存储，-1 表示未分配
pub type BlockId = u32;
/// inode 编号，同时也是目录表的槽位
pub type Inumber = u16;

/// inode 直接索引个数
pub const DIRECT_COUNT: usize = 11;
/// 索引块内的块编号个数(每个2字节)
pub const INDIRECT_COUNT: usize = BLOCK_SIZE / 2;
/// 单个文件可拥有的数据块上限
pub const MAX_BLOCKS: usize = DIRECT_COUNT + INDIRECT_COUNT;
pub const MAX_FILE_SIZE: usize = MAX_BLOCKS * BLOCK_SIZE;

/// 设备无法识别时格式化所用的 inode 个数
pub const DEFAULT_INODES: u32 = 64;
/// 目录序列化后必须能放进 inode 0 这一个文件
pub const MAX_FILES: u32 = (MAX_FILE_SIZE / Directory::SLOT_BYTES) as u32;
/// 块编号必须能放进 i16
pub const MAX_DEVICE_BLOCKS: usize = i16::MAX as usize + 1;

/// 根目录所在的 inode
pub const ROOT_INUMBER: Inumber = 0;
pub const ROOT_NAME: &str = "/";

type DataBlock = [u8; BLOCK_SIZE];
