use derive_more::Display;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// 打开模式不是 "r"、"w"、"w+"、"a" 之一
    #[display(fmt = "invalid open mode")]
    InvalidMode,
    #[display(fmt = "no free inode")]
    NoFreeInode,
    #[display(fmt = "no free block")]
    NoFreeBlock,
    #[display(fmt = "file not found")]
    FileNotFound,
    /// 目标索引已登记过块
    #[display(fmt = "block already registered")]
    BlockAlreadyRegistered,
    /// 前一个索引尚未登记，区段必须连续
    #[display(fmt = "preceding block unused")]
    PrecedingBlockUnused,
    /// 还没有索引块
    #[display(fmt = "indirect block is null")]
    IndirectNull,
    #[display(fmt = "access denied")]
    AccessDenied,
    #[display(fmt = "file table entry not found")]
    TableEntryNotFound,
    #[display(fmt = "invalid whence")]
    InvalidWhence,
    #[display(fmt = "invalid file name")]
    InvalidName,
    /// 存在其它打开者，操作被拒绝
    #[display(fmt = "resource busy")]
    Busy,
    #[display(fmt = "file too large")]
    FileTooLarge,
    #[display(fmt = "invalid argument")]
    InvalidArgument,
}

impl std::error::Error for Error {}
