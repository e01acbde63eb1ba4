//! # 扁平目录
//!
//! 单层目录：槽位 *i* 即 inode *i*，槽位 0 固定为根 `"/"`。
//! 文件名以 UTF-16 码元存储，最长 30 个，超出部分截断。
//!
//! 序列化后的目录作为 inode 0 的文件内容保存：
//! 先是 N 个 i32 名字长度，再是 N 个 60 字节的名字缓冲。

use std::collections::BTreeSet;

use crate::layout::{read_i16, read_i32, write_i16, write_i32};
use crate::Inumber;
use crate::{ROOT_INUMBER, ROOT_NAME};

type Name = [u16; Directory::NAME_CAP];

pub struct Directory {
    /// 每个槽位的名字长度，0 表示空闲
    lens: Vec<u32>,
    names: Vec<Name>,
    /// 已删除但仍被打开的文件：名字已清除，槽位保留到最后一次关闭
    orphans: BTreeSet<Inumber>,
}

impl Directory {
    /// 文件名最多容纳的 UTF-16 码元
    pub const NAME_CAP: usize = 30;
    /// 每个槽位序列化后的字节数
    pub const SLOT_BYTES: usize = 4 + Self::NAME_CAP * 2;

    /// 只含根目录的空目录
    pub fn new(capacity: u32) -> Self {
        let capacity = capacity as usize;
        let mut dir = Self {
            lens: vec![0; capacity],
            names: vec![[0; Self::NAME_CAP]; capacity],
            orphans: BTreeSet::new(),
        };
        if capacity > 0 {
            dir.set(ROOT_INUMBER, &encode_name(ROOT_NAME));
        }
        dir
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.lens.len()
    }

    /// 从头部之后找第一个空闲槽位登记 `name`
    pub fn ialloc(&mut self, name: &str) -> Option<Inumber> {
        let name = encode_name(name);
        if name.is_empty() {
            return None;
        }
        let inumber = (1..self.capacity())
            .map(|i| i as Inumber)
            .find(|&i| self.lens[i as usize] == 0 && !self.orphans.contains(&i))?;

        self.set(inumber, &name);
        Some(inumber)
    }

    /// 释放槽位；槽位本就空闲或是根目录时返回 `false`
    pub fn ifree(&mut self, inumber: Inumber) -> bool {
        let slot = inumber as usize;
        if inumber == ROOT_INUMBER || slot >= self.capacity() {
            return false;
        }
        let occupied = self.lens[slot] > 0 || self.orphans.remove(&inumber);
        self.lens[slot] = 0;
        self.names[slot] = [0; Self::NAME_CAP];
        occupied
    }

    pub fn namei(&self, name: &str) -> Option<Inumber> {
        let name = encode_name(name);
        if name.is_empty() {
            return None;
        }
        (0..self.capacity())
            .find(|&i| self.lens[i] as usize == name.len() && self.names[i][..name.len()] == name[..])
            .map(|i| i as Inumber)
    }

    /// 抹去名字但保留槽位
    pub fn orphan(&mut self, inumber: Inumber) -> bool {
        let slot = inumber as usize;
        if inumber == ROOT_INUMBER || slot >= self.capacity() || self.lens[slot] == 0 {
            return false;
        }
        self.lens[slot] = 0;
        self.names[slot] = [0; Self::NAME_CAP];
        self.orphans.insert(inumber)
    }

    /// 孤儿的最后一个打开者离开，槽位重新可用
    #[inline]
    pub fn reclaim(&mut self, inumber: Inumber) -> bool {
        self.orphans.remove(&inumber)
    }

    #[inline]
    pub fn is_orphan(&self, inumber: Inumber) -> bool {
        self.orphans.contains(&inumber)
    }

    pub fn orphans(&self) -> impl Iterator<Item = Inumber> + '_ {
        self.orphans.iter().copied()
    }

    /// 已登记的 `(inode 编号, 文件名)`，含根目录
    pub fn iter(&self) -> impl Iterator<Item = (Inumber, String)> + '_ {
        self.lens
            .iter()
            .zip(&self.names)
            .enumerate()
            .filter(|(_, (&len, _))| len > 0)
            .map(|(i, (&len, name))| {
                (i as Inumber, String::from_utf16_lossy(&name[..len as usize]))
            })
    }

    pub fn directory2bytes(&self) -> Vec<u8> {
        let capacity = self.capacity();
        let mut data = vec![0u8; capacity * Self::SLOT_BYTES];

        for (i, &len) in self.lens.iter().enumerate() {
            write_i32(&mut data, i * 4, len as i32);
        }
        let names_start = capacity * 4;
        for (i, name) in self.names.iter().enumerate() {
            let offset = names_start + i * Self::NAME_CAP * 2;
            for (j, &unit) in name.iter().enumerate() {
                write_i16(&mut data, offset + j * 2, unit as i16);
            }
        }

        data
    }

    /// 用 `data` 的内容覆盖目录；槽位数以当前容量为准
    pub fn bytes2directory(&mut self, data: &[u8]) {
        let stored = data.len() / Self::SLOT_BYTES;
        if stored != self.capacity() || data.len() % Self::SLOT_BYTES != 0 {
            log::warn!(
                "directory blob holds {stored} slots, expected {}",
                self.capacity()
            );
        }

        self.orphans.clear();
        let names_start = stored * 4;
        for i in 0..self.capacity() {
            if i >= stored {
                self.lens[i] = 0;
                self.names[i] = [0; Self::NAME_CAP];
                continue;
            }

            let len = read_i32(data, i * 4).clamp(0, Self::NAME_CAP as i32) as u32;
            let offset = names_start + i * Self::NAME_CAP * 2;
            for (j, unit) in self.names[i].iter_mut().enumerate() {
                *unit = read_i16(data, offset + j * 2) as u16;
            }
            self.lens[i] = len;
        }
    }

    fn set(&mut self, inumber: Inumber, name: &[u16]) {
        let slot = inumber as usize;
        self.names[slot] = [0; Self::NAME_CAP];
        self.names[slot][..name.len()].copy_from_slice(name);
        self.lens[slot] = name.len() as u32;
    }
}

impl PartialEq for Directory {
    /// 孤儿只存在于运行期，不参与比较
    fn eq(&self, other: &Self) -> bool {
        self.lens == other.lens && self.names == other.names
    }
}

impl core::fmt::Debug for Directory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// 截断到 [`Directory::NAME_CAP`] 个码元
fn encode_name(name: &str) -> Vec<u16> {
    name.encode_utf16().take(Directory::NAME_CAP).collect()
}
