use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::{Read, Write};
use std::io::{Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;

use flat_fs::BlockDevice;
use flat_fs::BLOCK_SIZE;

/// 以宿主文件作为块设备
pub struct BlockFile {
    file: Mutex<File>,
    num_blocks: usize,
}

impl BlockFile {
    /// 创建(或清空)一个 `num_blocks` 块大小的镜像
    pub fn create(path: impl AsRef<Path>, num_blocks: usize) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len((num_blocks * BLOCK_SIZE) as u64)?;

        Ok(Self {
            file: Mutex::new(file),
            num_blocks,
        })
    }

    /// 打开已有镜像，块数由文件长度决定
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len % BLOCK_SIZE != 0 {
            log::warn!("image size {len} is not a multiple of {BLOCK_SIZE}, tail ignored");
        }

        Ok(Self {
            file: Mutex::new(file),
            num_blocks: len / BLOCK_SIZE,
        })
    }
}

impl BlockDevice for BlockFile {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        assert!(block_id < self.num_blocks, "block {block_id} out of range");
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))
            .expect("seeking error");
        file.read_exact(buf).expect("not a complete block!");
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        assert!(block_id < self.num_blocks, "block {block_id} out of range");
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))
            .expect("seeking error");
        file.write_all(buf).expect("not a complete block!");
    }

    fn num_blocks(&self) -> usize {
        self.num_blocks
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use flat_fs::{FileSystem, Mode};

    use super::*;

    fn temp_image(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("flat-fs-{tag}-{}.img", std::process::id()))
    }

    #[test]
    fn create_sizes_the_image() {
        let path = temp_image("create");
        let device = BlockFile::create(&path, 8).unwrap();
        assert_eq!(device.num_blocks(), 8);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8 * BLOCK_SIZE as u64);

        let block = [0x5a; BLOCK_SIZE];
        device.write_block(7, &block);
        let mut back = [0; BLOCK_SIZE];
        device.read_block(7, &mut back);
        assert_eq!(back, block);
        drop(device);

        // 重新创建会清空旧镜像
        let device = BlockFile::create(&path, 2).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 2 * BLOCK_SIZE as u64);
        device.read_block(1, &mut back);
        assert!(back.iter().all(|&b| b == 0));

        drop(device);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn open_ignores_partial_tail() {
        let path = temp_image("tail");
        std::fs::write(&path, vec![1u8; 3 * BLOCK_SIZE + 100]).unwrap();

        let device = BlockFile::open(&path).unwrap();
        assert_eq!(device.num_blocks(), 3);
        let mut buf = [0; BLOCK_SIZE];
        device.read_block(2, &mut buf);
        assert!(buf.iter().all(|&b| b == 1));

        drop(device);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn open_missing_image_fails() {
        assert!(BlockFile::open(temp_image("missing")).is_err());
    }

    #[test]
    fn image_survives_reopen() {
        let path = temp_image("reopen");

        {
            let device = Arc::new(BlockFile::create(&path, 200).unwrap());
            let fs = FileSystem::mount(device).unwrap();
            let h = fs.open("hello", Mode::Write).unwrap();
            fs.write(&h, b"hello, image").unwrap();
            fs.close(&h).unwrap();
        }

        let device = Arc::new(BlockFile::open(&path).unwrap());
        assert_eq!(device.num_blocks(), 200);
        let fs = FileSystem::mount(device).unwrap();
        let h = fs.open("hello", Mode::Read).unwrap();
        let mut buf = [0; 32];
        let n = fs.read(&h, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello, image");
        fs.close(&h).unwrap();

        drop(fs);
        std::fs::remove_file(&path).unwrap();
    }
}
