mod cli;

use std::fs;
use std::io;
use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use cli::{Cli, Command};
use flat_fs::{FileSystem, Mode};
use flat_fs_fuse::BlockFile;

fn main() -> io::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if let Command::Format { blocks, files } = cli.command {
        let block_file = Arc::new(BlockFile::create(&cli.image, blocks)?);
        let fs = FileSystem::mount(block_file).map_err(io::Error::other)?;
        fs.format(files).map_err(io::Error::other)?;
        println!("{:?}: {blocks} blocks, {files} files", cli.image);
        return Ok(());
    }

    let block_file = Arc::new(BlockFile::open(&cli.image)?);
    let fs = FileSystem::mount(block_file).map_err(io::Error::other)?;

    match cli.command {
        Command::Format { .. } => unreachable!(),
        Command::Pack { source } => pack(&fs, &source)?,
        Command::Ls => {
            for (inumber, name) in fs.list() {
                let h = fs.open(&name, Mode::Read).map_err(io::Error::other)?;
                let size = fs.fsize(&h);
                fs.close(&h).map_err(io::Error::other)?;
                println!("{inumber:>4} {:>8} {name}", size.map_err(io::Error::other)?);
            }
        }
        Command::Cat { name } => {
            let h = fs.open(&name, Mode::Read).map_err(io::Error::other)?;
            let mut data = vec![0; fs.fsize(&h).map_err(io::Error::other)? as usize];
            let read = fs.read(&h, &mut data);
            fs.close(&h).map_err(io::Error::other)?;
            let read = read.map_err(io::Error::other)?;
            io::stdout().write_all(&data[..read])?;
        }
        Command::Rm { name } => fs.delete(&name).map_err(io::Error::other)?,
        Command::Stat => {
            println!("blocks: {}", fs.total_blocks());
            println!("inodes: {}", fs.total_inodes());
            println!("free blocks: {}", fs.free_blocks());
            println!("files: {}", fs.list().len());
        }
    }

    fs.sync().map_err(io::Error::other)
}

fn pack(fs: &FileSystem, source: &std::path::Path) -> io::Result<()> {
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            log::warn!("skipping non UTF-8 name {:?}", entry.file_name());
            continue;
        };

        let data = fs::read(entry.path())?;
        let h = fs.open(&name, Mode::Write).map_err(io::Error::other)?;
        let written = fs.write(&h, &data);
        fs.close(&h).map_err(io::Error::other)?;

        let written = written.map_err(io::Error::other)?;
        if written < data.len() {
            return Err(io::Error::other(format!(
                "{name}: only {written} of {} bytes fit",
                data.len()
            )));
        }
        println!("packed: {name:?} ({written} bytes)");
    }

    Ok(())
}
