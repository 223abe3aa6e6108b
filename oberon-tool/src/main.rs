//! Command-line front end for the Native Oberon file-system driver.

mod cli;
mod fuse;

use std::error::Error;
use std::process::ExitCode;

use clap::Parser;
use oberon_fs::{DiskImage, FileSystem, FsError};

use crate::cli::{Cli, Command};

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.log_level.into())
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn Error>> {
    let disk = DiskImage::open(&cli.image)?;
    let fs = FileSystem::open(disk)?;

    match &cli.command {
        Command::List => {
            for file in fs.list(|_| true)? {
                println!("{} ({} bytes)", file.name(), file.size());
            }
        }
        Command::Info { name } => {
            let file = fs
                .find(name)?
                .ok_or_else(|| FsError::NotFound(name.clone()))?;
            println!("File:    {}", file.name());
            println!("Address: {}", file.header_addr());
            println!("Size:    {} bytes", file.size());
        }
        Command::Read { name, dest } => {
            let file = fs
                .find(name)?
                .ok_or_else(|| FsError::NotFound(name.clone()))?;
            let data = file.read_at(0, file.size())?;
            std::fs::write(dest, data)?;
        }
        Command::Write { src, name } => {
            let data = std::fs::read(src)?;
            if data.len() as u64 > u64::from(oberon_fs::MAX_FILE_SIZE) {
                return Err(Box::new(FsError::FileTooLarge));
            }
            // There is no truncate on this file system; replace any
            // existing entry wholesale.
            fs.remove(name);
            let mut file = fs.create(name)?;
            file.write_at(0, &data)?;
            file.register()?;
        }
        Command::Mount { mountpoint } => {
            fuse::mount(&fs, mountpoint)?;
        }
    }

    fs.close()?;
    Ok(())
}
