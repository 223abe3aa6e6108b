use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Work with Native Oberon disk images: list, copy in and out, or mount.
#[derive(Parser)]
#[command(version)]
pub struct Cli {
    /// Disk image to work on
    #[arg(short, long)]
    pub image: PathBuf,

    /// Log verbosity
    #[arg(long, value_enum, default_value = "error")]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Panic,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            // The log facade stops at error.
            LogLevel::Error | LogLevel::Fatal | LogLevel::Panic => log::LevelFilter::Error,
        }
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// List the files in the image
    List,
    /// Show information about one file
    Info { name: String },
    /// Copy a file out of the image to the host file system
    Read { name: String, dest: PathBuf },
    /// Copy a host file into the image, replacing any existing file
    Write { src: PathBuf, name: String },
    /// Mount the image as a FUSE file system
    Mount { mountpoint: PathBuf },
}
