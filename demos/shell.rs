//! Small demo binary: formats an in-memory disk and execs a handful of
//! `mkdir`/`create`/`open`/`ls` commands, logging each step. Stands in
//! for process startup, device probing, and a user-facing shell, which
//! this crate's core treats as external.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::info;

use edu_fs::device::MemBlockDevice;
use edu_fs::FileSystem;

#[derive(Parser)]
#[command(version, about = "Exercises the educational file system core on an in-memory disk")]
struct Opt {
    /// Number of sectors in the backing in-memory disk
    #[arg(long, default_value_t = 4000)]
    sectors: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a directory, a file inside it, write to the file, then list the directory
    Demo,
    /// Create a directory at the given path
    Mkdir { path: String },
    /// Create an empty file at the given path
    Create { path: String },
    /// Write a string to a file, then print what comes back on read
    Echo { path: String, text: String },
    /// List a directory's entries
    Ls { path: String },
    /// Remove a file or empty directory
    Rm { path: String },
}

fn main() {
    env_logger::init();
    let opt = Opt::parse();

    let device = Arc::new(MemBlockDevice::new(opt.sectors));
    let fs = FileSystem::init(device, true);
    info!("shell: formatted a {}-sector in-memory disk", opt.sectors);

    match opt.command {
        Command::Demo => run_demo(&fs),
        Command::Mkdir { path } => fs.mkdir(&path).unwrap_or_else(|e| panic!("mkdir {path}: {e}")),
        Command::Create { path } => fs.create(&path, 0).unwrap_or_else(|e| panic!("create {path}: {e}")),
        Command::Echo { path, text } => echo(&fs, &path, &text),
        Command::Ls { path } => ls(&fs, &path),
        Command::Rm { path } => fs.remove(&path).unwrap_or_else(|e| panic!("rm {path}: {e}")),
    }

    fs.shutdown();
}

fn run_demo(fs: &FileSystem) {
    fs.mkdir("/greetings").expect("mkdir /greetings");
    info!("shell: created /greetings");
    fs.create("/greetings/hello", 0).expect("create /greetings/hello");
    info!("shell: created /greetings/hello");
    echo(fs, "/greetings/hello", "hello, file system");
    ls(fs, "/greetings");
}

fn echo(fs: &FileSystem, path: &str, text: &str) {
    let file = fs.open(path).unwrap_or_else(|e| panic!("open {path}: {e}"));
    let written = fs.write(&file, text.as_bytes());
    info!("shell: wrote {written} bytes to {path}");

    let file = fs.open(path).unwrap_or_else(|e| panic!("open {path}: {e}"));
    let mut buf = vec![0u8; written];
    let read = fs.read(&file, &mut buf);
    info!(
        "shell: read {read} bytes back from {path}: {:?}",
        String::from_utf8_lossy(&buf[..read])
    );
}

fn ls(fs: &FileSystem, path: &str) {
    let file = fs.open(path).unwrap_or_else(|e| panic!("open {path}: {e}"));
    info!("shell: listing {path}");
    while let Some(name) = fs.readdir(&file) {
        println!("{name}");
    }
}
