//! Mounts a `boxfs` container file at a directory via FUSE.

use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use fuser::MountOption;
use log::info;

use boxfs::bridge::BoxFs;
use boxfs::mount::open_container;
use boxfs::ops::Core;

/// Mounts a boxfs container at a directory.
#[derive(Parser)]
#[command(name = "boxfs", about = "Mount a boxfs container file")]
struct Args {
    /// Path of the container file to mount.
    container: PathBuf,

    /// Directory to mount the filesystem at.
    mountpoint: PathBuf,

    /// Mount the container read-only.
    #[arg(long)]
    read_only: bool,

    /// Allow other users to access the mount.
    #[arg(long)]
    allow_other: bool,

    /// Run in the foreground instead of detaching (kept for parity with
    /// typical FUSE tools; boxfs never backgrounds itself, so this is
    /// accepted but has no effect).
    #[arg(short = 'f', long)]
    foreground: bool,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    let _ = args.foreground;

    let file = open_container(&args.container, args.read_only).unwrap_or_else(|e| {
        eprintln!("boxfs: {}: {}", args.container.display(), e);
        exit(1);
    });
    let core = Core::mount(file, args.read_only).unwrap_or_else(|e| {
        eprintln!("boxfs: {}: {}", args.container.display(), e);
        exit(1);
    });
    let root_addr = core.root_addr();
    let fs = BoxFs::new(core, root_addr);

    let mut options = vec![MountOption::FSName("boxfs".to_string())];
    if args.read_only {
        options.push(MountOption::RO);
    } else {
        options.push(MountOption::RW);
    }
    if args.allow_other {
        options.push(MountOption::AllowOther);
    }

    info!("mounting {} at {}", args.container.display(), args.mountpoint.display());
    if let Err(e) = fuser::mount2(fs, &args.mountpoint, &options) {
        eprintln!("boxfs: {}: {}", args.mountpoint.display(), e);
        exit(1);
    }
}
