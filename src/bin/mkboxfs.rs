//! Formats a new `boxfs` container file.

use std::path::PathBuf;
use std::process::exit;

use clap::Parser;

/// Creates a boxfs container file.
#[derive(Parser)]
#[command(name = "mkboxfs", about = "Format a new boxfs container file")]
struct Args {
    /// Path of the container file to create (overwritten if it exists).
    container: PathBuf,

    /// Total size of the container, in bytes.
    #[arg(short = 's', long = "size", default_value_t = boxfs::consts::DEFAULT_CAPACITY)]
    size: u64,

    /// Overwrite the container file if it already exists.
    #[arg(long)]
    force: bool,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if args.container.exists() && !args.force {
        eprintln!(
            "mkboxfs: {}: already exists (use --force to overwrite)",
            args.container.display()
        );
        exit(1);
    }

    if let Err(e) = boxfs::mount::create_container(&args.container, args.size) {
        eprintln!("mkboxfs: {}: {}", args.container.display(), e);
        exit(1);
    }
}
