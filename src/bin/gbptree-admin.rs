//! Binary entry point for the GBPTree administrative CLI.
#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use gbptree::layout::BytesLayout;
use gbptree::{GbpError, Options, Tree};

const DEFAULT_MAX_INLINE: usize = 512;

#[derive(Parser, Debug)]
#[command(name = "gbptree-admin", version, about = "Administrative CLI for a GBPTree index file")]
struct Cli {
    /// Path to the tree's backing file.
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an empty tree at `db`, failing if it already exists.
    Init {
        #[arg(long, default_value_t = gbptree::pager::DEFAULT_PAGE_SIZE)]
        page_size: usize,
    },
    /// Insert or overwrite a key.
    Put { key: String, value: String },
    /// Look up a key.
    Get { key: String },
    /// Remove a key, printing its value if it was present.
    Remove { key: String },
    /// List every key/value pair in ascending order.
    Scan,
    /// Force a checkpoint.
    Checkpoint {
        #[arg(long, default_value = "manual")]
        reason: String,
    },
    /// Run a structural consistency check.
    Verify,
}

fn layout() -> BytesLayout {
    BytesLayout::new(DEFAULT_MAX_INLINE, DEFAULT_MAX_INLINE)
}

fn open_existing(db: &PathBuf) -> Result<Tree<BytesLayout>, GbpError> {
    Tree::open(db, layout(), Options::default())
}

fn run(cli: Cli) -> Result<(), GbpError> {
    match cli.command {
        Command::Init { page_size } => {
            let tree = Tree::create(&cli.db, layout(), Options { page_size, ..Options::default() })?;
            tree.checkpoint("init")?;
            println!("created {}", cli.db.display());
        }
        Command::Put { key, value } => {
            let tree = open_existing(&cli.db)?;
            tree.put(&key.into_bytes(), &value.into_bytes())?;
            tree.checkpoint("put")?;
        }
        Command::Get { key } => {
            let tree = open_existing(&cli.db)?;
            match tree.get(&key.into_bytes())? {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => {
                    eprintln!("key not found");
                    process::exit(1);
                }
            }
        }
        Command::Remove { key } => {
            let tree = open_existing(&cli.db)?;
            let removed = tree.remove(&key.into_bytes())?;
            tree.checkpoint("remove")?;
            match removed {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => {
                    eprintln!("key not found");
                    process::exit(1);
                }
            }
        }
        Command::Scan => {
            let tree = open_existing(&cli.db)?;
            for item in tree.seek(std::ops::Bound::Unbounded, std::ops::Bound::Unbounded) {
                let (key, value) = item?;
                println!("{}\t{}", String::from_utf8_lossy(&key), String::from_utf8_lossy(&value));
            }
        }
        Command::Checkpoint { reason } => {
            let tree = open_existing(&cli.db)?;
            let report = tree.checkpoint(&reason)?;
            println!(
                "checkpoint complete: stable={} unstable={} root={} took={:?}",
                report.stable_generation, report.unstable_generation, report.root, report.duration
            );
        }
        Command::Verify => {
            let tree = open_existing(&cli.db)?;
            let report = tree.consistency_check()?;
            println!("checked {} pages", report.checked_pages);
            println!("corrupt pages: {}", report.corrupt_pages.len());
            println!("crashed generation pointers: {}", report.unreachable_generation_pointers);
            if !report.is_clean() {
                process::exit(1);
            }
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error: {err}");
        process::exit(1);
    }
}
