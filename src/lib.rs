//! # GBPTree - a generation-safe, copy-on-write B+-tree index
//!
//! GBPTree layers a crash-safe B+-tree over a paged file abstraction.
//! Every mutation copies the page it touches onto a fresh page ID rather
//! than overwriting in place, so a reader holding an older root GSP keeps
//! seeing a consistent tree for as long as it needs, with no locking
//! against concurrent writers.
//!
//! ## Quick start
//!
//! ```no_run
//! use gbptree::{Options, Tree};
//! use gbptree::layout::U64Layout;
//!
//! let tree = Tree::create("index.db", U64Layout, Options::default())?;
//! tree.put(&1u64, &100u64)?;
//! assert_eq!(tree.get(&1u64)?, Some(100));
//! tree.checkpoint("manual")?;
//! # Ok::<(), gbptree::GbpError>(())
//! ```
//!
//! ## Architecture
//!
//! - [`pager`]: fixed-size page I/O, pin/unpin cursors, the stable/unstable
//!   generation pair, and buffered page ID reuse.
//! - [`node`]: the fixed node header plus the two body encodings
//!   (`dynamic` and `fixed`) a [`layout::Layout`] picks between.
//! - [`writer`]: the single-writer put/remove algorithm, copy-on-write
//!   against the pager.
//! - [`seeker`]: lock-free, restartable range reads.
//! - [`offload`]: the overflow chain for keys/values too large to inline.
//! - [`log`] and [`recovery`]: the detached-checkpoint log and the
//!   crash-pointer cleanup that runs on an unclean open.
//! - [`tree`]: ties every layer together behind the public [`Tree`] type.
//! - [`multiroot`]: many independent trees, keyed by a secondary key,
//!   sharing one paged file and one generation pair.

pub mod checkpoint;
pub mod checksum;
pub mod contracts;
pub mod error;
pub mod header;
pub mod layout;
pub mod log;
pub mod multiroot;
pub mod node;
pub mod offload;
pub mod pager;
pub mod recovery;
pub mod seeker;
pub mod tree;
pub mod types;
pub mod writer;

pub use crate::error::{GbpError, Result};
pub use crate::tree::{ConsistencyReport, Options, Tree};
