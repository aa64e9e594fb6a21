//! # Windows Registry Hive Engine
//!
//! A transactional read/edit/rebuild engine for Windows registry hive
//! files, written in Rust.
//!
//! ## Features
//!
//! - **Reading**: Memory-mapped, zero-copy access to hive images with
//!   lazy, cached structure parsing
//! - **Editing**: Copy-on-write transactions staging key and value
//!   edits on top of an immutable base image
//! - **Rebuilding**: Commit emits a fresh, well-formed hive image whose
//!   checksum verifies and whose offsets resolve after a round-trip
//! - **Type-safe**: Strong typing for registry values and structures
//! - **Comprehensive error handling**: Detailed error types for debugging
//!
//! ## Architecture
//!
//! The engine is built on several layers:
//!
//! 1. **Base Block (Header)**: Contains hive metadata and root key offset
//! 2. **Hive Bins (hbin)**: 4KB-aligned blocks containing cells
//! 3. **Cells**: Variable-sized structures (keys, values, lists, etc.)
//! 4. **Key Nodes (nk)**: Registry keys with subkeys and values
//! 5. **Value Keys (vk)**: Registry values with typed data
//! 6. **Subkey Lists (lf/lh/li/ri)**: Efficient subkey organization
//!
//! The write path adds a transaction overlay, a lazily materialized
//! rebuild tree, a bin-aware cell allocator, and the cell emitter that
//! produces the output image.
//!
//! ## Binary Layout
//!
//! Registry hives follow this structure:
//!
//! ```text
//! [Base Block - 4KB]
//!   - Signature: "regf"
//!   - Version, timestamps, root offset
//!   - Checksum
//!
//! [Hive Bins - variable size, 4KB aligned]
//!   [Hbin Header - 32 bytes]
//!     - Signature: "hbin"
//!     - Offset, size
//!
//!   [Cells - variable size]
//!     [Cell Size - 4 bytes, negative if allocated]
//!     [Cell Data]
//!       - Key nodes (nk)
//!       - Value keys (vk)
//!       - Subkey lists (lf/lh/li/ri)
//!       - Big data records (db)
//! ```
//!
//! ## Examples
//!
//! ### Reading a hive
//!
//! ```no_run
//! use reg_forge::Hive;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let hive = Hive::open("SYSTEM")?;
//! let root = hive.root_key()?;
//!
//! for subkey in root.subkeys()? {
//!     println!("  Subkey: {}", subkey.name());
//! }
//!
//! for value in root.values()? {
//!     println!("  Value: {} = {}", value.name(), value.data()?.to_display_string());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Editing and rebuilding
//!
//! ```no_run
//! use reg_forge::{FileSink, Hive, Transaction, ValueType, WriteOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let base = Hive::open("SOFTWARE")?;
//!
//! let mut tx = Transaction::begin(Some(&base));
//! tx.create_key("Vendor\\App", true)?;
//! tx.set_value("Vendor\\App", "Version", ValueType::String, b"1\0.\02\0\0\0")?;
//! tx.delete_key("Vendor\\Stale", true)?;
//!
//! let mut sink = FileSink::new("SOFTWARE.rebuilt");
//! tx.commit(&mut sink, &WriteOptions::default())?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod allocator;
pub mod bigdata;
pub mod cell;
pub mod error;
pub mod hbin;
pub mod header;
pub mod hive;
pub mod key;
pub mod limits;
pub mod pool;
pub mod sink;
pub mod strings;
pub mod subkey_list;
pub mod transaction;
pub mod utils;
pub mod value;

mod emitter;
mod tree;

// Re-export main types for convenience
pub use allocator::CellAllocator;
pub use cell::{CellType, KeyNodeFlags, ValueKeyFlags, ValueType};
pub use error::{RegistryError, Result};
pub use hbin::HbinHeader;
pub use header::BaseBlock;
pub use hive::{HbinIterator, Hive, RegistryKey, RegistryValue};
pub use key::KeyNode;
pub use limits::HiveLimits;
pub use sink::{FileSink, HiveSink, MemorySink};
pub use subkey_list::{SubkeyEntry, SubkeyListType};
pub use transaction::{Transaction, WriteOptions};
pub use value::{ValueData, ValueKey};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
