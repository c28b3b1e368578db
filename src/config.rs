//! Configuration constants for the on-disk format.
//! These constants define the stable page layout and engine limits.

/// Logical page size in bytes for all database files.
pub const PAGE_SIZE: usize = 4096;

/// Bytes reserved at the start of page 0 for the database header.
///
/// The header itself is 8 bytes today; the rest of the prefix is zero and
/// reserved for future metadata. Tree node capacities are computed against
/// `PAGE_SIZE - ROOT_PAGE_CONFIG_SIZE` so a node can always be stored on
/// page 0.
pub const ROOT_PAGE_CONFIG_SIZE: usize = 64;

/// Usable bytes for a serialized node on any page.
pub const NODE_AREA_SIZE: usize = PAGE_SIZE - ROOT_PAGE_CONFIG_SIZE;

/// Longest varchar value stored inline in a leaf cell. Longer values spill
/// to a chain of overflow pages and the cell stores a `TextPointer`.
pub const MAX_INLINE_VARCHAR: usize = 255;

/// Overflow page header: type tag (1) + next pointer (4) + data length (2).
pub const OVERFLOW_HEADER_SIZE: usize = 7;

/// Payload capacity of a single overflow page.
pub const MAX_OVERFLOW_PAGE_DATA: usize = NODE_AREA_SIZE - OVERFLOW_HEADER_SIZE;

/// Base node header: is_root (1) + is_internal (1) + parent (4).
pub const BASE_HEADER_SIZE: usize = 6;

/// Leaf node header: base + cells (4) + next_leaf (4).
pub const LEAF_HEADER_SIZE: usize = BASE_HEADER_SIZE + 8;

/// Internal node header: base + keys_num (4) + right_child (4).
pub const INTERNAL_HEADER_SIZE: usize = BASE_HEADER_SIZE + 8;

/// Index node header: is_root (1) + is_leaf (1) + parent (4) + keys (4)
/// + right_child (4).
pub const INDEX_HEADER_SIZE: usize = 14;

/// Internal cell: key (8) + child (4).
pub const INTERNAL_CELL_SIZE: usize = 12;

/// Fixed prefix of a leaf cell: key (8) + null bitmask (8).
pub const LEAF_CELL_HEADER_SIZE: usize = 16;

/// Sentinel meaning "not set" in right-child pointers, distinguishing the
/// unset state from page 0.
pub const RIGHT_CHILD_UNSET: u32 = 0xFFFF_FFFF;

/// Page type tag stored on overflow pages.
pub const OVERFLOW_PAGE_TAG: u8 = 4;

/// Name of the self-describing catalog table rooted at page 0.
pub const META_TABLE_NAME: &str = "minisql_schema";

/// Widest table or column identifier accepted.
pub const MAX_IDENT_LEN: usize = 64;

/// Declared size of the catalog's `sql` column; large enough that long DDL
/// exercises the overflow path.
pub const META_SQL_SIZE: usize = 2048;

/// Upper bound on tree depth used to break pointer cycles during descent.
pub const MAX_TREE_DEPTH: usize = 64;
