//! Engine-wide tuning constants.
//!
//! These values are load-bearing: packet and buffer sizes determine the
//! memory bound of the exchange (`comm_size * SEND_BUFFER_LIMIT *
//! COMM_BUFFER_SIZE` words plus one buffer per worker), and the block
//! geometry ties the graph layout to the bitmap word width.

/// One bitmap word holds `NBPE` ("number of bits per entry") vertices.
pub const LOG_NBPE: u32 = 6;
/// Bits per bitmap word.
pub const NBPE: usize = 1 << LOG_NBPE;
/// Mask for the bit index within a word.
pub const NBPE_MASK: usize = NBPE - 1;

/// Rows per column-sorted edge block.
pub const LOG_BFELL_SORT: u32 = 8;
/// Width of a column-sorted edge block, in rows.
pub const BFELL_SORT: usize = 1 << LOG_BFELL_SORT;
/// Mask for the row index within a block.
pub const BFELL_SORT_MASK: usize = BFELL_SORT - 1;
/// Bitmap words covered by one edge block.
pub const WORDS_PER_BLOCK: usize = BFELL_SORT / NBPE;

/// Smallest permitted `log2` of the per-rank vertex count. Two half-bitmap
/// windows must each cover a whole number of edge blocks.
pub const MIN_LOG_LOCAL_VERTS: u32 = LOG_BFELL_SORT + 1;

/// Capacity of a per-thread, per-destination packet, in u32 words.
pub const PACKET_LENGTH: usize = 1024;
/// Capacity of one exchange buffer, in u32 words.
pub const COMM_BUFFER_SIZE: usize = 32 * 1024;
/// Exchange buffers allocated per destination up front.
pub const PRE_ALLOCATE_COMM_BUFFER: usize = 14;
/// Per-destination send-queue depth that triggers producer back-pressure.
pub const SEND_BUFFER_LIMIT: usize = 6;
/// Ring-pipeline buffer slots for the bottom-up wave.
pub const BOTTOM_UP_BUFFER: usize = 8;

/// Vertices per next-queue chunk.
pub const BUCKET_UNIT_SIZE: usize = 1024;

/// Roots sampled per benchmark run.
pub const NUM_BFS_ROOTS: usize = 64;
/// First half of the benchmark RNG seed.
pub const USERSEED1: u64 = 2;
/// Second half of the benchmark RNG seed.
pub const USERSEED2: u64 = 3;

/// Default `alpha`: switch to bottom-up once the frontier exceeds
/// `num_global_verts / alpha`.
pub const DENOM_TO_BOTTOM_UP: i64 = 2000;
/// Default `beta`: switch back to top-down once the frontier shrinks below
/// `(num_global_verts - visited) / beta`.
pub const DENOM_TO_TOP_DOWN: f64 = 2.0;

/// Chunk length for the edge-list read/write interface, in edges.
pub const EDGE_CHUNK_SIZE: usize = 1 << 16;

/// A word of a packed bitmap.
pub type BitmapWord = u64;
/// A vertex id in one of the two grid-local coordinate spaces (row space or
/// target space): `(owner_coord << lgl) | local`.
pub type GridVertex = u32;
/// Position of a row inside its degree-sorted edge block.
pub type SortIdx = u16;
