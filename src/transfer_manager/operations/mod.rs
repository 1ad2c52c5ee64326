//! Chunked transfer protocols, expressed as work units.
//!
//! Uploads decompose at add time from the local file size; downloads start
//! with a 1-byte probe that discovers the blob size, after which the block
//! layout is built. Each block becomes one unit; a finalize unit depends on
//! every block.

mod download;
mod upload;

pub use download::{DownloadBlockOperation, DownloadFinalOperation, DownloadInitialOperation};
pub use upload::{UploadBlockOperation, UploadFinalOperation};

/// Split `[0, total_size)` into contiguous half-open chunks of at most
/// `block_size` bytes. A zero-length blob has no blocks.
///
/// Callers validate `block_size > 0` before decomposing.
pub fn block_layout(total_size: u64, block_size: u64) -> Vec<(u64, u64)> {
    let mut blocks = Vec::new();
    let mut start = 0;
    while start < total_size {
        let end = (start + block_size).min(total_size);
        blocks.push((start, end));
        start = end;
    }
    blocks
}

/// Unit id of the finalize operation for a blob transfer.
pub fn final_unit_id(parent_id: &str) -> String {
    format!("{}-final", parent_id)
}

/// Path blocks are assembled into before the atomic rename onto the
/// destination.
pub fn partial_path(destination: &str) -> std::path::PathBuf {
    std::path::PathBuf::from(format!("{}.partial", destination))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_layout_size_grid() {
        let bs = 4096;

        assert!(block_layout(0, bs).is_empty());
        assert_eq!(block_layout(1, bs), vec![(0, 1)]);
        assert_eq!(block_layout(bs - 1, bs), vec![(0, bs - 1)]);
        assert_eq!(block_layout(bs, bs), vec![(0, bs)]);
        assert_eq!(block_layout(bs + 1, bs), vec![(0, bs), (bs, bs + 1)]);
        assert_eq!(
            block_layout(3 * bs, bs),
            vec![(0, bs), (bs, 2 * bs), (2 * bs, 3 * bs)]
        );
    }

    #[test]
    fn test_block_layout_covers_range_exactly() {
        for total in [1u64, 100, 4095, 4096, 4097, 10_240, 1_000_000] {
            let layout = block_layout(total, 4096);

            // Contiguous, non-overlapping, covering [0, total)
            assert_eq!(layout.first().unwrap().0, 0);
            assert_eq!(layout.last().unwrap().1, total);
            for pair in layout.windows(2) {
                assert_eq!(pair[0].1, pair[1].0);
            }
            let sum: u64 = layout.iter().map(|(s, e)| e - s).sum();
            assert_eq!(sum, total);
        }
    }

    #[test]
    fn test_ten_megabytes_with_four_megabyte_blocks() {
        let mb = 1024 * 1024;
        let layout = block_layout(10 * mb, 4 * mb);
        assert_eq!(layout.len(), 3);
        assert_eq!(layout[0].1 - layout[0].0, 4 * mb);
        assert_eq!(layout[1].1 - layout[1].0, 4 * mb);
        assert_eq!(layout[2].1 - layout[2].0, 2 * mb);
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path("/tmp/out.bin"),
            std::path::PathBuf::from("/tmp/out.bin.partial")
        );
    }
}
