use crate::core::types::{DocIndex, Rank};

/// Rows start on 8-byte boundaries; the matcher does quadword loads, so
/// every row length is a whole number of 8-byte words.
pub const ROW_BYTE_ALIGNMENT: usize = 8;

const DOCUMENTS_PER_BYTE: usize = 8;

fn round_up(value: usize, quantum: usize) -> usize {
    value.div_ceil(quantum) * quantum
}

/// Rounds an address or byte count up to the row alignment.
pub fn align_up(value: usize) -> usize {
    round_up(value, ROW_BYTE_ALIGNMENT)
}

/// Actual rank-0 column capacity of a row with space for at least
/// `document_count` documents. Capacity is rounded up to the cross-rank
/// quantum `8 * 8 << max_rank` so that a row at every rank up to
/// `max_rank` is a whole number of aligned words covering the same
/// columns.
pub fn documents_in_rank0_row(document_count: DocIndex, max_rank: Rank) -> DocIndex {
    let quantum = (ROW_BYTE_ALIGNMENT * DOCUMENTS_PER_BYTE) << max_rank;
    round_up(document_count, quantum)
}

/// Byte length of a rank-`rank` row holding at least `document_count`
/// rank-0 columns.
pub fn bytes_in_row(document_count: DocIndex, rank: Rank, max_rank: Rank) -> usize {
    documents_in_rank0_row(document_count, max_rank) >> (3 + rank)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 8);
        assert_eq!(align_up(8), 8);
        assert_eq!(align_up(9), 16);
    }

    #[test]
    fn test_documents_in_rank0_row() {
        // With only rank 0 in use the quantum is one aligned word.
        assert_eq!(documents_in_rank0_row(1, 0), 64);
        assert_eq!(documents_in_rank0_row(64, 0), 64);
        assert_eq!(documents_in_rank0_row(65, 0), 128);
        // Higher max ranks double the quantum per rank.
        assert_eq!(documents_in_rank0_row(1, 3), 512);
        assert_eq!(documents_in_rank0_row(513, 3), 1024);
        assert_eq!(documents_in_rank0_row(1, 7), 8192);
    }

    #[test]
    fn test_bytes_in_row() {
        assert_eq!(bytes_in_row(4096, 0, 0), 512);
        assert_eq!(bytes_in_row(4096, 3, 3), 64);
        assert_eq!(bytes_in_row(4096, 6, 6), 8);
        // One stored bit of a rank-r row covers 2^r columns, so every
        // rank describes the same columns in fewer bytes.
        for rank in 0..=7 {
            assert_eq!(bytes_in_row(8192, rank, 7), 1024 >> rank);
        }
    }

    #[test]
    fn test_all_ranks_align_at_the_quantum() {
        let capacity = documents_in_rank0_row(1000, 7);
        for rank in 0..=7 {
            assert_eq!(bytes_in_row(capacity, rank, 7) % ROW_BYTE_ALIGNMENT, 0);
        }
    }
}
