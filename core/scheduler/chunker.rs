use crate::model::ChunkSpec;

/// Group datums (given as plan index and input size) into the chunks that are handed to
/// workers. Chunks keep plan order.
///
/// A `number` groups a fixed count of datums. A `size_bytes` closes a chunk as soon as its
/// datums add up to the limit, so a datum larger than the limit gets a chunk of its own. Without
/// a spec every datum is its own chunk.
pub fn chunk(datums: &[(usize, u64)], spec: Option<&ChunkSpec>) -> Vec<Vec<usize>> {
    match spec {
        Some(spec) if spec.number > 0 => datums
            .chunks(spec.number as usize)
            .map(|chunk| chunk.iter().map(|(index, _)| *index).collect())
            .collect(),

        Some(spec) if spec.size_bytes > 0 => {
            let mut chunks = vec![];
            let mut current = vec![];
            let mut current_size = 0;
            for (index, size) in datums {
                current.push(*index);
                current_size += size;
                if current_size >= spec.size_bytes {
                    chunks.push(std::mem::take(&mut current));
                    current_size = 0;
                }
            }
            if !current.is_empty() {
                chunks.push(current);
            }
            chunks
        }

        _ => datums.iter().map(|(index, _)| vec![*index]).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sized(sizes: &[u64]) -> Vec<(usize, u64)> {
        sizes.iter().copied().enumerate().collect()
    }

    #[test]
    fn without_a_spec_every_datum_is_a_chunk() {
        assert_eq!(chunk(&sized(&[1, 2, 3]), None), vec![vec![0], vec![1], vec![2]]);
        assert_eq!(
            chunk(&sized(&[1, 2]), Some(&ChunkSpec::default())),
            vec![vec![0], vec![1]]
        );
    }

    #[test]
    fn fixed_counts_group_in_plan_order() {
        let spec = ChunkSpec {
            number: 2,
            size_bytes: 0,
        };
        assert_eq!(
            chunk(&sized(&[1, 1, 1, 1, 1]), Some(&spec)),
            vec![vec![0, 1], vec![2, 3], vec![4]]
        );
    }

    #[test]
    fn byte_limits_close_chunks_greedily() {
        let spec = ChunkSpec {
            number: 0,
            size_bytes: 10,
        };
        assert_eq!(
            chunk(&sized(&[4, 4, 4, 20, 1]), Some(&spec)),
            vec![vec![0, 1, 2], vec![3], vec![4]]
        );
    }

    #[quickcheck]
    fn chunks_cover_every_datum_once(sizes: Vec<u8>, number: u8, size_bytes: u8) -> bool {
        let datums: Vec<(usize, u64)> = sizes.iter().map(|s| *s as u64).enumerate().collect();
        let spec = ChunkSpec {
            number: (number % 4) as u64,
            size_bytes: size_bytes as u64,
        };
        let flat: Vec<usize> = chunk(&datums, Some(&spec)).into_iter().flatten().collect();
        flat == (0..datums.len()).collect::<Vec<usize>>()
    }
}
