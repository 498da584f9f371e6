//! Fixed-order batching for the validation and test splits.

use seg_core::{Batch, Error, Result, Sample};

/// Groups samples into batches of `batch_size`, keeping a trailing partial
/// batch.
pub fn into_batches(samples: &[Sample], batch_size: usize) -> Result<Vec<Batch>> {
    if batch_size == 0 {
        return Err(Error::InvalidArgument("batch size must be positive".to_string()));
    }
    samples
        .chunks(batch_size)
        .map(|chunk| Batch::from_samples(chunk.to_vec()))
        .collect()
}

/// Number of batches `into_batches` yields for `len` samples.
pub fn batch_count(len: usize, batch_size: usize) -> usize {
    if batch_size == 0 {
        0
    } else {
        len.div_ceil(batch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(n: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| Sample::new(vec![i as f32; 4], vec![0; 4], 2).unwrap())
            .collect()
    }

    #[test]
    fn test_into_batches_keeps_remainder() {
        let batches = into_batches(&samples(5), 2).unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].len, 1);
        assert_eq!(batches[2].images[0], 4.0);
        assert_eq!(batch_count(5, 2), 3);
    }

    #[test]
    fn test_empty_split() {
        assert!(into_batches(&[], 4).unwrap().is_empty());
        assert!(into_batches(&samples(2), 0).is_err());
    }
}
