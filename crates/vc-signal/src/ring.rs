/// Fixed-size sample window that always holds the latest `capacity` samples.
///
/// Starts zero-filled. `write` advances an internal cursor and wraps, so the
/// oldest samples are overwritten in place without shifting the rest.
#[derive(Debug, Clone, PartialEq)]
pub struct RingBuffer {
    data: Vec<f32>,
    /// Index of the oldest sample.
    cursor: usize,
}

impl RingBuffer {
    pub fn zeros(capacity: usize) -> Self {
        Self {
            data: vec![0.0; capacity],
            cursor: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn write(&mut self, samples: &[f32]) {
        let cap = self.data.len();
        if cap == 0 || samples.is_empty() {
            return;
        }
        if samples.len() >= cap {
            self.data.copy_from_slice(&samples[samples.len() - cap..]);
            self.cursor = 0;
            return;
        }

        let n = samples.len();
        let first = (cap - self.cursor).min(n);
        self.data[self.cursor..self.cursor + first].copy_from_slice(&samples[..first]);
        self.data[..n - first].copy_from_slice(&samples[first..]);
        self.cursor = (self.cursor + n) % cap;
    }

    /// Rotates the storage so it reads oldest-to-newest and returns it.
    pub fn make_contiguous(&mut self) -> &[f32] {
        if self.cursor != 0 {
            self.data.rotate_left(self.cursor);
            self.cursor = 0;
        }
        &self.data
    }

    /// Samples oldest-to-newest.
    pub fn iter(&self) -> impl Iterator<Item = &f32> + '_ {
        let (newer, older) = self.data.split_at(self.cursor);
        older.iter().chain(newer.iter())
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.iter().copied().collect()
    }

    /// Mean square over the whole window, including samples never written.
    pub fn mean_square(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.data.iter().map(|&s| (s as f64) * (s as f64)).sum();
        (sum / self.data.len() as f64) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_zeroed_at_full_capacity() {
        let rb = RingBuffer::zeros(5);
        assert_eq!(rb.capacity(), 5);
        assert_eq!(rb.to_vec(), vec![0.0; 5]);
    }

    #[test]
    fn write_keeps_latest_samples_in_order() {
        let mut rb = RingBuffer::zeros(4);
        rb.write(&[1.0, 2.0, 3.0]);
        assert_eq!(rb.to_vec(), vec![0.0, 1.0, 2.0, 3.0]);

        rb.write(&[4.0, 5.0]);
        assert_eq!(rb.to_vec(), vec![2.0, 3.0, 4.0, 5.0]);
        assert_eq!(rb.make_contiguous(), &[2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn oversized_write_keeps_tail() {
        let mut rb = RingBuffer::zeros(3);
        rb.write(&[9.0]);
        rb.write(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(rb.to_vec(), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn contiguous_view_survives_further_writes() {
        let mut rb = RingBuffer::zeros(4);
        rb.write(&[1.0, 2.0, 3.0]);
        assert_eq!(rb.make_contiguous(), &[0.0, 1.0, 2.0, 3.0]);
        rb.write(&[4.0, 5.0, 6.0]);
        assert_eq!(rb.make_contiguous(), &[3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn mean_square_covers_unwritten_part() {
        let mut rb = RingBuffer::zeros(4);
        rb.write(&[2.0]);
        assert!((rb.mean_square() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn zero_capacity_ignores_writes() {
        let mut rb = RingBuffer::zeros(0);
        rb.write(&[1.0, 2.0]);
        assert!(rb.to_vec().is_empty());
        assert_eq!(rb.mean_square(), 0.0);
    }
}
