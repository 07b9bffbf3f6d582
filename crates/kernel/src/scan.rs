//! Work-efficient parallel exclusive prefix sum.
//!
//! Three phases, matching the GPU dispatch structure:
//!
//! 1. **Block scan**: the input is cut into blocks of [`BLOCK_SIZE`]
//!    elements (two per thread of a 256-wide workgroup). Each block is
//!    scanned with the Blelloch up-sweep / down-sweep in a zero-padded
//!    scratch array, and the block total is written to `block_sums`.
//! 2. **Block-sum scan**: `block_sums` is scanned in place. When it fits in
//!    one block this is a single Blelloch pass; otherwise a nested
//!    [`ParallelPrefixSum`] handles it recursively.
//! 3. **Offset propagation**: each block adds its scanned block sum to
//!    every element.
//!
//! ```text
//! out[i] = a[0] + a[1] + ... + a[i - 1],   out[0] = 0
//! ```

use std::sync::atomic::{AtomicU32, Ordering};

use rayon::prelude::*;

use crate::error::{KernelError, Result};

/// Threads per scan workgroup.
pub const WORKGROUP_SIZE: usize = 256;

/// Elements scanned per block (two per thread).
pub const BLOCK_SIZE: usize = 2 * WORKGROUP_SIZE;

/// A value the scan can read: plain counts or the atomic counters filled by
/// [`GridBuilder::count`](crate::grid::GridBuilder::count).
pub trait ScanInput: Sync {
    /// Current value.
    fn value(&self) -> u32;
}

impl ScanInput for u32 {
    #[inline]
    fn value(&self) -> u32 {
        *self
    }
}

impl ScanInput for AtomicU32 {
    #[inline]
    fn value(&self) -> u32 {
        self.load(Ordering::Relaxed)
    }
}

/// Number of blocks needed for `len` elements.
#[inline]
pub fn block_count(len: usize) -> usize {
    len.div_ceil(BLOCK_SIZE)
}

/// In-place Blelloch exclusive scan of one block. Returns the block total.
///
/// Up-sweep builds partial sums in a balanced tree; the root is saved as the
/// total and cleared; the down-sweep then pushes prefixes back to the leaves.
pub(crate) fn blelloch_block(buf: &mut [u32; BLOCK_SIZE]) -> u32 {
    let n = BLOCK_SIZE;

    let mut offset = 1;
    let mut d = n >> 1;
    while d > 0 {
        for t in 0..d {
            let ai = offset * (2 * t + 1) - 1;
            let bi = offset * (2 * t + 2) - 1;
            buf[bi] = buf[bi].wrapping_add(buf[ai]);
        }
        offset <<= 1;
        d >>= 1;
    }

    let total = buf[n - 1];
    buf[n - 1] = 0;

    let mut d = 1;
    while d < n {
        offset >>= 1;
        for t in 0..d {
            let ai = offset * (2 * t + 1) - 1;
            let bi = offset * (2 * t + 2) - 1;
            let left = buf[ai];
            buf[ai] = buf[bi];
            buf[bi] = buf[bi].wrapping_add(left);
        }
        d <<= 1;
    }

    total
}

/// Parallel exclusive scanner with scratch sized for one input length.
///
/// All scratch (block sums, nested scanner) is allocated in [`new`](Self::new)
/// and reused by every [`execute`](Self::execute).
pub struct ParallelPrefixSum {
    len: usize,
    /// Block totals, scanned in place during phase 2.
    block_sums: Vec<u32>,
    /// Scanner for `block_sums` when there is more than one block of them.
    nested: Option<Box<ParallelPrefixSum>>,
    /// Output of the nested scan.
    nested_out: Vec<u32>,
}

impl ParallelPrefixSum {
    /// Allocate scratch for scanning arrays of `len` elements.
    pub fn new(len: usize) -> Self {
        let blocks = block_count(len);
        let (nested, nested_out) = if blocks > BLOCK_SIZE {
            (Some(Box::new(Self::new(blocks))), vec![0; blocks])
        } else {
            (None, Vec::new())
        };
        Self {
            len,
            block_sums: vec![0; blocks],
            nested,
            nested_out,
        }
    }

    /// Input length this scanner was built for.
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` if the scanner handles empty arrays only.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of recursion levels below this one.
    pub fn depth(&self) -> usize {
        self.nested.as_ref().map_or(0, |n| 1 + n.depth())
    }

    /// Scan `input` into `output`. Both must have the length given to `new`.
    /// Zero-length input is a no-op.
    pub fn execute<T: ScanInput>(&mut self, input: &[T], output: &mut [u32]) -> Result<()> {
        if input.len() != self.len {
            return Err(KernelError::LengthMismatch {
                buffer: "scan input",
                expected: self.len,
                actual: input.len(),
            });
        }
        if output.len() != self.len {
            return Err(KernelError::LengthMismatch {
                buffer: "scan output",
                expected: self.len,
                actual: output.len(),
            });
        }
        self.scan_into(input, output);
        Ok(())
    }

    /// Three-phase scan. `input` and `output` are `self.len` long.
    fn scan_into<T: ScanInput>(&mut self, input: &[T], output: &mut [u32]) {
        debug_assert_eq!(input.len(), self.len);
        debug_assert_eq!(output.len(), self.len);
        if self.block_sums.is_empty() {
            return;
        }

        // ---- Phase 1: block-local scan ----
        output
            .par_chunks_mut(BLOCK_SIZE)
            .zip(input.par_chunks(BLOCK_SIZE))
            .zip(self.block_sums.par_iter_mut())
            .for_each(|((out, inp), sum)| {
                let mut buf = [0u32; BLOCK_SIZE];
                for (b, v) in buf.iter_mut().zip(inp) {
                    *b = v.value();
                }
                *sum = blelloch_block(&mut buf);
                out.copy_from_slice(&buf[..out.len()]);
            });

        // ---- Phase 2: scan of block sums ----
        let block_offsets: &[u32] = match self.nested.as_mut() {
            Some(nested) => {
                nested.scan_into(&self.block_sums, &mut self.nested_out);
                &self.nested_out
            }
            None => {
                let mut buf = [0u32; BLOCK_SIZE];
                buf[..self.block_sums.len()].copy_from_slice(&self.block_sums);
                blelloch_block(&mut buf);
                let blocks = self.block_sums.len();
                self.block_sums.copy_from_slice(&buf[..blocks]);
                &self.block_sums
            }
        };

        // ---- Phase 3: offset propagation ----
        output
            .par_chunks_mut(BLOCK_SIZE)
            .zip(block_offsets.par_iter())
            .skip(1)
            .for_each(|(out, &base)| {
                for v in out.iter_mut() {
                    *v = v.wrapping_add(base);
                }
            });
    }
}

/// Exclusive scan of `input` into a freshly allocated vector.
pub fn exclusive_scan(input: &[u32]) -> Vec<u32> {
    let mut out = vec![0; input.len()];
    ParallelPrefixSum::new(input.len()).scan_into(input, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serial(a: &[u32]) -> Vec<u32> {
        let mut acc = 0u32;
        a.iter()
            .map(|&v| {
                let o = acc;
                acc += v;
                o
            })
            .collect()
    }

    #[test]
    fn empty_is_noop() {
        let mut scanner = ParallelPrefixSum::new(0);
        let input: [u32; 0] = [];
        let mut out: [u32; 0] = [];
        assert!(scanner.execute(&input, &mut out).is_ok());
        assert!(exclusive_scan(&[]).is_empty());
    }

    #[test]
    fn single_element() {
        assert_eq!(exclusive_scan(&[7]), vec![0]);
    }

    #[test]
    fn small_non_power_of_two() {
        let a = [3, 1, 7, 0, 4, 1, 6, 3, 2];
        assert_eq!(exclusive_scan(&a), vec![0, 3, 4, 11, 11, 15, 16, 22, 25]);
    }

    #[test]
    fn exact_block_boundaries() {
        for len in [BLOCK_SIZE - 1, BLOCK_SIZE, BLOCK_SIZE + 1, 3 * BLOCK_SIZE] {
            let a: Vec<u32> = (0..len as u32).map(|i| i % 5).collect();
            assert_eq!(exclusive_scan(&a), serial(&a), "len {len}");
        }
    }

    #[test]
    fn recursive_block_sums() {
        // More than BLOCK_SIZE blocks forces one level of recursion.
        let len = BLOCK_SIZE * (BLOCK_SIZE + 3) + 17;
        let a: Vec<u32> = (0..len as u32).map(|i| (i * 7) % 3).collect();
        let mut scanner = ParallelPrefixSum::new(len);
        assert_eq!(scanner.depth(), 1);
        let mut out = vec![0; len];
        scanner.execute(&a, &mut out).unwrap();
        assert_eq!(out, serial(&a));
        assert_eq!(exclusive_scan(&a), out);
    }

    #[test]
    fn scanner_is_reusable() {
        let mut scanner = ParallelPrefixSum::new(1000);
        let mut out = vec![0; 1000];
        let ones = vec![1u32; 1000];
        scanner.execute(&ones, &mut out).unwrap();
        assert_eq!(out[999], 999);
        let twos = vec![2u32; 1000];
        scanner.execute(&twos, &mut out).unwrap();
        assert_eq!(out[999], 1998);
    }

    #[test]
    fn reads_atomic_counters() {
        let counts: Vec<AtomicU32> = [2, 0, 5].iter().map(|&v| AtomicU32::new(v)).collect();
        let mut out = vec![0; 3];
        ParallelPrefixSum::new(3).execute(&counts, &mut out).unwrap();
        assert_eq!(out, vec![0, 2, 2]);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut scanner = ParallelPrefixSum::new(4);
        let mut out = vec![0; 4];
        assert!(matches!(
            scanner.execute(&[1u32, 2, 3], &mut out),
            Err(KernelError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn blelloch_block_total() {
        let mut buf = [1u32; BLOCK_SIZE];
        let total = blelloch_block(&mut buf);
        assert_eq!(total, BLOCK_SIZE as u32);
        assert_eq!(buf[0], 0);
        assert_eq!(buf[BLOCK_SIZE - 1], BLOCK_SIZE as u32 - 1);
    }
}
