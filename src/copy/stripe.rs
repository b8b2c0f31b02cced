//! Stripe geometry and copy planning

use serde::{Deserialize, Serialize};

use crate::error::{FamError, Result};

/// Placement of a dataitem's bytes across memory servers
///
/// Logical byte `p` lives on server `(p / interleave) % servers` at local
/// offset `(p / (interleave * servers)) * interleave + p % interleave`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripeLayout {
    pub interleave_size: u64,
    pub server_count: u64,
}

/// Where a logical byte lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeLocation {
    pub server_index: u64,
    pub local_offset: u64,
}

impl StripeLayout {
    /// An interleave of zero is only meaningful for a single server
    pub fn new(interleave_size: u64, server_count: u64) -> Result<Self> {
        if server_count == 0 {
            return Err(FamError::range_mismatch("stripe layout needs at least one server"));
        }
        if interleave_size == 0 && server_count > 1 {
            return Err(FamError::range_mismatch(format!(
                "zero interleave size across {} servers",
                server_count
            )));
        }
        Ok(Self {
            interleave_size,
            server_count,
        })
    }

    fn is_unstriped(&self) -> bool {
        self.server_count == 1 || self.interleave_size == 0
    }

    pub fn locate(&self, pos: u64) -> StripeLocation {
        if self.is_unstriped() {
            return StripeLocation {
                server_index: 0,
                local_offset: pos,
            };
        }
        let stripe = pos / self.interleave_size;
        StripeLocation {
            server_index: stripe % self.server_count,
            local_offset: (stripe / self.server_count) * self.interleave_size
                + pos % self.interleave_size,
        }
    }

    /// Bytes from `pos` to the end of its stripe
    pub fn stripe_remaining(&self, pos: u64) -> u64 {
        if self.is_unstriped() {
            return u64::MAX;
        }
        self.interleave_size - pos % self.interleave_size
    }
}

/// One contiguous per-server piece of a copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubTransfer {
    /// Index into the source server lists
    pub src_server_index: u64,
    /// Offset relative to the source dataitem's base on that server
    pub src_local_offset: u64,
    /// Offset relative to the destination dataitem's base on this server
    pub dest_local_offset: u64,
    pub len: u64,
}

/// Split `size` logical bytes into the minimal list of sub-transfers landing on
/// destination server `dest_server_index`
///
/// Byte `k` of the copy is read from logical source position `src_start + k`
/// and written to logical destination position `dest_start + k`. Pieces that
/// are contiguous on both sides are merged.
pub fn plan_copy(
    src: &StripeLayout,
    src_start: u64,
    dest: &StripeLayout,
    dest_start: u64,
    dest_server_index: u64,
    size: u64,
) -> Vec<SubTransfer> {
    let mut plan: Vec<SubTransfer> = Vec::new();
    let mut done = 0u64;

    while done < size {
        let src_pos = src_start + done;
        let dest_pos = dest_start + done;
        let step = src
            .stripe_remaining(src_pos)
            .min(dest.stripe_remaining(dest_pos))
            .min(size - done);

        let dest_loc = dest.locate(dest_pos);
        if dest_loc.server_index == dest_server_index {
            let src_loc = src.locate(src_pos);
            let merged = match plan.last_mut() {
                Some(last)
                    if last.src_server_index == src_loc.server_index
                        && last.src_local_offset + last.len == src_loc.local_offset
                        && last.dest_local_offset + last.len == dest_loc.local_offset =>
                {
                    last.len += step;
                    true
                }
                _ => false,
            };
            if !merged {
                plan.push(SubTransfer {
                    src_server_index: src_loc.server_index,
                    src_local_offset: src_loc.local_offset,
                    dest_local_offset: dest_loc.local_offset,
                    len: step,
                });
            }
        }
        done += step;
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locate() {
        let layout = StripeLayout::new(4, 3).unwrap();
        assert_eq!(
            layout.locate(0),
            StripeLocation { server_index: 0, local_offset: 0 }
        );
        assert_eq!(
            layout.locate(5),
            StripeLocation { server_index: 1, local_offset: 1 }
        );
        assert_eq!(
            layout.locate(13),
            StripeLocation { server_index: 0, local_offset: 5 }
        );
        assert_eq!(layout.stripe_remaining(13), 3);
    }

    #[test]
    fn test_unstriped_copy_is_one_transfer() {
        let single = StripeLayout::new(0, 1).unwrap();
        let plan = plan_copy(&single, 10, &single, 0, 0, 300);
        assert_eq!(
            plan,
            vec![SubTransfer {
                src_server_index: 0,
                src_local_offset: 10,
                dest_local_offset: 0,
                len: 300,
            }]
        );
    }

    #[test]
    fn test_resampling_covers_every_byte_once() {
        let src = StripeLayout::new(4, 2).unwrap();
        let dest = StripeLayout::new(6, 3).unwrap();
        let size = 50;

        let mut seen = vec![0u32; size as usize];
        for server in 0..dest.server_count {
            for transfer in plan_copy(&src, 3, &dest, 0, server, size) {
                for i in 0..transfer.len {
                    // Reconstruct logical positions and check both mappings agree.
                    let dest_local = transfer.dest_local_offset + i;
                    let logical = (0..size)
                        .find(|&k| {
                            let loc = dest.locate(k);
                            loc.server_index == server && loc.local_offset == dest_local
                        })
                        .unwrap();
                    let src_loc = src.locate(3 + logical);
                    assert_eq!(src_loc.server_index, transfer.src_server_index);
                    assert_eq!(src_loc.local_offset, transfer.src_local_offset + i);
                    seen[logical as usize] += 1;
                }
            }
        }
        assert!(seen.iter().all(|&count| count == 1));
    }

    #[test]
    fn test_zero_interleave_rejected_when_striped() {
        assert!(StripeLayout::new(0, 2).is_err());
        assert!(StripeLayout::new(64, 0).is_err());
    }
}
