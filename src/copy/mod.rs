//! Striped copy engine
//!
//! A copy runs on a destination memory server. It reads source stripes from
//! whichever servers hold them and writes the destination stripes this server
//! owns. Source bytes are visited in source order and land in destination
//! stripe order; no ordering stronger than "every byte lands at its computed
//! offset" is promised.

pub mod stripe;

use serde::{Deserialize, Serialize};

use crate::{
    error::{FamError, Result},
    region::RegionId,
};

pub use stripe::{plan_copy, StripeLayout, StripeLocation, SubTransfer};

/// Parameters of a striped copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyRequest {
    pub src_region_id: RegionId,
    /// Base offset of the source dataitem on each source server
    pub src_offsets: Vec<u64>,
    pub src_used_memsrv_cnt: u64,
    /// Logical source range available to the copy
    pub src_copy_start: u64,
    pub src_copy_end: u64,
    /// Registration key of the source dataitem on each source server
    pub src_keys: Vec<u64>,
    /// Registered base address of the source dataitem on each source server
    pub src_base_addrs: Vec<u64>,
    pub src_memserver_ids: Vec<u64>,
    pub src_interleave_size: u64,
    pub dest_region_id: RegionId,
    /// Base offset of the destination dataitem on this server
    pub dest_offset: u64,
    pub dest_used_memsrv_cnt: u64,
    /// Which destination stripe column this server holds
    pub dest_server_index: u64,
    /// Logical destination position of the first copied byte
    pub dest_copy_start: u64,
    pub dest_interleave_size: u64,
    pub size: u64,
}

impl CopyRequest {
    /// Check the size and per-server accounting
    pub fn validate(&self) -> Result<()> {
        let available = self
            .src_copy_end
            .checked_sub(self.src_copy_start)
            .ok_or_else(|| {
                FamError::range_mismatch(format!(
                    "source copy end {} precedes start {}",
                    self.src_copy_end, self.src_copy_start
                ))
            })?;
        if available < self.size {
            return Err(FamError::range_mismatch(format!(
                "source range holds {} bytes, copy needs {}",
                available, self.size
            )));
        }

        for (side, start) in [("source", self.src_copy_start), ("destination", self.dest_copy_start)] {
            if start.checked_add(self.size).is_none() {
                return Err(FamError::invalid_range(format!(
                    "{} range at {} of {} bytes overflows",
                    side, start, self.size
                )));
            }
        }

        let declared = self.src_used_memsrv_cnt as usize;
        let lists = [
            ("src_offsets", self.src_offsets.len()),
            ("src_keys", self.src_keys.len()),
            ("src_base_addrs", self.src_base_addrs.len()),
            ("src_memserver_ids", self.src_memserver_ids.len()),
        ];
        for (name, len) in lists {
            if len != declared {
                return Err(FamError::range_mismatch(format!(
                    "{} has {} entries for {} source servers",
                    name, len, declared
                )));
            }
        }

        if self.dest_server_index >= self.dest_used_memsrv_cnt {
            return Err(FamError::range_mismatch(format!(
                "destination server index {} out of {} servers",
                self.dest_server_index, self.dest_used_memsrv_cnt
            )));
        }

        self.src_layout()?;
        self.dest_layout()?;
        Ok(())
    }

    pub fn src_layout(&self) -> Result<StripeLayout> {
        StripeLayout::new(self.src_interleave_size, self.src_used_memsrv_cnt)
    }

    pub fn dest_layout(&self) -> Result<StripeLayout> {
        StripeLayout::new(self.dest_interleave_size, self.dest_used_memsrv_cnt)
    }

    /// Validate and compute the sub-transfers for this server
    pub fn plan(&self) -> Result<Vec<SubTransfer>> {
        self.validate()?;
        Ok(plan_copy(
            &self.src_layout()?,
            self.src_copy_start,
            &self.dest_layout()?,
            self.dest_copy_start,
            self.dest_server_index,
            self.size,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn request() -> CopyRequest {
        CopyRequest {
            src_region_id: 1,
            src_offsets: vec![0, 0],
            src_used_memsrv_cnt: 2,
            src_copy_start: 0,
            src_copy_end: 256,
            src_keys: vec![11, 12],
            src_base_addrs: vec![0x1000, 0x2000],
            src_memserver_ids: vec![0, 1],
            src_interleave_size: 64,
            dest_region_id: 2,
            dest_offset: 0,
            dest_used_memsrv_cnt: 1,
            dest_server_index: 0,
            dest_copy_start: 0,
            dest_interleave_size: 0,
            size: 256,
        }
    }

    #[test]
    fn test_valid_request_plans() {
        let plan = request().plan().unwrap();
        assert_eq!(plan.len(), 4);
        assert_eq!(plan.iter().map(|t| t.len).sum::<u64>(), 256);
    }

    #[test]
    fn test_short_source_range() {
        let mut req = request();
        req.src_copy_end = 200;
        assert_eq!(req.validate().unwrap_err().kind(), ErrorKind::RangeMismatch);
    }

    #[test]
    fn test_list_length_mismatch() {
        let mut req = request();
        req.src_keys.pop();
        assert_eq!(req.validate().unwrap_err().kind(), ErrorKind::RangeMismatch);

        let mut req = request();
        req.dest_server_index = 1;
        assert_eq!(req.validate().unwrap_err().kind(), ErrorKind::RangeMismatch);
    }

    #[test]
    fn test_destination_range_overflow() {
        let mut req = request();
        req.size = 4;
        req.dest_copy_start = u64::MAX - 3;
        assert_eq!(req.plan().unwrap_err().kind(), ErrorKind::InvalidRange);

        req.dest_copy_start = u64::MAX - 4;
        assert!(req.validate().is_ok());
    }
}
