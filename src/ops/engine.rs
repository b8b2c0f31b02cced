//! Execution of validated requests against region memory
//!
//! Callers validate the request against its dataitem first; nothing in here
//! runs until the whole batch is known to fit, so a rejected batch never
//! leaves partially applied elements behind.

use std::ops::Range;

use crate::error::{FamError, Result};

use super::request::{AtomicRequest, AtomicResponse};

fn span(offset: u64, len: u64, memory_len: usize) -> Result<Range<usize>> {
    let end = offset
        .checked_add(len)
        .filter(|&end| end <= memory_len as u64)
        .ok_or_else(|| {
            FamError::invalid_range(format!(
                "[{}, +{}) lies outside region memory of {} bytes",
                offset, len, memory_len
            ))
        })?;
    Ok(offset as usize..end as usize)
}

/// Execute a read-only request (get or gather)
pub fn execute_read(request: &AtomicRequest, memory: &[u8]) -> Result<AtomicResponse> {
    match request {
        AtomicRequest::Get { offset, len } => {
            let range = span(*offset, *len, memory.len())?;
            Ok(AtomicResponse::Data(memory[range].to_vec()))
        }
        AtomicRequest::GatherStrided { offset, layout } => {
            let mut out = Vec::with_capacity(layout.payload_len() as usize);
            for element in layout.offsets() {
                let range = span(offset + element, layout.element_size, memory.len())?;
                out.extend_from_slice(&memory[range]);
            }
            Ok(AtomicResponse::Data(out))
        }
        AtomicRequest::GatherIndexed { offset, layout } => {
            let mut out = Vec::with_capacity(layout.payload_len() as usize);
            for element in layout.offsets() {
                let range = span(offset + element, layout.element_size, memory.len())?;
                out.extend_from_slice(&memory[range]);
            }
            Ok(AtomicResponse::Data(out))
        }
        other => Err(FamError::invalid_state(format!(
            "{:?} is not a read-only request",
            other.kind()
        ))),
    }
}

/// Execute a request that modifies memory (put, scatter, bitwise)
pub fn execute_write(request: &AtomicRequest, memory: &mut [u8]) -> Result<AtomicResponse> {
    let memory_len = memory.len();
    match request {
        AtomicRequest::Put { offset, data } => {
            let range = span(*offset, data.len() as u64, memory_len)?;
            memory[range].copy_from_slice(data);
            Ok(AtomicResponse::Done)
        }
        AtomicRequest::ScatterStrided {
            offset,
            layout,
            data,
        } => {
            let ranges = layout
                .offsets()
                .map(|element| span(offset + element, layout.element_size, memory_len))
                .collect::<Result<Vec<_>>>()?;
            scatter(memory, &ranges, data, layout.element_size as usize);
            Ok(AtomicResponse::Done)
        }
        AtomicRequest::ScatterIndexed {
            offset,
            layout,
            data,
        } => {
            let ranges = layout
                .offsets()
                .map(|element| span(offset + element, layout.element_size, memory_len))
                .collect::<Result<Vec<_>>>()?;
            scatter(memory, &ranges, data, layout.element_size as usize);
            Ok(AtomicResponse::Done)
        }
        AtomicRequest::Bitwise {
            offset,
            op,
            value,
            fetch,
        } => {
            let range = span(*offset, value.width(), memory_len)?;
            let target = &mut memory[range];
            let prior = value.read_same_width(target);
            prior.combine(*op, *value).write_le(target);
            Ok(if *fetch {
                AtomicResponse::Value(prior)
            } else {
                AtomicResponse::Done
            })
        }
        other => Err(FamError::invalid_state(format!(
            "{:?} does not modify memory",
            other.kind()
        ))),
    }
}

fn scatter(memory: &mut [u8], ranges: &[Range<usize>], data: &[u8], element_size: usize) {
    for (range, chunk) in ranges.iter().zip(data.chunks(element_size)) {
        memory[range.clone()].copy_from_slice(chunk);
    }
}
