//! Scratchpad booking (at init) and granting (at execute).
//!
//! The [`Registrar`] records named bookings while an implementation is
//! initialised. The frozen [`ScratchpadRegistry`] computes aligned offsets,
//! and a [`Grantor`] backs them with one allocation for a single execution.

use std::collections::HashMap;

use bytemuck::Pod;
use primkit_core::{PrimError, Result};
use primkit_layout::{ArgKey, DataType, TensorMeta};

/// Default booking alignment in bytes.
pub const DEFAULT_ALIGNMENT: usize = 64;

/// Every booking is at least 8-byte aligned so any Pod view fits.
const MIN_ALIGNMENT: usize = 8;

pub mod names {
    pub const PRECOMPUTED_SCALES: &str = "precomputed_scales";
    pub const SRC_ZERO_POINTS: &str = "src_zero_points";
    pub const WEI_ZERO_POINTS: &str = "wei_zero_points";
    pub const DST_ZERO_POINTS: &str = "dst_zero_points";
    pub const ROUNDING_SEED: &str = "sround_seed";
    pub const GEMM_ACC: &str = "gemm_acc";
    pub const REORDER_TMP: &str = "reorder_tmp";
    pub const NORM_STATS: &str = "norm_stats";
    pub const RNN_GATES: &str = "rnn_gates";
    pub const DW_CONV_BUF: &str = "dw_conv_buf";

    pub fn binary_rhs(i: usize) -> String {
        format!("binary_rhs_{i}")
    }

    pub fn prelu_rhs(i: usize) -> String {
        format!("prelu_rhs_{i}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Booking {
    pub key: String,
    /// Execution argument the buffer is exposed as, if any.
    pub arg: Option<ArgKey>,
    pub dtype: DataType,
    pub count: usize,
    pub alignment: usize,
    /// Tensor layout registered for auxiliary post-op inputs.
    pub md: Option<TensorMeta>,
}

impl Booking {
    pub fn size_bytes(&self) -> usize {
        self.dtype.size_of(self.count)
    }
}

/// Records bookings during `init`.
#[derive(Debug, Clone, Default)]
pub struct Registrar {
    bookings: Vec<Booking>,
}

impl Registrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Books `count` elements of `dtype`; rebooking a key is an error.
    pub fn book(&mut self, key: &str, dtype: DataType, count: usize, alignment: usize) -> Result<()> {
        self.push(Booking {
            key: key.to_string(),
            arg: None,
            dtype,
            count,
            alignment,
            md: None,
        })
    }

    /// Books a buffer that is also passed as execution argument `arg`.
    pub fn book_arg(&mut self, key: &str, arg: ArgKey, dtype: DataType, count: usize) -> Result<()> {
        self.push(Booking {
            key: key.to_string(),
            arg: Some(arg),
            dtype,
            count,
            alignment: DEFAULT_ALIGNMENT,
            md: None,
        })
    }

    /// Registers a tensor layout under `key`, sized from the tensor.
    pub fn book_md(&mut self, key: &str, arg: ArgKey, md: &TensorMeta) -> Result<()> {
        let count = md.padded_dims().iter().product();
        self.push(Booking {
            key: key.to_string(),
            arg: Some(arg),
            dtype: md.dtype(),
            count,
            alignment: DEFAULT_ALIGNMENT,
            md: Some(md.clone()),
        })
    }

    fn push(&mut self, booking: Booking) -> Result<()> {
        if booking.alignment == 0 || !booking.alignment.is_power_of_two() {
            return Err(PrimError::invalid(format!(
                "alignment {} of '{}' is not a power of two",
                booking.alignment, booking.key
            )));
        }
        if booking.dtype == DataType::Undef {
            return Err(PrimError::invalid(format!(
                "booking '{}' has undefined data type",
                booking.key
            )));
        }
        if self.bookings.iter().any(|b| b.key == booking.key) {
            return Err(PrimError::invalid(format!(
                "scratchpad key '{}' booked twice",
                booking.key
            )));
        }
        self.bookings.push(booking);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.bookings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bookings.len()
    }

    pub fn get(&self, key: &str) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.key == key)
    }

    pub fn bookings(&self) -> &[Booking] {
        &self.bookings
    }

    pub fn freeze(self) -> ScratchpadRegistry {
        let mut offsets = HashMap::with_capacity(self.bookings.len());
        let mut size = 0usize;
        let mut alignment = MIN_ALIGNMENT;
        for (i, b) in self.bookings.iter().enumerate() {
            let align = b.alignment.max(MIN_ALIGNMENT);
            alignment = alignment.max(align);
            size = size.next_multiple_of(align);
            offsets.insert(b.key.clone(), (i, size));
            size += b.size_bytes();
        }
        ScratchpadRegistry {
            bookings: self.bookings,
            offsets,
            size,
            alignment,
        }
    }
}

/// Frozen bookings with their offsets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScratchpadRegistry {
    bookings: Vec<Booking>,
    offsets: HashMap<String, (usize, usize)>,
    size: usize,
    alignment: usize,
}

impl ScratchpadRegistry {
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn bookings(&self) -> &[Booking] {
        &self.bookings
    }

    /// Alignment the base of the granted memory must have.
    pub fn alignment(&self) -> usize {
        self.alignment.max(MIN_ALIGNMENT)
    }

    pub fn get(&self, key: &str) -> Option<&Booking> {
        self.offsets.get(key).map(|(i, _)| &self.bookings[*i])
    }

    pub fn offset(&self, key: &str) -> Option<usize> {
        self.offsets.get(key).map(|(_, off)| *off)
    }

    /// Argument keys exposed by bookings (post-op inputs, ZP buffers, seeds).
    pub fn args(&self) -> impl Iterator<Item = (ArgKey, &Booking)> {
        self.bookings.iter().filter_map(|b| b.arg.map(|a| (a, b)))
    }
}

/// Backs a [`ScratchpadRegistry`] with memory for one execution.
#[derive(Debug)]
pub struct Grantor<'r> {
    registry: &'r ScratchpadRegistry,
    // Over-allocated by the registry alignment; bookings start at `base`.
    storage: Vec<u8>,
    base: usize,
}

impl<'r> Grantor<'r> {
    /// Allocates the scratchpad; fails with `OutOfMemory` above `limit` bytes.
    pub fn new(registry: &'r ScratchpadRegistry, limit: Option<usize>) -> Result<Self> {
        let requested = registry.size();
        if let Some(limit) = limit {
            if requested > limit {
                return Err(PrimError::OutOfMemory { requested, limit });
            }
        }
        let align = registry.alignment();
        let storage = vec![0u8; requested + align];
        let addr = storage.as_ptr().addr();
        let base = addr.next_multiple_of(align) - addr;
        Ok(Self {
            registry,
            storage,
            base,
        })
    }

    pub fn size(&self) -> usize {
        self.registry.size()
    }

    fn range(&self, key: &str, elem_size: usize) -> Result<(usize, usize)> {
        let booking = self
            .registry
            .get(key)
            .ok_or_else(|| PrimError::RuntimeError(format!("scratchpad key '{key}' not booked")))?;
        let offset = self.registry.offset(key).unwrap_or_default();
        let bytes = booking.size_bytes();
        if elem_size == 0 || bytes % elem_size != 0 || booking.dtype.size() != elem_size {
            return Err(PrimError::RuntimeError(format!(
                "scratchpad '{key}' holds {} elements, requested {elem_size}-byte view",
                booking.dtype
            )));
        }
        Ok((self.base + offset, self.base + offset + bytes))
    }

    /// Typed mutable view of a booking.
    pub fn get<T: Pod>(&mut self, key: &str) -> Result<&mut [T]> {
        let (start, end) = self.range(key, std::mem::size_of::<T>())?;
        bytemuck::try_cast_slice_mut(&mut self.storage[start..end])
            .map_err(|e| PrimError::RuntimeError(format!("scratchpad '{key}': {e}")))
    }

    pub fn get_ref<T: Pod>(&self, key: &str) -> Result<&[T]> {
        let (start, end) = self.range(key, std::mem::size_of::<T>())?;
        bytemuck::try_cast_slice(&self.storage[start..end])
            .map_err(|e| PrimError::RuntimeError(format!("scratchpad '{key}': {e}")))
    }
}
