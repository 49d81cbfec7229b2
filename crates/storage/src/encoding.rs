//! Value encodings of a column chunk and their decoders.
//!
//! Decoders expose `skip` and `next` plus a bulk [`ValueDecoder::visit`]
//! that matches on the encoding once and then runs a loop monomorphized
//! over the caller's callback.

use std::collections::HashMap;
use std::sync::Arc;

use strata_common::{Result, StrataError};

use crate::native::NativeValue;

/// Encoding kind of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Plain,
    Dictionary,
    RunLength,
    Delta,
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Encoding::Plain => "plain",
            Encoding::Dictionary => "dictionary",
            Encoding::RunLength => "run_length",
            Encoding::Delta => "delta",
        };
        f.write_str(name)
    }
}

/// Encoded non-null values of one column chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodedValues<T> {
    Plain(Vec<T>),
    Dictionary {
        dictionary: Vec<T>,
        indices: Vec<u32>,
    },
    /// `(value, run length)` pairs; run lengths are never zero.
    RunLength { runs: Vec<(T, u32)> },
    /// Integers only. Value `i` is the wrapping sum of `deltas[..=i]`.
    Delta { deltas: Vec<i64> },
}

/// Bit pattern of a value, used to dedup dictionary entries and detect runs
/// so that floats (including NaN) compare by identity.
fn bits<T: NativeValue>(v: &T) -> u64 {
    let mut buf = [0u8; 8];
    let bytes = bytemuck::bytes_of(v);
    buf[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

/// Bits per bit-packed dictionary index.
fn index_bits(dictionary_len: usize) -> usize {
    (usize::BITS - dictionary_len.saturating_sub(1).leading_zeros()).max(1) as usize
}

fn dictionary_encode<T: NativeValue>(values: &[T]) -> (Vec<T>, Vec<u32>) {
    let mut positions = HashMap::<u64, u32>::new();
    let mut dictionary = Vec::new();
    let indices = values
        .iter()
        .map(|v| {
            *positions.entry(bits(v)).or_insert_with(|| {
                dictionary.push(*v);
                (dictionary.len() - 1) as u32
            })
        })
        .collect();
    (dictionary, indices)
}

fn run_length_encode<T: NativeValue>(values: &[T]) -> Vec<(T, u32)> {
    let mut runs: Vec<(T, u32)> = Vec::new();
    for v in values {
        match runs.last_mut() {
            Some((last, len)) if bits(last) == bits(v) && *len < u32::MAX => *len += 1,
            _ => runs.push((*v, 1)),
        }
    }
    runs
}

impl<T: NativeValue> EncodedValues<T> {
    /// Encode `values` with `encoding`.
    pub fn encode(values: &[T], encoding: Encoding) -> Result<Self> {
        if values.len() > u32::MAX as usize {
            return Err(StrataError::Unsupported(format!(
                "chunk of {} values exceeds the encodable size",
                values.len()
            )));
        }
        Ok(match encoding {
            Encoding::Plain => Self::Plain(values.to_vec()),
            Encoding::Dictionary => {
                let (dictionary, indices) = dictionary_encode(values);
                Self::Dictionary {
                    dictionary,
                    indices,
                }
            }
            Encoding::RunLength => Self::RunLength {
                runs: run_length_encode(values),
            },
            Encoding::Delta => {
                if T::IS_FLOAT {
                    return Err(StrataError::Unsupported(format!(
                        "delta encoding of {}",
                        T::data_type()
                    )));
                }
                let mut previous = 0_i64;
                let mut deltas = Vec::with_capacity(values.len());
                for v in values {
                    let v = v.to_i64().ok_or_else(|| {
                        StrataError::Execution(format!("value {v:?} is not an integer"))
                    })?;
                    deltas.push(v.wrapping_sub(previous));
                    previous = v;
                }
                Self::Delta { deltas }
            }
        })
    }

    /// Dictionary or run-length when either is at least 4x smaller than
    /// plain, otherwise plain.
    pub fn encode_auto(values: &[T]) -> Result<Self> {
        let plain_bytes = std::mem::size_of_val(values);
        let runs = run_length_encode(values);
        let (dictionary, indices) = dictionary_encode(values);
        let rle = Self::RunLength { runs };
        let dict = Self::Dictionary {
            dictionary,
            indices,
        };
        let best = if rle.encoded_bytes() <= dict.encoded_bytes() {
            rle
        } else {
            dict
        };
        if values.is_empty() || best.encoded_bytes() * 4 > plain_bytes {
            return Self::encode(values, Encoding::Plain);
        }
        Ok(best)
    }

    pub fn encoding(&self) -> Encoding {
        match self {
            Self::Plain(_) => Encoding::Plain,
            Self::Dictionary { .. } => Encoding::Dictionary,
            Self::RunLength { .. } => Encoding::RunLength,
            Self::Delta { .. } => Encoding::Delta,
        }
    }

    /// Number of encoded values.
    pub fn len(&self) -> usize {
        match self {
            Self::Plain(values) => values.len(),
            Self::Dictionary { indices, .. } => indices.len(),
            Self::RunLength { runs } => runs.iter().map(|(_, n)| *n as usize).sum(),
            Self::Delta { deltas } => deltas.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate in-memory size of the encoded form.
    pub fn encoded_bytes(&self) -> usize {
        let width = std::mem::size_of::<T>();
        match self {
            Self::Plain(values) => values.len() * width,
            Self::Dictionary {
                dictionary,
                indices,
            } => dictionary.len() * width + (indices.len() * index_bits(dictionary.len())).div_ceil(8),
            Self::RunLength { runs } => runs.len() * (width + 4),
            Self::Delta { deltas } => deltas.len() * 8,
        }
    }

    /// Dictionary entries, for dictionary-encoded chunks.
    pub fn dictionary(&self) -> Option<&[T]> {
        match self {
            Self::Dictionary { dictionary, .. } => Some(dictionary),
            _ => None,
        }
    }
}

/// Sequential reader over [`EncodedValues`].
#[derive(Debug, Clone)]
pub struct ValueDecoder<T> {
    values: Arc<EncodedValues<T>>,
    len: usize,
    pos: usize,
    run: usize,
    run_offset: u32,
    current: i64,
}

impl<T: NativeValue> ValueDecoder<T> {
    pub fn new(values: Arc<EncodedValues<T>>) -> Self {
        let len = values.len();
        Self {
            values,
            len,
            pos: 0,
            run: 0,
            run_offset: 0,
            current: 0,
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.values.encoding()
    }

    pub fn values(&self) -> &Arc<EncodedValues<T>> {
        &self.values
    }

    /// Values not yet consumed.
    pub fn remaining(&self) -> usize {
        self.len - self.pos
    }

    fn check_available(&self, n: usize) -> Result<()> {
        if n > self.remaining() {
            return Err(StrataError::Internal(format!(
                "{} decoder asked for {n} values with {} remaining",
                self.encoding(),
                self.remaining()
            )));
        }
        Ok(())
    }

    /// Advance past `n` values without producing them.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.check_available(n)?;
        match &*self.values {
            EncodedValues::Plain(_) | EncodedValues::Dictionary { .. } => {}
            EncodedValues::RunLength { runs } => {
                let mut left = n;
                while left > 0 {
                    let in_run = (runs[self.run].1 - self.run_offset) as usize;
                    if left < in_run {
                        self.run_offset += left as u32;
                        left = 0;
                    } else {
                        left -= in_run;
                        self.run += 1;
                        self.run_offset = 0;
                    }
                }
            }
            EncodedValues::Delta { deltas } => {
                for d in &deltas[self.pos..self.pos + n] {
                    self.current = self.current.wrapping_add(*d);
                }
            }
        }
        self.pos += n;
        Ok(())
    }

    /// Decode the next value.
    pub fn next(&mut self) -> Result<T> {
        let mut out = T::default();
        self.visit(1, |v| out = v)?;
        Ok(out)
    }

    /// Decode the next `n` values into `f`, matching the encoding once.
    pub fn visit(&mut self, n: usize, mut f: impl FnMut(T)) -> Result<()> {
        self.check_available(n)?;
        match &*self.values {
            EncodedValues::Plain(values) => {
                values[self.pos..self.pos + n].iter().for_each(|v| f(*v));
            }
            EncodedValues::Dictionary {
                dictionary,
                indices,
            } => {
                for i in &indices[self.pos..self.pos + n] {
                    f(dictionary[*i as usize]);
                }
            }
            EncodedValues::RunLength { runs } => {
                let mut left = n;
                while left > 0 {
                    let (value, len) = runs[self.run];
                    let take = left.min((len - self.run_offset) as usize);
                    (0..take).for_each(|_| f(value));
                    left -= take;
                    self.run_offset += take as u32;
                    if self.run_offset == len {
                        self.run += 1;
                        self.run_offset = 0;
                    }
                }
            }
            EncodedValues::Delta { deltas } => {
                for d in &deltas[self.pos..self.pos + n] {
                    self.current = self.current.wrapping_add(*d);
                    f(self.current.cast::<T>()?);
                }
            }
        }
        self.pos += n;
        Ok(())
    }

    /// Dictionary indices of the next `n` values into `f`.
    pub fn visit_indices(&mut self, n: usize, mut f: impl FnMut(u32)) -> Result<()> {
        self.check_available(n)?;
        let EncodedValues::Dictionary { indices, .. } = &*self.values else {
            return Err(StrataError::Internal(format!(
                "dictionary indices requested from a {} chunk",
                self.encoding()
            )));
        };
        indices[self.pos..self.pos + n].iter().for_each(|i| f(*i));
        self.pos += n;
        Ok(())
    }
}
