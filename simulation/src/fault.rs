//! Flip bits in raw buffers and perturb token sequences.
//!
//! Every element is reinterpreted as an unsigned word of the same width (its [Lane]) and
//! XORed with a random mask in which each bit is set independently with probability `ber`.
//! Elements without a native word width (booleans, complex numbers, opaque types) are
//! treated as a sequence of bytes instead.
//!
//! Given the same seed and input, the output is identical across calls.

use crate::Error;
use bytes::Bytes;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{mem::size_of, ops::BitXor};

/// Element type of a [Tensor].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    Bool,
    Complex64,
    Complex128,
    /// An element of the given width (in bytes) with no known encoding.
    Opaque(usize),
}

impl DType {
    /// Width of a single element in bytes.
    pub const fn size(&self) -> usize {
        match self {
            Self::I8 | Self::U8 | Self::Bool => 1,
            Self::F16 | Self::BF16 | Self::I16 | Self::U16 => 2,
            Self::F32 | Self::I32 | Self::U32 => 4,
            Self::F64 | Self::I64 | Self::U64 | Self::Complex64 => 8,
            Self::Complex128 => 16,
            Self::Opaque(size) => *size,
        }
    }

    /// Word used to flip bits of this element type.
    pub const fn lane(&self) -> Lane {
        match self {
            Self::I8 | Self::U8 => Lane::U8,
            Self::F16 | Self::BF16 | Self::I16 | Self::U16 => Lane::U16,
            Self::F32 | Self::I32 | Self::U32 => Lane::U32,
            Self::F64 | Self::I64 | Self::U64 => Lane::U64,
            Self::Bool | Self::Complex64 | Self::Complex128 | Self::Opaque(_) => Lane::Bytes,
        }
    }

    /// Returns true for signed and unsigned integer types.
    pub const fn is_integer(&self) -> bool {
        matches!(
            self,
            Self::I8 | Self::I16 | Self::I32 | Self::I64 | Self::U8 | Self::U16 | Self::U32 | Self::U64
        )
    }
}

/// Unsigned reinterpretation of an element.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lane {
    U8,
    U16,
    U32,
    U64,
    /// Fallback: every byte is its own 8-bit unit.
    Bytes,
}

impl Lane {
    /// Number of bits in a single unit of this lane.
    pub const fn bits(&self) -> u32 {
        match self {
            Self::U8 | Self::Bytes => u8::BITS,
            Self::U16 => u16::BITS,
            Self::U32 => u32::BITS,
            Self::U64 => u64::BITS,
        }
    }
}

/// An unsigned word that elements are reinterpreted as.
pub trait Word: Copy + BitXor<Output = Self> {
    const BITS: u32;

    /// Keep the low `BITS` bits of `mask`.
    fn truncate(mask: u64) -> Self;

    /// Read a word from exactly `size_of::<Self>()` native-endian bytes.
    fn read(bytes: &[u8]) -> Self;

    /// Append the native-endian bytes of this word.
    fn extend(self, out: &mut Vec<u8>);
}

macro_rules! impl_word {
    ($($t:ty),*) => {$(
        impl Word for $t {
            const BITS: u32 = <$t>::BITS;

            fn truncate(mask: u64) -> Self {
                mask as $t
            }

            fn read(bytes: &[u8]) -> Self {
                let mut buf = [0u8; size_of::<$t>()];
                buf.copy_from_slice(bytes);
                <$t>::from_ne_bytes(buf)
            }

            fn extend(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_ne_bytes());
            }
        }
    )*};
}

impl_word!(u8, u16, u32, u64);

/// A fixed-width element that can be reinterpreted as a [Word].
pub trait Element: Copy {
    const DTYPE: DType;
    type Word: Word;

    fn into_word(self) -> Self::Word;
    fn from_word(word: Self::Word) -> Self;
}

macro_rules! impl_integer_element {
    ($($t:ty => $word:ty, $dtype:ident);* $(;)?) => {$(
        impl Element for $t {
            const DTYPE: DType = DType::$dtype;
            type Word = $word;

            fn into_word(self) -> $word {
                self as $word
            }

            fn from_word(word: $word) -> Self {
                word as $t
            }
        }
    )*};
}

impl_integer_element!(
    u8 => u8, U8;
    u16 => u16, U16;
    u32 => u32, U32;
    u64 => u64, U64;
    i8 => u8, I8;
    i16 => u16, I16;
    i32 => u32, I32;
    i64 => u64, I64;
);

impl Element for f32 {
    const DTYPE: DType = DType::F32;
    type Word = u32;

    fn into_word(self) -> u32 {
        self.to_bits()
    }

    fn from_word(word: u32) -> Self {
        f32::from_bits(word)
    }
}

impl Element for f64 {
    const DTYPE: DType = DType::F64;
    type Word = u64;

    fn into_word(self) -> u64 {
        self.to_bits()
    }

    fn from_word(word: u64) -> Self {
        f64::from_bits(word)
    }
}

/// An integer token that can be nudged up or down (wrapping at the type bounds).
pub trait Token: Element {
    fn step(self, up: bool) -> Self;
}

macro_rules! impl_token {
    ($($t:ty),*) => {$(
        impl Token for $t {
            fn step(self, up: bool) -> Self {
                if up {
                    self.wrapping_add(1)
                } else {
                    self.wrapping_sub(1)
                }
            }
        }
    )*};
}

impl_token!(u8, u16, u32, u64, i8, i16, i32, i64);

/// A raw, host-owned buffer of fixed-width elements.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    data: Bytes,
}

impl Tensor {
    /// Wrap raw (native-endian) element bytes.
    ///
    /// Returns [Error::ShapeMismatch] if `data` does not hold exactly one element
    /// per position in `shape`.
    pub fn new(dtype: DType, shape: Vec<usize>, data: impl Into<Bytes>) -> Result<Self, Error> {
        let data = data.into();
        let expected = shape
            .iter()
            .try_fold(dtype.size(), |acc, dim| acc.checked_mul(*dim))
            .unwrap_or(usize::MAX);
        if data.len() != expected {
            return Err(Error::ShapeMismatch {
                expected,
                found: data.len(),
            });
        }
        Ok(Self { dtype, shape, data })
    }

    /// Encode typed elements into a tensor of the given shape.
    pub fn from_elements<T: Element>(shape: Vec<usize>, values: &[T]) -> Result<Self, Error> {
        Self::new(T::DTYPE, shape, encode(values))
    }

    /// Decode the elements of this tensor, if its dtype matches `T`.
    pub fn to_elements<T: Element>(&self) -> Option<Vec<T>> {
        (self.dtype == T::DTYPE).then(|| decode(&self.data))
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self.dtype.size() {
            0 => 0,
            size => self.data.len() / size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_data(&self, data: Vec<u8>) -> Self {
        Self {
            dtype: self.dtype,
            shape: self.shape.clone(),
            data: Bytes::from(data),
        }
    }
}

/// Returns the rate if it can affect anything.
fn effective(ber: Option<f64>) -> Option<f64> {
    ber.filter(|ber| *ber > 0.0)
}

fn rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Draw a mask where each of the `W::BITS` low bits is set with probability `ber`.
fn mask<W: Word>(rng: &mut impl Rng, ber: f64) -> W {
    let mut mask = 0u64;
    for bit in 0..W::BITS {
        if rng.gen::<f64>() < ber {
            mask |= 1u64 << bit;
        }
    }
    W::truncate(mask)
}

fn encode<T: Element>(values: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * size_of::<T::Word>());
    for value in values {
        value.into_word().extend(&mut out);
    }
    out
}

fn decode<T: Element>(data: &[u8]) -> Vec<T> {
    data.chunks_exact(size_of::<T::Word>())
        .map(|chunk| T::from_word(T::Word::read(chunk)))
        .collect()
}

fn flip_with<T: Element>(values: &[T], ber: f64, rng: &mut impl Rng) -> Vec<T> {
    values
        .iter()
        .map(|value| T::from_word(value.into_word() ^ mask::<T::Word>(rng, ber)))
        .collect()
}

fn flip_raw<W: Element>(data: &[u8], ber: f64, rng: &mut impl Rng) -> Vec<u8> {
    encode(&flip_with(&decode::<W>(data), ber, rng))
}

/// Flip each bit of each element independently with probability `ber`.
///
/// Empty input or a missing/non-positive `ber` returns the input unchanged.
pub fn flip_elements<T: Element>(values: &[T], ber: Option<f64>, seed: Option<u64>) -> Vec<T> {
    let Some(ber) = effective(ber) else {
        return values.to_vec();
    };
    if values.is_empty() {
        return Vec::new();
    }
    flip_with(values, ber, &mut rng(seed))
}

/// Flip each bit of each element of `tensor` independently with probability `ber`.
///
/// The dtype and shape of the output match the input. Empty input or a
/// missing/non-positive `ber` returns the input unchanged.
pub fn flip_bits(tensor: &Tensor, ber: Option<f64>, seed: Option<u64>) -> Tensor {
    let Some(ber) = effective(ber) else {
        return tensor.clone();
    };
    if tensor.is_empty() {
        return tensor.clone();
    }
    let mut rng = rng(seed);
    let data = match tensor.dtype.lane() {
        Lane::U8 | Lane::Bytes => flip_raw::<u8>(&tensor.data, ber, &mut rng),
        Lane::U16 => flip_raw::<u16>(&tensor.data, ber, &mut rng),
        Lane::U32 => flip_raw::<u32>(&tensor.data, ber, &mut rng),
        Lane::U64 => flip_raw::<u64>(&tensor.data, ber, &mut rng),
    };
    tensor.with_data(data)
}

fn perturb_with<T: Token>(tokens: &[T], ber: f64, rng: &mut impl Rng) -> Vec<T> {
    tokens
        .iter()
        .map(|token| {
            if rng.gen::<f64>() < ber {
                token.step(rng.gen())
            } else {
                *token
            }
        })
        .collect()
}

fn perturb_raw<T: Token>(data: &[u8], ber: f64, rng: &mut impl Rng) -> Vec<u8> {
    encode(&perturb_with(&decode::<T>(data), ber, rng))
}

/// Move each token by exactly +1 or -1 (chosen uniformly) with probability `ber`.
///
/// Models token-level decoding noise rather than raw bit corruption.
pub fn perturb<T: Token>(tokens: &[T], ber: Option<f64>, seed: Option<u64>) -> Vec<T> {
    let Some(ber) = effective(ber) else {
        return tokens.to_vec();
    };
    if tokens.is_empty() {
        return Vec::new();
    }
    perturb_with(tokens, ber, &mut rng(seed))
}

/// Apply [perturb] to an integer tensor. Tensors of any other dtype are returned unchanged.
pub fn perturb_tokens(tensor: &Tensor, ber: Option<f64>, seed: Option<u64>) -> Tensor {
    let Some(ber) = effective(ber) else {
        return tensor.clone();
    };
    if tensor.is_empty() || !tensor.dtype.is_integer() {
        return tensor.clone();
    }
    let mut rng = rng(seed);
    let data = match tensor.dtype {
        DType::I8 => perturb_raw::<i8>(&tensor.data, ber, &mut rng),
        DType::I16 => perturb_raw::<i16>(&tensor.data, ber, &mut rng),
        DType::I32 => perturb_raw::<i32>(&tensor.data, ber, &mut rng),
        DType::I64 => perturb_raw::<i64>(&tensor.data, ber, &mut rng),
        DType::U8 => perturb_raw::<u8>(&tensor.data, ber, &mut rng),
        DType::U16 => perturb_raw::<u16>(&tensor.data, ber, &mut rng),
        DType::U32 => perturb_raw::<u32>(&tensor.data, ber, &mut rng),
        DType::U64 => perturb_raw::<u64>(&tensor.data, ber, &mut rng),
        _ => return tensor.clone(),
    };
    tensor.with_data(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 37 + 11) as u8).collect()
    }

    #[test_case(None; "absent")]
    #[test_case(Some(0.0); "zero")]
    #[test_case(Some(-0.5); "negative")]
    #[test_case(Some(f64::NAN); "nan")]
    fn test_identity(ber: Option<f64>) {
        let tensor = Tensor::new(DType::F32, vec![2, 3], pattern(24)).unwrap();
        assert_eq!(flip_bits(&tensor, ber, Some(1)), tensor);
        assert_eq!(perturb_tokens(&tensor, ber, Some(1)), tensor);

        let values = [1i64, -2, 3];
        assert_eq!(flip_elements(&values, ber, None), values);
        assert_eq!(perturb(&values, ber, None), values);
    }

    #[test]
    fn test_empty() {
        let tensor = Tensor::new(DType::U16, vec![0, 4], Vec::<u8>::new()).unwrap();
        assert_eq!(flip_bits(&tensor, Some(1.0), None), tensor);
        assert_eq!(perturb_tokens(&tensor, Some(1.0), None), tensor);
        assert!(flip_elements::<f64>(&[], Some(1.0), None).is_empty());
        assert!(perturb::<u32>(&[], Some(1.0), None).is_empty());
    }

    #[test_case(DType::F16; "f16")]
    #[test_case(DType::BF16; "bf16")]
    #[test_case(DType::F32; "f32")]
    #[test_case(DType::F64; "f64")]
    #[test_case(DType::I8; "i8")]
    #[test_case(DType::I16; "i16")]
    #[test_case(DType::I32; "i32")]
    #[test_case(DType::I64; "i64")]
    #[test_case(DType::U8; "u8")]
    #[test_case(DType::U16; "u16")]
    #[test_case(DType::U32; "u32")]
    #[test_case(DType::U64; "u64")]
    #[test_case(DType::Bool; "bool")]
    #[test_case(DType::Complex64; "complex64")]
    #[test_case(DType::Complex128; "complex128")]
    #[test_case(DType::Opaque(3); "opaque")]
    fn test_flip_all(dtype: DType) {
        let data = pattern(dtype.size() * 6);
        let tensor = Tensor::new(dtype, vec![3, 2], data.clone()).unwrap();

        let flipped = flip_bits(&tensor, Some(1.0), None);
        assert_eq!(flipped.dtype(), dtype);
        assert_eq!(flipped.shape(), &[3, 2]);
        let expected: Vec<u8> = data.iter().map(|byte| !byte).collect();
        assert_eq!(flipped.data().as_ref(), expected.as_slice());
    }

    #[test]
    fn test_flip_all_typed() {
        let floats = [1.5f32, -0.0, f32::INFINITY, 3.25e-12];
        let flipped = flip_elements(&floats, Some(1.0), Some(9));
        for (original, flipped) in floats.iter().zip(flipped) {
            assert_eq!(flipped.to_bits(), !original.to_bits());
        }

        let ints = [0i16, -1, i16::MIN, 1234];
        let flipped = flip_elements(&ints, Some(1.0), None);
        for (original, flipped) in ints.iter().zip(flipped) {
            assert_eq!(flipped, !original);
        }
    }

    #[test]
    fn test_deterministic() {
        let tensor = Tensor::new(DType::F64, vec![64], pattern(512)).unwrap();
        let first = flip_bits(&tensor, Some(0.05), Some(42));
        let second = flip_bits(&tensor, Some(0.05), Some(42));
        assert_eq!(first, second);
        assert_ne!(first, tensor);

        let other = flip_bits(&tensor, Some(0.05), Some(43));
        assert_ne!(first, other);
    }

    #[test]
    fn test_flip_rate() {
        let data = pattern(8192);
        let flipped = flip_elements(&data, Some(0.25), Some(7));
        let flips: u32 = data
            .iter()
            .zip(&flipped)
            .map(|(a, b)| (a ^ b).count_ones())
            .sum();
        let observed = flips as f64 / (data.len() * 8) as f64;
        assert!((0.23..0.27).contains(&observed), "observed {observed}");
    }

    #[test]
    fn test_tensor_matches_typed() {
        let values = [0.5f32, 1.0, -7.75, 1e9, 0.0, 42.0];
        let tensor = Tensor::from_elements(vec![6], &values).unwrap();
        let flipped = flip_bits(&tensor, Some(0.1), Some(5));
        assert_eq!(
            flipped.to_elements::<f32>().unwrap(),
            flip_elements(&values, Some(0.1), Some(5))
        );
        assert!(flipped.to_elements::<f64>().is_none());
    }

    #[test]
    fn test_shape_mismatch() {
        assert!(matches!(
            Tensor::new(DType::I32, vec![2, 2], vec![0u8; 15]),
            Err(Error::ShapeMismatch {
                expected: 16,
                found: 15
            })
        ));
        assert!(Tensor::from_elements(vec![3], &[1u16, 2]).is_err());
    }

    #[test]
    fn test_perturb_all() {
        let tokens: Vec<i32> = (0..256).map(|i| i * 3 - 100).collect();
        let perturbed = perturb(&tokens, Some(1.0), Some(3));
        let mut ups = 0;
        for (original, perturbed) in tokens.iter().zip(&perturbed) {
            let delta = perturbed - original;
            assert!(delta == 1 || delta == -1);
            if delta == 1 {
                ups += 1;
            }
        }

        // Both directions occur
        assert!(ups > 0 && ups < tokens.len());
    }

    #[test]
    fn test_perturb_wraps() {
        let perturbed = perturb(&[u8::MAX, 0], Some(1.0), Some(11));
        assert!(perturbed[0] == u8::MAX - 1 || perturbed[0] == 0);
        assert!(perturbed[1] == 1 || perturbed[1] == u8::MAX);
    }

    #[test]
    fn test_perturb_tokens_tensor() {
        let tokens = [10u32, 20, 30, 40];
        let tensor = Tensor::from_elements(vec![2, 2], &tokens).unwrap();
        let perturbed = perturb_tokens(&tensor, Some(1.0), Some(8));
        assert_eq!(perturbed.shape(), &[2, 2]);
        assert_eq!(
            perturbed.to_elements::<u32>().unwrap(),
            perturb(&tokens, Some(1.0), Some(8))
        );

        let floats = Tensor::from_elements(vec![2], &[1.0f32, 2.0]).unwrap();
        assert_eq!(perturb_tokens(&floats, Some(1.0), Some(8)), floats);
    }

    #[test]
    fn test_lanes() {
        assert_eq!(DType::BF16.lane(), Lane::U16);
        assert_eq!(DType::I64.lane(), Lane::U64);
        assert_eq!(DType::Complex64.lane(), Lane::Bytes);
        assert_eq!(Lane::Bytes.bits(), 8);
        assert_eq!(Lane::U32.bits(), 32);
    }
}
