use ndarray::{Array, ArrayD, Axis, Dimension, Slice};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{NwbError, Result};

/// Integer identifier of a recording channel and of its electrode table row.
pub type ChannelId = i64;

/// A single value stored in a dynamic table cell or a channel property.
///
/// Serialized untagged so metadata files can use plain JSON scalars.
/// Missing floating point values are represented by NaN and round-trip
/// through `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    /// Boolean flag (e.g. accepted / rejected ROI)
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Floating point value, NaN when missing
    Float(#[serde(with = "nan_as_null")] f64),
    /// Free text
    Text(String),
}

impl CellValue {
    /// Returns the value used for rows that do not supply this column.
    ///
    /// Text columns are padded with empty strings, everything else with NaN.
    pub fn fill_for(&self) -> CellValue {
        match self {
            CellValue::Text(_) => CellValue::Text(String::new()),
            _ => CellValue::Float(f64::NAN),
        }
    }

    /// True for NaN floats and empty strings.
    pub fn is_missing(&self) -> bool {
        match self {
            CellValue::Float(v) => v.is_nan(),
            CellValue::Text(s) => s.is_empty(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Int(v) => Some(*v as f64),
            CellValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CellValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CellValue::Bool(b) => write!(f, "{}", b),
            CellValue::Int(v) => write!(f, "{}", v),
            CellValue::Float(v) => write!(f, "{}", v),
            CellValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        CellValue::Text(value)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        CellValue::Int(value)
    }
}

impl From<i32> for CellValue {
    fn from(value: i32) -> Self {
        CellValue::Int(value as i64)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Float(value)
    }
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        CellValue::Bool(value)
    }
}

/// Serializes NaN as `null` and reads `null` back as NaN.
pub(crate) mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_none()
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

/// Element type of a stored array, named the way the NWB tooling names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    Float32,
    Float64,
}

impl DType {
    /// Size of one element in bytes
    pub fn itemsize(self) -> usize {
        match self {
            DType::Int8 | DType::UInt8 => 1,
            DType::Int16 | DType::UInt16 => 2,
            DType::Int32 | DType::UInt32 | DType::Float32 => 4,
            DType::Int64 | DType::Float64 => 8,
        }
    }

    /// The signed type of the same width; signed and float types map to themselves.
    pub fn signed(self) -> DType {
        match self {
            DType::UInt8 => DType::Int8,
            DType::UInt16 => DType::Int16,
            DType::UInt32 => DType::Int32,
            other => other,
        }
    }

    pub fn is_unsigned(self) -> bool {
        matches!(self, DType::UInt8 | DType::UInt16 | DType::UInt32)
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::Float32 | DType::Float64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            DType::Int8 => "int8",
            DType::UInt8 => "uint8",
            DType::Int16 => "int16",
            DType::UInt16 => "uint16",
            DType::Int32 => "int32",
            DType::UInt32 => "uint32",
            DType::Int64 => "int64",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        };
        write!(f, "{}", name)
    }
}

/// An n-dimensional array of one of the supported element types.
///
/// Traces are stored as (frames, channels), movies as
/// (frames, height, width, colour) and image masks as (rois, height, width).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dtype", content = "values", rename_all = "lowercase")]
pub enum DataArray {
    Int8(ArrayD<i8>),
    UInt8(ArrayD<u8>),
    Int16(ArrayD<i16>),
    UInt16(ArrayD<u16>),
    Int32(ArrayD<i32>),
    UInt32(ArrayD<u32>),
    Int64(ArrayD<i64>),
    Float32(#[serde(with = "nan_array")] ArrayD<f32>),
    Float64(#[serde(with = "nan_array")] ArrayD<f64>),
}

/// Float arrays stored as `{dim, data}` with NaN elements written as `null`.
mod nan_array {
    use ndarray::{ArrayD, IxDyn};
    use serde::de::{DeserializeOwned, Error};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub trait Element: Copy + Serialize + DeserializeOwned {
        const NAN: Self;
        fn is_nan(self) -> bool;
    }

    impl Element for f32 {
        const NAN: Self = f32::NAN;
        fn is_nan(self) -> bool {
            f32::is_nan(self)
        }
    }

    impl Element for f64 {
        const NAN: Self = f64::NAN;
        fn is_nan(self) -> bool {
            f64::is_nan(self)
        }
    }

    #[derive(Serialize)]
    struct ArrayRef<'a, T> {
        dim: &'a [usize],
        data: Vec<Option<T>>,
    }

    #[derive(Deserialize)]
    #[serde(bound = "T: DeserializeOwned")]
    struct ArrayOwned<T> {
        dim: Vec<usize>,
        data: Vec<Option<T>>,
    }

    pub fn serialize<T: Element, S: Serializer>(array: &ArrayD<T>, serializer: S) -> Result<S::Ok, S::Error> {
        ArrayRef {
            dim: array.shape(),
            data: array.iter().map(|&v| (!v.is_nan()).then_some(v)).collect(),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, T: Element, D: Deserializer<'de>>(deserializer: D) -> Result<ArrayD<T>, D::Error> {
        let stored = ArrayOwned::<T>::deserialize(deserializer)?;
        let values = stored.data.into_iter().map(|v| v.unwrap_or(T::NAN)).collect();
        ArrayD::from_shape_vec(IxDyn(&stored.dim), values).map_err(D::Error::custom)
    }
}

/// Applies `$body` to the inner array of every variant, binding it to `$arr`.
macro_rules! each_variant {
    ($value:expr, $arr:ident => $body:expr) => {
        match $value {
            DataArray::Int8($arr) => $body,
            DataArray::UInt8($arr) => $body,
            DataArray::Int16($arr) => $body,
            DataArray::UInt16($arr) => $body,
            DataArray::Int32($arr) => $body,
            DataArray::UInt32($arr) => $body,
            DataArray::Int64($arr) => $body,
            DataArray::Float32($arr) => $body,
            DataArray::Float64($arr) => $body,
        }
    };
}

/// Same as `each_variant`, but rewraps the result in the original variant.
macro_rules! map_variant {
    ($value:expr, $arr:ident => $body:expr) => {
        match $value {
            DataArray::Int8($arr) => DataArray::Int8($body),
            DataArray::UInt8($arr) => DataArray::UInt8($body),
            DataArray::Int16($arr) => DataArray::Int16($body),
            DataArray::UInt16($arr) => DataArray::UInt16($body),
            DataArray::Int32($arr) => DataArray::Int32($body),
            DataArray::UInt32($arr) => DataArray::UInt32($body),
            DataArray::Int64($arr) => DataArray::Int64($body),
            DataArray::Float32($arr) => DataArray::Float32($body),
            DataArray::Float64($arr) => DataArray::Float64($body),
        }
    };
}

macro_rules! impl_from_array {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl<D: Dimension> From<Array<$t, D>> for DataArray {
                fn from(array: Array<$t, D>) -> Self {
                    DataArray::$variant(array.into_dyn())
                }
            }
        )*
    };
}

impl_from_array!(
    i8 => Int8,
    u8 => UInt8,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    f32 => Float32,
    f64 => Float64,
);

impl DataArray {
    /// Allocates a zero-filled array of the given type and shape.
    pub fn zeros(dtype: DType, shape: &[usize]) -> DataArray {
        match dtype {
            DType::Int8 => DataArray::Int8(ArrayD::zeros(shape)),
            DType::UInt8 => DataArray::UInt8(ArrayD::zeros(shape)),
            DType::Int16 => DataArray::Int16(ArrayD::zeros(shape)),
            DType::UInt16 => DataArray::UInt16(ArrayD::zeros(shape)),
            DType::Int32 => DataArray::Int32(ArrayD::zeros(shape)),
            DType::UInt32 => DataArray::UInt32(ArrayD::zeros(shape)),
            DType::Int64 => DataArray::Int64(ArrayD::zeros(shape)),
            DType::Float32 => DataArray::Float32(ArrayD::zeros(shape)),
            DType::Float64 => DataArray::Float64(ArrayD::zeros(shape)),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            DataArray::Int8(_) => DType::Int8,
            DataArray::UInt8(_) => DType::UInt8,
            DataArray::Int16(_) => DType::Int16,
            DataArray::UInt16(_) => DType::UInt16,
            DataArray::Int32(_) => DType::Int32,
            DataArray::UInt32(_) => DType::UInt32,
            DataArray::Int64(_) => DType::Int64,
            DataArray::Float32(_) => DType::Float32,
            DataArray::Float64(_) => DType::Float64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        each_variant!(self, a => a.shape())
    }

    pub fn len(&self) -> usize {
        each_variant!(self, a => a.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `block` into `self` starting at `offset` (one entry per axis).
    pub fn assign_at(&mut self, offset: &[usize], block: &DataArray) -> Result<()> {
        match (self, block) {
            (DataArray::Int8(dst), DataArray::Int8(src)) => assign_block(dst, offset, src),
            (DataArray::UInt8(dst), DataArray::UInt8(src)) => assign_block(dst, offset, src),
            (DataArray::Int16(dst), DataArray::Int16(src)) => assign_block(dst, offset, src),
            (DataArray::UInt16(dst), DataArray::UInt16(src)) => assign_block(dst, offset, src),
            (DataArray::Int32(dst), DataArray::Int32(src)) => assign_block(dst, offset, src),
            (DataArray::UInt32(dst), DataArray::UInt32(src)) => assign_block(dst, offset, src),
            (DataArray::Int64(dst), DataArray::Int64(src)) => assign_block(dst, offset, src),
            (DataArray::Float32(dst), DataArray::Float32(src)) => assign_block(dst, offset, src),
            (DataArray::Float64(dst), DataArray::Float64(src)) => assign_block(dst, offset, src),
            (dst, src) => Err(NwbError::DtypeMismatch {
                expected: dst.dtype(),
                actual: src.dtype(),
            }),
        }
    }

    /// Shifts every value by `shift` and converts unsigned integers to the
    /// signed type of the same width.
    ///
    /// Values that do not fit the target type are an error rather than
    /// wrapping silently.
    pub fn rebase_signed(&self, shift: i64) -> Result<DataArray> {
        Ok(match self {
            DataArray::Int8(a) => DataArray::Int8(rebase(a, shift, DType::Int8)?),
            DataArray::UInt8(a) => DataArray::Int8(rebase(a, shift, DType::Int8)?),
            DataArray::Int16(a) => DataArray::Int16(rebase(a, shift, DType::Int16)?),
            DataArray::UInt16(a) => DataArray::Int16(rebase(a, shift, DType::Int16)?),
            DataArray::Int32(a) => DataArray::Int32(rebase(a, shift, DType::Int32)?),
            DataArray::UInt32(a) => DataArray::Int32(rebase(a, shift, DType::Int32)?),
            DataArray::Int64(a) => DataArray::Int64(rebase(a, shift, DType::Int64)?),
            DataArray::Float32(a) => DataArray::Float32(a.mapv(|v| v + shift as f32)),
            DataArray::Float64(a) => DataArray::Float64(a.mapv(|v| v + shift as f64)),
        })
    }

    /// Converts every element to `f64`.
    pub fn to_f64(&self) -> ArrayD<f64> {
        each_variant!(self, a => a.mapv(|v| v as f64))
    }

    /// Selects a frame window and a subset of columns from a 2-D (frames, channels) array.
    pub fn select_window(&self, start: usize, end: usize, columns: &[usize]) -> Result<DataArray> {
        if self.shape().len() != 2 {
            return Err(NwbError::InvalidArgument(format!(
                "expected a 2-D array, got {} dimensions",
                self.shape().len()
            )));
        }
        let (frames, width) = (self.shape()[0], self.shape()[1]);
        if start > end || end > frames {
            return Err(NwbError::InvalidArgument(format!(
                "frame window {}..{} is outside 0..{}",
                start, end, frames
            )));
        }
        if let Some(&bad) = columns.iter().find(|&&c| c >= width) {
            return Err(NwbError::InvalidArgument(format!(
                "column {} is outside 0..{}",
                bad, width
            )));
        }
        Ok(map_variant!(self, a => a
            .slice_axis(Axis(0), Slice::from(start..end))
            .select(Axis(1), columns)))
    }
}

fn assign_block<T: Clone>(dst: &mut ArrayD<T>, offset: &[usize], src: &ArrayD<T>) -> Result<()> {
    if dst.ndim() != src.ndim() || offset.len() != dst.ndim() {
        return Err(NwbError::InvalidArgument(format!(
            "chunk with {} dimensions (offset rank {}) does not match dataset rank {}",
            src.ndim(),
            offset.len(),
            dst.ndim()
        )));
    }
    for (axis, ((&start, &len), &cap)) in offset
        .iter()
        .zip(src.shape())
        .zip(dst.shape())
        .enumerate()
    {
        if start + len > cap {
            return Err(NwbError::InvalidArgument(format!(
                "chunk spans {}..{} on axis {} but the dataset only has {}",
                start,
                start + len,
                axis,
                cap
            )));
        }
    }
    let src_shape = src.shape().to_vec();
    let mut view = dst.slice_each_axis_mut(|desc| {
        let axis = desc.axis.index();
        Slice::from(offset[axis]..offset[axis] + src_shape[axis])
    });
    view.assign(src);
    Ok(())
}

fn rebase<S, T>(array: &ArrayD<S>, shift: i64, dtype: DType) -> Result<ArrayD<T>>
where
    S: Copy + Into<i64>,
    T: TryFrom<i64>,
{
    let mut values = Vec::with_capacity(array.len());
    for &v in array.iter() {
        let raw: i64 = v.into();
        let shifted = raw
            .checked_add(shift)
            .ok_or(NwbError::Overflow { value: raw, dtype })?;
        let converted =
            T::try_from(shifted).map_err(|_| NwbError::Overflow { value: shifted, dtype })?;
        values.push(converted);
    }
    Ok(ArrayD::from_shape_vec(array.raw_dim(), values)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    #[test]
    fn fill_value_follows_column_kind() {
        assert_eq!(CellValue::from("tetrode").fill_for(), CellValue::Text(String::new()));
        assert!(CellValue::from(3i64).fill_for().is_missing());
        assert!(CellValue::from(true).fill_for().is_missing());
    }

    #[test]
    fn nan_round_trips_through_null() {
        let json = serde_json::to_string(&vec![CellValue::Float(f64::NAN)]).unwrap();
        assert_eq!(json, "[null]");
        let back: Vec<CellValue> = serde_json::from_str(&json).unwrap();
        assert!(back[0].is_missing());
    }

    #[test]
    fn untagged_values_keep_their_kind() {
        let values: Vec<CellValue> = serde_json::from_str(r#"[1, 1.5, "a", false]"#).unwrap();
        assert_eq!(
            values,
            vec![
                CellValue::Int(1),
                CellValue::Float(1.5),
                CellValue::Text("a".into()),
                CellValue::Bool(false)
            ]
        );
    }

    #[test]
    fn rebase_moves_unsigned_into_signed_range() {
        let data = DataArray::from(array![[0u16, 32768], [65535, 40000]]);
        let signed = data.rebase_signed(-32768).unwrap();
        assert_eq!(signed.dtype(), DType::Int16);
        assert_eq!(
            signed,
            DataArray::from(array![[-32768i16, 0], [32767, 7232]])
        );
    }

    #[test]
    fn rebase_rejects_overflow() {
        let data = DataArray::from(array![[40000u16]]);
        assert!(matches!(
            data.rebase_signed(0),
            Err(NwbError::Overflow { value: 40000, .. })
        ));
    }

    #[test]
    fn assign_places_block_at_offset() {
        let mut target = DataArray::zeros(DType::Int16, &[4, 2]);
        let block = DataArray::from(array![[1i16], [2], [3], [4]]);
        target.assign_at(&[0, 1], &block).unwrap();
        assert_eq!(
            target,
            DataArray::from(array![[0i16, 1], [0, 2], [0, 3], [0, 4]])
        );
    }

    #[test]
    fn assign_checks_bounds_and_dtype() {
        let mut target = DataArray::zeros(DType::Int16, &[2, 2]);
        let too_long = DataArray::from(Array2::<i16>::zeros((3, 1)));
        assert!(target.assign_at(&[0, 0], &too_long).is_err());
        let wrong_type = DataArray::from(Array2::<f32>::zeros((1, 1)));
        assert!(matches!(
            target.assign_at(&[0, 0], &wrong_type),
            Err(NwbError::DtypeMismatch { .. })
        ));
    }

    #[test]
    fn select_window_picks_rows_and_columns() {
        let data = DataArray::from(array![[1i32, 2, 3], [4, 5, 6], [7, 8, 9]]);
        let window = data.select_window(1, 3, &[2, 0]).unwrap();
        assert_eq!(window, DataArray::from(array![[6i32, 4], [9, 7]]));
    }

    #[test]
    fn float_arrays_keep_nan_through_json() {
        let data = DataArray::from(array![[0.1f32, f32::NAN], [0.2, 0.3]]);
        let json = serde_json::to_string(&data).unwrap();
        assert!(json.contains("null"));
        let back: DataArray = serde_json::from_str(&json).unwrap();
        let DataArray::Float32(values) = back else {
            panic!("dtype changed: {:?}", back);
        };
        let values = values.into_dimensionality::<ndarray::Ix2>().unwrap();
        assert!(values[[0, 1]].is_nan());
        assert_eq!(values[[1, 0]], 0.2);

        let doubles = DataArray::from(array![f64::NAN, 1.5]);
        let back: DataArray = serde_json::from_str(&serde_json::to_string(&doubles).unwrap()).unwrap();
        assert_eq!(back.dtype(), DType::Float64);
        let values: Vec<f64> = back.to_f64().iter().copied().collect();
        assert!(values[0].is_nan());
        assert_eq!(values[1], 1.5);
    }

    #[test]
    fn dtype_names_match_numpy() {
        assert_eq!(DType::UInt16.to_string(), "uint16");
        assert_eq!(DType::UInt16.signed(), DType::Int16);
        assert_eq!(DType::Float32.itemsize(), 4);
    }
}
