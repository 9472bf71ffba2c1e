//! Array heap of the emulator.
//!
//! Arrays created by `newarr` (or bound by the caller through
//! [`crate::emulation::EmulationContext::bind_local_array`]) live here and are addressed
//! by [`ArrayRef`]. Elements are stored as normalised [`EmValue`]s of the array's
//! [`ElementType`]; typed pointer access (`ldind.*` / `stind.*` through an
//! [`EmValue::ElementPtr`]) goes through a little-endian byte view of the elements, so a
//! `uint[]` can be read through a `byte*` and the other way round.

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]

use std::fmt;

use crate::{
    emulation::{ConversionType, EmValue, EmulationError},
    Result,
};

/// Handle of an array on the emulator heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArrayRef(pub usize);

impl fmt::Display for ArrayRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "array#{}", self.0)
    }
}

/// Storage type of array elements and of typed pointer access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    /// `int8`
    I1,
    /// `uint8` (also `bool`)
    U1,
    /// `int16`
    I2,
    /// `uint16` (also `char`)
    U2,
    /// `int32`
    I4,
    /// `uint32`
    U4,
    /// `int64`
    I8,
    /// `uint64`
    U8,
    /// `float32`
    R4,
    /// `float64`
    R8,
    /// `native int`
    I,
    /// `native uint`
    U,
    /// Object reference
    Ref,
}

impl ElementType {
    /// Maps a fully qualified element type name (`newarr` operand) to its storage type.
    #[must_use]
    pub fn from_type_name(name: &str) -> Self {
        match name {
            "System.SByte" => ElementType::I1,
            "System.Byte" | "System.Boolean" => ElementType::U1,
            "System.Int16" => ElementType::I2,
            "System.UInt16" | "System.Char" => ElementType::U2,
            "System.Int32" => ElementType::I4,
            "System.UInt32" => ElementType::U4,
            "System.Int64" => ElementType::I8,
            "System.UInt64" => ElementType::U8,
            "System.Single" => ElementType::R4,
            "System.Double" => ElementType::R8,
            "System.IntPtr" => ElementType::I,
            "System.UIntPtr" => ElementType::U,
            _ => ElementType::Ref,
        }
    }

    /// Size of one element in bytes.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            ElementType::I1 | ElementType::U1 => 1,
            ElementType::I2 | ElementType::U2 => 2,
            ElementType::I4 | ElementType::U4 | ElementType::R4 => 4,
            ElementType::I8
            | ElementType::U8
            | ElementType::R8
            | ElementType::I
            | ElementType::U
            | ElementType::Ref => 8,
        }
    }

    /// Default value of a freshly allocated element.
    #[must_use]
    pub fn zero(self) -> EmValue {
        match self {
            ElementType::I1 | ElementType::U1 | ElementType::I2 | ElementType::U2 => {
                EmValue::I32(0)
            }
            ElementType::I4 => EmValue::I32(0),
            ElementType::U4 => EmValue::U32(0),
            ElementType::I8 => EmValue::I64(0),
            ElementType::U8 => EmValue::U64(0),
            ElementType::R4 => EmValue::F32(0.0),
            ElementType::R8 => EmValue::F64(0.0),
            ElementType::I => EmValue::NativeInt(0),
            ElementType::U => EmValue::NativeUInt(0),
            ElementType::Ref => EmValue::Null,
        }
    }

    fn conversion(self) -> Option<ConversionType> {
        match self {
            ElementType::I1 => Some(ConversionType::I1),
            ElementType::U1 => Some(ConversionType::U1),
            ElementType::I2 => Some(ConversionType::I2),
            ElementType::U2 => Some(ConversionType::U2),
            ElementType::I4 => Some(ConversionType::I4),
            ElementType::U4 => Some(ConversionType::U4),
            ElementType::I8 => Some(ConversionType::I8),
            ElementType::U8 => Some(ConversionType::U8),
            ElementType::R4 => Some(ConversionType::R4),
            ElementType::R8 => Some(ConversionType::R8),
            ElementType::I => Some(ConversionType::I),
            ElementType::U => Some(ConversionType::U),
            ElementType::Ref => None,
        }
    }

    /// Normalises `value` to this element type (truncation for narrow integers).
    ///
    /// # Errors
    ///
    /// Returns [`EmulationError::InvalidOperationTypes`] if a numeric slot receives a
    /// non-numeric value.
    pub fn coerce(self, value: &EmValue) -> Result<EmValue> {
        match self.conversion() {
            Some(conversion) => value.convert(conversion),
            None => Ok(value.clone()),
        }
    }

    fn to_bytes(self, value: &EmValue) -> Result<Option<Vec<u8>>> {
        let value = self.coerce(value)?;
        let size = self.size();
        let bits = match value {
            EmValue::Unknown => return Ok(None),
            EmValue::F32(v) => u64::from(v.to_bits()),
            EmValue::F64(v) => v.to_bits(),
            ref other => match other.as_i64() {
                Some(v) => v as u64,
                None => {
                    return Err(EmulationError::InvalidOperationTypes {
                        operation: "element bytes".to_string(),
                        operand_types: other.type_name().to_string(),
                    }
                    .into())
                }
            },
        };
        Ok(Some(bits.to_le_bytes()[..size].to_vec()))
    }

    fn from_bytes(self, bytes: &[u8]) -> EmValue {
        let mut raw = [0u8; 8];
        raw[..bytes.len()].copy_from_slice(bytes);
        let bits = u64::from_le_bytes(raw);
        match self {
            ElementType::I1 => EmValue::I32(i32::from(bits as u8 as i8)),
            ElementType::U1 => EmValue::I32(i32::from(bits as u8)),
            ElementType::I2 => EmValue::I32(i32::from(bits as u16 as i16)),
            ElementType::U2 => EmValue::I32(i32::from(bits as u16)),
            ElementType::I4 => EmValue::I32(bits as u32 as i32),
            ElementType::U4 => EmValue::U32(bits as u32),
            ElementType::I8 => EmValue::I64(bits as i64),
            ElementType::U8 => EmValue::U64(bits),
            ElementType::R4 => EmValue::F32(f32::from_bits(bits as u32)),
            ElementType::R8 => EmValue::F64(f64::from_bits(bits)),
            ElementType::I => EmValue::NativeInt(bits as i64),
            ElementType::U => EmValue::NativeUInt(bits),
            ElementType::Ref => EmValue::Unknown,
        }
    }
}

/// One array on the heap.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayObject {
    /// Element storage type
    pub element_type: ElementType,
    /// Normalised elements
    pub items: Vec<EmValue>,
}

impl ArrayObject {
    /// Creates a zero-initialised array.
    #[must_use]
    pub fn new(element_type: ElementType, length: usize) -> Self {
        ArrayObject {
            element_type,
            items: vec![element_type.zero(); length],
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if the array has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn slot(&self, index: i64) -> Result<usize> {
        usize::try_from(index)
            .ok()
            .filter(|&i| i < self.items.len())
            .ok_or_else(|| {
                EmulationError::ArrayIndexOutOfBounds {
                    index,
                    length: self.items.len(),
                }
                .into()
            })
    }

    /// Reads element `index`.
    ///
    /// # Errors
    ///
    /// Returns [`EmulationError::ArrayIndexOutOfBounds`] for an invalid index.
    pub fn get(&self, index: i64) -> Result<&EmValue> {
        let slot = self.slot(index)?;
        Ok(&self.items[slot])
    }

    /// Stores `value` into element `index`, normalised to the element type.
    ///
    /// # Errors
    ///
    /// Returns [`EmulationError::ArrayIndexOutOfBounds`] for an invalid index, or a
    /// type error if the value does not fit the element type.
    pub fn set(&mut self, index: i64, value: &EmValue) -> Result<()> {
        let slot = self.slot(index)?;
        self.items[slot] = self.element_type.coerce(value)?;
        Ok(())
    }

    fn byte_range(&self, byte_offset: i64, width: usize) -> Result<usize> {
        let total = self.items.len() * self.element_type.size();
        usize::try_from(byte_offset)
            .ok()
            .filter(|&start| start + width <= total)
            .ok_or_else(|| {
                EmulationError::ArrayIndexOutOfBounds {
                    index: byte_offset,
                    length: total,
                }
                .into()
            })
    }

    /// Reads a value of type `access` at `byte_offset` through the byte view.
    ///
    /// Returns [`EmValue::Unknown`] if any touched element is unknown.
    ///
    /// # Errors
    ///
    /// Returns [`EmulationError::ArrayIndexOutOfBounds`] if the access leaves the array.
    pub fn read(&self, byte_offset: i64, access: ElementType) -> Result<EmValue> {
        let element_size = self.element_type.size();
        let width = access.size();
        let start = self.byte_range(byte_offset, width)?;

        if width == element_size && start % element_size == 0 {
            return access.coerce(&self.items[start / element_size]);
        }
        if self.element_type == ElementType::Ref || access == ElementType::Ref {
            return Err(EmulationError::InvalidOperationTypes {
                operation: "ldind".to_string(),
                operand_types: "misaligned reference access".to_string(),
            }
            .into());
        }

        let mut bytes = Vec::with_capacity(width);
        let first = start / element_size;
        let last = (start + width - 1) / element_size;
        for item in &self.items[first..=last] {
            match self.element_type.to_bytes(item)? {
                Some(chunk) => bytes.extend_from_slice(&chunk),
                None => return Ok(EmValue::Unknown),
            }
        }
        let skip = start - first * element_size;
        Ok(access.from_bytes(&bytes[skip..skip + width]))
    }

    /// Writes `value` as type `access` at `byte_offset` through the byte view.
    ///
    /// # Errors
    ///
    /// Returns [`EmulationError::ArrayIndexOutOfBounds`] if the access leaves the array.
    pub fn write(&mut self, byte_offset: i64, access: ElementType, value: &EmValue) -> Result<()> {
        let element_size = self.element_type.size();
        let width = access.size();
        let start = self.byte_range(byte_offset, width)?;

        if width == element_size && start % element_size == 0 {
            let slot = start / element_size;
            self.items[slot] = self.element_type.coerce(&access.coerce(value)?)?;
            return Ok(());
        }
        if self.element_type == ElementType::Ref || access == ElementType::Ref {
            return Err(EmulationError::InvalidOperationTypes {
                operation: "stind".to_string(),
                operand_types: "misaligned reference access".to_string(),
            }
            .into());
        }

        let first = start / element_size;
        let last = (start + width - 1) / element_size;
        let Some(patch) = access.to_bytes(value)? else {
            for item in &mut self.items[first..=last] {
                *item = EmValue::Unknown;
            }
            return Ok(());
        };

        let mut bytes = Vec::with_capacity((last - first + 1) * element_size);
        for item in &self.items[first..=last] {
            match self.element_type.to_bytes(item)? {
                Some(chunk) => bytes.extend_from_slice(&chunk),
                None => bytes.extend(std::iter::repeat(0).take(element_size)),
            }
        }
        let skip = start - first * element_size;
        bytes[skip..skip + width].copy_from_slice(&patch);

        for (i, chunk) in bytes.chunks(element_size).enumerate() {
            self.items[first + i] = self.element_type.from_bytes(chunk);
        }
        Ok(())
    }
}

/// Owner of all arrays created during one emulation run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Heap {
    arrays: Vec<ArrayObject>,
}

impl Heap {
    /// Allocates a zero-initialised array and returns its handle.
    pub fn allocate(&mut self, element_type: ElementType, length: usize) -> ArrayRef {
        self.insert(ArrayObject::new(element_type, length))
    }

    /// Moves an existing array onto the heap.
    pub fn insert(&mut self, array: ArrayObject) -> ArrayRef {
        self.arrays.push(array);
        ArrayRef(self.arrays.len() - 1)
    }

    /// Returns the array behind `handle`.
    #[must_use]
    pub fn get(&self, handle: ArrayRef) -> Option<&ArrayObject> {
        self.arrays.get(handle.0)
    }

    /// Returns the array behind `handle` for modification.
    pub fn get_mut(&mut self, handle: ArrayRef) -> Option<&mut ArrayObject> {
        self.arrays.get_mut(handle.0)
    }

    /// Number of allocated arrays.
    #[must_use]
    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    /// Returns true if nothing was allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_type_from_name() {
        assert_eq!(ElementType::from_type_name("System.UInt32"), ElementType::U4);
        assert_eq!(ElementType::from_type_name("System.Byte"), ElementType::U1);
        assert_eq!(ElementType::from_type_name("System.String"), ElementType::Ref);
        assert_eq!(ElementType::U4.size(), 4);
    }

    #[test]
    fn test_array_store_normalises() {
        let mut array = ArrayObject::new(ElementType::U1, 2);
        array.set(0, &EmValue::I32(0x1FF)).unwrap();
        assert_eq!(array.get(0).unwrap(), &EmValue::I32(0xFF));

        let mut words = ArrayObject::new(ElementType::U4, 1);
        words.set(0, &EmValue::I32(-1)).unwrap();
        assert_eq!(words.get(0).unwrap(), &EmValue::U32(u32::MAX));
    }

    #[test]
    fn test_array_bounds() {
        let array = ArrayObject::new(ElementType::I4, 4);
        assert!(array.get(3).is_ok());
        assert!(array.get(4).is_err());
        assert!(array.get(-1).is_err());
    }

    #[test]
    fn test_byte_view_read_across_elements() {
        let mut array = ArrayObject::new(ElementType::U1, 8);
        for (i, byte) in [0x78, 0x56, 0x34, 0x12, 0xEF, 0xCD, 0xAB, 0x89].iter().enumerate() {
            array.set(i as i64, &EmValue::I32(*byte)).unwrap();
        }
        assert_eq!(
            array.read(0, ElementType::U4).unwrap(),
            EmValue::U32(0x1234_5678)
        );
        assert_eq!(
            array.read(4, ElementType::U4).unwrap(),
            EmValue::U32(0x89AB_CDEF)
        );
        assert!(array.read(6, ElementType::U4).is_err());
    }

    #[test]
    fn test_byte_view_write_into_words() {
        let mut array = ArrayObject::new(ElementType::U4, 2);
        array.write(2, ElementType::U4, &EmValue::U32(0xAABB_CCDD)).unwrap();
        assert_eq!(array.get(0).unwrap(), &EmValue::U32(0xCCDD_0000));
        assert_eq!(array.get(1).unwrap(), &EmValue::U32(0x0000_AABB));
    }

    #[test]
    fn test_unknown_element_poisons_read() {
        let mut array = ArrayObject::new(ElementType::U1, 4);
        array.items[1] = EmValue::Unknown;
        assert_eq!(array.read(0, ElementType::U4).unwrap(), EmValue::Unknown);
    }

    #[test]
    fn test_heap_allocation() {
        let mut heap = Heap::default();
        let a = heap.allocate(ElementType::I4, 3);
        let b = heap.allocate(ElementType::U1, 1);
        assert_ne!(a, b);
        assert_eq!(heap.get(a).map(ArrayObject::len), Some(3));
        assert!(heap.get(ArrayRef(7)).is_none());
    }
}
