//! Well-known external calls.
//!
//! ConfuserEx helpers call a small, fixed set of BCL members while computing keys and
//! tokens. Those are modelled here by name; every other call with a resolved
//! [`crate::metadata::MemberRef`] pops its arguments and pushes [`EmValue::Unknown`]
//! when it returns a value.

use std::rc::Rc;

use crate::{
    assembly::Instruction,
    emulation::{
        interpreter::unsupported, ArrayRef, ElementType, EmValue, EmulationContext,
        EmulationError,
    },
    metadata::MemberRef,
    Result,
};

/// Module path reported by `Module.FullyQualifiedName`.
const MODULE_PATH: &str = "C:\\module.dll";
/// Image base reported by `Marshal.GetHINSTANCE`.
const IMAGE_BASE: i64 = 0x40_0000;
/// Name reported by `MemberInfo.Name`.
const MEMBER_NAME: &str = "MockName";

fn type_error(member: &MemberRef, values: &[&EmValue]) -> crate::Error {
    EmulationError::InvalidOperationTypes {
        operation: member.full_name(),
        operand_types: values
            .iter()
            .map(|value| value.type_name())
            .collect::<Vec<_>>()
            .join(", "),
    }
    .into()
}

/// Executes `call` / `callvirt`.
pub(super) fn invoke(context: &mut EmulationContext, instruction: &Instruction) -> Result<()> {
    let Some(member) = instruction.member() else {
        return Err(unsupported(instruction));
    };

    match (member.declaring_type.as_str(), member.name.as_str()) {
        (
            "System.Math",
            "Log" | "Ceiling" | "Abs" | "Cos" | "Tan" | "Sqrt" | "Floor" | "Sin" | "Round",
        ) => math(context, member),
        ("System.Convert", "ToInt32") => convert_to_int32(context, member),
        ("System.String", "op_Equality" | "op_Inequality") => {
            let right = context.pop()?;
            let left = context.pop()?;
            let result = match (&left, &right) {
                (EmValue::Unknown, _) | (_, EmValue::Unknown) => EmValue::Unknown,
                (EmValue::Str(_) | EmValue::Null, EmValue::Str(_) | EmValue::Null) => {
                    let equal = left == right;
                    EmValue::from(if member.name == "op_Equality" {
                        equal
                    } else {
                        !equal
                    })
                }
                _ => return Err(type_error(member, &[&left, &right])),
            };
            context.push(result);
            Ok(())
        }
        (_, "get_Length") => {
            let receiver = context.pop()?;
            let length = match &receiver {
                EmValue::Str(value) => EmValue::I32(utf16_len(value)),
                EmValue::Array(array) => match context.array(*array) {
                    Some(object) => EmValue::I32(i32::try_from(object.len()).unwrap_or(i32::MAX)),
                    None => return Err(type_error(member, &[&receiver])),
                },
                EmValue::Unknown => EmValue::Unknown,
                _ => return Err(type_error(member, &[&receiver])),
            };
            context.push(length);
            Ok(())
        }
        ("System.String", "get_Chars") => {
            let index = context.pop()?;
            let receiver = context.pop()?;
            let value = match (&receiver, index.as_i64()) {
                (EmValue::Str(value), Some(position)) => {
                    let unit = usize::try_from(position)
                        .ok()
                        .and_then(|i| value.encode_utf16().nth(i))
                        .ok_or_else(|| EmulationError::ArrayIndexOutOfBounds {
                            index: position,
                            length: value.encode_utf16().count(),
                        })?;
                    EmValue::I32(i32::from(unit))
                }
                (EmValue::Str(_) | EmValue::Unknown, None) | (EmValue::Unknown, Some(_)) => {
                    EmValue::Unknown
                }
                _ => return Err(type_error(member, &[&receiver, &index])),
            };
            context.push(value);
            Ok(())
        }
        ("System.Type", "GetTypeFromHandle")
        | ("System.Reflection.FieldInfo", "GetFieldFromHandle")
        | (_, "op_Explicit" | "get_Module") => {
            let value = context.pop()?;
            context.push(value);
            Ok(())
        }
        (_, "get_FullyQualifiedName") => replace(context, 1, EmValue::from(MODULE_PATH)),
        (_, "GetHINSTANCE") => replace(context, 1, EmValue::NativeInt(IMAGE_BASE)),
        (_, "ResolveSignature") => replace(context, 2, EmValue::Bytes(Rc::from([0u8; 8]))),
        (_, "ResolveMethod") => replace(context, 2, EmValue::Null),
        (_, "get_MetadataToken") => replace(context, 1, EmValue::I32(0)),
        (_, "get_Name") => replace(context, 1, EmValue::from(MEMBER_NAME)),
        (_, "GetOptionalCustomModifiers") => {
            context.discard(1)?;
            let modifiers = context.allocate_array(ElementType::Ref, 1);
            context.push(EmValue::Array(modifiers));
            Ok(())
        }
        ("System.Array", "Copy") => array_copy(context, member),
        ("System.Buffer", "BlockCopy") => block_copy(context, member),
        _ => {
            let arguments = usize::from(member.param_count) + usize::from(member.has_this);
            context.discard(arguments)?;
            if member.returns_value {
                context.push(EmValue::Unknown);
            }
            Ok(())
        }
    }
}

fn utf16_len(value: &str) -> i32 {
    i32::try_from(value.encode_utf16().count()).unwrap_or(i32::MAX)
}

fn replace(context: &mut EmulationContext, pops: usize, value: EmValue) -> Result<()> {
    context.discard(pops)?;
    context.push(value);
    Ok(())
}

fn math(context: &mut EmulationContext, member: &MemberRef) -> Result<()> {
    let value = context.pop()?;
    if value.is_unknown() {
        context.push(EmValue::Unknown);
        return Ok(());
    }

    if member.name == "Abs" {
        let result = match value {
            EmValue::I32(v) => EmValue::I32(v.wrapping_abs()),
            EmValue::I64(v) => EmValue::I64(v.wrapping_abs()),
            EmValue::F32(v) => EmValue::F32(v.abs()),
            EmValue::F64(v) => EmValue::F64(v.abs()),
            ref other => return Err(type_error(member, &[other])),
        };
        context.push(result);
        return Ok(());
    }

    let Some(x) = value.as_f64() else {
        return Err(type_error(member, &[&value]));
    };
    let result = match member.name.as_str() {
        "Log" => x.ln(),
        "Ceiling" => x.ceil(),
        "Cos" => x.cos(),
        "Tan" => x.tan(),
        "Sqrt" => x.sqrt(),
        "Floor" => x.floor(),
        "Sin" => x.sin(),
        _ => x.round_ties_even(),
    };
    context.push(EmValue::F64(result));
    Ok(())
}

fn convert_to_int32(context: &mut EmulationContext, member: &MemberRef) -> Result<()> {
    let value = context.pop()?;
    #[allow(clippy::cast_possible_truncation)]
    let result = match &value {
        EmValue::Unknown => EmValue::Unknown,
        EmValue::F32(_) | EmValue::F64(_) => {
            let rounded = value.as_f64().unwrap_or_default().round_ties_even();
            if !(f64::from(i32::MIN)..=f64::from(i32::MAX)).contains(&rounded) {
                return Err(EmulationError::ArithmeticOverflow.into());
            }
            EmValue::I32(rounded as i32)
        }
        EmValue::Str(text) => text
            .trim()
            .parse::<i32>()
            .map(EmValue::I32)
            .map_err(|_| EmulationError::ValueConversion {
                from: "Str",
                to: "I32",
            })?,
        other => match other.as_i64().map(i32::try_from) {
            Some(Ok(v)) => EmValue::I32(v),
            Some(Err(_)) if matches!(other, EmValue::U32(_)) => EmValue::I32(other.as_i32().unwrap_or_default()),
            Some(Err(_)) => return Err(EmulationError::ArithmeticOverflow.into()),
            None => return Err(type_error(member, &[other])),
        },
    };
    context.push(result);
    Ok(())
}

fn poison(context: &mut EmulationContext, destination: &EmValue) {
    if let EmValue::Array(array) = destination {
        if let Some(object) = context.array_mut(*array) {
            for item in &mut object.items {
                *item = EmValue::Unknown;
            }
        }
    }
}

fn heap_array(context: &EmulationContext, value: &EmValue) -> Option<ArrayRef> {
    match value {
        EmValue::Array(array) if context.array(*array).is_some() => Some(*array),
        _ => None,
    }
}

/// `Array.Copy(src, dst, length)` and `Array.Copy(src, srcIndex, dst, dstIndex, length)`.
fn array_copy(context: &mut EmulationContext, member: &MemberRef) -> Result<()> {
    let (source, source_index, destination, destination_index, length) = if member.param_count >= 5 {
        let length = context.pop()?;
        let destination_index = context.pop()?;
        let destination = context.pop()?;
        let source_index = context.pop()?;
        let source = context.pop()?;
        (source, source_index, destination, destination_index, length)
    } else {
        let length = context.pop()?;
        let destination = context.pop()?;
        let source = context.pop()?;
        (source, EmValue::I32(0), destination, EmValue::I32(0), length)
    };

    let (Some(src), Some(dst), Some(from), Some(to), Some(count)) = (
        heap_array(context, &source),
        heap_array(context, &destination),
        source_index.as_i64(),
        destination_index.as_i64(),
        length.as_i64(),
    ) else {
        poison(context, &destination);
        return Ok(());
    };

    let mut copied = Vec::new();
    if let Some(object) = context.array(src) {
        for offset in 0..count {
            copied.push(object.get(from + offset)?.clone());
        }
    }
    if let Some(object) = context.array_mut(dst) {
        for (offset, value) in (0..count).zip(copied.iter()) {
            object.set(to + offset, value)?;
        }
    }
    Ok(())
}

/// `Buffer.BlockCopy(src, srcOffset, dst, dstOffset, count)`, in bytes.
fn block_copy(context: &mut EmulationContext, member: &MemberRef) -> Result<()> {
    let count = context.pop()?;
    let destination_offset = context.pop()?;
    let destination = context.pop()?;
    let source_offset = context.pop()?;
    let source = context.pop()?;

    let (Some(src), Some(dst), Some(from), Some(to), Some(count)) = (
        heap_array(context, &source),
        heap_array(context, &destination),
        source_offset.as_i64(),
        destination_offset.as_i64(),
        count.as_i64(),
    ) else {
        if !destination.is_unknown() && heap_array(context, &destination).is_none() {
            return Err(type_error(member, &[&source, &destination]));
        }
        poison(context, &destination);
        return Ok(());
    };

    let mut bytes = Vec::new();
    if let Some(object) = context.array(src) {
        for offset in 0..count {
            bytes.push(object.read(from + offset, ElementType::U1)?);
        }
    }
    if let Some(object) = context.array_mut(dst) {
        for (offset, byte) in (0..count).zip(bytes.iter()) {
            object.write(to + offset, ElementType::U1, byte)?;
        }
    }
    Ok(())
}
