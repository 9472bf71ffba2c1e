//! Array and pointer instruction handlers.

use crate::{
    assembly::Instruction,
    emulation::{
        interpreter::{invalid_operand, Flow},
        ElementType, EmValue, EmulationContext, EmulationError,
    },
    Result,
};

/// Largest array `newarr` will allocate.
const MAX_ARRAY_LENGTH: i64 = 1 << 24;

fn type_error(operation: &str, value: &EmValue) -> crate::Error {
    EmulationError::InvalidOperationTypes {
        operation: operation.to_string(),
        operand_types: value.type_name().to_string(),
    }
    .into()
}

fn pointer(value: &EmValue) -> Option<(crate::emulation::ArrayRef, i64)> {
    match *value {
        EmValue::Array(array) => Some((array, 0)),
        EmValue::ElementPtr { array, byte_offset } => Some((array, byte_offset)),
        _ => None,
    }
}

/// `ldind.*`: reads through an array pointer, placeholder `0` for other addresses.
pub(super) fn load_indirect(context: &mut EmulationContext, access: ElementType) -> Result<Flow> {
    let address = context.pop()?;
    let value = match (pointer(&address), &address) {
        (_, EmValue::Unknown) => EmValue::Unknown,
        (Some((array, offset)), _) => match context.array(array) {
            Some(object) => object.read(offset, access)?,
            None => return Err(type_error("ldind", &address)),
        },
        _ => EmValue::I32(0),
    };
    context.push(value);
    Ok(Flow::Next)
}

/// `stind.*`: writes through an array pointer, discards writes to other addresses.
pub(super) fn store_indirect(context: &mut EmulationContext, access: ElementType) -> Result<Flow> {
    let value = context.pop()?;
    let address = context.pop()?;
    if let Some((array, offset)) = pointer(&address) {
        let Some(object) = context.array_mut(array) else {
            return Err(type_error("stind", &address));
        };
        object.write(offset, access, &value)?;
    }
    Ok(Flow::Next)
}

/// `ldelem.*`
pub(super) fn load_element(context: &mut EmulationContext, access: ElementType) -> Result<Flow> {
    let index = context.pop()?;
    let receiver = context.pop()?;

    let value = match receiver {
        EmValue::Array(array) => {
            let Some(object) = context.array(array) else {
                return Err(type_error("ldelem", &receiver));
            };
            match index.as_i64() {
                Some(index) => access.coerce(object.get(index)?)?,
                None if index.is_unknown() => EmValue::Unknown,
                None => return Err(type_error("ldelem index", &index)),
            }
        }
        EmValue::Unknown => EmValue::Unknown,
        _ => EmValue::I32(0),
    };
    context.push(value);
    Ok(Flow::Next)
}

/// `stelem.*`
///
/// A store at an unknown index makes every element of the array unknown.
pub(super) fn store_element(context: &mut EmulationContext, access: ElementType) -> Result<Flow> {
    let value = context.pop()?;
    let index = context.pop()?;
    let receiver = context.pop()?;

    if let EmValue::Array(array) = receiver {
        let Some(object) = context.array_mut(array) else {
            return Err(type_error("stelem", &receiver));
        };
        match index.as_i64() {
            Some(index) => object.set(index, &access.coerce(&value)?)?,
            None if index.is_unknown() => {
                for item in &mut object.items {
                    *item = EmValue::Unknown;
                }
            }
            None => return Err(type_error("stelem index", &index)),
        }
    }
    Ok(Flow::Next)
}

/// `newarr`
pub(super) fn new_array(context: &mut EmulationContext, instruction: &Instruction) -> Result<()> {
    let element_type = instruction
        .member()
        .map(|member| ElementType::from_type_name(&member.full_name()))
        .ok_or_else(|| invalid_operand(instruction, "element type"))?;

    let length = context.pop()?;
    if length.is_unknown() {
        context.push(EmValue::Unknown);
        return Ok(());
    }
    let length = length
        .as_i64()
        .filter(|len| (0..=MAX_ARRAY_LENGTH).contains(len))
        .ok_or(EmulationError::ValueConversion {
            from: length.type_name(),
            to: "array length",
        })?;

    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    let handle = context.allocate_array(element_type, length as usize);
    context.push(EmValue::Array(handle));
    Ok(())
}

/// `ldlen`
pub(super) fn array_length(context: &mut EmulationContext) -> Result<()> {
    let receiver = context.pop()?;
    let length = match receiver {
        EmValue::Array(array) => match context.array(array) {
            Some(object) => EmValue::NativeUInt(object.len() as u64),
            None => return Err(type_error("ldlen", &receiver)),
        },
        EmValue::Unknown => EmValue::Unknown,
        other => return Err(type_error("ldlen", &other)),
    };
    context.push(length);
    Ok(())
}

/// `ldelema`
pub(super) fn element_address(
    context: &mut EmulationContext,
    instruction: &Instruction,
) -> Result<()> {
    let index = context.pop()?;
    let receiver = context.pop()?;

    let address = match (&receiver, index.as_i64()) {
        (EmValue::Array(array), Some(index)) => {
            let Some(object) = context.array(*array) else {
                return Err(type_error("ldelema", &receiver));
            };
            object.get(index)?;
            #[allow(clippy::cast_possible_wrap)]
            let size = object.element_type.size() as i64;
            EmValue::ElementPtr {
                array: *array,
                byte_offset: index * size,
            }
        }
        (EmValue::Array(_) | EmValue::Unknown, None) | (EmValue::Unknown, Some(_)) => {
            EmValue::Unknown
        }
        _ => return Err(invalid_operand(instruction, "array receiver")),
    };
    context.push(address);
    Ok(())
}
