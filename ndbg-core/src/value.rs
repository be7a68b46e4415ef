//! 変数の値の読み取り
//!
//! 値は読み取った停止の世代を持ちます。配列の要素は後から読むので、
//! 世代が変わっていたら [`DebuggerError::StaleFrame`] になります。

use crate::callstack::StackFrame;
use crate::{DebuggerConfig, DebuggerError};
use ndbg_symbols::{FrameBase, ValueType, VariableInfo, VariableLocation};
use ndbg_target::DebugChannel;
use std::fmt;

/// プリミティブ値
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Primitive {
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    Char(char),
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Primitive::Int(v) => write!(f, "{}", v),
            Primitive::UInt(v) => write!(f, "{}", v),
            Primitive::Float(v) => write!(f, "{}", v),
            Primitive::Bool(v) => write!(f, "{}", v),
            Primitive::Char(v) => write!(f, "{:?}", v),
        }
    }
}

/// 配列（ポインタ + 長さ）
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayValue {
    element: ValueType,
    address: u64,
    len: usize,
    generation: u64,
}

impl ArrayValue {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn element_type(&self) -> &ValueType {
        &self.element
    }

    pub fn address(&self) -> u64 {
        self.address
    }
}

/// 参照先を持つオブジェクト
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectValue {
    pub type_name: String,
    pub address: u64,
}

/// 変数の値
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Primitive(Primitive),
    /// null ポインタ（型名付き）
    Null { type_name: String },
    String(String),
    Array(ArrayValue),
    Object(ObjectValue),
    /// 読み取れない値（最適化で消えた、未対応の場所など）
    Unavailable(String),
}

impl Value {
    /// 値の文字列表現
    pub fn as_string(&self) -> String {
        match self {
            Value::Primitive(p) => p.to_string(),
            Value::Null { .. } => "null".to_string(),
            Value::String(s) => s.clone(),
            Value::Array(a) => format!("{}[{}]", a.element, a.len),
            Value::Object(o) => format!("{} @ 0x{:x}", o.type_name, o.address),
            Value::Unavailable(reason) => format!("<{}>", reason),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null { .. })
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_primitive(&self) -> Option<Primitive> {
        match self {
            Value::Primitive(p) => Some(*p),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{:?}", s),
            other => write!(f, "{}", other.as_string()),
        }
    }
}

/// 名前付きの値（引数またはローカル変数）
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub type_name: String,
    pub value: Value,
}

/// 値の読み取り
pub(crate) struct ValueReader<'a> {
    pub channel: &'a dyn DebugChannel,
    pub config: &'a DebuggerConfig,
    pub generation: u64,
}

impl ValueReader<'_> {
    /// フレーム上の変数を読み取る
    pub fn variable(&self, frame: &StackFrame, info: &VariableInfo) -> Variable {
        let value = match self.location(frame, &info.location) {
            Ok(address) => self.value_at(address, &info.ty),
            Err(reason) => Value::Unavailable(reason.to_string()),
        };
        Variable {
            name: info.name.clone(),
            type_name: info.ty.to_string(),
            value,
        }
    }

    fn location(&self, frame: &StackFrame, location: &VariableLocation) -> Result<u64, &'static str> {
        match location {
            VariableLocation::FrameOffset(offset) => {
                let base = match frame.frame_base {
                    FrameBase::FramePointer => frame.fp,
                    FrameBase::StackPointer => frame.sp,
                    // フレームポインタを使う関数では CFA = RBP + 16
                    FrameBase::Cfa => frame.fp.wrapping_add(16),
                };
                Ok(base.wrapping_add_signed(*offset))
            }
            VariableLocation::Address(address) => Ok(*address),
            VariableLocation::Register(_) => Err("register location"),
            VariableLocation::OptimizedOut => Err("optimized out"),
            VariableLocation::Unknown => Err("unsupported location"),
        }
    }

    /// アドレスにある値を型に従って読み取る
    pub fn value_at(&self, address: u64, ty: &ValueType) -> Value {
        match self.try_value_at(address, ty) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!("Failed to read {} at 0x{:x}: {:#}", ty, address, e);
                Value::Unavailable(format!("unreadable memory at 0x{:x}", address))
            }
        }
    }

    fn try_value_at(&self, address: u64, ty: &ValueType) -> anyhow::Result<Value> {
        let value: Value = match ty {
            ValueType::Int { size, signed } => {
                let size = usize::from(*size).clamp(1, 8);
                let bytes = self.read(address, size)?;
                let mut buf = [0u8; 8];
                buf[..size].copy_from_slice(&bytes);
                let raw = u64::from_le_bytes(buf);
                let primitive = if *signed {
                    let shift = 64 - size as u32 * 8;
                    Primitive::Int(((raw << shift) as i64) >> shift)
                } else {
                    Primitive::UInt(raw)
                };
                primitive.into()
            }
            ValueType::Float { size: 4 } => {
                Primitive::Float(f64::from(f32::from_le_bytes(self.read_array(address)?))).into()
            }
            ValueType::Float { .. } => {
                Primitive::Float(f64::from_le_bytes(self.read_array(address)?)).into()
            }
            ValueType::Bool => Primitive::Bool(self.read(address, 1)?[0] != 0).into(),
            ValueType::Char => {
                let raw = u32::from_le_bytes(self.read_array(address)?);
                match char::from_u32(raw) {
                    Some(c) => Primitive::Char(c).into(),
                    None => Value::Unavailable(format!("invalid char 0x{:x}", raw)),
                }
            }
            ValueType::Str => {
                let (ptr, len) = self.read_fat(address)?;
                if ptr == 0 {
                    return Ok(Value::Null {
                        type_name: ty.to_string(),
                    });
                }
                let len = len.min(self.config.max_string_len);
                let bytes = self.read(ptr, len)?;
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            }
            ValueType::Slice(element) => {
                let (ptr, len) = self.read_fat(address)?;
                if ptr == 0 {
                    return Ok(Value::Null {
                        type_name: ty.to_string(),
                    });
                }
                if len > self.config.max_array_len {
                    return Ok(Value::Unavailable(format!("array length {} is too large", len)));
                }
                Value::Array(ArrayValue {
                    element: (**element).clone(),
                    address: ptr,
                    len,
                    generation: self.generation,
                })
            }
            ValueType::Pointer(name) => {
                let ptr = u64::from_le_bytes(self.read_array(address)?);
                if ptr == 0 {
                    Value::Null {
                        type_name: name.clone(),
                    }
                } else {
                    Value::Object(ObjectValue {
                        type_name: name.clone(),
                        address: ptr,
                    })
                }
            }
            ValueType::Unknown { name, size } if *size > 0 => Value::Object(ObjectValue {
                type_name: name.clone(),
                address,
            }),
            ValueType::Unknown { name, .. } => Value::Unavailable(format!("unsized type {}", name)),
        };
        Ok(value)
    }

    /// 配列の要素を読み取る
    pub fn element(&self, array: &ArrayValue, index: usize) -> Result<Value, DebuggerError> {
        if array.generation != self.generation {
            return Err(DebuggerError::StaleFrame {
                frame: array.generation,
                current: self.generation,
            });
        }
        if index >= array.len {
            return Err(DebuggerError::IndexOutOfRange {
                index,
                len: array.len,
            });
        }
        // 先頭アドレスは初期化前のゴミのことがある
        let address = (index as u64)
            .checked_mul(array.element.byte_size())
            .and_then(|offset| array.address.checked_add(offset));
        match address {
            Some(address) => Ok(self.value_at(address, &array.element)),
            None => Ok(Value::Unavailable(format!(
                "element {} of array at 0x{:x} is out of the address space",
                index, array.address
            ))),
        }
    }

    fn read(&self, address: u64, len: usize) -> anyhow::Result<Vec<u8>> {
        let bytes = self.channel.read_memory(address, len)?;
        if bytes.len() != len {
            return Err(anyhow::anyhow!(
                "Short read at 0x{:x}: {} of {} bytes",
                address,
                bytes.len(),
                len
            ));
        }
        Ok(bytes)
    }

    fn read_array<const N: usize>(&self, address: u64) -> anyhow::Result<[u8; N]> {
        let bytes = self.read(address, N)?;
        bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("Failed to read {} bytes at 0x{:x}", N, address))
    }

    /// ポインタ + 長さ
    fn read_fat(&self, address: u64) -> anyhow::Result<(u64, usize)> {
        let ptr = u64::from_le_bytes(self.read_array(address)?);
        let len_address = address
            .checked_add(8)
            .ok_or_else(|| anyhow::anyhow!("Address overflow at 0x{:x}", address))?;
        let len = u64::from_le_bytes(self.read_array(len_address)?);
        Ok((ptr, usize::try_from(len).unwrap_or(usize::MAX)))
    }
}

impl From<Primitive> for Value {
    fn from(p: Primitive) -> Self {
        Value::Primitive(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndbg_target::{SimChannel, SimFunction, SimOp, SimProgram};
    use std::sync::Arc;

    #[test]
    fn test_as_string() {
        assert_eq!(Value::Primitive(Primitive::Int(-3)).as_string(), "-3");
        assert_eq!(Value::Primitive(Primitive::Bool(true)).as_string(), "true");
        assert_eq!(
            Value::Null {
                type_name: "&str".to_string()
            }
            .as_string(),
            "null"
        );
        assert_eq!(Value::String("abc".to_string()).as_string(), "abc");
        assert_eq!(Value::String("abc".to_string()).to_string(), "\"abc\"");
        let array = Value::Array(ArrayValue {
            element: ValueType::Int {
                size: 4,
                signed: true,
            },
            address: 0x1000,
            len: 2,
            generation: 1,
        });
        assert_eq!(array.as_string(), "i32[2]");
        assert_eq!(array.as_array().map(ArrayValue::len), Some(2));
        assert_eq!(Value::Unavailable("optimized out".to_string()).as_string(), "<optimized out>");
    }

    #[test]
    fn test_element_near_end_of_address_space() {
        let program = SimProgram::builder("/sim/Program.exe", "Src/Program.cs")
            .function(SimFunction::new("Main").line(3, [SimOp::Nop]))
            .build()
            .unwrap();
        let channel = SimChannel::new(Arc::new(program));
        let config = DebuggerConfig::default();
        let reader = ValueReader {
            channel: &channel,
            config: &config,
            generation: 1,
        };
        let array = ArrayValue {
            element: ValueType::Int {
                size: 8,
                signed: true,
            },
            address: 0xffff_ffff_ffff_fff8,
            len: 3,
            generation: 1,
        };

        assert!(matches!(reader.element(&array, 2), Ok(Value::Unavailable(_))));
        // 先頭の要素はアドレス空間内だが、読めないメモリ
        assert!(matches!(reader.element(&array, 0), Ok(Value::Unavailable(_))));
        assert!(matches!(
            reader.element(&array, 3),
            Err(DebuggerError::IndexOutOfRange { index: 3, len: 3 })
        ));
    }

    #[test]
    fn test_fat_pointer_at_end_of_address_space() {
        let program = SimProgram::builder("/sim/Program.exe", "Src/Program.cs")
            .function(SimFunction::new("Main").line(3, [SimOp::Nop]))
            .build()
            .unwrap();
        let channel = SimChannel::new(Arc::new(program));
        let config = DebuggerConfig::default();
        let reader = ValueReader {
            channel: &channel,
            config: &config,
            generation: 1,
        };
        assert!(matches!(
            reader.value_at(u64::MAX - 4, &ValueType::Str),
            Value::Unavailable(_)
        ));
    }
}
