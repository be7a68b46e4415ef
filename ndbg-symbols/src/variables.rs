//! 変数ロケーションと型の解析

use crate::loader::DwarfReader;
use crate::{Result, ValueType, VariableInfo};
use gimli::Reader;

/// 変数のロケーション
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariableLocation {
    /// フレームベースからのオフセット
    FrameOffset(i64),
    /// レジスタ
    Register(u16),
    /// 静的アドレス
    Address(u64),
    /// 最適化により削除された
    OptimizedOut,
    /// 未対応のロケーション式
    Unknown,
}

type Unit = gimli::Unit<DwarfReader>;
type Entry<'a, 'u> = gimli::DebuggingInformationEntry<'a, 'u, DwarfReader>;

/// 型参照の最大追跡深さ
const MAX_TYPE_DEPTH: usize = 8;

/// DIEから変数情報を読み取る
pub struct VariableReader<'a> {
    dwarf: &'a gimli::Dwarf<DwarfReader>,
    unit: &'a Unit,
}

impl<'a> VariableReader<'a> {
    pub fn new(dwarf: &'a gimli::Dwarf<DwarfReader>, unit: &'a Unit) -> Self {
        Self { dwarf, unit }
    }

    /// DIEの名前を取得する（文字列フォームはすべて対応）
    pub fn name(&self, entry: &Entry<'_, '_>) -> Result<Option<String>> {
        match entry.attr_value(gimli::DW_AT_name)? {
            Some(value) => {
                let name = self.dwarf.attr_string(self.unit, value)?;
                Ok(Some(name.to_string_lossy().into_owned()))
            }
            None => Ok(None),
        }
    }

    /// 引数またはローカル変数のDIEを読み取る
    ///
    /// 名前の無い変数（コンパイラ生成）は None を返します。
    pub fn variable(&self, entry: &Entry<'_, '_>) -> Result<Option<VariableInfo>> {
        let Some(name) = self.name(entry)? else {
            return Ok(None);
        };

        let ty = match entry.attr_value(gimli::DW_AT_type)? {
            Some(gimli::AttributeValue::UnitRef(offset)) => self.resolve_type(offset, 0)?,
            _ => ValueType::Unknown {
                name: "<unknown>".to_string(),
                size: 0,
            },
        };

        let location = self.location(entry)?;
        Ok(Some(VariableInfo { name, ty, location }))
    }

    /// `DW_AT_location` を単純なロケーションに変換する
    ///
    /// デバッグビルドで一般的な単一オペレーションの式だけを扱います。
    fn location(&self, entry: &Entry<'_, '_>) -> Result<VariableLocation> {
        let expr = match entry.attr_value(gimli::DW_AT_location)? {
            Some(gimli::AttributeValue::Exprloc(expr)) => expr,
            Some(_) => return Ok(VariableLocation::Unknown),
            None => return Ok(VariableLocation::OptimizedOut),
        };

        let mut data = expr.0;
        let op = data.read_u8()?;
        let location = match op {
            op if op == gimli::constants::DW_OP_fbreg.0 => {
                VariableLocation::FrameOffset(data.read_sleb128()?)
            }
            op if op == gimli::constants::DW_OP_addr.0 => VariableLocation::Address(data.read_u64()?),
            op if (gimli::constants::DW_OP_reg0.0..=gimli::constants::DW_OP_reg31.0).contains(&op) => {
                VariableLocation::Register(u16::from(op - gimli::constants::DW_OP_reg0.0))
            }
            _ => VariableLocation::Unknown,
        };
        Ok(location)
    }

    /// 型DIEを値の読み取りに必要な形へ変換する
    fn resolve_type(&self, offset: gimli::UnitOffset, depth: usize) -> Result<ValueType> {
        let entry = self.unit.entry(offset)?;
        let name = self.name(&entry)?;
        let size = entry
            .attr_value(gimli::DW_AT_byte_size)?
            .and_then(|v| v.udata_value())
            .unwrap_or(0);

        if depth >= MAX_TYPE_DEPTH {
            return Ok(unknown(name, size));
        }

        let ty = match entry.tag() {
            gimli::DW_TAG_base_type => base_type(&entry, name, size)?,
            gimli::DW_TAG_pointer_type | gimli::DW_TAG_reference_type => {
                let name = match name {
                    Some(name) => name,
                    None => match self.target_type(&entry)? {
                        Some(target) => format!("*{}", self.resolve_type(target, depth + 1)?),
                        None => "*void".to_string(),
                    },
                };
                ValueType::Pointer(name)
            }
            gimli::DW_TAG_typedef | gimli::DW_TAG_const_type | gimli::DW_TAG_volatile_type => {
                match self.target_type(&entry)? {
                    Some(target) => self.resolve_type(target, depth + 1)?,
                    None => unknown(name, size),
                }
            }
            gimli::DW_TAG_structure_type => match name.as_deref() {
                Some("&str") | Some("&mut str") => ValueType::Str,
                Some(n) if n.starts_with("&[") || n.starts_with("&mut [") => {
                    match self.slice_element(offset, depth)? {
                        Some(element) => ValueType::Slice(Box::new(element)),
                        None => unknown(name, size),
                    }
                }
                _ => unknown(name, size),
            },
            _ => unknown(name, size),
        };
        Ok(ty)
    }

    /// `DW_AT_type` の参照先を取得する
    fn target_type(&self, entry: &Entry<'_, '_>) -> Result<Option<gimli::UnitOffset>> {
        match entry.attr_value(gimli::DW_AT_type)? {
            Some(gimli::AttributeValue::UnitRef(offset)) => Ok(Some(offset)),
            _ => Ok(None),
        }
    }

    /// スライス構造体（data_ptr, length）の要素型を取得する
    fn slice_element(&self, offset: gimli::UnitOffset, depth: usize) -> Result<Option<ValueType>> {
        let mut tree = self.unit.entries_tree(Some(offset))?;
        let root = tree.root()?;
        let mut children = root.children();

        while let Some(child) = children.next()? {
            let member = child.entry();
            if member.tag() != gimli::DW_TAG_member {
                continue;
            }
            if self.name(member)?.as_deref() != Some("data_ptr") {
                continue;
            }
            let Some(pointer) = self.target_type(member)? else {
                return Ok(None);
            };
            let pointer_entry = self.unit.entry(pointer)?;
            return match self.target_type(&pointer_entry)? {
                Some(element) => Ok(Some(self.resolve_type(element, depth + 1)?)),
                None => Ok(None),
            };
        }
        Ok(None)
    }
}

fn unknown(name: Option<String>, size: u64) -> ValueType {
    ValueType::Unknown {
        name: name.unwrap_or_else(|| "<unknown>".to_string()),
        size,
    }
}

/// 基本型をエンコーディングとサイズから決める
fn base_type(entry: &Entry<'_, '_>, name: Option<String>, size: u64) -> Result<ValueType> {
    let encoding = match entry.attr_value(gimli::DW_AT_encoding)? {
        Some(gimli::AttributeValue::Encoding(enc)) => enc,
        _ => return Ok(unknown(name, size)),
    };

    let ty = match (encoding, size) {
        (gimli::DW_ATE_boolean, 1) => ValueType::Bool,
        (gimli::DW_ATE_UTF, 4) => ValueType::Char,
        (gimli::DW_ATE_float, 4 | 8) => ValueType::Float { size: size as u8 },
        (gimli::DW_ATE_signed | gimli::DW_ATE_signed_char, 1 | 2 | 4 | 8) => ValueType::Int {
            size: size as u8,
            signed: true,
        },
        (gimli::DW_ATE_unsigned | gimli::DW_ATE_unsigned_char | gimli::DW_ATE_UTF, 1 | 2 | 4 | 8) => {
            ValueType::Int {
                size: size as u8,
                signed: false,
            }
        }
        _ => unknown(name, size),
    };
    Ok(ty)
}
