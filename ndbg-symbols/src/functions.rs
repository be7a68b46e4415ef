//! 関数情報の収集と検索

use crate::loader::DwarfReader;
use crate::utils::FunctionFinder;
use crate::variables::VariableReader;
use crate::{DwarfLoader, FrameBase, FunctionInfo, Result};
use gimli::Reader;
use std::collections::HashMap;
use std::sync::Arc;

/// オフセット順の関数一覧
#[derive(Debug, Clone, Default)]
pub struct FunctionIndex {
    functions: Vec<Arc<FunctionInfo>>,
    by_name: HashMap<String, usize>,
}

impl FunctionIndex {
    pub fn from_functions(mut functions: Vec<FunctionInfo>) -> Self {
        functions.sort_by_key(|f| f.low);
        // 同じ開始位置のDIEが重複していたら先のものを残す
        functions.dedup_by_key(|f| f.low);

        let functions: Vec<Arc<FunctionInfo>> = functions.into_iter().map(Arc::new).collect();
        let mut by_name = HashMap::new();
        for (i, func) in functions.iter().enumerate() {
            by_name.entry(func.name.clone()).or_insert(i);
        }

        Self { functions, by_name }
    }

    /// オフセットを含む関数を検索する
    pub fn at(&self, offset: u64) -> Option<Arc<FunctionInfo>> {
        let idx = self.functions.partition_point(|f| f.low <= offset);
        if idx == 0 {
            return None;
        }
        let func = &self.functions[idx - 1];
        func.contains(offset).then(|| Arc::clone(func))
    }

    /// 名前から関数を検索する
    pub fn by_name(&self, name: &str) -> Option<Arc<FunctionInfo>> {
        self.by_name.get(name).map(|&i| Arc::clone(&self.functions[i]))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<FunctionInfo>> {
        self.functions.iter()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// すべてのコンパイル単位から関数DIEを収集する
///
/// 返す関数の `has_line_info` は false のままです。行テーブルと突き合わせるのは呼び出し側です。
pub fn collect_functions(loader: &DwarfLoader) -> Result<Vec<FunctionInfo>> {
    let dwarf = loader.dwarf();
    let image_base = loader.image_base();
    let mut functions = Vec::new();

    let mut units = dwarf.units();
    while let Some(header) = units.next()? {
        let unit = dwarf.unit(header)?;
        let collector = Collector {
            dwarf,
            unit: &unit,
            vars: VariableReader::new(dwarf, &unit),
            image_base,
        };
        let mut tree = unit.entries_tree(None)?;
        let root = tree.root()?;
        collector.scan(root, None, &mut functions)?;
    }

    tracing::debug!("Collected {} functions", functions.len());
    Ok(functions)
}

type Node<'abbrev, 'unit, 'tree> = gimli::EntriesTreeNode<'abbrev, 'unit, 'tree, DwarfReader>;
type Entry<'a, 'u> = gimli::DebuggingInformationEntry<'a, 'u, DwarfReader>;

struct Collector<'a> {
    dwarf: &'a gimli::Dwarf<DwarfReader>,
    unit: &'a gimli::Unit<DwarfReader>,
    vars: VariableReader<'a>,
    image_base: u64,
}

impl Collector<'_> {
    /// DIE木を走査する
    ///
    /// `current` は変数の追加先の関数です。レキシカルブロックの中の変数も同じ関数のローカル変数になります。
    fn scan(
        &self,
        node: Node<'_, '_, '_>,
        mut current: Option<&mut FunctionInfo>,
        out: &mut Vec<FunctionInfo>,
    ) -> Result<()> {
        let mut children = node.children();
        while let Some(child) = children.next()? {
            match child.entry().tag() {
                gimli::DW_TAG_subprogram => match self.function_header(child.entry())? {
                    Some(mut func) => {
                        self.scan(child, Some(&mut func), out)?;
                        out.push(func);
                    }
                    None => self.scan(child, None, out)?,
                },
                gimli::DW_TAG_formal_parameter => {
                    if let Some(func) = current.as_deref_mut() {
                        if let Some(var) = self.vars.variable(child.entry())? {
                            func.arguments.push(var);
                        }
                    }
                }
                gimli::DW_TAG_variable => {
                    if let Some(func) = current.as_deref_mut() {
                        if let Some(var) = self.vars.variable(child.entry())? {
                            func.locals.push(var);
                        }
                    }
                }
                gimli::DW_TAG_lexical_block => self.scan(child, current.as_deref_mut(), out)?,
                // インライン展開された関数の変数は呼び出し元に含めない
                _ => self.scan(child, None, out)?,
            }
        }
        Ok(())
    }

    /// 関数DIEから名前・範囲・フレームベースを読み取る
    fn function_header(&self, entry: &Entry<'_, '_>) -> Result<Option<FunctionInfo>> {
        let Some((low, high)) = FunctionFinder::function_range(self.dwarf, self.unit, entry)? else {
            return Ok(None);
        };
        if low < self.image_base {
            return Ok(None);
        }

        let name = match self.vars.name(entry)? {
            Some(name) => name,
            None => match self.specification_name(entry)? {
                Some(name) => name,
                None => return Ok(None),
            },
        };

        Ok(Some(FunctionInfo {
            name,
            low: low - self.image_base,
            high: high - self.image_base,
            frame_base: frame_base(entry)?,
            has_line_info: false,
            arguments: Vec::new(),
            locals: Vec::new(),
        }))
    }

    /// 宣言側のDIE（`DW_AT_specification` / `DW_AT_abstract_origin`）から名前を取る
    fn specification_name(&self, entry: &Entry<'_, '_>) -> Result<Option<String>> {
        for attr in [gimli::DW_AT_specification, gimli::DW_AT_abstract_origin] {
            if let Some(gimli::AttributeValue::UnitRef(offset)) = entry.attr_value(attr)? {
                let decl = self.unit.entry(offset)?;
                if let Some(name) = self.vars.name(&decl)? {
                    return Ok(Some(name));
                }
            }
        }
        Ok(None)
    }
}

/// `DW_AT_frame_base` を解釈する
///
/// 解釈できない場合はフレームポインタ基準とみなします。
fn frame_base(entry: &Entry<'_, '_>) -> Result<FrameBase> {
    let Some(gimli::AttributeValue::Exprloc(expr)) = entry.attr_value(gimli::DW_AT_frame_base)?
    else {
        return Ok(FrameBase::FramePointer);
    };

    let mut data = expr.0;
    if data.is_empty() {
        return Ok(FrameBase::FramePointer);
    }
    let base = match data.read_u8()? {
        op if op == gimli::constants::DW_OP_reg7.0 => FrameBase::StackPointer,
        op if op == gimli::constants::DW_OP_call_frame_cfa.0 => FrameBase::Cfa,
        _ => FrameBase::FramePointer,
    };
    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn func(name: &str, low: u64, high: u64) -> FunctionInfo {
        FunctionInfo {
            name: name.to_string(),
            low,
            high,
            frame_base: FrameBase::FramePointer,
            has_line_info: true,
            arguments: Vec::new(),
            locals: Vec::new(),
        }
    }

    #[test]
    fn test_function_lookup() {
        let index = FunctionIndex::from_functions(vec![
            func("Sub1", 0x40, 0x60),
            func("Main", 0x10, 0x30),
        ]);

        assert_eq!(index.at(0x10).unwrap().name, "Main");
        assert_eq!(index.at(0x5f).unwrap().name, "Sub1");
        assert!(index.at(0x30).is_none());
        assert!(index.at(0x8).is_none());
        assert_eq!(index.by_name("Sub1").unwrap().low, 0x40);
        assert!(index.by_name("Sub2").is_none());
    }
}
