//! シンボル解決のユーティリティ関数

use crate::Result;
use gimli::Reader;

/// 2つのソースファイルパスが同じファイルを指しているとみなせるか
///
/// 区切り文字の違い（`\` と `/`）を無視し、一方が他方のパス末尾と
/// ディレクトリ境界で一致すれば同じファイルとみなします。
pub fn paths_match(a: &str, b: &str) -> bool {
    let a = a.replace('\\', "/");
    let b = b.replace('\\', "/");
    if a == b {
        return true;
    }
    let (long, short) = if a.len() >= b.len() { (&a, &b) } else { (&b, &a) };
    long.ends_with(short.as_str())
        && long.as_bytes()[long.len() - short.len() - 1] == b'/'
        && !short.is_empty()
}

/// ファイルパスの最後の要素を取り出す
pub fn file_name(path: &str) -> &str {
    path.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(path)
}

/// 関数DIE検索ユーティリティ
pub struct FunctionFinder;

impl FunctionFinder {
    /// 関数DIEのアドレス範囲を取得する
    ///
    /// `DW_AT_low_pc` を持たない宣言だけのDIEは None を返します。
    pub fn function_range<R: Reader>(
        dwarf: &gimli::Dwarf<R>,
        unit: &gimli::Unit<R>,
        entry: &gimli::DebuggingInformationEntry<R>,
    ) -> Result<Option<(u64, u64)>> {
        let low_pc = match entry.attr_value(gimli::DW_AT_low_pc)? {
            Some(value) => match dwarf.attr_address(unit, value)? {
                Some(addr) => addr,
                None => return Ok(None),
            },
            None => return Ok(None),
        };

        let high_pc = match entry.attr_value(gimli::DW_AT_high_pc)? {
            Some(gimli::AttributeValue::Udata(size)) => low_pc + size,
            Some(value) => match dwarf.attr_address(unit, value)? {
                Some(addr) => addr,
                None => return Ok(None),
            },
            None => return Ok(None),
        };

        if high_pc <= low_pc {
            return Ok(None);
        }
        Ok(Some((low_pc, high_pc)))
    }
}
