//! ELFシンボルテーブルによる関数名解決
//!
//! DWARFに関数が見つからないフレーム（標準ライブラリの一部など）の名前付けに使います。

use crate::{DwarfLoader, Result};
use object::{Object, ObjectSymbol, SymbolKind};
use std::collections::HashMap;

/// シンボル情報
#[derive(Debug, Clone)]
pub struct Symbol {
    /// マングルされたシンボル名
    pub name: String,
    /// デマングルされたシンボル名
    pub demangled_name: String,
    /// モジュール相対オフセット
    pub offset: u64,
    pub size: u64,
}

impl Symbol {
    /// シンボルを作成し、デマングルされた名前を設定する
    pub fn new(name: String, offset: u64, size: u64) -> Self {
        let demangled_name = demangle_symbol(&name);
        Self {
            name,
            demangled_name,
            offset,
            size,
        }
    }

    /// 表示用の名前を取得
    pub fn display_name(&self) -> &str {
        &self.demangled_name
    }
}

/// シンボル名をデマングルする
fn demangle_symbol(name: &str) -> String {
    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        return format!("{:#}", demangled);
    }

    // C++のシンボルは未対応なのでそのまま返す
    name.to_string()
}

/// テキストシンボルの解決
pub struct SymbolResolver {
    /// シンボル名 -> インデックス
    by_name: HashMap<String, usize>,
    /// オフセット順に並んだシンボル
    by_offset: Vec<Symbol>,
}

impl SymbolResolver {
    /// ローダーのシンボルテーブルから構築する
    pub fn new(loader: &DwarfLoader) -> Result<Self> {
        let image_base = loader.image_base();
        let mut by_offset = Vec::new();

        // strip されたライブラリは .dynsym にしか名前が残らない
        let object = loader.object_file();
        for symbol in object.symbols().chain(object.dynamic_symbols()) {
            if symbol.kind() != SymbolKind::Text || symbol.address() < image_base {
                continue;
            }
            match symbol.name() {
                Ok(name) if !name.is_empty() => {
                    by_offset.push(Symbol::new(
                        name.to_string(),
                        symbol.address() - image_base,
                        symbol.size(),
                    ));
                }
                _ => {}
            }
        }

        by_offset.sort_by(|a, b| (a.offset, &a.name).cmp(&(b.offset, &b.name)));
        by_offset.dedup_by(|a, b| a.offset == b.offset && a.name == b.name);
        Ok(Self::from_symbols(by_offset))
    }

    pub fn is_empty(&self) -> bool {
        self.by_offset.is_empty()
    }

    /// シンボルの一覧から構築する
    pub fn from_symbols(mut symbols: Vec<Symbol>) -> Self {
        symbols.sort_by_key(|s| s.offset);
        let by_name = symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();
        Self {
            by_name,
            by_offset: symbols,
        }
    }

    /// シンボル名からオフセットを解決する
    pub fn resolve(&self, name: &str) -> Option<u64> {
        self.by_name.get(name).map(|&i| self.by_offset[i].offset)
    }

    /// オフセットを含むシンボルを返す
    ///
    /// サイズ 0 のシンボルは、次のシンボルまでを範囲とみなします。
    pub fn reverse_resolve(&self, offset: u64) -> Option<&Symbol> {
        let idx = self.by_offset.partition_point(|s| s.offset <= offset);
        if idx == 0 {
            return None;
        }
        let sym = &self.by_offset[idx - 1];
        if sym.size == 0 || offset < sym.offset + sym.size {
            Some(sym)
        } else {
            None
        }
    }

    /// すべてのシンボルを取得する
    pub fn all_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.by_offset.iter()
    }

    /// マングル名とデマングル名の両方でパターン検索する
    pub fn find_symbols(&self, pattern: &str) -> Vec<&Symbol> {
        self.by_offset
            .iter()
            .filter(|s| s.name.contains(pattern) || s.demangled_name.contains(pattern))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> SymbolResolver {
        SymbolResolver::from_symbols(vec![
            Symbol::new("_ZN4demo4main17h0123456789abcdefE".to_string(), 0x100, 0x40),
            Symbol::new("helper".to_string(), 0x200, 0),
        ])
    }

    #[test]
    fn test_demangled_name() {
        let r = resolver();
        let sym = r.reverse_resolve(0x110).unwrap();
        assert_eq!(sym.display_name(), "demo::main");
    }

    #[test]
    fn test_reverse_resolve_respects_size() {
        let r = resolver();
        assert!(r.reverse_resolve(0x150).is_none());
        assert!(r.reverse_resolve(0x50).is_none());
        // サイズ不明のシンボルは後続すべてを覆う
        assert_eq!(r.reverse_resolve(0x900).unwrap().name, "helper");
    }

    #[test]
    fn test_resolve_by_name() {
        let r = resolver();
        assert_eq!(r.resolve("helper"), Some(0x200));
        assert_eq!(r.find_symbols("demo").len(), 1);
    }
}
