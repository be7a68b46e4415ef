//! ソース行情報
//!
//! アドレス範囲と行の対応表です。DWARFの場合は addr2line で行番号プログラムを展開します。

use crate::utils::paths_match;
use crate::{DwarfLoader, LineRange, Result, SourceSegment};

/// ステートメント単位の行テーブル（オフセット順）
#[derive(Debug, Clone, Default)]
pub struct LineTable {
    rows: Vec<LineRange>,
}

impl LineTable {
    /// 行範囲の一覧から構築する
    ///
    /// 隣接していて同じ区間を指す行は1つのステートメントにまとめます。
    pub fn from_ranges(mut ranges: Vec<LineRange>) -> Self {
        ranges.sort_by_key(|r| r.start);

        let mut rows: Vec<LineRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            if range.end <= range.start {
                continue;
            }
            if let Some(last) = rows.last_mut() {
                if last.end == range.start && last.segment == range.segment {
                    last.end = range.end;
                    continue;
                }
            }
            rows.push(range);
        }

        Self { rows }
    }

    /// DWARFの行番号プログラムから構築する
    pub fn from_dwarf(loader: &DwarfLoader) -> Result<Self> {
        let context = addr2line::Context::from_dwarf(loader.load_dwarf()?)
            .map_err(|e| anyhow::anyhow!("Failed to build addr2line context: {}", e))?;
        let image_base = loader.image_base();

        let mut ranges = Vec::new();
        let iter = context
            .find_location_range(0, u64::MAX)
            .map_err(|e| anyhow::anyhow!("Failed to read line programs: {}", e))?;

        for (addr, size, location) in iter {
            // 行 0 はコンパイラ生成コードなので行情報なしとして扱う
            let (Some(file), Some(line)) = (location.file, location.line) else {
                continue;
            };
            if line == 0 || addr < image_base {
                continue;
            }
            let mut segment = SourceSegment::line(file, line);
            segment.start_column = location.column.filter(|&c| c != 0);
            ranges.push(LineRange {
                start: addr - image_base,
                end: addr - image_base + size,
                segment,
            });
        }

        Ok(Self::from_ranges(ranges))
    }

    /// オフセットを含むステートメントを検索する
    pub fn lookup(&self, offset: u64) -> Option<&LineRange> {
        let idx = self.rows.partition_point(|r| r.start <= offset);
        if idx == 0 {
            return None;
        }
        let row = &self.rows[idx - 1];
        row.contains(offset).then_some(row)
    }

    /// ファイルと行からステートメントを検索する
    ///
    /// その行で始まるステートメントを優先し、なければその行を覆う複数行のステートメントを返します。
    /// 同じ行に複数の範囲があれば最も若いオフセットを選びます。
    pub fn resolve(&self, file: &str, line: u32) -> Option<&LineRange> {
        let candidates = || {
            self.rows
                .iter()
                .filter(move |r| paths_match(&r.segment.file, file))
        };

        candidates()
            .filter(|r| r.segment.start_line == line)
            .min_by_key(|r| r.start)
            .or_else(|| {
                candidates()
                    .filter(|r| r.segment.start_line < line && line <= r.segment.end_line)
                    .min_by_key(|r| r.start)
            })
    }

    /// 指定範囲に行情報があるか
    pub fn has_rows_in(&self, low: u64, high: u64) -> bool {
        let idx = self.rows.partition_point(|r| r.end <= low);
        self.rows.get(idx).is_some_and(|r| r.start < high)
    }

    /// ステートメント数
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
