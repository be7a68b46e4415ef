//! メモリアクセス機能

use crate::{DebugChannel, Result};
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::{Read as _, Seek, SeekFrom, Write as _};
use std::path::PathBuf;

/// メモリから読み取り可能な型
pub trait MemoryReadable: Sized {
    /// バイト配列から値を構築
    fn from_le_bytes(bytes: &[u8]) -> Result<Self>;

    /// 型のサイズ（バイト数）
    fn size() -> usize;
}

macro_rules! impl_memory_readable {
    ($($ty:ty),*) => {
        $(
            impl MemoryReadable for $ty {
                fn from_le_bytes(bytes: &[u8]) -> Result<Self> {
                    let array = bytes.try_into().map_err(|_| {
                        anyhow::anyhow!(
                            "Failed to convert {} bytes to {} (expected {} bytes)",
                            bytes.len(),
                            stringify!($ty),
                            std::mem::size_of::<$ty>()
                        )
                    })?;
                    Ok(<$ty>::from_le_bytes(array))
                }

                fn size() -> usize {
                    std::mem::size_of::<$ty>()
                }
            }
        )*
    };
}

impl_memory_readable!(u8, u16, u32, u64, i32, i64);

/// チャネル越しに型付き値を読み取る
///
/// ```ignore
/// let return_address: u64 = read_value(channel, fp + 8)?;
/// ```
pub fn read_value<T: MemoryReadable>(channel: &dyn DebugChannel, address: u64) -> Result<T> {
    let bytes = channel.read_memory(address, T::size())?;
    T::from_le_bytes(&bytes)
}

/// ptrace 対象プロセスのメモリ
pub struct Memory {
    pid: Pid,
}

impl Memory {
    /// メモリアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// /proc/pid/mem のパスを取得する
    fn mem_path(&self) -> String {
        format!("/proc/{}/mem", self.pid)
    }

    /// メモリからデータを読み取る
    ///
    /// /proc/pid/memを使用してターゲットプロセスのメモリを読み取ります。
    /// /proc/pid/memが使用できない場合（EIOエラー）、PTRACE_PEEKDATAにフォールバックします。
    pub fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        match self.read_via_proc_mem(addr, size) {
            Ok(data) => Ok(data),
            Err(e) => {
                if let Some(io_err) = e.downcast_ref::<std::io::Error>() {
                    if io_err.raw_os_error() == Some(nix::libc::EIO) {
                        return self.read_via_ptrace(addr, size);
                    }
                }
                Err(e)
            }
        }
    }

    /// /proc/pid/mem経由でメモリを読み取る（内部実装）
    fn read_via_proc_mem(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        let mem_path = self.mem_path();
        let mut file = File::open(&mem_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", mem_path, e))?;

        file.seek(SeekFrom::Start(addr))?;

        let mut buffer = vec![0u8; size];
        file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    /// メモリにデータを書き込む
    ///
    /// 読み取り専用のコードページにも書き込めます（トラップの注入に使う）。
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let mem_path = self.mem_path();
        let mut file = OpenOptions::new()
            .write(true)
            .open(&mem_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {} for writing: {}", mem_path, e))?;

        file.seek(SeekFrom::Start(addr))
            .map_err(|e| anyhow::anyhow!("Failed to seek to address 0x{:x}: {}", addr, e))?;

        file.write_all(data).map_err(|e| {
            anyhow::anyhow!("Failed to write {} bytes to 0x{:x}: {}", data.len(), addr, e)
        })?;

        Ok(())
    }

    /// PTRACE_PEEKDATAを使用してメモリからデータを読み取る
    pub fn read_via_ptrace(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        use nix::sys::ptrace;

        let mut data = Vec::with_capacity(size);
        let word_size = std::mem::size_of::<usize>();

        for offset in (0..size).step_by(word_size) {
            let word_addr = (addr as usize + offset) as *mut std::ffi::c_void;
            let word = ptrace::read(self.pid, word_addr).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to read via ptrace at 0x{:x}: {}",
                    addr as usize + offset,
                    e
                )
            })?;

            let bytes = word.to_ne_bytes();
            let copy_size = (size - offset).min(word_size);
            data.extend_from_slice(&bytes[..copy_size]);
        }

        Ok(data)
    }

    /// 現在のメモリマッピングを読み取る
    pub fn mappings(&self) -> Result<Vec<MemoryMapping>> {
        let maps_path = format!("/proc/{}/maps", self.pid);
        let text = std::fs::read_to_string(&maps_path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", maps_path, e))?;
        parse_mappings(&text)
    }
}

/// メモリマッピング情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    /// ファイル内オフセット
    pub offset: u64,
    pub executable: bool,
    /// ファイルに対応するマッピングのパス
    pub path: Option<PathBuf>,
}

/// ロードされたイメージ（ファイルごとにマッピングをまとめたもの）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleImage {
    pub path: PathBuf,
    pub base: u64,
    pub size: u64,
}

/// /proc/pid/maps の内容を解析する
///
/// フォーマット: "address perms offset dev inode pathname"
/// 例: "7f1234567000-7f1234568000 r-xp 00000000 08:01 123456 /lib/libc.so"
pub fn parse_mappings(text: &str) -> Result<Vec<MemoryMapping>> {
    let mut mappings = Vec::new();

    for line in text.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 {
            continue;
        }

        let Some((start, end)) = parts[0].split_once('-') else {
            continue;
        };
        let start = u64::from_str_radix(start, 16)
            .map_err(|e| anyhow::anyhow!("Failed to parse start address: {}", e))?;
        let end = u64::from_str_radix(end, 16)
            .map_err(|e| anyhow::anyhow!("Failed to parse end address: {}", e))?;
        let offset = u64::from_str_radix(parts[2], 16)
            .map_err(|e| anyhow::anyhow!("Failed to parse segment offset: {}", e))?;

        // パスに空白を含む場合があるので残りを連結する
        let path = (parts.len() > 5)
            .then(|| parts[5..].join(" "))
            .filter(|p| p.starts_with('/'))
            .map(PathBuf::from);

        mappings.push(MemoryMapping {
            start,
            end,
            offset,
            executable: parts[1].chars().nth(2) == Some('x'),
            path,
        });
    }

    Ok(mappings)
}

/// マッピングをファイル単位のイメージにまとめる
///
/// ベースアドレスはファイルオフセット 0 のマッピングの開始位置です。
pub fn module_images(mappings: &[MemoryMapping]) -> Vec<ModuleImage> {
    let mut images: Vec<ModuleImage> = Vec::new();

    for mapping in mappings {
        let Some(path) = &mapping.path else {
            continue;
        };
        match images.iter_mut().find(|m| &m.path == path) {
            Some(image) => {
                image.size = image.size.max(mapping.end.saturating_sub(image.base));
            }
            None if mapping.offset == 0 => images.push(ModuleImage {
                path: path.clone(),
                base: mapping.start,
                size: mapping.end - mapping.start,
            }),
            None => {}
        }
    }

    images
}
