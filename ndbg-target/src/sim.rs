//! 決定的に動くシミュレーション上のデバッグ対象
//!
//! x86 風の呼び出し規約（call で戻りアドレスを積み、RBP でフレームを繋ぐ）を持つ小さな仮想マシンです。
//! 命令は関数ごとに組み立て、各ステートメントにソース行を付けられます。
//! 同時に行テーブルと関数情報（[`ModuleTable`]）を生成するので、実プロセスなしでエンジン全体を動かせます。
//!
//! トラップの扱いは x86 と同じです。`0xCC` を書き込んだ命令を実行すると PC はその直後を指して停止します。

use crate::{
    DebugChannel, DebugEvent, Instruction, InstructionKind, LaunchSpec, Launcher, Result,
    ResumeMode, ThreadContext, ThreadId, TrapKind, TRAP_BYTE,
};
use ndbg_symbols::{
    FrameBase, FunctionInfo, LineRange, ModuleTable, SourceSegment, TableSymbolProvider,
    ValueType, VariableInfo, VariableLocation,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// シミュレータのプロセスID（メインスレッドIDも同じ）
pub const SIM_PID: i32 = 4200;
pub const MAIN_THREAD: ThreadId = SIM_PID;

/// コードを配置するアドレス
pub const CODE_BASE: u64 = 0x40_0000;
pub const STACK_TOP: u64 = 0x7fff_0000;
const STACK_SIZE: u64 = 0x1_0000;
pub const HEAP_BASE: u64 = 0x1000_0000;
/// 追加ライブラリを配置するアドレス
const LIBRARY_BASE: u64 = 0x7f00_0000_0000;

const WORD: u64 = 8;

const OP_CALL: u8 = 0xE8;
const OP_RET: u8 = 0xC3;
const OP_NOP: u8 = 0x90;
const OP_PUSH_FP: u8 = 0x55;
const CALL_LEN: u64 = 5;
const PUSH_FP_LEN: u64 = 1;
const RET_LEN: u64 = 1;
const BREAK_LEN: u64 = 1;
const OP_LEN: u64 = 4;

/// 1回のポーリングで実行する最大命令数
const RUN_SLICE: usize = 1000;

const SIGSEGV: i32 = 11;
const SIGKILL: i32 = 9;

/// 変数の型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimType {
    /// 32ビット符号付き整数
    Int,
    Bool,
    /// ポインタ + 長さ（null 可）
    Str,
    /// i32 のポインタ + 要素数
    IntArray,
    /// 型名付きの参照（0 は null）
    Object(String),
}

impl SimType {
    fn value_type(&self) -> ValueType {
        match self {
            SimType::Int => ValueType::Int {
                size: 4,
                signed: true,
            },
            SimType::Bool => ValueType::Bool,
            SimType::Str => ValueType::Str,
            SimType::IntArray => ValueType::Slice(Box::new(ValueType::Int {
                size: 4,
                signed: true,
            })),
            SimType::Object(name) => ValueType::Pointer(name.clone()),
        }
    }
}

/// 変数に格納するデータ
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimData {
    Int(i32),
    Bool(bool),
    Str(Option<String>),
    IntArray(Vec<i32>),
    Object(Option<Vec<u8>>),
}

impl SimData {
    pub fn str(s: &str) -> Self {
        SimData::Str(Some(s.to_string()))
    }
}

/// ソースレベルの操作（1ステートメントは1つ以上の操作からなる）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimOp {
    Nop,
    /// 名前で関数を呼ぶ
    Call(String),
    /// 次の呼び出しの引数を設定する
    SetArg(usize, SimData),
    /// ローカル変数に代入する
    Store(String, SimData),
    /// 標準出力に書く
    Print(String),
    /// コード内のブレーク（INT3）
    Break,
    /// 同じ関数のステートメント番号へジャンプする
    Jump(usize),
    SpawnThread(ThreadId),
    EndThread(ThreadId),
    /// 遅延ロードのライブラリを読み込む
    LoadLibrary(usize),
    /// シグナルで停止する（再開すると異常終了する）
    Fault(i32, String),
    Exit(i32),
}

impl SimOp {
    pub fn call(name: &str) -> Self {
        SimOp::Call(name.to_string())
    }

    pub fn print(text: &str) -> Self {
        SimOp::Print(text.to_string())
    }

    pub fn store(name: &str, data: SimData) -> Self {
        SimOp::Store(name.to_string(), data)
    }

    fn len(&self) -> u64 {
        match self {
            SimOp::Call(_) => CALL_LEN,
            SimOp::Break => BREAK_LEN,
            _ => OP_LEN,
        }
    }
}

#[derive(Debug, Clone)]
struct SimStatement {
    line: Option<u32>,
    ops: Vec<SimOp>,
}

/// 関数の組み立て
#[derive(Debug, Clone)]
pub struct SimFunction {
    name: String,
    arguments: Vec<(String, SimType)>,
    locals: Vec<(String, SimType)>,
    open_line: Option<u32>,
    close_line: Option<u32>,
    statements: Vec<SimStatement>,
}

impl SimFunction {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            arguments: Vec::new(),
            locals: Vec::new(),
            open_line: None,
            close_line: None,
            statements: Vec::new(),
        }
    }

    /// 引数を宣言する（宣言順に SetArg の番号が対応する）
    pub fn arg(mut self, name: &str, ty: SimType) -> Self {
        self.arguments.push((name.to_string(), ty));
        self
    }

    pub fn local(mut self, name: &str, ty: SimType) -> Self {
        self.locals.push((name.to_string(), ty));
        self
    }

    /// プロローグ（フレームの作成と引数の退避）に付ける行
    pub fn open(mut self, line: u32) -> Self {
        self.open_line = Some(line);
        self
    }

    /// エピローグ（フレームの破棄と ret）に付ける行
    pub fn close(mut self, line: u32) -> Self {
        self.close_line = Some(line);
        self
    }

    /// 行情報付きのステートメントを追加する
    pub fn line(self, line: u32, ops: impl IntoIterator<Item = SimOp>) -> Self {
        self.statement(Some(line), ops)
    }

    /// 行情報の無いステートメントを追加する
    pub fn hidden(self, ops: impl IntoIterator<Item = SimOp>) -> Self {
        self.statement(None, ops)
    }

    fn has_frame_storage(&self) -> bool {
        !self.arguments.is_empty() || !self.locals.is_empty()
    }

    /// push rbp、mov rbp, rsp、領域の確保、引数ごとの退避
    fn prologue_len(&self) -> u64 {
        let reserve = if self.has_frame_storage() { OP_LEN } else { 0 };
        PUSH_FP_LEN + OP_LEN + reserve + OP_LEN * self.arguments.len() as u64
    }

    fn statement(mut self, line: Option<u32>, ops: impl IntoIterator<Item = SimOp>) -> Self {
        let mut ops: Vec<SimOp> = ops.into_iter().collect();
        if ops.is_empty() {
            ops.push(SimOp::Nop);
        }
        self.statements.push(SimStatement { line, ops });
        self
    }
}

/// 内部命令
#[derive(Debug, Clone)]
enum Instr {
    /// push rbp
    PushFrame,
    /// mov rbp, rsp
    SetFrame,
    Reserve(u64),
    Spill { index: usize, offset: i64, size: u64 },
    Leave,
    Ret,
    Nop,
    Call(u64),
    SetArg(usize, SimData),
    Store { offset: i64, data: SimData },
    Print(String),
    Break,
    Jump(u64),
    SpawnThread(ThreadId),
    EndThread(ThreadId),
    LoadLibrary(usize),
    Fault(i32, String),
    Exit(i32),
}

impl Instr {
    fn len(&self) -> u64 {
        match self {
            Instr::Call(_) => CALL_LEN,
            Instr::Ret => RET_LEN,
            Instr::Break => BREAK_LEN,
            Instr::PushFrame => PUSH_FP_LEN,
            _ => OP_LEN,
        }
    }
}

#[derive(Debug, Clone)]
struct SimLibrary {
    path: PathBuf,
    size: u64,
    at_start: bool,
}

/// プログラムの組み立て
#[derive(Debug, Clone)]
pub struct SimProgramBuilder {
    path: PathBuf,
    source_file: String,
    entry: String,
    functions: Vec<SimFunction>,
    libraries: Vec<SimLibrary>,
}

impl SimProgramBuilder {
    /// `path` はモジュールのパス、`source_file` は行情報のファイル名
    pub fn new(path: impl Into<PathBuf>, source_file: &str) -> Self {
        Self {
            path: path.into(),
            source_file: source_file.to_string(),
            entry: "Main".to_string(),
            functions: Vec::new(),
            libraries: Vec::new(),
        }
    }

    pub fn function(mut self, function: SimFunction) -> Self {
        self.functions.push(function);
        self
    }

    pub fn entry(mut self, name: &str) -> Self {
        self.entry = name.to_string();
        self
    }

    /// 起動時にロードされるシンボル無しのライブラリ
    pub fn library(mut self, path: impl Into<PathBuf>, size: u64) -> Self {
        self.libraries.push(SimLibrary {
            path: path.into(),
            size,
            at_start: true,
        });
        self
    }

    /// `SimOp::LoadLibrary` でロードされるライブラリ
    pub fn delayed_library(mut self, path: impl Into<PathBuf>, size: u64) -> Self {
        self.libraries.push(SimLibrary {
            path: path.into(),
            size,
            at_start: false,
        });
        self
    }

    pub fn build(self) -> Result<SimProgram> {
        // 1回目: 関数とステートメントのアドレスを決める
        let mut cursor = CODE_BASE + 0x10;
        let mut layouts = Vec::with_capacity(self.functions.len());
        let mut addresses: HashMap<&str, u64> = HashMap::new();

        for func in &self.functions {
            let low = cursor;
            let mut at = low + func.prologue_len();
            let mut statements = Vec::with_capacity(func.statements.len());
            for stmt in &func.statements {
                statements.push(at);
                at += stmt.ops.iter().map(SimOp::len).sum::<u64>();
            }
            let high = at + OP_LEN + RET_LEN;
            addresses.insert(func.name.as_str(), low);
            layouts.push((low, statements, high));
            cursor = align_up(high, 16);
        }

        let entry = *addresses
            .get(self.entry.as_str())
            .ok_or_else(|| anyhow::anyhow!("Unknown entry function {}", self.entry))?;

        // 2回目: 命令を並べ、行テーブルと関数情報を作る
        let mut instrs: BTreeMap<u64, Instr> = BTreeMap::new();
        let mut lines = Vec::new();
        let mut functions = Vec::new();

        for (func, (low, statements, high)) in self.functions.iter().zip(&layouts) {
            let mut slots: HashMap<&str, i64> = HashMap::new();
            let mut frame: u64 = 0;
            let mut variable = |name: &str, ty: &SimType| {
                let ty = ty.value_type();
                frame += align_up(ty.byte_size(), WORD);
                let offset = -(frame as i64);
                VariableInfo {
                    name: name.to_string(),
                    ty,
                    location: VariableLocation::FrameOffset(offset),
                }
            };
            let arguments: Vec<VariableInfo> =
                func.arguments.iter().map(|(n, t)| variable(n, t)).collect();
            let locals: Vec<VariableInfo> =
                func.locals.iter().map(|(n, t)| variable(n, t)).collect();
            let frame_size = align_up(frame, 16);
            for var in arguments.iter().chain(&locals) {
                if let VariableLocation::FrameOffset(offset) = var.location {
                    slots.insert(var.name.as_str(), offset);
                }
            }

            let mut at = *low;
            emit(&mut instrs, &mut at, Instr::PushFrame);
            emit(&mut instrs, &mut at, Instr::SetFrame);
            // 変数の無い関数は mov rbp, rsp でプロローグが終わる
            if func.has_frame_storage() {
                emit(&mut instrs, &mut at, Instr::Reserve(frame_size));
            }
            for (index, var) in arguments.iter().enumerate() {
                if let VariableLocation::FrameOffset(offset) = var.location {
                    let size = var.ty.byte_size();
                    emit(&mut instrs, &mut at, Instr::Spill { index, offset, size });
                }
            }
            if let Some(line) = func.open_line {
                lines.push(self.line_range(*low, at, line));
            }

            for (stmt, &start) in func.statements.iter().zip(statements) {
                for op in &stmt.ops {
                    let instr = match op {
                        SimOp::Nop => Instr::Nop,
                        SimOp::Call(name) => Instr::Call(*addresses.get(name.as_str()).ok_or_else(
                            || anyhow::anyhow!("Unknown function {} called from {}", name, func.name),
                        )?),
                        SimOp::SetArg(index, data) => Instr::SetArg(*index, data.clone()),
                        SimOp::Store(name, data) => Instr::Store {
                            offset: *slots.get(name.as_str()).ok_or_else(|| {
                                anyhow::anyhow!("Unknown local {} in {}", name, func.name)
                            })?,
                            data: data.clone(),
                        },
                        SimOp::Print(text) => Instr::Print(text.clone()),
                        SimOp::Break => Instr::Break,
                        SimOp::Jump(target) => Instr::Jump(*statements.get(*target).ok_or_else(
                            || anyhow::anyhow!("Jump to missing statement {} in {}", target, func.name),
                        )?),
                        SimOp::SpawnThread(tid) => Instr::SpawnThread(*tid),
                        SimOp::EndThread(tid) => Instr::EndThread(*tid),
                        SimOp::LoadLibrary(index) => {
                            if *index >= self.libraries.len() {
                                return Err(anyhow::anyhow!("Unknown library {}", index));
                            }
                            Instr::LoadLibrary(*index)
                        }
                        SimOp::Fault(signal, description) => {
                            Instr::Fault(*signal, description.clone())
                        }
                        SimOp::Exit(code) => Instr::Exit(*code),
                    };
                    emit(&mut instrs, &mut at, instr);
                }
                if let Some(line) = stmt.line {
                    lines.push(self.line_range(start, at, line));
                }
            }

            let epilogue = at;
            emit(&mut instrs, &mut at, Instr::Leave);
            emit(&mut instrs, &mut at, Instr::Ret);
            if let Some(line) = func.close_line {
                lines.push(self.line_range(epilogue, at, line));
            }

            functions.push(FunctionInfo {
                name: func.name.clone(),
                low: low - CODE_BASE,
                high: high - CODE_BASE,
                frame_base: FrameBase::FramePointer,
                has_line_info: false,
                arguments,
                locals,
            });
        }

        let code_end = layouts.last().map_or(CODE_BASE + 0x10, |(_, _, high)| *high);
        let mut code = vec![OP_NOP; (code_end - CODE_BASE + 16) as usize];
        for (&addr, instr) in &instrs {
            let at = (addr - CODE_BASE) as usize;
            match instr {
                Instr::Call(target) => {
                    let rel = (*target as i64 - (addr + CALL_LEN) as i64) as i32;
                    code[at] = OP_CALL;
                    code[at + 1..at + 5].copy_from_slice(&rel.to_le_bytes());
                }
                Instr::Ret => code[at] = OP_RET,
                Instr::PushFrame => code[at] = OP_PUSH_FP,
                Instr::Break => code[at] = TRAP_BYTE,
                _ => {}
            }
        }

        Ok(SimProgram {
            path: self.path,
            table: ModuleTable::new(lines, functions),
            code,
            instrs,
            entry,
            libraries: self.libraries,
        })
    }

    fn line_range(&self, start: u64, end: u64, line: u32) -> LineRange {
        LineRange {
            start: start - CODE_BASE,
            end: end - CODE_BASE,
            segment: SourceSegment::line(self.source_file.clone(), line),
        }
    }
}

fn emit(instrs: &mut BTreeMap<u64, Instr>, at: &mut u64, instr: Instr) {
    let len = instr.len();
    instrs.insert(*at, instr);
    *at += len;
}

fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// 組み立て済みのプログラム
#[derive(Debug, Clone)]
pub struct SimProgram {
    path: PathBuf,
    table: ModuleTable,
    code: Vec<u8>,
    instrs: BTreeMap<u64, Instr>,
    entry: u64,
    libraries: Vec<SimLibrary>,
}

impl SimProgram {
    pub fn builder(path: impl Into<PathBuf>, source_file: &str) -> SimProgramBuilder {
        SimProgramBuilder::new(path, source_file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn table(&self) -> &ModuleTable {
        &self.table
    }

    /// このプログラムのシンボルを返すプロバイダ
    pub fn symbol_provider(&self) -> TableSymbolProvider {
        TableSymbolProvider::new().with_module(self.path.clone(), self.table.clone())
    }

    /// 関数の先頭アドレス
    pub fn function_address(&self, name: &str) -> Option<u64> {
        self.table
            .functions()
            .by_name(name)
            .map(|f| CODE_BASE + f.low)
    }

    fn module_size(&self) -> u64 {
        self.code.len() as u64
    }

    fn library_base(index: usize) -> u64 {
        LIBRARY_BASE + index as u64 * 0x10_0000
    }
}

/// シミュレータを起動するランチャー
#[derive(Debug, Clone)]
pub struct SimLauncher {
    program: Arc<SimProgram>,
}

impl SimLauncher {
    pub fn new(program: SimProgram) -> Self {
        Self {
            program: Arc::new(program),
        }
    }

    pub fn program(&self) -> &SimProgram {
        &self.program
    }
}

impl Launcher for SimLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn DebugChannel>> {
        if spec.executable != self.program.path {
            return Err(anyhow::anyhow!(
                "Executable not found: {}",
                spec.executable.display()
            ));
        }
        tracing::debug!("Launching simulated {}", spec.executable.display());
        Ok(Box::new(SimChannel::new(Arc::clone(&self.program))))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimState {
    Stopped,
    Running,
    Stepping,
    Exited,
}

/// シミュレータのデバッグチャネル
pub struct SimChannel {
    program: Arc<SimProgram>,
    code: Vec<u8>,
    stack: Vec<u8>,
    heap: Vec<u8>,
    regs: ThreadContext,
    args: Vec<Vec<u8>>,
    threads: Vec<ThreadId>,
    pending: VecDeque<DebugEvent>,
    state: SimState,
    interrupt_requested: bool,
    /// 再開時に配送されるシグナル
    pending_fault: Option<i32>,
}

impl SimChannel {
    pub fn new(program: Arc<SimProgram>) -> Self {
        let mut pending = VecDeque::new();
        pending.push_back(DebugEvent::ThreadCreated { tid: MAIN_THREAD });
        pending.push_back(DebugEvent::ModuleLoaded {
            path: program.path.clone(),
            base: CODE_BASE,
            size: program.module_size(),
        });
        for (index, lib) in program.libraries.iter().enumerate() {
            if lib.at_start {
                pending.push_back(DebugEvent::ModuleLoaded {
                    path: lib.path.clone(),
                    base: SimProgram::library_base(index),
                    size: lib.size,
                });
            }
        }

        Self {
            code: program.code.clone(),
            stack: vec![0; STACK_SIZE as usize],
            heap: Vec::new(),
            // エントリ関数の戻りアドレスは 0（戻ると終了する）
            regs: ThreadContext {
                pc: program.entry,
                sp: STACK_TOP - WORD,
                fp: 0,
            },
            args: Vec::new(),
            threads: vec![MAIN_THREAD],
            pending,
            state: SimState::Stopped,
            interrupt_requested: false,
            pending_fault: None,
            program,
        }
    }

    /// アドレスを (領域, 領域内オフセット) に変換する
    fn locate(&self, address: u64, len: usize) -> Result<(Region, usize)> {
        let end = address
            .checked_add(len as u64)
            .ok_or_else(|| anyhow::anyhow!("Address overflow at 0x{:x}", address))?;
        let regions = [
            (Region::Code, CODE_BASE, self.code.len() as u64),
            (Region::Stack, STACK_TOP - STACK_SIZE, STACK_SIZE),
            (Region::Heap, HEAP_BASE, self.heap.len() as u64),
        ];
        for (region, base, size) in regions {
            if address >= base && end <= base + size {
                return Ok((region, (address - base) as usize));
            }
        }
        Err(anyhow::anyhow!("Unmapped address 0x{:x}", address))
    }

    fn region_mut(&mut self, region: Region) -> &mut Vec<u8> {
        match region {
            Region::Code => &mut self.code,
            Region::Stack => &mut self.stack,
            Region::Heap => &mut self.heap,
        }
    }

    fn store(&mut self, address: u64, data: &[u8]) -> Result<()> {
        let (region, offset) = self.locate(address, data.len())?;
        self.region_mut(region)[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn push(&mut self, value: u64) -> Result<()> {
        self.regs.sp -= WORD;
        self.store(self.regs.sp, &value.to_le_bytes())
    }

    fn pop(&mut self) -> Result<u64> {
        let bytes = self.read_memory(self.regs.sp, WORD as usize)?;
        self.regs.sp += WORD;
        let array: [u8; 8] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("Short stack read"))?;
        Ok(u64::from_le_bytes(array))
    }

    /// ヒープに確保してアドレスを返す
    fn alloc(&mut self, bytes: &[u8]) -> u64 {
        let address = HEAP_BASE + self.heap.len() as u64;
        self.heap.extend_from_slice(bytes);
        let aligned = align_up(self.heap.len() as u64, WORD) as usize;
        self.heap.resize(aligned, 0);
        address
    }

    /// データをメモリ上の表現に変換する（参照先はヒープに確保する）
    fn encode(&mut self, data: &SimData) -> Vec<u8> {
        let fat = |ptr: u64, len: u64| [ptr.to_le_bytes(), len.to_le_bytes()].concat();
        match data {
            SimData::Int(v) => v.to_le_bytes().to_vec(),
            SimData::Bool(b) => vec![u8::from(*b)],
            SimData::Str(None) => fat(0, 0),
            SimData::Str(Some(s)) => {
                let ptr = self.alloc(s.as_bytes());
                fat(ptr, s.len() as u64)
            }
            SimData::IntArray(items) => {
                let bytes: Vec<u8> = items.iter().flat_map(|v| v.to_le_bytes()).collect();
                let ptr = self.alloc(&bytes);
                fat(ptr, items.len() as u64)
            }
            SimData::Object(None) => 0u64.to_le_bytes().to_vec(),
            SimData::Object(Some(bytes)) => self.alloc(bytes).to_le_bytes().to_vec(),
        }
    }

    fn stop_with(&mut self, event: DebugEvent) {
        self.pending.push_back(event);
        self.state = SimState::Stopped;
    }

    fn exit_with(&mut self, code: i32) {
        tracing::debug!("Simulated process exited with code {}", code);
        self.pending.push_back(DebugEvent::Exited { code });
        self.state = SimState::Exited;
        self.threads.clear();
    }

    /// PC の命令を1つ実行する。停止または終了したら true
    fn execute(&mut self) -> Result<bool> {
        let pc = self.regs.pc;
        let Some(instr) = self.program.instrs.get(&pc).cloned() else {
            self.pending_fault = Some(SIGSEGV);
            self.stop_with(DebugEvent::Exception {
                tid: MAIN_THREAD,
                signal: SIGSEGV,
                description: format!("Invalid instruction pointer 0x{:x}", pc),
            });
            return Ok(true);
        };

        let (_, offset) = self.locate(pc, 1)?;
        if self.code[offset] == TRAP_BYTE || matches!(instr, Instr::Break) {
            self.regs.pc = pc + BREAK_LEN;
            self.stop_with(DebugEvent::Trap {
                tid: MAIN_THREAD,
                pc: self.regs.pc,
                kind: TrapKind::Software,
            });
            return Ok(true);
        }

        let next = pc + instr.len();
        self.regs.pc = next;
        match instr {
            Instr::PushFrame => self.push(self.regs.fp)?,
            Instr::SetFrame => self.regs.fp = self.regs.sp,
            Instr::Reserve(size) => self.regs.sp -= size,
            Instr::Spill {
                index,
                offset,
                size,
            } => {
                let mut bytes = self.args.get(index).cloned().unwrap_or_default();
                bytes.resize(size as usize, 0);
                self.store(self.regs.fp.wrapping_add_signed(offset), &bytes)?;
            }
            Instr::Leave => {
                self.regs.sp = self.regs.fp;
                self.regs.fp = self.pop()?;
            }
            Instr::Ret => {
                self.regs.pc = self.pop()?;
                if self.regs.pc == 0 {
                    self.exit_with(0);
                    return Ok(true);
                }
            }
            Instr::Nop | Instr::Break => {}
            Instr::Call(target) => {
                self.push(next)?;
                self.regs.pc = target;
            }
            Instr::SetArg(index, data) => {
                let bytes = self.encode(&data);
                if self.args.len() <= index {
                    self.args.resize(index + 1, Vec::new());
                }
                self.args[index] = bytes;
            }
            Instr::Store { offset, data } => {
                let bytes = self.encode(&data);
                self.store(self.regs.fp.wrapping_add_signed(offset), &bytes)?;
            }
            Instr::Print(text) => self.pending.push_back(DebugEvent::Output(text)),
            Instr::Jump(target) => self.regs.pc = target,
            Instr::SpawnThread(tid) => {
                self.threads.push(tid);
                self.pending.push_back(DebugEvent::ThreadCreated { tid });
            }
            Instr::EndThread(tid) => {
                self.threads.retain(|&t| t != tid);
                self.pending.push_back(DebugEvent::ThreadExited { tid });
            }
            Instr::LoadLibrary(index) => {
                if let Some(lib) = self.program.libraries.get(index) {
                    self.pending.push_back(DebugEvent::ModuleLoaded {
                        path: lib.path.clone(),
                        base: SimProgram::library_base(index),
                        size: lib.size,
                    });
                }
            }
            Instr::Fault(signal, description) => {
                self.pending_fault = Some(signal);
                self.stop_with(DebugEvent::Exception {
                    tid: MAIN_THREAD,
                    signal,
                    description,
                });
                return Ok(true);
            }
            Instr::Exit(code) => {
                self.exit_with(code);
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[derive(Debug, Clone, Copy)]
enum Region {
    Code,
    Stack,
    Heap,
}

impl DebugChannel for SimChannel {
    fn pid(&self) -> i32 {
        SIM_PID
    }

    fn poll_event(&mut self, timeout: Duration) -> Result<Option<DebugEvent>> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }

        match self.state {
            SimState::Running => {
                for _ in 0..RUN_SLICE {
                    if self.interrupt_requested {
                        self.interrupt_requested = false;
                        let pc = self.regs.pc;
                        self.stop_with(DebugEvent::Trap {
                            tid: MAIN_THREAD,
                            pc,
                            kind: TrapKind::Interrupt,
                        });
                        break;
                    }
                    if self.execute()? || !self.pending.is_empty() {
                        break;
                    }
                }
            }
            SimState::Stepping => {
                if !self.execute()? {
                    self.stop_with(DebugEvent::Trap {
                        tid: MAIN_THREAD,
                        pc: self.regs.pc,
                        kind: TrapKind::SingleStep,
                    });
                }
            }
            SimState::Stopped | SimState::Exited => {
                if !timeout.is_zero() {
                    std::thread::sleep(timeout);
                }
            }
        }

        Ok(self.pending.pop_front())
    }

    fn resume(&mut self, mode: ResumeMode) -> Result<()> {
        if self.state == SimState::Exited {
            return Err(anyhow::anyhow!("Process {} has exited", SIM_PID));
        }
        if let Some(signal) = self.pending_fault.take() {
            self.exit_with(128 + signal);
            return Ok(());
        }

        self.state = match mode {
            ResumeMode::Continue => SimState::Running,
            ResumeMode::Step(MAIN_THREAD) => SimState::Stepping,
            ResumeMode::Step(tid) => {
                return Err(anyhow::anyhow!("Thread {} cannot be stepped", tid));
            }
        };
        Ok(())
    }

    fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let (region, offset) = self.locate(address, len)?;
        let bytes = match region {
            Region::Code => &self.code,
            Region::Stack => &self.stack,
            Region::Heap => &self.heap,
        };
        Ok(bytes[offset..offset + len].to_vec())
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<()> {
        self.store(address, data)
    }

    fn context(&self, tid: ThreadId) -> Result<ThreadContext> {
        if tid == MAIN_THREAD {
            Ok(self.regs)
        } else if self.threads.contains(&tid) {
            Ok(ThreadContext::default())
        } else {
            Err(anyhow::anyhow!("Unknown thread {}", tid))
        }
    }

    fn set_context(&mut self, tid: ThreadId, context: &ThreadContext) -> Result<()> {
        if tid != MAIN_THREAD {
            return Err(anyhow::anyhow!("Thread {} has no registers", tid));
        }
        self.regs = *context;
        Ok(())
    }

    fn decode(&self, address: u64, code: &[u8]) -> Result<Instruction> {
        let (len, kind) = match code.first() {
            Some(&OP_CALL) => (CALL_LEN, InstructionKind::Call),
            Some(&OP_RET) => (RET_LEN, InstructionKind::Return),
            Some(&OP_PUSH_FP) => (PUSH_FP_LEN, InstructionKind::PushFramePointer),
            Some(&TRAP_BYTE) => (BREAK_LEN, InstructionKind::Other),
            Some(_) => (OP_LEN, InstructionKind::Other),
            None => return Err(anyhow::anyhow!("No code at 0x{:x}", address)),
        };
        Ok(Instruction {
            address,
            len,
            kind,
        })
    }

    fn interrupt(&mut self) -> Result<()> {
        if self.state == SimState::Running {
            self.interrupt_requested = true;
        }
        Ok(())
    }

    fn terminate(&mut self) -> Result<()> {
        if self.state != SimState::Exited {
            self.pending.clear();
            self.exit_with(128 + SIGKILL);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program() -> SimProgram {
        SimProgram::builder("/sim/Program.exe", "Src/Program.cs")
            .function(
                SimFunction::new("Main")
                    .open(5)
                    .line(6, [SimOp::print("Hello\n")])
                    .line(7, [SimOp::SetArg(0, SimData::Int(7)), SimOp::call("Sub")])
                    .close(8),
            )
            .function(
                SimFunction::new("Sub")
                    .arg("i", SimType::Int)
                    .open(10)
                    .line(11, [SimOp::Nop])
                    .close(12),
            )
            .library("/sim/System.dll", 0x1000)
            .build()
            .unwrap()
    }

    fn launch(program: SimProgram) -> Box<dyn DebugChannel> {
        SimLauncher::new(program)
            .launch(&LaunchSpec {
                executable: PathBuf::from("/sim/Program.exe"),
                working_directory: PathBuf::from("/sim"),
                arguments: Vec::new(),
            })
            .unwrap()
    }

    fn next(channel: &mut dyn DebugChannel) -> DebugEvent {
        channel.poll_event(Duration::ZERO).unwrap().unwrap()
    }

    #[test]
    fn test_initial_events_and_run_to_exit() {
        let mut channel = launch(program());
        assert_eq!(next(channel.as_mut()), DebugEvent::ThreadCreated { tid: MAIN_THREAD });
        assert!(matches!(next(channel.as_mut()), DebugEvent::ModuleLoaded { base: CODE_BASE, .. }));
        assert!(matches!(next(channel.as_mut()), DebugEvent::ModuleLoaded { .. }));
        assert!(channel.poll_event(Duration::ZERO).unwrap().is_none());

        channel.resume(ResumeMode::Continue).unwrap();
        assert_eq!(next(channel.as_mut()), DebugEvent::Output("Hello\n".to_string()));
        assert_eq!(next(channel.as_mut()), DebugEvent::Exited { code: 0 });
    }

    #[test]
    fn test_injected_trap_reports_pc_after_trap() {
        let program = program();
        let sub = program.function_address("Sub").unwrap();
        let mut channel = launch(program);
        while channel.poll_event(Duration::ZERO).unwrap().is_some() {}

        channel.write_memory(sub, &[TRAP_BYTE]).unwrap();
        channel.resume(ResumeMode::Continue).unwrap();
        assert_eq!(next(channel.as_mut()), DebugEvent::Output("Hello\n".to_string()));
        assert_eq!(
            next(channel.as_mut()),
            DebugEvent::Trap {
                tid: MAIN_THREAD,
                pc: sub + 1,
                kind: TrapKind::Software
            }
        );

        // 元に戻して再実行すると引数が退避される
        channel.write_memory(sub, &[OP_PUSH_FP]).unwrap();
        let ctx = channel.context(MAIN_THREAD).unwrap();
        channel
            .set_context(MAIN_THREAD, &ThreadContext { pc: sub, ..ctx })
            .unwrap();
        for _ in 0..4 {
            channel.resume(ResumeMode::Step(MAIN_THREAD)).unwrap();
            assert!(matches!(
                next(channel.as_mut()),
                DebugEvent::Trap {
                    kind: TrapKind::SingleStep,
                    ..
                }
            ));
        }
        let ctx = channel.context(MAIN_THREAD).unwrap();
        let bytes = channel.read_memory(ctx.fp - 8, 4).unwrap();
        assert_eq!(i32::from_le_bytes(bytes.try_into().unwrap()), 7);

        // 戻りアドレスは呼び出し元の call の直後
        let ret = channel.read_memory(ctx.fp + 8, 8).unwrap();
        let ret = u64::from_le_bytes(ret.try_into().unwrap());
        let code = channel.read_memory(ret - CALL_LEN, 1).unwrap();
        assert_eq!(channel.decode(ret - CALL_LEN, &code).unwrap().kind, InstructionKind::Call);
    }

    #[test]
    fn test_line_table_matches_layout() {
        let program = program();
        let main = program.table().functions().by_name("Main").unwrap();
        assert!(main.has_line_info);
        let entry = program.table().lines().lookup(main.low).unwrap();
        assert_eq!(entry.segment.start_line, 5);
        let sub = program.table().functions().by_name("Sub").unwrap();
        assert_eq!(sub.arguments[0].location, VariableLocation::FrameOffset(-8));
    }

    #[test]
    fn test_fault_then_resume_kills_process() {
        let program = SimProgram::builder("/sim/Program.exe", "Src/Program.cs")
            .function(SimFunction::new("Main").line(3, [SimOp::Fault(6, "SIGABRT".to_string())]))
            .build()
            .unwrap();
        let mut channel = launch(program);
        while channel.poll_event(Duration::ZERO).unwrap().is_some() {}

        channel.resume(ResumeMode::Continue).unwrap();
        assert!(matches!(next(channel.as_mut()), DebugEvent::Exception { signal: 6, .. }));
        channel.resume(ResumeMode::Continue).unwrap();
        assert_eq!(next(channel.as_mut()), DebugEvent::Exited { code: 134 });
    }

    #[test]
    fn test_unknown_executable() {
        let launcher = SimLauncher::new(program());
        let result = launcher.launch(&LaunchSpec {
            executable: PathBuf::from("/sim/Missing.exe"),
            working_directory: PathBuf::from("/sim"),
            arguments: Vec::new(),
        });
        assert!(result.is_err());
    }
}
