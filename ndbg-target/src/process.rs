//! ptrace によるプロセス制御
//!
//! デバッグ対象を fork / exec で起動し、すべてのスレッドを止めてから停止を報告する
//! all-stop 方式でイベントを [`DebugEvent`] に変換します。

use crate::memory::{module_images, Memory, ModuleImage};
use crate::registers::Registers;
use crate::thread::{Thread, ThreadState};
use crate::{
    disasm, DebugChannel, DebugEvent, Instruction, LaunchSpec, Launcher, Result, ResumeMode,
    ThreadContext, ThreadId, TrapKind,
};
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::CString;
use std::fs::File;
use std::io::Read as _;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt as _;
use std::time::{Duration, Instant};

/// siginfo の si_code（SIGTRAP の発生源）
const SI_USER: i32 = 0;
const SI_KERNEL: i32 = 0x80;
const SI_TKILL: i32 = -6;
const TRAP_BRKPT: i32 = 1;
const TRAP_TRACE: i32 = 2;

/// 停止を報告せずにそのまま配送するシグナル
const PASS_THROUGH_SIGNALS: &[Signal] = &[
    Signal::SIGCHLD,
    Signal::SIGWINCH,
    Signal::SIGALRM,
    Signal::SIGIO,
    Signal::SIGURG,
    Signal::SIGPROF,
];

/// waitpid をポーリングする間隔
const WAIT_SLICE: Duration = Duration::from_millis(5);

/// ptrace でデバッグ対象を起動するランチャー
#[derive(Debug, Clone, Copy, Default)]
pub struct PtraceLauncher;

impl Launcher for PtraceLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn DebugChannel>> {
        Ok(Box::new(PtraceChannel::spawn(spec)?))
    }
}

/// ptrace でトレースしているデバッグ対象
pub struct PtraceChannel {
    pid: Pid,
    memory: Memory,
    threads: HashMap<Pid, Thread>,
    /// 起動直後の SIGSTOP をまだ受け取っていない新しいスレッド
    starting: HashSet<Pid>,
    /// 停止を揃えている間に届いた、後で処理する停止
    deferred: VecDeque<WaitStatus>,
    pending: VecDeque<DebugEvent>,
    /// 標準出力のパイプ（読み取り側、ノンブロッキング）
    stdout: Option<File>,
    /// UTF-8 の途中で切れたバイト
    partial_output: Vec<u8>,
    modules: Vec<ModuleImage>,
    stepping: Option<Pid>,
    interrupt_requested: bool,
    exited: bool,
}

impl PtraceChannel {
    /// 実行可能ファイルを起動してデバッグ対象プロセスを開始する
    ///
    /// 新しいプロセスをforkして起動し、PTRACE_TRACEMEを設定してから
    /// 指定された実行可能ファイルをexecveで実行します。
    /// 標準出力はパイプに繋ぎ替え、exec 直後の停止状態で返します。
    pub fn spawn(spec: &LaunchSpec) -> Result<Self> {
        use nix::errno::Errno;
        use nix::fcntl::OFlag;
        use nix::unistd::{chdir, dup2, execve, fork, pipe2, write, ForkResult};

        if !spec.executable.is_file() {
            return Err(anyhow::anyhow!(
                "Executable not found: {}",
                spec.executable.display()
            ));
        }
        if !spec.working_directory.is_dir() {
            return Err(anyhow::anyhow!(
                "Working directory not found: {}",
                spec.working_directory.display()
            ));
        }

        // fork 後の子プロセスではメモリを確保しないように、先にすべて用意しておく
        let program_path = spec
            .executable
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid program path"))?;
        let program_cstring = CString::new(program_path)?;
        let cwd = CString::new(spec.working_directory.as_os_str().as_bytes())?;

        let mut cstring_args = vec![program_cstring.clone()];
        for arg in &spec.arguments {
            cstring_args.push(CString::new(arg.as_str())?);
        }

        // 環境変数は親プロセスから継承
        let env: Vec<CString> = std::env::vars()
            .map(|(key, val)| {
                CString::new(format!("{}={}", key, val)).map_err(anyhow::Error::from)
            })
            .collect::<Result<Vec<_>>>()?;

        let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC)?;
        // exec に成功すると閉じる。失敗した場合は子プロセスが errno を書く
        let (error_read, error_write) = pipe2(OFlag::O_CLOEXEC)?;

        match unsafe { fork()? } {
            ForkResult::Child => {
                let prepared = ptrace::traceme()
                    .and_then(|()| chdir(cwd.as_c_str()))
                    .and_then(|()| dup2(write_end.as_raw_fd(), nix::libc::STDOUT_FILENO).map(drop));
                let errno = match prepared {
                    Ok(()) => match execve(&program_cstring, &cstring_args, &env) {
                        Ok(never) => match never {},
                        Err(errno) => errno,
                    },
                    Err(errno) => errno,
                };
                let _ = write(&error_write, &(errno as i32).to_ne_bytes());
                unsafe { nix::libc::_exit(127) }
            }
            ForkResult::Parent { child } => {
                drop(write_end);
                drop(error_write);

                let status = waitpid(child, None)?;
                let mut errno = [0u8; 4];
                if File::from(error_read).read_exact(&mut errno).is_ok() {
                    let errno = Errno::from_raw(i32::from_ne_bytes(errno));
                    return Err(anyhow::anyhow!(
                        "Failed to start {} in {}: {}",
                        spec.executable.display(),
                        spec.working_directory.display(),
                        errno.desc()
                    ));
                }

                match status {
                    WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
                    WaitStatus::Exited(_, code) => {
                        return Err(anyhow::anyhow!(
                            "Failed to execute {} (exit code {})",
                            spec.executable.display(),
                            code
                        ));
                    }
                    status => {
                        return Err(anyhow::anyhow!(
                            "Unexpected wait status after execve: {:?}",
                            status
                        ));
                    }
                }

                ptrace::setoptions(
                    child,
                    ptrace::Options::PTRACE_O_TRACECLONE | ptrace::Options::PTRACE_O_EXITKILL,
                )?;

                let stdout = File::from(read_end);
                nix::fcntl::fcntl(
                    stdout.as_raw_fd(),
                    nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
                )?;

                tracing::info!("Spawned {} as pid {}", spec.executable.display(), child);

                let mut channel = Self {
                    pid: child,
                    memory: Memory::new(child.as_raw()),
                    threads: HashMap::new(),
                    starting: HashSet::new(),
                    deferred: VecDeque::new(),
                    pending: VecDeque::new(),
                    stdout: Some(stdout),
                    partial_output: Vec::new(),
                    modules: Vec::new(),
                    stepping: None,
                    interrupt_requested: false,
                    exited: false,
                };
                channel
                    .threads
                    .insert(child, Thread::new(child.as_raw(), ThreadState::Stopped));
                channel.pending.push_back(DebugEvent::ThreadCreated {
                    tid: child.as_raw(),
                });
                channel.rescan_modules()?;
                Ok(channel)
            }
        }
    }

    /// 1つの wait ステータスを処理する
    fn handle_status(&mut self, status: WaitStatus) -> Result<()> {
        match status {
            WaitStatus::Exited(pid, code) => self.on_exit(pid, code),
            WaitStatus::Signaled(pid, signal, _) => self.on_exit(pid, 128 + signal as i32),
            WaitStatus::PtraceEvent(pid, _, event) => {
                if event == ptrace::Event::PTRACE_EVENT_CLONE as i32 {
                    let new_tid = Pid::from_raw(ptrace::getevent(pid)? as i32);
                    self.on_thread_created(new_tid);
                }
                self.resume_thread(pid, None)
            }
            WaitStatus::Stopped(pid, signal) => self.on_signal_stop(pid, signal),
            status => {
                tracing::debug!("Ignoring wait status {:?}", status);
                Ok(())
            }
        }
    }

    fn on_exit(&mut self, pid: Pid, code: i32) -> Result<()> {
        self.threads.remove(&pid);
        if pid != self.pid {
            self.pending
                .push_back(DebugEvent::ThreadExited { tid: pid.as_raw() });
            return Ok(());
        }

        tracing::info!("Process {} exited with code {}", pid, code);
        self.drain_output();
        self.flush_partial_output();
        self.exited = true;
        self.stdout = None;
        self.threads.clear();
        self.pending.push_back(DebugEvent::Exited { code });
        Ok(())
    }

    fn on_thread_created(&mut self, tid: Pid) {
        if self.threads.contains_key(&tid) {
            return;
        }
        tracing::debug!("New thread {}", tid);
        // 新しいスレッドは SIGSTOP で停止した状態で始まる
        self.threads
            .insert(tid, Thread::new(tid.as_raw(), ThreadState::StopRequested));
        self.starting.insert(tid);
        self.pending
            .push_back(DebugEvent::ThreadCreated { tid: tid.as_raw() });
    }

    fn on_signal_stop(&mut self, pid: Pid, signal: Signal) -> Result<()> {
        if let Some(thread) = self.threads.get_mut(&pid) {
            thread.set_state(ThreadState::Stopped);
        }

        if signal == Signal::SIGSTOP {
            if self.starting.remove(&pid) {
                return self.resume_thread(pid, None);
            }
            if !self.threads.contains_key(&pid) {
                // clone イベントより先に新しいスレッドの停止が届いた
                self.on_thread_created(pid);
                self.starting.remove(&pid);
                return self.resume_thread(pid, None);
            }
            if self.interrupt_requested {
                self.interrupt_requested = false;
                return self.report_stop(pid, |tid, pc| DebugEvent::Trap {
                    tid,
                    pc,
                    kind: TrapKind::Interrupt,
                });
            }
            // 外部から送られた SIGSTOP は無視する
            return self.resume_thread(pid, None);
        }

        if signal == Signal::SIGTRAP {
            let info = ptrace::getsiginfo(pid)?;
            let kind = match info.si_code {
                TRAP_TRACE => TrapKind::SingleStep,
                SI_KERNEL | TRAP_BRKPT => TrapKind::Software,
                SI_USER | SI_TKILL => TrapKind::Break,
                code => {
                    tracing::debug!("SIGTRAP with si_code {} treated as break", code);
                    TrapKind::Break
                }
            };
            if self.stepping == Some(pid) {
                self.stepping = None;
            }
            return self.report_stop(pid, move |tid, pc| DebugEvent::Trap { tid, pc, kind });
        }

        if PASS_THROUGH_SIGNALS.contains(&signal) {
            tracing::debug!("Passing {:?} to thread {}", signal, pid);
            return self.resume_thread(pid, Some(signal));
        }

        if let Some(thread) = self.threads.get_mut(&pid) {
            thread.set_pending_signal(signal);
        }
        self.stepping = None;
        self.report_stop(pid, move |tid, _| DebugEvent::Exception {
            tid,
            signal: signal as i32,
            description: format!("{:?}", signal),
        })
    }

    /// 停止を揃えてから停止イベントを報告する
    fn report_stop<F>(&mut self, pid: Pid, event: F) -> Result<()>
    where
        F: FnOnce(ThreadId, u64) -> DebugEvent,
    {
        self.stop_all_except(pid)?;
        self.rescan_modules()?;
        self.drain_output();

        let pc = Registers::new(pid.as_raw()).context()?.pc;
        self.pending.push_back(event(pid.as_raw(), pc));
        Ok(())
    }

    /// 他のスレッドに SIGSTOP を送り、停止するまで待つ
    fn stop_all_except(&mut self, pid: Pid) -> Result<()> {
        let running: Vec<Pid> = self
            .threads
            .iter()
            .filter(|(tid, t)| **tid != pid && t.state() == ThreadState::Running)
            .map(|(tid, _)| *tid)
            .collect();

        for tid in &running {
            let ret = unsafe {
                nix::libc::syscall(
                    nix::libc::SYS_tgkill,
                    self.pid.as_raw(),
                    tid.as_raw(),
                    nix::libc::SIGSTOP,
                )
            };
            if ret != 0 {
                tracing::debug!("tgkill failed for thread {}", tid);
                continue;
            }
            if let Some(thread) = self.threads.get_mut(tid) {
                thread.set_state(ThreadState::StopRequested);
            }
        }

        for tid in running {
            loop {
                match waitpid(tid, Some(WaitPidFlag::__WALL))? {
                    WaitStatus::Stopped(_, Signal::SIGSTOP) => {
                        if let Some(thread) = self.threads.get_mut(&tid) {
                            thread.set_state(ThreadState::Stopped);
                        }
                        break;
                    }
                    status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => {
                        self.deferred.push_back(status);
                        break;
                    }
                    status => {
                        // SIGSTOP より先に別の停止が届いた。SIGSTOP は後で無視する
                        if let Some(thread) = self.threads.get_mut(&tid) {
                            thread.set_state(ThreadState::Stopped);
                        }
                        self.starting.insert(tid);
                        self.deferred.push_back(status);
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn resume_thread(&mut self, pid: Pid, signal: Option<Signal>) -> Result<()> {
        if self.stepping == Some(pid) {
            ptrace::step(pid, signal)?;
        } else {
            ptrace::cont(pid, signal)?;
        }
        if let Some(thread) = self.threads.get_mut(&pid) {
            thread.set_state(ThreadState::Running);
        }
        Ok(())
    }

    /// /proc/pid/maps を読み直してモジュールの増減を通知する
    fn rescan_modules(&mut self) -> Result<()> {
        let images = module_images(&self.memory.mappings()?);

        for old in &self.modules {
            if !images.iter().any(|m| m.path == old.path && m.base == old.base) {
                self.pending
                    .push_back(DebugEvent::ModuleUnloaded { base: old.base });
            }
        }
        for image in &images {
            if !self
                .modules
                .iter()
                .any(|m| m.path == image.path && m.base == image.base)
            {
                tracing::debug!("Module {} at 0x{:x}", image.path.display(), image.base);
                self.pending.push_back(DebugEvent::ModuleLoaded {
                    path: image.path.clone(),
                    base: image.base,
                    size: image.size,
                });
            }
        }

        self.modules = images;
        Ok(())
    }

    /// パイプに溜まっている出力を読み出す
    fn drain_output(&mut self) {
        let Some(stdout) = self.stdout.as_mut() else {
            return;
        };

        let mut buf = [0u8; 4096];
        loop {
            match stdout.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.partial_output.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!("Failed to read debuggee output: {}", e);
                    break;
                }
            }
        }

        if self.partial_output.is_empty() {
            return;
        }

        // マルチバイト文字の途中で切れていたら残りを次回に回す
        let valid = match std::str::from_utf8(&self.partial_output) {
            Ok(_) => self.partial_output.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.partial_output.len(),
        };
        if valid == 0 {
            return;
        }
        let rest = self.partial_output.split_off(valid);
        let text = String::from_utf8_lossy(&self.partial_output).into_owned();
        self.partial_output = rest;
        self.pending.push_back(DebugEvent::Output(text));
    }

    fn flush_partial_output(&mut self) {
        if !self.partial_output.is_empty() {
            let text = String::from_utf8_lossy(&self.partial_output).into_owned();
            self.partial_output.clear();
            self.pending.push_back(DebugEvent::Output(text));
        }
    }

    fn any_thread(&self) -> Result<Pid> {
        if self.threads.contains_key(&self.pid) {
            return Ok(self.pid);
        }
        self.threads
            .keys()
            .next()
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Process {} has no threads", self.pid))
    }
}

impl DebugChannel for PtraceChannel {
    fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    fn poll_event(&mut self, timeout: Duration) -> Result<Option<DebugEvent>> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            if let Some(status) = self.deferred.pop_front() {
                self.handle_status(status)?;
                continue;
            }
            if self.exited {
                return Ok(None);
            }

            self.drain_output();
            if !self.pending.is_empty() {
                continue;
            }

            match waitpid(
                Pid::from_raw(-1),
                Some(WaitPidFlag::__WALL | WaitPidFlag::WNOHANG),
            ) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(status) => {
                    self.handle_status(status)?;
                    continue;
                }
                Err(nix::errno::Errno::ECHILD) => return Ok(None),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(WAIT_SLICE.min(deadline - now));
        }
    }

    fn resume(&mut self, mode: ResumeMode) -> Result<()> {
        if self.exited {
            return Err(anyhow::anyhow!("Process {} has exited", self.pid));
        }

        match mode {
            ResumeMode::Step(tid) => {
                let pid = Pid::from_raw(tid);
                let thread = self
                    .threads
                    .get_mut(&pid)
                    .ok_or_else(|| anyhow::anyhow!("Unknown thread {}", tid))?;
                let signal = thread.take_pending_signal();
                self.stepping = Some(pid);
                self.resume_thread(pid, signal)
            }
            ResumeMode::Continue => {
                self.stepping = None;
                // 保留中の停止を持つスレッドは止めたままにする（次の poll で報告される）
                let held: HashSet<Pid> = self.deferred.iter().filter_map(|s| s.pid()).collect();
                let stopped: Vec<Pid> = self
                    .threads
                    .iter()
                    .filter(|(tid, t)| t.state() == ThreadState::Stopped && !held.contains(tid))
                    .map(|(tid, _)| *tid)
                    .collect();
                for pid in stopped {
                    let signal = self
                        .threads
                        .get_mut(&pid)
                        .and_then(|t| t.take_pending_signal());
                    self.resume_thread(pid, signal)?;
                }
                Ok(())
            }
        }
    }

    fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        self.memory.read(address, len)
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<()> {
        self.memory.write(address, data)
    }

    fn context(&self, tid: ThreadId) -> Result<ThreadContext> {
        Registers::new(tid).context()
    }

    fn set_context(&mut self, tid: ThreadId, context: &ThreadContext) -> Result<()> {
        Registers::new(tid).set_context(context)
    }

    fn decode(&self, address: u64, code: &[u8]) -> Result<Instruction> {
        disasm::classify(code, address)
    }

    fn interrupt(&mut self) -> Result<()> {
        if self.exited {
            return Ok(());
        }
        let target = self.any_thread()?;
        self.interrupt_requested = true;
        let ret = unsafe {
            nix::libc::syscall(
                nix::libc::SYS_tgkill,
                self.pid.as_raw(),
                target.as_raw(),
                nix::libc::SIGSTOP,
            )
        };
        if ret != 0 {
            return Err(anyhow::anyhow!(
                "Failed to interrupt {}: {}",
                self.pid,
                std::io::Error::last_os_error()
            ));
        }
        Ok(())
    }

    fn terminate(&mut self) -> Result<()> {
        if self.exited {
            return Ok(());
        }
        tracing::info!("Killing process {}", self.pid);
        nix::sys::signal::kill(self.pid, Signal::SIGKILL)?;
        Ok(())
    }
}

impl Drop for PtraceChannel {
    fn drop(&mut self) {
        if !self.exited {
            let _ = nix::sys::signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::Permissions;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    #[test]
    fn test_spawn_rejects_missing_working_directory() {
        let spec = LaunchSpec {
            executable: PathBuf::from("/bin/pwd"),
            working_directory: PathBuf::from("/definitely/not/here"),
            arguments: Vec::new(),
        };
        let error = PtraceChannel::spawn(&spec).err().unwrap();
        assert!(error.to_string().contains("Working directory"), "{}", error);
    }

    #[test]
    fn test_spawn_rejects_missing_executable() {
        let spec = LaunchSpec {
            executable: PathBuf::from("/definitely/not/here/testee"),
            working_directory: PathBuf::from("/"),
            arguments: Vec::new(),
        };
        assert!(PtraceChannel::spawn(&spec).is_err());
    }

    #[test]
    #[ignore]
    fn test_spawn_reports_unenterable_working_directory() {
        // root は権限を無視するので、一般ユーザーで実行する
        let dir = std::env::temp_dir().join(format!("ndbg-locked-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::set_permissions(&dir, Permissions::from_mode(0o000)).unwrap();
        let spec = LaunchSpec {
            executable: PathBuf::from("/bin/pwd"),
            working_directory: dir.clone(),
            arguments: Vec::new(),
        };
        let result = PtraceChannel::spawn(&spec);
        std::fs::set_permissions(&dir, Permissions::from_mode(0o755)).unwrap();
        std::fs::remove_dir(&dir).unwrap();

        let error = result.err().unwrap();
        assert!(error.to_string().contains("Failed to start"), "{}", error);
    }
}
