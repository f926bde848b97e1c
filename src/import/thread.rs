//! Per-thread control block shared between a pipeline thread and the monitor.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use tracing::{error, warn};

use crate::error::{ImportError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    Producer,
    Foreman,
    Worker,
}

/// Command the monitor (or an operator) sets on a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Pause = 0,
    Run = 1,
    Stop = 2,
    Abort = 3,
}

impl Command {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Command::Pause,
            1 => Command::Run,
            2 => Command::Stop,
            _ => Command::Abort,
        }
    }
}

/// State a thread reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    Waiting = 0,
    Running = 1,
    Finished = 2,
    Aborted = 3,
    /// Early exit carrying a DN-upgrade verdict.
    Quit = 4,
}

impl ThreadState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ThreadState::Waiting,
            1 => ThreadState::Running,
            2 => ThreadState::Finished,
            3 => ThreadState::Aborted,
            _ => ThreadState::Quit,
        }
    }

    /// Letter shown in the status block.
    pub fn letter(&self) -> char {
        match self {
            ThreadState::Waiting => 'W',
            ThreadState::Running => 'R',
            ThreadState::Finished => 'F',
            ThreadState::Aborted => 'A',
            ThreadState::Quit => 'Q',
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ThreadState::Finished | ThreadState::Aborted | ThreadState::Quit
        )
    }
}

/// Control block of one pipeline thread.
#[derive(Debug)]
pub struct ThreadInfo {
    pub name: String,
    pub kind: ThreadKind,
    command: AtomicU8,
    state: AtomicU8,
    first_id: AtomicU64,
    last_id: AtomicU64,
}

impl ThreadInfo {
    pub fn new(name: impl Into<String>, kind: ThreadKind, first_id: u64) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            kind,
            command: AtomicU8::new(Command::Run as u8),
            state: AtomicU8::new(ThreadState::Waiting as u8),
            first_id: AtomicU64::new(first_id),
            last_id: AtomicU64::new(first_id.saturating_sub(1)),
        })
    }

    pub fn command(&self) -> Command {
        Command::from_u8(self.command.load(Ordering::SeqCst))
    }

    pub fn set_command(&self, command: Command) {
        self.command.store(command as u8, Ordering::SeqCst);
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn first_id(&self) -> u64 {
        self.first_id.load(Ordering::SeqCst)
    }

    pub fn last_id(&self) -> u64 {
        self.last_id.load(Ordering::SeqCst)
    }

    pub fn set_last_id(&self, id: u64) {
        self.last_id.store(id, Ordering::SeqCst);
    }
}

/// Notification a pipeline thread sends when it exits.
#[derive(Debug)]
pub struct ThreadExit {
    pub name: String,
    pub error: Option<String>,
}

/// Spawn a pipeline thread.
///
/// The body's result decides the terminal state: `Ok` keeps a `Quit` state
/// or becomes `Finished`; `Aborted` becomes `Aborted` quietly; any other
/// error is logged, handed to `on_fatal` (which raises the job-wide
/// abort), and becomes `Aborted`.
pub fn spawn<F>(
    info: Arc<ThreadInfo>,
    exits: Sender<ThreadExit>,
    on_fatal: impl FnOnce(ImportError) + Send + 'static,
    body: F,
) -> Result<JoinHandle<()>>
where
    F: FnOnce(&ThreadInfo) -> Result<()> + Send + 'static,
{
    let thread_name = info.name.clone();
    std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let result = body(&info);
            let error = match result {
                Ok(()) => {
                    if info.state() != ThreadState::Quit {
                        info.set_state(ThreadState::Finished);
                    }
                    None
                }
                Err(ImportError::Aborted) => {
                    warn!(thread = %info.name, "thread aborted");
                    info.set_state(ThreadState::Aborted);
                    None
                }
                Err(e) => {
                    error!(thread = %info.name, error = %e, "thread failed");
                    let message = e.to_string();
                    on_fatal(e);
                    info.set_state(ThreadState::Aborted);
                    Some(message)
                }
            };
            let _ = exits.send(ThreadExit {
                name: info.name.clone(),
                error,
            });
        })
        .map_err(|e| ImportError::ThreadSpawn(thread_name, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_and_state_round_trip() {
        let info = ThreadInfo::new("cn", ThreadKind::Worker, 5);
        assert_eq!(info.command(), Command::Run);
        assert_eq!(info.state(), ThreadState::Waiting);
        assert_eq!(info.last_id(), 4);
        info.set_command(Command::Pause);
        assert_eq!(info.command(), Command::Pause);
        info.set_state(ThreadState::Quit);
        assert!(info.state().is_terminal());
        assert_eq!(info.state().letter(), 'Q');
    }

    #[test]
    fn test_spawn_reports_terminal_states() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let ok = ThreadInfo::new("ok", ThreadKind::Worker, 1);
        let failed = ThreadInfo::new("failed", ThreadKind::Worker, 1);
        let fatal = Arc::new(std::sync::Mutex::new(None));

        let slot = Arc::clone(&fatal);
        let h1 = spawn(Arc::clone(&ok), tx.clone(), |_| {}, |_| Ok(())).unwrap();
        let h2 = spawn(
            Arc::clone(&failed),
            tx,
            move |e| *slot.lock().unwrap() = Some(e),
            |_| Err(ImportError::Config("boom".to_string())),
        )
        .unwrap();
        h1.join().unwrap();
        h2.join().unwrap();

        assert_eq!(ok.state(), ThreadState::Finished);
        assert_eq!(failed.state(), ThreadState::Aborted);
        assert!(matches!(
            fatal.lock().unwrap().take(),
            Some(ImportError::Config(ref m)) if m == "boom"
        ));
        let exits: Vec<ThreadExit> = rx.try_iter().collect();
        assert_eq!(exits.len(), 2);
        assert!(exits.iter().any(|e| e.name == "failed" && e.error.is_some()));
    }
}
