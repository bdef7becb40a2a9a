//! PTY Worker (spec §4.3): one dedicated blocking-reader OS thread per PTY.
//!
//! Generalizes `ProcessManager::spawn_shell`'s reader-thread
//! idiom (`core::process_manager`) from "decode UTF-8, forward to a Tauri
//! event" to "feed the emulator, synchronously flush any auto-response,
//! publish the new screen, and nudge the frame scheduler" — the worker
//! owns authoritative screen state itself rather than handing raw bytes
//! to a frontend renderer.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use arc_swap::ArcSwap;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::{Error, Result};
use crate::pty::emulator::{Emulator, Screen, VteEmulator};
use crate::scheduler::FrameSignal;
use crate::session::PtyId;

/// Emitted by a worker's reader thread to the server's event loop. Child
/// exit status arrives separately from the process supervisor (§4.6), which
/// owns the reactor's `waitpid` capability; this only reports that the PTY
/// master itself stopped producing output.
#[derive(Debug, Clone)]
pub enum PtyEvent {
    /// `read` returned `0` or an unrecoverable error: orderly shutdown per
    /// §4.3's "Failure semantics".
    IoClosed { pty: PtyId },
}

/// Owns one PTY's master fd, its dedicated reader thread, and the
/// authoritative [`Screen`] snapshot readers take without blocking the
/// writer (§4.3 "Screen hand-off", §5 "double-buffered hand-off").
///
/// The emulator itself lives behind a plain `Mutex` rather than only inside
/// the reader thread: `resize` needs to reach it too (PTY dimensions and
/// emulator dimensions must never disagree), so both the reader thread and
/// any caller of `resize` serialize through the same lock. Only the
/// infrequent writer — one `feed` per read, one `resize` per client resize
/// event — ever takes it; readers of the *published* screen go through the
/// lock-free `ArcSwap` below instead.
pub struct PtyWorker {
    pub pty: PtyId,
    writer: Mutex<Box<dyn Write + Send>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    #[allow(dead_code)]
    child: Mutex<Box<dyn Child + Send + Sync>>,
    emulator: Mutex<Box<dyn Emulator>>,
    pub child_pid: i32,
    #[cfg(unix)]
    pub pgid: i32,
    screen: ArcSwap<Screen>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PtyWorker {
    /// Spawns a shell in a new PTY and its dedicated reader thread.
    /// `frame_signal` is fired (non-blocking) after any emulator-visible
    /// mutation; `events` carries [`PtyEvent::IoClosed`] back to the server.
    pub fn spawn(
        pty: PtyId,
        shell: &str,
        cwd: Option<&str>,
        env: &[(String, String)],
        cols: u16,
        rows: u16,
        frame_signal: FrameSignal,
        events: UnboundedSender<PtyEvent>,
    ) -> Result<Arc<Self>> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 })
            .map_err(|e| Error::resource_exhausted(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(shell);
        #[cfg(unix)]
        cmd.arg("-l");
        if let Some(dir) = cwd {
            cmd.cwd(dir);
        }
        for (k, v) in env {
            cmd.env(k, v);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| Error::resource_exhausted(format!("failed to spawn shell: {e}")))?;
        let child_pid = child
            .process_id()
            .map(|pid| pid as i32)
            .ok_or_else(|| Error::resource_exhausted("could not obtain child pid"))?;

        #[cfg(unix)]
        let pgid = pair.master.process_group_leader().unwrap_or(child_pid);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| Error::resource_exhausted(format!("failed to take PTY writer: {e}")))?;
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| Error::resource_exhausted(format!("failed to clone PTY reader: {e}")))?;

        drop(pair.slave);

        let worker = Arc::new(Self {
            pty,
            writer: Mutex::new(writer),
            master: Mutex::new(pair.master),
            child: Mutex::new(child),
            emulator: Mutex::new(Box::new(VteEmulator::new(cols, rows)) as Box<dyn Emulator>),
            child_pid,
            #[cfg(unix)]
            pgid,
            screen: ArcSwap::from_pointee(Screen::new(cols, rows)),
            reader_handle: Mutex::new(None),
        });

        let reader_target = Arc::clone(&worker);
        let handle = std::thread::Builder::new()
            .name(format!("pty-reader-{}", pty.0))
            .spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            let (changed, response, snapshot) = {
                                let mut emulator = reader_target.emulator.lock().unwrap();
                                let result = emulator.feed(&buf[..n]);
                                let snapshot = result.changed.then(|| emulator.snapshot());
                                (result.changed, result.auto_response, snapshot)
                            };
                            if let Some(response) = response {
                                if let Ok(mut w) = reader_target.writer.lock() {
                                    let _ = w.write_all(&response);
                                    let _ = w.flush();
                                }
                            }
                            if changed {
                                if let Some(snapshot) = snapshot {
                                    reader_target.screen.store(Arc::new(snapshot));
                                }
                                frame_signal.signal();
                            }
                        }
                        Err(e) => {
                            #[cfg(unix)]
                            {
                                let raw = e.raw_os_error().unwrap_or(0);
                                if raw == libc::EAGAIN || raw == libc::EINTR {
                                    continue;
                                }
                            }
                            log::debug!("pty {} reader error: {e}", pty.0);
                            break;
                        }
                    }
                }
                let _ = events.send(PtyEvent::IoClosed { pty });
                log::debug!("pty {} reader exited", pty.0);
            })
            .map_err(|e| Error::resource_exhausted(format!("failed to spawn reader thread: {e}")))?;

        *worker.reader_handle.lock().unwrap() = Some(handle);
        Ok(worker)
    }

    /// Routes client input to the PTY master. Spec §4.3 models this as a
    /// lock-protected queue the worker drains; with a direct writer mutex
    /// the queue collapses to "whichever caller holds the lock writes
    /// immediately," which is observably the same per-PTY ordering
    /// guarantee (§5) without a second hand-off thread.
    pub fn write_input(&self, data: &[u8]) -> Result<()> {
        let mut w = self.writer.lock().map_err(|_| Error::invalid_state("writer lock poisoned"))?;
        w.write_all(data).map_err(|e| Error::transient_io(e.to_string()))?;
        w.flush().map_err(|e| Error::transient_io(e.to_string()))?;
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let master = self.master.lock().map_err(|_| Error::invalid_state("master lock poisoned"))?;
        master
            .resize(PtySize { cols, rows, pixel_width: 0, pixel_height: 0 })
            .map_err(|e| Error::invalid_state(format!("resize failed: {e}")))?;
        drop(master);

        let mut emulator = self.emulator.lock().map_err(|_| Error::invalid_state("emulator lock poisoned"))?;
        emulator.resize(cols, rows);
        self.screen.store(Arc::new(emulator.snapshot()));
        Ok(())
    }

    /// Lock-free read of the current screen; never blocks the writer
    /// thread (§4.3, §5).
    pub fn snapshot(&self) -> Arc<Screen> {
        self.screen.load_full()
    }

    /// Sends SIGTERM to the process group, waits briefly, escalates to
    /// SIGKILL — identical grace-period escalation to
    /// `ProcessManager::kill_session`.
    pub async fn terminate(&self) {
        #[cfg(unix)]
        {
            let pgid = self.pgid;
            let pid = self.child_pid;
            unsafe { libc::kill(-pgid, libc::SIGTERM) };
            let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(3);
            while tokio::time::Instant::now() < deadline {
                if unsafe { libc::kill(pid, 0) } != 0 {
                    break;
                }
                tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            }
            if unsafe { libc::kill(pid, 0) } == 0 {
                unsafe { libc::kill(-pgid, libc::SIGKILL) };
            }
        }
        let handle = self.reader_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }
}
