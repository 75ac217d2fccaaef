//! Host runtime interface: argv, standard streams, the monotonic clock, and
//! the optional terminal capability.
//!
//! The VM never touches the process environment directly; everything flows
//! through a `Host` so embedders can substitute a scripted host. `MockHost`
//! is that substitute: captured streams, scripted stdin, and a virtual clock
//! that jumps forward on idle waits so timer tests run instantly.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, BufRead, Read, Write};
use std::rc::Rc;
use std::time::Instant;

/// One terminal input event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermEvent {
    Key(u8),
    Resize(u16, u16),
    Eof,
}

/// Optional terminal capability. All operations are fallible; callers map
/// failures to `Erring` values.
pub trait Terminal {
    fn set_raw_mode(&mut self, enable: bool) -> io::Result<()>;
    fn enter_alt_screen(&mut self) -> io::Result<()>;
    fn exit_alt_screen(&mut self) -> io::Result<()>;
    fn hide_cursor(&mut self) -> io::Result<()>;
    fn show_cursor(&mut self) -> io::Result<()>;
    /// (columns, rows)
    fn size(&mut self) -> io::Result<(u16, u16)>;
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
    fn read_event(&mut self) -> io::Result<TermEvent>;
}

pub trait Host {
    fn argv(&self) -> Vec<String>;
    fn stdin_read_all(&mut self) -> io::Result<Vec<u8>>;
    /// `None` at end of input. The trailing newline is stripped.
    fn stdin_read_line(&mut self) -> io::Result<Option<String>>;
    fn write_stdout(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn write_stderr(&mut self, bytes: &[u8]) -> io::Result<()>;
    /// Nanoseconds on a monotonic clock.
    fn monotonic_now(&mut self) -> u64;
    /// Idle until the clock reaches `deadline_ns` (or an external event on a
    /// real host). The mock host jumps its clock instead of sleeping.
    fn wait_until(&mut self, deadline_ns: u64);
    fn terminal(&mut self) -> Option<&mut dyn Terminal>;
}

// ---------------------------------------------------------------------------
// OS host
// ---------------------------------------------------------------------------

/// The real host: process argv, OS streams, `Instant`-based clock, and a
/// termios-backed terminal when stdin and stdout are both TTYs.
pub struct OsHost {
    start: Instant,
    term: Option<OsTerminal>,
}

impl OsHost {
    pub fn new() -> Self {
        let is_tty = unsafe { libc::isatty(0) == 1 && libc::isatty(1) == 1 };
        OsHost {
            start: Instant::now(),
            term: is_tty.then(OsTerminal::new),
        }
    }
}

impl Default for OsHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for OsHost {
    fn argv(&self) -> Vec<String> {
        std::env::args().collect()
    }

    fn stdin_read_all(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        io::stdin().read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn stdin_read_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        let n = io::stdin().lock().read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }
        Ok(Some(line))
    }

    fn write_stdout(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut out = io::stdout().lock();
        out.write_all(bytes)?;
        out.flush()
    }

    fn write_stderr(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut out = io::stderr().lock();
        out.write_all(bytes)?;
        out.flush()
    }

    fn monotonic_now(&mut self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }

    fn wait_until(&mut self, deadline_ns: u64) {
        let now = self.monotonic_now();
        if deadline_ns > now {
            std::thread::sleep(std::time::Duration::from_nanos(deadline_ns - now));
        }
    }

    fn terminal(&mut self) -> Option<&mut dyn Terminal> {
        self.term.as_mut().map(|t| t as &mut dyn Terminal)
    }
}

/// Raw-mode state for the controlling terminal. The saved termios is
/// restored when raw mode is switched off or the host drops, so a panicking
/// program does not leave the terminal unusable.
struct OsTerminal {
    saved: Option<libc::termios>,
}

impl OsTerminal {
    fn new() -> Self {
        OsTerminal { saved: None }
    }

    fn write_escape(&mut self, seq: &[u8]) -> io::Result<()> {
        let mut out = io::stdout().lock();
        out.write_all(seq)?;
        out.flush()
    }
}

impl Drop for OsTerminal {
    fn drop(&mut self) {
        let _ = self.set_raw_mode(false);
    }
}

impl Terminal for OsTerminal {
    fn set_raw_mode(&mut self, enable: bool) -> io::Result<()> {
        if enable {
            if self.saved.is_some() {
                return Ok(());
            }
            let mut termios = unsafe { std::mem::zeroed::<libc::termios>() };
            if unsafe { libc::tcgetattr(0, &mut termios) } != 0 {
                return Err(io::Error::last_os_error());
            }
            let saved = termios;
            unsafe { libc::cfmakeraw(&mut termios) };
            if unsafe { libc::tcsetattr(0, libc::TCSANOW, &termios) } != 0 {
                return Err(io::Error::last_os_error());
            }
            self.saved = Some(saved);
        } else if let Some(saved) = self.saved.take() {
            if unsafe { libc::tcsetattr(0, libc::TCSANOW, &saved) } != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    fn enter_alt_screen(&mut self) -> io::Result<()> {
        self.write_escape(b"\x1b[?1049h")
    }

    fn exit_alt_screen(&mut self) -> io::Result<()> {
        self.write_escape(b"\x1b[?1049l")
    }

    fn hide_cursor(&mut self) -> io::Result<()> {
        self.write_escape(b"\x1b[?25l")
    }

    fn show_cursor(&mut self) -> io::Result<()> {
        self.write_escape(b"\x1b[?25h")
    }

    fn size(&mut self) -> io::Result<(u16, u16)> {
        let mut ws = unsafe { std::mem::zeroed::<libc::winsize>() };
        if unsafe { libc::ioctl(1, libc::TIOCGWINSZ, &mut ws) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((ws.ws_col, ws.ws_row))
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut out = io::stdout().lock();
        out.write_all(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().lock().flush()?;
        unsafe { libc::fsync(1) };
        Ok(())
    }

    fn read_event(&mut self) -> io::Result<TermEvent> {
        let mut byte = [0u8; 1];
        let n = unsafe { libc::read(0, byte.as_mut_ptr() as *mut libc::c_void, 1) };
        match n {
            0 => Ok(TermEvent::Eof),
            1 => Ok(TermEvent::Key(byte[0])),
            _ => Err(io::Error::last_os_error()),
        }
    }
}

// ---------------------------------------------------------------------------
// Mock host
// ---------------------------------------------------------------------------

/// Captured output of a `MockHost`, cloneable before the host moves into the
/// VM.
#[derive(Debug, Clone, Default)]
pub struct MockOutput {
    stdout: Rc<RefCell<Vec<u8>>>,
    stderr: Rc<RefCell<Vec<u8>>>,
}

impl MockOutput {
    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.stdout.borrow()).into_owned()
    }

    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.stderr.borrow()).into_owned()
    }
}

/// Deterministic host for tests and replay runs.
pub struct MockHost {
    args: Vec<String>,
    stdin: VecDeque<u8>,
    output: MockOutput,
    clock_ns: u64,
    /// Virtual nanoseconds added per clock read, so busy loops observe time
    /// passing without any real sleeping.
    tick_ns: u64,
    term: Option<MockTerminal>,
}

impl MockHost {
    pub fn new() -> Self {
        MockHost {
            args: vec!["volt".to_string()],
            stdin: VecDeque::new(),
            output: MockOutput::default(),
            clock_ns: 0,
            tick_ns: 0,
            term: None,
        }
    }

    /// Advance the virtual clock by `ns` on every read.
    pub fn with_tick(mut self, ns: u64) -> Self {
        self.tick_ns = ns;
        self
    }

    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_stdin(mut self, input: &str) -> Self {
        self.stdin = input.bytes().collect();
        self
    }

    /// Attach a scripted terminal capability.
    pub fn with_terminal(mut self, events: Vec<TermEvent>) -> Self {
        self.term = Some(MockTerminal {
            events: events.into(),
            written: Vec::new(),
            raw_mode: false,
            alt_screen: false,
            cursor_hidden: false,
        });
        self
    }

    /// Handles on the captured streams; clone before `Vm` takes the host.
    pub fn output(&self) -> MockOutput {
        self.output.clone()
    }
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for MockHost {
    fn argv(&self) -> Vec<String> {
        self.args.clone()
    }

    fn stdin_read_all(&mut self) -> io::Result<Vec<u8>> {
        Ok(std::mem::take(&mut self.stdin).into())
    }

    fn stdin_read_line(&mut self) -> io::Result<Option<String>> {
        if self.stdin.is_empty() {
            return Ok(None);
        }
        let mut line = Vec::new();
        while let Some(b) = self.stdin.pop_front() {
            if b == b'\n' {
                break;
            }
            line.push(b);
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }

    fn write_stdout(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.output.stdout.borrow_mut().extend_from_slice(bytes);
        Ok(())
    }

    fn write_stderr(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.output.stderr.borrow_mut().extend_from_slice(bytes);
        Ok(())
    }

    fn monotonic_now(&mut self) -> u64 {
        self.clock_ns += self.tick_ns;
        self.clock_ns
    }

    fn wait_until(&mut self, deadline_ns: u64) {
        self.clock_ns = self.clock_ns.max(deadline_ns);
    }

    fn terminal(&mut self) -> Option<&mut dyn Terminal> {
        self.term.as_mut().map(|t| t as &mut dyn Terminal)
    }
}

/// Terminal double: records control operations, replays scripted events.
pub struct MockTerminal {
    events: VecDeque<TermEvent>,
    pub written: Vec<u8>,
    pub raw_mode: bool,
    pub alt_screen: bool,
    pub cursor_hidden: bool,
}

impl Terminal for MockTerminal {
    fn set_raw_mode(&mut self, enable: bool) -> io::Result<()> {
        self.raw_mode = enable;
        Ok(())
    }

    fn enter_alt_screen(&mut self) -> io::Result<()> {
        self.alt_screen = true;
        Ok(())
    }

    fn exit_alt_screen(&mut self) -> io::Result<()> {
        self.alt_screen = false;
        Ok(())
    }

    fn hide_cursor(&mut self) -> io::Result<()> {
        self.cursor_hidden = true;
        Ok(())
    }

    fn show_cursor(&mut self) -> io::Result<()> {
        self.cursor_hidden = false;
        Ok(())
    }

    fn size(&mut self) -> io::Result<(u16, u16)> {
        Ok((80, 24))
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.written.extend_from_slice(bytes);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn read_event(&mut self) -> io::Result<TermEvent> {
        Ok(self.events.pop_front().unwrap_or(TermEvent::Eof))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_streams() {
        let mut host = MockHost::new().with_stdin("line one\nline two");
        let out = host.output();
        host.write_stdout(b"hello").unwrap();
        host.write_stderr(b"oops").unwrap();
        assert_eq!(out.stdout(), "hello");
        assert_eq!(out.stderr(), "oops");
        assert_eq!(host.stdin_read_line().unwrap().as_deref(), Some("line one"));
        assert_eq!(host.stdin_read_line().unwrap().as_deref(), Some("line two"));
        assert_eq!(host.stdin_read_line().unwrap(), None);
    }

    #[test]
    fn test_mock_clock_jumps() {
        let mut host = MockHost::new();
        assert_eq!(host.monotonic_now(), 0);
        host.wait_until(5_000_000);
        assert_eq!(host.monotonic_now(), 5_000_000);
        // waiting for the past does not rewind
        host.wait_until(1);
        assert_eq!(host.monotonic_now(), 5_000_000);
    }

    #[test]
    fn test_mock_terminal_records() {
        let mut host = MockHost::new().with_terminal(vec![TermEvent::Key(b'q')]);
        let term = host.terminal().unwrap();
        term.set_raw_mode(true).unwrap();
        term.write_bytes(b"\x1b[2J").unwrap();
        assert_eq!(term.read_event().unwrap(), TermEvent::Key(b'q'));
        assert_eq!(term.read_event().unwrap(), TermEvent::Eof);
        assert_eq!(term.size().unwrap(), (80, 24));
    }

    #[test]
    fn test_host_without_terminal() {
        let mut host = MockHost::new();
        assert!(host.terminal().is_none());
    }
}
