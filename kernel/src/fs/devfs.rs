//! `/dev`: `/dev/null`, `/dev/random`, and the `/dev/tty1` interactive line
//! editor.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use pc_keyboard::{layouts, DecodedKey, HandleControl, KeyCode, Keyboard, ScancodeSet1};

use crate::config::TTY_HISTORY_CAPACITY;
use crate::errno::KernelError;
use crate::fs::{DirEntry, FileDescriptor, FileOps, FileSystem, Inode, InodePrivate, InodeType, SeekWhence, Stat};
use crate::sync::IrqSpinLock;

/// Decoded editing action the line editor's state machine reacts to,
/// separated from scancode/DecodedKey plumbing so it's unit-testable
/// without a PS/2 controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditKey {
    Char(char),
    Backspace,
    DeleteForward,
    Left,
    Right,
    Home,
    End,
    KillToEnd,
    HistoryUp,
    HistoryDown,
    Enter,
}

/// Emacs-style line editor state: buffer, cursor position, and a bounded
/// command history.
pub struct LineEditor {
    buf: String,
    cursor: usize,
    history: Vec<String>,
    history_index: Option<usize>,
}

impl LineEditor {
    pub const fn new() -> Self {
        Self {
            buf: String::new(),
            cursor: 0,
            history: Vec::new(),
            history_index: None,
        }
    }

    pub fn buffer(&self) -> &str {
        &self.buf
    }

    fn byte_offset(&self, char_index: usize) -> usize {
        self.buf.char_indices().nth(char_index).map(|(i, _)| i).unwrap_or(self.buf.len())
    }

    fn char_len(&self) -> usize {
        self.buf.chars().count()
    }

    fn push_history(&mut self, line: String) {
        if line.is_empty() {
            return;
        }
        if self.history.last() != Some(&line) {
            if self.history.len() == TTY_HISTORY_CAPACITY {
                self.history.remove(0);
            }
            self.history.push(line);
        }
        self.history_index = None;
    }

    /// Applies one decoded key. Returns `Some(line)` when Enter delivers a
    /// completed line (the internal buffer is then cleared).
    pub fn apply(&mut self, key: EditKey) -> Option<String> {
        match key {
            EditKey::Char(c) => {
                let at = self.byte_offset(self.cursor);
                self.buf.insert(at, c);
                self.cursor += 1;
                None
            }
            EditKey::Backspace => {
                if self.cursor > 0 {
                    let at = self.byte_offset(self.cursor - 1);
                    self.buf.remove(at);
                    self.cursor -= 1;
                }
                None
            }
            EditKey::DeleteForward => {
                if self.cursor < self.char_len() {
                    let at = self.byte_offset(self.cursor);
                    self.buf.remove(at);
                }
                None
            }
            EditKey::Left => {
                self.cursor = self.cursor.saturating_sub(1);
                None
            }
            EditKey::Right => {
                self.cursor = (self.cursor + 1).min(self.char_len());
                None
            }
            EditKey::Home => {
                self.cursor = 0;
                None
            }
            EditKey::End => {
                self.cursor = self.char_len();
                None
            }
            EditKey::KillToEnd => {
                let at = self.byte_offset(self.cursor);
                self.buf.truncate(at);
                None
            }
            EditKey::HistoryUp => {
                if self.history.is_empty() {
                    return None;
                }
                let next_index = match self.history_index {
                    None => self.history.len() - 1,
                    Some(0) => 0,
                    Some(i) => i - 1,
                };
                self.history_index = Some(next_index);
                self.buf = self.history[next_index].clone();
                self.cursor = self.char_len();
                None
            }
            EditKey::HistoryDown => {
                match self.history_index {
                    None => {}
                    Some(i) if i + 1 < self.history.len() => {
                        self.history_index = Some(i + 1);
                        self.buf = self.history[i + 1].clone();
                        self.cursor = self.char_len();
                    }
                    Some(_) => {
                        self.history_index = None;
                        self.buf.clear();
                        self.cursor = 0;
                    }
                }
                None
            }
            EditKey::Enter => {
                let line = core::mem::take(&mut self.buf);
                self.cursor = 0;
                self.push_history(line.clone());
                Some(line)
            }
        }
    }
}

/// Translates a raw Ctrl-modified ASCII control code or named key into an
/// [`EditKey`], covering the Ctrl-A/E/K/B/F/D shortcuts the base spec names.
fn decode_key(decoded: DecodedKey) -> Option<EditKey> {
    match decoded {
        DecodedKey::Unicode(c) => match c {
            '\u{8}' | '\u{7f}' => Some(EditKey::Backspace),
            '\r' | '\n' => Some(EditKey::Enter),
            '\u{1}' => Some(EditKey::Home),     // Ctrl-A
            '\u{5}' => Some(EditKey::End),      // Ctrl-E
            '\u{b}' => Some(EditKey::KillToEnd), // Ctrl-K
            '\u{2}' => Some(EditKey::Left),      // Ctrl-B
            '\u{6}' => Some(EditKey::Right),     // Ctrl-F
            '\u{4}' => Some(EditKey::DeleteForward), // Ctrl-D
            c if !c.is_control() => Some(EditKey::Char(c)),
            _ => None,
        },
        DecodedKey::RawKey(KeyCode::ArrowLeft) => Some(EditKey::Left),
        DecodedKey::RawKey(KeyCode::ArrowRight) => Some(EditKey::Right),
        DecodedKey::RawKey(KeyCode::ArrowUp) => Some(EditKey::HistoryUp),
        DecodedKey::RawKey(KeyCode::ArrowDown) => Some(EditKey::HistoryDown),
        DecodedKey::RawKey(KeyCode::Home) => Some(EditKey::Home),
        DecodedKey::RawKey(KeyCode::End) => Some(EditKey::End),
        DecodedKey::RawKey(KeyCode::Delete) => Some(EditKey::DeleteForward),
        DecodedKey::RawKey(_) => None,
    }
}

struct Tty1State {
    decoder: Keyboard<layouts::Us104Key, ScancodeSet1>,
    editor: LineEditor,
    waiting_process: Option<*mut crate::process::Process>,
}

// SAFETY: `waiting_process` is only read/written while `TTY1` is locked,
// which this kernel only ever does from kernel mode on its single CPU.
unsafe impl Send for Tty1State {}

lazy_static! {
    static ref TTY1: IrqSpinLock<Tty1State> = IrqSpinLock::new(Tty1State {
        decoder: Keyboard::new(ScancodeSet1::new(), layouts::Us104Key, HandleControl::MapLettersToUnicode),
        editor: LineEditor::new(),
        waiting_process: None,
    });
}

fn tty1_write(bytes: &[u8]) {
    crate::console::write_bytes(bytes);
}

/// Blocking read: drains the keyboard ring buffer through the decoder,
/// applying editing keys, until Enter delivers a line, then copies it (plus
/// a trailing `\n`) into `buf`.
fn tty_read(fd: &mut FileDescriptor, buf: &mut [u8]) -> Result<usize, KernelError> {
    let _ = fd;
    loop {
        let line = {
            let mut state = TTY1.lock();
            // SAFETY: `current_process()` returns the process executing this
            // syscall, which outlives this blocking read (it is the caller).
            state.waiting_process = Some(unsafe { crate::process::current_process() });
            drop(state);
            // SAFETY: matches the registration just performed.
            unsafe { crate::keyboard::set_waiting_process(crate::process::current_process()) };

            let mut completed = None;
            while let Some(scancode) = crate::keyboard::pop_scancode() {
                let mut state = TTY1.lock();
                if let Ok(Some(event)) = state.decoder.add_byte(scancode) {
                    if let Some(decoded) = state.decoder.process_keyevent(event) {
                        if let Some(edit_key) = decode_key(decoded) {
                            if let EditKey::Char(c) = edit_key {
                                let mut tmp = [0u8; 4];
                                tty1_write(c.encode_utf8(&mut tmp).as_bytes());
                            } else if matches!(edit_key, EditKey::Enter) {
                                tty1_write(b"\r\n");
                            }
                            if let Some(line) = state.editor.apply(edit_key) {
                                completed = Some(line);
                                break;
                            }
                        }
                    }
                }
            }
            completed
        };

        if let Some(line) = line {
            crate::keyboard::clear_waiting_process();
            let bytes = line.as_bytes();
            let n = bytes.len().min(buf.len());
            buf[..n].copy_from_slice(&bytes[..n]);
            return Ok(n);
        }

        // SAFETY: the current process was set `BLOCKED` by the caller
        // (syscall dispatcher) before entering this loop; `yield_blocked`
        // is the documented way to wait for the keyboard ISR to wake it.
        unsafe { crate::sched::yield_blocked() };
    }
}

fn tty_write(_fd: &mut FileDescriptor, buf: &[u8]) -> Result<usize, KernelError> {
    tty1_write(buf);
    Ok(buf.len())
}

fn tty_close(_fd: &mut FileDescriptor) {}

fn tty_lseek(_fd: &mut FileDescriptor, _offset: i64, _whence: SeekWhence) -> Result<u64, KernelError> {
    Err(KernelError::SeekOnPipe)
}

static TTY_OPS: FileOps = FileOps {
    read: tty_read,
    write: tty_write,
    close: tty_close,
    lseek: tty_lseek,
};

fn null_read(_fd: &mut FileDescriptor, _buf: &mut [u8]) -> Result<usize, KernelError> {
    Ok(0)
}

fn null_write(_fd: &mut FileDescriptor, buf: &[u8]) -> Result<usize, KernelError> {
    Ok(buf.len())
}

fn null_close(_fd: &mut FileDescriptor) {}

fn null_lseek(_fd: &mut FileDescriptor, _offset: i64, _whence: SeekWhence) -> Result<u64, KernelError> {
    Err(KernelError::SeekOnPipe)
}

static NULL_OPS: FileOps = FileOps {
    read: null_read,
    write: null_write,
    close: null_close,
    lseek: null_lseek,
};

fn random_read(_fd: &mut FileDescriptor, buf: &mut [u8]) -> Result<usize, KernelError> {
    let ticks = crate::apic::ticks();
    for (i, byte) in buf.iter_mut().enumerate() {
        // Deterministic, tick-derived byte stream; not cryptographic.
        let mixed = ticks.wrapping_add(i as u64).wrapping_mul(2_862_933_555_777_941_757).wrapping_add(3_037_000_493);
        *byte = (mixed >> 33) as u8;
    }
    Ok(buf.len())
}

fn random_write(_fd: &mut FileDescriptor, buf: &[u8]) -> Result<usize, KernelError> {
    Ok(buf.len())
}

fn random_close(_fd: &mut FileDescriptor) {}

fn random_lseek(_fd: &mut FileDescriptor, _offset: i64, _whence: SeekWhence) -> Result<u64, KernelError> {
    Err(KernelError::SeekOnPipe)
}

static RANDOM_OPS: FileOps = FileOps {
    read: random_read,
    write: random_write,
    close: random_close,
    lseek: random_lseek,
};

/// Devfs filesystem backend: three static char-device inodes, no subdirectories.
pub struct Devfs;

impl FileSystem for Devfs {
    fn name(&self) -> &str {
        "devfs"
    }

    fn open(&self, relative_path: &str, _flags: i32) -> Result<Arc<Inode>, KernelError> {
        let ops = match relative_path {
            "/null" => &NULL_OPS,
            "/random" => &RANDOM_OPS,
            "/tty1" => &TTY_OPS,
            _ => return Err(KernelError::NotFound),
        };
        Ok(Arc::new(Inode {
            kind: InodeType::CharDevice,
            size: 0,
            ops,
            private: InodePrivate::None,
        }))
    }

    fn stat(&self, relative_path: &str) -> Result<Stat, KernelError> {
        match relative_path {
            "/null" | "/random" | "/tty1" => Ok(Stat { kind: InodeType::CharDevice, size: 0 }),
            _ => Err(KernelError::NotFound),
        }
    }

    fn readdir(&self, relative_path: &str) -> Result<Vec<DirEntry>, KernelError> {
        if relative_path != "/" {
            return Err(KernelError::NotFound);
        }
        Ok(alloc::vec![
            DirEntry { name: String::from("null"), kind: InodeType::CharDevice },
            DirEntry { name: String::from("random"), kind: InodeType::CharDevice },
            DirEntry { name: String::from("tty1"), kind: InodeType::CharDevice },
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn basic_insert_and_enter() {
        let mut ed = LineEditor::new();
        for c in "hi".chars() {
            ed.apply(EditKey::Char(c));
        }
        assert_eq!(ed.apply(EditKey::Enter), Some("hi".to_string()));
        assert_eq!(ed.buffer(), "");
    }

    #[test]
    fn backspace_and_delete_forward() {
        let mut ed = LineEditor::new();
        for c in "abc".chars() {
            ed.apply(EditKey::Char(c));
        }
        ed.apply(EditKey::Backspace);
        assert_eq!(ed.buffer(), "ab");
        ed.apply(EditKey::Home);
        ed.apply(EditKey::DeleteForward);
        assert_eq!(ed.buffer(), "b");
    }

    #[test]
    fn cursor_motion_and_insert_in_middle() {
        let mut ed = LineEditor::new();
        for c in "ac".chars() {
            ed.apply(EditKey::Char(c));
        }
        ed.apply(EditKey::Left);
        ed.apply(EditKey::Char('b'));
        assert_eq!(ed.buffer(), "abc");
    }

    #[test]
    fn kill_to_end_from_home() {
        let mut ed = LineEditor::new();
        for c in "hello".chars() {
            ed.apply(EditKey::Char(c));
        }
        ed.apply(EditKey::Home);
        ed.apply(EditKey::KillToEnd);
        assert_eq!(ed.buffer(), "");
    }

    #[test]
    fn history_up_then_down_resets_to_empty() {
        let mut ed = LineEditor::new();
        for c in "first".chars() {
            ed.apply(EditKey::Char(c));
        }
        ed.apply(EditKey::Enter);
        for c in "second".chars() {
            ed.apply(EditKey::Char(c));
        }
        ed.apply(EditKey::Enter);

        ed.apply(EditKey::HistoryUp);
        assert_eq!(ed.buffer(), "second");
        ed.apply(EditKey::HistoryUp);
        assert_eq!(ed.buffer(), "first");
        ed.apply(EditKey::HistoryDown);
        assert_eq!(ed.buffer(), "second");
        ed.apply(EditKey::HistoryDown);
        assert_eq!(ed.buffer(), "");
    }

    #[test]
    fn history_dedups_consecutive_repeats() {
        let mut ed = LineEditor::new();
        ed.apply(EditKey::Char('x'));
        ed.apply(EditKey::Enter);
        ed.apply(EditKey::Char('x'));
        ed.apply(EditKey::Enter);
        assert_eq!(ed.history.len(), 1);
    }
}
