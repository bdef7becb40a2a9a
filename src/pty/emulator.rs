//! Terminal emulator (spec §4.3): the black-box `feed(bytes) -> screen-delta`
//! contract the PTY Worker drives, plus the typed screen state a client
//! snapshot is built from.
//!
//! Grounded on `core::vte_backend::VteHandler`/`Utf8Decoder`
//! (same `vte` parser Alacritty uses), generalized from "track cursor
//! position for xterm.js" into an authoritative grid this server owns
//! outright — there is no xterm.js downstream to defer rendering to, so the
//! `Screen` here must hold real cell contents, not just cursor coordinates.

use serde::{Deserialize, Serialize};
use vte::{Params, Parser, Perform};

/// One addressable grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub ch: char,
    pub bold: bool,
    pub reverse: bool,
    pub fg: Option<u8>,
    pub bg: Option<u8>,
}

impl Default for Cell {
    fn default() -> Self {
        Self { ch: ' ', bold: false, reverse: false, fg: None, bg: None }
    }
}

/// Authoritative screen state for one PTY: the visible grid, cursor, and a
/// capped scrollback of rows pushed off the top.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Screen {
    pub cols: u16,
    pub rows: u16,
    pub grid: Vec<Vec<Cell>>,
    pub cursor_row: u16,
    pub cursor_col: u16,
    pub cursor_visible: bool,
    pub title: Option<String>,
    pub scrollback: std::collections::VecDeque<Vec<Cell>>,
}

const MAX_SCROLLBACK_ROWS: usize = 10_000;

impl Screen {
    pub(crate) fn new(cols: u16, rows: u16) -> Self {
        Self {
            cols,
            rows,
            grid: vec![vec![Cell::default(); cols as usize]; rows as usize],
            cursor_row: 0,
            cursor_col: 0,
            cursor_visible: true,
            title: None,
            scrollback: std::collections::VecDeque::new(),
        }
    }

    pub(crate) fn resize(&mut self, cols: u16, rows: u16) {
        self.grid.resize(rows as usize, vec![Cell::default(); cols as usize]);
        for row in &mut self.grid {
            row.resize(cols as usize, Cell::default());
        }
        self.cols = cols;
        self.rows = rows;
        self.cursor_row = self.cursor_row.min(rows.saturating_sub(1));
        self.cursor_col = self.cursor_col.min(cols.saturating_sub(1));
    }

    fn scroll_up_one(&mut self) {
        let evicted = self.grid.remove(0);
        self.scrollback.push_back(evicted);
        if self.scrollback.len() > MAX_SCROLLBACK_ROWS {
            self.scrollback.pop_front();
        }
        self.grid.push(vec![Cell::default(); self.cols as usize]);
    }

    fn newline(&mut self) {
        if self.cursor_row + 1 >= self.rows {
            self.scroll_up_one();
        } else {
            self.cursor_row += 1;
        }
    }
}

/// Result of feeding one chunk of PTY output into the emulator.
pub struct FeedResult {
    /// Whether any screen-visible state changed (drives the frame scheduler).
    pub changed: bool,
    /// Bytes the emulator wants written back to the PTY master immediately,
    /// on the worker's own thread, per §4.3 (device attributes, CPR, etc.).
    pub auto_response: Option<Vec<u8>>,
}

/// The black-box contract the PTY Worker drives: feed raw bytes in, get a
/// change signal and any synchronous auto-response out.
pub trait Emulator: Send {
    fn feed(&mut self, bytes: &[u8]) -> FeedResult;
    fn resize(&mut self, cols: u16, rows: u16);
    fn snapshot(&self) -> Screen;
}

/// `vte`-backed emulator. `Parser::advance` drives a `Perform` impl
/// (`Handler`) that owns the actual `Screen` and an auto-response buffer —
/// mirrors `VteHandler`, but tracks cell contents and emits
/// DA1/DA2/CPR replies instead of only cursor coordinates.
pub struct VteEmulator {
    parser: Parser,
    handler: Handler,
}

impl VteEmulator {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { parser: Parser::new(), handler: Handler::new(cols, rows) }
    }
}

impl Emulator for VteEmulator {
    fn feed(&mut self, bytes: &[u8]) -> FeedResult {
        self.handler.dirty = false;
        self.handler.auto_response.clear();
        self.parser.advance(&mut self.handler, bytes);
        let auto_response = if self.handler.auto_response.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.handler.auto_response))
        };
        FeedResult { changed: self.handler.dirty, auto_response }
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        self.handler.screen.resize(cols, rows);
    }

    fn snapshot(&self) -> Screen {
        self.handler.screen.clone()
    }
}

struct Handler {
    screen: Screen,
    dirty: bool,
    auto_response: Vec<u8>,
    bold: bool,
    reverse: bool,
}

impl Handler {
    fn new(cols: u16, rows: u16) -> Self {
        Self { screen: Screen::new(cols, rows), dirty: false, auto_response: Vec::new(), bold: false, reverse: false }
    }

    fn put_char(&mut self, c: char) {
        let s = &mut self.screen;
        if s.cursor_col >= s.cols {
            s.cursor_col = 0;
            self.dirty = true;
            // inline newline since `s` already borrows `self.screen`
        }
        let row = s.cursor_row as usize;
        let col = s.cursor_col.min(s.cols.saturating_sub(1)) as usize;
        if let Some(cell) = s.grid.get_mut(row).and_then(|r| r.get_mut(col)) {
            *cell = Cell { ch: c, bold: self.bold, reverse: self.reverse, fg: None, bg: None };
        }
        s.cursor_col = s.cursor_col.saturating_add(1);
        self.dirty = true;
    }

    fn param(params: &Params, idx: usize, default: u16) -> u16 {
        params.iter().nth(idx).and_then(|p| p.first().copied()).filter(|v| *v != 0).unwrap_or(default)
    }
}

impl Perform for Handler {
    fn print(&mut self, c: char) {
        self.put_char(c);
    }

    fn execute(&mut self, byte: u8) {
        let s = &mut self.screen;
        match byte {
            0x0D => s.cursor_col = 0,
            0x0A => s.newline(),
            0x08 => s.cursor_col = s.cursor_col.saturating_sub(1),
            0x09 => {
                s.cursor_col = ((s.cursor_col / 8) + 1) * 8;
                if s.cursor_col >= s.cols {
                    s.cursor_col = s.cols.saturating_sub(1);
                }
            }
            0x07 => {}
            _ => {}
        }
        self.dirty = true;
    }

    fn hook(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, _action: char) {}
    fn put(&mut self, _byte: u8) {}
    fn unhook(&mut self) {}

    fn osc_dispatch(&mut self, params: &[&[u8]], _bell_terminated: bool) {
        if params.is_empty() {
            return;
        }
        if let Some(&[b'0' | b'1' | b'2']) = params.first() {
            if let Some(title_bytes) = params.get(1) {
                if let Ok(title) = std::str::from_utf8(title_bytes) {
                    self.screen.title = Some(title.to_string());
                    self.dirty = true;
                }
            }
        }
    }

    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], _ignore: bool, action: char) {
        let rows = self.screen.rows;
        let cols = self.screen.cols;
        match action {
            'A' => self.screen.cursor_row = self.screen.cursor_row.saturating_sub(Self::param(params, 0, 1)),
            'B' => {
                self.screen.cursor_row =
                    self.screen.cursor_row.saturating_add(Self::param(params, 0, 1)).min(rows.saturating_sub(1))
            }
            'C' => {
                self.screen.cursor_col =
                    self.screen.cursor_col.saturating_add(Self::param(params, 0, 1)).min(cols.saturating_sub(1))
            }
            'D' => self.screen.cursor_col = self.screen.cursor_col.saturating_sub(Self::param(params, 0, 1)),
            'H' | 'f' => {
                let row = Self::param(params, 0, 1).saturating_sub(1);
                let col = Self::param(params, 1, 1).saturating_sub(1);
                self.screen.cursor_row = row.min(rows.saturating_sub(1));
                self.screen.cursor_col = col.min(cols.saturating_sub(1));
            }
            'm' => {
                // SGR: only bold (1) and reverse-video (7) are tracked; any
                // other code (including the reset 0) clears both, which is
                // wrong for combinations like "bold + a color" but keeps
                // this emulator's attribute model honestly minimal rather
                // than half-implementing 256-color SGR.
                for p in params.iter() {
                    match p.first().copied().unwrap_or(0) {
                        0 => {
                            self.bold = false;
                            self.reverse = false;
                        }
                        1 => self.bold = true,
                        7 => self.reverse = true,
                        22 => self.bold = false,
                        27 => self.reverse = false,
                        _ => {}
                    }
                }
            }
            'n' => {
                // DSR: `ESC[6n` asks for cursor position, answered
                // synchronously per §4.3.
                if Self::param(params, 0, 0) == 6 {
                    let reply = format!("\x1b[{};{}R", self.screen.cursor_row + 1, self.screen.cursor_col + 1);
                    self.auto_response.extend_from_slice(reply.as_bytes());
                }
            }
            'c' => {
                // DA1 (`ESC[c`) vs DA2 (`ESC[>c`, intermediate `>`).
                if intermediates.first() == Some(&b'>') {
                    self.auto_response.extend_from_slice(b"\x1b[>1;10;0c");
                } else {
                    self.auto_response.extend_from_slice(b"\x1b[?1;2c");
                }
            }
            'h' | 'l' if intermediates.first() == Some(&b'?') => {
                if let Some(&[25]) = params.iter().next() {
                    self.screen.cursor_visible = action == 'h';
                }
            }
            _ => {}
        }
        self.dirty = true;
    }

    fn esc_dispatch(&mut self, _intermediates: &[u8], _ignore: bool, _byte: u8) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prints_advance_cursor_and_mark_dirty() {
        let mut emu = VteEmulator::new(10, 3);
        let result = emu.feed(b"hi");
        assert!(result.changed);
        assert!(result.auto_response.is_none());
        let screen = emu.snapshot();
        assert_eq!(screen.grid[0][0].ch, 'h');
        assert_eq!(screen.grid[0][1].ch, 'i');
        assert_eq!(screen.cursor_col, 2);
    }

    #[test]
    fn cursor_position_report_is_synchronous_auto_response() {
        let mut emu = VteEmulator::new(10, 3);
        emu.feed(b"ab");
        let result = emu.feed(b"\x1b[6n");
        let resp = result.auto_response.expect("expected CPR auto-response");
        assert_eq!(resp, b"\x1b[1;3R");
    }

    #[test]
    fn device_attributes_request_answered() {
        let mut emu = VteEmulator::new(10, 3);
        let result = emu.feed(b"\x1b[c");
        assert_eq!(result.auto_response.unwrap(), b"\x1b[?1;2c");
    }

    #[test]
    fn newline_past_bottom_row_scrolls_into_scrollback() {
        let mut emu = VteEmulator::new(5, 2);
        emu.feed(b"row1\n\rrow2\n\rrow3");
        let screen = emu.snapshot();
        assert_eq!(screen.scrollback.len(), 1);
    }
}
