use anyhow::Result;
use crossterm::{
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{prelude::CrosstermBackend, Terminal};
use std::{
    io::{Stderr, Write},
    ops::{Deref, DerefMut},
};

/// Raw-mode alternate screen on stderr, restored when dropped so that an
/// error or panic never leaves the shell unusable.
pub(crate) struct AutoDropTerminal {
    terminal: Terminal<CrosstermBackend<Stderr>>,
}

impl AutoDropTerminal {
    pub(crate) fn new() -> Result<Self> {
        enable_raw_mode()?;
        let mut stderr = std::io::stderr();
        if let Err(e) = execute!(stderr, EnterAlternateScreen) {
            disable_raw_mode().ok();
            return Err(e.into());
        }
        match Terminal::new(CrosstermBackend::new(stderr)) {
            Ok(terminal) => Ok(Self { terminal }),
            Err(e) => {
                restore(&mut std::io::stderr());
                Err(e.into())
            }
        }
    }
}

/// Leaves raw mode and the alternate screen, ignoring errors.
fn restore(out: &mut impl Write) {
    disable_raw_mode().ok();
    execute!(out, LeaveAlternateScreen).ok();
}

impl Deref for AutoDropTerminal {
    type Target = Terminal<CrosstermBackend<Stderr>>;

    fn deref(&self) -> &Self::Target {
        &self.terminal
    }
}

impl DerefMut for AutoDropTerminal {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.terminal
    }
}

impl Drop for AutoDropTerminal {
    fn drop(&mut self) {
        restore(self.terminal.backend_mut());
        self.terminal.show_cursor().ok();
    }
}
